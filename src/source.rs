use std::future::Future;
use std::time::Duration;
use anyhow::Result;
use log::{debug, error, info};
use shiplift::Docker;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::task::spawn_blocking;
use crate::config::Config;
use crate::data::{FullConnection, ServerConnection, Socket};
use crate::diag;
use crate::docker::Poller;
use crate::process::Registry;
use crate::procnet::{self, Tables};
use crate::track::{Exposure, Tracker};

pub enum Source {
    Tables(Tables),
    Diag(Tables),
    Docker(Poller),
}

pub struct Pipeline {
    pub servers:     Receiver<ServerConnection>,
    pub connections: Receiver<FullConnection>,
}

impl Source {
    pub async fn run(self, period: Duration, tx: Sender<Socket>) -> Result<()> {
        match self {
            Self::Tables(tables) => procnet::poll(tables, period, tx).await,
            Self::Diag(tables)   => diag_or_tables(diag::poll, tables, period, tx).await,
            Self::Docker(poller) => poller.run(period, tx).await,
        }
    }
}

pub async fn listen(config: &Config) -> Result<Pipeline> {
    config.validate()?;

    let mut sources = Vec::new();

    if config.enable_docker {
        let poller = Poller::new(Docker::new(), &config.docker_environment).await?;
        sources.push(Source::Docker(poller));
    }

    if config.enable_local_connections {
        let tables = Tables::from_env();
        sources.push(match config.enable_tcp_diag {
            true  => Source::Diag(tables),
            false => Source::Tables(tables),
        });
    }

    Ok(start(config, sources))
}

pub fn start(config: &Config, sources: Vec<Source>) -> Pipeline {
    let (tx, rx) = channel(config.queue_size);

    for source in sources {
        spawn(source.run(config.poll_interval, tx.clone()));
    }

    let (servers_tx, servers) = channel(config.queue_size);
    let (conns_tx, connections) = channel(config.queue_size);

    let registry = Registry::new(config.expose_cmdline, config.expose_environ);
    let exposure = Exposure {
        process:   config.expose_process_info,
        container: config.expose_container_process_info,
    };

    let tracker = Tracker::new(registry, exposure, config.aggregation);
    spawn(tracker.run(rx, servers_tx, conns_tx));

    Pipeline { servers, connections }
}

async fn diag_or_tables<F>(diag: F, tables: Tables, period: Duration, tx: Sender<Socket>) -> Result<()>
where
    F: FnOnce(Duration, Sender<Socket>) -> Result<()> + Send + 'static,
{
    let diag_tx = tx.clone();

    match spawn_blocking(move || diag(period, diag_tx)).await? {
        Ok(()) => return Ok(()),
        Err(e) => info!("tcp_diag failed, falling back to {}: {:?}", tables.v4.display(), e),
    }

    procnet::poll(tables, period, tx).await
}

pub fn spawn<F: Future<Output = Result<()>> + Send + 'static>(task: F) {
    tokio::spawn(async move {
        match task.await {
            Ok(()) => debug!("task finished"),
            Err(e) => error!("task failed: {:?}", e),
        }
    });
}
