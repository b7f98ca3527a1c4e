use std::collections::{HashMap, HashSet};
use std::env;
use std::future::Future;
use std::mem;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use log::{debug, info, warn};
use shiplift::{ContainerListOptions, Docker, Exec, ExecContainerOptions};
use shiplift::tty::TtyChunk;
use tokio::net::lookup_host;
use tokio::sync::mpsc::Sender;
use tokio::time::interval;
use crate::data::{Container, DockerHost, Family, Port, Socket};
use crate::procnet;

const TABLES: [(&str, Family); 2] = [
    ("/proc/net/tcp",  Family::V4),
    ("/proc/net/tcp6", Family::V6),
];

pub struct Poller {
    docker:  Docker,
    env:     HashSet<String>,
    host:    Arc<DockerHost>,
    breaker: Breaker,
}

struct Listed {
    id:     String,
    image:  String,
    labels: HashMap<String, String>,
    ports:  Vec<Port>,
}

impl Poller {
    pub async fn new(docker: Docker, allowed: &[String]) -> Result<Self> {
        docker.ping().await.map_err(|e| {
            anyhow!("could not connect to docker: {}", e)
        })?;

        let hostname = match env::var("DOCKERHOST_HOSTNAME") {
            Ok(name) if !name.is_empty() => name,
            _                            => docker.info().await?.name,
        };

        let ip = match dockerhost_ip(&hostname).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("could not determine IP address of docker host {}: {}", hostname, e);
                None
            }
        };

        info!("docker host {} ({:?})", hostname, ip);

        Ok(Self {
            docker,
            env:     allowed.iter().cloned().collect(),
            host:    Arc::new(DockerHost { hostname, ip }),
            breaker: Breaker::default(),
        })
    }

    pub async fn run(mut self, period: Duration, tx: Sender<Socket>) -> Result<()> {
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            info!("polling docker");

            if let Err(e) = self.poll(&tx).await {
                warn!("polling docker connections: {:?}", e);
            }

            if tx.is_closed() {
                debug!("socket queue closed");
                return Ok(());
            }
        }
    }

    pub async fn poll(&mut self, tx: &Sender<Socket>) -> Result<()> {
        let opts = ContainerListOptions::default();

        let containers = self.docker.containers().list(&opts).await?.into_iter().map(|c| {
            Listed {
                id:     c.id,
                image:  c.image,
                labels: c.labels,
                ports:  c.ports.into_iter().map(|p| Port {
                    private:  p.private_port,
                    public:   p.public_port,
                    ip:       p.ip,
                    protocol: p.typ,
                }).collect(),
            }
        }).collect::<Vec<_>>();

        let mut round = self.breaker.begin();
        let this = &*self;
        relay(&mut round, containers, tx, |c| this.sockets(c)).await;
        self.breaker.end(round);

        Ok(())
    }

    async fn sockets(&self, container: Listed) -> Result<Vec<Socket>> {
        let mut tables = Vec::with_capacity(TABLES.len());

        for (path, family) in TABLES.iter() {
            tables.push((self.exec(&container.id, path).await?, *family));
        }

        let container = Arc::new(self.describe(container).await?);

        Ok(tables.iter().flat_map(|(text, family)| {
            procnet::parse(text, *family, Some(container.clone()))
        }).collect())
    }

    async fn exec(&self, id: &str, path: &str) -> Result<String> {
        let opts = ExecContainerOptions::builder()
            .cmd(vec!["cat", path])
            .attach_stdout(true)
            .attach_stderr(true)
            .build();

        let exec   = Exec::create(&self.docker, id, &opts).await?;
        let chunks = exec.start().try_collect::<Vec<_>>().await?;

        let mut stdout = Vec::new();
        for chunk in chunks {
            if let TtyChunk::StdOut(bytes) = chunk {
                stdout.extend(bytes);
            }
        }

        let details = exec.inspect().await?;
        if details.running {
            return Err(anyhow!("exec of cat {} still running", path));
        }

        match details.exit_code {
            Some(0) => Ok(String::from_utf8_lossy(&stdout).into_owned()),
            code    => Err(anyhow!("cat {} exited with {:?}", path, code)),
        }
    }

    async fn describe(&self, listed: Listed) -> Result<Container> {
        let details = self.docker.containers().get(&listed.id).inspect().await?;
        let env     = details.config.env.unwrap_or_default();

        Ok(Container {
            id:     listed.id,
            name:   details.name.trim_start_matches('/').to_owned(),
            image:  listed.image,
            env:    filter_env(&env, &self.env),
            labels: listed.labels,
            ports:  listed.ports,
            host:   self.host.clone(),
        })
    }
}

async fn relay<F, Fut>(round: &mut Round, containers: Vec<Listed>, tx: &Sender<Socket>, mut sockets: F)
where
    F:   FnMut(Listed) -> Fut,
    Fut: Future<Output = Result<Vec<Socket>>>,
{
    for container in containers {
        if round.skip(&container.id) {
            debug!("skipping failed container {}", container.id);
            continue;
        }

        let id = container.id.clone();
        let sockets = match sockets(container).await {
            Ok(sockets) => sockets,
            Err(e)      => {
                warn!("failed to poll connections for container {}: {:?}, skipping next time", id, e);
                round.fail(id);
                continue;
            }
        };

        for socket in sockets {
            if tx.send(socket).await.is_err() {
                return;
            }
        }
    }
}

pub fn filter_env(env: &[String], allowed: &HashSet<String>) -> Vec<String> {
    env.iter().filter(|entry| {
        let name = entry.split('=').next().unwrap_or("");
        allowed.contains(name)
    }).cloned().collect()
}

async fn dockerhost_ip(hostname: &str) -> Result<IpAddr> {
    if let Ok(ip) = env::var("DOCKERHOST_IP") {
        if !ip.is_empty() {
            return Ok(ip.parse()?);
        }
    }

    let mut addrs = lookup_host((hostname, 0)).await?;
    addrs.next().map(|addr| addr.ip()).ok_or_else(|| {
        anyhow!("no addresses for {}", hostname)
    })
}

#[derive(Debug, Default)]
pub struct Breaker {
    failed: HashSet<String>,
}

#[derive(Debug)]
pub struct Round {
    previous: HashSet<String>,
    failed:   HashSet<String>,
}

impl Breaker {
    pub fn begin(&mut self) -> Round {
        Round {
            previous: mem::take(&mut self.failed),
            failed:   HashSet::new(),
        }
    }

    pub fn end(&mut self, round: Round) {
        self.failed = round.failed;
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.failed.contains(id)
    }
}

impl Round {
    pub fn skip(&mut self, id: &str) -> bool {
        if self.previous.contains(id) {
            self.failed.insert(id.to_owned());
            return true;
        }
        false
    }

    pub fn fail(&mut self, id: String) {
        self.failed.insert(id);
    }
}
