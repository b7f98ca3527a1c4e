use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::Result;
use log::{debug, trace};
use serde::Serialize;
use crate::data::{Container, FullConnection, Process, ServerConnection};
use crate::sink::Sink;
use crate::source::Pipeline;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Server,
    Connection,
}

#[derive(Debug, Serialize)]
pub struct Event {
    pub timestamp:   u64,
    pub kind:        Kind,
    pub hostname:    Arc<String>,
    pub local_ip:    IpAddr,
    pub local_port:  u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ip:   Option<IpAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<u16>,
    pub process:     Arc<Process>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container:   Option<ContainerEvent>,
    pub local_ips:   Vec<IpAddr>,
}

#[derive(Debug, Serialize)]
pub struct ContainerEvent {
    #[serde(flatten)]
    pub container: Arc<Container>,
    pub local_ips: Vec<IpAddr>,
}

pub struct Exporter {
    hostname:      Arc<String>,
    local_ips:     BTreeSet<IpAddr>,
    container_ips: HashMap<String, BTreeSet<IpAddr>>,
}

impl Exporter {
    pub fn new(hostname: String) -> Self {
        Self {
            hostname:      Arc::new(hostname),
            local_ips:     BTreeSet::new(),
            container_ips: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut pipeline: Pipeline, sink: Sink) -> Result<()> {
        let mut servers     = true;
        let mut connections = true;

        while servers || connections {
            let event = tokio::select! {
                s = pipeline.servers.recv(), if servers => match s {
                    Some(s) => self.server(s),
                    None    => {
                        servers = false;
                        continue;
                    }
                },
                c = pipeline.connections.recv(), if connections => match c {
                    Some(c) => self.connection(c),
                    None    => {
                        connections = false;
                        continue;
                    }
                },
            };

            trace!("{:?}", event);

            sink.send(event)?;
        }

        debug!("connection queues closed");

        Ok(())
    }

    pub fn server(&mut self, s: ServerConnection) -> Event {
        let container = self.record(s.local.ip(), s.container);

        Event {
            timestamp:   now(),
            kind:        Kind::Server,
            hostname:    self.hostname.clone(),
            local_ip:    s.local.ip(),
            local_port:  s.local.port(),
            remote_ip:   None,
            remote_port: None,
            process:     s.process,
            container,
            local_ips:   self.local_ips.iter().cloned().collect(),
        }
    }

    pub fn connection(&mut self, c: FullConnection) -> Event {
        let local     = c.local.local;
        let container = self.record(local.ip(), c.local.container);

        Event {
            timestamp:   now(),
            kind:        Kind::Connection,
            hostname:    self.hostname.clone(),
            local_ip:    local.ip(),
            local_port:  local.port(),
            remote_ip:   Some(c.remote.ip()),
            remote_port: Some(c.remote.port()),
            process:     c.local.process,
            container,
            local_ips:   self.local_ips.iter().cloned().collect(),
        }
    }

    fn record(&mut self, ip: IpAddr, container: Option<Arc<Container>>) -> Option<ContainerEvent> {
        let recorded = should_be_recorded(ip);

        let container = match container {
            Some(container) => container,
            None            => {
                if recorded {
                    self.local_ips.insert(ip);
                }
                return None;
            }
        };

        let ips = self.container_ips.entry(container.id.clone()).or_default();
        if recorded {
            ips.insert(ip);
        }

        Some(ContainerEvent {
            local_ips: ips.iter().cloned().collect(),
            container,
        })
    }
}

pub fn should_be_recorded(ip: IpAddr) -> bool {
    let localhost = match ip {
        IpAddr::V4(ip) => ip == Ipv4Addr::LOCALHOST,
        IpAddr::V6(ip) => ip == Ipv6Addr::LOCALHOST,
    };
    !ip.is_unspecified() && !localhost
}

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| {
        d.as_millis() as u64
    }).unwrap_or_default()
}
