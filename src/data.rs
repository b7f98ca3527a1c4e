use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use serde::Serialize;

/// One observation of a TCP socket. A destination port of 0 means the
/// socket has no peer and is listening.
#[derive(Clone, Debug)]
pub struct Socket {
    pub src:       SocketAddr,
    pub dst:       SocketAddr,
    pub uid:       u32,
    pub inode:     u64,
    pub container: Option<Arc<Container>>,
}

impl Socket {
    pub fn is_listening(&self) -> bool {
        self.dst.port() == 0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Family {
    V4,
    V6,
}

#[derive(Clone, Debug, Serialize)]
pub struct Container {
    pub id:     String,
    pub name:   String,
    pub image:  String,
    pub env:    Vec<String>,
    pub labels: HashMap<String, String>,
    pub ports:  Vec<Port>,
    pub host:   Arc<DockerHost>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Port {
    pub private:  u64,
    pub public:   Option<u64>,
    pub ip:       Option<String>,
    pub protocol: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct DockerHost {
    pub hostname: String,
    pub ip:       Option<IpAddr>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Process {
    #[serde(skip_serializing_if = "is_zero")]
    pub pid:     i32,
    pub binary:  String,
    pub cmdline: String,
    pub environ: Vec<String>,
    #[serde(skip)]
    pub inodes:  Vec<u64>,
}

impl Process {
    pub fn unknown(inode: u64) -> Self {
        Self {
            binary: format!("Unknown process with inode {}", inode),
            ..Self::default()
        }
    }

    pub fn anonymous(inode: u64) -> Self {
        Self {
            binary: format!("Process with inode {}", inode),
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConnection {
    pub local:     SocketAddr,
    pub process:   Arc<Process>,
    pub container: Option<Arc<Container>>,
}

#[derive(Clone, Debug)]
pub struct FullConnection {
    pub local:  ServerConnection,
    pub remote: SocketAddr,
}

#[derive(Clone, Debug)]
pub enum Connection {
    Server(ServerConnection),
    Full(FullConnection),
}

fn is_zero(pid: &i32) -> bool {
    *pid == 0
}

pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None     => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}
