use std::cmp::max;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::Result;
use log::{debug, trace};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval, Interval};
use crate::data::{Connection, FullConnection, Process, ServerConnection, Socket};
use crate::process::Registry;

#[derive(Clone, Copy, Debug)]
pub struct Exposure {
    pub process:   bool,
    pub container: bool,
}

pub struct Tracker {
    listening:   HashMap<SocketAddr, Instant>,
    outgoing:    HashMap<(SocketAddr, SocketAddr), Instant>,
    registry:    Registry,
    exposure:    Exposure,
    aggregation: Duration,
    last_sweep:  Instant,
}

impl Tracker {
    pub fn new(registry: Registry, exposure: Exposure, aggregation: Duration) -> Self {
        Self {
            listening:   HashMap::new(),
            outgoing:    HashMap::new(),
            registry,
            exposure,
            aggregation,
            last_sweep:  Instant::now(),
        }
    }

    pub async fn run(
        mut self,
        mut rx:  Receiver<Socket>,
        servers: Sender<ServerConnection>,
        conns:   Sender<FullConnection>,
    ) -> Result<()> {
        let mut ticks = interval(max(self.aggregation, Duration::from_secs(1)));
        while self.step(&mut rx, &mut ticks, &servers, &conns).await {}
        Ok(())
    }

    async fn step(
        &mut self,
        rx:      &mut Receiver<Socket>,
        ticks:   &mut Interval,
        servers: &Sender<ServerConnection>,
        conns:   &Sender<FullConnection>,
    ) -> bool {
        let socket = tokio::select! {
            socket = rx.recv() => match socket {
                Some(socket) => socket,
                None         => return false,
            },
            _ = ticks.tick() => {
                self.expire(Instant::now());
                return true;
            }
        };

        trace!("{:?}", socket);

        let sent = match self.observe(socket, Instant::now()) {
            Some(Connection::Server(s)) => servers.send(s).await.is_ok(),
            Some(Connection::Full(c))   => conns.send(c).await.is_ok(),
            None                        => true,
        };

        if !sent {
            debug!("connection queue closed");
        }

        sent
    }

    pub fn observe(&mut self, socket: Socket, now: Instant) -> Option<Connection> {
        let connection = self.classify(socket, now);
        self.expire(now);
        connection
    }

    pub fn sweep(&mut self, now: Instant) {
        let window = self.aggregation * 2;
        let before = self.listening.len() + self.outgoing.len();

        let live = |when: &mut Instant| now.saturating_duration_since(*when) <= window;
        self.listening.retain(|_, when| live(when));
        self.outgoing.retain(|_, when| live(when));
        self.last_sweep = now;

        let after = self.listening.len() + self.outgoing.len();
        debug!("swept {} dedup entries", before - after);
    }

    pub fn listening(&self) -> usize {
        self.listening.len()
    }

    pub fn outgoing(&self) -> usize {
        self.outgoing.len()
    }

    fn classify(&mut self, socket: Socket, now: Instant) -> Option<Connection> {
        let local = socket.src;

        if self.seen(self.listening.get(&local), now) {
            return None;
        }
        self.listening.insert(local, now);

        if socket.is_listening() {
            return Some(Connection::Server(ServerConnection {
                local,
                process:   self.process(&socket),
                container: socket.container,
            }));
        }

        let key = (local, socket.dst);
        if self.seen(self.outgoing.get(&key), now) {
            return None;
        }
        self.outgoing.insert(key, now);

        Some(Connection::Full(FullConnection {
            local: ServerConnection {
                local,
                process:   self.process(&socket),
                container: socket.container,
            },
            remote: socket.dst,
        }))
    }

    fn expire(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) > self.aggregation * 2 {
            self.sweep(now);
        }
    }

    fn seen(&self, when: Option<&Instant>, now: Instant) -> bool {
        when.map_or(false, |when| {
            now.saturating_duration_since(*when) < self.aggregation
        })
    }

    fn process(&mut self, socket: &Socket) -> Arc<Process> {
        let inode  = socket.inode;
        let expose = match socket.container {
            Some(_) => self.exposure.process && self.exposure.container,
            None    => self.exposure.process,
        };

        if !expose {
            return Arc::new(Process::anonymous(inode));
        }

        self.registry.lookup(inode).unwrap_or_else(|| {
            Arc::new(Process::unknown(inode))
        })
    }
}
