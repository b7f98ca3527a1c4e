use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use log::{debug, error};
use tokio::fs;
use tokio::sync::mpsc::Sender;
use tokio::time::interval;
use crate::data::{canonical, Container, Family, Socket};

const MIN_FIELDS: usize = 10;

#[derive(Clone, Debug)]
pub struct Tables {
    pub v4: PathBuf,
    pub v6: PathBuf,
}

impl Tables {
    pub fn from_env() -> Self {
        let path = |key: &str, default: &str| {
            env::var(key).ok().filter(|v| !v.is_empty()).unwrap_or_else(|| {
                default.to_owned()
            })
        };

        Self {
            v4: path("PROC_NET_TCP",  "/proc/net/tcp").into(),
            v6: path("PROC_NET_TCP6", "/proc/net/tcp6").into(),
        }
    }
}

impl Default for Tables {
    fn default() -> Self {
        Self::from_env()
    }
}

pub async fn poll(tables: Tables, period: Duration, tx: Sender<Socket>) -> Result<()> {
    let mut interval = interval(period);

    loop {
        interval.tick().await;

        for (path, family) in [(&tables.v4, Family::V4), (&tables.v6, Family::V6)] {
            let sockets = match read(path, family).await {
                Ok(sockets) => sockets,
                Err(e)      => {
                    error!("polling connections: {:?}", e);
                    break;
                }
            };

            for socket in sockets {
                if tx.send(socket).await.is_err() {
                    debug!("socket queue closed");
                    return Ok(());
                }
            }
        }
    }
}

pub async fn read(path: &Path, family: Family) -> Result<Vec<Socket>> {
    let text = fs::read_to_string(path).await.map_err(|e| {
        anyhow!("open {}: {}", path.display(), e)
    })?;
    Ok(parse(&text, family, None))
}

pub fn parse(text: &str, family: Family, container: Option<Arc<Container>>) -> Vec<Socket> {
    text.lines().filter_map(|line| {
        let words = line.split_whitespace().collect::<Vec<_>>();

        if words.len() < MIN_FIELDS || words[0] == "sl" {
            debug!("skipping line with {} words: {:?}", words.len(), line);
            return None;
        }

        match entry(&words, family) {
            Ok(socket) if socket.inode == 0 => None,
            Ok(socket) => Some(Socket {
                container: container.clone(),
                ..socket
            }),
            Err(e) => {
                debug!("skipping line {:?}: {}", line, e);
                None
            }
        }
    }).collect()
}

fn entry(words: &[&str], family: Family) -> Result<Socket> {
    Ok(Socket {
        src:       endpoint(words[1], family)?,
        dst:       endpoint(words[2], family)?,
        uid:       words[7].parse()?,
        inode:     words[9].parse()?,
        container: None,
    })
}

fn endpoint(word: &str, family: Family) -> Result<SocketAddr> {
    let (ip, port) = word.split_once(':').ok_or_else(|| {
        anyhow!("no ':' separator in {:?}", word)
    })?;

    let ip = match family {
        Family::V4 => ipv4(ip)?,
        Family::V6 => ipv6(ip)?,
    };
    let port = u16::from_str_radix(port, 16)?;

    Ok(SocketAddr::new(canonical(ip), port))
}

fn ipv4(hex: &str) -> Result<IpAddr> {
    if hex.len() != 8 {
        return Err(anyhow!("invalid ipv4 length: {:?}", hex));
    }
    let word = u32::from_str_radix(hex, 16)?;
    Ok(Ipv4Addr::from(word.to_le_bytes()).into())
}

fn ipv6(hex: &str) -> Result<IpAddr> {
    if hex.len() != 32 {
        return Err(anyhow!("invalid ipv6 length: {:?}", hex));
    }

    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
        let word = hex.get(i * 8..(i + 1) * 8).ok_or_else(|| {
            anyhow!("invalid ipv6 word: {:?}", hex)
        })?;
        let word = u32::from_str_radix(word, 16)?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }

    Ok(Ipv6Addr::from(octets).into())
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use tokio::sync::mpsc::channel;
    use tokio::time::sleep;
    use super::*;

    const TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000   120        0 18232 1 0000000000000000 100 0 0 10 0
   1: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 15113 1 0000000000000000 100 0 0 10 0
   2: F302A8C0:A296 2EDC3AD8:01BB 01 00000000:00000000 02:00000A6C 00000000  1000        0 243331 2 0000000000000000 20 4 30 10 -1
   3: F302A8C0:D3C2 8EFA4D4A:01BB 06 00000000:00000000 03:000005B1 00000000     0        0 0 3 0000000000000000
";

    const TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0050 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 19764 1 0000000000000000 100 0 0 10 0
   1: 0000000000000000FFFF00000100007F:E869 0000000000000000FFFF00000100007F:0CEA 01 00000000:00000000 00:00000000 00000000  1000        0 260913 1 0000000000000000 20 4 30 10 -1
   2: B80D0120000000000000000001000000:01BB 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 19766 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parse_ipv4_table() {
        let sockets = parse(TCP, Family::V4, None);

        assert_eq!(sockets.len(), 3);
        assert_eq!(sockets[0].src, "127.0.0.1:3306".parse().unwrap());
        assert!(sockets[0].is_listening());
        assert_eq!(sockets[0].uid, 120);
        assert_eq!(sockets[0].inode, 18232);

        assert_eq!(sockets[2].src, "192.168.2.243:41622".parse().unwrap());
        assert_eq!(sockets[2].dst, "216.58.220.46:443".parse().unwrap());
        assert_eq!(sockets[2].uid, 1000);
        assert!(!sockets[2].is_listening());
    }

    #[test]
    fn parse_ipv6_table() {
        let sockets = parse(TCP6, Family::V6, None);

        assert_eq!(sockets.len(), 3);
        assert_eq!(sockets[0].src, "[::]:80".parse().unwrap());
        assert_eq!(sockets[1].src, "127.0.0.1:59497".parse().unwrap());
        assert_eq!(sockets[1].dst, "127.0.0.1:3306".parse().unwrap());
        assert_eq!(sockets[2].src, "[2001:db8::1]:443".parse().unwrap());
    }

    #[test]
    fn parse_skips_malformed_lines() {
        let text = format!(
            "{}garbage\n   9: 0100007F 00000000:0000 0A\n   \
             10: ZZ00007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000 0 0 1 1\n\
             \n   11: 0100007F:0CEB 00000000:0000 0A 00000000:00000000 00:00000000 00000000 x 0 7 1\n",
            TCP,
        );

        let sockets = parse(&text, Family::V4, None);
        assert_eq!(sockets.len(), 3);
    }

    #[test]
    fn parse_tags_container() {
        let container = Arc::new(Container {
            id:     "abc".to_owned(),
            name:   "web".to_owned(),
            image:  "nginx".to_owned(),
            env:    Vec::new(),
            labels: Default::default(),
            ports:  Vec::new(),
            host:   Arc::new(crate::data::DockerHost {
                hostname: "dockerhost".to_owned(),
                ip:       None,
            }),
        });

        let sockets = parse(TCP, Family::V4, Some(container));
        assert!(sockets.iter().all(|s| {
            s.container.as_ref().map(|c| c.id.as_str()) == Some("abc")
        }));
    }

    #[tokio::test]
    async fn poll_reads_both_tables() {
        let mut v4 = tempfile::NamedTempFile::new().unwrap();
        let mut v6 = tempfile::NamedTempFile::new().unwrap();
        v4.write_all(TCP.as_bytes()).unwrap();
        v6.write_all(TCP6.as_bytes()).unwrap();

        let tables = Tables {
            v4: v4.path().to_path_buf(),
            v6: v6.path().to_path_buf(),
        };

        let (tx, mut rx) = channel(1);
        let task = tokio::spawn(poll(tables, Duration::from_millis(10), tx));

        let mut sockets = Vec::new();
        for _ in 0..6 {
            sockets.push(rx.recv().await.unwrap());
        }
        drop(rx);

        assert_eq!(sockets[0].inode, 18232);
        assert_eq!(sockets[5].inode, 19766);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn failed_table_ends_the_tick() {
        let mut v6 = tempfile::NamedTempFile::new().unwrap();
        v6.write_all(TCP6.as_bytes()).unwrap();

        let tables = Tables {
            v4: PathBuf::from("/nonexistent/proc/net/tcp"),
            v6: v6.path().to_path_buf(),
        };

        let (tx, mut rx) = channel(16);
        let task = tokio::spawn(poll(tables, Duration::from_millis(10), tx));

        sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        task.abort();
    }

    #[tokio::test]
    async fn read_missing_table_fails() {
        let path = Path::new("/nonexistent/proc/net/tcp");
        assert!(read(path, Family::V4).await.is_err());
    }
}
