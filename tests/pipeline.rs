use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::channel;
use tokio::time::{sleep, timeout};
use connwatch::config::Config;
use connwatch::data::Socket;
use connwatch::process::Registry;
use connwatch::procnet::Tables;
use connwatch::source::{start, Source};
use connwatch::track::{Exposure, Tracker};

const TCP: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000   120        0 18232 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0CEA 0100007F:C350 01 00000000:00000000 00:00000000 00000000   120        0 18240 1 0000000000000000 20 4 30 10 -1
   2: F302A8C0:A296 2EDC3AD8:01BB 01 00000000:00000000 02:00000A6C 00000000  1000        0 243331 2 0000000000000000 20 4 30 10 -1
";

const TCP6: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0050 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 19764 1 0000000000000000 100 0 0 10 0
";

fn table(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file
}

fn socket(src: &str, dst: &str) -> Socket {
    Socket {
        src:       src.parse().unwrap(),
        dst:       dst.parse().unwrap(),
        uid:       0,
        inode:     1,
        container: None,
    }
}

fn config() -> Config {
    Config {
        expose_process_info: false,
        poll_interval:       Duration::from_millis(20),
        aggregation:         Duration::from_secs(5),
        ..Config::default()
    }
}

#[tokio::test]
async fn repeated_polls_report_each_socket_once() {
    let v4 = table(TCP);
    let v6 = table(TCP6);
    let tables = Tables {
        v4: v4.path().to_path_buf(),
        v6: v6.path().to_path_buf(),
    };

    let mut pipeline = start(&config(), vec![Source::Tables(tables)]);

    let mut servers = Vec::new();
    for _ in 0..2 {
        let s = timeout(Duration::from_secs(5), pipeline.servers.recv()).await.unwrap().unwrap();
        servers.push(s.local);
    }
    servers.sort();
    assert_eq!(servers, vec![
        "127.0.0.1:3306".parse().unwrap(),
        "[::]:80".parse().unwrap(),
    ]);

    let c = timeout(Duration::from_secs(5), pipeline.connections.recv()).await.unwrap().unwrap();
    assert_eq!(c.local.local, "192.168.2.243:41622".parse().unwrap());
    assert_eq!(c.remote, "216.58.220.46:443".parse().unwrap());

    // several more poll ticks go by without anything new
    sleep(Duration::from_millis(200)).await;
    assert!(pipeline.servers.try_recv().is_err());
    assert!(pipeline.connections.try_recv().is_err());
}

#[tokio::test]
async fn tracker_loop_deduplicates_through_queues() {
    let (tx, rx) = channel(20);
    let (servers_tx, mut servers) = channel(20);
    let (conns_tx, mut conns) = channel(20);

    let exposure = Exposure { process: false, container: false };
    let tracker  = Tracker::new(Registry::new(false, false), exposure, Duration::from_secs(5));
    let task = tokio::spawn(tracker.run(rx, servers_tx, conns_tx));

    tx.send(socket("10.1.2.3:80", "0.0.0.0:0")).await.unwrap();
    assert!(servers.recv().await.is_some());

    tx.send(socket("10.1.2.3:80", "0.0.0.0:0")).await.unwrap();
    tx.send(socket("10.1.2.3:80", "192.0.2.1:40000")).await.unwrap();
    tx.send(socket("10.1.2.4:80", "192.0.2.1:40000")).await.unwrap();

    let c = conns.recv().await.unwrap();
    assert_eq!(c.local.local, "10.1.2.4:80".parse().unwrap());

    drop(tx);
    task.await.unwrap().unwrap();

    assert!(servers.recv().await.is_none());
    assert!(conns.recv().await.is_none());
}

#[tokio::test]
async fn zero_aggregation_reports_duplicates() {
    let (tx, rx) = channel(20);
    let (servers_tx, _servers) = channel(20);
    let (conns_tx, mut conns) = channel(20);

    let exposure = Exposure { process: false, container: false };
    let tracker  = Tracker::new(Registry::new(false, false), exposure, Duration::from_secs(0));
    tokio::spawn(tracker.run(rx, servers_tx, conns_tx));

    tx.send(socket("10.0.0.2:51000", "93.184.216.34:443")).await.unwrap();
    tx.send(socket("10.0.0.2:51000", "93.184.216.34:443")).await.unwrap();

    assert!(conns.recv().await.is_some());
    assert!(conns.recv().await.is_some());
}
