use std::convert::TryInto;
use std::mem;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Result};
use log::{debug, warn};
use parking_lot::Mutex;
use reqwest::{Client as HttpClient, Method, Request, Url};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio::time::interval;
use crate::export::{Event, Kind};
use crate::source::spawn;
use super::Args;

pub struct NewRelicClient {
    sender: Arc<Sender>,
}

struct Sender {
    client:   HttpClient,
    endpoint: Url,
    events:   Mutex<Vec<Value>>,
}

impl NewRelicClient {
    pub fn new(args: Args) -> Result<Self> {
        let account  = args.get("account")?;
        let key      = args.get("key")?;
        let region   = args.opt("region").unwrap_or("US");
        let interval = args.duration("interval", Duration::from_secs(10))?;

        let host = match region.to_ascii_uppercase().as_str() {
            "US" => "insights-collector.newrelic.com",
            "EU" => "insights-collector.eu01.nr-data.net",
            _    => return Err(anyhow!("invalid region: {}", region)),
        };

        let endpoint = format!("https://{}/v1/accounts/{}/events", host, account);
        let endpoint = Url::parse(&endpoint)?;

        let mut headers = HeaderMap::new();
        headers.insert("X-Insert-Key", HeaderValue::from_str(key)?);
        headers.insert(CONTENT_TYPE, "application/json".try_into()?);

        let client = HttpClient::builder().default_headers(headers).build()?;
        let sender = Arc::new(Sender::new(client, endpoint));

        spawn(sender.clone().exec(interval));

        Ok(Self { sender })
    }

    pub fn send(&self, event: Event) -> Result<()> {
        self.sender.push(attributes(&event));
        Ok(())
    }
}

impl Sender {
    fn new(client: HttpClient, endpoint: Url) -> Self {
        let events = Mutex::new(Vec::new());
        Self { client, endpoint, events }
    }

    fn push(&self, event: Value) {
        self.events.lock().push(event);
    }

    fn drain(&self) -> Vec<Value> {
        let mut events = self.events.lock();
        let empty = Vec::with_capacity(events.len());
        mem::replace(&mut events, empty)
    }

    async fn exec(self: Arc<Self>, period: Duration) -> Result<()> {
        let mut interval = interval(period);

        loop {
            interval.tick().await;

            let events = self.drain();
            if events.is_empty() {
                continue;
            }

            debug!("sending {} events", events.len());

            let endpoint = self.endpoint.clone();
            let mut req  = Request::new(Method::POST, endpoint);
            *req.body_mut() = Some(serde_json::to_vec(&events)?.into());

            match self.client.execute(req).await {
                Ok(res) if !res.status().is_success() => {
                    warn!("send failed: {}", res.text().await.unwrap_or_default());
                }
                Ok(_)  => (),
                Err(e) => warn!("send failed: {}", e),
            }
        }
    }
}

fn attributes(event: &Event) -> Value {
    let kind = match event.kind {
        Kind::Server     => "server",
        Kind::Connection => "connection",
    };

    let mut attrs = json!({
        "eventType":       "ConnectionVisibility",
        "timestamp":       event.timestamp,
        "event":           kind,
        "source.host":     &*event.hostname,
        "source.ip":       event.local_ip,
        "source.port":     event.local_port,
        "process.pid":     event.process.pid,
        "process.binary":  &event.process.binary,
        "process.cmdline": &event.process.cmdline,
    });

    if let (Some(ip), Some(port)) = (event.remote_ip, event.remote_port) {
        attrs["destination.ip"]   = json!(ip);
        attrs["destination.port"] = json!(port);
    }

    if let Some(c) = &event.container {
        attrs["container.id"]    = json!(c.container.id);
        attrs["container.name"]  = json!(c.container.name);
        attrs["container.image"] = json!(c.container.image);
        attrs["container.host"]  = json!(c.container.host.hostname);
    }

    attrs
}
