use std::collections::HashMap;
use std::time::Duration;
use anyhow::{anyhow, Result};
use crate::config::parse_duration;

#[derive(Debug)]
pub struct Args {
    args: HashMap<String, String>,
}

impl Args {
    pub fn parse(args: &str) -> Result<(&str, Self)> {
        let mut split = args.splitn(2, ',');
        let sink = split.next().unwrap_or("");
        let rest = split.next().unwrap_or("");

        let mut map = HashMap::new();
        for arg in rest.split(',').filter(|s| !s.is_empty()) {
            let (k, v) = arg.split_once('=').ok_or_else(|| {
                anyhow!("invalid sink arg '{}'", arg)
            })?;
            map.insert(k.to_owned(), v.to_owned());
        }

        Ok((sink, Self { args: map }))
    }

    pub fn get(&self, name: &str) -> Result<&str> {
        match self.args.get(name) {
            Some(value) => Ok(value.as_str()),
            None        => Err(anyhow!("missing arg '{}'", name)),
        }
    }

    pub fn opt(&self, name: &str) -> Option<&str> {
        self.args.get(name).map(String::as_str)
    }

    pub fn duration(&self, name: &str, default: Duration) -> Result<Duration> {
        match self.opt(name) {
            Some(value) => parse_duration(value),
            None        => Ok(default),
        }
    }
}
