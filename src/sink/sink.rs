use std::io::{self, Write};
use std::str::FromStr;
use anyhow::{Error, Result, anyhow};
use crate::export::Event;
use super::Args;
use super::nr::NewRelicClient;

pub enum Sink {
    NewRelic(NewRelicClient),
    Stdout,
}

impl Sink {
    pub fn send(&self, event: Event) -> Result<()> {
        match self {
            Self::NewRelic(c) => c.send(event)?,
            Self::Stdout      => {
                let mut out = io::stdout();
                serde_json::to_writer(&mut out, &event)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::Stdout
    }
}

impl FromStr for Sink {
   type Err = Error;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match Args::parse(arg)? {
            ("newrelic", args) => newrelic(args),
            ("stdout",  _args) => Ok(Self::Stdout),
            _                  => Err(anyhow!("invalid sink: {}", arg)),
        }
    }
}

fn newrelic(args: Args) -> Result<Sink> {
    Ok(Sink::NewRelic(NewRelicClient::new(args)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sinks() {
        assert!(matches!("stdout".parse::<Sink>(), Ok(Sink::Stdout)));
        assert!("kafka,brokers=a".parse::<Sink>().is_err());
        assert!("newrelic,key=abc".parse::<Sink>().is_err());
    }
}
