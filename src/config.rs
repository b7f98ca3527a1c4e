use std::time::Duration;
use anyhow::{anyhow, Result};
use log::debug;

#[derive(Clone, Debug)]
pub struct Config {
    pub expose_process_info:           bool,
    pub expose_container_process_info: bool,
    pub expose_cmdline:                bool,
    pub expose_environ:                bool,
    pub enable_local_connections:      bool,
    pub enable_docker:                 bool,
    pub enable_tcp_diag:               bool,
    pub poll_interval:                 Duration,
    pub aggregation:                   Duration,
    pub docker_environment:            Vec<String>,
    pub queue_size:                    usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            expose_process_info:           true,
            expose_container_process_info: false,
            expose_cmdline:                true,
            expose_environ:                false,
            enable_local_connections:      true,
            enable_docker:                 false,
            enable_tcp_diag:               false,
            poll_interval:                 Duration::from_secs(2),
            aggregation:                   Duration::from_secs(30),
            docker_environment:            Vec::new(),
            queue_size:                    20,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.enable_docker && self.enable_tcp_diag {
            if !self.enable_local_connections {
                return Err(anyhow!("tcp_diag is not supported when only monitoring docker containers"));
            }
            debug!("tcp_diag enabled for local processes but not for docker");
        }

        if self.poll_interval == Duration::from_secs(0) {
            return Err(anyhow!("poll interval must be greater than zero"));
        }

        if self.queue_size == 0 {
            return Err(anyhow!("queue size must be greater than zero"));
        }

        Ok(())
    }
}

/// Parses `500ms`, `2s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or_else(|| s.len());
    let (n, unit) = s.split_at(split);

    let n = n.parse::<u64>().map_err(|_| anyhow!("invalid duration: {:?}", s))?;

    Ok(match unit {
        "ms"     => Duration::from_millis(n),
        "s" | "" => Duration::from_secs(n),
        "m"      => Duration::from_secs(n * 60),
        "h"      => Duration::from_secs(n * 60 * 60),
        _        => return Err(anyhow!("invalid duration unit: {:?}", s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn tcp_diag_needs_local_connections_with_docker() {
        let mut config = Config {
            enable_docker:   true,
            enable_tcp_diag: true,
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        config.enable_local_connections = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = Config {
            poll_interval: Duration::from_secs(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
