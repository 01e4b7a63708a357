use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use faas_common::{FaasError, Result, Semaphore};
use faas_gateway::ChannelScope;
use faas_orchestrator::WatchConfig;

pub const DEFAULT_PORT: u16 = 13557;

#[derive(Debug, Clone, PartialEq)]
pub struct DevConfig {
    pub app: String,
    pub stage: String,
    pub root: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    /// `None` sizes the build semaphore from the CPU count.
    pub build_concurrency: Option<usize>,
    pub watch: WatchConfig,
    /// Deadline for loopback HTTP invocations that don't name one.
    pub default_timeout: Duration,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            app: "app".to_string(),
            stage: "dev".to_string(),
            root: PathBuf::from("."),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            build_concurrency: None,
            watch: WatchConfig::default(),
            default_timeout: Duration::from_secs(10),
        }
    }
}

impl DevConfig {
    /// Reads `FAAS_DEV_*` from the process environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if std::env::var_os("FAAS_DEV_ROOT").is_none() {
            config.root = std::env::current_dir()?;
        }
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            app: lookup("FAAS_DEV_APP").unwrap_or(defaults.app),
            stage: lookup("FAAS_DEV_STAGE").unwrap_or(defaults.stage),
            root: lookup("FAAS_DEV_ROOT").map(PathBuf::from).unwrap_or(defaults.root),
            host: parse(&lookup, "FAAS_DEV_HOST")?.unwrap_or(defaults.host),
            port: parse(&lookup, "FAAS_DEV_PORT")?.unwrap_or(defaults.port),
            build_concurrency: match parse::<usize>(&lookup, "FAAS_DEV_BUILD_CONCURRENCY")? {
                Some(0) => {
                    return Err(FaasError::Config(
                        "FAAS_DEV_BUILD_CONCURRENCY must be at least 1".to_string(),
                    ))
                }
                other => other,
            },
            watch: WatchConfig {
                poll_interval: parse(&lookup, "FAAS_DEV_WATCH_POLL_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.watch.poll_interval),
                stability: parse(&lookup, "FAAS_DEV_WATCH_STABILITY_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.watch.stability),
            },
            default_timeout: parse(&lookup, "FAAS_DEV_DEFAULT_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.default_timeout),
        })
    }

    pub fn scope(&self) -> ChannelScope {
        ChannelScope::new(&self.app, &self.stage)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn build_semaphore(&self) -> Semaphore {
        match self.build_concurrency {
            Some(max) => Semaphore::new(max),
            None => Semaphore::for_builds(),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| FaasError::Config(format!("{key}={raw:?}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DevConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DevConfig::default());
        assert_eq!(config.addr().to_string(), "127.0.0.1:13557");
        assert_eq!(config.scope().invoke_topic(), "faas-dev/app/dev/invoke");
    }

    #[test]
    fn test_overrides() {
        let config = DevConfig::from_lookup(lookup(&[
            ("FAAS_DEV_APP", "shop"),
            ("FAAS_DEV_STAGE", "alice"),
            ("FAAS_DEV_PORT", "9000"),
            ("FAAS_DEV_BUILD_CONCURRENCY", "2"),
            ("FAAS_DEV_WATCH_STABILITY_MS", "50"),
            ("FAAS_DEV_DEFAULT_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.scope().events_topic(), "faas-dev/shop/alice/events");
        assert_eq!(config.port, 9000);
        assert_eq!(config.build_semaphore().max(), 2);
        assert_eq!(config.watch.stability, Duration::from_millis(50));
        assert_eq!(config.default_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for vars in [
            [("FAAS_DEV_PORT", "http")],
            [("FAAS_DEV_BUILD_CONCURRENCY", "0")],
            [("FAAS_DEV_HOST", "localhost:1")],
        ] {
            assert!(matches!(
                DevConfig::from_lookup(lookup(&vars)),
                Err(FaasError::Config(_))
            ));
        }
    }
}
