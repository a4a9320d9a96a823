use std::{env, str::FromStr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    ZooKeeper,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "zookeeper" | "zk" => Ok(Backend::ZooKeeper),
            other => Err(anyhow::anyhow!(
                "COORDINATION_BACKEND must be 'memory' or 'zookeeper', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub backend: Backend,
    pub zk_connect: String,
    pub session_timeout_secs: u64,
    pub namespace: String,
    pub lock_root: String,
    pub bootstrap_strict: bool,
    pub acquire_recheck: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: "0.0.0.0:8080".to_string(),
            backend: Backend::Memory,
            zk_connect: "127.0.0.1:2181".to_string(),
            session_timeout_secs: 30,
            namespace: "lock-namespace".to_string(),
            lock_root: "rootlock".to_string(),
            bootstrap_strict: false,
            acquire_recheck: None,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let backend = match lookup("COORDINATION_BACKEND") {
            Some(value) => value.parse()?,
            None => defaults.backend,
        };

        let session_timeout_secs = match lookup("ZK_SESSION_TIMEOUT_SECS") {
            Some(value) => parse_secs("ZK_SESSION_TIMEOUT_SECS", &value)?,
            None => defaults.session_timeout_secs,
        };

        let acquire_recheck = match lookup("ACQUIRE_RECHECK_SECS") {
            Some(value) => Some(Duration::from_secs(parse_secs("ACQUIRE_RECHECK_SECS", &value)?)),
            None => None,
        };

        let bootstrap_strict = match lookup("BOOTSTRAP_STRICT") {
            Some(value) => parse_bool("BOOTSTRAP_STRICT", &value)?,
            None => defaults.bootstrap_strict,
        };

        let lock_root = lookup("LOCK_ROOT").unwrap_or(defaults.lock_root);
        if lock_root.trim_matches('/').is_empty() || lock_root.trim_matches('/').contains('/') {
            return Err(anyhow::anyhow!(
                "LOCK_ROOT must be a single node name, got '{}'",
                lock_root
            ));
        }

        Ok(Config {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            backend,
            zk_connect: lookup("ZK_CONNECT").unwrap_or(defaults.zk_connect),
            session_timeout_secs,
            namespace: lookup("LOCK_NAMESPACE").unwrap_or(defaults.namespace),
            lock_root,
            bootstrap_strict,
            acquire_recheck,
        })
    }
}

fn parse_secs(name: &str, value: &str) -> anyhow::Result<u64> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(anyhow::anyhow!(
            "{} must be a positive number of seconds, got '{}'",
            name,
            value
        )),
    }
}

fn parse_bool(name: &str, value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow::anyhow!("{} must be a boolean, got '{}'", name, value)),
    }
}
