use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    // stun servers tried in order until one answers, host or host:port
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    // port appended to server entries without an explicit one
    #[serde(default = "default_stun_port")]
    pub stun_port: u16,

    // local address probes are sent from, 0.0.0.0 picks the routed one
    #[serde(default = "default_source_ip")]
    pub source_ip: String,

    // local port probes are sent from
    #[serde(default = "default_source_port")]
    pub source_port: u16,

    // first receive timeout in milliseconds, doubled on every retry
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    // binding request attempts per exchange
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

fn default_stun_servers() -> Vec<String> {
    [
        "stunserver.stunprotocol.org",
        "stun.hot-chilli.net",
        "stun.fitauto.ru",
        "stun.syncthing.net",
        "stun.qq.com",
        "stun.miwifi.com",
        "stun.voipbuster.com",
        "stun.voipstunt.com",
        "stun.voxgratia.org",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stun_port() -> u16 {
    3478
}

fn default_source_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_source_port() -> u16 {
    54320
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_attempts() -> u32 {
    3
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            stun_servers: default_stun_servers(),
            stun_port: default_stun_port(),
            source_ip: default_source_ip(),
            source_port: default_source_port(),
            timeout_ms: default_timeout_ms(),
            attempts: default_attempts(),
        }
    }
}

impl ProbeConfig {
    /// Server endpoints in walk order, all in `host:port` form
    ///
    /// Entries that already carry a port keep it, everything else gets
    /// `stun_port` appended. An override replaces the whole list.
    pub fn endpoints(&self, host_override: Option<&str>) -> Vec<String> {
        let with_port = |host: &str| {
            if host.contains(':') {
                host.to_string()
            } else {
                format!("{}:{}", host, self.stun_port)
            }
        };
        match host_override {
            Some(host) => vec![with_port(host)],
            None => self.stun_servers.iter().map(|host| with_port(host)).collect(),
        }
    }
}

pub fn load(path: &str) -> anyhow::Result<ProbeConfig> {
    let content = fs::read_to_string(path)?;
    let config: ProbeConfig = toml::from_str(&content)?;
    Ok(config)
}
