//! Core Configuration - passed from the app shell

use std::path::Path;
use std::time::Duration;

use crate::chain::{default_networks, ChainId, NetworkConfig};
use crate::provider::ProviderKind;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Messaging network a client is created against. Passed to
/// [`MessagingTransport::create_client`](crate::messaging::MessagingTransport::create_client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessagingEnv {
    #[default]
    Production,
    Dev,
    Local,
}

impl MessagingEnv {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessagingEnv::Production => "production",
            MessagingEnv::Dev => "dev",
            MessagingEnv::Local => "local",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(MessagingEnv::Production),
            "dev" => Some(MessagingEnv::Dev),
            "local" => Some(MessagingEnv::Local),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessagingEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core configuration. The app shell constructs this once at startup.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub app: String,
    pub default_provider: ProviderKind,
    /// Upper bound on a wallet connect, including the user approving it.
    pub connect_timeout: Duration,
    /// Upper bound on the messaging client handshake.
    pub handshake_timeout: Duration,
    pub auto_connect_messaging: bool,
    pub messaging_env: MessagingEnv,
    pub networks: Vec<NetworkConfig>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app: "broadcast".into(),
            default_provider: ProviderKind::Injected,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            auto_connect_messaging: true,
            messaging_env: MessagingEnv::default(),
            networks: default_networks(),
        }
    }
}

impl CoreConfig {
    pub fn new(app: impl Into<String>) -> Self {
        Self { app: app.into(), ..Default::default() }
    }
    pub fn with_default_provider(mut self, kind: ProviderKind) -> Self { self.default_provider = kind; self }
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self { self.connect_timeout = timeout; self }
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self { self.handshake_timeout = timeout; self }
    pub fn with_messaging_env(mut self, env: MessagingEnv) -> Self { self.messaging_env = env; self }
    pub fn without_auto_connect(mut self) -> Self { self.auto_connect_messaging = false; self }

    /// Add or replace a network by chain id.
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.networks.retain(|n| n.chain_id != network.chain_id);
        self.networks.push(network);
        self
    }

    pub fn network(&self, chain_id: ChainId) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    /// Read `BROADCAST_*` overrides from the process environment.
    ///
    /// | Variable | Effect |
    /// |----------|--------|
    /// | `BROADCAST_APP` | app name |
    /// | `BROADCAST_PROVIDER` | `injected` / `relay-pairing` |
    /// | `BROADCAST_CONNECT_TIMEOUT_MS` | connect timeout |
    /// | `BROADCAST_HANDSHAKE_TIMEOUT_MS` | handshake timeout |
    /// | `BROADCAST_AUTO_CONNECT` | `0` disables messaging auto-connect |
    /// | `BROADCAST_MESSAGING_ENV` | `production` / `dev` / `local` |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(app) = env_var("BROADCAST_APP") {
            config.app = app;
        }
        if let Some(kind) = env_var("BROADCAST_PROVIDER").and_then(|v| ProviderKind::from_str(&v)) {
            config.default_provider = kind;
        }
        if let Some(ms) = env_var("BROADCAST_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_var("BROADCAST_HANDSHAKE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(flag) = env_var("BROADCAST_AUTO_CONNECT") {
            config.auto_connect_messaging = !matches!(flag.as_str(), "0" | "false" | "off");
        }
        if let Some(env) = env_var("BROADCAST_MESSAGING_ENV").and_then(|v| MessagingEnv::from_str(&v)) {
            config.messaging_env = env;
        }
        config
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Load `KEY=value` lines from a dotenv file without overriding variables
/// already set. Returns how many variables were applied.
pub fn load_env_file(path: &Path) -> std::io::Result<usize> {
    let contents = std::fs::read_to_string(path)?;
    let mut applied = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');
            if !value.is_empty() && std::env::var(key).is_err() {
                std::env::set_var(key, value);
                applied += 1;
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::POLYGON;

    #[test]
    fn with_network_replaces_by_chain_id() {
        let config = CoreConfig::new("test")
            .with_network(NetworkConfig::new(POLYGON, "Polygon PoS", "POL"));
        let polygon = config.network(POLYGON).unwrap();
        assert_eq!(polygon.name, "Polygon PoS");
        assert_eq!(config.networks.iter().filter(|n| n.chain_id == POLYGON).count(), 1);
    }

    #[test]
    fn messaging_env_parses_aliases() {
        assert_eq!(MessagingEnv::from_str("prod"), Some(MessagingEnv::Production));
        assert_eq!(MessagingEnv::from_str(" Dev "), Some(MessagingEnv::Dev));
        assert_eq!(MessagingEnv::from_str("mainnet"), None);
    }
}
