use crate::host::is_valid_name_char;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for lease timeouts (one year)
const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Lease allocation settings
    #[serde(default)]
    pub hosts: HostsConfig,

    /// Request forwarding settings
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the proxy front end (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Proxy front-end port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address for the control protocol (default: 127.0.0.1)
    #[serde(default = "default_controller_bind")]
    pub controller_bind: String,

    /// Port for the control protocol
    #[serde(default = "default_controller_port")]
    pub controller_port: u16,

    /// Maximum idle connections per backend port (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            controller_bind: default_controller_bind(),
            controller_port: default_controller_port(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Settings that govern how leases are named, numbered and reclaimed
#[derive(Debug, Deserialize, Clone)]
pub struct HostsConfig {
    /// Prepended to a host name to form its virtual hostname
    #[serde(default)]
    pub domain_prefix: String,

    /// Appended to a host name to form its virtual hostname
    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,

    /// First leasable port (inclusive)
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// End of the leasable port range (exclusive)
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Length of generated host names
    #[serde(default = "default_name_length")]
    pub name_length: usize,

    /// Lease lifetime in seconds, renewed by keep-alive
    #[serde(default = "default_host_timeout")]
    pub timeout_secs: u64,

    /// How often expired leases are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl HostsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Number of ports in the leasable range
    pub fn port_capacity(&self) -> usize {
        usize::from(self.port_range_end.saturating_sub(self.port_range_start))
    }

    pub fn domain_name(&self, name: &str) -> String {
        format!("{}{}{}", self.domain_prefix, name, self.domain_suffix)
    }
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            domain_prefix: String::new(),
            domain_suffix: default_domain_suffix(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            name_length: default_name_length(),
            timeout_secs: default_host_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Append the client address to X-Forwarded-For (default: true)
    #[serde(default = "default_true")]
    pub forward_client_ip: bool,

    /// Forward URL fragments to the backend (default: false)
    #[serde(default)]
    pub forward_fragment: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            forward_client_ip: true,
            forward_fragment: false,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    80
}

fn default_controller_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_controller_port() -> u16 {
    12700
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_domain_suffix() -> String {
    ".localhost".to_string()
}

fn default_port_range_start() -> u16 {
    20000
}

fn default_port_range_end() -> u16 {
    30000
}

fn default_name_length() -> usize {
    6
}

fn default_host_timeout() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Location of the per-user override file (`~/.wormgate/server.toml`)
pub fn default_override_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".wormgate").join("server.toml"))
}

impl Config {
    /// Load `base` (if any) and merge `overrides` (if it exists) on top of it.
    ///
    /// Tables are merged key by key, so an override file only needs the keys
    /// it changes.
    pub fn load_layered(base: Option<&Path>, overrides: Option<&Path>) -> anyhow::Result<Self> {
        let mut merged = match base {
            Some(path) => read_table(path)?,
            None => toml::Table::new(),
        };

        if let Some(path) = overrides.filter(|p| p.exists()) {
            merge_tables(&mut merged, read_table(path)?);
        }

        let config: Config = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let hosts = &self.hosts;
        let range = hosts.port_range_start..=hosts.port_range_end;

        if !hosts.domain_prefix.chars().all(is_valid_name_char) {
            errors.push(format!("invalid domain prefix '{}'", hosts.domain_prefix));
        }
        if !hosts.domain_suffix.chars().all(is_valid_name_char) {
            errors.push(format!("invalid domain suffix '{}'", hosts.domain_suffix));
        }
        if hosts.port_range_start == 0 || hosts.port_range_start >= hosts.port_range_end {
            errors.push(format!(
                "invalid host port range {}..{}",
                hosts.port_range_start, hosts.port_range_end
            ));
        }
        if self.server.controller_port == 0 || range.contains(&self.server.controller_port) {
            errors.push(format!(
                "controller port {} must be non-zero and outside the host port range",
                self.server.controller_port
            ));
        }
        if self.server.port != 0 && range.contains(&self.server.port) {
            errors.push(format!(
                "proxy port {} overlaps the host port range",
                self.server.port
            ));
        }
        if hosts.name_length == 0 {
            errors.push("host name length must be positive".to_string());
        }
        if hosts.timeout_secs == 0 || hosts.timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!("invalid host timeout {}s", hosts.timeout_secs));
        }
        if hosts.sweep_interval_secs == 0 || hosts.sweep_interval_secs > hosts.timeout_secs {
            errors.push(format!(
                "sweep interval {}s must be positive and no longer than the host timeout",
                hosts.sweep_interval_secs
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

fn read_table(path: &Path) -> anyhow::Result<toml::Table> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    content
        .parse::<toml::Table>()
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
bind = "127.0.0.1"
port = 8080
controller_port = 9000

[hosts]
domain_prefix = "t-"
domain_suffix = ".local"
port_range_start = 20000
port_range_end = 20010
name_length = 8
timeout_secs = 60
sweep_interval_secs = 10

[proxy]
forward_client_ip = false
forward_fragment = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.controller_port, 9000);
        assert_eq!(config.hosts.domain_name("api"), "t-api.local");
        assert_eq!(config.hosts.port_capacity(), 10);
        assert_eq!(config.hosts.timeout(), Duration::from_secs(60));
        assert_eq!(config.hosts.sweep_interval(), Duration::from_secs(10));
        assert!(!config.proxy.forward_client_ip);
        assert!(config.proxy.forward_fragment);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.controller_bind, "127.0.0.1");
        assert_eq!(config.server.controller_port, 12700);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.hosts.domain_prefix, "");
        assert_eq!(config.hosts.domain_suffix, ".localhost");
        assert_eq!(config.hosts.name_length, 6);
        assert!(config.proxy.forward_client_ip);
        assert!(!config.proxy.forward_fragment);
    }

    #[test]
    fn test_validate_rejects_controller_port_in_range() {
        let mut config = Config::default();
        config.server.controller_port = config.hosts.port_range_start + 1;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("controller port"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_bad_range() {
        let mut config = Config::default();
        config.hosts.port_range_start = 30000;
        config.hosts.port_range_end = 30000;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid host port range"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_sweep_longer_than_timeout() {
        let mut config = Config::default();
        config.hosts.timeout_secs = 10;
        config.hosts.sweep_interval_secs = 20;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sweep interval"), "{}", err);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.hosts.domain_prefix = "Bad Prefix!".to_string();
        config.hosts.name_length = 0;
        config.hosts.timeout_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid domain prefix"), "{}", err);
        assert!(err.contains("host name length"), "{}", err);
        assert!(err.contains("invalid host timeout"), "{}", err);
    }

    #[test]
    fn test_load_layered_override_wins_per_key() {
        let mut base = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            base,
            "[hosts]\ndomain_suffix = \".base\"\nname_length = 4\n[proxy]\nforward_fragment = true"
        )
        .unwrap();

        let mut overrides = tempfile::NamedTempFile::new().unwrap();
        writeln!(overrides, "[hosts]\nname_length = 12").unwrap();

        let config = Config::load_layered(Some(base.path()), Some(overrides.path())).unwrap();
        assert_eq!(config.hosts.domain_suffix, ".base");
        assert_eq!(config.hosts.name_length, 12);
        assert!(config.proxy.forward_fragment);
    }

    #[test]
    fn test_load_layered_missing_override_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("server.toml");

        let config = Config::load_layered(None, Some(&missing)).unwrap();
        assert_eq!(config.hosts.port_range_start, 20000);
    }

    #[test]
    fn test_load_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[hosts]\nsweep_interval_secs = 0").unwrap();

        let err = Config::load_layered(Some(file.path()), None).unwrap_err().to_string();
        assert!(err.contains("sweep interval"), "{}", err);
    }
}
