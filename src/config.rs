use serde::Deserialize;
use std::path::Path;

/// Strategy used by the reverse proxy to pick a worker for each request
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Round-robin: distribute requests evenly in roster order
    #[default]
    #[serde(alias = "roundrobin", alias = "round_robin")]
    RoundRobin,
    /// Least connections: select the worker with the fewest active connections
    #[serde(alias = "least_connections")]
    LeastConnections,
    /// Random: uniformly sample a worker
    Random,
}

/// Cluster configuration
///
/// Immutable once loaded. `validate` must pass before the supervisor starts;
/// port invariants are checked there rather than at use sites.
#[derive(Debug, Deserialize, Clone)]
pub struct ScalingConfig {
    /// Number of worker processes to supervise
    #[serde(default = "default_processes")]
    pub processes: usize,

    /// First worker port; worker `id` binds `base_port + id`
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Whether to run the reverse proxy in front of the workers
    #[serde(default)]
    pub enable_proxy: bool,

    /// Port the reverse proxy listens on (default: 8080)
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Worker selection strategy
    #[serde(default)]
    pub strategy: Strategy,
}

fn default_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_base_port() -> u16 {
    3000
}

fn default_proxy_port() -> u16 {
    8080
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            processes: default_processes(),
            base_port: default_base_port(),
            enable_proxy: false,
            proxy_port: default_proxy_port(),
            strategy: Strategy::default(),
        }
    }
}

impl ScalingConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ScalingConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration invariants, failing fast on violation
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.processes < 1 {
            anyhow::bail!("processes must be at least 1");
        }
        if self.base_port == 0 {
            anyhow::bail!("base_port must be non-zero");
        }
        let last_port = self.base_port as u32 + self.processes as u32 - 1;
        if last_port > u16::MAX as u32 {
            anyhow::bail!(
                "worker ports {}..={} exceed the valid port range",
                self.base_port,
                last_port
            );
        }
        if self.enable_proxy {
            let proxy = self.proxy_port as u32;
            if proxy >= self.base_port as u32 && proxy <= last_port {
                anyhow::bail!(
                    "proxy_port {} collides with the worker port range {}..={}",
                    self.proxy_port,
                    self.base_port,
                    last_port
                );
            }
        }
        Ok(())
    }

    /// Port assigned to the worker with the given id
    pub fn worker_port(&self, id: usize) -> u16 {
        self.base_port + id as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: ScalingConfig = toml::from_str("").unwrap();
        assert!(config.processes >= 1);
        assert_eq!(config.base_port, 3000);
        assert!(!config.enable_proxy);
        assert_eq!(config.proxy_port, 8080);
        assert_eq!(config.strategy, Strategy::RoundRobin);
    }

    #[test]
    fn test_full_toml() {
        let toml = r#"
            processes = 3
            base_port = 9000
            enable_proxy = true
            proxy_port = 8000
            strategy = "least-connections"
        "#;
        let config: ScalingConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.processes, 3);
        assert_eq!(config.base_port, 9000);
        assert!(config.enable_proxy);
        assert_eq!(config.proxy_port, 8000);
        assert_eq!(config.strategy, Strategy::LeastConnections);
        config.validate().unwrap();
    }

    #[test]
    fn test_strategy_aliases() {
        let config: ScalingConfig = toml::from_str(r#"strategy = "round_robin""#).unwrap();
        assert_eq!(config.strategy, Strategy::RoundRobin);
        let config: ScalingConfig = toml::from_str(r#"strategy = "random""#).unwrap();
        assert_eq!(config.strategy, Strategy::Random);
    }

    #[test]
    fn test_rejects_zero_processes() {
        let config = ScalingConfig {
            processes: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_port_range_overflow() {
        let config = ScalingConfig {
            processes: 10,
            base_port: 65530,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Exactly fitting the range is fine
        let config = ScalingConfig {
            processes: 6,
            base_port: 65530,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_proxy_port_inside_worker_range() {
        let config = ScalingConfig {
            processes: 4,
            base_port: 8080,
            enable_proxy: true,
            proxy_port: 8082,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // Same port is allowed when the proxy is disabled
        let config = ScalingConfig {
            processes: 4,
            base_port: 8080,
            enable_proxy: false,
            proxy_port: 8082,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_worker_port_mapping() {
        let config = ScalingConfig {
            processes: 3,
            base_port: 8080,
            ..Default::default()
        };
        assert_eq!(config.worker_port(0), 8080);
        assert_eq!(config.worker_port(1), 8081);
        assert_eq!(config.worker_port(2), 8082);
    }
}
