use std::path::PathBuf;

use envconfig::Envconfig;

/// Settings of the orchestrator process itself. Everything about the
/// supervised services comes from the deployment descriptor.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// Named volumes live in one directory each under this root.
    #[envconfig(from = "VOLUMES_ROOT", default = ".stack/volumes")]
    pub volumes_root: PathBuf,

    /// How often the orchestrator reports its own liveness.
    #[envconfig(from = "HEARTBEAT_INTERVAL_MS", default = "5000")]
    pub heartbeat_interval_ms: u64,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.bind(), "0.0.0.0:3302");
        assert_eq!(config.volumes_root, PathBuf::from(".stack/volumes"));
    }
}
