use anyhow::Result;

/// Runtime configuration, loaded from `MODULET_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub namespace: String,
    pub local_ip: String,
    pub cluster_url: String,
    pub status_sync_interval_secs: u64,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let node_name =
            std::env::var("MODULET_NODE_NAME").unwrap_or_else(|_| "modulet-node".to_string());

        let namespace =
            std::env::var("MODULET_NAMESPACE").unwrap_or_else(|_| "default".to_string());

        let local_ip = std::env::var("MODULET_LOCAL_IP").unwrap_or_else(|_| "127.0.0.1".to_string());

        let cluster_url = std::env::var("MODULET_CLUSTER_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:6443".to_string());

        let status_sync_interval_secs = std::env::var("MODULET_STATUS_SYNC_INTERVAL")
            .unwrap_or_else(|_| "30".to_string())
            .parse()?;

        let log_level = std::env::var("MODULET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            node_name,
            namespace,
            local_ip,
            cluster_url,
            status_sync_interval_secs,
            log_level,
        })
    }
}
