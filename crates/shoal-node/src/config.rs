use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_stats_time() -> Duration {
    Duration::from_secs(10)
}

fn default_max_memory() -> u64 {
    4 << 30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub data_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    /// Static peer bootstrap; the control plane keeps this current in
    /// a full deployment.
    #[serde(default)]
    pub targets: Vec<PeerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde", default = "TimeoutConfig::default_control")]
    pub control: Duration,
    #[serde(with = "humantime_serde", default = "TimeoutConfig::default_data")]
    pub data: Duration,
    #[serde(with = "humantime_serde", default = "TimeoutConfig::default_public")]
    pub public: Duration,
}

impl TimeoutConfig {
    fn default_control() -> Duration {
        Duration::from_secs(10)
    }
    fn default_data() -> Duration {
        Duration::from_secs(60)
    }
    fn default_public() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            control: Self::default_control(),
            data: Self::default_data(),
            public: Self::default_public(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub daemon_id: String,
    pub mountpaths: Vec<PathBuf>,
    /// Address the intra-data listener binds, e.g. "0.0.0.0:9083".
    pub data_addr: String,
    #[serde(with = "humantime_serde", default = "default_stats_time")]
    pub stats_time: Duration,
    /// Process memory cap for memory-intensive jobs, bytes.
    #[serde(default = "default_max_memory")]
    pub max_memory: u64,
    /// Optional StatsD endpoint, e.g. "127.0.0.1:8125".
    #[serde(default)]
    pub statsd: Option<String>,
    #[serde(default)]
    pub compress_data: bool,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read config {}: {e}", path.display()))?;
        let cfg: Config = serde_json::from_slice(&raw)
            .map_err(|e| anyhow::anyhow!("cannot parse config {}: {e}", path.display()))?;
        if cfg.mountpaths.is_empty() {
            anyhow::bail!("config must list at least one mountpath");
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal_and_full() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(
            &path,
            br#"{
                "daemon_id": "t1",
                "mountpaths": ["/data/mp1", "/data/mp2"],
                "data_addr": "0.0.0.0:9083"
            }"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.daemon_id, "t1");
        assert_eq!(cfg.stats_time, Duration::from_secs(10));
        assert_eq!(cfg.timeouts.data, Duration::from_secs(60));
        assert!(cfg.statsd.is_none());

        std::fs::write(
            &path,
            br#"{
                "daemon_id": "t2",
                "mountpaths": ["/data/mp1"],
                "data_addr": "0.0.0.0:9083",
                "stats_time": "30s",
                "max_memory": 1073741824,
                "statsd": "127.0.0.1:8125",
                "compress_data": true,
                "cluster": {"targets": [{"id": "t3", "data_addr": "10.0.0.3:9083"}]},
                "timeouts": {"control": "5s", "data": "2m", "public": "45s"}
            }"#,
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.stats_time, Duration::from_secs(30));
        assert_eq!(cfg.max_memory, 1 << 30);
        assert_eq!(cfg.cluster.targets.len(), 1);
        assert_eq!(cfg.timeouts.data, Duration::from_secs(120));
        assert!(cfg.compress_data);
    }

    #[test]
    fn empty_mountpaths_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            br#"{"daemon_id": "t1", "mountpaths": [], "data_addr": "0.0.0.0:9083"}"#,
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
    }
}
