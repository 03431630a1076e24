use anyhow::{Context, Result, bail};
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(
        default = "default_check_interval",
        deserialize_with = "duration_field"
    )]
    pub check_interval: Duration,
    #[serde(
        default = "default_reconnect_delay",
        deserialize_with = "duration_field"
    )]
    pub reconnect_delay: Duration,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub kubeconfig: PathBuf,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    pub namespace: String,
    pub service: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub local_port: u16,
    pub remote_port: u16,
    #[serde(default)]
    pub db_backup: Option<DbBackupConfig>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Service,
    Pod,
}

impl Display for TargetKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Service => write!(f, "service"),
            Self::Pod => write!(f, "pod"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbBackupConfig {
    #[serde(default)]
    pub secret_name: Option<String>,
    #[serde(default)]
    pub field_mapping: HashMap<String, String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Config {
    pub fn forward_count(&self) -> usize {
        self.clusters
            .iter()
            .map(|cluster| cluster.forwards.len())
            .sum()
    }

    pub fn backup_count(&self) -> usize {
        self.clusters
            .iter()
            .flat_map(|cluster| &cluster.forwards)
            .filter(|forward| forward.db_backup.is_some())
            .count()
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    // A zero interval means unset, same as a missing key.
    if config.check_interval.is_zero() {
        config.check_interval = DEFAULT_CHECK_INTERVAL;
    }
    if config.reconnect_delay.is_zero() {
        config.reconnect_delay = DEFAULT_RECONNECT_DELAY;
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.clusters.is_empty() {
        bail!("no clusters configured");
    }

    let mut cluster_names = HashSet::new();
    let mut local_ports: HashMap<u16, String> = HashMap::new();

    for (index, cluster) in config.clusters.iter().enumerate() {
        if cluster.name.trim().is_empty() {
            bail!("cluster at index {index} has no name");
        }
        if !cluster_names.insert(cluster.name.as_str()) {
            bail!("duplicate cluster name: {}", cluster.name);
        }
        if !cluster.kubeconfig.exists() {
            bail!(
                "kubeconfig file not found for cluster '{}': {}",
                cluster.name,
                cluster.kubeconfig.display()
            );
        }
        if cluster.forwards.is_empty() {
            bail!("cluster '{}' has no port-forwards configured", cluster.name);
        }

        let mut forward_keys = HashSet::new();
        for forward in &cluster.forwards {
            if forward.namespace.trim().is_empty() {
                bail!("forward in cluster '{}' has no namespace", cluster.name);
            }
            if forward.service.trim().is_empty() {
                bail!(
                    "forward in cluster '{}' has no service/pod name",
                    cluster.name
                );
            }
            if !forward_keys.insert((forward.namespace.as_str(), forward.service.as_str())) {
                bail!(
                    "duplicate forward for '{}' in namespace '{}' in cluster '{}'",
                    forward.service,
                    forward.namespace,
                    cluster.name
                );
            }
            if forward.local_port == 0 {
                bail!(
                    "forward for '{}/{}' in cluster '{}' has invalid local_port: 0 (must be 1-65535)",
                    forward.namespace,
                    forward.service,
                    cluster.name
                );
            }
            if forward.remote_port == 0 {
                bail!(
                    "forward for '{}/{}' in cluster '{}' has invalid remote_port: 0 (must be 1-65535)",
                    forward.namespace,
                    forward.service,
                    cluster.name
                );
            }

            let owner = format!(
                "{}/{}/{}",
                cluster.name, forward.namespace, forward.service
            );
            if let Some(existing) = local_ports.insert(forward.local_port, owner.clone()) {
                bail!(
                    "local port {} is used by both '{existing}' and '{owner}'",
                    forward.local_port
                );
            }
        }
    }

    Ok(())
}

fn default_check_interval() -> Duration {
    DEFAULT_CHECK_INTERVAL
}

fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY
}

fn duration_field<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Parses duration strings of the form `500ms`, `10s`, `2m` or `1h`.
fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{raw}' is missing a unit (ms, s, m, h)"))?;
    let (value, unit) = raw.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration value in '{raw}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3_600)),
        other => Err(format!("unknown duration unit '{other}' in '{raw}'")),
    }
}
