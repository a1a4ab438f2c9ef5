use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use harvest_core::Partition;
use harvest_fetch::{BackoffPolicy, HttpClientConfig, DEFAULT_API_BASE};
use serde::Deserialize;

use crate::discovery::DiscoveryConfig;
use crate::scheduler::TierConfig;

pub const DEFAULT_CONFIG_FILE: &str = "harvest.yaml";

/// Everything a harvest run needs, resolved from defaults, an optional YAML
/// file and `HARVEST_*` environment variables (in increasing precedence).
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestConfig {
    pub database_url: String,
    pub mirror_url: Option<String>,
    pub mirror_id: String,
    pub api_base: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub max_workers: usize,
    pub miss_threshold: u32,
    pub max_probes: u64,
    pub discovery_retries: u32,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: PathBuf,
    pub scheduler_cron: String,
    pub partitions: Vec<Partition>,
    pub tiers: TierConfig,
}

/// On-disk shape of `harvest.yaml`; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub database_url: Option<String>,
    pub mirror_url: Option<String>,
    pub mirror_id: Option<String>,
    pub api_base: Option<String>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub request_delay_ms: Option<u64>,
    pub max_workers: Option<usize>,
    pub miss_threshold: Option<u32>,
    pub max_probes: Option<u64>,
    pub discovery_retries: Option<u32>,
    pub archive_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_cron: Option<String>,
    pub partitions: Option<Vec<Partition>>,
    pub tiers: Option<TierConfig>,
}

impl HarvestConfig {
    pub fn defaults() -> Self {
        Self {
            database_url: "sqlite://harvest.db".to_string(),
            mirror_url: None,
            mirror_id: "mirror".to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            user_agent: "harvest-bot/0.1".to_string(),
            http_timeout_secs: 30,
            request_delay_ms: 1000,
            max_workers: 2,
            miss_threshold: 50,
            max_probes: 100_000,
            discovery_retries: 3,
            archive_dir: None,
            reports_dir: PathBuf::from("./reports"),
            scheduler_cron: "0 0 6 * * Mon".to_string(),
            partitions: vec![Partition(Utc::now().year().max(0) as u32)],
            tiers: TierConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self::defaults();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults, then `path` (or `./harvest.yaml` when present), then env.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::defaults();
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
        };
        if let Some(path) = file {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let parsed: ConfigFile = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply_file(parsed);
        }
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if file.mirror_url.is_some() {
            self.mirror_url = file.mirror_url;
        }
        if let Some(v) = file.mirror_id {
            self.mirror_id = v;
        }
        if let Some(v) = file.api_base {
            self.api_base = v;
        }
        if let Some(v) = file.user_agent {
            self.user_agent = v;
        }
        self.http_timeout_secs = file.http_timeout_secs.unwrap_or(self.http_timeout_secs);
        self.request_delay_ms = file.request_delay_ms.unwrap_or(self.request_delay_ms);
        self.max_workers = file.max_workers.unwrap_or(self.max_workers);
        self.miss_threshold = file.miss_threshold.unwrap_or(self.miss_threshold);
        self.max_probes = file.max_probes.unwrap_or(self.max_probes);
        self.discovery_retries = file.discovery_retries.unwrap_or(self.discovery_retries);
        if file.archive_dir.is_some() {
            self.archive_dir = file.archive_dir;
        }
        if let Some(v) = file.reports_dir {
            self.reports_dir = v;
        }
        if let Some(v) = file.scheduler_cron {
            self.scheduler_cron = v;
        }
        if let Some(v) = file.partitions {
            self.partitions = v;
        }
        if let Some(v) = file.tiers {
            self.tiers = v;
        }
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("HARVEST_DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = get("HARVEST_MIRROR_URL") {
            self.mirror_url = Some(v);
        }
        if let Some(v) = get("HARVEST_MIRROR_ID") {
            self.mirror_id = v;
        }
        if let Some(v) = get("HARVEST_API_BASE") {
            self.api_base = v;
        }
        if let Some(v) = get("HARVEST_USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("HARVEST_ARCHIVE_DIR") {
            self.archive_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("HARVEST_REPORTS_DIR") {
            self.reports_dir = PathBuf::from(v);
        }
        if let Some(v) = get("HARVEST_SCHEDULER_CRON") {
            self.scheduler_cron = v;
        }
        parse_into(&get, "HARVEST_HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs)?;
        parse_into(&get, "HARVEST_REQUEST_DELAY_MS", &mut self.request_delay_ms)?;
        parse_into(&get, "HARVEST_MAX_WORKERS", &mut self.max_workers)?;
        parse_into(&get, "HARVEST_MISS_THRESHOLD", &mut self.miss_threshold)?;
        parse_into(&get, "HARVEST_MAX_PROBES", &mut self.max_probes)?;
        parse_into(&get, "HARVEST_DISCOVERY_RETRIES", &mut self.discovery_retries)?;
        if let Some(v) = get("HARVEST_PARTITIONS") {
            self.partitions = parse_partitions(&v)?;
        }
        Ok(())
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            miss_threshold: self.miss_threshold,
            max_probes: self.max_probes,
            transient_retries: self.discovery_retries,
            retry_backoff: BackoffPolicy::default(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            api_base: self.api_base.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn parse_into<T>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = get(key) {
        *slot = raw
            .parse()
            .with_context(|| format!("{key} has invalid value `{raw}`"))?;
    }
    Ok(())
}

/// Comma-separated years, e.g. `2023,2024, 2025`.
pub fn parse_partitions(raw: &str) -> Result<Vec<Partition>> {
    let mut partitions = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().with_context(|| format!("invalid partition `{s}`")))
        .collect::<Result<Vec<Partition>>>()?;
    partitions.sort();
    partitions.dedup();
    Ok(partitions)
}
