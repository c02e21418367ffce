//! Configuration.
//!
//! Values are layered with the `config` crate:
//!
//! 1. **Compiled defaults**: every field has one, so an empty file is valid
//! 2. **TOML file**: optional, passed to [`GateConfig::load`]
//! 3. **Environment variables**: `TIER_GATE__SECTION__FIELD`, e.g.
//!    `TIER_GATE__STORE__HOST=redis.internal` or `TIER_GATE__LIMITER__WINDOW=sliding`
//!
//! ```toml
//! [store]
//! host = "localhost"
//! port = 6379
//!
//! [tiers]
//! default = "free"
//!
//! [tiers.tiers.free]
//! limit = 10
//! period_secs = 3600
//!
//! [tiers.tiers.pro]
//! limit = 1000
//! period_secs = 3600
//! paths."/api/v1/tasks" = { limit = 100, period_secs = 60 }
//! ```

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::path::Path;
use std::time::Duration;

use config::Config;
use config::Environment;
use config::File;
use config::FileFormat;
use serde::Deserialize;
use serde::Serialize;

use crate::FailPolicy;
use crate::cache::VaryPolicy;
use crate::error::ConfigError;
use crate::tier::Tier;
use crate::tier::TierTable;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub store: StoreConfig,
    pub tiers: TiersConfig,
    pub limiter: LimiterConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
}

/// Connection to the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    /// Prepended to every key, so several deployments can share one server.
    pub key_prefix: String,
    /// Upper bound on any single store call.
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            key_prefix: "tier-gate:".to_string(),
            timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A `{limit, period}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSpec {
    pub limit: u64,
    pub period_secs: u64,
}

/// One tier: its default quota and per-path overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSpec {
    pub limit: u64,
    pub period_secs: u64,
    #[serde(default)]
    pub paths: BTreeMap<String, LimitSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    /// Tier for anonymous principals and principals without a known tier.
    pub default: String,
    pub tiers: BTreeMap<String, TierSpec>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            default: "free".to_string(),
            tiers: BTreeMap::from([(
                "free".to_string(),
                TierSpec {
                    limit: 10,
                    period_secs: 3600,
                    paths: BTreeMap::new(),
                },
            )]),
        }
    }
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    #[default]
    Fixed,
    Sliding,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub window: WindowKind,
    pub fail_policy: FailPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// How long a response stays in the shared cache.
    pub ttl_secs: u64,
    /// Upper bound on the `max-age` advertised to clients.
    pub client_max_age_secs: u64,
    pub vary_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 30,
            client_max_age_secs: 60,
            vary_headers: VaryPolicy::default().headers().to_vec(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn client_max_age(&self) -> Duration {
        Duration::from_secs(self.client_max_age_secs)
    }

    pub fn vary_policy(&self) -> VaryPolicy {
        VaryPolicy::new(&self.vary_headers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    pub visibility_timeout_secs: u64,
    pub max_attempts: u32,
    /// Soft bound on queued items; unbounded when unset.
    pub max_depth: Option<u64>,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "tasks".to_string(),
            visibility_timeout_secs: 30,
            max_attempts: 5,
            max_depth: None,
            poll_interval_ms: 100,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl GateConfig {
    /// Loads defaults, then `path` if given, then `TIER_GATE__*` environment
    /// variables, and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or parsed, or if the merged
    /// configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let settings: Self = builder
            .add_source(
                Environment::with_prefix("TIER_GATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cache.vary_headers"),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parses a TOML document on top of the defaults, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let settings: Self = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.tiers.tiers.is_empty() {
            return invalid("no tiers configured".to_string());
        }
        if !self.tiers.tiers.contains_key(&self.tiers.default) {
            return invalid(format!(
                "default tier {:?} is not configured",
                self.tiers.default
            ));
        }
        for (name, tier) in &self.tiers.tiers {
            check_limit(name, "*", tier.limit, tier.period_secs)?;
            for (path, spec) in &tier.paths {
                check_limit(name, path, spec.limit, spec.period_secs)?;
            }
        }

        if self.store.timeout_ms == 0 {
            return invalid("store.timeout_ms must be positive".to_string());
        }
        if self.cache.enabled && self.cache.ttl_secs == 0 {
            return invalid("cache.ttl_secs must be positive".to_string());
        }
        if self.queue.visibility_timeout_secs == 0 {
            return invalid("queue.visibility_timeout_secs must be positive".to_string());
        }
        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be positive".to_string());
        }
        if self.queue.poll_interval_ms == 0 {
            return invalid("queue.poll_interval_ms must be positive".to_string());
        }
        Ok(())
    }

    /// Builds the read-only tier table.
    pub fn tier_table(&self) -> Result<TierTable, ConfigError> {
        let mut tiers = Vec::with_capacity(self.tiers.tiers.len());
        for (name, spec) in &self.tiers.tiers {
            let (limit, period) = limit_and_period(name, "*", spec.limit, spec.period_secs)?;
            let mut tier = Tier::new(name.clone(), limit, period);
            for (path, over) in &spec.paths {
                let (limit, period) = limit_and_period(name, path, over.limit, over.period_secs)?;
                tier = tier.with_path(path, limit, period);
            }
            tiers.push(tier);
        }
        TierTable::new(tiers, &self.tiers.default)
    }
}

fn check_limit(tier: &str, path: &str, limit: u64, period_secs: u64) -> Result<(), ConfigError> {
    limit_and_period(tier, path, limit, period_secs).map(|_| ())
}

fn limit_and_period(
    tier: &str,
    path: &str,
    limit: u64,
    period_secs: u64,
) -> Result<(NonZeroU64, Duration), ConfigError> {
    let limit = NonZeroU64::new(limit)
        .ok_or_else(|| ConfigError::Invalid(format!("tier {tier} ({path}): limit must be positive")))?;
    if period_secs == 0 {
        return Err(ConfigError::Invalid(format!(
            "tier {tier} ({path}): period_secs must be positive"
        )));
    }
    Ok((limit, Duration::from_secs(period_secs)))
}
