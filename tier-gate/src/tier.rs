use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigError;

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrincipalId {
    /// An authenticated user.
    User(String),
    /// An anonymous caller, identified by a client fingerprint such as its address.
    Anonymous(String),
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrincipalId::User(id) => write!(f, "user:{id}"),
            PrincipalId::Anonymous(id) => write!(f, "anon:{id}"),
        }
    }
}

/// A caller and the tier its credentials claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    id: PrincipalId,
    tier: Option<String>,
}

impl Principal {
    pub fn user(id: impl Into<String>, tier: Option<&str>) -> Self {
        Self {
            id: PrincipalId::User(id.into()),
            tier: tier.map(str::to_string),
        }
    }

    pub fn anonymous(fingerprint: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::Anonymous(fingerprint.into()),
            tier: None,
        }
    }

    pub fn id(&self) -> &PrincipalId {
        &self.id
    }

    pub fn tier_name(&self) -> Option<&str> {
        self.tier.as_deref()
    }
}

/// The effective limit applied to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quota {
    pub tier: String,
    /// The normalized path the limit is scoped to, or `*` for the whole tier.
    pub scope: String,
    pub limit: NonZeroU64,
    pub period: Duration,
}

impl Quota {
    /// Store key of the counter for `principal` in window `bucket`.
    pub fn counter_key(&self, principal: &PrincipalId, bucket: u64) -> String {
        format!(
            "ratelimit:{}:{}:{}:{}",
            self.tier, self.scope, principal, bucket
        )
    }
}

/// A named quota class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tier {
    name: String,
    limit: NonZeroU64,
    period: Duration,
    paths: HashMap<String, (NonZeroU64, Duration)>,
}

impl Tier {
    pub fn new(name: impl Into<String>, limit: NonZeroU64, period: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            period,
            paths: HashMap::new(),
        }
    }

    /// Overrides the limit for one path. The path is normalized first.
    pub fn with_path(mut self, path: &str, limit: NonZeroU64, period: Duration) -> Self {
        self.paths.insert(normalize_path(path), (limit, period));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> NonZeroU64 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// The quota that applies to a request for `path`.
    pub fn quota(&self, path: &str) -> Quota {
        let path = normalize_path(path);
        match self.paths.get(&path) {
            Some((limit, period)) => Quota {
                tier: self.name.clone(),
                scope: path,
                limit: *limit,
                period: *period,
            },
            None => Quota {
                tier: self.name.clone(),
                scope: "*".to_string(),
                limit: self.limit,
                period: self.period,
            },
        }
    }
}

/// Process-wide, read-only table of tiers with one default.
#[derive(Debug, Clone)]
pub struct TierTable {
    tiers: HashMap<String, Tier>,
    default: String,
}

impl TierTable {
    /// Builds a table; `default` must name one of `tiers`.
    pub fn new(tiers: impl IntoIterator<Item = Tier>, default: &str) -> Result<Self, ConfigError> {
        let tiers: HashMap<String, Tier> = tiers
            .into_iter()
            .map(|tier| (tier.name.clone(), tier))
            .collect();

        if tiers.is_empty() {
            return Err(ConfigError::Invalid("no tiers configured".to_string()));
        }
        if let Some(tier) = tiers.values().find(|tier| tier.period.is_zero()) {
            return Err(ConfigError::Invalid(format!(
                "tier {} has a zero period",
                tier.name
            )));
        }
        if !tiers.contains_key(default) {
            return Err(ConfigError::Invalid(format!(
                "default tier {default} is not defined"
            )));
        }

        Ok(Self {
            tiers,
            default: default.to_string(),
        })
    }

    /// A table holding exactly one tier, which is also the default.
    pub fn single(name: &str, limit: u64, period: Duration) -> Result<Self, ConfigError> {
        let limit = NonZeroU64::new(limit)
            .ok_or_else(|| ConfigError::Invalid(format!("tier {name} has a zero limit")))?;
        Self::new([Tier::new(name, limit, period)], name)
    }

    /// Maps a principal to its tier. Never fails.
    pub fn resolve(&self, principal: &Principal) -> &Tier {
        if let PrincipalId::User(id) = principal.id()
            && let Some(name) = principal.tier_name()
        {
            if let Some(tier) = self.tiers.get(name) {
                return tier;
            }
            debug!(user = %id, tier = name, "unknown tier, applying default");
        }
        self.default_tier()
    }

    pub fn default_tier(&self) -> &Tier {
        // Presence of the default is checked in `new`.
        &self.tiers[&self.default]
    }

    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.get(name)
    }
}

/// Canonical form of a request path: repeated slashes collapsed, no trailing slash.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nz(n: u64) -> NonZeroU64 {
        NonZeroU64::new(n).unwrap()
    }

    fn table() -> TierTable {
        TierTable::new(
            [
                Tier::new("free", nz(10), Duration::from_secs(3600)),
                Tier::new("pro", nz(1000), Duration::from_secs(3600)).with_path(
                    "/api/v1/tasks/",
                    nz(5),
                    Duration::from_secs(60),
                ),
            ],
            "free",
        )
        .unwrap()
    }

    #[test]
    fn anonymous_principals_get_the_default_tier() {
        let tiers = table();
        assert_eq!(tiers.resolve(&Principal::anonymous("10.0.0.1")).name(), "free");
    }

    #[test]
    fn anonymous_principals_cannot_claim_a_tier() {
        let tiers = table();
        let principal = Principal {
            id: PrincipalId::Anonymous("10.0.0.1".to_string()),
            tier: Some("pro".to_string()),
        };
        assert_eq!(tiers.resolve(&principal).name(), "free");
    }

    #[test]
    fn users_resolve_to_their_tier_or_the_default() {
        let tiers = table();
        assert_eq!(tiers.resolve(&Principal::user("1", Some("pro"))).name(), "pro");
        assert_eq!(tiers.resolve(&Principal::user("2", Some("gold"))).name(), "free");
        assert_eq!(tiers.resolve(&Principal::user("3", None)).name(), "free");
    }

    #[test]
    fn path_overrides_scope_the_quota() {
        let tiers = table();
        let pro = tiers.get("pro").unwrap();

        let scoped = pro.quota("/api/v1//tasks");
        assert_eq!(scoped.scope, "/api/v1/tasks");
        assert_eq!(scoped.limit.get(), 5);
        assert_eq!(scoped.period, Duration::from_secs(60));

        let tier_wide = pro.quota("/api/v1/users");
        assert_eq!(tier_wide.scope, "*");
        assert_eq!(tier_wide.limit.get(), 1000);
    }

    #[test]
    fn counter_keys_separate_principals_and_buckets() {
        let quota = table().default_tier().quota("/");
        let user = PrincipalId::User("42".to_string());
        let anon = PrincipalId::Anonymous("42".to_string());

        assert_eq!(quota.counter_key(&user, 7), "ratelimit:free:*:user:42:7");
        assert_ne!(quota.counter_key(&user, 7), quota.counter_key(&anon, 7));
        assert_ne!(quota.counter_key(&user, 7), quota.counter_key(&user, 8));
    }

    #[test]
    fn rejects_a_missing_default() {
        let err = TierTable::new([Tier::new("free", nz(1), Duration::from_secs(1))], "pro");
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn normalizes_paths() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//api///v1/users/"), "/api/v1/users");
        assert_eq!(normalize_path("api/v1"), "/api/v1");
    }
}
