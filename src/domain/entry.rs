//! Cache-state entries and the freshness policy applied to them.
//!
//! A [`CacheEntry`] records what was last served for a logical path under a
//! tag, and when. At most one entry exists per `(path, tag)` pair; writes are
//! idempotent upserts keyed on that pair.

use std::collections::BTreeMap;
use std::time::Duration;

use time::OffsetDateTime;

use super::error::DomainError;

/// Fallback tag for paths without a usable leading segment.
pub const ROOT_TAG: &str = "root";

/// Durable record of the last-known state of a rendered path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Logical route, e.g. `/blog/post-1`. Always starts with `/`.
    pub path: String,
    /// Logical invalidation group; multiple paths may share a tag.
    pub tag: String,
    /// Set on every successful regeneration and on every accepted
    /// revalidation request.
    pub revalidated_at: OffsetDateTime,
    /// Entries past this instant are excluded from correctness queries.
    pub expire_at: OffsetDateTime,
}

impl CacheEntry {
    /// Build an entry, rejecting malformed keys at the boundary.
    pub fn new(
        path: impl Into<String>,
        tag: impl Into<String>,
        revalidated_at: OffsetDateTime,
        expire_at: OffsetDateTime,
    ) -> Result<Self, DomainError> {
        let path = path.into();
        let tag = tag.into();
        validate_path(&path)?;
        validate_tag(&tag)?;
        Ok(Self {
            path,
            tag,
            revalidated_at,
            expire_at,
        })
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expire_at <= now
    }
}

/// Reject paths that cannot name a cacheable artifact.
///
/// Logical paths carry no query string and no scheme; the queue and the
/// store both refuse them before anything is persisted.
pub fn validate_path(path: &str) -> Result<(), DomainError> {
    if path.is_empty() {
        return Err(DomainError::validation("path must not be empty"));
    }
    if !path.starts_with('/') {
        return Err(DomainError::validation(format!(
            "path `{path}` must start with `/`"
        )));
    }
    if path.contains(char::is_whitespace) {
        return Err(DomainError::validation(format!(
            "path `{path}` must not contain whitespace"
        )));
    }
    if path.contains('?') || path.contains('#') {
        return Err(DomainError::validation(format!(
            "path `{path}` must not carry a query string or fragment"
        )));
    }
    Ok(())
}

pub fn validate_tag(tag: &str) -> Result<(), DomainError> {
    if tag.is_empty() {
        return Err(DomainError::validation("tag must not be empty"));
    }
    if tag.contains(char::is_whitespace) {
        return Err(DomainError::validation(format!(
            "tag `{tag}` must not contain whitespace"
        )));
    }
    Ok(())
}

/// Derive the invalidation tag for a path: its first segment, or [`ROOT_TAG`]
/// for `/` and other segment-less paths.
pub fn derive_tag(path: &str) -> String {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(ROOT_TAG)
        .to_string()
}

/// Per-route freshness windows: how long a regenerated artifact stays fresh.
///
/// Route overrides match on path prefix, longest prefix wins.
#[derive(Debug, Clone)]
pub struct FreshnessRules {
    default_ttl: Duration,
    route_ttls: Vec<(String, Duration)>,
}

impl FreshnessRules {
    pub fn new(default_ttl: Duration, route_ttls: BTreeMap<String, Duration>) -> Self {
        let mut route_ttls: Vec<(String, Duration)> = route_ttls.into_iter().collect();
        route_ttls.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        Self {
            default_ttl,
            route_ttls,
        }
    }

    pub fn ttl_for(&self, path: &str) -> Duration {
        self.route_ttls
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }

    /// The `(revalidated_at, expire_at)` pair for a write happening at `now`.
    pub fn window_from(&self, path: &str, now: OffsetDateTime) -> (OffsetDateTime, OffsetDateTime) {
        (now, now + self.ttl_for(path))
    }
}

impl Default for FreshnessRules {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), BTreeMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    #[test]
    fn entry_rejects_malformed_path() {
        let at = now();
        assert!(CacheEntry::new("blog/post", "blog", at, at).is_err());
        assert!(CacheEntry::new("", "blog", at, at).is_err());
        assert!(CacheEntry::new("/blog post", "blog", at, at).is_err());
        assert!(CacheEntry::new("/blog?x=1", "blog", at, at).is_err());
    }

    #[test]
    fn entry_rejects_empty_tag() {
        let at = now();
        assert!(CacheEntry::new("/blog/post", "", at, at).is_err());
    }

    #[test]
    fn entry_accepts_valid_key() {
        let at = now();
        let entry = CacheEntry::new("/blog/post-1", "blog", at, at + Duration::from_secs(60))
            .expect("valid entry");
        assert_eq!(entry.path, "/blog/post-1");
        assert_eq!(entry.tag, "blog");
        assert!(!entry.is_expired(at));
        assert!(entry.is_expired(at + Duration::from_secs(61)));
    }

    #[test]
    fn derive_tag_takes_first_segment() {
        assert_eq!(derive_tag("/blog/post-1"), "blog");
        assert_eq!(derive_tag("/docs"), "docs");
        assert_eq!(derive_tag("/"), ROOT_TAG);
        assert_eq!(derive_tag(""), ROOT_TAG);
    }

    #[test]
    fn freshness_longest_prefix_wins() {
        let mut overrides = BTreeMap::new();
        overrides.insert("/blog".to_string(), Duration::from_secs(600));
        overrides.insert("/blog/pinned".to_string(), Duration::from_secs(3600));
        let rules = FreshnessRules::new(Duration::from_secs(60), overrides);

        assert_eq!(rules.ttl_for("/docs"), Duration::from_secs(60));
        assert_eq!(rules.ttl_for("/blog/post-1"), Duration::from_secs(600));
        assert_eq!(rules.ttl_for("/blog/pinned/a"), Duration::from_secs(3600));
    }

    #[test]
    fn freshness_window_is_anchored_at_now() {
        let rules = FreshnessRules::default();
        let at = now();
        let (revalidated_at, expire_at) = rules.window_from("/blog", at);
        assert_eq!(revalidated_at, at);
        assert_eq!(expire_at, at + Duration::from_secs(300));
    }
}
