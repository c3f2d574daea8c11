//! Core type definitions for DiskCache
//!
//! Keys, group identifiers and the cache element stored by the engines.

use bytes::Bytes;
use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Trailing delimiter that turns a plain name key into a prefix for removal
pub const NAME_COMPONENT_DELIMITER: char = ':';

/// Identifies a group of keys within a region
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{cache_name}:{group_name}")]
pub struct GroupId {
    /// Region the group belongs to
    pub cache_name: String,
    /// Name of the group
    pub group_name: String,
}

impl GroupId {
    /// Create a new group identifier
    pub fn new(cache_name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            group_name: group_name.into(),
        }
    }
}

/// A key that belongs to a group
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{group_id}:{attr_name}")]
pub struct GroupAttrName {
    /// Owning group
    pub group_id: GroupId,
    /// Attribute name within the group
    pub attr_name: String,
}

impl GroupAttrName {
    /// Create a new group member key
    pub fn new(group_id: GroupId, attr_name: impl Into<String>) -> Self {
        Self {
            group_id,
            attr_name: attr_name.into(),
        }
    }
}

/// Cache key
///
/// `Name` keys are plain strings. `Member` keys belong to a group, and a bare
/// `Group` key addresses every member of that group on removal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From)]
pub enum CacheKey {
    #[display("{_0}")]
    Name(String),
    #[display("{_0}")]
    Member(GroupAttrName),
    #[display("{_0}")]
    Group(GroupId),
}

impl CacheKey {
    /// Create a plain name key
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Create a group member key
    pub fn member(
        cache_name: impl Into<String>,
        group_name: impl Into<String>,
        attr_name: impl Into<String>,
    ) -> Self {
        Self::Member(GroupAttrName::new(
            GroupId::new(cache_name, group_name),
            attr_name,
        ))
    }

    /// Create a bare group key
    pub fn group(cache_name: impl Into<String>, group_name: impl Into<String>) -> Self {
        Self::Group(GroupId::new(cache_name, group_name))
    }

    /// The prefix addressed by this key if it is a partial name (ends with `:`)
    #[must_use]
    pub fn partial_prefix(&self) -> Option<&str> {
        match self {
            Self::Name(name) if name.ends_with(NAME_COMPONENT_DELIMITER) => Some(name),
            _ => None,
        }
    }

    /// Check whether this key is addressed by a removal of `target`
    ///
    /// A `Group` target covers its members, a partial name covers every name
    /// with that prefix, anything else covers only itself.
    #[must_use]
    pub fn is_covered_by(&self, target: &Self) -> bool {
        match (target, self) {
            (Self::Group(group), Self::Member(member)) => &member.group_id == group,
            (Self::Name(_), Self::Name(name)) => match target.partial_prefix() {
                Some(prefix) => name.starts_with(prefix),
                None => self == target,
            },
            _ => self == target,
        }
    }

    /// Check whether a removal of this key may address more than one entry
    #[must_use]
    pub fn is_multi_key(&self) -> bool {
        matches!(self, Self::Group(_)) || self.partial_prefix().is_some()
    }
}

impl From<&str> for CacheKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

/// Current wall clock time in milliseconds since the epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Lifetime attributes carried with each element
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementAttributes {
    /// Creation time (ms since epoch)
    pub create_time_ms: u64,
    /// Last access time (ms since epoch)
    pub last_access_ms: u64,
    /// Maximum life in seconds; non-positive means no limit
    pub max_life_secs: i64,
    /// Maximum idle time in seconds; non-positive means no limit
    pub idle_time_secs: i64,
    /// Eternal elements never expire
    pub is_eternal: bool,
}

impl Default for ElementAttributes {
    fn default() -> Self {
        let now = now_millis();
        Self {
            create_time_ms: now,
            last_access_ms: now,
            max_life_secs: -1,
            idle_time_secs: -1,
            is_eternal: true,
        }
    }
}

impl ElementAttributes {
    /// Attributes for an element that expires after `max_life_secs`
    #[must_use]
    pub fn with_max_life(max_life_secs: i64) -> Self {
        Self {
            max_life_secs,
            is_eternal: false,
            ..Default::default()
        }
    }

    /// Check whether the element has outlived its max life or idle time
    #[must_use]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        if self.is_eternal {
            return false;
        }
        let exceeded = |since: u64, secs: i64| {
            u64::try_from(secs)
                .ok()
                .filter(|&s| s > 0)
                .is_some_and(|s| now_ms.saturating_sub(since) > s.saturating_mul(1000))
        };
        exceeded(self.create_time_ms, self.max_life_secs)
            || exceeded(self.last_access_ms, self.idle_time_secs)
    }
}

/// The unit stored by the engines
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheElement {
    /// Region the element belongs to
    pub cache_name: String,
    /// Element key
    pub key: CacheKey,
    /// Opaque value
    pub value: Bytes,
    /// Lifetime attributes
    pub attributes: ElementAttributes,
}

impl CacheElement {
    /// Create an element with default (eternal) attributes
    pub fn new(cache_name: impl Into<String>, key: CacheKey, value: impl Into<Bytes>) -> Self {
        Self {
            cache_name: cache_name.into(),
            key,
            value: value.into(),
            attributes: ElementAttributes::default(),
        }
    }

    /// Replace the element's attributes
    #[must_use]
    pub fn with_attributes(mut self, attributes: ElementAttributes) -> Self {
        self.attributes = attributes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        assert_eq!(CacheKey::name("alpha").to_string(), "alpha");
        assert_eq!(CacheKey::group("region", "g1").to_string(), "region:g1");
        assert_eq!(
            CacheKey::member("region", "g1", "attr").to_string(),
            "region:g1:attr"
        );
    }

    #[test]
    fn test_group_coverage() {
        let group = CacheKey::group("region", "g1");
        assert!(CacheKey::member("region", "g1", "a").is_covered_by(&group));
        assert!(!CacheKey::member("region", "g2", "a").is_covered_by(&group));
        assert!(!CacheKey::member("other", "g1", "a").is_covered_by(&group));
        assert!(!CacheKey::name("region:g1:a").is_covered_by(&group));
    }

    #[test]
    fn test_partial_name_coverage() {
        let prefix = CacheKey::name("user:");
        assert_eq!(prefix.partial_prefix(), Some("user:"));
        assert!(prefix.is_multi_key());
        assert!(CacheKey::name("user:1").is_covered_by(&prefix));
        assert!(CacheKey::name("user:").is_covered_by(&prefix));
        assert!(!CacheKey::name("users").is_covered_by(&prefix));

        let exact = CacheKey::name("user");
        assert!(!exact.is_multi_key());
        assert!(CacheKey::name("user").is_covered_by(&exact));
        assert!(!CacheKey::name("user:1").is_covered_by(&exact));
    }

    #[test]
    fn test_attributes_expiry() {
        let eternal = ElementAttributes::default();
        assert!(!eternal.is_expired(u64::MAX));

        let mut attrs = ElementAttributes::with_max_life(10);
        attrs.create_time_ms = 1_000;
        attrs.last_access_ms = 1_000;
        assert!(!attrs.is_expired(5_000));
        assert!(attrs.is_expired(11_001));

        let mut idle = ElementAttributes {
            is_eternal: false,
            idle_time_secs: 2,
            ..Default::default()
        };
        idle.last_access_ms = 0;
        idle.create_time_ms = 0;
        assert!(idle.is_expired(2_001));
        assert!(!idle.is_expired(1_999));
    }
}
