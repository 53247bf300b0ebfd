//! Identity types shared across the engine.
//!
//! Counter IDs are newtypes over `u64` handed out from monotonically
//! increasing counters, so ordering between two IDs of the same kind is issue
//! order. [`CacheKey`] is the exception: it is derived from stage inputs.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Handle returned by every `subscribe`/`listen` call; pass it back to unsubscribe.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Identifier of a notification, unique per engine instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub u64);

impl fmt::Debug for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NotificationId({})", self.0)
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number of a `search()` call. The highest issued value is the only
/// run allowed to write results.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RunId(pub u64);

impl RunId {
    pub const NONE: RunId = RunId(0);
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            write!(f, "RunId(NONE)")
        } else {
            write!(f, "RunId({})", self.0)
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Cache key of one pipeline stage result.
///
/// Holds the full identity of the result: the stage name, its serialized
/// options and the key of the upstream stage, down to the instructions
/// version. Options are length-prefixed so two different chains never render
/// to the same key. Equality compares the whole chain; only `Display` and
/// `Debug` abbreviate it to a digest.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Root key for a given instructions version.
    pub fn root(instructions_version: u64) -> Self {
        Self(format!("instructions@{}", instructions_version).into())
    }

    /// Key of a stage with serialized `options` fed by `upstream`.
    pub fn derive(stage: &str, options: &str, upstream: &CacheKey) -> Self {
        Self(format!("{}:{}:{}|{}", stage, options.len(), options, upstream.0).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn digest(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:016x})", self.digest())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id() {
        assert_eq!(RunId::default(), RunId::NONE);
        assert!(RunId(2) > RunId(1));
        assert_eq!(format!("{:?}", RunId::NONE), "RunId(NONE)");
    }

    #[test]
    fn test_cache_key_depends_on_upstream() {
        let a = CacheKey::root(1);
        let b = CacheKey::root(2);
        assert_ne!(a, b);

        let ga = CacheKey::derive("grouping", "{}", &a);
        let gb = CacheKey::derive("grouping", "{}", &b);
        assert_ne!(ga, gb);
        assert_eq!(ga, CacheKey::derive("grouping", "{}", &a));
    }

    #[test]
    fn test_cache_key_depends_on_stage_and_options() {
        let root = CacheKey::root(1);
        assert_ne!(
            CacheKey::derive("grouping", "{}", &root),
            CacheKey::derive("query", "{}", &root)
        );
        assert_ne!(
            CacheKey::derive("query", "{\"a\":1}", &root),
            CacheKey::derive("query", "{\"a\":2}", &root)
        );
    }

    #[test]
    fn test_cache_key_keeps_option_boundaries() {
        let root = CacheKey::root(1);
        // Options that embed what looks like a further chain stay distinct
        let nested = CacheKey::derive("query", "a", &CacheKey::derive("grouping", "b", &root));
        let flat = CacheKey::derive("query", &format!("a|grouping:1:b|{}", root.as_str()), &root);
        assert_ne!(nested, flat);
        assert_eq!(format!("{}", nested).len(), 16);
    }
}
