//! Cache-bust tokens for remote commands.
//!
//! The remote tool treats a command as cached when its environment matches a
//! previous invocation. Injecting a fresh `CACHEBUSTER` value forces it to run
//! again. Polarity follows the `cache_enabled` flag: `false` busts the cache,
//! `true` yields an empty token and lets the remote side reuse results.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Environment variable the token is exported as
pub const CACHE_BUSTER_ENV: &str = "CACHEBUSTER";

static LAST_TOKEN: AtomicI64 = AtomicI64::new(0);

/// Whether remote caching is allowed for a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Every remote command runs fresh (`cache_enabled = false`)
    #[default]
    Bust,
    /// Remote side may reuse cached results (`cache_enabled = true`)
    Reuse,
}

impl CacheMode {
    pub fn from_cache_enabled(cache_enabled: bool) -> Self {
        if cache_enabled {
            Self::Reuse
        } else {
            Self::Bust
        }
    }

    pub fn cache_enabled(self) -> bool {
        self == Self::Reuse
    }

    /// Issue the token for one run
    pub fn token(self) -> CacheToken {
        CacheToken::new(self.cache_enabled())
    }
}

/// Per-run cache signal
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheToken(String);

impl CacheToken {
    /// `enabled = false` → time-derived token; `enabled = true` → empty
    pub fn new(enabled: bool) -> Self {
        if enabled {
            Self::empty()
        } else {
            Self(next_timestamp().to_string())
        }
    }

    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Microseconds since the epoch, strictly increasing within the process
fn next_timestamp() -> i64 {
    let now = Utc::now().timestamp_micros();
    let mut last = LAST_TOKEN.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_TOKEN.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_cache_yields_empty_token() {
        assert!(CacheToken::new(true).is_empty());
        assert!(CacheMode::Reuse.token().is_empty());
    }

    #[test]
    fn test_disabled_cache_yields_distinct_tokens() {
        let a = CacheToken::new(false);
        let b = CacheToken::new(false);

        assert!(!a.is_empty());
        assert!(!b.is_empty());
        assert_ne!(a, b);
        assert!(b.as_str().parse::<i64>().unwrap() > a.as_str().parse::<i64>().unwrap());
    }

    #[test]
    fn test_mode_polarity() {
        assert_eq!(CacheMode::from_cache_enabled(false), CacheMode::Bust);
        assert_eq!(CacheMode::from_cache_enabled(true), CacheMode::Reuse);
        assert_eq!(CacheMode::default(), CacheMode::Bust);
    }

    #[test]
    fn test_token_serializes_as_plain_string() {
        let token = CacheToken::empty();
        assert_eq!(serde_json::to_string(&token).unwrap(), "\"\"");
    }
}
