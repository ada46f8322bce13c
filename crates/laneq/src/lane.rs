//! Lane namespacing
//!
//! A lane is the partition a deployment reads and writes. Production and
//! staging use their stack name; in development every machine gets its own
//! lane (its host name) so developers sharing one backend never steal each
//! other's jobs.
//!
//! Every backend key is derived from a [`Namespace`]: the stack prefix with
//! the `{mq}` hash tag, followed by the lane.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hash tag appended to the stack prefix; keeps all queue keys on one
/// Redis Cluster slot
pub const NAMESPACE_TAG: &str = "{mq}";

/// Longest lane name accepted
pub const MAX_LANE_LEN: usize = 64;

/// Hex digits of the digest appended to sanitized lane names
const SANITIZED_DIGEST_LEN: usize = 8;

/// Lane-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaneError {
    /// Empty lane name
    #[error("lane name must not be empty")]
    Empty,

    /// Lane name longer than [`MAX_LANE_LEN`]
    #[error("lane name exceeds {MAX_LANE_LEN} characters: {0}")]
    TooLong(String),

    /// Lane name contains a character that would break key derivation
    #[error("lane name contains invalid character {ch:?}: {lane}")]
    InvalidCharacter { lane: String, ch: char },
}

/// Partition identifier, one per logical deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lane(String);

impl Lane {
    /// Create a lane, rejecting names that could collide after key derivation
    pub fn new(name: impl Into<String>) -> Result<Self, LaneError> {
        let name = name.into();
        if name.is_empty() {
            return Err(LaneError::Empty);
        }
        if name.chars().count() > MAX_LANE_LEN {
            return Err(LaneError::TooLong(name));
        }
        if let Some(ch) = name.chars().find(|c| !is_lane_char(*c)) {
            return Err(LaneError::InvalidCharacter { lane: name, ch });
        }
        Ok(Self(name))
    }

    /// Build a lane from arbitrary input (e.g. a host name), replacing
    /// invalid characters with `-`
    ///
    /// When the input had to be changed, a short digest of it is appended so
    /// that distinct inputs (`Jane's`, `Jane-s`) keep distinct lanes.
    pub fn sanitized(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self("local".to_string());
        }

        let cleaned: String = raw
            .chars()
            .map(|c| if is_lane_char(c) { c } else { '-' })
            .collect();
        if cleaned == raw && cleaned.len() <= MAX_LANE_LEN {
            return Self(cleaned);
        }

        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        let suffix = &digest[..SANITIZED_DIGEST_LEN];
        let body: String = cleaned
            .chars()
            .take(MAX_LANE_LEN - SANITIZED_DIGEST_LEN - 1)
            .collect();
        let lane = format!("{body}-{suffix}");
        tracing::warn!(raw = %raw, lane = %lane, "Lane name sanitized");
        Self(lane)
    }

    /// Lane name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Lane {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn is_lane_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Inputs that decide the current lane
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaneConfig {
    /// Deployment stack (e.g. "production", "staging")
    pub stack: String,

    /// Local/interactive development mode
    pub dev: bool,

    /// Host name override for development mode
    pub host: Option<String>,
}

impl LaneConfig {
    /// Lane configuration for a deployed stack
    pub fn stack(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            dev: false,
            host: None,
        }
    }

    /// Lane configuration for local development
    pub fn dev(stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            dev: true,
            host: None,
        }
    }

    /// Override the host name used in development mode
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// The lane this process reads and writes
    ///
    /// Deployed stacks use the stack name; development mode uses the machine
    /// host name.
    pub fn current_lane(&self) -> Lane {
        if self.dev {
            let host = self
                .host
                .clone()
                .or_else(sysinfo::System::host_name)
                .unwrap_or_else(|| "localhost".to_string());
            Lane::sanitized(&host)
        } else {
            Lane::sanitized(&self.stack)
        }
    }

    /// Namespace for the current lane
    pub fn namespace(&self) -> Namespace {
        Namespace::for_stack(&self.stack, self.current_lane())
    }
}

/// Backend key space of one lane
///
/// # Example
///
/// ```
/// use laneq::{Lane, Namespace};
///
/// let ns = Namespace::for_stack("production", Lane::new("production").unwrap());
/// assert_eq!(ns.key(), "production:{mq}:production");
/// assert_eq!(ns.key_for("pending"), "production:{mq}:production:pending");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    prefix: String,
    lane: Lane,
}

impl Namespace {
    /// Namespace with an explicit prefix
    pub fn new(prefix: impl Into<String>, lane: Lane) -> Self {
        Self {
            prefix: prefix.into(),
            lane,
        }
    }

    /// Namespace with the default `{stack}:{mq}` prefix
    pub fn for_stack(stack: &str, lane: Lane) -> Self {
        Self::new(default_prefix(stack), lane)
    }

    /// Key prefix shared by all lanes of a stack
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Lane of this namespace
    pub fn lane(&self) -> &Lane {
        &self.lane
    }

    /// Root key of the lane
    pub fn key(&self) -> String {
        format!("{}:{}", self.prefix, self.lane)
    }

    /// Key for a structure within the lane
    pub fn key_for(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.lane, suffix)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.lane)
    }
}

/// Default key prefix for a stack
pub fn default_prefix(stack: &str) -> String {
    format!("{stack}:{NAMESPACE_TAG}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_validation() {
        assert!(Lane::new("production").is_ok());
        assert!(Lane::new("dev-box_01.local").is_ok());
        assert_eq!(Lane::new(""), Err(LaneError::Empty));
        assert!(matches!(
            Lane::new("a:b"),
            Err(LaneError::InvalidCharacter { ch: ':', .. })
        ));
        assert!(matches!(
            Lane::new("x".repeat(65)),
            Err(LaneError::TooLong(_))
        ));
    }

    #[test]
    fn test_sanitized() {
        assert_eq!(Lane::sanitized("alice-laptop").as_str(), "alice-laptop");
        assert_eq!(
            Lane::sanitized("Jane's MacBook").as_str(),
            "Jane-s-MacBook-de0d0e05"
        );
        assert_eq!(Lane::sanitized("   ").as_str(), "local");

        let long = Lane::sanitized(&"h".repeat(100));
        assert_eq!(long.as_str().len(), MAX_LANE_LEN);
        assert!(long.as_str().ends_with("-17c0dab4"));
        assert!(Lane::new(long.as_str()).is_ok());
    }

    #[test]
    fn test_sanitized_names_stay_distinct() {
        let mangled = Lane::sanitized("Jane's");
        let plain = Lane::sanitized("Jane-s");

        assert_eq!(plain.as_str(), "Jane-s");
        assert_eq!(mangled.as_str(), "Jane-s-576112c7");
        assert_ne!(mangled, plain);
    }

    #[test]
    fn test_stack_lane() {
        let config = LaneConfig::stack("staging");
        assert_eq!(config.current_lane().as_str(), "staging");
        // Pure function of configuration
        assert_eq!(config.current_lane(), config.current_lane());
    }

    #[test]
    fn test_dev_lane_uses_host() {
        let config = LaneConfig::dev("dev").with_host("alice-laptop");
        assert_eq!(config.current_lane().as_str(), "alice-laptop");
        assert_eq!(config.namespace().key(), "dev:{mq}:alice-laptop");
    }

    #[test]
    fn test_dev_lane_without_override_is_stable() {
        let config = LaneConfig::dev("dev");
        assert_eq!(config.current_lane(), config.current_lane());
        assert!(!config.current_lane().as_str().is_empty());
    }

    #[test]
    fn test_namespaces_do_not_overlap() {
        let a = Namespace::for_stack("dev", Lane::new("alice").unwrap());
        let b = Namespace::for_stack("dev", Lane::new("bob").unwrap());

        assert_ne!(a.key(), b.key());
        assert!(!a.key_for("pending").starts_with(&b.key()));
        assert_eq!(a.to_string(), a.key());
    }
}
