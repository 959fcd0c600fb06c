//! Job identifiers, reserved jobs, and put options.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Server-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<JobId> for u64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A job returned by `reserve` or one of the `peek-*` commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Server-assigned id.
    pub id: JobId,
    /// Opaque payload, byte-for-byte as it was put.
    pub body: Vec<u8>,
}

impl Job {
    /// Create a job from its parts.
    pub fn new(id: impl Into<JobId>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
        }
    }

    /// The body as UTF-8, replacing invalid sequences.
    pub fn body_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// String-keyed snapshot returned by the `stats*` commands.
pub type Stats = BTreeMap<String, String>;

/// Options for `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutOptions {
    /// Lower is more urgent.
    pub priority: u32,
    /// How long the job stays delayed before becoming ready.
    #[serde(with = "duration_serde")]
    pub delay: Duration,
    /// Time-to-run: how long a reservation may be held before auto-release.
    #[serde(with = "duration_serde")]
    pub ttr: Duration,
}

/// Conventional beanstalkd default priority.
pub const DEFAULT_PRIORITY: u32 = 1024;

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            delay: Duration::ZERO,
            ttr: Duration::from_secs(60),
        }
    }
}

impl PutOptions {
    /// Create options with the given priority and defaults for the rest.
    pub fn with_priority(priority: u32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    /// Set the delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the time-to-run.
    pub fn ttr(mut self, ttr: Duration) -> Self {
        self.ttr = ttr;
        self
    }
}

/// Serde module for Duration as whole seconds, the protocol's granularity.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
