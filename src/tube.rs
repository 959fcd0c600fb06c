//! Tube bookkeeping: the used tube, the watch set, and what the server has
//! been told about them.
//!
//! The registry holds two views. The *desired* view is what callers asked for
//! through `use`/`watch`/`ignore`; the *server* view is what the connection has
//! acknowledged. The client reconciles them lazily, right before the commands
//! that depend on them, by diffing the full sets.
//!
//! Not safe for concurrent use: a registry belongs to exactly one connection.

use crate::error::{Error, Result};
use crate::proto::validate_tube_name;

/// Tube every connection starts out using and watching.
pub const DEFAULT_TUBE: &str = "default";

/// Commands needed to bring the server's watch list in line with the watch set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchPlan {
    /// Tubes to `watch`, in watch-set order.
    pub watch: Vec<String>,
    /// Tubes to `ignore`, issued after every `watch`.
    pub ignore: Vec<String>,
}

impl WatchPlan {
    /// True when no round-trips are needed.
    pub fn is_empty(&self) -> bool {
        self.watch.is_empty() && self.ignore.is_empty()
    }
}

/// Used tube and watch set for one connection.
#[derive(Debug, Clone)]
pub struct TubeRegistry {
    used: String,
    watched: Vec<String>,
    server_used: String,
    server_watched: Vec<String>,
}

impl Default for TubeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TubeRegistry {
    /// A registry in the state of a freshly opened connection.
    pub fn new() -> Self {
        Self {
            used: DEFAULT_TUBE.to_string(),
            watched: vec![DEFAULT_TUBE.to_string()],
            server_used: DEFAULT_TUBE.to_string(),
            server_watched: vec![DEFAULT_TUBE.to_string()],
        }
    }

    /// Tube that `put` targets.
    pub fn used(&self) -> &str {
        &self.used
    }

    /// Watch set in insertion order. Never empty.
    pub fn watched(&self) -> &[String] {
        &self.watched
    }

    /// Whether `name` is in the watch set.
    pub fn is_watching(&self, name: &str) -> bool {
        self.watched.iter().any(|t| t == name)
    }

    /// Replace the used tube.
    ///
    /// A name the server would reject leaves the used tube unchanged.
    pub fn use_tube(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        validate_tube_name(&name).map_err(|e| Error::op("use", e))?;
        self.used = name;
        Ok(())
    }

    /// Add `name` to the watch set.
    ///
    /// Returns `false` if it was already watched, in which case nothing changes.
    /// A name the server would reject is never added.
    pub fn watch(&mut self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        validate_tube_name(&name).map_err(|e| Error::op("watch", e))?;
        if self.is_watching(&name) {
            return Ok(false);
        }
        self.watched.push(name);
        Ok(true)
    }

    /// Remove `name` from the watch set.
    ///
    /// Fails with `InvalidState` when only one tube is watched, and with
    /// `NotWatched` when `name` is not a member. The set is unchanged on error.
    pub fn ignore(&mut self, name: &str) -> Result<()> {
        if self.watched.len() <= 1 {
            return Err(Error::InvalidState(
                "cannot ignore the only watched tube".to_string(),
            ));
        }
        let idx = self
            .watched
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| Error::NotWatched(name.to_string()))?;
        self.watched.remove(idx);
        Ok(())
    }

    /// The tube to `use` on the server, if it differs from the used tube.
    pub(crate) fn pending_use(&self) -> Option<&str> {
        (self.server_used != self.used).then_some(self.used.as_str())
    }

    /// Record that the server acknowledged `use name`.
    pub(crate) fn mark_used(&mut self, name: &str) {
        self.server_used = name.to_string();
    }

    /// Diff the full watch set against the server's watch list.
    pub(crate) fn watch_plan(&self) -> WatchPlan {
        let watch = self
            .watched
            .iter()
            .filter(|t| !self.server_watched.contains(t))
            .cloned()
            .collect();
        let ignore = self
            .server_watched
            .iter()
            .filter(|t| !self.watched.contains(t))
            .cloned()
            .collect();
        WatchPlan { watch, ignore }
    }

    /// Record that the server acknowledged `watch name`.
    pub(crate) fn mark_watched(&mut self, name: &str) {
        if !self.server_watched.iter().any(|t| t == name) {
            self.server_watched.push(name.to_string());
        }
    }

    /// Record that the server acknowledged `ignore name`.
    pub(crate) fn mark_ignored(&mut self, name: &str) {
        self.server_watched.retain(|t| t != name);
    }

    /// True when the server view matches the desired view.
    pub fn is_synced(&self) -> bool {
        self.pending_use().is_none() && self.watch_plan().is_empty()
    }
}
