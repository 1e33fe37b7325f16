//! Per-request classification and timing state.
//!
//! The classification tag is decided once by the RequestClassifier before
//! middleware dispatch; timing marks are recorded by the Dispatcher at each
//! pipeline stage and must never feed back into classification.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Dispatch path chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Classification {
    /// Served straight from the secure cache, bypassing the chain.
    UltraFast,
    /// Short, fast-safe middleware chain.
    Fast,
    #[default]
    Standard,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::UltraFast => "ultra-fast",
            Classification::Fast => "fast",
            Classification::Standard => "standard",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic request timing: a start instant plus named stage marks.
#[derive(Debug)]
pub struct Timing {
    start: Instant,
    marks: Vec<(&'static str, Duration)>,
}

impl Timing {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
            marks: Vec::new(),
        }
    }

    /// Records the elapsed time since start under a stage name.
    pub fn mark(&mut self, stage: &'static str) {
        self.marks.push((stage, self.start.elapsed()));
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time at the given stage mark, if recorded.
    pub fn stage(&self, stage: &str) -> Option<Duration> {
        self.marks
            .iter()
            .find(|(name, _)| *name == stage)
            .map(|(_, d)| *d)
    }

    pub fn marks(&self) -> &[(&'static str, Duration)] {
        &self.marks
    }
}

/// Type-erased per-request variables shared between middleware and plugins.
#[derive(Default)]
pub struct Vars {
    inner: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Vars {
    /// Store a typed value into the context.
    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.inner.insert(key.into(), Box::new(value));
    }

    /// Get a typed reference from the context.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.inner.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Get a string slice if the stored value is a `String`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get::<String>(key).map(|s| s.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.inner.remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_tags() {
        assert_eq!(Classification::UltraFast.as_str(), "ultra-fast");
        assert_eq!(Classification::default(), Classification::Standard);
    }

    #[test]
    fn test_timing_marks() {
        let mut timing = Timing::start();
        timing.mark("middleware");
        timing.mark("handler");
        assert!(timing.stage("middleware").is_some());
        assert!(timing.stage("handler").unwrap() >= timing.stage("middleware").unwrap());
        assert!(timing.stage("plugin").is_none());
    }

    #[test]
    fn test_vars_typed_access() {
        let mut vars = Vars::default();
        vars.set("count", 7usize);
        vars.set("who", "tests".to_string());
        assert_eq!(vars.get::<usize>("count"), Some(&7));
        assert_eq!(vars.get_str("who"), Some("tests"));
        assert_eq!(vars.get::<usize>("who"), None);
        assert!(vars.remove("count"));
        assert!(!vars.contains("count"));
    }
}
