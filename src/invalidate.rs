//! The invalidation ledger.
//!
//! Completed tasks record which filesystem paths (or globs) their result is
//! sensitive to, and which child tasks they consumed. When the external
//! change signal reports a batch of modified paths, eviction is a match
//! over the sensitivity specs followed by a reachability walk up the
//! recorded dependency edges, never a full table rescan.

use std::collections::{HashMap, HashSet};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;

use crate::scheduler::TaskKey;

/// One sensitivity declaration attached to a completed task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum WatchSpec {
    Path(Utf8PathBuf),
    /// Pattern source text; validated when recorded, compiled when matched.
    Glob(String),
}

impl WatchSpec {
    fn matches(&self, changed: &Utf8Path) -> bool {
        match self {
            // A recorded directory is sensitive to anything inside it.
            WatchSpec::Path(path) => changed == path || changed.starts_with(path),
            WatchSpec::Glob(pattern) => Pattern::new(pattern)
                .map(|matcher| matcher.matches_path(changed.as_std_path()))
                .unwrap_or(false),
        }
    }
}

#[derive(Default)]
pub(crate) struct Ledger {
    /// Sensitivity spec → tasks whose results depend on it.
    watching: HashMap<WatchSpec, HashSet<TaskKey>>,
    /// Child task → tasks that consumed its result.
    dependents: HashMap<TaskKey, HashSet<TaskKey>>,
}

impl Ledger {
    /// Records a completed task's sensitivity set and its consumed children.
    pub fn record(&mut self, key: &TaskKey, sensitive: Vec<WatchSpec>, children: HashSet<TaskKey>) {
        for spec in sensitive {
            self.watching.entry(spec).or_default().insert(key.clone());
        }
        for child in children {
            self.dependents.entry(child).or_default().insert(key.clone());
        }
    }

    /// Evicts every task sensitive to one of `changed`, plus everything
    /// transitively depending on an evicted task. Returns the evicted keys
    /// so the scheduler can drop the matching slots.
    pub fn evict(&mut self, changed: &[Utf8PathBuf]) -> HashSet<TaskKey> {
        let mut stack: Vec<TaskKey> = self
            .watching
            .iter()
            .filter(|(spec, _)| changed.iter().any(|path| spec.matches(path)))
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect();

        let mut evicted = HashSet::new();
        while let Some(key) = stack.pop() {
            if !evicted.insert(key.clone()) {
                continue;
            }
            if let Some(parents) = self.dependents.get(&key) {
                stack.extend(parents.iter().cloned());
            }
        }

        if !evicted.is_empty() {
            tracing::info!(count = evicted.len(), "evicting invalidated tasks");
            for keys in self.watching.values_mut() {
                keys.retain(|key| !evicted.contains(key));
            }
            self.watching.retain(|_, keys| !keys.is_empty());
            self.dependents.retain(|child, _| !evicted.contains(child));
            for parents in self.dependents.values_mut() {
                parents.retain(|key| !evicted.contains(key));
            }
            self.dependents.retain(|_, parents| !parents.is_empty());
        }

        evicted
    }
}
