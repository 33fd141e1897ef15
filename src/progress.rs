//! The progress & event bus: a hierarchical allocation tree where each
//! leaf's completion contributes its share of the root's total, plus a
//! throttled byte-progress callback for transfer steps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Node {
    description: String,
    total_units: u64,
    completed_units: AtomicU64,
    children: Mutex<Vec<Arc<Node>>>,
}

/// One node in the allocation tree. Cheap to clone (an `Arc` handle);
/// every step that wants to report progress holds one.
#[derive(Clone)]
pub struct Allocation {
    node: Arc<Node>,
}

impl Allocation {
    /// A new root allocation with `total_units` of work.
    pub fn root(description: impl Into<String>, total_units: u64) -> Self {
        Self {
            node: Arc::new(Node {
                description: description.into(),
                total_units,
                completed_units: AtomicU64::new(0),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Allocates a child under this node, worth `units` out of this
    /// node's `total_units`.
    pub fn child(&self, description: impl Into<String>, units: u64) -> Self {
        let child = Self {
            node: Arc::new(Node {
                description: description.into(),
                total_units: units,
                completed_units: AtomicU64::new(0),
                children: Mutex::new(Vec::new()),
            }),
        };
        self.node.children.lock().unwrap().push(child.node.clone());
        child
    }

    /// Advances this leaf's completed-unit counter. Safe to call from
    /// multiple tasks reporting the same allocation's byte progress.
    pub fn advance(&self, units: u64) {
        self.node.completed_units.fetch_add(units, Ordering::Relaxed);
    }

    /// Marks this node (and, transitively, every descendant) fully done.
    pub fn complete(&self) {
        self.node
            .completed_units
            .store(self.node.total_units.max(1), Ordering::Relaxed);
    }

    pub fn description(&self) -> &str {
        &self.node.description
    }

    /// This node's own completion fraction — a leaf's `completed/total`;
    /// a non-leaf's unweighted average of its children's fractions (a
    /// non-leaf with no completed-unit writes of its own relies entirely
    /// on its children).
    fn fraction(&self) -> f64 {
        let children = self.node.children.lock().unwrap();
        if children.is_empty() {
            if self.node.total_units == 0 {
                return 1.0;
            }
            let completed = self.node.completed_units.load(Ordering::Relaxed) as f64;
            (completed / self.node.total_units as f64).min(1.0)
        } else {
            let sum: f64 = children.iter().map(|c| Allocation { node: c.clone() }.fraction()).sum();
            sum / children.len() as f64
        }
    }

    fn unfinished_leaves(&self, out: &mut Vec<String>) {
        let children = self.node.children.lock().unwrap();
        if children.is_empty() {
            let completed = self.node.completed_units.load(Ordering::Relaxed);
            if completed < self.node.total_units {
                out.push(self.node.description.clone());
            }
        } else {
            for child in children.iter() {
                Allocation { node: child.clone() }.unfinished_leaves(out);
            }
        }
    }
}

/// Reads an [`Allocation`] tree's overall progress: a fraction in `[0,1]`
/// and the descriptions of leaves that haven't completed yet.
pub struct ProgressHandler {
    root: Allocation,
}

impl ProgressHandler {
    pub fn new(root: Allocation) -> Self {
        Self { root }
    }

    pub fn progress(&self) -> f64 {
        self.root.fraction()
    }

    pub fn unfinished_leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.root.unfinished_leaves(&mut out);
        out
    }
}

/// Rate-limits a byte-progress callback so fast local I/O doesn't storm
/// the handler.
pub struct ThrottledReporter<F: Fn(u64)> {
    callback: F,
    min_interval: Duration,
    last_reported: Mutex<Instant>,
}

impl<F: Fn(u64)> ThrottledReporter<F> {
    pub fn new(callback: F) -> Self {
        Self::with_interval(callback, Duration::from_millis(100))
    }

    pub fn with_interval(callback: F, min_interval: Duration) -> Self {
        Self {
            callback,
            min_interval,
            last_reported: Mutex::new(Instant::now() - min_interval),
        }
    }

    /// Reports `units`, invoking the callback only if enough time has
    /// passed since the last invocation. `force` bypasses throttling
    /// (used for the final 100% report so a transfer never appears stuck).
    pub fn report(&self, units: u64, force: bool) {
        let mut last = self.last_reported.lock().unwrap();
        if force || last.elapsed() >= self.min_interval {
            (self.callback)(units);
            *last = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn leaf_fraction_tracks_completed_units() {
        let root = Allocation::root("pipeline", 10);
        root.advance(5);
        let handler = ProgressHandler::new(root);
        assert_eq!(handler.progress(), 0.5);
    }

    #[test]
    fn non_leaf_progress_averages_children() {
        let root = Allocation::root("pipeline", 1);
        let a = root.child("a", 1);
        let b = root.child("b", 1);
        a.complete();
        let handler = ProgressHandler::new(root);
        assert_eq!(handler.progress(), 0.5);
        assert_eq!(handler.unfinished_leaves(), vec!["b".to_string()]);
    }

    #[test]
    fn throttled_reporter_drops_calls_within_the_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let reporter = ThrottledReporter::with_interval(move |_| { c.fetch_add(1, Ordering::SeqCst); }, Duration::from_secs(60));
        reporter.report(1, false);
        reporter.report(2, false);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        reporter.report(3, true);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
