//! Live quota accounting
//!
//! The remaining byte budget is a single atomic counter updated with a
//! compare-and-exchange loop, so concurrent writers never serialize on a
//! lock and no update is lost.

use super::space::total_size;
use crate::error::Result;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Quota state for one subtree
pub struct SpaceAccountant {
    /// Canonical root of the subtree under quota
    root: PathBuf,
    /// Configured ceiling, `None` for unlimited
    limit: Option<u64>,
    /// Remaining bytes, computed on first use
    remaining: OnceLock<AtomicI64>,
    /// Serializes the initial scan
    init_lock: Mutex<()>,
}

impl SpaceAccountant {
    /// Create an accountant for `root`. The tree is not scanned until the
    /// first accounting call.
    pub fn new(root: impl AsRef<Path>, limit: Option<u64>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self {
            root,
            limit,
            remaining: OnceLock::new(),
            init_lock: Mutex::new(()),
        })
    }

    /// Accountant that never refuses and never scans
    pub fn unlimited(root: impl AsRef<Path>) -> Result<Self> {
        Self::new(root, None)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    fn limit_i64(&self) -> Option<i64> {
        self.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX))
    }

    /// True if `path` is charged against this quota
    pub fn covers(&self, path: &Path) -> bool {
        self.limit.is_some() && path.starts_with(&self.root)
    }

    fn counter(&self, limit: i64) -> Result<&AtomicI64> {
        if let Some(counter) = self.remaining.get() {
            return Ok(counter);
        }

        let _guard = self.init_lock.lock();
        if let Some(counter) = self.remaining.get() {
            return Ok(counter);
        }

        let used = total_size(&self.root)?;
        let used = i64::try_from(used).unwrap_or(i64::MAX);
        info!(
            "Quota initialized for {:?}: used={} limit={}",
            self.root, used, limit
        );
        Ok(self
            .remaining
            .get_or_init(|| AtomicI64::new(limit.saturating_sub(used))))
    }

    /// Bytes left before the quota is exhausted
    pub fn remaining(&self) -> Result<i64> {
        match self.limit_i64() {
            Some(limit) => Ok(self.counter(limit)?.load(Ordering::Acquire)),
            None => Ok(i64::MAX),
        }
    }

    /// Bytes currently in use under the root
    pub fn used(&self) -> Result<u64> {
        match self.limit_i64() {
            Some(limit) => Ok(limit.saturating_sub(self.remaining()?).max(0) as u64),
            None => total_size(&self.root),
        }
    }

    /// Apply a usage change: positive `delta` consumes budget, negative frees
    /// it. Usage never drops below zero, so `remaining` never exceeds the limit.
    pub fn charge(&self, delta: i64) -> Result<i64> {
        let Some(limit) = self.limit_i64() else {
            return Ok(i64::MAX);
        };
        let counter = self.counter(limit)?;

        let mut current = counter.load(Ordering::Acquire);
        loop {
            let candidate = current.saturating_sub(delta).min(limit);
            match counter.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("charge(delta={}) remaining={}", delta, candidate);
                    return Ok(candidate);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// True when the limit is finite and the budget is used up.
    ///
    /// Checked before a write is admitted; an admitted write may overshoot
    /// by at most its own size and the next one is refused.
    pub fn would_exceed(&self) -> Result<bool> {
        match self.limit_i64() {
            Some(limit) => Ok(self.counter(limit)?.load(Ordering::Acquire) <= 0),
            None => Ok(false),
        }
    }
}
