//! In-memory [`TrafficControl`] used by tests and dry runs.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::{ClassId, ClassTarget, Error, Result, TrafficControl};

/// A rate change recorded by [`MemoryTc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWrite {
    pub target: ClassTarget,
    pub kbps: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    rates: HashMap<ClassTarget, u64>,
    used: HashMap<ClassTarget, u64>,
    writes: Vec<RateWrite>,
    fail_all_writes: bool,
    failing_writes: HashSet<ClassId>,
    failing_reads: HashSet<ClassId>,
}

/// Keeps class rates and simulated usage in memory.
///
/// Only writes that change a rate are recorded, so an unchanged re-apply leaves the log as it
/// was. Failures can be injected for all writes, for writes to a given class, or for reads.
#[derive(Debug, Default)]
pub struct MemoryTc {
    state: Mutex<MemoryState>,
}

impl MemoryTc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the rate of a class without recording a write, as if it had been provisioned.
    pub fn provision(&self, target: &ClassTarget, kbps: u64) {
        self.state.lock().rates.insert(target.clone(), kbps);
    }

    /// Sets the throughput the next usage reads of `target` report.
    pub fn set_used(&self, target: &ClassTarget, kbps: u64) {
        self.state.lock().used.insert(target.clone(), kbps);
    }

    pub fn rate(&self, target: &ClassTarget) -> Option<u64> {
        self.state.lock().rates.get(target).copied()
    }

    pub fn writes(&self) -> Vec<RateWrite> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Makes every write fail while `fail` is set.
    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_all_writes = fail;
    }

    /// Makes writes to `classid` (on any interface) fail while `fail` is set.
    pub fn fail_writes_to(&self, classid: ClassId, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_writes.insert(classid);
        } else {
            state.failing_writes.remove(&classid);
        }
    }

    /// Makes reads of `classid` fail while `fail` is set.
    pub fn fail_reads_of(&self, classid: ClassId, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_reads.insert(classid);
        } else {
            state.failing_reads.remove(&classid);
        }
    }
}

impl TrafficControl for MemoryTc {
    fn apply_rate(&self, target: &ClassTarget, kbps: u64) -> Result<()> {
        let mut state = self.state.lock();

        if state.fail_all_writes || state.failing_writes.contains(&target.classid) {
            return Err(Error::Rejected(target.clone()));
        }

        if state.rates.insert(target.clone(), kbps) != Some(kbps) {
            state.writes.push(RateWrite { target: target.clone(), kbps });
        }

        Ok(())
    }

    fn read_used_kbps(&self, target: &ClassTarget) -> Result<u64> {
        let state = self.state.lock();
        if state.failing_reads.contains(&target.classid) {
            return Err(Error::UnknownClass(target.clone()));
        }
        Ok(state.used.get(target).copied().unwrap_or_default())
    }

    fn read_current_kbps(&self, target: &ClassTarget) -> Result<u64> {
        let state = self.state.lock();
        if state.failing_reads.contains(&target.classid) {
            return Err(Error::UnknownClass(target.clone()));
        }
        state.rates.get(target).copied().ok_or_else(|| Error::UnknownClass(target.clone()))
    }
}
