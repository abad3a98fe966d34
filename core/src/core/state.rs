//! Per-request scan lifecycle and aggregate counters.
//!
//! ```text
//! Admitted → BaselineCaptured → StrategiesDispatched → (PartialResults)*
//!          → Completed | ManuallyStopped | Error
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::{ParamMarks, StrategyTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    Admitted,
    BaselineCaptured,
    StrategiesDispatched,
    PartialResults,
    Completed,
    ManuallyStopped,
    Error,
}

impl ScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanPhase::Completed | ScanPhase::ManuallyStopped | ScanPhase::Error
        )
    }

    pub fn can_advance_to(&self, next: ScanPhase) -> bool {
        use ScanPhase::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, ManuallyStopped) | (_, Error) => true,
            (Admitted, BaselineCaptured) => true,
            (BaselineCaptured, StrategiesDispatched) => true,
            (StrategiesDispatched, PartialResults) | (StrategiesDispatched, Completed) => true,
            (PartialResults, PartialResults) | (PartialResults, Completed) => true,
            _ => false,
        }
    }
}

/// One admitted request moving through the pipeline.
#[derive(Debug)]
pub struct ScanTask {
    pub id: u64,
    pub signature: String,
    pub url: String,
    pub method: String,
    phase: Mutex<ScanPhase>,
    cancelled: AtomicBool,
    marks: Mutex<BTreeMap<usize, (String, ParamMarks)>>,
    findings: AtomicUsize,
}

impl ScanTask {
    pub fn new(id: u64, signature: String, url: String, method: String) -> Self {
        Self {
            id,
            signature,
            url,
            method,
            phase: Mutex::new(ScanPhase::Admitted),
            cancelled: AtomicBool::new(false),
            marks: Mutex::new(BTreeMap::new()),
            findings: AtomicUsize::new(0),
        }
    }

    pub fn phase(&self) -> ScanPhase {
        *self.phase.lock()
    }

    /// Moves to `next` if the transition is legal.
    pub fn advance(&self, next: ScanPhase) -> bool {
        let mut phase = self.phase.lock();
        if phase.can_advance_to(next) {
            *phase = next;
            true
        } else {
            debug!("scan #{}: ignoring {:?} -> {:?}", self.id, *phase, next);
            false
        }
    }

    /// Requests a cooperative stop; checked between payload attempts.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Registers a parameter as tested so it reports a (possibly empty) marker.
    pub fn mark_tested(&self, index: usize, name: &str) {
        self.marks
            .lock()
            .entry(index)
            .or_insert_with(|| (name.to_string(), ParamMarks::default()));
    }

    pub fn record_finding(&self, index: usize, name: &str, tag: StrategyTag) {
        self.marks
            .lock()
            .entry(index)
            .or_insert_with(|| (name.to_string(), ParamMarks::default()))
            .1
            .flag(tag);
        self.findings.fetch_add(1, Ordering::AcqRel);
        self.advance(ScanPhase::PartialResults);
    }

    pub fn finding_count(&self) -> usize {
        self.findings.load(Ordering::Acquire)
    }

    /// `(parameter, marker)` for every tested parameter, in original order.
    pub fn markers(&self) -> Vec<(String, String)> {
        self.marks
            .lock()
            .values()
            .map(|(name, marks)| (name.clone(), marks.encode()))
            .collect()
    }
}

/// Counters read by statistics collaborators.
#[derive(Debug, Default)]
pub struct ScanStats {
    processed: AtomicU64,
    vulnerable: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    stopped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub vulnerable: u64,
    pub rejected: u64,
    pub errors: u64,
    pub stopped: u64,
}

impl ScanStats {
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts for a task that reached a terminal phase.
    pub fn record_finished(&self, task: &ScanTask) {
        match task.phase() {
            ScanPhase::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            ScanPhase::ManuallyStopped => {
                self.stopped.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
        if task.finding_count() > 0 {
            self.vulnerable.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            vulnerable: self.vulnerable.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            stopped: self.stopped.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.processed,
            &self.vulnerable,
            &self.rejected,
            &self.errors,
            &self.stopped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
