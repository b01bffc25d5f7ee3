pub mod cancel;
pub mod conflict;
pub mod coordinator;
pub mod history;
pub mod queue;
pub mod scheduler;

pub use cancel::{CancelToken, CancellationRegistry, RunControl, SuspendGate};
pub use conflict::{
    ActiveCall, ConflictAnalysis, ConflictVerdict, analyze, conflicts, operations_compatible,
};
pub use coordinator::{Coordinator, ResourceAdmissionPolicy};
pub use history::Archiver;
pub use queue::TaskQueue;
pub use scheduler::{ScheduleUpdate, Scheduler};

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::models::{CallDependency, CallRequest, ConflictReason};

/// Admission verdict for one candidate against the live call set.
#[derive(Clone, Debug, PartialEq)]
pub enum AdmitDecision {
    Accept,
    Postpone {
        /// Dependencies the queue attaches so the candidate waits out its
        /// blockers.
        dependencies: Vec<CallDependency>,
        reasons: Vec<ConflictReason>,
    },
    Reject {
        reasons: Vec<ConflictReason>,
    },
}

/// Decides whether a candidate may run alongside the calls currently held
/// by the queue. Invoked under the queue lock so the decision and the
/// insertion are atomic.
pub trait AdmissionPolicy: Send + Sync {
    fn decide(&self, candidate: &CallRequest, live: &[ActiveCall]) -> AdmitDecision;
}

/// Admits every candidate unconditionally.
pub struct AdmitAll;

impl AdmissionPolicy for AdmitAll {
    fn decide(&self, _candidate: &CallRequest, _live: &[ActiveCall]) -> AdmitDecision {
        AdmitDecision::Accept
    }
}

/// Source of "now" for schedule arithmetic. Swapped for a manual clock in
/// scheduler tests.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Cooperative stop flag shared by the background loops.
#[derive(Default)]
pub struct ShutdownSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called, immediately if it already
    /// was.
    pub async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
