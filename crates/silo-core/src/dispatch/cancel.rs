//! Cooperative cancellation: a context-carried token handed to every
//! callable, plus the process-wide registry that maps live call ids to
//! their tokens so any task can request cancellation by id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};

use crate::models::call::CallId;
use crate::models::error::{SiloError, SiloResult};

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    parent: Option<Arc<CancelInner>>,
}

/// Cancellation flag for one call invocation. Raising the flag is
/// idempotent; polling is lock-free. A child token observes its parent's
/// flag as well as its own, so cancellation propagates to nested calls
/// only when the caller links them explicitly.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token for a nested call that is canceled whenever this one is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                flag: AtomicBool::new(false),
                parent: Some(self.inner.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        let mut current = Some(&self.inner);
        while let Some(inner) = current {
            if inner.flag.load(Ordering::SeqCst) {
                return true;
            }
            current = inner.parent.as_ref();
        }
        false
    }
}

/// Process-wide call id -> cancellation token map. Entries are registered
/// at enqueue and dropped when the call reaches a terminal state; the lock
/// is held only for map access, never while a callable runs.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashMap<CallId, CancelToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, call_id: CallId, token: CancelToken) {
        self.entries.lock().await.insert(call_id, token);
    }

    pub async fn remove(&self, call_id: CallId) {
        self.entries.lock().await.remove(&call_id);
    }

    /// Raises the flag for a registered call. Returns false when the call
    /// is unknown, which callers treat as a no-op rather than an error.
    pub async fn cancel(&self, call_id: CallId) -> bool {
        match self.entries.lock().await.get(&call_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn token_for(&self, call_id: CallId) -> Option<CancelToken> {
        self.entries.lock().await.get(&call_id).cloned()
    }

    pub async fn is_canceled(&self, call_id: CallId) -> bool {
        match self.entries.lock().await.get(&call_id) {
            Some(token) => token.is_canceled(),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Cooperative pause gate for a running call. The queue engages it on
/// suspend; the callable parks in `RunControl::checkpoint` until the gate
/// is released or the call is canceled.
#[derive(Debug, Default)]
pub struct SuspendGate {
    engaged: AtomicBool,
    notify: Notify,
}

impl SuspendGate {
    pub fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.engaged.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wakes a parked checkpoint without releasing the gate, so a canceled
    /// call can observe its flag while suspended.
    pub fn interrupt(&self) {
        self.notify.notify_waiters();
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

/// Per-invocation control handle passed to the callable: cancellation
/// polling, the suspension gate, and the progress slot surfaced on the
/// call report.
#[derive(Clone, Debug)]
pub struct RunControl {
    call_id: CallId,
    token: CancelToken,
    gate: Arc<SuspendGate>,
    progress: Arc<std::sync::Mutex<serde_json::Value>>,
}

impl RunControl {
    pub fn new(call_id: CallId, token: CancelToken) -> Self {
        Self {
            call_id,
            token,
            gate: Arc::new(SuspendGate::default()),
            progress: Arc::new(std::sync::Mutex::new(serde_json::Value::Null)),
        }
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    pub(crate) fn gate(&self) -> &SuspendGate {
        &self.gate
    }

    pub fn is_suspended(&self) -> bool {
        self.gate.is_engaged()
    }

    /// Cancellation and suspension point for loop bodies and long copy or
    /// fetch operations. Returns an error once the call is canceled; parks
    /// while the call is suspended.
    pub async fn checkpoint(&self) -> SiloResult<()> {
        loop {
            if self.token.is_canceled() {
                return Err(SiloError::Canceled { id: self.call_id });
            }
            if !self.gate.is_engaged() {
                return Ok(());
            }
            let parked = self.gate.notify.notified();
            tokio::pin!(parked);
            parked.as_mut().enable();
            // re-check after registering interest so a release racing the
            // flag check is not missed
            if self.token.is_canceled() {
                return Err(SiloError::Canceled { id: self.call_id });
            }
            if !self.gate.is_engaged() {
                return Ok(());
            }
            parked.await;
        }
    }

    pub fn report_progress(&self, value: serde_json::Value) {
        let mut slot = self
            .progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = value;
    }

    pub fn progress(&self) -> serde_json::Value {
        self.progress
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent_and_visible() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        token.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn child_observes_parent_but_not_the_reverse() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = CancelToken::new();

        child.cancel();
        assert!(child.is_canceled());
        assert!(!parent.is_canceled());

        parent.cancel();
        assert!(parent.child().is_canceled());
        assert!(!sibling.is_canceled());
    }

    #[tokio::test]
    async fn registry_cancel_of_unknown_call_is_a_no_op() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel(CallId(99)).await);

        let token = CancelToken::new();
        registry.register(CallId(1), token.clone()).await;
        assert!(registry.cancel(CallId(1)).await);
        assert!(token.is_canceled());

        registry.remove(CallId(1)).await;
        assert!(!registry.cancel(CallId(1)).await);
    }

    #[tokio::test]
    async fn checkpoint_errors_after_cancellation() {
        let control = RunControl::new(CallId(7), CancelToken::new());
        control.checkpoint().await.expect("not canceled yet");
        control.cancel_token().cancel();
        let err = control.checkpoint().await.expect_err("canceled");
        assert_eq!(err, SiloError::Canceled { id: CallId(7) });
    }

    #[tokio::test]
    async fn checkpoint_parks_while_suspended() {
        let control = RunControl::new(CallId(8), CancelToken::new());
        control.gate().engage();

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.gate().release();
        waiter
            .await
            .expect("join")
            .expect("checkpoint resumes after release");
    }
}
