//! Stable-key registries for persisted call targets and lifecycle hooks.
//! A serialized CallRequest stores only the string key; the callable is
//! resolved here at submission and again at revival after a restart.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::dispatch::cancel::RunControl;
use crate::models::call::{CallReport, CallRequest, LifecycleEvent, LifecycleHooks};
use crate::models::error::{SiloError, SiloResult};

pub type TargetFuture = Pin<Box<dyn Future<Output = SiloResult<serde_json::Value>> + Send>>;

pub type TargetFn = dyn Fn(TargetInvocation) -> TargetFuture + Send + Sync;

pub type HookFn = dyn Fn(&CallRequest, &CallReport) + Send + Sync;

/// What a target receives when its call is dispatched: the request's JSON
/// arguments and the control handle for cancellation, suspension, and
/// progress reporting.
pub struct TargetInvocation {
    pub args: serde_json::Value,
    pub control: RunControl,
}

#[derive(Default)]
pub struct TargetRegistry {
    targets: HashMap<String, Arc<TargetFn>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, key: impl Into<String>, target: F)
    where
        F: Fn(TargetInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SiloResult<serde_json::Value>> + Send + 'static,
    {
        self.targets
            .insert(key.into(), Arc::new(move |invocation| Box::pin(target(invocation))));
    }

    pub fn register_boxed(&mut self, key: impl Into<String>, target: Arc<TargetFn>) {
        self.targets.insert(key.into(), target);
    }

    pub fn resolve(&self, key: &str) -> SiloResult<Arc<TargetFn>> {
        self.targets
            .get(key)
            .cloned()
            .ok_or_else(|| SiloError::UnknownTarget { key: key.to_string() })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.targets.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }
}

/// Hook callables resolved from a request's registry keys, grouped by the
/// lifecycle event that fires them.
#[derive(Clone, Default)]
pub struct ResolvedHooks {
    enqueue: Vec<Arc<HookFn>>,
    dispatch: Vec<Arc<HookFn>>,
    complete: Vec<Arc<HookFn>>,
}

impl ResolvedHooks {
    pub fn on(&self, event: LifecycleEvent) -> &[Arc<HookFn>] {
        match event {
            LifecycleEvent::Enqueue => &self.enqueue,
            LifecycleEvent::Dispatch => &self.dispatch,
            LifecycleEvent::Complete => &self.complete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.enqueue.is_empty() && self.dispatch.is_empty() && self.complete.is_empty()
    }
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<HookFn>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, key: impl Into<String>, hook: F)
    where
        F: Fn(&CallRequest, &CallReport) + Send + Sync + 'static,
    {
        self.hooks.insert(key.into(), Arc::new(hook));
    }

    pub fn resolve(&self, key: &str) -> SiloResult<Arc<HookFn>> {
        self.hooks
            .get(key)
            .cloned()
            .ok_or_else(|| SiloError::UnknownHook { key: key.to_string() })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.hooks.contains_key(key)
    }

    /// Resolves every key a request references, failing submission early
    /// when any is unknown.
    pub fn resolve_hooks(&self, hooks: &LifecycleHooks) -> SiloResult<ResolvedHooks> {
        let resolve_event = |event: LifecycleEvent| -> SiloResult<Vec<Arc<HookFn>>> {
            hooks.on(event).iter().map(|key| self.resolve(key)).collect()
        };
        Ok(ResolvedHooks {
            enqueue: resolve_event(LifecycleEvent::Enqueue)?,
            dispatch: resolve_event(LifecycleEvent::Dispatch)?,
            complete: resolve_event(LifecycleEvent::Complete)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::cancel::CancelToken;
    use crate::models::call::CallId;

    #[tokio::test]
    async fn registered_target_resolves_and_runs() {
        let mut registry = TargetRegistry::new();
        registry.register("demo.echo", |invocation: TargetInvocation| async move {
            Ok(invocation.args)
        });

        let target = registry.resolve("demo.echo").expect("resolve");
        let control = RunControl::new(CallId(1), CancelToken::new());
        let result = target(TargetInvocation {
            args: serde_json::json!({"value": 3}),
            control,
        })
        .await
        .expect("run");
        assert_eq!(result, serde_json::json!({"value": 3}));
    }

    #[test]
    fn unknown_keys_are_submission_errors() {
        let registry = TargetRegistry::new();
        match registry.resolve("missing") {
            Err(SiloError::UnknownTarget { key }) => assert_eq!(key, "missing"),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("resolved a target that was never registered"),
        }

        let hooks = HookRegistry::new();
        let mut requested = LifecycleHooks::new();
        requested.add(LifecycleEvent::Complete, "missing-hook");
        assert!(hooks.resolve_hooks(&requested).is_err());
    }
}
