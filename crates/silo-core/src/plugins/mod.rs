//! Per-content-type plugin seam. The engine never calls a concrete
//! importer or distributor; it resolves a `ContentPlugin` through the
//! catalog and dispatches through the installed registry targets, so a
//! new content type is a trait impl plus one `register` call.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatch::cancel::RunControl;
use crate::models::{
    CallId, CallRequest, CallTarget, ResourceOperation, ResourceType, SiloError, SiloResult,
};
use crate::registry::{TargetInvocation, TargetRegistry};

pub type PluginFuture = Pin<Box<dyn Future<Output = SiloResult<serde_json::Value>> + Send>>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PluginDescriptor {
    pub type_id: &'static str,
    pub display_name: &'static str,
}

/// Capabilities one content type contributes. `sync` pulls upstream
/// content into a repository, `publish` pushes repository content out,
/// and both observe the run control for cancellation and progress.
pub trait ContentPlugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    fn validate_config(&self, config: &serde_json::Value) -> SiloResult<()>;

    fn sync(
        &self,
        repository_id: &str,
        config: serde_json::Value,
        control: RunControl,
    ) -> PluginFuture;

    fn publish(
        &self,
        repository_id: &str,
        config: serde_json::Value,
        control: RunControl,
    ) -> PluginFuture;
}

/// Argument payload carried by plugin call requests. Persisted requests
/// round-trip through JSON, so this is the full dispatch contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginCallArgs {
    pub repository_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

pub fn sync_target_key(type_id: &str) -> String {
    format!("content.{type_id}.sync")
}

pub fn publish_target_key(type_id: &str) -> String {
    format!("content.{type_id}.publish")
}

#[derive(Default)]
pub struct PluginCatalog {
    plugins: HashMap<String, Arc<dyn ContentPlugin>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin under its descriptor's type id, replacing any
    /// previous registration for that type.
    pub fn register(&mut self, plugin: Arc<dyn ContentPlugin>) {
        self.plugins
            .insert(plugin.descriptor().type_id.to_string(), plugin);
    }

    pub fn plugin(&self, type_id: &str) -> Option<Arc<dyn ContentPlugin>> {
        self.plugins.get(type_id).cloned()
    }

    pub fn type_ids(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Installs `content.<type>.sync` and `content.<type>.publish`
    /// targets for every registered plugin. The installed callable
    /// validates the config before running, so revived persisted calls
    /// get the same checks as fresh ones.
    pub fn install_targets(&self, targets: &mut TargetRegistry) {
        for (type_id, plugin) in &self.plugins {
            let sync_plugin = Arc::clone(plugin);
            targets.register(sync_target_key(type_id), move |invocation: TargetInvocation| {
                let plugin = Arc::clone(&sync_plugin);
                async move {
                    let args = plugin_args(invocation.args)?;
                    plugin.validate_config(&args.config)?;
                    plugin
                        .sync(&args.repository_id, args.config, invocation.control)
                        .await
                }
            });

            let publish_plugin = Arc::clone(plugin);
            targets.register(
                publish_target_key(type_id),
                move |invocation: TargetInvocation| {
                    let plugin = Arc::clone(&publish_plugin);
                    async move {
                        let args = plugin_args(invocation.args)?;
                        plugin.validate_config(&args.config)?;
                        plugin
                            .publish(&args.repository_id, args.config, invocation.control)
                            .await
                    }
                },
            );
        }
    }
}

fn plugin_args(args: serde_json::Value) -> SiloResult<PluginCallArgs> {
    serde_json::from_value(args)
        .map_err(|err| SiloError::invalid_input(format!("invalid plugin call arguments: {err}")))
}

/// Builds a sync call request with the standard declarations: the
/// repository is updated, the importer side of the plugin is read, and
/// the request carries the conventional resource/action tags.
pub fn sync_request(
    id: CallId,
    type_id: &str,
    repository_id: &str,
    config: serde_json::Value,
) -> CallRequest {
    let args = serde_json::json!({
        "repository_id": repository_id,
        "config": config,
    });
    CallRequest::new(id, CallTarget::new(sync_target_key(type_id)).with_args(args))
        .declaring(ResourceType::Repository, repository_id, ResourceOperation::Update)
        .declaring(ResourceType::Importer, type_id, ResourceOperation::Read)
        .with_tag(format!("resource:repository:{repository_id}"))
        .with_tag("action:sync")
        .with_archive(true)
}

/// Builds a publish call request. Publishing reads the distributor side
/// of the plugin and updates the repository, so a publish serializes
/// against a sync of the same repository but not against publishes of
/// other repositories.
pub fn publish_request(
    id: CallId,
    type_id: &str,
    repository_id: &str,
    config: serde_json::Value,
) -> CallRequest {
    let args = serde_json::json!({
        "repository_id": repository_id,
        "config": config,
    });
    CallRequest::new(id, CallTarget::new(publish_target_key(type_id)).with_args(args))
        .declaring(ResourceType::Repository, repository_id, ResourceOperation::Update)
        .declaring(ResourceType::Distributor, type_id, ResourceOperation::Read)
        .with_tag(format!("resource:repository:{repository_id}"))
        .with_tag("action:publish")
        .with_archive(true)
}
