//! Blueprint registry - resolves blueprint refs to implementations.
//!
//! Blueprints are registered by string reference (`name@version`) and looked
//! up when a run executes. The registry is built once at startup, before any
//! worker loop starts, and shared as `Arc<BlueprintRegistry>`.
//!
//! A blueprint is `(ctx, inputs) -> outputs`, inputs and outputs both opaque
//! JSON documents.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = BlueprintRegistry::new();
//! registry.register("core.test.echo@v1", |ctx, inputs| async move {
//!     ctx.step("Echoing inputs", StepKind::AgentTask, |_| async { Ok(()) }).await?;
//!     Ok(json!({ "echo": inputs }))
//! });
//! let registry = Arc::new(registry);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::info;

use crate::context::RunContext;

/// Type-erased blueprint implementation.
pub type BlueprintFn = Arc<
    dyn Fn(Arc<RunContext>, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct BlueprintRegistry {
    blueprints: HashMap<String, BlueprintFn>,
}

impl BlueprintRegistry {
    pub fn new() -> Self {
        Self {
            blueprints: HashMap::new(),
        }
    }

    /// Register a blueprint implementation under a reference.
    pub fn register<F, Fut>(&mut self, blueprint_ref: &str, implementation: F)
    where
        F: Fn(Arc<RunContext>, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let boxed: BlueprintFn = Arc::new(move |ctx, inputs| Box::pin(implementation(ctx, inputs)));
        self.blueprints.insert(blueprint_ref.to_string(), boxed);
        info!(blueprint_ref, "registered blueprint");
    }

    pub fn get(&self, blueprint_ref: &str) -> Option<BlueprintFn> {
        self.blueprints.get(blueprint_ref).cloned()
    }

    pub fn is_registered(&self, blueprint_ref: &str) -> bool {
        self.blueprints.contains_key(blueprint_ref)
    }

    /// All registered blueprint refs, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut refs: Vec<String> = self.blueprints.keys().cloned().collect();
        refs.sort();
        refs
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedBlueprintRegistry = Arc<BlueprintRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_check() {
        let mut registry = BlueprintRegistry::new();
        registry.register("core.test.noop@v1", |_ctx, _inputs| async move {
            Ok(serde_json::json!({}))
        });

        assert!(registry.is_registered("core.test.noop@v1"));
        assert!(!registry.is_registered("core.test.unknown@v1"));
    }

    #[test]
    fn list_is_sorted() {
        let mut registry = BlueprintRegistry::new();
        registry.register("b@v1", |_ctx, _inputs| async move { Ok(serde_json::json!({})) });
        registry.register("a@v1", |_ctx, _inputs| async move { Ok(serde_json::json!({})) });

        assert_eq!(registry.list(), vec!["a@v1".to_string(), "b@v1".to_string()]);
    }

    #[test]
    fn get_unknown_returns_none() {
        let registry = BlueprintRegistry::new();
        assert!(registry.get("missing@v1").is_none());
    }
}
