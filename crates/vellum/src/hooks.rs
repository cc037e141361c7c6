//! Plugin hooks: timed, ordered async dispatch around engine operations.
//!
//! A plugin implements [`Plugin`] and overrides the hooks it cares about;
//! the defaults are no-ops. Hooks run in registration order under a
//! per-plugin timeout. In safe mode a failing hook is logged and the
//! operation continues; in strict mode it aborts the operation.
//! `on_error` never re-enters itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use vellum_core::errors::{VellumError, VellumResult};

/// Default per-hook timeout.
pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 5000;

/// Lifecycle events plugins can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
    BeforeQuery,
    AfterQuery,
    BeforeTransaction,
    AfterTransaction,
    TransactionError,
    DatabaseInit,
    DatabaseClose,
    CollectionCreate,
    CollectionDrop,
    Error,
}

impl Hook {
    pub fn name(self) -> &'static str {
        match self {
            Hook::BeforeInsert => "on_before_insert",
            Hook::AfterInsert => "on_after_insert",
            Hook::BeforeUpdate => "on_before_update",
            Hook::AfterUpdate => "on_after_update",
            Hook::BeforeDelete => "on_before_delete",
            Hook::AfterDelete => "on_after_delete",
            Hook::BeforeQuery => "on_before_query",
            Hook::AfterQuery => "on_after_query",
            Hook::BeforeTransaction => "on_before_transaction",
            Hook::AfterTransaction => "on_after_transaction",
            Hook::TransactionError => "on_transaction_error",
            Hook::DatabaseInit => "on_database_init",
            Hook::DatabaseClose => "on_database_close",
            Hook::CollectionCreate => "on_collection_create",
            Hook::CollectionDrop => "on_collection_drop",
            Hook::Error => "on_error",
        }
    }
}

/// What a hook gets to see.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub collection: Option<String>,
    pub document: Option<Value>,
    pub error: Option<String>,
}

impl HookContext {
    pub fn for_collection(name: &str) -> HookContext {
        HookContext {
            collection: Some(name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_document(mut self, doc: &Value) -> HookContext {
        self.document = Some(doc.clone());
        self
    }

    pub fn with_error(mut self, error: &VellumError) -> HookContext {
        self.error = Some(error.to_string());
        self
    }
}

/// A user-supplied plugin. Override the hooks you need.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Per-plugin hook timeout override.
    fn timeout_ms(&self) -> u64 {
        DEFAULT_HOOK_TIMEOUT_MS
    }

    async fn on_before_insert(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_after_insert(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_before_update(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_after_update(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_before_delete(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_after_delete(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_before_query(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_after_query(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_before_transaction(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_after_transaction(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_transaction_error(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_database_init(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_database_close(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_collection_create(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_collection_drop(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
    async fn on_error(&self, _ctx: &HookContext) -> VellumResult<()> {
        Ok(())
    }
}

/// How hook failures propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Log and continue.
    Safe,
    /// Abort the surrounding operation.
    Strict,
}

/// Ordered plugin registry and dispatcher.
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
    mode: HookMode,
    in_error_hook: AtomicBool,
}

impl PluginManager {
    pub fn new(mode: HookMode) -> PluginManager {
        PluginManager {
            plugins: RwLock::new(Vec::new()),
            mode,
            in_error_hook: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> HookMode {
        self.mode
    }

    /// Register a plugin. Re-registering a name replaces the old instance
    /// in place, keeping its position in the order.
    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        let Ok(mut plugins) = self.plugins.write() else {
            return;
        };
        if let Some(existing) = plugins.iter_mut().find(|p| p.name() == plugin.name()) {
            *existing = plugin;
        } else {
            plugins.push(plugin);
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let Ok(mut plugins) = self.plugins.write() else {
            return false;
        };
        let before = plugins.len();
        plugins.retain(|p| p.name() != name);
        plugins.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.read().map(|p| p.is_empty()).unwrap_or(true)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Run `hook` on every plugin, in order, each under its timeout.
    pub async fn dispatch(&self, hook: Hook, ctx: &HookContext) -> VellumResult<()> {
        if hook == Hook::Error {
            // Suppress on_error → on_error loops.
            if self.in_error_hook.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            let result = self.dispatch_inner(hook, ctx).await;
            self.in_error_hook.store(false, Ordering::Release);
            return result;
        }
        self.dispatch_inner(hook, ctx).await
    }

    async fn dispatch_inner(&self, hook: Hook, ctx: &HookContext) -> VellumResult<()> {
        for plugin in self.snapshot() {
            let timeout = Duration::from_millis(plugin.timeout_ms());
            let outcome = tokio::time::timeout(timeout, call_hook(&plugin, hook, ctx)).await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(cause)) => VellumError::Plugin {
                    plugin: plugin.name().to_string(),
                    hook: hook.name().to_string(),
                    cause: cause.to_string(),
                },
                Err(_elapsed) => VellumError::PluginTimeout {
                    plugin: plugin.name().to_string(),
                    hook: hook.name().to_string(),
                    timeout_ms: plugin.timeout_ms(),
                },
            };
            match self.mode {
                HookMode::Strict => return Err(error),
                HookMode::Safe => {
                    warn!(plugin = plugin.name(), hook = hook.name(), error = %error, "plugin hook failed");
                }
            }
        }
        Ok(())
    }
}

async fn call_hook(plugin: &Arc<dyn Plugin>, hook: Hook, ctx: &HookContext) -> VellumResult<()> {
    match hook {
        Hook::BeforeInsert => plugin.on_before_insert(ctx).await,
        Hook::AfterInsert => plugin.on_after_insert(ctx).await,
        Hook::BeforeUpdate => plugin.on_before_update(ctx).await,
        Hook::AfterUpdate => plugin.on_after_update(ctx).await,
        Hook::BeforeDelete => plugin.on_before_delete(ctx).await,
        Hook::AfterDelete => plugin.on_after_delete(ctx).await,
        Hook::BeforeQuery => plugin.on_before_query(ctx).await,
        Hook::AfterQuery => plugin.on_after_query(ctx).await,
        Hook::BeforeTransaction => plugin.on_before_transaction(ctx).await,
        Hook::AfterTransaction => plugin.on_after_transaction(ctx).await,
        Hook::TransactionError => plugin.on_transaction_error(ctx).await,
        Hook::DatabaseInit => plugin.on_database_init(ctx).await,
        Hook::DatabaseClose => plugin.on_database_close(ctx).await,
        Hook::CollectionCreate => plugin.on_collection_create(ctx).await,
        Hook::CollectionDrop => plugin.on_collection_drop(ctx).await,
        Hook::Error => plugin.on_error(ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        name: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn on_before_insert(&self, _ctx: &HookContext) -> VellumResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(VellumError::validation("hook failure"))
            } else {
                Ok(())
            }
        }
    }

    struct Slow;

    #[async_trait]
    impl Plugin for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn timeout_ms(&self) -> u64 {
            20
        }

        async fn on_before_insert(&self, _ctx: &HookContext) -> VellumResult<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }
    }

    fn counting(name: &str, calls: &Arc<AtomicUsize>, fail: bool) -> Arc<dyn Plugin> {
        Arc::new(Counting {
            name: name.to_string(),
            calls: Arc::clone(calls),
            fail,
        })
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let manager = PluginManager::new(HookMode::Safe);
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register(counting("a", &calls, false));
        manager.register(counting("b", &calls, false));
        manager
            .dispatch(Hook::BeforeInsert, &HookContext::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_safe_mode_continues_after_failure() {
        let manager = PluginManager::new(HookMode::Safe);
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register(counting("bad", &calls, true));
        manager.register(counting("good", &calls, false));
        manager
            .dispatch(Hook::BeforeInsert, &HookContext::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_strict_mode_aborts() {
        let manager = PluginManager::new(HookMode::Strict);
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register(counting("bad", &calls, true));
        manager.register(counting("after", &calls, false));
        let err = manager
            .dispatch(Hook::BeforeInsert, &HookContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::Plugin { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_raises_plugin_timeout() {
        let manager = PluginManager::new(HookMode::Strict);
        manager.register(Arc::new(Slow));
        let err = manager
            .dispatch(Hook::BeforeInsert, &HookContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VellumError::PluginTimeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_unregister() {
        let manager = PluginManager::new(HookMode::Safe);
        let calls = Arc::new(AtomicUsize::new(0));
        manager.register(counting("a", &calls, false));
        assert!(manager.unregister("a"));
        assert!(!manager.unregister("a"));
        manager
            .dispatch(Hook::BeforeInsert, &HookContext::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
