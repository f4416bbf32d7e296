//! Extension points around tasks.
//!
//! Pre-hooks run inside the task's transaction, before its main mutation,
//! and an error from one aborts the task. Post-hooks run after the commit on
//! their own tokio task; their errors are logged and otherwise ignored.
//! A pre-hook must not call back into the engine, since the transaction it
//! runs in holds the backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{Item, ItemMembership, Transaction};
use crate::task::TaskKind;

/// What a hook is told about the task it surrounds.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HookPayload {
    Item { item: Item },
    Move { item: Item, to: Option<Uuid> },
    Copy { source: Item, copy: Item },
    Membership { membership: ItemMembership },
}

#[async_trait]
pub trait PreHook: Send + Sync {
    async fn before(
        &self,
        actor: Uuid,
        payload: &HookPayload,
        tx: &mut dyn Transaction,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait PostHook: Send + Sync {
    async fn after(&self, actor: Uuid, payload: &HookPayload) -> anyhow::Result<()>;
}

#[derive(Default, Clone)]
pub struct HookRegistry {
    pre: HashMap<TaskKind, Vec<Arc<dyn PreHook>>>,
    post: HashMap<TaskKind, Vec<Arc<dyn PostHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_pre(&mut self, kind: TaskKind, hook: Arc<dyn PreHook>) -> &mut Self {
        self.pre.entry(kind).or_default().push(hook);
        self
    }

    pub fn register_post(&mut self, kind: TaskKind, hook: Arc<dyn PostHook>) -> &mut Self {
        self.post.entry(kind).or_default().push(hook);
        self
    }

    /// Runs the pre-hooks of `kind` in registration order.
    pub async fn run_pre(
        &self,
        kind: TaskKind,
        actor: Uuid,
        payload: &HookPayload,
        tx: &mut dyn Transaction,
    ) -> Result<()> {
        let Some(hooks) = self.pre.get(&kind) else {
            return Ok(());
        };
        for hook in hooks {
            hook.before(actor, payload, tx)
                .await
                .map_err(|source| Error::Hook { kind, source })?;
        }
        Ok(())
    }

    /// Spawns the post-hooks of `kind`.
    pub fn spawn_post(&self, kind: TaskKind, actor: Uuid, payload: HookPayload) {
        let Some(hooks) = self.post.get(&kind) else {
            return;
        };
        let payload = Arc::new(payload);
        for hook in hooks {
            let hook = Arc::clone(hook);
            let payload = Arc::clone(&payload);
            tokio::spawn(async move {
                if let Err(e) = hook.after(actor, &payload).await {
                    tracing::warn!(%kind, %actor, error = %e, "Post-hook failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ItemPath;
    use crate::storage::{Backend, ItemType, MemoryBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl PreHook for Counting {
        async fn before(
            &self,
            _actor: Uuid,
            _payload: &HookPayload,
            _tx: &mut dyn Transaction,
        ) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Refusing;

    #[async_trait]
    impl PreHook for Refusing {
        async fn before(
            &self,
            _actor: Uuid,
            _payload: &HookPayload,
            _tx: &mut dyn Transaction,
        ) -> anyhow::Result<()> {
            anyhow::bail!("refused")
        }
    }

    fn payload() -> HookPayload {
        let id = Uuid::new_v4();
        HookPayload::Item {
            item: Item::new(
                id,
                ItemPath::root(id),
                "x",
                ItemType::Document,
                serde_json::Value::Null,
                id,
            ),
        }
    }

    #[tokio::test]
    async fn test_pre_hooks_run_in_order_and_stop_on_error() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let mut hooks = HookRegistry::new();
        hooks
            .register_pre(TaskKind::CreateItem, counter.clone())
            .register_pre(TaskKind::CreateItem, Arc::new(Refusing))
            .register_pre(TaskKind::CreateItem, counter.clone());

        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let result = hooks
            .run_pre(TaskKind::CreateItem, Uuid::new_v4(), &payload(), &mut *tx)
            .await;

        assert!(matches!(
            result,
            Err(Error::Hook { kind: TaskKind::CreateItem, .. })
        ));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // other kinds are unaffected
        hooks
            .run_pre(TaskKind::UpdateItem, Uuid::new_v4(), &payload(), &mut *tx)
            .await
            .unwrap();
    }
}
