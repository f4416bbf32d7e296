use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use super::{
    CascadeResult, SubTask, SubTaskFailure, SubTaskId, SubTaskOutcome, Task, TaskKind,
    TaskOutput, TaskStatus, TaskStep,
};
use crate::auth::PermissionResolver;
use crate::config::{CascadeMode, EngineConfig};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::hooks::{HookPayload, HookRegistry};
use crate::permission::PermissionLevel;
use crate::storage::{
    Backend, Item, ItemMembership, ItemPatch, ItemStore, MembershipStore, NewItem, Transaction,
};

/// What a task body gets to see of the engine.
pub(crate) struct TaskContext<'a> {
    pub actor: Uuid,
    pub config: &'a EngineConfig,
    pub hooks: &'a HookRegistry,
}

/// Tracks one task through its states.
struct Progress {
    kind: TaskKind,
    actor: Uuid,
    status: TaskStatus,
}

impl Progress {
    fn new(kind: TaskKind, actor: Uuid) -> Self {
        Self {
            kind,
            actor,
            status: TaskStatus::New,
        }
    }

    fn set(&mut self, next: TaskStatus) {
        debug_assert!(self.status.can_become(next), "{:?} -> {:?}", self.status, next);
        tracing::trace!(kind = %self.kind, actor = %self.actor, from = ?self.status, to = ?next, "Task state");
        self.status = next;
    }
}

/// Runs tasks against a backend.
///
/// Non-cascading tasks run in one transaction. A decomposed task is planned
/// in one transaction and its sub-tasks are then executed in order according
/// to [`CascadeMode`]. Post-hooks and events fire for every committed task
/// or sub-task.
pub struct TaskEngine {
    backend: Arc<dyn Backend>,
    hooks: Arc<HookRegistry>,
    events: EventBus,
    config: EngineConfig,
}

impl TaskEngine {
    pub fn new(backend: Arc<dyn Backend>, hooks: HookRegistry, config: EngineConfig) -> Self {
        Self {
            backend,
            hooks: Arc::new(hooks),
            events: EventBus::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn context(&self, actor: Uuid) -> TaskContext<'_> {
        TaskContext {
            actor,
            config: &self.config,
            hooks: &self.hooks,
        }
    }

    /// Runs a task on behalf of `actor`.
    ///
    /// An `Err` means nothing was written. A cascade that stops partway still
    /// returns `Ok`, with the failure in [`CascadeResult::failed_at`].
    pub async fn run(&self, actor: Uuid, task: Task) -> Result<CascadeResult> {
        let kind = task.kind();
        let target = task.target();
        let ctx = self.context(actor);
        let mut progress = Progress::new(kind, actor);
        progress.set(TaskStatus::Running);

        let mut tx = self.backend.begin().await?;
        let step = match task.run(&ctx, &mut *tx).await {
            Ok(step) => step,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(%kind, error = %rollback, "Rollback failed");
                }
                progress.set(TaskStatus::Fail);
                tracing::info!(%kind, %actor, error = %e, "Task refused");
                return Err(e);
            }
        };

        match step {
            TaskStep::Done(output) => {
                if let Err(e) = tx.commit().await {
                    progress.set(TaskStatus::Fail);
                    return Err(e);
                }
                progress.set(TaskStatus::Ok);
                self.notify(kind, actor, &output);
                Ok(CascadeResult::direct(kind, output))
            }
            TaskStep::Delegated(subtasks) => {
                // planning only reads
                tx.commit().await?;
                progress.set(TaskStatus::Delegated);
                tracing::debug!(%kind, %actor, subtasks = subtasks.len(), mode = ?self.config.cascade_mode, "Task delegated");
                let mut result = match self.config.cascade_mode {
                    CascadeMode::Partial => self.run_partial(&ctx, kind, subtasks).await,
                    CascadeMode::Atomic => self.run_atomic(&ctx, kind, subtasks).await,
                };
                result.target = target;
                if let Some(failure) = &result.failed_at {
                    tracing::warn!(
                        %kind,
                        %actor,
                        subtask = %failure.id,
                        target = %failure.target,
                        committed = result.completed.len(),
                        error = %failure.error,
                        "Cascade stopped"
                    );
                }
                Ok(result)
            }
        }
    }

    /// Each sub-task commits on its own; the first failure stops the cascade.
    async fn run_partial(
        &self,
        ctx: &TaskContext<'_>,
        kind: TaskKind,
        subtasks: Vec<SubTask>,
    ) -> CascadeResult {
        let mut result = CascadeResult::delegated(kind, subtasks.len());
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let id = SubTaskId(index);
            let (sub_kind, target) = (subtask.kind(), subtask.target());
            match self.run_committed(ctx, subtask).await {
                Ok(output) => {
                    self.notify(sub_kind, ctx.actor, &output);
                    result.completed.push(SubTaskOutcome {
                        id,
                        kind: sub_kind,
                        target,
                        output,
                    });
                }
                Err(error) => {
                    result.fail(SubTaskFailure {
                        id,
                        kind: sub_kind,
                        target,
                        error,
                    });
                    break;
                }
            }
        }
        result
    }

    async fn run_committed(&self, ctx: &TaskContext<'_>, subtask: SubTask) -> Result<TaskOutput> {
        let mut tx = self.backend.begin().await?;
        match subtask.run(ctx, &mut *tx).await {
            Ok(output) => {
                tx.commit().await?;
                Ok(output)
            }
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// All sub-tasks share one transaction, each inside its own savepoint.
    async fn run_atomic(
        &self,
        ctx: &TaskContext<'_>,
        kind: TaskKind,
        subtasks: Vec<SubTask>,
    ) -> CascadeResult {
        let mut result = CascadeResult::delegated(kind, subtasks.len());
        let mut tx = match self.backend.begin().await {
            Ok(tx) => tx,
            Err(error) => {
                if let Some(first) = subtasks.first() {
                    result.fail(SubTaskFailure {
                        id: SubTaskId(0),
                        kind: first.kind(),
                        target: first.target(),
                        error,
                    });
                }
                return result;
            }
        };

        let mut done = Vec::with_capacity(subtasks.len());
        let mut last = None;
        for (index, subtask) in subtasks.into_iter().enumerate() {
            let id = SubTaskId(index);
            let (sub_kind, target) = (subtask.kind(), subtask.target());
            last = Some((id, sub_kind, target));
            match run_in_savepoint(ctx, &mut *tx, subtask).await {
                Ok(output) => done.push(SubTaskOutcome {
                    id,
                    kind: sub_kind,
                    target,
                    output,
                }),
                Err(error) => {
                    if let Err(rollback) = tx.rollback().await {
                        tracing::warn!(%kind, error = %rollback, "Rollback failed");
                    }
                    result.fail(SubTaskFailure {
                        id,
                        kind: sub_kind,
                        target,
                        error,
                    });
                    return result;
                }
            }
        }

        if let Err(error) = tx.commit().await {
            if let Some((id, sub_kind, target)) = last {
                result.fail(SubTaskFailure {
                    id,
                    kind: sub_kind,
                    target,
                    error,
                });
            }
            return result;
        }

        for outcome in &done {
            self.notify(outcome.kind, ctx.actor, &outcome.output);
        }
        result.completed = done;
        result
    }

    /// Memberships removed along with a deleted item are reported as
    /// membership deletes of their own, before the item.
    fn notify(&self, kind: TaskKind, actor: Uuid, output: &TaskOutput) {
        if let TaskOutput::ItemDeleted { memberships, .. } = output {
            for membership in memberships {
                let removed = TaskOutput::MembershipRemoved(membership.clone());
                self.notify(TaskKind::DeleteMembership, actor, &removed);
            }
        }
        if let Some(payload) = hook_payload(output) {
            self.hooks.spawn_post(kind, actor, payload);
        }
        if let Some(event) = event_for(kind, output) {
            self.events.send(event);
        }
    }

    // === Items ===

    pub async fn create_item(&self, actor: Uuid, new: NewItem) -> Result<Item> {
        let output = self.run(actor, Task::CreateItem(new)).await?.into_output()?;
        expect_item(output)
    }

    pub async fn update_item(&self, actor: Uuid, id: Uuid, patch: ItemPatch) -> Result<Item> {
        let output = self
            .run(actor, Task::UpdateItem { id, patch })
            .await?
            .into_output()?;
        expect_item(output)
    }

    pub async fn delete_item(&self, actor: Uuid, id: Uuid) -> Result<CascadeResult> {
        self.run(actor, Task::DeleteItem { id }).await
    }

    /// Moves an item under `to`, or to the top level when `to` is `None`.
    pub async fn move_item(&self, actor: Uuid, id: Uuid, to: Option<Uuid>) -> Result<Item> {
        let output = self
            .run(actor, Task::MoveItem { id, to })
            .await?
            .into_output()?;
        expect_item(output)
    }

    pub async fn copy_item(&self, actor: Uuid, id: Uuid, to: Option<Uuid>) -> Result<CascadeResult> {
        self.run(actor, Task::CopyItem { id, to }).await
    }

    pub async fn get_item(&self, actor: Uuid, id: Uuid) -> Result<Item> {
        let mut tx = self.backend.begin().await?;
        let item = readable(&mut *tx, actor, id).await?;
        tx.commit().await?;
        Ok(item)
    }

    pub async fn get_children(&self, actor: Uuid, id: Uuid) -> Result<Vec<Item>> {
        let mut tx = self.backend.begin().await?;
        let item = readable(&mut *tx, actor, id).await?;
        let children = ItemStore::children(&mut *tx, &item).await?;
        tx.commit().await?;
        Ok(children)
    }

    pub async fn get_descendants(&self, actor: Uuid, id: Uuid) -> Result<Vec<Item>> {
        let mut tx = self.backend.begin().await?;
        let item = readable(&mut *tx, actor, id).await?;
        let descendants = ItemStore::descendants(&mut *tx, &item).await?;
        tx.commit().await?;
        Ok(descendants)
    }

    pub async fn get_ancestors(&self, actor: Uuid, id: Uuid) -> Result<Vec<Item>> {
        let mut tx = self.backend.begin().await?;
        let item = readable(&mut *tx, actor, id).await?;
        let ancestors = ItemStore::ancestors(&mut *tx, &item).await?;
        tx.commit().await?;
        Ok(ancestors)
    }

    /// Topmost items the account holds a membership on.
    pub async fn shared_items(&self, account: Uuid) -> Result<Vec<Item>> {
        let mut tx = self.backend.begin().await?;
        let memberships = tx.memberships_of_account(account).await?;
        let mut items = Vec::new();
        let mut tops: Vec<&ItemMembership> = Vec::new();
        // path order puts ancestors first
        for m in &memberships {
            if tops.iter().any(|top| top.item_path.is_ancestor_of(&m.item_path)) {
                continue;
            }
            tops.push(m);
            items.push(ItemStore::get_at(&mut *tx, &m.item_path).await?);
        }
        tx.commit().await?;
        Ok(items)
    }

    pub async fn effective_permission(
        &self,
        account: Uuid,
        item: Uuid,
    ) -> Result<Option<PermissionLevel>> {
        let mut tx = self.backend.begin().await?;
        let item = ItemStore::get(&mut *tx, item).await?;
        let level = PermissionResolver::effective_permission(&mut *tx, account, &item.path).await?;
        tx.commit().await?;
        Ok(level)
    }

    /// `account`'s effective permission on an item, asked by `actor`.
    /// Asking about another account needs Read on the item.
    pub async fn permission_of(
        &self,
        actor: Uuid,
        account: Uuid,
        item: Uuid,
    ) -> Result<Option<PermissionLevel>> {
        let mut tx = self.backend.begin().await?;
        let item = if actor == account {
            ItemStore::get(&mut *tx, item).await?
        } else {
            readable(&mut *tx, actor, item).await?
        };
        let level = PermissionResolver::effective_permission(&mut *tx, account, &item.path).await?;
        tx.commit().await?;
        Ok(level)
    }

    // === Memberships ===

    /// Returns `None` when the grant equals what the account already
    /// inherits, in which case any explicit row on the item was removed.
    pub async fn create_membership(
        &self,
        actor: Uuid,
        item: Uuid,
        account: Uuid,
        permission: PermissionLevel,
    ) -> Result<Option<ItemMembership>> {
        let task = Task::CreateMembership {
            item,
            account,
            permission,
        };
        match self.run(actor, task).await?.into_output()? {
            TaskOutput::Membership(m) => Ok(Some(m)),
            _ => Ok(None),
        }
    }

    pub async fn update_membership(
        &self,
        actor: Uuid,
        id: Uuid,
        permission: PermissionLevel,
    ) -> Result<CascadeResult> {
        self.run(actor, Task::UpdateMembership { id, permission }).await
    }

    pub async fn delete_membership(
        &self,
        actor: Uuid,
        id: Uuid,
        purge_below: bool,
    ) -> Result<CascadeResult> {
        self.run(actor, Task::DeleteMembership { id, purge_below })
            .await
    }

    /// One effective membership per account with access to the item.
    pub async fn get_memberships(&self, actor: Uuid, item: Uuid) -> Result<Vec<ItemMembership>> {
        let mut tx = self.backend.begin().await?;
        let item = readable(&mut *tx, actor, item).await?;
        let memberships = MembershipStore::effective_at(&mut *tx, &item.path).await?;
        tx.commit().await?;
        Ok(memberships)
    }

    pub async fn get_membership(&self, actor: Uuid, id: Uuid) -> Result<ItemMembership> {
        let mut tx = self.backend.begin().await?;
        let membership = MembershipStore::get(&mut *tx, id).await?;
        if membership.account_id != actor {
            let item = ItemStore::get_at(&mut *tx, &membership.item_path).await?;
            PermissionResolver::require(&mut *tx, actor, &item, PermissionLevel::Read).await?;
        }
        tx.commit().await?;
        Ok(membership)
    }
}

async fn readable(tx: &mut dyn Transaction, actor: Uuid, id: Uuid) -> Result<Item> {
    let item = ItemStore::get(tx, id).await?;
    PermissionResolver::require(tx, actor, &item, PermissionLevel::Read).await?;
    Ok(item)
}

async fn run_in_savepoint(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    subtask: SubTask,
) -> Result<TaskOutput> {
    tx.savepoint().await?;
    match subtask.run(ctx, tx).await {
        Ok(output) => {
            tx.release_savepoint().await?;
            Ok(output)
        }
        Err(e) => {
            tx.rollback_to_savepoint().await?;
            Err(e)
        }
    }
}

fn expect_item(output: TaskOutput) -> Result<Item> {
    match output {
        TaskOutput::Item(item) => Ok(item),
        other => Err(Error::Storage(anyhow::anyhow!(
            "expected an item, task produced {:?}",
            other
        ))),
    }
}

fn hook_payload(output: &TaskOutput) -> Option<HookPayload> {
    match output {
        TaskOutput::Item(item) | TaskOutput::ItemDeleted { item, .. } => {
            Some(HookPayload::Item { item: item.clone() })
        }
        TaskOutput::Copied { source, copy } => Some(HookPayload::Copy {
            source: source.clone(),
            copy: copy.clone(),
        }),
        TaskOutput::Membership(m) | TaskOutput::MembershipRemoved(m) => {
            Some(HookPayload::Membership {
                membership: m.clone(),
            })
        }
        TaskOutput::Unchanged => None,
    }
}

fn event_for(kind: TaskKind, output: &TaskOutput) -> Option<Event> {
    let event = match (kind, output) {
        (_, TaskOutput::MembershipRemoved(m)) => Event::MembershipDeleted {
            id: m.id,
            item: m.item_id(),
            account: m.account_id,
        },
        (TaskKind::CreateItem, TaskOutput::Item(item)) => Event::ItemCreated {
            id: item.id,
            parent: item.parent_id(),
        },
        (TaskKind::UpdateItem, TaskOutput::Item(item)) => Event::ItemUpdated { id: item.id },
        (_, TaskOutput::ItemDeleted { item, .. }) => Event::ItemDeleted { id: item.id },
        (TaskKind::MoveItem, TaskOutput::Item(item)) => Event::ItemMoved {
            id: item.id,
            new_parent: item.parent_id(),
        },
        (_, TaskOutput::Copied { source, copy }) => Event::ItemCopied {
            source: source.id,
            copy: copy.id,
        },
        (TaskKind::CreateMembership, TaskOutput::Membership(m)) => Event::MembershipCreated {
            id: m.id,
            item: m.item_id(),
            account: m.account_id,
            permission: m.permission,
        },
        (_, TaskOutput::Membership(m)) => Event::MembershipUpdated {
            id: m.id,
            permission: m.permission,
        },
        _ => return None,
    };
    Some(event)
}
