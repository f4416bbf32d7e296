//! Tasks over the item tree and the engine that executes them.
//!
//! A task either finishes with a [`TaskOutput`] or, for operations that fan
//! out over a subtree, is decomposed into an ordered list of single-row
//! sub-tasks that the engine runs one at a time. The outcome of a decomposed
//! task is a [`CascadeResult`], which says which sub-tasks committed and
//! where execution stopped.

mod engine;
mod item;
mod membership;


use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::path::ItemPath;
use crate::permission::PermissionLevel;
use crate::storage::{Item, ItemMembership, ItemPatch, NewItem, Transaction};

pub use engine::TaskEngine;
pub(crate) use engine::TaskContext;

/// Task discriminant. Hooks are registered per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    CreateItem,
    UpdateItem,
    DeleteItem,
    MoveItem,
    CopyItem,
    CreateMembership,
    UpdateMembership,
    DeleteMembership,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CreateItem => "create-item",
            TaskKind::UpdateItem => "update-item",
            TaskKind::DeleteItem => "delete-item",
            TaskKind::MoveItem => "move-item",
            TaskKind::CopyItem => "copy-item",
            TaskKind::CreateMembership => "create-membership",
            TaskKind::UpdateMembership => "update-membership",
            TaskKind::DeleteMembership => "delete-membership",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `New -> Running -> {Ok | Delegated | Fail}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    New,
    Running,
    Ok,
    Delegated,
    Fail,
}

impl TaskStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, TaskStatus::Ok | TaskStatus::Delegated | TaskStatus::Fail)
    }

    pub fn can_become(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::New, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Ok)
                | (TaskStatus::Running, TaskStatus::Delegated)
                | (TaskStatus::Running, TaskStatus::Fail)
        )
    }
}

/// A top-level operation requested by an actor.
#[derive(Clone, Debug)]
pub enum Task {
    CreateItem(NewItem),
    UpdateItem { id: Uuid, patch: ItemPatch },
    DeleteItem { id: Uuid },
    MoveItem { id: Uuid, to: Option<Uuid> },
    CopyItem { id: Uuid, to: Option<Uuid> },
    CreateMembership {
        item: Uuid,
        account: Uuid,
        permission: PermissionLevel,
    },
    UpdateMembership { id: Uuid, permission: PermissionLevel },
    DeleteMembership { id: Uuid, purge_below: bool },
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::CreateItem(_) => TaskKind::CreateItem,
            Task::UpdateItem { .. } => TaskKind::UpdateItem,
            Task::DeleteItem { .. } => TaskKind::DeleteItem,
            Task::MoveItem { .. } => TaskKind::MoveItem,
            Task::CopyItem { .. } => TaskKind::CopyItem,
            Task::CreateMembership { .. } => TaskKind::CreateMembership,
            Task::UpdateMembership { .. } => TaskKind::UpdateMembership,
            Task::DeleteMembership { .. } => TaskKind::DeleteMembership,
        }
    }

    /// The existing row the task acts on. Creation has none yet.
    pub fn target(&self) -> Option<Uuid> {
        match self {
            Task::CreateItem(_) => None,
            Task::UpdateItem { id, .. }
            | Task::DeleteItem { id }
            | Task::MoveItem { id, .. }
            | Task::CopyItem { id, .. }
            | Task::UpdateMembership { id, .. }
            | Task::DeleteMembership { id, .. } => Some(*id),
            Task::CreateMembership { item, .. } => Some(*item),
        }
    }

    pub(crate) async fn run(
        self,
        ctx: &TaskContext<'_>,
        tx: &mut dyn Transaction,
    ) -> Result<TaskStep> {
        match self {
            Task::CreateItem(new) => item::create(ctx, tx, new).await.map(TaskStep::Done),
            Task::UpdateItem { id, patch } => {
                item::update(ctx, tx, id, patch).await.map(TaskStep::Done)
            }
            Task::DeleteItem { id } => item::plan_delete(ctx, tx, id)
                .await
                .map(TaskStep::Delegated),
            Task::MoveItem { id, to } => item::move_item(ctx, tx, id, to).await.map(TaskStep::Done),
            Task::CopyItem { id, to } => item::plan_copy(ctx, tx, id, to)
                .await
                .map(TaskStep::Delegated),
            Task::CreateMembership {
                item,
                account,
                permission,
            } => membership::create(ctx, tx, item, account, permission)
                .await
                .map(TaskStep::Done),
            Task::UpdateMembership { id, permission } => {
                membership::update(ctx, tx, id, permission).await
            }
            Task::DeleteMembership { id, purge_below } => {
                membership::delete(ctx, tx, id, purge_below).await
            }
        }
    }
}

/// One row of a decomposed task.
#[derive(Clone, Debug)]
pub(crate) enum SubTask {
    DeleteItem {
        id: Uuid,
    },
    /// Copies `source` to `path`, whose last label is the copy's id.
    CopyItem {
        source: Uuid,
        path: ItemPath,
        root: bool,
    },
    UpdateMembership {
        id: Uuid,
        permission: PermissionLevel,
    },
    DeleteMembership {
        id: Uuid,
    },
}

impl SubTask {
    pub(crate) fn kind(&self) -> TaskKind {
        match self {
            SubTask::DeleteItem { .. } => TaskKind::DeleteItem,
            SubTask::CopyItem { .. } => TaskKind::CopyItem,
            SubTask::UpdateMembership { .. } => TaskKind::UpdateMembership,
            SubTask::DeleteMembership { .. } => TaskKind::DeleteMembership,
        }
    }

    pub(crate) fn target(&self) -> Uuid {
        match self {
            SubTask::DeleteItem { id }
            | SubTask::UpdateMembership { id, .. }
            | SubTask::DeleteMembership { id } => *id,
            SubTask::CopyItem { source, .. } => *source,
        }
    }

    pub(crate) async fn run(
        self,
        ctx: &TaskContext<'_>,
        tx: &mut dyn Transaction,
    ) -> Result<TaskOutput> {
        match self {
            SubTask::DeleteItem { id } => item::delete_row(ctx, tx, id).await,
            SubTask::CopyItem { source, path, root } => {
                item::copy_row(ctx, tx, source, path, root).await
            }
            SubTask::UpdateMembership { id, permission } => {
                membership::update_row(ctx, tx, id, permission).await
            }
            SubTask::DeleteMembership { id } => membership::delete_row(ctx, tx, id).await,
        }
    }
}

pub(crate) enum TaskStep {
    Done(TaskOutput),
    Delegated(Vec<SubTask>),
}

/// What a committed task or sub-task produced.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskOutput {
    Item(Item),
    /// A deleted item with the memberships that went with it.
    ItemDeleted {
        item: Item,
        memberships: Vec<ItemMembership>,
    },
    Copied { source: Item, copy: Item },
    Membership(ItemMembership),
    MembershipRemoved(ItemMembership),
    Unchanged,
}

impl TaskOutput {
    /// The item written, or the copy for a copied item.
    pub fn item(&self) -> Option<&Item> {
        match self {
            TaskOutput::Item(item) | TaskOutput::ItemDeleted { item, .. } => Some(item),
            TaskOutput::Copied { copy, .. } => Some(copy),
            _ => None,
        }
    }

    pub fn membership(&self) -> Option<&ItemMembership> {
        match self {
            TaskOutput::Membership(m) | TaskOutput::MembershipRemoved(m) => Some(m),
            _ => None,
        }
    }

    fn subject(&self) -> Option<Uuid> {
        self.item()
            .map(|i| i.id)
            .or_else(|| self.membership().map(|m| m.id))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SubTaskId(pub usize);

impl fmt::Display for SubTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SubTaskOutcome {
    pub id: SubTaskId,
    pub kind: TaskKind,
    pub target: Uuid,
    pub output: TaskOutput,
}

#[derive(Debug)]
pub struct SubTaskFailure {
    pub id: SubTaskId,
    pub kind: TaskKind,
    pub target: Uuid,
    pub error: Error,
}

/// Result of a task that passed its pre-checks.
///
/// A task that was not decomposed has a single outcome. For a decomposed
/// task, `completed` lists the committed sub-tasks in execution order and
/// `failed_at` the one that stopped the cascade; sub-tasks after it were
/// never attempted.
#[derive(Debug)]
pub struct CascadeResult {
    pub kind: TaskKind,
    pub target: Option<Uuid>,
    pub status: TaskStatus,
    pub planned: usize,
    pub completed: Vec<SubTaskOutcome>,
    pub failed_at: Option<SubTaskFailure>,
}

impl CascadeResult {
    pub(crate) fn direct(kind: TaskKind, output: TaskOutput) -> Self {
        let target = output.subject();
        Self {
            kind,
            target,
            status: TaskStatus::Ok,
            planned: 1,
            completed: vec![SubTaskOutcome {
                id: SubTaskId(0),
                kind,
                target: target.unwrap_or_default(),
                output,
            }],
            failed_at: None,
        }
    }

    pub(crate) fn delegated(kind: TaskKind, planned: usize) -> Self {
        Self {
            kind,
            target: None,
            status: TaskStatus::Delegated,
            planned,
            completed: Vec::new(),
            failed_at: None,
        }
    }

    pub(crate) fn fail(&mut self, failure: SubTaskFailure) {
        self.status = TaskStatus::Fail;
        self.failed_at = Some(failure);
    }

    pub fn is_complete(&self) -> bool {
        self.failed_at.is_none()
    }

    /// Sub-tasks that were neither committed nor the failing one.
    pub fn not_attempted(&self) -> usize {
        let failed = usize::from(self.failed_at.is_some());
        self.planned
            .saturating_sub(self.completed.len() + failed)
    }

    /// Targets of the committed sub-tasks, in execution order.
    pub fn completed_targets(&self) -> Vec<Uuid> {
        self.completed.iter().map(|o| o.target).collect()
    }

    pub fn output(&self) -> Option<&TaskOutput> {
        self.completed.last().map(|o| &o.output)
    }

    pub fn into_result(self) -> Result<Vec<SubTaskOutcome>> {
        match self.failed_at {
            Some(failure) => Err(failure.error),
            None => Ok(self.completed),
        }
    }

    /// Output of the last committed sub-task, or the failure.
    pub fn into_output(self) -> Result<TaskOutput> {
        let mut completed = self.into_result()?;
        Ok(completed
            .pop()
            .map(|o| o.output)
            .unwrap_or(TaskOutput::Unchanged))
    }
}
