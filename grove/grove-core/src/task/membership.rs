use chrono::Utc;
use uuid::Uuid;

use super::{SubTask, TaskContext, TaskKind, TaskOutput, TaskStep};
use crate::auth::PermissionResolver;
use crate::error::{Error, Result};
use crate::hooks::HookPayload;
use crate::permission::PermissionLevel;
use crate::storage::membership::ensure_within;
use crate::storage::{ItemMembership, ItemStore, MembershipStore, Transaction, WritePlan};

/// Grants `permission` to `account` on an item, in one transaction.
pub(super) async fn create(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    item: Uuid,
    account: Uuid,
    permission: PermissionLevel,
) -> Result<TaskOutput> {
    let item = ItemStore::get(tx, item).await?;
    PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Admin).await?;

    let limit = ctx.config.max_item_memberships_for_delete;
    match MembershipStore::plan_write(tx, account, &item.path, permission, limit).await? {
        WritePlan::Redundant {
            existing: Some(existing),
        } => {
            let payload = HookPayload::Membership {
                membership: existing.clone(),
            };
            ctx.hooks
                .run_pre(TaskKind::CreateMembership, ctx.actor, &payload, tx)
                .await?;
            tx.delete_membership(existing.id).await?;
            tracing::debug!(membership = %existing.id, "Removed membership made redundant by inheritance");
            Ok(TaskOutput::MembershipRemoved(existing))
        }
        WritePlan::Redundant { existing: None } => Ok(TaskOutput::Unchanged),
        WritePlan::Write {
            existing: Some(existing),
            ..
        } => Err(Error::ModifyExistingMembership(existing.id)),
        WritePlan::Write {
            existing: None,
            redundant_below,
        } => {
            let membership = ItemMembership::new(item.path.clone(), account, permission, ctx.actor);
            let payload = HookPayload::Membership {
                membership: membership.clone(),
            };
            ctx.hooks
                .run_pre(TaskKind::CreateMembership, ctx.actor, &payload, tx)
                .await?;

            for below in &redundant_below {
                tx.delete_membership(below.id).await?;
            }
            tx.insert_membership(&membership).await?;
            tracing::debug!(
                membership = %membership.id,
                %account,
                %permission,
                pruned = redundant_below.len(),
                "Created membership"
            );
            Ok(TaskOutput::Membership(membership))
        }
    }
}

/// Changes a membership's permission. Delegates when the change makes rows
/// redundant: the membership itself, or the account's rows below it.
pub(super) async fn update(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
    permission: PermissionLevel,
) -> Result<TaskStep> {
    let membership = MembershipStore::get(tx, id).await?;
    let item = ItemStore::get_at(tx, &membership.item_path).await?;
    PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Admin).await?;

    if membership.permission == permission {
        return Ok(TaskStep::Done(TaskOutput::Unchanged));
    }

    let limit = ctx.config.max_item_memberships_for_delete;
    let plan = MembershipStore::plan_write(
        tx,
        membership.account_id,
        &membership.item_path,
        permission,
        limit,
    )
    .await?;
    match plan {
        WritePlan::Redundant { .. } => Ok(TaskStep::Delegated(vec![SubTask::DeleteMembership {
            id,
        }])),
        WritePlan::Write {
            redundant_below, ..
        } if redundant_below.is_empty() => {
            let output = apply_update(ctx, tx, membership, permission).await?;
            Ok(TaskStep::Done(output))
        }
        WritePlan::Write {
            redundant_below, ..
        } => {
            let mut subtasks: Vec<SubTask> = redundant_below
                .iter()
                .map(|m| SubTask::DeleteMembership { id: m.id })
                .collect();
            subtasks.push(SubTask::UpdateMembership { id, permission });
            Ok(TaskStep::Delegated(subtasks))
        }
    }
}

pub(super) async fn update_row(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
    permission: PermissionLevel,
) -> Result<TaskOutput> {
    let membership = MembershipStore::get(tx, id).await?;
    apply_update(ctx, tx, membership, permission).await
}

async fn apply_update(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    mut membership: ItemMembership,
    permission: PermissionLevel,
) -> Result<TaskOutput> {
    membership.permission = permission;
    membership.updated_at = Utc::now();

    let payload = HookPayload::Membership {
        membership: membership.clone(),
    };
    ctx.hooks
        .run_pre(TaskKind::UpdateMembership, ctx.actor, &payload, tx)
        .await?;
    tx.update_membership(&membership).await?;
    Ok(TaskOutput::Membership(membership))
}

/// Revokes a membership. With `purge_below`, the account's memberships
/// below the item go too, deepest first, one sub-task each.
pub(super) async fn delete(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
    purge_below: bool,
) -> Result<TaskStep> {
    let membership = MembershipStore::get(tx, id).await?;
    if membership.account_id != ctx.actor {
        let item = ItemStore::get_at(tx, &membership.item_path).await?;
        PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Admin).await?;
    }

    if !purge_below {
        return Ok(TaskStep::Done(remove(ctx, tx, membership).await?));
    }

    let below = MembershipStore::below(tx, membership.account_id, &membership.item_path).await?;
    ensure_within(below.len() + 1, ctx.config.max_item_memberships_for_delete)?;

    let mut subtasks: Vec<SubTask> = below
        .iter()
        .map(|m| SubTask::DeleteMembership { id: m.id })
        .collect();
    subtasks.push(SubTask::DeleteMembership { id });
    Ok(TaskStep::Delegated(subtasks))
}

pub(super) async fn delete_row(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
) -> Result<TaskOutput> {
    let membership = MembershipStore::get(tx, id).await?;
    remove(ctx, tx, membership).await
}

async fn remove(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    membership: ItemMembership,
) -> Result<TaskOutput> {
    let payload = HookPayload::Membership {
        membership: membership.clone(),
    };
    ctx.hooks
        .run_pre(TaskKind::DeleteMembership, ctx.actor, &payload, tx)
        .await?;
    tx.delete_membership(membership.id).await?;
    Ok(TaskOutput::MembershipRemoved(membership))
}
