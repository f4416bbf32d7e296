use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use super::{SubTask, TaskContext, TaskKind, TaskOutput};
use crate::auth::PermissionResolver;
use crate::error::{Error, Result};
use crate::hooks::HookPayload;
use crate::path::ItemPath;
use crate::permission::PermissionLevel;
use crate::storage::{
    Item, ItemMembership, ItemPatch, ItemStore, MembershipStore, NewItem, Transaction,
};

fn check_levels(ctx: &TaskContext<'_>, levels: usize) -> Result<()> {
    let limit = ctx.config.max_tree_levels;
    if levels > limit {
        return Err(Error::HierarchyTooDeep { levels, limit });
    }
    Ok(())
}

/// Folder that a new, moved or copied item will live in.
async fn destination(ctx: &TaskContext<'_>, tx: &mut dyn Transaction, parent: Uuid) -> Result<Item> {
    let parent = ItemStore::get(tx, parent).await?;
    PermissionResolver::require(tx, ctx.actor, &parent, PermissionLevel::Write).await?;
    if !parent.is_folder() {
        return Err(Error::ItemNotFolder(parent.id));
    }
    Ok(parent)
}

/// Makes the actor admin of an item it just created, unless it already
/// inherits admin there.
async fn grant_creator(ctx: &TaskContext<'_>, tx: &mut dyn Transaction, item: &Item) -> Result<()> {
    let inherited = MembershipStore::inherited(tx, ctx.actor, &item.path).await?;
    if inherited.map_or(true, |m| m.permission < PermissionLevel::Admin) {
        let membership = ItemMembership::new(
            item.path.clone(),
            ctx.actor,
            PermissionLevel::Admin,
            ctx.actor,
        );
        tx.insert_membership(&membership).await?;
    }
    Ok(())
}

pub(super) async fn create(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    new: NewItem,
) -> Result<TaskOutput> {
    let id = Uuid::new_v4();
    let path = match new.parent {
        Some(parent) => destination(ctx, tx, parent).await?.path.append_child(id),
        None => ItemPath::root(id),
    };
    check_levels(ctx, path.levels())?;

    let item = Item::new(id, path, new.name, new.item_type, new.extra, ctx.actor);
    let payload = HookPayload::Item { item: item.clone() };
    ctx.hooks
        .run_pre(TaskKind::CreateItem, ctx.actor, &payload, tx)
        .await?;

    tx.insert_item(&item).await?;
    grant_creator(ctx, tx, &item).await?;
    tracing::debug!(item = %item.id, parent = ?item.parent_id(), "Created item");
    Ok(TaskOutput::Item(item))
}

pub(super) async fn update(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
    patch: ItemPatch,
) -> Result<TaskOutput> {
    let mut item = ItemStore::get(tx, id).await?;
    PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Write).await?;
    patch.apply(&mut item);

    let payload = HookPayload::Item { item: item.clone() };
    ctx.hooks
        .run_pre(TaskKind::UpdateItem, ctx.actor, &payload, tx)
        .await?;
    tx.update_item(&item).await?;
    Ok(TaskOutput::Item(item))
}

/// One delete sub-task per row, children before parents.
pub(super) async fn plan_delete(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
) -> Result<Vec<SubTask>> {
    let item = ItemStore::get(tx, id).await?;
    PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Admin).await?;

    let descendants = ItemStore::descendants_deepest_first(tx, &item).await?;
    let limit = ctx.config.max_descendants_for_delete;
    if descendants.len() > limit {
        return Err(Error::TooManyDescendants {
            item: id,
            count: descendants.len(),
            limit,
        });
    }

    Ok(descendants
        .iter()
        .map(|d| d.id)
        .chain(std::iter::once(item.id))
        .map(|id| SubTask::DeleteItem { id })
        .collect())
}

/// Deletes a single childless item and the memberships on it.
pub(super) async fn delete_row(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
) -> Result<TaskOutput> {
    let item = ItemStore::get(tx, id).await?;
    if ItemStore::has_children(tx, &item).await? {
        return Err(Error::ItemHasChildren(id));
    }

    let payload = HookPayload::Item { item: item.clone() };
    ctx.hooks
        .run_pre(TaskKind::DeleteItem, ctx.actor, &payload, tx)
        .await?;

    let memberships = tx.memberships_by_path_prefix(&item.path, None).await?;
    for membership in &memberships {
        tx.delete_membership(membership.id).await?;
    }
    tx.delete_item(id).await?;
    Ok(TaskOutput::ItemDeleted { item, memberships })
}

/// Moves a subtree in one transaction and repairs the memberships in it.
pub(super) async fn move_item(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
    to: Option<Uuid>,
) -> Result<TaskOutput> {
    let item = ItemStore::get(tx, id).await?;
    PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Admin).await?;

    let invalid = || Error::InvalidMoveTarget { item: id, target: to };
    if item.parent_id() == to || to == Some(id) {
        return Err(invalid());
    }
    let new_path = match to {
        Some(parent) => {
            let parent = destination(ctx, tx, parent).await?;
            if item.path.is_ancestor_of(&parent.path) {
                return Err(invalid());
            }
            parent.path.append_child(id)
        }
        None => ItemPath::root(id),
    };

    let descendants = ItemStore::descendants(tx, &item).await?;
    let limit = ctx.config.max_descendants_for_move;
    if descendants.len() > limit {
        return Err(Error::TooManyDescendants {
            item: id,
            count: descendants.len(),
            limit,
        });
    }
    let deepest = ItemStore::subtree_levels(&item, &descendants);
    check_levels(ctx, deepest - item.path.levels() + new_path.levels())?;

    let payload = HookPayload::Move {
        item: item.clone(),
        to,
    };
    ctx.hooks
        .run_pre(TaskKind::MoveItem, ctx.actor, &payload, tx)
        .await?;

    // access each account held here through an ancestor before the move
    let previously_inherited = match item.path.parent() {
        Some(parent) => MembershipStore::effective_at(tx, &parent).await?,
        None => Vec::new(),
    };

    let old_path = item.path.clone();
    let mut moved = item;
    moved.path = new_path.clone();
    moved.updated_at = Utc::now();
    tx.update_item(&moved).await?;
    for mut descendant in descendants {
        descendant.path = descendant.path.rebase(&old_path, &new_path)?;
        tx.update_item(&descendant).await?;
    }
    for mut membership in tx.memberships_by_path_prefix(&old_path, None).await? {
        membership.item_path = membership.item_path.rebase(&old_path, &new_path)?;
        tx.update_membership(&membership).await?;
    }

    for grant in previously_inherited {
        if tx.membership_at(grant.account_id, &new_path).await?.is_some() {
            continue;
        }
        let inherited = MembershipStore::inherited(tx, grant.account_id, &new_path).await?;
        if inherited.map_or(true, |m| m.permission < grant.permission) {
            let kept = ItemMembership::new(
                new_path.clone(),
                grant.account_id,
                grant.permission,
                ctx.actor,
            );
            tx.insert_membership(&kept).await?;
        }
    }

    // top-down, so each row is compared with what is left above it
    let mut subtree = tx.memberships_by_path_prefix(&new_path, None).await?;
    subtree.sort_by_key(|m| m.item_path.levels());
    let mut pruned = 0usize;
    for membership in subtree {
        let inherited =
            MembershipStore::inherited(tx, membership.account_id, &membership.item_path).await?;
        if inherited.is_some_and(|i| membership.permission <= i.permission) {
            tx.delete_membership(membership.id).await?;
            pruned += 1;
        }
    }

    tracing::debug!(item = %id, to = ?to, pruned, "Moved item");
    Ok(TaskOutput::Item(moved))
}

/// One copy sub-task per row, parents before children, each with its final
/// path already assigned.
pub(super) async fn plan_copy(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    id: Uuid,
    to: Option<Uuid>,
) -> Result<Vec<SubTask>> {
    let item = ItemStore::get(tx, id).await?;
    PermissionResolver::require(tx, ctx.actor, &item, PermissionLevel::Read).await?;

    let root_path = match to {
        Some(parent) => destination(ctx, tx, parent)
            .await?
            .path
            .append_child(Uuid::new_v4()),
        None => ItemPath::root(Uuid::new_v4()),
    };

    let mut descendants = ItemStore::descendants(tx, &item).await?;
    let limit = ctx.config.max_descendants_for_copy;
    if descendants.len() > limit {
        return Err(Error::TooManyDescendants {
            item: id,
            count: descendants.len(),
            limit,
        });
    }
    let deepest = ItemStore::subtree_levels(&item, &descendants);
    check_levels(ctx, deepest - item.path.levels() + root_path.levels())?;

    descendants.sort_by(|a, b| {
        (a.path.levels(), a.created_at, &a.path).cmp(&(b.path.levels(), b.created_at, &b.path))
    });

    let mut copies: HashMap<Uuid, ItemPath> = HashMap::new();
    copies.insert(item.id, root_path.clone());
    let mut subtasks = vec![SubTask::CopyItem {
        source: item.id,
        path: root_path,
        root: true,
    }];
    for descendant in descendants {
        let parent_copy = descendant
            .parent_id()
            .and_then(|parent| copies.get(&parent))
            .cloned()
            .ok_or_else(|| Error::InvalidPath(descendant.path.to_string()))?;
        let path = parent_copy.append_child(Uuid::new_v4());
        copies.insert(descendant.id, path.clone());
        subtasks.push(SubTask::CopyItem {
            source: descendant.id,
            path,
            root: false,
        });
    }
    Ok(subtasks)
}

pub(super) async fn copy_row(
    ctx: &TaskContext<'_>,
    tx: &mut dyn Transaction,
    source: Uuid,
    path: ItemPath,
    root: bool,
) -> Result<TaskOutput> {
    let source = ItemStore::get(tx, source).await?;
    if let Some(parent) = path.parent() {
        ItemStore::get_at(tx, &parent).await?;
    }

    let copy = Item::new(
        path.id(),
        path,
        source.name.clone(),
        source.item_type,
        source.extra.clone(),
        ctx.actor,
    );
    let payload = HookPayload::Copy {
        source: source.clone(),
        copy: copy.clone(),
    };
    ctx.hooks
        .run_pre(TaskKind::CopyItem, ctx.actor, &payload, tx)
        .await?;

    tx.insert_item(&copy).await?;
    if root {
        grant_creator(ctx, tx, &copy).await?;
    }
    Ok(TaskOutput::Copied { source, copy })
}
