use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Transaction;
use crate::error::{Error, Result};
use crate::path::ItemPath;
use crate::permission::PermissionLevel;

/// Grants an account a permission on an item and, implicitly, on every
/// descendant that has no membership of its own for that account.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemMembership {
    pub id: Uuid,
    pub item_path: ItemPath,
    pub account_id: Uuid,
    pub permission: PermissionLevel,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ItemMembership {
    pub fn new(
        item_path: ItemPath,
        account_id: Uuid,
        permission: PermissionLevel,
        creator_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            item_path,
            account_id,
            permission,
            creator_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn item_id(&self) -> Uuid {
        self.item_path.id()
    }
}

/// What writing `permission` for an account at a path requires, once the
/// consistency rules are applied.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePlan {
    /// The permission equals the inherited one. An explicit row, if any,
    /// is redundant and goes away.
    Redundant { existing: Option<ItemMembership> },
    /// The write stands. `redundant_below` lists the account's memberships
    /// strictly below that it makes redundant, deepest first.
    Write {
        existing: Option<ItemMembership>,
        redundant_below: Vec<ItemMembership>,
    },
}

/// Membership queries and the rules keeping them consistent.
pub struct MembershipStore;

impl MembershipStore {
    pub async fn get(tx: &mut dyn Transaction, id: Uuid) -> Result<ItemMembership> {
        tx.membership(id).await?.ok_or(Error::MembershipNotFound(id))
    }

    /// The membership an account inherits at `path` from a strict ancestor.
    pub async fn inherited(
        tx: &mut dyn Transaction,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Option<ItemMembership>> {
        match path.parent() {
            Some(parent) => tx.closest_membership(account, &parent).await,
            None => Ok(None),
        }
    }

    /// The account's memberships strictly below `path`, deepest first.
    pub async fn below(
        tx: &mut dyn Transaction,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Vec<ItemMembership>> {
        let mut rows = tx.memberships_by_path_prefix(path, Some(account)).await?;
        rows.retain(|m| &m.item_path != path);
        sort_deepest_first(&mut rows);
        Ok(rows)
    }

    /// For every account with access at `path`, the membership that grants it.
    pub async fn effective_at(
        tx: &mut dyn Transaction,
        path: &ItemPath,
    ) -> Result<Vec<ItemMembership>> {
        let mut by_account = BTreeMap::new();
        // shallow to deep, so deeper grants overwrite
        for m in tx.memberships_covering(path).await? {
            by_account.insert(m.account_id, m);
        }
        let mut out: Vec<ItemMembership> = by_account.into_values().collect();
        out.sort_by(|a, b| (&a.item_path, a.created_at).cmp(&(&b.item_path, b.created_at)));
        Ok(out)
    }

    /// Applies the consistency rules to a prospective write of `permission`
    /// for `account` at `path`.
    ///
    /// Fails with [`Error::InvalidPermissionLevel`] when the write is weaker
    /// than what the account inherits, and with [`Error::TooManyMemberships`]
    /// when it would prune more than `limit` rows below.
    pub async fn plan_write(
        tx: &mut dyn Transaction,
        account: Uuid,
        path: &ItemPath,
        permission: PermissionLevel,
        limit: usize,
    ) -> Result<WritePlan> {
        let existing = tx.membership_at(account, path).await?;

        if let Some(inherited) = Self::inherited(tx, account, path).await? {
            if permission == inherited.permission {
                return Ok(WritePlan::Redundant { existing });
            }
            if permission < inherited.permission {
                return Err(Error::InvalidPermissionLevel(format!(
                    "{} is weaker than the {} inherited from {}",
                    permission,
                    inherited.permission,
                    inherited.item_id()
                )));
            }
        }

        let mut redundant_below = Self::below(tx, account, path).await?;
        redundant_below.retain(|m| m.permission <= permission);
        ensure_within(redundant_below.len(), limit)?;

        Ok(WritePlan::Write {
            existing,
            redundant_below,
        })
    }
}

pub(crate) fn ensure_within(count: usize, limit: usize) -> Result<()> {
    if count > limit {
        return Err(Error::TooManyMemberships { count, limit });
    }
    Ok(())
}

pub(crate) fn sort_deepest_first(rows: &mut [ItemMembership]) {
    rows.sort_by(|a, b| {
        (Reverse(a.item_path.levels()), &a.item_path).cmp(&(Reverse(b.item_path.levels()), &b.item_path))
    });
}
