//! Effective permissions.
//!
//! An account's permission on an item comes from its membership on the
//! closest item along the path, the item itself included. Nothing is
//! granted without a membership somewhere on the path.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::path::ItemPath;
use crate::permission::PermissionLevel;
use crate::storage::{Item, Transaction};

pub struct PermissionResolver;

impl PermissionResolver {
    pub async fn effective_permission(
        tx: &mut dyn Transaction,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Option<PermissionLevel>> {
        Ok(tx
            .closest_membership(account, path)
            .await?
            .map(|m| m.permission))
    }

    pub async fn has_permission(
        tx: &mut dyn Transaction,
        account: Uuid,
        path: &ItemPath,
        required: PermissionLevel,
    ) -> Result<bool> {
        Ok(Self::effective_permission(tx, account, path)
            .await?
            .is_some_and(|level| level.allows(required)))
    }

    /// Returns the account's level on `item`, or fails if it is below `required`.
    pub async fn require(
        tx: &mut dyn Transaction,
        account: Uuid,
        item: &Item,
        required: PermissionLevel,
    ) -> Result<PermissionLevel> {
        match Self::effective_permission(tx, account, &item.path).await? {
            Some(level) if level.allows(required) => Ok(level),
            held => {
                tracing::debug!(
                    %account,
                    item = %item.id,
                    ?held,
                    %required,
                    "Permission denied"
                );
                Err(Error::InsufficientPermission {
                    account,
                    item: item.id,
                    required,
                })
            }
        }
    }
}
