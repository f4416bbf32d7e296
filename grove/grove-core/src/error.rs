use thiserror::Error;
use uuid::Uuid;

use crate::permission::PermissionLevel;
use crate::task::TaskKind;

/// Errors raised by the item tree, the membership rules and the task engine.
///
/// Authorization, capacity, not-found and structural variants are raised
/// before any mutation. `Hook` and `Storage` can also surface from a single
/// sub-task of a cascade, in which case they are reported inside a
/// [`crate::task::CascadeResult`] instead of being returned directly.
#[derive(Error, Debug)]
pub enum Error {
    // === Authorization ===
    #[error("account {account} needs {required} permission on item {item}")]
    InsufficientPermission {
        account: Uuid,
        item: Uuid,
        required: PermissionLevel,
    },

    #[error("invalid permission level: {0}")]
    InvalidPermissionLevel(String),

    // === Capacity guards ===
    #[error("item {item} has {count} descendants, limit is {limit}")]
    TooManyDescendants {
        item: Uuid,
        count: usize,
        limit: usize,
    },

    #[error("operation touches {count} memberships, limit is {limit}")]
    TooManyMemberships { count: usize, limit: usize },

    // === Not found ===
    #[error("item not found: {0}")]
    ItemNotFound(Uuid),

    #[error("membership not found: {0}")]
    MembershipNotFound(Uuid),

    // === Structural ===
    #[error("malformed item path: '{0}'")]
    InvalidPath(String),

    #[error("item {0} is not a folder")]
    ItemNotFolder(Uuid),

    #[error("item {item} cannot be moved under {target:?}")]
    InvalidMoveTarget { item: Uuid, target: Option<Uuid> },

    #[error("hierarchy of {levels} levels exceeds the limit of {limit}")]
    HierarchyTooDeep { levels: usize, limit: usize },

    #[error("membership {0} already exists, update it instead")]
    ModifyExistingMembership(Uuid),

    #[error("item {0} still has children")]
    ItemHasChildren(Uuid),

    // === Collaborators ===
    #[error("{kind} hook failed: {source}")]
    Hook {
        kind: TaskKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the kinds of error a task is refused with while it is being
    /// checked and planned. Returned as the `Err` of `TaskEngine::run` they
    /// mean nothing was written. Inside `CascadeResult::failed_at` they only
    /// mean the failing sub-task wrote nothing: the sub-tasks before it
    /// stay committed.
    pub fn is_precheck(&self) -> bool {
        !matches!(
            self,
            Error::Hook { .. } | Error::Storage(_) | Error::ItemHasChildren(_)
        )
    }

    /// True for authorization failures.
    pub fn is_authorization(&self) -> bool {
        matches!(
            self,
            Error::InsufficientPermission { .. } | Error::InvalidPermissionLevel(_)
        )
    }

    /// True for the capacity guards.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Error::TooManyDescendants { .. } | Error::TooManyMemberships { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifies_errors() {
        let denied = Error::InsufficientPermission {
            account: Uuid::new_v4(),
            item: Uuid::new_v4(),
            required: PermissionLevel::Admin,
        };
        assert!(denied.is_authorization());
        assert!(denied.is_precheck());

        let guard = Error::TooManyMemberships { count: 11, limit: 10 };
        assert!(guard.is_capacity());
        assert!(guard.is_precheck());

        let hook = Error::Hook {
            kind: TaskKind::DeleteItem,
            source: anyhow::anyhow!("plugin offline"),
        };
        assert!(!hook.is_precheck());

        // a row that vanished is reported the same way whether it was found
        // missing while planning or by a later sub-task
        let missing = Error::ItemNotFound(Uuid::new_v4());
        assert!(missing.is_precheck());
        assert!(!missing.is_capacity());
        assert!(!Error::ItemHasChildren(Uuid::new_v4()).is_precheck());
        assert!(!Error::Storage(anyhow::anyhow!("disk full")).is_precheck());
        assert_eq!(hook.to_string(), "delete-item hook failed: plugin offline");
    }
}
