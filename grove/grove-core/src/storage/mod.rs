//! Persistence seam for items and memberships.
//!
//! The engine only talks to a [`Backend`] through the [`Transaction`] rows
//! operations below. [`MemoryBackend`] is the bundled implementation, with an
//! optional on-disk journal.

pub mod item;
pub mod journal;
pub mod membership;
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::path::ItemPath;

pub use item::{Item, ItemPatch, ItemStore, ItemType, NewItem};
pub use membership::{ItemMembership, MembershipStore, WritePlan};
pub use memory::{MemoryBackend, Snapshot};

/// Opens transactions. A backend must give each transaction a consistent
/// view and make its writes visible to others only on commit.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// Row-level operations inside one transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    // === Items ===
    async fn item(&mut self, id: Uuid) -> Result<Option<Item>>;

    async fn item_at(&mut self, path: &ItemPath) -> Result<Option<Item>>;

    /// The item at `prefix` and everything below it, ordered by path.
    async fn items_by_path_prefix(&mut self, prefix: &ItemPath) -> Result<Vec<Item>>;

    async fn insert_item(&mut self, item: &Item) -> Result<()>;

    /// Replaces the row with the same id. The path may change.
    async fn update_item(&mut self, item: &Item) -> Result<()>;

    async fn delete_item(&mut self, id: Uuid) -> Result<bool>;

    // === Memberships ===
    async fn membership(&mut self, id: Uuid) -> Result<Option<ItemMembership>>;

    async fn membership_at(
        &mut self,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Option<ItemMembership>>;

    /// Memberships on `prefix` and below, ordered by path. Restricted to one
    /// account when `account` is set.
    async fn memberships_by_path_prefix(
        &mut self,
        prefix: &ItemPath,
        account: Option<Uuid>,
    ) -> Result<Vec<ItemMembership>>;

    /// Memberships of every account on `path` and its ancestors, ordered by path.
    async fn memberships_covering(&mut self, path: &ItemPath) -> Result<Vec<ItemMembership>>;

    /// The account's membership on `path` or its deepest ancestor that has one.
    async fn closest_membership(
        &mut self,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Option<ItemMembership>>;

    async fn memberships_of_account(&mut self, account: Uuid) -> Result<Vec<ItemMembership>>;

    /// Fails if the account already has a membership on the same path.
    async fn insert_membership(&mut self, membership: &ItemMembership) -> Result<()>;

    async fn update_membership(&mut self, membership: &ItemMembership) -> Result<()>;

    async fn delete_membership(&mut self, id: Uuid) -> Result<bool>;

    // === Control ===
    async fn savepoint(&mut self) -> Result<()>;

    async fn release_savepoint(&mut self) -> Result<()>;

    async fn rollback_to_savepoint(&mut self) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
