//! In-process backend.
//!
//! A transaction holds the table lock from `begin` until it commits or rolls
//! back, so transactions are serialized. Writes are applied in place and
//! recorded in an undo log; rollback (explicit, to a savepoint, or on drop)
//! replays the log backwards. With a journal, every commit is appended to
//! disk before the lock is released.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::journal::{Journal, JournalOp};
use super::{Backend, Item, ItemMembership, Transaction};
use crate::error::{Error, Result};
use crate::path::ItemPath;

#[derive(Default)]
struct Tables {
    items: HashMap<Uuid, Item>,
    item_paths: BTreeMap<ItemPath, Uuid>,
    memberships: HashMap<Uuid, ItemMembership>,
    /// path -> account -> membership id
    membership_paths: BTreeMap<ItemPath, BTreeMap<Uuid, Uuid>>,
}

fn subtree<'a, V>(
    index: &'a BTreeMap<ItemPath, V>,
    prefix: &ItemPath,
) -> impl Iterator<Item = (&'a ItemPath, &'a V)> {
    let end = prefix.range_end();
    index
        .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Excluded(end.as_str())))
        .collect::<Vec<_>>()
        .into_iter()
}

impl Tables {
    fn put_item(&mut self, item: Item) -> Option<Item> {
        let prev = self.remove_item(item.id);
        self.item_paths.insert(item.path.clone(), item.id);
        self.items.insert(item.id, item);
        prev
    }

    fn remove_item(&mut self, id: Uuid) -> Option<Item> {
        let prev = self.items.remove(&id)?;
        if self.item_paths.get(&prev.path) == Some(&id) {
            self.item_paths.remove(&prev.path);
        }
        Some(prev)
    }

    fn put_membership(&mut self, membership: ItemMembership) -> Option<ItemMembership> {
        let prev = self.remove_membership(membership.id);
        self.membership_paths
            .entry(membership.item_path.clone())
            .or_default()
            .insert(membership.account_id, membership.id);
        self.memberships.insert(membership.id, membership);
        prev
    }

    fn remove_membership(&mut self, id: Uuid) -> Option<ItemMembership> {
        let prev = self.memberships.remove(&id)?;
        if let Some(accounts) = self.membership_paths.get_mut(&prev.item_path) {
            if accounts.get(&prev.account_id) == Some(&id) {
                accounts.remove(&prev.account_id);
            }
            if accounts.is_empty() {
                self.membership_paths.remove(&prev.item_path);
            }
        }
        Some(prev)
    }

    fn membership_id_at(&self, account: Uuid, path: &ItemPath) -> Option<Uuid> {
        self.membership_paths
            .get(path)
            .and_then(|accounts| accounts.get(&account))
            .copied()
    }

    fn apply(&mut self, op: JournalOp) {
        match op {
            JournalOp::PutItem { item } => {
                self.put_item(item);
            }
            JournalOp::DeleteItem { id } => {
                self.remove_item(id);
            }
            JournalOp::PutMembership { membership } => {
                self.put_membership(membership);
            }
            JournalOp::DeleteMembership { id } => {
                self.remove_membership(id);
            }
        }
    }

    fn revert(&mut self, undo: Undo) {
        match undo {
            Undo::Item(id, Some(prev)) => {
                self.remove_item(id);
                self.put_item(prev);
            }
            Undo::Item(id, None) => {
                self.remove_item(id);
            }
            Undo::Membership(id, Some(prev)) => {
                self.remove_membership(id);
                self.put_membership(prev);
            }
            Undo::Membership(id, None) => {
                self.remove_membership(id);
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        let mut items: Vec<Item> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        let mut memberships: Vec<ItemMembership> = self.memberships.values().cloned().collect();
        memberships.sort_by(|a, b| (&a.item_path, a.account_id).cmp(&(&b.item_path, b.account_id)));
        Snapshot { items, memberships }
    }
}

/// Prior state of a row touched by a transaction.
enum Undo {
    Item(Uuid, Option<Item>),
    Membership(Uuid, Option<ItemMembership>),
}

/// Every row of a backend, items by path and memberships by path then account.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub items: Vec<Item>,
    pub memberships: Vec<ItemMembership>,
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
    journal: Option<Arc<Journal>>,
}

impl MemoryBackend {
    /// A backend that keeps nothing on disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend journaled to `dir`, with the journal replayed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let (journal, entries) = Journal::open(dir)?;
        let mut tables = Tables::default();
        let replayed = entries.len();
        for entry in entries {
            for op in entry.ops {
                tables.apply(op);
            }
        }
        tracing::info!(
            journal = %journal.path().display(),
            entries = replayed,
            items = tables.items.len(),
            memberships = tables.memberships.len(),
            "Replayed journal"
        );
        Ok(Self {
            tables: Arc::new(Mutex::new(tables)),
            journal: Some(Arc::new(journal)),
        })
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.tables.lock().await.snapshot()
    }

    /// Rewrites the journal as a single snapshot of the current rows.
    pub async fn compact(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let tables = self.tables.lock().await;
        let snapshot = tables.snapshot();
        let ops: Vec<JournalOp> = snapshot
            .items
            .into_iter()
            .map(|item| JournalOp::PutItem { item })
            .chain(
                snapshot
                    .memberships
                    .into_iter()
                    .map(|membership| JournalOp::PutMembership { membership }),
            )
            .collect();
        let rows = ops.len();
        journal.rewrite(ops)?;
        tracing::info!(rows, "Compacted journal");
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            tables,
            undo: Vec::new(),
            savepoints: Vec::new(),
            journal: self.journal.clone(),
            finished: false,
        }))
    }
}

struct MemoryTransaction {
    tables: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
    savepoints: Vec<usize>,
    journal: Option<Arc<Journal>>,
    finished: bool,
}

impl MemoryTransaction {
    fn undo_to(&mut self, mark: usize) {
        while self.undo.len() > mark {
            if let Some(undo) = self.undo.pop() {
                self.tables.revert(undo);
            }
        }
    }

    /// Final state of every row this transaction touched, in first-touch order.
    fn journal_ops(&self) -> Vec<JournalOp> {
        let mut seen = HashSet::new();
        let mut ops = Vec::new();
        for undo in &self.undo {
            match undo {
                Undo::Item(id, _) => {
                    if seen.insert(*id) {
                        ops.push(match self.tables.items.get(id) {
                            Some(item) => JournalOp::PutItem { item: item.clone() },
                            None => JournalOp::DeleteItem { id: *id },
                        });
                    }
                }
                Undo::Membership(id, _) => {
                    if seen.insert(*id) {
                        ops.push(match self.tables.memberships.get(id) {
                            Some(m) => JournalOp::PutMembership {
                                membership: m.clone(),
                            },
                            None => JournalOp::DeleteMembership { id: *id },
                        });
                    }
                }
            }
        }
        ops
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.undo_to(0);
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn item(&mut self, id: Uuid) -> Result<Option<Item>> {
        Ok(self.tables.items.get(&id).cloned())
    }

    async fn item_at(&mut self, path: &ItemPath) -> Result<Option<Item>> {
        Ok(self
            .tables
            .item_paths
            .get(path)
            .and_then(|id| self.tables.items.get(id))
            .cloned())
    }

    async fn items_by_path_prefix(&mut self, prefix: &ItemPath) -> Result<Vec<Item>> {
        Ok(subtree(&self.tables.item_paths, prefix)
            .filter(|(path, _)| prefix.covers(path))
            .filter_map(|(_, id)| self.tables.items.get(id).cloned())
            .collect())
    }

    async fn insert_item(&mut self, item: &Item) -> Result<()> {
        if self.tables.items.contains_key(&item.id) || self.tables.item_paths.contains_key(&item.path) {
            return Err(Error::Storage(anyhow!("item {} already exists", item.id)));
        }
        self.tables.put_item(item.clone());
        self.undo.push(Undo::Item(item.id, None));
        Ok(())
    }

    async fn update_item(&mut self, item: &Item) -> Result<()> {
        if !self.tables.items.contains_key(&item.id) {
            return Err(Error::ItemNotFound(item.id));
        }
        if let Some(other) = self.tables.item_paths.get(&item.path) {
            if *other != item.id {
                return Err(Error::Storage(anyhow!("path {} is taken", item.path)));
            }
        }
        let prev = self.tables.put_item(item.clone());
        self.undo.push(Undo::Item(item.id, prev));
        Ok(())
    }

    async fn delete_item(&mut self, id: Uuid) -> Result<bool> {
        match self.tables.remove_item(id) {
            Some(prev) => {
                self.undo.push(Undo::Item(id, Some(prev)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn membership(&mut self, id: Uuid) -> Result<Option<ItemMembership>> {
        Ok(self.tables.memberships.get(&id).cloned())
    }

    async fn membership_at(
        &mut self,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Option<ItemMembership>> {
        Ok(self
            .tables
            .membership_id_at(account, path)
            .and_then(|id| self.tables.memberships.get(&id))
            .cloned())
    }

    async fn memberships_by_path_prefix(
        &mut self,
        prefix: &ItemPath,
        account: Option<Uuid>,
    ) -> Result<Vec<ItemMembership>> {
        let mut out = Vec::new();
        for (path, accounts) in subtree(&self.tables.membership_paths, prefix) {
            if !prefix.covers(path) {
                continue;
            }
            for (account_id, id) in accounts {
                if account.map_or(true, |a| a == *account_id) {
                    if let Some(m) = self.tables.memberships.get(id) {
                        out.push(m.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn memberships_covering(&mut self, path: &ItemPath) -> Result<Vec<ItemMembership>> {
        let mut out = Vec::new();
        for p in path.ancestors().iter().chain(std::iter::once(path)) {
            if let Some(accounts) = self.tables.membership_paths.get(p) {
                out.extend(
                    accounts
                        .values()
                        .filter_map(|id| self.tables.memberships.get(id))
                        .cloned(),
                );
            }
        }
        Ok(out)
    }

    async fn closest_membership(
        &mut self,
        account: Uuid,
        path: &ItemPath,
    ) -> Result<Option<ItemMembership>> {
        let mut current = Some(path.clone());
        while let Some(p) = current {
            if let Some(id) = self.tables.membership_id_at(account, &p) {
                return Ok(self.tables.memberships.get(&id).cloned());
            }
            current = p.parent();
        }
        Ok(None)
    }

    async fn memberships_of_account(&mut self, account: Uuid) -> Result<Vec<ItemMembership>> {
        let mut out: Vec<ItemMembership> = self
            .tables
            .memberships
            .values()
            .filter(|m| m.account_id == account)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.item_path.cmp(&b.item_path));
        Ok(out)
    }

    async fn insert_membership(&mut self, membership: &ItemMembership) -> Result<()> {
        if let Some(existing) = self
            .tables
            .membership_id_at(membership.account_id, &membership.item_path)
        {
            return Err(Error::ModifyExistingMembership(existing));
        }
        if self.tables.memberships.contains_key(&membership.id) {
            return Err(Error::Storage(anyhow!(
                "membership {} already exists",
                membership.id
            )));
        }
        self.tables.put_membership(membership.clone());
        self.undo.push(Undo::Membership(membership.id, None));
        Ok(())
    }

    async fn update_membership(&mut self, membership: &ItemMembership) -> Result<()> {
        if !self.tables.memberships.contains_key(&membership.id) {
            return Err(Error::MembershipNotFound(membership.id));
        }
        if let Some(other) = self
            .tables
            .membership_id_at(membership.account_id, &membership.item_path)
        {
            if other != membership.id {
                return Err(Error::ModifyExistingMembership(other));
            }
        }
        let prev = self.tables.put_membership(membership.clone());
        self.undo.push(Undo::Membership(membership.id, prev));
        Ok(())
    }

    async fn delete_membership(&mut self, id: Uuid) -> Result<bool> {
        match self.tables.remove_membership(id) {
            Some(prev) => {
                self.undo.push(Undo::Membership(id, Some(prev)));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn savepoint(&mut self) -> Result<()> {
        self.savepoints.push(self.undo.len());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> Result<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::Storage(anyhow!("no savepoint to release")))
    }

    async fn rollback_to_savepoint(&mut self) -> Result<()> {
        let mark = self
            .savepoints
            .pop()
            .ok_or_else(|| Error::Storage(anyhow!("no savepoint to roll back to")))?;
        self.undo_to(mark);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if let Some(journal) = this.journal.clone() {
            let ops = this.journal_ops();
            if !ops.is_empty() {
                if let Err(e) = journal.append(ops) {
                    this.undo_to(0);
                    this.finished = true;
                    return Err(Error::Storage(e.context("journal append failed")));
                }
            }
        }
        this.finished = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.undo_to(0);
        this.finished = true;
        Ok(())
    }
}
