use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Transaction;
use crate::error::{Error, Result};
use crate::path::ItemPath;

/// Kinds of items. Only folders can have children.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Folder,
    Document,
    File,
    Link,
    App,
    Shortcut,
    H5p,
    Etherpad,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Folder => "folder",
            ItemType::Document => "document",
            ItemType::File => "file",
            ItemType::Link => "link",
            ItemType::App => "app",
            ItemType::Shortcut => "shortcut",
            ItemType::H5p => "h5p",
            ItemType::Etherpad => "etherpad",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "folder" => ItemType::Folder,
            "document" => ItemType::Document,
            "file" => ItemType::File,
            "link" => ItemType::Link,
            "app" => ItemType::App,
            "shortcut" => ItemType::Shortcut,
            "h5p" => ItemType::H5p,
            "etherpad" => ItemType::Etherpad,
            other => anyhow::bail!("unknown item type '{}'", other),
        })
    }
}

/// A node of the item tree. The parent is implied by the path.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: Uuid,
    pub path: ItemPath,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub extra: serde_json::Value,
    pub creator_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(
        id: Uuid,
        path: ItemPath,
        name: impl Into<String>,
        item_type: ItemType,
        extra: serde_json::Value,
        creator_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            path,
            name: name.into(),
            item_type,
            extra,
            creator_id,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.path.parent_id()
    }

    pub fn is_folder(&self) -> bool {
        self.item_type == ItemType::Folder
    }
}

/// Input of item creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewItem {
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub extra: serde_json::Value,
    pub parent: Option<Uuid>,
}

impl NewItem {
    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            item_type: ItemType::Folder,
            extra: serde_json::Value::Null,
            parent: None,
        }
    }

    pub fn of_type(name: impl Into<String>, item_type: ItemType) -> Self {
        Self {
            item_type,
            ..Self::folder(name)
        }
    }

    pub fn under(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Fields an update may change. `None` leaves the field as is.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub extra: Option<serde_json::Value>,
}

impl ItemPatch {
    pub fn apply(&self, item: &mut Item) {
        if let Some(name) = &self.name {
            item.name = name.clone();
        }
        if let Some(extra) = &self.extra {
            item.extra = extra.clone();
        }
        item.updated_at = Utc::now();
    }
}

/// Tree queries over the items table.
pub struct ItemStore;

impl ItemStore {
    pub async fn get(tx: &mut dyn Transaction, id: Uuid) -> Result<Item> {
        tx.item(id).await?.ok_or(Error::ItemNotFound(id))
    }

    pub async fn get_at(tx: &mut dyn Transaction, path: &ItemPath) -> Result<Item> {
        tx.item_at(path)
            .await?
            .ok_or_else(|| Error::ItemNotFound(path.id()))
    }

    /// Strict descendants, parents before children.
    pub async fn descendants(tx: &mut dyn Transaction, item: &Item) -> Result<Vec<Item>> {
        let mut all = tx.items_by_path_prefix(&item.path).await?;
        all.retain(|i| i.id != item.id);
        Ok(all)
    }

    /// Strict descendants in safe deletion order: deepest first, then oldest
    /// first, then by path.
    pub async fn descendants_deepest_first(
        tx: &mut dyn Transaction,
        item: &Item,
    ) -> Result<Vec<Item>> {
        let mut all = Self::descendants(tx, item).await?;
        all.sort_by(|a, b| {
            (Reverse(a.path.levels()), a.created_at, &a.path).cmp(&(
                Reverse(b.path.levels()),
                b.created_at,
                &b.path,
            ))
        });
        Ok(all)
    }

    /// Direct children, oldest first.
    pub async fn children(tx: &mut dyn Transaction, item: &Item) -> Result<Vec<Item>> {
        let level = item.path.levels() + 1;
        let mut children: Vec<Item> = Self::descendants(tx, item)
            .await?
            .into_iter()
            .filter(|i| i.path.levels() == level)
            .collect();
        children.sort_by(|a, b| (a.created_at, &a.path).cmp(&(b.created_at, &b.path)));
        Ok(children)
    }

    pub async fn has_children(tx: &mut dyn Transaction, item: &Item) -> Result<bool> {
        Ok(tx.items_by_path_prefix(&item.path).await?.len() > 1)
    }

    /// Strict ancestors, root first.
    pub async fn ancestors(tx: &mut dyn Transaction, item: &Item) -> Result<Vec<Item>> {
        let mut out = Vec::new();
        for path in item.path.ancestors() {
            out.push(Self::get_at(tx, &path).await?);
        }
        Ok(out)
    }

    /// Levels of the deepest path in the subtree rooted at `item`.
    pub fn subtree_levels(item: &Item, descendants: &[Item]) -> usize {
        descendants
            .iter()
            .map(|d| d.path.levels())
            .chain(std::iter::once(item.path.levels()))
            .max()
            .unwrap_or(1)
    }
}
