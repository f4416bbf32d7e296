//! Materialized item paths.
//!
//! Every item stores the ids of its ancestors and itself as one string, so
//! that "all descendants of X" is a string-prefix query. Each id becomes a
//! fixed-width label (the hyphenated uuid with `-` replaced by `_`) and labels
//! are joined with [`SEPARATOR`]. All slicing of path strings lives here.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

pub const SEPARATOR: char = '.';
const LABEL_LEN: usize = 36;

/// Position of an item in the tree, root label first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemPath(String);

/// Encodes an item id as a path label.
pub fn label_of(id: Uuid) -> String {
    id.hyphenated().to_string().replace('-', "_")
}

fn id_of_label(label: &str) -> Option<Uuid> {
    if label.len() != LABEL_LEN || label.contains('-') {
        return None;
    }
    Uuid::parse_str(&label.replace('_', "-")).ok()
}

impl ItemPath {
    /// Path of a root item.
    pub fn root(id: Uuid) -> Self {
        Self(label_of(id))
    }

    /// Builds a path from ancestor ids, root first, the item itself last.
    pub fn from_ids(ids: &[Uuid]) -> Result<Self> {
        if ids.is_empty() {
            return Err(Error::InvalidPath(String::new()));
        }
        let labels: Vec<String> = ids.iter().map(|id| label_of(*id)).collect();
        Ok(Self(labels.join(&SEPARATOR.to_string())))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() || raw.split(SEPARATOR).any(|l| id_of_label(l).is_none()) {
            return Err(Error::InvalidPath(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn labels(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    /// Ids on the path, root first.
    pub fn ids(&self) -> Vec<Uuid> {
        // labels were validated on construction
        self.labels().filter_map(id_of_label).collect()
    }

    /// Id of the item this path belongs to.
    pub fn id(&self) -> Uuid {
        let last = self.0.rsplit(SEPARATOR).next().unwrap_or_default();
        id_of_label(last).unwrap_or_default()
    }

    /// Number of labels, i.e. depth + 1.
    pub fn levels(&self) -> usize {
        self.labels().count()
    }

    /// Zero for root items.
    pub fn depth(&self) -> usize {
        self.levels() - 1
    }

    pub fn is_root(&self) -> bool {
        !self.0.contains(SEPARATOR)
    }

    pub fn parent(&self) -> Option<ItemPath> {
        self.0
            .rfind(SEPARATOR)
            .map(|idx| ItemPath(self.0[..idx].to_string()))
    }

    pub fn parent_id(&self) -> Option<Uuid> {
        self.parent().map(|p| p.id())
    }

    pub fn append_child(&self, child: Uuid) -> ItemPath {
        ItemPath(format!("{}{}{}", self.0, SEPARATOR, label_of(child)))
    }

    /// Strict: a path is not its own ancestor.
    pub fn is_ancestor_of(&self, other: &ItemPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0[self.0.len()..].starts_with(SEPARATOR)
    }

    pub fn is_descendant_of(&self, other: &ItemPath) -> bool {
        other.is_ancestor_of(self)
    }

    /// True if `other` is this path or below it.
    pub fn covers(&self, other: &ItemPath) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Strict ancestors, root first.
    pub fn ancestors(&self) -> Vec<ItemPath> {
        let mut out = Vec::with_capacity(self.depth());
        let mut current = self.parent();
        while let Some(path) = current {
            current = path.parent();
            out.push(path);
        }
        out.reverse();
        out
    }

    /// Replaces the `from` prefix of this path with `to`.
    pub fn rebase(&self, from: &ItemPath, to: &ItemPath) -> Result<ItemPath> {
        if self == from {
            return Ok(to.clone());
        }
        if !from.is_ancestor_of(self) {
            return Err(Error::InvalidPath(self.0.clone()));
        }
        Ok(ItemPath(format!("{}{}", to.0, &self.0[from.0.len()..])))
    }

    /// Exclusive upper bound for a range scan over this path and everything
    /// below it in a path-ordered index.
    pub(crate) fn range_end(&self) -> String {
        // '/' sorts directly after the separator
        format!("{}/", self.0)
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ItemPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ItemPath> for String {
    fn from(path: ItemPath) -> Self {
        path.0
    }
}

impl Borrow<str> for ItemPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> (Vec<Uuid>, ItemPath) {
        let ids: Vec<Uuid> = (0..n).map(|_| Uuid::new_v4()).collect();
        let path = ItemPath::from_ids(&ids).unwrap();
        (ids, path)
    }

    #[test]
    fn test_root_and_children() {
        let root_id = Uuid::new_v4();
        let root = ItemPath::root(root_id);
        assert!(root.is_root());
        assert_eq!(root.depth(), 0);
        assert_eq!(root.id(), root_id);
        assert!(root.parent().is_none());

        let child_id = Uuid::new_v4();
        let child = root.append_child(child_id);
        assert_eq!(child.levels(), 2);
        assert_eq!(child.id(), child_id);
        assert_eq!(child.parent(), Some(root.clone()));
        assert_eq!(child.parent_id(), Some(root_id));
        assert_eq!(child.ids(), vec![root_id, child_id]);
    }

    #[test]
    fn test_labels_have_no_hyphens() {
        let id = Uuid::new_v4();
        let label = label_of(id);
        assert_eq!(label.len(), 36);
        assert!(!label.contains('-'));
        assert_eq!(ItemPath::root(id).as_str(), label);
    }

    #[test]
    fn test_ancestry_is_strict() {
        let (_, path) = chain(3);
        let parent = path.parent().unwrap();
        let grand = parent.parent().unwrap();

        assert!(grand.is_ancestor_of(&path));
        assert!(parent.is_ancestor_of(&path));
        assert!(!path.is_ancestor_of(&path));
        assert!(path.is_descendant_of(&grand));
        assert!(!grand.is_descendant_of(&path));
        assert!(path.covers(&path));
        assert_eq!(path.ancestors(), vec![grand, parent]);
    }

    #[test]
    fn test_siblings_are_unrelated() {
        let root = ItemPath::root(Uuid::new_v4());
        let a = root.append_child(Uuid::new_v4());
        let b = root.append_child(Uuid::new_v4());
        assert!(!a.is_ancestor_of(&b));
        assert!(!b.is_ancestor_of(&a));
    }

    #[test]
    fn test_rejects_malformed_paths() {
        assert!(matches!(ItemPath::parse(""), Err(Error::InvalidPath(_))));
        assert!(ItemPath::parse("abc").is_err());
        let id = Uuid::new_v4();
        assert!(ItemPath::parse(&id.to_string()).is_err());
        let good = ItemPath::root(id);
        assert!(ItemPath::parse(&format!("{}.", good)).is_err());
        assert!(ItemPath::parse(&format!("{}..{}", good, good)).is_err());
        assert_eq!(ItemPath::parse(good.as_str()).unwrap(), good);
        assert!(ItemPath::from_ids(&[]).is_err());
    }

    #[test]
    fn test_rebases_subtree() {
        let (_, moved) = chain(2);
        let leaf = moved.append_child(Uuid::new_v4());
        let target = ItemPath::root(Uuid::new_v4()).append_child(moved.id());

        let rebased = leaf.rebase(&moved, &target).unwrap();
        assert_eq!(rebased.parent(), Some(target.clone()));
        assert_eq!(rebased.id(), leaf.id());
        assert_eq!(moved.rebase(&moved, &target).unwrap(), target);

        let unrelated = ItemPath::root(Uuid::new_v4());
        assert!(unrelated.rebase(&moved, &target).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let (_, path) = chain(2);
        let json = serde_json::to_string(&path).unwrap();
        let back: ItemPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
        assert!(serde_json::from_str::<ItemPath>("\"nope\"").is_err());
    }
}
