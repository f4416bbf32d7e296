use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the sub-tasks of a decomposed operation are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CascadeMode {
    /// Each sub-task commits on its own. Work done before a failure stays.
    #[default]
    Partial,
    /// All sub-tasks share one transaction and commit or roll back together.
    Atomic,
}

impl std::str::FromStr for CascadeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "partial" => Ok(CascadeMode::Partial),
            "atomic" => Ok(CascadeMode::Atomic),
            other => Err(Error::Config(format!("unknown cascade mode '{}'", other))),
        }
    }
}

/// Engine limits and cascade behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_descendants_for_delete")]
    pub max_descendants_for_delete: usize,

    #[serde(default = "default_max_descendants_for_copy")]
    pub max_descendants_for_copy: usize,

    #[serde(default = "default_max_descendants_for_move")]
    pub max_descendants_for_move: usize,

    #[serde(default = "default_max_item_memberships_for_delete")]
    pub max_item_memberships_for_delete: usize,

    /// Labels allowed in a path, the root included.
    #[serde(default = "default_max_tree_levels")]
    pub max_tree_levels: usize,

    #[serde(default)]
    pub cascade_mode: CascadeMode,
}

fn default_max_descendants_for_delete() -> usize {
    5
}

fn default_max_descendants_for_copy() -> usize {
    20
}

fn default_max_descendants_for_move() -> usize {
    15
}

fn default_max_item_memberships_for_delete() -> usize {
    10
}

fn default_max_tree_levels() -> usize {
    15
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_descendants_for_delete: default_max_descendants_for_delete(),
            max_descendants_for_copy: default_max_descendants_for_copy(),
            max_descendants_for_move: default_max_descendants_for_move(),
            max_item_memberships_for_delete: default_max_item_memberships_for_delete(),
            max_tree_levels: default_max_tree_levels(),
            cascade_mode: CascadeMode::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `GROVE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        {
            let limits: [(&str, &mut usize); 5] = [
                (
                    "GROVE_MAX_DESCENDANTS_FOR_DELETE",
                    &mut config.max_descendants_for_delete,
                ),
                (
                    "GROVE_MAX_DESCENDANTS_FOR_COPY",
                    &mut config.max_descendants_for_copy,
                ),
                (
                    "GROVE_MAX_DESCENDANTS_FOR_MOVE",
                    &mut config.max_descendants_for_move,
                ),
                (
                    "GROVE_MAX_ITEM_MEMBERSHIPS_FOR_DELETE",
                    &mut config.max_item_memberships_for_delete,
                ),
                ("GROVE_MAX_TREE_LEVELS", &mut config.max_tree_levels),
            ];
            for (key, slot) in limits {
                if let Some(raw) = lookup(key) {
                    *slot = raw
                        .trim()
                        .parse()
                        .map_err(|_| Error::Config(format!("{} is not a number: '{}'", key, raw)))?;
                }
            }
        }
        if let Some(raw) = lookup("GROVE_CASCADE_MODE") {
            config.cascade_mode = raw.trim().parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_descendants_for_delete", self.max_descendants_for_delete),
            ("max_descendants_for_copy", self.max_descendants_for_copy),
            ("max_descendants_for_move", self.max_descendants_for_move),
            (
                "max_item_memberships_for_delete",
                self.max_item_memberships_for_delete,
            ),
            ("max_tree_levels", self.max_tree_levels),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(Error::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_descendants_for_delete, 5);
        assert_eq!(config.max_descendants_for_copy, 20);
        assert_eq!(config.max_descendants_for_move, 15);
        assert_eq!(config.max_item_memberships_for_delete, 10);
        assert_eq!(config.max_tree_levels, 15);
        assert_eq!(config.cascade_mode, CascadeMode::Partial);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GROVE_MAX_DESCENDANTS_FOR_DELETE", "50"),
            ("GROVE_CASCADE_MODE", "Atomic"),
        ]
        .into_iter()
        .collect();
        let config =
            EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.max_descendants_for_delete, 50);
        assert_eq!(config.max_descendants_for_copy, 20);
        assert_eq!(config.cascade_mode, CascadeMode::Atomic);
    }

    #[test]
    fn test_rejects_bad_values() {
        let bad_number = EngineConfig::from_lookup(|k| {
            (k == "GROVE_MAX_TREE_LEVELS").then(|| "deep".to_string())
        });
        assert!(matches!(bad_number, Err(Error::Config(_))));

        let zero = EngineConfig::from_lookup(|k| {
            (k == "GROVE_MAX_DESCENDANTS_FOR_COPY").then(|| "0".to_string())
        });
        assert!(matches!(zero, Err(Error::Config(_))));
    }

    #[test]
    fn test_json_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("grove.json");
        std::fs::write(&file, r#"{ "max_tree_levels": 4, "cascade_mode": "atomic" }"#).unwrap();

        let config = EngineConfig::from_json_file(&file).unwrap();
        assert_eq!(config.max_tree_levels, 4);
        assert_eq!(config.cascade_mode, CascadeMode::Atomic);
        assert_eq!(config.max_descendants_for_delete, 5);
    }
}
