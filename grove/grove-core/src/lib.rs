//! Item trees with inherited permissions and cascading operations.
//!
//! Items form a forest addressed by materialized paths. Access is granted by
//! memberships that apply to an item and everything below it, with the
//! closest membership on the path deciding. Structural operations go through
//! the [`TaskEngine`], which checks permissions and capacity limits up front
//! and splits subtree-wide work into ordered single-row sub-tasks.

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod path;
pub mod permission;
pub mod storage;
pub mod task;

pub use config::{CascadeMode, EngineConfig};
pub use error::{Error, Result};
pub use path::ItemPath;
pub use permission::PermissionLevel;
pub use storage::{Item, ItemMembership, ItemPatch, ItemType, MemoryBackend, NewItem};
pub use task::{CascadeResult, Task, TaskEngine, TaskKind, TaskOutput, TaskStatus};
