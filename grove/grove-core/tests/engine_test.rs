//! End-to-end tests for the task engine over a journal-backed store

use std::sync::Arc;

use anyhow::Result;
use grove_core::hooks::HookRegistry;
use grove_core::{
    CascadeMode, EngineConfig, Error, ItemType, MemoryBackend, NewItem, PermissionLevel,
    TaskEngine,
};
use tempfile::TempDir;
use uuid::Uuid;

fn engine_for(backend: &MemoryBackend, config: EngineConfig) -> TaskEngine {
    TaskEngine::new(Arc::new(backend.clone()), HookRegistry::new(), config)
}

#[tokio::test]
async fn test_share_then_delete_folder() -> Result<()> {
    let backend = MemoryBackend::new();
    let engine = engine_for(&backend, EngineConfig::default());
    let m = Uuid::new_v4();
    let n = Uuid::new_v4();

    let root = engine.create_item(m, NewItem::folder("root")).await?;
    let docs = engine
        .create_item(m, NewItem::folder("docs").under(root.id))
        .await?;
    // M already inherits admin, so no row is added for docs
    assert_eq!(backend.snapshot().await.memberships.len(), 1);

    engine
        .create_membership(m, docs.id, n, PermissionLevel::Write)
        .await?;
    let file = engine
        .create_item(m, NewItem::of_type("file", ItemType::File).under(docs.id))
        .await?;
    let sub = engine
        .create_item(m, NewItem::folder("sub").under(docs.id))
        .await?;
    engine
        .create_item(m, NewItem::of_type("note", ItemType::Document).under(sub.id))
        .await?;

    assert_eq!(
        engine.effective_permission(n, file.id).await?,
        Some(PermissionLevel::Write)
    );

    let result = engine.delete_item(m, docs.id).await?;
    assert!(result.is_complete());
    assert_eq!(result.completed.len(), 4);
    assert_eq!(result.completed_targets().last(), Some(&docs.id));

    let snapshot = backend.snapshot().await;
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.items[0].id, root.id);
    assert_eq!(snapshot.memberships.len(), 1);
    assert_eq!(snapshot.memberships[0].account_id, m);
    assert!(engine.shared_items(n).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_journal_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let owner = Uuid::new_v4();
    let guest = Uuid::new_v4();

    let (root, doc) = {
        let backend = MemoryBackend::open(dir.path())?;
        let engine = engine_for(&backend, EngineConfig::default());
        let root = engine.create_item(owner, NewItem::folder("root")).await?;
        let doc = engine
            .create_item(owner, NewItem::of_type("doc", ItemType::Document).under(root.id))
            .await?;
        engine
            .create_membership(owner, root.id, guest, PermissionLevel::Read)
            .await?;

        // a grant equal to the inherited one writes nothing
        let unchanged = engine
            .create_membership(owner, doc.id, guest, PermissionLevel::Read)
            .await;
        assert!(matches!(unchanged, Ok(None)));
        (root, doc)
    };

    let reopened = MemoryBackend::open(dir.path())?;
    let engine = engine_for(&reopened, EngineConfig::default());
    assert_eq!(engine.get_item(guest, doc.id).await?.name, "doc");
    assert_eq!(
        engine.effective_permission(guest, doc.id).await?,
        Some(PermissionLevel::Read)
    );

    let moved = engine.move_item(owner, doc.id, None).await?;
    assert!(moved.path.is_root());
    reopened.compact().await?;

    let compacted = MemoryBackend::open(dir.path())?;
    let snapshot = compacted.snapshot().await;
    assert_eq!(snapshot, reopened.snapshot().await);
    assert_eq!(snapshot.items.len(), 2);
    // guest kept read access on the moved document
    let engine = engine_for(&compacted, EngineConfig::default());
    assert_eq!(
        engine.effective_permission(guest, moved.id).await?,
        Some(PermissionLevel::Read)
    );
    assert_eq!(engine.get_children(owner, root.id).await?.len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_atomic_copy_from_env_config() -> Result<()> {
    let config = EngineConfig::from_lookup(|key| match key {
        "GROVE_CASCADE_MODE" => Some("atomic".to_string()),
        "GROVE_MAX_DESCENDANTS_FOR_COPY" => Some("2".to_string()),
        _ => None,
    })?;
    assert_eq!(config.cascade_mode, CascadeMode::Atomic);

    let backend = MemoryBackend::new();
    let engine = engine_for(&backend, config);
    let owner = Uuid::new_v4();
    let src = engine.create_item(owner, NewItem::folder("src")).await?;
    let inner = engine
        .create_item(owner, NewItem::folder("inner").under(src.id))
        .await?;
    engine
        .create_item(owner, NewItem::folder("leaf").under(inner.id))
        .await?;

    let result = engine.copy_item(owner, src.id, None).await?;
    assert!(result.is_complete());
    assert_eq!(result.completed.len(), 3);
    assert_eq!(backend.snapshot().await.items.len(), 6);

    engine
        .create_item(owner, NewItem::folder("extra").under(src.id))
        .await?;
    let err = engine.copy_item(owner, src.id, None).await.unwrap_err();
    assert!(matches!(err, Error::TooManyDescendants { count: 3, limit: 2, .. }));
    Ok(())
}
