//! Command line front end for a journal-backed item tree.
//!
//! Every command runs as the account given with `--as` and prints its result
//! as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use grove_core::hooks::HookRegistry;
use grove_core::{
    CascadeResult, EngineConfig, ItemPatch, ItemType, MemoryBackend, NewItem, PermissionLevel,
    TaskEngine,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "grove")]
#[command(about = "Item trees with inherited permissions")]
struct Cli {
    /// Directory holding the journal
    #[arg(long, env = "GROVE_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// JSON file with engine limits; GROVE_* variables are used otherwise
    #[arg(long)]
    config: Option<PathBuf>,

    /// Account the command runs as
    #[arg(long = "as", env = "GROVE_ACCOUNT")]
    actor: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an item
    Create {
        name: String,

        #[arg(short = 't', long = "type", default_value = "folder")]
        item_type: ItemType,

        /// Parent folder; omitted for a top-level item
        #[arg(short, long)]
        parent: Option<Uuid>,

        /// Extra attributes as a JSON object
        #[arg(long)]
        extra: Option<String>,
    },

    /// Show an item
    Show { id: Uuid },

    /// List the children of a folder
    Children { id: Uuid },

    /// List every item below an item
    Descendants { id: Uuid },

    /// Rename an item or replace its extra attributes
    Update {
        id: Uuid,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        extra: Option<String>,
    },

    /// Delete an item and everything below it
    Delete { id: Uuid },

    /// Move an item under another folder, or to the top level
    Move {
        id: Uuid,

        #[arg(long)]
        to: Option<Uuid>,
    },

    /// Copy an item and everything below it
    Copy {
        id: Uuid,

        #[arg(long)]
        to: Option<Uuid>,
    },

    /// Grant an account access to an item
    Grant {
        item: Uuid,
        account: Uuid,
        permission: PermissionLevel,
    },

    /// Change the permission of a membership
    Regrant {
        membership: Uuid,
        permission: PermissionLevel,
    },

    /// Remove a membership
    Revoke {
        membership: Uuid,

        /// Also remove the account's memberships below the item
        #[arg(long)]
        purge_below: bool,
    },

    /// List the effective membership of each account on an item
    Members { item: Uuid },

    /// Show an account's effective permission on an item
    Permission { item: Uuid, account: Uuid },

    /// Top-level items shared with the account
    Shared,

    /// Rewrite the journal as a snapshot
    Compact,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let backend = MemoryBackend::open(&cli.data_dir)?;
    info!(data_dir = %cli.data_dir.display(), "Opened item store");

    if let Commands::Compact = cli.command {
        backend.compact().await?;
        info!("Journal compacted");
        return Ok(());
    }

    let actor = cli
        .actor
        .ok_or_else(|| anyhow::anyhow!("--as <ACCOUNT> is required"))?;
    let engine = TaskEngine::new(Arc::new(backend), HookRegistry::new(), config);
    run(&engine, actor, cli.command).await
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

async fn run(engine: &TaskEngine, actor: Uuid, command: Commands) -> Result<()> {
    match command {
        Commands::Create {
            name,
            item_type,
            parent,
            extra,
        } => {
            let mut new = NewItem::of_type(name, item_type);
            new.parent = parent;
            if let Some(extra) = extra {
                new.extra = serde_json::from_str(&extra)?;
            }
            print(&engine.create_item(actor, new).await?)
        }
        Commands::Show { id } => print(&engine.get_item(actor, id).await?),
        Commands::Children { id } => print(&engine.get_children(actor, id).await?),
        Commands::Descendants { id } => print(&engine.get_descendants(actor, id).await?),
        Commands::Update { id, name, extra } => {
            let patch = ItemPatch {
                name,
                extra: extra.as_deref().map(serde_json::from_str).transpose()?,
            };
            print(&engine.update_item(actor, id, patch).await?)
        }
        Commands::Delete { id } => report(engine.delete_item(actor, id).await?),
        Commands::Move { id, to } => print(&engine.move_item(actor, id, to).await?),
        Commands::Copy { id, to } => report(engine.copy_item(actor, id, to).await?),
        Commands::Grant {
            item,
            account,
            permission,
        } => print(
            &engine
                .create_membership(actor, item, account, permission)
                .await?,
        ),
        Commands::Regrant {
            membership,
            permission,
        } => report(engine.update_membership(actor, membership, permission).await?),
        Commands::Revoke {
            membership,
            purge_below,
        } => report(
            engine
                .delete_membership(actor, membership, purge_below)
                .await?,
        ),
        Commands::Members { item } => print(&engine.get_memberships(actor, item).await?),
        Commands::Permission { item, account } => {
            print(&engine.permission_of(actor, account, item).await?)
        }
        Commands::Shared => print(&engine.shared_items(actor).await?),
        Commands::Compact => Ok(()),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Report<'a> {
    task: String,
    status: String,
    completed: Vec<&'a grove_core::task::SubTaskOutcome>,
    failed_at: Option<FailureReport>,
    not_attempted: usize,
}

#[derive(Serialize)]
struct FailureReport {
    subtask: String,
    target: Uuid,
    error: String,
}

/// Prints a cascade and fails the command if it stopped partway.
fn report(result: CascadeResult) -> Result<()> {
    let failed_at = result.failed_at.as_ref().map(|f| FailureReport {
        subtask: format!("{} {}", f.id, f.kind),
        target: f.target,
        error: f.error.to_string(),
    });
    print(&Report {
        task: result.kind.to_string(),
        status: format!("{:?}", result.status).to_lowercase(),
        completed: result.completed.iter().collect(),
        failed_at,
        not_attempted: result.not_attempted(),
    })?;
    result.into_result()?;
    Ok(())
}
