use crate::config::parse::load_config;
use crate::storage::{CheckpointStore, DeadLetter, DuckDbStore};
use serde::Serialize;
use std::path::Path;

const DEAD_LETTER_PREVIEW: usize = 20;

#[derive(Serialize)]
struct CheckpointView {
    checkpoint: Option<crate::storage::Checkpoint>,
    recent_dead_letters: Vec<DeadLetter>,
}

fn open_store(config_path: &Path) -> Result<DuckDbStore, Box<dyn std::error::Error>> {
    let config = load_config(config_path)?;
    Ok(DuckDbStore::new(&config.checkpoint.path)?)
}

/// Print the stored checkpoint and the most recent dead letters as JSON
pub async fn show(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config_path)?;
    store.init_schema().await?;

    let view = CheckpointView {
        checkpoint: store.load_checkpoint().await?,
        recent_dead_letters: store.list_dead_letters(DEAD_LETTER_PREVIEW).await?,
    };
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

/// Forget the stored checkpoint; the next run starts from the source's beginning
pub async fn reset(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config_path)?;
    store.init_schema().await?;

    match store.load_checkpoint().await? {
        Some(checkpoint) => {
            store.clear_checkpoint().await?;
            println!(
                "Checkpoint cleared (was sequence {}, cursor {})",
                checkpoint.sequence,
                checkpoint.cursor.as_deref().unwrap_or("none")
            );
        }
        None => println!("No checkpoint stored"),
    }
    Ok(())
}
