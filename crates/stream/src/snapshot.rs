//! JSON persistence for [`InMemoryBroker`] state.
//!
//! Lets a short-lived process (the `rill` binary) keep streams, dedup state
//! and consumer offsets between invocations.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::broker::{BrokerSnapshot, InMemoryBroker};
use crate::error::Result;

/// Load a broker from `path`. A missing file yields an empty broker.
///
/// # Errors
/// Returns `Error::Io` when the file cannot be read and
/// `Error::Serialization` when it is not a valid snapshot.
pub async fn load(path: &Path) -> Result<InMemoryBroker> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(InMemoryBroker::new());
        }
        Err(e) => return Err(e.into()),
    };

    let snapshot: BrokerSnapshot = serde_json::from_str(&content)?;
    tracing::debug!(
        path = %path.display(),
        streams = snapshot.streams.len(),
        "Loaded broker snapshot"
    );
    Ok(InMemoryBroker::from_snapshot(snapshot))
}

/// Write the broker state to `path`, replacing any previous snapshot.
///
/// The file is written next to its destination first and then renamed, so a
/// reader never observes a partial snapshot.
///
/// # Errors
/// Returns `Error::Io` on filesystem failures.
pub async fn save(broker: &InMemoryBroker, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let snapshot = broker.snapshot().await;
    let json = serde_json::to_vec_pretty(&snapshot)?;

    let staging = staging_path(path);
    tokio::fs::write(&staging, json).await?;
    if let Err(e) = tokio::fs::rename(&staging, path).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e.into());
    }

    tracing::debug!(path = %path.display(), "Saved broker snapshot");
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
