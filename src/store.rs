use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::PanelConfig;
use crate::models::StatusDocument;

/// Shared handle to the latest readings.
///
/// The prober is the only writer; the display takes snapshots. Every update
/// runs under the write lock, so a snapshot is always either entirely before
/// or entirely after a probe cycle.
#[derive(Debug, Clone)]
pub struct StatusStore {
    inner: Arc<RwLock<StatusDocument>>,
}

impl StatusStore {
    pub fn new(doc: StatusDocument) -> Self {
        Self {
            inner: Arc::new(RwLock::new(doc)),
        }
    }

    /// Loads the persisted document, falling back to the all-DOWN default on
    /// a missing file, unparseable content or a target set that no longer
    /// matches the configuration.
    pub fn load_or_default(config: &PanelConfig) -> Self {
        let path = &config.state_file;
        let doc = match load_document(path, config) {
            Ok(doc) => {
                info!("Restored panel state from {}", path.display());
                doc
            }
            Err(e) => {
                warn!("Using default panel state: {:#}", e);
                StatusDocument::default_for(config)
            }
        };
        Self::new(doc)
    }

    /// Applies one cycle's worth of changes while holding the write lock.
    pub async fn apply_update<F, T>(&self, mutate: F) -> T
    where
        F: FnOnce(&mut StatusDocument) -> T,
    {
        let mut doc = self.inner.write().await;
        mutate(&mut doc)
    }

    pub async fn snapshot(&self) -> StatusDocument {
        self.inner.read().await.clone()
    }

    /// Writes the current document to `path` through a temporary file in the
    /// same directory followed by a rename.
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let json = self.snapshot().await.to_json().context("Failed to encode panel state")?;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
            .await
            .context("Persist task panicked")?
    }
}

fn load_document(path: &Path, config: &PanelConfig) -> Result<StatusDocument> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut doc = StatusDocument::from_json(&text, &config.gate.name)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    anyhow::ensure!(
        doc.matches(config),
        "{} tracks a different set of targets than the configuration",
        path.display()
    );
    doc.refresh_addresses(config);
    Ok(doc)
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(contents).context("Failed to write panel state")?;
    tmp.as_file().sync_all().context("Failed to sync panel state")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CycleOutcome, SpeedSample, Status};

    fn config_in(dir: &Path) -> PanelConfig {
        PanelConfig {
            state_file: dir.join("pi_monitor.json"),
            ..PanelConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = StatusStore::load_or_default(&config);
        assert_eq!(store.snapshot().await, StatusDocument::default_for(&config));
    }

    #[tokio::test]
    async fn invalid_json_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        std::fs::write(&config.state_file, "{\"INTERNET\": {\"IP\": ").unwrap();

        let doc = StatusStore::load_or_default(&config).snapshot().await;
        assert_eq!(doc, StatusDocument::default_for(&config));
        assert!(!doc.link_up());
    }

    #[tokio::test]
    async fn persisted_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = StatusStore::load_or_default(&config);
        store
            .apply_update(|doc| {
                CycleOutcome {
                    gate: Status::Up,
                    services: vec![("PLEX".into(), Status::Up)],
                    speed: Some(SpeedSample::from_bits_per_second(100_000_000.0, 20_000_000.0)),
                }
                .apply_to(doc)
            })
            .await;
        store.persist(&config.state_file).await.unwrap();

        let reloaded = StatusStore::load_or_default(&config).snapshot().await;
        assert_eq!(reloaded, store.snapshot().await);
        assert_eq!(reloaded.speed(), SpeedSample { download: 12.5, upload: 2.5 });
    }

    #[tokio::test]
    async fn persist_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = StatusStore::load_or_default(&config);
        store.persist(&config.state_file).await.unwrap();
        store.persist(&config.state_file).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("pi_monitor.json")]);
    }

    #[tokio::test]
    async fn reconfigured_targets_reset_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let store = StatusStore::load_or_default(&config);
        store.apply_update(|doc| doc.gate.status = Status::Up).await;
        store.persist(&config.state_file).await.unwrap();

        let mut changed = config.clone();
        changed.services.pop();
        let doc = StatusStore::load_or_default(&changed).snapshot().await;
        assert_eq!(doc, StatusDocument::default_for(&changed));
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_updates() {
        let store = StatusStore::new(StatusDocument::default_for(&PanelConfig::default()));
        let before = store.snapshot().await;
        store.apply_update(|doc| doc.gate.status = Status::Up).await;
        assert!(!before.link_up());
        assert!(store.snapshot().await.link_up());
    }
}
