//! Producer-side on-disk state: the registered producer id and the files
//! it serves. Written back after every mutation as indented JSON, mode
//! 0600 — the file maps public ids to private filesystem paths.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_STATE_FILE: &str = ".pinhole-producer-state.json";

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse state file {0}: {1}")]
    Parse(PathBuf, serde_json::Error),
    #[error("failed to write state file {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerState {
    #[serde(default)]
    pub producer_id: Option<Uuid>,
    /// Keyed by the file id's string form.
    #[serde(default)]
    pub files: HashMap<String, FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: Uuid,
    pub name: String,
    pub size: u64,
    pub file_path: PathBuf,
}

pub struct StateStore {
    path: PathBuf,
    state: ProducerState,
}

impl StateStore {
    /// Load state from `path`. A missing file is an empty state; anything
    /// else that goes wrong is the caller's to handle (the CLIs warn and
    /// continue with an empty store).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StateError::Parse(path.clone(), e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ProducerState::default(),
            Err(e) => return Err(StateError::Read(path.clone(), e)),
        };
        Ok(Self { path, state })
    }

    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: ProducerState::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn producer_id(&self) -> Option<Uuid> {
        self.state.producer_id
    }

    pub fn set_producer_id(&mut self, producer_id: Uuid) -> Result<(), StateError> {
        self.state.producer_id = Some(producer_id);
        self.save()
    }

    pub fn add_file(
        &mut self,
        file_id: Uuid,
        name: String,
        size: u64,
        file_path: PathBuf,
    ) -> Result<(), StateError> {
        self.state.files.insert(
            file_id.to_string(),
            FileEntry {
                file_id,
                name,
                size,
                file_path,
            },
        );
        self.save()
    }

    pub fn get_file(&self, file_id: Uuid) -> Option<&FileEntry> {
        self.state.files.get(&file_id.to_string())
    }

    pub fn files(&self) -> &HashMap<String, FileEntry> {
        &self.state.files
    }

    fn save(&self) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(&self.state)
            .map_err(|e| StateError::Parse(self.path.clone(), e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StateError::Write(self.path.clone(), e))?;
            }
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&self.path)
            .map_err(|e| StateError::Write(self.path.clone(), e))?;
        file.write_all(json.as_bytes())
            .map_err(|e| StateError::Write(self.path.clone(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("pinhole-state-test-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn missing_file_loads_empty() {
        let store = StateStore::open(temp_path("never-written.json")).unwrap();
        assert!(store.producer_id().is_none());
        assert!(store.files().is_empty());
    }

    #[test]
    fn mutations_persist_across_reopen() {
        let path = temp_path("round-trip.json");
        let producer_id = Uuid::new_v4();
        let file_id = Uuid::new_v4();

        let mut store = StateStore::open(&path).unwrap();
        store.set_producer_id(producer_id).unwrap();
        store
            .add_file(file_id, "a.bin".into(), 4096, "/data/a.bin".into())
            .unwrap();

        let reopened = StateStore::open(&path).unwrap();
        assert_eq!(reopened.producer_id(), Some(producer_id));
        let entry = reopened.get_file(file_id).unwrap();
        assert_eq!(entry.name, "a.bin");
        assert_eq!(entry.size, 4096);
        assert_eq!(entry.file_path, PathBuf::from("/data/a.bin"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn state_file_is_indented_json() {
        let path = temp_path("pretty.json");
        let mut store = StateStore::open(&path).unwrap();
        store.set_producer_id(Uuid::new_v4()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\n  \"producer_id\""));

        let _ = std::fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[test]
    fn state_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("private.json");
        let _ = std::fs::remove_file(&path);
        let mut store = StateStore::open(&path).unwrap();
        store.set_producer_id(Uuid::new_v4()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let _ = std::fs::remove_file(&path);
    }
}
