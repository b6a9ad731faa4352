use crate::auth::SessionMarkers;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const STATE_VERSION: u8 = 1;

pub trait MarkerStore {
    fn load_markers(&self) -> Result<SessionMarkers>;
    fn save_markers(&self, markers: &SessionMarkers) -> Result<()>;
    fn clear_markers(&self) -> Result<()>;
}

/// JSON file store. The session marker is a bearer credential and is kept
/// XOR-obfuscated at rest; the selected instance id is stored as is.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    path: PathBuf,
    obfuscation_key: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedState {
    version: u8,
    session_id_obfuscated: Option<String>,
    selected_instance_id: Option<String>,
    saved_at: Option<DateTime<Utc>>,
}

impl FileMarkerStore {
    pub fn new(path: PathBuf, obfuscation_key: String) -> Self {
        Self {
            path,
            obfuscation_key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(&self) -> Result<PersistedState> {
        if !self.path.exists() {
            return Ok(PersistedState {
                version: STATE_VERSION,
                ..PersistedState::default()
            });
        }
        let bytes = fs::read(&self.path).context("read marker file failed")?;
        serde_json::from_slice::<PersistedState>(&bytes).context("decode marker file failed")
    }

    fn save_state(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create marker directory failed")?;
        }
        let data = serde_json::to_vec_pretty(state).context("encode marker file failed")?;
        fs::write(&self.path, data).context("write marker file failed")?;
        Ok(())
    }

    fn key(&self) -> &[u8] {
        if self.obfuscation_key.is_empty() {
            b"portal"
        } else {
            self.obfuscation_key.as_bytes()
        }
    }

    fn obfuscate(&self, plain: &str) -> String {
        let key = self.key();
        plain
            .as_bytes()
            .iter()
            .enumerate()
            .map(|(i, b)| format!("{:02x}", b ^ key[i % key.len()]))
            .collect()
    }

    fn deobfuscate(&self, encoded: &str) -> Result<String> {
        if !encoded.is_ascii() || !encoded.len().is_multiple_of(2) {
            anyhow::bail!("invalid obfuscated marker length");
        }
        let key = self.key();
        let raw = (0..encoded.len())
            .step_by(2)
            .enumerate()
            .map(|(i, idx)| {
                u8::from_str_radix(&encoded[idx..idx + 2], 16)
                    .map(|b| b ^ key[i % key.len()])
                    .context("invalid hex in obfuscated marker")
            })
            .collect::<Result<Vec<u8>>>()?;
        String::from_utf8(raw).context("invalid utf8 marker")
    }
}

impl MarkerStore for FileMarkerStore {
    fn load_markers(&self) -> Result<SessionMarkers> {
        let state = self.load_state()?;
        let session_id = state
            .session_id_obfuscated
            .as_deref()
            .map(|encoded| self.deobfuscate(encoded))
            .transpose()?;
        Ok(SessionMarkers {
            session_id,
            selected_instance_id: state.selected_instance_id,
        })
    }

    fn save_markers(&self, markers: &SessionMarkers) -> Result<()> {
        self.save_state(&PersistedState {
            version: STATE_VERSION,
            session_id_obfuscated: markers.session_id.as_deref().map(|s| self.obfuscate(s)),
            selected_instance_id: markers.selected_instance_id.clone(),
            saved_at: Some(Utc::now()),
        })
    }

    fn clear_markers(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.save_markers(&SessionMarkers::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryMarkerStore {
    markers: Arc<Mutex<SessionMarkers>>,
}

impl MemoryMarkerStore {
    pub fn with_markers(markers: SessionMarkers) -> Self {
        Self {
            markers: Arc::new(Mutex::new(markers)),
        }
    }

    pub fn snapshot(&self) -> SessionMarkers {
        self.markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl MarkerStore for MemoryMarkerStore {
    fn load_markers(&self) -> Result<SessionMarkers> {
        Ok(self.snapshot())
    }

    fn save_markers(&self, markers: &SessionMarkers) -> Result<()> {
        *self
            .markers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = markers.clone();
        Ok(())
    }

    fn clear_markers(&self) -> Result<()> {
        self.save_markers(&SessionMarkers::default())
    }
}
