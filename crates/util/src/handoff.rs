//! Key/value handoff file consumed by downstream CI steps.
//!
//! Provisioning steps record small facts here (the discovered server
//! address, the Rancher project id) so later pipeline stages can pick them
//! up without re-deriving them. The file lives at `.corral/handoff.json`
//! unless `CORRAL_HANDOFF_PATH` points elsewhere.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::expand_tilde;

/// Environment variable allowing callers to override the handoff file path.
pub const HANDOFF_PATH_ENV: &str = "CORRAL_HANDOFF_PATH";

/// Default location relative to the working directory.
pub const DEFAULT_HANDOFF_PATH: &str = ".corral/handoff.json";

/// Key under which the Rancher server address is recorded.
pub const SERVER_ADDRESS_KEY: &str = "rancher_server_address";
/// Key under which the Rancher project id is recorded.
pub const PROJECT_ID_KEY: &str = "rancher_project_id";
/// Key under which the highest provisioned agent count is recorded.
pub const AGENT_COUNT_KEY: &str = "rancher_agent_count";

/// Error surfaced when reading or writing the handoff file fails.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("handoff serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One recorded value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffEntry {
    pub value: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HandoffPayload {
    #[serde(default)]
    entries: IndexMap<String, HandoffEntry>,
}

/// JSON-backed handoff store.
#[derive(Debug)]
pub struct HandoffStore {
    path: PathBuf,
    payload: Mutex<HandoffPayload>,
}

impl HandoffStore {
    /// Open the store at `path`, or at the default location when `None`.
    pub fn open(path: Option<PathBuf>) -> Result<Self, HandoffError> {
        let path = path.unwrap_or_else(default_handoff_path);
        let payload = load_payload(&path)?;
        Ok(Self {
            path,
            payload: Mutex::new(payload),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `value` under `key`, replacing any previous value, and flush.
    pub fn record(&self, key: &str, value: impl Into<String>) -> Result<(), HandoffError> {
        let mut payload = self.payload.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        payload.entries.insert(
            key.to_string(),
            HandoffEntry {
                value: value.into(),
                recorded_at: Utc::now(),
            },
        );
        debug!(key, path = %self.path.display(), "recorded handoff value");
        self.save_locked(&payload)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let payload = self.payload.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        payload.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Drop `key`; missing keys are not an error.
    pub fn forget(&self, key: &str) -> Result<(), HandoffError> {
        let mut payload = self.payload.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if payload.entries.shift_remove(key).is_some() {
            self.save_locked(&payload)?;
        }
        Ok(())
    }

    fn save_locked(&self, payload: &HandoffPayload) -> Result<(), HandoffError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| HandoffError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let data = serde_json::to_string_pretty(payload)?;
        fs::write(&self.path, data).map_err(|source| HandoffError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

fn default_handoff_path() -> PathBuf {
    if let Ok(path) = env::var(HANDOFF_PATH_ENV) {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return expand_tilde(trimmed);
        }
    }
    PathBuf::from(DEFAULT_HANDOFF_PATH)
}

fn load_payload(path: &Path) -> Result<HandoffPayload, HandoffError> {
    match fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(payload) => Ok(payload),
            Err(error) => {
                warn!(
                    path = %path.display(),
                    error = %error,
                    "Failed to parse handoff file; starting empty"
                );
                Ok(HandoffPayload::default())
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(HandoffPayload::default()),
        Err(source) => Err(HandoffError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
