//! Durable home of the [`AgentState`].
//!
//! Layout under the data directory:
//!
//! ```text
//! state.json                 current record, replaced atomically
//! snapshots/
//!   snapshot-<utc>-<step>-<id>.json   one per planned iteration, never rewritten
//!   snapshot-<utc>-<step>-<id>.png    optional screenshot for the same iteration
//! ```
//!
//! Snapshot names sort chronologically, so an external retention sweep can
//! delete the oldest entries without coordinating with the agent.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent_engine::state::AgentState;
use crate::errors::{DeskError, DeskResult};
use crate::executor::ActionPlan;
use crate::perception::types::{Observation, ObservationRef};

const STATE_FILE: &str = "state.json";
const SNAPSHOT_DIR: &str = "snapshots";
const SNAPSHOT_PREFIX: &str = "snapshot-";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: uuid::Uuid,
    pub taken_at: DateTime<Utc>,
    pub state: AgentState,
    pub observation: Option<ObservationRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<ActionPlan>,
}

pub struct StateStore {
    state_path: PathBuf,
    snapshot_dir: PathBuf,
    emotion_dims: usize,
}

fn persistence(context: &str, path: &Path, e: impl std::fmt::Display) -> DeskError {
    DeskError::Persistence(format!("{context} {}: {e}", path.display()))
}

impl StateStore {
    pub fn new(data_dir: &Path, emotion_dims: usize) -> Self {
        Self {
            state_path: data_dir.join(STATE_FILE),
            snapshot_dir: data_dir.join(SNAPSHOT_DIR),
            emotion_dims,
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub(crate) fn temp_path(&self) -> PathBuf {
        self.state_path.with_extension("json.tmp")
    }

    /// Reads the current record, or a fresh default if there is none.
    ///
    /// An unreadable file is moved aside (`state.json.corrupt-<ts>`) rather
    /// than silently overwritten by the next save.
    pub fn load(&self) -> DeskResult<AgentState> {
        let content = match fs::read_to_string(&self.state_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.state_path.display(), "no saved state, starting fresh");
                return Ok(AgentState::new(self.emotion_dims));
            }
            Err(e) => return Err(persistence("failed to read", &self.state_path, e)),
        };

        match serde_json::from_str::<AgentState>(&content) {
            Ok(mut state) => {
                if state.emotion_vector.dims() != self.emotion_dims {
                    tracing::warn!(
                        saved = state.emotion_vector.dims(),
                        configured = self.emotion_dims,
                        "emotion vector resized to configured dimensionality"
                    );
                }
                state.emotion_vector.fit(self.emotion_dims);
                tracing::info!(
                    path = %self.state_path.display(),
                    status = %state.status,
                    steps = state.step_count,
                    "state loaded"
                );
                Ok(state)
            }
            Err(e) => {
                let aside = self
                    .state_path
                    .with_extension(format!("json.corrupt-{}", Utc::now().format("%Y%m%dT%H%M%SZ")));
                tracing::error!(error = %e, moved_to = %aside.display(), "saved state unreadable, starting fresh");
                fs::rename(&self.state_path, &aside)
                    .map_err(|e| persistence("failed to move aside", &self.state_path, e))?;
                Ok(AgentState::new(self.emotion_dims))
            }
        }
    }

    /// Writes to a sibling temp file, fsyncs, then renames over `state.json`.
    /// Readers see either the previous record or the new one, never a mix.
    pub fn save(&self, state: &AgentState) -> DeskResult<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(|e| persistence("failed to create", parent, e))?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp).map_err(|e| persistence("failed to create", &tmp, e))?;
            file.write_all(&json)
                .and_then(|_| file.sync_all())
                .map_err(|e| persistence("failed to write", &tmp, e))?;
        }
        fs::rename(&tmp, &self.state_path)
            .map_err(|e| persistence("failed to replace", &self.state_path, e))?;
        tracing::debug!(path = %self.state_path.display(), steps = state.step_count, "state saved");
        Ok(())
    }

    /// Appends an immutable snapshot. With `keep_image`, the observation's PNG
    /// is written next to it and referenced from the snapshot.
    pub fn snapshot(
        &self,
        state: &AgentState,
        observation: Option<&Observation>,
        plan: Option<&ActionPlan>,
        keep_image: bool,
    ) -> DeskResult<PathBuf> {
        fs::create_dir_all(&self.snapshot_dir)
            .map_err(|e| persistence("failed to create", &self.snapshot_dir, e))?;

        let id = uuid::Uuid::new_v4();
        let taken_at = Utc::now();
        let stem = format!(
            "{SNAPSHOT_PREFIX}{}-{:010}-{}",
            taken_at.format("%Y%m%dT%H%M%S%.6fZ"),
            state.step_count,
            &id.simple().to_string()[..8]
        );

        let image_path = match observation {
            Some(obs) if keep_image => {
                let path = self.snapshot_dir.join(format!("{stem}.png"));
                fs::write(&path, obs.to_png()?).map_err(|e| persistence("failed to write", &path, e))?;
                Some(path)
            }
            _ => None,
        };

        let snapshot = Snapshot {
            id,
            taken_at,
            state: state.clone(),
            observation: observation.map(|o| o.reference(image_path)),
            plan: plan.cloned(),
        };

        let path = self.snapshot_dir.join(format!("{stem}.json"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| persistence("refusing to overwrite snapshot", &path, e))?;
        file.write_all(&serde_json::to_vec_pretty(&snapshot)?)
            .map_err(|e| persistence("failed to write", &path, e))?;
        tracing::debug!(path = %path.display(), "snapshot written");
        Ok(path)
    }

    /// Snapshot files, oldest first.
    pub fn list_snapshots(&self) -> DeskResult<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.snapshot_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SNAPSHOT_PREFIX) && n.ends_with(".json"))
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    pub fn read_snapshot(&self, path: &Path) -> DeskResult<Snapshot> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Deletes all but the newest `keep` snapshots (and their images).
    /// Returns how many snapshots were removed. Files that vanish underneath
    /// (another retention sweep) count as pruned.
    pub fn prune_snapshots(&self, keep: usize) -> DeskResult<usize> {
        let all = self.list_snapshots()?;
        let excess = all.len().saturating_sub(keep);
        for path in &all[..excess] {
            remove_snapshot(path)?;
        }
        if excess > 0 {
            tracing::info!(removed = excess, kept = keep, "snapshots pruned");
        }
        Ok(excess)
    }
}

/// Removes a snapshot record and its image. Returns whether the record was
/// still there.
fn remove_snapshot(path: &Path) -> DeskResult<bool> {
    let existed = remove_if_present(path)?;
    remove_if_present(&path.with_extension("png"))?;
    Ok(existed)
}

fn remove_if_present(path: &Path) -> DeskResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(persistence("failed to remove", path, e)),
    }
}
