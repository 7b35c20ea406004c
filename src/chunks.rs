//! Chunk scheduling: partitions the transformation window into ordered,
//! non-overlapping chunks and tracks per-chunk completion in a durable
//! progress artifact so a run can resume from an arbitrary index.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{TimeWindow, MINUTE_MS};

/// Progress artifact format version.
const ARTIFACT_VERSION: u32 = 1;

/// Processing state of one chunk.
///
/// Legal transitions: `Pending → InProgress → Completed | Failed`. A
/// `Failed` chunk is never retried automatically; the operator re-invokes
/// the run from the failed index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One unit of transformation work: a half-open time interval plus its
/// position in the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub window: TimeWindow,
}

/// Partition of the full transformation window into equal-width chunks.
/// Chunks are contiguous, non-overlapping, and their union is the window.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlan {
    window: TimeWindow,
    chunk_width_ms: i64,
}

impl ChunkPlan {
    /// Creates a plan. The width must be positive, a whole number of
    /// minutes, and divide the window evenly so that the final chunk is
    /// not short. The window start must sit on the minute grid: a minute
    /// bucket straddling a chunk boundary would split one aggregation
    /// group across two chunks and break per-chunk range clearing.
    pub fn new(window: TimeWindow, chunk_width: Duration) -> Result<Self> {
        let chunk_width_ms = i64::try_from(chunk_width.as_millis())
            .ok()
            .filter(|ms| *ms > 0)
            .context("chunk width must be a positive number of milliseconds")?;

        if chunk_width_ms % MINUTE_MS != 0 {
            bail!(
                "chunk width {chunk_width_ms}ms must be a whole number of minutes \
                 so minute buckets never straddle a chunk boundary",
            );
        }
        if window.start_ms.rem_euclid(MINUTE_MS) != 0 {
            bail!(
                "window start {}ms is not minute-aligned",
                window.start_ms,
            );
        }
        if window.duration_ms() % chunk_width_ms != 0 {
            bail!(
                "chunk width {chunk_width_ms}ms does not evenly divide the {}ms window",
                window.duration_ms(),
            );
        }

        Ok(Self {
            window,
            chunk_width_ms,
        })
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn chunk_width_ms(&self) -> i64 {
        self.chunk_width_ms
    }

    /// Total number of chunks in the plan.
    pub fn chunk_count(&self) -> usize {
        (self.window.duration_ms() / self.chunk_width_ms) as usize
    }

    /// The chunk at `index`, if within the plan.
    pub fn chunk(&self, index: usize) -> Option<Chunk> {
        if index >= self.chunk_count() {
            return None;
        }
        let start_ms = self.window.start_ms + index as i64 * self.chunk_width_ms;
        Some(Chunk {
            index,
            window: TimeWindow {
                start_ms,
                end_ms: start_ms + self.chunk_width_ms,
            },
        })
    }

    /// All chunks from `start_index` onward, in processing order.
    pub fn chunks_from(&self, start_index: usize) -> impl Iterator<Item = Chunk> + '_ {
        (start_index..self.chunk_count()).filter_map(move |idx| self.chunk(idx))
    }
}

/// Durable record of `{chunk index → state}`.
///
/// Every state change is persisted before the call returns, so the artifact
/// on disk never claims a chunk is complete before its batch write was
/// acknowledged (the engine marks `Completed` strictly after the write).
#[derive(Debug)]
pub struct ChunkProgress {
    path: PathBuf,
    window: TimeWindow,
    chunk_width_ms: i64,
    states: Vec<ChunkState>,
}

/// On-disk representation of chunk progress.
#[derive(Debug, Serialize, Deserialize)]
struct ProgressArtifact {
    version: u32,
    window: TimeWindow,
    chunk_width_ms: i64,
    states: Vec<ChunkState>,
}

impl ChunkProgress {
    /// Creates a fresh progress record for `plan` with every chunk
    /// `Pending`, persisting it immediately.
    pub fn create(path: &Path, plan: &ChunkPlan) -> Result<Self> {
        let progress = Self {
            path: path.to_path_buf(),
            window: plan.window(),
            chunk_width_ms: plan.chunk_width_ms(),
            states: vec![ChunkState::Pending; plan.chunk_count()],
        };
        progress.persist()?;
        Ok(progress)
    }

    /// Loads existing progress for `plan`, or creates a fresh record if
    /// none exists. An existing artifact must describe the same window and
    /// chunk width; anything else means it belongs to a different run.
    pub fn load_or_create(path: &Path, plan: &ChunkPlan) -> Result<Self> {
        if !path.exists() {
            return Self::create(path, plan);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading chunk progress from {}", path.display()))?;
        let artifact: ProgressArtifact =
            serde_json::from_str(&data).context("parsing chunk progress artifact")?;

        if artifact.version != ARTIFACT_VERSION {
            bail!(
                "chunk progress version {} is not supported (expected {})",
                artifact.version,
                ARTIFACT_VERSION,
            );
        }
        if artifact.window != plan.window() || artifact.chunk_width_ms != plan.chunk_width_ms() {
            bail!(
                "chunk progress at {} was recorded for a different window or chunk width; \
                 remove it to start a fresh run",
                path.display(),
            );
        }
        if artifact.states.len() != plan.chunk_count() {
            bail!(
                "chunk progress has {} entries but the plan has {} chunks",
                artifact.states.len(),
                plan.chunk_count(),
            );
        }

        Ok(Self {
            path: path.to_path_buf(),
            window: artifact.window,
            chunk_width_ms: artifact.chunk_width_ms,
            states: artifact.states,
        })
    }

    /// State of the chunk at `index`.
    pub fn state(&self, index: usize) -> Option<ChunkState> {
        self.states.get(index).copied()
    }

    pub fn chunk_count(&self) -> usize {
        self.states.len()
    }

    /// Number of chunks already marked `Completed`.
    pub fn completed_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == ChunkState::Completed)
            .count()
    }

    /// Records a state transition and persists the artifact.
    pub fn mark(&mut self, index: usize, state: ChunkState) -> Result<()> {
        let current = self
            .states
            .get(index)
            .copied()
            .with_context(|| format!("chunk index {index} out of range"))?;

        let legal = matches!(
            (current, state),
            (ChunkState::Pending, ChunkState::InProgress)
                | (ChunkState::InProgress, ChunkState::Completed)
                | (ChunkState::InProgress, ChunkState::Failed)
        );
        if !legal {
            bail!("illegal chunk state transition for chunk {index}: {current:?} -> {state:?}");
        }

        self.states[index] = state;
        self.persist()
    }

    /// Re-enters chunk `start_index` and everything after it at `Pending`.
    ///
    /// Completion of chunks below `start_index` is trusted, not
    /// re-verified; the operator asserts those are done.
    pub fn reset_from(&mut self, start_index: usize) -> Result<()> {
        if start_index > self.states.len() {
            bail!(
                "resume index {start_index} is beyond the {} chunks in this run",
                self.states.len(),
            );
        }
        for state in &mut self.states[start_index..] {
            *state = ChunkState::Pending;
        }
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let artifact = ProgressArtifact {
            version: ARTIFACT_VERSION,
            window: self.window,
            chunk_width_ms: self.chunk_width_ms,
            states: self.states.clone(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        let data = serde_json::to_vec_pretty(&artifact).context("serializing chunk progress")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("writing chunk progress to {}", self.path.display()))?;

        Ok(())
    }
}
