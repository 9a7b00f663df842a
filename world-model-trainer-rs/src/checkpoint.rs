//! Checkpointing of model and optimizer state at epoch boundaries.
//!
//! After every validation pass the [`CheckpointPolicy`] decides whether the
//! model is the best seen so far and hands a [`CheckpointRecord`] to a
//! [`CheckpointStore`]. Two slots exist:
//!
//! - **Latest**: overwritten at the end of every epoch
//! - **Best**: overwritten only when the validation loss strictly improves
//!
//! # Format
//!
//! [`FileCheckpointStore`] lays a slot out as a directory:
//!
//! ```text
//! <root>/checkpoint/          <root>/best/
//!   model.bin                   model.bin        (burn BinFileRecorder)
//!   optimizer.bin               optimizer.bin
//!   metadata.json               metadata.json    (epoch, loss, host, time)
//! ```
//!
//! A slot is written into a temporary directory first and renamed into
//! place, so a crash mid-write leaves the previous slot intact.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = FileCheckpointStore::new(run_dir);
//! let mut policy = CheckpointPolicy::new(Some(store));
//!
//! let is_best = policy.consider(epoch, val_loss, &model, &optimizer)?;
//!
//! // Later, resume from the best slot
//! let (model, optimizer, metadata) =
//!     FileCheckpointStore::new(run_dir).load(CheckpointSlot::Best, model, optimizer, &device)?;
//! ```

use burn::module::AutodiffModule;
use burn::optim::Optimizer;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::error::{Result, WorldModelError};

/// Current checkpoint metadata format version.
const CHECKPOINT_VERSION: u32 = 1;

const MODEL_FILE: &str = "model";
const OPTIMIZER_FILE: &str = "optimizer";
const METADATA_FILE: &str = "metadata.json";

/// Where a checkpoint is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CheckpointSlot {
    /// State at the end of the most recent epoch.
    Latest,
    /// State with the lowest validation loss so far.
    Best,
}

impl CheckpointSlot {
    /// Directory name of the slot.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Latest => "checkpoint",
            Self::Best => "best",
        }
    }
}

impl fmt::Display for CheckpointSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Full training state at the end of one epoch.
#[derive(Debug)]
pub struct CheckpointRecord<'a, B, M, O> {
    /// Epoch the state belongs to.
    pub epoch: usize,
    /// Model parameters.
    pub model: &'a M,
    /// Optimizer state.
    pub optimizer: &'a O,
    /// Whether the validation loss is the best so far.
    pub is_best: bool,
    /// Validation loss of the epoch.
    pub validation_loss: f64,
    _backend: PhantomData<B>,
}

impl<'a, B, M, O> CheckpointRecord<'a, B, M, O> {
    /// Creates a record.
    #[must_use]
    pub fn new(
        epoch: usize,
        model: &'a M,
        optimizer: &'a O,
        is_best: bool,
        validation_loss: f64,
    ) -> Self {
        Self {
            epoch,
            model,
            optimizer,
            is_best,
            validation_loss,
            _backend: PhantomData,
        }
    }

    /// Metadata describing this record.
    #[must_use]
    pub fn metadata(&self) -> CheckpointMetadata {
        CheckpointMetadata::new(self.epoch, self.is_best, self.validation_loss)
    }
}

/// Metadata stored next to every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Format version.
    pub version: u32,

    /// Epoch the checkpoint belongs to.
    pub epoch: usize,

    /// Whether this was the best epoch when written.
    pub is_best: bool,

    /// Validation loss of the epoch.
    pub validation_loss: f64,

    /// Wall-clock timestamp (RFC 3339 format).
    pub timestamp: String,

    /// Hostname where the checkpoint was created.
    pub hostname: String,
}

impl CheckpointMetadata {
    /// Creates metadata with the current timestamp and hostname.
    #[must_use]
    pub fn new(epoch: usize, is_best: bool, validation_loss: f64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            epoch,
            is_best,
            validation_loss,
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

/// Persistence backend for checkpoints.
pub trait CheckpointStore {
    /// Writes `record` into `slot`, replacing what was there.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be persisted.
    fn write<B, M, O>(
        &mut self,
        record: &CheckpointRecord<'_, B, M, O>,
        slot: CheckpointSlot,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>;
}

/// Stores checkpoints as burn binary records under a run directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
    recorder: BinFileRecorder<FullPrecisionSettings>,
}

impl FileCheckpointStore {
    /// Creates a store rooted at `root`. Nothing is written until the first
    /// checkpoint.
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            recorder: BinFileRecorder::new(),
        }
    }

    /// Directory of a slot.
    #[must_use]
    pub fn slot_dir(&self, slot: CheckpointSlot) -> PathBuf {
        self.root.join(slot.dir_name())
    }

    /// Reads the metadata of a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is missing, corrupted, or has an
    /// incompatible version.
    pub fn read_metadata(&self, slot: CheckpointSlot) -> Result<CheckpointMetadata> {
        read_metadata_from(&self.slot_dir(slot))
    }

    /// Restores model and optimizer from a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the slot's files cannot be loaded.
    pub fn load<B, M, O>(
        &self,
        slot: CheckpointSlot,
        model: M,
        optimizer: O,
        device: &B::Device,
    ) -> Result<(M, O, CheckpointMetadata)>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        load_from_dir(&self.slot_dir(slot), &self.recorder, model, optimizer, device)
    }
}

/// Restores model and optimizer from a slot directory written by
/// [`FileCheckpointStore`].
///
/// # Errors
///
/// Returns an error if any of the directory's files cannot be loaded.
pub fn load_checkpoint_dir<B, M, O>(
    dir: &Path,
    model: M,
    optimizer: O,
    device: &B::Device,
) -> Result<(M, O, CheckpointMetadata)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    load_from_dir(dir, &BinFileRecorder::new(), model, optimizer, device)
}

fn load_from_dir<B, M, O>(
    dir: &Path,
    recorder: &BinFileRecorder<FullPrecisionSettings>,
    model: M,
    optimizer: O,
    device: &B::Device,
) -> Result<(M, O, CheckpointMetadata)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let metadata = read_metadata_from(dir)?;
    let model = model
        .load_file(dir.join(MODEL_FILE), recorder, device)
        .map_err(recorder_error)?;
    let record = <BinFileRecorder<FullPrecisionSettings> as Recorder<B>>::load::<O::Record>(
        recorder,
        dir.join(OPTIMIZER_FILE),
        device,
    )
    .map_err(recorder_error)?;
    let optimizer = optimizer.load_record(record);

    tracing::info!(
        epoch = metadata.epoch,
        validation_loss = metadata.validation_loss,
        "restored checkpoint from {}",
        dir.display()
    );
    Ok((model, optimizer, metadata))
}

fn read_metadata_from(dir: &Path) -> Result<CheckpointMetadata> {
    let file = File::open(dir.join(METADATA_FILE)).map_err(|e| {
        WorldModelError::Checkpoint(format!("failed to open metadata in {}: {e}", dir.display()))
    })?;
    let metadata: CheckpointMetadata = serde_json::from_reader(BufReader::new(file))?;

    if metadata.version != CHECKPOINT_VERSION {
        return Err(WorldModelError::Checkpoint(format!(
            "incompatible checkpoint version: {} (expected {CHECKPOINT_VERSION})",
            metadata.version
        )));
    }
    Ok(metadata)
}

fn recorder_error(err: RecorderError) -> WorldModelError {
    WorldModelError::Checkpoint(format!("{err:?}"))
}

impl CheckpointStore for FileCheckpointStore {
    fn write<B, M, O>(
        &mut self,
        record: &CheckpointRecord<'_, B, M, O>,
        slot: CheckpointSlot,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        fs::create_dir_all(&self.root)?;
        let target = self.slot_dir(slot);
        let staging = self.root.join(format!(".{slot}.tmp"));
        let retired = self.root.join(format!(".{slot}.old"));

        for stale in [&staging, &retired] {
            if stale.exists() {
                fs::remove_dir_all(stale)?;
            }
        }
        fs::create_dir_all(&staging)?;

        record
            .model
            .clone()
            .save_file(staging.join(MODEL_FILE), &self.recorder)
            .map_err(recorder_error)?;
        <BinFileRecorder<FullPrecisionSettings> as Recorder<B>>::record(
            &self.recorder,
            record.optimizer.to_record(),
            staging.join(OPTIMIZER_FILE),
        )
        .map_err(recorder_error)?;

        let writer = BufWriter::new(File::create(staging.join(METADATA_FILE))?);
        serde_json::to_writer_pretty(writer, &record.metadata())?;

        if target.exists() {
            fs::rename(&target, &retired)?;
        }
        fs::rename(&staging, &target)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }

        tracing::debug!(epoch = record.epoch, %slot, "wrote checkpoint to {}", target.display());
        Ok(())
    }
}

/// Keeps the metadata of every write in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    writes: Vec<(CheckpointSlot, CheckpointMetadata)>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All writes in order.
    #[must_use]
    pub fn writes(&self) -> &[(CheckpointSlot, CheckpointMetadata)] {
        &self.writes
    }

    /// Epochs written to `slot`, in order.
    #[must_use]
    pub fn epochs_in(&self, slot: CheckpointSlot) -> Vec<usize> {
        self.writes
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, m)| m.epoch)
            .collect()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn write<B, M, O>(
        &mut self,
        record: &CheckpointRecord<'_, B, M, O>,
        slot: CheckpointSlot,
    ) -> Result<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        self.writes.push((slot, record.metadata()));
        Ok(())
    }
}

/// Tracks the best validation loss and decides what gets written.
#[derive(Debug, Clone)]
pub struct CheckpointPolicy<S> {
    store: Option<S>,
    current_best: Option<f64>,
}

impl<S: CheckpointStore> CheckpointPolicy<S> {
    /// Creates a policy. With `None`, best tracking still happens but nothing
    /// is written.
    pub fn new(store: Option<S>) -> Self {
        Self {
            store,
            current_best: None,
        }
    }

    /// Lowest validation loss seen so far.
    #[must_use]
    pub fn current_best(&self) -> Option<f64> {
        self.current_best
    }

    /// The underlying store, if checkpointing is enabled.
    #[must_use]
    pub fn store(&self) -> Option<&S> {
        self.store.as_ref()
    }

    /// Whether checkpoints are written.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Records the validation loss of `epoch` and writes the checkpoint
    /// slots. Returns whether the epoch is the new best.
    ///
    /// The first call is always best; after that only a strictly lower loss
    /// is, or any loss while the recorded best is NaN.
    ///
    /// # Errors
    ///
    /// Propagates store write errors.
    pub fn consider<B, M, O>(
        &mut self,
        epoch: usize,
        validation_loss: f64,
        model: &M,
        optimizer: &O,
    ) -> Result<bool>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        // A NaN best never blocks a later finite loss.
        let is_best = self
            .current_best
            .is_none_or(|best| validation_loss < best || best.is_nan());
        if is_best {
            self.current_best = Some(validation_loss);
        }

        if let Some(store) = self.store.as_mut() {
            let record =
                CheckpointRecord::<B, M, O>::new(epoch, model, optimizer, is_best, validation_loss);
            store.write(&record, CheckpointSlot::Latest)?;
            if is_best {
                store.write(&record, CheckpointSlot::Best)?;
            }
        }

        if is_best {
            tracing::info!(epoch, validation_loss, "new best validation loss");
        }
        Ok(is_best)
    }
}
