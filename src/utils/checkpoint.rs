//! Checkpoint files with SHA256 checksum validation.
//!
//! A checkpoint is an ordered collection of named tensors ("items") written as
//! safetensors, plus a `<file>.meta.json` sidecar that carries a checksum and
//! the number of updates seen when it was written.

use crate::utils::error::{Result, TrainingError};
use candle_core::{safetensors, DType, Device, Tensor};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Reserved item name of the full-precision parameter snapshot.
pub const MASTER_PARAMETERS: &str = "master_parameters";

/// One named binary entry of a checkpoint.
#[derive(Debug, Clone)]
pub struct Item {
    pub name: String,
    pub tensor: Tensor,
}

impl Item {
    pub fn new(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            name: name.into(),
            tensor,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.dims()
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }

    /// Convert the payload to another numeric type, no-op if it already matches.
    pub fn convert(&mut self, dtype: DType) -> Result<()> {
        if self.tensor.dtype() != dtype {
            self.tensor = self.tensor.to_dtype(dtype)?;
        }
        Ok(())
    }
}

/// Find an item by name.
pub fn find_item<'a>(items: &'a [Item], name: &str) -> Option<&'a Item> {
    items.iter().find(|item| item.name == name)
}

/// Metadata stored alongside checkpoints
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// SHA256 checksum of the item data
    pub checksum: String,
    /// Original filename
    pub filename: String,
    /// Updates seen when saved
    pub updates: Option<usize>,
    /// Item names in save order
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// `<model>.optimizer.safetensors`
pub fn checkpoint_path(model: &Path) -> PathBuf {
    append_suffix(model, ".optimizer.safetensors")
}

/// `<model>.progress.json`
pub fn progress_path(model: &Path) -> PathBuf {
    append_suffix(model, ".progress.json")
}

/// Replace the final extension of `model` with `.iter<N>.<ext>`.
pub fn snapshot_path(model: &Path, updates: usize) -> PathBuf {
    match model.extension().and_then(|e| e.to_str()) {
        Some(ext) => model.with_extension(format!("iter{}.{}", updates, ext)),
        None => append_suffix(model, &format!(".iter{}", updates)),
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    append_suffix(path, ".meta.json")
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

/// Compute SHA256 checksum of item data.
///
/// Hashes name, dtype and shape of every item plus the first and last 1024
/// bytes of its data (all of it when smaller).
pub fn compute_items_checksum(items: &[Item]) -> Result<String> {
    let mut hasher = Sha256::new();

    let mut sorted: Vec<&Item> = items.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    for item in sorted {
        let meta = format!("{}:{:?}:{:?}", item.name, item.dtype(), item.shape());
        hasher.update(meta.as_bytes());

        let data = item
            .tensor
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let bytes: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();

        if bytes.len() > 2048 {
            hasher.update(&bytes[..1024]);
            hasher.update(&bytes[bytes.len() - 1024..]);
        } else {
            hasher.update(&bytes);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Save items with a checksum sidecar.
pub fn save_items<P: AsRef<Path>>(items: &[Item], path: P, updates: Option<usize>) -> Result<()> {
    let path = path.as_ref();

    let mut tensors = HashMap::with_capacity(items.len());
    for item in items {
        if tensors
            .insert(item.name.clone(), item.tensor.clone())
            .is_some()
        {
            return Err(TrainingError::Checkpoint(format!(
                "duplicate item '{}' in {}",
                item.name,
                path.display()
            )));
        }
    }

    let checksum = compute_items_checksum(items)?;
    safetensors::save(&tensors, path)?;

    let metadata = CheckpointMetadata {
        checksum: checksum.clone(),
        filename: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("checkpoint")
            .to_string(),
        updates,
        items: items.iter().map(|item| item.name.clone()).collect(),
        extra: HashMap::new(),
    };

    let meta_json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| TrainingError::Checkpoint(format!("Failed to serialize metadata: {}", e)))?;
    fs::write(sidecar_path(path), meta_json)?;

    info!(
        checkpoint = %path.display(),
        checksum = %checksum,
        items = items.len(),
        updates = ?updates,
        "Items saved with checksum"
    );

    Ok(())
}

/// Load items, verifying the checksum when a sidecar exists.
///
/// Items come back in save order when the sidecar records it, otherwise
/// sorted by name.
pub fn load_items<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<(Vec<Item>, Option<CheckpointMetadata>)> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(TrainingError::MissingFile(path.to_path_buf()));
    }

    let mut tensors = safetensors::load(path, device)?;

    let meta_path = sidecar_path(path);
    let metadata = if meta_path.exists() {
        let meta_json = fs::read_to_string(&meta_path)?;
        let meta: CheckpointMetadata = serde_json::from_str(&meta_json)
            .map_err(|e| TrainingError::Checkpoint(format!("Failed to parse metadata: {}", e)))?;
        Some(meta)
    } else {
        warn!(
            checkpoint = %path.display(),
            "No metadata file found - skipping checksum verification"
        );
        None
    };

    let mut order: Vec<String> = metadata
        .as_ref()
        .map(|m| m.items.clone())
        .unwrap_or_default();
    if order.len() != tensors.len() {
        order = tensors.keys().cloned().collect();
        order.sort();
    }

    let mut items = Vec::with_capacity(order.len());
    for name in order {
        let tensor = tensors.remove(&name).ok_or_else(|| {
            TrainingError::Checkpoint(format!("item '{}' missing from {}", name, path.display()))
        })?;
        items.push(Item::new(name, tensor));
    }

    if let Some(meta) = &metadata {
        let current = compute_items_checksum(&items)?;
        if current != meta.checksum {
            error!(
                expected = %meta.checksum,
                actual = %current,
                "Checkpoint checksum mismatch - corruption detected"
            );
            return Err(TrainingError::Checkpoint(format!(
                "Checkpoint corruption detected: checksum mismatch (expected {}, got {})",
                meta.checksum, current
            )));
        }
        info!(
            checkpoint = %path.display(),
            checksum = %current,
            "Checkpoint loaded and verified"
        );
    }

    Ok((items, metadata))
}
