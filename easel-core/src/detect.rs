//! Large-variant (SDXL-class) model detection.
//!
//! Heuristics run cheapest first and stop at the first positive. Anything that cannot be read is
//! treated as "not large" and logged.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use safetensors::tensor::Metadata;
use serde::Serialize;
use tracing::{debug, warn};

pub const LARGE_VARIANT_MARKERS: &[&str] = &["sdxl", "flux"];

pub const SIZE_THRESHOLD_BYTES: u64 = 6 * 1024 * 1024 * 1024;

pub const METADATA_MODEL_TYPE: &str = "stable-diffusion-xl";

pub const KEY_SCAN_LIMIT: usize = 500;

/// Tensor-name fragments that only appear in checkpoints carrying a second text encoder.
pub const LARGE_VARIANT_KEY_INDICATORS: &[&str] = &[
    "text_encoder_2",
    "tokenizer_2",
    "text_model_2",
    "conditioner.embedders.1.transformer.text_model",
    "model.text_encoder_2.text_model.embeddings.token_embedding.weight",
    "model.clip_l.transformer.resblocks.11.attn.q_proj.weight",
    "model.clip_g.transformer.resblocks.23.attn.q_proj.weight",
];

/// Safetensors headers larger than this are not worth parsing for a heuristic.
const MAX_HEADER_BYTES: u64 = 100 * 1024 * 1024;

/// Weights file inspected when the model path is a diffusers directory.
const DIFFUSERS_UNET_WEIGHTS: &str = "unet/diffusion_pytorch_model.safetensors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionReason {
    FileName,
    FileSize,
    Metadata,
    TensorNames,
    /// All heuristics ran and none matched.
    None,
    /// Something could not be read; reported as negative.
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub is_large: bool,
    pub reason: DetectionReason,
}

impl Detection {
    fn positive(reason: DetectionReason) -> Self {
        Self {
            is_large: true,
            reason,
        }
    }

    fn negative(reason: DetectionReason) -> Self {
        Self {
            is_large: false,
            reason,
        }
    }
}

pub fn detect_large_variant(path: &Path) -> Detection {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if let Some(marker) = LARGE_VARIANT_MARKERS
        .iter()
        .find(|marker| file_name.contains(*marker))
    {
        debug!("large variant detected from file name '{file_name}' (marker '{marker}')");
        return Detection::positive(DetectionReason::FileName);
    }

    let weights = weights_file(path);

    let mut uncertain = false;
    match std::fs::metadata(&weights) {
        Ok(meta) => {
            debug!(
                "model file {} is {:.2} GiB",
                weights.display(),
                meta.len() as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            if meta.len() > SIZE_THRESHOLD_BYTES {
                return Detection::positive(DetectionReason::FileSize);
            }
        }
        Err(err) => {
            warn!("could not stat {} for variant detection: {err}", weights.display());
            uncertain = true;
        }
    }

    let header = match read_header(&weights) {
        Ok(header) => header,
        Err(err) => {
            warn!("could not read safetensors header of {}: {err}", weights.display());
            return Detection::negative(DetectionReason::Uncertain);
        }
    };

    if declares_large_model_type(&header) {
        debug!("large variant detected from safetensors metadata");
        return Detection::positive(DetectionReason::Metadata);
    }

    if let Some(key) = find_large_variant_key(&header) {
        debug!("large variant indicator found in tensor '{key}'");
        return Detection::positive(DetectionReason::TensorNames);
    }

    if uncertain {
        Detection::negative(DetectionReason::Uncertain)
    } else {
        Detection::negative(DetectionReason::None)
    }
}

fn weights_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join(DIFFUSERS_UNET_WEIGHTS)
    } else {
        path.to_path_buf()
    }
}

fn read_header(path: &Path) -> io::Result<Metadata> {
    let mut file = File::open(path)?;
    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("safetensors header of {header_len} bytes is too large"),
        ));
    }
    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)?;
    serde_json::from_slice(&header).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn declares_large_model_type(header: &Metadata) -> bool {
    header
        .metadata()
        .as_ref()
        .and_then(|meta| meta.get("model_type"))
        .is_some_and(|model_type| model_type.to_lowercase().contains(METADATA_MODEL_TYPE))
}

fn find_large_variant_key(header: &Metadata) -> Option<String> {
    let mut names: Vec<String> = header.tensors().into_keys().collect();
    names.sort();
    names.into_iter().take(KEY_SCAN_LIMIT).find(|name| {
        LARGE_VARIANT_KEY_INDICATORS
            .iter()
            .any(|indicator| name.contains(indicator))
    })
}
