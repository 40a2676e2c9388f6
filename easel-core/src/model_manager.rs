//! Ownership of the single loaded model.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::detect::{detect_large_variant, Detection};
use crate::engine::{MemorySaver, ModelLike, ModelLoader};
use crate::error::LoadError;
use crate::{ComputeDevice, DeviceMap};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    #[serde(default)]
    pub device: DeviceMap,
    #[serde(default)]
    pub quantize: bool,
    /// `None` runs variant detection on the model path.
    #[serde(default)]
    pub large_variant: Option<bool>,
}

/// Load options after device resolution and variant detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLoadOptions {
    pub device_map: DeviceMap,
    pub device: ComputeDevice,
    pub quantize: bool,
    pub large_variant: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub name: String,
    pub is_large_variant: bool,
    pub supports_memory_offload: bool,
    pub quantization_enabled: bool,
    pub device: ComputeDevice,
    pub memory_savers: Vec<MemorySaver>,
}

pub struct ModelHandle {
    pub model: Box<dyn ModelLike>,
    pub info: ModelInfo,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("info", &self.info).finish()
    }
}

/// A model file or diffusers directory found in the models directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub path: PathBuf,
    pub detection: Detection,
}

/// Holds at most one `ModelHandle`. Loading always tears the previous handle down first.
pub struct ModelManager {
    loader: Arc<dyn ModelLoader>,
    handle: Option<ModelHandle>,
}

impl ModelManager {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self {
            loader,
            handle: None,
        }
    }

    pub fn load(&mut self, path: &Path, options: &LoadOptions) -> Result<&ModelInfo, LoadError> {
        // The old model goes away even if the new one never arrives.
        self.unload();

        if !path.exists() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        let resolved = resolve_options(path, options);
        info!(
            "Loading model {} on {} (large variant: {}, quantize: {})",
            path.display(),
            resolved.device,
            resolved.large_variant,
            resolved.quantize
        );

        let mut model = match self.loader.load(path, &resolved) {
            Ok(model) => model,
            Err(err) => {
                error!("Loading {} failed: {err}", path.display());
                self.loader.reclaim_memory();
                return Err(err);
            }
        };

        let capabilities = model.capabilities();
        let quantization_enabled = resolved.quantize && capabilities.supports_quantization;
        if resolved.quantize && !quantization_enabled {
            warn!("Quantization requested but not supported by the engine, loading without it");
        }

        let mut memory_savers = Vec::new();
        if resolved.device.is_gpu() {
            let mut wanted = Vec::new();
            if !quantization_enabled {
                wanted.push(MemorySaver::Offload);
            }
            wanted.extend([MemorySaver::SlicedDecoding, MemorySaver::TiledDecoding]);
            for saver in wanted {
                match model.enable_memory_saver(saver) {
                    Ok(()) => {
                        info!("Enabled {saver:?}");
                        memory_savers.push(saver);
                    }
                    Err(err) => warn!("Could not enable {saver:?}: {err}"),
                }
            }
        }

        let info = ModelInfo {
            path: path.to_path_buf(),
            name: model_name(path),
            is_large_variant: resolved.large_variant,
            supports_memory_offload: capabilities.supports_memory_offload,
            quantization_enabled,
            device: resolved.device,
            memory_savers,
        };
        info!("Model {} ready", info.name);

        let handle = self.handle.insert(ModelHandle { model, info });
        Ok(&handle.info)
    }

    /// Releases the held model and reclaims device memory. A no-op when nothing is loaded.
    pub fn unload(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Releasing model {}", handle.info.name);
            drop(handle);
            self.loader.reclaim_memory();
        }
    }

    pub fn current(&self) -> Option<&ModelHandle> {
        self.handle.as_ref()
    }

    pub fn current_mut(&mut self) -> Option<&mut ModelHandle> {
        self.handle.as_mut()
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.is_some()
    }

    pub fn info(&self) -> Option<&ModelInfo> {
        self.handle.as_ref().map(|handle| &handle.info)
    }

    pub fn loader(&self) -> &Arc<dyn ModelLoader> {
        &self.loader
    }
}

impl Drop for ModelManager {
    fn drop(&mut self) {
        self.unload();
    }
}

fn resolve_options(path: &Path, options: &LoadOptions) -> ResolvedLoadOptions {
    let device = ComputeDevice::resolve(options.device);
    let quantize = options.quantize && device.is_gpu();
    if options.quantize && !quantize {
        info!("Quantization is only available on GPU devices, disabled for {device}");
    }
    let large_variant = options
        .large_variant
        .unwrap_or_else(|| detect_large_variant(path).is_large);
    ResolvedLoadOptions {
        device_map: options.device,
        device,
        quantize,
        large_variant,
    }
}

fn model_name(path: &Path) -> String {
    let name = if path.is_dir() {
        path.file_name()
    } else {
        path.file_stem()
    };
    name.map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Lists `*.safetensors` files and diffusers directories (those with a `model_index.json` or a
/// `unet/` folder) directly under `dir`, sorted by name.
pub fn list_models(dir: &Path) -> std::io::Result<Vec<ModelEntry>> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_checkpoint = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"));
        let is_diffusers_dir =
            path.is_dir() && (path.join("model_index.json").is_file() || path.join("unet").is_dir());
        if is_checkpoint || is_diffusers_dir {
            entries.push(ModelEntry {
                name: model_name(&path),
                detection: detect_large_variant(&path),
                path,
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
