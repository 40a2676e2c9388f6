use std::path::Path;

use image::DynamicImage;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, GenerationError, LoadError};
use crate::model_manager::ResolvedLoadOptions;
use crate::scheduler::SchedulerConfig;

/// What the step callback asks the engine to do once the current step has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Abort,
}

/// Reported after each completed denoising step. `step_index` counts finished steps, so the last
/// call of an image has `step_index == total_steps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    pub step_index: usize,
    pub total_steps: usize,
}

pub type StepCallback<'a> = dyn FnMut(StepProgress) -> StepControl + 'a;

/// Per-image parameters handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
}

/// Optional execution modes that trade speed for memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySaver {
    SlicedDecoding,
    TiledDecoding,
    Offload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub supports_memory_offload: bool,
    pub supports_sliced_decoding: bool,
    pub supports_tiled_decoding: bool,
    pub supports_quantization: bool,
}

/// A loaded engine instance.
pub trait ModelLike: Send {
    fn generate(
        &mut self,
        params: &ImageParams,
        rng: &mut StdRng,
        on_step: &mut StepCallback<'_>,
    ) -> Result<DynamicImage, GenerationError>;

    fn scheduler_config(&self) -> SchedulerConfig;

    fn reconfigure_scheduler(&mut self, config: &SchedulerConfig);

    fn capabilities(&self) -> Capabilities;

    fn enable_memory_saver(&mut self, saver: MemorySaver) -> Result<(), EngineError> {
        let _ = saver;
        Err(EngineError::Unsupported("memory saving"))
    }

    /// Drops buffers that only live for one image.
    fn release_transient(&mut self) {}
}

pub trait ModelLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        options: &ResolvedLoadOptions,
    ) -> Result<Box<dyn ModelLike>, LoadError>;

    /// Hands freed device memory back to the driver. Called after every release.
    fn reclaim_memory(&self) {}
}
