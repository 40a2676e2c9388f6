pub mod config;
pub mod detect;
pub mod device_map;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod model_manager;
pub mod orchestrator;
pub mod persist;
pub mod scheduler;
mod stable_diffusion;
mod util;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use device_map::*;
pub use error::{GenerationError, LoadError, OrchestratorError};
pub use events::{event_channel, Event, EventReceiver, EventSender, ProgressEvent, Severity};
pub use model_manager::{list_models, LoadOptions, ModelInfo};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use stable_diffusion::StableDiffusionLoader;
pub(crate) use util::*;

use engine::ImageParams;
use serde::{Deserialize, Serialize};

/// Largest accepted image side, in pixels.
pub const MAX_IMAGE_SIDE: usize = 2048;

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_size")]
    pub height: usize,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// `-1` asks for a random seed.
    #[serde(default = "default_seed")]
    pub seed: i64,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    #[serde(default = "default_image_count")]
    pub image_count: usize,
}

fn default_size() -> usize {
    512
}

fn default_steps() -> usize {
    30
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_seed() -> i64 {
    -1
}

fn default_scheduler() -> String {
    scheduler::SchedulerName::default().to_string()
}

fn default_image_count() -> usize {
    1
}

impl GenerationRequest {
    /// Checks everything that can be rejected before a worker is started. Unknown scheduler
    /// names are not an error; the batch falls back to the current scheduler.
    pub fn validate(&self) -> Result<(), GenerationError> {
        let invalid = |message: String| Err(GenerationError::InvalidInput(message));

        if self.prompt.trim().is_empty() {
            return invalid("prompt must not be empty".to_string());
        }
        if self.width == 0 || self.height == 0 {
            return invalid(format!("image size {}x{} is empty", self.width, self.height));
        }
        if self.width % 8 != 0 || self.height % 8 != 0 {
            return invalid(format!(
                "width and height must be multiples of 8, got {}x{}",
                self.width, self.height
            ));
        }
        if self.width > MAX_IMAGE_SIDE || self.height > MAX_IMAGE_SIDE {
            return invalid(format!(
                "image size {}x{} exceeds {MAX_IMAGE_SIDE}x{MAX_IMAGE_SIDE}",
                self.width, self.height
            ));
        }
        if self.steps == 0 {
            return invalid("steps must be at least 1".to_string());
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale <= 0.0 {
            return invalid(format!("guidance scale {} must be positive", self.guidance_scale));
        }
        if self.seed < -1 || self.seed > i64::from(u32::MAX) {
            return invalid(format!(
                "seed {} must be -1 or between 0 and {}",
                self.seed,
                u32::MAX
            ));
        }
        if self.image_count == 0 {
            return invalid("image count must be at least 1".to_string());
        }
        Ok(())
    }

    pub(crate) fn image_params(&self) -> ImageParams {
        let negative_prompt = (!self.negative_prompt.trim().is_empty()).then(|| self.negative_prompt.clone());
        ImageParams {
            prompt: self.prompt.clone(),
            negative_prompt,
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance_scale: self.guidance_scale,
        }
    }
}
