use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use rand::rngs::StdRng;
use tokenizers::Tokenizer;
use tracing::{debug, info};

mod sampling;

use crate::engine::{Capabilities, ImageParams, ModelLike, ModelLoader, StepCallback};
use crate::error::{classify_generation_failure, is_out_of_memory, GenerationError, LoadError};
use crate::model_manager::ResolvedLoadOptions;
use crate::scheduler::SchedulerConfig;
use crate::{select_best_device, synchronize_device, tensor_to_image};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const CLIP2_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

struct TextEncoder {
    model: clip::ClipTextTransformer,
    tokenizer: Tokenizer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn load(
        config: &clip::Config,
        weights: PathBuf,
        tokenizer: PathBuf,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(&tokenizer)
            .map_err(Error::msg)
            .with_context(|| format!("failed to load tokenizer {}", tokenizer.display()))?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .context("failed to load text encoder")?;
        Ok(Self {
            model,
            tokenizer,
            max_len: config.max_position_embeddings,
            pad_id,
        })
    }

    fn encode(&self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        // Tokens past the encoder window are dropped.
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    vae_scale: f64,
    text_encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler: SchedulerConfig,
}

enum Outcome {
    Image(DynamicImage),
    Aborted,
}

impl StableDiffusionModel {
    fn text_embeddings(&self, prompt: &str, negative_prompt: &str) -> Result<Tensor> {
        let mut per_encoder = Vec::with_capacity(self.text_encoders.len());
        for encoder in &self.text_encoders {
            let cond = encoder.encode(prompt, &self.device)?;
            let uncond = encoder.encode(negative_prompt, &self.device)?;
            per_encoder.push(Tensor::cat(&[uncond, cond], 0)?);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }

    fn run(
        &mut self,
        params: &ImageParams,
        rng: &mut StdRng,
        on_step: &mut StepCallback<'_>,
    ) -> Result<Outcome> {
        let text_embeddings = self.text_embeddings(
            &params.prompt,
            params.negative_prompt.as_deref().unwrap_or(""),
        )?;
        let mut scheduler = sampling::build_scheduler(&self.scheduler, params.steps)?;
        let noise = sampling::get_noise(rng, params.height, params.width, &self.device)?;

        let latents = match sampling::denoise(
            &self.unet,
            scheduler.as_mut(),
            noise,
            &text_embeddings,
            params.guidance_scale,
            self.dtype,
            on_step,
        )? {
            sampling::Denoised::Latents(latents) => latents,
            sampling::Denoised::Aborted => return Ok(Outcome::Aborted),
        };
        debug!("Generated latent image");

        let decoded = self.vae.decode(&(&latents / self.vae_scale)?)?;
        debug!("Decoded image");

        let img = ((decoded.to_dtype(DType::F32)? / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        Ok(Outcome::Image(tensor_to_image(&img.i(0)?)?))
    }
}

impl ModelLike for StableDiffusionModel {
    fn generate(
        &mut self,
        params: &ImageParams,
        rng: &mut StdRng,
        on_step: &mut StepCallback<'_>,
    ) -> Result<DynamicImage, GenerationError> {
        if params.width % 8 != 0 || params.height % 8 != 0 {
            return Err(GenerationError::InvalidInput(format!(
                "width and height must be multiples of 8, got {}x{}",
                params.width, params.height
            )));
        }
        match self.run(params, rng, on_step) {
            Ok(Outcome::Image(image)) => Ok(image),
            Ok(Outcome::Aborted) => Err(GenerationError::Cancelled),
            Err(err) => Err(classify_generation_failure(&err)),
        }
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        self.scheduler
    }

    fn reconfigure_scheduler(&mut self, config: &SchedulerConfig) {
        self.scheduler = *config;
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn release_transient(&mut self) {
        synchronize_device(&self.device);
    }
}

/// Loads diffusers-layout Stable Diffusion directories (`unet/`, `vae/`, `text_encoder/`, and for
/// the large variant `text_encoder_2/`).
#[derive(Debug, Default)]
pub struct StableDiffusionLoader;

impl ModelLoader for StableDiffusionLoader {
    fn load(
        &self,
        path: &Path,
        options: &ResolvedLoadOptions,
    ) -> Result<Box<dyn ModelLike>, LoadError> {
        if !path.is_dir() {
            return Err(LoadError::IncompatibleFormat(format!(
                "{} is a single-file checkpoint, only diffusers directories can be loaded",
                path.display()
            )));
        }
        let model = load_pipeline(path, options).map_err(|err| {
            let message = format!("{err:#}");
            if is_out_of_memory(&message) {
                LoadError::InsufficientMemory(message)
            } else if err.downcast_ref::<MissingComponent>().is_some() {
                LoadError::IncompatibleFormat(message)
            } else {
                LoadError::Unknown(message)
            }
        })?;
        Ok(Box::new(model))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("missing model component {0}")]
struct MissingComponent(String);

/// Picks `<dir>/<component>/<stem>.safetensors`, preferring the `.fp16` variant for half
/// precision weights.
fn component_file(dir: &Path, component: &str, stem: &str, dtype: DType) -> Result<PathBuf> {
    let component_dir = dir.join(component);
    if dtype == DType::F16 {
        let fp16 = component_dir.join(format!("{stem}.fp16.safetensors"));
        if fp16.is_file() {
            return Ok(fp16);
        }
    }
    let full = component_dir.join(format!("{stem}.safetensors"));
    if full.is_file() {
        Ok(full)
    } else {
        Err(MissingComponent(format!("{component}/{stem}.safetensors")).into())
    }
}

fn tokenizer_file(dir: &Path, component: &str, fallback_repo: &str) -> Result<PathBuf> {
    let local = dir.join(component).join("tokenizer.json");
    if local.is_file() {
        return Ok(local);
    }
    info!("No {component}/tokenizer.json, fetching it from {fallback_repo}");
    let api = hf_hub::api::sync::Api::new()?;
    api.model(fallback_repo.to_string())
        .get("tokenizer.json")
        .with_context(|| format!("failed to get tokenizer from {fallback_repo}"))
}

fn load_pipeline(dir: &Path, options: &ResolvedLoadOptions) -> Result<StableDiffusionModel> {
    let device = select_best_device(options.device_map).context("failed to set up device")?;
    let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };

    let (config, vae_scale) = if options.large_variant {
        (StableDiffusionConfig::sdxl(None, None, None), 0.13025)
    } else {
        (StableDiffusionConfig::v1_5(None, None, None), 0.18215)
    };

    let mut text_encoders = vec![TextEncoder::load(
        &config.clip,
        component_file(dir, "text_encoder", "model", DType::F32)?,
        tokenizer_file(dir, "tokenizer", CLIP_TOKENIZER_REPO)?,
        &device,
    )?];
    if let Some(clip2) = &config.clip2 {
        text_encoders.push(TextEncoder::load(
            clip2,
            component_file(dir, "text_encoder_2", "model", DType::F32)?,
            tokenizer_file(dir, "tokenizer_2", CLIP2_TOKENIZER_REPO)?,
            &device,
        )?);
    }

    let vae = config
        .build_vae(
            component_file(dir, "vae", "diffusion_pytorch_model", dtype)?,
            &device,
            dtype,
        )
        .context("failed to load autoencoder")?;
    let unet = config
        .build_unet(
            component_file(dir, "unet", "diffusion_pytorch_model", dtype)?,
            &device,
            4,
            cfg!(feature = "flash-attn"),
            dtype,
        )
        .context("failed to load unet")?;

    Ok(StableDiffusionModel {
        device,
        dtype,
        vae_scale,
        text_encoders,
        unet,
        vae,
        scheduler: SchedulerConfig::default(),
    })
}
