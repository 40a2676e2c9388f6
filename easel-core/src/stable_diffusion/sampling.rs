use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{self, Scheduler, SchedulerConfig as _},
    uni_pc::{SigmaSchedule, UniPCSchedulerConfig},
    unet_2d::UNet2DConditionModel,
};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use crate::engine::{StepCallback, StepControl, StepProgress};
use crate::scheduler::{PredictionType, SchedulerAlgorithm, SchedulerConfig};

fn prediction_type(prediction: PredictionType) -> schedulers::PredictionType {
    match prediction {
        PredictionType::Epsilon => schedulers::PredictionType::Epsilon,
        PredictionType::VPrediction => schedulers::PredictionType::VPrediction,
    }
}

/// Builds the candle scheduler closest to `config`. Candle ships fewer samplers than the names we
/// accept, so several algorithms share an implementation.
pub fn build_scheduler(config: &SchedulerConfig, steps: usize) -> Result<Box<dyn Scheduler>> {
    use SchedulerAlgorithm as A;

    let multistep = matches!(
        config.algorithm,
        A::UniPcMultistep | A::DeisMultistep | A::DpmSolverMultistep
    );
    if config.use_karras_variant && !multistep {
        warn!("Karras sigmas are not available, using the plain {:?} schedule", config.algorithm);
    }
    let params = &config.params;
    let scheduler = match config.algorithm {
        A::EulerAncestralDiscrete | A::Kdpm2AncestralDiscrete => EulerAncestralDiscreteSchedulerConfig {
            beta_start: params.beta_start,
            beta_end: params.beta_end,
            steps_offset: params.steps_offset,
            train_timesteps: params.train_timesteps,
            prediction_type: prediction_type(params.prediction_type),
            ..Default::default()
        }
        .build(steps)?,
        A::UniPcMultistep | A::DeisMultistep | A::DpmSolverMultistep => {
            multistep_config(config).build(steps)?
        }
        A::EulerDiscrete
        | A::DpmSolverSde
        | A::LmsDiscrete
        | A::Ddim
        | A::Pndm
        | A::Ddpm
        | A::HeunDiscrete
        | A::Kdpm2Discrete => DDIMSchedulerConfig {
            beta_start: params.beta_start,
            beta_end: params.beta_end,
            steps_offset: params.steps_offset,
            train_timesteps: params.train_timesteps,
            prediction_type: prediction_type(params.prediction_type),
            ..Default::default()
        }
        .build(steps)?,
    };
    Ok(scheduler)
}

/// UniPC has its own sigma schedule and no beta range, so only the Karras flag, training
/// timesteps and prediction type carry over.
fn multistep_config(config: &SchedulerConfig) -> UniPCSchedulerConfig {
    UniPCSchedulerConfig {
        sigma_schedule: if config.use_karras_variant {
            SigmaSchedule::Karras(Default::default())
        } else {
            SigmaSchedule::Exponential(Default::default())
        },
        num_training_timesteps: config.params.train_timesteps,
        prediction_type: prediction_type(config.params.prediction_type),
        ..Default::default()
    }
}

/// Gaussian latent noise drawn from `rng`, so a given seed always yields the same latents.
pub fn get_noise(
    rng: &mut StdRng,
    height: usize,
    width: usize,
    device: &Device,
) -> Result<Tensor> {
    let shape = (1, 4, height / 8, width / 8);
    let len = 4 * (height / 8) * (width / 8);
    let noise: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(noise, shape, device)?)
}

pub enum Denoised {
    Latents(Tensor),
    Aborted,
}

/// Classifier-free guided denoising loop. `text_embeddings` holds the unconditional batch
/// followed by the conditional one.
#[allow(clippy::too_many_arguments)]
pub fn denoise(
    unet: &UNet2DConditionModel,
    scheduler: &mut dyn Scheduler,
    latents: Tensor,
    text_embeddings: &Tensor,
    guidance_scale: f64,
    dtype: DType,
    on_step: &mut StepCallback<'_>,
) -> Result<Denoised> {
    let timesteps = scheduler.timesteps().to_vec();
    let total_steps = timesteps.len();
    let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(dtype)?;

    for (index, &timestep) in timesteps.iter().enumerate() {
        let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
        let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
        let noise_pred = unet.forward(&latent_model_input, timestep as f64, text_embeddings)?;
        let noise_pred = noise_pred.chunk(2, 0)?;
        let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
        let noise_pred = (uncond + ((text - uncond)? * guidance_scale)?)?;
        latents = scheduler.step(&noise_pred, timestep, &latents)?;

        let progress = StepProgress {
            step_index: index + 1,
            total_steps,
        };
        if on_step(progress) == StepControl::Abort {
            return Ok(Denoised::Aborted);
        }
    }
    Ok(Denoised::Latents(latents))
}
