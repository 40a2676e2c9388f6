//! Sampling-algorithm catalog and the pure reconfiguration step applied before every batch.

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

const KARRAS_MARKER: &str = "Karras";

/// Names offered to the user. Several names share one algorithm and differ only in the Karras
/// noise schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerName {
    #[serde(rename = "Euler")]
    Euler,
    #[serde(rename = "Euler Ancestral")]
    EulerAncestral,
    #[serde(rename = "DPM++ 2M")]
    DpmPp2m,
    #[serde(rename = "DPM++ 2M Karras")]
    DpmPp2mKarras,
    #[serde(rename = "DPM++ SDE")]
    DpmPpSde,
    #[serde(rename = "DPM++ SDE Karras")]
    DpmPpSdeKarras,
    #[serde(rename = "LMS")]
    Lms,
    #[serde(rename = "LMS Karras")]
    LmsKarras,
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "PNDM")]
    Pndm,
    #[serde(rename = "DDPM")]
    Ddpm,
    #[serde(rename = "Heun")]
    Heun,
    #[serde(rename = "KDPM2")]
    Kdpm2,
    #[serde(rename = "KDPM2 Ancestral")]
    Kdpm2Ancestral,
    #[serde(rename = "DEIS")]
    Deis,
    #[serde(rename = "UniPC")]
    UniPc,
}

serde_plain::derive_display_from_serialize!(SchedulerName);
serde_plain::derive_fromstr_from_deserialize!(SchedulerName);

impl Default for SchedulerName {
    fn default() -> Self {
        Self::Euler
    }
}

impl SchedulerName {
    pub fn all() -> &'static [SchedulerName] {
        use SchedulerName::*;
        &[
            Euler,
            EulerAncestral,
            DpmPp2m,
            DpmPp2mKarras,
            DpmPpSde,
            DpmPpSdeKarras,
            Lms,
            LmsKarras,
            Ddim,
            Pndm,
            Ddpm,
            Heun,
            Kdpm2,
            Kdpm2Ancestral,
            Deis,
            UniPc,
        ]
    }

    pub fn lookup(name: &str) -> Result<Self, SchedulerError> {
        name.trim()
            .parse()
            .map_err(|_| SchedulerError::UnknownScheduler(name.to_string()))
    }

    pub fn algorithm(&self) -> SchedulerAlgorithm {
        use SchedulerAlgorithm as A;
        match self {
            SchedulerName::Euler => A::EulerDiscrete,
            SchedulerName::EulerAncestral => A::EulerAncestralDiscrete,
            SchedulerName::DpmPp2m | SchedulerName::DpmPp2mKarras => A::DpmSolverMultistep,
            SchedulerName::DpmPpSde | SchedulerName::DpmPpSdeKarras => A::DpmSolverSde,
            SchedulerName::Lms | SchedulerName::LmsKarras => A::LmsDiscrete,
            SchedulerName::Ddim => A::Ddim,
            SchedulerName::Pndm => A::Pndm,
            SchedulerName::Ddpm => A::Ddpm,
            SchedulerName::Heun => A::HeunDiscrete,
            SchedulerName::Kdpm2 => A::Kdpm2Discrete,
            SchedulerName::Kdpm2Ancestral => A::Kdpm2AncestralDiscrete,
            SchedulerName::Deis => A::DeisMultistep,
            SchedulerName::UniPc => A::UniPcMultistep,
        }
    }

    pub fn is_karras(&self) -> bool {
        self.to_string().contains(KARRAS_MARKER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAlgorithm {
    EulerDiscrete,
    EulerAncestralDiscrete,
    DpmSolverMultistep,
    DpmSolverSde,
    LmsDiscrete,
    Ddim,
    Pndm,
    Ddpm,
    HeunDiscrete,
    Kdpm2Discrete,
    Kdpm2AncestralDiscrete,
    DeisMultistep,
    UniPcMultistep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// Numeric parameters carried over from one scheduler configuration to the next.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerParams {
    pub beta_start: f64,
    pub beta_end: f64,
    pub train_timesteps: usize,
    pub steps_offset: usize,
    pub prediction_type: PredictionType,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            beta_start: 0.00085,
            beta_end: 0.012,
            train_timesteps: 1000,
            steps_offset: 1,
            prediction_type: PredictionType::Epsilon,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub algorithm: SchedulerAlgorithm,
    pub use_karras_variant: bool,
    pub params: SchedulerParams,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(SchedulerName::default().algorithm(), SchedulerParams::default())
    }
}

impl SchedulerConfig {
    pub fn new(algorithm: SchedulerAlgorithm, params: SchedulerParams) -> Self {
        Self {
            algorithm,
            use_karras_variant: false,
            params,
        }
    }
}

/// Builds the configuration for `name`, inheriting the numeric parameters of `current`.
///
/// The Karras flag is always set explicitly, so applying a non-Karras name after a Karras one
/// clears it.
pub fn reconfigure(current: &SchedulerConfig, name: &str) -> Result<SchedulerConfig, SchedulerError> {
    let name = SchedulerName::lookup(name)?;
    Ok(SchedulerConfig {
        algorithm: name.algorithm(),
        use_karras_variant: name.is_karras(),
        params: current.params,
    })
}
