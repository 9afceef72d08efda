//! Layer-wise stochastic latent-variable network for causal effect
//! estimation with partially missing covariates.
//!
//! A feed-forward chain is turned into a latent-variable model: every hidden
//! layer carries a conditional likelihood given its predecessor, with special
//! treatment of the layer holding the treatment block, the layer holding the
//! observed-missingness indicators (MNAR mode), and the outcome boundary. The
//! `ImputationSampler` alternates SGHMC updates of the latent layers and of
//! the imputed missing covariates; the caller owns the outer loop and the
//! per-layer supervised fits against the imputed targets.

pub mod config;
pub mod error;
pub mod layers;
pub mod likelihood;
pub mod mask;
pub mod missing;
pub mod net;
pub mod noise;
pub mod sampler;
pub mod tensor_ops;

pub use config::{
    LayerRole, MissPattern, MissingSpec, NetConfig, SamplerConfig, TreatNodes, Treatment,
};
pub use error::{Result, StoNetError};
pub use mask::{LayerMask, ParamMask};
pub use missing::missing_likelihood;
pub use net::{LatentState, StoNetCausal};
pub use noise::{DeviceNoise, GaussianNoise, SeededNoise};
pub use sampler::{Imputation, ImputationBatch, ImputationSampler};

pub use candle_core;
pub use candle_nn;
