//! Gaussian noise sources for the Langevin updates.
//!
//! The sampler never draws randomness on its own; it asks a `GaussianNoise`
//! implementation for standard-normal tensors. Seed `SeededNoise` to make a
//! whole sampling run reproducible.

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::Result;

/// Standard-normal generator matching the shape of a target tensor.
pub trait GaussianNoise {
    fn standard_normal_like(&mut self, like: &Tensor) -> Result<Tensor>;
}

/// Draws from the tensor engine's own RNG.
#[derive(Debug, Default)]
pub struct DeviceNoise;

impl GaussianNoise for DeviceNoise {
    fn standard_normal_like(&mut self, like: &Tensor) -> Result<Tensor> {
        Ok(like.randn_like(0.0, 1.0)?)
    }
}

/// Seeded generator for reproducible runs.
#[derive(Debug)]
pub struct SeededNoise {
    rng: StdRng,
}

impl SeededNoise {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl GaussianNoise for SeededNoise {
    fn standard_normal_like(&mut self, like: &Tensor) -> Result<Tensor> {
        let data: Vec<f32> = (0..like.elem_count())
            .map(|_| StandardNormal.sample(&mut self.rng))
            .collect();
        Ok(Tensor::from_vec(data, like.dims(), like.device())?)
    }
}
