//! Backward imputation by stochastic-gradient Hamiltonian Monte Carlo.
//!
//! Each call rebuilds the latent state from a single deterministic forward
//! pass, then runs `mh_step` sweeps. A sweep updates every hidden layer from
//! the output toward the input with a momentum + Langevin-noise step, so each
//! layer's gradient already reflects the just-updated deeper layer, and then
//! updates the imputed missing covariates. Treatment and observed-indicator
//! columns are pinned: their momentum is zeroed on every sweep because those
//! values are determined by observed data.

use candle_core::{Tensor, Var};
use log::debug;

use crate::config::SamplerConfig;
use crate::error::{Result, StoNetError};
use crate::likelihood::sum_squared_error;
use crate::mask::ParamMask;
use crate::missing::missing_likelihood;
use crate::net::{LatentState, StoNetCausal};
use crate::noise::GaussianNoise;
use crate::tensor_ops::{add_to_cols, overwrite_cols, select_cols, zero_cols};

/// One batch of observations for imputation.
pub struct ImputationBatch<'a> {
    /// Covariates, shape `(n, input_dim)`; missing entries hold their current
    /// imputed values.
    pub x: &'a Tensor,
    /// Realized treatment, shape `(n, treatment_width)`.
    pub treat: &'a Tensor,
    /// Outcome labels, whatever shape the outcome loss expects.
    pub y: &'a Tensor,
    /// Missingness flags per missing column, shape `(n, miss_cols.len())`,
    /// `1` where the entry is actually missing. Required exactly when the
    /// network has a missing-data specification.
    pub miss_ind: Option<&'a Tensor>,
}

/// Updated latent targets and imputed input, returned to the caller for the
/// per-layer supervised fits.
#[derive(Debug)]
pub struct Imputation {
    /// One tensor per hidden layer.
    pub hidden: Vec<Tensor>,
    /// The input with refreshed values in the flagged missing entries; the
    /// caller's tensor is left untouched.
    pub x: Tensor,
}

/// SGHMC sampler imputing latent layers and missing covariates.
pub struct ImputationSampler<R: GaussianNoise> {
    noise: R,
}

impl<R: GaussianNoise> ImputationSampler<R> {
    pub fn new(noise: R) -> Self {
        Self { noise }
    }

    /// Run `cfg.mh_step` sweeps of backward imputation.
    ///
    /// * `net` - the stochastic network
    /// * `cfg` - sampler hyper-parameters
    /// * `outcome_loss` - summed loss `(prediction, label) -> scalar`
    /// * `batch` - observations
    /// * `prune` - pruning mask applied to every evaluation
    pub fn run<L>(
        &mut self,
        net: &StoNetCausal,
        cfg: &SamplerConfig,
        outcome_loss: &L,
        batch: &ImputationBatch<'_>,
        prune: &ParamMask,
    ) -> Result<Imputation>
    where
        L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    {
        let num_hidden = net.num_hidden();
        cfg.validate(num_hidden)?;
        net.check_treat_shape(batch.treat, batch.x)?;
        self.check_missing_contract(net, cfg, batch)?;

        let treat_layer = net.config().treatment.layer;
        let treat_block = net.config().treatment.nodes.col_range();
        let obs_block = net
            .missing_spec()
            .and_then(|spec| spec.obs_ind_cols())
            .map(|cols| (treat_layer + 1, cols));

        debug!(
            "backward imputation: {} sweeps over {} latent layers",
            cfg.mh_step, num_hidden
        );

        // single deterministic forward pass seeds the latent state; the
        // treatment block and, under MNAR, the observed indicators are
        // overwritten by their realized values
        let mut hidden: Vec<Var> = Vec::with_capacity(num_hidden);
        let mut momentum: Vec<Tensor> = Vec::with_capacity(num_hidden);
        let mut cur = batch.x.clone();
        for index in 0..num_hidden {
            let mut h = net.layer_output(index, &cur, prune)?.detach();
            if index == treat_layer {
                h = overwrite_cols(&h, treat_block.clone(), batch.treat)?;
            }
            if let Some((obs_layer, cols)) = &obs_block {
                if index == *obs_layer {
                    let miss_ind = batch.miss_ind.ok_or_else(|| {
                        StoNetError::contract("mnar imputation requires miss_ind")
                    })?;
                    let obs_ind = miss_ind.affine(-1.0, 1.0)?;
                    h = overwrite_cols(&h, cols.clone(), &obs_ind)?;
                }
            }
            cur = h.clone();
            momentum.push(h.zeros_like()?);
            hidden.push(Var::from_tensor(&h)?);
        }
        let mut forward_hidden = hidden[0].as_tensor().copy()?;

        let mut x_cur = batch.x.clone();
        let mut miss_momentum = match (net.missing_spec(), batch.miss_ind) {
            (Some(spec), Some(miss_ind)) => {
                let (nn, _) = batch.x.dims2()?;
                if miss_ind.dims() != [nn, spec.miss_cols.len()] {
                    return Err(StoNetError::contract(format!(
                        "miss_ind shape {:?}, expected ({}, {})",
                        miss_ind.dims(),
                        nn,
                        spec.miss_cols.len()
                    )));
                }
                Some(miss_ind.zeros_like()?)
            }
            _ => None,
        };

        for _step in 0..cfg.mh_step {
            // latent updates, deepest first
            for index in (0..num_hidden).rev() {
                let state = LatentState {
                    forward_hidden: &forward_hidden,
                    hidden: &hidden,
                    y: batch.y,
                };
                let ll_deeper =
                    net.layer_likelihood(index + 1, &state, outcome_loss, cfg, prune)?;
                let ll_here = net.layer_likelihood(index, &state, outcome_loss, cfg, prune)?;
                let grads = ((ll_deeper + ll_here)?).backward()?;
                let grad = grads
                    .get(hidden[index].as_tensor())
                    .ok_or_else(|| StoNetError::NoGradient {
                        target: format!("latent layer {}", index),
                    })?;

                let lr = cfg.impute_lrs[index];
                let noise = self.noise.standard_normal_like(grad)?;
                let mut m = ((&momentum[index] * (1.0 - cfg.alpha))? + (grad * lr)?)?;
                m = (m + (noise * (2.0 * cfg.alpha).sqrt())?)?;
                if index == treat_layer {
                    m = zero_cols(&m, treat_block.clone())?;
                }
                if let Some((obs_layer, cols)) = &obs_block {
                    if index == *obs_layer {
                        m = zero_cols(&m, cols.clone())?;
                    }
                }
                hidden[index].set(&(hidden[index].as_tensor() + (&m * lr)?)?)?;
                momentum[index] = m;
            }

            // missing-covariate update
            if let (Some(spec), Some(miss_ind), Some(m_prev)) =
                (net.missing_spec(), batch.miss_ind, miss_momentum.take())
            {
                let x_var = Var::from_tensor(&x_cur)?;
                let ll_graph = missing_likelihood(x_var.as_tensor(), spec)?;
                let first = net.layer_output(0, x_var.as_tensor(), prune)?;
                let sse = sum_squared_error(&first, hidden[0].as_tensor())?;
                let ll_consistency = (sse.neg()? / (2.0 * cfg.sigma_list[0]))?;

                let grads = ((ll_graph + ll_consistency)?).backward()?;
                let grad_x = grads
                    .get(x_var.as_tensor())
                    .ok_or_else(|| StoNetError::NoGradient {
                        target: "imputed input".to_string(),
                    })?;
                let grad_miss = select_cols(grad_x, &spec.miss_cols)?;

                let noise = self.noise.standard_normal_like(&grad_miss)?;
                let mut m = ((&m_prev * (1.0 - cfg.alpha))? + (grad_miss * cfg.miss_lr)?)?;
                m = (m + (noise * (2.0 * cfg.alpha).sqrt())?)?;
                // only the entries actually flagged missing may move
                m = m.mul(miss_ind)?;

                x_cur = add_to_cols(&x_cur, &spec.miss_cols, &(&m * cfg.miss_lr)?)?;
                miss_momentum = Some(m);

                forward_hidden = net.layer_output(0, &x_cur, prune)?.detach();
            }
        }

        Ok(Imputation {
            hidden: hidden.iter().map(|h| h.as_tensor().detach()).collect(),
            x: x_cur,
        })
    }

    fn check_missing_contract(
        &self,
        net: &StoNetCausal,
        cfg: &SamplerConfig,
        batch: &ImputationBatch<'_>,
    ) -> Result<()> {
        match (net.missing_spec(), batch.miss_ind) {
            (Some(_), None) => Err(StoNetError::contract(
                "network configured for missing data but miss_ind was not supplied",
            )),
            (None, Some(_)) => Err(StoNetError::contract(
                "miss_ind supplied to a network without a missing-data specification",
            )),
            (Some(_), Some(_)) if !(cfg.miss_lr > 0.0) => Err(StoNetError::contract(
                "missing-data imputation requires a positive miss_lr",
            )),
            _ => Ok(()),
        }
    }
}
