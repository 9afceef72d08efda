//! Static network configuration: layer geometry, treatment placement, the
//! missing-data specification, and sampler hyper-parameters.
//!
//! Everything here is resolved and validated once, before any tensor work.
//! In particular the role of every layer boundary is fixed at construction
//! (`NetConfig::layer_roles`) instead of being re-derived on each likelihood
//! call.

use std::ops::Range;

use crate::error::{Result, StoNetError};

/// Where the realized treatment enters the latent chain.
#[derive(Debug, Clone)]
pub enum TreatNodes {
    /// A single logit column; the treatment is binary and the propensity
    /// score is a sigmoid of that logit.
    Binary {
        col: usize,
        /// Positive-class weight for the treatment label loss.
        pos_weight: Option<f64>,
    },
    /// A contiguous block of logit columns; the treatment is categorical and
    /// the propensity score is a softmax over the block.
    Categorical {
        cols: Range<usize>,
        /// Per-class weights for the treatment label loss.
        class_weights: Option<Vec<f64>>,
    },
}

impl TreatNodes {
    /// Column range occupied by the treatment block.
    pub fn col_range(&self) -> Range<usize> {
        match self {
            TreatNodes::Binary { col, .. } => *col..(*col + 1),
            TreatNodes::Categorical { cols, .. } => cols.clone(),
        }
    }

    pub fn width(&self) -> usize {
        self.col_range().len()
    }
}

/// Treatment placement within the chain.
#[derive(Debug, Clone)]
pub struct Treatment {
    /// Index of the hidden layer carrying the treatment block, in
    /// `[0, num_hidden - 1]`.
    pub layer: usize,
    pub nodes: TreatNodes,
}

/// How covariate missingness is generated.
#[derive(Debug, Clone)]
pub enum MissPattern {
    /// Missing at random: imputation only, no indicator channel.
    Mar,
    /// Missing not at random: observed indicators occupy latent columns one
    /// layer after the treatment layer, and the structural mask severs their
    /// connection to the layer that consumes them.
    Mnar {
        /// Columns of layer `treat_layer + 1` holding the observed
        /// indicators, one per missing covariate.
        obs_ind_cols: Range<usize>,
    },
}

/// Missing-covariate specification.
#[derive(Debug, Clone)]
pub struct MissingSpec {
    pub pattern: MissPattern,
    /// Input columns that contain missing entries.
    pub miss_cols: Vec<usize>,
    /// Conditional-independence graph: `graph[i]` lists the i-th missing
    /// column first, followed by the covariates it is conditioned on.
    pub graph: Vec<Vec<usize>>,
}

impl MissingSpec {
    pub fn obs_ind_cols(&self) -> Option<Range<usize>> {
        match &self.pattern {
            MissPattern::Mar => None,
            MissPattern::Mnar { obs_ind_cols } => Some(obs_ind_cols.clone()),
        }
    }
}

/// Role of a layer boundary, resolved once at construction.
///
/// Boundary `i` relates latent layer `i` to its predecessor (boundary 0
/// relates the first latent layer to the cached input transform, boundary
/// `num_hidden` relates the outcome to the last latent layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerRole {
    /// Gaussian fit against the cached first forward pass.
    Input,
    /// Label loss on the treatment block, Gaussian on the flanking columns.
    Treatment,
    /// Label loss on the observed-indicator block, Gaussian on the flanks.
    ObservedIndicator,
    /// Externally supplied outcome loss.
    Output,
    /// Gaussian fit between adjacent latent layers.
    Latent,
}

/// Static geometry of the stochastic network.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub input_dim: usize,
    pub output_dim: usize,
    /// One entry per hidden layer; the chain has `hidden_dims.len() + 1`
    /// transforms.
    pub hidden_dims: Vec<usize>,
    pub treatment: Treatment,
    pub missing: Option<MissingSpec>,
}

impl NetConfig {
    pub fn num_hidden(&self) -> usize {
        self.hidden_dims.len()
    }

    pub fn is_mnar(&self) -> bool {
        matches!(
            self.missing,
            Some(MissingSpec {
                pattern: MissPattern::Mnar { .. },
                ..
            })
        )
    }

    /// Resolve the role of every boundary `0..=num_hidden`.
    ///
    /// Boundary 0 is always `Input`, even when the treatment layer is 0; the
    /// sampler still pins the treatment columns there through the momentum
    /// mask, so the block never drifts.
    pub fn layer_roles(&self) -> Vec<LayerRole> {
        let num_hidden = self.num_hidden();
        let obs_layer = self.is_mnar().then(|| self.treatment.layer + 1);
        (0..=num_hidden)
            .map(|index| {
                if index == 0 {
                    LayerRole::Input
                } else if index == self.treatment.layer {
                    LayerRole::Treatment
                } else if index == num_hidden {
                    LayerRole::Output
                } else if obs_layer == Some(index) {
                    LayerRole::ObservedIndicator
                } else {
                    LayerRole::Latent
                }
            })
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 || self.output_dim == 0 {
            return Err(StoNetError::config("input and output dims must be positive"));
        }
        if self.hidden_dims.is_empty() {
            return Err(StoNetError::config("at least one hidden layer is required"));
        }
        if self.hidden_dims.iter().any(|&d| d == 0) {
            return Err(StoNetError::config("hidden dims must be positive"));
        }

        let num_hidden = self.num_hidden();
        let treat = &self.treatment;
        if treat.layer >= num_hidden {
            return Err(StoNetError::config(format!(
                "treat_layer {} out of range for {} hidden layers",
                treat.layer, num_hidden
            )));
        }
        let block = treat.nodes.col_range();
        let treat_dim = self.hidden_dims[treat.layer];
        if block.is_empty() || block.end > treat_dim {
            return Err(StoNetError::config(format!(
                "treatment block {:?} does not fit layer {} of width {}",
                block, treat.layer, treat_dim
            )));
        }
        if let TreatNodes::Categorical {
            cols,
            class_weights: Some(w),
        } = &treat.nodes
        {
            if w.len() != cols.len() {
                return Err(StoNetError::config(format!(
                    "{} class weights for a treatment block of width {}",
                    w.len(),
                    cols.len()
                )));
            }
        }

        if let Some(miss) = &self.missing {
            self.validate_missing(miss)?;
        }
        Ok(())
    }

    fn validate_missing(&self, miss: &MissingSpec) -> Result<()> {
        if miss.miss_cols.is_empty() {
            return Err(StoNetError::config("miss_cols must not be empty"));
        }
        if miss.miss_cols.iter().any(|&c| c >= self.input_dim) {
            return Err(StoNetError::config("miss_cols exceed the input dimension"));
        }
        if miss.graph.len() != miss.miss_cols.len() {
            return Err(StoNetError::config(format!(
                "graph has {} entries for {} missing columns",
                miss.graph.len(),
                miss.miss_cols.len()
            )));
        }
        for (entry, &col) in miss.graph.iter().zip(miss.miss_cols.iter()) {
            if entry.len() < 2 {
                return Err(StoNetError::config(format!(
                    "graph entry for column {} needs at least one conditioning covariate",
                    col
                )));
            }
            if entry[0] != col {
                return Err(StoNetError::config(format!(
                    "graph entry must start with its own missing column {}, got {}",
                    col, entry[0]
                )));
            }
            if entry.iter().any(|&c| c >= self.input_dim) {
                return Err(StoNetError::config(format!(
                    "graph entry for column {} exceeds the input dimension",
                    col
                )));
            }
        }

        if let MissPattern::Mnar { obs_ind_cols } = &miss.pattern {
            let obs_layer = self.treatment.layer + 1;
            // the indicator layer must exist and must feed a later transform
            if obs_layer + 1 > self.num_hidden() {
                return Err(StoNetError::config(
                    "mnar needs the observed-indicator layer strictly before the output layer",
                ));
            }
            let obs_dim = self.hidden_dims[obs_layer];
            if obs_ind_cols.is_empty() || obs_ind_cols.end > obs_dim {
                return Err(StoNetError::config(format!(
                    "observed-indicator block {:?} does not fit layer {} of width {}",
                    obs_ind_cols, obs_layer, obs_dim
                )));
            }
            if obs_ind_cols.len() != miss.miss_cols.len() {
                return Err(StoNetError::config(format!(
                    "{} observed-indicator columns for {} missing columns",
                    obs_ind_cols.len(),
                    miss.miss_cols.len()
                )));
            }
            let treat_block = self.treatment.nodes.col_range();
            if obs_layer == self.treatment.layer && ranges_overlap(&treat_block, obs_ind_cols) {
                return Err(StoNetError::config(
                    "observed-indicator block overlaps the treatment block",
                ));
            }
        }
        Ok(())
    }
}

fn ranges_overlap(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}

/// Hyper-parameters for one call to backward imputation.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Number of SGHMC steps per call.
    pub mh_step: usize,
    /// Per-layer learning rates for the latent updates, `num_hidden` entries.
    pub impute_lrs: Vec<f64>,
    /// Momentum decay / Langevin noise scale, in `[0, 1)`.
    pub alpha: f64,
    /// Learning rate for the missing-covariate update.
    pub miss_lr: f64,
    /// Multiplier on the treatment label log-likelihood.
    pub treat_loss_weight: f64,
    /// Multiplier on the observed-indicator log-likelihood.
    pub obs_ind_loss_weight: f64,
    /// Per-boundary noise variances, `num_hidden + 1` entries, all positive.
    pub sigma_list: Vec<f64>,
}

impl SamplerConfig {
    /// Uniform learning rate and noise variance across layers, unit loss
    /// weights; a reasonable starting point for experiments.
    pub fn uniform(num_hidden: usize, mh_step: usize, lr: f64, alpha: f64, sigma: f64) -> Self {
        Self {
            mh_step,
            impute_lrs: vec![lr; num_hidden],
            alpha,
            miss_lr: lr,
            treat_loss_weight: 1.0,
            obs_ind_loss_weight: 1.0,
            sigma_list: vec![sigma; num_hidden + 1],
        }
    }

    pub fn validate(&self, num_hidden: usize) -> Result<()> {
        if self.impute_lrs.len() != num_hidden {
            return Err(StoNetError::config(format!(
                "{} impute_lrs for {} hidden layers",
                self.impute_lrs.len(),
                num_hidden
            )));
        }
        if self.sigma_list.len() != num_hidden + 1 {
            return Err(StoNetError::config(format!(
                "sigma_list needs {} entries, got {}",
                num_hidden + 1,
                self.sigma_list.len()
            )));
        }
        if self.sigma_list.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(StoNetError::config("sigma_list entries must be positive"));
        }
        if !(0.0..1.0).contains(&self.alpha) {
            return Err(StoNetError::config("alpha must lie in [0, 1)"));
        }
        Ok(())
    }
}
