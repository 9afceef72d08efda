//! The stochastic causal network: transform chain, masking, and the
//! per-layer conditional likelihood model.
//!
//! The chain is an ordinary feed-forward network; what makes it stochastic is
//! that `layer_likelihood` treats each hidden layer as a latent variable with
//! a Gaussian (or label-loss) conditional given its predecessor. The sampler
//! in `crate::sampler` drives those likelihoods to impute the latent states.

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops;

use crate::config::{LayerRole, MissingSpec, NetConfig, SamplerConfig, TreatNodes};
use crate::error::{Result, StoNetError};
use crate::layers::LayerChain;
use crate::likelihood::{bce_with_logits_sum, cross_entropy_sum, sum_squared_error};
use crate::mask::{mnar_structural_mask, ParamMask};
use crate::tensor_ops::overwrite_cols;

/// Latent state threaded through likelihood evaluations.
pub struct LatentState<'a> {
    /// Cached output of the first transform, refreshed by the sampler after
    /// each missing-value update.
    pub forward_hidden: &'a Tensor,
    /// Current latent values, one `Var` per hidden layer.
    pub hidden: &'a [Var],
    /// Outcome labels.
    pub y: &'a Tensor,
}

/// Stochastic feed-forward network with a treatment block and optional
/// missing-data channel.
pub struct StoNetCausal {
    chain: LayerChain,
    roles: Vec<LayerRole>,
    cfg: NetConfig,
    /// Structural mask on the layer consuming the observed indicators.
    mnar_mask: Option<(usize, Tensor)>,
    treat_class_weights: Option<Tensor>,
    device: Device,
}

impl StoNetCausal {
    /// Build the network on `device`, validating the configuration first.
    /// The MNAR structural mask, if any, is applied to the stored weights
    /// immediately so the severed block starts at zero.
    pub fn new(cfg: NetConfig, device: &Device) -> Result<Self> {
        cfg.validate()?;
        let chain = LayerChain::new(&cfg, device)?;
        let roles = cfg.layer_roles();

        let mnar_mask = match cfg.missing.as_ref().and_then(MissingSpec::obs_ind_cols) {
            Some(obs_ind_cols) => {
                let masked_layer = cfg.treatment.layer + 2;
                let layer = chain.get(masked_layer);
                let mask = mnar_structural_mask(
                    layer.out_dim(),
                    layer.in_dim(),
                    obs_ind_cols,
                    device,
                )?;
                Some((masked_layer, mask))
            }
            None => None,
        };

        let treat_class_weights = match &cfg.treatment.nodes {
            TreatNodes::Categorical {
                class_weights: Some(w),
                ..
            } => {
                let w_k: Vec<f32> = w.iter().map(|&v| v as f32).collect();
                let len = w_k.len();
                Some(Tensor::from_vec(w_k, (1, len), device)?)
            }
            _ => None,
        };

        let net = Self {
            chain,
            roles,
            cfg,
            mnar_mask,
            treat_class_weights,
            device: device.clone(),
        };
        net.apply_mnar_mask()?;
        Ok(net)
    }

    pub fn config(&self) -> &NetConfig {
        &self.cfg
    }

    pub fn num_hidden(&self) -> usize {
        self.cfg.num_hidden()
    }

    pub fn missing_spec(&self) -> Option<&MissingSpec> {
        self.cfg.missing.as_ref()
    }

    pub fn roles(&self) -> &[LayerRole] {
        &self.roles
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// All trainable parameters, for an external optimizer.
    pub fn parameters(&self) -> Vec<Var> {
        self.chain
            .iter()
            .flat_map(|layer| [layer.weight().clone(), layer.bias().clone()])
            .collect()
    }

    /// Masked output of one chain transform.
    pub fn layer_output(&self, index: usize, input: &Tensor, prune: &ParamMask) -> Result<Tensor> {
        let layer_mask = prune.layer(index);
        let mut weight_masks: Vec<&Tensor> = Vec::with_capacity(2);
        if let Some(mask) = layer_mask.and_then(|m| m.weight.as_ref()) {
            weight_masks.push(mask);
        }
        if let Some((masked_layer, mask)) = &self.mnar_mask {
            if *masked_layer == index {
                weight_masks.push(mask);
            }
        }
        self.chain.get(index).forward_masked(
            input,
            &weight_masks,
            layer_mask.and_then(|m| m.bias.as_ref()),
        )
    }

    /// Feed-forward evaluation with treatment substitution.
    ///
    /// Runs the chain on `x_nd`; at the treatment layer the pre-overwrite
    /// logits become the propensity score (sigmoid for a binary treatment,
    /// row softmax for a categorical one) and the realized `treat_nk` values
    /// replace those columns, so deeper layers see the observed treatment.
    ///
    /// # Returns `(out_nd, propensity_nk)`
    pub fn forward(
        &self,
        x_nd: &Tensor,
        treat_nk: &Tensor,
        prune: &ParamMask,
    ) -> Result<(Tensor, Tensor)> {
        self.check_treat_shape(treat_nk, x_nd)?;
        let block = self.cfg.treatment.nodes.col_range();
        let mut x = x_nd.clone();
        let mut propensity = None;
        for index in 0..self.chain.len() {
            x = self.layer_output(index, &x, prune)?;
            if index == self.cfg.treatment.layer {
                let logits = x.narrow(1, block.start, block.len())?;
                let ps = match &self.cfg.treatment.nodes {
                    TreatNodes::Binary { .. } => ops::sigmoid(&logits)?,
                    TreatNodes::Categorical { .. } => ops::softmax(&logits, 1)?,
                };
                propensity = Some(ps);
                x = overwrite_cols(&x, block.clone(), treat_nk)?;
            }
        }
        let propensity = propensity
            .ok_or_else(|| StoNetError::contract("treatment layer was never reached"))?;
        Ok((x, propensity))
    }

    /// Conditional log-likelihood of boundary `index`, `0..=num_hidden`.
    ///
    /// Gaussian terms are scaled by `1 / (2 sigma[index])`; the treatment and
    /// observed-indicator label terms are weighted by their loss weights and
    /// deliberately carry no sigma scaling.
    pub fn layer_likelihood<L>(
        &self,
        index: usize,
        state: &LatentState<'_>,
        outcome_loss: &L,
        cfg: &SamplerConfig,
        prune: &ParamMask,
    ) -> Result<Tensor>
    where
        L: Fn(&Tensor, &Tensor) -> candle_core::Result<Tensor>,
    {
        if index >= self.roles.len() {
            return Err(StoNetError::contract(format!(
                "layer index {} out of range for {} boundaries",
                index,
                self.roles.len()
            )));
        }
        if state.hidden.len() != self.num_hidden() {
            return Err(StoNetError::contract(format!(
                "latent state holds {} layers, network has {}",
                state.hidden.len(),
                self.num_hidden()
            )));
        }
        cfg.validate(self.num_hidden())?;
        let sigma = cfg.sigma_list[index];
        match self.roles[index] {
            LayerRole::Input => {
                let h0 = state.hidden[0].as_tensor();
                let sse = sum_squared_error(state.forward_hidden, h0)?;
                Ok((sse.neg()? / (2.0 * sigma))?)
            }
            LayerRole::Treatment => {
                let prev = state.hidden[index - 1].as_tensor();
                let z = self.layer_output(index, prev, prune)?;
                let h = state.hidden[index].as_tensor();
                let block = self.cfg.treatment.nodes.col_range();

                let z_block = z.narrow(1, block.start, block.len())?;
                let target = h.narrow(1, block.start, block.len())?;
                let label_loss = match &self.cfg.treatment.nodes {
                    TreatNodes::Binary { pos_weight, .. } => {
                        bce_with_logits_sum(&z_block, &target, *pos_weight)?
                    }
                    TreatNodes::Categorical { .. } => {
                        cross_entropy_sum(&z_block, &target, self.treat_class_weights.as_ref())?
                    }
                };
                let label_ll = (label_loss.neg()? * cfg.treat_loss_weight)?;
                let flanks = self.gaussian_flanks(&z, h, block, sigma)?;
                Ok((label_ll + flanks)?)
            }
            LayerRole::ObservedIndicator => {
                let block = self
                    .missing_spec()
                    .and_then(MissingSpec::obs_ind_cols)
                    .ok_or_else(|| {
                        StoNetError::contract("observed-indicator role without an mnar configuration")
                    })?;
                let prev = state.hidden[index - 1].as_tensor();
                let z = self.layer_output(index, prev, prune)?;
                let h = state.hidden[index].as_tensor();

                let z_block = z.narrow(1, block.start, block.len())?;
                let target = h.narrow(1, block.start, block.len())?;
                let label_loss = bce_with_logits_sum(&z_block, &target, None)?;
                let label_ll = (label_loss.neg()? * cfg.obs_ind_loss_weight)?;
                let flanks = self.gaussian_flanks(&z, h, block, sigma)?;
                Ok((label_ll + flanks)?)
            }
            LayerRole::Output => {
                let prev = state.hidden[index - 1].as_tensor();
                let out = self.layer_output(index, prev, prune)?;
                let loss = outcome_loss(&out, state.y)?;
                Ok((loss.neg()? / (2.0 * sigma))?)
            }
            LayerRole::Latent => {
                let prev = state.hidden[index - 1].as_tensor();
                let z = self.layer_output(index, prev, prune)?;
                let sse = sum_squared_error(&z, state.hidden[index].as_tensor())?;
                Ok((sse.neg()? / (2.0 * sigma))?)
            }
        }
    }

    /// Gaussian log-likelihood of the columns strictly before and strictly
    /// after `block`, never including the block itself.
    fn gaussian_flanks(
        &self,
        z_nd: &Tensor,
        target_nd: &Tensor,
        block: std::ops::Range<usize>,
        sigma: f64,
    ) -> Result<Tensor> {
        let (_, dim) = z_nd.dims2()?;
        let mut total = Tensor::zeros((), DType::F32, &self.device)?;
        if block.start > 0 {
            let sse = sum_squared_error(
                &z_nd.narrow(1, 0, block.start)?,
                &target_nd.narrow(1, 0, block.start)?,
            )?;
            total = (total + (sse.neg()? / (2.0 * sigma))?)?;
        }
        if block.end < dim {
            let sse = sum_squared_error(
                &z_nd.narrow(1, block.end, dim - block.end)?,
                &target_nd.narrow(1, block.end, dim - block.end)?,
            )?;
            total = (total + (sse.neg()? / (2.0 * sigma))?)?;
        }
        Ok(total)
    }

    /// Re-zero the structural MNAR block in place. Idempotent; a no-op
    /// outside MNAR mode.
    pub fn apply_mnar_mask(&self) -> Result<()> {
        if let Some((masked_layer, mask)) = &self.mnar_mask {
            self.chain
                .get(*masked_layer)
                .mask_params_in_place(Some(mask), None)?;
        }
        Ok(())
    }

    /// Zero pruned parameter entries in place. Idempotent.
    pub fn apply_param_mask(&self, prune: &ParamMask) -> Result<()> {
        prune.validate(&self.chain.shapes())?;
        for index in 0..self.chain.len() {
            if let Some(mask) = prune.layer(index) {
                self.chain
                    .get(index)
                    .mask_params_in_place(mask.weight.as_ref(), mask.bias.as_ref())?;
            }
        }
        Ok(())
    }

    /// Zero the gradients of pruned and structurally masked parameters, so an
    /// optimizer step cannot reintroduce severed connections.
    pub fn mask_gradients(&self, grads: &mut GradStore, prune: &ParamMask) -> Result<()> {
        prune.validate(&self.chain.shapes())?;
        for index in 0..self.chain.len() {
            let layer = self.chain.get(index);

            let mut weight_masks: Vec<&Tensor> = Vec::with_capacity(2);
            if let Some(mask) = prune.layer(index).and_then(|m| m.weight.as_ref()) {
                weight_masks.push(mask);
            }
            if let Some((masked_layer, mask)) = &self.mnar_mask {
                if *masked_layer == index {
                    weight_masks.push(mask);
                }
            }
            if !weight_masks.is_empty() {
                if let Some(grad) = grads.get(layer.weight().as_tensor()) {
                    let mut masked = grad.clone();
                    for mask in &weight_masks {
                        masked = masked.mul(mask)?;
                    }
                    grads.insert(layer.weight().as_tensor(), masked);
                }
            }
            if let Some(mask) = prune.layer(index).and_then(|m| m.bias.as_ref()) {
                if let Some(grad) = grads.get(layer.bias().as_tensor()) {
                    let masked = grad.mul(mask)?;
                    grads.insert(layer.bias().as_tensor(), masked);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn check_treat_shape(&self, treat_nk: &Tensor, x_nd: &Tensor) -> Result<()> {
        let (nn, _) = x_nd.dims2()?;
        let width = self.cfg.treatment.nodes.width();
        if treat_nk.dims() != [nn, width] {
            return Err(StoNetError::contract(format!(
                "treatment tensor shape {:?}, expected ({}, {})",
                treat_nk.dims(),
                nn,
                width
            )));
        }
        Ok(())
    }

    pub(crate) fn chain(&self) -> &LayerChain {
        &self.chain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MissPattern, Treatment};
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn binary_config() -> NetConfig {
        NetConfig {
            input_dim: 4,
            output_dim: 1,
            hidden_dims: vec![4, 3],
            treatment: Treatment {
                layer: 0,
                nodes: TreatNodes::Binary {
                    col: 0,
                    pos_weight: None,
                },
            },
            missing: None,
        }
    }

    fn mnar_config() -> NetConfig {
        NetConfig {
            input_dim: 4,
            output_dim: 1,
            hidden_dims: vec![4, 3, 3],
            treatment: Treatment {
                layer: 0,
                nodes: TreatNodes::Binary {
                    col: 0,
                    pos_weight: None,
                },
            },
            missing: Some(MissingSpec {
                pattern: MissPattern::Mnar { obs_ind_cols: 0..2 },
                miss_cols: vec![1, 2],
                graph: vec![vec![1, 0, 3], vec![2, 0, 3]],
            }),
        }
    }

    #[test]
    fn binary_propensity_lies_in_unit_interval() -> Result<()> {
        let device = Device::Cpu;
        let net = StoNetCausal::new(binary_config(), &device)?;
        let x = Tensor::randn(0f32, 1f32, (8, 4), &device)?;
        let treat = Tensor::ones((8, 1), DType::F32, &device)?;
        let (out, ps) = net.forward(&x, &treat, &ParamMask::NoMask)?;
        assert_eq!(out.dims(), &[8, 1]);
        for row in ps.to_vec2::<f32>()? {
            assert!(row[0] > 0.0 && row[0] < 1.0);
        }
        Ok(())
    }

    #[test]
    fn categorical_propensity_rows_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let mut cfg = binary_config();
        cfg.treatment.nodes = TreatNodes::Categorical {
            cols: 1..4,
            class_weights: None,
        };
        let net = StoNetCausal::new(cfg, &device)?;
        let x = Tensor::randn(0f32, 1f32, (5, 4), &device)?;
        let treat = Tensor::zeros((5, 3), DType::F32, &device)?;
        let (_, ps) = net.forward(&x, &treat, &ParamMask::NoMask)?;
        for row in ps.to_vec2::<f32>()? {
            let total: f32 = row.iter().sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-5);
            assert!(row.iter().all(|&p| p > 0.0));
        }
        Ok(())
    }

    #[test]
    fn forward_substitutes_realized_treatment() -> Result<()> {
        let device = Device::Cpu;
        let net = StoNetCausal::new(binary_config(), &device)?;
        let x = Tensor::randn(0f32, 1f32, (4, 4), &device)?;
        let treat_a = Tensor::zeros((4, 1), DType::F32, &device)?;
        let treat_b = Tensor::ones((4, 1), DType::F32, &device)?;
        let (out_a, ps_a) = net.forward(&x, &treat_a, &ParamMask::NoMask)?;
        let (out_b, ps_b) = net.forward(&x, &treat_b, &ParamMask::NoMask)?;
        // the propensity ignores the realized treatment, the outcome does not
        assert_eq!(ps_a.to_vec2::<f32>()?, ps_b.to_vec2::<f32>()?);
        assert_ne!(out_a.to_vec2::<f32>()?, out_b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn mnar_mask_application_is_idempotent() -> Result<()> {
        let device = Device::Cpu;
        let net = StoNetCausal::new(mnar_config(), &device)?;
        let masked_layer = net.config().treatment.layer + 2;

        let once = net.chain().get(masked_layer).weight().to_vec2::<f32>()?;
        // the severed block is already zero after construction
        for row in &once {
            assert_eq!(row[0], 0.0);
            assert_eq!(row[1], 0.0);
        }
        net.apply_mnar_mask()?;
        let twice = net.chain().get(masked_layer).weight().to_vec2::<f32>()?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn param_mask_zeroes_and_gradient_mask_holds() -> Result<()> {
        let device = Device::Cpu;
        let net = StoNetCausal::new(binary_config(), &device)?;

        let mut masks = vec![crate::mask::LayerMask::default(); 3];
        let mut weight_mask = vec![1f32; 4 * 4];
        weight_mask[0] = 0.0; // prune entry (0, 0) of layer 1
        masks[1].weight = Some(Tensor::from_vec(weight_mask, (4, 4), &device)?);
        let prune = ParamMask::UserMask(masks);

        net.apply_param_mask(&prune)?;
        let w = net.chain().get(1).weight().to_vec2::<f32>()?;
        assert_eq!(w[0][0], 0.0);

        // gradients through the masked forward are zero at the pruned entry
        let x = Tensor::randn(0f32, 1f32, (4, 4), &device)?;
        let treat = Tensor::zeros((4, 1), DType::F32, &device)?;
        let (out, _) = net.forward(&x, &treat, &prune)?;
        let mut grads = out.sum_all()?.backward()?;
        net.mask_gradients(&mut grads, &prune)?;
        let grad = grads
            .get(net.chain().get(1).weight().as_tensor())
            .expect("weight gradient");
        assert_eq!(grad.to_vec2::<f32>()?[0][0], 0.0);
        Ok(())
    }
}
