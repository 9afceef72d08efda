//! Linear layer stack backing the stochastic network.
//!
//! Layer 0 maps the raw input without a nonlinearity; every later transform
//! applies tanh to its input before the dense map, mirroring the chain the
//! likelihood model is written against. Parameters are `Var`s so the sampler
//! and an external optimizer can update them in place.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Linear, Module};

use crate::config::NetConfig;
use crate::error::Result;

/// Elementwise nonlinearity applied before a layer's dense map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nonlinearity {
    Tanh,
}

impl Nonlinearity {
    fn apply(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Nonlinearity::Tanh => x.tanh(),
        }
    }
}

/// One transform in the chain: optional pre-activation, then `x W^T + b`.
pub struct StoLayer {
    weight: Var,
    bias: Var,
    preact: Option<Nonlinearity>,
}

impl StoLayer {
    fn new(
        in_dim: usize,
        out_dim: usize,
        preact: Option<Nonlinearity>,
        device: &Device,
    ) -> Result<Self> {
        // Kaiming-style fan-in init, zero bias
        let std = (2.0 / in_dim as f64).sqrt() as f32;
        let init = Tensor::randn(0f32, std, (out_dim, in_dim), device)?;
        Ok(Self {
            weight: Var::from_tensor(&init)?,
            bias: Var::zeros(out_dim, DType::F32, device)?,
            preact,
        })
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    pub fn bias(&self) -> &Var {
        &self.bias
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn in_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Forward pass with effective parameters: the stored weight multiplied
    /// by every mask in `weight_masks`, and the bias by `bias_mask`.
    pub(crate) fn forward_masked(
        &self,
        x_nd: &Tensor,
        weight_masks: &[&Tensor],
        bias_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let x_nd = match &self.preact {
            Some(act) => act.apply(x_nd)?,
            None => x_nd.clone(),
        };
        let mut weight = self.weight.as_tensor().clone();
        for mask in weight_masks {
            weight = weight.mul(mask)?;
        }
        let mut bias = self.bias.as_tensor().clone();
        if let Some(mask) = bias_mask {
            bias = bias.mul(mask)?;
        }
        Ok(Linear::new(weight, Some(bias)).forward(&x_nd)?)
    }

    /// Zero masked parameter entries in place. Reapplying without an
    /// intervening parameter update is a no-op.
    pub(crate) fn mask_params_in_place(
        &self,
        weight_mask: Option<&Tensor>,
        bias_mask: Option<&Tensor>,
    ) -> Result<()> {
        if let Some(mask) = weight_mask {
            self.weight.set(&self.weight.as_tensor().mul(mask)?)?;
        }
        if let Some(mask) = bias_mask {
            self.bias.set(&self.bias.as_tensor().mul(mask)?)?;
        }
        Ok(())
    }
}

/// The ordered chain of `num_hidden + 1` transforms.
pub struct LayerChain {
    layers: Vec<StoLayer>,
}

impl LayerChain {
    pub(crate) fn new(cfg: &NetConfig, device: &Device) -> Result<Self> {
        let num_hidden = cfg.num_hidden();
        let mut layers = Vec::with_capacity(num_hidden + 1);
        layers.push(StoLayer::new(cfg.input_dim, cfg.hidden_dims[0], None, device)?);
        for i in 1..num_hidden {
            layers.push(StoLayer::new(
                cfg.hidden_dims[i - 1],
                cfg.hidden_dims[i],
                Some(Nonlinearity::Tanh),
                device,
            )?);
        }
        layers.push(StoLayer::new(
            cfg.hidden_dims[num_hidden - 1],
            cfg.output_dim,
            Some(Nonlinearity::Tanh),
            device,
        )?);
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> &StoLayer {
        &self.layers[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoLayer> {
        self.layers.iter()
    }

    /// `(out, in)` shapes of every layer, for mask validation.
    pub fn shapes(&self) -> Vec<(usize, usize)> {
        self.layers
            .iter()
            .map(|l| (l.out_dim(), l.in_dim()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetConfig, TreatNodes, Treatment};
    use candle_core::Device;

    fn tiny_config() -> NetConfig {
        NetConfig {
            input_dim: 3,
            output_dim: 2,
            hidden_dims: vec![4, 4],
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

    #[test]
    fn chain_shapes_follow_config() -> Result<()> {
        let chain = LayerChain::new(&tiny_config(), &Device::Cpu)?;
        assert_eq!(chain.shapes(), vec![(4, 3), (4, 4), (2, 4)]);
        Ok(())
    }

    #[test]
    fn masked_forward_ignores_pruned_inputs() -> Result<()> {
        let chain = LayerChain::new(&tiny_config(), &Device::Cpu)?;
        let layer = chain.get(0);

        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0], (1, 3), &Device::Cpu)?;
        let mask = crate::mask::mnar_structural_mask(4, 3, 1..3, &Device::Cpu)?;
        let masked = layer.forward_masked(&x, &[&mask], None)?;

        // only the first input column survives, so doubling the others is invisible
        let x2 = Tensor::from_vec(vec![1f32, 4.0, 6.0], (1, 3), &Device::Cpu)?;
        let masked2 = layer.forward_masked(&x2, &[&mask], None)?;
        assert_eq!(masked.to_vec2::<f32>()?, masked2.to_vec2::<f32>()?);
        Ok(())
    }
}
