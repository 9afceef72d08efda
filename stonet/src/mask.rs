//! Parameter masking: user pruning masks and the structural MNAR mask.
//!
//! Masks are plain values. The pruning mask travels with each call instead of
//! living as hidden state on the network, and the MNAR mask is derived from
//! the configuration once at construction. Both multiply into the effective
//! weights of every evaluation, so pruned connections contribute neither to
//! the forward pass nor to parameter gradients.

use std::ops::Range;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, StoNetError};
use crate::tensor_ops::zero_cols;

/// Optional mask over one layer's parameters; `1` keeps an entry, `0` prunes
/// it. Shapes must match the layer's weight `(out, in)` and bias `(out,)`.
#[derive(Debug, Clone, Default)]
pub struct LayerMask {
    pub weight: Option<Tensor>,
    pub bias: Option<Tensor>,
}

/// Pruning mask passed explicitly into every forward/likelihood evaluation.
#[derive(Debug, Clone, Default)]
pub enum ParamMask {
    /// All parameters active.
    #[default]
    NoMask,
    /// User-chosen sparsity pattern, one entry per chain layer.
    UserMask(Vec<LayerMask>),
}

impl ParamMask {
    pub(crate) fn layer(&self, index: usize) -> Option<&LayerMask> {
        match self {
            ParamMask::NoMask => None,
            ParamMask::UserMask(layers) => layers.get(index),
        }
    }

    /// Check the mask against the chain's `(out, in)` layer shapes.
    pub fn validate(&self, shapes: &[(usize, usize)]) -> Result<()> {
        let layers = match self {
            ParamMask::NoMask => return Ok(()),
            ParamMask::UserMask(layers) => layers,
        };
        if layers.len() != shapes.len() {
            return Err(StoNetError::config(format!(
                "mask covers {} layers, chain has {}",
                layers.len(),
                shapes.len()
            )));
        }
        for (index, (mask, &(out_dim, in_dim))) in layers.iter().zip(shapes.iter()).enumerate() {
            if let Some(w) = &mask.weight {
                if w.dims() != [out_dim, in_dim] {
                    return Err(StoNetError::config(format!(
                        "weight mask shape {:?} does not match layer {} ({}, {})",
                        w.dims(),
                        index,
                        out_dim,
                        in_dim
                    )));
                }
            }
            if let Some(b) = &mask.bias {
                if b.dims() != [out_dim] {
                    return Err(StoNetError::config(format!(
                        "bias mask shape {:?} does not match layer {} ({},)",
                        b.dims(),
                        index,
                        out_dim
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Weight mask severing the observed-indicator block from the layer that
/// consumes it: all ones except the input columns holding the indicators.
pub(crate) fn mnar_structural_mask(
    out_dim: usize,
    in_dim: usize,
    obs_ind_cols: Range<usize>,
    device: &Device,
) -> Result<Tensor> {
    let ones = Tensor::ones((out_dim, in_dim), DType::F32, device)?;
    Ok(zero_cols(&ones, obs_ind_cols)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn structural_mask_zeroes_indicator_columns() -> Result<()> {
        let m = mnar_structural_mask(2, 4, 1..3, &Device::Cpu)?;
        assert_eq!(
            m.to_vec2::<f32>()?,
            vec![vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0, 1.0]]
        );
        Ok(())
    }

    #[test]
    fn mask_shape_validation() -> Result<()> {
        let shapes = [(3, 4), (2, 3)];
        ParamMask::NoMask.validate(&shapes)?;

        let ok = ParamMask::UserMask(vec![
            LayerMask {
                weight: Some(Tensor::ones((3, 4), DType::F32, &Device::Cpu)?),
                bias: None,
            },
            LayerMask::default(),
        ]);
        ok.validate(&shapes)?;

        let bad = ParamMask::UserMask(vec![
            LayerMask {
                weight: Some(Tensor::ones((4, 3), DType::F32, &Device::Cpu)?),
                bias: None,
            },
            LayerMask::default(),
        ]);
        assert!(bad.validate(&shapes).is_err());
        Ok(())
    }
}
