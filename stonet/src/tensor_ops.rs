//! Column-block helpers shared by the forward pass and the sampler.
//!
//! All helpers treat the second dimension as the feature axis and build new
//! tensors; callers decide what to keep. `overwrite_cols` participates in the
//! autodiff graph, so gradients flow into the surviving blocks and into the
//! replacement values, never into the overwritten entries.

use std::ops::Range;

use candle_core::{Result, Tensor};

/// Replace the columns `cols` of `x_nd` with `values_nk`, leaving every other
/// column intact.
pub fn overwrite_cols(x_nd: &Tensor, cols: Range<usize>, values_nk: &Tensor) -> Result<Tensor> {
    let (_, dim) = x_nd.dims2()?;
    let mut parts = Vec::with_capacity(3);
    if cols.start > 0 {
        parts.push(x_nd.narrow(1, 0, cols.start)?);
    }
    parts.push(values_nk.clone());
    if cols.end < dim {
        parts.push(x_nd.narrow(1, cols.end, dim - cols.end)?);
    }
    Tensor::cat(&parts, 1)
}

/// Zero the columns `cols` of `x_nd`.
pub fn zero_cols(x_nd: &Tensor, cols: Range<usize>) -> Result<Tensor> {
    let (nn, _) = x_nd.dims2()?;
    let zeros = Tensor::zeros((nn, cols.len()), x_nd.dtype(), x_nd.device())?;
    overwrite_cols(x_nd, cols, &zeros)
}

/// Gather an arbitrary set of columns of `x_nd` into a dense `(n, k)` block,
/// in the order given.
pub fn select_cols(x_nd: &Tensor, cols: &[usize]) -> Result<Tensor> {
    let parts = cols
        .iter()
        .map(|&j| x_nd.narrow(1, j, 1))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&parts, 1)
}

/// Add `delta_nk` into the listed columns of `x_nd`, one delta column per
/// entry of `cols`.
pub fn add_to_cols(x_nd: &Tensor, cols: &[usize], delta_nk: &Tensor) -> Result<Tensor> {
    let mut x = x_nd.clone();
    for (k, &j) in cols.iter().enumerate() {
        let col = (x.narrow(1, j, 1)? + delta_nk.narrow(1, k, 1)?)?;
        x = overwrite_cols(&x, j..j + 1, &col)?;
    }
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn arange(nn: usize, dd: usize) -> Result<Tensor> {
        let data: Vec<f32> = (0..nn * dd).map(|v| v as f32).collect();
        Tensor::from_vec(data, (nn, dd), &Device::Cpu)
    }

    #[test]
    fn overwrite_keeps_flanks() -> Result<()> {
        let x = arange(2, 4)?;
        let v = Tensor::from_vec(vec![-1f32, -2.0], (2, 1), &Device::Cpu)?;
        let y = overwrite_cols(&x, 1..2, &v)?;
        assert_eq!(
            y.to_vec2::<f32>()?,
            vec![vec![0.0, -1.0, 2.0, 3.0], vec![4.0, -2.0, 6.0, 7.0]]
        );
        Ok(())
    }

    #[test]
    fn overwrite_at_edges() -> Result<()> {
        let x = arange(1, 3)?;
        let v = Tensor::from_vec(vec![9f32], (1, 1), &Device::Cpu)?;
        let left = overwrite_cols(&x, 0..1, &v)?;
        assert_eq!(left.to_vec2::<f32>()?, vec![vec![9.0, 1.0, 2.0]]);
        let right = overwrite_cols(&x, 2..3, &v)?;
        assert_eq!(right.to_vec2::<f32>()?, vec![vec![0.0, 1.0, 9.0]]);
        Ok(())
    }

    #[test]
    fn select_and_add_round_trip() -> Result<()> {
        let x = arange(2, 4)?;
        let picked = select_cols(&x, &[3, 0])?;
        assert_eq!(
            picked.to_vec2::<f32>()?,
            vec![vec![3.0, 0.0], vec![7.0, 4.0]]
        );

        let delta = Tensor::from_vec(vec![10f32, 0.0, 10.0, 0.0], (2, 2), &Device::Cpu)?;
        let y = add_to_cols(&x, &[3, 0], &delta)?;
        assert_eq!(
            y.to_vec2::<f32>()?,
            vec![vec![0.0, 1.0, 2.0, 13.0], vec![4.0, 5.0, 6.0, 17.0]]
        );
        Ok(())
    }
}
