//! Gaussian conditional likelihood for imputed missing covariates.
//!
//! For a missing column x_1 with conditioning set X_2 drawn from the
//! conditional-independence graph, the batch moments give
//!
//! mu_{1|2} = mu_1 + Sigma_12 Sigma_22^{-1} (X_2 - mu_2)
//! s2_{1|2} = Sigma_11 - Sigma_12 Sigma_22^{-1} Sigma_21
//!
//! and each column contributes `-sse(x_1, mu_{1|2}) / (2 s2_{1|2})`.
//!
//! The moments are frozen statistics: they are estimated from a detached
//! snapshot of the batch and enter the likelihood as constants, so gradients
//! only flow through the squared-error term into the imputed values.

use candle_core::Tensor;
use nalgebra::DMatrix;

use crate::config::MissingSpec;
use crate::error::{Result, StoNetError};
use crate::likelihood::sum_squared_error;
use crate::tensor_ops::select_cols;

type Mat = DMatrix<f64>;

// conditional variances below this fraction of the marginal variance are
// treated as a degenerate conditioning block
const COND_VAR_FLOOR: f64 = 1e-12;

/// Frozen conditional moments of one missing column given its graph.
#[derive(Debug)]
pub struct CondMoments {
    /// Conditional mean per batch row, shape `(n, 1)`, constant.
    pub mean_n: Tensor,
    /// Conditional variance, strictly positive.
    pub variance: f64,
}

/// Estimate the conditional moments of `col` given the rest of `graph_cols`
/// from the batch `x_frozen` (already detached by the caller).
pub(crate) fn conditional_moments(
    x_frozen: &Tensor,
    graph_cols: &[usize],
    col: usize,
) -> Result<CondMoments> {
    let sub = select_cols(x_frozen, graph_cols)?;
    let rows: Vec<Vec<f32>> = sub.to_vec2()?;
    let nn = rows.len();
    let mm = graph_cols.len();
    if nn < 2 {
        return Err(StoNetError::contract(format!(
            "conditional moments for column {} need at least two batch rows",
            col
        )));
    }

    let joint = Mat::from_fn(nn, mm, |i, j| rows[i][j] as f64);
    let mean = joint.row_mean();
    let centered = Mat::from_fn(nn, mm, |i, j| joint[(i, j)] - mean[j]);
    let cov = centered.transpose() * &centered / (nn as f64 - 1.0);

    // regression coefficients Sigma_22^{-1} Sigma_21
    let cond_block = cov.view((1, 1), (mm - 1, mm - 1)).into_owned();
    let cross = cov.view((1, 0), (mm - 1, 1)).into_owned();
    let coef = cond_block
        .lu()
        .solve(&cross)
        .ok_or(StoNetError::SingularConditioning { col })?;

    let variance = cov[(0, 0)] - (cross.transpose() * &coef)[(0, 0)];
    let floor = COND_VAR_FLOOR * cov[(0, 0)].abs().max(1.0);
    if !variance.is_finite() || variance <= floor {
        return Err(StoNetError::DegenerateConditionalVariance {
            col,
            value: variance,
        });
    }

    let mean_vec: Vec<f32> = (0..nn)
        .map(|i| {
            let mut acc = mean[0];
            for j in 1..mm {
                acc += (joint[(i, j)] - mean[j]) * coef[(j - 1, 0)];
            }
            acc as f32
        })
        .collect();
    let mean_n = Tensor::from_vec(mean_vec, (nn, 1), x_frozen.device())?;

    Ok(CondMoments { mean_n, variance })
}

/// Sum of conditional Gaussian log-likelihoods over all missing columns.
///
/// Differentiable with respect to `x_impute`; the conditional moments are
/// re-estimated from a detached snapshot on every call.
pub fn missing_likelihood(x_impute: &Tensor, spec: &MissingSpec) -> Result<Tensor> {
    let x_frozen = x_impute.detach();
    let mut total: Option<Tensor> = None;
    for (graph_cols, &col) in spec.graph.iter().zip(spec.miss_cols.iter()) {
        let moments = conditional_moments(&x_frozen, graph_cols, col)?;
        let observed = x_impute.narrow(1, col, 1)?;
        let sse = sum_squared_error(&observed, &moments.mean_n)?;
        let ll = (sse.neg()? / (2.0 * moments.variance))?;
        total = Some(match total {
            Some(acc) => (acc + ll)?,
            None => ll,
        });
    }
    total.ok_or_else(|| StoNetError::contract("no missing columns configured"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MissPattern;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn batch(device: &Device) -> Result<Tensor> {
        // column 0 tracks column 2 closely; columns 2 and 3 vary freely
        let data: Vec<f32> = vec![
            1.0, 0.0, 1.1, 0.4, //
            2.0, 1.0, 2.2, 0.6, //
            0.5, 0.0, 0.4, 1.0, //
            1.5, 1.0, 1.6, 0.2, //
            0.9, 0.0, 1.0, 0.8, //
            2.4, 1.0, 2.5, 0.1,
        ];
        Ok(Tensor::from_vec(data, (6, 4), device)?)
    }

    #[test]
    fn conditional_variance_is_positive() -> Result<()> {
        let x = batch(&Device::Cpu)?;
        let moments = conditional_moments(&x, &[0, 2, 3], 0)?;
        assert!(moments.variance > 0.0);
        assert_eq!(moments.mean_n.dims(), &[6, 1]);
        Ok(())
    }

    #[test]
    fn known_bivariate_moments() -> Result<()> {
        // col0 is nearly 2 * col1 + 1; the regression slope is cov/var = 2.12
        // and the fitted values follow 6.1 + 2.12 * (col1 - 2.5)
        let data: Vec<f32> = vec![
            3.0, 1.0, //
            5.0, 2.0, //
            7.0, 3.0, //
            9.4, 4.0,
        ];
        let x = Tensor::from_vec(data, (4, 2), &Device::Cpu)?;
        let moments = conditional_moments(&x, &[0, 1], 0)?;
        let means = moments.mean_n.to_vec2::<f32>()?;
        for (got, expect) in means.iter().map(|r| r[0]).zip([2.92f32, 5.04, 7.16, 9.28]) {
            assert_relative_eq!(got, expect, epsilon = 1e-4);
        }
        // cond_var = var0 - slope * cov01 = 0.016
        assert_relative_eq!(moments.variance as f32, 0.016, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn duplicated_conditioning_column_is_singular() -> Result<()> {
        let x = batch(&Device::Cpu)?;
        let err = conditional_moments(&x, &[0, 2, 2], 0).unwrap_err();
        assert!(matches!(err, StoNetError::SingularConditioning { col: 0 }));
        Ok(())
    }

    #[test]
    fn collinear_response_is_degenerate() -> Result<()> {
        // column 0 is exactly 2 * column 1: conditional variance collapses
        let data: Vec<f32> = vec![
            2.0, 1.0, //
            4.0, 2.0, //
            6.0, 3.0, //
            8.0, 4.0,
        ];
        let x = Tensor::from_vec(data, (4, 2), &Device::Cpu)?;
        let err = conditional_moments(&x, &[0, 1], 0).unwrap_err();
        assert!(matches!(
            err,
            StoNetError::DegenerateConditionalVariance { col: 0, .. }
        ));
        Ok(())
    }

    #[test]
    fn likelihood_sums_over_missing_columns() -> Result<()> {
        let x = batch(&Device::Cpu)?;
        let spec = MissingSpec {
            pattern: MissPattern::Mar,
            miss_cols: vec![0, 1],
            graph: vec![vec![0, 2, 3], vec![1, 2, 3]],
        };
        let ll: f32 = missing_likelihood(&x, &spec)?.to_scalar()?;
        assert!(ll.is_finite());
        assert!(ll <= 0.0);
        Ok(())
    }
}
