use crate::error::{Result, SomaError};
use nalgebra::{DMatrix, DVector};

const DEGREE: usize = 3;
const TERMS: usize = DEGREE + 1;

/// Unweighted least-squares cubic `y = c0 + c1 x + c2 x² + c3 x³`.
#[derive(Debug, Clone, PartialEq)]
pub struct CubicFit {
    /// Coefficients, constant term first.
    pub coeffs: [f64; TERMS],
    /// Coefficient covariance `SSR / (n - 4) · (XᵀX)⁻¹`.
    pub covariance: [[f64; TERMS]; TERMS],
    pub points: usize,
}

impl CubicFit {
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self> {
        let n = x.len();
        if n != y.len() {
            return Err(SomaError::FitFailure(format!(
                "{n} abscissae but {} ordinates",
                y.len()
            )));
        }
        if n <= TERMS {
            return Err(SomaError::FitFailure(format!(
                "need more than {TERMS} points for a cubic with covariance, got {n}"
            )));
        }
        let mut distinct = x.to_vec();
        distinct.sort_by(f64::total_cmp);
        distinct.dedup();
        if distinct.len() < TERMS {
            return Err(SomaError::FitFailure(format!(
                "only {} distinct abscissae",
                distinct.len()
            )));
        }

        let mut design = DMatrix::<f64>::zeros(n, TERMS);
        for (i, xi) in x.iter().enumerate() {
            for k in 0..TERMS {
                design[(i, k)] = xi.powi(k as i32);
            }
        }
        // Column scaling keeps XᵀX invertible when |x| is small.
        let scale: Vec<f64> = (0..TERMS)
            .map(|k| {
                let norm = design.column(k).norm();
                if norm > 0.0 {
                    norm
                } else {
                    1.0
                }
            })
            .collect();
        for (k, s) in scale.iter().enumerate() {
            design.column_mut(k).scale_mut(1.0 / s);
        }

        let rhs = DVector::from_column_slice(y);
        let normal = design.transpose() * &design;
        let inverse = normal
            .try_inverse()
            .ok_or_else(|| SomaError::FitFailure("singular normal matrix".to_string()))?;
        let beta = &inverse * design.transpose() * &rhs;

        let residual = &rhs - &design * &beta;
        let ssr = residual.norm_squared();
        let fac = ssr / (n - TERMS) as f64;

        let mut coeffs = [0.0; TERMS];
        let mut covariance = [[0.0; TERMS]; TERMS];
        for i in 0..TERMS {
            coeffs[i] = beta[i] / scale[i];
            for j in 0..TERMS {
                covariance[i][j] = fac * inverse[(i, j)] / (scale[i] * scale[j]);
            }
        }
        if coeffs.iter().any(|c| !c.is_finite()) {
            return Err(SomaError::FitFailure("non-finite coefficients".to_string()));
        }
        Ok(Self {
            coeffs,
            covariance,
            points: n,
        })
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
    }

    /// Standard error of coefficient `k`.
    pub fn sigma(&self, k: usize) -> f64 {
        self.covariance[k][k].max(0.0).sqrt()
    }

    /// Value and uncertainty of the `order`-th derivative at zero:
    /// `order! · c_order ± order! · σ_order`.
    pub fn derivative_at_zero(&self, order: usize) -> (f64, f64) {
        let factorial: f64 = (1..=order).map(|k| k as f64).product();
        (factorial * self.coeffs[order], factorial * self.sigma(order))
    }
}
