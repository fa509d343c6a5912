/// Robust loss used to down-weight outlier residuals in iteratively
/// reweighted least squares.
pub trait RobustEstimator {
    /// IRLS weight of a residual, `rho'(r) / r`.
    fn weight(&self, residual: f32) -> f32;
}

/// Tukey's biweight. Residuals beyond `c` get zero weight.
pub struct TukeyEstimator {
    pub c: f32,
}

impl RobustEstimator for TukeyEstimator {
    fn weight(&self, residual: f32) -> f32 {
        if residual.abs() >= self.c {
            return 0.0;
        }
        let u = residual / self.c;
        let v = 1.0 - u * u;
        v * v
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn tukey_should_reject_outliers() {
        let tukey = TukeyEstimator { c: 0.002 };
        assert_eq!(tukey.weight(0.0), 1.0);
        assert_relative_eq!(tukey.weight(0.001), 0.5625, epsilon = 1e-6);
        assert_eq!(tukey.weight(0.003), 0.0);
        assert_eq!(tukey.weight(-0.003), 0.0);
    }
}
