use nalgebra::{Cholesky, Const, SMatrix, SVector};
use num::Zero;

/// Accumulates the normal equations of a weighted least squares problem and
/// solves them with optional Levenberg-Marquardt damping.
///
/// # Type parameters
///
/// * `DIM` - The dimension of the problem.
#[derive(Clone, Debug)]
pub struct GaussNewton<const DIM: usize> {
    hessian: SMatrix<f64, DIM, DIM>,
    gradient: SVector<f64, DIM>,
    squared_residual_sum: f64,
    count: usize,
}

impl<const DIM: usize> Default for GaussNewton<DIM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DIM: usize> GaussNewton<DIM> {
    /// Creates a new Gauss Newton optimizer.
    pub fn new() -> Self {
        Self {
            hessian: SMatrix::zero(),
            gradient: SVector::zero(),
            squared_residual_sum: 0.0,
            count: 0,
        }
    }

    /// Adds a residual scaled by a robust weight (IRLS).
    ///
    /// # Arguments
    ///
    /// * `residual` - The residual of the step.
    /// * `jacobian` - The jacobian of the step.
    /// * `weight` - Weight of the residual, usually from a [`super::RobustEstimator`].
    pub fn weighted_step(&mut self, residual: f32, jacobian: &[f32; DIM], weight: f32) {
        let residual = residual as f64;
        let weight = weight as f64;
        for i in 0..DIM {
            let ival = jacobian[i] as f64 * weight;
            self.gradient[i] += ival * residual;

            self.hessian[(i, i)] += ival * jacobian[i] as f64;
            for j in i + 1..DIM {
                let mul = ival * jacobian[j] as f64;
                self.hessian[(i, j)] += mul;
                self.hessian[(j, i)] += mul;
            }
        }

        self.squared_residual_sum += weight * residual * residual;
        self.count += 1;
    }

    /// Solves the system after normalizing it by its largest hessian entry and
    /// adding `damping` to the diagonal.
    ///
    /// # Returns
    ///
    /// The update vector, or `None` if the system is empty or not positive definite.
    pub fn solve_damped(&self, damping: f32) -> Option<SVector<f32, DIM>> {
        if self.count == 0 {
            return None;
        }

        let max_coeff = self.hessian.amax();
        if max_coeff <= 0.0 || !max_coeff.is_finite() {
            return None;
        }
        let scaling = 1.0 / max_coeff;
        let hessian =
            self.hessian * scaling + SMatrix::<f64, DIM, DIM>::identity() * damping as f64;
        let gradient = self.gradient * scaling;

        Cholesky::<f64, Const<DIM>>::new(hessian)
            .map(|cholesky| nalgebra::convert(cholesky.solve(&gradient)))
    }

    /// Adds the values of another optimizer to this one.
    /// Use this to combine the state of sub optimizers.
    ///
    /// # Arguments
    ///
    /// * `other` - The other optimizer.
    pub fn add(&mut self, other: &Self) {
        self.hessian += other.hessian;
        self.gradient += other.gradient;
        self.squared_residual_sum += other.squared_residual_sum;
        self.count += other.count;
    }

    /// Number of residuals added so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the mean squared residual.
    pub fn mean_squared_residual(&self) -> f32 {
        if self.count == 0 {
            return 0.0;
        }
        (self.squared_residual_sum / self.count as f64) as f32
    }
}
