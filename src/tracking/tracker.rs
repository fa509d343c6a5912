use itertools::iproduct;
use nalgebra::{Vector3, Vector6};
use rayon::prelude::*;
use tracing::{debug, trace};

use super::cost_function::SurfaceDistance;
use crate::error::{Error, Result};
use crate::image::DepthFrame;
use crate::optim::{GaussNewton, RobustEstimator, TukeyEstimator};
use crate::params::SdfParameters;
use crate::transform::Transform;
use crate::volume::VoxelGrid;

/// Parameters of the pose tracker.
#[derive(Debug, Clone)]
pub struct TrackerParams {
    /// Tukey's cutoff as a fraction of the positive truncation distance.
    pub robust_statistic_coefficient: f32,
    /// Levenberg-Marquardt damping added to the normalized system.
    pub regularization: f32,
    /// Stop a level once the update's norm falls below this.
    pub convergence_condition: f32,
    /// Pixel (or point) strides, coarsest first.
    pub strides: Vec<usize>,
    /// Iteration cap for each stride.
    pub iterations: Vec<usize>,
    /// Fewer residuals than this means tracking is lost.
    pub min_valid_residuals: usize,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self::from(&SdfParameters::default())
    }
}

impl From<&SdfParameters> for TrackerParams {
    fn from(params: &SdfParameters) -> Self {
        Self {
            robust_statistic_coefficient: params.robust_statistic_coefficient,
            regularization: params.regularization,
            convergence_condition: params.convergence_condition,
            strides: params.pyramid_strides.clone(),
            iterations: params.pyramid_iterations.clone(),
            min_valid_residuals: params.min_valid_residuals,
        }
    }
}

impl TrackerParams {
    pub fn validate(&self) -> Result<()> {
        if self.strides.is_empty() || self.strides.len() != self.iterations.len() {
            return Err(Error::invalid_parameter(
                "tracker strides and iterations must be non-empty and of equal length",
            ));
        }
        if self.strides.iter().any(|stride| *stride == 0) {
            return Err(Error::invalid_parameter("tracker strides must be positive"));
        }
        if self.robust_statistic_coefficient <= 0.0 || self.regularization < 0.0 {
            return Err(Error::invalid_parameter(
                "robust coefficient must be positive and regularization non-negative",
            ));
        }
        Ok(())
    }
}

/// Outcome of one pose estimation.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    /// Left-multiplied motion found by the optimizer. Identity when lost.
    pub increment: Transform,
    /// Whether enough residuals supported the last iteration.
    pub valid: bool,
    /// Whether the finest level stopped by the convergence criterion.
    pub converged: bool,
    /// Total iterations over all levels.
    pub iterations: usize,
    /// Residuals used in the last iteration.
    pub valid_residuals: usize,
}

impl PoseEstimate {
    /// Estimate of a frame that could not be tracked.
    pub fn lost(valid_residuals: usize) -> Self {
        Self {
            increment: Transform::eye(),
            valid: false,
            converged: false,
            iterations: 0,
            valid_residuals,
        }
    }

    /// Applies the increment to `pose`, or returns it unchanged when lost.
    pub fn apply(&self, pose: &Transform) -> Transform {
        if !self.valid {
            return pose.clone();
        }
        let mut updated = &self.increment * pose;
        updated.renormalize();
        updated
    }
}

/// Frame-to-model tracker. Aligns measured points with the zero level set of
/// a [`VoxelGrid`] by iteratively reweighted least squares on the sampled
/// signed distances.
pub struct PoseTracker {
    pub params: TrackerParams,
}

impl PoseTracker {
    pub fn new(params: TrackerParams) -> Self {
        Self { params }
    }

    /// Estimates the camera motion of a depth frame.
    ///
    /// # Arguments
    ///
    /// * `grid` - The model to align with.
    /// * `frame` - The new depth frame.
    /// * `pose` - Camera to world pose of the previous frame, used as the
    ///   initial guess.
    pub fn estimate_pose(
        &self,
        grid: &VoxelGrid,
        frame: &DepthFrame,
        pose: &Transform,
    ) -> PoseEstimate {
        let levels = self
            .params
            .strides
            .iter()
            .map(|stride| {
                iproduct!(
                    (0..frame.height()).step_by(*stride),
                    (0..frame.width()).step_by(*stride)
                )
                .filter_map(|(v, u)| frame.point(u, v))
                .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        self.align(grid, &levels, pose)
    }

    /// Estimates the motion of an unordered set of camera-frame points.
    pub fn estimate_pose_points(
        &self,
        grid: &VoxelGrid,
        points: &[Vector3<f32>],
        pose: &Transform,
    ) -> PoseEstimate {
        let levels = self
            .params
            .strides
            .iter()
            .map(|stride| {
                points
                    .iter()
                    .step_by(*stride)
                    .filter(|p| p.iter().all(|c| c.is_finite()))
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        self.align(grid, &levels, pose)
    }

    /// Builds the weighted normal equations for the current estimate.
    fn linearize(
        &self,
        cost: &SurfaceDistance,
        estimator: &TukeyEstimator,
        points: &[Vector3<f32>],
        pose: &Transform,
    ) -> GaussNewton<6> {
        points
            .par_iter()
            .fold(GaussNewton::<6>::new, |mut optimizer, point| {
                let world_point = pose * point;
                if let Some((residual, jacobian)) = cost.jacobian(&world_point) {
                    let weight = estimator.weight(residual);
                    if weight > 0.0 {
                        optimizer.weighted_step(residual, &jacobian, weight);
                    }
                }
                optimizer
            })
            .reduce(GaussNewton::<6>::new, |mut lhs, rhs| {
                lhs.add(&rhs);
                lhs
            })
    }

    fn align(&self, grid: &VoxelGrid, levels: &[Vec<Vector3<f32>>], pose: &Transform) -> PoseEstimate {
        let cost = SurfaceDistance::new(grid);
        let estimator = TukeyEstimator {
            c: self.params.robust_statistic_coefficient * grid.band().dmax,
        };

        let mut increment = Transform::eye();
        let mut total_iterations = 0;
        let mut valid_residuals = 0;
        let mut valid = false;
        let mut converged = false;

        for (level, (points, max_iterations)) in levels
            .iter()
            .zip(self.params.iterations.iter())
            .enumerate()
        {
            converged = false;
            for _ in 0..*max_iterations {
                let estimate = &increment * pose;
                let optimizer = self.linearize(&cost, &estimator, points, &estimate);
                total_iterations += 1;
                valid_residuals = optimizer.count();
                valid = valid_residuals >= self.params.min_valid_residuals;
                trace!(
                    level,
                    valid_residuals,
                    mse = optimizer.mean_squared_residual(),
                    "tracker iteration"
                );
                if !valid {
                    trace!(level, valid_residuals, "too few residuals");
                    break;
                }

                let update: Vector6<f32> = match optimizer.solve_damped(self.params.regularization) {
                    Some(solution) => -solution,
                    None => {
                        valid = false;
                        break;
                    }
                };
                increment = &Transform::exp(&update) * &increment;

                if update.norm() < self.params.convergence_condition {
                    converged = true;
                    break;
                }
            }
            trace!(level, valid_residuals, converged, "tracker level done");
        }

        debug!(
            valid,
            converged, total_iterations, valid_residuals, "pose estimation finished"
        );
        PoseEstimate {
            increment: if valid { increment } else { Transform::eye() },
            valid,
            converged,
            iterations: total_iterations,
            valid_residuals,
        }
    }
}
