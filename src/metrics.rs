use crate::error::{Error, Result};
use crate::trajectory::Trajectory;
use crate::transform::Transform;

/// Metrics for comparing two transforms.
#[derive(Clone, Debug, Default)]
pub struct TransformMetrics {
    /// Angle between the two transforms in radians.
    pub angle: f32,
    /// Translation vector size between the two transforms.
    pub translation: f32,
}

impl TransformMetrics {
    /// Difference between two poses.
    pub fn new(lhs: &Transform, rhs: &Transform) -> Self {
        let diff = &lhs.inverse() * rhs;

        Self {
            angle: diff.angle(),
            translation: diff.translation().norm(),
        }
    }

    /// Mean pose difference between two trajectories of the same length.
    pub fn mean_trajectory_error(pred: &Trajectory, ground_truth: &Trajectory) -> Result<Self> {
        if pred.len() != ground_truth.len() {
            return Err(Error::invalid_parameter(
                "trajectories have different lengths",
            ));
        }
        if pred.is_empty() {
            return Ok(Self::default());
        }

        let mut accum = Self::default();
        for ((pred, _), (gt, _)) in pred.iter().zip(ground_truth.iter()) {
            let metrics = Self::new(pred, gt);
            accum.angle += metrics.angle;
            accum.translation += metrics.translation;
        }
        let count = pred.len() as f32;
        Ok(Self {
            angle: accum.angle / count,
            translation: accum.translation / count,
        })
    }
}

impl std::fmt::Display for TransformMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "angle: {:.2} deg, translation: {:.5}",
            self.angle.to_degrees(),
            self.translation
        )
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector6};

    use super::*;

    #[test]
    fn should_be_zero_for_equal_poses() {
        let pose = Transform::exp(&Vector6::new(0.1, -0.2, 0.3, 0.01, 0.02, -0.03));
        let metrics = TransformMetrics::new(&pose, &pose);

        assert_relative_eq!(metrics.angle, 0.0, epsilon = 1e-3);
        assert_relative_eq!(metrics.translation, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn should_average_over_trajectories() {
        let pred: Trajectory = (0..4)
            .map(|i| (Transform::from_translation(&Vector3::new(i as f32, 0.0, 0.0)), i as f64))
            .collect();
        let gt: Trajectory = (0..4)
            .map(|i| (Transform::from_translation(&Vector3::new(i as f32, 0.5, 0.0)), i as f64))
            .collect();

        let metrics = TransformMetrics::mean_trajectory_error(&pred, &gt).unwrap();
        assert_relative_eq!(metrics.translation, 0.5, epsilon = 1e-6);

        let short: Trajectory = gt.iter().take(2).map(|(t, s)| (t.clone(), s)).collect();
        assert!(TransformMetrics::mean_trajectory_error(&pred, &short).is_err());
    }
}
