use nalgebra::Vector3;

use crate::volume::VoxelGrid;

/// Derivative of a function of a world point with respect to a left-multiplied
/// twist `[v, w]`, given the function's spatial gradient at that point.
pub(super) fn se3_jacobian(point: &Vector3<f32>, gradient: &Vector3<f32>) -> [f32; 6] {
    let twist = point.cross(gradient);
    [
        gradient[0],
        gradient[1],
        gradient[2],
        twist[0],
        twist[1],
        twist[2],
    ]
}

/// Point to implicit surface distance: the residual of a measured point is
/// the field's signed distance at its location.
pub(super) struct SurfaceDistance<'grid> {
    grid: &'grid VoxelGrid,
    upper: f32,
    lower: f32,
}

impl<'grid> SurfaceDistance<'grid> {
    /// Samples near either truncation limit carry no gradient information.
    const BAND_MARGIN: f32 = 1e-4;

    pub fn new(grid: &'grid VoxelGrid) -> Self {
        let band = grid.band();
        Self {
            grid,
            upper: band.dmax - Self::BAND_MARGIN,
            lower: band.dmin + Self::BAND_MARGIN,
        }
    }

    /// Computes the residual and the Jacobian of a world point.
    ///
    /// # Returns
    ///
    /// * `None` if the point lies outside the observed band or its gradient
    /// can't be computed.
    pub fn jacobian(&self, point: &Vector3<f32>) -> Option<(f32, [f32; 6])> {
        let distance = self.grid.sample_distance(point)?;
        if distance > self.upper || distance < self.lower {
            return None;
        }

        let gradient = self.grid.gradient3(point)?;
        if gradient.iter().any(|g| !g.is_finite()) || gradient.norm_squared() < 1e-12 {
            return None;
        }
        Some((distance, se3_jacobian(point, &gradient)))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use rstest::rstest;

    use super::*;
    use crate::unit_test::planar_grid;

    #[rstest]
    fn should_match_finite_differences(planar_grid: VoxelGrid) {
        let cost = SurfaceDistance::new(&planar_grid);
        let point = Vector3::new(0.02, -0.01, 0.29);
        let (residual, jacobian) = cost.jacobian(&point).unwrap();
        assert_relative_eq!(residual, 0.01, epsilon = 1e-5);

        // Translation along Z moves the point towards the plane.
        assert_relative_eq!(jacobian[2], -1.0, epsilon = 1e-3);
        assert_relative_eq!(jacobian[0], 0.0, epsilon = 1e-3);
        // Rotation about X tilts the point's Z by -y * wx.
        let expected = point.cross(&Vector3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(jacobian[3], expected[0], epsilon = 1e-3);
        assert_relative_eq!(jacobian[4], expected[1], epsilon = 1e-3);
    }

    #[rstest]
    fn should_skip_saturated_samples(planar_grid: VoxelGrid) {
        let cost = SurfaceDistance::new(&planar_grid);
        assert!(cost.jacobian(&Vector3::new(0.0, 0.0, 0.05)).is_none());
        assert!(cost.jacobian(&Vector3::new(0.0, 0.0, 0.45)).is_none());
        assert!(cost.jacobian(&Vector3::new(0.0, 0.0, 3.0)).is_none());
    }
}
