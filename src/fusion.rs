use std::sync::atomic::{AtomicUsize, Ordering};

use nalgebra::Vector3;
use ndarray::Zip;
use tracing::debug;

use crate::camera::PinholeCamera;
use crate::image::{color_at, is_valid_depth, ColorImage, DepthFrame};
use crate::transform::Transform;
use crate::volume::{TruncationBand, VoxelGrid};

/// Weight given to each new observation.
pub struct FusionParameters {
    pub observation_weight: f32,
}

impl Default for FusionParameters {
    fn default() -> Self {
        FusionParameters {
            observation_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionSummary {
    /// Cells whose distance and weight were updated.
    pub num_updated: usize,
    /// Cells that also received a color update.
    pub num_colored: usize,
}

/// Folds one observation into a cell with a weighted running average.
/// Observations behind the negative band leave the cell untouched, those in
/// front of the positive band saturate at `dmax`.
///
/// # Returns
///
/// * Whether the cell was updated.
#[inline]
fn update_cell(
    distance: &mut f32,
    weight: &mut f32,
    eta: f32,
    new_weight: f32,
    band: &TruncationBand,
) -> bool {
    if !eta.is_finite() || eta < band.dmin {
        return false;
    }
    let new_distance = eta.min(band.dmax);
    let total = *weight + new_weight;
    *distance = ((*distance * *weight + new_distance * new_weight) / total).clamp(band.dmin, band.dmax);
    *weight = total.min(band.wmax);
    true
}

/// Running average of the cell color, weighted by its own color confidence.
#[inline]
fn update_color(
    color: &mut Vector3<f32>,
    color_weight: &mut f32,
    new_color: &Vector3<f32>,
    new_weight: f32,
    wmax: f32,
) {
    let total = *color_weight + new_weight;
    *color = (*color * *color_weight + new_color * new_weight) / total;
    *color_weight = total.min(wmax);
}

/// Integrates depth observations into a [`VoxelGrid`]. This is the only
/// writer of grid contents.
#[derive(Default)]
pub struct FusionEngine {
    params: FusionParameters,
}

impl FusionEngine {
    pub fn new(params: FusionParameters) -> Self {
        Self { params }
    }

    /// Projects every cell into the depth frame and updates those inside the
    /// frustum with their signed distance along the viewing direction.
    ///
    /// # Arguments
    ///
    /// * `grid` - The volume to update.
    /// * `frame` - Depth frame in meters.
    /// * `camera_to_world` - Pose of the camera that took the frame.
    /// * `color` - Optional color image registered to the depth frame.
    pub fn fuse(
        &self,
        grid: &mut VoxelGrid,
        frame: &DepthFrame,
        camera_to_world: &Transform,
        color: Option<&ColorImage>,
    ) -> FusionSummary {
        let camera = PinholeCamera::new(
            frame.intrinsics.clone(),
            camera_to_world.clone(),
            frame.width(),
            frame.height(),
        );
        let band = grid.band();
        let origin = grid.origin();
        let resolution = grid.resolution();
        let new_weight = self.params.observation_weight;
        let depth = &frame.depth;

        // Signed distance and pixel of a cell, if it projects onto a valid measurement.
        let observe = |(i, j, k): (usize, usize, usize)| -> Option<(f32, usize, usize)> {
            let position =
                origin + Vector3::new(i as f32, j as f32, k as f32) * resolution;
            let (u, v, z) = camera.project_to_pixel(&position)?;
            let measured = depth[(v, u)];
            if !is_valid_depth(measured) {
                return None;
            }
            Some((measured - z, u, v))
        };

        let num_updated = AtomicUsize::new(0);
        let num_colored = AtomicUsize::new(0);
        let VoxelGrid {
            distance: distances,
            weight: weights,
            color: colors,
            ..
        } = grid;

        match (colors.as_mut(), color) {
            (Some(colors), Some(color_image)) => {
                Zip::indexed(distances)
                    .and(weights)
                    .and(&mut colors.rgb)
                    .and(&mut colors.weight)
                    .par_for_each(|index, distance, weight, cell_color, color_weight| {
                        if let Some((eta, u, v)) = observe(index) {
                            if update_cell(distance, weight, eta, new_weight, &band) {
                                num_updated.fetch_add(1, Ordering::Relaxed);
                                if eta < band.dmax {
                                    if let Some(observed) = color_at(color_image, u, v) {
                                        update_color(
                                            cell_color,
                                            color_weight,
                                            &observed,
                                            new_weight,
                                            band.wmax,
                                        );
                                        num_colored.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                            }
                        }
                    });
            }
            _ => {
                Zip::indexed(distances)
                    .and(weights)
                    .par_for_each(|index, distance, weight| {
                        if let Some((eta, _, _)) = observe(index) {
                            if update_cell(distance, weight, eta, new_weight, &band) {
                                num_updated.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    });
            }
        }

        let summary = FusionSummary {
            num_updated: num_updated.into_inner(),
            num_colored: num_colored.into_inner(),
        };
        debug!(?summary, "fused depth frame");
        summary
    }

    /// Integrates an unordered set of camera-frame points by updating the cells
    /// along each point's ray that fall inside the truncation band.
    ///
    /// # Arguments
    ///
    /// * `grid` - The volume to update.
    /// * `points` - Measured points in the camera frame.
    /// * `camera_to_world` - Pose of the sensor.
    pub fn fuse_points(
        &self,
        grid: &mut VoxelGrid,
        points: &[Vector3<f32>],
        camera_to_world: &Transform,
    ) -> FusionSummary {
        let band = grid.band();
        let dims = grid.dims();
        let step = grid.resolution() * 0.5;
        let center = camera_to_world.translation();
        let mut num_updated = 0;

        for point in points.iter().filter(|p| p.iter().all(|c| c.is_finite())) {
            let world = camera_to_world * point;
            let ray = world - center;
            let length = ray.norm();
            if length <= f32::EPSILON {
                continue;
            }
            let direction = ray / length;

            let mut last_index = None;
            let mut s = (length - band.dmax).max(0.0);
            while s <= length - band.dmin {
                let coord = grid.world_to_grid(&(center + direction * s));
                s += step;

                let index = match round_index(&coord, &dims) {
                    Some(index) => index,
                    None => continue,
                };
                if last_index == Some(index) {
                    continue;
                }
                last_index = Some(index);

                let eta = length - (grid.cell_position(index) - center).dot(&direction);
                let (distance, weight) = (&mut grid.distance, &mut grid.weight);
                if update_cell(
                    &mut distance[index],
                    &mut weight[index],
                    eta,
                    self.params.observation_weight,
                    &band,
                ) {
                    num_updated += 1;
                }
            }
        }

        let summary = FusionSummary {
            num_updated,
            num_colored: 0,
        };
        debug!(?summary, "fused point set");
        summary
    }
}

fn round_index(coord: &Vector3<f32>, dims: &[usize; 3]) -> Option<[usize; 3]> {
    let mut index = [0usize; 3];
    for axis in 0..3 {
        let c = coord[axis].round();
        if !(c >= 0.0 && c < dims[axis] as f32) {
            return None;
        }
        index[axis] = c as usize;
    }
    Some(index)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use ndarray::Array3;
    use rstest::rstest;

    use super::*;
    use crate::unit_test::{empty_grid, planar_frame};

    #[rstest]
    fn should_fuse_planar_frame(planar_frame: DepthFrame) {
        let mut grid = empty_grid();
        let summary = FusionEngine::default().fuse(&mut grid, &planar_frame, &Transform::eye(), None);
        assert!(summary.num_updated > 0);

        // Plane at z = 0.3; cell k = 80 lies on it.
        assert_relative_eq!(grid.distance([50, 50, 80]), 0.0, epsilon = 1e-5);
        assert_relative_eq!(grid.distance([50, 50, 78]), 0.02, epsilon = 1e-5);
        assert_relative_eq!(grid.distance([50, 50, 83]), -0.03, epsilon = 1e-5);
        // Saturated free space in front of the plane.
        assert_eq!(grid.distance([50, 50, 60]), 0.1);
        assert_eq!(grid.weight([50, 50, 60]), 1.0);
        // Behind the negative band: untouched.
        assert_eq!(grid.weight([50, 50, 90]), 0.0);
        // Behind the camera: untouched.
        assert_eq!(grid.weight([50, 50, 40]), 0.0);
        assert!(grid.check_invariants());
    }

    #[rstest]
    fn repeated_fusion_should_saturate_weight(planar_frame: DepthFrame) {
        let mut grid = empty_grid();
        let engine = FusionEngine::default();
        let mut last_weight = 0.0;
        for _ in 0..70 {
            engine.fuse(&mut grid, &planar_frame, &Transform::eye(), None);
            let weight = grid.weight([50, 50, 79]);
            assert!(weight >= last_weight);
            last_weight = weight;
        }
        assert_eq!(last_weight, grid.band().wmax);
        assert_relative_eq!(grid.distance([50, 50, 79]), 0.01, epsilon = 1e-5);
        assert!(grid.check_invariants());
    }

    #[rstest]
    fn should_fuse_color(planar_frame: DepthFrame) {
        let mut grid = crate::unit_test::empty_color_grid();
        let mut color = Array3::<u8>::zeros((planar_frame.height(), planar_frame.width(), 3));
        color.slice_mut(ndarray::s![.., .., 0]).fill(200);

        let summary =
            FusionEngine::default().fuse(&mut grid, &planar_frame, &Transform::eye(), Some(&color));
        assert!(summary.num_colored > 0);
        assert_eq!(grid.color([50, 50, 80]), Some(Vector3::new(200.0, 0.0, 0.0)));
        assert_eq!(grid.color_weight([50, 50, 80]), 1.0);
        // Free space saturates without color.
        assert_eq!(grid.weight([50, 50, 60]), 1.0);
        assert_eq!(grid.color([50, 50, 60]), None);
    }

    #[rstest]
    fn depth_only_frames_should_not_dilute_color(planar_frame: DepthFrame) {
        let mut grid = crate::unit_test::empty_color_grid();
        let engine = FusionEngine::default();
        let mut color = Array3::<u8>::zeros((planar_frame.height(), planar_frame.width(), 3));
        color.slice_mut(ndarray::s![.., .., 1]).fill(120);

        engine.fuse(&mut grid, &planar_frame, &Transform::eye(), None);
        assert_eq!(grid.weight([50, 50, 80]), 1.0);
        assert_eq!(grid.color([50, 50, 80]), None);

        engine.fuse(&mut grid, &planar_frame, &Transform::eye(), Some(&color));
        engine.fuse(&mut grid, &planar_frame, &Transform::eye(), None);
        assert_eq!(grid.weight([50, 50, 80]), 3.0);
        assert_eq!(grid.color_weight([50, 50, 80]), 1.0);
        assert_eq!(grid.color([50, 50, 80]), Some(Vector3::new(0.0, 120.0, 0.0)));
        assert!(grid.check_invariants());
    }

    #[test]
    fn should_fuse_points_along_rays() {
        let mut grid = empty_grid();
        let points = vec![Vector3::new(0.0, 0.0, 0.3), Vector3::new(0.05, 0.0, 0.3)];
        let summary = FusionEngine::default().fuse_points(&mut grid, &points, &Transform::eye());

        assert!(summary.num_updated > 0);
        assert_relative_eq!(grid.distance([50, 50, 80]), 0.0, epsilon = 1e-5);
        assert_relative_eq!(grid.distance([50, 50, 75]), 0.05, epsilon = 1e-5);
        assert_eq!(grid.weight([50, 50, 60]), 0.0);
        assert!(grid.check_invariants());
    }

    #[test]
    fn should_ignore_invalid_depth() {
        let mut grid = empty_grid();
        let frame = DepthFrame::new(
            ndarray::Array2::zeros((60, 80)),
            crate::unit_test::test_intrinsics(),
        );
        let summary = FusionEngine::default().fuse(&mut grid, &frame, &Transform::eye(), None);
        assert_eq!(summary.num_updated, 0);
        assert!(grid.is_unobserved());
    }
}
