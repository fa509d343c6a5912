use nalgebra::Vector3;
use ndarray::{Array2, Array3};
use rstest::fixture;

use super::frames::test_intrinsics;
use super::grids::{empty_grid, test_band};
use crate::camera::CameraIntrinsics;
use crate::image::DepthFrame;
use crate::transform::Transform;
use crate::volume::VoxelGrid;

const WALL_Z: f32 = 0.45;

/// A sphere floating in front of a wall, stored as an exact truncated
/// distance field. Gives the tracker constraints on all six axes.
pub struct SphereScene {
    pub grid: VoxelGrid,
    pub center: Vector3<f32>,
    pub radius: f32,
}

impl SphereScene {
    fn distance(&self, point: &Vector3<f32>) -> f32 {
        ((point - self.center).norm() - self.radius).min(WALL_Z - point[2])
    }

    pub fn frame_intrinsics(&self) -> CameraIntrinsics {
        test_intrinsics()
    }

    /// Ray traced depth of the scene seen from `camera_to_world`.
    pub fn render(&self, camera_to_world: &Transform) -> DepthFrame {
        let intrinsics = self.frame_intrinsics();
        let origin = camera_to_world.translation();
        let depth = Array2::from_shape_fn((60, 80), |(v, u)| {
            let ray = intrinsics.backproject(u as f32, v as f32, 1.0);
            let dir = camera_to_world.rotate(&ray);

            let to_origin = origin - self.center;
            let a = dir.norm_squared();
            let b = 2.0 * dir.dot(&to_origin);
            let c = to_origin.norm_squared() - self.radius * self.radius;
            let disc = b * b - 4.0 * a * c;
            let sphere_t = if disc >= 0.0 {
                Some((-b - disc.sqrt()) / (2.0 * a)).filter(|t| *t > 0.0)
            } else {
                None
            };
            let wall_t = if dir[2] > 1e-6 {
                Some((WALL_Z - origin[2]) / dir[2]).filter(|t| *t > 0.0)
            } else {
                None
            };

            // `ray` has unit Z, so the ray parameter is the camera depth.
            match (sphere_t, wall_t) {
                (Some(s), Some(w)) => s.min(w),
                (Some(t), None) | (None, Some(t)) => t,
                (None, None) => 0.0,
            }
        });
        DepthFrame::new(depth, intrinsics)
    }
}

#[fixture]
pub fn sphere_scene() -> SphereScene {
    let mut scene = SphereScene {
        grid: empty_grid(),
        center: Vector3::new(0.0, 0.0, 0.3),
        radius: 0.1,
    };
    let band = test_band();
    let distance = Array3::from_shape_fn(scene.grid.distance.dim(), |(i, j, k)| {
        let position = scene.grid.cell_position([i, j, k]);
        scene.distance(&position).clamp(band.dmin, band.dmax)
    });
    scene.grid.distance = distance;
    scene.grid.weight.fill(1.0);
    scene
}
