#![allow(dead_code)]

use nalgebra::Vector3;
use ndarray::Array2;
use sdftrack::camera::CameraIntrinsics;
use sdftrack::image::DepthFrame;
use sdftrack::transform::Transform;
use sdftrack::SdfParameters;

pub const WIDTH: usize = 80;
pub const HEIGHT: usize = 60;

pub fn intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::from_simple_intrinsic(80.0, 80.0, 39.5, 29.5)
}

/// 1 m^3 volume of 1 cm cells centered on the camera's starting position.
pub fn params() -> SdfParameters {
    SdfParameters::default()
        .with_grid_size(100, 100, 100)
        .with_resolution(0.01)
        .with_truncation(-0.04, 0.1)
        .with_intrinsics(intrinsics())
        .with_image_size(WIDTH, HEIGHT)
        .with_pose_offset(Vector3::zeros())
}

/// Depth of a constant distance wall.
pub fn planar_frame(z: f32) -> DepthFrame {
    DepthFrame::new(Array2::from_elem((HEIGHT, WIDTH), z), intrinsics())
}

/// Corner of a room seen from `camera_to_world`: a back wall at z = 0.35, a
/// floor at y = 0.08 and a side wall at x = 0.1.
pub fn corner_frame(camera_to_world: &Transform) -> DepthFrame {
    let intrinsics = intrinsics();
    let origin = camera_to_world.translation();
    let planes = [(2, 0.35f32), (1, 0.08), (0, 0.1)];

    let depth = Array2::from_shape_fn((HEIGHT, WIDTH), |(v, u)| {
        let direction = camera_to_world.rotate(&intrinsics.backproject(u as f32, v as f32, 1.0));
        planes
            .iter()
            .filter(|(axis, _)| direction[*axis] > 1e-6)
            .map(|(axis, offset)| (offset - origin[*axis]) / direction[*axis])
            .filter(|t| *t > 0.0)
            .fold(f32::INFINITY, f32::min)
    })
    .mapv(|t| if t.is_finite() { t } else { 0.0 });
    DepthFrame::new(depth, intrinsics)
}
