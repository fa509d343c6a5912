use ndarray::Array2;
use rstest::fixture;

use crate::camera::CameraIntrinsics;
use crate::image::DepthFrame;

/// 80x60 pinhole camera with a roughly 53 degree horizontal field of view.
pub fn test_intrinsics() -> CameraIntrinsics {
    CameraIntrinsics::from_simple_intrinsic(80.0, 80.0, 39.5, 29.5)
}

/// Every pixel sees a wall 0.3 m ahead.
#[fixture]
pub fn planar_frame() -> DepthFrame {
    DepthFrame::new(Array2::from_elem((60, 80), 0.3), test_intrinsics())
}
