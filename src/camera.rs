use nalgebra::Vector3;
use serde_derive::{Deserialize, Serialize};

use super::transform::Transform;

/// Camera intrinsic parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// Focal length and pixel scale in the X-axis.
    pub fx: f64,
    /// Focal length and pixel scale in the Y-axis.
    pub fy: f64,
    /// Camera X-center.
    pub cx: f64,
    /// Camera Y-center.
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn from_simple_intrinsic(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Project a 3D point into image space.
    ///
    /// # Arguments
    ///
    /// * point: The 3D point in the camera frame.
    ///
    /// # Returns
    ///
    /// * (x and y) coordinates.
    pub fn project(&self, point: &Vector3<f32>) -> (f32, f32) {
        (
            point[0] * self.fx as f32 / point[2] + self.cx as f32,
            point[1] * self.fy as f32 / point[2] + self.cy as f32,
        )
    }

    /// Back-projects the pixel `(x, y)` with depth `z` into the camera frame.
    pub fn backproject(&self, x: f32, y: f32, z: f32) -> Vector3<f32> {
        Vector3::new(
            (x - self.cx as f32) * z / self.fx as f32,
            (y - self.cy as f32) * z / self.fy as f32,
            z,
        )
    }

    /// Scale the camera parameters according to the given scale.
    ///
    /// # Arguments
    ///
    /// * scale: The scale factor.
    ///
    /// # Returns
    ///
    /// * A new camera with scaled parameters.
    pub fn scale(&self, scale: f64) -> Self {
        Self {
            fx: self.fx * scale,
            fy: self.fy * scale,
            cx: self.cx * scale,
            cy: self.cy * scale,
        }
    }
}

/// Intrinsics plus a pose and the image size. Maps world points to pixels and
/// pixels to world rays.
#[derive(Clone, Debug)]
pub struct PinholeCamera {
    pub intrinsics: CameraIntrinsics,
    pub camera_to_world: Transform,
    world_to_camera: Transform,
    pub width: usize,
    pub height: usize,
}

impl PinholeCamera {
    pub fn new(
        intrinsics: CameraIntrinsics,
        camera_to_world: Transform,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            intrinsics,
            world_to_camera: camera_to_world.inverse(),
            camera_to_world,
            width,
            height,
        }
    }

    pub fn world_to_camera(&self) -> &Transform {
        &self.world_to_camera
    }

    /// Camera center in world coordinates.
    pub fn center(&self) -> Vector3<f32> {
        self.camera_to_world.translation()
    }

    /// Project a world point into image space.
    ///
    /// # Returns
    ///
    /// * (x and y) coordinates and the depth of the point in the camera frame.
    pub fn project(&self, point: &Vector3<f32>) -> (f32, f32, f32) {
        let camera_point = &self.world_to_camera * point;
        let (x, y) = self.intrinsics.project(&camera_point);
        (x, y, camera_point[2])
    }

    /// Projects a world point and rounds to the nearest pixel. Returns `None`
    /// if the point is behind the camera or falls outside the image.
    pub fn project_to_pixel(&self, point: &Vector3<f32>) -> Option<(usize, usize, f32)> {
        let (x, y, z) = self.project(point);
        if z <= 0.0 {
            return None;
        }

        let (u, v) = ((x + 0.5).floor(), (y + 0.5).floor());
        if u >= 0.0 && u < self.width as f32 && v >= 0.0 && v < self.height as f32 {
            Some((u as usize, v as usize, z))
        } else {
            None
        }
    }

    /// Unit direction in world coordinates of the ray through pixel `(u, v)`.
    pub fn ray_direction(&self, u: f32, v: f32) -> Vector3<f32> {
        let camera_ray = self.intrinsics.backproject(u, v, 1.0);
        self.camera_to_world.rotate(&camera_ray).normalize()
    }
}
