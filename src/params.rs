use std::path::Path;

use nalgebra::Vector3;
use serde_derive::{Deserialize, Serialize};

use crate::camera::CameraIntrinsics;
use crate::error::{Error, Result};

/// All tunables of the tracker. Every field has a default, so partial JSON
/// files are accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdfParameters {
    /// Number of cells along X, Y and Z.
    pub grid_size: [usize; 3],
    /// Edge length of a cell in meters.
    pub resolution: f32,
    /// World position of cell `(0, 0, 0)`. `None` centers the grid at the origin.
    pub grid_origin: Option<[f32; 3]>,
    /// Positive truncation distance (in front of surfaces).
    pub dmax: f32,
    /// Negative truncation distance (behind surfaces), must be negative.
    pub dmin: f32,
    /// Weight saturation.
    pub wmax: f32,
    /// Stores per-cell color when set.
    pub use_color: bool,

    /// Tukey width as a fraction of `dmax`.
    pub robust_statistic_coefficient: f32,
    /// Levenberg-Marquardt damping added to the scaled normal equations.
    pub regularization: f32,
    /// Stops a pyramid level once the update norm falls below this value.
    pub convergence_condition: f32,
    /// Twist norm of the motion since the last fused frame required to fuse again.
    pub min_pose_change: f32,
    /// Pixel strides used from coarse to fine.
    pub pyramid_strides: Vec<usize>,
    /// Iteration cap for each entry of `pyramid_strides`.
    pub pyramid_iterations: Vec<usize>,
    /// Fewer residuals than this marks the frame as lost.
    pub min_valid_residuals: usize,
    /// Estimates motion on every frame. When false, frames are fused at the
    /// pose given through `SdfTracker::set_pose`.
    pub tracking_enabled: bool,
    /// Fuses frames whose tracking is degraded using the last good pose.
    pub fuse_when_lost: bool,

    /// Ray marching step budget.
    pub raycast_steps: usize,

    pub image_width: usize,
    pub image_height: usize,
    pub intrinsics: CameraIntrinsics,
    /// Initial camera position in world coordinates.
    pub pose_offset: [f32; 3],
}

impl Default for SdfParameters {
    fn default() -> Self {
        Self {
            grid_size: [250, 250, 250],
            resolution: 0.01,
            grid_origin: None,
            dmax: 0.1,
            dmin: -0.04,
            wmax: 64.0,
            use_color: false,
            robust_statistic_coefficient: 0.02,
            regularization: 0.01,
            convergence_condition: 0.0001,
            min_pose_change: 0.01,
            pyramid_strides: vec![4, 2, 1],
            pyramid_iterations: vec![12, 8, 2],
            min_valid_residuals: 100,
            tracking_enabled: true,
            fuse_when_lost: false,
            raycast_steps: 64,
            image_width: 640,
            image_height: 480,
            intrinsics: CameraIntrinsics::from_simple_intrinsic(520.0, 520.0, 319.5, 239.5),
            pose_offset: [0.0, 0.0, -0.7],
        }
    }
}

impl SdfParameters {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let params: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        params.validate()?;
        Ok(params)
    }

    pub fn with_grid_size(mut self, x: usize, y: usize, z: usize) -> Self {
        self.grid_size = [x, y, z];
        self
    }

    pub fn with_resolution(mut self, value: f32) -> Self {
        self.resolution = value;
        self
    }

    pub fn with_grid_origin(mut self, origin: Vector3<f32>) -> Self {
        self.grid_origin = Some([origin[0], origin[1], origin[2]]);
        self
    }

    pub fn with_truncation(mut self, dmin: f32, dmax: f32) -> Self {
        self.dmin = dmin;
        self.dmax = dmax;
        self
    }

    pub fn with_max_weight(mut self, value: f32) -> Self {
        self.wmax = value;
        self
    }

    pub fn with_color(mut self, value: bool) -> Self {
        self.use_color = value;
        self
    }

    pub fn with_image_size(mut self, width: usize, height: usize) -> Self {
        self.image_width = width;
        self.image_height = height;
        self
    }

    pub fn with_intrinsics(mut self, intrinsics: CameraIntrinsics) -> Self {
        self.intrinsics = intrinsics;
        self
    }

    pub fn with_pose_offset(mut self, offset: Vector3<f32>) -> Self {
        self.pose_offset = [offset[0], offset[1], offset[2]];
        self
    }

    pub fn with_min_pose_change(mut self, value: f32) -> Self {
        self.min_pose_change = value;
        self
    }

    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.tracking_enabled = enabled;
        self
    }

    pub fn with_raycast_steps(mut self, value: usize) -> Self {
        self.raycast_steps = value;
        self
    }

    pub fn with_min_valid_residuals(mut self, value: usize) -> Self {
        self.min_valid_residuals = value;
        self
    }

    /// Origin of the grid, centering it around the world origin when unset.
    pub fn origin(&self) -> Vector3<f32> {
        match self.grid_origin {
            Some(origin) => Vector3::from(origin),
            None => Vector3::new(
                -(self.grid_size[0] as f32) * self.resolution * 0.5,
                -(self.grid_size[1] as f32) * self.resolution * 0.5,
                -(self.grid_size[2] as f32) * self.resolution * 0.5,
            ),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.grid_size.iter().any(|size| *size < 2) {
            return Err(Error::invalid_parameter(
                "grid must have at least 2 cells along each axis",
            ));
        }
        if self.resolution <= 0.0 || !self.resolution.is_finite() {
            return Err(Error::invalid_parameter("resolution must be positive"));
        }
        if self.dmax <= 0.0 || self.dmin >= 0.0 {
            return Err(Error::invalid_parameter(format!(
                "truncation band must satisfy dmin < 0 < dmax, got [{}, {}]",
                self.dmin, self.dmax
            )));
        }
        if self.wmax <= 0.0 {
            return Err(Error::invalid_parameter("wmax must be positive"));
        }
        if self.robust_statistic_coefficient <= 0.0 || self.regularization < 0.0 {
            return Err(Error::invalid_parameter(
                "robust coefficient must be positive and regularization non-negative",
            ));
        }
        if self.pyramid_strides.is_empty()
            || self.pyramid_strides.len() != self.pyramid_iterations.len()
            || self.pyramid_strides.contains(&0)
        {
            return Err(Error::invalid_parameter(
                "pyramid strides and iterations must be non-empty, non-zero and of equal length",
            ));
        }
        if self.intrinsics.fx <= 0.0 || self.intrinsics.fy <= 0.0 {
            return Err(Error::invalid_parameter("focal lengths must be positive"));
        }
        if self.image_width == 0 || self.image_height == 0 {
            return Err(Error::invalid_parameter("image size must be positive"));
        }
        Ok(())
    }
}
