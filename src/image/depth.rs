use image::{ImageBuffer, Luma};
use ndarray::{Array2, ArrayView2};

use crate::camera::CameraIntrinsics;
use crate::error::{Error, Result};

/// Rendered or measured depth in meters, shape `(height, width)`. Zero marks
/// pixels without depth.
pub type DepthImage = Array2<f32>;

/// Whether a depth sample carries a measurement.
#[inline]
pub fn is_valid_depth(depth: f32) -> bool {
    depth.is_finite() && depth > 0.0
}

/// A depth measurement together with the intrinsics of the sensor that took it.
#[derive(Clone, Debug)]
pub struct DepthFrame {
    /// Range values in meters. Zero, negative and non-finite entries are missing data.
    pub depth: DepthImage,
    pub intrinsics: CameraIntrinsics,
}

impl DepthFrame {
    pub fn new(depth: DepthImage, intrinsics: CameraIntrinsics) -> Self {
        Self { depth, intrinsics }
    }

    /// Converts a raw 16-bit depth image into meters.
    ///
    /// # Arguments
    ///
    /// * `depth` - Raw sensor values, 0 is missing.
    /// * `depth_scale` - Meters per raw unit (e.g. 1/5000 for TUM datasets).
    /// * `intrinsics` - Camera intrinsics.
    pub fn from_u16(
        depth: &ArrayView2<u16>,
        depth_scale: f32,
        intrinsics: CameraIntrinsics,
    ) -> Self {
        Self {
            depth: depth.map(|raw| *raw as f32 * depth_scale),
            intrinsics,
        }
    }

    pub fn width(&self) -> usize {
        self.depth.shape()[1]
    }

    pub fn height(&self) -> usize {
        self.depth.shape()[0]
    }

    pub fn valid_count(&self) -> usize {
        self.depth.iter().filter(|z| is_valid_depth(**z)).count()
    }

    /// Rejects frames that cannot be processed at all.
    pub fn check(&self) -> Result<()> {
        if self.width() == 0 || self.height() == 0 {
            return Err(Error::invalid_parameter("depth frame is empty"));
        }
        if self.intrinsics.fx <= 0.0 || self.intrinsics.fy <= 0.0 {
            return Err(Error::invalid_parameter(
                "depth frame has non-positive focal length",
            ));
        }
        Ok(())
    }

    /// Camera-frame point of pixel `(u, v)`, if it has a valid depth.
    pub fn point(&self, u: usize, v: usize) -> Option<nalgebra::Vector3<f32>> {
        let z = self.depth[(v, u)];
        if is_valid_depth(z) {
            Some(self.intrinsics.backproject(u as f32, v as f32, z))
        } else {
            None
        }
    }
}

/// Encodes a metric depth image into a 16-bit image with the given scale,
/// saturating values that don't fit.
pub fn depth_to_luma16(depth: &ArrayView2<f32>, depth_scale: f32) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    let (height, width) = depth.dim();
    ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let z = depth[(y as usize, x as usize)];
        if is_valid_depth(z) {
            Luma([(z / depth_scale).round().min(u16::MAX as f32) as u16])
        } else {
            Luma([0])
        }
    })
}
