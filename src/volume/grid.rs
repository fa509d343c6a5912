use nalgebra::Vector3;
use ndarray::{Array3, Zip};

use crate::error::{Error, Result};
use crate::params::SdfParameters;

/// Truncation limits of the signed distance field.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TruncationBand {
    /// Negative truncation, the distance stored deepest behind a surface.
    pub dmin: f32,
    /// Positive truncation, the distance stored in observed free space.
    pub dmax: f32,
    /// Saturation value of the accumulated weights.
    pub wmax: f32,
}

impl TruncationBand {
    pub fn new(dmin: f32, dmax: f32, wmax: f32) -> Result<Self> {
        if !(dmin < 0.0 && dmax > 0.0 && wmax > 0.0) {
            return Err(Error::invalid_parameter(format!(
                "invalid truncation band dmin={dmin} dmax={dmax} wmax={wmax}"
            )));
        }
        Ok(Self { dmin, dmax, wmax })
    }
}

/// Per-cell colors with their own confidence, since depth-only frames
/// observe distances without observing any color.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ColorVolume {
    /// Accumulated RGB colors in `[0, 255]`.
    pub(crate) rgb: Array3<Vector3<f32>>,
    /// Color weights in `[0, wmax]`. Zero means no color was ever fused.
    pub(crate) weight: Array3<f32>,
}

impl ColorVolume {
    pub(crate) fn zeros(shape: (usize, usize, usize)) -> Self {
        Self {
            rgb: Array3::from_elem(shape, Vector3::zeros()),
            weight: Array3::zeros(shape),
        }
    }
}

/// Dense voxel grid holding a truncated signed distance and a confidence
/// weight per cell, and optionally a color.
///
/// Arrays are indexed as `[x, y, z]`. Cell `(i, j, k)` sits at
/// `origin + (i, j, k) * resolution` in world coordinates.
#[derive(Clone, Debug)]
pub struct VoxelGrid {
    /// Signed distances, always inside `[dmin, dmax]`.
    pub(crate) distance: Array3<f32>,
    /// Confidence weights, always inside `[0, wmax]`. Zero means never observed.
    pub(crate) weight: Array3<f32>,
    pub(crate) color: Option<ColorVolume>,
    resolution: f32,
    origin: Vector3<f32>,
    band: TruncationBand,
}

impl VoxelGrid {
    /// Allocates an unobserved grid.
    ///
    /// # Arguments
    ///
    /// * `dims` - Number of cells along X, Y and Z.
    /// * `resolution` - Cell edge length in meters.
    /// * `origin` - World position of cell `(0, 0, 0)`.
    /// * `band` - Truncation limits.
    /// * `use_color` - Allocates per-cell colors.
    pub fn new(
        dims: [usize; 3],
        resolution: f32,
        origin: Vector3<f32>,
        band: TruncationBand,
        use_color: bool,
    ) -> Result<Self> {
        if dims.iter().any(|dim| *dim < 2) {
            return Err(Error::invalid_parameter(format!(
                "grid dimensions must be at least 2, got {dims:?}"
            )));
        }
        if resolution <= 0.0 || !resolution.is_finite() {
            return Err(Error::invalid_parameter("resolution must be positive"));
        }

        let shape = (dims[0], dims[1], dims[2]);
        Ok(Self {
            distance: Array3::from_elem(shape, band.dmax),
            weight: Array3::zeros(shape),
            color: if use_color {
                Some(ColorVolume::zeros(shape))
            } else {
                None
            },
            resolution,
            origin,
            band,
        })
    }

    pub fn from_params(params: &SdfParameters) -> Result<Self> {
        Self::new(
            params.grid_size,
            params.resolution,
            params.origin(),
            TruncationBand::new(params.dmin, params.dmax, params.wmax)?,
            params.use_color,
        )
    }

    /// Assembles a grid from raw arrays, checking shapes and invariants.
    pub(crate) fn from_parts(
        distance: Array3<f32>,
        weight: Array3<f32>,
        color: Option<ColorVolume>,
        resolution: f32,
        origin: Vector3<f32>,
        band: TruncationBand,
    ) -> Result<Self> {
        if distance.dim() != weight.dim()
            || color.as_ref().map_or(false, |color| {
                color.rgb.dim() != distance.dim() || color.weight.dim() != distance.dim()
            })
        {
            return Err(Error::format("grid arrays have mismatching shapes"));
        }
        let mut grid = Self::new(
            [distance.dim().0, distance.dim().1, distance.dim().2],
            resolution,
            origin,
            band,
            false,
        )?;
        grid.distance = distance;
        grid.weight = weight;
        grid.color = color;
        Ok(grid)
    }

    pub fn dims(&self) -> [usize; 3] {
        let (x, y, z) = self.distance.dim();
        [x, y, z]
    }

    pub fn len(&self) -> usize {
        self.distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    pub fn origin(&self) -> Vector3<f32> {
        self.origin
    }

    pub fn band(&self) -> TruncationBand {
        self.band
    }

    pub fn has_color(&self) -> bool {
        self.color.is_some()
    }

    pub fn distance(&self, index: [usize; 3]) -> f32 {
        self.distance[index]
    }

    pub fn weight(&self, index: [usize; 3]) -> f32 {
        self.weight[index]
    }

    /// Fused color of a cell, `None` when the cell never received one.
    pub fn color(&self, index: [usize; 3]) -> Option<Vector3<f32>> {
        self.color
            .as_ref()
            .filter(|color| color.weight[index] > 0.0)
            .map(|color| color.rgb[index])
    }

    pub fn color_weight(&self, index: [usize; 3]) -> f32 {
        self.color.as_ref().map_or(0.0, |color| color.weight[index])
    }

    /// Continuous grid coordinates of a world point.
    pub fn world_to_grid(&self, point: &Vector3<f32>) -> Vector3<f32> {
        (point - self.origin) / self.resolution
    }

    /// World position of a (possibly fractional) grid coordinate.
    pub fn grid_to_world(&self, coord: &Vector3<f32>) -> Vector3<f32> {
        self.origin + coord * self.resolution
    }

    /// World position of the cell `[i, j, k]`.
    pub fn cell_position(&self, index: [usize; 3]) -> Vector3<f32> {
        self.origin
            + Vector3::new(index[0] as f32, index[1] as f32, index[2] as f32) * self.resolution
    }

    /// Minimum and maximum world coordinates covered by the cells.
    pub fn bounds(&self) -> (Vector3<f32>, Vector3<f32>) {
        let dims = self.dims();
        let extent = Vector3::new(
            (dims[0] - 1) as f32,
            (dims[1] - 1) as f32,
            (dims[2] - 1) as f32,
        ) * self.resolution;
        (self.origin, self.origin + extent)
    }

    /// Number of cells with non-zero weight.
    pub fn observed_count(&self) -> usize {
        self.weight.iter().filter(|w| **w > 0.0).count()
    }

    /// True while nothing was ever fused into the grid.
    pub fn is_unobserved(&self) -> bool {
        self.weight.iter().all(|w| *w <= 0.0)
    }

    /// Clears every cell back to the unobserved state.
    pub fn reset(&mut self) {
        self.distance.fill(self.band.dmax);
        self.weight.fill(0.0);
        if let Some(color) = self.color.as_mut() {
            color.rgb.fill(Vector3::zeros());
            color.weight.fill(0.0);
        }
    }

    /// Checks the distance and weight invariants on every cell.
    pub fn check_invariants(&self) -> bool {
        let band = self.band;
        let fields = Zip::from(&self.distance)
            .and(&self.weight)
            .fold(true, |ok, distance, weight| {
                ok && *distance >= band.dmin
                    && *distance <= band.dmax
                    && *weight >= 0.0
                    && *weight <= band.wmax
            });
        fields
            && self.color.as_ref().map_or(true, |color| {
                color
                    .weight
                    .iter()
                    .all(|weight| *weight >= 0.0 && *weight <= band.wmax)
            })
    }
}
