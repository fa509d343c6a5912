use std::ops::{Add, Mul};

use nalgebra::Vector3;

use super::grid::VoxelGrid;

/// Interpolated value of the field at a continuous position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sample {
    pub distance: f32,
    pub weight: f32,
}

/// The 8 cells enclosing a continuous grid coordinate plus the fractional
/// offsets inside the lower corner's cell.
struct Corners {
    base: [usize; 3],
    frac: Vector3<f32>,
}

const CORNER_OFFSETS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [0, 1, 0],
    [1, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [0, 1, 1],
    [1, 1, 1],
];

fn trilinear<T>(values: &[T; 8], frac: &Vector3<f32>) -> T
where
    T: Copy + Add<Output = T> + Mul<f32, Output = T>,
{
    let (fx, fy, fz) = (frac[0], frac[1], frac[2]);
    let x00 = values[0] * (1.0 - fx) + values[1] * fx;
    let x10 = values[2] * (1.0 - fx) + values[3] * fx;
    let x01 = values[4] * (1.0 - fx) + values[5] * fx;
    let x11 = values[6] * (1.0 - fx) + values[7] * fx;

    let y0 = x00 * (1.0 - fy) + x10 * fy;
    let y1 = x01 * (1.0 - fy) + x11 * fy;

    y0 * (1.0 - fz) + y1 * fz
}

impl VoxelGrid {
    /// Locates the enclosing cells. Coordinates within half a cell outside the
    /// grid are clamped to the border, anything further away has no data.
    fn corners(&self, point: &Vector3<f32>) -> Option<Corners> {
        let coord = self.world_to_grid(point);
        let dims = self.dims();

        let mut base = [0usize; 3];
        let mut frac = Vector3::zeros();
        for axis in 0..3 {
            let upper = (dims[axis] - 1) as f32;
            let c = coord[axis];
            if !c.is_finite() || c < -0.5 || c > upper + 0.5 {
                return None;
            }
            let c = c.clamp(0.0, upper);
            let lower = (c.floor() as usize).min(dims[axis] - 2);
            base[axis] = lower;
            frac[axis] = c - lower as f32;
        }

        Some(Corners { base, frac })
    }

    fn corner_index(corners: &Corners, offset: &[usize; 3]) -> [usize; 3] {
        [
            corners.base[0] + offset[0],
            corners.base[1] + offset[1],
            corners.base[2] + offset[2],
        ]
    }

    /// Trilinear sample of distance and weight at a world point.
    ///
    /// # Returns
    ///
    /// * `None` if the point lies outside the grid or none of the 8 enclosing
    /// cells was ever observed.
    pub fn sample(&self, point: &Vector3<f32>) -> Option<Sample> {
        let corners = self.corners(point)?;

        let mut distances = [0.0f32; 8];
        let mut weights = [0.0f32; 8];
        for (n, offset) in CORNER_OFFSETS.iter().enumerate() {
            let index = Self::corner_index(&corners, offset);
            distances[n] = self.distance[index];
            weights[n] = self.weight[index];
        }

        if weights.iter().all(|w| *w <= 0.0) {
            return None;
        }

        Some(Sample {
            distance: trilinear(&distances, &corners.frac),
            weight: trilinear(&weights, &corners.frac),
        })
    }

    /// Interpolated distance, `None` when unknown.
    pub fn sample_distance(&self, point: &Vector3<f32>) -> Option<f32> {
        self.sample(point).map(|sample| sample.distance)
    }

    /// Trilinear color at a world point, weighted by the color confidence of
    /// the enclosing cells. `None` when none of them ever received a color.
    pub fn sample_color(&self, point: &Vector3<f32>) -> Option<Vector3<f32>> {
        let color = self.color.as_ref()?;
        let corners = self.corners(point)?;

        let mut colors = [Vector3::zeros(); 8];
        let mut weights = [0.0f32; 8];
        for (n, offset) in CORNER_OFFSETS.iter().enumerate() {
            let index = Self::corner_index(&corners, offset);
            weights[n] = color.weight[index];
            colors[n] = color.rgb[index] * weights[n];
        }

        let coverage = trilinear(&weights, &corners.frac);
        if coverage <= f32::EPSILON {
            return None;
        }
        Some(trilinear(&colors, &corners.frac) / coverage)
    }

    /// Central difference derivative of the distance along `axis`.
    ///
    /// # Arguments
    ///
    /// * `point` - World point.
    /// * `axis` - 0, 1 or 2 for X, Y or Z.
    /// * `step` - Half the differencing baseline, in cells.
    pub fn gradient(&self, point: &Vector3<f32>, axis: usize, step: f32) -> Option<f32> {
        let delta = step * self.resolution();
        let mut offset = Vector3::zeros();
        offset[axis] = delta;

        let forward = self.sample(&(point + offset))?;
        let backward = self.sample(&(point - offset))?;
        Some((forward.distance - backward.distance) / (2.0 * delta))
    }

    /// Spatial gradient of the distance field using a one cell step.
    pub fn gradient3(&self, point: &Vector3<f32>) -> Option<Vector3<f32>> {
        Some(Vector3::new(
            self.gradient(point, 0, 1.0)?,
            self.gradient(point, 1, 1.0)?,
            self.gradient(point, 2, 1.0)?,
        ))
    }

    /// Unit surface normal, pointing towards free space.
    pub fn normal(&self, point: &Vector3<f32>) -> Option<Vector3<f32>> {
        let gradient = self.gradient3(point)?;
        let norm = gradient.norm();
        if norm > 1e-6 {
            Some(gradient / norm)
        } else {
            None
        }
    }
}
