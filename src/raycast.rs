use nalgebra::Vector3;
use ndarray::{Array2, Array3, Axis, Zip};
use tracing::debug;

use crate::camera::PinholeCamera;
use crate::image::DepthImage;
use crate::volume::VoxelGrid;

/// Renders depth images of the zero level set by sphere tracing the
/// distance field.
#[derive(Debug, Clone)]
pub struct Raycaster {
    /// Maximum number of samples taken along each ray.
    pub max_steps: usize,
}

impl Default for Raycaster {
    fn default() -> Self {
        Self { max_steps: 64 }
    }
}

/// Entry and exit ray parameters of an axis aligned box, if the ray hits it.
fn intersect_box(
    origin: &Vector3<f32>,
    direction: &Vector3<f32>,
    min: &Vector3<f32>,
    max: &Vector3<f32>,
) -> Option<(f32, f32)> {
    let mut t_near = f32::NEG_INFINITY;
    let mut t_far = f32::INFINITY;
    for axis in 0..3 {
        if direction[axis].abs() < f32::EPSILON {
            if origin[axis] < min[axis] || origin[axis] > max[axis] {
                return None;
            }
            continue;
        }
        let inv = 1.0 / direction[axis];
        let t0 = (min[axis] - origin[axis]) * inv;
        let t1 = (max[axis] - origin[axis]) * inv;
        t_near = t_near.max(t0.min(t1));
        t_far = t_far.min(t0.max(t1));
    }

    if t_far < t_near.max(0.0) {
        None
    } else {
        Some((t_near.max(0.0), t_far))
    }
}

impl Raycaster {
    pub fn new(max_steps: usize) -> Self {
        Self { max_steps }
    }

    /// Marches a ray through the grid looking for the first crossing from
    /// positive to negative distance.
    ///
    /// # Arguments
    ///
    /// * `origin` - Ray origin in world coordinates.
    /// * `direction` - Unit ray direction in world coordinates.
    ///
    /// # Returns
    ///
    /// * Distance along the ray to the refined crossing, `None` when the ray
    /// leaves the grid or runs out of steps.
    pub fn cast_ray(
        &self,
        grid: &VoxelGrid,
        origin: &Vector3<f32>,
        direction: &Vector3<f32>,
    ) -> Option<f32> {
        let (min, max) = grid.bounds();
        let (t_enter, t_exit) = intersect_box(origin, direction, &min, &max)?;
        let band = grid.band();
        let min_step = grid.resolution();
        let unknown_step = band.dmax.min(-band.dmin);

        let mut t = t_enter;
        let mut previous: Option<(f32, f32)> = None;
        for _ in 0..self.max_steps {
            if t > t_exit {
                return None;
            }

            let step = match grid.sample_distance(&(origin + direction * t)) {
                Some(distance) => {
                    if let Some((t_prev, d_prev)) = previous {
                        if d_prev > 0.0 && distance <= 0.0 {
                            return Some(t_prev + (t - t_prev) * d_prev / (d_prev - distance));
                        }
                    }
                    previous = Some((t, distance));
                    distance.max(min_step)
                }
                None => {
                    previous = None;
                    unknown_step
                }
            };
            t += step;
        }
        None
    }

    /// Renders a depth image, zero where no surface was found.
    pub fn render(&self, grid: &VoxelGrid, camera: &PinholeCamera) -> DepthImage {
        let mut depth = Array2::zeros((camera.height, camera.width));
        let center = camera.center();

        Zip::indexed(&mut depth).par_for_each(|(v, u), depth| {
            *depth = self.pixel_depth(grid, camera, &center, u, v).unwrap_or(0.0);
        });

        debug!(
            hits = depth.iter().filter(|z| **z > 0.0).count(),
            "rendered depth"
        );
        depth
    }

    /// Renders depth and world-frame unit normals, shape `(height, width, 3)`.
    /// Pixels without a surface or without a defined normal hold zeros.
    pub fn render_normals(&self, grid: &VoxelGrid, camera: &PinholeCamera) -> (DepthImage, Array3<f32>) {
        let mut depth = Array2::zeros((camera.height, camera.width));
        let mut normals = Array3::zeros((camera.height, camera.width, 3));
        let center = camera.center();

        Zip::indexed(&mut depth)
            .and(normals.lanes_mut(Axis(2)))
            .par_for_each(|(v, u), depth, mut normal| {
                let direction = camera.ray_direction(u as f32, v as f32);
                if let Some(t) = self.cast_ray(grid, &center, &direction) {
                    let hit = center + direction * t;
                    *depth = camera.project(&hit).2;
                    if let Some(n) = grid.normal(&hit) {
                        normal[0] = n[0];
                        normal[1] = n[1];
                        normal[2] = n[2];
                    }
                }
            });
        (depth, normals)
    }

    fn pixel_depth(
        &self,
        grid: &VoxelGrid,
        camera: &PinholeCamera,
        center: &Vector3<f32>,
        u: usize,
        v: usize,
    ) -> Option<f32> {
        let direction = camera.ray_direction(u as f32, v as f32);
        let t = self.cast_ray(grid, center, &direction)?;
        let z = camera.project(&(center + direction * t)).2;
        (z > 0.0).then_some(z)
    }
}
