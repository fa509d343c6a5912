use nalgebra::Vector3;
use ndarray::prelude::*;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::Geometry;
use crate::mesh::{color_to_rgb, normal_to_rgb};
use crate::volume::VoxelGrid;

/// Unordered point set. Points, normals and colors are `(N, 3)` arrays.
#[derive(Clone, Debug)]
pub struct PointCloud {
    pub points: Array2<f32>,
    pub normals: Option<Array2<f32>>,
    pub colors: Option<Array2<u8>>,
}

impl PointCloud {
    pub fn empty() -> Self {
        Self {
            points: Array2::zeros((0, 3)),
            normals: None,
            colors: None,
        }
    }

    /// Builds a cloud from point vectors.
    pub fn from_points(points: &[Vector3<f32>]) -> Self {
        Self {
            points: Array2::from_shape_fn((points.len(), 3), |(i, c)| points[i][c]),
            normals: None,
            colors: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point(&self, index: usize) -> Vector3<f32> {
        Vector3::new(
            self.points[(index, 0)],
            self.points[(index, 1)],
            self.points[(index, 2)],
        )
    }

    pub fn normal(&self, index: usize) -> Option<Vector3<f32>> {
        self.normals.as_ref().map(|normals| {
            Vector3::new(normals[(index, 0)], normals[(index, 1)], normals[(index, 2)])
        })
    }

    /// Copies the rows at `indices` into a new cloud.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            points: self.points.select(Axis(0), indices),
            normals: self
                .normals
                .as_ref()
                .map(|normals| normals.select(Axis(0), indices)),
            colors: self
                .colors
                .as_ref()
                .map(|colors| colors.select(Axis(0), indices)),
        }
    }
}

impl From<PointCloud> for Geometry {
    fn from(pcl: PointCloud) -> Geometry {
        Geometry {
            points: pcl.points,
            normals: pcl.normals,
            colors: pcl.colors,
            faces: None,
        }
    }
}

struct SurfacePoint {
    position: Vector3<f32>,
    normal: Vector3<f32>,
    color: [u8; 3],
}

/// Emits the observed cells whose distance lies inside `[lower, upper]`.
#[derive(Debug, Clone)]
pub struct SurfaceSampler {
    pub lower: f32,
    pub upper: f32,
    /// Moves each point along its normal onto the zero level set.
    pub project_to_surface: bool,
    /// Fills the cloud's normals from the field's gradient.
    pub with_normals: bool,
}

impl Default for SurfaceSampler {
    fn default() -> Self {
        Self {
            lower: -0.02,
            upper: 0.03,
            project_to_surface: true,
            with_normals: true,
        }
    }
}

impl SurfaceSampler {
    pub fn new(lower: f32, upper: f32) -> Result<Self> {
        if !(lower <= upper) {
            return Err(Error::invalid_parameter(format!(
                "surface band lower bound {lower} is above upper bound {upper}"
            )));
        }
        Ok(Self {
            lower,
            upper,
            ..Default::default()
        })
    }

    pub fn project_to_surface(mut self, value: bool) -> Self {
        self.project_to_surface = value;
        self
    }

    pub fn with_normals(mut self, value: bool) -> Self {
        self.with_normals = value;
        self
    }

    fn sample_slice(&self, grid: &VoxelGrid, i: usize, with_color: bool) -> Vec<SurfacePoint> {
        let [_, ny, nz] = grid.dims();
        let mut points = Vec::new();
        for j in 0..ny {
            for k in 0..nz {
                let index = [i, j, k];
                let distance = grid.distance[index];
                if grid.weight[index] <= 0.0 || distance < self.lower || distance > self.upper {
                    continue;
                }

                let mut position = grid.cell_position(index);
                let normal = if self.with_normals || self.project_to_surface {
                    match grid.normal(&position) {
                        Some(normal) => normal,
                        // Cells next to unobserved space have no gradient.
                        None => continue,
                    }
                } else {
                    Vector3::zeros()
                };
                if self.project_to_surface {
                    position -= normal * distance;
                }

                let color = if with_color {
                    match grid.sample_color(&position).or_else(|| grid.color(index)) {
                        Some(color) => color_to_rgb(&color),
                        None => normal_to_rgb(&grid.normal(&position).unwrap_or(normal)),
                    }
                } else {
                    [0; 3]
                };

                points.push(SurfacePoint {
                    position,
                    normal,
                    color,
                });
            }
        }
        points
    }

    fn sample(&self, grid: &VoxelGrid, with_color: bool) -> PointCloud {
        let slices = (0..grid.dims()[0])
            .into_par_iter()
            .map(|i| self.sample_slice(grid, i, with_color))
            .collect::<Vec<_>>();
        let points = slices.into_iter().flatten().collect::<Vec<_>>();

        let len = points.len();
        let cloud = PointCloud {
            points: Array2::from_shape_fn((len, 3), |(i, c)| points[i].position[c]),
            normals: self
                .with_normals
                .then(|| Array2::from_shape_fn((len, 3), |(i, c)| points[i].normal[c])),
            colors: with_color.then(|| Array2::from_shape_fn((len, 3), |(i, c)| points[i].color[c])),
        };
        debug!(points = cloud.len(), "sampled surface band");
        cloud
    }

    /// Samples the band into a point cloud. An unobserved grid yields an
    /// empty cloud.
    pub fn sample_band(&self, grid: &VoxelGrid) -> PointCloud {
        self.sample(grid, false)
    }

    /// Like [`Self::sample_band`], with per point colors.
    ///
    /// # Returns
    ///
    /// * `Error::InvalidParameter` if the grid stores no colors.
    pub fn sample_band_rgb(&self, grid: &VoxelGrid) -> Result<PointCloud> {
        if !grid.has_color() {
            return Err(Error::invalid_parameter("the volume has no color channel"));
        }
        Ok(self.sample(grid, true))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use rstest::rstest;

    use super::*;
    use crate::unit_test::{empty_grid, planar_grid};

    #[rstest]
    fn should_sample_planar_band(planar_grid: VoxelGrid) {
        let sampler = SurfaceSampler::new(-0.02, 0.03).unwrap().project_to_surface(false);
        let cloud = sampler.sample_band(&planar_grid);
        assert!(!cloud.is_empty());

        // Layers z = 0.27..0.32, but cells without both gradient neighbours
        // on the border are dropped.
        for i in 0..cloud.len() {
            let z = cloud.point(i)[2];
            assert!((0.27 - 1e-5..=0.32 + 1e-5).contains(&z), "{z}");
        }
        assert!(cloud.colors.is_none());
        assert_relative_eq!(cloud.normal(0).unwrap()[2], -1.0, epsilon = 1e-4);
    }

    #[rstest]
    fn should_project_onto_surface(planar_grid: VoxelGrid) {
        let cloud = SurfaceSampler::default().sample_band(&planar_grid);
        for point in cloud.points.axis_iter(Axis(0)) {
            assert_relative_eq!(point[2], 0.3, epsilon = 1e-4);
        }
    }

    #[rstest]
    fn rgb_sampling_requires_color(planar_grid: VoxelGrid) {
        assert!(SurfaceSampler::default().sample_band_rgb(&planar_grid).is_err());
    }

    #[test]
    fn should_sample_colors() {
        let grid = crate::unit_test::colored_planar_grid();
        let cloud = SurfaceSampler::default().sample_band_rgb(&grid).unwrap();
        let colors = cloud.colors.unwrap();
        assert_eq!(colors.nrows(), cloud.points.nrows());
        assert_eq!(colors.row(0).to_vec(), vec![10, 20, 30]);
    }

    #[rstest]
    fn uncolored_band_should_use_normal_shading(planar_grid: VoxelGrid) {
        let mut grid = planar_grid;
        grid.color = Some(crate::volume::ColorVolume::zeros(grid.distance.dim()));
        let cloud = SurfaceSampler::default().sample_band_rgb(&grid).unwrap();
        let colors = cloud.colors.unwrap();
        assert!(colors.nrows() > 0);
        for color in colors.axis_iter(Axis(0)) {
            assert_ne!(color.to_vec(), vec![0, 0, 0]);
            assert_eq!(color[2], 0);
        }
    }

    #[test]
    fn empty_grid_should_yield_empty_cloud() {
        let cloud = SurfaceSampler::default().sample_band(&empty_grid());
        assert!(cloud.is_empty());
    }

    #[test]
    fn should_reject_inverted_band() {
        assert!(SurfaceSampler::new(0.1, -0.1).is_err());
    }

    #[test]
    fn should_select_rows() {
        let cloud = PointCloud::from_points(&[
            Vector3::new(1.0, 2.0, 3.0),
            Vector3::new(4.0, 5.0, 6.0),
            Vector3::new(7.0, 8.0, 9.0),
        ]);
        let selected = cloud.select(&[2, 0]);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected.point(0), Vector3::new(7.0, 8.0, 9.0));
    }
}
