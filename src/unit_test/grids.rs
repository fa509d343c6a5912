use nalgebra::Vector3;
use ndarray::Array3;
use rstest::fixture;

use crate::volume::{ColorVolume, TruncationBand, VoxelGrid};

/// 100^3 cells of 1 cm centered on the world origin, band [-0.04, 0.1].
pub(crate) fn test_band() -> TruncationBand {
    TruncationBand::new(-0.04, 0.1, 64.0).unwrap()
}

fn allocate(use_color: bool) -> VoxelGrid {
    VoxelGrid::new(
        [100, 100, 100],
        0.01,
        Vector3::new(-0.5, -0.5, -0.5),
        test_band(),
        use_color,
    )
    .unwrap()
}

#[fixture]
pub fn empty_grid() -> VoxelGrid {
    allocate(false)
}

#[fixture]
pub fn empty_color_grid() -> VoxelGrid {
    allocate(true)
}

/// Grid with the fully observed plane z = 0.3 facing a camera at the origin.
#[fixture]
pub fn planar_grid() -> VoxelGrid {
    let mut grid = allocate(false);
    let band = grid.band();
    let origin_z = grid.origin()[2];
    let resolution = grid.resolution();
    grid.distance = Array3::from_shape_fn(grid.distance.dim(), |(_, _, k)| {
        let z = origin_z + k as f32 * resolution;
        (0.3 - z).clamp(band.dmin, band.dmax)
    });
    grid.weight.fill(1.0);
    grid
}

/// [`planar_grid`] with the color (10, 20, 30) stored in every cell.
#[fixture]
pub fn colored_planar_grid() -> VoxelGrid {
    let mut grid = planar_grid();
    let mut color = ColorVolume::zeros(grid.distance.dim());
    color.rgb.fill(Vector3::new(10.0, 20.0, 30.0));
    color.weight.fill(1.0);
    grid.color = Some(color);
    grid
}
