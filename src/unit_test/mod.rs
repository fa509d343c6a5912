mod grids;
pub(crate) use grids::{colored_planar_grid, empty_color_grid, empty_grid, planar_grid};
mod frames;
pub(crate) use frames::{planar_frame, test_intrinsics};
mod scenes;
pub(crate) use scenes::{sphere_scene, SphereScene};
