mod grid;
pub(crate) use grid::ColorVolume;
pub use grid::{TruncationBand, VoxelGrid};

mod interpolate;
pub use interpolate::Sample;
