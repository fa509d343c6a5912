mod dataset;
pub use dataset::{DatasetFrame, DepthDataset, TUM_DEPTH_SCALE};
mod geometry;
pub use geometry::Geometry;
mod ply;
pub use ply::{write_mesh_ply, write_ply, write_point_cloud_ply};
mod volume;
pub use volume::{load_volume, read_volume, save_volume, write_volume};
