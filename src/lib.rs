pub mod camera;
pub mod error;
pub mod fusion;
pub mod image;
pub mod io;
pub mod kdtree;
pub mod mesh;
pub mod metrics;
mod optim;
pub mod params;
pub mod pointcloud;
pub mod raycast;
pub mod segmentation;
pub mod system;
pub mod tracking;
pub mod trajectory;
pub mod transform;
pub mod volume;

#[cfg(test)]
mod unit_test;

pub use error::{Error, Result};
pub use params::SdfParameters;
pub use system::{ExportOptions, FrameStatus, SdfTracker, TerminationHandle};
