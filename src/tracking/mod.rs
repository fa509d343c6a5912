mod cost_function;

mod tracker;
pub use tracker::{PoseEstimate, PoseTracker, TrackerParams};
