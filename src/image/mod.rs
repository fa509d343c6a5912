mod rgb;
pub use rgb::{color_at, ColorImage, IntoArray3};

mod depth;
pub use depth::{depth_to_luma16, is_valid_depth, DepthFrame, DepthImage};
