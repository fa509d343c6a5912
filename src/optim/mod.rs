mod gaussnewton;
pub use gaussnewton::GaussNewton;

mod robust_estimator;
pub use robust_estimator::{RobustEstimator, TukeyEstimator};
