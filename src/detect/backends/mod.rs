pub mod marker;
pub mod stub;

pub use marker::{MarkerDetector, MarkerPoseEstimator};
pub use stub::{FixedPoseEstimator, ScriptedDetector};
