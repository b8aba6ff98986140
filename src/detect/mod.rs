//! Detector seams.
//!
//! The object detector and pose estimator are external collaborators. This
//! module defines the traits they implement, the result types they return, a
//! registry that resolves capabilities once at startup, and built-in backends
//! for synthetic scenes and tests.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::{DetectionCapability, DetectorInput, ObjectDetector, PoseEstimator};
pub use backends::{FixedPoseEstimator, MarkerDetector, MarkerPoseEstimator, ScriptedDetector};
pub use registry::BackendRegistry;
pub use result::{Detection, KeypointSource, Keypoints, COCO_PERSON, RETAIL_OBJECT_CLASSES};
