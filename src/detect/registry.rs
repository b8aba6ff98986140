use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use super::backend::{DetectionCapability, DetectorInput, ObjectDetector, PoseEstimator};
use super::result::{Detection, Keypoints};

type SharedDetector = Arc<Mutex<dyn ObjectDetector>>;

/// Detector and pose backends shared by every camera pipeline.
///
/// Backends sit behind a `Mutex` because inference takes `&mut self`. Clones
/// share the same backends; no per-camera state lives here.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    detectors: BTreeMap<String, SharedDetector>,
    preferred: Option<String>,
    pose: Option<Arc<Mutex<dyn PoseEstimator>>>,
}

fn lock<'a, T: ?Sized>(backend: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>> {
    backend
        .lock()
        .map_err(|_| anyhow!("backend '{}' lock poisoned", name))
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a detector. The first one registered is preferred.
    pub fn register<B: ObjectDetector + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        self.preferred.get_or_insert_with(|| name.clone());
        self.detectors.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.detectors.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.preferred = Some(name.to_string());
        Ok(())
    }

    /// Registered detector names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }

    pub fn register_pose_estimator<P: PoseEstimator + 'static>(&mut self, estimator: P) {
        self.pose = Some(Arc::new(Mutex::new(estimator)));
    }

    /// Capability flag consulted once when a pipeline is built.
    pub fn has_pose_estimator(&self) -> bool {
        self.pose.is_some()
    }

    pub fn warm_up(&self) -> Result<()> {
        for (name, backend) in &self.detectors {
            lock(&**backend, name)?.warm_up()?;
        }
        Ok(())
    }

    /// Preferred detector if it handles `capability`, else the first that does.
    fn detector_for(&self, capability: DetectionCapability) -> Result<(&str, &SharedDetector)> {
        let preferred = self
            .preferred
            .as_deref()
            .and_then(|name| self.detectors.get_key_value(name));
        for (name, backend) in preferred.into_iter().chain(self.detectors.iter()) {
            if lock(&**backend, name)?.supports(capability) {
                return Ok((name.as_str(), backend));
            }
        }
        Err(anyhow!("no registered backend supports {:?}", capability))
    }

    /// Detect with a backend offering `capability`, then enforce the class
    /// filter and confidence floor regardless of what the backend returned.
    pub fn detect_with_capability(
        &self,
        capability: DetectionCapability,
        input: &DetectorInput<'_>,
        class_filter: &[u32],
        min_confidence: f32,
    ) -> Result<Vec<Detection>> {
        let (name, backend) = self.detector_for(capability)?;
        let detections = lock(&**backend, name)?.detect(input, class_filter, min_confidence)?;
        Ok(detections
            .into_iter()
            .filter(|d| class_filter.contains(&d.class_id) && d.confidence >= min_confidence)
            .collect())
    }

    /// Run the pose estimator on a crop. `Ok(None)` when none is registered.
    pub fn estimate_pose(&self, crop: &DetectorInput<'_>) -> Result<Option<Keypoints>> {
        match &self.pose {
            Some(pose) => lock(&**pose, "pose")?.estimate(crop),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::{FixedPoseEstimator, ScriptedDetector};
    use crate::detect::result::COCO_PERSON;
    use crate::geometry::BoundingBox;

    fn input(sequence: u64) -> DetectorInput<'static> {
        DetectorInput::new(&[], 0, 0, sequence)
    }

    #[test]
    fn registry_filters_class_and_confidence() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(ScriptedDetector::new().with_frame(
            1,
            vec![
                Detection::person(BoundingBox::new(0.0, 0.0, 10.0, 20.0), 0.9),
                Detection::person(BoundingBox::new(50.0, 0.0, 10.0, 20.0), 0.3),
                Detection::new(BoundingBox::new(5.0, 5.0, 2.0, 2.0), 0.9, 39),
            ],
        ));
        let persons = registry.detect_with_capability(
            DetectionCapability::PersonDetection,
            &input(1),
            &[COCO_PERSON],
            0.5,
        )?;
        assert_eq!(persons.len(), 1);
        assert_eq!(persons[0].confidence, 0.9);
        Ok(())
    }

    #[test]
    fn missing_capability_is_an_error() {
        let registry = BackendRegistry::new();
        let result = registry.detect_with_capability(
            DetectionCapability::ObjectDetection,
            &input(0),
            &[39],
            0.5,
        );
        assert!(result.is_err());
    }

    #[test]
    fn pose_capability_is_resolved_from_registration() -> Result<()> {
        let mut registry = BackendRegistry::new();
        assert!(!registry.has_pose_estimator());
        assert_eq!(registry.estimate_pose(&input(0))?, None);

        registry.register_pose_estimator(FixedPoseEstimator::new(None));
        assert!(registry.has_pose_estimator());
        Ok(())
    }

    #[test]
    fn set_default_rejects_unknown_backend() {
        let mut registry = BackendRegistry::new();
        registry.register(ScriptedDetector::new());
        assert!(registry.set_default("scripted").is_ok());
        assert!(registry.set_default("tract").is_err());
        assert_eq!(registry.list(), vec!["scripted".to_string()]);
    }
}
