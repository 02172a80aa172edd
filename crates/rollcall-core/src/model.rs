//! Recognition model builder.
//!
//! Turns the current contents of a [`FaceStore`] into a trained LBPH model plus
//! the label ↔ identity mapping needed to report results. Labels are assigned
//! densely in store enumeration order (lexicographic by identity) and only live
//! as long as the model; clients only ever see identity strings.

use crate::recognizer::{LbphParams, LbphRecognizer, RecognizerError};
use crate::store::{FaceStore, StoreError};
use crate::types::{IdentityFaces, Prediction, UNKNOWN_IDENTITY};
use image::GrayImage;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Bijection between identities and the integer labels of one training run.
#[derive(Debug, Clone, Default)]
pub struct LabelMap {
    by_identity: HashMap<String, i32>,
    by_label: HashMap<i32, String>,
}

impl LabelMap {
    /// Label for `usn`, assigning the next free one on first sight.
    pub fn assign(&mut self, usn: &str) -> i32 {
        if let Some(&label) = self.by_identity.get(usn) {
            return label;
        }
        let label = self.by_identity.len() as i32;
        self.by_identity.insert(usn.to_string(), label);
        self.by_label.insert(label, usn.to_string());
        label
    }

    pub fn identity(&self, label: i32) -> Option<&str> {
        self.by_label.get(&label).map(String::as_str)
    }

    pub fn label(&self, usn: &str) -> Option<i32> {
        self.by_identity.get(usn).copied()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_identity.len()
    }
}

/// A freshly trained recognizer together with its label mapping.
pub struct TrainedModel {
    recognizer: LbphRecognizer,
    labels: LabelMap,
}

impl TrainedModel {
    /// Train on an already enumerated store snapshot.
    ///
    /// Returns `Ok(None)` when the snapshot holds no images at all.
    pub fn train(
        identities: Vec<IdentityFaces>,
        params: LbphParams,
    ) -> Result<Option<Self>, ModelError> {
        let mut labels = LabelMap::default();
        let mut images: Vec<GrayImage> = Vec::new();
        let mut image_labels: Vec<i32> = Vec::new();

        for identity in identities {
            let label = labels.assign(&identity.usn);
            image_labels.extend(std::iter::repeat(label).take(identity.faces.len()));
            images.extend(identity.faces);
        }

        if images.is_empty() {
            return Ok(None);
        }

        let recognizer = LbphRecognizer::train(params, &images, &image_labels)?;
        tracing::debug!(
            identities = labels.by_identity.len(),
            samples = recognizer.sample_count(),
            "trained LBPH model"
        );

        Ok(Some(Self { recognizer, labels }))
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// Number of distinct identities the model was trained on.
    pub fn identity_count(&self) -> usize {
        self.labels.by_identity.len()
    }

    pub fn sample_count(&self) -> usize {
        self.recognizer.sample_count()
    }

    /// Classify one face crop.
    ///
    /// A label missing from the map, or a distance over the threshold, reports
    /// [`UNKNOWN_IDENTITY`].
    pub fn predict(&self, face: &GrayImage) -> Prediction {
        let raw = self.recognizer.predict(face);
        let usn = raw
            .label
            .and_then(|label| self.labels.identity(label))
            .unwrap_or(UNKNOWN_IDENTITY)
            .to_string();
        Prediction {
            usn,
            distance: raw.distance,
        }
    }
}

/// Scan `store` and train a model over every stored face.
///
/// `Ok(None)` means nothing is enrolled yet.
pub fn build_model(store: &FaceStore, params: LbphParams) -> Result<Option<TrainedModel>, ModelError> {
    let identities = store.enumerate_all()?;
    TrainedModel::train(identities, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn stripes(width: u32, height: u32, period: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| {
            Luma([if (x / period) % 2 == 0 { 40 } else { 210 }])
        })
    }

    fn blobs(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let dx = x as i32 % 16 - 8;
            let dy = y as i32 % 16 - 8;
            Luma([(dx * dx + dy * dy).min(255) as u8])
        })
    }

    #[test]
    fn test_label_map_dense_first_seen() {
        let mut map = LabelMap::default();
        assert_eq!(map.assign("b"), 0);
        assert_eq!(map.assign("a"), 1);
        assert_eq!(map.assign("b"), 0);
        assert_eq!(map.identity(1), Some("a"));
        assert_eq!(map.label("b"), Some(0));
        assert_eq!(map.identity(7), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_train_empty_snapshot() {
        let identities = vec![IdentityFaces { usn: "ghost".into(), faces: vec![] }];
        assert!(TrainedModel::train(identities, LbphParams::default()).unwrap().is_none());
    }

    #[test]
    fn test_predict_reports_identity() {
        let identities = vec![
            IdentityFaces { usn: "alice".into(), faces: vec![stripes(64, 64, 4)] },
            IdentityFaces { usn: "bob".into(), faces: vec![blobs(64, 64)] },
        ];
        let model = TrainedModel::train(identities, LbphParams::default())
            .unwrap()
            .unwrap();
        assert_eq!(model.sample_count(), 2);
        assert_eq!(model.labels().label("alice"), Some(0));

        let p = model.predict(&blobs(64, 64));
        assert_eq!(p.usn, "bob");
        assert_eq!(p.confidence(), 0);
    }

    #[test]
    fn test_predict_unknown_over_threshold() {
        let identities = vec![IdentityFaces { usn: "alice".into(), faces: vec![stripes(64, 64, 4)] }];
        let params = LbphParams { threshold: 1e-6, ..Default::default() };
        let model = TrainedModel::train(identities, params).unwrap().unwrap();
        assert_eq!(model.predict(&blobs(64, 64)).usn, UNKNOWN_IDENTITY);
    }

    #[test]
    fn test_build_model_from_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaceStore::open(tmp.path()).unwrap();
        assert!(build_model(&store, LbphParams::default()).unwrap().is_none());

        store.append_face("alice", &stripes(64, 64, 4)).unwrap();
        store.append_face("bob", &blobs(64, 64)).unwrap();

        let model = build_model(&store, LbphParams::default()).unwrap().unwrap();
        assert_eq!(model.identity_count(), 2);
        // The JPEG round trip perturbs pixels, so only the identity is stable.
        assert_eq!(model.predict(&stripes(64, 64, 4)).usn, "alice");
        assert_eq!(model.predict(&blobs(64, 64)).usn, "bob");
    }

    #[test]
    fn test_rebuild_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaceStore::open(tmp.path()).unwrap();
        store.append_face("zed", &stripes(64, 64, 4)).unwrap();
        store.append_face("amy", &blobs(64, 64)).unwrap();

        let a = build_model(&store, LbphParams::default()).unwrap().unwrap();
        let b = build_model(&store, LbphParams::default()).unwrap().unwrap();
        assert_eq!(a.labels().label("amy"), Some(0));
        assert_eq!(a.labels().label("amy"), b.labels().label("amy"));
        let probe = blobs(64, 64);
        assert_eq!(a.predict(&probe), b.predict(&probe));
    }
}
