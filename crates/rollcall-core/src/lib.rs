//! rollcall-core: face enrollment and recognition engine.
//!
//! Uses a Haar cascade for face detection and LBPH histograms for recognition,
//! with enrolled faces kept as JPEG crops in a per-identity directory tree.

pub mod cascade;
pub mod decoder;
pub mod detector;
pub mod model;
pub mod recognizer;
pub mod store;
pub mod types;

pub use cascade::{default_cascade_path, CascadeError, HaarCascade};
pub use decoder::{decode_data_url, ColorMode, DecodeError, DecodedImage};
pub use detector::{CascadeDetector, DetectionParams, FaceDetector};
pub use model::{build_model, ModelError, TrainedModel};
pub use recognizer::{LbphParams, LbphRecognizer};
pub use store::{FaceStore, StoreError};
pub use types::{crop_face, BoundingBox, IdentitySummary, Prediction, UNKNOWN_IDENTITY};
