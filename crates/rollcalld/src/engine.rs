use rollcall_core::decoder::{decode_data_url, ColorMode, DecodeError};
use rollcall_core::model::{build_model, ModelError};
use rollcall_core::store::{validate_identity, FaceStore, StoreError};
use rollcall_core::{crop_face, FaceDetector, IdentitySummary, LbphParams, Prediction};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),
    #[error("invalid image: {0}")]
    InvalidImage(#[from] DecodeError),
    #[error("no face detected in the image")]
    NoFaceDetected,
    #[error("no enrolled identities")]
    NoEnrolledIdentities,
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment operation.
#[derive(Debug)]
pub struct EnrollResult {
    pub usn: String,
    /// Crops written, in detector order.
    pub saved: Vec<PathBuf>,
}

/// Snapshot of the face store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStatus {
    pub faces_dir: PathBuf,
    pub identities: usize,
    pub faces: usize,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    Enroll {
        usn: String,
        image: String,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Recognize {
        image: String,
        reply: oneshot::Sender<Result<Prediction, EngineError>>,
    },
    List {
        reply: oneshot::Sender<Result<Vec<IdentitySummary>, EngineError>>,
    },
    Remove {
        usn: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<StoreStatus, EngineError>>,
    },
}

/// Everything the engine thread owns: the detector, the store and the
/// recognizer settings used for each per-request retrain.
pub struct Engine {
    detector: Box<dyn FaceDetector>,
    store: FaceStore,
    lbph: LbphParams,
}

impl Engine {
    pub fn new(detector: Box<dyn FaceDetector>, store: FaceStore, lbph: LbphParams) -> Self {
        Self {
            detector,
            store,
            lbph,
        }
    }

    /// Decode, detect and persist every face found in `image` under `usn`.
    ///
    /// Nothing touches the disk until at least one face has been found.
    pub fn enroll(&self, usn: &str, image: &str) -> Result<EnrollResult, EngineError> {
        validate_identity(usn).map_err(|_| EngineError::InvalidIdentity(usn.to_string()))?;

        let gray = decode_data_url(image, ColorMode::Grayscale)?.into_gray();
        let faces = self.detector.detect(&gray);
        tracing::debug!(usn, detected = faces.len(), "enroll: detection done");

        let crops: Vec<_> = faces.iter().filter_map(|b| crop_face(&gray, b)).collect();
        if crops.is_empty() {
            return Err(EngineError::NoFaceDetected);
        }

        let saved = self.store.append_faces(usn, &crops)?;
        tracing::debug!(usn, saved = saved.len(), "enroll: crops stored");

        Ok(EnrollResult {
            usn: usn.to_string(),
            saved,
        })
    }

    /// Retrain on the whole store and classify the first face in `image`.
    pub fn recognize(&self, image: &str) -> Result<Prediction, EngineError> {
        let decoded = decode_data_url(image, ColorMode::Color)?;

        let model = build_model(&self.store, self.lbph)?.ok_or(EngineError::NoEnrolledIdentities)?;
        tracing::debug!(
            identities = model.identity_count(),
            samples = model.sample_count(),
            "recognize: model rebuilt"
        );

        let gray = decoded.into_gray();
        let faces = self.detector.detect(&gray);
        let crop = faces
            .first()
            .and_then(|b| crop_face(&gray, b))
            .ok_or(EngineError::NoFaceDetected)?;
        if faces.len() > 1 {
            tracing::debug!(detected = faces.len(), "recognize: using first face only");
        }

        let prediction = model.predict(&crop);
        tracing::info!(usn = %prediction.usn, distance = prediction.distance, "face recognized");
        Ok(prediction)
    }

    pub fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        Ok(self.store.list_identities()?)
    }

    pub fn remove(&self, usn: &str) -> Result<bool, EngineError> {
        validate_identity(usn).map_err(|_| EngineError::InvalidIdentity(usn.to_string()))?;
        let removed = self.store.remove_identity(usn)?;
        if removed {
            tracing::info!(usn, "identity removed");
        }
        Ok(removed)
    }

    pub fn status(&self) -> Result<StoreStatus, EngineError> {
        let identities = self.store.list_identities()?;
        Ok(StoreStatus {
            faces_dir: self.store.root().to_path_buf(),
            identities: identities.len(),
            faces: identities.iter().map(|i| i.faces).sum(),
        })
    }

    fn handle(&self, req: EngineRequest) {
        // A dropped receiver means the HTTP client went away; nothing to do.
        match req {
            EngineRequest::Enroll { usn, image, reply } => {
                let _ = reply.send(self.enroll(&usn, &image));
            }
            EngineRequest::Recognize { image, reply } => {
                let _ = reply.send(self.recognize(&image));
            }
            EngineRequest::List { reply } => {
                let _ = reply.send(self.list());
            }
            EngineRequest::Remove { usn, reply } => {
                let _ = reply.send(self.remove(&usn));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Request enrollment of every face in a data-URL image.
    pub async fn enroll(&self, usn: String, image: String) -> Result<EnrollResult, EngineError> {
        self.call(|reply| EngineRequest::Enroll { usn, image, reply })
            .await
    }

    /// Request recognition of the first face in a data-URL image.
    pub async fn recognize(&self, image: String) -> Result<Prediction, EngineError> {
        self.call(|reply| EngineRequest::Recognize { image, reply })
            .await
    }

    pub async fn list(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.call(|reply| EngineRequest::List { reply }).await
    }

    pub async fn remove(&self, usn: String) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Remove { usn, reply }).await
    }

    pub async fn status(&self) -> Result<StoreStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Requests are processed one at a time in arrival order; the thread exits
/// once every handle has been dropped.
pub fn spawn_engine(engine: Engine) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(faces_dir = %engine.store.root().display(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}
