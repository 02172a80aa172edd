//! On-disk face store.
//!
//! Layout: `<root>/<usn>/<usn>_<n>.jpg`, one grayscale JPEG crop per file, with
//! `n` starting at 1. The directory tree is the only durable state; everything
//! else is rebuilt from it on demand.

use crate::decoder::{self, ColorMode};
use crate::types::{IdentityFaces, IdentitySummary};
use image::codecs::jpeg::JpegEncoder;
use image::GrayImage;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const FACE_EXTENSION: &str = "jpg";
const JPEG_QUALITY: u8 = 95;
const MAX_IDENTITY_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identity {0:?}: use 1-64 characters from [A-Za-z0-9_-]")]
    InvalidIdentity(String),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode face crop: {0}")]
    Encode(#[from] image::ImageError),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Check that `usn` is safe to use as a directory name.
pub fn validate_identity(usn: &str) -> Result<(), StoreError> {
    let ok = !usn.is_empty()
        && usn.len() <= MAX_IDENTITY_LEN
        && usn
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentity(usn.to_string()))
    }
}

/// Identity → face-crop folders under a root directory.
///
/// Appends for one identity are serialised through a per-identity mutex, and
/// file names are claimed with create-new semantics, so concurrent writers
/// never overwrite each other's crops.
pub struct FaceStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FaceStore {
    /// Open the store at `root`, creating the directory if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_dir(&self, usn: &str) -> PathBuf {
        self.root.join(usn)
    }

    fn identity_lock(&self, usn: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(usn.to_string()).or_default().clone()
    }

    /// Create the identity's directory if absent.
    pub fn ensure_identity(&self, usn: &str) -> Result<PathBuf, StoreError> {
        validate_identity(usn)?;
        let dir = self.identity_dir(usn);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(dir)
    }

    /// Store one face crop under `usn`, returning the file written.
    pub fn append_face(&self, usn: &str, face: &GrayImage) -> Result<PathBuf, StoreError> {
        let mut paths = self.append_faces(usn, std::slice::from_ref(face))?;
        Ok(paths.remove(0))
    }

    /// Store several crops under `usn` in order, holding the identity lock once.
    pub fn append_faces(&self, usn: &str, faces: &[GrayImage]) -> Result<Vec<PathBuf>, StoreError> {
        validate_identity(usn)?;

        // Encode before touching the disk so a bad crop leaves nothing behind.
        let encoded = faces
            .iter()
            .map(encode_jpeg)
            .collect::<Result<Vec<_>, _>>()?;

        let lock = self.identity_lock(usn);
        let _guard: MutexGuard<'_, ()> = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.ensure_identity(usn)?;
        let mut seq = fs::read_dir(&dir).map_err(io_err(&dir))?.count() + 1;

        let mut written = Vec::with_capacity(encoded.len());
        for bytes in &encoded {
            let path = loop {
                let candidate = dir.join(format!("{usn}_{seq}.{FACE_EXTENSION}"));
                seq += 1;
                match OpenOptions::new().write(true).create_new(true).open(&candidate) {
                    Ok(mut file) => {
                        file.write_all(bytes).map_err(io_err(&candidate))?;
                        break candidate;
                    }
                    Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                    Err(e) => return Err(io_err(&candidate)(e)),
                }
            };
            tracing::info!(usn, path = %path.display(), "saved face");
            written.push(path);
        }

        Ok(written)
    }

    /// Every identity with its decodable face crops.
    ///
    /// Identities are returned in lexicographic order and crops in file-name
    /// order, so label assignment downstream is reproducible. Unreadable files
    /// are skipped with a warning.
    pub fn enumerate_all(&self) -> Result<Vec<IdentityFaces>, StoreError> {
        let mut all = Vec::new();
        for (usn, dir) in self.identity_dirs()? {
            let mut faces = Vec::new();
            for path in sorted_files(&dir)? {
                let decoded = fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| {
                        decoder::decode_bytes(&bytes, ColorMode::Grayscale)
                            .map_err(|e| e.to_string())
                    });
                match decoded {
                    Ok(img) => faces.push(img.into_gray()),
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "could not read face image");
                    }
                }
            }
            all.push(IdentityFaces { usn, faces });
        }
        Ok(all)
    }

    /// Enrolled identities with their stored file counts.
    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, StoreError> {
        self.identity_dirs()?
            .into_iter()
            .map(|(usn, dir)| {
                let faces = sorted_files(&dir)?.len();
                Ok(IdentitySummary { usn, faces })
            })
            .collect()
    }

    /// Delete an identity and all its crops. Returns `false` if it did not exist.
    pub fn remove_identity(&self, usn: &str) -> Result<bool, StoreError> {
        validate_identity(usn)?;
        let lock = self.identity_lock(usn);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.identity_dir(usn);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(usn, "removed identity");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    /// Identity directories under the root, sorted by name.
    fn identity_dirs(&self) -> Result<Vec<(String, PathBuf)>, StoreError> {
        // The root may have been removed while we were running.
        fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;

        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(usn) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %path.display(), "skipping non UTF-8 identity directory");
                continue;
            };
            if validate_identity(&usn).is_err() {
                tracing::warn!(path = %path.display(), "skipping directory with invalid identity name");
                continue;
            }
            dirs.push((usn, path));
        }
        dirs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(dirs)
    }
}

/// Regular files in `dir`, sorted by name.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn encode_jpeg(face: &GrayImage) -> Result<Vec<u8>, StoreError> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY).encode_image(face)?;
    Ok(bytes)
}
