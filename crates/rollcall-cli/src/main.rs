use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::decoder::{decode_bytes, ColorMode};
use rollcall_core::{
    build_model, crop_face, default_cascade_path, CascadeDetector, DetectionParams, FaceDetector,
    FaceStore, LbphParams, Prediction,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face enrollment and recognition CLI")]
struct Cli {
    /// Root of the per-student face directories
    #[arg(long, env = "ROLLCALL_FACES_DIR", default_value = "faces", global = true)]
    faces_dir: PathBuf,
    /// Haar cascade XML (default: search the usual OpenCV install paths)
    #[arg(long, env = "ROLLCALL_CASCADE_PATH", global = true)]
    cascade: Option<PathBuf>,
    /// Pyramid scale step for detection
    #[arg(long, env = "ROLLCALL_SCALE_FACTOR", default_value_t = 1.3, global = true)]
    scale_factor: f64,
    /// Neighbouring hits a detection needs
    #[arg(long, env = "ROLLCALL_MIN_NEIGHBORS", default_value_t = 5, global = true)]
    min_neighbors: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll every face in an image file under a student USN
    Enroll {
        #[arg(short, long)]
        usn: String,
        image: PathBuf,
    },
    /// Recognize the first face in an image file
    Recognize { image: PathBuf },
    /// List enrolled students
    List,
    /// Remove a student and all stored faces
    Remove { usn: String },
    /// Print the faces the detector finds in an image file
    Detect { image: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let store = FaceStore::open(&cli.faces_dir)
        .with_context(|| format!("opening face store {}", cli.faces_dir.display()))?;

    match &cli.command {
        Commands::Enroll { usn, image } => {
            rollcall_core::store::validate_identity(usn)?;
            let detector = load_detector(&cli)?;
            let gray = read_image(image, ColorMode::Grayscale)?;
            let crops: Vec<_> = detector
                .detect(&gray)
                .iter()
                .filter_map(|b| crop_face(&gray, b))
                .collect();
            if crops.is_empty() {
                bail!("no face detected in {}", image.display());
            }
            for path in store.append_faces(usn, &crops)? {
                println!("saved {}", path.display());
            }
            println!("Student {usn} enrolled successfully!");
        }
        Commands::Recognize { image } => {
            let detector = load_detector(&cli)?;
            let prediction = recognize(&store, &detector, image)?;
            println!(
                "{}",
                serde_json::json!({
                    "usn": prediction.usn,
                    "confidence": prediction.confidence(),
                })
            );
        }
        Commands::List => {
            let students = store.list_identities()?;
            if students.is_empty() {
                println!("No students enrolled");
            }
            for s in students {
                println!("{}\t{} face(s)", s.usn, s.faces);
            }
        }
        Commands::Remove { usn } => {
            rollcall_core::store::validate_identity(usn)?;
            if store.remove_identity(usn)? {
                println!("Student {usn} removed");
            } else {
                bail!("student {usn} not found");
            }
        }
        Commands::Detect { image } => {
            let detector = load_detector(&cli)?;
            let gray = read_image(image, ColorMode::Grayscale)?;
            let faces = detector.detect(&gray);
            println!("{}", serde_json::to_string_pretty(&faces)?);
        }
    }

    Ok(())
}

fn load_detector(cli: &Cli) -> Result<CascadeDetector> {
    let path = cli
        .cascade
        .clone()
        .or_else(default_cascade_path)
        .context("no Haar cascade found; pass --cascade")?;
    let params = DetectionParams {
        scale_factor: cli.scale_factor,
        min_neighbors: cli.min_neighbors,
        ..Default::default()
    };
    CascadeDetector::load(&path, params)
        .with_context(|| format!("loading cascade {}", path.display()))
}

/// Classify the first face in `image`. The image is decoded before the store
/// is read, so a bad file never costs a retrain.
fn recognize(store: &FaceStore, detector: &impl FaceDetector, image: &Path) -> Result<Prediction> {
    let gray = read_image(image, ColorMode::Color)?;
    let Some(model) = build_model(store, LbphParams::default())? else {
        bail!("no enrolled students yet");
    };
    let faces = detector.detect(&gray);
    let Some(crop) = faces.first().and_then(|b| crop_face(&gray, b)) else {
        bail!("no face detected in {}", image.display());
    };
    Ok(model.predict(&crop))
}

fn read_image(path: &Path, mode: ColorMode) -> Result<image::GrayImage> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let decoded =
        decode_bytes(&bytes, mode).with_context(|| format!("decoding {}", path.display()))?;
    Ok(decoded.into_gray())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::BoundingBox;

    struct WholeImage;

    impl FaceDetector for WholeImage {
        fn detect(&self, image: &image::GrayImage) -> Vec<BoundingBox> {
            vec![BoundingBox::new(0, 0, image.width(), image.height())]
        }
    }

    #[test]
    fn test_recognize_rejects_bad_image_before_training() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaceStore::open(tmp.path().join("faces")).unwrap();
        store.append_face("amy", &image::GrayImage::new(8, 8)).unwrap();
        let path = tmp.path().join("query.png");
        std::fs::write(&path, b"not an image").unwrap();

        let err = recognize(&store, &WholeImage, &path).unwrap_err();
        assert!(format!("{err:#}").starts_with("decoding"), "{err:#}");
    }

    #[test]
    fn test_recognize_empty_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FaceStore::open(tmp.path().join("faces")).unwrap();
        let path = tmp.path().join("query.png");
        image::GrayImage::new(8, 8).save(&path).unwrap();

        let err = recognize(&store, &WholeImage, &path).unwrap_err();
        assert_eq!(err.to_string(), "no enrolled students yet");
    }
}
