use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Sub-directory of the output directory holding per-image label files.
pub const LABELS_DIR: &str = "labels";

/// One detection in normalized image-fraction units.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_index: usize,
    pub confidence: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

/// Files produced by one detector run.
#[derive(Debug, Clone)]
pub struct DetectionArtifacts {
    /// `<out>/labels/<stem>.txt`. Absent when nothing was detected.
    pub labels_path: PathBuf,
    /// `<out>/<file name>`, the input with boxes drawn on it.
    pub rendered_path: PathBuf,
    pub detections: usize,
}

/// A loaded detection model. Calls block until inference completes.
pub trait Detector: Send + Sync {
    fn detect(&self, image: &Path, output_dir: &Path) -> Result<DetectionArtifacts, DetectorError>;
}

pub fn labels_path(image: &Path, output_dir: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    output_dir.join(LABELS_DIR).join(format!("{stem}.txt"))
}

pub fn rendered_path(image: &Path, output_dir: &Path) -> PathBuf {
    match image.file_name() {
        Some(name) => output_dir.join(name),
        None => output_dir.join("image"),
    }
}

/// `<class> <cx> <cy> <w> <h> <conf>` with six decimals, one line per detection.
pub fn format_labels(detections: &[Detection]) -> String {
    let mut out = String::new();
    for d in detections {
        let _ = writeln!(
            out,
            "{} {:.6} {:.6} {:.6} {:.6} {:.6}",
            d.class_index, d.cx, d.cy, d.width, d.height, d.confidence
        );
    }
    out
}

/// Write the label file; nothing is written for an empty detection set.
pub fn write_labels(path: &Path, detections: &[Detection]) -> Result<(), DetectorError> {
    if detections.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format_labels(detections))?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Unexpected model output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
