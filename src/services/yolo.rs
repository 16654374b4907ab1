//! YOLO detector running on ONNX Runtime.
//!
//! Supports both common export layouts: YOLOv5 (`[1, N, 5 + C]`, with an
//! objectness column) and YOLOv8 (`[1, 4 + C, N]`, class scores only).

use image::{imageops::FilterType, Rgb, RgbImage};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;
use std::sync::Mutex;

use super::detector::{self, Detection, DetectionArtifacts, Detector, DetectorError};

/// Upper bound on boxes kept per image after NMS.
const MAX_DETECTIONS: usize = 300;

/// Grey used for letterbox padding.
const PAD_VALUE: u8 = 114;

const BOX_THICKNESS: u32 = 3;

const PALETTE: [[u8; 3]; 10] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [52, 69, 147],
    [203, 56, 255],
];

#[derive(Debug, Clone)]
pub struct DetectorOptions {
    /// Side of the square model input, in pixels.
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub intra_threads: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            intra_threads: 4,
        }
    }
}

/// ONNX Runtime session wrapper. Loaded once and shared across jobs.
pub struct OnnxDetector {
    session: Mutex<Session>,
    options: DetectorOptions,
}

impl OnnxDetector {
    pub fn load(model_path: &Path, options: DetectorOptions) -> Result<Self, DetectorError> {
        tracing::info!(model = %model_path.display(), "Loading ONNX detection model");

        if !model_path.is_file() {
            return Err(DetectorError::Model(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| DetectorError::Model(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DetectorError::Model(format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(options.intra_threads)
            .map_err(|e| DetectorError::Model(format!("Failed to set threads: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| DetectorError::Model(format!("Failed to load model: {e}")))?;

        tracing::info!(
            input_size = options.input_size,
            confidence = options.confidence_threshold,
            iou = options.iou_threshold,
            "ONNX detector initialized"
        );

        Ok(Self {
            session: Mutex::new(session),
            options,
        })
    }

    /// Run the model, returning the first output's shape and data.
    fn run_model(&self, input: Vec<f32>) -> Result<(Vec<usize>, Vec<f32>), DetectorError> {
        let size = self.options.input_size as usize;
        let tensor = Tensor::from_array((vec![1usize, 3, size, size], input.into_boxed_slice()))
            .map_err(|e| DetectorError::Inference(format!("Input tensor creation failed: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| DetectorError::Inference("detector session poisoned".to_string()))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());
        let inputs = vec![(input_name, tensor.into_dyn())];

        let outputs = session
            .run(inputs)
            .map_err(|e| DetectorError::Inference(e.to_string()))?;

        let output_iter: Vec<_> = outputs.iter().collect();
        let output = output_iter
            .first()
            .map(|(_, v)| v)
            .ok_or_else(|| DetectorError::InvalidOutput("model produced no outputs".to_string()))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InvalidOutput(format!("Failed to extract tensor: {e}")))?;

        let dims = shape.iter().map(|&d| d as usize).collect();
        Ok((dims, data.to_vec()))
    }
}

impl Detector for OnnxDetector {
    fn detect(&self, image_path: &Path, output_dir: &Path) -> Result<DetectionArtifacts, DetectorError> {
        let mut source = image::open(image_path)?.to_rgb8();

        let (input, letterbox) = preprocess(&source, self.options.input_size);
        let (dims, data) = self.run_model(input)?;
        let candidates = decode_output(&dims, &data, self.options.confidence_threshold)?;
        let kept = non_max_suppression(candidates, self.options.iou_threshold);
        let detections = to_detections(&kept, &letterbox);

        std::fs::create_dir_all(output_dir)?;
        let labels_path = detector::labels_path(image_path, output_dir);
        detector::write_labels(&labels_path, &detections)?;

        render_detections(&mut source, &detections);
        let rendered_path = detector::rendered_path(image_path, output_dir);
        source.save(&rendered_path)?;

        tracing::debug!(
            image = %image_path.display(),
            detections = detections.len(),
            "Detection complete"
        );

        Ok(DetectionArtifacts {
            labels_path,
            rendered_path,
            detections: detections.len(),
        })
    }
}

/// Geometry of an aspect-preserving resize onto a padded square canvas.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width.max(1) as f32).min(target as f32 / height.max(1) as f32);
        let resized_width = ((width as f32 * scale).round() as u32).clamp(1, target);
        let resized_height = ((height as f32 * scale).round() as u32).clamp(1, target);
        Self {
            scale,
            pad_x: (target - resized_width) / 2,
            pad_y: (target - resized_height) / 2,
            resized_width,
            resized_height,
            source_width: width,
            source_height: height,
        }
    }

    /// Map a point in model-input pixels back to source pixels.
    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Letterbox `image` into a `target`-sized NCHW float tensor scaled to `[0, 1]`.
pub fn preprocess(image: &RgbImage, target: u32) -> (Vec<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), target);
    let resized = image::imageops::resize(
        image,
        letterbox.resized_width,
        letterbox.resized_height,
        FilterType::Triangle,
    );

    let mut canvas = RgbImage::from_pixel(target, target, Rgb([PAD_VALUE; 3]));
    image::imageops::overlay(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );

    let plane = (target * target) as usize;
    let mut input = vec![0.0f32; 3 * plane];
    for (x, y, pixel) in canvas.enumerate_pixels() {
        let offset = (y * target + x) as usize;
        for channel in 0..3 {
            input[channel * plane + offset] = pixel[channel] as f32 / 255.0;
        }
    }

    (input, letterbox)
}

/// A scored box in model-input pixel corners, before suppression.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub class_index: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Candidate {
    fn from_center(class_index: usize, confidence: f32, cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            class_index,
            confidence,
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Decode raw model output into candidates above `confidence_threshold`.
pub fn decode_output(
    dims: &[usize],
    data: &[f32],
    confidence_threshold: f32,
) -> Result<Vec<Candidate>, DetectorError> {
    let (batch, rows, cols) = match dims {
        [batch, rows, cols] => (*batch, *rows, *cols),
        _ => {
            return Err(DetectorError::InvalidOutput(format!(
                "expected 3 output dimensions, got {dims:?}"
            )))
        }
    };
    if batch != 1 {
        return Err(DetectorError::InvalidOutput(format!(
            "expected batch=1, got {batch}"
        )));
    }
    if data.len() != rows * cols {
        return Err(DetectorError::InvalidOutput(format!(
            "output has {} values, shape {dims:?} needs {}",
            data.len(),
            rows * cols
        )));
    }

    let mut candidates = Vec::new();

    if rows > cols {
        // YOLOv5: one row per anchor, objectness in column 4.
        if cols < 6 {
            return Err(DetectorError::InvalidOutput(format!(
                "YOLOv5 output needs at least 6 columns, got {cols}"
            )));
        }
        for row in data.chunks_exact(cols) {
            let objectness = row[4];
            if objectness < confidence_threshold {
                continue;
            }
            let Some((class_index, class_score)) = best_class(&row[5..]) else {
                continue;
            };
            let confidence = objectness * class_score;
            if confidence < confidence_threshold {
                continue;
            }
            candidates.push(Candidate::from_center(
                class_index,
                confidence,
                row[0],
                row[1],
                row[2],
                row[3],
            ));
        }
    } else {
        // YOLOv8: one column per anchor, no objectness.
        let (features, anchors) = (rows, cols);
        if features < 5 {
            return Err(DetectorError::InvalidOutput(format!(
                "YOLOv8 output needs at least 5 features, got {features}"
            )));
        }
        let mut scores = vec![0.0f32; features - 4];
        for anchor in 0..anchors {
            let at = |feature: usize| data[feature * anchors + anchor];
            for (class, score) in scores.iter_mut().enumerate() {
                *score = at(4 + class);
            }
            let Some((class_index, confidence)) = best_class(&scores) else {
                continue;
            };
            if confidence < confidence_threshold {
                continue;
            }
            candidates.push(Candidate::from_center(
                class_index,
                confidence,
                at(0),
                at(1),
                at(2),
                at(3),
            ));
        }
    }

    Ok(candidates)
}

fn best_class(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((index, score)),
        })
}

pub fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let overlap_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let overlap_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = overlap_w * overlap_h;
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy per-class NMS, highest confidence first.
pub fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= MAX_DETECTIONS {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_index == candidate.class_index && iou(k, &candidate) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// Map kept candidates to normalized source-image boxes, dropping empty ones.
pub fn to_detections(kept: &[Candidate], letterbox: &Letterbox) -> Vec<Detection> {
    let width = letterbox.source_width as f32;
    let height = letterbox.source_height as f32;

    kept.iter()
        .filter_map(|c| {
            let (x1, y1) = letterbox.to_source(c.x1, c.y1);
            let (x2, y2) = letterbox.to_source(c.x2, c.y2);
            let (x1, x2) = (x1.clamp(0.0, width), x2.clamp(0.0, width));
            let (y1, y2) = (y1.clamp(0.0, height), y2.clamp(0.0, height));
            let (box_w, box_h) = (x2 - x1, y2 - y1);
            if box_w <= 0.0 || box_h <= 0.0 {
                return None;
            }
            Some(Detection {
                class_index: c.class_index,
                confidence: c.confidence,
                cx: (x1 + box_w / 2.0) / width,
                cy: (y1 + box_h / 2.0) / height,
                width: box_w / width,
                height: box_h / height,
            })
        })
        .collect()
}

/// Draw one outlined box per detection, coloured by class.
pub fn render_detections(image: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return;
    }

    let to_px = |v: f32, extent: u32| ((v * extent as f32).round().max(0.0) as u32).min(extent - 1);

    for d in detections {
        let color = Rgb(PALETTE[d.class_index % PALETTE.len()]);
        let x1 = to_px(d.cx - d.width / 2.0, width);
        let x2 = to_px(d.cx + d.width / 2.0, width);
        let y1 = to_px(d.cy - d.height / 2.0, height);
        let y2 = to_px(d.cy + d.height / 2.0, height);

        for t in 0..BOX_THICKNESS {
            for x in x1..=x2 {
                put(image, x, y1 + t, color);
                put(image, x, y2.saturating_sub(t), color);
            }
            for y in y1..=y2 {
                put(image, x1 + t, y, color);
                put(image, x2.saturating_sub(t), y, color);
            }
        }
    }
}

fn put(image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_letterbox_wide_image() {
        let lb = Letterbox::fit(1280, 720, 640);
        assert!(approx(lb.scale, 0.5));
        assert_eq!((lb.resized_width, lb.resized_height), (640, 360));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 140));
        let (x, y) = lb.to_source(320.0, 320.0);
        assert!(approx(x, 640.0) && approx(y, 360.0));
    }

    #[test]
    fn test_preprocess_pads_with_grey() {
        let image = RgbImage::from_pixel(20, 10, Rgb([255, 0, 0]));
        let (input, lb) = preprocess(&image, 32);
        assert_eq!(input.len(), 3 * 32 * 32);
        assert_eq!(lb.pad_y, 8);
        // Top-left corner is padding.
        assert!(approx(input[0], PAD_VALUE as f32 / 255.0));
        // Centre pixel is the red image: R plane 1.0, G plane 0.0.
        let centre = 16 * 32 + 16;
        assert!(approx(input[centre], 1.0));
        assert!(approx(input[32 * 32 + centre], 0.0));
    }

    #[test]
    fn test_decode_yolov5_layout() {
        let (rows, cols) = (8, 7);
        let mut data = vec![0.0f32; rows * cols];
        data[..7].copy_from_slice(&[320.0, 320.0, 64.0, 96.0, 0.9, 0.1, 0.8]);
        data[7..14].copy_from_slice(&[100.0, 100.0, 10.0, 10.0, 0.1, 0.9, 0.0]);

        let candidates = decode_output(&[1, rows, cols], &data, 0.25).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_index, 1);
        assert!(approx(candidates[0].confidence, 0.72));
        assert!(approx(candidates[0].x1, 288.0));
        assert!(approx(candidates[0].y2, 368.0));
    }

    #[test]
    fn test_decode_yolov8_layout() {
        let (features, anchors) = (6, 10);
        let mut data = vec![0.0f32; features * anchors];
        let values = [50.0, 60.0, 20.0, 30.0, 0.9, 0.2];
        for (feature, value) in values.iter().enumerate() {
            data[feature * anchors + 3] = *value;
        }

        let candidates = decode_output(&[1, features, anchors], &data, 0.25).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_index, 0);
        assert!(approx(candidates[0].x1, 40.0));
        assert!(approx(candidates[0].y1, 45.0));
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        assert!(decode_output(&[1, 85], &[0.0; 85], 0.25).is_err());
        assert!(decode_output(&[2, 10, 6], &[0.0; 120], 0.25).is_err());
        assert!(decode_output(&[1, 10, 6], &[0.0; 59], 0.25).is_err());
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap_only() {
        let boxed = |class_index, confidence, x1: f32| Candidate {
            class_index,
            confidence,
            x1,
            y1: 0.0,
            x2: x1 + 100.0,
            y2: 100.0,
        };
        let kept = non_max_suppression(
            vec![
                boxed(0, 0.6, 5.0),
                boxed(0, 0.9, 0.0),
                boxed(1, 0.7, 0.0),
                boxed(0, 0.5, 300.0),
            ],
            0.45,
        );
        assert_eq!(kept.len(), 3);
        assert!(approx(kept[0].confidence, 0.9));
        assert_eq!(kept[1].class_index, 1);
        assert!(approx(kept[2].x1, 300.0));
    }

    #[test]
    fn test_detections_are_normalized_to_source() {
        let lb = Letterbox::fit(1280, 720, 640);
        let candidate = Candidate::from_center(15, 0.8, 320.0, 320.0, 64.0, 96.0);
        let detections = to_detections(&[candidate], &lb);
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert!(approx(d.cx, 0.5));
        assert!(approx(d.cy, 0.5));
        assert!(approx(d.width, 0.1));
        assert!(approx(d.height, 192.0 / 720.0));
    }

    #[test]
    fn test_render_draws_box_edges() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        let detection = Detection {
            class_index: 0,
            confidence: 0.9,
            cx: 0.5,
            cy: 0.5,
            width: 0.4,
            height: 0.4,
        };
        render_detections(&mut image, &[detection]);
        assert_eq!(image.get_pixel(30, 50), &Rgb(PALETTE[0]));
        assert_eq!(image.get_pixel(50, 50), &Rgb([0, 0, 0]));
    }
}
