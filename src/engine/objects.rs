//! Generic object detector
//!
//! Decodes DETR-style split outputs (`boxes` + `scores` + optional `labels`)
//! and YOLO-style combined `[batch, N, 5 + C]` outputs into normalized
//! detections on the original image.

use image::DynamicImage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::nms::nms;
use super::pool::ModelHandle;
use super::preprocess::{prepare, ResizeInfo};
use super::registry::{BoxConvention, ModelConfig, ModelFamily, OutputNaming};
use super::tensor::{NamedTensors, Tensor};
use super::types::Detection;
use crate::error::{Result, VisionError};
use crate::utils::math::{argmax, sigmoid};

/// Candidates below this are dropped before NMS
pub const EARLY_SCORE_FLOOR: f32 = 0.1;

/// Caller-supplied decoding thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Allowed class ids; empty accepts every class
    pub relevant_class_ids: Vec<u32>,
    pub max_detections: usize,
    /// Prototype activation above which a mask pixel is set
    pub mask_threshold: f32,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            relevant_class_ids: Vec::new(),
            max_detections: 100,
            mask_threshold: 0.5,
        }
    }
}

impl DecodeOptions {
    pub fn is_relevant(&self, class_id: u32) -> bool {
        self.relevant_class_ids.is_empty() || self.relevant_class_ids.contains(&class_id)
    }

    /// Final confidence/allow-list filter and cap, applied after NMS
    pub(crate) fn finish(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.confidence_threshold && self.is_relevant(d.class_id))
            .take(self.max_detections)
            .map(|mut d| {
                d.id = Uuid::new_v4().to_string();
                d
            })
            .collect()
    }
}

/// Output layouts this decoder understands
#[derive(Debug)]
enum ObjectOutputs<'a> {
    Split {
        boxes: &'a Tensor,
        scores: &'a Tensor,
        labels: Option<&'a Tensor>,
    },
    Combined(&'a Tensor),
}

impl<'a> ObjectOutputs<'a> {
    fn classify(config: &ModelConfig, outputs: &'a NamedTensors) -> Result<Self> {
        match config.outputs {
            OutputNaming::Split { boxes, scores, labels } => {
                match (outputs.get(boxes), outputs.get(scores)) {
                    (Some(b), Some(s)) => Ok(ObjectOutputs::Split {
                        boxes: b,
                        scores: s,
                        labels: labels.and_then(|name| outputs.get(name)),
                    }),
                    _ => Self::split_by_shape(outputs).ok_or_else(|| {
                        VisionError::malformed(
                            config.id,
                            format!(
                                "expected '{}' and '{}', got {:?}",
                                boxes,
                                scores,
                                outputs.names().collect::<Vec<_>>()
                            ),
                        )
                    }),
                }
            }
            OutputNaming::Combined { output } => {
                let row = 5 + config.num_classes();
                outputs
                    .get(output)
                    .or_else(|| {
                        outputs
                            .iter()
                            .map(|(_, t)| t)
                            .find(|t| t.shape().len() == 3 && t.shape()[2] == row)
                    })
                    .map(ObjectOutputs::Combined)
                    .ok_or_else(|| {
                        VisionError::malformed(config.id, format!("no [1, N, {}] output", row))
                    })
            }
            _ => Err(VisionError::malformed(
                config.id,
                "registry entry has no object detector outputs",
            )),
        }
    }

    /// Unnamed outputs: boxes are the `[.., N, 4]` tensor, scores the next
    /// tensor divisible into N rows, labels an optional further `[.., N]` tensor.
    fn split_by_shape(outputs: &'a NamedTensors) -> Option<Self> {
        let boxes = outputs
            .iter()
            .map(|(_, t)| t)
            .find(|t| t.shape().len() >= 2 && t.shape().last() == Some(&4) && !t.is_empty())?;
        let n = boxes.len() / 4;
        let mut rest = outputs
            .iter()
            .map(|(_, t)| t)
            .filter(|t| !std::ptr::eq(*t, boxes) && !t.is_empty() && t.len() % n == 0);
        let scores = rest.next()?;
        let labels = rest.next().filter(|t| t.len() == n);
        Some(ObjectOutputs::Split { boxes, scores, labels })
    }
}

/// Resolved coordinate convention for one box
fn decode_box(
    raw: [f32; 4],
    convention: BoxConvention,
    pixel_space: bool,
    input: (u32, u32),
) -> (f32, f32, f32, f32) {
    let (pixel, corner) = match convention {
        // Pixel-space boxes that grow to the right and down are corner form
        BoxConvention::Inferred => (pixel_space, pixel_space && raw[2] > raw[0] && raw[3] > raw[1]),
        BoxConvention::PixelCorner => (true, true),
        BoxConvention::PixelCenter => (true, false),
        BoxConvention::NormalizedCorner => (false, true),
        BoxConvention::NormalizedCenter => (false, false),
    };

    let (cx, cy, w, h) = if corner {
        (
            (raw[0] + raw[2]) / 2.0,
            (raw[1] + raw[3]) / 2.0,
            raw[2] - raw[0],
            raw[3] - raw[1],
        )
    } else {
        (raw[0], raw[1], raw[2], raw[3])
    };

    let (sx, sy) = if pixel {
        (1.0, 1.0)
    } else {
        (input.0 as f32, input.1 as f32)
    };

    (
        (cx - w / 2.0) * sx,
        (cy - h / 2.0) * sy,
        (cx + w / 2.0) * sx,
        (cy + h / 2.0) * sy,
    )
}

fn candidate(
    config: &ModelConfig,
    class_id: u32,
    confidence: f32,
    bbox_px: (f32, f32, f32, f32),
    resize: &ResizeInfo,
) -> Detection {
    let (x1, y1, x2, y2) = bbox_px;
    Detection {
        id: String::new(),
        class_id,
        class_name: config.class_name(class_id).unwrap_or("unknown").to_string(),
        confidence,
        bbox: resize.to_original_box(x1, y1, x2, y2),
        mask: None,
    }
}

fn decode_split(
    config: &ModelConfig,
    boxes: &Tensor,
    scores: &Tensor,
    labels: Option<&Tensor>,
    resize: &ResizeInfo,
    options: &DecodeOptions,
) -> Result<Vec<Detection>> {
    if boxes.is_empty() || boxes.len() % 4 != 0 {
        return Err(VisionError::malformed(
            config.id,
            format!("boxes shape {:?} is not [N, 4]", boxes.shape()),
        ));
    }
    let n = boxes.len() / 4;
    if scores.len() % n != 0 || scores.is_empty() {
        return Err(VisionError::malformed(
            config.id,
            format!("scores shape {:?} does not match {} boxes", scores.shape(), n),
        ));
    }
    let num_scores = scores.len() / n;
    let num_classes = config.num_classes();
    // An extra leading column is a background class
    let class_offset = usize::from(num_scores > 1 && num_scores > num_classes);
    let labels = labels.filter(|l| l.len() == n);

    let pixel_space = boxes.data().iter().copied().fold(f32::MIN, f32::max) > 1.0;
    debug!(
        "{}: {} anchors, {} score columns, pixel space: {}",
        config.id, n, num_scores, pixel_space
    );

    let box_data = boxes.data();
    let score_data = scores.data();
    let mut detections = Vec::new();

    for a in 0..n {
        let (class_id, score) = if num_scores == 1 {
            let class_id = labels.map(|l| l.data()[a].max(0.0).round() as u32).unwrap_or(0);
            (class_id, sigmoid(score_data[a]))
        } else {
            let row = &score_data[a * num_scores + class_offset..(a + 1) * num_scores];
            // sigmoid is monotonic, so the best logit is the best score
            match argmax(row) {
                Some((c, logit)) => (c as u32, sigmoid(logit)),
                None => continue,
            }
        };

        if score < EARLY_SCORE_FLOOR || class_id as usize >= num_classes || !options.is_relevant(class_id) {
            continue;
        }

        let raw = [
            box_data[a * 4],
            box_data[a * 4 + 1],
            box_data[a * 4 + 2],
            box_data[a * 4 + 3],
        ];
        let px = decode_box(raw, config.box_convention, pixel_space, config.input_size);
        detections.push(candidate(config, class_id, score, px, resize));
    }

    Ok(detections)
}

fn decode_combined(
    config: &ModelConfig,
    output: &Tensor,
    resize: &ResizeInfo,
    options: &DecodeOptions,
) -> Result<Vec<Detection>> {
    let num_classes = config.num_classes();
    let row_len = 5 + num_classes;
    if output.is_empty() || output.len() % row_len != 0 {
        return Err(VisionError::malformed(
            config.id,
            format!("output shape {:?} is not [1, N, {}]", output.shape(), row_len),
        ));
    }

    let data = output.data();
    let rows = data.len() / row_len;
    let pixel_space = match config.box_convention {
        BoxConvention::Inferred => data
            .chunks_exact(row_len)
            .flat_map(|row| row[..4].iter().copied())
            .fold(f32::MIN, f32::max)
            > 1.0,
        BoxConvention::PixelCorner | BoxConvention::PixelCenter => true,
        BoxConvention::NormalizedCorner | BoxConvention::NormalizedCenter => false,
    };
    let convention = if pixel_space {
        BoxConvention::PixelCenter
    } else {
        BoxConvention::NormalizedCenter
    };

    let mut detections = Vec::new();
    for row in data.chunks_exact(row_len) {
        let objectness = sigmoid(row[4]);
        if objectness < EARLY_SCORE_FLOOR {
            continue;
        }

        let Some((class, logit)) = argmax(&row[5..]) else {
            continue;
        };

        let confidence = objectness * sigmoid(logit);
        let class_id = class as u32;
        if confidence < EARLY_SCORE_FLOOR || !options.is_relevant(class_id) {
            continue;
        }

        let px = decode_box([row[0], row[1], row[2], row[3]], convention, pixel_space, config.input_size);
        detections.push(candidate(config, class_id, confidence, px, resize));
    }

    debug!("{}: {} of {} rows above floor", config.id, detections.len(), rows);
    Ok(detections)
}

/// Decode object detector outputs. Unrecognized layouts log a diagnostic and
/// yield no detections.
pub fn decode_objects(
    config: &ModelConfig,
    outputs: &NamedTensors,
    resize: &ResizeInfo,
    options: &DecodeOptions,
) -> Vec<Detection> {
    let candidates = ObjectOutputs::classify(config, outputs).and_then(|layout| match layout {
        ObjectOutputs::Split { boxes, scores, labels } => {
            decode_split(config, boxes, scores, labels, resize, options)
        }
        ObjectOutputs::Combined(output) => decode_combined(config, output, resize, options),
    });

    match candidates {
        Ok(candidates) => {
            let before = candidates.len();
            let kept = nms(candidates, options.iou_threshold, true);
            debug!("{}: {} candidates, {} after NMS", config.id, before, kept.len());
            options.finish(kept)
        }
        Err(e) => {
            warn!("{}", e);
            Vec::new()
        }
    }
}

/// Object detection stage bound to a loaded model
pub struct ObjectDetector {
    handle: ModelHandle,
}

impl ObjectDetector {
    pub fn new(handle: ModelHandle) -> Result<Self> {
        if handle.config().family != ModelFamily::ObjectDetector {
            return Err(VisionError::unavailable(handle.id(), "not an object detection model"));
        }
        Ok(Self { handle })
    }

    /// Detect objects in an image
    pub async fn detect(&self, image: &DynamicImage, options: &DecodeOptions) -> Result<Vec<Detection>> {
        let config = self.handle.config();
        let prepared = prepare(image, config);
        let outputs = self.handle.run(prepared.inputs).await?;
        let detections = decode_objects(config, &outputs, &prepared.resize, options);
        info!("{} detected {} objects", config.id, detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{get_config, RF_DETR, YOLOV5_COCO};

    const LOGIT_HIGH: f32 = 4.0; // sigmoid ~0.982
    const LOGIT_LOW: f32 = -6.0;

    fn square() -> ResizeInfo {
        ResizeInfo::letterbox((640, 640), (640, 640))
    }

    fn split(boxes: Vec<f32>, scores: Tensor, labels: Option<Vec<f32>>) -> NamedTensors {
        let n = boxes.len() / 4;
        let mut outputs = NamedTensors::new();
        outputs.push("boxes", Tensor::new(vec![1, n, 4], boxes).unwrap());
        outputs.push("scores", scores);
        if let Some(labels) = labels {
            outputs.push("labels", Tensor::new(vec![1, n], labels).unwrap());
        }
        outputs
    }

    #[test]
    fn test_single_score_normalized_center() {
        let config = get_config(RF_DETR).unwrap();
        let outputs = split(
            vec![0.5, 0.5, 0.2, 0.4, 0.1, 0.1, 0.05, 0.05],
            Tensor::new(vec![1, 2], vec![LOGIT_HIGH, LOGIT_LOW]).unwrap(),
            Some(vec![2.0, 0.0]),
        );
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert_eq!(d.class_id, 2);
        assert_eq!(d.class_name, "car");
        assert!((d.bbox.x - 0.4).abs() < 1e-4);
        assert!((d.bbox.y - 0.3).abs() < 1e-4);
        assert!((d.bbox.width - 0.2).abs() < 1e-4);
        assert!((d.bbox.height - 0.4).abs() < 1e-4);
        assert!(!d.id.is_empty());
    }

    #[test]
    fn test_pixel_corner_boxes() {
        let config = get_config(RF_DETR).unwrap();
        // x2 > x1 and y2 > y1 at pixel scale: corner form
        let outputs = split(
            vec![64.0, 128.0, 320.0, 448.0],
            Tensor::new(vec![1, 1], vec![LOGIT_HIGH]).unwrap(),
            Some(vec![0.0]),
        );
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
        let b = dets[0].bbox;
        assert!((b.x - 0.1).abs() < 1e-4);
        assert!((b.y - 0.2).abs() < 1e-4);
        assert!((b.x2() - 0.5).abs() < 1e-4);
        assert!((b.y2() - 0.7).abs() < 1e-4);
    }

    #[test]
    fn test_pixel_center_boxes() {
        let config = get_config(RF_DETR).unwrap();
        // width smaller than x: center form
        let outputs = split(
            vec![320.0, 320.0, 64.0, 128.0],
            Tensor::new(vec![1, 1], vec![LOGIT_HIGH]).unwrap(),
            None,
        );
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        let b = dets[0].bbox;
        assert_eq!(dets[0].class_id, 0);
        assert!((b.x - 0.45).abs() < 1e-4);
        assert!((b.width - 0.1).abs() < 1e-4);
        assert!((b.height - 0.2).abs() < 1e-4);
    }

    #[test]
    fn test_multiclass_with_background_offset() {
        let config = get_config(RF_DETR).unwrap();
        let columns = 81;
        let mut scores = vec![LOGIT_LOW; columns];
        scores[0] = 8.0; // background, ignored
        scores[3] = LOGIT_HIGH; // real class 2
        let outputs = split(
            vec![0.5, 0.5, 0.2, 0.2],
            Tensor::new(vec![1, 1, columns], scores).unwrap(),
            None,
        );
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 2);
        // Background logit 8.0 would give ~0.9997 if it were counted
        assert!((dets[0].confidence - sigmoid(LOGIT_HIGH)).abs() < 1e-6);
    }

    #[test]
    fn test_multiclass_without_background() {
        let config = get_config(RF_DETR).unwrap();
        let mut scores = vec![LOGIT_LOW; 80];
        scores[7] = LOGIT_HIGH;
        let outputs = split(
            vec![0.5, 0.5, 0.2, 0.2],
            Tensor::new(vec![1, 1, 80], scores).unwrap(),
            None,
        );
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets[0].class_name, "truck");
    }

    #[test]
    fn test_allow_list_and_threshold() {
        let config = get_config(RF_DETR).unwrap();
        let outputs = split(
            vec![0.2, 0.2, 0.1, 0.1, 0.7, 0.7, 0.1, 0.1, 0.5, 0.5, 0.1, 0.1],
            Tensor::new(vec![1, 3], vec![LOGIT_HIGH, LOGIT_HIGH, -0.5]).unwrap(),
            Some(vec![0.0, 2.0, 2.0]),
        );
        let options = DecodeOptions {
            relevant_class_ids: vec![2],
            ..DecodeOptions::default()
        };
        let dets = decode_objects(config, &outputs, &square(), &options);
        // person filtered by allow-list, third car below 0.5 threshold
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 2);
        assert!(dets[0].confidence >= 0.5);
    }

    #[test]
    fn test_letterbox_inversion() {
        let config = get_config(RF_DETR).unwrap();
        // 1280x720 letterboxed into 640x640: pad_y = 140, scale 0.5
        let resize = ResizeInfo::letterbox((1280, 720), (640, 640));
        let outputs = split(
            vec![0.0, 140.0, 640.0, 500.0],
            Tensor::new(vec![1, 1], vec![LOGIT_HIGH]).unwrap(),
            None,
        );
        let dets = decode_objects(config, &outputs, &resize, &DecodeOptions::default());
        let b = dets[0].bbox;
        assert!(b.x.abs() < 1e-4);
        assert!(b.y.abs() < 1e-4);
        assert!((b.width - 1.0).abs() < 1e-4);
        assert!((b.height - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_combined_layout() {
        let config = get_config(YOLOV5_COCO).unwrap();
        let row = 85;
        let mut data = vec![LOGIT_LOW; row * 2];
        // row 0: centered 64x64 box, confident "dog"
        data[..4].copy_from_slice(&[320.0, 320.0, 64.0, 64.0]);
        data[4] = LOGIT_HIGH;
        data[5 + 16] = LOGIT_HIGH;
        // row 1: objectness too low
        data[row..row + 4].copy_from_slice(&[100.0, 100.0, 10.0, 10.0]);
        let mut outputs = NamedTensors::new();
        outputs.push("output0", Tensor::new(vec![1, 2, row], data).unwrap());

        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "dog");
        let expected = sigmoid(LOGIT_HIGH) * sigmoid(LOGIT_HIGH);
        assert!((dets[0].confidence - expected).abs() < 1e-5);
        assert!((dets[0].bbox.x - 0.45).abs() < 1e-4);
    }

    #[test]
    fn test_duplicates_suppressed() {
        let config = get_config(RF_DETR).unwrap();
        let outputs = split(
            vec![0.5, 0.5, 0.2, 0.2, 0.5, 0.5, 0.2, 0.2],
            Tensor::new(vec![1, 2], vec![LOGIT_HIGH, 3.0]).unwrap(),
            Some(vec![2.0, 2.0]),
        );
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - sigmoid(LOGIT_HIGH)).abs() < 1e-6);
    }

    #[test]
    fn test_malformed_outputs_yield_nothing() {
        let config = get_config(RF_DETR).unwrap();
        let mut outputs = NamedTensors::new();
        outputs.push("something", Tensor::zeros(vec![1, 7]));
        assert!(decode_objects(config, &outputs, &square(), &DecodeOptions::default()).is_empty());

        let outputs = split(
            vec![0.5, 0.5, 0.2, 0.2, 0.5, 0.5, 0.2, 0.2],
            Tensor::new(vec![1, 3], vec![LOGIT_HIGH; 3]).unwrap(),
            None,
        );
        assert!(decode_objects(config, &outputs, &square(), &DecodeOptions::default()).is_empty());
    }

    #[test]
    fn test_boxes_stay_in_unit_square() {
        let config = get_config(RF_DETR).unwrap();
        let outputs = split(
            vec![0.95, 0.02, 0.4, 0.3, 0.0, 1.0, 0.5, 0.5],
            Tensor::new(vec![1, 2], vec![LOGIT_HIGH, LOGIT_HIGH]).unwrap(),
            Some(vec![0.0, 1.0]),
        );
        let resize = ResizeInfo::letterbox((800, 600), (640, 640));
        for d in decode_objects(config, &outputs, &resize, &DecodeOptions::default()) {
            assert!(d.bbox.x >= 0.0 && d.bbox.y >= 0.0);
            assert!(d.bbox.x2() <= 1.0 + 1e-6);
            assert!(d.bbox.y2() <= 1.0 + 1e-6);
        }
    }

    #[test]
    fn test_split_by_shape_fallback() {
        let config = get_config(RF_DETR).unwrap();
        let mut outputs = NamedTensors::new();
        outputs.push("dets", Tensor::new(vec![1, 1, 4], vec![0.5, 0.5, 0.2, 0.2]).unwrap());
        outputs.push("logits", Tensor::new(vec![1, 1], vec![LOGIT_HIGH]).unwrap());
        let dets = decode_objects(config, &outputs, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
    }
}
