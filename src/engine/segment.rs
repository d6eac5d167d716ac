//! Instance segmentation decoder (YOLOv8-seg layout)
//!
//! The detection tensor is `[1, 4 + C + M, A]`: box center/size, raw class
//! scores and M mask coefficients per anchor. Masks are rebuilt from the
//! `[1, M, PH, PW]` prototype tensor inside each surviving box.

use image::DynamicImage;
use ndarray::ArrayView3;
use tracing::{debug, info, warn};

use super::nms::{nms, Suppressible};
use super::objects::{DecodeOptions, EARLY_SCORE_FLOOR};
use super::pool::ModelHandle;
use super::preprocess::{prepare, ResizeInfo};
use super::registry::{ModelConfig, ModelFamily, OutputNaming};
use super::tensor::{NamedTensors, Tensor};
use super::types::{BoundingBox, Detection, SegmentMask};
use crate::error::{Result, VisionError};
use crate::utils::math::sigmoid;

/// Detection tensor with its anchor/channel orientation resolved
struct AnchorTable<'a> {
    data: &'a [f32],
    anchors: usize,
    channels: usize,
    channel_major: bool,
}

impl AnchorTable<'_> {
    fn at(&self, anchor: usize, channel: usize) -> f32 {
        if self.channel_major {
            self.data[channel * self.anchors + anchor]
        } else {
            self.data[anchor * self.channels + channel]
        }
    }
}

/// A decoded anchor that still carries its mask coefficients
struct Candidate {
    detection: Detection,
    coeffs: Vec<f32>,
}

impl Suppressible for Candidate {
    fn bbox(&self) -> &BoundingBox {
        &self.detection.bbox
    }
    fn confidence(&self) -> f32 {
        self.detection.confidence
    }
    fn class_id(&self) -> u32 {
        self.detection.class_id
    }
}

fn anchor_table<'a>(config: &ModelConfig, outputs: &'a NamedTensors) -> Result<AnchorTable<'a>> {
    let channels = 4 + config.num_classes() + config.num_mask_coeffs;
    let named = match config.outputs {
        OutputNaming::Segment { detections, .. } => outputs.get(detections),
        _ => None,
    };
    let tensor = named
        .filter(|t| is_anchor_table(t, channels))
        .or_else(|| outputs.iter().map(|(_, t)| t).find(|t| is_anchor_table(t, channels)))
        .ok_or_else(|| {
            VisionError::malformed(
                config.id,
                format!(
                    "no [1, {}, A] detection tensor in {:?}",
                    channels,
                    outputs.names().collect::<Vec<_>>()
                ),
            )
        })?;

    let shape = tensor.shape();
    // [1, C, A] is the export default; [1, A, C] appears after a transpose
    let channel_major = shape[1] == channels;
    let anchors = if channel_major { shape[2] } else { shape[1] };
    Ok(AnchorTable {
        data: tensor.data(),
        anchors,
        channels,
        channel_major,
    })
}

fn is_anchor_table(tensor: &Tensor, channels: usize) -> bool {
    let shape = tensor.shape();
    shape.len() == 3 && (shape[1] == channels || shape[2] == channels)
}

fn prototypes<'a>(config: &ModelConfig, outputs: &'a NamedTensors) -> Option<ArrayView3<'a, f32>> {
    let named = match config.outputs {
        OutputNaming::Segment { prototypes, .. } => outputs.get(prototypes),
        _ => None,
    };
    let tensor = named.or_else(|| {
        outputs
            .iter()
            .map(|(_, t)| t)
            .find(|t| t.shape().len() == 4 && t.shape()[1] == config.num_mask_coeffs)
    })?;

    let shape = tensor.shape();
    if shape.len() != 4 || shape[0] != 1 || shape[1] != config.num_mask_coeffs {
        warn!(
            "{}: prototype shape {:?} does not match {} coefficients, using box masks",
            config.id, shape, config.num_mask_coeffs
        );
        return None;
    }
    if (shape[3], shape[2]) != config.proto_size {
        debug!("{}: prototypes are {:?}, registry expects {:?}", config.id, &shape[2..], config.proto_size);
    }

    let view = tensor.view().ok()?;
    view.into_shape((shape[1], shape[2], shape[3])).ok()
}

fn decode_candidates(
    config: &ModelConfig,
    table: &AnchorTable<'_>,
    resize: &ResizeInfo,
    options: &DecodeOptions,
) -> Vec<Candidate> {
    let num_classes = config.num_classes();
    let coeff_start = 4 + num_classes;
    let mut candidates = Vec::new();

    for a in 0..table.anchors {
        // Class scores at this layer are already probabilities
        let mut best = (0usize, f32::MIN);
        for c in 0..num_classes {
            let score = table.at(a, 4 + c);
            if score > best.1 {
                best = (c, score);
            }
        }
        let (class_id, confidence) = (best.0 as u32, best.1);
        if confidence < EARLY_SCORE_FLOOR || !options.is_relevant(class_id) {
            continue;
        }

        let (cx, cy, w, h) = (table.at(a, 0), table.at(a, 1), table.at(a, 2), table.at(a, 3));
        let bbox = resize.to_original_box(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        let coeffs = (coeff_start..table.channels).map(|c| table.at(a, c)).collect();

        candidates.push(Candidate {
            detection: Detection {
                id: String::new(),
                class_id,
                class_name: config.class_name(class_id).unwrap_or("unknown").to_string(),
                confidence,
                bbox,
                mask: None,
            },
            coeffs,
        });
    }

    candidates
}

/// Rebuild a binary mask at original resolution. Only pixels inside `bbox`
/// are evaluated; without prototypes the box itself is the mask.
fn build_mask(
    coeffs: &[f32],
    protos: Option<&ArrayView3<'_, f32>>,
    bbox: &BoundingBox,
    resize: &ResizeInfo,
    threshold: f32,
) -> SegmentMask {
    let (width, height) = (resize.original_width, resize.original_height);
    let mut mask = SegmentMask::empty(width, height);

    let (x1, y1, x2, y2) = bbox.to_pixels(width, height);
    let (x1, y1) = (x1.round() as u32, y1.round() as u32);
    let (x2, y2) = ((x2.round() as u32).min(width), (y2.round() as u32).min(height));

    let Some(protos) = protos else {
        for y in y1..y2 {
            let row = (y * width) as usize;
            mask.data[row + x1 as usize..row + x2 as usize].fill(255);
        }
        return mask;
    };

    let (num_coeffs, ph, pw) = protos.dim();
    if ph == 0 || pw == 0 {
        return mask;
    }
    let sx = pw as f32 / resize.input_width as f32;
    let sy = ph as f32 / resize.input_height as f32;
    // Each prototype cell is evaluated at most once
    let mut cells: Vec<Option<bool>> = vec![None; ph * pw];

    for y in y1..y2 {
        for x in x1..x2 {
            let (mx, my) = resize.to_model(x as f32 + 0.5, y as f32 + 0.5);
            let px = ((mx * sx) as usize).min(pw - 1);
            let py = ((my * sy) as usize).min(ph - 1);
            let on = *cells[py * pw + px].get_or_insert_with(|| {
                let activation: f32 = (0..num_coeffs.min(coeffs.len()))
                    .map(|c| coeffs[c] * protos[[c, py, px]])
                    .sum();
                sigmoid(activation) > threshold
            });
            if on {
                mask.data[(y * width + x) as usize] = 255;
            }
        }
    }

    mask
}

/// Decode segmentation outputs. Missing or malformed detection tensors log a
/// diagnostic and yield no detections.
pub fn decode_segments(
    config: &ModelConfig,
    outputs: &NamedTensors,
    resize: &ResizeInfo,
    options: &DecodeOptions,
) -> Vec<Detection> {
    let table = match anchor_table(config, outputs) {
        Ok(table) => table,
        Err(e) => {
            warn!("{}", e);
            return Vec::new();
        }
    };
    let protos = prototypes(config, outputs);
    if protos.is_none() {
        debug!("{}: no prototypes, falling back to box masks", config.id);
    }

    let candidates = decode_candidates(config, &table, resize, options);
    let before = candidates.len();
    let kept = nms(candidates, options.iou_threshold, true);
    debug!("{}: {} candidates, {} after NMS", config.id, before, kept.len());

    let kept: Vec<Candidate> = kept
        .into_iter()
        .filter(|c| {
            c.detection.confidence >= options.confidence_threshold
                && options.is_relevant(c.detection.class_id)
        })
        .take(options.max_detections)
        .collect();

    let detections = kept
        .into_iter()
        .map(|c| {
            let mask = build_mask(
                &c.coeffs,
                protos.as_ref(),
                &c.detection.bbox,
                resize,
                options.mask_threshold,
            );
            Detection {
                mask: Some(mask),
                ..c.detection
            }
        })
        .collect();

    options.finish(detections)
}

/// Segmentation stage bound to a loaded model
pub struct Segmenter {
    handle: ModelHandle,
}

impl Segmenter {
    pub fn new(handle: ModelHandle) -> Result<Self> {
        if handle.config().family != ModelFamily::Segmenter {
            return Err(VisionError::unavailable(handle.id(), "not a segmentation model"));
        }
        Ok(Self { handle })
    }

    /// Detect objects with per-instance masks
    pub async fn segment(&self, image: &DynamicImage, options: &DecodeOptions) -> Result<Vec<Detection>> {
        let config = self.handle.config();
        let prepared = prepare(image, config);
        let outputs = self.handle.run(prepared.inputs).await?;
        let detections = decode_segments(config, &outputs, &prepared.resize, options);
        info!("{} segmented {} instances", config.id, detections.len());
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{get_config, YOLOV8_SEG};

    const CHANNELS: usize = 4 + 80 + 32;

    /// Channel-major detection tensor from per-anchor rows
    fn detections(rows: &[Vec<f32>]) -> Tensor {
        let anchors = rows.len();
        let mut data = vec![0.0; CHANNELS * anchors];
        for (a, row) in rows.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                data[c * anchors + a] = v;
            }
        }
        Tensor::new(vec![1, CHANNELS, anchors], data).unwrap()
    }

    fn row(cx: f32, cy: f32, w: f32, h: f32, class: usize, score: f32, coeff0: f32) -> Vec<f32> {
        let mut r = vec![0.0; CHANNELS];
        r[..4].copy_from_slice(&[cx, cy, w, h]);
        r[4 + class] = score;
        r[4 + 80] = coeff0;
        r
    }

    /// Prototypes where channel 0 is `value` everywhere
    fn protos(value: f32) -> Tensor {
        let (m, h, w) = (32, 160, 160);
        let mut data = vec![0.0; m * h * w];
        data[..h * w].fill(value);
        Tensor::new(vec![1, m, h, w], data).unwrap()
    }

    fn outputs(det: Tensor, proto: Option<Tensor>) -> NamedTensors {
        let mut out = NamedTensors::new();
        out.push("output0", det);
        if let Some(p) = proto {
            out.push("output1", p);
        }
        out
    }

    fn square() -> ResizeInfo {
        ResizeInfo::letterbox((640, 640), (640, 640))
    }

    #[test]
    fn test_mask_only_inside_box() {
        let config = get_config(YOLOV8_SEG).unwrap();
        let out = outputs(
            detections(&[row(320.0, 320.0, 128.0, 64.0, 0, 0.9, 5.0)]),
            Some(protos(1.0)),
        );
        let dets = decode_segments(config, &out, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);

        let mask = dets[0].mask.as_ref().unwrap();
        assert_eq!((mask.width, mask.height), (640, 640));
        assert_eq!(mask.get(320, 320), 255);
        assert_eq!(mask.get(10, 10), 0);
        assert_eq!(mask.get(320, 200), 0);
        assert_eq!(mask.area(), 128 * 64);
    }

    #[test]
    fn test_mask_threshold_applies() {
        let config = get_config(YOLOV8_SEG).unwrap();
        // sigmoid(-5) is far below 0.5
        let out = outputs(
            detections(&[row(320.0, 320.0, 128.0, 64.0, 0, 0.9, -5.0)]),
            Some(protos(1.0)),
        );
        let dets = decode_segments(config, &out, &square(), &DecodeOptions::default());
        assert_eq!(dets[0].mask.as_ref().unwrap().area(), 0);
    }

    #[test]
    fn test_rectangular_mask_without_prototypes() {
        let config = get_config(YOLOV8_SEG).unwrap();
        let out = outputs(detections(&[row(100.0, 100.0, 40.0, 20.0, 2, 0.8, 0.0)]), None);
        let dets = decode_segments(config, &out, &square(), &DecodeOptions::default());
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_name, "car");
        assert_eq!(dets[0].mask.as_ref().unwrap().area(), 40 * 20);
    }

    #[test]
    fn test_raw_scores_and_filters() {
        let config = get_config(YOLOV8_SEG).unwrap();
        let out = outputs(
            detections(&[
                row(100.0, 100.0, 40.0, 40.0, 0, 0.95, 0.0),
                row(400.0, 400.0, 40.0, 40.0, 2, 0.3, 0.0),
                row(500.0, 100.0, 40.0, 40.0, 2, 0.7, 0.0),
                row(500.0, 500.0, 40.0, 40.0, 5, 0.05, 0.0),
            ]),
            Some(protos(0.0)),
        );
        let options = DecodeOptions {
            relevant_class_ids: vec![2],
            ..DecodeOptions::default()
        };
        let dets = decode_segments(config, &out, &square(), &options);
        // Raw score 0.7 is kept as-is, no sigmoid applied
        assert_eq!(dets.len(), 1);
        assert!((dets[0].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_overlapping_instances_suppressed_and_capped() {
        let config = get_config(YOLOV8_SEG).unwrap();
        let out = outputs(
            detections(&[
                row(200.0, 200.0, 100.0, 100.0, 0, 0.9, 0.0),
                row(202.0, 202.0, 100.0, 100.0, 0, 0.8, 0.0),
                row(500.0, 500.0, 60.0, 60.0, 0, 0.85, 0.0),
                row(100.0, 500.0, 60.0, 60.0, 0, 0.6, 0.0),
            ]),
            None,
        );
        let options = DecodeOptions {
            max_detections: 2,
            ..DecodeOptions::default()
        };
        let dets = decode_segments(config, &out, &square(), &options);
        assert_eq!(dets.len(), 2);
        assert!((dets[0].confidence - 0.9).abs() < 1e-6);
        assert!((dets[1].confidence - 0.85).abs() < 1e-6);
        assert_ne!(dets[0].id, dets[1].id);
    }

    #[test]
    fn test_letterboxed_mask_resolution() {
        let config = get_config(YOLOV8_SEG).unwrap();
        let resize = ResizeInfo::letterbox((1280, 720), (640, 640));
        // Full content area: y from 140 to 500 in model space
        let out = outputs(
            detections(&[row(320.0, 320.0, 640.0, 360.0, 0, 0.9, 5.0)]),
            Some(protos(1.0)),
        );
        let dets = decode_segments(config, &out, &resize, &DecodeOptions::default());
        let mask = dets[0].mask.as_ref().unwrap();
        assert_eq!((mask.width, mask.height), (1280, 720));
        assert_eq!(mask.area(), 1280 * 720);
    }

    #[test]
    fn test_missing_detection_tensor() {
        let config = get_config(YOLOV8_SEG).unwrap();
        let mut out = NamedTensors::new();
        out.push("output1", protos(1.0));
        assert!(decode_segments(config, &out, &square(), &DecodeOptions::default()).is_empty());
    }
}
