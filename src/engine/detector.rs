//! YuNet Face Detector
//!
//! Anchor-free detector with three pyramid levels (strides 8/16/32). Each
//! level has co-located `cls`, `obj`, `bbox` (4 per cell) and `kps`
//! (10 per cell, 5 landmarks) tensors.

use image::DynamicImage;
use tracing::{debug, info, warn};

use super::nms::nms;
use super::pool::ModelHandle;
use super::preprocess::{prepare, ResizeInfo};
use super::registry::{ModelConfig, ModelFamily, OutputNaming};
use super::tensor::{NamedTensors, Tensor};
use super::types::FaceRegion;
use crate::error::{Result, VisionError};

pub const DEFAULT_CONFIDENCE: f32 = 0.6;
pub const DEFAULT_NMS: f32 = 0.3;

/// The four tensors of one pyramid level
struct Level<'a> {
    stride: u32,
    cls: &'a Tensor,
    obj: &'a Tensor,
    bbox: &'a Tensor,
    kps: &'a Tensor,
}

/// Resolve per-stride tensors by `{prefix}_{stride}` name, falling back to
/// export order (all cls, all obj, all bbox, all kps).
fn levels<'a>(config: &ModelConfig, outputs: &'a NamedTensors) -> Result<Vec<Level<'a>>> {
    let OutputNaming::Pyramid { cls, obj, bbox, kps, strides } = config.outputs else {
        return Err(VisionError::malformed(config.id, "registry entry has no pyramid outputs"));
    };

    let by_name = |prefix: &str, stride: u32| outputs.get(&format!("{}_{}", prefix, stride));
    let n = strides.len();
    let by_index = |group: usize, idx: usize| {
        if outputs.len() == 4 * n {
            outputs.by_index(group * n + idx)
        } else {
            None
        }
    };

    strides
        .iter()
        .enumerate()
        .map(|(idx, &stride)| {
            let find = |group: usize, prefix: &str| {
                by_name(prefix, stride).or_else(|| by_index(group, idx)).ok_or_else(|| {
                    VisionError::malformed(
                        config.id,
                        format!("missing {}_{} in {:?}", prefix, stride, outputs.names().collect::<Vec<_>>()),
                    )
                })
            };
            Ok(Level {
                stride,
                cls: find(0, cls)?,
                obj: find(1, obj)?,
                bbox: find(2, bbox)?,
                kps: find(3, kps)?,
            })
        })
        .collect()
}

fn decode_level(
    config: &ModelConfig,
    level: &Level<'_>,
    resize: &ResizeInfo,
    confidence_threshold: f32,
    faces: &mut Vec<FaceRegion>,
) -> Result<()> {
    let (input_w, input_h) = config.input_size;
    let stride = level.stride as f32;
    let cols = (input_w / level.stride) as usize;
    let rows = (input_h / level.stride) as usize;
    let cells = rows * cols;

    if level.cls.len() != cells
        || level.obj.len() != cells
        || level.bbox.len() != cells * 4
        || level.kps.len() != cells * 10
    {
        return Err(VisionError::malformed(
            config.id,
            format!(
                "stride {}: expected {} cells, got cls {:?} obj {:?} bbox {:?} kps {:?}",
                level.stride,
                cells,
                level.cls.shape(),
                level.obj.shape(),
                level.bbox.shape(),
                level.kps.shape()
            ),
        ));
    }

    let (cls, obj, bbox, kps) = (level.cls.data(), level.obj.data(), level.bbox.data(), level.kps.data());
    let (orig_w, orig_h) = (resize.original_width as f32, resize.original_height as f32);
    let before = faces.len();

    for row in 0..rows {
        for col in 0..cols {
            let i = row * cols + col;
            let score = (cls[i].clamp(0.0, 1.0) * obj[i].clamp(0.0, 1.0)).sqrt();
            if score < confidence_threshold {
                continue;
            }

            let b = &bbox[i * 4..i * 4 + 4];
            let cx = (col as f32 + b[0]) * stride;
            let cy = (row as f32 + b[1]) * stride;
            let w = b[2].exp() * stride;
            let h = b[3].exp() * stride;

            let mut landmarks = [(0.0f32, 0.0f32); 5];
            for (n, landmark) in landmarks.iter_mut().enumerate() {
                let lx = (kps[i * 10 + 2 * n] + col as f32) * stride;
                let ly = (kps[i * 10 + 2 * n + 1] + row as f32) * stride;
                let (ox, oy) = resize.to_original(lx, ly);
                *landmark = ((ox / orig_w).clamp(0.0, 1.0), (oy / orig_h).clamp(0.0, 1.0));
            }

            faces.push(FaceRegion {
                bbox: resize.to_original_box(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
                confidence: score,
                landmarks,
            });
        }
    }

    debug!("Stride {} found {} faces", level.stride, faces.len() - before);
    Ok(())
}

/// Decode YuNet outputs into faces. Missing or malformed levels log a
/// diagnostic and yield no faces.
pub fn decode_faces(
    config: &ModelConfig,
    outputs: &NamedTensors,
    resize: &ResizeInfo,
    confidence_threshold: f32,
    nms_threshold: f32,
) -> Vec<FaceRegion> {
    let decoded = levels(config, outputs).and_then(|levels| {
        let mut faces = Vec::new();
        for level in &levels {
            decode_level(config, level, resize, confidence_threshold, &mut faces)?;
        }
        Ok(faces)
    });

    match decoded {
        Ok(faces) => {
            let before = faces.len();
            let kept = nms(faces, nms_threshold, false);
            debug!("Total {} faces before NMS, {} after", before, kept.len());
            kept
        }
        Err(e) => {
            warn!("{}", e);
            Vec::new()
        }
    }
}

/// Face detection stage bound to a loaded model
pub struct FaceDetector {
    handle: ModelHandle,
    confidence_threshold: f32,
    nms_threshold: f32,
    max_faces: Option<usize>,
}

impl FaceDetector {
    /// Create a new face detector
    pub fn new(handle: ModelHandle, confidence_threshold: f32, nms_threshold: f32) -> Result<Self> {
        if handle.config().family != ModelFamily::FaceDetector {
            return Err(VisionError::unavailable(handle.id(), "not a face detection model"));
        }
        Ok(Self {
            handle,
            confidence_threshold,
            nms_threshold,
            max_faces: None,
        })
    }

    /// Keep at most `max_faces` faces, highest confidence first
    pub fn with_max_faces(mut self, max_faces: usize) -> Self {
        self.max_faces = Some(max_faces);
        self
    }

    /// Get the confidence threshold
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Detect faces in an image
    pub async fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceRegion>> {
        let config = self.handle.config();
        let prepared = prepare(image, config);
        let outputs = self.handle.run(prepared.inputs).await?;

        let mut faces = decode_faces(
            config,
            &outputs,
            &prepared.resize,
            self.confidence_threshold,
            self.nms_threshold,
        );
        if let Some(max) = self.max_faces {
            faces.truncate(max);
        }

        info!("Detected {} faces after NMS", faces.len());
        Ok(faces)
    }
}
