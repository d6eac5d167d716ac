//! Model registry
//!
//! Static table of every model the pipeline knows how to drive: tensor
//! geometry, class lists, pixel encoding and output naming. The table must
//! stay in lock-step with the deployed model files; a wrong class count
//! misparses tensor slices silently.

use serde::Serialize;

/// Which decoder a model's output feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    ObjectDetector,
    Segmenter,
    FaceDetector,
    FaceEmbedder,
    SceneClassifier,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::ObjectDetector => "object_detector",
            ModelFamily::Segmenter => "segmenter",
            ModelFamily::FaceDetector => "face_detector",
            ModelFamily::FaceEmbedder => "face_embedder",
            ModelFamily::SceneClassifier => "scene_classifier",
        }
    }
}

/// Per-model pixel encoding. These are model constants, never a shared default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelRecipe {
    /// RGB, `(p/255 - mean_c) / std_c` with ImageNet statistics
    ImageNet,
    /// RGB, `p/255`
    UnitScale,
    /// BGR, raw 0-255 values
    RawBgr,
    /// RGB, `(p - 127.5) / 128`
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeStrategy {
    Stretch,
    Letterbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

/// How a detector encodes its box coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxConvention {
    /// Infer pixel/normalized and corner/center form from the values
    Inferred,
    PixelCorner,
    PixelCenter,
    NormalizedCorner,
    NormalizedCenter,
}

/// Output tensor naming per model family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputNaming {
    /// Separate box / score / optional label tensors
    Split {
        boxes: &'static str,
        scores: &'static str,
        labels: Option<&'static str>,
    },
    /// One `[batch, N, 5 + C]` tensor
    Combined { output: &'static str },
    /// Detection tensor plus mask prototypes
    Segment {
        detections: &'static str,
        prototypes: &'static str,
    },
    /// Per-stride tensors named `{prefix}_{stride}`
    Pyramid {
        cls: &'static str,
        obj: &'static str,
        bbox: &'static str,
        kps: &'static str,
        strides: &'static [u32],
    },
    /// A single vector output (embedding or class scores); first output is used
    Vector,
}

/// Immutable registry entry
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub id: &'static str,
    pub family: ModelFamily,
    pub input_name: &'static str,
    /// (width, height)
    pub input_size: (u32, u32),
    pub layout: TensorLayout,
    pub recipe: PixelRecipe,
    pub resize: ResizeStrategy,
    pub classes: &'static [&'static str],
    pub num_mask_coeffs: usize,
    /// (width, height) of the mask prototypes
    pub proto_size: (usize, usize),
    pub box_convention: BoxConvention,
    pub embedding_dim: Option<usize>,
    pub outputs: OutputNaming,
    /// Default file name inside the models directory
    pub file_name: &'static str,
}

impl ModelConfig {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_name(&self, class_id: u32) -> Option<&'static str> {
        self.classes.get(class_id as usize).copied()
    }

    pub fn class_id(&self, name: &str) -> Option<u32> {
        self.classes
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .map(|idx| idx as u32)
    }

    /// Input tensor shape for a single image
    pub fn input_shape(&self) -> Vec<usize> {
        let (w, h) = (self.input_size.0 as usize, self.input_size.1 as usize);
        match self.layout {
            TensorLayout::Nchw => vec![1, 3, h, w],
            TensorLayout::Nhwc => vec![1, h, w, 3],
        }
    }
}

/// COCO dataset class names
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Scene categories, in the sorted order the classifier was trained with
pub const SCENE_CLASSES: [&str; 5] = [
    "crowd_scene",
    "garage_pitlane",
    "podium_celebration",
    "portrait_paddock",
    "racing_action",
];

pub const FACE_CLASSES: [&str; 1] = ["face"];

pub const RF_DETR: &str = "rf-detr";
pub const YOLOV5_COCO: &str = "yolov5-coco";
pub const YOLOV8_SEG: &str = "yolov8n-seg";
pub const YUNET: &str = "yunet";
pub const ARCFACE: &str = "arcface-r100";
pub const SCENE_CLASSIFIER: &str = "scene-classifier";

static MODELS: [ModelConfig; 6] = [
    ModelConfig {
        id: RF_DETR,
        family: ModelFamily::ObjectDetector,
        input_name: "images",
        input_size: (640, 640),
        layout: TensorLayout::Nchw,
        recipe: PixelRecipe::ImageNet,
        resize: ResizeStrategy::Letterbox,
        classes: &COCO_CLASSES,
        num_mask_coeffs: 0,
        proto_size: (0, 0),
        box_convention: BoxConvention::Inferred,
        embedding_dim: None,
        outputs: OutputNaming::Split {
            boxes: "boxes",
            scores: "scores",
            labels: Some("labels"),
        },
        file_name: "rf-detr.onnx",
    },
    ModelConfig {
        id: YOLOV5_COCO,
        family: ModelFamily::ObjectDetector,
        input_name: "images",
        input_size: (640, 640),
        layout: TensorLayout::Nchw,
        recipe: PixelRecipe::UnitScale,
        resize: ResizeStrategy::Letterbox,
        classes: &COCO_CLASSES,
        num_mask_coeffs: 0,
        proto_size: (0, 0),
        box_convention: BoxConvention::PixelCenter,
        embedding_dim: None,
        outputs: OutputNaming::Combined { output: "output0" },
        file_name: "yolov5s.onnx",
    },
    ModelConfig {
        id: YOLOV8_SEG,
        family: ModelFamily::Segmenter,
        input_name: "images",
        input_size: (640, 640),
        layout: TensorLayout::Nchw,
        recipe: PixelRecipe::UnitScale,
        resize: ResizeStrategy::Letterbox,
        classes: &COCO_CLASSES,
        num_mask_coeffs: 32,
        proto_size: (160, 160),
        box_convention: BoxConvention::PixelCenter,
        embedding_dim: None,
        outputs: OutputNaming::Segment {
            detections: "output0",
            prototypes: "output1",
        },
        file_name: "yolov8n-seg.onnx",
    },
    ModelConfig {
        id: YUNET,
        family: ModelFamily::FaceDetector,
        input_name: "input",
        input_size: (640, 640),
        layout: TensorLayout::Nchw,
        recipe: PixelRecipe::RawBgr,
        resize: ResizeStrategy::Stretch,
        classes: &FACE_CLASSES,
        num_mask_coeffs: 0,
        proto_size: (0, 0),
        box_convention: BoxConvention::PixelCenter,
        embedding_dim: None,
        outputs: OutputNaming::Pyramid {
            cls: "cls",
            obj: "obj",
            bbox: "bbox",
            kps: "kps",
            strides: &[8, 16, 32],
        },
        file_name: "face_detection_yunet_2023mar.onnx",
    },
    ModelConfig {
        id: ARCFACE,
        family: ModelFamily::FaceEmbedder,
        input_name: "input.1",
        input_size: (112, 112),
        layout: TensorLayout::Nchw,
        recipe: PixelRecipe::Symmetric,
        resize: ResizeStrategy::Stretch,
        classes: &[],
        num_mask_coeffs: 0,
        proto_size: (0, 0),
        box_convention: BoxConvention::Inferred,
        embedding_dim: Some(512),
        outputs: OutputNaming::Vector,
        file_name: "arcface_r100.onnx",
    },
    ModelConfig {
        id: SCENE_CLASSIFIER,
        family: ModelFamily::SceneClassifier,
        input_name: "input",
        input_size: (224, 224),
        layout: TensorLayout::Nhwc,
        recipe: PixelRecipe::UnitScale,
        resize: ResizeStrategy::Stretch,
        classes: &SCENE_CLASSES,
        num_mask_coeffs: 0,
        proto_size: (0, 0),
        box_convention: BoxConvention::Inferred,
        embedding_dim: None,
        outputs: OutputNaming::Vector,
        file_name: "scene_classifier.onnx",
    },
];

/// Look up a model by id
pub fn get_config(model_id: &str) -> Option<&'static ModelConfig> {
    MODELS.iter().find(|m| m.id == model_id)
}

/// All registered models
pub fn all_configs() -> &'static [ModelConfig] {
    &MODELS
}

/// Map class names to ids for a model. Unknown names (and unknown models)
/// are dropped silently, so the result is a best-effort subset.
pub fn class_names_to_ids<S: AsRef<str>>(model_id: &str, names: &[S]) -> Vec<u32> {
    let Some(config) = get_config(model_id) else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|name| config.class_id(name.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let seg = get_config(YOLOV8_SEG).unwrap();
        assert_eq!(seg.family, ModelFamily::Segmenter);
        assert_eq!(seg.num_classes(), 80);
        assert_eq!(seg.num_mask_coeffs, 32);
        assert!(get_config("missing").is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let mut ids: Vec<_> = all_configs().iter().map(|m| m.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), all_configs().len());
    }

    #[test]
    fn test_class_lookup_both_ways() {
        let config = get_config(RF_DETR).unwrap();
        assert_eq!(config.class_id("car"), Some(2));
        assert_eq!(config.class_name(2), Some("car"));
        assert_eq!(config.class_name(80), None);
    }

    #[test]
    fn test_class_names_to_ids_drops_unknown() {
        let ids = class_names_to_ids(RF_DETR, &["person", "spaceship", "truck"]);
        assert_eq!(ids, vec![0, 7]);
        assert!(class_names_to_ids("missing", &["person"]).is_empty());
    }

    #[test]
    fn test_input_shape_follows_layout() {
        assert_eq!(get_config(YUNET).unwrap().input_shape(), vec![1, 3, 640, 640]);
        assert_eq!(
            get_config(SCENE_CLASSIFIER).unwrap().input_shape(),
            vec![1, 224, 224, 3]
        );
    }
}
