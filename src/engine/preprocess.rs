//! Image preprocessing
//!
//! Turns an arbitrary-size image into the fixed tensor a model expects and
//! records the geometry needed to map model coordinates back to the source.

use image::{imageops::FilterType, DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::Array4;

use super::registry::{ModelConfig, PixelRecipe, ResizeStrategy, TensorLayout};
use super::tensor::{NamedTensors, Tensor};
use super::types::BoundingBox;
use crate::error::{Result, VisionError};

/// Fill value for letterbox padding, per channel
pub const LETTERBOX_FILL: u8 = 114;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Crops smaller than this on either side are rejected
pub const MIN_CROP_PX: u32 = 10;

impl PixelRecipe {
    /// Encode one RGB pixel into the model's channel order and value range
    pub fn encode(&self, rgb: [u8; 3]) -> [f32; 3] {
        let [r, g, b] = rgb.map(|v| v as f32);
        match self {
            PixelRecipe::ImageNet => [
                (r / 255.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0],
                (g / 255.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1],
                (b / 255.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2],
            ],
            PixelRecipe::UnitScale => [r / 255.0, g / 255.0, b / 255.0],
            PixelRecipe::RawBgr => [b, g, r],
            PixelRecipe::Symmetric => [
                (r - 127.5) / 128.0,
                (g - 127.5) / 128.0,
                (b - 127.5) / 128.0,
            ],
        }
    }
}

/// Mapping between original image pixels and model input pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResizeInfo {
    pub scale_x: f32,
    pub scale_y: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub original_width: u32,
    pub original_height: u32,
    pub input_width: u32,
    pub input_height: u32,
}

impl ResizeInfo {
    /// Aspect-preserving resize, centered with padding
    pub fn letterbox(original: (u32, u32), input: (u32, u32)) -> Self {
        let (orig_w, orig_h) = (original.0.max(1), original.1.max(1));
        let (input_w, input_h) = input;

        let scale = f32::min(
            input_w as f32 / orig_w as f32,
            input_h as f32 / orig_h as f32,
        );

        let (new_w, new_h) = Self::scaled_dims(orig_w, orig_h, scale, input);

        Self {
            scale_x: scale,
            scale_y: scale,
            pad_x: ((input_w - new_w) / 2) as f32,
            pad_y: ((input_h - new_h) / 2) as f32,
            original_width: orig_w,
            original_height: orig_h,
            input_width: input_w,
            input_height: input_h,
        }
    }

    /// Direct resize to the input size, no padding
    pub fn stretch(original: (u32, u32), input: (u32, u32)) -> Self {
        let (orig_w, orig_h) = (original.0.max(1), original.1.max(1));
        Self {
            scale_x: input.0 as f32 / orig_w as f32,
            scale_y: input.1 as f32 / orig_h as f32,
            pad_x: 0.0,
            pad_y: 0.0,
            original_width: orig_w,
            original_height: orig_h,
            input_width: input.0,
            input_height: input.1,
        }
    }

    fn scaled_dims(orig_w: u32, orig_h: u32, scale: f32, input: (u32, u32)) -> (u32, u32) {
        let new_w = ((orig_w as f32 * scale).round() as u32).clamp(1, input.0);
        let new_h = ((orig_h as f32 * scale).round() as u32).clamp(1, input.1);
        (new_w, new_h)
    }

    /// Size of the resized image content inside the model input
    pub fn content_size(&self) -> (u32, u32) {
        let new_w = ((self.original_width as f32 * self.scale_x).round() as u32)
            .clamp(1, self.input_width);
        let new_h = ((self.original_height as f32 * self.scale_y).round() as u32)
            .clamp(1, self.input_height);
        (new_w, new_h)
    }

    /// Original pixel coordinates to model input coordinates
    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale_x + self.pad_x, y * self.scale_y + self.pad_y)
    }

    /// Model input coordinates to original pixel coordinates, clamped to the image
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let ox = (x - self.pad_x) / self.scale_x;
        let oy = (y - self.pad_y) / self.scale_y;
        (
            ox.clamp(0.0, self.original_width as f32),
            oy.clamp(0.0, self.original_height as f32),
        )
    }

    /// Model-space corner box to a normalized box on the original image
    pub fn to_original_box(&self, x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
        let (ox1, oy1) = self.to_original(x1, y1);
        let (ox2, oy2) = self.to_original(x2, y2);
        let (w, h) = (self.original_width as f32, self.original_height as f32);
        BoundingBox::from_corners(ox1 / w, oy1 / h, ox2 / w, oy2 / h)
    }
}

/// A model-ready input plus the geometry to invert its coordinates
#[derive(Debug, Clone)]
pub struct PreparedInput {
    pub inputs: NamedTensors,
    pub resize: ResizeInfo,
}

/// Preprocess an image the way `config` expects it
pub fn prepare(image: &DynamicImage, config: &ModelConfig) -> PreparedInput {
    let (resized, resize) = match config.resize {
        ResizeStrategy::Letterbox => letterbox(image, config.input_size),
        ResizeStrategy::Stretch => stretch(image, config.input_size),
    };

    let tensor = image_to_tensor(&resized, config.recipe, config.layout);

    PreparedInput {
        inputs: NamedTensors::single(config.input_name, tensor),
        resize,
    }
}

/// Resize with padding to maintain aspect ratio
pub fn letterbox(image: &DynamicImage, target: (u32, u32)) -> (RgbImage, ResizeInfo) {
    let info = ResizeInfo::letterbox(image.dimensions(), target);
    let (new_w, new_h) = info.content_size();

    let resized = image::imageops::resize(&image.to_rgb8(), new_w, new_h, FilterType::Triangle);

    let fill = Rgb([LETTERBOX_FILL; 3]);
    let mut padded = RgbImage::from_pixel(target.0, target.1, fill);
    image::imageops::overlay(&mut padded, &resized, info.pad_x as i64, info.pad_y as i64);

    (padded, info)
}

/// Resize directly to the target size
pub fn stretch(image: &DynamicImage, target: (u32, u32)) -> (RgbImage, ResizeInfo) {
    let info = ResizeInfo::stretch(image.dimensions(), target);
    let resized = image::imageops::resize(&image.to_rgb8(), target.0, target.1, FilterType::Triangle);
    (resized, info)
}

/// Convert an RGB image to a batch-of-one tensor with the given encoding
pub fn image_to_tensor(rgb: &RgbImage, recipe: PixelRecipe, layout: TensorLayout) -> Tensor {
    let (width, height) = rgb.dimensions();
    let (w, h) = (width as usize, height as usize);

    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
    };

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let encoded = recipe.encode(pixel.0);
        let (x, y) = (x as usize, y as usize);
        for (c, value) in encoded.into_iter().enumerate() {
            match layout {
                TensorLayout::Nchw => tensor[[0, c, y, x]] = value,
                TensorLayout::Nhwc => tensor[[0, y, x, c]] = value,
            }
        }
    }

    Tensor::from_array4(tensor)
}

/// Crop a face region with `padding` (fraction of the box size) added on every side
pub fn crop_face(image: &DynamicImage, bbox: &BoundingBox, padding: f32) -> Result<DynamicImage> {
    let (img_w, img_h) = image.dimensions();
    let (x1, y1, x2, y2) = bbox.to_pixels(img_w, img_h);

    let margin_x = (x2 - x1) * padding;
    let margin_y = (y2 - y1) * padding;

    let x1 = (x1 - margin_x).max(0.0) as u32;
    let y1 = (y1 - margin_y).max(0.0) as u32;
    let x2 = (x2 + margin_x).min(img_w as f32) as u32;
    let y2 = (y2 + margin_y).min(img_h as f32) as u32;

    let (w, h) = (x2.saturating_sub(x1), y2.saturating_sub(y1));
    if w < MIN_CROP_PX || h < MIN_CROP_PX {
        return Err(VisionError::GeometryDegenerate(format!(
            "face crop {}x{} is below {}px",
            w, h, MIN_CROP_PX
        )));
    }

    Ok(image.crop_imm(x1, y1, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::{get_config, ARCFACE, RF_DETR, SCENE_CLASSIFIER, YOLOV8_SEG, YUNET};

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    #[test]
    fn test_letterbox_geometry() {
        let info = ResizeInfo::letterbox((1280, 720), (640, 640));
        assert!((info.scale_x - 0.5).abs() < 1e-6);
        assert_eq!(info.content_size(), (640, 360));
        assert_eq!(info.pad_x, 0.0);
        assert_eq!(info.pad_y, 140.0);
    }

    #[test]
    fn test_letterbox_round_trip() {
        let info = ResizeInfo::letterbox((1000, 750), (640, 640));
        for &(x, y) in &[(0.0, 0.0), (123.4, 567.8), (999.0, 749.0), (500.0, 375.0)] {
            let (mx, my) = info.to_model(x, y);
            let (ox, oy) = info.to_original(mx, my);
            assert!((ox - x).abs() < 1e-3, "x {} -> {}", x, ox);
            assert!((oy - y).abs() < 1e-3, "y {} -> {}", y, oy);
        }
    }

    #[test]
    fn test_to_original_clamps_padding() {
        let info = ResizeInfo::letterbox((1280, 720), (640, 640));
        assert_eq!(info.to_original(10.0, 0.0), (20.0, 0.0));
        assert_eq!(info.to_original(640.0, 640.0), (1280.0, 720.0));
    }

    #[test]
    fn test_letterbox_pads_with_gray() {
        let (padded, info) = letterbox(&solid(200, 100, [255, 0, 0]), (64, 64));
        assert_eq!(padded.dimensions(), (64, 64));
        assert_eq!(info.pad_y, 16.0);
        assert_eq!(padded.get_pixel(0, 0).0, [114, 114, 114]);
        assert_eq!(padded.get_pixel(32, 32).0, [255, 0, 0]);
    }

    #[test]
    fn test_recipes() {
        let px = [255, 128, 0];
        let imagenet = PixelRecipe::ImageNet.encode(px);
        assert!((imagenet[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
        assert!((imagenet[2] - (0.0 - 0.406) / 0.225).abs() < 1e-5);

        assert_eq!(PixelRecipe::UnitScale.encode(px), [1.0, 128.0 / 255.0, 0.0]);
        assert_eq!(PixelRecipe::RawBgr.encode(px), [0.0, 128.0, 255.0]);

        let sym = PixelRecipe::Symmetric.encode(px);
        assert!((sym[0] - 127.5 / 128.0).abs() < 1e-6);
        assert!((sym[2] + 127.5 / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_prepare_uses_model_conventions() {
        let image = solid(320, 240, [10, 20, 30]);

        let face = prepare(&image, get_config(YUNET).unwrap());
        let t = face.inputs.get("input").unwrap();
        assert_eq!(t.shape(), &[1, 3, 640, 640]);
        // BGR, raw values: channel 0 plane is blue
        assert_eq!(t.data()[0], 30.0);
        assert_eq!(face.resize.pad_x, 0.0);

        let seg = prepare(&image, get_config(YOLOV8_SEG).unwrap());
        let t = seg.inputs.first().unwrap();
        assert_eq!(seg.resize.pad_y, 80.0);
        // top-left is padding
        assert!((t.data()[0] - 114.0 / 255.0).abs() < 1e-6);

        let det = prepare(&image, get_config(RF_DETR).unwrap());
        assert_eq!(det.inputs.get("images").unwrap().shape(), &[1, 3, 640, 640]);

        let emb = prepare(&image, get_config(ARCFACE).unwrap());
        let t = emb.inputs.first().unwrap();
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t.data()[0] - (10.0 - 127.5) / 128.0).abs() < 1e-5);

        let scene = prepare(&image, get_config(SCENE_CLASSIFIER).unwrap());
        let t = scene.inputs.first().unwrap();
        assert_eq!(t.shape(), &[1, 224, 224, 3]);
        assert!((t.data()[2] - 30.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_crop_face_padding() {
        let image = solid(400, 400, [0, 0, 0]);
        let bbox = BoundingBox { x: 0.25, y: 0.25, width: 0.25, height: 0.25 };
        let crop = crop_face(&image, &bbox, 0.25).unwrap();
        assert_eq!(crop.dimensions(), (150, 150));
    }

    #[test]
    fn test_crop_face_rejects_tiny() {
        let image = solid(100, 100, [0, 0, 0]);
        let bbox = BoundingBox { x: 0.5, y: 0.5, width: 0.05, height: 0.05 };
        assert!(matches!(
            crop_face(&image, &bbox, 0.25),
            Err(VisionError::GeometryDegenerate(_))
        ));
    }
}
