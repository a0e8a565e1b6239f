use image::imageops::{self, FilterType};
use image::{DynamicImage, Rgb, RgbImage};
use rand::Rng;

pub const IMAGE_SIZE: u32 = 224;
const EVAL_RESIZE: u32 = 256;

/// ImageNet channel statistics on [0, 1] RGB values.
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Dataset sizes below this get only resizing.
pub const BALANCED_MIN_SAMPLES: usize = 200;
/// Dataset sizes above this get the full geometric and photometric set.
pub const FULL_ABOVE_SAMPLES: usize = 1000;

/// Normalized CHW pixels of one RGB image.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBuffer {
    data: Vec<f32>,
    width: u32,
    height: u32,
}

impl PixelBuffer {
    pub fn from_rgb(image: &RgbImage) -> Self {
        let (width, height) = image.dimensions();
        let plane = (width * height) as usize;
        let mut data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in image.enumerate_pixels() {
            let offset = (y * width + x) as usize;
            for c in 0..3 {
                data[c * plane + offset] = (pixel[c] as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }
        Self { data, width, height }
    }

    /// `[channels, height, width]`
    pub fn shape(&self) -> [i64; 3] {
        [3, self.height as i64, self.width as i64]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    fn fill_rect(&mut self, x: u32, y: u32, w: u32, h: u32, value: f32) {
        let plane = (self.width * self.height) as usize;
        for c in 0..3 {
            for row in y..y + h {
                let start = c * plane + (row * self.width + x) as usize;
                self.data[start..start + w as usize].fill(value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    Resize { width: u32, height: u32 },
    /// Scales so the shorter side equals the given length, keeping aspect.
    ResizeShorter(u32),
    CenterCrop(u32),
    RandomResizedCrop {
        size: u32,
        scale: (f32, f32),
        ratio: (f32, f32),
    },
    HorizontalFlip { p: f64 },
    RandomRotation { degrees: f32 },
    ColorJitter {
        brightness: f32,
        contrast: f32,
        saturation: f32,
        hue: f32,
    },
    RandomAffine {
        translate: (f32, f32),
        scale: (f32, f32),
    },
}

impl Transform {
    pub fn is_random(&self) -> bool {
        !matches!(
            self,
            Transform::Resize { .. } | Transform::ResizeShorter(_) | Transform::CenterCrop(_)
        )
    }

    fn apply<R: Rng + ?Sized>(&self, image: RgbImage, rng: &mut R) -> RgbImage {
        match *self {
            Transform::Resize { width, height } => {
                imageops::resize(&image, width, height, FilterType::Triangle)
            }
            Transform::ResizeShorter(side) => resize_shorter(&image, side),
            Transform::CenterCrop(size) => center_crop(&image, size),
            Transform::RandomResizedCrop { size, scale, ratio } => {
                random_resized_crop(&image, size, scale, ratio, rng)
            }
            Transform::HorizontalFlip { p } => {
                if rng.random_bool(p) {
                    imageops::flip_horizontal(&image)
                } else {
                    image
                }
            }
            Transform::RandomRotation { degrees } => {
                let angle = rng.random_range(-degrees..=degrees).to_radians();
                let (cos, sin) = (angle.cos(), angle.sin());
                warp(&image, |dx, dy| (dx * cos + dy * sin, -dx * sin + dy * cos))
            }
            Transform::ColorJitter {
                brightness,
                contrast,
                saturation,
                hue,
            } => {
                let b = rng.random_range(1.0 - brightness..=1.0 + brightness);
                let c = rng.random_range(1.0 - contrast..=1.0 + contrast);
                let s = rng.random_range(1.0 - saturation..=1.0 + saturation);
                let h = rng.random_range(-hue..=hue);
                color_jitter(image, b, c, s, h)
            }
            Transform::RandomAffine { translate, scale } => {
                let (w, h) = image.dimensions();
                let tx = rng.random_range(-translate.0..=translate.0) * w as f32;
                let ty = rng.random_range(-translate.1..=translate.1) * h as f32;
                let s = rng.random_range(scale.0..=scale.1);
                warp(&image, |dx, dy| ((dx - tx) / s, (dy - ty) / s))
            }
        }
    }
}

/// Cuts a random rectangle out of the normalized tensor and zeroes it.
#[derive(Debug, Clone, PartialEq)]
pub struct RandomErasing {
    pub p: f64,
    pub area: (f32, f32),
    pub aspect: (f32, f32),
}

impl Default for RandomErasing {
    fn default() -> Self {
        Self {
            p: 0.5,
            area: (0.02, 0.33),
            aspect: (0.3, 3.3),
        }
    }
}

impl RandomErasing {
    fn apply<R: Rng + ?Sized>(&self, pixels: &mut PixelBuffer, rng: &mut R) {
        if !rng.random_bool(self.p) {
            return;
        }
        let total = (pixels.width * pixels.height) as f32;
        let (log_lo, log_hi) = (self.aspect.0.ln(), self.aspect.1.ln());
        for _ in 0..10 {
            let area = total * rng.random_range(self.area.0..=self.area.1);
            let aspect = rng.random_range(log_lo..=log_hi).exp();
            let h = (area * aspect).sqrt().round() as u32;
            let w = (area / aspect).sqrt().round() as u32;
            if w == 0 || h == 0 || w >= pixels.width || h >= pixels.height {
                continue;
            }
            let x = rng.random_range(0..=pixels.width - w);
            let y = rng.random_range(0..=pixels.height - h);
            pixels.fill_rect(x, y, w, h, 0.0);
            return;
        }
    }
}

/// An ordered list of image transforms followed by normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    transforms: Vec<Transform>,
    erasing: Option<RandomErasing>,
}

impl Pipeline {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self {
            transforms,
            erasing: None,
        }
    }

    pub fn with_erasing(mut self, erasing: RandomErasing) -> Self {
        self.erasing = Some(erasing);
        self
    }

    /// Number of randomized steps, a rough measure of augmentation strength.
    pub fn random_steps(&self) -> usize {
        self.transforms.iter().filter(|t| t.is_random()).count() + self.erasing.is_some() as usize
    }

    pub fn is_deterministic(&self) -> bool {
        self.random_steps() == 0
    }

    pub fn apply<R: Rng + ?Sized>(&self, image: &DynamicImage, rng: &mut R) -> PixelBuffer {
        let mut rgb = image.to_rgb8();
        for transform in &self.transforms {
            rgb = transform.apply(rgb, rng);
        }
        let mut pixels = PixelBuffer::from_rgb(&rgb);
        if let Some(erasing) = &self.erasing {
            erasing.apply(&mut pixels, rng);
        }
        pixels
    }
}

/// Resize the short side to 256, center-crop 224. Used for validation and inference.
pub fn eval_pipeline() -> Pipeline {
    Pipeline::new(vec![
        Transform::ResizeShorter(EVAL_RESIZE),
        Transform::CenterCrop(IMAGE_SIZE),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AugmentationTier {
    Minimal,
    Balanced,
    Full,
}

impl AugmentationTier {
    pub fn for_dataset_size(total_samples: usize) -> Self {
        if total_samples < BALANCED_MIN_SAMPLES {
            AugmentationTier::Minimal
        } else if total_samples <= FULL_ABOVE_SAMPLES {
            AugmentationTier::Balanced
        } else {
            AugmentationTier::Full
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationPolicy {
    pub tier: AugmentationTier,
    pub train: Pipeline,
    pub eval: Pipeline,
}

impl AugmentationPolicy {
    pub fn for_dataset_size(total_samples: usize, random_erasing: bool) -> Self {
        let tier = AugmentationTier::for_dataset_size(total_samples);
        let train = match tier {
            AugmentationTier::Minimal => Pipeline::new(vec![Transform::Resize {
                width: IMAGE_SIZE,
                height: IMAGE_SIZE,
            }]),
            AugmentationTier::Balanced => Pipeline::new(balanced_transforms()),
            AugmentationTier::Full => {
                let mut transforms = balanced_transforms();
                transforms.extend([
                    Transform::RandomRotation { degrees: 15.0 },
                    Transform::ColorJitter {
                        brightness: 0.2,
                        contrast: 0.2,
                        saturation: 0.2,
                        hue: 0.1,
                    },
                    Transform::RandomAffine {
                        translate: (0.1, 0.1),
                        scale: (0.9, 1.1),
                    },
                ]);
                let pipeline = Pipeline::new(transforms);
                if random_erasing {
                    pipeline.with_erasing(RandomErasing::default())
                } else {
                    pipeline
                }
            }
        };
        log::info!(
            "Using {:?} augmentation for {} samples ({} random steps)",
            tier,
            total_samples,
            train.random_steps()
        );
        Self {
            tier,
            train,
            eval: eval_pipeline(),
        }
    }
}

fn balanced_transforms() -> Vec<Transform> {
    vec![
        Transform::Resize {
            width: EVAL_RESIZE,
            height: EVAL_RESIZE,
        },
        Transform::RandomResizedCrop {
            size: IMAGE_SIZE,
            scale: (0.08, 1.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
        },
        Transform::HorizontalFlip { p: 0.5 },
    ]
}

fn resize_shorter(image: &RgbImage, side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let (nw, nh) = if w <= h {
        (side, ((h as f64 * side as f64 / w as f64).round() as u32).max(1))
    } else {
        (((w as f64 * side as f64 / h as f64).round() as u32).max(1), side)
    };
    imageops::resize(image, nw, nh, FilterType::Triangle)
}

fn center_crop(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w < size || h < size {
        let upscaled = resize_shorter(image, size);
        return center_crop(&upscaled, size);
    }
    let x = (w - size) / 2;
    let y = (h - size) / 2;
    imageops::crop_imm(image, x, y, size, size).to_image()
}

fn random_resized_crop<R: Rng + ?Sized>(
    image: &RgbImage,
    size: u32,
    scale: (f32, f32),
    ratio: (f32, f32),
    rng: &mut R,
) -> RgbImage {
    let (w, h) = image.dimensions();
    let area = (w * h) as f32;
    let (log_lo, log_hi) = (ratio.0.ln(), ratio.1.ln());

    for _ in 0..10 {
        let target = area * rng.random_range(scale.0..=scale.1);
        let aspect = rng.random_range(log_lo..=log_hi).exp();
        let cw = (target * aspect).sqrt().round() as u32;
        let ch = (target / aspect).sqrt().round() as u32;
        if cw > 0 && ch > 0 && cw <= w && ch <= h {
            let x = rng.random_range(0..=w - cw);
            let y = rng.random_range(0..=h - ch);
            let crop = imageops::crop_imm(image, x, y, cw, ch).to_image();
            return imageops::resize(&crop, size, size, FilterType::Triangle);
        }
    }

    // Fallback: the largest centered crop within the ratio bounds.
    let in_ratio = w as f32 / h as f32;
    let (cw, ch) = if in_ratio < ratio.0 {
        (w, ((w as f32 / ratio.0).round() as u32).clamp(1, h))
    } else if in_ratio > ratio.1 {
        (((h as f32 * ratio.1).round() as u32).clamp(1, w), h)
    } else {
        (w, h)
    };
    let crop = imageops::crop_imm(image, (w - cw) / 2, (h - ch) / 2, cw, ch).to_image();
    imageops::resize(&crop, size, size, FilterType::Triangle)
}

/// Inverse-maps every output pixel through `map` (offsets from the image
/// center) and samples bilinearly; outside pixels are black.
fn warp(image: &RgbImage, map: impl Fn(f32, f32) -> (f32, f32)) -> RgbImage {
    let (w, h) = image.dimensions();
    let (cx, cy) = (w as f32 / 2.0, h as f32 / 2.0);
    RgbImage::from_fn(w, h, |x, y| {
        let (dx, dy) = map(x as f32 - cx, y as f32 - cy);
        bilinear(image, cx + dx, cy + dy)
    })
}

fn bilinear(image: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (w, h) = image.dimensions();
    if x < 0.0 || y < 0.0 || x > (w - 1) as f32 || y > (h - 1) as f32 {
        return Rgb([0, 0, 0]);
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let (p00, p10) = (image.get_pixel(x0, y0), image.get_pixel(x1, y0));
    let (p01, p11) = (image.get_pixel(x0, y1), image.get_pixel(x1, y1));

    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = p00[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + p10[c] as f32 * fx * (1.0 - fy)
            + p01[c] as f32 * (1.0 - fx) * fy
            + p11[c] as f32 * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn luma(rgb: [f32; 3]) -> f32 {
    0.299 * rgb[0] + 0.587 * rgb[1] + 0.114 * rgb[2]
}

/// Brightness, contrast and saturation are blends against black, the mean
/// luma and the per-pixel luma; hue is a rotation in HSV space.
fn color_jitter(mut image: RgbImage, brightness: f32, contrast: f32, saturation: f32, hue: f32) -> RgbImage {
    let to_unit = |p: &Rgb<u8>| [p[0] as f32 / 255.0, p[1] as f32 / 255.0, p[2] as f32 / 255.0];
    let brightened: Vec<[f32; 3]> = image
        .pixels()
        .map(|p| to_unit(p).map(|v| (v * brightness).clamp(0.0, 1.0)))
        .collect();
    let mean_luma = brightened.iter().map(|&rgb| luma(rgb)).sum::<f32>() / brightened.len().max(1) as f32;

    for (pixel, &rgb) in image.pixels_mut().zip(&brightened) {
        let mut rgb = rgb.map(|v| ((v - mean_luma) * contrast + mean_luma).clamp(0.0, 1.0));
        let gray = luma(rgb);
        rgb = rgb.map(|v| ((v - gray) * saturation + gray).clamp(0.0, 1.0));
        if hue != 0.0 {
            let (h, s, v) = rgb_to_hsv(rgb);
            rgb = hsv_to_rgb((h + hue).rem_euclid(1.0), s, v);
        }
        *pixel = Rgb(rgb.map(|v| (v * 255.0).round().clamp(0.0, 255.0) as u8));
    }
    image
}

fn rgb_to_hsv([r, g, b]: [f32; 3]) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let sector = h * 6.0;
    let i = sector.floor();
    let f = sector - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match i as i32 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        }))
    }

    #[test]
    fn tiers_switch_at_boundaries() {
        assert_eq!(AugmentationTier::for_dataset_size(0), AugmentationTier::Minimal);
        assert_eq!(AugmentationTier::for_dataset_size(199), AugmentationTier::Minimal);
        assert_eq!(AugmentationTier::for_dataset_size(200), AugmentationTier::Balanced);
        assert_eq!(AugmentationTier::for_dataset_size(1000), AugmentationTier::Balanced);
        assert_eq!(AugmentationTier::for_dataset_size(1001), AugmentationTier::Full);
    }

    #[test]
    fn strength_is_monotonic_in_dataset_size() {
        let sizes = [10, 199, 200, 640, 1000, 1001, 50_000];
        let steps: Vec<usize> = sizes
            .iter()
            .map(|&n| AugmentationPolicy::for_dataset_size(n, false).train.random_steps())
            .collect();
        assert!(steps.windows(2).all(|w| w[0] <= w[1]), "{steps:?}");
        assert_eq!(steps[0], 0);

        let full = AugmentationPolicy::for_dataset_size(5000, false);
        let erasing = AugmentationPolicy::for_dataset_size(5000, true);
        assert!(erasing.train.random_steps() > full.train.random_steps());
        // Erasing is a Full-tier option only.
        assert_eq!(
            AugmentationPolicy::for_dataset_size(500, true).train,
            AugmentationPolicy::for_dataset_size(500, false).train
        );
    }

    #[test]
    fn policy_is_a_pure_function_of_size() {
        assert_eq!(
            AugmentationPolicy::for_dataset_size(777, false),
            AugmentationPolicy::for_dataset_size(777, false)
        );
    }

    #[test]
    fn eval_output_is_identical_across_calls() {
        let policy = AugmentationPolicy::for_dataset_size(5000, true);
        assert!(policy.eval.is_deterministic());
        let image = gradient(320, 240);
        let a = policy.eval.apply(&image, &mut StdRng::seed_from_u64(1));
        let b = policy.eval.apply(&image, &mut StdRng::seed_from_u64(2));
        assert_eq!(a, b);
        assert_eq!(a.shape(), [3, 224, 224]);
    }

    #[test]
    fn every_tier_produces_model_sized_tensors() {
        let image = gradient(300, 180);
        let mut rng = StdRng::seed_from_u64(7);
        for n in [50, 500, 5000] {
            let policy = AugmentationPolicy::for_dataset_size(n, true);
            let pixels = policy.train.apply(&image, &mut rng);
            assert_eq!(pixels.shape(), [3, 224, 224], "n={n}");
            assert_eq!(pixels.as_slice().len(), 3 * 224 * 224);
        }
    }

    #[test]
    fn normalization_uses_imagenet_statistics() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 255, 255])));
        let pixels = Pipeline::new(vec![]).apply(&white, &mut StdRng::seed_from_u64(0));
        let plane = 16;
        for c in 0..3 {
            let expected = (1.0 - MEAN[c]) / STD[c];
            assert!((pixels.as_slice()[c * plane] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn center_crop_upscales_small_images() {
        let small = gradient(100, 60).to_rgb8();
        let cropped = center_crop(&small, 224);
        assert_eq!(cropped.dimensions(), (224, 224));
    }

    #[test]
    fn hsv_round_trip_preserves_colour() {
        for rgb in [[0.2, 0.4, 0.6], [0.9, 0.1, 0.1], [0.5, 0.5, 0.5]] {
            let (h, s, v) = rgb_to_hsv(rgb);
            let back = hsv_to_rgb(h, s, v);
            for c in 0..3 {
                assert!((back[c] - rgb[c]).abs() < 1e-5, "{rgb:?} -> {back:?}");
            }
        }
    }
}
