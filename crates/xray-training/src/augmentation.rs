//! Randomized input perturbations for training batches.
//!
//! Factors are drawn on the host from a caller-owned RNG, one set per sample,
//! and applied to the whole batch in tensor form. Pixel values are expected
//! in `[0, 255]` and stay clamped to that range.

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor, TensorData},
};
use rand::Rng;
use xray_core::AugmentationConfig;

const PIXEL_MAX: f32 = 255.0;

/// Per-sample factors of one augmentation pass
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationParams {
    pub contrast: Vec<f32>,
    /// Offsets in pixel units
    pub brightness: Vec<f32>,
    pub rotate: Vec<bool>,
}

impl AugmentationParams {
    pub fn len(&self) -> usize {
        self.contrast.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contrast.is_empty()
    }
}

/// Contrast, brightness and quarter-turn rotation stage
#[derive(Module, Clone, Debug)]
pub struct RandomAugmentation {
    contrast_lower: f64,
    contrast_upper: f64,
    brightness_lower: f64,
    brightness_upper: f64,
    rotation_probability: f64,
}

fn draw<R: Rng>(rng: &mut R, lower: f64, upper: f64) -> f32 {
    if lower < upper {
        rng.gen_range(lower..upper) as f32
    } else {
        lower as f32
    }
}

impl RandomAugmentation {
    pub fn new(config: &AugmentationConfig) -> Self {
        Self {
            contrast_lower: config.contrast_range.0 as f64,
            contrast_upper: config.contrast_range.1 as f64,
            brightness_lower: config.brightness_range.0 as f64,
            brightness_upper: config.brightness_range.1 as f64,
            rotation_probability: config.rotation_probability.clamp(0.0, 1.0),
        }
    }

    pub fn sample<R: Rng>(&self, batch_size: usize, rng: &mut R) -> AugmentationParams {
        let mut params = AugmentationParams {
            contrast: Vec::with_capacity(batch_size),
            brightness: Vec::with_capacity(batch_size),
            rotate: Vec::with_capacity(batch_size),
        };
        for _ in 0..batch_size {
            params
                .contrast
                .push(draw(rng, self.contrast_lower, self.contrast_upper));
            params
                .brightness
                .push(draw(rng, self.brightness_lower, self.brightness_upper) * PIXEL_MAX);
            params.rotate.push(rng.gen_bool(self.rotation_probability));
        }
        params
    }

    /// Applies explicit factors to a `[batch, channels, h, w]` batch.
    ///
    /// Rotation is skipped for non-square images.
    pub fn apply<B: Backend>(&self, images: Tensor<B, 4>, params: &AugmentationParams) -> Tensor<B, 4> {
        let [n, _, h, w] = images.dims();
        let device = images.device();
        let per_sample =
            |values: Vec<f32>| Tensor::<B, 4>::from_data(TensorData::new(values, [n, 1, 1, 1]), &device);

        let mean = images.clone().mean_dim(3).mean_dim(2);
        let contrast = per_sample(params.contrast.clone());
        let x = ((images - mean.clone()) * contrast + mean).clamp(0.0, PIXEL_MAX);

        let x = (x + per_sample(params.brightness.clone())).clamp(0.0, PIXEL_MAX);

        if h != w || !params.rotate.iter().any(|&r| r) {
            return x;
        }
        let rotated = x.clone().swap_dims(2, 3).flip([3]);
        let mask: Vec<f32> = params.rotate.iter().map(|&r| if r { 1.0 } else { 0.0 }).collect();
        let keep: Vec<f32> = mask.iter().map(|m| 1.0 - m).collect();

        x * per_sample(keep) + rotated * per_sample(mask)
    }

    /// Draws factors for every sample and applies them
    pub fn forward<B: Backend, R: Rng>(&self, images: Tensor<B, 4>, rng: &mut R) -> Tensor<B, 4> {
        let params = self.sample(images.dims()[0], rng);
        self.apply(images, &params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type TestBackend = NdArray<f32>;

    fn identity() -> RandomAugmentation {
        RandomAugmentation::new(&AugmentationConfig {
            contrast_range: (1.0, 1.0),
            brightness_range: (0.0, 0.0),
            rotation_probability: 0.0,
            seed: 0,
        })
    }

    fn values(t: Tensor<TestBackend, 4>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    fn image(data: Vec<f32>, shape: [usize; 4]) -> Tensor<TestBackend, 4> {
        Tensor::from_data(TensorData::new(data, shape), &Default::default())
    }

    #[test]
    fn test_identity_leaves_batch_unchanged() {
        let input = image(vec![0.0, 50.0, 100.0, 255.0], [1, 1, 2, 2]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let output = identity().forward(input.clone(), &mut rng);
        assert_eq!(values(output), values(input));
    }

    #[test]
    fn test_contrast_and_brightness() {
        let aug = identity();
        let input = image(vec![0.0, 100.0, 0.0, 100.0], [1, 1, 2, 2]);

        let params = AugmentationParams {
            contrast: vec![2.0],
            brightness: vec![10.0],
            rotate: vec![false],
        };
        // mean 50: 0 -> -50 -> 0 (+10), 100 -> 150 (+10)
        assert_eq!(values(aug.apply(input, &params)), vec![10.0, 160.0, 10.0, 160.0]);
    }

    #[test]
    fn test_brightness_is_clamped() {
        let aug = identity();
        let input = image(vec![250.0; 4], [1, 1, 2, 2]);
        let params = AugmentationParams {
            contrast: vec![1.0],
            brightness: vec![25.5],
            rotate: vec![false],
        };
        assert_eq!(values(aug.apply(input, &params)), vec![255.0; 4]);
    }

    #[test]
    fn test_rotation_only_for_selected_samples() {
        let aug = identity();
        let input = image(vec![1.0, 2.0, 3.0, 4.0, 1.0, 2.0, 3.0, 4.0], [2, 1, 2, 2]);
        let params = AugmentationParams {
            contrast: vec![1.0, 1.0],
            brightness: vec![0.0, 0.0],
            rotate: vec![true, false],
        };
        assert_eq!(
            values(aug.apply(input, &params)),
            vec![3.0, 1.0, 4.0, 2.0, 1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_sampling_is_seeded() {
        let aug = RandomAugmentation::new(&AugmentationConfig::default());
        let a = aug.sample(8, &mut ChaCha8Rng::seed_from_u64(42));
        let b = aug.sample(8, &mut ChaCha8Rng::seed_from_u64(42));
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.contrast.iter().all(|c| (0.89..=1.11).contains(c)));
        assert!(a.brightness.iter().all(|d| d.abs() <= 25.6));
    }
}
