//! Transfer-learning classifier on a frozen DenseNet backbone.
//!
//! Graph: optional augmentation -> DenseNet input normalization -> backbone
//! -> global average pooling -> dropout -> dense layer. Only the dense layer
//! is trained.

use burn::{
    module::{AutodiffModule, Module},
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Dropout, DropoutConfig, Linear, LinearConfig,
    },
    tensor::{
        activation::softmax,
        backend::{AutodiffBackend, Backend},
        Tensor, TensorData,
    },
};
use rand::Rng;

use crate::augmentation::RandomAugmentation;
use crate::densenet::DenseNet;

/// ImageNet channel means used by the DenseNet weights
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];

/// ImageNet channel standard deviations used by the DenseNet weights
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// DenseNet input normalization: `[0, 255]` RGB to ImageNet-standardized
/// values.
pub fn preprocess_input<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = images.device();
    let channel = |values: [f32; 3]| {
        Tensor::<B, 4>::from_data(TensorData::new(values.to_vec(), [1, 3, 1, 1]), &device)
    };

    (images / 255.0 - channel(IMAGENET_MEAN)) / channel(IMAGENET_STD)
}

/// Backbone features pooled to `[batch, channels]`
fn pooled_features<B: Backend>(
    backbone: &DenseNet<B>,
    pool: &AdaptiveAvgPool2d,
    images: Tensor<B, 4>,
) -> Tensor<B, 2> {
    let x = backbone.forward(preprocess_input(images));
    let x = pool.forward(x);

    let [batch_size, channels, _, _] = x.dims();
    x.reshape([batch_size, channels])
}

/// Pneumonia classifier built by [`ModelBuilder`](crate::builder::ModelBuilder)
#[derive(Module, Debug)]
pub struct TransferClassifier<B: Backend> {
    augmentation: Option<RandomAugmentation>,
    backbone: DenseNet<B>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    fc: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> TransferClassifier<B> {
    pub fn new(
        backbone: DenseNet<B>,
        augmentation: Option<RandomAugmentation>,
        dropout: f64,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let fc = LinearConfig::new(backbone.num_features(), num_classes).init(device);
        Self {
            augmentation,
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(dropout).init(),
            fc,
            num_classes,
        }
    }

    /// Logits for a batch of `[0, 255]` images.
    ///
    /// This is the inference path: augmentation is skipped and, on a backend
    /// without autodiff, batch norm and dropout run in evaluation mode.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = pooled_features(&self.backbone, &self.pool, images);
        self.fc.forward(self.dropout.forward(features))
    }

    /// Class probabilities
    pub fn predict(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn augmentation(&self) -> Option<&RandomAugmentation> {
        self.augmentation.as_ref()
    }

    pub fn backbone(&self) -> &DenseNet<B> {
        &self.backbone
    }

    /// Parameters updated by training
    pub fn trainable_params(&self) -> usize {
        self.fc.num_params()
    }
}

impl<B: AutodiffBackend> TransferClassifier<B> {
    /// Logits for a training step.
    ///
    /// Applies the augmentation stage, then runs the backbone on the inner
    /// backend so it stays in inference mode and outside the gradient graph.
    pub fn forward_train<R: Rng>(&self, images: Tensor<B, 4>, rng: &mut R) -> Tensor<B, 2> {
        let images = match &self.augmentation {
            Some(augmentation) => augmentation.forward(images, rng),
            None => images,
        };

        let backbone = self.backbone.valid();
        let features = pooled_features(&backbone, &self.pool, images.inner());
        let features = Tensor::<B, 2>::from_inner(features);

        self.fc.forward(self.dropout.forward(features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::densenet::DenseNetConfig;
    use burn::backend::Autodiff;
    use burn::nn::loss::CrossEntropyLossConfig;
    use burn::tensor::Int;
    use burn_ndarray::NdArray;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use xray_core::AugmentationConfig;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn tiny_backbone() -> DenseNetConfig {
        DenseNetConfig::new(vec![2, 2])
            .with_growth_rate(4)
            .with_num_init_features(8)
            .with_bn_size(2)
    }

    #[test]
    fn test_preprocess_input() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::full([1, 3, 1, 1], 255.0, &device);
        let out = preprocess_input(images).into_data().to_vec::<f32>().unwrap();

        for c in 0..3 {
            let expected = (1.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!((out[c] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_forward_and_predict_shapes() {
        let device = Default::default();
        let backbone = tiny_backbone().init::<TestBackend>(&device);
        let model = TransferClassifier::new(backbone, None, 0.2, 3, &device);

        let images = Tensor::<TestBackend, 4>::full([2, 3, 32, 32], 128.0, &device);
        assert_eq!(model.forward(images.clone()).dims(), [2, 3]);

        let probs = model.predict(images).into_data().to_vec::<f32>().unwrap();
        for row in probs.chunks(3) {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
        assert_eq!(model.trainable_params(), 16 * 3 + 3);
    }

    #[test]
    fn test_forward_train_only_reaches_head() {
        let device = Default::default();
        let backbone = tiny_backbone().init::<TestAutodiffBackend>(&device).no_grad();
        let augmentation = RandomAugmentation::new(&AugmentationConfig::default());
        let model = TransferClassifier::new(backbone, Some(augmentation), 0.2, 3, &device);

        let images = Tensor::<TestAutodiffBackend, 4>::full([2, 3, 32, 32], 100.0, &device);
        let targets = Tensor::<TestAutodiffBackend, 1, Int>::from_data(
            TensorData::new(vec![0i64, 2], [2]),
            &device,
        );

        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let logits = model.forward_train(images, &mut rng);
        assert_eq!(logits.dims(), [2, 3]);

        let loss = CrossEntropyLossConfig::new()
            .init(&device)
            .forward(logits, targets);
        let grads = loss.backward();

        assert!(model.fc.weight.val().grad(&grads).is_some());
        assert!(model.augmentation().is_some());
    }
}
