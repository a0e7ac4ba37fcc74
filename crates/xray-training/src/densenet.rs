//! DenseNet feature extractor.
//!
//! Layout follows the ImageNet DenseNets without their classification head:
//! a strided 7x7 stem, dense blocks joined by compressing transitions, and a
//! final batch norm + ReLU. Output is the last feature map,
//! `[batch, num_features, h / 32, w / 32]`.

use std::path::Path;

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use xray_core::Backbone;

/// Configuration of a DenseNet backbone
#[derive(Config, Debug)]
pub struct DenseNetConfig {
    /// Dense layers per block
    pub block_config: Vec<usize>,

    /// Channels added by every dense layer
    #[config(default = "32")]
    pub growth_rate: usize,

    /// Channels produced by the stem
    #[config(default = "64")]
    pub num_init_features: usize,

    /// Bottleneck width as a multiple of the growth rate
    #[config(default = "4")]
    pub bn_size: usize,

    /// Channel reduction applied by each transition
    #[config(default = "0.5")]
    pub compression: f64,
}

impl DenseNetConfig {
    pub fn densenet121() -> Self {
        Self::new(vec![6, 12, 24, 16])
    }

    pub fn densenet169() -> Self {
        Self::new(vec![6, 12, 32, 32])
    }

    pub fn densenet201() -> Self {
        Self::new(vec![6, 12, 48, 32])
    }

    pub fn for_backbone(backbone: Backbone) -> Self {
        match backbone {
            Backbone::DenseNet121 => Self::densenet121(),
            Backbone::DenseNet169 => Self::densenet169(),
            Backbone::DenseNet201 => Self::densenet201(),
        }
    }

    /// Channels entering each transition, then the final channel count
    fn channel_plan(&self) -> (Vec<(usize, usize)>, usize) {
        let mut features = self.num_init_features;
        let mut transitions = Vec::new();
        for (i, &layers) in self.block_config.iter().enumerate() {
            features += layers * self.growth_rate;
            if i + 1 < self.block_config.len() {
                let reduced = (features as f64 * self.compression).floor() as usize;
                transitions.push((features, reduced));
                features = reduced;
            }
        }
        (transitions, features)
    }

    /// Channels of the extracted feature map
    pub fn num_features(&self) -> usize {
        self.channel_plan().1
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> DenseNet<B> {
        let conv0 = Conv2dConfig::new([3, self.num_init_features], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let norm0 = BatchNormConfig::new(self.num_init_features).init(device);
        let pool0 = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let (plan, num_features) = self.channel_plan();

        let mut blocks = Vec::with_capacity(self.block_config.len());
        let mut transitions = Vec::with_capacity(plan.len());
        let mut features = self.num_init_features;
        for (i, &layers) in self.block_config.iter().enumerate() {
            blocks.push(DenseBlock::new(
                layers,
                features,
                self.growth_rate,
                self.bn_size,
                device,
            ));
            if let Some(&(in_channels, out_channels)) = plan.get(i) {
                transitions.push(Transition::new(in_channels, out_channels, device));
                features = out_channels;
            }
        }

        DenseNet {
            conv0,
            norm0,
            pool0,
            blocks,
            transitions,
            norm_final: BatchNormConfig::new(num_features).init(device),
            relu: Relu::new(),
            num_features,
        }
    }
}

/// BN-ReLU-Conv1x1-BN-ReLU-Conv3x3, concatenated onto its input
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    norm1: BatchNorm<B>,
    conv1: Conv2d<B>,
    norm2: BatchNorm<B>,
    conv2: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> DenseLayer<B> {
    pub fn new(in_channels: usize, growth_rate: usize, bn_size: usize, device: &B::Device) -> Self {
        let bottleneck = bn_size * growth_rate;
        Self {
            norm1: BatchNormConfig::new(in_channels).init(device),
            conv1: Conv2dConfig::new([in_channels, bottleneck], [1, 1])
                .with_bias(false)
                .init(device),
            norm2: BatchNormConfig::new(bottleneck).init(device),
            conv2: Conv2dConfig::new([bottleneck, growth_rate], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.relu.forward(self.norm1.forward(x.clone()));
        let out = self.conv1.forward(out);
        let out = self.relu.forward(self.norm2.forward(out));
        let out = self.conv2.forward(out);

        Tensor::cat(vec![x, out], 1)
    }
}

#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(
        num_layers: usize,
        in_channels: usize,
        growth_rate: usize,
        bn_size: usize,
        device: &B::Device,
    ) -> Self {
        let layers = (0..num_layers)
            .map(|i| DenseLayer::new(in_channels + i * growth_rate, growth_rate, bn_size, device))
            .collect();
        Self { layers }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(x, |x, layer| layer.forward(x))
    }
}

/// BN-ReLU-Conv1x1 followed by 2x2 average pooling
#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    norm: BatchNorm<B>,
    conv: Conv2d<B>,
    pool: AvgPool2d,
    relu: Relu,
}

impl<B: Backend> Transition<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(in_channels).init(device),
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.norm.forward(x));
        self.pool.forward(self.conv.forward(x))
    }
}

/// DenseNet convolutional trunk
#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    conv0: Conv2d<B>,
    norm0: BatchNorm<B>,
    pool0: MaxPool2d,
    blocks: Vec<DenseBlock<B>>,
    transitions: Vec<Transition<B>>,
    norm_final: BatchNorm<B>,
    relu: Relu,
    num_features: usize,
}

impl<B: Backend> DenseNet<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv0.forward(images);
        let x = self.relu.forward(self.norm0.forward(x));
        let mut x = self.pool0.forward(x);

        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if let Some(transition) = self.transitions.get(i) {
                x = transition.forward(x);
            }
        }

        self.relu.forward(self.norm_final.forward(x))
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    /// Replaces the weights with a record saved by [`CompactRecorder`]
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> xray_core::Result<Self> {
        if !path.exists() && !path.with_extension("mpk").exists() {
            return Err(xray_core::Error::NotFound(format!(
                "pretrained weights {}",
                path.display()
            )));
        }

        self.load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|e| {
                xray_core::Error::Model(format!(
                    "Failed to load pretrained weights {}: {e:?}",
                    path.display()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn tiny() -> DenseNetConfig {
        DenseNetConfig::new(vec![2, 2])
            .with_growth_rate(4)
            .with_num_init_features(8)
            .with_bn_size(2)
    }

    #[test]
    fn test_feature_counts() {
        assert_eq!(DenseNetConfig::densenet121().num_features(), 1024);
        assert_eq!(DenseNetConfig::densenet169().num_features(), 1664);
        assert_eq!(DenseNetConfig::densenet201().num_features(), 1920);
        // 8 + 2*4 = 16 -> 8, then 8 + 2*4 = 16
        assert_eq!(tiny().num_features(), 16);
    }

    #[test]
    fn test_for_backbone() {
        let config = DenseNetConfig::for_backbone(Backbone::DenseNet169);
        assert_eq!(config.block_config, vec![6, 12, 32, 32]);
        assert_eq!(config.growth_rate, 32);
        assert_eq!(config.num_init_features, 64);
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = tiny().init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = model.forward(input);

        // stem /4, one transition /2
        assert_eq!(output.dims(), [2, 16, 4, 4]);
        assert_eq!(model.num_features(), 16);
    }

    #[test]
    fn test_pretrained_roundtrip() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backbone");

        let source = tiny().init::<TestBackend>(&device);
        source
            .clone()
            .save_file(path.clone(), &CompactRecorder::new())
            .unwrap();

        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let expected = source.forward(input.clone());

        let loaded = tiny()
            .init::<TestBackend>(&device)
            .load_pretrained(&path, &device)
            .unwrap();
        let actual = loaded.forward(input);

        let expected = expected.into_data().to_vec::<f32>().unwrap();
        let actual = actual.into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_pretrained_weights() {
        let device = Default::default();
        let err = tiny()
            .init::<TestBackend>(&device)
            .load_pretrained(Path::new("/nonexistent/weights"), &device)
            .unwrap_err();
        assert!(matches!(err, xray_core::Error::NotFound(_)));
    }
}
