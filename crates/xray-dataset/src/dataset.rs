//! Burn dataset, batcher and sample streams for class-partitioned X-ray trees.
//!
//! A stream root must contain exactly the `normal`, `bacteria` and `virus`
//! directories. Images are resized to the configured dimensions and kept as
//! RGB values in `[0, 255]`; normalization belongs to the model.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info};
use xray_core::{
    DataConfig, Error, ImageDimensions, ImageSample, Result, ResultExt, XrayClass, NUM_CLASSES,
};

use crate::loader::ImageLoader;

/// Batch size of every stream
pub const BATCH_SIZE: usize = 32;

/// Side length images are resized to
pub const IMAGE_SIZE: u32 = 224;

/// Seed of the sample and per-epoch shuffles
pub const SHUFFLE_SEED: u64 = 42;

/// A decoded image ready for batching
#[derive(Clone, Debug)]
pub struct XrayItem {
    /// CHW pixel values in `[0, 255]`
    pub image: Vec<f32>,
    /// Class index
    pub label: usize,
    pub path: PathBuf,
}

impl XrayItem {
    pub fn from_sample(sample: &ImageSample, dims: ImageDimensions) -> Result<Self> {
        let loader = ImageLoader::new("");
        Ok(Self {
            image: loader.load_pixels(&sample.path, dims)?,
            label: sample.label,
            path: sample.path.clone(),
        })
    }
}

/// First image that failed to load during the current epoch, shared between
/// a dataset and the stream reading it
#[derive(Debug, Clone, Default)]
pub struct LoadFailures {
    first: Arc<Mutex<Option<String>>>,
}

impl LoadFailures {
    fn record(&self, message: String) {
        if let Ok(mut first) = self.first.lock() {
            first.get_or_insert(message);
        }
    }

    /// Clears and returns the recorded failure
    pub fn take(&self) -> Option<String> {
        self.first.lock().ok().and_then(|mut first| first.take())
    }
}

/// Lazily decoded dataset over a list of samples.
///
/// Burn ends an epoch at the first `None`, so a sample that fails to decode
/// is recorded in [`LoadFailures`] for the reading stream to report.
#[derive(Debug, Clone)]
pub struct XrayDataset {
    samples: Vec<ImageSample>,
    dims: ImageDimensions,
    failures: LoadFailures,
}

impl XrayDataset {
    pub fn new(samples: Vec<ImageSample>, dims: ImageDimensions) -> Self {
        Self {
            samples,
            dims,
            failures: LoadFailures::default(),
        }
    }

    pub fn failures(&self) -> &LoadFailures {
        &self.failures
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    /// Number of samples per class, in label order
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0; NUM_CLASSES];
        for sample in &self.samples {
            if sample.label < NUM_CLASSES {
                counts[sample.label] += 1;
            }
        }
        counts
    }
}

impl Dataset<XrayItem> for XrayDataset {
    fn get(&self, index: usize) -> Option<XrayItem> {
        let sample = self.samples.get(index)?;
        match XrayItem::from_sample(sample, self.dims) {
            Ok(item) => Some(item),
            Err(e) => {
                error!("Failed to load {}: {e}", sample.path.display());
                self.failures.record(e.to_string());
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of X-ray images
#[derive(Clone, Debug)]
pub struct XrayBatch<B: Backend> {
    /// Images with shape `[batch, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// Class indices with shape `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

impl<B: AutodiffBackend> XrayBatch<B> {
    /// The same batch detached onto the inner backend
    pub fn inner(self) -> XrayBatch<B::InnerBackend> {
        XrayBatch {
            images: self.images.inner(),
            targets: self.targets.inner(),
        }
    }
}

/// Stacks decoded items into an [`XrayBatch`]
#[derive(Clone, Debug)]
pub struct XrayBatcher {
    dims: ImageDimensions,
}

impl XrayBatcher {
    pub fn new(dims: ImageDimensions) -> Self {
        Self { dims }
    }
}

impl<B: Backend> Batcher<B, XrayItem, XrayBatch<B>> for XrayBatcher {
    fn batch(&self, items: Vec<XrayItem>, device: &B::Device) -> XrayBatch<B> {
        let batch_size = items.len();
        let (height, width) = (self.dims.height as usize, self.dims.width as usize);

        let pixels: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(pixels, [batch_size, 3, height, width]),
            device,
        );

        let labels: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        XrayBatch { images, targets }
    }
}

/// Loading parameters shared by every stream of a run
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub batch_size: usize,
    pub image_size: ImageDimensions,
    pub seed: u64,
    /// Prefetch threads; more than one interleaves batches nondeterministically
    pub num_workers: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            image_size: ImageDimensions::new(IMAGE_SIZE, IMAGE_SIZE, 3),
            seed: SHUFFLE_SEED,
            num_workers: 1,
        }
    }
}

impl From<&DataConfig> for StreamOptions {
    fn from(config: &DataConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            image_size: config.image_size,
            seed: config.seed,
            num_workers: config.num_workers,
        }
    }
}

/// Which part of a split tree to stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subset {
    Training,
    Validation,
    Both,
}

/// Shuffled, batched, prefetched view over a sample list
#[derive(Clone)]
pub struct SampleStream<B: Backend> {
    loader: Arc<dyn DataLoader<B, XrayBatch<B>>>,
    failures: LoadFailures,
    samples: Vec<ImageSample>,
    batch_size: usize,
}

impl<B: Backend> SampleStream<B> {
    pub fn new(samples: Vec<ImageSample>, options: &StreamOptions, device: &B::Device) -> Self {
        let dataset = XrayDataset::new(samples.clone(), options.image_size);
        let failures = dataset.failures().clone();
        let loader: Arc<dyn DataLoader<B, XrayBatch<B>>> =
            DataLoaderBuilder::new(XrayBatcher::new(options.image_size))
                .batch_size(options.batch_size)
                .shuffle(options.seed)
                .num_workers(options.num_workers.max(1))
                .set_device(device.clone())
                .build(dataset);

        Self {
            loader,
            failures,
            samples,
            batch_size: options.batch_size,
        }
    }

    /// One epoch of batches. Each call advances the shuffle.
    ///
    /// An epoch that ends before every sample was yielded finishes with a
    /// `Dataset` error naming the image that failed to load.
    pub fn iter(&self) -> impl Iterator<Item = Result<XrayBatch<B>>> + '_ {
        self.failures.take();
        let expected = self.samples.len();
        let mut batches = self.loader.iter();
        let mut seen = 0;
        let mut finished = false;

        std::iter::from_fn(move || {
            if finished {
                return None;
            }
            match batches.next() {
                Some(batch) => {
                    seen += batch.targets.dims()[0];
                    Some(Ok(batch))
                }
                None => {
                    finished = true;
                    (seen < expected).then(|| {
                        let cause = self
                            .failures
                            .take()
                            .unwrap_or_else(|| "no load error recorded".into());
                        Err(Error::Dataset(format!(
                            "epoch ended after {seen} of {expected} samples: {cause}"
                        )))
                    })
                }
            }
        })
    }

    /// Samples in their pre-shuffle order
    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|s| s.label).collect()
    }
}

impl<B: Backend> std::fmt::Debug for SampleStream<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleStream")
            .field("len", &self.samples.len())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Training and validation streams cut from one tree
#[derive(Debug, Clone)]
pub struct SampleStreams<B: Backend> {
    pub train: SampleStream<B>,
    pub validation: SampleStream<B>,
}

/// Result of [`create_datasets`]
#[derive(Debug, Clone)]
pub enum Streams<B: Backend> {
    Single(SampleStream<B>),
    Pair(SampleStreams<B>),
}

impl<B: Backend> Streams<B> {
    pub fn into_single(self) -> Result<SampleStream<B>> {
        match self {
            Streams::Single(stream) => Ok(stream),
            Streams::Pair(_) => Err(Error::InvalidArgument(
                "expected a single stream, got a train/validation pair".into(),
            )),
        }
    }

    pub fn into_pair(self) -> Result<SampleStreams<B>> {
        match self {
            Streams::Pair(pair) => Ok(pair),
            Streams::Single(_) => Err(Error::InvalidArgument(
                "expected a train/validation pair, got a single stream".into(),
            )),
        }
    }
}

/// Lists, checks and shuffles the samples below `path`.
///
/// The order depends only on the directory contents and `seed`.
pub fn collect_samples(path: &Path, seed: u64) -> Result<Vec<ImageSample>> {
    let loader = ImageLoader::new(path);

    let found = loader.subdirectories(Path::new(""))?;
    let mut expected = XrayClass::names();
    expected.sort();
    if found != expected {
        return Err(Error::Config(format!(
            "{} must contain exactly the class directories {:?}, found {:?}",
            path.display(),
            XrayClass::names(),
            found
        )));
    }

    let mut samples = Vec::new();
    for class in XrayClass::ALL {
        samples.extend(loader.load_class_directory(Path::new(""), class)?);
    }
    // Sample paths already include the root
    let reader = ImageLoader::new("");
    for sample in &samples {
        reader.load_image(&sample.path)?;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    samples.shuffle(&mut rng);
    Ok(samples)
}

/// Splits shuffled samples into `(training, validation)`.
///
/// Validation gets the last `floor(split * n)` samples.
pub fn split_samples(
    mut samples: Vec<ImageSample>,
    split: f64,
) -> (Vec<ImageSample>, Vec<ImageSample>) {
    let n_validation = (split * samples.len() as f64).floor() as usize;
    let validation = samples.split_off(samples.len() - n_validation.min(samples.len()));
    (samples, validation)
}

/// Builds sample streams over a class-partitioned directory with the fixed
/// pipeline settings (batch 32, 224x224 RGB, seed 42).
///
/// `split` and `subset` go together: both unset gives one stream over every
/// sample, both set gives the requested part of a training/validation split.
pub fn create_datasets<B: Backend>(
    path: impl AsRef<Path>,
    split: Option<f64>,
    subset: Option<Subset>,
    device: &B::Device,
) -> Result<Streams<B>> {
    create_datasets_with(path, split, subset, &StreamOptions::default(), device)
}

/// [`create_datasets`] with explicit loading parameters
pub fn create_datasets_with<B: Backend>(
    path: impl AsRef<Path>,
    split: Option<f64>,
    subset: Option<Subset>,
    options: &StreamOptions,
    device: &B::Device,
) -> Result<Streams<B>> {
    build_streams(path.as_ref(), split, subset, options, device).during("create_datasets")
}

fn build_streams<B: Backend>(
    path: &Path,
    split: Option<f64>,
    subset: Option<Subset>,
    options: &StreamOptions,
    device: &B::Device,
) -> Result<Streams<B>> {
    if options.batch_size == 0 {
        return Err(Error::InvalidArgument("batch size must be positive".into()));
    }

    let samples = collect_samples(path, options.seed)?;
    debug!("Found {} images under {}", samples.len(), path.display());

    let streams = match (split, subset) {
        (None, None) => Streams::Single(SampleStream::new(samples, options, device)),
        (Some(split), Some(subset)) => {
            if !(0.0..1.0).contains(&split) {
                return Err(Error::InvalidArgument(format!(
                    "validation split must be within [0, 1), got {split}"
                )));
            }
            let (train, validation) = split_samples(samples, split);
            info!(
                "Using {} files for training and {} for validation",
                train.len(),
                validation.len()
            );
            match subset {
                Subset::Training => Streams::Single(SampleStream::new(train, options, device)),
                Subset::Validation => {
                    Streams::Single(SampleStream::new(validation, options, device))
                }
                Subset::Both => Streams::Pair(SampleStreams {
                    train: SampleStream::new(train, options, device),
                    validation: SampleStream::new(validation, options, device),
                }),
            }
        }
        (split, subset) => {
            return Err(Error::InvalidArgument(format!(
                "split and subset must be set together, got split {split:?} and subset {subset:?}"
            )))
        }
    };

    Ok(streams)
}

/// Streams of a full run
#[derive(Debug, Clone)]
pub struct IngestedData<B: Backend> {
    pub train: SampleStream<B>,
    pub validation: SampleStream<B>,
    pub test: SampleStream<B>,
}

/// Loads the training tree with a validation split and the test tree whole
#[derive(Debug, Clone, Default)]
pub struct DataIngestion {
    config: DataConfig,
}

impl DataIngestion {
    pub fn new(config: DataConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn initiate_data_ingestion<B: Backend>(&self, device: &B::Device) -> Result<IngestedData<B>> {
        info!("Started data ingestion");
        let options = StreamOptions::from(&self.config);

        let SampleStreams { train, validation } = create_datasets_with(
            &self.config.train_dir,
            Some(self.config.validation_split),
            Some(Subset::Both),
            &options,
            device,
        )
        .and_then(Streams::into_pair)
        .during("initiate_data_ingestion")?;

        let test = create_datasets_with(&self.config.test_dir, None, None, &options, device)
            .and_then(Streams::into_single)
            .during("initiate_data_ingestion")?;

        info!(
            "Loaded {} training, {} validation and {} test images",
            train.len(),
            validation.len(),
            test.len()
        );
        Ok(IngestedData {
            train,
            validation,
            test,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use std::fs;
    use tempfile::TempDir;
    use xray_core::ErrorKind;

    type TestBackend = NdArray<f32>;

    fn write_image(path: &Path, shade: u8) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let img = image::ImageBuffer::from_fn(12, 10, |_, _| image::Rgb([shade, shade, shade]));
        img.save(path).unwrap();
    }

    /// Tree with `per_class` images in each class directory
    fn class_tree(root: &Path, per_class: usize) {
        for class in XrayClass::ALL {
            for i in 0..per_class {
                let shade = (class.label() * 100 + i) as u8;
                write_image(&root.join(class.token()).join(format!("{class}_{i}.png")), shade);
            }
        }
    }

    fn small_options() -> StreamOptions {
        StreamOptions {
            batch_size: 4,
            image_size: ImageDimensions::new(8, 8, 3),
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_missing_class_dir() {
        let temp = TempDir::new().unwrap();
        write_image(&temp.path().join("normal/a.png"), 0);
        write_image(&temp.path().join("virus/b.png"), 0);

        let device = Default::default();
        let err = create_datasets::<TestBackend>(temp.path(), None, None, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.operation(), Some("create_datasets"));
    }

    #[test]
    fn test_rejects_extra_dir() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 1);
        fs::create_dir(temp.path().join("covid")).unwrap();

        let device = Default::default();
        let err = create_datasets::<TestBackend>(temp.path(), None, None, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_split_and_subset_must_match() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 1);

        let device = Default::default();
        let err = create_datasets::<TestBackend>(temp.path(), Some(0.2), None, &device).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_split_samples_takes_validation_from_tail() {
        let samples: Vec<_> = (0..10)
            .map(|i| ImageSample::new(PathBuf::from(format!("{i}.png")), 0))
            .collect();
        let (train, validation) = split_samples(samples.clone(), 0.2);
        assert_eq!(train.len(), 8);
        assert_eq!(validation, samples[8..].to_vec());

        let (train, validation) = split_samples(samples, 0.25);
        assert_eq!((train.len(), validation.len()), (8, 2));
    }

    #[test]
    fn test_training_and_validation_partition_samples() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 4);
        let device = Default::default();
        let options = small_options();

        let pair = create_datasets_with::<TestBackend>(
            temp.path(),
            Some(0.2),
            Some(Subset::Both),
            &options,
            &device,
        )
        .unwrap()
        .into_pair()
        .unwrap();

        assert_eq!(pair.train.len(), 10);
        assert_eq!(pair.validation.len(), 2);

        let only_validation = create_datasets_with::<TestBackend>(
            temp.path(),
            Some(0.2),
            Some(Subset::Validation),
            &options,
            &device,
        )
        .unwrap()
        .into_single()
        .unwrap();
        assert_eq!(only_validation.samples(), pair.validation.samples());

        let mut all: Vec<_> = pair
            .train
            .samples()
            .iter()
            .chain(pair.validation.samples())
            .map(|s| s.path.clone())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 12);
    }

    #[test]
    fn test_same_arguments_same_order() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 3);
        let device = Default::default();
        let options = small_options();

        let first_labels = |stream: &SampleStream<TestBackend>| -> Vec<i64> {
            stream
                .iter()
                .flat_map(|batch| batch.unwrap().targets.into_data().to_vec::<i64>().unwrap())
                .collect()
        };

        let a = create_datasets_with::<TestBackend>(temp.path(), None, None, &options, &device)
            .unwrap()
            .into_single()
            .unwrap();
        let b = create_datasets_with::<TestBackend>(temp.path(), None, None, &options, &device)
            .unwrap()
            .into_single()
            .unwrap();

        assert_eq!(a.samples(), b.samples());
        assert_eq!(first_labels(&a), first_labels(&b));
    }

    #[test]
    fn test_batches_keep_raw_pixel_range() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 2);
        let device = Default::default();

        let stream = create_datasets_with::<TestBackend>(
            temp.path(),
            None,
            None,
            &small_options(),
            &device,
        )
        .unwrap()
        .into_single()
        .unwrap();

        assert_eq!(stream.num_batches(), 2);
        let batches = stream.iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].images.dims(), [4, 3, 8, 8]);
        assert_eq!(batches[1].targets.dims(), [2]);

        let max = batches[1].images.clone().max().into_scalar();
        assert!(max <= 255.0);
        assert!(max >= 1.0);
    }

    fn truncate(path: &Path) {
        let bytes = fs::read(path).unwrap();
        fs::write(path, &bytes[..bytes.len() - 16]).unwrap();
    }

    #[test]
    fn test_truncated_image_fails_creation() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 4);
        truncate(&temp.path().join("bacteria/bacteria_0.png"));

        let device = Default::default();
        let err = create_datasets_with::<TestBackend>(temp.path(), None, None, &small_options(), &device)
            .unwrap_err();
        assert_eq!(err.operation(), Some("create_datasets"));
        assert_eq!(err.kind(), ErrorKind::Image);
    }

    #[test]
    fn test_epoch_yields_every_sample_or_fails() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 4);
        let device = Default::default();

        let stream = create_datasets_with::<TestBackend>(temp.path(), None, None, &small_options(), &device)
            .unwrap()
            .into_single()
            .unwrap();
        let yielded: usize = stream
            .iter()
            .map(|batch| batch.unwrap().targets.dims()[0])
            .sum();
        assert_eq!(yielded, stream.len());

        truncate(&temp.path().join("bacteria/bacteria_0.png"));
        let results: Vec<_> = stream.iter().collect();
        let yielded: usize = results
            .iter()
            .filter_map(|batch| batch.as_ref().ok())
            .map(|batch| batch.targets.dims()[0])
            .sum();
        assert!(yielded < stream.len());

        let err = results.into_iter().last().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Dataset);
        assert!(err.to_string().contains("bacteria_0.png"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_does_not_repeat_samples() {
        let temp = TempDir::new().unwrap();
        class_tree(temp.path(), 1);
        let normal = temp.path().join("normal");
        std::os::unix::fs::symlink(&normal, normal.join("loop")).unwrap();

        let samples = collect_samples(temp.path(), SHUFFLE_SEED).unwrap();
        assert_eq!(samples.len(), 3);
    }

    #[test]
    fn test_class_counts() {
        let samples = vec![
            ImageSample::new(PathBuf::from("a.png"), 0),
            ImageSample::new(PathBuf::from("b.png"), 2),
            ImageSample::new(PathBuf::from("c.png"), 2),
        ];
        let dataset = XrayDataset::new(samples, ImageDimensions::new(8, 8, 3));
        assert_eq!(dataset.class_counts(), [1, 0, 2]);
        assert_eq!(dataset.len(), 3);
    }

    #[test]
    fn test_data_ingestion() {
        let temp = TempDir::new().unwrap();
        class_tree(&temp.path().join("images/train"), 5);
        class_tree(&temp.path().join("images/test"), 1);

        let ingestion = DataIngestion::new(DataConfig {
            train_dir: temp.path().join("images/train"),
            test_dir: temp.path().join("images/test"),
            image_size: ImageDimensions::new(8, 8, 3),
            batch_size: 4,
            ..Default::default()
        });

        let device = Default::default();
        let data = ingestion.initiate_data_ingestion::<TestBackend>(&device).unwrap();
        assert_eq!(data.train.len(), 12);
        assert_eq!(data.validation.len(), 3);
        assert_eq!(data.test.len(), 3);
    }

    #[test]
    fn test_data_ingestion_missing_tree() {
        let temp = TempDir::new().unwrap();
        let ingestion = DataIngestion::new(DataConfig {
            train_dir: temp.path().join("nope"),
            ..Default::default()
        });

        let device = Default::default();
        let err = ingestion
            .initiate_data_ingestion::<TestBackend>(&device)
            .unwrap_err();
        assert_eq!(err.operation(), Some("initiate_data_ingestion"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
