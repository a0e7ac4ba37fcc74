//! Chest X-ray dataset preparation and loading.
//!
//! [`sorter`] turns the raw archive into a train/test tree on disk,
//! [`dataset`] streams such a tree into Burn batches.

pub mod dataset;
pub mod loader;
pub mod sorter;

pub use dataset::{
    create_datasets, create_datasets_with, DataIngestion, IngestedData, LoadFailures, SampleStream,
    SampleStreams, StreamOptions, Streams, Subset, XrayBatch, XrayBatcher, XrayDataset, XrayItem,
};
pub use loader::ImageLoader;
pub use sorter::{ImageSorter, SortSummary, SplitSummary};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::dataset::*;
    pub use crate::loader::*;
    pub use crate::sorter::*;
}
