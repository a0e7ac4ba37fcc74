//! Core type definitions for the chest X-ray pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// File extensions recognized as images. Matching is case-sensitive.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Number of diagnostic classes.
pub const NUM_CLASSES: usize = 3;

/// Diagnostic class of a chest X-ray.
///
/// The declaration order is the label order and the order in which filename
/// tokens are matched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum XrayClass {
    /// No pneumonia
    Normal,
    /// Bacterial pneumonia
    Bacteria,
    /// Viral pneumonia
    Virus,
}

impl XrayClass {
    /// All classes in label order.
    pub const ALL: [XrayClass; NUM_CLASSES] =
        [XrayClass::Normal, XrayClass::Bacteria, XrayClass::Virus];

    /// Filename token and directory name of the class.
    pub fn token(self) -> &'static str {
        match self {
            XrayClass::Normal => "normal",
            XrayClass::Bacteria => "bacteria",
            XrayClass::Virus => "virus",
        }
    }

    /// Integer label used by the model.
    pub fn label(self) -> usize {
        self as usize
    }

    /// Class for an integer label.
    pub fn from_label(label: usize) -> Option<Self> {
        Self::ALL.get(label).copied()
    }

    /// Class for a directory name, exact match.
    pub fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.token() == name)
    }

    /// Directory names in label order.
    pub fn names() -> Vec<String> {
        Self::ALL.iter().map(|c| c.token().to_string()).collect()
    }
}

impl std::fmt::Display for XrayClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

/// Represents an image sample with its label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label (index)
    pub label: usize,
}

impl ImageSample {
    /// Creates a new image sample
    pub fn new(path: PathBuf, label: usize) -> Self {
        Self { path, label }
    }

    /// Class of the sample, if the label is in range
    pub fn class(&self) -> Option<XrayClass> {
        XrayClass::from_label(self.label)
    }
}

/// Image dimensions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Number of channels (e.g., 3 for RGB)
    pub channels: u32,
}

impl ImageDimensions {
    /// Creates new image dimensions
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Standard ImageNet dimensions (224x224x3)
    pub fn imagenet() -> Self {
        Self::new(224, 224, 3)
    }

    /// Total number of values per image
    pub fn total_values(&self) -> usize {
        (self.width * self.height * self.channels) as usize
    }
}

/// A named scalar tagged with a step, as written to a summary sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalarRecord {
    pub name: String,
    pub value: f64,
    pub step: usize,
}

impl ScalarRecord {
    pub fn new(name: impl Into<String>, value: f64, step: usize) -> Self {
        Self {
            name: name.into(),
            value,
            step,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_order_and_labels() {
        assert_eq!(XrayClass::ALL[0], XrayClass::Normal);
        assert_eq!(XrayClass::Bacteria.label(), 1);
        assert_eq!(XrayClass::Virus.label(), 2);
        assert_eq!(XrayClass::from_label(2), Some(XrayClass::Virus));
        assert_eq!(XrayClass::from_label(3), None);
    }

    #[test]
    fn test_class_names() {
        assert_eq!(XrayClass::names(), vec!["normal", "bacteria", "virus"]);
        assert_eq!(XrayClass::from_dir_name("bacteria"), Some(XrayClass::Bacteria));
        assert_eq!(XrayClass::from_dir_name("BACTERIA"), None);
        assert_eq!(XrayClass::Normal.to_string(), "normal");
    }

    #[test]
    fn test_image_sample() {
        let sample = ImageSample::new(PathBuf::from("person1_virus_6.jpeg"), 2);
        assert_eq!(sample.class(), Some(XrayClass::Virus));
    }

    #[test]
    fn test_image_dimensions() {
        let dims = ImageDimensions::imagenet();
        assert_eq!(dims.width, 224);
        assert_eq!(dims.total_values(), 224 * 224 * 3);
    }
}
