//! Image discovery and decoding.
//!
//! Directory scans here accept the recognized extensions in any case. The
//! sorter applies its own, stricter, name rules.

use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use xray_core::{Error, ImageDimensions, ImageSample, Result, XrayClass, IMAGE_EXTENSIONS};

/// Whether `path` carries a recognized image extension, ignoring case.
pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Image loader rooted at a dataset directory
pub struct ImageLoader {
    root_dir: PathBuf,
}

impl ImageLoader {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Resolves `path` against the root unless it is absolute
    pub fn full_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    /// Decodes an image
    pub fn load_image(&self, path: &Path) -> Result<DynamicImage> {
        let full_path = self.full_path(path);

        if !full_path.exists() {
            return Err(Error::NotFound(format!(
                "Image file not found: {}",
                full_path.display()
            )));
        }

        ImageReader::open(&full_path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| Error::Image(format!("Failed to load image {}: {e}", full_path.display())))
    }

    /// Decodes, converts to RGB and resizes an image, returning CHW pixel
    /// values in `[0, 255]`
    pub fn load_pixels(&self, path: &Path, dims: ImageDimensions) -> Result<Vec<f32>> {
        let rgb = self
            .load_image(path)?
            .resize_exact(dims.width, dims.height, FilterType::Triangle)
            .to_rgb8();

        let (width, height) = (dims.width as usize, dims.height as usize);
        let plane = width * height;
        let mut pixels = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for c in 0..3 {
                pixels[c * plane + offset] = pixel[c] as f32;
            }
        }

        Ok(pixels)
    }

    fn checked_dir(&self, dir: &Path) -> Result<PathBuf> {
        let full_dir = self.full_path(dir);

        if !full_dir.exists() {
            return Err(Error::NotFound(format!(
                "Directory not found: {}",
                full_dir.display()
            )));
        }

        if !full_dir.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "Path is not a directory: {}",
                full_dir.display()
            )));
        }

        Ok(full_dir)
    }

    /// Image files directly inside `dir`, sorted by path
    pub fn scan_directory(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let full_dir = self.checked_dir(dir)?;

        let mut images = Vec::new();
        for entry in std::fs::read_dir(&full_dir)? {
            let path = entry?.path();
            if path.is_file() && has_image_extension(&path) {
                images.push(path);
            }
        }

        images.sort();
        Ok(images)
    }

    /// Image files anywhere below `dir`, sorted by path.
    ///
    /// Symlinks are not followed, so a link cycle cannot repeat files.
    pub fn scan_directory_recursive(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let full_dir = self.checked_dir(dir)?;

        let mut images = Vec::new();
        for entry in WalkDir::new(&full_dir).min_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_file() && has_image_extension(entry.path()) {
                images.push(entry.into_path());
            }
        }

        images.sort();
        Ok(images)
    }

    /// Names of the immediate subdirectories of `dir`, sorted
    pub fn subdirectories(&self, dir: &Path) -> Result<Vec<String>> {
        let full_dir = self.checked_dir(dir)?;

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&full_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();
        Ok(names)
    }

    /// Every image below `<dir>/<class>` labelled with that class
    pub fn load_class_directory(&self, dir: &Path, class: XrayClass) -> Result<Vec<ImageSample>> {
        let images = self.scan_directory_recursive(&dir.join(class.token()))?;

        Ok(images
            .into_iter()
            .map(|path| ImageSample::new(path, class.label()))
            .collect())
    }
}
