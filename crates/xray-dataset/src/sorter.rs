//! On-disk normalization of the raw chest X-ray dump.
//!
//! The raw archive ships as `train/`, `test/` and `val/` folders with
//! upper-case class directories. [`ImageSorter`] flattens that tree, files
//! every image into a class directory by the token in its name, and splits
//! each class into train and test sets under the output directory:
//!
//! ```text
//! <output>/train/{normal,bacteria,virus}/...
//! <output>/test/{normal,bacteria,virus}/...
//! <output>/split_info.json
//! ```
//!
//! Files are moved, never copied or rewritten. Concurrent runs over the same
//! directory are not supported.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use xray_core::{Error, Result, ResultExt, SorterConfig, XrayClass, IMAGE_EXTENSIONS, NUM_CLASSES};

/// Directory whose presence marks an unextracted archive
const EXTRACTION_MARKER: [&str; 2] = ["test", "NORMAL"];

/// Top-level split folders of the raw archive
const ARCHIVE_SPLITS: [&str; 3] = ["train", "test", "val"];

/// Name before a recognized image extension.
///
/// Extensions are matched case-sensitively, so `scan.PNG` is not an image
/// here.
pub fn image_stem(file_name: &str) -> Option<&str> {
    IMAGE_EXTENSIONS.iter().find_map(|ext| {
        file_name
            .strip_suffix(ext)
            .and_then(|rest| rest.strip_suffix('.'))
    })
}

/// Class whose token appears in the name before its image extension.
///
/// Tokens are matched ignoring ASCII case, in label order, so a name carrying
/// several tokens goes to the first class. Returns `None` for names without a
/// token and for files that are not recognized images.
pub fn match_class_token(file_name: &str) -> Option<XrayClass> {
    let stem = image_stem(file_name)?.to_ascii_lowercase();
    XrayClass::ALL
        .into_iter()
        .find(|class| stem.contains(class.token()))
}

/// Moves a file, falling back to copy and delete across filesystems.
///
/// Refuses to overwrite an existing destination.
pub fn move_file(from: &Path, to: &Path) -> Result<()> {
    if to.exists() {
        return Err(Error::AlreadyExists(format!(
            "{} (moving {})",
            to.display(),
            from.display()
        )));
    }

    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Files directly inside `dir`, sorted by name
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// File name of `path`, or `None` when it is not valid UTF-8
fn utf8_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Image counts per class after sorting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortSummary {
    /// Files moved because their name carried the class token, in label order
    pub matched: [usize; NUM_CLASSES],
    /// Token-less images swept into `normal`
    pub fallback: usize,
}

impl SortSummary {
    pub fn total(&self) -> usize {
        self.matched.iter().sum::<usize>() + self.fallback
    }
}

/// Train/test counts of one class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSplit {
    pub class: XrayClass,
    pub train: usize,
    pub test: usize,
}

/// Result of [`ImageSorter::split_files`], also written as `split_info.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub seed: u64,
    pub train_ratio: f64,
    pub classes: Vec<ClassSplit>,
}

impl SplitSummary {
    pub fn total_train(&self) -> usize {
        self.classes.iter().map(|c| c.train).sum()
    }

    pub fn total_test(&self) -> usize {
        self.classes.iter().map(|c| c.test).sum()
    }

    pub fn class(&self, class: XrayClass) -> Option<&ClassSplit> {
        self.classes.iter().find(|c| c.class == class)
    }
}

/// Number of files of an `n`-file class that go to training
pub fn train_count(n: usize, train_ratio: f64) -> usize {
    ((train_ratio * n as f64).round() as usize).min(n)
}

/// Sorts and splits a raw chest X-ray dump on disk
#[derive(Debug, Clone)]
pub struct ImageSorter {
    config: SorterConfig,
}

impl ImageSorter {
    pub fn new(config: SorterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SorterConfig {
        &self.config
    }

    fn image_dir(&self) -> &Path {
        &self.config.image_dir
    }

    /// Flattens the raw archive into `image_dir`.
    ///
    /// Does nothing unless `image_dir/test/NORMAL` exists. Returns the number
    /// of images moved.
    pub fn extract_images(&self) -> Result<usize> {
        self.try_extract_images().during("extract_images")
    }

    fn try_extract_images(&self) -> Result<usize> {
        let root = self.image_dir();
        let marker: PathBuf = EXTRACTION_MARKER.iter().fold(root.to_path_buf(), |p, s| p.join(s));
        if !marker.is_dir() {
            debug!("No {} directory, skipping extraction", marker.display());
            return Ok(0);
        }

        info!("Started image extraction from {}", root.display());

        let nested = nested_images(root)?;
        for path in &nested {
            if let Some(name) = utf8_name(path) {
                move_file(path, &root.join(name))?;
            }
        }

        for split in ARCHIVE_SPLITS {
            let dir = root.join(split);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
        }

        info!("Finished extracting {} images", nested.len());
        Ok(nested.len())
    }

    /// Moves every image in `image_dir` into its class directory.
    ///
    /// Images without a class token are swept into `normal`.
    pub fn sort_images(&self) -> Result<SortSummary> {
        self.try_sort_images().during("sort_images")
    }

    fn try_sort_images(&self) -> Result<SortSummary> {
        let root = self.image_dir();
        info!("Started image sorting into respective classes");

        let mut summary = SortSummary::default();
        for class in XrayClass::ALL {
            let dest = root.join(class.token());
            fs::create_dir_all(&dest)?;

            for path in list_files(root)? {
                let Some(name) = utf8_name(&path) else {
                    continue;
                };
                if match_class_token(name) == Some(class) {
                    move_file(&path, &dest.join(name))?;
                    summary.matched[class.label()] += 1;
                }
            }
            debug!("{} images matched '{}'", summary.matched[class.label()], class);
        }

        let fallback_dir = root.join(XrayClass::Normal.token());
        for path in list_files(root)? {
            let Some(name) = utf8_name(&path) else {
                continue;
            };
            if image_stem(name).is_some() {
                move_file(&path, &fallback_dir.join(name))?;
                summary.fallback += 1;
            }
        }
        if summary.fallback > 0 {
            warn!(
                "{} images carried no class token and were filed as normal",
                summary.fallback
            );
        }

        info!("Finished sorting {} images", summary.total());
        Ok(summary)
    }

    /// Splits every class directory into `output_dir/{train,test}/<class>`.
    ///
    /// The class directories are removed from `image_dir` afterwards.
    pub fn split_files(&self) -> Result<SplitSummary> {
        self.try_split_files().during("split_files")
    }

    fn try_split_files(&self) -> Result<SplitSummary> {
        let root = self.image_dir();
        let output = &self.config.output_dir;
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);

        let mut classes = Vec::with_capacity(NUM_CLASSES);
        for class in XrayClass::ALL {
            let class_dir = root.join(class.token());
            if !class_dir.is_dir() {
                return Err(Error::NotFound(format!(
                    "class directory {}",
                    class_dir.display()
                )));
            }

            let mut files = list_files(&class_dir)?;
            files.shuffle(&mut rng);
            let n_train = train_count(files.len(), self.config.train_ratio);

            let train_dir = output.join("train").join(class.token());
            let test_dir = output.join("test").join(class.token());
            fs::create_dir_all(&train_dir)?;
            fs::create_dir_all(&test_dir)?;

            for (i, path) in files.iter().enumerate() {
                let dest = if i < n_train { &train_dir } else { &test_dir };
                if let Some(name) = path.file_name() {
                    move_file(path, &dest.join(name))?;
                }
            }

            fs::remove_dir_all(&class_dir)?;

            debug!(
                "{}: {} train, {} test",
                class,
                n_train,
                files.len() - n_train
            );
            classes.push(ClassSplit {
                class,
                train: n_train,
                test: files.len() - n_train,
            });
        }

        let summary = SplitSummary {
            seed: self.config.seed,
            train_ratio: self.config.train_ratio,
            classes,
        };
        let info_path = output.join("split_info.json");
        fs::write(&info_path, serde_json::to_string_pretty(&summary)?)?;

        info!(
            "Split files into {} training and {} testing images under {}",
            summary.total_train(),
            summary.total_test(),
            output.display()
        );
        Ok(summary)
    }

    /// Runs extraction, sorting and splitting in order, stopping at the first
    /// failure.
    pub fn initiate_image_sorting(&self) -> Result<SplitSummary> {
        self.extract_images().during("initiate_image_sorting")?;
        self.sort_images().during("initiate_image_sorting")?;
        self.split_files().during("initiate_image_sorting")
    }
}

/// Images inside the subdirectories of `root`, sorted by path.
///
/// Symlinks are not followed.
fn nested_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in WalkDir::new(root).min_depth(2) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() && utf8_name(entry.path()).and_then(image_stem).is_some() {
            images.push(entry.into_path());
        }
    }
    images.sort();
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xray_core::ErrorKind;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn sorter_for(temp: &TempDir) -> ImageSorter {
        ImageSorter::new(SorterConfig {
            image_dir: temp.path().join("chest_xray"),
            output_dir: temp.path().join("artifacts"),
            ..Default::default()
        })
    }

    #[test]
    fn test_image_stem_is_case_sensitive() {
        assert_eq!(image_stem("person1_virus_6.jpeg"), Some("person1_virus_6"));
        assert_eq!(image_stem("a.png"), Some("a"));
        assert_eq!(image_stem("scan.PNG"), None);
        assert_eq!(image_stem("notes.txt"), None);
        assert_eq!(image_stem("png"), None);
    }

    #[test]
    fn test_match_class_token() {
        assert_eq!(match_class_token("person1_bacteria_1.jpeg"), Some(XrayClass::Bacteria));
        assert_eq!(match_class_token("NORMAL2-IM-1427-0001.jpeg"), Some(XrayClass::Normal));
        assert_eq!(match_class_token("Person_Virus_3.jpg"), Some(XrayClass::Virus));
        assert_eq!(match_class_token("IM-0001.jpeg"), None);
        assert_eq!(match_class_token("virus_notes.txt"), None);
        // Token only in the extension part does not count
        assert_eq!(match_class_token("scan.normal"), None);
    }

    #[test]
    fn test_first_token_wins() {
        assert_eq!(match_class_token("virus_bacteria.png"), Some(XrayClass::Bacteria));
        assert_eq!(match_class_token("normal_virus.png"), Some(XrayClass::Normal));
    }

    #[test]
    fn test_train_count_rounds() {
        assert_eq!(train_count(1, 0.8), 1);
        assert_eq!(train_count(2, 0.8), 2);
        assert_eq!(train_count(10, 0.8), 8);
        assert_eq!(train_count(7, 0.8), 6);
        assert_eq!(train_count(0, 0.8), 0);
        assert_eq!(train_count(3, 1.0), 3);
    }

    #[test]
    fn test_move_file_refuses_overwrite() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.png");
        let b = temp.path().join("b.png");
        touch(&a);
        touch(&b);

        let err = move_file(&a, &b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(a.exists());
    }

    #[test]
    fn test_extract_without_marker_is_noop() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("train/PNEUMONIA/person1_bacteria_1.jpeg"));

        assert_eq!(sorter.extract_images().unwrap(), 0);
        assert!(root.join("train/PNEUMONIA/person1_bacteria_1.jpeg").exists());
        assert_eq!(names_in(&root), vec!["train"]);
    }

    #[test]
    fn test_extract_flattens_archive() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("test/NORMAL/IM-0001.jpeg"));
        touch(&root.join("train/PNEUMONIA/person1_virus_6.jpeg"));
        touch(&root.join("val/NORMAL/NORMAL2-IM-1.png"));
        touch(&root.join("train/PNEUMONIA/readme.txt"));
        touch(&root.join("already_here.jpg"));

        let moved = sorter.extract_images().unwrap();

        assert_eq!(moved, 3);
        assert_eq!(
            names_in(&root),
            vec![
                "IM-0001.jpeg",
                "NORMAL2-IM-1.png",
                "already_here.jpg",
                "person1_virus_6.jpeg"
            ]
        );
    }

    #[test]
    fn test_extract_collision_is_wrapped() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("test/NORMAL/IM-0001.jpeg"));
        touch(&root.join("train/NORMAL/IM-0001.jpeg"));

        let err = sorter.extract_images().unwrap_err();
        assert_eq!(err.operation(), Some("extract_images"));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_sort_images_by_token() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("person1_bacteria_1.jpeg"));
        touch(&root.join("person2_VIRUS_3.png"));
        touch(&root.join("NORMAL2-IM-1.jpg"));
        touch(&root.join("IM-0007.jpeg"));
        touch(&root.join("upper.JPG"));
        touch(&root.join("notes.txt"));

        let summary = sorter.sort_images().unwrap();

        assert_eq!(summary.matched, [1, 1, 1]);
        assert_eq!(summary.fallback, 1);
        assert_eq!(names_in(&root.join("bacteria")), vec!["person1_bacteria_1.jpeg"]);
        assert_eq!(names_in(&root.join("virus")), vec!["person2_VIRUS_3.png"]);
        assert_eq!(
            names_in(&root.join("normal")),
            vec!["IM-0007.jpeg", "NORMAL2-IM-1.jpg"]
        );
        assert!(root.join("upper.JPG").exists());
        assert!(root.join("notes.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_sort_leaves_non_utf8_names_in_place() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("person1_bacteria_1.jpeg"));
        let stray = root.join(OsStr::from_bytes(b"notes\xff.txt"));
        touch(&stray);

        let summary = sorter.sort_images().unwrap();

        assert_eq!(summary.matched, [0, 1, 0]);
        assert!(root.join("bacteria/person1_bacteria_1.jpeg").exists());
        assert!(stray.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_extract_does_not_follow_symlinks() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("test/NORMAL/IM-0001.jpeg"));
        std::os::unix::fs::symlink(root.join("test"), root.join("test/NORMAL/loop")).unwrap();

        assert_eq!(sorter.extract_images().unwrap(), 1);
        assert!(root.join("IM-0001.jpeg").exists());
    }

    #[test]
    fn test_split_counts_and_info() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        for i in 0..10 {
            touch(&root.join(format!("normal/n{i}.png")));
        }
        for i in 0..7 {
            touch(&root.join(format!("bacteria/b{i}.png")));
        }
        fs::create_dir_all(root.join("virus")).unwrap();

        let summary = sorter.split_files().unwrap();

        let out = &sorter.config().output_dir;
        assert_eq!(summary.class(XrayClass::Normal).unwrap().train, 8);
        assert_eq!(summary.class(XrayClass::Bacteria).unwrap().train, 6);
        assert_eq!(summary.class(XrayClass::Bacteria).unwrap().test, 1);
        assert_eq!(summary.total_train() + summary.total_test(), 17);
        assert_eq!(names_in(&out.join("train/normal")).len(), 8);
        assert_eq!(names_in(&out.join("test/normal")).len(), 2);
        assert!(names_in(&out.join("test/virus")).is_empty());
        assert!(!root.join("normal").exists());

        let info: SplitSummary =
            serde_json::from_str(&fs::read_to_string(out.join("split_info.json")).unwrap()).unwrap();
        assert_eq!(info, summary);
    }

    #[test]
    fn test_split_is_deterministic() {
        let run = || {
            let temp = TempDir::new().unwrap();
            let sorter = sorter_for(&temp);
            for i in 0..20 {
                touch(&sorter.image_dir().join(format!("normal/n{i:02}.png")));
            }
            fs::create_dir_all(sorter.image_dir().join("bacteria")).unwrap();
            fs::create_dir_all(sorter.image_dir().join("virus")).unwrap();
            sorter.split_files().unwrap();
            names_in(&sorter.config().output_dir.join("test/normal"))
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_split_missing_class_dir() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        fs::create_dir_all(sorter.image_dir().join("normal")).unwrap();

        let err = sorter.split_files().unwrap_err();
        assert_eq!(err.operation(), Some("split_files"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_initiate_image_sorting_end_to_end() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("test/NORMAL/img1.jpeg"));
        touch(&root.join("train/PNEUMONIA/person_bacteria_1.png"));
        touch(&root.join("val/NORMAL/NORMAL2-IM-1.jpg"));

        let summary = sorter.initiate_image_sorting().unwrap();

        let out = &sorter.config().output_dir;
        assert!(out.join("train/bacteria/person_bacteria_1.png").exists());
        assert!(
            out.join("train/normal/NORMAL2-IM-1.jpg").exists()
                || out.join("test/normal/NORMAL2-IM-1.jpg").exists()
        );
        for split in ARCHIVE_SPLITS {
            assert!(!root.join(split).exists());
        }
        assert_eq!(summary.total_train() + summary.total_test(), 3);
        assert!(names_in(&root).is_empty());
    }

    #[test]
    fn test_initiate_stops_at_first_failure() {
        let temp = TempDir::new().unwrap();
        let sorter = sorter_for(&temp);
        let root = sorter.image_dir().to_path_buf();
        touch(&root.join("test/NORMAL/IM-1.jpeg"));
        touch(&root.join("val/NORMAL/IM-1.jpeg"));

        let err = sorter.initiate_image_sorting().unwrap_err();
        assert_eq!(err.operation(), Some("initiate_image_sorting"));
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert!(!root.join("normal").exists());
        assert!(!sorter.config().output_dir.exists());
    }
}
