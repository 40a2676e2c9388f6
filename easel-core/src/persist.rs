//! On-disk image output plus a JSON record set describing every saved image.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Local, SecondsFormat};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::PersistError;

/// What the orchestrator knows about an image when it hands it over for saving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub scheduler: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance_scale: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub prompt: String,
    pub negative_prompt: String,
    pub timestamp: String,
    pub filepath: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
}

pub trait ImageStore: Send + Sync {
    fn save(&self, image: &DynamicImage, metadata: &ImageMetadata) -> Result<PathBuf, PersistError>;

    /// Deletes every saved image. Returns how many files were removed.
    fn clear(&self) -> Result<usize, PersistError>;
}

pub struct DiskImageStore {
    dir: PathBuf,
    metadata_file: PathBuf,
}

impl DiskImageStore {
    pub fn new(dir: impl Into<PathBuf>, metadata_file: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            metadata_file: metadata_file.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the record set; a missing or unparsable file counts as empty.
    pub fn records(&self) -> BTreeMap<String, MetadataRecord> {
        let raw = match std::fs::read_to_string(&self.metadata_file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                warn!("could not read {}: {err}", self.metadata_file.display());
                return BTreeMap::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(
                "metadata file {} is corrupt, starting fresh: {err}",
                self.metadata_file.display()
            );
            BTreeMap::new()
        })
    }

    /// Saved images, newest first.
    pub fn entries(&self) -> Vec<(String, MetadataRecord)> {
        let mut entries: Vec<_> = self.records().into_iter().collect();
        entries.sort_by(|(a_name, a), (b_name, b)| {
            b.timestamp.cmp(&a.timestamp).then_with(|| b_name.cmp(a_name))
        });
        entries
    }

    fn write_records(&self, records: &BTreeMap<String, MetadataRecord>) -> Result<(), PersistError> {
        if let Some(parent) = self.metadata_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.metadata_file.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(records)?)?;
        std::fs::rename(&tmp, &self.metadata_file)?;
        Ok(())
    }

    fn next_file_name(&self) -> String {
        let stem = format!("image_{}", Local::now().format("%Y%m%d_%H%M%S"));
        let mut name = format!("{stem}.png");
        let mut counter = 1;
        while self.dir.join(&name).exists() {
            name = format!("{stem}_{counter}.png");
            counter += 1;
        }
        name
    }
}

impl ImageStore for DiskImageStore {
    fn save(&self, image: &DynamicImage, metadata: &ImageMetadata) -> Result<PathBuf, PersistError> {
        std::fs::create_dir_all(&self.dir)?;
        let file_name = self.next_file_name();
        let filepath = self.dir.join(&file_name);
        image.save_with_format(&filepath, ImageFormat::Png)?;

        let mut records = self.records();
        records.insert(
            file_name,
            MetadataRecord {
                prompt: metadata.prompt.clone(),
                negative_prompt: metadata.negative_prompt.clone(),
                timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                filepath: filepath.clone(),
                seed: Some(metadata.seed),
                scheduler: Some(metadata.scheduler.clone()),
                width: Some(metadata.width),
                height: Some(metadata.height),
                steps: Some(metadata.steps),
                guidance_scale: Some(metadata.guidance_scale),
            },
        );
        self.write_records(&records)?;
        debug!("saved {}", filepath.display());
        Ok(filepath)
    }

    fn clear(&self) -> Result<usize, PersistError> {
        let records = self.records();
        let mut removed = 0;
        for record in records.values() {
            match std::fs::remove_file(&record.filepath) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("could not delete {}: {err}", record.filepath.display()),
            }
        }
        self.write_records(&BTreeMap::new())?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn metadata(prompt: &str) -> ImageMetadata {
        ImageMetadata {
            prompt: prompt.to_string(),
            negative_prompt: String::new(),
            seed: 42,
            scheduler: "Euler".to_string(),
            width: 4,
            height: 4,
            steps: 20,
            guidance_scale: 7.5,
        }
    }

    fn image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(4, 4))
    }

    #[test]
    fn saves_png_and_merges_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskImageStore::new(dir.path(), dir.path().join("image_data.json"));

        let first = store.save(&image(), &metadata("a cat")).unwrap();
        let second = store.save(&image(), &metadata("a dog")).unwrap();

        assert_ne!(first, second);
        assert!(first.is_file() && second.is_file());
        let records = store.records();
        assert_eq!(records.len(), 2);
        let name = first.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(records[&name].prompt, "a cat");
        assert_eq!(records[&name].seed, Some(42));
        assert!(chrono::DateTime::parse_from_rfc3339(&records[&name].timestamp).is_ok());
    }

    #[test]
    fn corrupt_metadata_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let metadata_file = dir.path().join("image_data.json");
        std::fs::write(&metadata_file, "{ not json").unwrap();
        let store = DiskImageStore::new(dir.path(), &metadata_file);

        assert!(store.records().is_empty());
        store.save(&image(), &metadata("a cat")).unwrap();
        assert_eq!(store.records().len(), 1);
    }

    #[test]
    fn legacy_records_without_parameters_still_parse() {
        let dir = tempfile::tempdir().unwrap();
        let metadata_file = dir.path().join("image_data.json");
        std::fs::write(
            &metadata_file,
            r#"{"image_20240101_120000.png": {"prompt": "p", "negative_prompt": "",
                "timestamp": "2024-01-01 12:00:00", "filepath": "output/image_20240101_120000.png"}}"#,
        )
        .unwrap();
        let store = DiskImageStore::new(dir.path(), &metadata_file);
        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.seed, None);
    }

    #[test]
    fn clear_removes_files_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskImageStore::new(dir.path(), dir.path().join("image_data.json"));
        let path = store.save(&image(), &metadata("a cat")).unwrap();

        assert_eq!(store.clear().unwrap(), 1);
        assert!(!path.exists());
        assert!(store.entries().is_empty());
    }
}
