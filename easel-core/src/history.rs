//! Recently used prompt pairs, most recent first.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::HistoryError;

pub const DEFAULT_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptEntry {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
}

impl PromptEntry {
    pub fn new(prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptHistory {
    entries: VecDeque<PromptEntry>,
    capacity: usize,
}

impl Default for PromptHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl PromptHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Adds `entry` at the front, evicting the oldest entry when full. Returns `false` and leaves
    /// the history untouched if the identical pair is already present.
    pub fn add(&mut self, entry: PromptEntry) -> bool {
        if self.capacity == 0 || self.entries.contains(&entry) {
            return false;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(entry);
        true
    }

    pub fn entries(&self) -> impl Iterator<Item = &PromptEntry> {
        self.entries.iter()
    }

    pub fn find(&self, prompt: &str) -> Option<&PromptEntry> {
        self.entries.iter().find(|entry| entry.prompt == prompt)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn extend_oldest(&mut self, entries: Vec<PromptEntry>) {
        for entry in entries {
            if self.entries.len() == self.capacity {
                break;
            }
            if !self.entries.contains(&entry) {
                self.entries.push_back(entry);
            }
        }
    }
}

/// A `PromptHistory` mirrored to a JSON list on disk.
#[derive(Debug)]
pub struct PromptHistoryStore {
    history: PromptHistory,
    path: PathBuf,
}

impl PromptHistoryStore {
    /// Loads the history from `path`. A missing or corrupt file yields an empty history.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let mut history = PromptHistory::with_capacity(capacity);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<PromptEntry>>(&raw) {
                Ok(entries) => history.extend_oldest(entries),
                Err(err) => warn!("prompt history {} is corrupt: {err}", path.display()),
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("could not read prompt history {}: {err}", path.display()),
        }
        Self { history, path }
    }

    /// Adds the pair and persists the list when it changed.
    pub fn add(&mut self, entry: PromptEntry) -> Result<bool, HistoryError> {
        let added = self.history.add(entry);
        if added {
            self.save()?;
        }
        Ok(added)
    }

    pub fn clear(&mut self) -> Result<(), HistoryError> {
        self.history.clear();
        self.save()
    }

    pub fn history(&self) -> &PromptHistory {
        &self.history
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries: Vec<&PromptEntry> = self.history.entries().collect();
        std::fs::write(&self.path, serde_json::to_vec_pretty(&entries)?)?;
        Ok(())
    }
}
