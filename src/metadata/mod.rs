//! # Metadata Module
//!
//! Small persistent `key=value` ledger recording forwarding progress.
//!
//! The file keeps comments (`#...`), blank lines and unknown lines verbatim.
//! Saving is read-merge-rewrite: touched keys are replaced in place, new keys
//! are appended, and the result replaces the old file through a rename so a
//! crash mid-write never leaves a truncated ledger.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Directory under the base path holding the metadata file
pub const CONFIG_DIR: &str = "config";

/// Metadata file name
pub const METADATA_FILE: &str = "meta.txt";

/// Absolute path of the file currently being drained
pub const LAST_UPLOADED_FILE: &str = "LastUploadedFile";

/// Byte offset of the next line to read in that file
pub const LAST_UPLOADED_FILE_OFFSET: &str = "LastUploadedFileOffset";

/// Persistent key-value ledger with an in-memory overlay
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    lines: Vec<String>,
    meta: HashMap<String, String>,
    loaded: bool,
}

impl MetadataStore {
    /// Create a store for `<base_dir>/config/meta.txt` without touching disk
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self::at(base_dir.as_ref().join(CONFIG_DIR).join(METADATA_FILE))
    }

    /// Create a store for an explicit metadata file path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lines: Vec::new(),
            meta: HashMap::new(),
            loaded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the metadata file into the line buffer and overlay
    ///
    /// A missing file loads as empty.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MetadataIo` if the file cannot be read
    pub fn load(&mut self) -> Result<&HashMap<String, String>> {
        self.lines = self.read_lines()?;
        self.meta = parse_lines(&self.lines);
        self.loaded = true;
        Ok(&self.meta)
    }

    /// Merge `new_meta` into the line buffer
    ///
    /// Existing keys are replaced on their own line, every occurrence if a
    /// key is repeated; unseen keys are appended in the order given.
    /// Comments and blank lines are untouched.
    pub fn merge(&mut self, new_meta: &[(&str, String)]) {
        for (key, value) in new_meta {
            let entry = format!("{}={}", key, value);
            let mut found = false;
            for line in self.lines.iter_mut().filter(|line| line_key(line) == Some(*key)) {
                *line = entry.clone();
                found = true;
            }
            if !found {
                self.lines.push(entry);
            }
            self.meta.insert((*key).to_string(), value.clone());
        }
    }

    /// Merge `new_meta` with the on-disk content and rewrite the file
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::MetadataIo` on any read or write failure; the
    /// previous file is left intact in that case
    pub fn save(&mut self, new_meta: &[(&str, String)]) -> Result<()> {
        self.lines = self.read_lines()?;
        self.meta = parse_lines(&self.lines);
        self.loaded = true;
        self.merge(new_meta);
        self.write_atomic()?;
        debug!("Saved {} metadata key(s) to {}", new_meta.len(), self.path.display());
        Ok(())
    }

    /// Look up a key, loading from disk on first use
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        if !self.loaded {
            self.load()?;
        }
        Ok(self.meta.get(key).cloned())
    }

    /// Look up a key as an unsigned integer
    ///
    /// Missing, empty or non-numeric values read as `None`.
    pub fn get_u64(&mut self, key: &str) -> Result<Option<u64>> {
        Ok(self.get(key)?.and_then(|v| v.parse().ok()))
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(self.io_err(source)),
        }
    }

    fn write_atomic(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let mut contents = self.lines.join("\n");
        contents.push('\n');

        let write = || -> io::Result<()> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, &self.path)
        };
        write().map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: io::Error) -> GatewayError {
        GatewayError::MetadataIo {
            path: self.path.clone(),
            source,
        }
    }
}

/// Key of a `key=value` line, or `None` for comments, blanks and junk
fn line_key(line: &str) -> Option<&str> {
    if line.starts_with('#') {
        return None;
    }
    line.split_once('=').map(|(k, _)| k.trim())
}

fn parse_lines(lines: &[String]) -> HashMap<String, String> {
    lines
        .iter()
        .filter_map(|line| {
            let key = line_key(line)?;
            let (_, value) = line.split_once('=')?;
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}
