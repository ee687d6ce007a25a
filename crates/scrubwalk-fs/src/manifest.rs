//! Scrub manifests: the recorded state a directory tree is checked against.
//!
//! A manifest maps every path under a root (relative, `/`-separated, with
//! `""` for the root itself) to either a file's size and BLAKE3 hash or a
//! directory's sorted child names.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::Instant;

use blake3::Hasher;
use chrono::{DateTime, Utc};
use jwalk::WalkDir;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use scrubwalk_core::ScrubError;

/// Key of the tree root.
pub const ROOT_KEY: &str = "";

/// Files at or above this size are hashed through a memory map on the rayon pool.
const MMAP_THRESHOLD: u64 = 128 * 1024;

/// Recorded state of one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManifestEntry {
    /// Regular file.
    File {
        /// Size in bytes.
        size: u64,
        /// Hex BLAKE3 digest of the contents.
        hash: String,
    },
    /// Directory and its child names, sorted.
    Directory { children: Vec<String> },
}

impl ManifestEntry {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, ManifestEntry::Directory { .. })
    }
}

/// Recorded state of a whole tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// When the manifest was built.
    pub created_at: DateTime<Utc>,
    /// Path key to recorded state.
    pub entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Walk `root` and record every regular file and directory beneath it.
    ///
    /// Symlinks and special files are not recorded. Any file that cannot be
    /// hashed fails the build.
    pub fn build(root: impl AsRef<Path>) -> Result<Self, ScrubError> {
        let start = Instant::now();
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| ScrubError::io(root, e))?;
        if !root.is_dir() {
            return Err(ScrubError::other(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let mut entries = BTreeMap::new();
        entries.insert(
            ROOT_KEY.to_string(),
            ManifestEntry::Directory {
                children: Vec::new(),
            },
        );
        let mut files: Vec<(String, PathBuf)> = Vec::new();

        let walker = WalkDir::new(&root)
            .sort(true)
            .skip_hidden(false)
            .follow_links(false)
            .min_depth(1);

        for entry_result in walker {
            let entry = match entry_result {
                Ok(e) => e,
                Err(err) => {
                    let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
                    return Err(ScrubError::other(format!(
                        "cannot walk {}: {err}",
                        path.display()
                    )));
                }
            };

            let path = entry.path();
            let Some(key) = relative_key(&root, &path) else {
                continue;
            };
            let file_type = entry.file_type();
            if file_type.is_dir() {
                entries.insert(
                    key.clone(),
                    ManifestEntry::Directory {
                        children: Vec::new(),
                    },
                );
            } else if file_type.is_file() {
                files.push((key.clone(), path));
            } else {
                debug!(path = %path.display(), "Skipping special file");
                continue;
            }

            // Directories are yielded before their contents.
            let (parent, name) = split_key(&key);
            if let Some(ManifestEntry::Directory { children }) = entries.get_mut(parent) {
                children.push(name.to_string());
            }
        }

        let hashed = files
            .into_par_iter()
            .map(|(key, path)| hash_file(&path).map(|(size, hash)| (key, size, hash)))
            .collect::<Result<Vec<_>, _>>()?;
        for (key, size, hash) in hashed {
            entries.insert(key, ManifestEntry::File { size, hash });
        }

        for entry in entries.values_mut() {
            if let ManifestEntry::Directory { children } = entry {
                children.sort();
            }
        }

        let manifest = Self {
            created_at: Utc::now(),
            entries,
        };
        info!(
            root = %root.display(),
            files = manifest.file_count(),
            directories = manifest.dir_count(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Built manifest"
        );
        Ok(manifest)
    }

    /// Read a manifest written by [`Manifest::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScrubError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ScrubError::io(path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| ScrubError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Write the manifest as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ScrubError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| ScrubError::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .map_err(|e| ScrubError::io(path, e.into()))
    }

    /// Recorded state of `key`.
    pub fn get(&self, key: &str) -> Option<&ManifestEntry> {
        self.entries.get(key)
    }

    /// Number of recorded paths, the root included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_dir()).count()
    }

    pub fn dir_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_dir()).count()
    }

    /// Sum of recorded file sizes.
    pub fn total_bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|e| match e {
                ManifestEntry::File { size, .. } => *size,
                ManifestEntry::Directory { .. } => 0,
            })
            .sum()
    }
}

/// Join a child name onto a path key.
pub fn join_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

/// Split a non-root key into its parent key and final name.
fn split_key(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(pos) => (&key[..pos], &key[pos + 1..]),
        None => (ROOT_KEY, key),
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Size and hex BLAKE3 digest of a file.
pub fn hash_file(path: &Path) -> Result<(u64, String), ScrubError> {
    let mut file = File::open(path).map_err(|e| ScrubError::io(path, e))?;
    let size = file.metadata().map_err(|e| ScrubError::io(path, e))?.len();
    let mut hasher = Hasher::new();

    if size >= MMAP_THRESHOLD {
        hasher
            .update_mmap_rayon(path)
            .map_err(|e| ScrubError::io(path, e))?;
    } else {
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let bytes_read = file.read(&mut buffer).map_err(|e| ScrubError::io(path, e))?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
    }

    Ok((size, hasher.finalize().to_hex().to_string()))
}
