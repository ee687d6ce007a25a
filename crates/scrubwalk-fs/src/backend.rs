//! [`ScrubBackend`] over a directory tree checked against a [`Manifest`].

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use compact_str::CompactString;
use dashmap::DashMap;
use tracing::{debug, info};

use scrubwalk_core::{FragmentId, NamespaceEntry, ObjectId, ScrubError, VerifyOutcome};
use scrubwalk_stack::{Completer, Fetch, FragmentContents, ScrubBackend};

use crate::config::FsBackendConfig;
use crate::manifest::{Manifest, ManifestEntry, ROOT_KEY, hash_file, join_key};

/// Scrubs a live directory tree against its manifest.
///
/// Every manifest path gets an [`ObjectId`]. Directory fragments are the
/// manifest's sorted child list cut into `fragment_size` chunks and are
/// always served synchronously. Files at or above `async_hash_threshold` are
/// hashed on the rayon pool and verify through their completer.
pub struct FsBackend {
    root: PathBuf,
    manifest: Manifest,
    config: FsBackendConfig,
    /// Path key per object, indexed by `ObjectId`.
    keys: Vec<String>,
    ids: HashMap<String, ObjectId>,
    stamps: Arc<DashMap<String, CompactString>>,
    hashes_offloaded: u64,
}

impl FsBackend {
    /// Open `root` for scrubbing against `manifest`.
    pub fn open(
        root: impl AsRef<Path>,
        manifest: Manifest,
        config: FsBackendConfig,
    ) -> Result<Self, ScrubError> {
        config
            .validate()
            .map_err(|message| ScrubError::InvalidConfig { message })?;
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| ScrubError::io(root, e))?;

        if !manifest.get(ROOT_KEY).is_some_and(ManifestEntry::is_dir) {
            return Err(ScrubError::Corrupt {
                path: root,
                message: "manifest has no root directory".to_string(),
            });
        }

        let keys: Vec<String> = manifest.entries.keys().cloned().collect();
        let ids = keys
            .iter()
            .enumerate()
            .map(|(i, key)| (key.clone(), ObjectId::new(i as u64)))
            .collect();

        info!(
            root = %root.display(),
            objects = keys.len(),
            fragment_size = config.fragment_size,
            "Opened filesystem backend"
        );

        Ok(Self {
            root,
            manifest,
            config,
            keys,
            ids,
            stamps: Arc::new(DashMap::new()),
            hashes_offloaded: 0,
        })
    }

    /// Canonical root of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Namespace entry for the tree root, named by its absolute path.
    pub fn root_entry(&self) -> NamespaceEntry {
        NamespaceEntry::directory(self.root.display().to_string(), self.ids[ROOT_KEY])
    }

    /// Namespace entry for a manifest path, named by its absolute path.
    pub fn entry(&self, key: &str) -> Option<NamespaceEntry> {
        let object = *self.ids.get(key)?;
        let name = self.abs_path(key).display().to_string();
        Some(match self.manifest.get(key)? {
            ManifestEntry::Directory { .. } => NamespaceEntry::directory(name, object),
            ManifestEntry::File { .. } => NamespaceEntry::file(name, object),
        })
    }

    /// Last tag recorded for a manifest path.
    pub fn stamp(&self, key: &str) -> Option<CompactString> {
        self.stamps.get(key).map(|tag| tag.value().clone())
    }

    /// Snapshot of every recorded tag stamp.
    pub fn stamps(&self) -> HashMap<String, CompactString> {
        self.stamps
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Number of file hashes handed to the rayon pool.
    pub fn hashes_offloaded(&self) -> u64 {
        self.hashes_offloaded
    }

    fn key_of(&self, object: ObjectId) -> Result<&str, ScrubError> {
        self.keys
            .get(object.0 as usize)
            .map(String::as_str)
            .ok_or_else(|| ScrubError::other(format!("unknown object {object}")))
    }

    fn abs_path(&self, key: &str) -> PathBuf {
        if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(key)
        }
    }

    fn children_of(&self, key: &str) -> Result<&[String], ScrubError> {
        match self.manifest.get(key) {
            Some(ManifestEntry::Directory { children }) => Ok(children.as_slice()),
            _ => Err(ScrubError::Corrupt {
                path: self.abs_path(key),
                message: "not a directory in the manifest".to_string(),
            }),
        }
    }

    fn load_fragment(&self, dir: ObjectId, frag: FragmentId) -> Result<FragmentContents, ScrubError> {
        let key = self.key_of(dir)?;
        let chunk = self
            .children_of(key)?
            .chunks(self.config.fragment_size)
            .nth(frag.0 as usize)
            .ok_or_else(|| ScrubError::other(format!("fragment {} out of range", frag.0)))?;

        chunk
            .iter()
            .map(|name| {
                let child_key = join_key(key, name);
                let object = self.ids.get(&child_key).copied();
                match (object, self.manifest.get(&child_key)) {
                    (Some(object), Some(ManifestEntry::Directory { .. })) => {
                        Ok(NamespaceEntry::directory(name.as_str(), object))
                    }
                    (Some(object), Some(ManifestEntry::File { .. })) => {
                        Ok(NamespaceEntry::file(name.as_str(), object))
                    }
                    _ => Err(ScrubError::Corrupt {
                        path: self.abs_path(&child_key),
                        message: "listed child has no manifest record".to_string(),
                    }),
                }
            })
            .collect()
    }

    /// Tag to stamp on successful verifies, if stamping applies.
    fn stamp_tag(&self, tag: &str) -> Option<CompactString> {
        (self.config.stamp_tags && !tag.is_empty()).then(|| CompactString::from(tag))
    }
}

impl ScrubBackend for FsBackend {
    fn fragments(&mut self, dir: &NamespaceEntry) -> Result<Vec<FragmentId>, ScrubError> {
        let key = self.key_of(dir.object)?;
        let count = self.children_of(key)?.len();
        let path = self.abs_path(key);
        let metadata = fs::symlink_metadata(&path).map_err(|e| ScrubError::io(&path, e))?;
        if !metadata.is_dir() {
            return Err(ScrubError::Corrupt {
                path,
                message: "expected a directory".to_string(),
            });
        }

        let fragments = count.div_ceil(self.config.fragment_size) as u32;
        Ok((0..fragments).map(FragmentId::new).collect())
    }

    fn fetch_fragment(
        &mut self,
        dir: &NamespaceEntry,
        frag: FragmentId,
        completer: Completer<FragmentContents>,
    ) -> Fetch<Result<FragmentContents, ScrubError>> {
        completer.ready(self.load_fragment(dir.object, frag))
    }

    fn verify(
        &mut self,
        target: &NamespaceEntry,
        tag: &str,
        completer: Completer<VerifyOutcome>,
    ) -> Fetch<Result<VerifyOutcome, ScrubError>> {
        let key = match self.key_of(target.object) {
            Ok(key) => key.to_string(),
            Err(err) => return completer.ready(Err(err)),
        };
        let path = self.abs_path(&key);
        let stamp_tag = self.stamp_tag(tag);

        let result = match self.manifest.get(&key) {
            Some(ManifestEntry::Directory { children }) => verify_directory(&path, children),
            Some(ManifestEntry::File { size, hash }) => {
                match check_file_size(&path, *size) {
                    Ok(None) if *size >= self.config.async_hash_threshold => {
                        self.hashes_offloaded += 1;
                        debug!(path = %path.display(), size, "Hashing off-thread");
                        let expected = hash.clone();
                        let stamps = self.stamps.clone();
                        rayon::spawn(move || {
                            let result = compare_hash(&path, &expected);
                            if let (Some(tag), Ok(_)) = (stamp_tag, &result) {
                                stamps.insert(key, tag);
                            }
                            completer.complete(result);
                        });
                        return Fetch::Pending;
                    }
                    Ok(None) => compare_hash(&path, hash),
                    Ok(Some(mismatch)) => Ok(mismatch),
                    Err(err) => Err(err),
                }
            }
            None => Err(ScrubError::Corrupt {
                path,
                message: "object has no manifest record".to_string(),
            }),
        };

        if let (Some(tag), Ok(_)) = (stamp_tag, &result) {
            self.stamps.insert(key, tag);
        }
        completer.ready(result)
    }
}

/// Cheap checks before hashing. `Ok(None)` means the contents must be hashed.
fn check_file_size(path: &Path, expected: u64) -> Result<Option<VerifyOutcome>, ScrubError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| ScrubError::io(path, e))?;
    if !metadata.is_file() {
        return Ok(Some(VerifyOutcome::mismatch("expected a regular file")));
    }
    if metadata.len() != expected {
        return Ok(Some(VerifyOutcome::mismatch(format!(
            "size {} differs from recorded {expected}",
            metadata.len()
        ))));
    }
    Ok(None)
}

fn compare_hash(path: &Path, expected: &str) -> Result<VerifyOutcome, ScrubError> {
    let (_, actual) = hash_file(path)?;
    if actual == expected {
        Ok(VerifyOutcome::Match)
    } else {
        Ok(VerifyOutcome::mismatch(format!(
            "content hash {actual} differs from recorded {expected}"
        )))
    }
}

/// Compare the on-disk child names of a directory with the recorded ones.
///
/// Symlinks and special files are ignored, as when the manifest is built.
fn verify_directory(path: &Path, recorded: &[String]) -> Result<VerifyOutcome, ScrubError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| ScrubError::io(path, e))?;
    if !metadata.is_dir() {
        return Ok(VerifyOutcome::mismatch("expected a directory"));
    }

    let mut on_disk = BTreeSet::new();
    for entry in fs::read_dir(path).map_err(|e| ScrubError::io(path, e))? {
        let entry = entry.map_err(|e| ScrubError::io(path, e))?;
        let file_type = entry.file_type().map_err(|e| ScrubError::io(entry.path(), e))?;
        if file_type.is_dir() || file_type.is_file() {
            on_disk.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let recorded: BTreeSet<&str> = recorded.iter().map(String::as_str).collect();
    let missing: Vec<&str> = recorded
        .iter()
        .copied()
        .filter(|name| !on_disk.contains(*name))
        .collect();
    let unexpected: Vec<&str> = on_disk
        .iter()
        .map(String::as_str)
        .filter(|name| !recorded.contains(name))
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(VerifyOutcome::Match);
    }

    let mut detail = Vec::new();
    if !missing.is_empty() {
        detail.push(format!("missing [{}]", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        detail.push(format!("unexpected [{}]", unexpected.join(", ")));
    }
    Ok(VerifyOutcome::mismatch(detail.join("; ")))
}
