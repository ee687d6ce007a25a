//! Filesystem backend for scrubwalk.
//!
//! This crate lets a [`scrubwalk_stack::ScrubStack`] scrub a real directory
//! tree:
//!
//! - **Manifests** - record every file's size and BLAKE3 hash and every
//!   directory's child names, built in parallel with jwalk and rayon
//! - **Backend** - [`FsBackend`] serves directory fragments from the manifest
//!   and verifies objects against the disk, hashing large files off-thread
//!
//! ```rust,ignore
//! use scrubwalk_fs::{FsBackend, FsBackendConfig, Manifest};
//! use scrubwalk_stack::ScrubStack;
//!
//! let manifest = Manifest::build("/srv/data")?;
//! manifest.save("data.manifest.json")?;
//!
//! let backend = FsBackend::open("/srv/data", manifest, FsBackendConfig::default())?;
//! let root = backend.root_entry();
//! let mut stack = ScrubStack::new(backend);
//! stack.enqueue_top(root, true, true, "weekly", |_, outcome| {
//!     println!("{} objects, {} mismatches", outcome.objects_verified, outcome.mismatches);
//! });
//! stack.run_until_idle().await;
//! ```

mod backend;
mod config;
mod manifest;

pub use backend::FsBackend;
pub use config::{FsBackendConfig, FsBackendConfigBuilder};
pub use manifest::{Manifest, ManifestEntry, ROOT_KEY, hash_file, join_key};
