//! Namespace entry and object identifier types.

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Identifier of a file or directory object in the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Create a new ObjectId from a u64.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifier of one fragment (partition) of a directory's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(pub u32);

impl FragmentId {
    /// Create a new FragmentId.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

/// Kind of object a namespace entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Regular file. Scrubbed with a single verify.
    File,
    /// Directory. Owns fragments and is finalized after its children.
    Directory,
}

impl ObjectKind {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, ObjectKind::Directory)
    }

    /// Check if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, ObjectKind::File)
    }
}

/// A named edge from a parent directory to a file or directory object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceEntry {
    /// Entry name (not full path).
    pub name: CompactString,

    /// Target object.
    pub object: ObjectId,

    /// What the target object is.
    pub kind: ObjectKind,
}

impl NamespaceEntry {
    /// Create an entry pointing at a file.
    pub fn file(name: impl Into<CompactString>, object: ObjectId) -> Self {
        Self {
            name: name.into(),
            object,
            kind: ObjectKind::File,
        }
    }

    /// Create an entry pointing at a directory.
    pub fn directory(name: impl Into<CompactString>, object: ObjectId) -> Self {
        Self {
            name: name.into(),
            object,
            kind: ObjectKind::Directory,
        }
    }

    /// Check if this entry points at a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if this entry points at a file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Join this entry's name onto a parent path.
    pub fn child_path(&self, parent: &str) -> String {
        if parent.is_empty() {
            self.name.to_string()
        } else if parent.ends_with('/') {
            format!("{parent}{}", self.name)
        } else {
            format!("{parent}/{}", self.name)
        }
    }
}
