//! Path normalisation and the path ↔ object key mapping.

use crate::error::FsError;

pub const ROOT: &str = "/";

/// Object name used to materialise an otherwise empty directory remotely.
pub const DIRECTORY_MARKER: &str = ".bucketfs-dir";

/// Normalise a filesystem path: leading `/`, no trailing `/`, no empty,
/// `.` or `..` components. The directory marker name is reserved.
pub fn normalize(path: &str) -> Result<String, FsError> {
    let mut normalized = String::with_capacity(path.len() + 1);
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if part == "." || part == ".." || part == DIRECTORY_MARKER || part.contains('\0') {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        normalized.push('/');
        normalized.push_str(part);
    }
    if normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

/// Parent of a normalised path. The root is its own parent.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(pos) => &path[..pos],
    }
}

/// Final component of a normalised path, empty for the root.
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a directory path and a single name, validating the name.
pub fn join(dir: &str, name: &str) -> Result<String, FsError> {
    if name.is_empty() || name.contains('/') {
        return Err(FsError::InvalidPath(format!("{dir}/{name}")));
    }
    if dir == ROOT {
        normalize(&format!("/{name}"))
    } else {
        normalize(&format!("{dir}/{name}"))
    }
}

/// True when `path` is strictly inside directory `dir`.
pub fn is_within(path: &str, dir: &str) -> bool {
    if dir == ROOT {
        return path != ROOT;
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// Rewrite `path` (equal to or inside `from`) so it lives under `to`.
pub fn rebase(path: &str, from: &str, to: &str) -> String {
    if path == from {
        return to.to_string();
    }
    format!("{to}{}", &path[from.len()..])
}

/// Number of components; the root has depth 0.
pub fn depth(path: &str) -> usize {
    if path == ROOT {
        0
    } else {
        path.matches('/').count()
    }
}

/// What a remote key stands for in the namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteKey {
    File(String),
    /// A directory marker (either ours or a `name/` folder object).
    Directory(String),
}

/// Maps filesystem paths onto object keys below an optional prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    /// Empty, or ends with `/`.
    prefix: String,
}

impl KeyMapper {
    pub fn new(prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}/")
        };
        Self { prefix }
    }

    /// Prefix handed to the store when listing the mount.
    pub fn list_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn file_key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path.trim_start_matches('/'))
    }

    pub fn marker_key(&self, dir: &str) -> String {
        if dir == ROOT {
            format!("{}{DIRECTORY_MARKER}", self.prefix)
        } else {
            format!(
                "{}{}/{DIRECTORY_MARKER}",
                self.prefix,
                dir.trim_start_matches('/')
            )
        }
    }

    /// Path for a key produced by [`KeyMapper::file_key`].
    pub fn file_path(&self, key: &str) -> Option<String> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            return None;
        }
        normalize(rest).ok()
    }

    /// Directory path for a key produced by [`KeyMapper::marker_key`].
    pub fn marker_path(&self, key: &str) -> Option<String> {
        match self.classify(key)? {
            RemoteKey::Directory(dir) => Some(dir),
            RemoteKey::File(_) => None,
        }
    }

    /// Interpret a listed key. Keys outside the prefix or that cannot be
    /// expressed as a path yield `None`.
    pub fn classify(&self, key: &str) -> Option<RemoteKey> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        if rest.is_empty() {
            return None;
        }
        if let Some(folder) = rest.strip_suffix('/') {
            return normalize(folder).ok().map(RemoteKey::Directory);
        }
        match rest.rsplit_once('/') {
            Some((dir, DIRECTORY_MARKER)) => normalize(dir).ok().map(RemoteKey::Directory),
            None if rest == DIRECTORY_MARKER => Some(RemoteKey::Directory(ROOT.to_string())),
            _ => normalize(rest).ok().map(RemoteKey::File),
        }
    }
}
