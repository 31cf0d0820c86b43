use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{ApiError, ApiResult};

/// URL prefix under which the storage root is served.
pub const PUBLIC_PREFIX: &str = "/storage";

/// Attempts before giving up on a free sequence number
const MAX_SEQUENCE_ATTEMPTS: u32 = 16;

/// Public disk rooted at a local directory.
///
/// Every path handed in is relative to the root. Paths that try to leave the
/// root (`..`, absolute, drive prefixes) are rejected.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, relative: &str) -> ApiResult<PathBuf> {
        let rel = Path::new(relative);
        let clean = !relative.is_empty()
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(ApiError::Storage(format!("Rejected storage path {relative:?}")));
        }
        Ok(self.root.join(rel))
    }

    /// Public URL for a stored path
    pub fn url(&self, relative: &str) -> String {
        format!("{PUBLIC_PREFIX}/{}", relative.trim_start_matches('/'))
    }

    /// Inverse of [`Storage::url`]; `None` for anything not on this disk.
    pub fn path_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(PUBLIC_PREFIX)?.strip_prefix('/')
    }

    /// Write (or overwrite) a file, creating parent directories.
    pub async fn put(&self, relative: &str, data: &[u8]) -> ApiResult<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ApiError::Storage(format!("Failed to create directory for {relative}: {e}"))
            })?;
        }
        fs::write(&path, data)
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to write {relative}: {e}")))
    }

    /// Write only if nothing exists at `relative` yet. Returns `false` on collision.
    pub async fn put_new(&self, relative: &str, data: &[u8]) -> ApiResult<bool> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ApiError::Storage(format!("Failed to create directory for {relative}: {e}"))
            })?;
        }
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(ApiError::Storage(format!("Failed to create {relative}: {e}"))),
        };
        file.write_all(data)
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to write {relative}: {e}")))?;
        file.flush()
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to flush {relative}: {e}")))?;
        Ok(true)
    }

    pub async fn get(&self, relative: &str) -> ApiResult<Option<Vec<u8>>> {
        let path = self.resolve(relative)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ApiError::Storage(format!("Failed to read {relative}: {e}"))),
        }
    }

    #[cfg(test)]
    pub async fn exists(&self, relative: &str) -> ApiResult<bool> {
        let path = self.resolve(relative)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to stat {relative}: {e}")))
    }

    /// Remove a file. A file that is already gone is not an error; returns
    /// whether anything was removed.
    pub async fn delete(&self, relative: &str) -> ApiResult<bool> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ApiError::Storage(format!("Failed to delete {relative}: {e}"))),
        }
    }

    /// Remove a directory tree, tolerating its absence.
    pub async fn delete_dir(&self, relative: &str) -> ApiResult<()> {
        let path = self.resolve(relative)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ApiError::Storage(format!("Failed to delete {relative}: {e}"))),
        }
    }

    /// File names directly inside `relative`; empty if the directory is missing.
    pub async fn files(&self, relative: &str) -> ApiResult<Vec<String>> {
        let path = self.resolve(relative)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ApiError::Storage(format!("Failed to list {relative}: {e}"))),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ApiError::Storage(format!("Failed to list {relative}: {e}")))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    /// Store `data` under `dir` as `{slug}_{NNN}.{ext}`, where NNN is one past
    /// the highest sequence already in `dir`. Returns the stored file name.
    pub async fn put_sequenced(
        &self,
        dir: &str,
        base_name: &str,
        ext: &str,
        data: &[u8],
    ) -> ApiResult<String> {
        let existing = self.files(dir).await?;
        let mut next = existing
            .iter()
            .filter_map(|name| sequence_of(name))
            .max()
            .unwrap_or(0)
            + 1;
        let base = slug(base_name);

        for _ in 0..MAX_SEQUENCE_ATTEMPTS {
            let filename = format!("{base}_{next:03}.{ext}");
            if self.put_new(&format!("{dir}/{filename}"), data).await? {
                return Ok(filename);
            }
            // Lost a race with a concurrent upload; move past it
            next += 1;
        }

        Err(ApiError::Storage(format!(
            "Could not allocate a free file name in {dir}"
        )))
    }
}

/// Lowercase ASCII slug: runs of anything non-alphanumeric become one `-`.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        "file".to_string()
    } else {
        out
    }
}

/// Sequence number in `name_007.mp4` style names
fn sequence_of(file_name: &str) -> Option<u32> {
    let stem = file_name.rsplit_once('.').map_or(file_name, |(stem, _)| stem);
    let (_, digits) = stem.rsplit_once('_')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Last path component of a client-supplied name, without its extension and
/// restricted to `[A-Za-z0-9._-]`.
pub fn file_stem(filename: &str) -> String {
    let last = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let stem = match last.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => last,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "report".to_string()
    } else {
        cleaned
    }
}

/// Lowercased extension of a client-supplied name
pub fn extension(filename: &str) -> Option<String> {
    let last = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_ascii_lowercase()),
        _ => None,
    }
}
