//! Artifact storage contract and implementations.
//!
//! Rendered files are written under a deterministic name derived from the
//! job identifier and the worker-supplied file name, so a redelivered
//! completion overwrites the same artifact instead of leaving a second copy.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Directory prefix under which all map artifacts are stored.
pub const ARTIFACT_PREFIX: &str = "maps";

// ---------------------------------------------------------------------------
// Artifact reference
// ---------------------------------------------------------------------------

/// Stable handle to a stored artifact, persisted on the result row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The file name part of the reference, used as the download name.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Longest file name [`sanitize_filename`] produces, in bytes.
pub const MAX_FILENAME_BYTES: usize = 150;

/// Longest extension kept intact when a file name is shortened.
const MAX_EXTENSION_BYTES: usize = 16;

/// Longest directory segment of an encoded job id.
const MAX_JOB_SEGMENT_BYTES: usize = 200;

/// Longest single path component a store accepts.
pub const MAX_COMPONENT_BYTES: usize = 255;

/// Longest artifact name a store accepts.
pub const MAX_NAME_BYTES: usize = 1024;

/// Reduce a worker-supplied file name to a safe single path component.
///
/// Directory parts are stripped and every character outside
/// `[A-Za-z0-9._-]` becomes `_`. Names longer than
/// [`MAX_FILENAME_BYTES`] are cut in the stem, keeping a short extension.
/// Returns `None` when nothing usable is left.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned: String = base
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(shorten(cleaned)),
    }
}

/// Cut an ASCII file name down to [`MAX_FILENAME_BYTES`].
fn shorten(name: String) -> String {
    if name.len() <= MAX_FILENAME_BYTES {
        return name;
    }
    let (stem, extension) = match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= MAX_EXTENSION_BYTES => name.split_at(dot),
        _ => (name.as_str(), ""),
    };
    format!(
        "{}{extension}",
        &stem[..MAX_FILENAME_BYTES - extension.len()]
    )
}

/// Encode a job id as a directory path, one id per directory.
///
/// Bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct ids
/// never share a directory and no segment is `.` or `..`. Long ids are
/// split into segments of at most 200 bytes.
pub fn job_directory(job_id: &str) -> Option<String> {
    if job_id.is_empty() {
        return None;
    }

    let mut encoded = String::with_capacity(job_id.len());
    for byte in job_id.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'_' | b'-') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }

    // Encoded ids are ASCII, so char offsets are byte offsets.
    let mut directory = String::with_capacity(encoded.len() + 4);
    for (offset, c) in encoded.char_indices() {
        if offset > 0 && offset % MAX_JOB_SEGMENT_BYTES == 0 {
            directory.push('/');
        }
        directory.push(c);
    }
    Some(directory)
}

/// Derive the storage name `maps/<job>/<file>` for a job's artifact.
///
/// `<job>` is [`job_directory`] and `<file>` is [`sanitize_filename`].
pub fn artifact_name(job_id: &str, filename: &str) -> Result<String, CoreError> {
    let job = job_directory(job_id)
        .ok_or_else(|| CoreError::Validation(format!("Unusable job id '{job_id}'")))?;
    let file = sanitize_filename(filename)
        .ok_or_else(|| CoreError::Validation(format!("Unusable filename '{filename}'")))?;
    let name = format!("{ARTIFACT_PREFIX}/{job}/{file}");
    if name.len() > MAX_NAME_BYTES {
        return Err(CoreError::Validation(format!(
            "Artifact name for job '{job_id}' exceeds {MAX_NAME_BYTES} bytes"
        )));
    }
    Ok(name)
}

/// Check that `name` is a relative path of plain components within the
/// store's length limits.
fn validate_name(name: &str) -> Result<&Path, ArtifactError> {
    let relative = Path::new(name);
    let mut components = relative.components().peekable();
    let valid = name.len() <= MAX_NAME_BYTES
        && components.peek().is_some()
        && components.all(|c| match c {
            Component::Normal(part) => part.len() <= MAX_COMPONENT_BYTES,
            _ => false,
        });
    if valid {
        Ok(relative)
    } else {
        Err(ArtifactError::InvalidReference(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid artifact reference '{0}'")]
    InvalidReference(String),

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact store unavailable: {0}")]
    Unavailable(String),
}

/// Durable byte storage keyed by a generated name.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `name`, replacing any previous artifact with the
    /// same name. Readers never observe a partially written artifact.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError>;

    /// Read an artifact back.
    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError>;

    /// Remove an artifact. Removing a missing artifact succeeds.
    async fn delete(&self, artifact: &ArtifactRef) -> Result<(), ArtifactError>;
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// Stores artifacts as files below a media root directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a relative artifact name to a path inside the root.
    ///
    /// Absolute paths, any `..`, `.` or prefix components, and over-long
    /// components are rejected.
    fn resolve(&self, name: &str) -> Result<PathBuf, ArtifactError> {
        Ok(self.root.join(validate_name(name)?))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError> {
        let path = self.resolve(name)?;
        let parent = path
            .parent()
            .ok_or_else(|| ArtifactError::InvalidReference(name.to_string()))?;

        tokio::fs::create_dir_all(parent).await?;

        // Write next to the target, then rename over it. The temp name is
        // fixed-length whatever the target's length.
        let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        Ok(ArtifactRef::new(name))
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(artifact.as_str())?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(artifact.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, artifact: &ArtifactRef) -> Result<(), ArtifactError> {
        let path = self.resolve(artifact.as_str())?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local artifact store for tests and dry runs.
///
/// `set_failing(true)` makes every `put` fail with
/// [`ArtifactError::Unavailable`], which lets callers exercise their
/// persistence-failure paths.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failing: AtomicBool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        // A poisoned map is still structurally valid.
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError> {
        validate_name(name)?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(ArtifactError::Unavailable("injected failure".into()));
        }
        self.lock().insert(name.to_string(), bytes.to_vec());
        Ok(ArtifactRef::new(name))
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        self.lock()
            .get(artifact.as_str())
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(artifact.to_string()))
    }

    async fn delete(&self, artifact: &ArtifactRef) -> Result<(), ArtifactError> {
        self.lock().remove(artifact.as_str());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
