//! Dataset file sources
//!
//! A `FileSource` resolves opaque file ids to named text contents. The
//! listing is cached in a `FileListingCache` owned by the caller, so its
//! lifetime is exactly one request and nothing is shared between runs.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::SourceError;

const DATA_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

/// One CSV-shaped input: a display name and its raw text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetFile {
    pub name: String,
    pub content: String,
}

impl DatasetFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Read a file from disk. The display name is the file name; a leading
    /// UTF-8 byte order mark is dropped.
    pub async fn read(path: &Path) -> Result<Self, SourceError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        let bytes = tokio::fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::NotFound(path.display().to_string())
            } else {
                SourceError::Io(e)
            }
        })?;
        let content = String::from_utf8(bytes).map_err(|_| SourceError::Encoding(name.clone()))?;
        let content = match content.strip_prefix('\u{feff}') {
            Some(stripped) => stripped.to_string(),
            None => content,
        };

        Ok(Self { name, content })
    }

    /// Field delimiter: tab for `.tsv` files or a header line that has tabs
    /// but no commas, comma otherwise.
    pub fn delimiter(&self) -> u8 {
        if self.name.to_ascii_lowercase().ends_with(".tsv") {
            return b'\t';
        }
        let header = self.content.lines().next().unwrap_or_default();
        if header.contains('\t') && !header.contains(',') {
            b'\t'
        } else {
            b','
        }
    }
}

/// A listed, not yet downloaded file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
}

/// Where dataset files come from
#[async_trait]
pub trait FileSource: Send + Sync {
    /// List the files available from this source
    async fn list_files(&self) -> Result<Vec<FileEntry>, SourceError>;

    /// Download one listed file
    async fn fetch(&self, entry: &FileEntry) -> Result<DatasetFile, SourceError>;
}

/// `*.csv`, `*.tsv` and `*.txt` files of one directory
#[derive(Debug, Clone)]
pub struct LocalDirectorySource {
    root: PathBuf,
}

impl LocalDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileSource for LocalDirectorySource {
    #[tracing::instrument(skip(self), fields(root = %self.root.display()))]
    async fn list_files(&self) -> Result<Vec<FileEntry>, SourceError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let path = entry.path();
            let is_data = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| DATA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
            if !is_data {
                continue;
            }

            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(FileEntry {
                id: name.clone(),
                name,
                size_bytes: metadata.len(),
            });
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(file_count = entries.len(), "directory listed");
        Ok(entries)
    }

    async fn fetch(&self, entry: &FileEntry) -> Result<DatasetFile, SourceError> {
        // ids are bare file names; anything else could escape the root
        if Path::new(&entry.id).file_name().and_then(|n| n.to_str()) != Some(entry.id.as_str()) {
            return Err(SourceError::NotFound(entry.id.clone()));
        }
        let mut file = DatasetFile::read(&self.root.join(&entry.id)).await?;
        file.name = entry.name.clone();
        Ok(file)
    }
}

struct CachedListing {
    entries: Vec<FileEntry>,
    cached_at: Instant,
}

/// Request-scoped cache of a source's file listing
pub struct FileListingCache<S: FileSource> {
    source: S,
    /// Listing lifetime; `None` keeps it until `invalidate`
    ttl: Option<Duration>,
    listing: RwLock<Option<CachedListing>>,
}

impl<S: FileSource> FileListingCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            ttl: None,
            listing: RwLock::new(None),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn cached(&self) -> Option<Vec<FileEntry>> {
        let listing = self.listing.read();
        let cached = listing.as_ref()?;
        let fresh = self
            .ttl
            .is_none_or(|ttl| cached.cached_at.elapsed() < ttl);
        fresh.then(|| cached.entries.clone())
    }

    /// The source's listing, fetched on first use
    pub async fn list_files(&self) -> Result<Vec<FileEntry>, SourceError> {
        if let Some(entries) = self.cached() {
            tracing::trace!("file listing cache hit");
            return Ok(entries);
        }

        tracing::debug!("file listing cache miss");
        let entries = self.source.list_files().await?;
        *self.listing.write() = Some(CachedListing {
            entries: entries.clone(),
            cached_at: Instant::now(),
        });
        Ok(entries)
    }

    /// Drop the cached listing
    pub fn invalidate(&self) {
        tracing::debug!("invalidating file listing cache");
        self.listing.write().take();
    }

    /// Download a file by id, resolving it through the cached listing
    pub async fn download(&self, id: &str) -> Result<DatasetFile, SourceError> {
        let entries = self.list_files().await?;
        let entry = entries
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| SourceError::NotFound(id.to_string()))?;
        self.source.fetch(entry).await
    }

    /// Download several files concurrently.
    ///
    /// Returns the downloaded files in request order plus one message per
    /// failed download.
    pub async fn download_all(&self, ids: &[String]) -> (Vec<DatasetFile>, Vec<String>) {
        let results = futures::future::join_all(ids.iter().map(|id| self.download(id))).await;

        let mut files = Vec::with_capacity(ids.len());
        let mut errors = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(file) => files.push(file),
                Err(e) => {
                    tracing::warn!(file_id = %id, error = %e, "download failed");
                    errors.push(format!("Failed to download file {}: {}", id, e));
                }
            }
        }
        (files, errors)
    }
}
