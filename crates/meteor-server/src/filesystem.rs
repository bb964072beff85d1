//! Byte sources for result files.
//!
//! A result path is resolved by URI scheme: `file://` URIs and bare
//! absolute paths go to the local filesystem, any other scheme to a
//! backend registered at runtime.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

/// Byte-source errors
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no filesystem registered for scheme '{scheme}' ({path})")]
    UnsupportedScheme { scheme: String, path: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// An opened source: total length plus a sequential reader.
pub struct ByteStream {
    pub len: u64,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream").field("len", &self.len).finish_non_exhaustive()
    }
}

/// Opens result paths for reading.
pub trait ByteSource: Send + Sync {
    fn open(&self, path: &str) -> Result<ByteStream, FsError>;
}

/// Scheme of a path URI, or `file` for a bare path.
pub fn scheme_of(path: &str) -> &str {
    match path.find("://") {
        Some(i) if i > 0 => &path[..i],
        _ => "file",
    }
}

/// Local disk backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    fn resolve(path: &str) -> PathBuf {
        PathBuf::from(path.strip_prefix("file://").unwrap_or(path))
    }
}

impl ByteSource for LocalFileSystem {
    fn open(&self, path: &str) -> Result<ByteStream, FsError> {
        let local = Self::resolve(path);
        let file = match File::open(&local) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FsError::NotFound(path.to_string()))
            }
            Err(source) => {
                return Err(FsError::Io {
                    path: path.to_string(),
                    source,
                })
            }
        };
        let metadata = file.metadata().map_err(|source| FsError::Io {
            path: path.to_string(),
            source,
        })?;
        if !metadata.is_file() {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(ByteStream {
            len: metadata.len(),
            reader: Box::new(file),
        })
    }
}

/// In-memory backend keyed by the full path string.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    files: Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), Arc::new(bytes.into()));
    }

    pub fn remove(&self, path: &str) -> bool {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some()
    }
}

/// Reader over a shared buffer.
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl ByteSource for MemoryFileSystem {
    fn open(&self, path: &str) -> Result<ByteStream, FsError> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        let bytes = files
            .get(path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(ByteStream {
            len: bytes.len() as u64,
            reader: Box::new(Cursor::new(SharedBytes(bytes))),
        })
    }
}

/// Routes paths to backends by scheme.
#[derive(Clone)]
pub struct FileSystems {
    backends: HashMap<String, Arc<dyn ByteSource>>,
}

impl FileSystems {
    /// Registry with the local backend under `file`.
    pub fn new() -> Self {
        let mut backends: HashMap<String, Arc<dyn ByteSource>> = HashMap::new();
        backends.insert("file".to_string(), Arc::new(LocalFileSystem));
        Self { backends }
    }

    /// Register (or replace) the backend for a scheme.
    pub fn register(&mut self, scheme: impl Into<String>, backend: Arc<dyn ByteSource>) {
        self.backends.insert(scheme.into(), backend);
    }

    pub fn with(mut self, scheme: impl Into<String>, backend: Arc<dyn ByteSource>) -> Self {
        self.register(scheme, backend);
        self
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl Default for FileSystems {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteSource for FileSystems {
    fn open(&self, path: &str) -> Result<ByteStream, FsError> {
        let scheme = scheme_of(path);
        let backend = self
            .backends
            .get(scheme)
            .ok_or_else(|| FsError::UnsupportedScheme {
                scheme: scheme.to_string(),
                path: path.to_string(),
            })?;
        backend.open(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn read_all(mut stream: ByteStream) -> Vec<u8> {
        let mut buf = Vec::new();
        stream.reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_scheme_of() {
        assert_eq!(scheme_of("file:///tmp/a.json"), "file");
        assert_eq!(scheme_of("hdfs://nn:9000/a.json"), "hdfs");
        assert_eq!(scheme_of("/tmp/a.json"), "file");
        assert_eq!(scheme_of("://odd"), "file");
    }

    #[test]
    fn test_local_file_by_uri_and_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        std::fs::File::create(&path).unwrap().write_all(b"[1,2,3]").unwrap();

        let fs = LocalFileSystem;
        let by_path = fs.open(path.to_str().unwrap()).unwrap();
        assert_eq!(by_path.len, 7);
        let uri = format!("file://{}", path.display());
        assert_eq!(read_all(fs.open(&uri).unwrap()), b"[1,2,3]");
    }

    #[test]
    fn test_local_missing_and_directory_are_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem;
        let missing = dir.path().join("nope.json");
        assert!(matches!(fs.open(missing.to_str().unwrap()), Err(FsError::NotFound(_))));
        assert!(matches!(fs.open(dir.path().to_str().unwrap()), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_registry_routes_by_scheme() {
        let mem = MemoryFileSystem::new();
        mem.insert("mem://bucket/a.json", "hello");
        let registry = FileSystems::new().with("mem", Arc::new(mem.clone()));

        assert_eq!(registry.schemes(), vec!["file", "mem"]);
        assert_eq!(read_all(registry.open("mem://bucket/a.json").unwrap()), b"hello");
        assert!(matches!(
            registry.open("hdfs://nn/a.json"),
            Err(FsError::UnsupportedScheme { .. })
        ));

        assert!(mem.remove("mem://bucket/a.json"));
        assert!(matches!(registry.open("mem://bucket/a.json"), Err(FsError::NotFound(_))));
    }
}
