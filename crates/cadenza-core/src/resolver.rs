// src/resolver.rs
//! Maps request URLs onto files under the document root.

use memmap2::{Mmap, MmapOptions};
use std::ffi::OsStr;
use std::fs::{File, Metadata};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Default bound on `root + url`, in bytes. The bound is exclusive: a path
/// must be strictly shorter.
pub const DEFAULT_MAX_PATH_LEN: usize = 200;

const OTHER_READ: u32 = libc::S_IROTH as u32;

/// A regular file opened for one response.
///
/// The file descriptor is closed as soon as the mapping exists; the mapping
/// is unmapped when this value is dropped. Empty files are never mapped.
pub struct MappedFile {
    path: PathBuf,
    len: usize,
    map: Option<Mmap>,
}

impl MappedFile {
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("mapped", &self.map.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub enum Resolution {
    File(MappedFile),
    BadRequest,
    NotFound,
    Forbidden,
    /// The file passed every check but could not be opened or mapped.
    InternalError,
}

#[derive(Debug, Clone)]
pub struct DocumentRoot {
    root: PathBuf,
    max_path_len: usize,
}

impl DocumentRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }

    pub fn with_max_path_len(mut self, max_path_len: usize) -> Self {
        self.max_path_len = max_path_len;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a URL (already known to start with `/`) to a mapped file.
    pub fn resolve(&self, url: &[u8]) -> Resolution {
        let Some(decoded) = decode_path(url) else {
            return Resolution::BadRequest;
        };
        if decoded.split(|&b| b == b'/').any(|segment| segment == b"..") {
            tracing::debug!(url = %String::from_utf8_lossy(url), "rejecting traversal");
            return Resolution::BadRequest;
        }

        let root = self.root.as_os_str().as_bytes();
        let root = root.strip_suffix(b"/").unwrap_or(root);
        if root.len() + decoded.len() >= self.max_path_len {
            tracing::debug!(len = root.len() + decoded.len(), "rejecting overlong path");
            return Resolution::BadRequest;
        }
        let mut joined = Vec::with_capacity(root.len() + decoded.len());
        joined.extend_from_slice(root);
        joined.extend_from_slice(&decoded);
        let path = PathBuf::from(OsStr::from_bytes(&joined));

        let meta = match std::fs::metadata(&path) {
            Ok(meta) => meta,
            Err(_) => return Resolution::NotFound,
        };
        if meta.permissions().mode() & OTHER_READ == 0 {
            return Resolution::Forbidden;
        }
        if meta.is_dir() {
            return Resolution::BadRequest;
        }

        match map_file(&path, &meta) {
            Ok(file) => Resolution::File(file),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to map file");
                Resolution::InternalError
            }
        }
    }
}

fn map_file(path: &Path, meta: &Metadata) -> std::io::Result<MappedFile> {
    let len = usize::try_from(meta.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "file too large"))?;
    if len == 0 {
        return Ok(MappedFile {
            path: path.to_path_buf(),
            len,
            map: None,
        });
    }

    let file = File::open(path)?;
    // SAFETY: the mapping is private and read-only. Truncation of the file by
    // another process while it is mapped can still raise SIGBUS.
    let map = unsafe { MmapOptions::new().len(len).map_copy_read_only(&file)? };
    drop(file);

    Ok(MappedFile {
        path: path.to_path_buf(),
        len,
        map: Some(map),
    })
}

/// Strip query and fragment, then percent-decode. `None` on a bad escape
/// or an encoded NUL.
fn decode_path(url: &[u8]) -> Option<Vec<u8>> {
    let end = memchr::memchr2(b'?', b'#', url).unwrap_or(url.len());
    let raw = &url[..end];

    // percent_decode passes malformed escapes through unchanged.
    let well_formed = memchr::memchr_iter(b'%', raw).all(|i| {
        raw.get(i + 1..i + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
    });
    if !well_formed {
        return None;
    }

    let decoded: Vec<u8> = percent_encoding::percent_decode(raw).collect();
    if memchr::memchr(0, &decoded).is_some() {
        return None;
    }
    Some(decoded)
}
