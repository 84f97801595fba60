use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use log::debug;

use mh_core::HostError;

/// Virtual filesystem namespace the module loader reads from. Scheme-qualified
/// specifiers bypass the store entirely in favor of an HTTP fetch.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, path: &str) -> bool;
}

/// In-memory store keyed by normalized relative path.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .expect("file store lock should not be poisoned")
            .insert(path.into(), contents.into());
    }
}

impl FileStore for MemoryFileStore {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        self.files
            .lock()
            .expect("file store lock should not be poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
    }

    fn exists(&self, path: &str) -> bool {
        self.files
            .lock()
            .expect("file store lock should not be poisoned")
            .contains_key(path)
    }
}

/// Store backed by a directory on the real filesystem.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl FileStore for DirStore {
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.root.join(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }
}

pub(crate) fn is_absolute_path(name: &str) -> bool {
    Path::new(name).is_absolute()
}

/// Fetches a scheme-qualified module source over HTTP.
pub(crate) fn fetch(url: &str) -> Result<Vec<u8>, HostError> {
    debug!("fetching source url={url}");
    let start = Instant::now();

    let response = match ureq::get(url).call() {
        Ok(response) => response,
        Err(ureq::Error::Status(404, _)) => {
            return Err(HostError::RemoteNotFound(url.to_string()));
        }
        Err(ureq::Error::Status(status, _)) => {
            return Err(HostError::UnexpectedStatus {
                status,
                url: url.to_string(),
            });
        }
        Err(error) => return Err(HostError::runtime(error.to_string())),
    };

    let mut data = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut data)
        .map_err(|error| HostError::runtime(error.to_string()))?;

    debug!(
        "fetched url={url} len={} t={:?}",
        data.len(),
        start.elapsed()
    );
    Ok(data)
}

/// One-shot HTTP server for exercising remote source loading. Returns the
/// base URL; the listener answers a single request and exits.
#[cfg(test)]
pub(crate) fn serve_once(status_line: &'static str, body: &'static str) -> String {
    use std::io::Write;

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind local listener");
    let addr = listener.local_addr().expect("listener has an address");
    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = Vec::new();
            let mut chunk = [0u8; 512];
            while let Ok(n) = stream.read(&mut chunk) {
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                if request.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{addr}")
}
