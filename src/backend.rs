//! Read-only access to a tree of dump directories (`<database>/<date>/<file>`), either on the
//! local filesystem or behind an HTTP server with directory listings.

use std::{
    fmt::Debug,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use reqwest::{blocking::Client, StatusCode};
use scraper::{Html, Selector};

pub const DEFAULT_REMOTE_BASE: &str = "https://dumps.wikimedia.org";
pub const DEFAULT_LOCAL_ROOT: &str = "./data/dumps";

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("I/O error on {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("HTTP request failed")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Directory,
    File,
}

/// A backing store of dump directories. Paths are given as segments relative to the root.
pub trait DumpBackend: Debug + Send + Sync {
    /// Human readable location of an entry, for logs and error messages.
    fn location(&self, path: &[&str]) -> String;

    /// Names of the entries of one kind in a directory. A missing directory has no entries.
    fn list(&self, path: &[&str], kind: EntryKind) -> Result<Vec<String>, BackendError>;

    /// Content of a small text file, `None` if it does not exist.
    fn read_to_string(&self, path: &[&str]) -> Result<Option<String>, BackendError>;

    /// Open a file for sequential reading.
    fn open(&self, path: &[&str]) -> Result<Box<dyn Read + Send>, BackendError>;

    /// Filesystem path of a file, for callers that need to seek.
    fn local_path(&self, _path: &[&str]) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &[&str]) -> PathBuf {
        path.iter().fold(self.root.clone(), |acc, segment| acc.join(segment))
    }

    fn io_error(&self, path: &[&str], source: io::Error) -> BackendError {
        BackendError::Io {
            path: self.location(path),
            source,
        }
    }
}

impl DumpBackend for LocalBackend {
    fn location(&self, path: &[&str]) -> String {
        self.resolve(path).display().to_string()
    }

    fn list(&self, path: &[&str], kind: EntryKind) -> Result<Vec<String>, BackendError> {
        let entries = match fs::read_dir(self.resolve(path)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(path, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_error(path, e))?;
            let file_type = entry.file_type().map_err(|e| self.io_error(path, e))?;
            let wanted = match kind {
                EntryKind::Directory => file_type.is_dir(),
                EntryKind::File => file_type.is_file(),
            };
            if wanted {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_to_string(&self, path: &[&str]) -> Result<Option<String>, BackendError> {
        match fs::read_to_string(self.resolve(path)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(path, e)),
        }
    }

    fn open(&self, path: &[&str]) -> Result<Box<dyn Read + Send>, BackendError> {
        let file = File::open(self.resolve(path)).map_err(|e| self.io_error(path, e))?;
        Ok(Box::new(file))
    }

    fn local_path(&self, path: &[&str]) -> Option<PathBuf> {
        Some(self.resolve(path))
    }
}

/// HTTP backend for servers laid out like `dumps.wikimedia.org`.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    base: String,
    client: Client,
}

impl RemoteBackend {
    pub fn new(base: impl Into<String>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(base, client))
    }

    pub fn with_client(base: impl Into<String>, client: Client) -> Self {
        let base = base.into().trim_end_matches('/').to_owned();
        Self { base, client }
    }

    fn url(&self, path: &[&str], directory: bool) -> String {
        let mut url = self.base.clone();
        for segment in path {
            url.push('/');
            url.push_str(segment);
        }
        if directory {
            url.push('/');
        }
        url
    }

    /// GET a resource, `None` on 404.
    fn get(&self, url: &str) -> Result<Option<reqwest::blocking::Response>, BackendError> {
        tracing::debug!(message = "Requesting", url);
        let response = self.client.get(url).send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(response.error_for_status()?))
    }
}

/// Entry names of an HTML directory listing. Directories are the link texts ending in `/`.
pub fn parse_listing(html: &str, kind: EntryKind) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("a") else {
        return Vec::new();
    };

    document
        .select(&selector)
        .map(|a| a.text().collect::<String>())
        .map(|text| text.trim().to_owned())
        .filter(|text| !text.is_empty() && !text.starts_with(".."))
        .filter_map(|text| match kind {
            EntryKind::Directory => text.strip_suffix('/').map(str::to_owned),
            EntryKind::File => (!text.ends_with('/')).then_some(text),
        })
        .collect()
}

impl DumpBackend for RemoteBackend {
    fn location(&self, path: &[&str]) -> String {
        self.url(path, false)
    }

    fn list(&self, path: &[&str], kind: EntryKind) -> Result<Vec<String>, BackendError> {
        match self.get(&self.url(path, true))? {
            Some(response) => Ok(parse_listing(&response.text()?, kind)),
            None => Ok(Vec::new()),
        }
    }

    fn read_to_string(&self, path: &[&str]) -> Result<Option<String>, BackendError> {
        match self.get(&self.url(path, false))? {
            Some(response) => Ok(Some(response.text()?)),
            None => Ok(None),
        }
    }

    fn open(&self, path: &[&str]) -> Result<Box<dyn Read + Send>, BackendError> {
        let url = self.url(path, false);
        match self.get(&url)? {
            Some(response) => Ok(Box::new(response)),
            None => Err(BackendError::Io {
                path: url,
                source: io::Error::from(io::ErrorKind::NotFound),
            }),
        }
    }
}
