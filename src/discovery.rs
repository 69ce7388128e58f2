//! Resolve a database, dump kind and snapshot policy to a [`Dump`].

use std::{
    collections::{hash_map::Entry, HashMap},
    path::PathBuf,
    sync::Arc,
};

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use serde::{de::IgnoredAny, Deserialize};

use crate::{
    backend::{BackendError, DumpBackend, EntryKind, LocalBackend, RemoteBackend},
    dump::{sort_by_part, Dump},
    dump_kind::DumpKind,
};

const STATUS_JSON: &str = "dumpstatus.json";
const STATUS_INCR: &str = "status.txt";
const LATEST: &str = "latest";
const DATE_FORMAT: &str = "%Y%m%d";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("malformed manifest at {location}")]
    Manifest {
        location: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a snapshot date in the basic ISO form `YYYYMMDD`.
pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
}

/// The `dumpstatus.json` document of a snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub jobs: HashMap<String, Job>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub status: String,
    #[serde(default)]
    pub files: HashMap<String, IgnoredAny>,
}

impl Job {
    pub fn is_done(&self) -> bool {
        self.status == "done"
    }

    fn files_of(&self, kind: DumpKind, database: &str, directory: &str) -> Vec<String> {
        let scheme = kind.naming_scheme(database, directory);
        let mut files: Vec<_> = self
            .files
            .keys()
            .filter(|name| scheme.is_match(name))
            .cloned()
            .collect();
        // JSON objects are unordered
        sort_by_part(&mut files);
        files
    }
}

impl Manifest {
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        serde_json::from_str(content)
    }

    fn done_job(&self, kind: DumpKind) -> Option<&Job> {
        kind.job_key()
            .and_then(|key| self.jobs.get(key))
            .filter(|job| job.is_done())
    }

    /// Files of a finished job producing `kind`, in part order.
    ///
    /// If the job of `kind` is done, its files matching `kind`'s naming scheme are used, or
    /// those matching the fallback's scheme if there are none (small wikis publish only
    /// recombined files under the partitioned job). Otherwise the fallback job is used if it
    /// is done. `None` if nothing qualifies.
    pub fn select_files(&self, kind: DumpKind, database: &str, directory: &str) -> Option<Vec<String>> {
        if let Some(job) = self.done_job(kind) {
            let files = job.files_of(kind, database, directory);
            if !files.is_empty() {
                return Some(files);
            }
            let fallback = kind.fallback()?;
            let files = job.files_of(fallback, database, directory);
            tracing::debug!(
                message = "Using fallback naming scheme",
                %kind,
                %fallback,
                files = files.len()
            );
            return (!files.is_empty()).then_some(files);
        }

        let fallback = kind.fallback()?;
        let job = self.done_job(fallback)?;
        tracing::debug!(message = "Using fallback job", %kind, %fallback);
        let files = job.files_of(fallback, database, directory);
        (!files.is_empty()).then_some(files)
    }
}

/// Directory listings fetched during one discovery session.
#[derive(Debug, Default)]
pub struct ListingCache {
    listings: FxHashMap<(String, EntryKind), Vec<String>>,
}

impl ListingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(
        &mut self,
        backend: &dyn DumpBackend,
        path: &[&str],
        kind: EntryKind,
    ) -> Result<&[String], BackendError> {
        let listing = match self.listings.entry((backend.location(path), kind)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(backend.list(path, kind)?),
        };
        Ok(listing.as_slice())
    }

    pub fn len(&self) -> usize {
        self.listings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpSource {
    /// Root holding a `public` tree of regular dumps and an `incr` tree of incremental ones.
    Local(PathBuf),
    Remote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReferenceDate {
    After(NaiveDate),
    At(NaiveDate),
}

/// Which dump to look for and where.
///
/// Without `latest`, `after` or `at`, the newest finished snapshot is chosen.
#[derive(Debug, Clone)]
pub struct DumpConfig {
    database: String,
    source: Option<DumpSource>,
    latest: bool,
    reference: Option<ReferenceDate>,
    kind: Option<DumpKind>,
}

impl DumpConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            source: None,
            latest: false,
            reference: None,
            kind: None,
        }
    }

    pub fn local(mut self, root: impl Into<PathBuf>) -> Self {
        self.source = Some(DumpSource::Local(root.into()));
        self
    }

    pub fn remote(mut self, base_url: impl Into<String>) -> Self {
        self.source = Some(DumpSource::Remote(base_url.into()));
        self
    }

    /// Use the `latest` directory instead of a dated snapshot.
    pub fn latest(mut self) -> Self {
        self.latest = true;
        self
    }

    /// Use the earliest finished snapshot taken on or after `date`.
    pub fn after(mut self, date: NaiveDate) -> Self {
        self.reference = Some(ReferenceDate::After(date));
        self
    }

    /// Use the snapshot taken on `date`, if it is finished.
    pub fn at(mut self, date: NaiveDate) -> Self {
        self.reference = Some(ReferenceDate::At(date));
        self
    }

    pub fn kind(mut self, kind: DumpKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    fn validate(&self) -> Result<(DumpKind, &DumpSource), DiscoveryError> {
        let kind = self
            .kind
            .ok_or(DiscoveryError::Config("no dump kind specified"))?;
        let source = self
            .source
            .as_ref()
            .ok_or(DiscoveryError::Config("no source (local or remote) specified"))?;

        if let DumpSource::Remote(_) = source {
            if kind.is_incremental() {
                return Err(DiscoveryError::Config(
                    "incremental dumps are not available remotely",
                ));
            }
            if kind.is_multistream() {
                return Err(DiscoveryError::Config(
                    "multistream dumps are not available remotely",
                ));
            }
        }
        if self.latest && self.reference.is_some() {
            return Err(DiscoveryError::Config(
                "cannot specify both latest and a reference date",
            ));
        }
        Ok((kind, source))
    }

    fn backend(&self, kind: DumpKind, source: &DumpSource) -> Result<Arc<dyn DumpBackend>, DiscoveryError> {
        Ok(match source {
            DumpSource::Local(root) => {
                let subtree = if kind.is_incremental() { "incr" } else { "public" };
                Arc::new(LocalBackend::new(root.join(subtree)))
            }
            DumpSource::Remote(base) => Arc::new(RemoteBackend::new(base.as_str())?),
        })
    }

    /// Resolve the configuration to a dump. `Ok(None)` if no snapshot qualifies.
    pub fn fetch(&self) -> Result<Option<Dump>, DiscoveryError> {
        self.fetch_with_cache(&mut ListingCache::new())
    }

    #[tracing::instrument(skip(self, cache), fields(database = %self.database, kind = ?self.kind))]
    pub fn fetch_with_cache(&self, cache: &mut ListingCache) -> Result<Option<Dump>, DiscoveryError> {
        let (kind, source) = self.validate()?;
        let backend = self.backend(kind, source)?;
        let database = self.database.as_str();

        if self.latest {
            return Ok(fetch_listed(&*backend, cache, database, LATEST, kind)?
                .map(|files| Dump::new(Arc::clone(&backend), database, LATEST, kind, files)));
        }

        let mut dates: Vec<NaiveDate> = cache
            .list(&*backend, &[database], EntryKind::Directory)?
            .iter()
            .filter_map(|name| parse_date(name).ok())
            .collect();
        dates.sort_unstable();

        let candidates: Vec<NaiveDate> = match self.reference {
            Some(ReferenceDate::At(date)) => dates.into_iter().filter(|d| *d == date).collect(),
            Some(ReferenceDate::After(date)) => dates.into_iter().filter(|d| *d >= date).collect(),
            None => dates.into_iter().rev().collect(),
        };

        for date in candidates {
            let directory = date.format(DATE_FORMAT).to_string();
            if let Some(files) = fetch_snapshot(&*backend, cache, database, &directory, kind)? {
                tracing::debug!(message = "Selected snapshot", %directory, files = files.len());
                return Ok(Some(Dump::new(backend, database, directory, kind, files)));
            }
            tracing::debug!(message = "Snapshot not usable", %directory);
        }
        Ok(None)
    }
}

/// Files of `kind` in a snapshot directory, judged by its manifest (or the status file of
/// incremental dumps).
fn fetch_snapshot(
    backend: &dyn DumpBackend,
    cache: &mut ListingCache,
    database: &str,
    directory: &str,
    kind: DumpKind,
) -> Result<Option<Vec<String>>, DiscoveryError> {
    if kind.is_incremental() {
        let status = backend.read_to_string(&[database, directory, STATUS_INCR])?;
        if status.as_deref().map(str::trim) != Some("done:all") {
            return Ok(None);
        }
        let scheme = kind.naming_scheme(database, directory);
        let mut files: Vec<String> = cache
            .list(backend, &[database, directory], EntryKind::File)?
            .iter()
            .filter(|name| scheme.is_match(name))
            .cloned()
            .collect();
        sort_by_part(&mut files);
        return Ok((!files.is_empty()).then_some(files));
    }

    let path = [database, directory, STATUS_JSON];
    let Some(content) = backend.read_to_string(&path)? else {
        return Ok(None);
    };
    let manifest = Manifest::parse(&content).map_err(|source| DiscoveryError::Manifest {
        location: backend.location(&path),
        source,
    })?;
    Ok(manifest.select_files(kind, database, directory))
}

/// Files of `kind` in a directory without manifest, matched by name only.
fn fetch_listed(
    backend: &dyn DumpBackend,
    cache: &mut ListingCache,
    database: &str,
    directory: &str,
    kind: DumpKind,
) -> Result<Option<Vec<String>>, DiscoveryError> {
    let listing = cache.list(backend, &[database, directory], EntryKind::File)?;

    let matching = |kind: DumpKind| {
        let scheme = kind.naming_scheme(database, directory);
        let mut files: Vec<String> = listing
            .iter()
            .filter(|name| scheme.is_match(name))
            .cloned()
            .collect();
        sort_by_part(&mut files);
        files
    };

    let mut files = matching(kind);
    if files.is_empty() {
        if let Some(fallback) = kind.fallback() {
            files = matching(fallback);
        }
    }
    Ok((!files.is_empty()).then_some(files))
}
