use std::{
    collections::VecDeque,
    fmt,
    io,
    sync::{Arc, LazyLock},
};

use rayon::iter::{ParallelBridge, ParallelIterator};
use regex::Regex;

use crate::{
    backend::{BackendError, DumpBackend},
    block_stream::open_decompressed,
    dump_kind::DumpKind,
    dump_parser::{DumpParser, ParsingError},
    multistream::{MultistreamError, MultistreamReader, PageFilter},
    push_parser::{self, PushError},
    revision::Revision,
};

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Parsing(#[from] ParsingError),
    #[error(transparent)]
    Multistream(#[from] MultistreamError),
    #[error(transparent)]
    Push(#[from] PushError),
    #[error("failed to open dump file")]
    Io(#[from] io::Error),
    #[error("{0}")]
    FilterConflict(&'static str),
    #[error("multistream files {0:?} are not a pair of dump and index")]
    UnpairedMultistream(Vec<String>),
    #[error("multistream dumps need a seekable local file, {0} is not one")]
    NotSeekable(String),
}

static PART_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?<slice>\d+)\.(?:txt|xml)(?:-p(?<start>\d+)p(?<end>\d+))?").unwrap()
});

/// Part number and page id range encoded in a file name, e.g. `...-pages-articles3.xml-p100p200.bz2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartInfo {
    pub slice: Option<u64>,
    /// inclusive page id range
    pub range: Option<(u64, u64)>,
}

impl PartInfo {
    pub fn of(filename: &str) -> Self {
        let Some(caps) = PART_NUMBER.captures(filename) else {
            return PartInfo::default();
        };
        let number = |name| caps.name(name).and_then(|m| m.as_str().parse::<u64>().ok());
        PartInfo {
            slice: number("slice"),
            range: number("start").zip(number("end")),
        }
    }

    /// Sort key of a file within its dump: the range start if present, else the part number.
    pub fn sort_key(&self) -> u64 {
        self.range
            .map(|(start, _)| start)
            .or(self.slice)
            .unwrap_or_default()
    }
}

/// Sort file names by the part they hold.
pub fn sort_by_part(filenames: &mut [String]) {
    filenames.sort_by_cached_key(|name| (PartInfo::of(name).sort_key(), name.clone()));
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Plain(String),
    Multistream { main: String, index: String },
}

impl Source {
    fn name(&self) -> &str {
        match self {
            Source::Plain(name) => name,
            Source::Multistream { main, .. } => main,
        }
    }
}

static MULTISTREAM_PART: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d*\.xml").unwrap());
static MULTISTREAM_INDEX_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-index\d*\.txt").unwrap());

/// Pair the dump and index files of a multistream dump, in order of first appearance.
fn pair_multistream(filenames: &[String]) -> Result<Vec<Source>, DumpError> {
    let mut groups: Vec<(String, Vec<&String>)> = Vec::new();
    for filename in filenames {
        let key = MULTISTREAM_PART.replace(filename, "");
        let key = MULTISTREAM_INDEX_PART.replace(&key, "").into_owned();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(filename),
            None => groups.push((key, vec![filename])),
        }
    }

    groups
        .into_iter()
        .map(|(_, members)| {
            let main = members.iter().find(|name| name.contains(".xml"));
            let index = members.iter().find(|name| name.contains("-index"));
            match (members.len(), main, index) {
                (2, Some(main), Some(index)) => Ok(Source::Multistream {
                    main: (*main).clone(),
                    index: (*index).clone(),
                }),
                _ => Err(DumpError::UnpairedMultistream(
                    members.into_iter().cloned().collect(),
                )),
            }
        })
        .collect()
}

/// A resolved dump: the files of one kind in one snapshot directory of one database.
///
/// Files are listed in part order. Reading is lazy and a title or page id filter can be
/// attached before reading.
#[derive(Clone)]
pub struct Dump {
    backend: Arc<dyn DumpBackend>,
    database: String,
    directory: String,
    kind: DumpKind,
    files: Vec<String>,
    filter: Option<PageFilter>,
}

impl fmt::Debug for Dump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dump")
            .field("location", &self.backend.location(&[self.database.as_str(), self.directory.as_str()]))
            .field("kind", &self.kind)
            .field("files", &self.files)
            .field("filter", &self.filter)
            .finish()
    }
}

impl Dump {
    pub fn new(
        backend: Arc<dyn DumpBackend>,
        database: impl Into<String>,
        directory: impl Into<String>,
        kind: DumpKind,
        files: Vec<String>,
    ) -> Self {
        Self {
            backend,
            database: database.into(),
            directory: directory.into(),
            kind,
            files,
            filter: None,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Snapshot directory, a `YYYYMMDD` date or `latest`.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn kind(&self) -> DumpKind {
        self.kind
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn filter(&self) -> Option<&PageFilter> {
        self.filter.as_ref()
    }

    /// One name standing for the whole dump, with the part number of partitioned dumps
    /// replaced by `X`. Index files of multistream dumps are not considered.
    pub fn descriptive_filename(&self) -> Option<String> {
        static XML: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.xml\b").unwrap());
        static PART: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"\d+\.(\w+)(?:-p\d+p\d+)?").unwrap());

        self.files
            .iter()
            .find(|name| XML.is_match(name))
            .map(|name| PART.replace(name, "X.${1}").into_owned())
    }

    pub fn filter_titles<I, S>(mut self, titles: I) -> Result<Self, DumpError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(PageFilter::Ids(_)) = self.filter {
            return Err(DumpError::FilterConflict(
                "cannot filter titles on a dump that is already filtered by page ids",
            ));
        }
        self.filter = Some(PageFilter::titles(titles));
        Ok(self)
    }

    pub fn filter_ids(mut self, ids: impl IntoIterator<Item = u64>) -> Result<Self, DumpError> {
        if let Some(PageFilter::Titles(_)) = self.filter {
            return Err(DumpError::FilterConflict(
                "cannot filter page ids on a dump that is already filtered by titles",
            ));
        }
        self.filter = Some(PageFilter::ids(ids));
        Ok(self)
    }

    /// Whether a file can hold a wanted page, judged by the page id range in its name.
    fn may_contain_wanted(&self, filename: &str) -> bool {
        let (Some(PageFilter::Ids(ids)), Some((start, end))) =
            (&self.filter, PartInfo::of(filename).range)
        else {
            return true;
        };
        match (ids.iter().min(), ids.iter().max()) {
            (Some(&min), Some(&max)) => min <= end && start <= max,
            _ => false,
        }
    }

    fn sources(&self) -> Result<VecDeque<Source>, DumpError> {
        let sources = if self.kind.is_multistream() {
            pair_multistream(&self.files)?
        } else {
            self.files.iter().cloned().map(Source::Plain).collect()
        };

        Ok(sources
            .into_iter()
            .filter(|source| {
                let keep = self.may_contain_wanted(source.name());
                if !keep {
                    tracing::debug!(message = "Skipping file outside the wanted page ids", file = source.name());
                }
                keep
            })
            .collect())
    }

    fn open_plain(&self, filename: &str) -> Result<Box<dyn io::BufRead + Send>, DumpError> {
        let path = [self.database.as_str(), self.directory.as_str(), filename];
        tracing::info!(message = "Reading", file = %self.backend.location(&path));
        Ok(open_decompressed(self.backend.open(&path)?)?)
    }

    fn open_source(&self, source: &Source) -> Result<RevisionIter, DumpError> {
        match (source, &self.filter) {
            (Source::Multistream { main, index }, Some(filter)) => {
                let main_path = [self.database.as_str(), self.directory.as_str(), main.as_str()];
                let index_path = [self.database.as_str(), self.directory.as_str(), index.as_str()];
                let Some(archive) = self.backend.local_path(&main_path) else {
                    return Err(DumpError::NotSeekable(self.backend.location(&main_path)));
                };
                tracing::info!(message = "Reading", file = %archive.display());
                let index = open_decompressed(self.backend.open(&index_path)?)?;
                let reader =
                    MultistreamReader::new(std::fs::File::open(&archive)?, index, filter.clone())?;
                Ok(Box::new(reader))
            }
            // without a filter every block is needed, so the dump is read front to back
            (Source::Multistream { main, .. }, None) | (Source::Plain(main), _) => {
                Ok(Box::new(DumpParser::new(self.open_plain(main)?)))
            }
        }
    }

    /// Lazily read the revisions of all files, in file order. Files are opened one at a time
    /// as the previous one is exhausted.
    pub fn revisions(&self) -> Result<Revisions<'_>, DumpError> {
        Ok(Revisions {
            dump: self,
            pending: self.sources()?,
            current: None,
            finished: false,
        })
    }

    /// Push every (matching) revision to `consumer`, file by file.
    pub fn for_each_revision(&self, mut consumer: impl FnMut(Revision)) -> Result<(), DumpError> {
        for source in self.sources()? {
            match (&source, &self.filter) {
                (Source::Plain(name), filter) => {
                    push_parser::for_each_revision(self.open_plain(name)?, |revision| {
                        if filter.as_ref().map_or(true, |f| f.matches(&revision)) {
                            consumer(revision)
                        }
                    })?;
                }
                _ => {
                    for revision in self.open_source(&source)? {
                        consumer(revision?);
                    }
                }
            }
        }
        Ok(())
    }

    /// Like [`Dump::for_each_revision`], with the consumer running on a worker pool.
    /// Consumers are called in no particular order.
    pub fn par_for_each_revision(
        &self,
        consumer: impl Fn(Revision) + Send + Sync,
    ) -> Result<(), DumpError> {
        let filter = self.filter.as_ref();
        for source in self.sources()? {
            match &source {
                Source::Plain(name) => {
                    push_parser::par_for_each_revision(self.open_plain(name)?, |revision| {
                        if filter.map_or(true, |f| f.matches(&revision)) {
                            consumer(revision)
                        }
                    })?;
                }
                _ => {
                    self.open_source(&source)?
                        .par_bridge()
                        .try_for_each(|revision| revision.map(&consumer))?;
                }
            }
        }
        Ok(())
    }
}

type RevisionIter = Box<dyn Iterator<Item = Result<Revision, ParsingError>> + Send>;

/// Iterator over the revisions of a [`Dump`], see [`Dump::revisions`].
pub struct Revisions<'a> {
    dump: &'a Dump,
    pending: VecDeque<Source>,
    current: Option<RevisionIter>,
    finished: bool,
}

impl fmt::Debug for Revisions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Revisions")
            .field("dump", &self.dump)
            .field("pending", &self.pending)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Iterator for Revisions<'_> {
    type Item = Result<Revision, DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let Some(current) = &mut self.current else {
                let Some(source) = self.pending.pop_front() else {
                    self.finished = true;
                    return None;
                };
                match self.dump.open_source(&source) {
                    Ok(iter) => self.current = Some(iter),
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
                continue;
            };

            match current.next() {
                Some(Ok(revision)) => {
                    if self.dump.filter.as_ref().map_or(true, |f| f.matches(&revision)) {
                        return Some(Ok(revision));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
                None => self.current = None,
            }
        }
        None
    }
}
