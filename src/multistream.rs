//! Selective reading of multistream archives through their side index.
//!
//! The index has one `OFFSET:PAGEID:TITLE` line per page. All pages sharing an offset live in
//! the same compressed block, so a set of wanted pages translates into a set of blocks.

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek},
    path::Path,
    sync::Arc,
};

use rustc_hash::FxHashSet;

use crate::{
    block_stream::{open_decompressed, BlockStats, BlockStream},
    dump_parser::{DumpParser, ParsingError},
    revision::Revision,
};

#[derive(Debug, thiserror::Error)]
pub enum MultistreamError {
    #[error("failed to read multistream archive or index")]
    Io(#[from] io::Error),
    #[error("malformed index line {line}: {content:?}")]
    MalformedIndex { line: usize, content: String },
}

/// Which pages to keep. Titles and page ids cannot be mixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageFilter {
    Titles(FxHashSet<String>),
    Ids(FxHashSet<u64>),
}

impl PageFilter {
    pub fn titles<I, S>(titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        PageFilter::Titles(titles.into_iter().map(Into::into).collect())
    }

    pub fn ids(ids: impl IntoIterator<Item = u64>) -> Self {
        PageFilter::Ids(ids.into_iter().collect())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PageFilter::Titles(titles) => titles.is_empty(),
            PageFilter::Ids(ids) => ids.is_empty(),
        }
    }

    pub fn matches_page(&self, page_id: u64, title: &str) -> bool {
        match self {
            PageFilter::Titles(titles) => titles.contains(title),
            PageFilter::Ids(ids) => ids.contains(&page_id),
        }
    }

    pub fn matches(&self, revision: &Revision) -> bool {
        self.matches_page(revision.page_id, &revision.title)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry<'a> {
    pub offset: u64,
    pub page_id: u64,
    pub title: &'a str,
}

impl<'a> IndexEntry<'a> {
    /// Parse one index line. The title is everything after the second colon and may itself
    /// contain colons.
    pub fn parse(line: &'a str) -> Option<Self> {
        let first = memchr::memchr(b':', line.as_bytes())?;
        let second = first + 1 + memchr::memchr(b':', &line.as_bytes()[first + 1..])?;
        Some(IndexEntry {
            offset: line[..first].parse().ok()?,
            page_id: line[first + 1..second].parse().ok()?,
            title: &line[second + 1..],
        })
    }
}

/// Result of scanning an index against a [`PageFilter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSelection {
    /// distinct offsets of blocks with at least one wanted page, in index order
    pub offsets: Vec<u64>,
    /// pages living in the selected blocks
    pub retained_pages: u64,
    pub total_pages: u64,
    pub total_blocks: u64,
}

/// Scan the index once, collecting the blocks that hold a wanted page.
#[tracing::instrument(skip_all)]
pub fn select_offsets<R: BufRead>(
    mut index: R,
    filter: &PageFilter,
) -> Result<ChunkSelection, MultistreamError> {
    let mut selection = ChunkSelection::default();
    let mut seen = FxHashSet::default();
    let mut line = String::new();
    let mut line_number = 0;

    // offset of the block currently being scanned, its page count and whether one of them matched
    let mut current_block: Option<u64> = None;
    let mut block_pages = 0;
    let mut block_matched = false;

    loop {
        line.clear();
        if index.read_line(&mut line)? == 0 {
            break;
        }
        line_number += 1;

        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            continue;
        }
        let entry = IndexEntry::parse(trimmed).ok_or_else(|| MultistreamError::MalformedIndex {
            line: line_number,
            content: trimmed.to_owned(),
        })?;

        selection.total_pages += 1;
        if current_block != Some(entry.offset) {
            if block_matched {
                selection.retained_pages += block_pages;
            }
            current_block = Some(entry.offset);
            selection.total_blocks += 1;
            block_pages = 0;
            block_matched = false;
        }
        block_pages += 1;

        if filter.matches_page(entry.page_id, entry.title) {
            block_matched = true;
            if seen.insert(entry.offset) {
                selection.offsets.push(entry.offset);
            }
        }
    }
    if block_matched {
        selection.retained_pages += block_pages;
    }

    tracing::info!(
        message = "Scanned multistream index",
        blocks_selected = selection.offsets.len(),
        blocks_total = selection.total_blocks,
        pages_retained = selection.retained_pages,
        pages_total = selection.total_pages
    );
    Ok(selection)
}

/// Revisions of the pages matching a filter, read from only the blocks that contain them.
///
/// Blocks hold sibling pages that were not asked for, so records are filtered again after
/// parsing.
#[derive(Debug)]
pub struct MultistreamReader<R: Read + Seek> {
    parser: DumpParser<BufReader<BlockStream<R>>>,
    filter: PageFilter,
    selection: ChunkSelection,
    stats: Arc<BlockStats>,
}

impl MultistreamReader<File> {
    /// Open an archive and its index. The index may be bzip2-compressed or plain text.
    pub fn open(archive: &Path, index: &Path, filter: PageFilter) -> Result<Self, MultistreamError> {
        let index = open_decompressed(File::open(index)?)?;
        Self::new(File::open(archive)?, index, filter)
    }

    pub fn of_titles<I, S>(archive: &Path, index: &Path, titles: I) -> Result<Self, MultistreamError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::open(archive, index, PageFilter::titles(titles))
    }

    pub fn of_page_ids(
        archive: &Path,
        index: &Path,
        ids: impl IntoIterator<Item = u64>,
    ) -> Result<Self, MultistreamError> {
        Self::open(archive, index, PageFilter::ids(ids))
    }
}

impl<R: Read + Seek> MultistreamReader<R> {
    pub fn new(archive: R, index: impl BufRead, filter: PageFilter) -> Result<Self, MultistreamError> {
        let selection = select_offsets(index, &filter)?;
        let stream = BlockStream::new(archive, selection.offsets.clone());
        let stats = stream.stats();
        let parser = DumpParser::new(BufReader::new(stream)).with_estimated_len(selection.retained_pages);

        Ok(Self {
            parser,
            filter,
            selection,
            stats,
        })
    }

    pub fn selection(&self) -> &ChunkSelection {
        &self.selection
    }

    pub fn stats(&self) -> Arc<BlockStats> {
        Arc::clone(&self.stats)
    }
}

impl<R: Read + Seek> Iterator for MultistreamReader<R> {
    type Item = Result<Revision, ParsingError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.parser.next()? {
                Ok(revision) if !self.filter.matches(&revision) => continue,
                result => return Some(result),
            }
        }
    }
}
