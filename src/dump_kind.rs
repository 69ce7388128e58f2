use std::{fmt, str::FromStr};

use regex::Regex;

/// The kinds of XML dump published per snapshot.
///
/// Partitioned kinds (split into numbered parts) and their recombined single-file
/// counterparts fall back to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DumpKind {
    StubsMetaHistory,
    StubsMetaCurrent,
    StubsArticles,
    StubsMetaHistoryRecombine,
    StubsMetaCurrentRecombine,
    StubsArticlesRecombine,
    PagesMetaHistory,
    PagesMetaCurrent,
    PagesMetaCurrentRecombine,
    PagesArticles,
    PagesArticlesRecombine,
    PagesArticlesMultistream,
    PagesArticlesMultistreamRecombine,
    Abstracts,
    AbstractsRecombine,
    PagesMetaHistoryIncr,
    StubsMetaHistoryIncr,
}

impl DumpKind {
    pub const ALL: [DumpKind; 17] = [
        DumpKind::StubsMetaHistory,
        DumpKind::StubsMetaCurrent,
        DumpKind::StubsArticles,
        DumpKind::StubsMetaHistoryRecombine,
        DumpKind::StubsMetaCurrentRecombine,
        DumpKind::StubsArticlesRecombine,
        DumpKind::PagesMetaHistory,
        DumpKind::PagesMetaCurrent,
        DumpKind::PagesMetaCurrentRecombine,
        DumpKind::PagesArticles,
        DumpKind::PagesArticlesRecombine,
        DumpKind::PagesArticlesMultistream,
        DumpKind::PagesArticlesMultistreamRecombine,
        DumpKind::Abstracts,
        DumpKind::AbstractsRecombine,
        DumpKind::PagesMetaHistoryIncr,
        DumpKind::StubsMetaHistoryIncr,
    ];

    /// Key of the job producing this kind in `dumpstatus.json`.
    ///
    /// Incremental dumps have no manifest and therefore no key.
    pub fn job_key(self) -> Option<&'static str> {
        use DumpKind::*;
        match self {
            StubsMetaHistory | StubsMetaCurrent | StubsArticles => Some("xmlstubsdump"),
            StubsMetaHistoryRecombine | StubsMetaCurrentRecombine | StubsArticlesRecombine => {
                Some("xmlstubsdumprecombine")
            }
            PagesMetaHistory => Some("metahistorybz2dump"),
            PagesMetaCurrent => Some("metacurrentdump"),
            PagesMetaCurrentRecombine => Some("metacurrentdumprecombine"),
            PagesArticles => Some("articlesdump"),
            PagesArticlesRecombine => Some("articlesdumprecombine"),
            PagesArticlesMultistream => Some("articlesmultistreamdump"),
            PagesArticlesMultistreamRecombine => Some("articlesmultistreamdumprecombine"),
            Abstracts => Some("abstractsdump"),
            AbstractsRecombine => Some("abstractsdumprecombine"),
            PagesMetaHistoryIncr | StubsMetaHistoryIncr => None,
        }
    }

    /// File name pattern with `${database}` and `${date}` placeholders.
    pub fn naming_template(self) -> &'static str {
        use DumpKind::*;
        match self {
            StubsMetaHistory => r"${database}-${date}-stub-meta-history\d+\.xml(\.gz)?",
            StubsMetaCurrent => r"${database}-${date}-stub-meta-current\d+\.xml(\.gz)?",
            StubsArticles => r"${database}-${date}-stub-articles\d+\.xml(\.gz)?",
            StubsMetaHistoryRecombine => r"${database}-${date}-stub-meta-history\.xml(\.gz)?",
            StubsMetaCurrentRecombine => r"${database}-${date}-stub-meta-current\.xml(\.gz)?",
            StubsArticlesRecombine => r"${database}-${date}-stub-articles\.xml(\.gz)?",
            // history is never recombined
            PagesMetaHistory => {
                r"${database}-${date}-pages-meta-history(\d+\.xml-p\d+p\d+|\.xml)(\.bz2)?"
            }
            PagesMetaCurrent => r"${database}-${date}-pages-meta-current\d+\.xml-p\d+p\d+(\.bz2)?",
            PagesMetaCurrentRecombine => r"${database}-${date}-pages-meta-current\.xml(\.bz2)?",
            PagesArticles => r"${database}-${date}-pages-articles\d+\.xml-p\d+p\d+(\.bz2)?",
            PagesArticlesRecombine => r"${database}-${date}-pages-articles\.xml(\.bz2)?",
            // multistream files are only useful compressed
            PagesArticlesMultistream => {
                r"${database}-${date}-pages-articles-multistream(\d+\.xml|-index\d+\.txt)-p\d+p\d+\.bz2"
            }
            PagesArticlesMultistreamRecombine => {
                r"${database}-${date}-pages-articles-multistream(\.xml|-index\.txt)\.bz2"
            }
            Abstracts => r"${database}-${date}-abstract\d+\.xml(\.gz)?",
            AbstractsRecombine => r"${database}-${date}-abstract\.xml(\.gz)?",
            PagesMetaHistoryIncr => r"${database}-${date}-pages-meta-hist-incr\.xml(\.bz2)?",
            StubsMetaHistoryIncr => r"${database}-${date}-stubs-meta-hist-incr\.xml(\.gz)?",
        }
    }

    /// Anchored regex matching the file names of this kind for one database and snapshot
    /// directory (`YYYYMMDD` or `latest`).
    pub fn naming_scheme(self, database: &str, directory: &str) -> Regex {
        let pattern = self
            .naming_template()
            .replace("${database}", &regex::escape(database))
            .replace("${date}", &regex::escape(directory));
        Regex::new(&format!("^(?:{pattern})$"))
            .expect("templates are valid and substitutions are escaped")
    }

    /// The kind to try when this one's job is missing or not done.
    pub fn fallback(self) -> Option<DumpKind> {
        use DumpKind::*;
        match self {
            StubsMetaHistory => Some(StubsMetaHistoryRecombine),
            StubsMetaCurrent => Some(StubsMetaCurrentRecombine),
            StubsArticles => Some(StubsArticlesRecombine),
            PagesMetaCurrent => Some(PagesMetaCurrentRecombine),
            PagesArticles => Some(PagesArticlesRecombine),
            PagesArticlesMultistream => Some(PagesArticlesMultistreamRecombine),
            Abstracts => Some(AbstractsRecombine),
            StubsMetaHistoryRecombine => Some(StubsMetaHistory),
            StubsMetaCurrentRecombine => Some(StubsMetaCurrent),
            StubsArticlesRecombine => Some(StubsArticles),
            PagesMetaCurrentRecombine => Some(PagesMetaCurrent),
            PagesArticlesRecombine => Some(PagesArticles),
            PagesArticlesMultistreamRecombine => Some(PagesArticlesMultistream),
            AbstractsRecombine => Some(Abstracts),
            PagesMetaHistory | PagesMetaHistoryIncr | StubsMetaHistoryIncr => None,
        }
    }

    pub fn is_incremental(self) -> bool {
        matches!(
            self,
            DumpKind::PagesMetaHistoryIncr | DumpKind::StubsMetaHistoryIncr
        )
    }

    pub fn is_multistream(self) -> bool {
        matches!(
            self,
            DumpKind::PagesArticlesMultistream | DumpKind::PagesArticlesMultistreamRecombine
        )
    }

    pub fn label(self) -> &'static str {
        use DumpKind::*;
        match self {
            StubsMetaHistory => "STUBS_META_HISTORY",
            StubsMetaCurrent => "STUBS_META_CURRENT",
            StubsArticles => "STUBS_ARTICLES",
            StubsMetaHistoryRecombine => "STUBS_META_HISTORY_RECOMBINE",
            StubsMetaCurrentRecombine => "STUBS_META_CURRENT_RECOMBINE",
            StubsArticlesRecombine => "STUBS_ARTICLES_RECOMBINE",
            PagesMetaHistory => "PAGES_META_HISTORY",
            PagesMetaCurrent => "PAGES_META_CURRENT",
            PagesMetaCurrentRecombine => "PAGES_META_CURRENT_RECOMBINE",
            PagesArticles => "PAGES_ARTICLES",
            PagesArticlesRecombine => "PAGES_ARTICLES_RECOMBINE",
            PagesArticlesMultistream => "PAGES_ARTICLES_MULTISTREAM",
            PagesArticlesMultistreamRecombine => "PAGES_ARTICLES_MULTISTREAM_RECOMBINE",
            Abstracts => "ABSTRACTS",
            AbstractsRecombine => "ABSTRACTS_RECOMBINE",
            PagesMetaHistoryIncr => "PAGES_META_HISTORY_INCR",
            StubsMetaHistoryIncr => "STUBS_META_HISTORY_INCR",
        }
    }
}

impl fmt::Display for DumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown dump kind {0:?}")]
pub struct UnknownDumpKind(pub String);

impl FromStr for DumpKind {
    type Err = UnknownDumpKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_ascii_uppercase().replace('-', "_");
        DumpKind::ALL
            .into_iter()
            .find(|kind| kind.label() == label)
            .ok_or_else(|| UnknownDumpKind(s.to_owned()))
    }
}
