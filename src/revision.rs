use std::cmp::Ordering;

use chrono::{DateTime, NaiveDateTime, Utc};
use compact_str::CompactString;

/// One historical revision of one page, as read from a dump.
///
/// Page-level fields (`title`, `namespace`, `page_id`, `redirect`) are repeated on every
/// revision of the page, so a record is self-contained.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub title: CompactString,
    pub namespace: i32,
    pub page_id: u64,
    pub id: u64,
    /// 0 if the revision has no parent
    pub parent_id: u64,
    pub timestamp: DateTime<Utc>,
    /// `None` if the contributor was suppressed
    pub contributor: Option<CompactString>,
    pub anonymous: bool,
    pub minor: bool,
    pub comment: CompactString,
    /// `None` for stub dumps and suppressed revisions
    pub text: Option<String>,
    /// Size of the text in bytes as declared by the dump, available in stub dumps too
    pub bytes: Option<u64>,
    pub redirect: bool,
    pub revision_deleted: bool,
    pub comment_deleted: bool,
    pub contributor_deleted: bool,
}

impl Revision {
    pub fn is_main_namespace(&self) -> bool {
        self.namespace == 0
    }

    pub fn is_redirect(&self) -> bool {
        self.redirect
    }

    /// Order by page id, then by revision id.
    ///
    /// This is the order in which dumps list revisions and the one the timeline collector
    /// relies on.
    pub fn cmp_canonical(&self, other: &Revision) -> Ordering {
        self.page_id
            .cmp(&other.page_id)
            .then_with(|| self.id.cmp(&other.id))
    }
}

// Source: https://github.com/mediawiki-utilities/python-mwtypes/blob/523a93f98fe1372938fc15872b5abb1f267cc643/mwtypes/timestamp.py#L12
const TIMESTAMP_FORMAT_LONG: &str = "%Y-%m-%dT%H:%M:%SZ";
const TIMESTAMP_FORMAT_SHORT: &str = "%Y%m%d%H%M%S";

/// Parse a dump timestamp, accepting both the ISO-8601 form used in XML dumps and the
/// compact form used by the database.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT_LONG)
        .or_else(|_| NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT_SHORT))
        .ok()
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT_LONG).to_string()
}
