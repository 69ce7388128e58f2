//! Fixtures shared by unit and integration tests: dump XML writer, compressed multistream
//! archives with their side index, and proptest strategies.

use std::{
    io::{Cursor, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use chrono::DateTime;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    Layer,
};

use crate::{block_stream::Compression, revision::Revision};

pub mod prelude {
    pub(crate) use super::{
        compress, count_warnings, dummy_revision, multistream_archive, pages_to_xml,
        wrap_in_root,
    };
    pub(crate) use proptest::prelude::*;
}

/// Counts `WARN` events whose target starts with the given module path.
struct WarningCounter {
    target: &'static str,
    count: Arc<AtomicUsize>,
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() == Level::WARN && metadata.target().starts_with(self.target) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Run `f` on the current thread and count the warnings logged from `target` meanwhile.
pub fn count_warnings<R>(target: &'static str, f: impl FnOnce() -> R) -> (R, usize) {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarningCounter {
        target,
        count: Arc::clone(&count),
    });
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, count.load(Ordering::Relaxed))
}

pub fn dummy_revision() -> Revision {
    Revision {
        title: "Dummy".into(),
        namespace: 0,
        page_id: 1,
        id: 1,
        parent_id: 0,
        timestamp: DateTime::from_timestamp(1_000_000_000, 0).unwrap(),
        contributor: Some("Dummy".into()),
        anonymous: false,
        minor: false,
        comment: "".into(),
        text: Some("".into()),
        bytes: None,
        redirect: false,
        revision_deleted: false,
        comment_deleted: false,
        contributor_deleted: false,
    }
}

pub fn wrap_in_root(fragment: &str) -> String {
    format!("<mediawiki>\n{fragment}\n</mediawiki>")
}

fn write_text_element<W: Write>(writer: &mut quick_xml::Writer<W>, name: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .unwrap();
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .unwrap();
    writer.write_event(Event::End(BytesEnd::new(name))).unwrap();
}

fn deleted(name: &str) -> BytesStart<'_> {
    BytesStart::new(name).with_attributes([("deleted", "deleted")])
}

/// Serialize revisions as `<page>` elements, one page per run of equal page ids.
///
/// Page-level fields are taken from the first revision of each run.
pub fn pages_to_xml(revisions: &[Revision]) -> String {
    let mut xml = Vec::new();
    let mut writer = quick_xml::Writer::new(Cursor::new(&mut xml));

    for page in revisions.chunk_by(|a, b| a.page_id == b.page_id) {
        let first = &page[0];
        writer
            .write_event(Event::Start(BytesStart::new("page")))
            .unwrap();
        write_text_element(&mut writer, "title", &first.title);
        write_text_element(&mut writer, "ns", &first.namespace.to_string());
        write_text_element(&mut writer, "id", &first.page_id.to_string());
        if first.redirect {
            writer
                .write_event(Event::Empty(
                    BytesStart::new("redirect").with_attributes([("title", "Target")]),
                ))
                .unwrap();
        }

        for revision in page {
            writer
                .write_event(Event::Start(BytesStart::new("revision")))
                .unwrap();
            write_text_element(&mut writer, "id", &revision.id.to_string());
            if revision.parent_id != 0 {
                write_text_element(&mut writer, "parentid", &revision.parent_id.to_string());
            }
            write_text_element(
                &mut writer,
                "timestamp",
                &crate::revision::format_timestamp(&revision.timestamp),
            );

            if revision.contributor_deleted {
                writer
                    .write_event(Event::Empty(deleted("contributor")))
                    .unwrap();
            } else if let Some(contributor) = &revision.contributor {
                writer
                    .write_event(Event::Start(BytesStart::new("contributor")))
                    .unwrap();
                if revision.anonymous {
                    write_text_element(&mut writer, "ip", contributor);
                } else {
                    write_text_element(&mut writer, "username", contributor);
                    // contributor ids share the tag name with page and revision ids
                    write_text_element(&mut writer, "id", "4242");
                }
                writer
                    .write_event(Event::End(BytesEnd::new("contributor")))
                    .unwrap();
            }

            if revision.minor {
                writer
                    .write_event(Event::Empty(BytesStart::new("minor")))
                    .unwrap();
            }
            if revision.comment_deleted {
                writer.write_event(Event::Empty(deleted("comment"))).unwrap();
            } else if !revision.comment.is_empty() {
                write_text_element(&mut writer, "comment", &revision.comment);
            }
            write_text_element(&mut writer, "model", "wikitext");
            write_text_element(&mut writer, "format", "text/x-wiki");

            let mut text_start = BytesStart::new("text");
            let bytes = revision.bytes.map(|bytes| bytes.to_string());
            if let Some(bytes) = &bytes {
                text_start.push_attribute(("bytes", bytes.as_str()));
            }
            if revision.revision_deleted {
                text_start.push_attribute(("deleted", "deleted"));
                writer.write_event(Event::Empty(text_start)).unwrap();
            } else if let Some(text) = &revision.text {
                text_start.push_attribute(("xml:space", "preserve"));
                writer.write_event(Event::Start(text_start)).unwrap();
                writer
                    .write_event(Event::Text(BytesText::new(text)))
                    .unwrap();
                writer
                    .write_event(Event::End(BytesEnd::new("text")))
                    .unwrap();
            } else if bytes.is_some() {
                // stub dumps point at the stored text instead of embedding it
                text_start.push_attribute(("id", revision.id.to_string().as_str()));
                writer.write_event(Event::Empty(text_start)).unwrap();
            }

            writer
                .write_event(Event::End(BytesEnd::new("revision")))
                .unwrap();
        }

        writer
            .write_event(Event::End(BytesEnd::new("page")))
            .unwrap();
    }

    String::from_utf8(xml).unwrap()
}

pub fn compress(format: Compression, data: &[u8]) -> Vec<u8> {
    match format {
        Compression::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::fast());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        }
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
            encoder.write_all(data).unwrap();
            encoder.finish().unwrap()
        }
        Compression::Zstd => zstd::encode_all(data, 1).unwrap(),
    }
}

/// A bzip2 multistream archive held in memory.
#[derive(Debug, Clone)]
pub struct MultistreamArchive {
    pub data: Vec<u8>,
    /// `OFFSET:PAGEID:TITLE` lines
    pub index: String,
    /// start of every page block, in file order
    pub block_offsets: Vec<u64>,
}

const SITE_INFO: &str = r#"<mediawiki xmlns="http://www.mediawiki.org/xml/export-0.11/" version="0.11">
  <siteinfo>
    <sitename>Wikipedia</sitename>
    <dbname>testwiki</dbname>
    <namespaces>
      <namespace key="0" case="first-letter" />
    </namespaces>
  </siteinfo>
"#;

/// Build a multistream archive: a header stream with the site info, one stream per entry of
/// `blocks` and a footer stream, like the `pages-articles-multistream` dumps.
pub fn multistream_archive(blocks: &[Vec<Revision>]) -> MultistreamArchive {
    let mut data = compress(Compression::Bzip2, SITE_INFO.as_bytes());
    let mut index = String::new();
    let mut block_offsets = Vec::new();

    for block in blocks {
        let offset = data.len() as u64;
        block_offsets.push(offset);
        for page in block.chunk_by(|a, b| a.page_id == b.page_id) {
            index.push_str(&format!("{offset}:{}:{}\n", page[0].page_id, page[0].title));
        }
        data.extend(compress(Compression::Bzip2, pages_to_xml(block).as_bytes()));
    }
    data.extend(compress(Compression::Bzip2, b"</mediawiki>\n"));

    MultistreamArchive {
        data,
        index,
        block_offsets,
    }
}

pub mod proptest {
    use compact_str::CompactString;
    use proptest::prelude::*;

    use crate::revision::Revision;

    pub fn xml_text() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9 <>&'\"äöü\n]{0,40}"
    }

    pub fn maybe_contributor() -> impl Strategy<Value = (Option<CompactString>, bool, bool)> {
        // (contributor, anonymous, deleted)
        prop_oneof![
            6 => "[A-Za-z][A-Za-z0-9]{0,10}".prop_map(|name| (Some(name.into()), false, false)),
            2 => "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}"
                .prop_map(|ip| (Some(ip.into()), true, false)),
            1 => Just((None, false, true)),
        ]
    }

    prop_compose! {
        fn revision_body()
                (contributor in maybe_contributor(),
                 minor in proptest::bool::weighted(0.2),
                 comment in xml_text(),
                 comment_deleted in proptest::bool::weighted(0.1),
                 text in xml_text(),
                 revision_deleted in proptest::bool::weighted(0.1),
                 stub in proptest::bool::weighted(0.1),
                 seconds in 0i64..2_000_000_000)
        -> Revision {
            let (contributor, anonymous, contributor_deleted) = contributor;
            Revision {
                contributor,
                anonymous,
                contributor_deleted,
                minor,
                comment: if comment_deleted { "".into() } else { comment.into() },
                comment_deleted,
                bytes: (!revision_deleted).then_some(text.len() as u64),
                text: if revision_deleted || stub { None } else { Some(text) },
                revision_deleted,
                timestamp: chrono::DateTime::from_timestamp(seconds, 0).unwrap(),
                ..crate::test_support::dummy_revision()
            }
        }
    }

    /// Revisions of up to `max_pages` pages, in canonical order with chronological timestamps.
    pub fn page_revisions(max_pages: usize) -> impl Strategy<Value = Vec<Revision>> {
        prop::collection::vec(
            (
                "[A-Z][a-z ]{0,12}",
                0i32..4,
                proptest::bool::weighted(0.1),
                prop::collection::vec(revision_body(), 1..5),
            ),
            0..max_pages,
        )
        .prop_map(|pages| {
            let mut next_id = 1;
            let mut revisions = Vec::new();
            for (page_index, (title, namespace, redirect, mut bodies)) in
                pages.into_iter().enumerate()
            {
                bodies.sort_by_key(|r| r.timestamp);
                let mut parent_id = 0;
                for body in bodies {
                    let id = next_id;
                    next_id += 1;
                    revisions.push(Revision {
                        title: format!("{title}{page_index}").into(),
                        namespace,
                        redirect,
                        page_id: page_index as u64 + 1,
                        id,
                        parent_id,
                        ..body
                    });
                    parent_id = id;
                }
            }
            revisions
        })
    }
}
