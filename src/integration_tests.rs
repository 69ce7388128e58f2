use std::{fs, io::Cursor, path::Path};

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::{
    block_stream::Compression,
    discovery::{DumpConfig, ListingCache},
    dump_kind::DumpKind,
    dump_parser::DumpParser,
    multistream::{MultistreamReader, PageFilter},
    push_parser,
    revision::Revision,
    test_support::{prelude::*, proptest::page_revisions},
    timeline::{self, Period, Timeline},
};

fn page(page_id: u64, id: u64, title: &str) -> Revision {
    Revision {
        page_id,
        id,
        title: title.into(),
        ..dummy_revision()
    }
}

fn pull(xml: &str) -> Vec<Revision> {
    DumpParser::new(xml.as_bytes())
        .collect::<Result<_, _>>()
        .unwrap()
}

fn push(xml: &str) -> Vec<Revision> {
    let mut revisions = Vec::new();
    push_parser::for_each_revision(xml.as_bytes(), |r| revisions.push(r)).unwrap();
    revisions
}

proptest! {
    #[test]
    fn pull_and_push_parsers_agree(revisions in page_revisions(8)) {
        let xml = wrap_in_root(&pages_to_xml(&revisions));
        let pulled = pull(&xml);
        prop_assert_eq!(&pulled, &revisions);
        prop_assert_eq!(push(&xml), pulled);
    }

    #[test]
    fn revisions_of_a_page_are_chronological(revisions in page_revisions(8)) {
        let xml = wrap_in_root(&pages_to_xml(&revisions));
        let parsed = pull(&xml);

        for page in parsed.chunk_by(|a, b| a.page_id == b.page_id) {
            let mut by_id: Vec<_> = page.iter().map(|r| r.id).collect();
            by_id.sort_unstable();
            let mut by_time = page.to_vec();
            by_time.sort_by_key(|r| (r.timestamp, r.id));
            let by_time: Vec<_> = by_time.iter().map(|r| r.id).collect();
            prop_assert_eq!(by_id, by_time);
        }
    }
}

/// Five blocks of two pages each, titles `P1` to `P10`.
fn five_blocks() -> Vec<Vec<Revision>> {
    (0..5u64)
        .map(|block| {
            (1..=2)
                .map(|i| {
                    let page_id = block * 2 + i;
                    page(page_id, page_id * 100, &format!("P{page_id}"))
                })
                .collect()
        })
        .collect()
}

#[test]
fn title_filter_decompresses_only_matching_blocks() {
    let archive = multistream_archive(&five_blocks());
    let wanted = ["P2", "P7", "P8", "Missing"];

    let reader = MultistreamReader::new(
        Cursor::new(archive.data),
        archive.index.as_bytes(),
        PageFilter::titles(wanted),
    )
    .unwrap();
    let stats = reader.stats();
    let titles: Vec<_> = reader.map(|r| r.unwrap().title.to_string()).collect();

    assert_eq!(titles, vec!["P2", "P7", "P8"]);
    // P2 lives in the first block, P7 and P8 share the fourth
    assert_eq!(stats.blocks_decompressed(), 2);
    assert_eq!(stats.blocks_skipped(), 0);
}

#[test]
fn corrupted_block_is_skipped() {
    let mut archive = multistream_archive(&five_blocks());
    let corrupt = archive.block_offsets[2] as usize;
    archive.data[corrupt..corrupt + 3].copy_from_slice(b"XXX");

    let reader = MultistreamReader::new(
        Cursor::new(archive.data),
        archive.index.as_bytes(),
        PageFilter::ids(1..=10),
    )
    .unwrap();
    let stats = reader.stats();
    let (ids, warnings) = count_warnings("wikidumps::block_stream", || {
        reader.map(|r| r.unwrap().page_id).collect::<Vec<_>>()
    });

    assert_eq!(ids, vec![1, 2, 3, 4, 7, 8, 9, 10]);
    assert_eq!(warnings, 1);
    assert_eq!(stats.blocks_skipped(), 1);
    assert_eq!(stats.blocks_decompressed(), 4);
}

fn write_manifest(root: &Path, files: &[&str]) {
    let dir = root.join("public/db/20240501");
    fs::create_dir_all(&dir).unwrap();
    let files: serde_json::Map<_, _> = files
        .iter()
        .map(|name| (name.to_string(), json!({ "size": 1 })))
        .collect();
    let manifest = json!({
        "jobs": {
            "articlesdump": { "status": "done", "files": files },
            "metacurrentdump": { "status": "done", "files": {} }
        },
        "version": "0.8"
    });
    fs::write(dir.join("dumpstatus.json"), manifest.to_string()).unwrap();
}

#[test]
fn manifest_files_round_trip() {
    let root = tempfile::tempdir().unwrap();
    write_manifest(
        root.path(),
        &[
            "db-20240501-pages-articles3.xml-p21p30.bz2",
            "db-20240501-pages-articles1.xml-p1p10.bz2",
            "db-20240501-pages-articles-multistream1.xml-p1p10.bz2",
            "db-20240501-pages-articles2.xml-p11p20.bz2",
        ],
    );
    let config = DumpConfig::new("db")
        .local(root.path())
        .kind(DumpKind::PagesArticles);

    let first = config.fetch().unwrap().unwrap();
    assert_eq!(
        first.files(),
        [
            "db-20240501-pages-articles1.xml-p1p10.bz2",
            "db-20240501-pages-articles2.xml-p11p20.bz2",
            "db-20240501-pages-articles3.xml-p21p30.bz2",
        ]
    );

    // unchanged manifest, fresh and shared caches alike
    let second = config.fetch().unwrap().unwrap();
    let mut cache = ListingCache::new();
    let third = config.fetch_with_cache(&mut cache).unwrap().unwrap();
    assert_eq!(first.files(), second.files());
    assert_eq!(first.files(), third.files());
    assert_eq!(first.directory(), third.directory());
}

fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap()
}

#[test]
fn discovered_dump_feeds_timeline() {
    let day = 86_400;
    let t0 = 1_700_000_000;
    let revisions = vec![
        Revision {
            timestamp: at(t0 - 1),
            text: Some("a".into()),
            ..page(1, 1, "One")
        },
        Revision {
            timestamp: at(t0 + day + 1),
            text: Some("bb".into()),
            ..page(2, 2, "Two")
        },
        Revision {
            timestamp: at(t0 + 2 * day + 1),
            parent_id: 2,
            text: Some("bbbbbb".into()),
            ..page(2, 3, "Two")
        },
    ];

    let root = tempfile::tempdir().unwrap();
    let name = "db-20240501-pages-articles1.xml-p1p2.bz2";
    write_manifest(root.path(), &[name]);
    let xml = wrap_in_root(&pages_to_xml(&revisions));
    fs::write(
        root.path().join("public/db/20240501").join(name),
        compress(Compression::Bzip2, xml.as_bytes()),
    )
    .unwrap();

    let dump = DumpConfig::new("db")
        .local(root.path())
        .kind(DumpKind::PagesArticles)
        .fetch()
        .unwrap()
        .unwrap();

    let buckets = Timeline::new(at(t0), at(t0 + 3 * day), Period::Days(1)).unwrap();
    let lengths = timeline::mapping(buckets, |r: &Revision| {
        r.text.as_deref().map_or(0, |t| t.len() as u64)
    })
    .consume(dump.revisions().unwrap())
    .unwrap();

    // page two only shows after its first revision, its later revision replaces the earlier one
    assert_eq!(lengths.values().copied().collect::<Vec<_>>(), vec![1, 1, 3, 7]);

    let buckets = Timeline::new(at(t0), at(t0 + 3 * day), Period::Days(1)).unwrap();
    let pages = timeline::counting(buckets, |_: &Revision| true)
        .consume(dump.revisions().unwrap())
        .unwrap();
    assert_eq!(pages.values().copied().collect::<Vec<_>>(), vec![1, 1, 2, 2]);
}

#[test]
fn filter_on_discovered_multistream_dump() {
    let root = tempfile::tempdir().unwrap();
    let files = [
        "db-20240501-pages-articles-multistream.xml.bz2",
        "db-20240501-pages-articles-multistream-index.txt.bz2",
    ];
    let dir = root.path().join("public/db/20240501");
    fs::create_dir_all(&dir).unwrap();
    let manifest = json!({
        "jobs": {
            "articlesmultistreamdumprecombine": {
                "status": "done",
                "files": { files[0]: {}, files[1]: {} }
            }
        }
    });
    fs::write(dir.join("dumpstatus.json"), manifest.to_string()).unwrap();

    let archive = multistream_archive(&five_blocks());
    fs::write(dir.join(files[0]), &archive.data).unwrap();
    fs::write(
        dir.join(files[1]),
        compress(Compression::Bzip2, archive.index.as_bytes()),
    )
    .unwrap();

    let dump = DumpConfig::new("db")
        .local(root.path())
        .kind(DumpKind::PagesArticlesMultistreamRecombine)
        .fetch()
        .unwrap()
        .unwrap()
        .filter_titles(["P5", "P10"])
        .unwrap();

    let titles: Vec<_> = dump
        .revisions()
        .unwrap()
        .map(|r| r.unwrap().title.to_string())
        .collect();
    assert_eq!(titles, vec!["P5", "P10"]);
}
