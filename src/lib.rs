// SPDX-License-Identifier: MPL-2.0
//! # wikidumps
//!
//! Streaming access to Wikimedia XML dumps: finding the right snapshot, reading only the parts of
//! an archive you need, parsing revisions and aggregating them into time series.
//!
//! ## Overview
//!
//! A dump is a set of compressed XML files (bzip2, gzip or zstd) published per database and
//! snapshot date, described by a `dumpstatus.json` manifest. `wikidumps` covers the path from a
//! database name to a stream of [`Revision`](revision::Revision) records:
//!
//! - **Discovery**: resolve a database, a [`DumpKind`](dump_kind::DumpKind) and a snapshot policy
//!   (latest, on a date, on or after a date) against a local mirror or an HTTP server.
//! - **Parsing**: a lazy pull parser ([`DumpParser`](dump_parser::DumpParser)) and a push parser
//!   ([`push_parser`]) with a concurrent variant, both over the same field grammar.
//! - **Selective reading**: multistream archives are read through their side index, decompressing
//!   only the blocks that hold the requested pages.
//! - **Aggregation**: fold a revision stream into a [`Timeline`](timeline::Timeline) where every
//!   page contributes the value of its latest revision at each instant.
//!
//! ## Basic Usage
//!
//! Parse a local dump file:
//!
//! ```rust,no_run
//! use std::fs::File;
//! use std::io::BufReader;
//! use wikidumps::dump_parser::DumpParser;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let xml_dump = File::open("dewiktionary-20240901-stub-meta-history.xml")?;
//!     let parser = DumpParser::new(BufReader::new(xml_dump));
//!
//!     for revision in parser {
//!         let revision = revision?;
//!         println!("{} @ {}: {}", revision.title, revision.timestamp, revision.id);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Finding a Dump
//!
//! ```rust,no_run
//! use wikidumps::backend::DEFAULT_REMOTE_BASE;
//! use wikidumps::discovery::{parse_date, DumpConfig};
//! use wikidumps::dump_kind::DumpKind;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dump = DumpConfig::new("dewiktionary")
//!         .remote(DEFAULT_REMOTE_BASE)
//!         .after(parse_date("20240501")?)
//!         .kind(DumpKind::PagesArticles)
//!         .fetch()?;
//!
//!     let Some(dump) = dump else {
//!         eprintln!("no finished snapshot yet");
//!         return Ok(());
//!     };
//!     for revision in dump.revisions()? {
//!         println!("{}", revision?.title);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! Discovery returns `Ok(None)` when no snapshot qualifies. Conflicting settings (for example
//! `latest()` together with a date) are reported as errors.
//!
//! ### Reading a Few Pages of a Multistream Dump
//!
//! ```rust,no_run
//! use std::path::Path;
//! use wikidumps::multistream::MultistreamReader;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let reader = MultistreamReader::of_titles(
//!         Path::new("enwiki-20240501-pages-articles-multistream.xml.bz2"),
//!         Path::new("enwiki-20240501-pages-articles-multistream-index.txt.bz2"),
//!         ["Rust (programming language)", "Ferris"],
//!     )?;
//!     let stats = reader.stats();
//!
//!     for revision in reader {
//!         println!("{}", revision?.title);
//!     }
//!     eprintln!("{} blocks decompressed", stats.blocks_decompressed());
//!
//!     Ok(())
//! }
//! ```
//!
//! ### Aggregating over Time
//!
//! ```rust,no_run
//! use chrono::{TimeZone, Utc};
//! use wikidumps::discovery::DumpConfig;
//! use wikidumps::dump_kind::DumpKind;
//! use wikidumps::timeline::{counting, Period, Timeline};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let Some(dump) = DumpConfig::new("plwiktionary")
//!         .local("./data/dumps")
//!         .kind(DumpKind::StubsMetaHistory)
//!         .fetch()?
//!     else {
//!         return Ok(());
//!     };
//!
//!     let timeline = Timeline::new(
//!         Utc.with_ymd_and_hms(2010, 1, 1, 0, 0, 0).unwrap(),
//!         Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
//!         Period::Months(1),
//!     )?;
//!     let articles = counting(timeline, |r| r.is_main_namespace() && !r.is_redirect())
//!         .consume(dump.revisions()?)?;
//!     println!("{articles}");
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Parallel Processing
//!
//! XML parsing is linear. [`push_parser::par_for_each_revision`] keeps parsing on the calling
//! thread and hands every revision to a `rayon` worker pool; the call returns once all tasks
//! have finished. Consumers run in no particular order and need their own synchronization.
//!
//! The timeline collector relies on revisions arriving grouped by page and in revision order,
//! so it is always fed from a sequential stream.
//!
//! ## Logging and Error Handling
//!
//! - Uses the `tracing` crate for warnings (skipped blocks, malformed field values) and for
//!   progress information (index scans, files being read).
//! - A compressed block that fails to decompress is logged and skipped; the stream continues
//!   with the next block.
//! - Malformed field values (a non-numeric id, an unparsable timestamp) are logged and replaced by
//!   a default. Enable the `strict` feature to make the parser fail on them instead.
//!
//! ```toml
//! [dependencies]
//! wikidumps = { version = "0.1.0", features = ["strict"] }
//! ```
//!
//! ## Limitations
//!
//! - **XML Format Compatibility**: Tested with the Wikimedia export format version 0.11.
//! - **Multistream dumps** can only be filtered when the archive is on the local filesystem,
//!   since block selection needs to seek.
//!
//! ## Dependencies
//!
//! - **`compact_str`**: Used in the public API for short strings (titles, contributor names).
//! - **`chrono`**: Timestamps and snapshot dates.

pub mod backend;
pub mod block_stream;
pub mod discovery;
pub mod dump;
pub mod dump_kind;
pub mod dump_parser;
pub mod multistream;
pub mod push_parser;
pub mod revision;
pub mod timeline;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod test_support;
