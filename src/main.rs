use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Args, Parser, Subcommand};
use rustc_hash::FxHashSet;
use tracing::Level;
use wikidumps::{
    backend::DEFAULT_LOCAL_ROOT,
    block_stream::open_decompressed,
    discovery::{parse_date, DumpConfig},
    dump::Dump,
    dump_kind::DumpKind,
    multistream::{select_offsets, PageFilter},
    revision::format_timestamp,
    timeline::{counting, Period, Timeline},
};

#[derive(Debug, Parser)]
#[command(name = "wikidumps")]
#[command(about = "Find and read Wikimedia XML dumps")]
struct CommandLine {
    #[command(subcommand)]
    command: Command,

    /// Also print debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count the revisions and pages of a dump
    Count {
        #[command(flatten)]
        selection: Selection,

        /// Hand revisions to a worker pool instead of counting on the parser thread
        #[arg(long)]
        parallel: bool,
    },

    /// List the files of a dump
    Files {
        #[command(flatten)]
        selection: Selection,
    },

    /// Show which blocks of a multistream archive hold the given pages
    Index {
        /// Side index, plain or bzip2-compressed
        index: PathBuf,

        #[arg(long = "title")]
        titles: Vec<String>,

        #[arg(long = "page-id", conflicts_with = "titles")]
        page_ids: Vec<u64>,
    },

    /// Monthly number of main namespace pages that are not redirects
    Timeline {
        #[command(flatten)]
        selection: Selection,

        /// First instant (YYYYMMDD)
        #[arg(long, value_parser = parse_date)]
        from: NaiveDate,

        /// Last instant (YYYYMMDD)
        #[arg(long, value_parser = parse_date)]
        to: NaiveDate,

        /// Months between two instants
        #[arg(long, default_value_t = 1)]
        months: u32,
    },
}

#[derive(Debug, Args)]
struct Selection {
    /// Database name, e.g. `dewiktionary`
    database: String,

    /// Dump kind, e.g. `pages-articles` or `STUBS_META_HISTORY`
    #[arg(short, long)]
    kind: DumpKind,

    /// Root of a local mirror with `public` and `incr` subtrees [default: ./data/dumps]
    #[arg(long, conflicts_with = "remote")]
    local: Option<PathBuf>,

    /// Base URL of a dump server, e.g. https://dumps.wikimedia.org
    #[arg(long)]
    remote: Option<String>,

    /// Use the `latest` directory
    #[arg(long)]
    latest: bool,

    /// Use the earliest snapshot taken on or after this date (YYYYMMDD)
    #[arg(long, value_parser = parse_date, conflicts_with = "at")]
    after: Option<NaiveDate>,

    /// Use the snapshot taken on this date (YYYYMMDD)
    #[arg(long, value_parser = parse_date)]
    at: Option<NaiveDate>,

    /// Only read pages with this title
    #[arg(long = "title")]
    titles: Vec<String>,

    /// Only read pages with this id
    #[arg(long = "page-id")]
    page_ids: Vec<u64>,
}

impl Selection {
    fn config(&self) -> DumpConfig {
        let mut config = DumpConfig::new(self.database.clone()).kind(self.kind);
        config = match (&self.local, &self.remote) {
            (_, Some(remote)) => config.remote(remote.clone()),
            (Some(local), None) => config.local(local.clone()),
            (None, None) => config.local(DEFAULT_LOCAL_ROOT),
        };
        if self.latest {
            config = config.latest();
        }
        if let Some(date) = self.after {
            config = config.after(date);
        }
        if let Some(date) = self.at {
            config = config.at(date);
        }
        config
    }

    fn fetch(&self) -> Result<Dump> {
        let dump = self.config().fetch()?.with_context(|| {
            format!("no finished {} dump of {}", self.kind, self.database)
        })?;

        // the library rejects a title filter combined with an id filter
        let dump = if !self.titles.is_empty() {
            dump.filter_titles(self.titles.iter().cloned())?
        } else {
            dump
        };
        let dump = if !self.page_ids.is_empty() {
            dump.filter_ids(self.page_ids.iter().copied())?
        } else {
            dump
        };
        Ok(dump)
    }
}

fn count(selection: &Selection, parallel: bool) -> Result<()> {
    let dump = selection.fetch()?;

    let (revisions, pages) = if parallel {
        let revisions = AtomicU64::new(0);
        let pages = Mutex::new(FxHashSet::default());
        dump.par_for_each_revision(|revision| {
            revisions.fetch_add(1, Ordering::Relaxed);
            pages
                .lock()
                .expect("no consumer panics while holding the lock")
                .insert(revision.page_id);
        })?;
        let pages = pages
            .into_inner()
            .expect("no consumer panics while holding the lock");
        (revisions.into_inner(), pages.len() as u64)
    } else {
        let mut revisions = 0u64;
        let mut pages = 0u64;
        let mut last_page = None;
        for revision in dump.revisions()? {
            let revision = revision?;
            revisions += 1;
            if last_page != Some(revision.page_id) {
                pages += 1;
                last_page = Some(revision.page_id);
            }
        }
        (revisions, pages)
    };

    println!("{}", dump.descriptive_filename().unwrap_or_else(|| dump.kind().to_string()));
    println!("revisions\t{revisions}");
    println!("pages\t{pages}");
    Ok(())
}

fn files(selection: &Selection) -> Result<()> {
    let dump = selection.fetch()?;
    eprintln!("{} {} ({})", dump.database(), dump.directory(), dump.kind());
    if let Some(name) = dump.descriptive_filename() {
        eprintln!("{name}");
    }
    for file in dump.files() {
        println!("{file}");
    }
    Ok(())
}

fn index(index: &Path, titles: Vec<String>, page_ids: Vec<u64>) -> Result<()> {
    let filter = if titles.is_empty() {
        PageFilter::ids(page_ids)
    } else {
        PageFilter::titles(titles)
    };
    let file = File::open(index).with_context(|| format!("cannot open {}", index.display()))?;
    let selection = select_offsets(open_decompressed(file)?, &filter)?;

    println!(
        "blocks\t{}/{}\npages\t{}/{}",
        selection.offsets.len(),
        selection.total_blocks,
        selection.retained_pages,
        selection.total_pages
    );
    for offset in selection.offsets {
        println!("{offset}");
    }
    Ok(())
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn timeline(selection: &Selection, from: NaiveDate, to: NaiveDate, months: u32) -> Result<()> {
    let timeline = Timeline::new(midnight(from), midnight(to), Period::Months(months))?;
    let dump = selection.fetch()?;

    let timeline = counting(timeline, |revision| {
        revision.is_main_namespace() && !revision.is_redirect()
    })
    .consume(dump.revisions()?)?;

    for entry in &timeline {
        println!("{}\t{}", format_timestamp(&entry.time), entry.value);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = CommandLine::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Count {
            selection,
            parallel,
        } => count(&selection, parallel),
        Command::Files { selection } => files(&selection),
        Command::Index {
            index: path,
            titles,
            page_ids,
        } => index(&path, titles, page_ids),
        Command::Timeline {
            selection,
            from,
            to,
            months,
        } => timeline(&selection, from, to, months),
    }
}
