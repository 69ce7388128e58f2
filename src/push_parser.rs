//! Event-driven front end: revisions are handed to a consumer as soon as their page closes.

use std::{io::BufRead, num::NonZeroUsize, thread::available_parallelism};

use quick_xml::events::Event;

use crate::{
    dump_parser::{PageAssembler, ParsingError, Tag, TextCapture},
    revision::Revision,
};

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error(transparent)]
    Parsing(#[from] ParsingError),
    #[error("failed to build worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Scan the whole stream, calling `consumer` once per revision in document order.
///
/// The revisions of a page are delivered together when `</page>` is read. A malformed
/// stream aborts the scan; revisions delivered before the error are not retracted.
pub fn for_each_revision<R: BufRead>(
    reader: R,
    mut consumer: impl FnMut(Revision),
) -> Result<(), ParsingError> {
    drive(reader, |page| page.into_iter().for_each(&mut consumer))
}

/// Like [`for_each_revision`], but every revision is a separate task on a worker pool sized to
/// the available parallelism.
///
/// Parsing stays on the calling thread. Consumer invocations run in no particular order. The
/// function returns once every submitted task has completed, also when parsing failed.
pub fn par_for_each_revision<R: BufRead>(
    reader: R,
    consumer: impl Fn(Revision) + Send + Sync,
) -> Result<(), PushError> {
    let threads = available_parallelism().map_or(1, NonZeroUsize::get);
    par_for_each_revision_with_threads(reader, threads, consumer)
}

pub fn par_for_each_revision_with_threads<R: BufRead>(
    reader: R,
    threads: usize,
    consumer: impl Fn(Revision) + Send + Sync,
) -> Result<(), PushError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("revision-worker-{i}"))
        .build()?;
    tracing::debug!(message = "Started worker pool", threads = pool.current_num_threads());

    let consumer = &consumer;
    // the scope only returns after all spawned tasks have finished
    pool.in_place_scope(|scope| {
        drive(reader, |page| {
            for revision in page {
                scope.spawn(move |_| consumer(revision));
            }
        })
    })?;
    Ok(())
}

fn drive<R: BufRead>(reader: R, mut on_page: impl FnMut(Vec<Revision>)) -> Result<(), ParsingError> {
    let mut xml_parser = quick_xml::Reader::from_reader(reader);
    let mut buf = Vec::with_capacity(64 * 1024);
    let mut text = TextCapture::new();
    let mut assembler = PageAssembler::new();
    let mut page = Vec::new();
    let mut depth = 0usize;

    loop {
        buf.clear();
        match xml_parser.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let tag = Tag::from_name(e.local_name().as_ref());
                depth += 1;
                assembler.open(tag, e, false)?;
                text.start(tag);
            }
            Event::Empty(ref e) => {
                let tag = Tag::from_name(e.local_name().as_ref());
                assembler.open(tag, e, true)?;
            }
            Event::Text(ref e) => text.push(&e.unescape()?),
            Event::CData(ref e) => text.push(&String::from_utf8_lossy(e)),
            Event::End(ref e) => {
                let tag = Tag::from_name(e.local_name().as_ref());
                depth = depth.saturating_sub(1);
                let position = xml_parser.buffer_position() as u64;
                if let Some(value) = text.finish(tag) {
                    assembler.apply_text(tag, value, position)?;
                }
                if let Some(revision) = assembler.close(tag, position)? {
                    page.push(revision);
                }
                if tag == Tag::Page && !page.is_empty() {
                    on_page(std::mem::take(&mut page));
                }
            }
            Event::Eof => {
                if depth != 0 || assembler.in_page() {
                    tracing::error!(
                        message = "Unexpected end of file",
                        depth,
                        position = xml_parser.buffer_position() as u64
                    );
                    return Err(ParsingError::Eof);
                }
                return Ok(());
            }
            _ => {}
        }
    }
}
