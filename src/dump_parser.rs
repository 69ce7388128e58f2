use std::{
    any::type_name_of_val,
    collections::HashMap,
    fmt::Debug,
    io::BufRead,
};

use chrono::DateTime;
use compact_str::CompactString;
use quick_xml::events::{BytesStart, Event};

use crate::revision::{parse_timestamp, Revision};

// all tags the grammar knows about, i.e. the tags of which we need a value and their parent tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tag {
    SiteInfo,    // <siteinfo><dbname>...</dbname><namespaces>...</namespaces> ...other tags</siteinfo>
    DbName,      // <dbname>dewiktionary</dbname>
    Namespace,   // <namespace key="1">Diskussion</namespace>
    Page,        // <page>...tags are (title, ns, id, redirect, revision)</page>
    Title,       // <title>blah</title>
    Ns,          // <ns>0</ns>
    Id,          // <id>500</id> (page, revision and contributor share the tag name)
    Redirect,    // <redirect title="blub" />
    Revision,    // <revision>...tags are (id, parentid, timestamp, contributor, minor, comment, text)</revision>
    ParentId,    // <parentid>499</parentid>
    Timestamp,   // <timestamp>2003-12-05T06:41:50Z</timestamp>
    Contributor, // <contributor><username>blah</username><id>500</id></contributor> or <contributor deleted="deleted" />
    Username,    // <username>blah</username>
    Ip,          // <ip>127.0.0.1</ip> (replaces username for anonymous edits)
    Minor,       // <minor />
    Comment,     // <comment>blah</comment> or <comment deleted="deleted" />
    Text,        // <text bytes="20">blah</text> or <text bytes="20" deleted="deleted" />
    Unknown,
}

impl Tag {
    pub(crate) fn from_name(name: &[u8]) -> Self {
        match name {
            b"siteinfo" => Tag::SiteInfo,
            b"dbname" => Tag::DbName,
            b"namespace" => Tag::Namespace,
            b"page" => Tag::Page,
            b"title" => Tag::Title,
            b"ns" => Tag::Ns,
            b"id" => Tag::Id,
            b"redirect" => Tag::Redirect,
            b"revision" => Tag::Revision,
            b"parentid" => Tag::ParentId,
            b"timestamp" => Tag::Timestamp,
            b"contributor" => Tag::Contributor,
            b"username" => Tag::Username,
            b"ip" => Tag::Ip,
            b"minor" => Tag::Minor,
            b"comment" => Tag::Comment,
            b"text" => Tag::Text,
            _ => Tag::Unknown,
        }
    }

    /// Whether the character data of this tag is a field value.
    pub(crate) fn captures_text(self) -> bool {
        matches!(
            self,
            Tag::DbName
                | Tag::Namespace
                | Tag::Title
                | Tag::Ns
                | Tag::Id
                | Tag::ParentId
                | Tag::Timestamp
                | Tag::Username
                | Tag::Ip
                | Tag::Comment
                | Tag::Text
        )
    }

    fn name(self) -> &'static str {
        match self {
            Tag::SiteInfo => "siteinfo",
            Tag::DbName => "dbname",
            Tag::Namespace => "namespace",
            Tag::Page => "page",
            Tag::Title => "title",
            Tag::Ns => "ns",
            Tag::Id => "id",
            Tag::Redirect => "redirect",
            Tag::Revision => "revision",
            Tag::ParentId => "parentid",
            Tag::Timestamp => "timestamp",
            Tag::Contributor => "contributor",
            Tag::Username => "username",
            Tag::Ip => "ip",
            Tag::Minor => "minor",
            Tag::Comment => "comment",
            Tag::Text => "text",
            Tag::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParsingError {
    #[error("XML error")]
    XmlError(#[from] quick_xml::Error),
    #[error("unexpected end of file")]
    Eof,
    #[error("invalid value {value:?} for <{field}> at byte {position}")]
    InvalidField {
        field: &'static str,
        value: String,
        position: u64,
    },
}

#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub enum Namespace {
    #[default]
    Default,
    Named(CompactString),
}

impl Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Default => write!(f, "Default"),
            Namespace::Named(name) => write!(f, "{:?}", name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SiteInfo {
    pub dbname: CompactString,
    pub namespaces: HashMap<i32, Namespace>,
}

#[derive(Debug, Default)]
struct PageFields {
    title: CompactString,
    namespace: i32,
    id: Option<u64>,
    redirect: bool,
}

#[derive(Debug, Default)]
struct RevisionFields {
    id: Option<u64>,
    parent_id: u64,
    timestamp: Option<chrono::DateTime<chrono::Utc>>,
    contributor: Option<CompactString>,
    anonymous: bool,
    minor: bool,
    comment: CompactString,
    text: Option<String>,
    bytes: Option<u64>,
    revision_deleted: bool,
    comment_deleted: bool,
    contributor_deleted: bool,
}

/// Field grammar shared by the pull and push drivers.
///
/// The drivers own the XML event loop and the text buffer; this type maps "tag opened",
/// "tag text complete" and "tag closed" onto the record under construction.
#[derive(Debug, Default)]
pub(crate) struct PageAssembler {
    page: Option<PageFields>,
    revision: Option<RevisionFields>,
    site_info: Option<SiteInfo>,
    in_site_info: bool,
    namespace_key: Option<i32>,
}

impl PageAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn site_info(&self) -> Option<&SiteInfo> {
        self.site_info.as_ref()
    }

    pub(crate) fn in_page(&self) -> bool {
        self.page.is_some()
    }

    /// Handle an opening tag, including self-closing ones (`is_empty`).
    pub(crate) fn open(
        &mut self,
        tag: Tag,
        e: &BytesStart,
        is_empty: bool,
    ) -> Result<(), ParsingError> {
        match tag {
            Tag::SiteInfo => {
                self.in_site_info = !is_empty;
                self.site_info.get_or_insert_with(SiteInfo::default);
            }
            Tag::Namespace if self.in_site_info => {
                self.namespace_key = None;
                for attr in e.attributes() {
                    let attr = attr.map_err(quick_xml::Error::from)?;
                    if attr.key.as_ref() == b"key" {
                        let key = attr.unescape_value()?;
                        match key.parse() {
                            Ok(key) => self.namespace_key = Some(key),
                            Err(_) => tracing::warn!(
                                message = "Ignoring namespace with invalid key",
                                key = %key
                            ),
                        }
                    }
                }
                if is_empty {
                    self.insert_namespace("");
                }
            }
            Tag::Page => {
                self.page = Some(PageFields::default());
                self.revision = None;
            }
            Tag::Redirect => {
                if let Some(page) = &mut self.page {
                    page.redirect = true;
                }
            }
            Tag::Revision => {
                if self.page.is_some() {
                    self.revision = Some(RevisionFields::default());
                }
            }
            Tag::Minor => {
                if let Some(revision) = &mut self.revision {
                    revision.minor = true;
                }
            }
            Tag::Contributor | Tag::Comment => {
                let Some(revision) = &mut self.revision else {
                    return Ok(());
                };
                let deleted = has_deleted_attribute(e)?;
                match tag {
                    Tag::Contributor => revision.contributor_deleted |= deleted,
                    _ => revision.comment_deleted |= deleted,
                }
            }
            Tag::Text => {
                let Some(revision) = &mut self.revision else {
                    return Ok(());
                };
                let attributes = TextAttributes::read(e)?;
                revision.revision_deleted |= attributes.deleted;
                revision.bytes = attributes.bytes;
                // <text bytes="0" /> is an empty text, <text bytes="1234" id="987" /> a stub
                if is_empty && !attributes.deleted && !attributes.is_stub() {
                    revision.text = Some(String::new());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply the accumulated character data of a closed text-carrying tag.
    pub(crate) fn apply_text(
        &mut self,
        tag: Tag,
        text: &str,
        position: u64,
    ) -> Result<(), ParsingError> {
        if self.in_site_info {
            match tag {
                Tag::DbName => {
                    if let Some(site_info) = &mut self.site_info {
                        site_info.dbname = CompactString::from(text);
                    }
                }
                Tag::Namespace => self.insert_namespace(text),
                _ => {}
            }
            return Ok(());
        }

        let Some(page) = &mut self.page else {
            return Ok(());
        };

        match (tag, &mut self.revision) {
            (Tag::Title, _) => page.title = CompactString::from(text),
            (Tag::Ns, _) => page.namespace = parse_number(tag, text, position)?,
            // Page and revision ids share the tag name: the first <id> of a page is the page
            // id, the first <id> of a revision is the revision id and anything after that
            // (the contributor's id) is ignored. This depends on the element order of the
            // export schema.
            (Tag::Id, _) if page.id.is_none() => page.id = Some(parse_number(tag, text, position)?),
            (Tag::Id, Some(revision)) if revision.id.is_none() => {
                revision.id = Some(parse_number(tag, text, position)?)
            }
            (Tag::ParentId, Some(revision)) => {
                revision.parent_id = parse_number(tag, text, position)?
            }
            (Tag::Timestamp, Some(revision)) => {
                revision.timestamp = match parse_timestamp(text) {
                    Some(timestamp) => Some(timestamp),
                    None => Some(invalid_value(tag, text, position, DateTime::<chrono::Utc>::UNIX_EPOCH)?),
                }
            }
            (Tag::Username, Some(revision)) => {
                revision.contributor = Some(CompactString::from(text))
            }
            (Tag::Ip, Some(revision)) => {
                revision.contributor = Some(CompactString::from(text));
                revision.anonymous = true;
            }
            (Tag::Comment, Some(revision)) => revision.comment = CompactString::from(text),
            (Tag::Text, Some(revision)) => {
                if !revision.revision_deleted {
                    revision.text = Some(text.to_owned());
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Handle a closing tag. Returns the finished record when a revision closes.
    pub(crate) fn close(&mut self, tag: Tag, position: u64) -> Result<Option<Revision>, ParsingError> {
        match tag {
            Tag::SiteInfo => {
                self.in_site_info = false;
                Ok(None)
            }
            Tag::Revision => match (self.revision.take(), &self.page) {
                (Some(revision), Some(page)) => build_revision(page, revision, position).map(Some),
                _ => Ok(None),
            },
            Tag::Page => {
                self.page = None;
                self.revision = None;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn insert_namespace(&mut self, name: &str) {
        if let (Some(site_info), Some(key)) = (&mut self.site_info, self.namespace_key.take()) {
            let namespace = if name.is_empty() {
                Namespace::Default
            } else {
                Namespace::Named(CompactString::from(name))
            };
            site_info.namespaces.insert(key, namespace);
        }
    }
}

fn has_deleted_attribute(e: &BytesStart) -> Result<bool, ParsingError> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == b"deleted" {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Attributes of a `<text>` element.
#[derive(Debug, Default)]
struct TextAttributes {
    deleted: bool,
    bytes: Option<u64>,
    /// Stub dumps reference the stored text by `id` or `location` instead of embedding it
    stored_elsewhere: bool,
}

impl TextAttributes {
    fn read(e: &BytesStart) -> Result<Self, ParsingError> {
        let mut attributes = Self::default();
        for attr in e.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            match attr.key.as_ref() {
                b"deleted" => attributes.deleted = true,
                b"bytes" => {
                    attributes.bytes = std::str::from_utf8(&attr.value)
                        .ok()
                        .and_then(|value| value.trim().parse().ok());
                    if attributes.bytes.is_none() {
                        tracing::warn!(
                            message = "Ignoring invalid text size",
                            value = %String::from_utf8_lossy(&attr.value)
                        );
                    }
                }
                b"id" | b"location" => attributes.stored_elsewhere = true,
                _ => {}
            }
        }
        Ok(attributes)
    }

    fn is_stub(&self) -> bool {
        self.stored_elsewhere || self.bytes.is_some_and(|bytes| bytes > 0)
    }
}

fn invalid_value<T>(tag: Tag, text: &str, position: u64, fallback: T) -> Result<T, ParsingError> {
    if cfg!(feature = "strict") {
        return Err(ParsingError::InvalidField {
            field: tag.name(),
            value: text.to_owned(),
            position,
        });
    }
    tracing::warn!(
        message = "Found invalid field value, using fallback",
        field = tag.name(),
        value = text,
        position
    );
    Ok(fallback)
}

fn parse_number<T: std::str::FromStr + Default>(
    tag: Tag,
    text: &str,
    position: u64,
) -> Result<T, ParsingError> {
    match text.trim().parse() {
        Ok(value) => Ok(value),
        Err(_) => invalid_value(tag, text, position, T::default()),
    }
}

fn build_revision(
    page: &PageFields,
    revision: RevisionFields,
    position: u64,
) -> Result<Revision, ParsingError> {
    let id = match revision.id {
        Some(id) => id,
        None => invalid_value(Tag::Id, "", position, 0)?,
    };
    let timestamp = match revision.timestamp {
        Some(timestamp) => timestamp,
        None => invalid_value(Tag::Timestamp, "", position, DateTime::<chrono::Utc>::UNIX_EPOCH)?,
    };

    Ok(Revision {
        title: page.title.clone(),
        namespace: page.namespace,
        page_id: page.id.unwrap_or_default(),
        id,
        parent_id: revision.parent_id,
        timestamp,
        contributor: if revision.contributor_deleted {
            None
        } else {
            revision.contributor
        },
        anonymous: revision.anonymous,
        minor: revision.minor,
        comment: revision.comment,
        text: revision.text,
        bytes: revision.bytes,
        redirect: page.redirect,
        revision_deleted: revision.revision_deleted,
        comment_deleted: revision.comment_deleted,
        contributor_deleted: revision.contributor_deleted,
    })
}

/// Character data of the tag currently being captured.
#[derive(Debug)]
pub(crate) struct TextCapture {
    tag: Option<Tag>,
    buf: String,
}

impl TextCapture {
    pub(crate) fn new() -> Self {
        Self {
            tag: None,
            // large enough for most page texts
            buf: String::with_capacity(64 * 1024),
        }
    }

    pub(crate) fn start(&mut self, tag: Tag) {
        if tag.captures_text() {
            self.tag = Some(tag);
            self.buf.clear();
        } else {
            self.tag = None;
        }
    }

    pub(crate) fn push(&mut self, text: &str) {
        if self.tag.is_some() {
            self.buf.push_str(text);
        }
    }

    /// Stop capturing; returns the text if `tag` is the one being captured.
    pub(crate) fn finish(&mut self, tag: Tag) -> Option<&str> {
        if self.tag == Some(tag) {
            self.tag = None;
            Some(&self.buf)
        } else {
            None
        }
    }
}

/// Lazy, forward-only reader of the revisions in a dump.
///
/// Each call to [`Iterator::next`] advances the underlying XML reader just far enough to
/// complete one revision. After the first error the iterator is exhausted.
pub struct DumpParser<R: BufRead> {
    xml_parser: quick_xml::Reader<R>,
    buf: Vec<u8>,
    text: TextCapture,
    assembler: PageAssembler,
    depth: usize,
    finished: bool,
    estimated_len: Option<u64>,
}

impl<R: BufRead> Debug for DumpParser<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DumpParser")
            .field("xml_parser", &type_name_of_val(&self.xml_parser))
            // print buffer length and capacity
            .field("buf.len", &self.buf.len())
            .field("buf.capacity", &self.buf.capacity())
            .field("depth", &self.depth)
            .field("finished", &self.finished)
            .field("estimated_len", &self.estimated_len)
            .finish()
    }
}

impl<R: BufRead> DumpParser<R> {
    pub fn new(reader: R) -> Self {
        let xml_parser = quick_xml::Reader::from_reader(reader);
        // expand_empty_elements not set, empty elements are handled explicitly

        Self {
            xml_parser,
            buf: Vec::with_capacity(64 * 1024),
            text: TextCapture::new(),
            assembler: PageAssembler::new(),
            depth: 0,
            finished: false,
            estimated_len: None,
        }
    }

    /// Attach an estimate of how many revisions the stream holds.
    ///
    /// This is a hint for consumers that pre-allocate; it is never used for control flow.
    pub fn with_estimated_len(mut self, estimated_len: u64) -> Self {
        self.estimated_len = Some(estimated_len);
        self
    }

    pub fn estimated_len(&self) -> Option<u64> {
        self.estimated_len
    }

    /// Site information from the `<siteinfo>` header, once the parser has read past it.
    ///
    /// Fragment streams built from multistream blocks have no header.
    pub fn site_info(&self) -> Option<&SiteInfo> {
        self.assembler.site_info()
    }

    pub fn into_inner(self) -> R {
        self.xml_parser.into_inner()
    }

    fn byte_position(&self) -> u64 {
        self.xml_parser.buffer_position() as u64
    }

    fn next_revision(&mut self) -> Result<Option<Revision>, ParsingError> {
        loop {
            self.buf.clear();
            match self.xml_parser.read_event_into(&mut self.buf)? {
                Event::Start(ref e) => {
                    let tag = Tag::from_name(e.local_name().as_ref());
                    self.depth += 1;
                    self.assembler.open(tag, e, false)?;
                    self.text.start(tag);
                }
                Event::Empty(ref e) => {
                    let tag = Tag::from_name(e.local_name().as_ref());
                    self.assembler.open(tag, e, true)?;
                }
                Event::Text(ref e) => {
                    let text = e.unescape()?;
                    self.text.push(&text);
                }
                Event::CData(ref e) => {
                    let text = String::from_utf8_lossy(e);
                    self.text.push(&text);
                }
                Event::End(ref e) => {
                    let tag = Tag::from_name(e.local_name().as_ref());
                    self.depth = self.depth.saturating_sub(1);
                    let position = self.xml_parser.buffer_position() as u64;
                    if let Some(text) = self.text.finish(tag) {
                        self.assembler.apply_text(tag, text, position)?;
                    }
                    if let Some(revision) = self.assembler.close(tag, position)? {
                        return Ok(Some(revision));
                    }
                }
                Event::Eof => {
                    if self.depth != 0 || self.assembler.in_page() {
                        tracing::error!(
                            message = "Unexpected end of file",
                            depth = self.depth,
                            position = self.byte_position()
                        );
                        return Err(ParsingError::Eof);
                    }
                    return Ok(None);
                }
                _ => {}
            }
        }
    }
}

impl<R: BufRead> Iterator for DumpParser<R> {
    type Item = Result<Revision, ParsingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.next_revision() {
            Ok(Some(revision)) => Some(Ok(revision)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: BufRead> std::iter::FusedIterator for DumpParser<R> {}
