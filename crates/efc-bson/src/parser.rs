//! Streaming parser
//!
//! [`Decoder`] is a push state machine: it is fed whatever bytes have
//! arrived and resumes exactly where it stopped, so a document may be
//! split across reads at any byte. [`BsonParser`] drives it from a
//! [`Read`] source, one document per [`BsonParser::next_bson`] call.
//!
//! Every node is handed to a [`NodeHook`] once its subtree is complete;
//! the hook may keep it or drop it from the document under construction.

use std::io::{self, Read};

use efc_core::{config, Error, Result};

use crate::codec::{HEADER_LEN, MAGIC, VERSION};
use crate::document::{self, BsonDocument, NodeId};
use crate::value::{Tag, Value};
use crate::varint;

// ── Hooks ──

/// What to do with a node the parser just completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Keep,
    /// Remove the node and its subtree from the document
    Discard,
}

/// Callback run for each completed node, children before parents.
pub trait NodeHook {
    fn on_node(&mut self, doc: &BsonDocument, node: NodeId) -> NodeAction;
}

impl<F> NodeHook for F
where
    F: FnMut(&BsonDocument, NodeId) -> NodeAction,
{
    fn on_node(&mut self, doc: &BsonDocument, node: NodeId) -> NodeAction {
        self(doc, node)
    }
}

/// Keeps every node.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAll;

impl NodeHook for KeepAll {
    fn on_node(&mut self, _doc: &BsonDocument, _node: NodeId) -> NodeAction {
        NodeAction::Keep
    }
}

// ── Decoder ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Document,
    NeedMore,
}

enum Step {
    Continue,
    NeedMore,
    Document,
}

#[derive(Debug)]
enum State {
    Start,
    Node,
    Attr,
    AttrPayload { name: String, tag: Tag, remaining: usize },
    Value,
    Payload { tag: Tag, remaining: usize },
    Children,
}

/// A node whose record has been started but whose subtree is not done.
#[derive(Debug)]
struct Frame {
    name: String,
    attrs_left: u64,
    attrs: Vec<(String, Value)>,
    node: Option<NodeId>,
    children_left: u64,
}

/// Incremental document decoder.
///
/// The header is optional, so a stream opening with `BSON\x01` is always
/// read as a header. A headerless document whose first node has a
/// 0x42-byte name beginning `SON\x01` is therefore misread; writers that
/// may emit such names should export with the header.
pub(crate) struct Decoder {
    buf: Vec<u8>,
    pos: usize,
    consumed: u64,
    state: State,
    stack: Vec<Frame>,
    payload: Vec<u8>,
    max_payload: u64,
}

/// A name read off the wire must also be addressable by path.
fn wire_name(bytes: &[u8], what: &str) -> Result<String> {
    let name =
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::data_format(format!("{}: {}", what, e)))?;
    document::check_name(&name).map_err(|e| Error::data_format(format!("{}: {}", what, e)))?;
    Ok(name)
}

impl Decoder {
    pub(crate) fn new(max_payload: usize) -> Self {
        Decoder {
            buf: Vec::new(),
            pos: 0,
            consumed: 0,
            state: State::Start,
            stack: Vec::new(),
            payload: Vec::new(),
            max_payload: max_payload as u64,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        } else if self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// True between documents with nothing buffered.
    pub(crate) fn at_boundary(&self) -> bool {
        matches!(self.state, State::Start) && self.stack.is_empty() && self.pos == self.buf.len()
    }

    /// Stream offset of the next unread byte.
    pub(crate) fn offset(&self) -> u64 {
        self.consumed
    }

    fn avail(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn advance(&mut self, n: usize) {
        self.pos += n;
        self.consumed += n as u64;
    }

    fn take_payload(&mut self, remaining: &mut usize) {
        let n = (*remaining).min(self.buf.len() - self.pos);
        self.payload.extend_from_slice(&self.buf[self.pos..self.pos + n]);
        self.advance(n);
        *remaining -= n;
    }

    fn check_payload(&self, tag: Tag, len: u64) -> Result<usize> {
        tag.check_len(len)?;
        if len > self.max_payload {
            return Err(Error::data_format(format!(
                "payload of {} bytes exceeds limit of {}",
                len, self.max_payload
            )));
        }
        usize::try_from(len).map_err(|_| Error::data_format(format!("payload of {} bytes", len)))
    }

    fn top(&mut self) -> Result<&mut Frame> {
        self.stack
            .last_mut()
            .ok_or_else(|| Error::illegal_state("decoder has no open node"))
    }

    /// Run until a document completes or the buffered input runs out.
    /// `eof` marks that no more input will follow.
    pub(crate) fn decode<H: NodeHook + ?Sized>(
        &mut self,
        doc: &mut BsonDocument,
        hook: &mut H,
        eof: bool,
    ) -> Result<Status> {
        loop {
            match self.step(doc, hook, eof)? {
                Step::Continue => {}
                Step::NeedMore => return Ok(Status::NeedMore),
                Step::Document => return Ok(Status::Document),
            }
        }
    }

    fn step<H: NodeHook + ?Sized>(&mut self, doc: &mut BsonDocument, hook: &mut H, eof: bool) -> Result<Step> {
        let state = std::mem::replace(&mut self.state, State::Start);
        match state {
            State::Start => {
                let a = self.avail();
                if a.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let n = a.len().min(MAGIC.len());
                if a[..n] == MAGIC[..n] {
                    if a.len() >= HEADER_LEN {
                        if a[MAGIC.len()] != VERSION {
                            return Err(Error::data_format(format!(
                                "unsupported version {}",
                                a[MAGIC.len()]
                            )));
                        }
                        self.advance(HEADER_LEN);
                    } else if !eof {
                        return Ok(Step::NeedMore);
                    }
                }
                if !doc.is_empty() {
                    doc.clear();
                }
                self.state = State::Node;
            }

            State::Node => {
                let a = self.avail();
                let Some(&len) = a.first() else {
                    self.state = State::Node;
                    return Ok(Step::NeedMore);
                };
                let len = usize::from(len);
                let Some((attrs, used)) = a.get(1 + len..).and_then(varint::decode) else {
                    self.state = State::Node;
                    return Ok(Step::NeedMore);
                };
                let name = wire_name(&a[1..1 + len], "node name")?;
                self.advance(1 + len + used);
                self.stack.push(Frame {
                    name,
                    attrs_left: attrs,
                    attrs: Vec::new(),
                    node: None,
                    children_left: 0,
                });
                self.state = if attrs > 0 { State::Attr } else { State::Value };
            }

            State::Attr => {
                let a = self.avail();
                let Some(&len) = a.first() else {
                    self.state = State::Attr;
                    return Ok(Step::NeedMore);
                };
                let len = usize::from(len);
                let Some((&tag, rest)) = a.get(1 + len..).and_then(<[u8]>::split_first) else {
                    self.state = State::Attr;
                    return Ok(Step::NeedMore);
                };
                let Some((plen, used)) = varint::decode(rest) else {
                    self.state = State::Attr;
                    return Ok(Step::NeedMore);
                };
                let tag = Tag::from_u8(tag)?;
                if tag == Tag::Container {
                    return Err(Error::data_format("attribute with container tag"));
                }
                let remaining = self.check_payload(tag, plen)?;
                let name = wire_name(&a[1..1 + len], "attribute name")?;
                self.advance(1 + len + 1 + used);
                self.payload.clear();
                self.state = State::AttrPayload { name, tag, remaining };
            }

            State::AttrPayload { name, tag, mut remaining } => {
                self.take_payload(&mut remaining);
                if remaining > 0 {
                    self.state = State::AttrPayload { name, tag, remaining };
                    return Ok(Step::NeedMore);
                }
                let value = Value::decode(tag, &self.payload)?;
                let frame = self.top()?;
                frame.attrs.push((name, value));
                frame.attrs_left -= 1;
                let more = frame.attrs_left > 0;
                self.state = if more { State::Attr } else { State::Value };
            }

            State::Value => {
                let a = self.avail();
                let Some((&tag, rest)) = a.split_first() else {
                    self.state = State::Value;
                    return Ok(Step::NeedMore);
                };
                let Some((plen, used)) = varint::decode(rest) else {
                    self.state = State::Value;
                    return Ok(Step::NeedMore);
                };
                let tag = Tag::from_u8(tag)?;
                let remaining = self.check_payload(tag, plen)?;
                self.advance(1 + used);
                self.payload.clear();
                self.state = State::Payload { tag, remaining };
            }

            State::Payload { tag, mut remaining } => {
                self.take_payload(&mut remaining);
                if remaining > 0 {
                    self.state = State::Payload { tag, remaining };
                    return Ok(Step::NeedMore);
                }
                let value = Value::decode(tag, &self.payload)?;
                let depth = self.stack.len();
                let frame = self.top()?;
                let name = std::mem::take(&mut frame.name);
                let attrs = std::mem::take(&mut frame.attrs);
                let id = if depth == 1 {
                    if name.is_empty() {
                        doc.reset_root(name, value, attrs);
                        doc.root()
                    } else {
                        doc.attach(doc.root(), name, value, attrs)?
                    }
                } else {
                    let parent = self.stack[depth - 2]
                        .node
                        .ok_or_else(|| Error::illegal_state("parent node not placed"))?;
                    doc.attach(parent, name, value, attrs)?
                };
                self.top()?.node = Some(id);
                self.state = State::Children;
            }

            State::Children => {
                let Some((count, used)) = varint::decode(self.avail()) else {
                    self.state = State::Children;
                    return Ok(Step::NeedMore);
                };
                self.advance(used);
                self.top()?.children_left = count;
                if count > 0 {
                    self.state = State::Node;
                } else {
                    return self.complete(doc, hook);
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Pop every frame whose subtree is now done.
    fn complete<H: NodeHook + ?Sized>(&mut self, doc: &mut BsonDocument, hook: &mut H) -> Result<Step> {
        loop {
            let frame = self
                .stack
                .pop()
                .ok_or_else(|| Error::illegal_state("decoder has no open node"))?;
            let id = frame
                .node
                .ok_or_else(|| Error::illegal_state("completed node not placed"))?;
            if hook.on_node(doc, id) == NodeAction::Discard {
                doc.remove_node(id);
            }
            match self.stack.last_mut() {
                None => {
                    self.state = State::Start;
                    return Ok(Step::Document);
                }
                Some(parent) => {
                    parent.children_left -= 1;
                    if parent.children_left > 0 {
                        self.state = State::Node;
                        return Ok(Step::Continue);
                    }
                }
            }
        }
    }
}

// ── Driver ──

/// Reads a stream of documents from `R`.
///
/// After a malformed document the parser stays failed and keeps
/// returning the same error.
pub struct BsonParser<R, H = KeepAll> {
    reader: R,
    hook: H,
    decoder: Decoder,
    chunk: Vec<u8>,
    eof: bool,
    failed: Option<Error>,
    documents: u64,
}

impl<R: Read> BsonParser<R, KeepAll> {
    pub fn new(reader: R) -> Self {
        Self::with_hook(reader, KeepAll)
    }
}

impl<R: Read, H: NodeHook> BsonParser<R, H> {
    pub fn with_hook(reader: R, hook: H) -> Self {
        let cfg = config::global();
        BsonParser {
            reader,
            hook,
            decoder: Decoder::new(cfg.bson_max_payload),
            chunk: vec![0; cfg.bson_read_chunk.max(1)],
            eof: false,
            failed: None,
            documents: 0,
        }
    }

    /// Parse the next document into `doc`, replacing its contents.
    ///
    /// Returns `false` when the stream ends cleanly between documents.
    /// A stream ending inside a document is a `DataFormat` error.
    pub fn next_bson(&mut self, doc: &mut BsonDocument) -> Result<bool> {
        if let Some(e) = &self.failed {
            return Err(e.clone());
        }
        doc.clear();
        loop {
            match self.decoder.decode(doc, &mut self.hook, self.eof) {
                Ok(Status::Document) => {
                    self.documents += 1;
                    return Ok(true);
                }
                Ok(Status::NeedMore) if self.eof => {
                    if self.decoder.at_boundary() {
                        return Ok(false);
                    }
                    return Err(self.fail(Error::data_format(format!(
                        "stream ends inside document {}",
                        self.documents + 1
                    ))));
                }
                Ok(Status::NeedMore) => self.fill()?,
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn fill(&mut self) -> Result<()> {
        let n = loop {
            match self.reader.read(&mut self.chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            self.eof = true;
        } else {
            self.decoder.feed(&self.chunk[..n]);
        }
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Error {
        log::debug!(
            "bson: parse failed at offset {} in document {}: {}",
            self.decoder.offset(),
            self.documents + 1,
            e
        );
        self.failed = Some(e.clone());
        e
    }

    /// Documents parsed so far.
    pub fn documents(&self) -> u64 {
        self.documents
    }

    pub fn hook(&self) -> &H {
        &self.hook
    }

    pub fn hook_mut(&mut self) -> &mut H {
        &mut self.hook
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read, H: NodeHook> Iterator for BsonParser<R, H> {
    type Item = Result<BsonDocument>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut doc = BsonDocument::new();
        match self.next_bson(&mut doc) {
            Ok(true) => Some(Ok(doc)),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out its bytes a few at a time.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn sample() -> BsonDocument {
        let mut doc = BsonDocument::new();
        doc.add("r/a", 1i32).unwrap();
        doc.add("r/b", "xy").unwrap();
        doc
    }

    fn stream(copies: usize, use_head: bool) -> Vec<u8> {
        let one = sample().to_bytes("r", use_head).unwrap();
        one.repeat(copies)
    }

    #[test]
    fn test_three_documents() {
        let data = stream(3, true);
        let mut parser = BsonParser::new(&data[..]);
        let mut doc = BsonDocument::new();
        for _ in 0..3 {
            assert!(parser.next_bson(&mut doc).unwrap());
            assert_eq!(doc.get_int("r/a").unwrap(), 1);
            assert_eq!(doc.get_string("r/b").unwrap(), "xy");
        }
        assert!(!parser.next_bson(&mut doc).unwrap());
        assert_eq!(parser.documents(), 3);
    }

    #[test]
    fn test_byte_at_a_time() {
        for use_head in [true, false] {
            let reader = Trickle { data: stream(2, use_head), pos: 0, step: 1 };
            let docs: Vec<_> = BsonParser::new(reader).collect::<Result<_>>().unwrap();
            assert_eq!(docs.len(), 2);
            assert_eq!(docs[1], sample());
        }
    }

    #[test]
    fn test_empty_stream() {
        let mut parser = BsonParser::new(io::empty());
        let mut doc = BsonDocument::new();
        assert!(!parser.next_bson(&mut doc).unwrap());
        assert!(doc.is_empty());
    }

    #[test]
    fn test_truncated_stream() {
        let mut data = stream(2, true);
        data.truncate(data.len() - 3);
        let mut parser = BsonParser::new(Trickle { data, pos: 0, step: 5 });
        let mut doc = BsonDocument::new();
        assert!(parser.next_bson(&mut doc).unwrap());
        let err = parser.next_bson(&mut doc).unwrap_err();
        assert!(matches!(err, Error::DataFormat(_)));
        // Stays failed
        assert!(matches!(parser.next_bson(&mut doc), Err(Error::DataFormat(_))));
    }

    #[test]
    fn test_malformed_input() {
        let cases: [&[u8]; 7] = [
            // unknown tag
            &[1, b'x', 0, 42, 0, 0],
            // int32 with a 3-byte payload
            &[1, b'x', 0, 5, 3, 1, 2, 3, 0],
            // bad version
            b"BSON\x07\x00\x00\x0a\x00\x00",
            // container attribute
            &[1, b'x', 1, 1, b'k', 10, 0, 10, 0, 0],
            // name not utf-8
            &[1, 0xff, 0, 10, 0, 0],
            // node name with a path separator
            &[3, b'a', b'/', b'b', 0, 10, 0, 0],
            // attribute name with an index bracket
            &[1, b'x', 1, 2, b'k', b'[', 3, 1, 7, 10, 0, 0],
        ];
        for (i, bytes) in cases.iter().enumerate() {
            let mut doc = BsonDocument::new();
            let r = BsonParser::new(*bytes).next_bson(&mut doc);
            assert!(matches!(r, Err(Error::DataFormat(_))), "case {}: {:?}", i, r);
        }
    }

    #[test]
    fn test_leading_magic_is_header() {
        // A headerless first node named "SON\x01..." would start with
        // the same five bytes as the header; they are read as a header.
        let mut name = b"SON\x01".to_vec();
        name.resize(0x42, b'n');
        let mut bytes = vec![0x42];
        bytes.extend_from_slice(&name);
        bytes.extend_from_slice(&[0, 10, 0, 0]);
        assert_eq!(&bytes[..5], b"BSON\x01");
        let mut doc = BsonDocument::new();
        assert!(BsonParser::new(&bytes[..]).next_bson(&mut doc).is_err());

        let mut headed = b"BSON\x01".to_vec();
        headed.extend_from_slice(&bytes);
        let mut parser = BsonParser::new(&headed[..]);
        assert!(parser.next_bson(&mut doc).unwrap());
        assert_eq!(doc.child_count(doc.root(), std::str::from_utf8(&name).unwrap()), 1);
    }

    #[test]
    fn test_next_bson_keeps_encoding_label() {
        let data = stream(2, true);
        let mut parser = BsonParser::new(&data[..]);
        let mut doc = BsonDocument::new();
        doc.set_encoding("Shift_JIS").unwrap();
        assert!(parser.next_bson(&mut doc).unwrap());
        assert!(parser.next_bson(&mut doc).unwrap());
        assert_eq!(doc.encoding(), "Shift_JIS");
        assert_eq!(doc.get_int("r/a").unwrap(), 1);
    }

    #[test]
    fn test_payload_limit() {
        let mut decoder = Decoder::new(4);
        let mut bytes = vec![1, b's', 0, Tag::String as u8];
        varint::encode(5, &mut bytes);
        bytes.extend_from_slice(b"hello\x00");
        decoder.feed(&bytes);
        let mut doc = BsonDocument::new();
        assert!(matches!(
            decoder.decode(&mut doc, &mut KeepAll, true),
            Err(Error::DataFormat(_))
        ));
    }

    #[test]
    fn test_hook_discards_nodes() {
        let mut seen = Vec::new();
        let hook = |doc: &BsonDocument, id: NodeId| {
            seen.push(doc.path_of(id).unwrap_or_default());
            if doc.name(id) == Some("b") {
                NodeAction::Discard
            } else {
                NodeAction::Keep
            }
        };
        let data = stream(1, false);
        let mut parser = BsonParser::with_hook(&data[..], hook);
        let mut doc = BsonDocument::new();
        assert!(parser.next_bson(&mut doc).unwrap());
        drop(parser);
        assert_eq!(seen, ["r/a", "r/b", "r"]);
        assert_eq!(doc.get_int("r/a").unwrap(), 1);
        assert!(doc.find("r/b").is_none());
    }

    #[test]
    fn test_unnamed_top_level_becomes_root() {
        let mut src = BsonDocument::new();
        src.add("x", 5i64).unwrap();
        src.add("y/z", 2.5f64).unwrap();
        let bytes = src.to_bytes("", false).unwrap();
        let mut parser = BsonParser::new(&bytes[..]);
        let mut doc = BsonDocument::new();
        doc.add("stale", 1i8).unwrap();
        assert!(parser.next_bson(&mut doc).unwrap());
        assert_eq!(doc, src);
        assert!(doc.find("stale").is_none());
    }
}
