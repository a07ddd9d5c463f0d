//! Serialization of documents and subtrees
//!
//! ```text
//! document := [header] node
//! header   := "BSON" version:u8
//! node     := name-len:u8 name attr-count:varint attr*
//!             tag:u8 payload-len:varint payload child-count:varint node*
//! attr     := name-len:u8 name tag:u8 payload-len:varint payload
//! ```
//!
//! Nodes are emitted in preorder, so a reader can hand each one over as
//! soon as its subtree is complete.

use std::io;

use efc_core::{config, Error, Result};
use efc_nio::IoByteBuffer;

use crate::document::{BsonDocument, NodeId};
use crate::parser::{Decoder, KeepAll, Status};
use crate::value::Value;
use crate::varint;

pub const MAGIC: &[u8; 4] = b"BSON";
pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = MAGIC.len() + 1;

fn put_name(name: &str, out: &mut Vec<u8>) {
    // Names are checked against MAX_NAME_LEN when inserted
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn put_value(value: &Value, out: &mut Vec<u8>) {
    out.push(value.tag() as u8);
    varint::encode(value.payload_len() as u64, out);
    value.encode_payload(out);
}

impl BsonDocument {
    /// Encode the record of one node, excluding its children's records.
    fn encode_node(&self, id: NodeId, out: &mut Vec<u8>) {
        let name = self.name(id).unwrap_or_default();
        put_name(name, out);
        let attrs = self.attrs(id);
        varint::encode(attrs.len() as u64, out);
        for (k, v) in attrs {
            put_name(k, out);
            put_value(v, out);
        }
        match self.value(id) {
            Some(v) => put_value(v, out),
            None => put_value(&Value::Container, out),
        }
        varint::encode(self.children(id).len() as u64, out);
    }

    /// Serialize the subtree at `path` into `out`, preceded by the
    /// header when `use_head` is set.
    pub fn export<W: io::Write + ?Sized>(&self, path: &str, use_head: bool, out: &mut W) -> Result<()> {
        let top = self.lookup(path)?;
        let mut scratch = Vec::with_capacity(256);
        if use_head {
            scratch.extend_from_slice(MAGIC);
            scratch.push(VERSION);
        }
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            self.encode_node(id, &mut scratch);
            stack.extend(self.children(id).iter().rev());
            if scratch.len() >= 4096 {
                out.write_all(&scratch)?;
                scratch.clear();
            }
        }
        out.write_all(&scratch)?;
        Ok(())
    }

    /// Serialize the subtree at `path` to a new vector.
    pub fn to_bytes(&self, path: &str, use_head: bool) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.export(path, use_head, &mut out)?;
        Ok(out)
    }

    /// Serialize into `buf` at its position. Fails with
    /// `BufferOverflow`, writing nothing, if the encoding does not fit.
    pub fn export_to_buffer(&self, path: &str, use_head: bool, buf: &mut IoByteBuffer) -> Result<()> {
        let bytes = self.to_bytes(path, use_head)?;
        if bytes.len() > buf.remaining() {
            return Err(Error::BufferOverflow);
        }
        buf.put_slice(&bytes)?;
        Ok(())
    }

    /// Rebuild a document from one fully buffered encoding.
    ///
    /// A top-level node with an empty name becomes the root; a named one
    /// is placed under the root, so `import(export(p))` addresses the
    /// node again by its own name. The result carries the default
    /// encoding label.
    pub fn import(bytes: &[u8]) -> Result<BsonDocument> {
        let mut doc = BsonDocument::new();
        doc.import_into(bytes)?;
        Ok(doc)
    }

    /// Replace the contents of `self` with a decoded encoding, keeping
    /// its encoding label. On error the document is left cleared.
    pub fn import_into(&mut self, bytes: &[u8]) -> Result<()> {
        self.clear();
        let mut decoder = Decoder::new(config::global().bson_max_payload);
        decoder.feed(bytes);
        let status = decoder.decode(self, &mut KeepAll, true);
        match status {
            Ok(Status::Document) => Ok(()),
            Ok(Status::NeedMore) => {
                self.clear();
                Err(Error::data_format(format!(
                    "input ends inside a document after {} bytes",
                    bytes.len()
                )))
            }
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }
}
