//! # efc-bson
//!
//! Binary structured object notation: a tree of named, typed nodes with
//! attributes, a compact self-delimiting encoding, and a parser that
//! pulls documents off a byte stream one at a time.
//!
//! ## Modules
//!
//! - `varint` - Nine-byte-max unsigned varints used for lengths and counts
//! - `value` - Type tags, typed values and their little-endian payloads
//! - `document` - Arena-backed tree addressed by `a/b[1]/c` paths
//! - `codec` - Export of a subtree and import of a buffered encoding
//! - `parser` - Restartable decoder and the stream-driven [`BsonParser`]
//!
//! ## Example
//!
//! ```
//! use efc_bson::{BsonDocument, BsonParser};
//!
//! let mut doc = BsonDocument::new();
//! doc.add("r/a", 1i32).unwrap();
//! doc.add("r/b", "xy").unwrap();
//! let bytes = doc.to_bytes("r", true).unwrap();
//!
//! let mut parser = BsonParser::new(&bytes[..]);
//! let mut out = BsonDocument::new();
//! assert!(parser.next_bson(&mut out).unwrap());
//! assert_eq!(out.get_string("r/b").unwrap(), "xy");
//! ```

pub mod varint;
pub mod value;
pub mod document;
pub mod codec;
pub mod parser;

pub use codec::{MAGIC, VERSION};
pub use document::{BsonDocument, NodeId, DEFAULT_ENCODING};
pub use parser::{BsonParser, KeepAll, NodeAction, NodeHook};
pub use value::{Tag, Value};
