//! Documents pulled off a stream one at a time.

use std::io::{self, Read};

use efc::bson::{BsonDocument, BsonParser, NodeAction, NodeId};

fn record() -> BsonDocument {
    let mut doc = BsonDocument::new();
    doc.add("r/a", 1i32).unwrap();
    doc.add("r/b", "xy").unwrap();
    doc
}

fn three() -> Vec<u8> {
    let one = record().to_bytes("r", true).unwrap();
    one.repeat(3)
}

/// Returns at most `max` bytes per read.
struct Chunked<R> {
    inner: R,
    max: usize,
}

impl<R: Read> Read for Chunked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.max);
        self.inner.read(&mut buf[..n])
    }
}

#[test]
fn three_documents_then_end() {
    let _ = env_logger::builder().is_test(true).try_init();
    let data = three();
    for max in [1, 3, 7, 4096] {
        let mut parser = BsonParser::new(Chunked { inner: &data[..], max });
        let mut doc = BsonDocument::new();
        let mut count = 0;
        while parser.next_bson(&mut doc).unwrap() {
            assert_eq!(doc.get_int("r/a").unwrap(), 1);
            assert_eq!(doc.get_string("r/b").unwrap(), "xy");
            count += 1;
        }
        assert_eq!(count, 3, "chunk size {}", max);
    }
}

#[test]
fn hook_filters_while_streaming() {
    let data = three();
    let mut seen = 0usize;
    let hook = |doc: &BsonDocument, id: NodeId| {
        seen += 1;
        if doc.name(id) == Some("a") {
            NodeAction::Discard
        } else {
            NodeAction::Keep
        }
    };
    let docs: Vec<BsonDocument> = BsonParser::with_hook(&data[..], hook)
        .collect::<efc::Result<_>>()
        .unwrap();
    assert_eq!(docs.len(), 3);
    for doc in &docs {
        assert!(doc.find("r/a").is_none());
        assert_eq!(doc.get_string("r/b").unwrap(), "xy");
    }
    assert_eq!(seen, 9);
}

#[test]
fn file_source() {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(&three()).unwrap();
    let file = std::fs::File::open(tmp.path()).unwrap();
    let docs: Vec<_> = BsonParser::new(io::BufReader::new(file))
        .collect::<efc::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(docs.len(), 3);
    assert!(docs.iter().all(|d| *d == record()));
}

#[test]
fn streamed_tree_levels_and_indices() {
    let mut src = BsonDocument::new();
    src.add("log/entry/msg", "start").unwrap();
    src.add("log/entry/msg", "stop").unwrap();
    src.add("log/entry", 3i64).unwrap();
    src.add("log/entry", 4i64).unwrap();
    let data = src.to_bytes("log", true).unwrap().repeat(2);

    let mut parser = BsonParser::new(Chunked { inner: &data[..], max: 5 });
    let mut doc = BsonDocument::new();
    doc.set_encoding("ISO-8859-1").unwrap();
    let mut count = 0;
    while parser.next_bson(&mut doc).unwrap() {
        assert_eq!(doc.encoding(), "ISO-8859-1");
        assert_eq!(doc.level_of(doc.root()), Some(0));
        let stop = doc.lookup("log/entry/msg[1]").unwrap();
        assert_eq!(doc.level_of(stop), Some(3));
        assert_eq!(doc.index_of(stop), Some(1));
        for i in 0..3 {
            let entry = doc.lookup(&format!("log/entry[{}]", i)).unwrap();
            assert_eq!(doc.index_of(entry), Some(i));
            assert_eq!(doc.level_of(entry), Some(2));
        }
        assert_eq!(doc.get_llong("log/entry[2]").unwrap(), 4);
        count += 1;
    }
    assert_eq!(count, 2);
}
