//! Tree documents and path addressing
//!
//! A document owns an unnamed container root. Paths name nodes below it:
//!
//! ```text
//! segment[/segment]...     segment = name | name[i]
//! ```
//!
//! `name[i]` selects the i-th child called `name` (zero-based); a bare
//! name selects the first. The empty path is the root.

use std::fmt;

use efc_core::{Error, Result};

use crate::value::Value;

/// Handle to a node within one document.
///
/// Handles of removed nodes may be reused by later insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

const ROOT: NodeId = NodeId(0);

/// Label of a new document.
pub const DEFAULT_ENCODING: &str = "UTF-8";

/// Longest node or attribute name; the wire stores it in one byte.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) value: Value,
    pub(crate) attrs: Vec<(String, Value)>,
    pub(crate) children: Vec<NodeId>,
    parent: Option<NodeId>,
}

impl Node {
    fn new(name: String, value: Value, parent: Option<NodeId>) -> Self {
        Node {
            name,
            value,
            attrs: Vec::new(),
            children: Vec::new(),
            parent,
        }
    }
}

struct Segment<'a> {
    name: &'a str,
    index: usize,
}

fn parse_path(path: &str) -> Result<Vec<Segment<'_>>> {
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('/').map(parse_segment).collect()
}

fn parse_segment(seg: &str) -> Result<Segment<'_>> {
    let bad = || Error::illegal_argument(format!("bad path segment {:?}", seg));
    let (name, index) = match seg.find('[') {
        Some(open) => {
            let digits = seg[open + 1..].strip_suffix(']').ok_or_else(bad)?;
            let index = digits.parse::<usize>().map_err(|_| bad())?;
            (&seg[..open], index)
        }
        None => (seg, 0),
    };
    if name.is_empty() || name.contains(']') {
        return Err(bad());
    }
    Ok(Segment { name, index })
}

pub(crate) fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LEN {
        return Err(Error::illegal_argument(format!(
            "name of {} bytes exceeds {}",
            name.len(),
            MAX_NAME_LEN
        )));
    }
    if name.contains(['/', '[', ']']) {
        return Err(Error::illegal_argument(format!("name {:?} contains a path character", name)));
    }
    Ok(())
}

/// A tree of named, typed nodes with attributes.
///
/// Not synchronized; share an immutable document between readers or
/// confine a mutable one to a single thread.
#[derive(Clone)]
pub struct BsonDocument {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    encoding: String,
}

impl Default for BsonDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl BsonDocument {
    pub fn new() -> Self {
        BsonDocument {
            nodes: vec![Some(Node::new(String::new(), Value::Container, None))],
            free: Vec::new(),
            encoding: DEFAULT_ENCODING.to_owned(),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Text encoding label. Not carried on the wire; string payloads
    /// are always UTF-8 bytes.
    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn set_encoding(&mut self, encoding: &str) -> Result<()> {
        if encoding.is_empty() {
            return Err(Error::illegal_argument("empty encoding label"));
        }
        self.encoding = encoding.to_owned();
        Ok(())
    }

    /// Drop every node but an empty root. The encoding label is kept.
    pub fn clear(&mut self) {
        self.nodes.truncate(1);
        self.nodes[0] = Some(Node::new(String::new(), Value::Container, None));
        self.free.clear();
    }

    /// True when the root has no children, attributes or value.
    pub fn is_empty(&self) -> bool {
        self.node(ROOT).map_or(true, |root| {
            root.children.is_empty() && root.attrs.is_empty() && root.value.is_container()
        })
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub(crate) fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(Option::as_mut)
    }

    fn require(&self, id: NodeId) -> Result<&Node> {
        self.node(id)
            .ok_or_else(|| Error::NoSuchElement(format!("node {:?}", id)))
    }

    fn require_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.node_mut(id)
            .ok_or_else(|| Error::NoSuchElement(format!("node {:?}", id)))
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                NodeId(i)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    // ── Lookup ──

    fn nth_child(&self, parent: NodeId, name: &str, index: usize) -> Option<NodeId> {
        self.node(parent)?
            .children
            .iter()
            .copied()
            .filter(|&c| self.node(c).map_or(false, |n| n.name == name))
            .nth(index)
    }

    /// The node at `path`, if present.
    pub fn find(&self, path: &str) -> Option<NodeId> {
        let segments = parse_path(path).ok()?;
        self.resolve(ROOT, &segments)
    }

    fn resolve(&self, from: NodeId, segments: &[Segment<'_>]) -> Option<NodeId> {
        segments
            .iter()
            .try_fold(from, |cur, seg| self.nth_child(cur, seg.name, seg.index))
    }

    /// Like [`find`](Self::find) but a miss is `NoSuchElement`.
    pub fn lookup(&self, path: &str) -> Result<NodeId> {
        let segments = parse_path(path)?;
        self.resolve(ROOT, &segments)
            .ok_or_else(|| Error::NoSuchElement(path.to_owned()))
    }

    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.node(node).map(|n| n.name.as_str())
    }

    pub fn value(&self, node: NodeId) -> Option<&Value> {
        self.node(node).map(|n| &n.value)
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).and_then(|n| n.parent)
    }

    /// Children in insertion order; empty for a missing node.
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.node(node).map_or(&[], |n| n.children.as_slice())
    }

    /// Direct children of `parent` called `name`.
    pub fn child_count(&self, parent: NodeId, name: &str) -> usize {
        self.children(parent)
            .iter()
            .filter(|&&c| self.name(c) == Some(name))
            .count()
    }

    /// Depth of `node`; the root is level 0.
    pub fn level_of(&self, node: NodeId) -> Option<usize> {
        let mut level = 0;
        let mut cur = self.node(node)?;
        while let Some(parent) = cur.parent {
            cur = self.node(parent)?;
            level += 1;
        }
        Some(level)
    }

    /// Position of `node` among its parent's children of the same name,
    /// so that `name[index]` addresses it. The root is 0.
    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        let n = self.node(node)?;
        let Some(parent) = n.parent else {
            return Some(0);
        };
        let index = self
            .children(parent)
            .iter()
            .take_while(|&&c| c != node)
            .filter(|&&c| self.name(c) == Some(n.name.as_str()))
            .count();
        Some(index)
    }

    /// The path addressing `node`, with `[i]` on repeated names.
    pub fn path_of(&self, node: NodeId) -> Option<String> {
        let mut segments = Vec::new();
        let mut cur = node;
        while let Some(parent) = self.node(cur)?.parent {
            let name = &self.node(cur)?.name;
            let index = self.index_of(cur)?;
            segments.push(if index == 0 {
                name.clone()
            } else {
                format!("{}[{}]", name, index)
            });
            cur = parent;
        }
        segments.reverse();
        Some(segments.join("/"))
    }

    // ── Typed access ──

    pub fn get(&self, path: &str) -> Result<&Value> {
        let id = self.lookup(path)?;
        Ok(&self.require(id)?.value)
    }

    pub fn get_byte(&self, path: &str) -> Result<i8> {
        self.get(path)?.to_i8()
    }

    pub fn get_short(&self, path: &str) -> Result<i16> {
        self.get(path)?.to_i16()
    }

    pub fn get_int(&self, path: &str) -> Result<i32> {
        self.get(path)?.to_i32()
    }

    pub fn get_llong(&self, path: &str) -> Result<i64> {
        self.get(path)?.to_i64()
    }

    pub fn get_float(&self, path: &str) -> Result<f32> {
        self.get(path)?.to_f32()
    }

    pub fn get_double(&self, path: &str) -> Result<f64> {
        self.get(path)?.to_f64()
    }

    pub fn get_string(&self, path: &str) -> Result<String> {
        self.get(path)?.to_string_value()
    }

    // ── Mutation ──

    /// Append a node at `path`, creating missing intermediate containers.
    /// An existing node of the same name is kept; the new one follows it.
    pub fn add(&mut self, path: &str, value: impl Into<Value>) -> Result<NodeId> {
        let segments = parse_path(path)?;
        let (last, parents) = segments
            .split_last()
            .ok_or_else(|| Error::illegal_argument("cannot add at the root path"))?;
        let mut cur = ROOT;
        for seg in parents {
            cur = match self.nth_child(cur, seg.name, seg.index) {
                Some(c) => c,
                None if seg.index == 0 => self.add_child(cur, seg.name, Value::Container)?,
                None => return Err(Error::NoSuchElement(path.to_owned())),
            };
        }
        self.add_child(cur, last.name, value)
    }

    /// Replace the value at `path`, adding the node if absent.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) -> Result<NodeId> {
        match self.find(path) {
            Some(id) => {
                self.require_mut(id)?.value = value.into();
                Ok(id)
            }
            None => self.add(path, value),
        }
    }

    /// Append a child called `name` under `parent`.
    pub fn add_child(&mut self, parent: NodeId, name: &str, value: impl Into<Value>) -> Result<NodeId> {
        check_name(name)?;
        self.require(parent)?;
        let id = self.alloc(Node::new(name.to_owned(), value.into(), Some(parent)));
        self.require_mut(parent)?.children.push(id);
        Ok(id)
    }

    pub fn set_value(&mut self, node: NodeId, value: impl Into<Value>) -> Result<()> {
        self.require_mut(node)?.value = value.into();
        Ok(())
    }

    /// Remove the node at `path` with its subtree. The empty path clears
    /// the document.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let id = self.lookup(path)?;
        self.remove_node(id);
        Ok(())
    }

    /// Remove `node` and its subtree; the root is cleared instead.
    pub fn remove_node(&mut self, node: NodeId) {
        if node == ROOT {
            self.clear();
            return;
        }
        let Some(parent) = self.parent(node) else {
            return;
        };
        if let Some(p) = self.node_mut(parent) {
            p.children.retain(|&c| c != node);
        }
        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.nodes.get_mut(id.0).and_then(Option::take) {
                stack.extend(n.children);
                self.free.push(id.0);
            }
        }
    }

    // ── Attributes ──

    /// Set attribute `name` on the node at `path`, replacing any value it had.
    pub fn set_attr(&mut self, path: &str, name: &str, value: impl Into<Value>) -> Result<()> {
        let id = self.lookup(path)?;
        self.set_node_attr(id, name, value.into())
    }

    pub(crate) fn set_node_attr(&mut self, node: NodeId, name: &str, value: Value) -> Result<()> {
        check_name(name)?;
        if value.is_container() {
            return Err(Error::illegal_argument("attribute cannot be a container"));
        }
        let attrs = &mut self.require_mut(node)?.attrs;
        match attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => attrs.push((name.to_owned(), value)),
        }
        Ok(())
    }

    pub fn get_attr(&self, path: &str, name: &str) -> Option<&Value> {
        let id = self.find(path)?;
        self.attrs(id).iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Attributes of `node` in insertion order.
    pub fn attrs(&self, node: NodeId) -> &[(String, Value)] {
        self.node(node).map_or(&[], |n| n.attrs.as_slice())
    }

    // ── Decoder support ──

    pub(crate) fn reset_root(&mut self, name: String, value: Value, attrs: Vec<(String, Value)>) {
        self.clear();
        let root = &mut self.nodes[0];
        *root = Some(Node {
            name,
            value,
            attrs,
            children: Vec::new(),
            parent: None,
        });
    }

    pub(crate) fn attach(&mut self, parent: NodeId, name: String, value: Value, attrs: Vec<(String, Value)>) -> Result<NodeId> {
        self.require(parent)?;
        let mut node = Node::new(name, value, Some(parent));
        node.attrs = attrs;
        let id = self.alloc(node);
        self.require_mut(parent)?.children.push(id);
        Ok(id)
    }

    // ── Dump ──

    fn dump(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        let Some(n) = self.node(id) else {
            return Ok(());
        };
        let name = if id == ROOT && n.name.is_empty() { "/" } else { n.name.as_str() };
        write!(f, "{:indent$}{}", "", name, indent = depth * 2)?;
        if id == ROOT {
            write!(f, " [{}]", self.encoding)?;
        }
        for (k, v) in &n.attrs {
            write!(f, " @{}={}", k, v)?;
        }
        if !n.value.is_container() {
            write!(f, " = {} ({:?})", n.value, n.value.tag())?;
        }
        writeln!(f)?;
        for &c in &n.children {
            self.dump(f, c, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for BsonDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dump(f, ROOT, 0)
    }
}

impl fmt::Debug for BsonDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BsonDocument")
            .field("nodes", &self.len())
            .field("encoding", &self.encoding)
            .finish()
    }
}

/// Structural equality: encoding label, names, values, attributes and
/// child order.
impl PartialEq for BsonDocument {
    fn eq(&self, other: &Self) -> bool {
        fn same(a: &BsonDocument, ai: NodeId, b: &BsonDocument, bi: NodeId) -> bool {
            match (a.node(ai), b.node(bi)) {
                (Some(x), Some(y)) => {
                    x.name == y.name
                        && x.value == y.value
                        && x.attrs == y.attrs
                        && x.children.len() == y.children.len()
                        && x.children
                            .iter()
                            .zip(&y.children)
                            .all(|(&c, &d)| same(a, c, b, d))
                }
                _ => false,
            }
        }
        self.encoding == other.encoding && same(self, ROOT, other, ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BsonDocument {
        let mut doc = BsonDocument::new();
        doc.add("r/a", 1i32).unwrap();
        doc.add("r/b", "xy").unwrap();
        doc.add("r/item", 10i64).unwrap();
        doc.add("r/item", 11i64).unwrap();
        doc.add("r/item", 12i64).unwrap();
        doc
    }

    #[test]
    fn test_paths_and_indices() {
        let doc = sample();
        assert_eq!(doc.get_int("r/a").unwrap(), 1);
        assert_eq!(doc.get_string("r/b").unwrap(), "xy");
        assert_eq!(doc.get_llong("/r/item[2]").unwrap(), 12);
        assert_eq!(doc.get_llong("r/item").unwrap(), 10);
        assert!(doc.find("r/item[3]").is_none());
        assert!(matches!(doc.get_int("r/zz"), Err(Error::NoSuchElement(_))));
        assert!(matches!(doc.lookup("r/item[x]"), Err(Error::IllegalArgument(_))));
        assert_eq!(doc.lookup("").unwrap(), doc.root());

        let r = doc.find("r").unwrap();
        assert_eq!(doc.child_count(r, "item"), 3);
        assert_eq!(doc.child_count(r, "a"), 1);
        assert_eq!(doc.child_count(r, "none"), 0);
        assert_eq!(doc.children(r).len(), 5);
    }

    #[test]
    fn test_path_of_round_trips() {
        let doc = sample();
        for path in ["r", "r/a", "r/item", "r/item[1]", "r/item[2]"] {
            let id = doc.find(path).unwrap();
            assert_eq!(doc.path_of(id).unwrap(), path);
        }
        assert_eq!(doc.path_of(doc.root()).unwrap(), "");
    }

    #[test]
    fn test_set_replaces_or_adds() {
        let mut doc = sample();
        let a = doc.find("r/a").unwrap();
        assert_eq!(doc.set("r/a", 5i32).unwrap(), a);
        assert_eq!(doc.get_int("r/a").unwrap(), 5);
        doc.set("r/c/d", 2.5f64).unwrap();
        assert_eq!(doc.get_double("r/c/d").unwrap(), 2.5);
        assert!(doc.value(doc.find("r/c").unwrap()).unwrap().is_container());
    }

    #[test]
    fn test_add_rejects_bad_names() {
        let mut doc = BsonDocument::new();
        assert!(doc.add("", 1i32).is_err());
        assert!(doc.add("a//b", 1i32).is_err());
        let long = "n".repeat(MAX_NAME_LEN + 1);
        assert!(doc.add(&long, 1i32).is_err());
        assert!(matches!(doc.add("a[1]/b", 1i32), Err(Error::NoSuchElement(_))));
    }

    #[test]
    fn test_remove_frees_subtree() {
        let mut doc = sample();
        let before = doc.len();
        doc.remove("r/item[1]").unwrap();
        assert_eq!(doc.len(), before - 1);
        assert_eq!(doc.get_llong("r/item[1]").unwrap(), 12);
        doc.remove("r").unwrap();
        assert_eq!(doc.len(), 1);
        assert!(doc.is_empty());
        doc.add("x", 1i8).unwrap();
        doc.remove("").unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_attributes() {
        let mut doc = sample();
        doc.set_attr("r/a", "unit", "ms").unwrap();
        doc.set_attr("r/a", "scale", 3i32).unwrap();
        doc.set_attr("r/a", "unit", "s").unwrap();
        let a = doc.find("r/a").unwrap();
        assert_eq!(doc.attrs(a).len(), 2);
        assert_eq!(doc.attrs(a)[0].0, "unit");
        assert_eq!(doc.get_attr("r/a", "unit"), Some(&Value::from("s")));
        assert!(doc.get_attr("r/a", "missing").is_none());
        assert!(doc.set_attr("r/a", "c", Value::Container).is_err());
    }

    #[test]
    fn test_display_dump() {
        let mut doc = BsonDocument::new();
        doc.add("r/a", 1i32).unwrap();
        doc.set_attr("r", "v", 2i8).unwrap();
        let text = doc.to_string();
        assert_eq!(text, "/ [UTF-8]\n  r @v=2\n    a = 1 (I32)\n");
    }

    #[test]
    fn test_level_of() {
        let mut doc = sample();
        let deep = doc.add("r/c/d/e", 1i8).unwrap();
        assert_eq!(doc.level_of(doc.root()), Some(0));
        assert_eq!(doc.level_of(doc.find("r").unwrap()), Some(1));
        assert_eq!(doc.level_of(doc.find("r/item[2]").unwrap()), Some(2));
        assert_eq!(doc.level_of(deep), Some(4));
        doc.remove("r/c").unwrap();
        assert_eq!(doc.level_of(deep), None);
    }

    #[test]
    fn test_index_of_same_name_group() {
        let doc = sample();
        assert_eq!(doc.index_of(doc.root()), Some(0));
        assert_eq!(doc.index_of(doc.find("r/a").unwrap()), Some(0));
        // Other names in between do not count
        assert_eq!(doc.index_of(doc.find("r/b").unwrap()), Some(0));
        for i in 0..3 {
            let id = doc.find(&format!("r/item[{}]", i)).unwrap();
            assert_eq!(doc.index_of(id), Some(i));
        }
        let mut doc = doc;
        doc.remove("r/item[0]").unwrap();
        assert_eq!(doc.index_of(doc.find("r/item[1]").unwrap()), Some(1));
        assert_eq!(doc.get_llong("r/item[1]").unwrap(), 12);
    }

    #[test]
    fn test_encoding_label() {
        let mut doc = sample();
        assert_eq!(doc.encoding(), DEFAULT_ENCODING);
        doc.set_encoding("ISO-8859-1").unwrap();
        assert!(doc.set_encoding("").is_err());
        assert_ne!(doc, sample());
        doc.clear();
        assert_eq!(doc.encoding(), "ISO-8859-1");
        assert!(doc.to_string().starts_with("/ [ISO-8859-1]\n"));
        assert_eq!(doc.clone().encoding(), "ISO-8859-1");
    }
}
