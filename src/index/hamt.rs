//! Persistent hash-array-mapped trie.
//!
//! Keys hash to 64 bits. Ten levels consume six bits each, an eleventh
//! level the remaining four; keys whose hashes are fully equal share a
//! linear collision node. Internal nodes are created only where hashes
//! diverge and record their own depth plus a representative hash prefix,
//! so no internal node ever has fewer than two children.
//!
//! Mutation is copy-on-write: inserting copies the nodes on the path to
//! the affected leaf into heap buffers and leaves every other subtree
//! referenced by its committed address. `flush` writes the heap nodes
//! out post-order, so a committed child's address is always strictly
//! below its parent's — and below the root record published in the
//! trailer.
//!
//! On-disk encodings (little-endian, 8-aligned):
//! ```text
//! leaf:      hash: u64, key, value
//! linear:    hash: u64, count: varint, (key, value) x count
//! internal:  bitmap: u64, prefix: u64, depth: u64, child-word x popcount
//! root rec:  root child-word: u64, entry count: u64
//! ```
//! A child word is the child's address with a kind tag in the low three
//! bits (addresses are 8-aligned): 0 leaf, 1 internal, 2 linear.

use crate::address::{Address, Extent};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::index::{IndexKey, IndexValue};
use crate::serialize::{ArchiveReader, ArchiveWriter};
use crate::transaction::Transaction;

// ── Tree geometry ──────────────────────────────────────────────────

/// Depth of the last internal level; levels 0..MAX_DEPTH consume six
/// hash bits each, level MAX_DEPTH the remaining four.
const MAX_DEPTH: u8 = 10;

/// Hash fragment indexing a node's bitmap at `depth`.
#[inline]
fn fragment(hash: u64, depth: u8) -> u32 {
    if depth < MAX_DEPTH {
        ((hash >> (6 * u32::from(depth))) & 0x3f) as u32
    } else {
        ((hash >> 60) & 0x0f) as u32
    }
}

/// First depth at which two distinct hashes index different slots.
fn divergence_depth(a: u64, b: u64) -> Option<u8> {
    (0..=MAX_DEPTH).find(|&d| fragment(a, d) != fragment(b, d))
}

// ── Child references ───────────────────────────────────────────────

const TAG_MASK: u64 = 0b111;
const TAG_LEAF: u64 = 0;
const TAG_INTERNAL: u64 = 1;
const TAG_LINEAR: u64 = 2;

/// A child slot: either a committed node named by address or an in-heap
/// buffer created by an insert in the current transaction.
#[derive(Debug, Clone)]
pub(crate) enum Child<K, V> {
    StoreLeaf(Address),
    StoreInternal(Address),
    StoreLinear(Address),
    HeapLeaf(Box<LeafNode<K, V>>),
    HeapInternal(Box<InternalNode<K, V>>),
    HeapLinear(Box<LinearNode<K, V>>),
}

#[derive(Debug, Clone)]
pub(crate) struct LeafNode<K, V> {
    hash: u64,
    key: K,
    value: V,
}

#[derive(Debug, Clone)]
pub(crate) struct InternalNode<K, V> {
    /// Level of the trie this node's bitmap indexes.
    depth: u8,
    /// Hash of some key beneath this node; all keys beneath agree with
    /// it on every fragment before `depth`.
    prefix: u64,
    bitmap: u64,
    children: Vec<Child<K, V>>,
}

#[derive(Debug, Clone)]
pub(crate) struct LinearNode<K, V> {
    /// The full hash every entry shares.
    hash: u64,
    entries: Vec<(K, V)>,
}

impl<K, V> InternalNode<K, V> {
    #[inline]
    fn slot(&self, frag: u32) -> usize {
        (self.bitmap & ((1u64 << frag) - 1)).count_ones() as usize
    }

    #[inline]
    fn has(&self, frag: u32) -> bool {
        self.bitmap & (1u64 << frag) != 0
    }
}

fn child_from_word<K, V>(word: u64, parent: Address) -> Result<Child<K, V>> {
    let addr = Address::new(word & !TAG_MASK);
    if addr.is_null() || addr >= parent {
        return Err(StoreError::IndexCorrupt(format!(
            "child reference {word:#x} does not precede its parent {parent}"
        )));
    }
    match word & TAG_MASK {
        TAG_LEAF => Ok(Child::StoreLeaf(addr)),
        TAG_INTERNAL => Ok(Child::StoreInternal(addr)),
        TAG_LINEAR => Ok(Child::StoreLinear(addr)),
        tag => Err(StoreError::IndexCorrupt(format!("unknown child tag {tag}"))),
    }
}

/// Reader over the tail of the store starting at a node address. The
/// bound only protects decoding of corrupt data; well-formed nodes say
/// how much to read themselves.
fn reader_at(db: &Database, addr: Address) -> Result<ArchiveReader<'_>> {
    let size = db.size();
    if addr.absolute() >= size {
        return Err(StoreError::BadAddress {
            addr: addr.absolute(),
            size: 0,
        });
    }
    Ok(ArchiveReader::new(
        db,
        Extent::new(addr, size - addr.absolute()),
    ))
}

// ── HamtMap ────────────────────────────────────────────────────────

/// A persistent key→value map with structural sharing across revisions.
pub struct HamtMap<K, V> {
    root: Option<Child<K, V>>,
    len: u64,
    dirty: bool,
    /// Root record extent as of the last load/flush; returned verbatim
    /// by a flush with no mutations.
    committed_record: Extent<u8>,
}

impl<K: IndexKey, V: IndexValue> HamtMap<K, V> {
    pub fn empty() -> Self {
        HamtMap {
            root: None,
            len: 0,
            dirty: false,
            committed_record: Extent::NULL,
        }
    }

    /// Load from a trailer's root record; a null record is the empty map.
    pub fn load(db: &Database, record: Extent<u8>) -> Result<Self> {
        if record.is_null() {
            return Ok(Self::empty());
        }
        if record.size != 16 {
            return Err(StoreError::IndexCorrupt(format!(
                "index root record has size {}",
                record.size
            )));
        }
        let mut r = ArchiveReader::new(db, record);
        let root_word = r.get_u64()?;
        let len = r.get_u64()?;
        let root = child_from_word(root_word, record.addr)?;
        Ok(HamtMap {
            root: Some(root),
            len,
            dirty: false,
            committed_record: record,
        })
    }

    /// Number of entries.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True iff there are unflushed mutations.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    // ── Lookup ─────────────────────────────────────────────────────

    /// Find the value stored under `key`.
    pub fn find(&self, db: &Database, key: &K) -> Result<Option<V>> {
        Ok(self.find_entry(db, key)?.map(|(_, v)| v))
    }

    /// Find the stored entry for `key` (the stored key can carry more
    /// than the probe, e.g. an indirect string's extent).
    pub fn find_entry(&self, db: &Database, key: &K) -> Result<Option<(K, V)>> {
        match &self.root {
            None => Ok(None),
            Some(root) => Self::find_in(db, root, 0, key.hash_key(), key),
        }
    }

    fn find_in(
        db: &Database,
        child: &Child<K, V>,
        from_depth: u8,
        hash: u64,
        key: &K,
    ) -> Result<Option<(K, V)>> {
        match child {
            Child::StoreLeaf(addr) => {
                let leaf = read_leaf::<K, V>(db, *addr)?;
                Self::match_leaf(db, &leaf, hash, key)
            }
            Child::HeapLeaf(leaf) => Self::match_leaf(db, leaf, hash, key),
            Child::StoreLinear(addr) => {
                let lin = read_linear::<K, V>(db, *addr)?;
                Self::match_linear(db, &lin, hash, key)
            }
            Child::HeapLinear(lin) => Self::match_linear(db, lin, hash, key),
            Child::StoreInternal(addr) => {
                let node = read_internal::<K, V>(db, *addr, from_depth)?;
                Self::find_in_internal(db, &node, from_depth, hash, key)
            }
            Child::HeapInternal(node) => {
                Self::find_in_internal(db, node, from_depth, hash, key)
            }
        }
    }

    fn find_in_internal(
        db: &Database,
        node: &InternalNode<K, V>,
        from_depth: u8,
        hash: u64,
        key: &K,
    ) -> Result<Option<(K, V)>> {
        if node.depth < from_depth {
            return Err(StoreError::IndexCorrupt(
                "internal node depth does not increase".into(),
            ));
        }
        // Every key beneath agrees with the prefix on the skipped
        // levels; a mismatch there means the key is absent.
        for d in from_depth..node.depth {
            if fragment(hash, d) != fragment(node.prefix, d) {
                return Ok(None);
            }
        }
        let frag = fragment(hash, node.depth);
        if !node.has(frag) {
            return Ok(None);
        }
        let child = &node.children[node.slot(frag)];
        Self::find_in(db, child, node.depth + 1, hash, key)
    }

    fn match_leaf(
        db: &Database,
        leaf: &LeafNode<K, V>,
        hash: u64,
        key: &K,
    ) -> Result<Option<(K, V)>> {
        if leaf.hash == hash && key.key_eq(&leaf.key, db)? {
            Ok(Some((leaf.key.clone(), leaf.value.clone())))
        } else {
            Ok(None)
        }
    }

    fn match_linear(
        db: &Database,
        lin: &LinearNode<K, V>,
        hash: u64,
        key: &K,
    ) -> Result<Option<(K, V)>> {
        if lin.hash != hash {
            return Ok(None);
        }
        for (k, v) in &lin.entries {
            if key.key_eq(k, db)? {
                return Ok(Some((k.clone(), v.clone())));
            }
        }
        Ok(None)
    }

    // ── Insertion ──────────────────────────────────────────────────

    /// Insert `key → value`, replacing any existing value. Returns true
    /// iff the key was not present before.
    ///
    /// Nothing is allocated in the store here; new nodes live on the
    /// heap until [`HamtMap::flush`].
    pub fn insert_or_assign(
        &mut self,
        tx: &Transaction<'_>,
        key: K,
        value: V,
    ) -> Result<bool> {
        let db = tx.db();
        let hash = key.hash_key();
        let (new_root, inserted) = match self.root.take() {
            None => (
                Child::HeapLeaf(Box::new(LeafNode { hash, key, value })),
                true,
            ),
            Some(root) => Self::insert_in(db, root, 0, hash, key, value)?,
        };
        self.root = Some(new_root);
        if inserted {
            self.len += 1;
        }
        self.dirty = true;
        Ok(inserted)
    }

    fn insert_in(
        db: &Database,
        child: Child<K, V>,
        from_depth: u8,
        hash: u64,
        key: K,
        value: V,
    ) -> Result<(Child<K, V>, bool)> {
        match child {
            Child::StoreLeaf(addr) => {
                let leaf = read_leaf::<K, V>(db, addr)?;
                Self::insert_into_leaf(db, leaf, from_depth, hash, key, value)
            }
            Child::HeapLeaf(leaf) => {
                Self::insert_into_leaf(db, *leaf, from_depth, hash, key, value)
            }
            Child::StoreLinear(addr) => {
                let lin = read_linear::<K, V>(db, addr)?;
                Self::insert_into_linear(db, lin, from_depth, hash, key, value)
            }
            Child::HeapLinear(lin) => {
                Self::insert_into_linear(db, *lin, from_depth, hash, key, value)
            }
            Child::StoreInternal(addr) => {
                let node = read_internal::<K, V>(db, addr, from_depth)?;
                Self::insert_into_internal(db, node, from_depth, hash, key, value)
            }
            Child::HeapInternal(node) => {
                Self::insert_into_internal(db, *node, from_depth, hash, key, value)
            }
        }
    }

    fn insert_into_leaf(
        db: &Database,
        leaf: LeafNode<K, V>,
        from_depth: u8,
        hash: u64,
        key: K,
        value: V,
    ) -> Result<(Child<K, V>, bool)> {
        if leaf.hash == hash {
            if key.key_eq(&leaf.key, db)? {
                // Same key: assign.
                return Ok((
                    Child::HeapLeaf(Box::new(LeafNode { hash, key, value })),
                    false,
                ));
            }
            // Full 64-bit hash collision: linear node.
            return Ok((
                Child::HeapLinear(Box::new(LinearNode {
                    hash,
                    entries: vec![(leaf.key, leaf.value), (key, value)],
                })),
                true,
            ));
        }
        let old_hash = leaf.hash;
        let node = Self::two_children(
            from_depth,
            old_hash,
            Child::HeapLeaf(Box::new(leaf)),
            hash,
            Child::HeapLeaf(Box::new(LeafNode { hash, key, value })),
        );
        Ok((Child::HeapInternal(Box::new(node)), true))
    }

    fn insert_into_linear(
        db: &Database,
        mut lin: LinearNode<K, V>,
        from_depth: u8,
        hash: u64,
        key: K,
        value: V,
    ) -> Result<(Child<K, V>, bool)> {
        if lin.hash == hash {
            for entry in &mut lin.entries {
                if key.key_eq(&entry.0, db)? {
                    *entry = (key, value);
                    return Ok((Child::HeapLinear(Box::new(lin)), false));
                }
            }
            lin.entries.push((key, value));
            return Ok((Child::HeapLinear(Box::new(lin)), true));
        }
        let old_hash = lin.hash;
        let node = Self::two_children(
            from_depth,
            old_hash,
            Child::HeapLinear(Box::new(lin)),
            hash,
            Child::HeapLeaf(Box::new(LeafNode { hash, key, value })),
        );
        Ok((Child::HeapInternal(Box::new(node)), true))
    }

    fn insert_into_internal(
        db: &Database,
        mut node: InternalNode<K, V>,
        from_depth: u8,
        hash: u64,
        key: K,
        value: V,
    ) -> Result<(Child<K, V>, bool)> {
        if node.depth < from_depth {
            return Err(StoreError::IndexCorrupt(
                "internal node depth does not increase".into(),
            ));
        }
        // If the new key disagrees with this subtree's shared prefix on
        // a skipped level, the trees part ways above this node.
        for d in from_depth..node.depth {
            if fragment(hash, d) != fragment(node.prefix, d) {
                let old_prefix = node.prefix;
                let parent = Self::two_children(
                    d,
                    old_prefix,
                    Child::HeapInternal(Box::new(node)),
                    hash,
                    Child::HeapLeaf(Box::new(LeafNode { hash, key, value })),
                );
                return Ok((Child::HeapInternal(Box::new(parent)), true));
            }
        }

        let frag = fragment(hash, node.depth);
        let idx = node.slot(frag);
        if !node.has(frag) {
            node.bitmap |= 1u64 << frag;
            node.children.insert(
                idx,
                Child::HeapLeaf(Box::new(LeafNode { hash, key, value })),
            );
            return Ok((Child::HeapInternal(Box::new(node)), true));
        }

        let old = node.children.remove(idx);
        let (new_child, inserted) =
            Self::insert_in(db, old, node.depth + 1, hash, key, value)?;
        node.children.insert(idx, new_child);
        Ok((Child::HeapInternal(Box::new(node)), inserted))
    }

    /// An internal node holding two children at their divergence depth.
    fn two_children(
        min_depth: u8,
        a_hash: u64,
        a: Child<K, V>,
        b_hash: u64,
        b: Child<K, V>,
    ) -> InternalNode<K, V> {
        let depth = divergence_depth(a_hash, b_hash)
            .expect("distinct hashes must diverge in some fragment");
        debug_assert!(depth >= min_depth);
        let fa = fragment(a_hash, depth);
        let fb = fragment(b_hash, depth);
        debug_assert_ne!(fa, fb);
        let (children, bitmap) = if fa < fb {
            (vec![a, b], (1u64 << fa) | (1u64 << fb))
        } else {
            (vec![b, a], (1u64 << fa) | (1u64 << fb))
        };
        InternalNode {
            depth,
            prefix: a_hash,
            bitmap,
            children,
        }
    }

    // ── Flush ──────────────────────────────────────────────────────

    /// Write out every heap node post-order and return the new root
    /// record. Idempotent: with no mutations since the last flush or
    /// load, the previous record is returned unchanged.
    pub fn flush(&mut self, tx: &mut Transaction<'_>) -> Result<Extent<u8>> {
        if !self.dirty {
            return Ok(self.committed_record);
        }
        let root_word = match self.root.as_mut() {
            Some(root) => Self::flush_child(tx, root)?,
            None => 0,
        };
        let mut w = ArchiveWriter::new(8);
        w.put_u64(root_word);
        w.put_u64(self.len);
        let record = w.finish(tx)?;
        self.committed_record = record;
        self.dirty = false;
        Ok(record)
    }

    fn flush_child(tx: &mut Transaction<'_>, child: &mut Child<K, V>) -> Result<u64> {
        let (addr, tag) = match child {
            // Committed subtrees are emitted verbatim.
            Child::StoreLeaf(addr) => return Ok(addr.absolute() | TAG_LEAF),
            Child::StoreInternal(addr) => return Ok(addr.absolute() | TAG_INTERNAL),
            Child::StoreLinear(addr) => return Ok(addr.absolute() | TAG_LINEAR),
            Child::HeapLeaf(leaf) => {
                let mut w = ArchiveWriter::new(8);
                w.put_u64(leaf.hash);
                leaf.key.encode(&mut w)?;
                leaf.value.encode(&mut w)?;
                (w.finish(tx)?.addr, TAG_LEAF)
            }
            Child::HeapLinear(lin) => {
                let mut w = ArchiveWriter::new(8);
                w.put_u64(lin.hash);
                w.put_varint(lin.entries.len() as u64);
                for (k, v) in &lin.entries {
                    k.encode(&mut w)?;
                    v.encode(&mut w)?;
                }
                (w.finish(tx)?.addr, TAG_LINEAR)
            }
            Child::HeapInternal(node) => {
                // Children first so every stored reference points below.
                let mut words = Vec::with_capacity(node.children.len());
                for c in &mut node.children {
                    words.push(Self::flush_child(tx, c)?);
                }
                let mut w = ArchiveWriter::new(8);
                w.put_u64(node.bitmap);
                w.put_u64(node.prefix);
                w.put_u64(u64::from(node.depth));
                for word in words {
                    w.put_u64(word);
                }
                (w.finish(tx)?.addr, TAG_INTERNAL)
            }
        };
        debug_assert_eq!(addr.absolute() & TAG_MASK, 0);
        *child = match tag {
            TAG_LEAF => Child::StoreLeaf(addr),
            TAG_LINEAR => Child::StoreLinear(addr),
            _ => Child::StoreInternal(addr),
        };
        Ok(addr.absolute() | tag)
    }

    /// Visit every key held in a heap node, mutably. Used by the name
    /// index to swap pending strings for their committed extents just
    /// before flush; committed subtrees hold no such keys.
    pub(crate) fn for_each_heap_key_mut(&mut self, f: &mut impl FnMut(&mut K)) {
        if let Some(root) = self.root.as_mut() {
            Self::visit_heap_keys(root, f);
        }
    }

    fn visit_heap_keys(child: &mut Child<K, V>, f: &mut impl FnMut(&mut K)) {
        match child {
            Child::HeapLeaf(leaf) => f(&mut leaf.key),
            Child::HeapLinear(lin) => {
                for (k, _) in &mut lin.entries {
                    f(k);
                }
            }
            Child::HeapInternal(node) => {
                for c in &mut node.children {
                    Self::visit_heap_keys(c, f);
                }
            }
            Child::StoreLeaf(_) | Child::StoreInternal(_) | Child::StoreLinear(_) => {}
        }
    }

    // ── Iteration ──────────────────────────────────────────────────

    /// In-order iteration over all entries at this map's state. Stable
    /// for readers pinned to one revision; not defined across them.
    pub fn iter<'a>(&'a self, db: &'a Database) -> Iter<'a, K, V> {
        let mut it = Iter {
            db,
            stack: Vec::new(),
            pending: None,
            error: false,
        };
        if let Some(root) = &self.root {
            if let Some(item) = it.enter(root) {
                it.pending = Some(item);
            }
        }
        it
    }
}

// ── Node decoding ──────────────────────────────────────────────────

fn read_leaf<K: IndexKey, V: IndexValue>(
    db: &Database,
    addr: Address,
) -> Result<LeafNode<K, V>> {
    let mut r = reader_at(db, addr)?;
    let hash = r.get_u64()?;
    let key = K::decode(&mut r)?;
    let value = V::decode(&mut r)?;
    Ok(LeafNode { hash, key, value })
}

fn read_linear<K: IndexKey, V: IndexValue>(
    db: &Database,
    addr: Address,
) -> Result<LinearNode<K, V>> {
    let mut r = reader_at(db, addr)?;
    let hash = r.get_u64()?;
    let count = r.get_varint()?;
    if count < 2 {
        return Err(StoreError::IndexCorrupt(format!(
            "linear node with {count} entries"
        )));
    }
    let mut entries = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let k = K::decode(&mut r)?;
        let v = V::decode(&mut r)?;
        entries.push((k, v));
    }
    Ok(LinearNode { hash, entries })
}

fn read_internal<K: IndexKey, V: IndexValue>(
    db: &Database,
    addr: Address,
    from_depth: u8,
) -> Result<InternalNode<K, V>> {
    let mut r = reader_at(db, addr)?;
    let bitmap = r.get_u64()?;
    let prefix = r.get_u64()?;
    let depth = r.get_u64()?;
    if depth > u64::from(MAX_DEPTH) || depth < u64::from(from_depth) {
        return Err(StoreError::IndexCorrupt(format!(
            "internal node depth {depth} out of range"
        )));
    }
    let depth = depth as u8;
    if depth == MAX_DEPTH && bitmap >= 1 << 16 {
        return Err(StoreError::IndexCorrupt(
            "bottom-level bitmap wider than 16 bits".into(),
        ));
    }
    let count = bitmap.count_ones() as usize;
    if count < 2 {
        return Err(StoreError::IndexCorrupt(format!(
            "internal node with {count} children"
        )));
    }
    let mut children = Vec::with_capacity(count);
    for _ in 0..count {
        // Children strictly precede their parent, which bounds every
        // walk and makes reference cycles impossible.
        children.push(child_from_word(r.get_u64()?, addr)?);
    }
    Ok(InternalNode {
        depth,
        prefix,
        bitmap,
        children,
    })
}

// ── Iterator ───────────────────────────────────────────────────────

enum Frame<'a, K, V> {
    Borrowed(&'a InternalNode<K, V>, usize),
    Owned(InternalNode<K, V>, usize),
    Entries(std::vec::IntoIter<(K, V)>),
}

/// Depth-first in-order traversal; yields owned (key, value) pairs.
pub struct Iter<'a, K, V> {
    db: &'a Database,
    stack: Vec<Frame<'a, K, V>>,
    pending: Option<Result<(K, V)>>,
    error: bool,
}

impl<'a, K: IndexKey, V: IndexValue> Iter<'a, K, V> {
    /// Descend into `child`; returns an item if it resolved directly to
    /// a leaf, otherwise pushes a frame.
    fn enter(&mut self, child: &'a Child<K, V>) -> Option<Result<(K, V)>> {
        match child {
            Child::HeapLeaf(leaf) => Some(Ok((leaf.key.clone(), leaf.value.clone()))),
            Child::HeapLinear(lin) => {
                self.stack
                    .push(Frame::Entries(lin.entries.clone().into_iter()));
                None
            }
            Child::HeapInternal(node) => {
                self.stack.push(Frame::Borrowed(node.as_ref(), 0));
                None
            }
            Child::StoreLeaf(addr) => Some(
                read_leaf::<K, V>(self.db, *addr).map(|l| (l.key, l.value)),
            ),
            Child::StoreLinear(addr) => match read_linear::<K, V>(self.db, *addr) {
                Ok(lin) => {
                    self.stack.push(Frame::Entries(lin.entries.into_iter()));
                    None
                }
                Err(e) => Some(Err(e)),
            },
            Child::StoreInternal(addr) => {
                match read_internal::<K, V>(self.db, *addr, 0) {
                    Ok(node) => {
                        self.stack.push(Frame::Owned(node, 0));
                        None
                    }
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }

    /// Like `enter` for children of an owned (decoded) node; those are
    /// always committed references.
    fn enter_owned(&mut self, child: Child<K, V>) -> Option<Result<(K, V)>> {
        match child {
            Child::StoreLeaf(addr) => Some(
                read_leaf::<K, V>(self.db, addr).map(|l| (l.key, l.value)),
            ),
            Child::StoreLinear(addr) => match read_linear::<K, V>(self.db, addr) {
                Ok(lin) => {
                    self.stack.push(Frame::Entries(lin.entries.into_iter()));
                    None
                }
                Err(e) => Some(Err(e)),
            },
            Child::StoreInternal(addr) => match read_internal::<K, V>(self.db, addr, 0) {
                Ok(node) => {
                    self.stack.push(Frame::Owned(node, 0));
                    None
                }
                Err(e) => Some(Err(e)),
            },
            // A decoded node only holds committed children.
            _ => Some(Err(StoreError::IndexCorrupt(
                "heap child beneath a committed node".into(),
            ))),
        }
    }
}

enum Step<'a, K, V> {
    Item(K, V),
    Borrowed(&'a Child<K, V>),
    Owned(Child<K, V>),
    Pop,
}

impl<'a, K: IndexKey, V: IndexValue> Iterator for Iter<'a, K, V> {
    type Item = Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.error {
            return None;
        }
        if let Some(item) = self.pending.take() {
            self.error = item.is_err();
            return Some(item);
        }
        loop {
            let step = match self.stack.last_mut()? {
                Frame::Entries(entries) => match entries.next() {
                    Some((k, v)) => Step::Item(k, v),
                    None => Step::Pop,
                },
                Frame::Borrowed(node, pos) => {
                    // Copy the long-lived reference out so descending
                    // does not keep the stack borrowed.
                    let node: &'a InternalNode<K, V> = *node;
                    if *pos < node.children.len() {
                        let child = &node.children[*pos];
                        *pos += 1;
                        Step::Borrowed(child)
                    } else {
                        Step::Pop
                    }
                }
                Frame::Owned(node, pos) => {
                    if *pos < node.children.len() {
                        // Children of a decoded node are committed
                        // references; the clone is two words.
                        let child = node.children[*pos].clone();
                        *pos += 1;
                        Step::Owned(child)
                    } else {
                        Step::Pop
                    }
                }
            };
            let item = match step {
                Step::Item(k, v) => return Some(Ok((k, v))),
                Step::Pop => {
                    self.stack.pop();
                    continue;
                }
                Step::Borrowed(child) => self.enter(child),
                Step::Owned(child) => self.enter_owned(child),
            };
            if let Some(item) = item {
                self.error = item.is_err();
                return Some(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::index::IndexSet;
    use crate::region::RegionConfig;
    use crate::transaction::Transaction;
    use tempfile::TempDir;

    fn test_config() -> RegionConfig {
        RegionConfig {
            min_region_size: 4096,
            full_region_size: 16384,
        }
    }

    fn new_db(dir: &TempDir) -> Database {
        Database::create_with(&dir.path().join("t.db"), test_config()).unwrap()
    }

    // A key with an explicit hash so collisions are constructible.
    #[derive(Debug, Clone, PartialEq)]
    struct TestKey {
        hash: u64,
        id: u32,
    }

    impl IndexKey for TestKey {
        fn hash_key(&self) -> u64 {
            self.hash
        }

        fn encode(&self, w: &mut ArchiveWriter) -> Result<()> {
            w.put_u64(self.hash);
            w.put_u32(self.id);
            Ok(())
        }

        fn decode(r: &mut ArchiveReader<'_>) -> Result<Self> {
            let hash = r.get_u64()?;
            let id = r.get_u32()?;
            Ok(TestKey { hash, id })
        }

        fn key_eq(&self, stored: &Self, _db: &Database) -> Result<bool> {
            Ok(self == stored)
        }
    }

    type TestMap = HamtMap<TestKey, u64>;

    fn key(hash: u64, id: u32) -> TestKey {
        TestKey { hash, id }
    }

    #[test]
    fn test_fragment_covers_all_bits() {
        // 10 x 6 + 4 = 64 bits; every bit of the hash lands somewhere.
        let mut covered = 0u64;
        for d in 0..=MAX_DEPTH {
            let width = if d < MAX_DEPTH { 6 } else { 4 };
            let shift = if d < MAX_DEPTH { 6 * u64::from(d) } else { 60 };
            covered |= ((1u64 << width) - 1) << shift;
        }
        assert_eq!(covered, u64::MAX);
    }

    #[test]
    fn test_divergence_depth() {
        assert_eq!(divergence_depth(0b000001, 0b000010), Some(0));
        assert_eq!(divergence_depth(0x40, 0x80), Some(1));
        // Differ only in the top four bits.
        assert_eq!(divergence_depth(0, 1 << 60), Some(MAX_DEPTH));
        assert_eq!(divergence_depth(7, 7), None);
    }

    #[test]
    fn test_insert_find_heap_only() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut map = TestMap::empty();
        let tx = Transaction::begin(&mut db).unwrap();

        assert!(map.insert_or_assign(&tx, key(1, 1), 100).unwrap());
        assert!(map.insert_or_assign(&tx, key(2, 2), 200).unwrap());
        assert!(!map.insert_or_assign(&tx, key(1, 1), 101).unwrap());

        assert_eq!(map.len(), 2);
        assert_eq!(map.find(tx.db(), &key(1, 1)).unwrap(), Some(101));
        assert_eq!(map.find(tx.db(), &key(2, 2)).unwrap(), Some(200));
        assert_eq!(map.find(tx.db(), &key(3, 3)).unwrap(), None);
    }

    #[test]
    fn test_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let record = {
            let mut map = TestMap::empty();
            let mut tx = Transaction::begin(&mut db).unwrap();
            for i in 0..200u64 {
                map.insert_or_assign(&tx, key(i.wrapping_mul(0x9e37_79b9_7f4a_7c15), i as u32), i)
                    .unwrap();
            }
            let record = map.flush(&mut tx).unwrap();
            tx.commit(&mut indexes).unwrap();
            record
        };

        let map = TestMap::load(&db, record).unwrap();
        assert_eq!(map.len(), 200);
        for i in 0..200u64 {
            let k = key(i.wrapping_mul(0x9e37_79b9_7f4a_7c15), i as u32);
            assert_eq!(map.find(&db, &k).unwrap(), Some(i), "key {i}");
        }
        assert_eq!(map.find(&db, &key(42, 9999)).unwrap(), None);
    }

    #[test]
    fn test_flush_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut map = TestMap::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        map.insert_or_assign(&tx, key(1, 1), 1).unwrap();
        let r1 = map.flush(&mut tx).unwrap();
        let r2 = map.flush(&mut tx).unwrap();
        assert_eq!(r1, r2);
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        // A later flush with no further mutations repeats the record.
        let mut tx = Transaction::begin(&mut db).unwrap();
        let r3 = map.flush(&mut tx).unwrap();
        assert_eq!(r1, r3);
        tx.rollback().unwrap();
    }

    #[test]
    fn test_structural_sharing_across_commits() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut map = TestMap::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        for i in 0..50u64 {
            map.insert_or_assign(&tx, key(i << 6 | 1, i as u32), i).unwrap();
        }
        let r1 = map.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        // Second transaction touches one key; old root stays valid.
        let mut tx = Transaction::begin(&mut db).unwrap();
        map.insert_or_assign(&tx, key(3 << 6 | 1, 3), 999).unwrap();
        let r2 = map.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);
        assert_ne!(r1, r2);

        let old = TestMap::load(&db, r1).unwrap();
        let new = TestMap::load(&db, r2).unwrap();
        assert_eq!(old.find(&db, &key(3 << 6 | 1, 3)).unwrap(), Some(3));
        assert_eq!(new.find(&db, &key(3 << 6 | 1, 3)).unwrap(), Some(999));
    }

    #[test]
    fn test_full_hash_collision_goes_linear() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut map = TestMap::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        // Same 64-bit hash, three distinct keys.
        assert!(map.insert_or_assign(&tx, key(0xdead, 1), 10).unwrap());
        assert!(map.insert_or_assign(&tx, key(0xdead, 2), 20).unwrap());
        assert!(map.insert_or_assign(&tx, key(0xdead, 3), 30).unwrap());
        assert!(!map.insert_or_assign(&tx, key(0xdead, 2), 21).unwrap());
        assert_eq!(map.len(), 3);

        let record = map.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let map = TestMap::load(&db, record).unwrap();
        assert_eq!(map.find(&db, &key(0xdead, 1)).unwrap(), Some(10));
        assert_eq!(map.find(&db, &key(0xdead, 2)).unwrap(), Some(21));
        assert_eq!(map.find(&db, &key(0xdead, 3)).unwrap(), Some(30));
        assert_eq!(map.find(&db, &key(0xdead, 4)).unwrap(), None);

        // Iteration yields each entry exactly once.
        let mut ids: Vec<u32> = map
            .iter(&db)
            .map(|r| r.unwrap().0.id)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_partial_collision_splits_at_divergence() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut map = TestMap::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        // Hashes agree on the bottom 60 bits, differ in the top four:
        // the split happens at the last level.
        let a = key(0x0aaa_aaaa_aaaa_aaaa & !(0xf << 60), 1);
        let b = key(a.hash | (0x5 << 60), 2);
        map.insert_or_assign(&tx, a.clone(), 1).unwrap();
        map.insert_or_assign(&tx, b.clone(), 2).unwrap();

        let record = map.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let map = TestMap::load(&db, record).unwrap();
        assert_eq!(map.find(&db, &a).unwrap(), Some(1));
        assert_eq!(map.find(&db, &b).unwrap(), Some(2));

        // A third key diverging at depth 0 restructures above the pair.
        let mut tx = Transaction::begin(&mut db).unwrap();
        let mut map = TestMap::load(tx.db(), record).unwrap();
        let c = key(a.hash ^ 1, 3);
        map.insert_or_assign(&tx, c.clone(), 3).unwrap();
        let record = map.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let map = TestMap::load(&db, record).unwrap();
        assert_eq!(map.find(&db, &a).unwrap(), Some(1));
        assert_eq!(map.find(&db, &b).unwrap(), Some(2));
        assert_eq!(map.find(&db, &c).unwrap(), Some(3));
    }

    #[test]
    fn test_iteration_order_and_count() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut map = TestMap::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        for i in 0..100u64 {
            // Spread across slots; id mirrors hash for checking.
            map.insert_or_assign(&tx, key(i * 37, i as u32), i).unwrap();
        }
        let record = map.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let map = TestMap::load(&db, record).unwrap();
        let items: Vec<(TestKey, u64)> = map.iter(&db).collect::<Result<_>>().unwrap();
        assert_eq!(items.len(), 100);
        let mut ids: Vec<u32> = items.iter().map(|(k, _)| k.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..100).collect::<Vec<u32>>());

        // Two traversals agree.
        let again: Vec<u32> = map.iter(&db).map(|r| r.unwrap().0.id).collect();
        assert_eq!(again, items.iter().map(|(k, _)| k.id).collect::<Vec<u32>>());
    }

    #[test]
    fn test_load_rejects_bad_record() {
        let dir = TempDir::new().unwrap();
        let db = new_db(&dir);

        let bogus = Extent::new(Address::new(8), 15);
        assert!(matches!(
            TestMap::load(&db, bogus),
            Err(StoreError::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_empty_map_find_and_iter() {
        let dir = TempDir::new().unwrap();
        let db = new_db(&dir);
        let map = TestMap::empty();
        assert_eq!(map.find(&db, &key(1, 1)).unwrap(), None);
        assert_eq!(map.iter(&db).count(), 0);
        assert!(map.is_empty());
    }
}
