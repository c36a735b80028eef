//! Path-compressed trie from transaction hashes to transaction locators.

use crate::xdr::{Decoder, Encoder};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::io::{Read, Write};

/// Version tag written in front of every encoded trie.
pub const TRIE_INDEX_VERSION: u32 = 1;

/// Decoding refuses tries nested deeper than this.
const MAX_DEPTH: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct TrieNode {
    /// Bytes consumed along the edge from the parent, after the child key byte.
    prefix: Vec<u8>,
    value: Option<Vec<u8>>,
    children: BTreeMap<u8, TrieNode>,
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl TrieNode {
    fn leaf(prefix: &[u8], value: Vec<u8>) -> Self {
        Self {
            prefix: prefix.to_vec(),
            value: Some(value),
            children: BTreeMap::new(),
        }
    }

    fn is_blank(&self) -> bool {
        self.prefix.is_empty() && self.value.is_none() && self.children.is_empty()
    }

    /// Inserts `value` under `key`, where `key` still includes this node's prefix.
    fn upsert(&mut self, key: &[u8], value: Vec<u8>) -> Option<Vec<u8>> {
        let common = common_prefix_len(&self.prefix, key);

        if common < self.prefix.len() {
            // Split: this node keeps the shared prefix, its old content moves one level down.
            let rest = self.prefix.split_off(common);
            let moved = TrieNode {
                prefix: rest[1..].to_vec(),
                value: self.value.take(),
                children: std::mem::take(&mut self.children),
            };
            self.children.insert(rest[0], moved);

            match key[common..].split_first() {
                None => self.value = Some(value),
                Some((first, tail)) => {
                    self.children.insert(*first, TrieNode::leaf(tail, value));
                }
            }
            return None;
        }

        match key[common..].split_first() {
            None => self.value.replace(value),
            Some((first, tail)) => match self.children.entry(*first) {
                Entry::Vacant(entry) => {
                    entry.insert(TrieNode::leaf(tail, value));
                    None
                }
                Entry::Occupied(entry) => entry.into_mut().upsert(tail, value),
            },
        }
    }

    fn walk<F: FnMut(&[u8], &[u8])>(&self, key: &mut Vec<u8>, f: &mut F) {
        let len = key.len();
        key.extend_from_slice(&self.prefix);
        if let Some(value) = &self.value {
            f(key, value);
        }
        for (byte, child) in &self.children {
            key.push(*byte);
            child.walk(key, f);
            key.pop();
        }
        key.truncate(len);
    }

    fn encode(&self, encoder: &mut Encoder) {
        encoder.put_opaque(&self.prefix);
        encoder.put_opaque(self.value.as_deref().unwrap_or_default());
        encoder.put_u32(self.children.len() as u32);
        for (byte, child) in &self.children {
            encoder.put_fixed_opaque(&[*byte]);
            child.encode(encoder);
        }
    }

    fn decode(decoder: &mut Decoder<'_>, depth: usize) -> Result<Self> {
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep(MAX_DEPTH));
        }

        let prefix = decoder.get_opaque()?;
        let value = decoder.get_opaque()?;
        let count = decoder.get_u32()?;

        let mut children = BTreeMap::new();
        for _ in 0..count {
            let [byte] = decoder.get_fixed_opaque::<1>()?;
            children.insert(byte, TrieNode::decode(decoder, depth + 1)?);
        }

        Ok(Self {
            prefix,
            value: (!value.is_empty()).then_some(value),
            children,
        })
    }
}

/// A radix trie keyed by byte strings.
///
/// Empty values are indistinguishable from absent ones once encoded, so callers
/// should only store non-empty values.
#[derive(Default)]
pub struct TrieIndex {
    root: RwLock<Option<TrieNode>>,
}

impl TrieIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the value stored under `key`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty.
    pub fn upsert(&self, key: &[u8], value: Vec<u8>) -> Option<Vec<u8>> {
        assert!(!key.is_empty(), "trie keys must not be empty");

        let mut root = self.root.write();
        match root.as_mut() {
            Some(node) => node.upsert(key, value),
            None => {
                *root = Some(TrieNode::leaf(key, value));
                None
            }
        }
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let root = self.root.read();
        let mut node = root.as_ref()?;
        let mut key = key;

        loop {
            key = key.strip_prefix(node.prefix.as_slice())?;
            match key.split_first() {
                None => return node.value.clone(),
                Some((first, tail)) => {
                    node = node.children.get(first)?;
                    key = tail;
                }
            }
        }
    }

    /// Visits every key/value pair in ascending key order under the read lock.
    pub fn iterate<F: FnMut(&[u8], &[u8])>(&self, mut f: F) {
        if let Some(root) = self.root.read().as_ref() {
            root.walk(&mut Vec::new(), &mut f);
        }
    }

    /// Collects every key/value pair in ascending key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut entries = Vec::new();
        self.iterate(|key, value| entries.push((key.to_vec(), value.to_vec())));
        entries
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        let mut len = 0;
        self.iterate(|_, _| len += 1);
        len
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().is_none()
    }

    /// Upserts every entry of `other` into this trie, in ascending key order.
    ///
    /// On duplicate keys the value from `other` wins.
    pub fn merge(&self, other: &TrieIndex) {
        if std::ptr::eq(self, other) {
            return;
        }

        for (key, value) in other.entries() {
            self.upsert(&key, value);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.put_u32(TRIE_INDEX_VERSION);
        match self.root.read().as_ref() {
            Some(root) => root.encode(&mut encoder),
            None => TrieNode::default().encode(&mut encoder),
        }
        encoder.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);

        let version = decoder.get_u32()?;
        if version != TRIE_INDEX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let root = TrieNode::decode(&mut decoder, 0)?;
        decoder.finish()?;

        Ok(Self {
            root: RwLock::new(Some(root).filter(|root| !root.is_blank())),
        })
    }

    /// Encodes the trie into `writer`, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<u64> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Decodes a trie from the whole of `reader`, returning it with the number of bytes read.
    pub fn read_from<R: Read>(mut reader: R) -> Result<(Self, u64)> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let trie = Self::from_bytes(&bytes)?;
        Ok((trie, bytes.len() as u64))
    }
}

impl Clone for TrieIndex {
    fn clone(&self) -> Self {
        Self {
            root: RwLock::new(self.root.read().clone()),
        }
    }
}

impl PartialEq for TrieIndex {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || *self.root.read() == *other.root.read()
    }
}

impl Eq for TrieIndex {}

impl fmt::Debug for TrieIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieIndex").field("keys", &self.len()).finish()
    }
}
