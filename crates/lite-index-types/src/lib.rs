//! In-memory index structures for the horizon-lite index engine.
//!
//! This crate provides the two compressed structures the index engine persists:
//! - [`BitmapIndex`]: a growable bitmap over checkpoint numbers, one per account
//!   and category.
//! - [`TrieIndex`]: a path-compressed trie mapping transaction hashes to their
//!   locators.
//!
//! Both carry an instance-level reader/writer lock, so a shared handle can be
//! mutated from several workers at once.

mod bitmap;
mod error;
mod trie;
mod xdr;

pub use bitmap::BitmapIndex;
pub use error::Error;
pub use trie::{TrieIndex, TRIE_INDEX_VERSION};

use std::collections::HashMap;
use std::sync::Arc;

/// Result type for index encoding and decoding.
pub type Result<T> = std::result::Result<T, Error>;

/// Bitmap indices of a single account, keyed by category name
/// (e.g. `all/all`, `successful/payments`).
pub type NamedIndices = HashMap<String, Arc<BitmapIndex>>;
