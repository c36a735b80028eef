//! Compressed bitmap over checkpoint numbers.
//!
//! The bitmap only stores the bytes between the first and last active positions.
//! Positions are 1-based: within a byte the most significant bit is the lowest
//! position, so position 1 is `0b1000_0000` of the byte anchored at 1 and
//! position 8 is `0b0000_0001`. On-disk indices depend on this layout.

use crate::xdr::{Decoder, Encoder};
use crate::{Error, Result};
use parking_lot::RwLock;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Bitmap {
    bitmap: Vec<u8>,
    // 0 iff the bitmap is empty.
    first_bit: u32,
    last_bit: u32,
}

/// Returns the mask of `index` within its byte.
fn bit_mask(index: u32) -> u8 {
    if index % 8 == 0 {
        1
    } else {
        1u8 << (8 - index % 8)
    }
}

/// Number of bytes between the bytes holding positions `i` and `j`, `i <= j`.
///
/// Byte ranges may end one past `u32::MAX`, so positions are widened first.
fn distance(i: u64, j: u64) -> usize {
    ((j - 1) / 8 - (i - 1) / 8) as usize
}

/// Returns the shift (0 = most significant bit) of the first set bit at or after `after`.
fn max_bit_after(b: u8, after: u32) -> Option<u32> {
    if b == 0 {
        return None;
    }
    (after..8).find(|shift| (0b1000_0000u8 >> shift) & b != 0)
}

/// Returns the shift of the last set bit of `b`.
fn last_bit_shift(b: u8) -> Option<u32> {
    (0..8u32).rev().find(|shift| (0b1000_0000u8 >> shift) & b != 0)
}

impl Bitmap {
    /// First position the bitmap can represent, e.g. 9 when only 12 is set.
    fn range_first_bit(&self) -> u32 {
        (self.first_bit - 1) / 8 * 8 + 1
    }

    /// Last position the bitmap can represent, e.g. 16 when only 12 is set.
    ///
    /// One past `u32::MAX` once the byte holding `u32::MAX` is in range.
    fn range_last_bit(&self) -> u64 {
        u64::from(self.range_first_bit()) + self.bitmap.len() as u64 * 8 - 1
    }

    /// Position of the bit at `shift` within byte `loc`.
    fn position(&self, loc: usize, shift: u32) -> Option<u32> {
        let position = u64::from(self.range_first_bit()) + loc as u64 * 8 + u64::from(shift);
        u32::try_from(position).ok()
    }

    /// Checks that a decoded record is one `set_active` could have produced.
    fn validate(&self) -> Result<()> {
        if self.first_bit == 0 {
            if self.last_bit != 0 || !self.bitmap.is_empty() {
                return Err(Error::InvalidBitmap("empty bitmap with bounds or bytes"));
            }
            return Ok(());
        }

        if self.first_bit > self.last_bit {
            return Err(Error::InvalidBitmap("first bit after last bit"));
        }

        let expected_len = distance(self.first_bit.into(), self.last_bit.into()) + 1;
        if self.bitmap.len() != expected_len {
            return Err(Error::InvalidBitmap("length does not match bit range"));
        }

        let first = max_bit_after(self.bitmap[0], 0).and_then(|shift| self.position(0, shift));
        if first != Some(self.first_bit) {
            return Err(Error::InvalidBitmap("first bit is not the lowest set bit"));
        }

        let l = self.bitmap.len() - 1;
        let last = last_bit_shift(self.bitmap[l]).and_then(|shift| self.position(l, shift));
        if last != Some(self.last_bit) {
            return Err(Error::InvalidBitmap("last bit is not the highest set bit"));
        }

        Ok(())
    }

    fn set_active(&mut self, index: u32) -> Result<()> {
        if index == 0 {
            return Err(Error::ZeroPosition);
        }

        if self.first_bit == 0 {
            self.first_bit = index;
            self.last_bit = index;
            self.bitmap = vec![bit_mask(index)];
            return Ok(());
        }

        let range_first = self.range_first_bit();
        let range_last = self.range_last_bit();

        if index >= range_first && u64::from(index) <= range_last {
            let loc = ((index - range_first) / 8) as usize;
            self.bitmap[loc] |= bit_mask(index);
            self.first_bit = self.first_bit.min(index);
            self.last_bit = self.last_bit.max(index);
        } else if index < range_first {
            let mut bitmap = vec![0u8; distance(index.into(), range_first.into())];
            bitmap.extend_from_slice(&self.bitmap);
            bitmap[0] |= bit_mask(index);
            self.bitmap = bitmap;
            self.first_bit = index;
        } else {
            let grow = distance(range_last, index.into());
            self.bitmap.resize(self.bitmap.len() + grow, 0);
            let loc = ((index - range_first) / 8) as usize;
            self.bitmap[loc] |= bit_mask(index);
            self.last_bit = index;
        }

        Ok(())
    }

    fn set_inactive(&mut self, index: u32) {
        if self.first_bit == 0
            || index < self.range_first_bit()
            || u64::from(index) > self.range_last_bit()
        {
            return;
        }

        let loc = ((index - self.range_first_bit()) / 8) as usize;
        self.bitmap[loc] &= !bit_mask(index);

        if loc == 0 && self.first_bit == index {
            match self.next_active_bit(index) {
                None => *self = Self::default(),
                Some(next) => {
                    // Drop the bytes emptied in front of the new first bit.
                    self.bitmap.drain(..distance(self.first_bit.into(), next.into()));
                    self.first_bit = next;
                }
            }
        } else if loc == self.bitmap.len() - 1 {
            let trimmed = self.bitmap[loc] == 0;
            if trimmed {
                while self.bitmap.last() == Some(&0) {
                    self.bitmap.pop();
                }
            }

            if trimmed || self.last_bit == index {
                let l = self.bitmap.len() - 1;
                // The first bit is still set, so the last byte is non-zero.
                let last = last_bit_shift(self.bitmap[l]).and_then(|shift| self.position(l, shift));
                if let Some(last) = last {
                    self.last_bit = last;
                }
            }
        }
    }

    fn is_active(&self, index: u32) -> bool {
        if self.first_bit == 0 || index < self.first_bit || index > self.last_bit {
            return false;
        }
        let loc = ((index - self.range_first_bit()) / 8) as usize;
        self.bitmap[loc] & bit_mask(index) != 0
    }

    fn next_active_bit(&self, position: u32) -> Option<u32> {
        if self.first_bit == 0 || position > self.last_bit {
            return None;
        }

        let position = position.max(self.first_bit);
        let loc = ((position - self.range_first_bit()) / 8) as usize;

        if let Some(shift) = max_bit_after(self.bitmap[loc], (position - 1) % 8) {
            return self.position(loc, shift);
        }

        (loc + 1..self.bitmap.len()).find_map(|loc| {
            max_bit_after(self.bitmap[loc], 0).and_then(|shift| self.position(loc, shift))
        })
    }

    fn active_bits(&self) -> Vec<u32> {
        let mut bits = Vec::new();
        let mut next = self.next_active_bit(0);
        while let Some(bit) = next {
            bits.push(bit);
            next = bit
                .checked_add(1)
                .and_then(|position| self.next_active_bit(position));
        }
        bits
    }
}

/// A sparse, growable bitmap of active checkpoints.
///
/// Every operation takes the instance lock: mutations exclusively, queries shared.
#[derive(Default)]
pub struct BitmapIndex {
    inner: RwLock<Bitmap>,
}

impl BitmapIndex {
    /// Creates an empty bitmap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes a bitmap from its XDR wire form.
    ///
    /// Records whose bounds disagree with their bytes fail with
    /// [`Error::InvalidBitmap`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        let first_bit = decoder.get_u32()?;
        let last_bit = decoder.get_u32()?;
        let bitmap = decoder.get_opaque()?;
        decoder.finish()?;

        let bitmap = Bitmap {
            bitmap,
            first_bit,
            last_bit,
        };
        bitmap.validate()?;

        Ok(Self {
            inner: RwLock::new(bitmap),
        })
    }

    /// Encodes this bitmap as `firstBit: u32, lastBit: u32, bitmap: opaque<>`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.inner.read();
        let mut encoder = Encoder::new();
        encoder.put_u32(inner.first_bit);
        encoder.put_u32(inner.last_bit);
        encoder.put_opaque(&inner.bitmap);
        encoder.into_bytes()
    }

    /// Number of bytes backing the bitmap.
    pub fn size(&self) -> usize {
        self.inner.read().bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().first_bit == 0
    }

    /// First active position, 0 if empty.
    pub fn first_bit(&self) -> u32 {
        self.inner.read().first_bit
    }

    /// Last active position, 0 if empty.
    pub fn last_bit(&self) -> u32 {
        self.inner.read().last_bit
    }

    /// Marks `index` as active, growing the bitmap in either direction as needed.
    pub fn set_active(&self, index: u32) -> Result<()> {
        self.inner.write().set_active(index)
    }

    /// Clears `index`, trimming bytes that become empty at either end.
    pub fn set_inactive(&self, index: u32) {
        self.inner.write().set_inactive(index)
    }

    pub fn is_active(&self, index: u32) -> bool {
        self.inner.read().is_active(index)
    }

    /// Returns the smallest active position `>= position`, or `None` once past the end.
    pub fn next_active_bit(&self, position: u32) -> Option<u32> {
        self.inner.read().next_active_bit(position)
    }

    /// All active positions in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + use<> {
        self.inner.read().active_bits().into_iter()
    }

    /// Unions `other` into this bitmap.
    pub fn merge(&self, other: &BitmapIndex) -> Result<()> {
        if std::ptr::eq(self, other) {
            return Ok(());
        }

        // Snapshot first so the two instance locks are never held together.
        let bits = other.inner.read().active_bits();

        let mut inner = self.inner.write();
        for bit in bits {
            inner.set_active(bit)?;
        }
        Ok(())
    }

    /// Renders both bitmaps byte-by-byte as two binary columns.
    pub fn debug_compare(&self, other: &BitmapIndex) -> String {
        let a = self.inner.read().bitmap.clone();
        let b = other.inner.read().bitmap.clone();

        (0..a.len().max(b.len()))
            .map(|n| {
                let left = a
                    .get(n)
                    .map(|byte| format!("{byte:08b}"))
                    .unwrap_or_else(|| " ".repeat(8));
                let right = b.get(n).map(|byte| format!("{byte:08b}")).unwrap_or_default();
                format!("{left} | {right}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Clone for BitmapIndex {
    fn clone(&self) -> Self {
        Self {
            inner: RwLock::new(self.inner.read().clone()),
        }
    }
}

impl PartialEq for BitmapIndex {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other) || *self.inner.read() == *other.inner.read()
    }
}

impl Eq for BitmapIndex {}

impl fmt::Debug for BitmapIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("BitmapIndex")
            .field("first_bit", &inner.first_bit)
            .field("last_bit", &inner.last_bit)
            .field("bytes", &inner.bitmap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn bitmap_of(positions: &[u32]) -> BitmapIndex {
        let index = BitmapIndex::new();
        for position in positions {
            index.set_active(*position).unwrap();
        }
        index
    }

    fn raw(index: &BitmapIndex) -> Vec<u8> {
        index.inner.read().bitmap.clone()
    }

    #[test]
    fn test_new_from_bytes() {
        for i in 1..200u32 {
            let index = bitmap_of(&[i]);
            let decoded = BitmapIndex::from_bytes(&index.to_bytes()).unwrap();
            assert_eq!(*index.inner.read(), *decoded.inner.read(), "position {i}");
        }

        let index = bitmap_of(&(1..200).step_by(3).collect::<Vec<_>>());
        let decoded = BitmapIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(index, decoded);
    }

    fn encode_raw(first_bit: u32, last_bit: u32, bitmap: &[u8]) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.put_u32(first_bit);
        encoder.put_u32(last_bit);
        encoder.put_opaque(bitmap);
        encoder.into_bytes()
    }

    #[test]
    fn test_inconsistent_records_are_rejected() {
        let cases: &[(u32, u32, &[u8])] = &[
            // Bounds reach past the single stored byte.
            (5, 100, &[0b0000_1000]),
            // Empty marker with leftover bounds or bytes.
            (0, 4, &[]),
            (0, 0, &[0b1000_0000]),
            (3, 0, &[0b0010_0000]),
            // First bit after last bit.
            (10, 2, &[0b0100_0000, 0b0100_0000]),
            // Extra trailing byte.
            (1, 1, &[0b1000_0000, 0]),
            // Bounds name bits that are not set.
            (3, 3, &[0b1000_0000]),
            (1, 10, &[0b1000_0000, 0b0010_0000]),
            (2, 8, &[0b1100_0001]),
        ];

        for (first_bit, last_bit, bitmap) in cases {
            let bytes = encode_raw(*first_bit, *last_bit, bitmap);
            assert!(
                matches!(BitmapIndex::from_bytes(&bytes), Err(Error::InvalidBitmap(_))),
                "first {first_bit} last {last_bit} bitmap {bitmap:?}"
            );
        }

        let empty = BitmapIndex::from_bytes(&encode_raw(0, 0, &[])).unwrap();
        assert!(empty.is_empty());

        let valid = raw(&bitmap_of(&[5, 50, 100]));
        let decoded = BitmapIndex::from_bytes(&encode_raw(5, 100, &valid)).unwrap();
        assert_eq!(decoded.next_active_bit(6), Some(50));
    }

    #[test]
    fn test_top_of_range() {
        let top = u32::MAX;

        let index = bitmap_of(&[top]);
        index.set_active(top - 3).unwrap();
        assert_eq!(raw(&index), vec![0b0001_0010]);
        assert_eq!((index.first_bit(), index.last_bit()), (top - 3, top));

        // Grow left from the byte holding the last representable position.
        index.set_active(top - 100).unwrap();
        assert_eq!((index.first_bit(), index.last_bit()), (top - 100, top));
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![top - 100, top - 3, top]);
        assert!(index.is_active(top));
        assert!(!index.is_active(top - 1));

        assert_eq!(index.next_active_bit(top - 99), Some(top - 3));
        assert_eq!(index.next_active_bit(top - 2), Some(top));
        assert_eq!(index.next_active_bit(top), Some(top));

        // Grow right into the top byte.
        let index = bitmap_of(&[top - 100]);
        index.set_active(top).unwrap();
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![top - 100, top]);

        let decoded = BitmapIndex::from_bytes(&index.to_bytes()).unwrap();
        assert_eq!(decoded, index);

        index.set_inactive(top);
        assert_eq!((index.first_bit(), index.last_bit()), (top - 100, top - 100));
        assert_eq!(index.size(), 1);

        let merged = bitmap_of(&[top - 7, top]);
        merged.merge(&bitmap_of(&[top - 8])).unwrap();
        assert_eq!(merged.iter().collect::<Vec<_>>(), vec![top - 8, top - 7, top]);
        assert_eq!(merged.next_active_bit(top - 6), Some(top));
    }

    #[test]
    fn test_concurrent_set_active() {
        let index = Arc::new(BitmapIndex::new());

        std::thread::scope(|scope| {
            for thread in 0..8u32 {
                let index = index.clone();
                scope.spawn(move || {
                    for n in 0..250u32 {
                        index.set_active(1 + thread + n * 8 * 3).unwrap();
                    }
                });
            }
        });

        let expected = (0..8u32)
            .flat_map(|thread| (0..250u32).map(move |n| 1 + thread + n * 8 * 3))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();
        assert_eq!(index.iter().collect::<Vec<_>>(), expected);
        assert_eq!(index.first_bit(), 1);
        assert_eq!(index.last_bit(), 8 + 249 * 24);
    }

    #[test]
    fn test_wire_layout() {
        let index = bitmap_of(&[10, 1]);
        assert_eq!(
            index.to_bytes(),
            vec![
                0, 0, 0, 1, // first bit
                0, 0, 0, 10, // last bit
                0, 0, 0, 2, // bitmap length
                0b1000_0000, 0b0100_0000, 0, 0,
            ]
        );
    }

    #[test]
    fn test_set_active_initializes_single_byte() {
        for checkpoint in 1..=16u32 {
            let index = bitmap_of(&[checkpoint]);
            let range_first = if checkpoint <= 8 { 1 } else { 9 };
            let shift = (checkpoint - 1) % 8;

            assert_eq!(raw(&index), vec![0b1000_0000u8 >> shift]);
            assert_eq!(index.inner.read().range_first_bit(), range_first);
            assert_eq!(index.first_bit(), checkpoint);
            assert_eq!(index.last_bit(), checkpoint);
        }
    }

    #[test]
    fn test_set_active() {
        // Update current bitmap right
        let index = bitmap_of(&[1]);
        index.set_active(8).unwrap();
        assert_eq!(raw(&index), vec![0b1000_0001]);
        assert_eq!((index.first_bit(), index.last_bit()), (1, 8));

        // Update current bitmap left
        let index = bitmap_of(&[8, 1]);
        assert_eq!(raw(&index), vec![0b1000_0001]);
        assert_eq!((index.first_bit(), index.last_bit()), (1, 8));

        let index = bitmap_of(&[10, 9, 16]);
        assert_eq!(raw(&index), vec![0b1100_0001]);
        assert_eq!((index.first_bit(), index.last_bit()), (9, 16));

        // Expand bitmap to the left
        let index = bitmap_of(&[10, 1]);
        assert_eq!(raw(&index), vec![0b1000_0000, 0b0100_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (1, 10));

        let index = bitmap_of(&[17, 2]);
        assert_eq!(raw(&index), vec![0b0100_0000, 0b0000_0000, 0b1000_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (2, 17));

        // Expand bitmap to the right
        let index = bitmap_of(&[1, 10]);
        assert_eq!(raw(&index), vec![0b1000_0000, 0b0100_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (1, 10));

        let index = bitmap_of(&[2, 17]);
        assert_eq!(raw(&index), vec![0b0100_0000, 0b0000_0000, 0b1000_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (2, 17));

        let index = bitmap_of(&[17, 26]);
        assert_eq!(raw(&index), vec![0b1000_0000, 0b0100_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (17, 26));
    }

    #[test]
    fn test_zero_position_is_rejected() {
        let index = BitmapIndex::new();
        assert!(matches!(index.set_active(0), Err(Error::ZeroPosition)));
        assert!(index.is_empty());
    }

    #[test]
    fn test_set_inactive() {
        let index = bitmap_of(&[17, 17 + 9, 17 + 9 + 10]);
        assert_eq!(raw(&index), vec![0b1000_0000, 0b0100_0000, 0b0001_0000]);

        // Disabling the first bit trims the first byte.
        index.set_inactive(17);
        assert!(!index.is_active(17));
        assert_eq!(raw(&index), vec![0b0100_0000, 0b0001_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (17 + 9, 17 + 9 + 10));

        // Disabling the last bit trims the last byte.
        index.set_inactive(17 + 9 + 10);
        assert_eq!(raw(&index), vec![0b0100_0000]);
        assert_eq!((index.first_bit(), index.last_bit()), (26, 26));

        // Disabling the only bit empties the bitmap.
        index.set_inactive(26);
        assert!(index.is_empty());
        assert_eq!(index.size(), 0);
        assert_eq!(index.next_active_bit(0), None);

        // Empty bytes in the middle get compressed away on shrink.
        let index = bitmap_of(&[1, 5, 40]);
        index.set_inactive(40);
        assert_eq!(raw(&index), vec![0b1000_1000]);
        assert_eq!(index.last_bit(), 5);

        index.set_inactive(1);
        assert_eq!((index.first_bit(), index.last_bit()), (5, 5));

        // Clearing the last bit inside the last byte walks back to the previous one.
        let index = bitmap_of(&[9, 11, 14]);
        index.set_inactive(14);
        assert_eq!(raw(&index), vec![0b1010_0000]);
        assert_eq!(index.last_bit(), 11);

        // Out of range is a no-op.
        index.set_inactive(100);
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![9, 11]);
    }

    #[test]
    fn test_next_active_bit() {
        let index = bitmap_of(&[2, 8, 9, 30]);

        assert_eq!(index.next_active_bit(0), Some(2));
        assert_eq!(index.next_active_bit(2), Some(2));
        assert_eq!(index.next_active_bit(3), Some(8));
        assert_eq!(index.next_active_bit(8), Some(8));
        assert_eq!(index.next_active_bit(9), Some(9));
        assert_eq!(index.next_active_bit(10), Some(30));
        assert_eq!(index.next_active_bit(30), Some(30));
        assert_eq!(index.next_active_bit(31), None);

        assert_eq!(BitmapIndex::new().next_active_bit(1), None);
    }

    #[test]
    fn test_iteration_reproduces_sorted_positions() {
        for _ in 0..100 {
            let mut positions = (0..fastrand::usize(1..64))
                .map(|_| fastrand::u32(1..2000))
                .collect::<Vec<_>>();
            let index = bitmap_of(&positions);

            positions.sort_unstable();
            positions.dedup();

            assert_eq!(index.iter().collect::<Vec<_>>(), positions);
            assert_eq!(index.first_bit(), positions[0]);
            assert_eq!(index.last_bit(), *positions.last().unwrap());
            for position in &positions {
                assert!(index.is_active(*position));
            }
        }
    }

    #[test]
    fn test_merge() {
        let a = bitmap_of(&[1, 7, 64]);
        let b = bitmap_of(&[3, 9, 200]);

        let ab = a.clone();
        ab.merge(&b).unwrap();
        let ba = b.clone();
        ba.merge(&a).unwrap();

        assert_eq!(ab.iter().collect::<Vec<_>>(), vec![1, 3, 7, 9, 64, 200]);
        assert_eq!(ab, ba);

        // Merging with itself, or with an equal copy, changes nothing.
        let before = ab.clone();
        ab.merge(&ab).unwrap();
        ab.merge(&before).unwrap();
        assert_eq!(ab, before);

        // Merging into an empty bitmap copies the other one.
        let empty = BitmapIndex::new();
        empty.merge(&a).unwrap();
        assert_eq!(empty, a);
    }

    #[test]
    fn test_debug_compare() {
        let a = bitmap_of(&[1, 10]);
        let b = bitmap_of(&[2]);
        assert_eq!(
            a.debug_compare(&b),
            "10000000 | 01000000\n01000000 | "
        );
        assert_eq!(b.debug_compare(&a), "01000000 | 10000000\n         | 01000000");
    }
}
