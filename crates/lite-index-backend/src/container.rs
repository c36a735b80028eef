//! Multi-member gzip container holding a set of named bitmap indices.
//!
//! Each index is written as its own gzip member whose header `FNAME` field
//! carries the index name. Members are written in ascending name order and can
//! be appended without touching earlier ones.

use crate::{Error, Result};
use flate2::Compression;
use flate2::GzBuilder;
use flate2::bufread::GzDecoder;
use lite_index_types::{BitmapIndex, NamedIndices};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Arc;

/// Writes every index of `indexes` as a named gzip member, returning the writer.
pub fn write_named_indices<W: Write>(indexes: &NamedIndices, mut writer: W) -> Result<W> {
    let mut names = indexes.keys().collect::<Vec<_>>();
    names.sort();

    for name in names {
        let mut encoder = GzBuilder::new()
            .filename(name.as_str())
            .write(writer, Compression::default());
        encoder.write_all(&indexes[name].to_bytes())?;
        writer = encoder.finish()?;
    }

    Ok(writer)
}

/// Encodes `indexes` into an in-memory container.
pub fn encode_named_indices(indexes: &NamedIndices) -> Result<Vec<u8>> {
    write_named_indices(indexes, Vec::new())
}

/// Reads members until end of stream, rebuilding the name to index mapping.
pub fn read_named_indices<R: Read>(reader: R) -> Result<NamedIndices> {
    let mut reader = BufReader::new(reader);
    let mut indexes = NamedIndices::new();

    while !reader.fill_buf()?.is_empty() {
        let mut decoder = GzDecoder::new(reader);
        let mut bytes = Vec::new();
        decoder.read_to_end(&mut bytes)?;

        let name = decoder
            .header()
            .and_then(|header| header.filename())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .ok_or(Error::NotFound)?;

        indexes.insert(name, Arc::new(BitmapIndex::from_bytes(&bytes)?));
        reader = decoder.into_inner();
    }

    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_of(positions: &[u32]) -> Arc<BitmapIndex> {
        let index = BitmapIndex::new();
        for position in positions {
            index.set_active(*position).unwrap();
        }
        Arc::new(index)
    }

    #[test]
    fn test_single_member_round_trip() {
        let indexes = NamedIndices::from([("A".to_string(), bitmap_of(&[1, 5, 130]))]);

        let bytes = encode_named_indices(&indexes).unwrap();
        let decoded = read_named_indices(bytes.as_slice()).unwrap();

        assert_eq!(decoded, indexes);
    }

    #[test]
    fn test_members_can_be_appended() {
        let first = NamedIndices::from([
            ("all/all".to_string(), bitmap_of(&[2, 3])),
            ("all/payments".to_string(), bitmap_of(&[3])),
        ]);
        let second = NamedIndices::from([("successful/all".to_string(), bitmap_of(&[9]))]);

        let bytes = encode_named_indices(&first).unwrap();
        let bytes = write_named_indices(&second, bytes).unwrap();

        let decoded = read_named_indices(bytes.as_slice()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded["all/all"], first["all/all"]);
        assert_eq!(decoded["all/payments"], first["all/payments"]);
        assert_eq!(decoded["successful/all"], second["successful/all"]);
    }

    #[test]
    fn test_empty_container() {
        let bytes = encode_named_indices(&NamedIndices::new()).unwrap();
        assert!(bytes.is_empty());
        assert!(read_named_indices(bytes.as_slice()).unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_container_is_an_error() {
        let indexes = NamedIndices::from([("A".to_string(), bitmap_of(&[1]))]);
        let mut bytes = encode_named_indices(&indexes).unwrap();
        bytes.truncate(bytes.len() - 4);

        assert!(read_named_indices(bytes.as_slice()).is_err());
        assert!(read_named_indices(&b"not gzip"[..]).is_err());
    }
}
