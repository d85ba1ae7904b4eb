//! Node pointer records.
//!
//! A node pointer is `routing key ++ child page id`, the child id stored
//! big endian in the trailing 8 bytes. The wire shape is fixed; what an
//! index may vary is how the routing key is derived from the child's
//! first record, which is the [`NodePointerCodec`] seam.

use crate::storage::PageId;
use byteorder::{BigEndian, ByteOrder};

/// How an index derives the routing key filed in a parent page.
pub trait NodePointerCodec: Send + Sync {
    /// Routing key for a child whose first user record is given.
    /// `child_level` is the child's own level.
    fn route_key(&self, first_record: &[u8], child_level: u32) -> Vec<u8>;
}

/// Byte-ordered keys: a child is filed under its first record's key.
#[derive(Debug, Default)]
pub struct OrderedKeyCodec;

impl NodePointerCodec for OrderedKeyCodec {
    fn route_key(&self, first_record: &[u8], child_level: u32) -> Vec<u8> {
        if child_level == 0 {
            first_record.to_vec()
        } else {
            // The child's record is itself a node pointer; drop its
            // child id trailer.
            first_record[..first_record.len() - 8].to_vec()
        }
    }
}

/// Build a node pointer record.
pub fn encode_node_pointer(route_key: &[u8], child: PageId) -> Vec<u8> {
    let mut rec = Vec::with_capacity(route_key.len() + 8);
    rec.extend_from_slice(route_key);
    let mut trailer = [0u8; 8];
    BigEndian::write_u64(&mut trailer, child.0);
    rec.extend_from_slice(&trailer);
    rec
}

/// Child page id carried by a node pointer record.
pub fn node_pointer_child(rec: &[u8]) -> PageId {
    PageId(BigEndian::read_u64(&rec[rec.len() - 8..]))
}

/// Rewrite the child id of a node pointer record in place.
pub fn repoint_node_pointer(rec: &mut [u8], child: PageId) {
    let len = rec.len();
    BigEndian::write_u64(&mut rec[len - 8..], child.0);
}

/// Hook notified when structural operations move or discard records, so
/// that per-record state held outside the tree (row locks, adaptive
/// caches) can follow the records to their new page.
pub trait RecordMoveObserver: Send + Sync {
    /// `count` records left `from` for `to`, keeping their order.
    fn records_moved(&self, _from: PageId, _to: PageId, _count: usize) {}

    /// The page was unlinked and returned to the allocator.
    fn page_discarded(&self, _page_id: PageId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pointer_roundtrip() {
        let rec = encode_node_pointer(b"key", PageId(42));
        assert_eq!(&rec[..3], b"key");
        assert_eq!(node_pointer_child(&rec), PageId(42));
    }

    #[test]
    fn test_repoint_keeps_key() {
        let mut rec = encode_node_pointer(b"key", PageId(42));
        repoint_node_pointer(&mut rec, PageId(7));
        assert_eq!(&rec[..3], b"key");
        assert_eq!(node_pointer_child(&rec), PageId(7));
    }

    #[test]
    fn test_route_key_strips_trailer_above_leaf() {
        let codec = OrderedKeyCodec;
        assert_eq!(codec.route_key(b"abc", 0), b"abc");

        let ptr = encode_node_pointer(b"abc", PageId(9));
        assert_eq!(codec.route_key(&ptr, 1), b"abc");
    }

    #[test]
    fn test_child_id_sorts_big_endian() {
        // The trailer must not disturb byte-wise key comparison of two
        // pointers with equal keys.
        let a = encode_node_pointer(b"k", PageId(1));
        let b = encode_node_pointer(b"k", PageId(256));
        assert!(a < b);
    }
}
