use std::io::Read;

use crate::{
    error::{DbError, DbResult},
    io::{ByteWriter, Decodeable, Encodeable},
    storage::page::PAGE_SIZE,
    types::{PageNum, NIL_PAGE_NUM},
};

/// Maximum child count of an inner node holding K-byte keys and
/// V-byte values; even by construction. A node splits when its key
/// count reaches the order.
pub fn order_of(key_size: u16, value_size: u16) -> usize {
    2 * ((PAGE_SIZE - 1024) / (key_size as usize + value_size as usize) / 2)
}

/// Pad a page number into a V-byte value slot. Inner nodes store
/// child pointers this way, which is why V >= 4 always holds.
pub fn page_num_to_value(page_num: PageNum, value_size: u16) -> Vec<u8> {
    let mut value = vec![0u8; value_size as usize];
    value[..4].copy_from_slice(&page_num.to_be_bytes());
    value
}

pub fn value_to_page_num(value: &[u8]) -> PageNum {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&value[..4]);
    PageNum::from_be_bytes(bytes)
}

/// The payload of a B+Tree page: an ordered run of fixed-width keys
/// and their values. Leaf values are payload bytes; inner values are
/// child page numbers, one more of them than there are keys.
pub struct BTreeNode {
    pub parent: PageNum,
    pub prev_leaf: PageNum,
    pub next_leaf: PageNum,
    pub is_leaf: bool,
    key_size: u16,
    value_size: u16,
    keys: Vec<Vec<u8>>,
    values: Vec<Vec<u8>>,
}

impl BTreeNode {
    pub fn new_leaf(key_size: u16, value_size: u16) -> Self {
        Self {
            parent: NIL_PAGE_NUM,
            prev_leaf: NIL_PAGE_NUM,
            next_leaf: NIL_PAGE_NUM,
            is_leaf: true,
            key_size,
            value_size,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    /// A fresh inner node starts with a single child and no keys;
    /// only root promotion creates these.
    pub fn new_inner(key_size: u16, value_size: u16, first_child: PageNum) -> Self {
        Self {
            parent: NIL_PAGE_NUM,
            prev_leaf: NIL_PAGE_NUM,
            next_leaf: NIL_PAGE_NUM,
            is_leaf: false,
            key_size,
            value_size,
            keys: Vec::new(),
            values: vec![page_num_to_value(first_child, value_size)],
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn key_size(&self) -> u16 {
        self.key_size
    }

    pub fn value_size(&self) -> u16 {
        self.value_size
    }

    pub fn order(&self) -> usize {
        order_of(self.key_size, self.value_size)
    }

    pub fn key_at(&self, slot: usize) -> &[u8] {
        &self.keys[slot]
    }

    pub fn value_at(&self, slot: usize) -> &[u8] {
        &self.values[slot]
    }

    pub fn first_key(&self) -> &[u8] {
        &self.keys[0]
    }

    pub fn child_at(&self, index: usize) -> PageNum {
        value_to_page_num(&self.values[index])
    }

    pub fn children(&self) -> Vec<PageNum> {
        debug_assert!(!self.is_leaf);
        self.values.iter().map(|v| value_to_page_num(v)).collect()
    }

    /// First slot whose key is >= the probe. With duplicates allowed
    /// this is where both lookups and inserts land, keeping a new row
    /// ordered before any existing equal key.
    pub fn lower_bound(&self, key: &[u8]) -> usize {
        let mut lo = 0;
        let mut hi = self.keys.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.keys[mid].as_slice() < key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Which child a descent for `key` follows. Separators equal to
    /// the probe send the descent left, toward the leaf where the
    /// global lower bound sits.
    pub fn child_index(&self, key: &[u8]) -> usize {
        debug_assert!(!self.is_leaf);
        self.lower_bound(key)
    }

    /// Insert a key with its value and return the slot it landed in.
    /// For leaves the value sits at the key's slot; for inner nodes
    /// the value is the child right of the key.
    pub fn insert_entry(&mut self, key: &[u8], value: &[u8]) -> usize {
        let slot = self.lower_bound(key);
        self.keys.insert(slot, key.to_vec());
        if self.is_leaf {
            self.values.insert(slot, value.to_vec());
        } else {
            self.values.insert(slot + 1, value.to_vec());
        }
        slot
    }

    /// A node may momentarily hold `order` keys; it then has to split.
    pub fn is_overflow(&self) -> bool {
        self.len() > self.order() - 1
    }

    /// Move the upper half out into a fresh sibling leaf. The caller
    /// patches page links and parents.
    pub fn split_leaf(&mut self) -> BTreeNode {
        debug_assert!(self.is_leaf);
        let mid = self.order() / 2;
        let mut sibling = BTreeNode::new_leaf(self.key_size, self.value_size);
        sibling.keys = self.keys.split_off(mid);
        sibling.values = self.values.split_off(mid);
        sibling.parent = self.parent;
        sibling
    }

    /// Split an inner node: the middle key is promoted, not copied.
    /// Afterwards this node keeps order/2 - 1 keys and the sibling
    /// carries order - order/2.
    pub fn split_inner(&mut self) -> (Vec<u8>, BTreeNode) {
        debug_assert!(!self.is_leaf);
        let mid = self.order() / 2;

        // keys split one slot left of the children: the key at
        // mid - 1 leaves with the sibling run and is then promoted,
        // which leaves order/2 - 1 keys (and order/2 children) here
        let mut sibling = BTreeNode {
            parent: self.parent,
            prev_leaf: NIL_PAGE_NUM,
            next_leaf: NIL_PAGE_NUM,
            is_leaf: false,
            key_size: self.key_size,
            value_size: self.value_size,
            keys: self.keys.split_off(mid - 1),
            values: self.values.split_off(mid),
        };
        let promoted = sibling.keys.remove(0);
        (promoted, sibling)
    }
}

/// # Format
///
/// - 1 byte: leaf flag
/// - 4 bytes each: parent, prev leaf, next leaf
/// - 2 bytes each: key width, value width, entry count
/// - keys, then values (count + 1 values for inner nodes)
impl Encodeable for BTreeNode {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.is_leaf);
        writer.write(&self.parent);
        writer.write(&self.prev_leaf);
        writer.write(&self.next_leaf);
        writer.write(&self.key_size);
        writer.write(&self.value_size);
        writer.write(&(self.keys.len() as u16));
        for key in &self.keys {
            writer.write_raw(key);
        }
        for value in &self.values {
            writer.write_raw(value);
        }
        writer.to_bytes()
    }
}

impl Decodeable for BTreeNode {
    fn decode_from<R: Read>(reader: &mut R) -> DbResult<Self> {
        let is_leaf = bool::decode_from(reader)?;
        let parent = u32::decode_from(reader)?;
        let prev_leaf = u32::decode_from(reader)?;
        let next_leaf = u32::decode_from(reader)?;
        let key_size = u16::decode_from(reader)?;
        let value_size = u16::decode_from(reader)?;
        let len = u16::decode_from(reader)? as usize;
        if key_size == 0 || value_size < 4 {
            return Err(DbError::corrupt("invalid b+tree node widths"));
        }

        let mut keys = Vec::with_capacity(len);
        for _ in 0..len {
            keys.push(crate::io::read_exact(reader, key_size as usize)?);
        }
        let value_count = if is_leaf { len } else { len + 1 };
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            values.push(crate::io::read_exact(reader, value_size as usize)?);
        }

        Ok(Self {
            parent,
            prev_leaf,
            next_leaf,
            is_leaf,
            key_size,
            value_size,
            keys,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    // key + value widths picked so the order formula yields 4, which
    // keeps split scenarios small: 2 * ((8192 - 1024) / 1792 / 2) = 4
    const K: u16 = 896;
    const V: u16 = 896;

    fn key(byte: u8) -> Vec<u8> {
        vec![byte; K as usize]
    }

    fn val(byte: u8) -> Vec<u8> {
        vec![byte; V as usize]
    }

    #[test]
    fn test_order_formula() {
        assert_eq!(order_of(K, V), 4);
        assert_eq!(order_of(8, 4), 596);
        assert_eq!(order_of(8, 8), 448);
        // even by construction
        assert_eq!(order_of(8, 4) % 2, 0);
    }

    #[test]
    fn test_page_num_value_round_trip() {
        let value = page_num_to_value(0xabcd, 8);
        assert_eq!(value.len(), 8);
        assert_eq!(value_to_page_num(&value), 0xabcd);
    }

    #[test]
    fn test_lower_bound_with_duplicates() {
        let mut node = BTreeNode::new_leaf(K, V);
        for byte in [1u8, 3, 3, 5] {
            node.insert_entry(&key(byte), &val(byte));
        }
        assert_eq!(node.lower_bound(&key(0)), 0);
        assert_eq!(node.lower_bound(&key(3)), 1);
        assert_eq!(node.lower_bound(&key(4)), 3);
        assert_eq!(node.lower_bound(&key(9)), 4);
    }

    #[test]
    fn test_insert_keeps_keys_sorted() {
        let mut node = BTreeNode::new_leaf(K, V);
        for byte in [5u8, 1, 3] {
            node.insert_entry(&key(byte), &val(byte));
        }
        let got: Vec<u8> = (0..node.len()).map(|i| node.key_at(i)[0]).collect();
        assert_eq!(got, vec![1, 3, 5]);
        // values travel with their keys on a leaf
        assert_eq!(node.value_at(0)[0], 1);
    }

    #[test]
    fn test_no_split_at_order_minus_one() {
        let mut node = BTreeNode::new_leaf(K, V);
        for byte in 0..(order_of(K, V) - 1) as u8 {
            node.insert_entry(&key(byte), &val(byte));
        }
        assert!(!node.is_overflow());
    }

    #[test]
    fn test_leaf_split_geometry() {
        let order = order_of(K, V);
        let mut node = BTreeNode::new_leaf(K, V);
        for byte in 0..order as u8 {
            node.insert_entry(&key(byte), &val(byte));
        }
        assert!(node.is_overflow());

        let sibling = node.split_leaf();
        assert_eq!(node.len(), order / 2);
        assert_eq!(sibling.len(), order - order / 2);
        // the sibling starts exactly where the node stopped
        assert!(node.key_at(node.len() - 1) < sibling.first_key());
    }

    #[test]
    fn test_inner_split_promotes_middle_key() {
        let order = order_of(K, V);
        let mut node = BTreeNode::new_inner(K, V, 100);
        for i in 0..order as u8 {
            node.insert_entry(&key(i), &page_num_to_value(101 + i as u32, V));
        }
        assert!(node.is_overflow());
        assert_eq!(node.values.len(), order + 1);

        let (promoted, sibling) = node.split_inner();
        assert_eq!(node.len(), order / 2 - 1);
        assert_eq!(sibling.len(), order - order / 2);
        assert_eq!(promoted, key((order / 2 - 1) as u8));
        // children counts stay len + 1 on both sides
        assert_eq!(node.values.len(), node.len() + 1);
        assert_eq!(sibling.values.len(), sibling.len() + 1);
    }

    #[test]
    fn test_codec_round_trip() {
        let mut node = BTreeNode::new_leaf(8, 4);
        node.next_leaf = 9;
        node.insert_entry(&7i64.to_be_bytes(), &page_num_to_value(3, 4));

        let mut reader = Cursor::new(node.encode());
        let decoded = BTreeNode::decode_from(&mut reader).unwrap();
        assert!(decoded.is_leaf);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded.next_leaf, 9);
        assert_eq!(decoded.key_at(0), &7i64.to_be_bytes());
        assert_eq!(value_to_page_num(decoded.value_at(0)), 3);
    }
}
