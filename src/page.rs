//! In-memory page model and its on-disk slotted encoding.
//!
//! A page is a fixed 4096-byte unit. Branch and leaf pages carry a 16-byte
//! header, a slot array of node offsets growing up from the header, and node
//! bodies packed down from the end of the page. Overflow pages carry the same
//! header shape with a chain length instead of entry bookkeeping, followed by
//! raw value bytes.

use crate::comparator::Comparator;
use crate::constants::{
    NodeFlags, PageFlags, MAX_INLINE_ITEM, NODE_HDR_SIZE, PAGE_HDR_SIZE, PAGE_SIZE, SLOT_SIZE,
};
use crate::error::{Error, Result};

/// Result of a key search within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SearchResult {
    /// Key found at this node index (leftmost match)
    Found(usize),
    /// Key absent; this is the index it would be inserted at
    Missing(usize),
}

/// A single key/value entry within a branch or leaf page.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub flags: NodeFlags,
    pub key: Vec<u8>,
    /// Leaf: value bytes. Branch: child page number, 8 bytes little-endian.
    /// BIGDATA leaf: overflow start page and value length, 16 bytes.
    pub value: Vec<u8>,
}

impl Node {
    pub fn leaf(key: Vec<u8>, value: Vec<u8>) -> Node {
        Node { flags: NodeFlags::empty(), key, value }
    }

    pub fn bigdata(key: Vec<u8>, start: u64, len: u64) -> Node {
        let mut value = Vec::with_capacity(16);
        value.extend_from_slice(&start.to_le_bytes());
        value.extend_from_slice(&len.to_le_bytes());
        Node { flags: NodeFlags::BIGDATA, key, value }
    }

    pub fn branch(key: Vec<u8>, child: u64) -> Node {
        Node { flags: NodeFlags::empty(), key, value: child.to_le_bytes().to_vec() }
    }

    pub fn is_bigdata(&self) -> bool {
        self.flags.contains(NodeFlags::BIGDATA)
    }

    /// Child page number of a branch node.
    pub fn child(&self) -> Result<u64> {
        let bytes: [u8; 8] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| Error::corrupted("branch node value is not a page number"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn set_child(&mut self, child: u64) {
        self.value = child.to_le_bytes().to_vec();
    }

    /// Overflow chain reference (start page, value length) of a BIGDATA node.
    pub fn overflow_ref(&self) -> Result<(u64, u64)> {
        if !self.is_bigdata() || self.value.len() != 16 {
            return Err(Error::corrupted("node has no overflow reference"));
        }
        let mut start = [0u8; 8];
        let mut len = [0u8; 8];
        start.copy_from_slice(&self.value[..8]);
        len.copy_from_slice(&self.value[8..]);
        Ok((u64::from_le_bytes(start), u64::from_le_bytes(len)))
    }

    /// Serialized size of this node, excluding its slot entry.
    pub fn size(&self) -> usize {
        NODE_HDR_SIZE + self.key.len() + self.value.len()
    }
}

/// Does a key/value pair of this size fit inline in a leaf node?
pub(crate) fn fits_inline(klen: usize, vlen: usize) -> bool {
    NODE_HDR_SIZE + klen + vlen <= MAX_INLINE_ITEM
}

/// A parsed branch or leaf page.
#[derive(Debug, Clone)]
pub(crate) struct Page {
    pub pgno: u64,
    pub flags: PageFlags,
    pub nodes: Vec<Node>,
}

impl Page {
    pub fn new(pgno: u64, flags: PageFlags) -> Page {
        Page { pgno, flags, nodes: Vec::new() }
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(PageFlags::LEAF)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(PageFlags::BRANCH)
    }

    /// Bytes this page occupies when serialized.
    pub fn used(&self) -> usize {
        PAGE_HDR_SIZE
            + self
                .nodes
                .iter()
                .map(|n| SLOT_SIZE + n.size())
                .sum::<usize>()
    }

    /// Lower bound search: leftmost node whose key compares equal, or the
    /// index the key would be inserted at.
    pub fn search(&self, key: &[u8], cmp: &dyn Comparator) -> SearchResult {
        let mut lo = 0usize;
        let mut hi = self.nodes.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(&self.nodes[mid].key, key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo < self.nodes.len() && cmp.compare(&self.nodes[lo].key, key) == std::cmp::Ordering::Equal {
            SearchResult::Found(lo)
        } else {
            SearchResult::Missing(lo)
        }
    }

    /// Index of the child to descend into for `key`. Node 0 carries the
    /// sentinel empty key and is never compared.
    pub fn branch_index(&self, key: &[u8], cmp: &dyn Comparator) -> usize {
        let mut lo = 1usize;
        let mut hi = self.nodes.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if cmp.compare(&self.nodes[mid].key, key) == std::cmp::Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo - 1
    }

    /// Serialize into a page-sized buffer.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let used = self.used();
        if used > PAGE_SIZE || self.nodes.len() > u16::MAX as usize {
            return Err(Error::corrupted(format!(
                "page {} exceeds capacity when serialized",
                self.pgno
            )));
        }
        buf.fill(0);
        let num = self.nodes.len();
        let lower = PAGE_HDR_SIZE + num * SLOT_SIZE;
        let mut upper = PAGE_SIZE;
        for (i, node) in self.nodes.iter().enumerate() {
            upper -= node.size();
            let slot = PAGE_HDR_SIZE + i * SLOT_SIZE;
            buf[slot..slot + 2].copy_from_slice(&(upper as u16).to_le_bytes());
            let off = upper;
            buf[off..off + 2].copy_from_slice(&(node.key.len() as u16).to_le_bytes());
            buf[off + 2..off + 6].copy_from_slice(&(node.value.len() as u32).to_le_bytes());
            buf[off + 6..off + 8].copy_from_slice(&node.flags.bits().to_le_bytes());
            let koff = off + NODE_HDR_SIZE;
            buf[koff..koff + node.key.len()].copy_from_slice(&node.key);
            let voff = koff + node.key.len();
            buf[voff..voff + node.value.len()].copy_from_slice(&node.value);
        }
        buf[0..8].copy_from_slice(&self.pgno.to_le_bytes());
        buf[8..10].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[10..12].copy_from_slice(&(num as u16).to_le_bytes());
        buf[12..14].copy_from_slice(&(lower as u16).to_le_bytes());
        buf[14..16].copy_from_slice(&(upper as u16).to_le_bytes());
        Ok(())
    }

    /// Parse a page out of its on-disk bytes, validating structure.
    pub fn parse(buf: &[u8], expect_pgno: u64) -> Result<Page> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::corrupted("short page read"));
        }
        let pgno = u64::from_le_bytes(buf[0..8].try_into().map_err(|_| Error::Invalid)?);
        let flags = PageFlags::from_bits(u16::from_le_bytes([buf[8], buf[9]]))
            .ok_or_else(|| Error::corrupted(format!("page {expect_pgno}: unknown page flags")))?;
        if pgno != expect_pgno {
            return Err(Error::corrupted(format!(
                "page {expect_pgno}: header claims page number {pgno}"
            )));
        }
        if !(flags.contains(PageFlags::LEAF) ^ flags.contains(PageFlags::BRANCH)) {
            return Err(Error::corrupted(format!(
                "page {pgno}: neither branch nor leaf"
            )));
        }
        let num = u16::from_le_bytes([buf[10], buf[11]]) as usize;
        if flags.contains(PageFlags::BRANCH) && num == 0 {
            return Err(Error::corrupted(format!("page {pgno}: empty branch page")));
        }
        let lower = u16::from_le_bytes([buf[12], buf[13]]) as usize;
        let upper = u16::from_le_bytes([buf[14], buf[15]]) as usize;
        if lower != PAGE_HDR_SIZE + num * SLOT_SIZE || lower > upper || upper > PAGE_SIZE {
            return Err(Error::corrupted(format!("page {pgno}: bad free-space bounds")));
        }
        let mut nodes = Vec::with_capacity(num);
        for i in 0..num {
            let slot = PAGE_HDR_SIZE + i * SLOT_SIZE;
            let off = u16::from_le_bytes([buf[slot], buf[slot + 1]]) as usize;
            if off < upper || off + NODE_HDR_SIZE > PAGE_SIZE {
                return Err(Error::corrupted(format!("page {pgno}: node offset out of range")));
            }
            let klen = u16::from_le_bytes([buf[off], buf[off + 1]]) as usize;
            let vlen = u32::from_le_bytes(buf[off + 2..off + 6].try_into().map_err(|_| Error::Invalid)?)
                as usize;
            let nflags = NodeFlags::from_bits(u16::from_le_bytes([buf[off + 6], buf[off + 7]]))
                .ok_or_else(|| Error::corrupted(format!("page {pgno}: unknown node flags")))?;
            let koff = off + NODE_HDR_SIZE;
            if koff + klen + vlen > PAGE_SIZE {
                return Err(Error::corrupted(format!("page {pgno}: node data out of range")));
            }
            if flags.contains(PageFlags::BRANCH) && vlen != 8 {
                return Err(Error::corrupted(format!("page {pgno}: branch node value size {vlen}")));
            }
            nodes.push(Node {
                flags: nflags,
                key: buf[koff..koff + klen].to_vec(),
                value: buf[koff + klen..koff + klen + vlen].to_vec(),
            });
        }
        Ok(Page { pgno, flags, nodes })
    }
}

/// Write the header of the first page of an overflow chain.
pub(crate) fn write_overflow_header(buf: &mut [u8], pgno: u64, npages: u32) {
    buf[0..8].copy_from_slice(&pgno.to_le_bytes());
    buf[8..10].copy_from_slice(&PageFlags::OVERFLOW.bits().to_le_bytes());
    buf[10..12].fill(0);
    buf[12..16].copy_from_slice(&npages.to_le_bytes());
}

/// Parse and validate the header of an overflow chain's first page.
pub(crate) fn parse_overflow_header(buf: &[u8], expect_pgno: u64) -> Result<u32> {
    let pgno = u64::from_le_bytes(buf[0..8].try_into().map_err(|_| Error::Invalid)?);
    let flags = u16::from_le_bytes([buf[8], buf[9]]);
    if pgno != expect_pgno || flags != PageFlags::OVERFLOW.bits() {
        return Err(Error::corrupted(format!(
            "page {expect_pgno}: not an overflow page"
        )));
    }
    Ok(u32::from_le_bytes(buf[12..16].try_into().map_err(|_| Error::Invalid)?))
}

/// Number of pages an overflow chain for a value of this length occupies.
pub(crate) fn overflow_pages(len: usize) -> usize {
    (len + PAGE_HDR_SIZE).div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::LexicographicComparator;

    fn sample_leaf() -> Page {
        let mut page = Page::new(7, PageFlags::LEAF);
        page.nodes.push(Node::leaf(b"alpha".to_vec(), b"1".to_vec()));
        page.nodes.push(Node::leaf(b"beta".to_vec(), b"2".to_vec()));
        page.nodes.push(Node::leaf(b"gamma".to_vec(), b"3".to_vec()));
        page
    }

    #[test]
    fn serialize_parse_round_trip() {
        let page = sample_leaf();
        let mut buf = vec![0u8; PAGE_SIZE];
        page.serialize(&mut buf).unwrap();
        let back = Page::parse(&buf, 7).unwrap();
        assert_eq!(back.flags, PageFlags::LEAF);
        assert_eq!(back.nodes.len(), 3);
        assert_eq!(back.nodes[1].key, b"beta");
        assert_eq!(back.nodes[1].value, b"2");
    }

    #[test]
    fn parse_rejects_wrong_page_number() {
        let page = sample_leaf();
        let mut buf = vec![0u8; PAGE_SIZE];
        page.serialize(&mut buf).unwrap();
        assert!(matches!(Page::parse(&buf, 8), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn search_finds_leftmost_match() {
        let cmp = LexicographicComparator;
        let mut page = Page::new(1, PageFlags::LEAF);
        page.nodes.push(Node::leaf(b"k".to_vec(), b"a".to_vec()));
        page.nodes.push(Node::leaf(b"k".to_vec(), b"b".to_vec()));
        page.nodes.push(Node::leaf(b"z".to_vec(), b"c".to_vec()));
        assert_eq!(page.search(b"k", &cmp), SearchResult::Found(0));
        assert_eq!(page.search(b"m", &cmp), SearchResult::Missing(2));
        assert_eq!(page.search(b"zz", &cmp), SearchResult::Missing(3));
    }

    #[test]
    fn branch_index_uses_sentinel_first_entry() {
        let cmp = LexicographicComparator;
        let mut page = Page::new(2, PageFlags::BRANCH);
        page.nodes.push(Node::branch(Vec::new(), 10));
        page.nodes.push(Node::branch(b"m".to_vec(), 11));
        page.nodes.push(Node::branch(b"t".to_vec(), 12));
        assert_eq!(page.branch_index(b"a", &cmp), 0);
        assert_eq!(page.branch_index(b"m", &cmp), 1);
        assert_eq!(page.branch_index(b"s", &cmp), 1);
        assert_eq!(page.branch_index(b"x", &cmp), 2);
    }

    #[test]
    fn overflow_header_round_trip() {
        let mut buf = vec![0u8; PAGE_SIZE];
        write_overflow_header(&mut buf, 99, 4);
        assert_eq!(parse_overflow_header(&buf, 99).unwrap(), 4);
        assert!(parse_overflow_header(&buf, 98).is_err());
    }

    #[test]
    fn inline_capacity_boundary() {
        assert!(fits_inline(10, MAX_INLINE_ITEM - NODE_HDR_SIZE - 10));
        assert!(!fits_inline(10, MAX_INLINE_ITEM - NODE_HDR_SIZE - 9));
    }
}
