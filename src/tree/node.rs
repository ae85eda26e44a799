//! # Page Layout and Node Codec
//!
//! Every B+ tree page is 4096 bytes and begins with a 16-byte header. Nodes
//! are addressed through a slot array of 2-byte offsets growing down from
//! the header; node payloads grow up from the end of the page:
//!
//! ```text
//! +---------------------------+ 0
//! | PageHeader (16 bytes)     |
//! +---------------------------+ 16
//! | Node offsets (2B each)    |  <- grows downward, ends at `lower`
//! +---------------------------+
//! | Free space                |
//! +---------------------------+ `upper`
//! | Node payloads             |  <- grows upward from the page end
//! +---------------------------+ 4096
//! ```
//!
//! ## Page Header (16 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  --------------------------------------
//! 0       1     flags          Leaf / Branch / Overflow
//! 1       1     reserved
//! 2       2     lower          First byte past the offset array
//! 4       2     upper          First byte of the lowest payload
//! 6       2     entry_count    Number of nodes in this page
//! 8       4     page_no        This page's own number
//! 12      4     overflow_size  Value byte length (overflow pages only)
//! ```
//!
//! ## Node Layout (24-byte header + key + inline value)
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ------------------------------------------
//! 0       1     flags      PageRef / Data / MultiValuePageRef / Overflow
//! 1       1     reserved
//! 2       2     key_size
//! 4       4     version    Per-slot upsert counter
//! 8       8     page       Child page / overflow start / sub-tree root
//! 16      8     data_size  Inline or overflow value byte length
//! ```
//!
//! Leaf pages hold `Data` nodes (inline value, or an overflow reference when
//! the node would exceed a quarter of the usable space) and
//! `MultiValuePageRef` nodes whose payload is the embedded sub-tree's
//! header. Branch pages hold `PageRef` nodes; the first entry of every
//! branch page carries the empty key, the "before all keys" sentinel.
//!
//! ## Deletion and Compaction
//!
//! Removing a node drops its offset slot but leaks its payload bytes. The
//! copy-on-write copy pass (`copy_compact`) rewrites pages densely, so every
//! page mutated by a transaction is defragmented for free.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::storage::{PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_USABLE_SIZE};

pub const NODE_HEADER_SIZE: usize = 24;
pub const SLOT_SIZE: usize = 2;

/// Largest node (header + key + inline value) a leaf keeps in-page; bigger
/// values move to an overflow run.
pub const MAX_NODE_SIZE: usize = PAGE_USABLE_SIZE / 4;

/// Page flags.
pub const PAGE_LEAF: u8 = 0x01;
pub const PAGE_BRANCH: u8 = 0x02;
pub const PAGE_OVERFLOW: u8 = 0x04;
pub const PAGE_FREE_SPACE: u8 = 0x08;

/// Node flags.
pub const NODE_PAGE_REF: u8 = 0x01;
pub const NODE_DATA: u8 = 0x02;
pub const NODE_MULTI_VALUE_PAGE_REF: u8 = 0x04;
pub const NODE_OVERFLOW: u8 = 0x08;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    flags: u8,
    _reserved: u8,
    lower: U16,
    upper: U16,
    entry_count: U16,
    page_no: U32,
    overflow_size: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn lower(&self) -> u16 {
        self.lower.get()
    }

    pub fn upper(&self) -> u16 {
        self.upper.get()
    }

    pub fn entry_count(&self) -> u16 {
        self.entry_count.get()
    }

    pub fn page_no(&self) -> u32 {
        self.page_no.get()
    }

    pub fn overflow_size(&self) -> u32 {
        self.overflow_size.get()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    flags: u8,
    _reserved: u8,
    key_size: U16,
    version: U32,
    page: U64,
    data_size: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

impl NodeHeader {
    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_page_ref(&self) -> bool {
        self.flags & NODE_PAGE_REF != 0
    }

    pub fn is_data(&self) -> bool {
        self.flags & NODE_DATA != 0
    }

    pub fn is_multi_value(&self) -> bool {
        self.flags & NODE_MULTI_VALUE_PAGE_REF != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.flags & NODE_OVERFLOW != 0
    }

    pub fn key_size(&self) -> usize {
        self.key_size.get() as usize
    }

    pub fn version(&self) -> u32 {
        self.version.get()
    }

    pub fn page(&self) -> u64 {
        self.page.get()
    }

    pub fn data_size(&self) -> u64 {
        self.data_size.get()
    }
}

/// A decoded node: header plus the key and inline payload slices.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    pub header: &'a NodeHeader,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

/// Result of a key search within one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound(usize),
}

/// Total in-page size of a node with the given key and inline payload.
pub fn node_size(key_len: usize, data_len: usize) -> usize {
    NODE_HEADER_SIZE + key_len + data_len
}

/// Pages needed for an overflow run holding `value_len` bytes. Every page
/// of the run carries its own header so journal images stay
/// self-describing; each contributes the usable space.
pub fn overflow_page_count(value_len: usize) -> u64 {
    value_len.div_ceil(PAGE_USABLE_SIZE).max(1) as u64
}

/// Read-only view over a page buffer.
#[derive(Clone, Copy)]
pub struct PageView<'a> {
    data: &'a [u8],
}

impl<'a> PageView<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data })
    }

    pub fn header(&self) -> &'a PageHeader {
        // Length was checked in new(); a 16-byte unaligned parse cannot fail.
        PageHeader::ref_from_bytes(&self.data[..PAGE_HEADER_SIZE]).unwrap()
    }

    pub fn is_leaf(&self) -> bool {
        self.header().flags() & PAGE_LEAF != 0
    }

    pub fn is_branch(&self) -> bool {
        self.header().flags() & PAGE_BRANCH != 0
    }

    pub fn is_overflow(&self) -> bool {
        self.header().flags() & PAGE_OVERFLOW != 0
    }

    pub fn entry_count(&self) -> usize {
        self.header().entry_count() as usize
    }

    pub fn free_space(&self) -> usize {
        self.header().upper().saturating_sub(self.header().lower()) as usize
    }

    pub fn has_space_for(&self, node_len: usize) -> bool {
        self.free_space() >= node_len + SLOT_SIZE
    }

    fn slot_offset(&self, index: usize) -> usize {
        let slot_pos = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        u16::from_le_bytes([self.data[slot_pos], self.data[slot_pos + 1]]) as usize
    }

    pub fn node(&self, index: usize) -> Result<NodeRef<'a>> {
        ensure!(
            index < self.entry_count(),
            "node index {} out of bounds (entry_count={})",
            index,
            self.entry_count()
        );

        let offset = self.slot_offset(index);
        ensure!(
            offset + NODE_HEADER_SIZE <= PAGE_SIZE,
            "node offset {} out of page bounds",
            offset
        );

        let header = NodeHeader::ref_from_bytes(&self.data[offset..offset + NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))?;

        let key_start = offset + NODE_HEADER_SIZE;
        let key_end = key_start + header.key_size();
        let inline_len = if header.is_overflow() {
            0
        } else if header.is_data() || header.is_multi_value() {
            header.data_size() as usize
        } else {
            0
        };
        let value_end = key_end + inline_len;
        ensure!(
            value_end <= PAGE_SIZE,
            "node at offset {} extends beyond page end",
            offset
        );

        Ok(NodeRef {
            header,
            key: &self.data[key_start..key_end],
            value: &self.data[key_end..value_end],
        })
    }

    pub fn key(&self, index: usize) -> Result<&'a [u8]> {
        Ok(self.node(index)?.key)
    }

    /// Binary search for `key` under the byte comparator. Branch pages sort
    /// the empty sentinel key before everything, so the plain comparison is
    /// correct there too.
    pub fn search(&self, key: &[u8]) -> Result<SearchResult> {
        let mut low = 0usize;
        let mut high = self.entry_count();

        while low < high {
            let mid = (low + high) / 2;
            match self.key(mid)?.cmp(key) {
                std::cmp::Ordering::Equal => return Ok(SearchResult::Found(mid)),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }

        Ok(SearchResult::NotFound(low))
    }

    /// Index of the child covering `key` in a branch page.
    pub fn branch_child_index(&self, key: &[u8]) -> Result<usize> {
        debug_assert!(self.is_branch());
        match self.search(key)? {
            SearchResult::Found(i) => Ok(i),
            SearchResult::NotFound(0) => Ok(0),
            SearchResult::NotFound(i) => Ok(i - 1),
        }
    }

    pub fn child_page(&self, index: usize) -> Result<u64> {
        let node = self.node(index)?;
        ensure!(
            node.header.is_page_ref(),
            "node {} in page {} is not a page reference",
            index,
            self.header().page_no()
        );
        Ok(node.header.page())
    }
}

/// Mutable view over a page buffer.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        Ok(Self { data })
    }

    /// Initializes an empty page in place.
    pub fn init(data: &'a mut [u8], flags: u8, page_no: u32) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        data.fill(0);

        let header = PageHeader {
            flags,
            _reserved: 0,
            lower: U16::new(PAGE_HEADER_SIZE as u16),
            upper: U16::new(PAGE_SIZE as u16),
            entry_count: U16::new(0),
            page_no: U32::new(page_no),
            overflow_size: U32::new(0),
        };
        data[..PAGE_HEADER_SIZE].copy_from_slice(header.as_bytes());

        Ok(Self { data })
    }

    pub fn view(&self) -> PageView<'_> {
        PageView { data: self.data }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::mut_from_bytes(&mut self.data[..PAGE_HEADER_SIZE]).unwrap()
    }

    pub fn set_page_no(&mut self, page_no: u32) {
        self.header_mut().page_no = U32::new(page_no);
    }

    pub fn set_overflow_size(&mut self, size: u32) {
        self.header_mut().overflow_size = U32::new(size);
    }

    /// Inserts a node at `index`, shifting later slots right. The caller
    /// must have verified free space.
    pub fn insert_node(
        &mut self,
        index: usize,
        flags: u8,
        key: &[u8],
        page: u64,
        data: &[u8],
        version: u32,
    ) -> Result<()> {
        self.insert_node_with_size(index, flags, key, page, data, data.len() as u64, version)
    }

    /// Like `insert_node`, with `data_size` recorded independently of the
    /// inline bytes. Overflow references store no inline payload but carry
    /// the out-of-page value's byte length.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_node_with_size(
        &mut self,
        index: usize,
        flags: u8,
        key: &[u8],
        page: u64,
        data: &[u8],
        data_size: u64,
        version: u32,
    ) -> Result<()> {
        let size = node_size(key.len(), data.len());
        let view = self.view();
        let count = view.entry_count();

        ensure!(index <= count, "insert index {} out of bounds", index);
        ensure!(
            view.has_space_for(size),
            "page {} has no room for a {}-byte node",
            view.header().page_no(),
            size
        );

        let lower = view.header().lower() as usize;
        let upper = view.header().upper() as usize;
        let payload_offset = upper - size;

        // Open a slot gap at `index`.
        let slot_pos = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.data.copy_within(slot_pos..lower, slot_pos + SLOT_SIZE);
        self.data[slot_pos..slot_pos + SLOT_SIZE]
            .copy_from_slice(&(payload_offset as u16).to_le_bytes());

        let node = NodeHeader {
            flags,
            _reserved: 0,
            key_size: U16::new(key.len() as u16),
            version: U32::new(version),
            page: U64::new(page),
            data_size: U64::new(data_size),
        };
        let key_start = payload_offset + NODE_HEADER_SIZE;
        self.data[payload_offset..key_start].copy_from_slice(node.as_bytes());
        self.data[key_start..key_start + key.len()].copy_from_slice(key);
        self.data[key_start + key.len()..key_start + key.len() + data.len()]
            .copy_from_slice(data);

        let header = self.header_mut();
        header.lower = U16::new((lower + SLOT_SIZE) as u16);
        header.upper = U16::new(payload_offset as u16);
        header.entry_count = U16::new((count + 1) as u16);

        Ok(())
    }

    /// Removes the node at `index`. Its payload bytes are leaked until the
    /// next copy-on-write pass compacts the page.
    pub fn remove_node(&mut self, index: usize) -> Result<()> {
        let view = self.view();
        let count = view.entry_count();
        ensure!(index < count, "remove index {} out of bounds", index);

        let lower = view.header().lower() as usize;
        let slot_pos = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.data.copy_within(slot_pos + SLOT_SIZE..lower, slot_pos);

        let header = self.header_mut();
        header.lower = U16::new((lower - SLOT_SIZE) as u16);
        header.entry_count = U16::new((count - 1) as u16);

        Ok(())
    }

    /// Rewrites the child page number of a `PageRef` node in place.
    pub fn set_child_page(&mut self, index: usize, child: u64) -> Result<()> {
        let view = self.view();
        ensure!(
            index < view.entry_count(),
            "child index {} out of bounds",
            index
        );
        let offset = view.slot_offset(index);

        let node =
            NodeHeader::mut_from_bytes(&mut self.data[offset..offset + NODE_HEADER_SIZE])
                .map_err(|e| eyre::eyre!("failed to read NodeHeader: {:?}", e))?;
        ensure!(
            node.is_page_ref(),
            "node {} is not a page reference",
            index
        );
        node.page = U64::new(child);
        Ok(())
    }
}

/// Copies `src` into `dst` densely: same header identity, payloads packed
/// against the page end with no leaked gaps.
pub fn copy_compact(src: PageView<'_>, dst: &mut [u8]) -> Result<()> {
    let src_header = src.header();
    let mut page = PageMut::init(dst, src_header.flags(), src_header.page_no())?;
    page.set_overflow_size(src_header.overflow_size());

    for i in 0..src.entry_count() {
        let node = src.node(i)?;
        page.insert_node_with_size(
            i,
            node.header.flags(),
            node.key,
            node.header.page(),
            node.value,
            node.header.data_size(),
            node.header.version(),
        )?;
    }

    Ok(())
}

/// Structural check of a single page; the sum of slot and payload sizes must
/// stay within the usable space and keys must be strictly increasing.
pub fn validate_page(data: &[u8]) -> Result<()> {
    let view = PageView::new(data)?;
    let header = view.header();

    if header.flags() & PAGE_OVERFLOW != 0 {
        return Ok(());
    }

    ensure!(
        header.flags() & (PAGE_LEAF | PAGE_BRANCH) != 0,
        "page {} has no type flag",
        header.page_no()
    );
    ensure!(
        header.lower() as usize >= PAGE_HEADER_SIZE,
        "lower {} below page header",
        header.lower()
    );
    ensure!(
        header.lower() <= header.upper(),
        "lower {} above upper {}",
        header.lower(),
        header.upper()
    );
    ensure!(
        header.upper() as usize <= PAGE_SIZE,
        "upper {} beyond page end",
        header.upper()
    );
    ensure!(
        header.lower() as usize == PAGE_HEADER_SIZE + view.entry_count() * SLOT_SIZE,
        "offset array size does not match entry count"
    );

    let mut total = view.entry_count() * SLOT_SIZE;
    for i in 0..view.entry_count() {
        let node = view.node(i)?;
        total += node_size(node.key.len(), node.value.len());

        if i > 0 {
            let prev = view.key(i - 1)?;
            ensure!(
                prev < node.key,
                "keys out of order in page {} at index {}",
                header.page_no(),
                i
            );
        }
    }
    ensure!(
        total <= PAGE_USABLE_SIZE,
        "page {} content {} exceeds usable space",
        header.page_no(),
        total
    );

    if view.is_branch() {
        ensure!(view.entry_count() > 0, "branch page with no entries");
        ensure!(
            view.key(0)?.is_empty(),
            "branch page {} first key is not the sentinel",
            header.page_no()
        );
        for i in 0..view.entry_count() {
            let node = view.node(i)?;
            ensure!(
                node.header.is_page_ref(),
                "branch page {} holds a non-reference node",
                header.page_no()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        PageMut::init(&mut data, PAGE_LEAF, 7).unwrap();
        data
    }

    #[test]
    fn page_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 16);
    }

    #[test]
    fn node_header_size_is_24_bytes() {
        assert_eq!(std::mem::size_of::<NodeHeader>(), 24);
    }

    #[test]
    fn init_sets_empty_page() {
        let data = leaf_page();
        let view = PageView::new(&data).unwrap();

        assert!(view.is_leaf());
        assert_eq!(view.entry_count(), 0);
        assert_eq!(view.header().page_no(), 7);
        assert_eq!(view.free_space(), PAGE_USABLE_SIZE);
    }

    #[test]
    fn insert_and_read_nodes() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data).unwrap();

        page.insert_node(0, NODE_DATA, b"bravo", 0, b"2", 0).unwrap();
        page.insert_node(0, NODE_DATA, b"alpha", 0, b"1", 0).unwrap();
        page.insert_node(2, NODE_DATA, b"charlie", 0, b"3", 0).unwrap();

        let view = PageView::new(&data).unwrap();
        assert_eq!(view.entry_count(), 3);
        assert_eq!(view.key(0).unwrap(), b"alpha");
        assert_eq!(view.key(1).unwrap(), b"bravo");
        assert_eq!(view.key(2).unwrap(), b"charlie");
        assert_eq!(view.node(1).unwrap().value, b"2");
        validate_page(&data).unwrap();
    }

    #[test]
    fn search_finds_existing_and_insertion_points() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data).unwrap();
        for (i, key) in [b"bb".as_ref(), b"dd", b"ff"].iter().enumerate() {
            page.insert_node(i, NODE_DATA, key, 0, b"x", 0).unwrap();
        }

        let view = PageView::new(&data).unwrap();
        assert_eq!(view.search(b"dd").unwrap(), SearchResult::Found(1));
        assert_eq!(view.search(b"aa").unwrap(), SearchResult::NotFound(0));
        assert_eq!(view.search(b"cc").unwrap(), SearchResult::NotFound(1));
        assert_eq!(view.search(b"zz").unwrap(), SearchResult::NotFound(3));
    }

    #[test]
    fn remove_node_shifts_slots() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data).unwrap();
        for (i, key) in [b"a".as_ref(), b"b", b"c"].iter().enumerate() {
            page.insert_node(i, NODE_DATA, key, 0, b"v", 0).unwrap();
        }

        page.remove_node(1).unwrap();

        let view = PageView::new(&data).unwrap();
        assert_eq!(view.entry_count(), 2);
        assert_eq!(view.key(0).unwrap(), b"a");
        assert_eq!(view.key(1).unwrap(), b"c");
    }

    #[test]
    fn branch_child_index_respects_sentinel() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = PageMut::init(&mut data, PAGE_BRANCH, 1).unwrap();
        page.insert_node(0, NODE_PAGE_REF, b"", 10, &[], 0).unwrap();
        page.insert_node(1, NODE_PAGE_REF, b"m", 20, &[], 0).unwrap();
        page.insert_node(2, NODE_PAGE_REF, b"t", 30, &[], 0).unwrap();

        let view = PageView::new(&data).unwrap();
        assert_eq!(view.branch_child_index(b"a").unwrap(), 0);
        assert_eq!(view.branch_child_index(b"m").unwrap(), 1);
        assert_eq!(view.branch_child_index(b"p").unwrap(), 1);
        assert_eq!(view.branch_child_index(b"z").unwrap(), 2);
        assert_eq!(view.child_page(view.branch_child_index(b"z").unwrap()).unwrap(), 30);
    }

    #[test]
    fn set_child_page_rewrites_in_place() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = PageMut::init(&mut data, PAGE_BRANCH, 1).unwrap();
        page.insert_node(0, NODE_PAGE_REF, b"", 10, &[], 0).unwrap();

        page.set_child_page(0, 99).unwrap();

        let view = PageView::new(&data).unwrap();
        assert_eq!(view.child_page(0).unwrap(), 99);
    }

    #[test]
    fn copy_compact_reclaims_leaked_space() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data).unwrap();
        page.insert_node(0, NODE_DATA, b"a", 0, &[1u8; 200], 0).unwrap();
        page.insert_node(1, NODE_DATA, b"b", 0, &[2u8; 200], 0).unwrap();
        let before = PageView::new(&data).unwrap().free_space();
        PageMut::new(&mut data).unwrap().remove_node(0).unwrap();

        let mut compacted = vec![0u8; PAGE_SIZE];
        copy_compact(PageView::new(&data).unwrap(), &mut compacted).unwrap();

        let view = PageView::new(&compacted).unwrap();
        assert_eq!(view.entry_count(), 1);
        assert_eq!(view.key(0).unwrap(), b"b");
        assert!(view.free_space() > before);
        validate_page(&compacted).unwrap();
    }

    #[test]
    fn has_space_for_accounts_for_slot() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data).unwrap();
        let big = vec![0u8; PAGE_USABLE_SIZE - NODE_HEADER_SIZE - SLOT_SIZE - 1];

        assert!(page.view().has_space_for(node_size(1, big.len())));
        page.insert_node(0, NODE_DATA, b"k", 0, &big, 0).unwrap();
        assert!(!page.view().has_space_for(node_size(1, 0)));
    }

    #[test]
    fn overflow_page_count_accounts_for_per_page_headers() {
        assert_eq!(overflow_page_count(0), 1);
        assert_eq!(overflow_page_count(1), 1);
        assert_eq!(overflow_page_count(PAGE_USABLE_SIZE), 1);
        assert_eq!(overflow_page_count(PAGE_USABLE_SIZE + 1), 2);
        assert_eq!(overflow_page_count(3 * PAGE_USABLE_SIZE), 3);
    }

    #[test]
    fn validate_page_rejects_unordered_keys() {
        let mut data = leaf_page();
        let mut page = PageMut::new(&mut data).unwrap();
        page.insert_node(0, NODE_DATA, b"b", 0, b"", 0).unwrap();
        page.insert_node(1, NODE_DATA, b"a", 0, b"", 0).unwrap();

        assert!(validate_page(&data).is_err());
    }

    #[test]
    fn validate_page_rejects_branch_without_sentinel() {
        let mut data = vec![0u8; PAGE_SIZE];
        let mut page = PageMut::init(&mut data, PAGE_BRANCH, 1).unwrap();
        page.insert_node(0, NODE_PAGE_REF, b"k", 5, &[], 0).unwrap();

        assert!(validate_page(&data).is_err());
    }
}
