//! Copy-on-write B+tree over pages.
//!
//! Mutations clone the root-to-leaf path into the transaction's working set;
//! pages of older snapshots are never written in place. Branch pages follow
//! the convention that node 0 carries an empty sentinel key, so a separator
//! key is a lower bound for its whole subtree. Duplicate values (DUPSORT)
//! are adjacent leaf entries ordered by the duplicate comparator; a run may
//! span leaves, in which case the intervening separators all equal the key.

use std::cmp::Ordering;

use crate::constants::{
    DbFlags, PageFlags, WriteFlags, FILL_THRESHOLD, MAX_DUP_SIZE, MAX_KEY_SIZE, MAX_VALUE_SIZE,
    PAGE_HDR_SIZE, PAGE_SIZE, SLOT_SIZE,
};
use crate::env::DbiSlot;
use crate::error::{Error, Result};
use crate::meta::DbInfo;
use crate::page::{self, fits_inline, Node, Page, SearchResult};
use crate::transaction::Transaction;

/// One step of a root-to-leaf path: the page and the entry index taken.
#[derive(Debug, Clone)]
pub(crate) struct PathEntry {
    pub pgno: u64,
    pub index: usize,
}

pub(crate) type Path = Vec<PathEntry>;

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::BadValSize);
    }
    Ok(())
}

fn validate_value(slot: &DbiSlot, value: &[u8]) -> Result<()> {
    let limit = if slot.flags.contains(DbFlags::DUPSORT) { MAX_DUP_SIZE } else { MAX_VALUE_SIZE };
    if value.len() > limit {
        return Err(Error::BadValSize);
    }
    Ok(())
}

/// Errors that indicate the write transaction's working set may be half
/// mutated and must not be committed.
fn is_fatal(err: &Error) -> bool {
    matches!(
        err,
        Error::MapFull | Error::Io(_) | Error::Corrupted { .. } | Error::PageNotFound(_)
    )
}

/// Resolve a leaf node's value, following an overflow chain if needed.
pub(crate) fn node_value(txn: &Transaction<'_>, node: &Node) -> Result<Vec<u8>> {
    if node.is_bigdata() {
        let (start, len) = node.overflow_ref()?;
        txn.read_overflow(start, len)
    } else {
        Ok(node.value.clone())
    }
}

fn make_leaf_node(txn: &Transaction<'_>, info: &mut DbInfo, key: &[u8], value: &[u8]) -> Result<Node> {
    if fits_inline(key.len(), value.len()) {
        Ok(Node::leaf(key.to_vec(), value.to_vec()))
    } else {
        let (start, npages) = txn.write_overflow(value)?;
        info.overflow_pages += npages as u64;
        Ok(Node::bigdata(key.to_vec(), start, value.len() as u64))
    }
}

fn drop_node_value(txn: &Transaction<'_>, info: &mut DbInfo, node: &Node) -> Result<()> {
    if node.is_bigdata() {
        let (start, len) = node.overflow_ref()?;
        txn.free_overflow(start, len);
        info.overflow_pages = info
            .overflow_pages
            .saturating_sub(page::overflow_pages(len as usize) as u64);
    }
    Ok(())
}

// Path navigation

/// Right-biased descent by key: the leaf whose range holds `key`. The leaf
/// frame's index is left at 0 for the caller to position.
fn descend_to_leaf(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    info: &DbInfo,
    key: &[u8],
) -> Result<Option<Path>> {
    if info.root == 0 {
        return Ok(None);
    }
    let mut path = Path::new();
    let mut pgno = info.root;
    loop {
        let page = txn.get_page(pgno)?;
        if page.is_branch() {
            let index = page.branch_index(key, slot.key_cmp.as_ref());
            let child = page.nodes[index].child()?;
            path.push(PathEntry { pgno, index });
            pgno = child;
        } else {
            path.push(PathEntry { pgno, index: 0 });
            return Ok(Some(path));
        }
    }
}

fn descend_leftmost_from(txn: &Transaction<'_>, path: &mut Path, start: u64) -> Result<()> {
    let mut pgno = start;
    loop {
        let page = txn.get_page(pgno)?;
        if page.is_branch() {
            let child = page.nodes[0].child()?;
            path.push(PathEntry { pgno, index: 0 });
            pgno = child;
        } else {
            if page.nodes.is_empty() {
                return Err(Error::corrupted(format!("page {pgno}: empty non-root leaf")));
            }
            path.push(PathEntry { pgno, index: 0 });
            return Ok(());
        }
    }
}

fn descend_rightmost_from(txn: &Transaction<'_>, path: &mut Path, start: u64) -> Result<()> {
    let mut pgno = start;
    loop {
        let page = txn.get_page(pgno)?;
        if page.is_branch() {
            let index = page.nodes.len() - 1;
            let child = page.nodes[index].child()?;
            path.push(PathEntry { pgno, index });
            pgno = child;
        } else {
            if page.nodes.is_empty() {
                return Err(Error::corrupted(format!("page {pgno}: empty non-root leaf")));
            }
            path.push(PathEntry { pgno, index: page.nodes.len() - 1 });
            return Ok(());
        }
    }
}

/// Path to the first or last entry of the tree; empty path when the tree is.
pub(crate) fn descend_edge(
    txn: &Transaction<'_>,
    info: &DbInfo,
    first: bool,
) -> Result<Path> {
    let mut path = Path::new();
    if info.root == 0 {
        return Ok(path);
    }
    let root = txn.get_page(info.root)?;
    if root.is_leaf() && root.nodes.is_empty() {
        return Ok(path);
    }
    drop(root);
    if first {
        descend_leftmost_from(txn, &mut path, info.root)?;
    } else {
        descend_rightmost_from(txn, &mut path, info.root)?;
    }
    Ok(path)
}

/// The entry the path points at, unresolved. None when the path is empty or
/// sits past the end of its leaf.
pub(crate) fn raw_entry(txn: &Transaction<'_>, path: &Path) -> Result<Option<(Vec<u8>, Node)>> {
    let Some(last) = path.last() else {
        return Ok(None);
    };
    let leaf = txn.get_page(last.pgno)?;
    match leaf.nodes.get(last.index) {
        Some(node) => Ok(Some((node.key.clone(), node.clone()))),
        None => Ok(None),
    }
}

/// The entry the path points at, with overflow values resolved.
pub(crate) fn current_entry(
    txn: &Transaction<'_>,
    path: &Path,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    match raw_entry(txn, path)? {
        Some((key, node)) => Ok(Some((key, node_value(txn, &node)?))),
        None => Ok(None),
    }
}

/// Step to the next entry, crossing leaves. Returns false (path untouched)
/// when there is none.
pub(crate) fn advance(txn: &Transaction<'_>, path: &mut Path) -> Result<bool> {
    if path.is_empty() {
        return Ok(false);
    }
    let leaf_level = path.len() - 1;
    {
        let leaf = txn.get_page(path[leaf_level].pgno)?;
        if path[leaf_level].index + 1 < leaf.nodes.len() {
            path[leaf_level].index += 1;
            return Ok(true);
        }
    }
    let mut level = leaf_level;
    while level > 0 {
        level -= 1;
        let page = txn.get_page(path[level].pgno)?;
        if path[level].index + 1 < page.nodes.len() {
            path.truncate(level + 1);
            path[level].index += 1;
            let child = page.nodes[path[level].index].child()?;
            drop(page);
            descend_leftmost_from(txn, path, child)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Step to the previous entry, crossing leaves. Returns false (path
/// untouched) when there is none.
pub(crate) fn retreat(txn: &Transaction<'_>, path: &mut Path) -> Result<bool> {
    if path.is_empty() {
        return Ok(false);
    }
    let leaf_level = path.len() - 1;
    if path[leaf_level].index > 0 {
        path[leaf_level].index -= 1;
        return Ok(true);
    }
    let mut level = leaf_level;
    while level > 0 {
        level -= 1;
        let page = txn.get_page(path[level].pgno)?;
        if path[level].index > 0 {
            path.truncate(level + 1);
            path[level].index -= 1;
            let child = page.nodes[path[level].index].child()?;
            drop(page);
            descend_rightmost_from(txn, path, child)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Walk a path back to the first entry of a duplicate run.
fn run_start(txn: &Transaction<'_>, slot: &DbiSlot, path: &mut Path, key: &[u8]) -> Result<()> {
    loop {
        let mut probe = path.clone();
        if !retreat(txn, &mut probe)? {
            return Ok(());
        }
        match raw_entry(txn, &probe)? {
            Some((k, _)) if slot.key_cmp.compare(&k, key) == Ordering::Equal => *path = probe,
            _ => return Ok(()),
        }
    }
}

/// If the previous entry of `path` (whose leaf index must be 0) carries this
/// key, move the path onto it and back to the start of its duplicate run.
/// Deleting the tail of a run that once spanned leaves can leave its head in
/// the leaf before the one descent lands on.
fn back_into_run(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    path: &mut Path,
    key: &[u8],
) -> Result<bool> {
    let mut probe = path.clone();
    if !retreat(txn, &mut probe)? {
        return Ok(false);
    }
    match raw_entry(txn, &probe)? {
        Some((k, _)) if slot.key_cmp.compare(&k, key) == Ordering::Equal => {
            *path = probe;
            run_start(txn, slot, path, key)?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Position at the leftmost entry whose key equals `key`, or None.
pub(crate) fn position_key(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    info: &DbInfo,
    key: &[u8],
) -> Result<Option<Path>> {
    let Some(mut path) = descend_to_leaf(txn, slot, info, key)? else {
        return Ok(None);
    };
    let dupsort = slot.flags.contains(DbFlags::DUPSORT);
    let leaf_level = path.len() - 1;
    let leaf = txn.get_page(path[leaf_level].pgno)?;
    match leaf.search(key, slot.key_cmp.as_ref()) {
        SearchResult::Found(index) => {
            drop(leaf);
            path[leaf_level].index = index;
            if index == 0 && dupsort {
                run_start(txn, slot, &mut path, key)?;
            }
            Ok(Some(path))
        }
        SearchResult::Missing(0) if dupsort => {
            drop(leaf);
            path[leaf_level].index = 0;
            if back_into_run(txn, slot, &mut path, key)? {
                Ok(Some(path))
            } else {
                Ok(None)
            }
        }
        SearchResult::Missing(_) => Ok(None),
    }
}

/// Position at the first entry with key >= `key` (leftmost duplicate first),
/// or None when every entry sorts before it.
pub(crate) fn lower_bound_key(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    info: &DbInfo,
    key: &[u8],
) -> Result<Option<Path>> {
    let Some(mut path) = descend_to_leaf(txn, slot, info, key)? else {
        return Ok(None);
    };
    let dupsort = slot.flags.contains(DbFlags::DUPSORT);
    let leaf_level = path.len() - 1;
    let leaf = txn.get_page(path[leaf_level].pgno)?;
    match leaf.search(key, slot.key_cmp.as_ref()) {
        SearchResult::Found(index) => {
            drop(leaf);
            path[leaf_level].index = index;
            if index == 0 && dupsort {
                run_start(txn, slot, &mut path, key)?;
            }
            Ok(Some(path))
        }
        SearchResult::Missing(index) if index < leaf.nodes.len() => {
            drop(leaf);
            path[leaf_level].index = index;
            if index == 0 && dupsort && back_into_run(txn, slot, &mut path, key)? {
                return Ok(Some(path));
            }
            Ok(Some(path))
        }
        SearchResult::Missing(index) => {
            drop(leaf);
            path[leaf_level].index = index.saturating_sub(1);
            if index == 0 && dupsort {
                let mut run = path.clone();
                run[leaf_level].index = 0;
                if back_into_run(txn, slot, &mut run, key)? {
                    return Ok(Some(run));
                }
            }
            if advance(txn, &mut path)? {
                Ok(Some(path))
            } else {
                Ok(None)
            }
        }
    }
}

/// Position at the first entry >= the (key, value) pair of a DUPSORT
/// database, or None when every entry sorts before it.
pub(crate) fn lower_bound_pair(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    info: &DbInfo,
    key: &[u8],
    value: &[u8],
) -> Result<Option<Path>> {
    let Some(mut path) = lower_bound_key(txn, slot, info, key)? else {
        return Ok(None);
    };
    loop {
        let Some((k, node)) = raw_entry(txn, &path)? else {
            return Ok(None);
        };
        if slot.key_cmp.compare(&k, key) != Ordering::Equal {
            return Ok(Some(path));
        }
        match slot.dup_cmp.compare(&node.value, value) {
            Ordering::Less => {
                if !advance(txn, &mut path)? {
                    return Ok(None);
                }
            }
            _ => return Ok(Some(path)),
        }
    }
}

/// Position at the exact (key, value) pair of a DUPSORT database, or None.
pub(crate) fn position_pair(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    info: &DbInfo,
    key: &[u8],
    value: &[u8],
) -> Result<Option<Path>> {
    let Some(mut path) = position_key(txn, slot, info, key)? else {
        return Ok(None);
    };
    loop {
        let Some((k, node)) = raw_entry(txn, &path)? else {
            return Ok(None);
        };
        if slot.key_cmp.compare(&k, key) != Ordering::Equal {
            return Ok(None);
        }
        match slot.dup_cmp.compare(&node.value, value) {
            Ordering::Less => {
                if !advance(txn, &mut path)? {
                    return Ok(None);
                }
            }
            Ordering::Equal => return Ok(Some(path)),
            Ordering::Greater => return Ok(None),
        }
    }
}

// Read operations

/// Point lookup. For DUPSORT databases this returns the first duplicate.
pub(crate) fn search(txn: &Transaction<'_>, dbi: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
    txn.ensure_active()?;
    validate_key(key)?;
    let slot = txn.env().dbi_slot(dbi)?;
    let info = txn.db_info(dbi)?;
    match position_key(txn, &slot, &info, key)? {
        Some(path) => match raw_entry(txn, &path)? {
            Some((_, node)) => node_value(txn, &node).map(Some),
            None => Ok(None),
        },
        None => Ok(None),
    }
}

/// First entry of a tree in key order, with its value resolved.
pub(crate) fn first_entry(txn: &Transaction<'_>, dbi: usize) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let info = txn.db_info(dbi)?;
    let path = descend_edge(txn, &info, true)?;
    current_entry(txn, &path)
}

// Write operations

/// Insert or overwrite one key/value pair.
pub(crate) fn insert(
    txn: &Transaction<'_>,
    dbi: usize,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    match insert_impl(txn, dbi, key, value, flags) {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_fatal(&e) {
                txn.mark_broken();
            }
            Err(e)
        }
    }
}

fn insert_impl(
    txn: &Transaction<'_>,
    dbi: usize,
    key: &[u8],
    value: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    txn.ensure_write()?;
    validate_key(key)?;
    let slot = txn.env().dbi_slot(dbi)?;
    validate_value(&slot, value)?;
    let dupsort = slot.flags.contains(DbFlags::DUPSORT);
    let mut info = txn.db_info(dbi)?;

    if flags.contains(WriteFlags::APPEND) {
        let edge = descend_edge(txn, &info, false)?;
        if let Some((last, _)) = raw_entry(txn, &edge)? {
            if slot.key_cmp.compare(key, &last) != Ordering::Greater {
                return Err(Error::KeyMismatch);
            }
        }
    }

    if info.root == 0 {
        let pgno = txn.alloc_run(1)?;
        let mut page = Page::new(pgno, PageFlags::LEAF);
        let node = make_leaf_node(txn, &mut info, key, value)?;
        page.nodes.push(node);
        txn.put_dirty(page);
        info.root = pgno;
        info.depth = 1;
        info.leaf_pages += 1;
        info.entries += 1;
        txn.set_db_info(dbi, info);
        txn.bump_version();
        return Ok(());
    }

    let mut overwrite = false;
    let mut path;
    if dupsort {
        match position_key(txn, &slot, &info, key)? {
            Some(run) => {
                if flags.contains(WriteFlags::NOOVERWRITE) {
                    return Err(Error::KeyExist);
                }
                path = run;
                // walk the run to the value-ordered position
                loop {
                    let Some((k, node)) = raw_entry(txn, &path)? else {
                        break;
                    };
                    if slot.key_cmp.compare(&k, key) != Ordering::Equal {
                        break;
                    }
                    match slot.dup_cmp.compare(&node.value, value) {
                        Ordering::Less => {
                            // Stepping past the run into the next leaf would
                            // put the new pair under a separator greater than
                            // its key; insert at the end of this leaf instead.
                            let before = path.clone();
                            let stay_here = if !advance(txn, &mut path)? {
                                true
                            } else if path[path.len() - 1].pgno != before[before.len() - 1].pgno {
                                match raw_entry(txn, &path)? {
                                    Some((k2, _)) => {
                                        slot.key_cmp.compare(&k2, key) != Ordering::Equal
                                    }
                                    None => true,
                                }
                            } else {
                                false
                            };
                            if stay_here {
                                path = before;
                                let last = path.len() - 1;
                                path[last].index += 1;
                                break;
                            }
                        }
                        Ordering::Equal => {
                            if flags.contains(WriteFlags::NODUPDATA) {
                                return Err(Error::KeyExist);
                            }
                            // identical pair under the comparators
                            return Ok(());
                        }
                        Ordering::Greater => break,
                    }
                }
            }
            None => {
                path = descend_to_leaf(txn, &slot, &info, key)?
                    .ok_or_else(|| Error::corrupted("tree root vanished"))?;
                let leaf_level = path.len() - 1;
                let leaf_rc = txn.get_page(path[leaf_level].pgno)?;
                let index = match leaf_rc.search(key, slot.key_cmp.as_ref()) {
                    SearchResult::Missing(index) => index,
                    SearchResult::Found(_) => {
                        return Err(Error::corrupted("key search disagrees with descent"))
                    }
                };
                drop(leaf_rc);
                path[leaf_level].index = index;
            }
        }
    } else {
        path = descend_to_leaf(txn, &slot, &info, key)?
            .ok_or_else(|| Error::corrupted("tree root vanished"))?;
        let leaf_level = path.len() - 1;
        let leaf_rc = txn.get_page(path[leaf_level].pgno)?;
        let found = leaf_rc.search(key, slot.key_cmp.as_ref());
        drop(leaf_rc);
        match found {
            SearchResult::Found(index) => {
                if flags.contains(WriteFlags::NOOVERWRITE) {
                    return Err(Error::KeyExist);
                }
                path[leaf_level].index = index;
                overwrite = true;
            }
            SearchResult::Missing(index) => {
                path[leaf_level].index = index;
            }
        }
    }

    let mut pages = cow_pages(txn, &path)?;
    let leaf_index = path[path.len() - 1].index;
    {
        let leaf = pages.last_mut().ok_or_else(|| Error::corrupted("empty cow path"))?;
        if overwrite {
            let old = leaf.nodes[leaf_index].clone();
            let reused = if old.is_bigdata() && !fits_inline(key.len(), value.len()) {
                let (start, _) = old.overflow_ref()?;
                txn.replace_overflow(start, value)
            } else {
                false
            };
            let new_node = if reused {
                Node::bigdata(key.to_vec(), old.overflow_ref()?.0, value.len() as u64)
            } else {
                drop_node_value(txn, &mut info, &old)?;
                make_leaf_node(txn, &mut info, key, value)?
            };
            leaf.nodes[leaf_index] = new_node;
        } else {
            let node = make_leaf_node(txn, &mut info, key, value)?;
            leaf.nodes.insert(leaf_index, node);
        }
    }

    // unwind, splitting where a page overflowed
    let mut carry: Option<(Vec<u8>, u64)> = None;
    let mut root_pgno = 0;
    let mut level = pages.len();
    while let Some(mut page) = pages.pop() {
        level -= 1;
        if let Some((sep, right)) = carry.take() {
            page.nodes.insert(path[level].index + 1, Node::branch(sep, right));
        }
        if page.used() > PAGE_SIZE {
            carry = Some(split_page(txn, &mut info, &mut page)?);
        }
        root_pgno = page.pgno;
        txn.put_dirty(page);
    }
    if let Some((sep, right)) = carry {
        let new_root_pgno = txn.alloc_run(1)?;
        let mut new_root = Page::new(new_root_pgno, PageFlags::BRANCH);
        new_root.nodes.push(Node::branch(Vec::new(), root_pgno));
        new_root.nodes.push(Node::branch(sep, right));
        txn.put_dirty(new_root);
        info.branch_pages += 1;
        info.depth += 1;
        root_pgno = new_root_pgno;
    }
    info.root = root_pgno;
    if !overwrite {
        info.entries += 1;
    }
    txn.set_db_info(dbi, info);
    txn.bump_version();
    Ok(())
}

/// Delete a key (all duplicates) or one exact (key, value) pair.
pub(crate) fn delete(
    txn: &Transaction<'_>,
    dbi: usize,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<()> {
    match delete_impl(txn, dbi, key, value) {
        Ok(()) => Ok(()),
        Err(e) => {
            if is_fatal(&e) {
                txn.mark_broken();
            }
            Err(e)
        }
    }
}

fn delete_impl(
    txn: &Transaction<'_>,
    dbi: usize,
    key: &[u8],
    value: Option<&[u8]>,
) -> Result<()> {
    txn.ensure_write()?;
    validate_key(key)?;
    let slot = txn.env().dbi_slot(dbi)?;
    let dupsort = slot.flags.contains(DbFlags::DUPSORT);
    let mut info = txn.db_info(dbi)?;
    if info.root == 0 {
        return Err(Error::NotFound);
    }

    match value {
        Some(v) if dupsort => {
            let Some(path) = position_pair(txn, &slot, &info, key, v)? else {
                return Err(Error::NotFound);
            };
            remove_at(txn, &slot, &mut info, &path)?;
        }
        _ => {
            let mut removed = false;
            loop {
                let Some(path) = position_key(txn, &slot, &info, key)? else {
                    break;
                };
                remove_at(txn, &slot, &mut info, &path)?;
                removed = true;
                if !dupsort || info.root == 0 {
                    break;
                }
            }
            if !removed {
                return Err(Error::NotFound);
            }
        }
    }
    txn.set_db_info(dbi, info);
    txn.bump_version();
    Ok(())
}

/// Free every page of a tree, resetting its info to empty.
pub(crate) fn clear_tree(txn: &Transaction<'_>, dbi: usize) -> Result<()> {
    txn.ensure_write()?;
    let mut info = txn.db_info(dbi)?;
    if info.root != 0 {
        let mut stack = vec![info.root];
        while let Some(pgno) = stack.pop() {
            let page = txn.get_page(pgno)?;
            if page.is_branch() {
                for node in &page.nodes {
                    stack.push(node.child()?);
                }
            } else {
                for node in &page.nodes {
                    if node.is_bigdata() {
                        let (start, len) = node.overflow_ref()?;
                        txn.free_overflow(start, len);
                    }
                }
            }
            drop(page);
            txn.free_page(pgno);
        }
    }
    info = DbInfo { flags: info.flags, ..DbInfo::default() };
    txn.set_db_info(dbi, info);
    txn.bump_version();
    Ok(())
}

// Structural helpers

/// Touch every page on a path and re-point each parent at its child's copy.
fn cow_pages(txn: &Transaction<'_>, path: &Path) -> Result<Vec<Page>> {
    let mut pages = Vec::with_capacity(path.len());
    for frame in path {
        pages.push(txn.touch_page(frame.pgno)?);
    }
    for i in 0..pages.len().saturating_sub(1) {
        let child = pages[i + 1].pgno;
        pages[i].nodes[path[i].index].set_child(child);
    }
    Ok(pages)
}

fn underflowed(page: &Page) -> bool {
    if page.is_branch() {
        page.nodes.len() < 2 || page.used() < FILL_THRESHOLD
    } else {
        page.nodes.is_empty() || page.used() < FILL_THRESHOLD
    }
}

/// Split an over-full page, returning the separator and the new right page.
fn split_page(txn: &Transaction<'_>, info: &mut DbInfo, page: &mut Page) -> Result<(Vec<u8>, u64)> {
    let limit = PAGE_SIZE - PAGE_HDR_SIZE;
    let total: usize = page.nodes.iter().map(|n| SLOT_SIZE + n.size()).sum();
    let mut best: Option<(usize, usize)> = None;
    let mut acc = 0usize;
    for i in 0..page.nodes.len() - 1 {
        acc += SLOT_SIZE + page.nodes[i].size();
        let right = total - acc;
        if acc <= limit && right <= limit {
            let balance = acc.abs_diff(total / 2);
            if best.map_or(true, |(_, b)| balance < b) {
                best = Some((i + 1, balance));
            }
        }
    }
    let (split_at, _) =
        best.ok_or_else(|| Error::corrupted(format!("page {}: no valid split point", page.pgno)))?;

    let right_nodes = page.nodes.split_off(split_at);
    let right_pgno = txn.alloc_run(1)?;
    let mut right = Page::new(right_pgno, page.flags);
    right.nodes = right_nodes;
    let sep = if right.is_branch() {
        std::mem::take(&mut right.nodes[0].key)
    } else {
        right.nodes[0].key.clone()
    };
    if right.is_branch() {
        info.branch_pages += 1;
    } else {
        info.leaf_pages += 1;
    }
    txn.put_dirty(right);
    Ok((sep, right_pgno))
}

/// Remove the entry a path points at, rebalancing up the path.
fn remove_at(
    txn: &Transaction<'_>,
    slot: &DbiSlot,
    info: &mut DbInfo,
    path: &Path,
) -> Result<()> {
    let mut pages = cow_pages(txn, path)?;
    let leaf_index = path[path.len() - 1].index;

    let mut child_underflow = {
        let leaf = pages.last_mut().ok_or_else(|| Error::corrupted("empty cow path"))?;
        if leaf_index >= leaf.nodes.len() {
            return Err(Error::corrupted("delete position out of range"));
        }
        let node = leaf.nodes.remove(leaf_index);
        drop_node_value(txn, info, &node)?;
        underflowed(leaf)
    };
    let mut root_pgno = pages[0].pgno;
    let leaf = pages.pop().ok_or_else(|| Error::corrupted("empty cow path"))?;
    if pages.is_empty() {
        root_pgno = leaf.pgno;
    }
    txn.put_dirty(leaf);

    let mut level = pages.len();
    while let Some(mut page) = pages.pop() {
        level -= 1;
        if child_underflow {
            rebalance_child(txn, slot, info, &mut page, path[level].index)?;
        }
        child_underflow = underflowed(&page);
        root_pgno = page.pgno;
        txn.put_dirty(page);
    }
    info.root = root_pgno;

    // shrink the root while it is trivial
    loop {
        if info.root == 0 {
            break;
        }
        let page = txn.get_page(info.root)?;
        if page.is_branch() && page.nodes.len() == 1 {
            let child = page.nodes[0].child()?;
            drop(page);
            txn.free_page(info.root);
            info.branch_pages = info.branch_pages.saturating_sub(1);
            info.depth = info.depth.saturating_sub(1);
            info.root = child;
            continue;
        }
        if page.is_leaf() && page.nodes.is_empty() {
            drop(page);
            txn.free_page(info.root);
            info.leaf_pages = info.leaf_pages.saturating_sub(1);
            info.depth = 0;
            info.root = 0;
        }
        break;
    }
    info.entries = info.entries.saturating_sub(1);
    Ok(())
}

/// Merge or rebalance the underflowed child at `idx` with a sibling.
fn rebalance_child(
    txn: &Transaction<'_>,
    _slot: &DbiSlot,
    info: &mut DbInfo,
    parent: &mut Page,
    idx: usize,
) -> Result<()> {
    if parent.nodes.len() < 2 {
        // a lone child is handled by root shrinking
        return Ok(());
    }
    let (li, ri) = if idx > 0 { (idx - 1, idx) } else { (idx, idx + 1) };
    let left_pgno = parent.nodes[li].child()?;
    let right_pgno = parent.nodes[ri].child()?;
    let sep = parent.nodes[ri].key.clone();

    let left_rc = txn.get_page(left_pgno)?;
    let right_rc = txn.get_page(right_pgno)?;
    let sep_cost = if right_rc.is_branch() { sep.len() } else { 0 };
    if left_rc.used() + right_rc.used() - PAGE_HDR_SIZE + sep_cost <= PAGE_SIZE {
        // merge right into left
        let mut right_nodes = right_rc.nodes.clone();
        let right_is_branch = right_rc.is_branch();
        drop(right_rc);
        drop(left_rc);
        let mut left = txn.touch_page(left_pgno)?;
        parent.nodes[li].set_child(left.pgno);
        if right_is_branch {
            if let Some(first) = right_nodes.first_mut() {
                first.key = sep;
            }
        }
        left.nodes.extend(right_nodes);
        if left.is_branch() {
            info.branch_pages = info.branch_pages.saturating_sub(1);
        } else {
            info.leaf_pages = info.leaf_pages.saturating_sub(1);
        }
        txn.free_page(right_pgno);
        parent.nodes.remove(ri);
        txn.put_dirty(left);
        return Ok(());
    }
    drop(left_rc);
    drop(right_rc);

    // move one boundary node from the fuller sibling
    let mut left = txn.touch_page(left_pgno)?;
    let mut right = txn.touch_page(right_pgno)?;
    parent.nodes[li].set_child(left.pgno);
    parent.nodes[ri].set_child(right.pgno);
    let from_left = left.used() > right.used();
    if left.is_branch() {
        if from_left {
            let donor = left
                .nodes
                .pop()
                .ok_or_else(|| Error::corrupted("empty branch during rebalance"))?;
            let first = right
                .nodes
                .first_mut()
                .ok_or_else(|| Error::corrupted("empty branch during rebalance"))?;
            first.key = sep;
            let donor_child = donor.child()?;
            parent.nodes[ri].key = donor.key;
            right.nodes.insert(0, Node::branch(Vec::new(), donor_child));
        } else {
            if right.nodes.len() < 2 {
                return Err(Error::corrupted("branch too small to donate"));
            }
            let sentinel = right.nodes.remove(0);
            left.nodes.push(Node::branch(sep, sentinel.child()?));
            parent.nodes[ri].key = right.nodes[0].key.clone();
            right.nodes[0].key = Vec::new();
        }
    } else if from_left {
        let donor = left
            .nodes
            .pop()
            .ok_or_else(|| Error::corrupted("empty leaf during rebalance"))?;
        parent.nodes[ri].key = donor.key.clone();
        right.nodes.insert(0, donor);
    } else {
        if right.nodes.len() < 2 {
            return Err(Error::corrupted("leaf too small to donate"));
        }
        let donor = right.nodes.remove(0);
        left.nodes.push(donor);
        parent.nodes[ri].key = right.nodes[0].key.clone();
    }
    txn.put_dirty(left);
    txn.put_dirty(right);
    Ok(())
}
