use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::MutexGuard;

use log::{debug, trace};

use crate::btree;
use crate::constants::{
    EnvFlags, WriteFlags, CORE_DBS, FREE_DBI, MAIN_DBI, META_PAGES, PAGE_HDR_SIZE, PAGE_SIZE,
};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::freelist::{decode_ids, encode_ids, IdList};
use crate::meta::{DbInfo, MetaHeader};
use crate::page::{self, Page};

/// Ids per freelist entry; sized so entries always stay inline in a leaf.
const FREE_CHUNK_IDS: usize = 248;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    Aborted,
}

enum TxnKind<'env> {
    Read,
    /// The guard is the exclusive writer slot; child transactions run under
    /// their root's guard and hold none themselves.
    Write { _guard: Option<MutexGuard<'env, ()>> },
}

/// The write transaction's working set, or a read transaction's page cache.
#[derive(Default, Clone)]
struct TxnInner {
    /// Copy-on-write pages staged by this transaction
    dirty: HashMap<u64, Rc<Page>>,
    /// Overflow chains staged by this transaction, keyed by start page
    dirty_overflow: HashMap<u64, Rc<Vec<u8>>>,
    /// Clean pages parsed from the map
    read_cache: HashMap<u64, Rc<Page>>,
    /// Working copies of per-database bookkeeping, indexed by dbi
    dbs: Vec<Option<DbInfo>>,
    db_dirty: Vec<bool>,
    /// Reclaimed pages available for allocation right now
    free_pool: IdList,
    /// Pages unreferenced by this version but possibly visible to older
    /// snapshots; saved to the freelist database at commit
    pending_free: Vec<u64>,
    /// Pages newly allocated by this transaction
    allocated: IdList,
    /// Next page to allocate from the end of the file
    next_pgno: u64,
}

impl TxnInner {
    fn ensure_dbi(&mut self, dbi: usize) {
        if dbi >= self.dbs.len() {
            self.dbs.resize(dbi + 1, None);
            self.db_dirty.resize(dbi + 1, false);
        }
    }
}

/// A transaction against an [`Environment`].
///
/// Read transactions observe the commit that was current when they began, for
/// their whole lifetime. At most one write transaction is live at a time; its
/// changes become visible atomically at commit. Dropping an active
/// transaction aborts it.
pub struct Transaction<'env> {
    env: &'env Environment,
    id: u64,
    snapshot: MetaHeader,
    kind: TxnKind<'env>,
    parent: Option<&'env Transaction<'env>>,
    state: Cell<TxnState>,
    has_child: Cell<bool>,
    broken: Cell<bool>,
    reader_slot: Cell<Option<usize>>,
    version: Cell<u64>,
    inner: RefCell<TxnInner>,
}

impl<'env> Transaction<'env> {
    /// Begin a read-only transaction. The reader registers itself before its
    /// snapshot is confirmed so page reclamation can never outrun it.
    pub(crate) fn begin_read(env: &'env Environment) -> Result<Transaction<'env>> {
        let (snapshot, slot) = loop {
            let (meta, _) = env.snapshot();
            let slot = env.register_reader(meta.txn_id)?;
            let (confirm, _) = env.snapshot();
            if confirm.txn_id == meta.txn_id {
                break (meta, slot);
            }
            env.release_reader(slot);
        };
        trace!("begin read transaction at snapshot {}", snapshot.txn_id);
        let mut inner = TxnInner { next_pgno: snapshot.last_pgno + 1, ..TxnInner::default() };
        inner.dbs = vec![Some(snapshot.free_db), Some(snapshot.main_db)];
        inner.db_dirty = vec![false; CORE_DBS];
        Ok(Transaction {
            env,
            id: snapshot.txn_id,
            snapshot,
            kind: TxnKind::Read,
            parent: None,
            state: Cell::new(TxnState::Active),
            has_child: Cell::new(false),
            broken: Cell::new(false),
            reader_slot: Cell::new(Some(slot)),
            version: Cell::new(0),
            inner: RefCell::new(inner),
        })
    }

    /// Begin the single write transaction, blocking on the writer slot or
    /// failing with [`Error::WriterBusy`] when `block` is false.
    pub(crate) fn begin_write(env: &'env Environment, block: bool) -> Result<Transaction<'env>> {
        if env.is_readonly() {
            return Err(Error::EnvReadOnly);
        }
        let guard = if block { env.lock_writer() } else { env.try_lock_writer()? };
        let (snapshot, _) = env.snapshot();
        let id = snapshot.txn_id + 1;
        let mut inner = TxnInner { next_pgno: snapshot.last_pgno + 1, ..TxnInner::default() };
        inner.dbs = vec![Some(snapshot.free_db), Some(snapshot.main_db)];
        inner.db_dirty = vec![false; CORE_DBS];
        let txn = Transaction {
            env,
            id,
            snapshot,
            kind: TxnKind::Write { _guard: Some(guard) },
            parent: None,
            state: Cell::new(TxnState::Active),
            has_child: Cell::new(false),
            broken: Cell::new(false),
            reader_slot: Cell::new(None),
            version: Cell::new(0),
            inner: RefCell::new(inner),
        };
        debug!("begin write transaction {}", id);
        txn.reclaim()?;
        Ok(txn)
    }

    /// Begin a nested write transaction. The parent is unusable until the
    /// child commits or aborts; only the outermost commit reaches storage.
    pub fn begin_child(&self) -> Result<Transaction<'_>> {
        self.ensure_write()?;
        let inner = self.inner.borrow().clone();
        self.has_child.set(true);
        trace!("begin child of write transaction {}", self.id);
        Ok(Transaction {
            env: self.env,
            id: self.id,
            snapshot: self.snapshot.clone(),
            kind: TxnKind::Write { _guard: None },
            parent: Some(self),
            state: Cell::new(TxnState::Active),
            has_child: Cell::new(false),
            broken: Cell::new(false),
            reader_slot: Cell::new(None),
            version: Cell::new(self.version.get()),
            inner: RefCell::new(inner),
        })
    }

    /// Transaction id: the snapshot id for readers, the id this transaction
    /// will commit as for writers.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_readonly(&self) -> bool {
        matches!(self.kind, TxnKind::Read)
    }

    pub(crate) fn is_write(&self) -> bool {
        !self.is_readonly()
    }

    pub(crate) fn env(&self) -> &'env Environment {
        self.env
    }

    pub(crate) fn snapshot_meta(&self) -> &MetaHeader {
        &self.snapshot
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state.get() != TxnState::Active || self.broken.get() {
            return Err(Error::TxnInvalid);
        }
        if self.has_child.get() {
            return Err(Error::TxnHasChild);
        }
        Ok(())
    }

    /// Poison the transaction after a mutation failed part-way; the working
    /// set may be inconsistent, so it can only be aborted.
    pub(crate) fn mark_broken(&self) {
        if self.is_write() {
            self.broken.set(true);
        }
    }

    pub(crate) fn ensure_write(&self) -> Result<()> {
        self.ensure_active()?;
        if !self.is_write() {
            return Err(Error::TxnReadOnly);
        }
        Ok(())
    }

    /// Counter bumped on every mutation; cursors use it to notice staleness.
    pub(crate) fn mutation_version(&self) -> u64 {
        self.version.get()
    }

    pub(crate) fn bump_version(&self) {
        self.version.set(self.version.get() + 1);
    }

    // Page access

    /// Fetch a page: this transaction's dirty copy if it has one, otherwise
    /// the committed page from the map.
    pub(crate) fn get_page(&self, pgno: u64) -> Result<Rc<Page>> {
        {
            let inner = self.inner.borrow();
            if pgno < META_PAGES as u64 || pgno >= inner.next_pgno {
                return Err(Error::PageNotFound(pgno));
            }
            if let Some(p) = inner.dirty.get(&pgno) {
                return Ok(p.clone());
            }
            if let Some(p) = inner.read_cache.get(&pgno) {
                return Ok(p.clone());
            }
        }
        let bytes = self.env.page_bytes(pgno)?;
        let parsed = Rc::new(Page::parse(&bytes, pgno)?);
        let mut inner = self.inner.borrow_mut();
        if inner.read_cache.len() >= 1024 {
            inner.read_cache.clear();
        }
        inner.read_cache.insert(pgno, parsed.clone());
        Ok(parsed)
    }

    /// Take a page out for mutation. A page this transaction already staged
    /// keeps its number; a committed page is copied to a fresh number and the
    /// old one is queued for freeing.
    pub(crate) fn touch_page(&self, pgno: u64) -> Result<Page> {
        self.ensure_write()?;
        {
            let mut inner = self.inner.borrow_mut();
            if let Some(rc) = inner.dirty.remove(&pgno) {
                return Ok(Rc::try_unwrap(rc).unwrap_or_else(|rc| (*rc).clone()));
            }
        }
        let rc = self.get_page(pgno)?;
        let mut copy = (*rc).clone();
        drop(rc);
        let new_pgno = self.alloc_run(1)?;
        self.note_free(pgno);
        self.inner.borrow_mut().read_cache.remove(&pgno);
        copy.pgno = new_pgno;
        trace!("cow page {} -> {}", pgno, new_pgno);
        Ok(copy)
    }

    /// Stage a page back into the working set.
    pub(crate) fn put_dirty(&self, page: Page) {
        self.inner.borrow_mut().dirty.insert(page.pgno, Rc::new(page));
    }

    /// Allocate `count` consecutive pages, preferring reclaimed pages.
    pub(crate) fn alloc_run(&self, count: usize) -> Result<u64> {
        self.ensure_write()?;
        let mut inner = self.inner.borrow_mut();
        if let Some(start) = inner.free_pool.take_run(count) {
            for p in start..start + count as u64 {
                inner.allocated.insert(p);
            }
            return Ok(start);
        }
        let start = inner.next_pgno;
        let end = start + count as u64;
        if end as usize * PAGE_SIZE > self.env.map_size() {
            return Err(Error::MapFull);
        }
        inner.next_pgno = end;
        for p in start..end {
            inner.allocated.insert(p);
        }
        Ok(start)
    }

    fn note_free(&self, pgno: u64) {
        let mut inner = self.inner.borrow_mut();
        if inner.allocated.remove(pgno) {
            inner.free_pool.insert(pgno);
        } else {
            inner.pending_free.push(pgno);
        }
    }

    /// Release a tree page this version no longer references.
    pub(crate) fn free_page(&self, pgno: u64) {
        {
            let mut inner = self.inner.borrow_mut();
            inner.dirty.remove(&pgno);
            inner.read_cache.remove(&pgno);
        }
        self.note_free(pgno);
    }

    // Overflow chains

    /// Stage a value too large for a leaf node into an overflow chain.
    pub(crate) fn write_overflow(&self, data: &[u8]) -> Result<(u64, usize)> {
        let npages = page::overflow_pages(data.len());
        let start = self.alloc_run(npages)?;
        self.inner
            .borrow_mut()
            .dirty_overflow
            .insert(start, Rc::new(data.to_vec()));
        Ok((start, npages))
    }

    /// Read an overflow value staged here or committed in the map.
    pub(crate) fn read_overflow(&self, start: u64, len: u64) -> Result<Vec<u8>> {
        {
            let inner = self.inner.borrow();
            if let Some(data) = inner.dirty_overflow.get(&start) {
                if data.len() as u64 != len {
                    return Err(Error::corrupted("overflow chain length mismatch"));
                }
                return Ok(data.as_ref().clone());
            }
        }
        let header = self.env.page_bytes(start)?;
        let npages = page::parse_overflow_header(&header, start)?;
        if npages as usize != page::overflow_pages(len as usize) {
            return Err(Error::corrupted("overflow chain length mismatch"));
        }
        self.env
            .file_bytes(start as usize * PAGE_SIZE + PAGE_HDR_SIZE, len as usize)
    }

    /// If this transaction staged the chain itself, replace its bytes in
    /// place (same pages). Returns false when the chain is not ours to reuse.
    pub(crate) fn replace_overflow(&self, start: u64, data: &[u8]) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.dirty_overflow.get_mut(&start) {
            Some(existing)
                if page::overflow_pages(existing.len()) == page::overflow_pages(data.len()) =>
            {
                *existing = Rc::new(data.to_vec());
                true
            }
            _ => false,
        }
    }

    /// Release an overflow chain.
    pub(crate) fn free_overflow(&self, start: u64, len: u64) {
        let npages = page::overflow_pages(len as usize);
        self.inner.borrow_mut().dirty_overflow.remove(&start);
        for p in start..start + npages as u64 {
            self.note_free(p);
        }
    }

    // Database bookkeeping

    /// Working copy of a database's info, resolving named databases through
    /// the catalog on first use.
    pub(crate) fn db_info(&self, dbi: usize) -> Result<DbInfo> {
        {
            let inner = self.inner.borrow();
            if let Some(Some(info)) = inner.dbs.get(dbi) {
                return Ok(*info);
            }
        }
        let slot = self.env.dbi_slot(dbi)?;
        let name = slot.name.ok_or(Error::BadDbi)?;
        let value = btree::search(self, MAIN_DBI, name.as_bytes())?.ok_or(Error::BadDbi)?;
        let info = DbInfo::decode(&value)?;
        let mut inner = self.inner.borrow_mut();
        inner.ensure_dbi(dbi);
        inner.dbs[dbi] = Some(info);
        Ok(info)
    }

    pub(crate) fn set_db_info(&self, dbi: usize, info: DbInfo) {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_dbi(dbi);
        inner.dbs[dbi] = Some(info);
        inner.db_dirty[dbi] = true;
    }

    /// Seed a named database's info without marking it dirty (plain open).
    pub(crate) fn seed_db_info(&self, dbi: usize, info: DbInfo) {
        let mut inner = self.inner.borrow_mut();
        inner.ensure_dbi(dbi);
        inner.dbs[dbi] = Some(info);
    }

    /// Forget a database's working state entirely (after deleting it), so
    /// commit does not write its info back into the catalog.
    pub(crate) fn forget_db(&self, dbi: usize) {
        let mut inner = self.inner.borrow_mut();
        if dbi < inner.dbs.len() {
            inner.dbs[dbi] = None;
            inner.db_dirty[dbi] = false;
        }
    }

    // Lifecycle

    /// Commit the transaction.
    ///
    /// For the root write transaction this folds the freed-page bookkeeping
    /// into the freelist database, writes the staged pages through the map,
    /// flushes them, and only then publishes the new meta header in the
    /// inactive slot. A failure anywhere leaves the previous commit intact.
    pub fn commit(self) -> Result<()> {
        self.ensure_active()?;

        if self.is_readonly() {
            if let Some(slot) = self.reader_slot.take() {
                self.env.release_reader(slot);
            }
            self.state.set(TxnState::Committed);
            return Ok(());
        }

        if let Some(parent) = self.parent {
            let inner = self.inner.replace(TxnInner::default());
            *parent.inner.borrow_mut() = inner;
            parent.version.set(self.version.get() + 1);
            parent.has_child.set(false);
            self.state.set(TxnState::Committed);
            trace!("folded child into write transaction {}", self.id);
            return Ok(());
        }

        let untouched = {
            let inner = self.inner.borrow();
            inner.dirty.is_empty()
                && inner.dirty_overflow.is_empty()
                && inner.pending_free.is_empty()
                && inner.free_pool.is_empty()
                && !inner.db_dirty.iter().any(|d| *d)
        };
        if untouched {
            self.state.set(TxnState::Committed);
            return Ok(());
        }

        self.write_named_db_infos()?;
        self.save_freelist()?;
        let (flush_offset, flush_len) = self.write_dirty_pages()?;
        if !self.env.env_flags().contains(EnvFlags::NOSYNC) && flush_len > 0 {
            self.env.flush_data_range(flush_offset, flush_len)?;
        }

        let meta = {
            let inner = self.inner.borrow();
            MetaHeader {
                magic: self.snapshot.magic,
                version: self.snapshot.version,
                page_size: self.snapshot.page_size,
                flags: self.snapshot.flags,
                mapsize: self.env.map_size() as u64,
                last_pgno: inner.next_pgno - 1,
                txn_id: self.id,
                free_db: inner.dbs[FREE_DBI].unwrap_or(self.snapshot.free_db),
                main_db: inner.dbs[MAIN_DBI].unwrap_or(self.snapshot.main_db),
            }
        };
        let slot = (self.id % 2) as usize;
        self.env.write_meta(slot, &meta)?;
        self.env.publish(meta, slot);
        self.state.set(TxnState::Committed);
        debug!("committed write transaction {}", self.id);
        Ok(())
    }

    /// Abort the transaction, discarding its working set.
    pub fn abort(self) {
        // Drop performs the cleanup.
    }

    /// Write changed named-database bookkeeping back into the catalog.
    fn write_named_db_infos(&self) -> Result<()> {
        let updates: Vec<(usize, DbInfo)> = {
            let inner = self.inner.borrow();
            inner
                .dbs
                .iter()
                .enumerate()
                .skip(CORE_DBS)
                .filter_map(|(dbi, info)| match info {
                    Some(info) if inner.db_dirty.get(dbi).copied().unwrap_or(false) => {
                        Some((dbi, *info))
                    }
                    _ => None,
                })
                .collect()
        };
        for (dbi, info) in updates {
            let slot = self.env.dbi_slot(dbi)?;
            let name = slot.name.ok_or(Error::BadDbi)?;
            btree::insert(
                self,
                MAIN_DBI,
                name.as_bytes(),
                &info.encode(),
                WriteFlags::empty(),
            )?;
        }
        Ok(())
    }

    /// Pull reclaimable entries out of the freelist database into the free
    /// pool. An entry is reclaimable once no live reader's snapshot predates
    /// the transaction that freed its pages.
    fn reclaim(&self) -> Result<()> {
        let limit = self.env.oldest_reader().unwrap_or(u64::MAX);
        loop {
            let Some((key, value)) = btree::first_entry(self, FREE_DBI)? else {
                break;
            };
            if key.len() != 16 {
                return Err(Error::corrupted("freelist key has unexpected length"));
            }
            let freed_by = u64::from_be_bytes(key[..8].try_into().map_err(|_| Error::Invalid)?);
            if freed_by > limit {
                break;
            }
            // make the pages allocatable first so deleting the entry itself
            // draws from them instead of growing the file
            let ids = decode_ids(&value)?;
            trace!("reclaimed {} pages freed by txn {}", ids.len(), freed_by);
            self.inner.borrow_mut().free_pool.extend(ids);
            btree::delete(self, FREE_DBI, &key, None)?;
        }
        Ok(())
    }

    /// Persist pages freed by this transaction (and any unused remainder of
    /// the free pool) under this transaction's id, looping until the writes
    /// themselves stop freeing pages.
    ///
    /// The free pool stays allocatable while the pending list is folded, so
    /// the freelist writes draw from it; only the unused remainder is parked
    /// in the entry at the end.
    fn save_freelist(&self) -> Result<()> {
        let mut acc = IdList::new();
        loop {
            let more = std::mem::take(&mut self.inner.borrow_mut().pending_free);
            if more.is_empty() {
                break;
            }
            acc.extend(more);
            self.write_freelist_chunks(&acc)?;
        }
        loop {
            let leftovers = {
                let mut inner = self.inner.borrow_mut();
                let mut v = std::mem::take(&mut inner.pending_free);
                v.extend(inner.free_pool.drain());
                v
            };
            if leftovers.is_empty() {
                break;
            }
            acc.extend(leftovers);
            self.write_freelist_chunks(&acc)?;
        }
        if !acc.is_empty() {
            trace!("saved {} freed pages under txn {}", acc.len(), self.id);
        }
        Ok(())
    }

    fn write_freelist_chunks(&self, acc: &IdList) -> Result<()> {
        for (seq, chunk) in acc.as_slice().chunks(FREE_CHUNK_IDS).enumerate() {
            let mut key = [0u8; 16];
            key[..8].copy_from_slice(&self.id.to_be_bytes());
            key[8..].copy_from_slice(&(seq as u64).to_be_bytes());
            btree::insert(self, FREE_DBI, &key, &encode_ids(chunk), WriteFlags::empty())?;
        }
        Ok(())
    }

    /// Serialize the working set into the map. Returns the byte range that
    /// needs flushing.
    fn write_dirty_pages(&self) -> Result<(usize, usize)> {
        let inner = self.inner.borrow();
        if inner.dirty.is_empty() && inner.dirty_overflow.is_empty() {
            return Ok((0, 0));
        }
        let mut lo = usize::MAX;
        let mut hi = 0usize;
        self.env.with_map_mut(|bytes| {
            for (&pgno, page) in &inner.dirty {
                let offset = pgno as usize * PAGE_SIZE;
                page.serialize(&mut bytes[offset..offset + PAGE_SIZE])?;
                lo = lo.min(offset);
                hi = hi.max(offset + PAGE_SIZE);
            }
            for (&start, data) in &inner.dirty_overflow {
                let npages = page::overflow_pages(data.len());
                let offset = start as usize * PAGE_SIZE;
                let end = offset + npages * PAGE_SIZE;
                bytes[offset..end].fill(0);
                page::write_overflow_header(&mut bytes[offset..offset + PAGE_HDR_SIZE], start, npages as u32);
                bytes[offset + PAGE_HDR_SIZE..offset + PAGE_HDR_SIZE + data.len()]
                    .copy_from_slice(data);
                lo = lo.min(offset);
                hi = hi.max(end);
            }
            Ok(())
        })?;
        Ok((lo, hi - lo))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state.get() != TxnState::Active {
            return;
        }
        self.state.set(TxnState::Aborted);
        if let Some(slot) = self.reader_slot.take() {
            self.env.release_reader(slot);
        }
        if let Some(parent) = self.parent {
            parent.has_child.set(false);
        } else if self.is_write() {
            debug!("aborted write transaction {}", self.id);
        }
    }
}
