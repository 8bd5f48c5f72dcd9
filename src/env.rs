use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lazy_static::lazy_static;
use log::debug;
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::comparator::{dup_comparator, key_comparator, Comparator};
use crate::constants::{
    DbFlags, EnvFlags, CORE_DBS, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS, DEFAULT_MAX_READERS,
    META_PAGES, PAGE_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH,
};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::{choose_meta, MetaHeader, Stat};
use crate::transaction::Transaction;

lazy_static! {
    /// Flags that may still be toggled after the environment is open
    static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
}

fn rlock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn wlock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn mlock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|e| e.into_inner())
}

/// The mapping over the data file; read-only environments map without write
/// access.
enum Map {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::Ro(m) => m,
            Map::Rw(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Map::Ro(_) => Err(Error::EnvReadOnly),
            Map::Rw(m) => Ok(&mut m[..]),
        }
    }

    fn flush(&self) -> Result<()> {
        if let Map::Rw(m) = self {
            m.flush()?;
        }
        Ok(())
    }

    fn flush_async(&self) -> Result<()> {
        if let Map::Rw(m) = self {
            m.flush_async()?;
        }
        Ok(())
    }

    fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if let Map::Rw(m) = self {
            m.flush_range(offset, len)?;
        }
        Ok(())
    }

    fn flush_async_range(&self, offset: usize, len: usize) -> Result<()> {
        if let Map::Rw(m) = self {
            m.flush_async_range(offset, len)?;
        }
        Ok(())
    }
}

/// The currently published commit.
struct EnvState {
    meta: MetaHeader,
    meta_index: usize,
}

/// One active read transaction.
struct ReaderSlot {
    pid: u32,
    txn_id: u64,
}

/// An active reader, as reported by [`Environment::reader_list`].
#[derive(Debug, Clone)]
pub struct ReaderInfo {
    /// Process id that owns the reader
    pub pid: u32,
    /// Snapshot transaction id the reader observes
    pub txn_id: u64,
}

/// In-memory registry entry for an open database handle.
#[derive(Clone)]
pub(crate) struct DbiSlot {
    pub name: Option<String>,
    pub flags: DbFlags,
    pub key_cmp: Arc<dyn Comparator>,
    pub dup_cmp: Arc<dyn Comparator>,
}

impl DbiSlot {
    pub(crate) fn new(name: Option<String>, flags: DbFlags) -> DbiSlot {
        DbiSlot {
            name,
            flags,
            key_cmp: key_comparator(flags),
            dup_cmp: dup_comparator(flags),
        }
    }
}

/// Environment information, in the shape callers see.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    /// Size of the memory map
    pub mapsize: usize,
    /// Last used page number
    pub last_pgno: usize,
    /// Id of the last committed transaction
    pub last_txnid: usize,
    /// Maximum number of reader slots
    pub max_readers: u32,
    /// Number of reader slots currently in use
    pub num_readers: u32,
}

/// Configuration collected before the environment is opened.
#[derive(Debug, Clone)]
pub struct EnvBuilder {
    map_size: usize,
    max_dbs: usize,
    max_readers: usize,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        EnvBuilder {
            map_size: DEFAULT_MAP_SIZE,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

impl EnvBuilder {
    /// Set the size of the memory map, the hard ceiling on database growth.
    /// Rounded up to a page multiple.
    pub fn set_map_size(mut self, size: usize) -> EnvBuilder {
        self.map_size = size;
        self
    }

    /// Set the maximum number of named databases.
    pub fn set_max_dbs(mut self, dbs: usize) -> EnvBuilder {
        self.max_dbs = dbs;
        self
    }

    /// Set the maximum number of concurrent read transactions.
    pub fn set_max_readers(mut self, readers: usize) -> EnvBuilder {
        self.max_readers = readers;
        self
    }

    /// Open or create the environment at `path` (a regular file).
    pub fn open<P: AsRef<Path>>(self, path: P, flags: EnvFlags) -> Result<Environment> {
        let path = path.as_ref().to_path_buf();
        let read_only = flags.contains(EnvFlags::RDONLY);
        let min_size = PAGE_SIZE * (META_PAGES + 1);
        let mut map_size = round_to_pages(self.map_size.max(min_size));

        let data_file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(&path)?;
        let file_size = data_file.metadata()?.len() as usize;

        let (map, meta, meta_index) = if file_size == 0 {
            if read_only {
                return Err(Error::Invalid);
            }
            data_file.set_len(map_size as u64)?;
            let mut mmap = unsafe { MmapOptions::new().len(map_size).map_mut(&data_file)? };
            let meta = MetaHeader::initial(map_size as u64);
            meta.encode(&mut mmap[0..PAGE_SIZE]);
            meta.encode(&mut mmap[PAGE_SIZE..META_PAGES * PAGE_SIZE]);
            mmap.flush()?;
            debug!("initialized new environment at {}", path.display());
            (Map::Rw(mmap), meta, 0)
        } else {
            if file_size < META_PAGES * PAGE_SIZE {
                return Err(Error::Invalid);
            }
            let probe = unsafe { MmapOptions::new().len(file_size).map(&data_file)? };
            let slot0 = MetaHeader::decode(&probe[0..PAGE_SIZE]);
            let slot1 = MetaHeader::decode(&probe[PAGE_SIZE..META_PAGES * PAGE_SIZE]);
            drop(probe);
            let (meta, meta_index) = choose_meta(slot0, slot1)?;
            map_size = map_size.max(meta.mapsize as usize);
            if read_only {
                map_size = file_size;
                let mmap = unsafe { MmapOptions::new().len(file_size).map(&data_file)? };
                (Map::Ro(mmap), meta, meta_index)
            } else {
                map_size = map_size.max(round_to_pages(file_size));
                if file_size < map_size {
                    data_file.set_len(map_size as u64)?;
                }
                let mmap = unsafe { MmapOptions::new().len(map_size).map_mut(&data_file)? };
                (Map::Rw(mmap), meta, meta_index)
            }
        };

        debug!(
            "opened environment at {} (txn {}, last page {})",
            path.display(),
            meta.txn_id,
            meta.last_pgno
        );

        let main_flags = DbFlags::from_bits_truncate(meta.main_db.flags);
        let mut dbis: Vec<Option<DbiSlot>> = Vec::with_capacity(CORE_DBS + self.max_dbs);
        dbis.push(Some(DbiSlot::new(None, DbFlags::empty())));
        dbis.push(Some(DbiSlot::new(None, main_flags)));

        Ok(Environment {
            path,
            flags,
            map_size,
            max_dbs: self.max_dbs,
            max_readers: self.max_readers,
            data_file,
            map: RwLock::new(map),
            state: RwLock::new(EnvState { meta, meta_index }),
            readers: Mutex::new(Vec::new()),
            writer: Mutex::new(()),
            dbis: Mutex::new(dbis),
        })
    }
}

fn round_to_pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// An open handle to a single memory-mapped storage file.
///
/// The environment owns the map, the published root pointer, the reader table
/// and the registry of open database handles. Any number of read transactions
/// and at most one write transaction may be live against it at a time.
pub struct Environment {
    path: PathBuf,
    flags: EnvFlags,
    map_size: usize,
    max_dbs: usize,
    max_readers: usize,
    #[allow(dead_code)]
    data_file: File,
    map: RwLock<Map>,
    state: RwLock<EnvState>,
    readers: Mutex<Vec<Option<ReaderSlot>>>,
    writer: Mutex<()>,
    dbis: Mutex<Vec<Option<DbiSlot>>>,
}

impl Environment {
    /// Start configuring a new environment.
    pub fn new() -> EnvBuilder {
        EnvBuilder::default()
    }

    /// Begin a write transaction, blocking until the writer slot is free.
    pub fn begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_write(self, true)
    }

    /// Begin a write transaction, failing with [`Error::WriterBusy`] if
    /// another write transaction is active.
    pub fn try_begin_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_write(self, false)
    }

    /// Begin a read-only transaction pinned to the current committed state.
    pub fn begin_ro_txn(&self) -> Result<Transaction<'_>> {
        Transaction::begin_read(self)
    }

    /// Flush buffered writes to durable storage.
    ///
    /// Commits already write data through the map; this forces the OS to
    /// persist it, which matters when the environment runs with NOSYNC.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.is_readonly() {
            return Err(Error::EnvReadOnly);
        }
        let map = rlock(&self.map);
        if force || !self.flags.contains(EnvFlags::NOSYNC) {
            map.flush()
        } else {
            map.flush_async()
        }
    }

    /// Path that was used to open the environment.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Statistics of the main database as of the last commit.
    pub fn stat(&self) -> Stat {
        Stat::from_info(&rlock(&self.state).meta.main_db)
    }

    /// Environment information as of the last commit.
    pub fn info(&self) -> EnvInfo {
        let state = rlock(&self.state);
        EnvInfo {
            mapsize: self.map_size,
            last_pgno: state.meta.last_pgno as usize,
            last_txnid: state.meta.txn_id as usize,
            max_readers: self.max_readers as u32,
            num_readers: mlock(&self.readers).iter().flatten().count() as u32,
        }
    }

    /// List the active read transactions.
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        mlock(&self.readers)
            .iter()
            .flatten()
            .map(|r| ReaderInfo { pid: r.pid, txn_id: r.txn_id })
            .collect()
    }

    /// Release the in-memory registry entry of a named database handle.
    /// Stored data is untouched.
    pub fn close_db(&self, db: Database) {
        let dbi = db.dbi();
        if dbi >= CORE_DBS {
            let mut dbis = mlock(&self.dbis);
            if dbi < dbis.len() {
                dbis[dbi] = None;
            }
        }
    }

    /// Copy the environment to `path` as a consistent hot backup, taken
    /// through a read transaction so concurrent commits don't tear it.
    pub fn copy<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let txn = self.begin_ro_txn()?;
        let meta = txn.snapshot_meta().clone();
        let mut dst = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let mut meta_buf = vec![0u8; PAGE_SIZE];
        meta.encode(&mut meta_buf);
        dst.write_all(&meta_buf)?;
        dst.write_all(&meta_buf)?;

        const CHUNK: usize = 1 << 20;
        let end = (meta.last_pgno as usize + 1) * PAGE_SIZE;
        let mut offset = META_PAGES * PAGE_SIZE;
        while offset < end {
            let len = CHUNK.min(end - offset);
            let bytes = self.file_bytes(offset, len)?;
            dst.write_all(&bytes)?;
            offset += len;
        }
        dst.sync_all()?;
        debug!("copied environment to {}", path.as_ref().display());
        Ok(())
    }

    /// Toggle runtime-changeable flags (NOSYNC, NOMETASYNC).
    pub fn set_flags(&mut self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::Incompatible);
        }
        if onoff {
            self.flags |= flags;
        } else {
            self.flags &= !flags;
        }
        Ok(())
    }

    pub fn get_flags(&self) -> EnvFlags {
        self.flags
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(EnvFlags::RDONLY)
    }

    pub fn get_max_dbs(&self) -> usize {
        self.max_dbs
    }

    pub fn get_max_readers(&self) -> usize {
        self.max_readers
    }

    /// Library version
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    pub fn version_string() -> String {
        format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    // Internal plumbing used by transactions and the B-tree.

    pub(crate) fn env_flags(&self) -> EnvFlags {
        self.flags
    }

    pub(crate) fn map_size(&self) -> usize {
        self.map_size
    }

    /// Snapshot the currently published meta header.
    pub(crate) fn snapshot(&self) -> (MetaHeader, usize) {
        let state = rlock(&self.state);
        (state.meta.clone(), state.meta_index)
    }

    /// Publish a freshly committed meta header.
    pub(crate) fn publish(&self, meta: MetaHeader, meta_index: usize) {
        let mut state = wlock(&self.state);
        state.meta = meta;
        state.meta_index = meta_index;
    }

    pub(crate) fn lock_writer(&self) -> MutexGuard<'_, ()> {
        mlock(&self.writer)
    }

    pub(crate) fn try_lock_writer(&self) -> Result<MutexGuard<'_, ()>> {
        match self.writer.try_lock() {
            Ok(guard) => Ok(guard),
            Err(std::sync::TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => Err(Error::WriterBusy),
        }
    }

    pub(crate) fn register_reader(&self, txn_id: u64) -> Result<usize> {
        let mut readers = mlock(&self.readers);
        let slot = ReaderSlot { pid: std::process::id(), txn_id };
        if let Some(idx) = readers.iter().position(Option::is_none) {
            readers[idx] = Some(slot);
            return Ok(idx);
        }
        if readers.len() >= self.max_readers {
            return Err(Error::ReadersFull);
        }
        readers.push(Some(slot));
        Ok(readers.len() - 1)
    }

    pub(crate) fn release_reader(&self, idx: usize) {
        let mut readers = mlock(&self.readers);
        if idx < readers.len() {
            readers[idx] = None;
        }
    }

    /// Snapshot id of the oldest active read transaction, if any.
    pub(crate) fn oldest_reader(&self) -> Option<u64> {
        mlock(&self.readers).iter().flatten().map(|r| r.txn_id).min()
    }

    /// Copy one page's bytes out of the map.
    pub(crate) fn page_bytes(&self, pgno: u64) -> Result<Vec<u8>> {
        let offset = pgno as usize * PAGE_SIZE;
        self.file_bytes(offset, PAGE_SIZE).map_err(|e| match e {
            Error::PageNotFound(_) => Error::PageNotFound(pgno),
            other => other,
        })
    }

    /// Copy an arbitrary byte range out of the map.
    pub(crate) fn file_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let map = rlock(&self.map);
        let bytes = map.bytes();
        let end = offset.checked_add(len).ok_or(Error::PageNotFound(0))?;
        if end > bytes.len() {
            return Err(Error::PageNotFound((offset / PAGE_SIZE) as u64));
        }
        Ok(bytes[offset..end].to_vec())
    }

    /// Run `f` with mutable access to the whole map. Write transactions use
    /// this at commit to lay down dirty pages.
    pub(crate) fn with_map_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        let mut map = wlock(&self.map);
        f(map.bytes_mut()?)
    }

    /// Flush a byte range of the map to storage.
    pub(crate) fn flush_data_range(&self, offset: usize, len: usize) -> Result<()> {
        rlock(&self.map).flush_range(offset, len)
    }

    /// Write one meta slot and flush it according to the sync flags.
    pub(crate) fn write_meta(&self, idx: usize, meta: &MetaHeader) -> Result<()> {
        let offset = idx * PAGE_SIZE;
        self.with_map_mut(|bytes| {
            meta.encode(&mut bytes[offset..offset + PAGE_SIZE]);
            Ok(())
        })?;
        if !self.flags.contains(EnvFlags::NOSYNC) {
            let map = rlock(&self.map);
            if self.flags.contains(EnvFlags::NOMETASYNC) {
                map.flush_async_range(offset, PAGE_SIZE)?;
            } else {
                map.flush_range(offset, PAGE_SIZE)?;
            }
        }
        Ok(())
    }

    pub(crate) fn dbi_slot(&self, dbi: usize) -> Result<DbiSlot> {
        mlock(&self.dbis)
            .get(dbi)
            .and_then(|slot| slot.clone())
            .ok_or(Error::BadDbi)
    }

    pub(crate) fn find_dbi(&self, name: &str) -> Option<(usize, DbiSlot)> {
        mlock(&self.dbis)
            .iter()
            .enumerate()
            .find_map(|(i, slot)| match slot {
                Some(s) if s.name.as_deref() == Some(name) => Some((i, s.clone())),
                _ => None,
            })
    }

    pub(crate) fn register_dbi(&self, slot: DbiSlot) -> Result<usize> {
        let mut dbis = mlock(&self.dbis);
        let open_named = dbis.iter().skip(CORE_DBS).flatten().count();
        if open_named >= self.max_dbs {
            return Err(Error::DbsFull);
        }
        if let Some(idx) = dbis.iter().skip(CORE_DBS).position(Option::is_none) {
            let idx = idx + CORE_DBS;
            dbis[idx] = Some(slot);
            return Ok(idx);
        }
        dbis.push(Some(slot));
        Ok(dbis.len() - 1)
    }

    /// Replace a registry entry, used when (re)configuring the main database
    /// handle through [`Database::open`].
    pub(crate) fn set_dbi_slot(&self, dbi: usize, slot: DbiSlot) {
        let mut dbis = mlock(&self.dbis);
        if dbi < dbis.len() {
            dbis[dbi] = Some(slot);
        }
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        debug!("closing environment at {}", self.path.display());
    }
}
