use std::cell::{Cell, RefCell};
use std::cmp::Ordering;

use crate::btree::{self, Path};
use crate::constants::{DbFlags, WriteFlags};
use crate::env::DbiSlot;
use crate::error::{Error, Result};
use crate::transaction::Transaction;

/// Where the cursor currently stands.
enum Pos {
    /// Never positioned
    Unset,
    /// On an entry, as a root-to-leaf path
    On(Path),
    /// Ran off the high end
    EofFwd,
    /// Ran off the low end
    EofBack,
}

struct CursorState {
    pos: Pos,
    /// Key (and duplicate value, under DUPSORT) of the current entry, used to
    /// re-establish the position after the transaction mutates the tree.
    saved: Option<(Vec<u8>, Option<Vec<u8>>)>,
    seen_version: u64,
}

/// A stateful, positioned iterator over one database, bound to one
/// transaction.
///
/// Movement past either end yields `Ok(None)` rather than an error. The
/// borrow on the transaction means a cursor cannot outlive it; a closed or
/// never-positioned cursor fails with [`Error::CursorInvalid`] where a
/// position is required.
pub struct Cursor<'txn> {
    txn: &'txn Transaction<'txn>,
    dbi: usize,
    slot: DbiSlot,
    closed: Cell<bool>,
    state: RefCell<CursorState>,
}

impl<'txn> Cursor<'txn> {
    pub(crate) fn new(txn: &'txn Transaction<'txn>, dbi: usize) -> Result<Cursor<'txn>> {
        txn.ensure_active()?;
        let slot = txn.env().dbi_slot(dbi)?;
        txn.db_info(dbi)?;
        Ok(Cursor {
            txn,
            dbi,
            slot,
            closed: Cell::new(false),
            state: RefCell::new(CursorState {
                pos: Pos::Unset,
                saved: None,
                seen_version: txn.mutation_version(),
            }),
        })
    }

    fn check(&self) -> Result<()> {
        if self.closed.get() {
            return Err(Error::CursorInvalid);
        }
        self.txn.ensure_active()
    }

    fn dupsort(&self) -> bool {
        self.slot.flags.contains(DbFlags::DUPSORT)
    }

    /// Re-establish the position after the transaction mutated the tree
    /// underneath us: the saved entry (or its successor) becomes current.
    fn refresh(&self, st: &mut CursorState) -> Result<()> {
        if st.seen_version == self.txn.mutation_version() {
            return Ok(());
        }
        st.seen_version = self.txn.mutation_version();
        if !matches!(st.pos, Pos::On(_)) {
            return Ok(());
        }
        let Some((key, dup)) = st.saved.clone() else {
            st.pos = Pos::Unset;
            return Ok(());
        };
        let info = self.txn.db_info(self.dbi)?;
        let path = match &dup {
            Some(value) => btree::lower_bound_pair(self.txn, &self.slot, &info, &key, value)?,
            None => btree::lower_bound_key(self.txn, &self.slot, &info, &key)?,
        };
        st.pos = match path {
            Some(p) => Pos::On(p),
            None => Pos::EofFwd,
        };
        Ok(())
    }

    fn remember(&self, st: &mut CursorState) -> Result<()> {
        if let Pos::On(path) = &st.pos {
            if let Some((key, node)) = btree::raw_entry(self.txn, path)? {
                let dup = if self.dupsort() { Some(node.value.clone()) } else { None };
                st.saved = Some((key, dup));
                return Ok(());
            }
        }
        st.saved = None;
        Ok(())
    }

    fn settle(
        &self,
        st: &mut CursorState,
        path: Option<Path>,
        forward: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match path {
            Some(path) => match btree::current_entry(self.txn, &path)? {
                Some(entry) => {
                    st.pos = Pos::On(path);
                    self.remember(st)?;
                    Ok(Some(entry))
                }
                None => {
                    st.pos = if forward { Pos::EofFwd } else { Pos::EofBack };
                    st.saved = None;
                    Ok(None)
                }
            },
            None => {
                st.pos = if forward { Pos::EofFwd } else { Pos::EofBack };
                st.saved = None;
                Ok(None)
            }
        }
    }

    fn move_to_edge(
        &self,
        st: &mut CursorState,
        first: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        st.seen_version = self.txn.mutation_version();
        let info = self.txn.db_info(self.dbi)?;
        let path = btree::descend_edge(self.txn, &info, first)?;
        let path = if path.is_empty() { None } else { Some(path) };
        self.settle(st, path, first)
    }

    /// Position at the first entry.
    pub fn first(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.move_to_edge(&mut st, true)
    }

    /// Position at the last entry.
    pub fn last(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.move_to_edge(&mut st, false)
    }

    /// Step to the next entry. An unpositioned cursor starts at the first.
    pub fn next(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.refresh(&mut st)?;
        match std::mem::replace(&mut st.pos, Pos::Unset) {
            Pos::Unset | Pos::EofBack => self.move_to_edge(&mut st, true),
            Pos::EofFwd => {
                st.pos = Pos::EofFwd;
                Ok(None)
            }
            Pos::On(mut path) => {
                if btree::advance(self.txn, &mut path)? {
                    self.settle(&mut st, Some(path), true)
                } else {
                    st.pos = Pos::EofFwd;
                    st.saved = None;
                    Ok(None)
                }
            }
        }
    }

    /// Step to the previous entry. An unpositioned cursor starts at the last.
    pub fn prev(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.refresh(&mut st)?;
        match std::mem::replace(&mut st.pos, Pos::Unset) {
            Pos::Unset | Pos::EofFwd => self.move_to_edge(&mut st, false),
            Pos::EofBack => {
                st.pos = Pos::EofBack;
                Ok(None)
            }
            Pos::On(mut path) => {
                if btree::retreat(self.txn, &mut path)? {
                    self.settle(&mut st, Some(path), false)
                } else {
                    st.pos = Pos::EofBack;
                    st.saved = None;
                    Ok(None)
                }
            }
        }
    }

    /// Position at an exact key (its first duplicate under DUPSORT).
    pub fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        st.seen_version = self.txn.mutation_version();
        let info = self.txn.db_info(self.dbi)?;
        match btree::position_key(self.txn, &self.slot, &info, key)? {
            Some(path) => self.settle(&mut st, Some(path), true),
            None => {
                st.pos = Pos::Unset;
                st.saved = None;
                Ok(None)
            }
        }
    }

    /// Position at the first entry with key >= `key`.
    pub fn seek_range(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        st.seen_version = self.txn.mutation_version();
        let info = self.txn.db_info(self.dbi)?;
        let path = btree::lower_bound_key(self.txn, &self.slot, &info, key)?;
        self.settle(&mut st, path, true)
    }

    /// Position at an exact (key, value) pair of a DUPSORT database.
    pub fn seek_pair(&self, key: &[u8], value: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        if !self.dupsort() {
            return Err(Error::Incompatible);
        }
        let mut st = self.state.borrow_mut();
        st.seen_version = self.txn.mutation_version();
        let info = self.txn.db_info(self.dbi)?;
        match btree::position_pair(self.txn, &self.slot, &info, key, value)? {
            Some(path) => self.settle(&mut st, Some(path), true),
            None => {
                st.pos = Pos::Unset;
                st.saved = None;
                Ok(None)
            }
        }
    }

    /// The entry the cursor stands on; `Ok(None)` after running off an end.
    pub fn get_current(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.refresh(&mut st)?;
        match &st.pos {
            Pos::On(path) => btree::current_entry(self.txn, path),
            Pos::EofFwd | Pos::EofBack => Ok(None),
            Pos::Unset => Err(Error::CursorInvalid),
        }
    }

    /// Step to the next duplicate of the current key; `Ok(None)` (cursor
    /// unmoved) when the run is exhausted.
    pub fn next_dup(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        if !self.dupsort() {
            return Ok(None);
        }
        let mut st = self.state.borrow_mut();
        self.refresh(&mut st)?;
        let Pos::On(path) = &st.pos else {
            return Err(Error::CursorInvalid);
        };
        let Some((current_key, _)) = btree::raw_entry(self.txn, path)? else {
            return Err(Error::CursorInvalid);
        };
        let mut probe = path.clone();
        if !btree::advance(self.txn, &mut probe)? {
            return Ok(None);
        }
        match btree::raw_entry(self.txn, &probe)? {
            Some((key, _)) if self.slot.key_cmp.compare(&key, &current_key) == Ordering::Equal => {
                self.settle(&mut st, Some(probe), true)
            }
            _ => Ok(None),
        }
    }

    /// Step to the first duplicate of the next distinct key.
    pub fn next_nodup(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.refresh(&mut st)?;
        let Pos::On(path) = &st.pos else {
            drop(st);
            return self.next();
        };
        let Some((current_key, _)) = btree::raw_entry(self.txn, path)? else {
            return Err(Error::CursorInvalid);
        };
        let mut probe = path.clone();
        loop {
            if !btree::advance(self.txn, &mut probe)? {
                st.pos = Pos::EofFwd;
                st.saved = None;
                return Ok(None);
            }
            match btree::raw_entry(self.txn, &probe)? {
                Some((key, _))
                    if self.slot.key_cmp.compare(&key, &current_key) != Ordering::Equal =>
                {
                    return self.settle(&mut st, Some(probe), true);
                }
                Some(_) => continue,
                None => {
                    st.pos = Pos::EofFwd;
                    st.saved = None;
                    return Ok(None);
                }
            }
        }
    }

    /// Store a pair through the cursor and leave it positioned on the written
    /// entry.
    pub fn put(&self, key: &[u8], value: &[u8], flags: WriteFlags) -> Result<()> {
        self.check()?;
        btree::insert(self.txn, self.dbi, key, value, flags)?;
        let mut st = self.state.borrow_mut();
        st.seen_version = self.txn.mutation_version();
        let info = self.txn.db_info(self.dbi)?;
        let path = if self.dupsort() {
            btree::position_pair(self.txn, &self.slot, &info, key, value)?
        } else {
            btree::position_key(self.txn, &self.slot, &info, key)?
        };
        match path {
            Some(path) => {
                st.pos = Pos::On(path);
                self.remember(&mut st)?;
            }
            None => {
                st.pos = Pos::Unset;
                st.saved = None;
            }
        }
        Ok(())
    }

    /// Delete the entry the cursor stands on, leaving it positioned on the
    /// next remaining entry.
    pub fn del(&self) -> Result<()> {
        self.check()?;
        let mut st = self.state.borrow_mut();
        self.refresh(&mut st)?;
        let Pos::On(path) = &st.pos else {
            return Err(Error::CursorInvalid);
        };
        let Some((key, node)) = btree::raw_entry(self.txn, path)? else {
            return Err(Error::CursorInvalid);
        };
        let dup = if self.dupsort() { Some(node.value.clone()) } else { None };
        btree::delete(self.txn, self.dbi, &key, dup.as_deref())?;
        st.seen_version = self.txn.mutation_version();
        let info = self.txn.db_info(self.dbi)?;
        let path = match &dup {
            Some(value) => btree::lower_bound_pair(self.txn, &self.slot, &info, &key, value)?,
            None => btree::lower_bound_key(self.txn, &self.slot, &info, &key)?,
        };
        match path {
            Some(path) => {
                st.pos = Pos::On(path);
                self.remember(&mut st)?;
            }
            None => {
                st.pos = Pos::EofFwd;
                st.saved = None;
            }
        }
        Ok(())
    }

    /// Close the cursor; any further use fails with
    /// [`Error::CursorInvalid`].
    pub fn close(&self) {
        self.closed.set(true);
    }
}
