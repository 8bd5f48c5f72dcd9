use std::sync::Arc;

use log::debug;

use crate::btree;
use crate::comparator::Comparator;
use crate::constants::{
    DbFlags, WriteFlags, CORE_DBS, MAIN_DBI, MAX_KEY_SIZE, PERSISTENT_DB_FLAGS,
};
use crate::cursor::Cursor;
use crate::env::DbiSlot;
use crate::error::{Error, Result};
use crate::meta::{DbInfo, Stat};
use crate::transaction::Transaction;

/// A handle to a named sub-database, or to the unnamed main database.
///
/// The handle is a small integer resolved through the environment's registry;
/// each transaction resolves its own current root for it, so the same handle
/// is valid across transactions. Persistent flags and the comparator are
/// fixed when the database is first created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Database {
    dbi: usize,
}

impl Database {
    /// Open a database inside a transaction, creating it when
    /// [`DbFlags::CREATE`] is set. `None` opens the main database.
    pub fn open(txn: &Transaction<'_>, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        Self::open_inner(txn, name, flags, None)
    }

    /// Open a database with a caller-supplied key comparator.
    ///
    /// The comparator is fixed for the life of the handle; callers must
    /// supply the same ordering at every open of the same database.
    pub fn open_with_comparator(
        txn: &Transaction<'_>,
        name: Option<&str>,
        flags: DbFlags,
        comparator: Arc<dyn Comparator>,
    ) -> Result<Database> {
        Self::open_inner(txn, name, flags, Some(comparator))
    }

    fn open_inner(
        txn: &Transaction<'_>,
        name: Option<&str>,
        flags: DbFlags,
        comparator: Option<Arc<dyn Comparator>>,
    ) -> Result<Database> {
        txn.ensure_active()?;
        let env = txn.env();
        let persistent = flags & PERSISTENT_DB_FLAGS;

        let Some(name) = name else {
            // The main database's persistent flags may be chosen on first use
            // while it is still empty; afterwards they are as fixed as any
            // named database's.
            let mut info = txn.db_info(MAIN_DBI)?;
            let existing = DbFlags::from_bits_truncate(info.flags);
            if !persistent.is_empty() && persistent != existing {
                if info.root != 0 || existing != DbFlags::empty() {
                    return Err(Error::Incompatible);
                }
                txn.ensure_write()?;
                info.flags = persistent.bits();
                txn.set_db_info(MAIN_DBI, info);
                let mut slot = DbiSlot::new(None, persistent);
                if let Some(cmp) = comparator.clone() {
                    slot.key_cmp = cmp;
                }
                env.set_dbi_slot(MAIN_DBI, slot);
            } else if let Some(cmp) = comparator {
                let mut slot = DbiSlot::new(None, existing);
                slot.key_cmp = cmp;
                env.set_dbi_slot(MAIN_DBI, slot);
            }
            return Ok(Database { dbi: MAIN_DBI });
        };

        if name.is_empty() || name.len() > MAX_KEY_SIZE {
            return Err(Error::BadValSize);
        }
        // named databases live as catalog entries in the main B-tree
        let main_flags = DbFlags::from_bits_truncate(txn.db_info(MAIN_DBI)?.flags);
        if main_flags.contains(DbFlags::DUPSORT) {
            return Err(Error::Incompatible);
        }

        if let Some((dbi, slot)) = env.find_dbi(name) {
            if !persistent.is_empty() && persistent != slot.flags & PERSISTENT_DB_FLAGS {
                return Err(Error::Incompatible);
            }
            return Ok(Database { dbi });
        }

        match btree::search(txn, MAIN_DBI, name.as_bytes())? {
            Some(value) => {
                let info = DbInfo::decode(&value).map_err(|_| Error::Incompatible)?;
                let stored = DbFlags::from_bits_truncate(info.flags) & PERSISTENT_DB_FLAGS;
                if !persistent.is_empty() && persistent != stored {
                    return Err(Error::Incompatible);
                }
                let mut slot = DbiSlot::new(Some(name.to_string()), stored);
                if let Some(cmp) = comparator {
                    slot.key_cmp = cmp;
                }
                let dbi = env.register_dbi(slot)?;
                txn.seed_db_info(dbi, info);
                Ok(Database { dbi })
            }
            None => {
                if !flags.contains(DbFlags::CREATE) {
                    return Err(Error::NotFound);
                }
                txn.ensure_write()?;
                let info = DbInfo { flags: persistent.bits(), ..DbInfo::default() };
                let mut slot = DbiSlot::new(Some(name.to_string()), persistent);
                if let Some(cmp) = comparator {
                    slot.key_cmp = cmp;
                }
                let dbi = env.register_dbi(slot)?;
                txn.set_db_info(dbi, info);
                debug!("created database '{name}' as dbi {dbi}");
                Ok(Database { dbi })
            }
        }
    }

    /// The integer identifier backing this handle.
    pub fn dbi(&self) -> usize {
        self.dbi
    }

    /// Look up a key. Returns the first duplicate under DUPSORT.
    pub fn get(&self, txn: &Transaction<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        btree::search(txn, self.dbi, key)
    }

    /// Store a key/value pair.
    pub fn put(
        &self,
        txn: &Transaction<'_>,
        key: &[u8],
        value: &[u8],
        flags: WriteFlags,
    ) -> Result<()> {
        btree::insert(txn, self.dbi, key, value, flags)
    }

    /// Delete a key, or one exact (key, value) pair under DUPSORT. Fails with
    /// [`Error::NotFound`] when nothing matched.
    pub fn del(&self, txn: &Transaction<'_>, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        btree::delete(txn, self.dbi, key, value)
    }

    /// Open a cursor over this database.
    pub fn cursor<'txn>(&self, txn: &'txn Transaction<'txn>) -> Result<Cursor<'txn>> {
        Cursor::new(txn, self.dbi)
    }

    /// Statistics of this database as seen by `txn`.
    pub fn stat(&self, txn: &Transaction<'_>) -> Result<Stat> {
        txn.ensure_active()?;
        Ok(Stat::from_info(&txn.db_info(self.dbi)?))
    }

    /// Persistent flags of this database.
    pub fn flags(&self, txn: &Transaction<'_>) -> Result<DbFlags> {
        txn.ensure_active()?;
        let info = txn.db_info(self.dbi)?;
        Ok(DbFlags::from_bits_truncate(info.flags))
    }

    /// Empty the database; with `delete` also remove it from the catalog and
    /// release its handle. The main database can be emptied but not deleted.
    pub fn drop(&self, txn: &Transaction<'_>, delete: bool) -> Result<()> {
        txn.ensure_write()?;
        if delete && self.dbi < CORE_DBS {
            return Err(Error::Incompatible);
        }
        btree::clear_tree(txn, self.dbi)?;
        if delete {
            let slot = txn.env().dbi_slot(self.dbi)?;
            let name = slot.name.ok_or(Error::BadDbi)?;
            // a database created within this transaction has no catalog
            // entry yet
            match btree::delete(txn, MAIN_DBI, name.as_bytes(), None) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
            txn.forget_db(self.dbi);
            txn.env().close_db(*self);
            debug!("deleted database '{name}'");
        }
        Ok(())
    }
}
