//! arbordb: an embedded, transactional key-value store.
//!
//! A single memory-mapped file holds copy-on-write B+trees reached through
//! two alternating meta pages, so a commit is one flush plus one meta-slot
//! write and a crash can only ever land on the previous commit. Any number of
//! read transactions run concurrently against their own snapshots while at
//! most one write transaction stages changes; named sub-databases with
//! independent orderings live inside the same file.
//!
//! ```
//! use arbordb::{Database, Environment, EnvFlags, DbFlags, WriteFlags};
//!
//! # fn main() -> arbordb::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let env = Environment::new()
//!     .set_map_size(1 << 22)
//!     .open(dir.path().join("data.adb"), EnvFlags::empty())?;
//!
//! let txn = env.begin_txn()?;
//! let db = Database::open(&txn, None, DbFlags::empty())?;
//! db.put(&txn, b"greeting", b"hello", WriteFlags::empty())?;
//! txn.commit()?;
//!
//! let txn = env.begin_ro_txn()?;
//! assert_eq!(db.get(&txn, b"greeting")?.as_deref(), Some(&b"hello"[..]));
//! # Ok(())
//! # }
//! ```

mod btree;
mod comparator;
mod constants;
mod cursor;
mod database;
mod env;
mod error;
mod freelist;
mod meta;
mod page;
mod transaction;

pub use comparator::{Comparator, LexicographicComparator, ReverseComparator};
pub use constants::{DbFlags, EnvFlags, WriteFlags, MAX_DUP_SIZE, MAX_KEY_SIZE, PAGE_SIZE};
pub use cursor::Cursor;
pub use database::Database;
pub use env::{EnvBuilder, EnvInfo, Environment, ReaderInfo};
pub use error::{Error, Result};
pub use meta::Stat;
pub use transaction::Transaction;
