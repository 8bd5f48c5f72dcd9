use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EnvFlags: u32 {
        /// Open the environment read-only
        const RDONLY = 0x20000;
        /// Don't flush data pages to disk on commit
        const NOSYNC = 0x10000;
        /// Flush data pages on commit but let the meta page trail behind
        const NOMETASYNC = 0x40000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DbFlags: u32 {
        /// Compare keys in reverse byte order
        const REVERSEKEY = 0x02;
        /// Allow duplicate values for a key, kept in sorted order
        const DUPSORT = 0x04;
        /// Compare duplicate values in reverse byte order
        const REVERSEDUP = 0x40;
        /// Create the named database if it does not exist
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteFlags: u32 {
        /// Fail with KeyExist instead of overwriting an existing key
        const NOOVERWRITE = 0x10;
        /// Fail with KeyExist if the exact key/value pair is already present
        const NODUPDATA = 0x20;
        /// Caller guarantees keys arrive in ascending order
        const APPEND = 0x20000;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u16 {
        const LEAF = 0x01;
        const OVERFLOW = 0x04;
        const META = 0x08;
        const BRANCH = 0x20;
    }
}

// Node flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeFlags: u16 {
        /// Value lives in an overflow chain, node stores (pgno, len)
        const BIGDATA = 0x01;
    }
}

impl Default for EnvFlags {
    fn default() -> Self {
        EnvFlags::empty()
    }
}

impl Default for DbFlags {
    fn default() -> Self {
        DbFlags::empty()
    }
}

impl Default for WriteFlags {
    fn default() -> Self {
        WriteFlags::empty()
    }
}

/// Database flags that are persisted in the catalog and fixed at creation.
pub(crate) const PERSISTENT_DB_FLAGS: DbFlags = DbFlags::REVERSEKEY
    .union(DbFlags::DUPSORT)
    .union(DbFlags::REVERSEDUP);

/// Size of a database page
pub const PAGE_SIZE: usize = 4096;
/// Serialized size of a page header
pub(crate) const PAGE_HDR_SIZE: usize = 16;
/// Serialized size of a node header
pub(crate) const NODE_HDR_SIZE: usize = 8;
/// Size of one slot-array entry
pub(crate) const SLOT_SIZE: usize = 2;
/// Magic number identifying arbordb files ("ARBR")
pub(crate) const MAGIC: u32 = 0x4152_4252;
/// Version numbers major
pub(crate) const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub(crate) const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub(crate) const VERSION_PATCH: u32 = 0;
/// Number of alternating meta pages at the start of the file
pub(crate) const META_PAGES: usize = 2;
/// Database identifiers reserved for the engine itself
pub(crate) const CORE_DBS: usize = 2;
/// Identifier of the internal freelist database
pub(crate) const FREE_DBI: usize = 0;
/// Identifier of the unnamed main database
pub(crate) const MAIN_DBI: usize = 1;

/// Default size of the memory map (16 MiB)
pub(crate) const DEFAULT_MAP_SIZE: usize = 1 << 24;
/// Default maximum number of named databases
pub(crate) const DEFAULT_MAX_DBS: usize = 16;
/// Default maximum number of concurrent read transactions
pub(crate) const DEFAULT_MAX_READERS: usize = 126;

/// Maximum size of a key in bytes
pub const MAX_KEY_SIZE: usize = 511;
/// Maximum size of a duplicate value under DUPSORT (values double as sort keys)
pub const MAX_DUP_SIZE: usize = 511;
/// Maximum size of a value in bytes
pub(crate) const MAX_VALUE_SIZE: usize = u32::MAX as usize;

/// Largest serialized node (header + key + value) that stays inline in a page.
/// Two maximal nodes plus the page header fill a page exactly.
pub(crate) const MAX_INLINE_ITEM: usize = (PAGE_SIZE - PAGE_HDR_SIZE) / 2 - SLOT_SIZE;

/// A page using less space than this is a candidate for merging
pub(crate) const FILL_THRESHOLD: usize = PAGE_SIZE / 4;
