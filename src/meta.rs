//! Meta pages: the durable root-pointer slots.
//!
//! Pages 0 and 1 each hold a serialized [`MetaHeader`]. A commit writes the
//! slot its transaction id selects (`txn_id % 2`), so the previously published
//! header survives intact; on open the slot with the higher transaction id and
//! a valid checksum wins.

use crate::constants::{MAGIC, PAGE_SIZE, VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH};
use crate::error::{Error, Result};

/// Combined on-disk version number
pub(crate) const VERSION: u32 = VERSION_MAJOR << 24 | VERSION_MINOR << 16 | VERSION_PATCH;

/// Per-database bookkeeping stored in the meta page (core databases) or the
/// catalog (named databases).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DbInfo {
    /// Persistent database flags
    pub flags: u32,
    /// Depth of the B-tree, 0 when empty
    pub depth: u16,
    /// Number of branch pages
    pub branch_pages: u64,
    /// Number of leaf pages
    pub leaf_pages: u64,
    /// Number of overflow pages
    pub overflow_pages: u64,
    /// Number of data entries
    pub entries: u64,
    /// Root page number, 0 when empty
    pub root: u64,
}

/// Serialized size of a DbInfo block
pub(crate) const DB_INFO_SIZE: usize = 48;

impl DbInfo {
    pub fn encode(&self) -> [u8; DB_INFO_SIZE] {
        let mut buf = [0u8; DB_INFO_SIZE];
        buf[0..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..6].copy_from_slice(&self.depth.to_le_bytes());
        buf[8..16].copy_from_slice(&self.branch_pages.to_le_bytes());
        buf[16..24].copy_from_slice(&self.leaf_pages.to_le_bytes());
        buf[24..32].copy_from_slice(&self.overflow_pages.to_le_bytes());
        buf[32..40].copy_from_slice(&self.entries.to_le_bytes());
        buf[40..48].copy_from_slice(&self.root.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<DbInfo> {
        if buf.len() != DB_INFO_SIZE {
            return Err(Error::Incompatible);
        }
        Ok(DbInfo {
            flags: u32::from_le_bytes(buf[0..4].try_into().map_err(|_| Error::Invalid)?),
            depth: u16::from_le_bytes([buf[4], buf[5]]),
            branch_pages: u64::from_le_bytes(buf[8..16].try_into().map_err(|_| Error::Invalid)?),
            leaf_pages: u64::from_le_bytes(buf[16..24].try_into().map_err(|_| Error::Invalid)?),
            overflow_pages: u64::from_le_bytes(buf[24..32].try_into().map_err(|_| Error::Invalid)?),
            entries: u64::from_le_bytes(buf[32..40].try_into().map_err(|_| Error::Invalid)?),
            root: u64::from_le_bytes(buf[40..48].try_into().map_err(|_| Error::Invalid)?),
        })
    }
}

/// The durable header published by a commit.
#[derive(Debug, Clone)]
pub(crate) struct MetaHeader {
    /// Magic number identifying arbordb files
    pub magic: u32,
    /// Version number
    pub version: u32,
    /// Page size this file was written with
    pub page_size: u32,
    /// Persistent environment flags
    pub flags: u32,
    /// Size of the mmap region at commit time
    pub mapsize: u64,
    /// Last used page in the data file
    pub last_pgno: u64,
    /// Transaction id that committed this header
    pub txn_id: u64,
    /// Freelist database bookkeeping
    pub free_db: DbInfo,
    /// Main (catalog) database bookkeeping
    pub main_db: DbInfo,
}

/// Bytes of a meta header covered by the checksum
const META_BODY: usize = 40 + 2 * DB_INFO_SIZE;

impl MetaHeader {
    pub fn initial(mapsize: u64) -> MetaHeader {
        MetaHeader {
            magic: MAGIC,
            version: VERSION,
            page_size: PAGE_SIZE as u32,
            flags: 0,
            mapsize,
            last_pgno: 1,
            txn_id: 0,
            free_db: DbInfo::default(),
            main_db: DbInfo::default(),
        }
    }

    /// Serialize into the head of a meta page, checksummed.
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= META_BODY + 4);
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.mapsize.to_le_bytes());
        buf[24..32].copy_from_slice(&self.last_pgno.to_le_bytes());
        buf[32..40].copy_from_slice(&self.txn_id.to_le_bytes());
        buf[40..40 + DB_INFO_SIZE].copy_from_slice(&self.free_db.encode());
        buf[40 + DB_INFO_SIZE..META_BODY].copy_from_slice(&self.main_db.encode());
        let crc = crc32fast::hash(&buf[..META_BODY]);
        buf[META_BODY..META_BODY + 4].copy_from_slice(&crc.to_le_bytes());
    }

    /// Decode and validate one meta slot.
    pub fn decode(buf: &[u8]) -> Result<MetaHeader> {
        if buf.len() < META_BODY + 4 {
            return Err(Error::Invalid);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().map_err(|_| Error::Invalid)?);
        if magic != MAGIC {
            return Err(Error::Invalid);
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().map_err(|_| Error::Invalid)?);
        if version != VERSION {
            return Err(Error::VersionMismatch);
        }
        let stored_crc =
            u32::from_le_bytes(buf[META_BODY..META_BODY + 4].try_into().map_err(|_| Error::Invalid)?);
        if crc32fast::hash(&buf[..META_BODY]) != stored_crc {
            return Err(Error::corrupted("meta page checksum mismatch"));
        }
        let page_size = u32::from_le_bytes(buf[8..12].try_into().map_err(|_| Error::Invalid)?);
        if page_size as usize != PAGE_SIZE {
            return Err(Error::Invalid);
        }
        Ok(MetaHeader {
            magic,
            version,
            page_size,
            flags: u32::from_le_bytes(buf[12..16].try_into().map_err(|_| Error::Invalid)?),
            mapsize: u64::from_le_bytes(buf[16..24].try_into().map_err(|_| Error::Invalid)?),
            last_pgno: u64::from_le_bytes(buf[24..32].try_into().map_err(|_| Error::Invalid)?),
            txn_id: u64::from_le_bytes(buf[32..40].try_into().map_err(|_| Error::Invalid)?),
            free_db: DbInfo::decode(&buf[40..40 + DB_INFO_SIZE])?,
            main_db: DbInfo::decode(&buf[40 + DB_INFO_SIZE..META_BODY])?,
        })
    }
}

/// Pick the live meta slot: the valid header with the higher transaction id.
pub(crate) fn choose_meta(
    slot0: Result<MetaHeader>,
    slot1: Result<MetaHeader>,
) -> Result<(MetaHeader, usize)> {
    match (slot0, slot1) {
        (Ok(m0), Ok(m1)) => {
            if m1.txn_id > m0.txn_id {
                Ok((m1, 1))
            } else {
                Ok((m0, 0))
            }
        }
        (Ok(m0), Err(_)) => Ok((m0, 0)),
        (Err(_), Ok(m1)) => Ok((m1, 1)),
        (Err(e), Err(_)) => Err(e),
    }
}

/// Statistics for a database, in the shape callers see.
#[derive(Debug, Clone, Default)]
pub struct Stat {
    /// Size of a database page
    pub psize: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: usize,
    /// Number of leaf pages
    pub leaf_pages: usize,
    /// Number of overflow pages
    pub overflow_pages: usize,
    /// Number of data entries
    pub entries: usize,
}

impl Stat {
    pub(crate) fn from_info(info: &DbInfo) -> Stat {
        Stat {
            psize: PAGE_SIZE as u32,
            depth: info.depth as u32,
            branch_pages: info.branch_pages as usize,
            leaf_pages: info.leaf_pages as usize,
            overflow_pages: info.overflow_pages as usize,
            entries: info.entries as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_encode_decode_round_trip() {
        let mut meta = MetaHeader::initial(1 << 20);
        meta.txn_id = 9;
        meta.last_pgno = 17;
        meta.main_db.root = 5;
        meta.main_db.entries = 3;
        let mut buf = vec![0u8; PAGE_SIZE];
        meta.encode(&mut buf);
        let back = MetaHeader::decode(&buf).unwrap();
        assert_eq!(back.txn_id, 9);
        assert_eq!(back.last_pgno, 17);
        assert_eq!(back.main_db.root, 5);
        assert_eq!(back.main_db.entries, 3);
    }

    #[test]
    fn decode_rejects_bad_checksum() {
        let meta = MetaHeader::initial(1 << 20);
        let mut buf = vec![0u8; PAGE_SIZE];
        meta.encode(&mut buf);
        buf[24] ^= 0xff;
        assert!(matches!(MetaHeader::decode(&buf), Err(Error::Corrupted { .. })));
    }

    #[test]
    fn decode_rejects_foreign_magic() {
        let buf = vec![0u8; PAGE_SIZE];
        assert!(matches!(MetaHeader::decode(&buf), Err(Error::Invalid)));
    }

    #[test]
    fn newer_valid_slot_wins() {
        let mut m0 = MetaHeader::initial(1 << 20);
        m0.txn_id = 4;
        let mut m1 = MetaHeader::initial(1 << 20);
        m1.txn_id = 5;
        let (chosen, idx) = choose_meta(Ok(m0.clone()), Ok(m1)).unwrap();
        assert_eq!((chosen.txn_id, idx), (5, 1));
        let (chosen, idx) = choose_meta(Ok(m0), Err(Error::Invalid)).unwrap();
        assert_eq!((chosen.txn_id, idx), (4, 0));
    }
}
