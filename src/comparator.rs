use std::cmp::Ordering;
use std::sync::Arc;

use crate::constants::DbFlags;

/// A total order over key byte strings.
///
/// A comparator is attached to a database handle when the handle is first
/// opened and stays fixed for the life of that handle; keys that compare
/// equal are one logical key regardless of byte-level differences.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

impl<F> Comparator for F
where
    F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync,
{
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self(a, b)
    }
}

/// Byte-wise lexicographic order, the default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicographicComparator;

impl Comparator for LexicographicComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Compares keys from the last byte toward the first (REVERSEKEY order).
#[derive(Debug, Default, Clone, Copy)]
pub struct ReverseComparator;

impl Comparator for ReverseComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.iter().rev().cmp(b.iter().rev())
    }
}

/// Built-in key comparator selected by the database flags.
pub(crate) fn key_comparator(flags: DbFlags) -> Arc<dyn Comparator> {
    if flags.contains(DbFlags::REVERSEKEY) {
        Arc::new(ReverseComparator)
    } else {
        Arc::new(LexicographicComparator)
    }
}

/// Built-in duplicate-value comparator selected by the database flags.
pub(crate) fn dup_comparator(flags: DbFlags) -> Arc<dyn Comparator> {
    if flags.contains(DbFlags::REVERSEDUP) {
        Arc::new(ReverseComparator)
    } else {
        Arc::new(LexicographicComparator)
    }
}
