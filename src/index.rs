//! Range index contract and decorators
//!
//! [`RangeIndex`] is what callers program against. [`RangeIndexWrapper`]
//! hides the concrete index behind it and [`RangeIndexLogger`] traces every
//! call on the way through. Decorators stack:
//!
//! ```rust,no_run
//! use blockvault::{BPlusTree, RangeIndex, RangeIndexLogger, RangeIndexWrapper, RecordFactory};
//!
//! # fn main() -> blockvault::Result<()> {
//! let tree = BPlusTree::mem("SPO", 4096, RecordFactory::new(24, 0))?;
//! let index = RangeIndexWrapper::new(RangeIndexLogger::new("SPO", tree));
//! assert!(index.is_empty()?);
//! # Ok(())
//! # }
//! ```

use crate::bptree::{BPlusTree, RecordIter};
use crate::error::Result;
use crate::record::{Record, RecordFactory};
use std::sync::Arc;

/// An ordered index of fixed-length records.
pub trait RangeIndex: Send + Sync {
    /// Record with the same key as `key`, if any.
    fn find(&self, key: &Record) -> Result<Option<Record>>;

    fn contains(&self, key: &Record) -> Result<bool> {
        Ok(self.find(key)?.is_some())
    }

    /// Insert, overwriting the value of an existing key. `true` if the key
    /// is new.
    fn insert(&self, record: &Record) -> Result<bool>;

    /// `true` if a record was removed.
    fn delete(&self, key: &Record) -> Result<bool>;

    fn min_key(&self) -> Result<Option<Record>>;

    fn max_key(&self) -> Result<Option<Record>>;

    /// Every record in ascending order.
    fn iter(&self) -> RecordIter {
        self.iter_range(None, None)
    }

    /// Records with `min <= key < max`. `None` leaves that end open.
    fn iter_range(&self, min: Option<&Record>, max: Option<&Record>) -> RecordIter;

    /// [`iter_range`](RangeIndex::iter_range) with each record mapped.
    fn iter_range_map<'a, T, F>(
        &self,
        min: Option<&Record>,
        max: Option<&Record>,
        mut f: F,
    ) -> Box<dyn Iterator<Item = Result<T>> + 'a>
    where
        Self: Sized,
        T: 'a,
        F: FnMut(Record) -> T + 'a,
    {
        Box::new(self.iter_range(min, max).map(move |r| r.map(&mut f)))
    }

    /// Remove every record.
    fn clear(&self) -> Result<()>;

    fn sync(&self) -> Result<()>;

    fn close(&self) -> Result<()>;

    /// Validate internal structure.
    fn check(&self) -> Result<()>;

    /// Number of records, counted.
    fn size(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.min_key()?.is_none())
    }

    fn record_factory(&self) -> RecordFactory;
}

impl RangeIndex for BPlusTree {
    fn find(&self, key: &Record) -> Result<Option<Record>> {
        BPlusTree::find(self, key)
    }

    fn insert(&self, record: &Record) -> Result<bool> {
        BPlusTree::insert(self, record)
    }

    fn delete(&self, key: &Record) -> Result<bool> {
        BPlusTree::delete(self, key)
    }

    fn min_key(&self) -> Result<Option<Record>> {
        BPlusTree::min_key(self)
    }

    fn max_key(&self) -> Result<Option<Record>> {
        BPlusTree::max_key(self)
    }

    fn iter_range(&self, min: Option<&Record>, max: Option<&Record>) -> RecordIter {
        BPlusTree::iter_range(self, min, max)
    }

    fn clear(&self) -> Result<()> {
        BPlusTree::clear(self)
    }

    fn sync(&self) -> Result<()> {
        BPlusTree::sync(self)
    }

    fn close(&self) -> Result<()> {
        BPlusTree::close(self)
    }

    fn check(&self) -> Result<()> {
        BPlusTree::check(self)
    }

    fn size(&self) -> Result<u64> {
        BPlusTree::size(self)
    }

    fn is_empty(&self) -> Result<bool> {
        BPlusTree::is_empty(self)
    }

    fn record_factory(&self) -> RecordFactory {
        BPlusTree::record_factory(self)
    }
}

macro_rules! forward_range_index {
    ($($target:tt)*) => {
        fn find(&self, key: &Record) -> Result<Option<Record>> {
            self.$($target)*.find(key)
        }

        fn contains(&self, key: &Record) -> Result<bool> {
            self.$($target)*.contains(key)
        }

        fn insert(&self, record: &Record) -> Result<bool> {
            self.$($target)*.insert(record)
        }

        fn delete(&self, key: &Record) -> Result<bool> {
            self.$($target)*.delete(key)
        }

        fn min_key(&self) -> Result<Option<Record>> {
            self.$($target)*.min_key()
        }

        fn max_key(&self) -> Result<Option<Record>> {
            self.$($target)*.max_key()
        }

        fn iter(&self) -> RecordIter {
            self.$($target)*.iter()
        }

        fn iter_range(&self, min: Option<&Record>, max: Option<&Record>) -> RecordIter {
            self.$($target)*.iter_range(min, max)
        }

        fn clear(&self) -> Result<()> {
            self.$($target)*.clear()
        }

        fn sync(&self) -> Result<()> {
            self.$($target)*.sync()
        }

        fn close(&self) -> Result<()> {
            self.$($target)*.close()
        }

        fn check(&self) -> Result<()> {
            self.$($target)*.check()
        }

        fn size(&self) -> Result<u64> {
            self.$($target)*.size()
        }

        fn is_empty(&self) -> Result<bool> {
            self.$($target)*.is_empty()
        }

        fn record_factory(&self) -> RecordFactory {
            self.$($target)*.record_factory()
        }
    };
}

impl<I: RangeIndex + ?Sized> RangeIndex for Box<I> {
    forward_range_index!(as_ref());
}

impl<I: RangeIndex + ?Sized> RangeIndex for Arc<I> {
    forward_range_index!(as_ref());
}

/// Uniform façade over any index implementation.
pub struct RangeIndexWrapper {
    inner: Box<dyn RangeIndex>,
}

impl RangeIndexWrapper {
    pub fn new(index: impl RangeIndex + 'static) -> Self {
        RangeIndexWrapper {
            inner: Box::new(index),
        }
    }

    pub fn inner(&self) -> &dyn RangeIndex {
        self.inner.as_ref()
    }

    pub fn into_inner(self) -> Box<dyn RangeIndex> {
        self.inner
    }
}

impl RangeIndex for RangeIndexWrapper {
    forward_range_index!(inner);
}

/// Traces every call, with its outcome, at debug level.
pub struct RangeIndexLogger<I> {
    label: String,
    inner: I,
}

impl<I: RangeIndex> RangeIndexLogger<I> {
    pub fn new(label: impl Into<String>, inner: I) -> Self {
        RangeIndexLogger {
            label: label.into(),
            inner,
        }
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

impl<I: RangeIndex> RangeIndex for RangeIndexLogger<I> {
    fn find(&self, key: &Record) -> Result<Option<Record>> {
        let result = self.inner.find(key);
        tracing::debug!(index = %self.label, ?key, found = matches!(result, Ok(Some(_))), "find");
        result
    }

    fn contains(&self, key: &Record) -> Result<bool> {
        let result = self.inner.contains(key);
        tracing::debug!(index = %self.label, ?key, ?result, "contains");
        result
    }

    fn insert(&self, record: &Record) -> Result<bool> {
        let result = self.inner.insert(record);
        tracing::debug!(index = %self.label, ?record, ?result, "insert");
        result
    }

    fn delete(&self, key: &Record) -> Result<bool> {
        let result = self.inner.delete(key);
        tracing::debug!(index = %self.label, ?key, ?result, "delete");
        result
    }

    fn min_key(&self) -> Result<Option<Record>> {
        let result = self.inner.min_key();
        tracing::debug!(index = %self.label, ?result, "min_key");
        result
    }

    fn max_key(&self) -> Result<Option<Record>> {
        let result = self.inner.max_key();
        tracing::debug!(index = %self.label, ?result, "max_key");
        result
    }

    fn iter(&self) -> RecordIter {
        tracing::debug!(index = %self.label, "iter");
        self.inner.iter()
    }

    fn iter_range(&self, min: Option<&Record>, max: Option<&Record>) -> RecordIter {
        tracing::debug!(index = %self.label, ?min, ?max, "iter_range");
        self.inner.iter_range(min, max)
    }

    fn clear(&self) -> Result<()> {
        tracing::debug!(index = %self.label, "clear");
        self.inner.clear()
    }

    fn sync(&self) -> Result<()> {
        tracing::debug!(index = %self.label, "sync");
        self.inner.sync()
    }

    fn close(&self) -> Result<()> {
        tracing::debug!(index = %self.label, "close");
        self.inner.close()
    }

    fn check(&self) -> Result<()> {
        let result = self.inner.check();
        tracing::debug!(index = %self.label, ok = result.is_ok(), "check");
        result
    }

    fn size(&self) -> Result<u64> {
        let result = self.inner.size();
        tracing::debug!(index = %self.label, ?result, "size");
        result
    }

    fn is_empty(&self) -> Result<bool> {
        self.inner.is_empty()
    }

    fn record_factory(&self) -> RecordFactory {
        self.inner.record_factory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> RecordFactory {
        RecordFactory::new(4, 4)
    }

    fn rec(n: u32) -> Record {
        factory()
            .create_kv(&n.to_be_bytes(), &(n + 1).to_be_bytes())
            .unwrap()
    }

    fn key(n: u32) -> Record {
        factory().create_key(&n.to_be_bytes()).unwrap()
    }

    fn exercise(index: &dyn RangeIndex) {
        for n in 0..100 {
            assert!(index.insert(&rec(n)).unwrap());
        }
        assert_eq!(index.size().unwrap(), 100);
        assert!(index.contains(&key(42)).unwrap());
        assert!(index.delete(&key(42)).unwrap());
        assert!(!index.contains(&key(42)).unwrap());
        assert_eq!(index.min_key().unwrap(), Some(key(0)));
        assert_eq!(index.max_key().unwrap(), Some(key(99)));
        assert_eq!(index.iter_range(Some(&key(40)), Some(&key(45))).count(), 4);
        index.check().unwrap();
        index.clear().unwrap();
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn test_tree_through_trait_object() {
        let tree = BPlusTree::mem("t", 128, factory()).unwrap();
        exercise(&tree);
    }

    #[test]
    fn test_decorators_pass_through() {
        let tree = BPlusTree::mem("t", 128, factory()).unwrap();
        let index = RangeIndexWrapper::new(RangeIndexLogger::new("t", tree));
        exercise(&index);
        assert_eq!(index.record_factory(), factory());
    }

    #[test]
    fn test_shared_index() {
        let index: Arc<dyn RangeIndex> = Arc::new(BPlusTree::mem("t", 128, factory()).unwrap());
        let clone = Arc::clone(&index);
        clone.insert(&rec(5)).unwrap();
        assert!(index.contains(&key(5)).unwrap());
    }

    #[test]
    fn test_iter_range_map() {
        let tree = BPlusTree::mem("t", 128, factory()).unwrap();
        for n in 0..20 {
            tree.insert(&rec(n)).unwrap();
        }
        let values: Vec<u32> = tree
            .iter_range_map(Some(&key(3)), Some(&key(6)), |r| {
                u32::from_be_bytes(r.value().try_into().unwrap())
            })
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(values, vec![4, 5, 6]);
    }
}
