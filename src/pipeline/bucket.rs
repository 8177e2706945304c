//! DataBucket - scoped key/value store
//!
//! One bucket per `(plugin, instance)` slot of a pipeline context. Values
//! are type-erased and shared; the reader/writer lock per bucket keeps
//! `query_data_with_bind_default` linearizable with concurrent binds on the
//! same key.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Values stored in a bucket.
pub type BucketValue = Arc<dyn Any + Send + Sync>;

/// Scoped key/value store bound to one `(plugin, instance)` slot.
pub struct DataBucket {
    data: RwLock<HashMap<String, BucketValue>>,
    closed: AtomicBool,
}

impl DataBucket {
    pub(crate) fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the bucket unusable; called when the owning context closes.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data.write().clear();
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed("data bucket"))
        } else {
            Ok(())
        }
    }

    /// Bind `value` under `key`, returning the previous value if any.
    pub fn bind_data(&self, key: impl Into<String>, value: BucketValue) -> Result<Option<BucketValue>> {
        self.check_open()?;
        Ok(self.data.write().insert(key.into(), value))
    }

    /// Look up the value under `key`.
    pub fn query_data(&self, key: &str) -> Result<Option<BucketValue>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    /// Return the value under `key`, installing a freshly computed default
    /// when absent.
    ///
    /// The write lock is held across the default computation, so concurrent
    /// callers for the same absent key all observe the one installed
    /// default. A failing default fn bubbles to the caller without binding.
    pub fn query_data_with_bind_default(
        &self,
        key: impl Into<String>,
        default_fn: impl FnOnce() -> Result<BucketValue>,
    ) -> Result<BucketValue> {
        self.check_open()?;
        let key = key.into();
        let mut data = self.data.write();
        if let Some(existing) = data.get(&key) {
            return Ok(existing.clone());
        }
        let value = default_fn()?;
        data.insert(key, value.clone());
        Ok(value)
    }

    /// Remove the value under `key`, returning it if present.
    pub fn unbind_data(&self, key: &str) -> Result<Option<BucketValue>> {
        self.check_open()?;
        Ok(self.data.write().remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_bind_query_unbind() {
        let bucket = DataBucket::new();

        assert!(bucket.bind_data("k", Arc::new(1u32)).unwrap().is_none());
        let prev = bucket.bind_data("k", Arc::new(2u32)).unwrap().unwrap();
        assert_eq!(*prev.downcast::<u32>().unwrap(), 1);

        let got = bucket.query_data("k").unwrap().unwrap();
        assert_eq!(*got.downcast::<u32>().unwrap(), 2);

        assert!(bucket.unbind_data("k").unwrap().is_some());
        assert!(bucket.query_data("k").unwrap().is_none());
    }

    #[test]
    fn test_bind_default_runs_once_under_contention() {
        let bucket = Arc::new(DataBucket::new());
        let computed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                let computed = computed.clone();
                std::thread::spawn(move || {
                    let value = bucket
                        .query_data_with_bind_default("shared", || {
                            computed.fetch_add(1, Ordering::Relaxed);
                            Ok(Arc::new(7u64) as BucketValue)
                        })
                        .unwrap();
                    *value.downcast::<u64>().unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), 7);
        }
        assert_eq!(computed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bind_default_failure_does_not_bind() {
        let bucket = DataBucket::new();
        let err = bucket
            .query_data_with_bind_default("k", || {
                Err(Error::plugin_run("demo", "default construction failed"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::PluginRun { .. }));
        assert!(bucket.query_data("k").unwrap().is_none());

        // The key stays bindable afterwards.
        let value = bucket
            .query_data_with_bind_default("k", || Ok(Arc::new(1u8) as BucketValue))
            .unwrap();
        assert_eq!(*value.downcast::<u8>().unwrap(), 1);
    }

    #[test]
    fn test_closed_bucket_rejects_operations() {
        let bucket = DataBucket::new();
        bucket.bind_data("k", Arc::new(1u8)).unwrap();
        bucket.close();

        assert!(matches!(
            bucket.bind_data("k", Arc::new(2u8)),
            Err(Error::Closed(_))
        ));
        assert!(matches!(bucket.query_data("k"), Err(Error::Closed(_))));
        assert!(matches!(bucket.unbind_data("k"), Err(Error::Closed(_))));
        assert!(matches!(
            bucket.query_data_with_bind_default("k", || Ok(Arc::new(0u8) as BucketValue)),
            Err(Error::Closed(_))
        ));
    }
}
