//! Bounded in-memory model cache
//!
//! Keeps recently used deserialized models so a run does not re-parse
//! every artifact blob. Explicitly owned and explicitly invalidated: the
//! coordinator drops an entry whenever an instrument's refresh fails or
//! its artifact is rewritten, and the map never grows past its capacity
//! (least-recently-used entries are evicted first).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use super::Forecaster;

/// Shared handle to a cached model. The inner mutex serializes retraining
/// against concurrent readers.
pub type ModelHandle = Arc<Mutex<Box<dyn Forecaster>>>;

pub struct ModelCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, ModelHandle>,
    /// Recency order, least recently used at the front.
    order: VecDeque<String>,
}

impl ModelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, ticker: &str) -> Option<ModelHandle> {
        let mut inner = self.inner.lock();
        let handle = inner.entries.get(ticker)?.clone();
        Self::touch(&mut inner, ticker);
        Some(handle)
    }

    /// Store (or replace) the model for a ticker, evicting the least
    /// recently used entry if the cache is full. Returns the handle.
    pub fn insert(&self, ticker: &str, model: Box<dyn Forecaster>) -> ModelHandle {
        let handle: ModelHandle = Arc::new(Mutex::new(model));
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(ticker) && inner.entries.len() >= self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
                debug!("Evicted cached model for {}", evicted);
            }
        }

        inner.entries.insert(ticker.to_string(), handle.clone());
        Self::touch(&mut inner, ticker);
        handle
    }

    /// Drop a cached model, forcing the next user to reload it from the
    /// persisted artifact.
    pub fn invalidate(&self, ticker: &str) {
        let mut inner = self.inner.lock();
        inner.entries.remove(ticker);
        inner.order.retain(|t| t != ticker);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(inner: &mut CacheInner, ticker: &str) {
        inner.order.retain(|t| t != ticker);
        inner.order.push_back(ticker.to_string());
    }
}
