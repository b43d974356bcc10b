use crate::backend::Channel;
use std::fmt;
use std::sync::Arc;

/// Eager in-memory collection. Clones share the underlying buffer.
pub struct LocalDataset<T> {
    items: Arc<Vec<T>>,
    cached: bool,
}

impl<T> LocalDataset<T> {
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
            cached: false,
        }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True once `cache()` produced this handle
    pub fn is_cached(&self) -> bool {
        self.cached
    }
}

impl<T: Clone> LocalDataset<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.as_ref().clone()
    }
}

impl<T> Clone for LocalDataset<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            cached: self.cached,
        }
    }
}

impl<T> fmt::Debug for LocalDataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDataset")
            .field("len", &self.items.len())
            .field("cached", &self.cached)
            .finish()
    }
}

impl<T> From<Vec<T>> for LocalDataset<T> {
    fn from(items: Vec<T>) -> Self {
        Self::from_vec(items)
    }
}

impl<T: Clone + Send + Sync + 'static> Channel for LocalDataset<T> {
    fn union(&self, other: &Self) -> Self {
        let mut items = Vec::with_capacity(self.len() + other.len());
        items.extend(self.items.iter().cloned());
        items.extend(other.items.iter().cloned());
        Self::from_vec(items)
    }

    fn cache(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            cached: true,
        }
    }
}
