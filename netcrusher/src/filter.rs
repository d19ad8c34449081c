//! Byte-transform filters applied to relayed traffic.
//!
//! Each crusher owns a [`FilterRepository`] with two ordered lists:
//! `outgoing` (client to remote) and `incoming` (remote to client). Lists can
//! be edited from any thread; every new session takes a [`FilterChain`]
//! snapshot and keeps it for its whole life.
//!
//! Filters run inline on the reactor thread and must not block.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

/// A byte transform stage.
///
/// Returning an empty buffer suppresses the data: a TCP chunk is not
/// forwarded, a datagram is dropped.
pub trait Filter: Send + Sync {
    fn transform(&self, client: SocketAddr, data: Vec<u8>) -> Vec<u8>;
}

impl<F> Filter for F
where
    F: Fn(SocketAddr, Vec<u8>) -> Vec<u8> + Send + Sync,
{
    fn transform(&self, client: SocketAddr, data: Vec<u8>) -> Vec<u8> {
        self(client, data)
    }
}

/// Immutable, ordered set of filters taken from a [`FilterList`].
#[derive(Clone)]
pub struct FilterChain {
    stages: Arc<[Arc<dyn Filter>]>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self {
            stages: Arc::from(Vec::new()),
        }
    }
}

impl FilterChain {
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `data` through every stage in order.
    pub fn apply(&self, client: SocketAddr, data: Vec<u8>) -> Vec<u8> {
        let mut data = data;
        for stage in self.stages.iter() {
            if data.is_empty() {
                break;
            }
            data = stage.transform(client, data);
        }
        data
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[derive(Clone)]
struct NamedFilter {
    name: String,
    filter: Arc<dyn Filter>,
}

/// Ordered, named list of filters for one direction.
///
/// Readers on the reactor thread never block writers.
pub struct FilterList {
    stages: ArcSwap<Vec<NamedFilter>>,
}

impl Default for FilterList {
    fn default() -> Self {
        Self {
            stages: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl FilterList {
    /// Append a filter. A filter with the same name is replaced in place.
    pub fn add(&self, name: impl Into<String>, filter: impl Filter + 'static) {
        let entry = NamedFilter {
            name: name.into(),
            filter: Arc::new(filter),
        };
        self.stages.rcu(|current| {
            let mut next = (**current).clone();
            match next.iter_mut().find(|f| f.name == entry.name) {
                Some(existing) => *existing = entry.clone(),
                None => next.push(entry.clone()),
            }
            next
        });
    }

    /// Remove the filter called `name`. Returns whether it was present.
    pub fn remove(&self, name: &str) -> bool {
        let previous = self.stages.rcu(|current| {
            current
                .iter()
                .filter(|f| f.name != name)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().any(|f| f.name == name)
    }

    pub fn clear(&self) {
        self.stages.store(Arc::new(Vec::new()));
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.load().iter().map(|f| f.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.load().is_empty()
    }

    /// Current filters as an immutable chain.
    pub fn snapshot(&self) -> FilterChain {
        let stages = self.stages.load();
        FilterChain {
            stages: stages.iter().map(|f| Arc::clone(&f.filter)).collect(),
        }
    }
}

impl fmt::Debug for FilterList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Per-crusher filter configuration.
#[derive(Clone, Default, Debug)]
pub struct FilterRepository {
    inner: Arc<Lists>,
}

#[derive(Default, Debug)]
struct Lists {
    incoming: FilterList,
    outgoing: FilterList,
}

impl FilterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters for traffic from the remote endpoint back to the client.
    pub fn incoming(&self) -> &FilterList {
        &self.inner.incoming
    }

    /// Filters for traffic from the client to the remote endpoint.
    pub fn outgoing(&self) -> &FilterList {
        &self.inner.outgoing
    }
}
