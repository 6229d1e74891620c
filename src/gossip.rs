//! Epidemic dissemination of broadcast values over a fixed neighbour graph.
//!
//! [`Gossip`] keeps the most recently applied topology, this node's neighbour set derived from it, and a
//! deduplicated store of every value observed. Observing a value for the first time yields a [`Fanout`] naming the
//! neighbours it must be forwarded to; observing it again yields nothing. Termination of the flood therefore rests
//! entirely on the dedup store: nodes that already know a value still receive repeat copies from neighbours that
//! are propagating it, and discard them.
//!
//! Fanout is best-effort. Copies are queued on the outbox without a `msg_id`, no acknowledgement is expected, and
//! a failed send is dropped. Queueing does wait for room in the outbox.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError, RwLock},
};

use tracing::{debug, trace};

use crate::{
    message::{Body, Envelope, Payload, Topology},
    outbox::Outbox,
};

/// Gossip state for one node.
#[derive(Debug, Default)]
pub struct Gossip {
    graph: RwLock<Graph>,
    store: Mutex<Store>,
}

#[derive(Debug, Default)]
struct Graph {
    topology: Topology,
    neighbours: Vec<String>,
}

impl Graph {
    fn select_neighbours(&mut self, node_id: &str) -> bool {
        let Some(neighbours) = self.topology.get(node_id) else {
            return false;
        };
        self.neighbours = neighbours
            .iter()
            .filter(|neighbour| *neighbour != node_id)
            .cloned()
            .collect();
        true
    }
}

#[derive(Debug, Default)]
struct Store {
    seen: HashSet<i64>,
    order: Vec<i64>,
}

impl Gossip {
    /// Creates gossip state with no topology, no neighbours and an empty store.
    pub fn new() -> Self {
        Gossip::default()
    }

    /// Applies a topology update for the node `node_id`.
    ///
    /// The neighbour set is replaced with `topology[node_id]`, excluding `node_id` itself. If the node id is not yet
    /// known, or the topology has no entry for it, the neighbour set is left unchanged. The full mapping is kept
    /// either way.
    ///
    /// Returns `true` if the neighbour set was replaced.
    pub fn apply_topology(&self, node_id: Option<&str>, topology: Topology) -> bool {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        graph.topology = topology;
        let replaced = node_id.is_some_and(|id| graph.select_neighbours(id));
        debug!(?node_id, neighbours = ?graph.neighbours, replaced, "applied topology");

        replaced
    }

    /// Derives the neighbour set of `node_id` from the most recently applied topology.
    ///
    /// Used once the node id becomes known, so a topology applied before that still takes effect. Returns `true` if
    /// the neighbour set was replaced.
    pub fn select_neighbours(&self, node_id: &str) -> bool {
        let mut graph = self.graph.write().unwrap_or_else(PoisonError::into_inner);
        let replaced = graph.select_neighbours(node_id);
        if replaced {
            debug!(node_id, neighbours = ?graph.neighbours, "selected neighbours from stored topology");
        }

        replaced
    }

    /// Returns the current neighbour set.
    pub fn neighbours(&self) -> Vec<String> {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .neighbours
            .clone()
    }

    /// Returns the most recently applied topology.
    pub fn topology(&self) -> Topology {
        self.graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .topology
            .clone()
    }

    /// Records `value`, received from `origin`.
    ///
    /// If the value was unseen it is stored and a [`Fanout`] to every neighbour except `origin` is returned. If it
    /// was already seen, nothing changes and `None` is returned. The membership test and the insert happen under
    /// one lock, so among concurrent observers of the same value exactly one gets the fanout.
    pub fn observe(&self, value: i64, origin: &str) -> Option<Fanout> {
        {
            let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
            if !store.seen.insert(value) {
                trace!(value, origin, "duplicate gossip value");
                return None;
            }
            store.order.push(value);
        }

        let targets: Vec<String> = self
            .graph
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .neighbours
            .iter()
            .filter(|neighbour| *neighbour != origin)
            .cloned()
            .collect();
        debug!(value, origin, ?targets, "new gossip value");

        Some(Fanout {
            message: value,
            targets,
        })
    }

    /// Returns every distinct value observed so far, in first-observed order.
    pub fn snapshot(&self) -> Vec<i64> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .clone()
    }

    /// Returns `true` if `value` has been observed.
    pub fn contains(&self, value: i64) -> bool {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .seen
            .contains(&value)
    }

    /// The number of distinct values observed.
    pub fn len(&self) -> usize {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .order
            .len()
    }

    /// Returns `true` if no value has been observed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The forwarding copies owed for a newly observed value.
#[must_use = "a fanout does nothing unless sent"]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fanout {
    message: i64,
    targets: Vec<String>,
}

impl Fanout {
    /// The value being forwarded.
    pub fn message(&self) -> i64 {
        self.message
    }

    /// The neighbours the value will be forwarded to.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Queues a fire-and-forget `broadcast` from `from` to every target.
    ///
    /// Copies carry no `msg_id`, so receivers do not reply. Send failures are dropped.
    pub async fn send(self, from: &str, outbox: &Outbox) {
        for dest in self.targets {
            let envelope = Envelope {
                src: from.to_string(),
                dest,
                body: Body::new(Payload::Broadcast {
                    message: self.message,
                }),
            };
            if let Err(err) = outbox.send(envelope).await {
                trace!(dest = %err.0.dest, message = self.message, "dropped gossip copy");
            }
        }
    }
}
