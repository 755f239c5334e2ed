//! The per-connection operation registry.

use std::collections::HashMap;

use tokio::task::JoinHandle;

use crate::producer::BoxProducer;

/// The id is already taken by an in-flight operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Duplicate;

/// One registry entry.
///
/// An id is reserved the instant a valid `subscribe` is accepted, before the factory has run,
/// so a second `subscribe` with the same id is rejected even while the first is still being
/// prepared. The reservation is upgraded to a running producer once the factory returns, and
/// removed on completion, error or cancellation.
pub(crate) enum Entry {
    /// Sentinel for an operation whose producer is still being constructed. The task handle
    /// is the producer task, attached right after it is spawned.
    Reserved { task: Option<JoinHandle<()>> },
    /// A running producer, exclusively owned by the registry.
    Running {
        producer: BoxProducer,
        task: JoinHandle<()>,
    },
}

impl Entry {
    pub(crate) fn into_parts(self) -> (Option<BoxProducer>, Option<JoinHandle<()>>) {
        match self {
            Self::Reserved { task } => (None, task),
            Self::Running { producer, task } => (Some(producer), Some(task)),
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<String, Entry>,
}

impl Registry {
    /// Atomically reserves an id. Does not mutate on duplicates.
    pub(crate) fn reserve(&mut self, id: &str) -> Result<(), Duplicate> {
        if self.entries.contains_key(id) {
            return Err(Duplicate);
        }
        self.entries.insert(id.into(), Entry::Reserved { task: None });
        Ok(())
    }

    /// Attaches the producer task to an existing reservation. A no-op if the operation has
    /// been cancelled (or has already settled) in the meantime.
    pub(crate) fn attach_task(&mut self, id: &str, task: JoinHandle<()>) {
        if let Some(Entry::Reserved { task: slot }) = self.entries.get_mut(id) {
            *slot = Some(task);
        }
    }

    /// Upgrades a reservation to a running producer. Returns the producer back if the
    /// reservation is gone, in which case the caller owns its cleanup.
    pub(crate) fn install(&mut self, id: &str, producer: BoxProducer) -> Result<(), BoxProducer> {
        match self.entries.remove(id) {
            Some(Entry::Reserved { task: Some(task) }) => {
                self.entries
                    .insert(id.into(), Entry::Running { producer, task });
                Ok(())
            }
            Some(entry @ Entry::Running { .. }) => {
                // Unreachable through the orchestrator; keep the existing producer.
                self.entries.insert(id.into(), entry);
                Err(producer)
            }
            Some(Entry::Reserved { task: None }) | None => Err(producer),
        }
    }

    /// Removes an entry if present, returning it for the caller to stop.
    pub(crate) fn remove(&mut self, id: &str) -> Option<Entry> {
        self.entries.remove(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// The ids of all in-flight operations, for shutdown iteration.
    pub(crate) fn snapshot_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.entries.len()
    }
}
