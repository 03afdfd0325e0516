//! In-process triplestore backed by oxigraph.
//!
//! Useful without a Fuseki server: tests, one-machine deployments, and
//! `sync.backend = "embedded"`. Either purely in memory or persisted on disk.

use std::path::Path;

use oxigraph::model::GraphName;
use oxigraph::store::Store;

use crate::error::{SyncError, SyncResult};

use super::{SyncBatch, TripleSink};

pub struct EmbeddedTripleStore {
    store: Store,
}

fn storage_error(context: &str, e: impl std::fmt::Display) -> SyncError {
    SyncError::Permanent {
        status: None,
        message: format!("{context}: {e}"),
    }
}

impl EmbeddedTripleStore {
    /// Create a new in-memory store (no persistence).
    pub fn in_memory() -> SyncResult<Self> {
        let store = Store::new().map_err(|e| storage_error("failed to create oxigraph store", e))?;
        Ok(Self { store })
    }

    /// Open or create a persistent store at the given path.
    pub fn open(path: &Path) -> SyncResult<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| storage_error("failed to create oxigraph directory", e))?;
        let store = Store::open(path).map_err(|e| {
            storage_error(&format!("failed to open oxigraph store at {}", path.display()), e)
        })?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

impl TripleSink for EmbeddedTripleStore {
    fn name(&self) -> &str {
        "embedded"
    }

    fn insert(&self, batch: &SyncBatch) -> SyncResult<()> {
        for triple in &batch.triples {
            let quad = triple.clone().in_graph(GraphName::DefaultGraph);
            self.store
                .insert(&quad)
                .map_err(|e| storage_error("insert failed", e))?;
        }
        Ok(())
    }

    fn triple_count(&self) -> SyncResult<u64> {
        let len = self
            .store
            .len()
            .map_err(|e| storage_error("count failed", e))?;
        Ok(len as u64)
    }

    fn ping(&self) -> SyncResult<()> {
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        self.store
            .clear()
            .map_err(|e| storage_error("clear failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::{Literal, NamedNode, Triple};

    fn triple(s: &str) -> Triple {
        Triple::new(
            NamedNode::new_unchecked(format!("http://x.org/{s}")),
            NamedNode::new_unchecked("http://x.org/p"),
            Literal::new_simple_literal("o"),
        )
    }

    #[test]
    fn insert_is_idempotent() {
        let store = EmbeddedTripleStore::in_memory().unwrap();
        let batch = SyncBatch::new(1, vec![triple("a"), triple("b")]);
        store.insert(&batch).unwrap();
        store.insert(&batch).unwrap();
        assert_eq!(store.triple_count().unwrap(), 2);
    }

    #[test]
    fn clear_removes_everything() {
        let store = EmbeddedTripleStore::in_memory().unwrap();
        store.insert(&SyncBatch::new(1, vec![triple("a")])).unwrap();
        store.clear().unwrap();
        assert_eq!(store.triple_count().unwrap(), 0);
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let store = EmbeddedTripleStore::open(dir.path()).unwrap();
            store.insert(&SyncBatch::new(1, vec![triple("a")])).unwrap();
        }
        let store = EmbeddedTripleStore::open(dir.path()).unwrap();
        assert_eq!(store.triple_count().unwrap(), 1);
    }
}
