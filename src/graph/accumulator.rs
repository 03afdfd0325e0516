//! In-memory graph accumulator.
//!
//! A concurrent set of triples owned by the pipeline and shared by handle with
//! the worker, sync and backup tasks. Merge is a set union: inserting a
//! triple that is already present is a no-op, so merge order never matters.

use dashmap::DashSet;
use oxigraph::model::vocab::rdf;
use oxigraph::model::{Term, Triple};
use serde::{Deserialize, Serialize};

use super::vocab::{EntityKind, Vocab};

/// Number of typed entities per class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub papers: usize,
    pub tasks: usize,
    pub datasets: usize,
    pub methods: usize,
    pub results: usize,
}

impl EntityCounts {
    pub fn get(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Paper => self.papers,
            EntityKind::Task => self.tasks,
            EntityKind::Dataset => self.datasets,
            EntityKind::Method => self.methods,
            EntityKind::Result => self.results,
        }
    }

    fn bump(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Paper => self.papers += 1,
            EntityKind::Task => self.tasks += 1,
            EntityKind::Dataset => self.datasets += 1,
            EntityKind::Method => self.methods += 1,
            EntityKind::Result => self.results += 1,
        }
    }
}

/// Concurrent set-of-triples graph.
#[derive(Debug, Default)]
pub struct GraphAccumulator {
    triples: DashSet<Triple>,
    vocab: Vocab,
}

impl GraphAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union `triples` into the graph and return the ones that were new.
    ///
    /// Safe to call from many workers at once; a triple raced in by two
    /// callers is reported as new to exactly one of them.
    pub fn merge(&self, triples: impl IntoIterator<Item = Triple>) -> Vec<Triple> {
        triples
            .into_iter()
            .filter(|t| self.triples.insert(t.clone()))
            .collect()
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.triples.contains(triple)
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Remove every triple.
    pub fn clear(&self) {
        self.triples.clear();
    }

    /// Remove `triples`, returning how many were present.
    pub fn remove<'a>(&self, triples: impl IntoIterator<Item = &'a Triple>) -> usize {
        triples
            .into_iter()
            .filter(|t| self.triples.remove(*t).is_some())
            .count()
    }

    /// Copy of the current triple set, in no particular order.
    pub fn triples(&self) -> Vec<Triple> {
        self.triples.iter().map(|t| t.key().clone()).collect()
    }

    /// The graph as sorted N-Triples lines (without trailing newlines).
    ///
    /// Sorting makes two snapshots of equal graphs byte-identical.
    pub fn ntriples_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .triples
            .iter()
            .map(|t| ntriples_line(t.key()))
            .collect();
        lines.sort_unstable();
        lines
    }

    /// Count entities by their `rdf:type`.
    pub fn entity_counts(&self) -> EntityCounts {
        let mut counts = EntityCounts::default();
        for entry in self.triples.iter() {
            let triple = entry.key();
            if triple.predicate.as_str() != rdf::TYPE.as_str() {
                continue;
            }
            if let Term::NamedNode(class) = &triple.object {
                if let Some(kind) = self.vocab.kind_of_class(class.as_str()) {
                    counts.bump(kind);
                }
            }
        }
        counts
    }
}

/// One N-Triples statement.
pub fn ntriples_line(triple: &Triple) -> String {
    format!("{triple} .")
}
