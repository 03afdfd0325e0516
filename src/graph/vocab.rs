//! The paper ontology: one fixed namespace, five classes, and the properties
//! linking them.

use oxigraph::model::NamedNode;

/// Ontology namespace. Entity identifiers are minted under it as well.
pub const NS: &str = "http://extremexp.eu/ontology/matic_papers/";

/// Kinds of entity the mapper mints identifiers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Paper,
    Task,
    Dataset,
    Method,
    Result,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        Self::Paper,
        Self::Task,
        Self::Dataset,
        Self::Method,
        Self::Result,
    ];

    /// Path segment used in minted identifiers.
    pub fn segment(self) -> &'static str {
        match self {
            Self::Paper => "paper",
            Self::Task => "task",
            Self::Dataset => "dataset",
            Self::Method => "method",
            Self::Result => "result",
        }
    }

    /// Local name of the ontology class.
    pub fn class_name(self) -> &'static str {
        match self {
            Self::Paper => "Paper",
            Self::Task => "Task",
            Self::Dataset => "Dataset",
            Self::Method => "Method",
            Self::Result => "ReportedResult",
        }
    }
}

/// Resolved class and property IRIs.
///
/// Built once per mapper; cloning is cheap enough that workers can each own one.
#[derive(Debug, Clone)]
pub struct Vocab {
    // Classes
    pub paper: NamedNode,
    pub task: NamedNode,
    pub dataset: NamedNode,
    pub method: NamedNode,
    pub reported_result: NamedNode,

    // Datatype properties
    pub paper_title: NamedNode,
    pub pdf_url: NamedNode,
    pub papers_with_code_url: NamedNode,
    pub year: NamedNode,
    pub task_name: NamedNode,
    pub dataset_name: NamedNode,
    pub method_name: NamedNode,
    pub model_name: NamedNode,
    pub metric_name: NamedNode,
    pub metric_value: NamedNode,
    pub rank: NamedNode,

    // Object properties
    pub mentions_task: NamedNode,
    pub mentions_dataset: NamedNode,
    pub employs_method: NamedNode,
    pub reports_result: NamedNode,
    pub reported_in_paper: NamedNode,
    pub evaluates_task: NamedNode,
    pub on_dataset: NamedNode,
}

fn term(local: &str) -> NamedNode {
    NamedNode::new_unchecked(format!("{NS}{local}"))
}

impl Vocab {
    pub fn new() -> Self {
        Self {
            paper: term("Paper"),
            task: term("Task"),
            dataset: term("Dataset"),
            method: term("Method"),
            reported_result: term("ReportedResult"),
            paper_title: term("paperTitle"),
            pdf_url: term("pdfUrl"),
            papers_with_code_url: term("papersWithCodeUrl"),
            year: term("year"),
            task_name: term("taskName"),
            dataset_name: term("datasetName"),
            method_name: term("methodName"),
            model_name: term("modelName"),
            metric_name: term("metricName"),
            metric_value: term("metricValue"),
            rank: term("rank"),
            mentions_task: term("mentionsTask"),
            mentions_dataset: term("mentionsDataset"),
            employs_method: term("employsMethod"),
            reports_result: term("reportsResult"),
            reported_in_paper: term("reportedInPaper"),
            evaluates_task: term("evaluatesTask"),
            on_dataset: term("onDataset"),
        }
    }

    pub fn class(&self, kind: EntityKind) -> &NamedNode {
        match kind {
            EntityKind::Paper => &self.paper,
            EntityKind::Task => &self.task,
            EntityKind::Dataset => &self.dataset,
            EntityKind::Method => &self.method,
            EntityKind::Result => &self.reported_result,
        }
    }

    /// Entity kind for a class IRI, if it is one of ours.
    pub fn kind_of_class(&self, iri: &str) -> Option<EntityKind> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| self.class(*kind).as_str() == iri)
    }
}

impl Default for Vocab {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_live_in_namespace() {
        let vocab = Vocab::new();
        for kind in EntityKind::ALL {
            let iri = vocab.class(kind).as_str();
            assert!(iri.starts_with(NS));
            assert_eq!(vocab.kind_of_class(iri), Some(kind));
        }
        assert_eq!(
            vocab.reported_result.as_str(),
            "http://extremexp.eu/ontology/matic_papers/ReportedResult"
        );
    }
}
