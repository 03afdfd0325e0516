//! Canonical record → RDF triples.
//!
//! Identifiers are minted from natural keys: the paper's source URL, an
//! entity's name, and for reported results the combination of paper, task,
//! dataset, model and metric. Keys are case and whitespace normalized before
//! hashing, so one logical entity always gets one IRI.

use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Triple};
use unicode_normalization::UnicodeNormalization;

use crate::normalize::{CanonicalRecord, ResultEntry};

use super::vocab::{EntityKind, NS, Vocab};

/// Hex characters of the blake3 digest kept in an identifier.
const ID_HEX_LEN: usize = 16;

/// Mint the IRI for an entity from its already-normalized key.
pub fn entity_iri(kind: EntityKind, key: &str) -> NamedNode {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.segment().as_bytes());
    hasher.update(&[0]);
    hasher.update(key.as_bytes());
    let hex = hasher.finalize().to_hex();
    NamedNode::new_unchecked(format!("{NS}{}/{}", kind.segment(), &hex[..ID_HEX_LEN]))
}

/// NFKC, lowercase, collapse internal whitespace, trim.
pub fn name_key(name: &str) -> String {
    let folded: String = name.nfkc().collect::<String>().to_lowercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trim, drop the fragment and trailing slashes, lowercase scheme and host.
pub fn url_key(url: &str) -> String {
    let url = url.trim();
    let url = url.split('#').next().unwrap_or(url).trim_end_matches('/');
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = match rest.find('/') {
                Some(idx) => rest.split_at(idx),
                None => (rest, ""),
            };
            format!(
                "{}://{}{}",
                scheme.to_ascii_lowercase(),
                host.to_ascii_lowercase(),
                path
            )
        }
        None => url.to_string(),
    }
}

/// Maps canonical records onto the paper ontology.
#[derive(Debug, Clone, Default)]
pub struct GraphMapper {
    vocab: Vocab,
}

impl GraphMapper {
    pub fn new() -> Self {
        Self {
            vocab: Vocab::new(),
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    /// IRI of the paper a record describes.
    pub fn paper_iri(&self, record: &CanonicalRecord) -> NamedNode {
        entity_iri(EntityKind::Paper, &url_key(&record.source_url))
    }

    /// Produce every triple describing `record`.
    ///
    /// The output order is fixed for a given record: set-valued fields are
    /// already sorted and results are visited in input order.
    pub fn map_record(&self, record: &CanonicalRecord) -> Vec<Triple> {
        let v = &self.vocab;
        let paper_key = url_key(&record.source_url);
        let paper = entity_iri(EntityKind::Paper, &paper_key);
        let mut out = Vec::new();

        out.push(Triple::new(
            paper.clone(),
            rdf::TYPE.into_owned(),
            v.paper.clone(),
        ));
        out.push(Triple::new(
            paper.clone(),
            v.paper_title.clone(),
            Literal::new_simple_literal(&record.title),
        ));
        out.push(Triple::new(
            paper.clone(),
            v.pdf_url.clone(),
            Literal::new_typed_literal(&paper_key, xsd::ANY_URI),
        ));
        if let Some(origin) = &record.origin_url {
            out.push(Triple::new(
                paper.clone(),
                v.papers_with_code_url.clone(),
                Literal::new_typed_literal(origin, xsd::ANY_URI),
            ));
        }
        if let Some(year) = record.year {
            out.push(Triple::new(
                paper.clone(),
                v.year.clone(),
                Literal::new_typed_literal(year.to_string(), xsd::G_YEAR),
            ));
        }

        for task in &record.tasks {
            let node = self.named_entity(EntityKind::Task, task, &mut out);
            out.push(Triple::new(paper.clone(), v.mentions_task.clone(), node));
        }
        for dataset in &record.datasets {
            let node = self.named_entity(EntityKind::Dataset, dataset, &mut out);
            out.push(Triple::new(paper.clone(), v.mentions_dataset.clone(), node));
        }
        for method in &record.methods {
            let node = self.named_entity(EntityKind::Method, method, &mut out);
            out.push(Triple::new(paper.clone(), v.employs_method.clone(), node));
        }

        for entry in &record.results {
            self.result_entity(&paper, &paper_key, entry, &mut out);
        }

        out
    }

    /// Emit type and name triples for a named entity and return its IRI.
    fn named_entity(&self, kind: EntityKind, name: &str, out: &mut Vec<Triple>) -> NamedNode {
        let node = entity_iri(kind, &name_key(name));
        let name_prop = match kind {
            EntityKind::Task => &self.vocab.task_name,
            EntityKind::Dataset => &self.vocab.dataset_name,
            EntityKind::Method => &self.vocab.method_name,
            EntityKind::Paper | EntityKind::Result => &self.vocab.paper_title,
        };
        out.push(Triple::new(
            node.clone(),
            rdf::TYPE.into_owned(),
            self.vocab.class(kind).clone(),
        ));
        out.push(Triple::new(
            node.clone(),
            name_prop.clone(),
            Literal::new_simple_literal(name.trim()),
        ));
        node
    }

    fn result_entity(
        &self,
        paper: &NamedNode,
        paper_key: &str,
        entry: &ResultEntry,
        out: &mut Vec<Triple>,
    ) {
        let v = &self.vocab;
        let key = [
            paper_key.to_string(),
            name_key(&entry.task),
            name_key(&entry.dataset),
            name_key(&entry.model),
            name_key(&entry.metric),
        ]
        .join("\u{1f}");
        let node = entity_iri(EntityKind::Result, &key);

        out.push(Triple::new(
            node.clone(),
            rdf::TYPE.into_owned(),
            v.reported_result.clone(),
        ));
        out.push(Triple::new(paper.clone(), v.reports_result.clone(), node.clone()));
        out.push(Triple::new(node.clone(), v.reported_in_paper.clone(), paper.clone()));

        if !entry.task.is_empty() {
            let task = self.named_entity(EntityKind::Task, &entry.task, out);
            out.push(Triple::new(node.clone(), v.evaluates_task.clone(), task));
        }
        if !entry.dataset.is_empty() {
            let dataset = self.named_entity(EntityKind::Dataset, &entry.dataset, out);
            out.push(Triple::new(node.clone(), v.on_dataset.clone(), dataset));
        }

        let attributes = [
            (&v.model_name, &entry.model),
            (&v.metric_name, &entry.metric),
            (&v.metric_value, &entry.value),
            (&v.rank, &entry.rank),
        ];
        for (prop, value) in attributes {
            if !value.is_empty() {
                out.push(Triple::new(
                    node.clone(),
                    prop.clone(),
                    Literal::new_simple_literal(value),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize_value;
    use oxigraph::model::Term;
    use serde_json::json;

    fn sample() -> CanonicalRecord {
        normalize_value(&json!({
            "sourceUrl": "https://arxiv.org/pdf/2103.14030v2.pdf",
            "title": "T",
            "tasks": ["Image Classification"],
            "results": [{
                "task": "Segmentation", "dataset": "ADE20K", "model": "M",
                "metric": "mIoU", "value": "53.50", "rank": "75"
            }]
        }))
        .unwrap()
    }

    #[test]
    fn names_collapse_case_and_whitespace() {
        assert_eq!(name_key("  Image   Classification "), "image classification");
        assert_eq!(
            entity_iri(EntityKind::Task, &name_key("Image Classification")),
            entity_iri(EntityKind::Task, &name_key("image  classification")),
        );
    }

    #[test]
    fn same_name_different_kind_differs() {
        assert_ne!(
            entity_iri(EntityKind::Task, "imagenet"),
            entity_iri(EntityKind::Dataset, "imagenet"),
        );
    }

    #[test]
    fn url_key_normalizes_scheme_host_and_trailing_slash() {
        assert_eq!(
            url_key(" HTTPS://ArXiv.org/pdf/2103.14030v2.pdf#page=2 "),
            "https://arxiv.org/pdf/2103.14030v2.pdf"
        );
        assert_eq!(url_key("https://x.org/Paper/"), "https://x.org/Paper");
    }

    #[test]
    fn url_variants_share_one_pdf_url() {
        let mapper = GraphMapper::new();
        let a = normalize_value(&json!({"url": "https://ArXiv.org/pdf/1.pdf", "title": "T"})).unwrap();
        let b = normalize_value(&json!({"url": "https://arxiv.org/pdf/1.pdf#page=3", "title": "T"})).unwrap();
        assert_eq!(mapper.map_record(&a), mapper.map_record(&b));

        let v = mapper.vocab();
        let pdf_urls: Vec<_> = mapper
            .map_record(&a)
            .into_iter()
            .filter(|t| t.predicate == v.pdf_url)
            .map(|t| t.object)
            .collect();
        assert_eq!(
            pdf_urls,
            vec![Term::from(Literal::new_typed_literal(
                "https://arxiv.org/pdf/1.pdf",
                xsd::ANY_URI
            ))]
        );
    }

    #[test]
    fn mapping_is_deterministic() {
        let mapper = GraphMapper::new();
        let rec = sample();
        assert_eq!(mapper.map_record(&rec), mapper.map_record(&rec));
    }

    #[test]
    fn result_links_paper_task_and_dataset() {
        let mapper = GraphMapper::new();
        let rec = sample();
        let triples = mapper.map_record(&rec);
        let v = mapper.vocab();
        let paper = mapper.paper_iri(&rec);

        let reports: Vec<_> = triples
            .iter()
            .filter(|t| t.predicate == v.reports_result)
            .collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].subject.to_string(), paper.to_string());

        let segmentation = entity_iri(EntityKind::Task, "segmentation");
        assert!(
            triples
                .iter()
                .any(|t| t.predicate == v.evaluates_task && t.object == Term::from(segmentation.clone()))
        );
        let ade = entity_iri(EntityKind::Dataset, "ade20k");
        assert!(
            triples
                .iter()
                .any(|t| t.predicate == v.on_dataset && t.object == Term::from(ade.clone()))
        );
        assert!(
            triples
                .iter()
                .any(|t| t.predicate == v.metric_value
                    && t.object == Term::from(Literal::new_simple_literal("53.50")))
        );
    }

    #[test]
    fn year_is_typed_g_year() {
        let mapper = GraphMapper::new();
        let triples = mapper.map_record(&sample());
        let year = triples
            .iter()
            .find(|t| t.predicate == mapper.vocab().year)
            .unwrap();
        assert_eq!(
            year.object,
            Term::from(Literal::new_typed_literal("2021", xsd::G_YEAR))
        );
    }
}
