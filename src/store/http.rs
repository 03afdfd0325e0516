//! SPARQL 1.1 over HTTP, laid out the way Apache Jena Fuseki serves a dataset:
//!
//! - `POST {endpoint}/{dataset}/update`: `INSERT DATA` and `CLEAR ALL`
//! - `POST {endpoint}/{dataset}/sparql`: `SELECT (COUNT(*) AS ?count)`
//! - `GET  {endpoint}/$/ping`: liveness

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

use super::{SyncBatch, TripleSink};

const COUNT_QUERY: &str = "SELECT (COUNT(*) AS ?count) WHERE { ?s ?p ?o }";
const SPARQL_RESULTS_JSON: &str = "application/sparql-results+json";
const SPARQL_UPDATE: &str = "application/sparql-update";
/// Longest response body echoed into an error message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Server base URL, e.g. `http://localhost:3030`.
    pub endpoint: String,
    pub dataset: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// Remote triplestore client.
pub struct HttpTripleStore {
    config: HttpStoreConfig,
    agent: ureq::Agent,
    auth_header: Option<String>,
}

impl HttpTripleStore {
    pub fn new(config: HttpStoreConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let auth_header = config
            .username
            .as_deref()
            .map(|user| basic_auth(user, config.password.as_deref().unwrap_or("")));
        Self {
            config,
            agent,
            auth_header,
        }
    }

    fn base(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    pub fn update_url(&self) -> String {
        format!("{}/{}/update", self.base(), self.config.dataset)
    }

    pub fn query_url(&self) -> String {
        format!("{}/{}/sparql", self.base(), self.config.dataset)
    }

    pub fn ping_url(&self) -> String {
        format!("{}/$/ping", self.base())
    }

    fn post(&self, url: &str) -> ureq::Request {
        let req = self.agent.post(url);
        match &self.auth_header {
            Some(auth) => req.set("Authorization", auth),
            None => req,
        }
    }

    fn update(&self, body: &str) -> SyncResult<()> {
        self.post(&self.update_url())
            .set("Content-Type", SPARQL_UPDATE)
            .send_string(body)
            .map_err(classify)?;
        Ok(())
    }
}

impl TripleSink for HttpTripleStore {
    fn name(&self) -> &str {
        "http"
    }

    fn insert(&self, batch: &SyncBatch) -> SyncResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.update(&insert_data(batch))
    }

    fn triple_count(&self) -> SyncResult<u64> {
        let resp = self
            .post(&self.query_url())
            .set("Accept", SPARQL_RESULTS_JSON)
            .send_form(&[("query", COUNT_QUERY)])
            .map_err(classify)?;
        let json: Value = resp.into_json().map_err(|e| SyncError::Permanent {
            status: None,
            message: format!("unreadable count response: {e}"),
        })?;
        parse_count_response(&json).ok_or_else(|| SyncError::Permanent {
            status: None,
            message: format!("count response has no numeric ?count binding: {json}"),
        })
    }

    fn ping(&self) -> SyncResult<()> {
        self.agent.get(&self.ping_url()).call().map_err(classify)?;
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        self.update("CLEAR ALL")
    }
}

/// `INSERT DATA { ... }` for every triple in the batch.
pub fn insert_data(batch: &SyncBatch) -> String {
    format!("INSERT DATA {{\n{}}}", batch.to_ntriples())
}

pub fn basic_auth(user: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{user}:{password}")))
}

/// Pull `?count` out of a SPARQL JSON results document.
pub fn parse_count_response(json: &Value) -> Option<u64> {
    let binding = json.pointer("/results/bindings/0/count/value")?;
    match binding {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Timeouts, throttling and server errors are worth retrying; anything else
/// the server said no to will say no again.
pub fn classify_status(status: u16, body: &str) -> SyncError {
    let mut message = format!("HTTP {status}");
    let body = body.trim();
    if !body.is_empty() {
        let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
        message.push_str(": ");
        message.push_str(&snippet);
    }
    match status {
        408 | 425 | 429 | 500..=599 => SyncError::Transient {
            status: Some(status),
            message,
        },
        _ => SyncError::Permanent {
            status: Some(status),
            message,
        },
    }
}

fn classify(err: ureq::Error) -> SyncError {
    match err {
        ureq::Error::Status(status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            classify_status(status, &body)
        }
        ureq::Error::Transport(t) => SyncError::Transient {
            status: None,
            message: t.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::{Literal, NamedNode, Triple};
    use serde_json::json;

    fn store() -> HttpTripleStore {
        HttpTripleStore::new(HttpStoreConfig {
            endpoint: "http://localhost:3030/".into(),
            dataset: "matic_papers_kg".into(),
            username: Some("admin".into()),
            password: Some("secret".into()),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn endpoints_follow_dataset_layout() {
        let s = store();
        assert_eq!(s.update_url(), "http://localhost:3030/matic_papers_kg/update");
        assert_eq!(s.query_url(), "http://localhost:3030/matic_papers_kg/sparql");
        assert_eq!(s.ping_url(), "http://localhost:3030/$/ping");
    }

    #[test]
    fn basic_auth_header() {
        assert_eq!(basic_auth("admin", "secret"), "Basic YWRtaW46c2VjcmV0");
        assert_eq!(store().auth_header.as_deref(), Some("Basic YWRtaW46c2VjcmV0"));
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(classify_status(503, "busy").is_transient());
        assert!(classify_status(429, "").is_transient());
        assert!(classify_status(408, "").is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        let err = classify_status(401, "Unauthorized");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("401"));
        assert!(!classify_status(400, "Parse error").is_transient());
    }

    #[test]
    fn count_response_parses() {
        let body = json!({
            "head": { "vars": ["count"] },
            "results": { "bindings": [{
                "count": {
                    "type": "literal",
                    "datatype": "http://www.w3.org/2001/XMLSchema#integer",
                    "value": "1234"
                }
            }]}
        });
        assert_eq!(parse_count_response(&body), Some(1234));
        assert_eq!(parse_count_response(&json!({ "results": { "bindings": [] } })), None);
    }

    #[test]
    fn insert_data_wraps_ntriples() {
        let batch = SyncBatch::new(
            7,
            vec![Triple::new(
                NamedNode::new_unchecked("http://x.org/s"),
                NamedNode::new_unchecked("http://x.org/p"),
                Literal::new_simple_literal("a \"quoted\" title"),
            )],
        );
        let body = insert_data(&batch);
        assert!(body.starts_with("INSERT DATA {\n<http://x.org/s>"));
        assert!(body.contains(r#""a \"quoted\" title" ."#));
        assert!(body.ends_with(".\n}"));
    }
}
