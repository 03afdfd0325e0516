//! Record normalization: heterogeneous paper JSON → [`CanonicalRecord`].
//!
//! Field names are resolved through a static alias table. Each canonical field
//! lists its candidate key paths in priority order; the first present,
//! non-empty candidate wins. Nested paths (`mentions.tasks`) are walked one
//! object level at a time.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

/// A raw input record: arbitrary string keys to JSON values.
pub type RawRecord = Map<String, Value>;

/// Candidate key paths for one canonical field, highest priority first.
pub struct FieldAliases {
    pub canonical: &'static str,
    pub candidates: &'static [&'static str],
}

pub const SOURCE_URL: FieldAliases = FieldAliases {
    canonical: "sourceUrl",
    candidates: &["sourceUrl", "url", "pdfUrl", "pdf_url"],
};

pub const ORIGIN_URL: FieldAliases = FieldAliases {
    canonical: "originUrl",
    candidates: &["originUrl", "origin", "papersWithCodeUrl", "paperswithcode_url"],
};

pub const TITLE: FieldAliases = FieldAliases {
    canonical: "title",
    candidates: &["title", "paperTitle", "paper_title"],
};

pub const YEAR: FieldAliases = FieldAliases {
    canonical: "year",
    candidates: &["year", "publicationYear"],
};

pub const TASKS: FieldAliases = FieldAliases {
    canonical: "tasks",
    candidates: &["tasks", "mentions.tasks"],
};

pub const DATASETS: FieldAliases = FieldAliases {
    canonical: "datasets",
    candidates: &["datasets", "mentions.datasets"],
};

pub const METHODS: FieldAliases = FieldAliases {
    canonical: "methods",
    candidates: &["methods", "mentions.methods"],
};

pub const RESULTS: FieldAliases = FieldAliases {
    canonical: "results",
    candidates: &["results", "mentions.results"],
};

/// The full alias table, in declaration order.
pub const ALIAS_TABLE: &[&FieldAliases] = &[
    &SOURCE_URL,
    &ORIGIN_URL,
    &TITLE,
    &YEAR,
    &TASKS,
    &DATASETS,
    &METHODS,
    &RESULTS,
];

/// One reported benchmark result. Numeric-looking values stay strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultEntry {
    pub task: String,
    pub dataset: String,
    pub model: String,
    pub metric: String,
    pub value: String,
    pub rank: String,
}

/// A paper after alias resolution and validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub source_url: String,
    pub origin_url: Option<String>,
    pub title: String,
    pub year: Option<i32>,
    pub tasks: BTreeSet<String>,
    pub datasets: BTreeSet<String>,
    pub methods: BTreeSet<String>,
    pub results: Vec<ResultEntry>,
}

/// Normalize a JSON value that should be a paper object.
pub fn normalize_value(value: &Value) -> Result<CanonicalRecord, ValidationError> {
    match value {
        Value::Object(map) => normalize(map),
        other => Err(ValidationError::new(
            "record",
            format!("must be a JSON object, got {}", json_kind(other)),
        )),
    }
}

/// Normalize one raw record.
pub fn normalize(raw: &RawRecord) -> Result<CanonicalRecord, ValidationError> {
    let source_url = resolve_string(raw, &SOURCE_URL)
        .ok_or_else(|| ValidationError::new(SOURCE_URL.canonical, "is missing or empty"))?;
    let title = resolve_string(raw, &TITLE)
        .ok_or_else(|| ValidationError::new(TITLE.canonical, "is missing or empty"))?;
    let origin_url = resolve_string(raw, &ORIGIN_URL);

    let year = match resolve(raw, &YEAR) {
        Some(value) => Some(parse_year(value)?),
        None => year_from_url(&source_url),
    };

    let results = resolve(raw, &RESULTS)
        .map(result_entries)
        .unwrap_or_default();

    Ok(CanonicalRecord {
        source_url,
        origin_url,
        title,
        year,
        tasks: resolve(raw, &TASKS).map(string_set).unwrap_or_default(),
        datasets: resolve(raw, &DATASETS).map(string_set).unwrap_or_default(),
        methods: resolve(raw, &METHODS).map(string_set).unwrap_or_default(),
        results,
    })
}

/// First present, non-null, non-empty candidate for a field.
fn resolve<'a>(raw: &'a RawRecord, aliases: &FieldAliases) -> Option<&'a Value> {
    aliases
        .candidates
        .iter()
        .filter_map(|path| lookup_path(raw, path))
        .find(|v| !is_blank(v))
}

fn resolve_string(raw: &RawRecord, aliases: &FieldAliases) -> Option<String> {
    resolve(raw, aliases)
        .map(scalar_to_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn lookup_path<'a>(raw: &'a RawRecord, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = raw.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn parse_year(value: &Value) -> Result<i32, ValidationError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    };
    parsed
        .filter(|y| (1000..=9999).contains(y))
        .ok_or_else(|| ValidationError::new(YEAR.canonical, format!("is not a year: {value}")))
}

/// Coerce a scalar to its string form. Objects and arrays render as compact JSON.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn string_set(value: &Value) -> BTreeSet<String> {
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .map(scalar_to_string)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn result_entries(value: &Value) -> Vec<ResultEntry> {
    let Value::Array(items) = value else {
        tracing::warn!(kind = json_kind(value), "`results` is not an array; ignoring");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(obj) => Some(result_entry(obj)),
            other => {
                tracing::warn!(kind = json_kind(other), "skipping non-object result entry");
                None
            }
        })
        .collect()
}

fn result_entry(obj: &Map<String, Value>) -> ResultEntry {
    let field = |name: &str| {
        obj.get(name)
            .map(scalar_to_string)
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };
    ResultEntry {
        task: field("task"),
        dataset: field("dataset"),
        model: field("model"),
        metric: field("metric"),
        value: field("value"),
        rank: field("rank"),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Year extraction
// ---------------------------------------------------------------------------

/// New-style arXiv identifier: YYMM.NNNNN with an optional version suffix.
static ARXIV_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{2})(\d{2})\.\d{4,5}(?:v\d+)?$").expect("static regex"));

/// A file name that starts with a plausible four-digit year.
static LEADING_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^((?:19|20)\d{2})(?:\D|$)").expect("static regex"));

/// First year of new-style arXiv identifiers (0704 = April 2007).
const ARXIV_FIRST_YY: u32 = 7;

/// Extract a publication year from the last path segment of a source URL.
///
/// Only two shapes are recognised: a new-style arXiv identifier
/// (`2103.14030v2` → 2021) and a file name beginning with a four-digit year.
/// Anything else yields `None`.
pub fn year_from_url(url: &str) -> Option<i32> {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let segment = without_query.trim_end_matches('/').rsplit('/').next()?;
    let stem = strip_suffix_ci(segment, ".pdf");

    if let Some(caps) = ARXIV_ID.captures(stem) {
        let yy: u32 = caps[1].parse().ok()?;
        let mm: u32 = caps[2].parse().ok()?;
        if (1..=12).contains(&mm) && yy >= ARXIV_FIRST_YY {
            return i32::try_from(2000 + yy).ok();
        }
        return None;
    }

    LEADING_YEAR
        .captures(stem)
        .and_then(|caps| caps[1].parse().ok())
}

fn strip_suffix_ci<'a>(s: &'a str, suffix: &str) -> &'a str {
    if s.len() >= suffix.len() && s[s.len() - suffix.len()..].eq_ignore_ascii_case(suffix) {
        &s[..s.len() - suffix.len()]
    } else {
        s
    }
}
