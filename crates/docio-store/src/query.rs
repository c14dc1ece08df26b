//! Query model
//!
//! A small predicate and sort model: enough to count documents, look them
//! up by id or field value, and page through sorted results.

use crate::document::{Document, ID_FIELD};
use docio_common::DocId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Document predicate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Filter {
    /// Match every document (`*:*`)
    All,
    /// Match a single id
    Id(DocId),
    /// Field equals value; array fields match if any element equals
    Term { field: String, value: Value },
    /// Numeric field within inclusive bounds
    Range {
        field: String,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// All sub-filters match
    And(Vec<Filter>),
}

impl Filter {
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::All => true,
            Self::Id(id) => doc.id() == id,
            Self::Term { field, value } => {
                if field == ID_FIELD {
                    return value.as_str() == Some(doc.id().as_str())
                        || value.as_u64().is_some_and(|n| n.to_string() == doc.id().as_str());
                }
                match doc.get(field) {
                    Some(Value::Array(items)) => items.iter().any(|v| v == value),
                    Some(v) => v == value,
                    None => false,
                }
            }
            Self::Range { field, min, max } => {
                let Some(n) = doc.get(field).and_then(Value::as_f64) else {
                    return false;
                };
                min.is_none_or(|lo| n >= lo) && max.is_none_or(|hi| n <= hi)
            }
            Self::And(filters) => filters.iter().all(|f| f.matches(doc)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    pub order: SortOrder,
}

/// A query against one store or, when `distrib` is set, a whole collection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub filter: Filter,
    pub sort: Vec<SortField>,
    /// Maximum documents returned; `num_found` is unaffected
    pub rows: Option<usize>,
    /// Fan out to every shard (true) or answer from local replicas only
    pub distrib: bool,
}

impl Default for Query {
    fn default() -> Self {
        Self::all()
    }
}

impl Query {
    /// Match all documents
    #[must_use]
    pub const fn all() -> Self {
        Self::new(Filter::All)
    }

    #[must_use]
    pub const fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: Vec::new(),
            rows: None,
            distrib: true,
        }
    }

    /// Match one document id
    #[must_use]
    pub const fn id(id: DocId) -> Self {
        Self::new(Filter::Id(id))
    }

    /// Match a field value
    #[must_use]
    pub fn term(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(Filter::Term {
            field: field.into(),
            value: value.into(),
        })
    }

    #[must_use]
    pub const fn rows(mut self, rows: usize) -> Self {
        self.rows = Some(rows);
        self
    }

    #[must_use]
    pub fn sort_asc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            order: SortOrder::Asc,
        });
        self
    }

    #[must_use]
    pub fn sort_desc(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            order: SortOrder::Desc,
        });
        self
    }

    /// Answer from local replicas only (`distrib=false`)
    #[must_use]
    pub const fn local(mut self) -> Self {
        self.distrib = false;
        self
    }

    /// Evaluate against a set of documents
    pub fn execute<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> QueryResult {
        let matched: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.filter.matches(d))
            .cloned()
            .collect();
        self.finish(matched)
    }

    /// Sort and page an already-filtered set
    fn finish(&self, mut docs: Vec<Document>) -> QueryResult {
        let num_found = docs.len() as u64;
        docs.sort_by(|a, b| self.compare(a, b));
        if let Some(rows) = self.rows {
            docs.truncate(rows);
        }
        QueryResult { num_found, docs }
    }

    fn compare(&self, a: &Document, b: &Document) -> Ordering {
        for key in &self.sort {
            let ord = match (sort_value(a, &key.field), sort_value(b, &key.field)) {
                // Missing values sort last regardless of direction
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
                (Some(x), Some(y)) => match key.order {
                    SortOrder::Asc => compare_keys(&x, &y),
                    SortOrder::Desc => compare_keys(&x, &y).reverse(),
                },
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id().cmp(b.id())
    }
}

fn sort_value<'a>(doc: &'a Document, field: &str) -> Option<SortKey<'a>> {
    if field == ID_FIELD {
        return Some(SortKey::Str(doc.id().as_str()));
    }
    match doc.get(field)? {
        Value::Number(n) => n.as_f64().map(SortKey::Num),
        Value::String(s) => Some(SortKey::Str(s)),
        Value::Bool(b) => Some(SortKey::Num(if *b { 1.0 } else { 0.0 })),
        _ => None,
    }
}

enum SortKey<'a> {
    Num(f64),
    Str(&'a str),
}

// Numbers sort before strings
fn compare_keys(a: &SortKey<'_>, b: &SortKey<'_>) -> Ordering {
    match (a, b) {
        (SortKey::Num(x), SortKey::Num(y)) => x.total_cmp(y),
        (SortKey::Str(x), SortKey::Str(y)) => x.cmp(y),
        (SortKey::Num(_), SortKey::Str(_)) => Ordering::Less,
        (SortKey::Str(_), SortKey::Num(_)) => Ordering::Greater,
    }
}

/// Result of a query
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Total number of matching documents
    pub num_found: u64,
    /// Returned documents, sorted and limited by `rows`
    pub docs: Vec<Document>,
}

impl QueryResult {
    /// Merge per-shard results of a distributed query
    ///
    /// Each partial result must already be limited to `rows`; the merge
    /// re-sorts and applies the limit again.
    #[must_use]
    pub fn merge(query: &Query, parts: impl IntoIterator<Item = Self>) -> Self {
        let mut num_found = 0;
        let mut docs = Vec::new();
        for part in parts {
            num_found += part.num_found;
            docs.extend(part.docs);
        }
        let mut merged = query.finish(docs);
        merged.num_found = num_found;
        merged
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.docs.iter().map(|d| d.id().as_str()).collect()
    }
}
