//! Execution of translated pipelines.
//!
//! The executor owns no connection: it drives an injected [Backend]
//! handle, parses the returned rows into documents, resolves deferred
//! `$function` markers through an injected [SandboxLoader], re-applies
//! the pipeline's final sort in memory, and assembles `$facet` results.
//! Translation stays pure; all suspension points live here.

mod functions;
mod sort;

use std::collections::HashMap;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::stream::{self, StreamExt, TryStreamExt};

use crate::params::ParamValue;
use crate::sql::SqlQuery;
use crate::{Error, Reason, Result};

/// One row returned by the backend. Only the document envelope and the
/// search score are ever inspected.
#[derive(Debug, Clone)]
pub struct Row {
    pub data: RowData,
    pub search_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum RowData {
    /// JSON text, as the embedded backend stores it.
    Text(String),
    /// An already-structured value from the analytical backend.
    Structured(serde_json::Value),
}

/// The backend handle the executor drives. Implementations supply their
/// own pooling and concurrency discipline.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, sql: &str, params: &[ParamValue]) -> Result<Vec<Row>>;
}

/// External sandbox for user-defined function bodies. Runs `body` once
/// per argument tuple and returns one scalar per tuple, in input order.
/// Function bodies are never evaluated in-process.
#[async_trait]
pub trait SandboxLoader: Send + Sync {
    async fn execute_batch(&self, body: &str, args: Vec<Vec<Bson>>) -> Result<Vec<Bson>>;
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Cap on concurrently running `$facet` sub-queries.
    pub facet_concurrency: usize,
    /// Rewrite failing function sites to null instead of failing the run.
    /// Affected documents then carry a `_functionErrors` list naming the
    /// sites.
    pub lenient_functions: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        ExecOptions {
            facet_concurrency: 4,
            lenient_functions: false,
        }
    }
}

pub struct Executor<B> {
    backend: B,
    sandbox: Option<Box<dyn SandboxLoader>>,
    options: ExecOptions,
}

impl<B: Backend> Executor<B> {
    pub fn new(backend: B) -> Self {
        Executor {
            backend,
            sandbox: None,
            options: ExecOptions::default(),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Box<dyn SandboxLoader>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    /// Run a translated query and return its result documents, in order.
    pub async fn run(&self, query: &SqlQuery) -> Result<Vec<Document>> {
        if !query.facets.is_empty() {
            return Ok(vec![self.run_facets(query).await?]);
        }

        let rows = self.backend.execute(&query.sql, &query.params).await?;
        let mut docs = rows
            .into_iter()
            .map(parse_row)
            .collect::<Result<Vec<_>>>()?;

        functions::resolve(
            &mut docs,
            self.sandbox.as_deref(),
            self.options.lenient_functions,
        )
        .await?;

        // The SQL-level sort ordered placeholder text, not resolved
        // values; the pipeline's last sort is authoritative.
        if let Some(spec) = &query.post_sort {
            sort::sort_documents(&mut docs, spec)?;
        }
        Ok(docs)
    }

    /// Facet sub-queries run concurrently; results are keyed by facet
    /// name, so completion order does not matter.
    async fn run_facets(&self, query: &SqlQuery) -> Result<Document> {
        let mut results: HashMap<String, Vec<Document>> = stream::iter(query.facets.iter())
            .map(|facet| async move {
                log::trace!("running facet `{}`", facet.name);
                let rows = self.backend.execute(&facet.sql, &facet.params).await?;
                let mut docs = rows
                    .into_iter()
                    .map(parse_row)
                    .collect::<Result<Vec<_>>>()?;
                functions::resolve(
                    &mut docs,
                    self.sandbox.as_deref(),
                    self.options.lenient_functions,
                )
                .await?;
                Ok::<_, Error>((facet.name.clone(), docs))
            })
            .buffer_unordered(self.options.facet_concurrency.max(1))
            .try_collect()
            .await?;

        let mut assembled = Document::new();
        for facet in &query.facets {
            let docs = results.remove(&facet.name).unwrap_or_default();
            assembled.insert(
                facet.name.clone(),
                Bson::Array(docs.into_iter().map(Bson::Document).collect()),
            );
        }
        Ok(assembled)
    }
}

fn parse_row(row: Row) -> Result<Document> {
    let value: serde_json::Value = match row.data {
        RowData::Text(text) => serde_json::from_str(&text).map_err(|e| {
            Error::new(Reason::Execution {
                message: format!("backend returned malformed JSON: {e}"),
            })
        })?,
        RowData::Structured(value) => value,
    };

    let bson = bson::to_bson(&value).map_err(|e| {
        Error::new(Reason::Execution {
            message: format!("backend row is not representable: {e}"),
        })
    })?;
    let mut doc = match bson {
        Bson::Document(doc) => doc,
        _ => {
            return Err(Error::new(Reason::Execution {
                message: "backend row is not a document".to_string(),
            }))
        }
    };

    if let Some(score) = row.search_score {
        doc.insert("_searchScore", Bson::Double(score));
    }
    Ok(doc)
}

/// Look a dotted path up in a document; digit segments index arrays.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Bson::Document(doc) => doc.get(segment)?,
            Bson::Array(array) => array.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate documents.
/// Array segments only descend into existing positions.
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_)) | Some(Bson::Array(_))) {
                doc.insert(head, Document::new());
            }
            match doc.get_mut(head) {
                Some(Bson::Document(inner)) => set_path(inner, rest, value),
                Some(Bson::Array(array)) => set_in_array(array, rest, value),
                _ => {}
            }
        }
    }
}

fn set_in_array(array: &mut Vec<Bson>, path: &str, value: Bson) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let Ok(index) = head.parse::<usize>() else {
        return;
    };
    let Some(slot) = array.get_mut(index) else {
        return;
    };
    match rest {
        None => *slot = value,
        Some(rest) => match slot {
            Bson::Document(inner) => set_path(inner, rest, value),
            Bson::Array(inner) => set_in_array(inner, rest, value),
            _ => {}
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bson::doc;

    use super::*;
    use crate::sql::{FacetQuery, FUNCTION_MARKER};

    fn text_row(json: &str) -> Row {
        Row {
            data: RowData::Text(json.to_string()),
            search_score: None,
        }
    }

    /// Returns canned rows per SQL statement.
    struct MapBackend {
        responses: Vec<(String, Vec<Row>)>,
    }

    #[async_trait]
    impl Backend for MapBackend {
        async fn execute(&self, sql: &str, _params: &[ParamValue]) -> Result<Vec<Row>> {
            self.responses
                .iter()
                .find(|(key, _)| key == sql)
                .map(|(_, rows)| rows.clone())
                .ok_or_else(|| {
                    Error::new(Reason::Execution {
                        message: format!("unexpected query: {sql}"),
                    })
                })
        }
    }

    /// Sums numeric argument tuples and records the batches it saw.
    struct AddingSandbox {
        calls: std::sync::Arc<Mutex<Vec<(String, Vec<Vec<Bson>>)>>>,
    }

    #[async_trait]
    impl SandboxLoader for AddingSandbox {
        async fn execute_batch(&self, body: &str, args: Vec<Vec<Bson>>) -> Result<Vec<Bson>> {
            self.calls
                .lock()
                .unwrap()
                .push((body.to_string(), args.clone()));
            Ok(args
                .iter()
                .map(|tuple| {
                    let sum: f64 = tuple
                        .iter()
                        .map(|v| match v {
                            Bson::Int32(n) => f64::from(*n),
                            Bson::Int64(n) => *n as f64,
                            Bson::Double(f) => *f,
                            _ => 0.0,
                        })
                        .sum();
                    Bson::Double(sum)
                })
                .collect())
        }
    }

    struct FailingSandbox;

    #[async_trait]
    impl SandboxLoader for FailingSandbox {
        async fn execute_batch(&self, _body: &str, _args: Vec<Vec<Bson>>) -> Result<Vec<Bson>> {
            Err(Error::new(Reason::Execution {
                message: "sandbox crashed".to_string(),
            }))
        }
    }

    fn placeholder(body: &str, fields: &[&str]) -> String {
        let payload = serde_json::json!({
            "body": body,
            "args": fields.iter().map(|f| serde_json::json!({"kind": "field", "path": f})).collect::<Vec<_>>(),
            "literals": {},
        });
        format!("{FUNCTION_MARKER}{payload}")
    }

    fn function_query(sql: &str) -> SqlQuery {
        SqlQuery {
            sql: sql.to_string(),
            params: vec![],
            facets: vec![],
            post_sort: Some(doc! { "s": 1 }),
        }
    }

    /// Rows as JSON text, with the marker properly escaped inside.
    fn marker_row(marker: &str, a: i64, b: i64) -> Row {
        text_row(&serde_json::json!({ "s": marker, "a": a, "b": b }).to_string())
    }

    #[tokio::test]
    async fn resolves_functions_and_post_sorts() {
        let marker = placeholder("(x, y) => x + y", &["a", "b"]);
        let rows = vec![
            marker_row(&marker, 5, -1),
            marker_row(&marker, 0, 10),
            marker_row(&marker, 1, 2),
        ];
        let backend = MapBackend {
            responses: vec![("Q".to_string(), rows)],
        };
        let calls = std::sync::Arc::new(Mutex::new(Vec::new()));
        let sandbox = AddingSandbox {
            calls: calls.clone(),
        };

        let executor = Executor::new(backend).with_sandbox(Box::new(sandbox));
        let docs = executor.run(&function_query("Q")).await.unwrap();

        let values: Vec<f64> = docs.iter().map(|d| d.get_f64("s").unwrap()).collect();
        assert_eq!(values, vec![3.0, 4.0, 10.0]);

        // One batched invocation, tuples in row order.
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "(x, y) => x + y");
        // JSON numbers come back from the row parser as 64-bit ints.
        assert_eq!(
            calls[0].1,
            vec![
                vec![Bson::Int64(5), Bson::Int64(-1)],
                vec![Bson::Int64(0), Bson::Int64(10)],
                vec![Bson::Int64(1), Bson::Int64(2)],
            ]
        );
    }

    #[tokio::test]
    async fn missing_sandbox_is_an_error() {
        let marker = placeholder("() => 1", &[]);
        let backend = MapBackend {
            responses: vec![(
                "Q".to_string(),
                vec![text_row(&serde_json::json!({ "s": marker }).to_string())],
            )],
        };
        let executor = Executor::new(backend);
        let err = executor.run(&function_query("Q")).await.unwrap_err();
        assert_eq!(err.reason, Reason::SandboxUnavailable);
    }

    #[tokio::test]
    async fn lenient_mode_nulls_failed_sites() {
        let marker = placeholder("() => boom()", &[]);
        let backend = MapBackend {
            responses: vec![(
                "Q".to_string(),
                vec![text_row(
                    &serde_json::json!({ "s": marker, "a": 1 }).to_string(),
                )],
            )],
        };
        let executor = Executor::new(backend)
            .with_sandbox(Box::new(FailingSandbox))
            .with_options(ExecOptions {
                lenient_functions: true,
                ..ExecOptions::default()
            });

        let query = SqlQuery {
            sql: "Q".to_string(),
            params: vec![],
            facets: vec![],
            post_sort: None,
        };
        let docs = executor.run(&query).await.unwrap();
        assert_eq!(docs[0].get("s"), Some(&Bson::Null));
        let errors = docs[0].get_array("_functionErrors").unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn facets_assemble_into_one_document() {
        let backend = MapBackend {
            responses: vec![
                (
                    "A".to_string(),
                    vec![text_row(r#"{"_id": "x", "n": 2}"#)],
                ),
                (
                    "B".to_string(),
                    vec![
                        text_row(r#"{"t": 1}"#),
                        text_row(r#"{"t": 2}"#),
                    ],
                ),
            ],
        };
        let executor = Executor::new(backend);

        let query = SqlQuery {
            sql: String::new(),
            params: vec![],
            facets: vec![
                FacetQuery {
                    name: "by_city".to_string(),
                    sql: "A".to_string(),
                    params: vec![],
                },
                FacetQuery {
                    name: "recent".to_string(),
                    sql: "B".to_string(),
                    params: vec![],
                },
            ],
            post_sort: None,
        };

        let docs = executor.run(&query).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get_array("by_city").unwrap().len(), 1);
        assert_eq!(docs[0].get_array("recent").unwrap().len(), 2);
    }

    #[test]
    fn path_helpers_roundtrip() {
        let mut doc = doc! { "a": { "b": [ { "c": 1 } ] } };
        assert_eq!(get_path(&doc, "a.b.0.c"), Some(&Bson::Int32(1)));
        assert_eq!(get_path(&doc, "a.x"), None);

        set_path(&mut doc, "a.b.0.c", Bson::Int32(2));
        assert_eq!(get_path(&doc, "a.b.0.c"), Some(&Bson::Int32(2)));

        set_path(&mut doc, "fresh.nested", Bson::Boolean(true));
        assert_eq!(get_path(&doc, "fresh.nested"), Some(&Bson::Boolean(true)));
    }
}
