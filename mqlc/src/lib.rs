//! # mqlc
//!
//! Translator for MongoDB-shaped queries and aggregation pipelines,
//! targeting SQL over two backends: SQLite tables holding one JSON
//! document per row, and ClickHouse for analytics. Translation is pure;
//! running the result is the executor's job.
//!
//! ```ascii
//!        filter / pipeline (bson)
//!
//!                  │
//!        translate │   stage translators
//!                  │   expression & filter translators
//!                  │   dialect capability table
//!                  ▼
//!
//!        SqlQuery { sql, params, facets }
//!
//!                  │
//!     exec::run    │   backend handle (injected)
//!                  │   $function sandbox (injected)
//!                  │   post-sort, facet assembly
//!                  ▼
//!
//!        documents (bson)
//! ```
//!
//! Two invariants hold for every translation: user values only ever
//! reach the SQL as `?` placeholders whose bound values sit in
//! [SqlQuery::params] in placeholder order, and every field name spliced
//! into the SQL has passed the validators in [ident].
//!
//! ## Example
//!
//! ```
//! use bson::doc;
//!
//! let query = mqlc::translate_pipeline(
//!     "users",
//!     &[doc! { "$match": { "status": "active", "age": { "$gte": 18 } } }],
//!     &mqlc::Options::default(),
//! )?;
//!
//! assert_eq!(
//!     query.sql,
//!     "SELECT data FROM users WHERE json_extract(data, '$.status') = ? \
//!      AND json_extract(data, '$.age') >= ?"
//! );
//! assert_eq!(query.params.len(), 2);
//! # Ok::<(), mqlc::Error>(())
//! ```

#![forbid(unsafe_code)]

mod error;
pub mod exec;
pub mod ident;
mod params;
pub mod routing;
pub mod sql;

use bson::Document;

pub use error::{Error, Reason, Result, WithErrorInfo};
pub use params::{ParamBuf, ParamValue};
pub use sql::{Dialect, FacetQuery, SqlQuery};

/// Translation options. An instance is cheap and reusable; the same
/// options and input always produce the same SQL and parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Target dialect to translate for.
    pub dialect: Dialect,

    /// Run the rule-based stage rewrites (merging adjacent stages,
    /// pushing filters upstream) before planning.
    ///
    /// Defaults to true.
    pub optimize: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            dialect: Dialect::default(),
            optimize: true,
        }
    }
}

impl Options {
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    pub fn no_optimize(self) -> Self {
        self.with_optimize(false)
    }
}

/// Translate an aggregation pipeline against `collection`.
pub fn translate_pipeline(
    collection: &str,
    pipeline: &[Document],
    options: &Options,
) -> Result<SqlQuery> {
    sql::translate(collection, pipeline, options)
}

/// Options for the find-style entry point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub projection: Option<Document>,
    pub sort: Option<Document>,
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}

/// Translate a plain filter query, the CRUD path's `find()`.
///
/// Internally a pipeline: the filter becomes `$match` and the options
/// become their corresponding stages, so both entry points share one
/// planner.
pub fn translate_find(
    collection: &str,
    filter: &Document,
    find: &FindOptions,
    options: &Options,
) -> Result<SqlQuery> {
    let mut pipeline = Vec::new();
    if !filter.is_empty() {
        pipeline.push(bson::doc! { "$match": filter.clone() });
    }
    if let Some(sort) = &find.sort {
        pipeline.push(bson::doc! { "$sort": sort.clone() });
    }
    if let Some(skip) = find.skip {
        pipeline.push(bson::doc! { "$skip": skip });
    }
    if let Some(limit) = find.limit {
        pipeline.push(bson::doc! { "$limit": limit });
    }
    if let Some(projection) = &find.projection {
        pipeline.push(bson::doc! { "$project": projection.clone() });
    }
    translate_pipeline(collection, &pipeline, options)
}
