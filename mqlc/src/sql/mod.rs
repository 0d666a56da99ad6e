//! Translation of filters and aggregation pipelines into SQL.

mod dialect;
mod gen_expr;
mod gen_filter;
mod gen_query;
mod gen_stage;
mod search;

pub use dialect::Dialect;
pub(crate) use dialect::DialectHandler;
pub(crate) use gen_expr::{FunctionArg, FunctionPayload, FUNCTION_MARKER};
pub(crate) use gen_stage::sort_direction;

use std::collections::HashMap;

use crate::ident::{self, FieldPath};
use crate::params::{ParamBuf, ParamValue};
use crate::{Options, Result};

/// Name of the column holding the document envelope.
pub(crate) const DOC_COLUMN: &str = "data";

/// A translated query: SQL text plus the values bound at its placeholders,
/// in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<ParamValue>,
    /// Sub-queries produced by `$facet`; empty otherwise. Each runs
    /// independently and contributes one field of the assembled result.
    pub facets: Vec<FacetQuery>,
    /// The last `$sort` specification of the pipeline, re-applied by the
    /// executor after deferred functions are resolved.
    pub post_sort: Option<bson::Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetQuery {
    pub name: String,
    pub sql: String,
    pub params: Vec<ParamValue>,
}

/// A piece of SQL together with the parameters its placeholders bind.
/// Fragments are assembled into statements in SQL textual order, which is
/// what keeps the parameter vector aligned with the placeholders.
#[derive(Debug, Clone, Default)]
pub(crate) struct Fragment {
    pub sql: String,
    pub params: ParamBuf,
}

/// State shared across the translators of one pipeline.
pub(crate) struct Context {
    pub dialect: Box<dyn DialectHandler>,
    pub collection: String,
    /// `$$name` bindings introduced by `$lookup` `let`, mapping the
    /// variable to the SQL expression it stands for.
    pub variables: HashMap<String, String>,
    /// Field paths referenced by `$function` arguments in the stage being
    /// translated; `$project` folds these into its output envelope.
    pub function_fields: Vec<FieldPath>,
}

impl Context {
    pub fn new(dialect: Dialect, collection: &str) -> Result<Self> {
        ident::validate_identifier(collection)?;
        Ok(Context {
            dialect: dialect.handler(),
            collection: collection.to_string(),
            variables: HashMap::new(),
            function_fields: Vec::new(),
        })
    }
}

/// Translate an aggregation pipeline.
pub(crate) fn translate(
    collection: &str,
    pipeline: &[bson::Document],
    options: &Options,
) -> Result<SqlQuery> {
    gen_query::plan(collection, pipeline, options)
}
