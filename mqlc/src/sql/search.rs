//! Full-text search over the `<collection>_fts` companion table.
//!
//! `$search` joins the collection against its FTS index by rowid and
//! filters with a single bound `MATCH` query; `$text` does the same as a
//! WHERE-level membership test. The match query itself is assembled here
//! and bound as one parameter.

use bson::{Bson, Document};
use itertools::Itertools;

use super::{Context, Dialect};
use crate::params::{ParamBuf, ParamValue};
use crate::{Error, Reason, Result};

/// Score column attached alongside `data` by a `$search` stage.
pub(crate) const SCORE_COLUMN: &str = "_searchScore";

fn require_text_search(ctx: &Context) -> Result<()> {
    if ctx.dialect.supports_text_search() {
        Ok(())
    } else {
        Err(Error::new(Reason::FeatureUnavailable {
            feature: "text search".to_string(),
            engine: Dialect::ClickHouse.to_string(),
        }))
    }
}

/// `{$text: {$search: "..."}}` inside a filter; a membership test so it
/// can sit anywhere in a WHERE clause.
pub(crate) fn translate_text_filter(
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    require_text_search(ctx)?;

    let spec = value.as_document().ok_or_else(|| {
        Error::new(Reason::MalformedExpression {
            context: "$text takes a document".to_string(),
        })
    })?;
    let query = spec.get_str("$search").map_err(|_| {
        Error::new(Reason::MalformedExpression {
            context: "$text requires a `$search` string".to_string(),
        })
    })?;

    let fts = fts_table(ctx);
    let placeholder = params.push(ParamValue::String(query.to_string()));
    Ok(format!(
        "id IN (SELECT rowid FROM {fts} WHERE {fts} MATCH {placeholder})"
    ))
}

/// CTE body for a `$search` stage. Always carries the score column so the
/// relevance order survives later stages.
pub(crate) fn translate_search_stage(
    spec: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    require_text_search(ctx)?;

    let (operator, payload) = spec.iter().exactly_one().map_err(|_| {
        Error::new(Reason::MalformedStage {
            stage: "$search".to_string(),
            details: "exactly one search operator is required".to_string(),
        })
    })?;

    let query = translate_operator(operator, payload)?;
    let fts = fts_table(ctx);
    let collection = ctx.collection.clone();
    let placeholder = params.push(ParamValue::String(query));

    Ok(format!(
        "SELECT documents.data AS data, -bm25({fts}) AS {SCORE_COLUMN} \
         FROM {collection} AS documents \
         JOIN {fts} ON documents.id = {fts}.rowid \
         WHERE {fts} MATCH {placeholder} \
         ORDER BY {SCORE_COLUMN} DESC"
    ))
}

fn fts_table(ctx: &Context) -> String {
    format!("{}_fts", ctx.collection)
}

fn translate_operator(operator: &str, payload: &Bson) -> Result<String> {
    match operator {
        "text" => Ok(query_of(operator, payload)?),
        "phrase" => {
            let query = query_of(operator, payload)?;
            Ok(format!("\"{}\"", query.replace('"', "\"\"")))
        }
        "wildcard" => {
            let query = query_of(operator, payload)?;
            Ok(if query.ends_with('*') {
                query
            } else {
                format!("{query}*")
            })
        }
        "compound" => translate_compound(payload),
        name => Err(Error::new(Reason::UnsupportedOperator {
            name: format!("$search.{name}"),
        })),
    }
}

/// `must` and `filter` AND together, `should` forms one OR group, and
/// `mustNot` negates. `filter` clauses take part in matching only; FTS
/// scoring is unaffected by where a term sits in the boolean.
fn translate_compound(payload: &Bson) -> Result<String> {
    let spec = payload.as_document().ok_or_else(|| {
        Error::new(Reason::MalformedStage {
            stage: "$search".to_string(),
            details: "compound takes a document".to_string(),
        })
    })?;

    let mut parts = Vec::new();

    for key in ["must", "filter"] {
        for clause in clauses_of(spec, key)? {
            parts.push(format!("({clause})"));
        }
    }

    let should = clauses_of(spec, "should")?;
    if !should.is_empty() {
        parts.push(format!(
            "({})",
            should.iter().map(|c| format!("({c})")).join(" OR ")
        ));
    }

    for clause in clauses_of(spec, "mustNot")? {
        parts.push(format!("NOT ({clause})"));
    }

    if parts.is_empty() {
        return Err(Error::new(Reason::MalformedStage {
            stage: "$search".to_string(),
            details: "compound requires at least one clause".to_string(),
        }));
    }
    Ok(parts.into_iter().join(" AND "))
}

fn clauses_of(spec: &Document, key: &str) -> Result<Vec<String>> {
    let Some(value) = spec.get(key) else {
        return Ok(Vec::new());
    };
    let list = value.as_array().ok_or_else(|| {
        Error::new(Reason::MalformedStage {
            stage: "$search".to_string(),
            details: format!("compound `{key}` must be an array"),
        })
    })?;

    list.iter()
        .map(|clause| {
            let clause = clause.as_document().ok_or_else(|| {
                Error::new(Reason::MalformedStage {
                    stage: "$search".to_string(),
                    details: format!("compound `{key}` entries must be operators"),
                })
            })?;
            let (operator, payload) = clause.iter().exactly_one().map_err(|_| {
                Error::new(Reason::MalformedStage {
                    stage: "$search".to_string(),
                    details: "each compound clause takes one operator".to_string(),
                })
            })?;
            translate_operator(operator, payload)
        })
        .collect()
}

fn query_of(operator: &str, payload: &Bson) -> Result<String> {
    let spec = payload.as_document().ok_or_else(|| {
        Error::new(Reason::MalformedStage {
            stage: "$search".to_string(),
            details: format!("{operator} takes a document"),
        })
    })?;
    let query = spec.get_str("query").map_err(|_| {
        Error::new(Reason::MalformedStage {
            stage: "$search".to_string(),
            details: format!("{operator} requires a `query` string"),
        })
    })?;
    Ok(query.to_string())
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use insta::assert_snapshot;

    use super::*;
    use crate::sql::Dialect;

    fn ctx(dialect: Dialect) -> Context {
        Context::new(dialect, "articles").unwrap()
    }

    #[test]
    fn text_filter_is_a_membership_test() {
        let mut ctx = ctx(Dialect::Sqlite);
        let mut params = ParamBuf::new();
        let sql = translate_text_filter(
            &Bson::Document(doc! { "$search": "rust async" }),
            &mut ctx,
            &mut params,
        )
        .unwrap();
        assert_snapshot!(sql, @"id IN (SELECT rowid FROM articles_fts WHERE articles_fts MATCH ?)");
        assert_eq!(params.values(), &[ParamValue::String("rust async".into())]);
    }

    #[test]
    fn search_stage_joins_and_scores() {
        let mut ctx = ctx(Dialect::Sqlite);
        let mut params = ParamBuf::new();
        let sql = translate_search_stage(
            &doc! { "text": { "query": "sqlite", "path": "title" } },
            &mut ctx,
            &mut params,
        )
        .unwrap();
        assert_snapshot!(sql, @"SELECT documents.data AS data, -bm25(articles_fts) AS _searchScore FROM articles AS documents JOIN articles_fts ON documents.id = articles_fts.rowid WHERE articles_fts MATCH ? ORDER BY _searchScore DESC");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn compound_combines_clause_groups() {
        let mut ctx = ctx(Dialect::Sqlite);
        let mut params = ParamBuf::new();
        translate_search_stage(
            &doc! { "compound": {
                "must": [ { "text": { "query": "parser" } } ],
                "should": [
                    { "text": { "query": "nom" } },
                    { "phrase": { "query": "hand written" } },
                ],
                "mustNot": [ { "wildcard": { "query": "deprecat" } } ],
            } },
            &mut ctx,
            &mut params,
        )
        .unwrap();
        assert_eq!(
            params.values(),
            &[ParamValue::String(
                "(parser) AND ((nom) OR ((\"hand written\"))) AND NOT (deprecat*)".into()
            )]
        );
    }

    #[test]
    fn text_search_is_unavailable_on_clickhouse() {
        let mut ctx = ctx(Dialect::ClickHouse);
        let mut params = ParamBuf::new();
        let err = translate_text_filter(
            &Bson::Document(doc! { "$search": "x" }),
            &mut ctx,
            &mut params,
        )
        .unwrap_err();
        assert!(matches!(err.reason, Reason::FeatureUnavailable { .. }));
    }
}
