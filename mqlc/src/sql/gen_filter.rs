//! Translation of filter documents into WHERE-clause fragments.

use bson::{Bson, Document};
use itertools::Itertools;

use super::{gen_expr, search, Context, DOC_COLUMN};
use crate::ident::FieldPath;
use crate::params::{ParamBuf, ParamValue};
use crate::{Error, Reason, Result};

/// Translate a filter document into a boolean SQL fragment.
pub(crate) fn translate_filter(
    filter: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    if filter.is_empty() {
        return Ok("TRUE".to_string());
    }

    let clauses = filter
        .iter()
        .map(|(key, value)| translate_entry(key, value, ctx, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(clauses.into_iter().join(" AND "))
}

fn translate_entry(
    key: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    match key {
        "$and" => logical(key, value, " AND ", false, ctx, params),
        "$or" => logical(key, value, " OR ", false, ctx, params),
        "$nor" => logical(key, value, " OR ", true, ctx, params),
        "$expr" => {
            let expr = gen_expr::translate_expr(value, ctx, params)?;
            Ok(format!("({expr})"))
        }
        "$text" => search::translate_text_filter(value, ctx, params),
        _ if key.starts_with('$') => Err(Error::new(Reason::UnsupportedOperator {
            name: key.to_string(),
        })),
        _ => translate_field(key, value, ctx, params),
    }
}

fn logical(
    name: &str,
    value: &Bson,
    connective: &str,
    negate: bool,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let filters = match value {
        Bson::Array(filters) if !filters.is_empty() => filters,
        _ => {
            return Err(Error::new(Reason::MalformedExpression {
                context: format!("{name} takes a non-empty array of filters"),
            }))
        }
    };

    let clauses = filters
        .iter()
        .map(|filter| {
            let filter = filter.as_document().ok_or_else(|| {
                Error::new(Reason::MalformedExpression {
                    context: format!("{name} entries must be filter documents"),
                })
            })?;
            Ok(format!("({})", translate_filter(filter, ctx, params)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let joined = clauses.into_iter().join(connective);
    Ok(if negate {
        format!("NOT ({joined})")
    } else {
        format!("({joined})")
    })
}

fn translate_field(
    key: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let path = FieldPath::parse(key)?;
    let extract = ctx.dialect.json_extract(DOC_COLUMN, &path);

    match value {
        Bson::Document(doc) => {
            let operator_keys = doc.keys().filter(|k| k.starts_with('$')).count();
            if operator_keys == doc.len() && !doc.is_empty() {
                translate_operators(&path, doc, ctx, params)
            } else if operator_keys == 0 {
                // A literal sub-document compares for exact equality.
                Ok(format!("{extract} = {}", params.push_bson(value)?))
            } else {
                Err(Error::new(Reason::MalformedExpression {
                    context: format!("`{key}` mixes operators with plain fields"),
                }))
            }
        }
        Bson::Null => Ok(format!("{extract} IS NULL")),
        Bson::RegularExpression(re) => {
            translate_regex(&extract, &re.pattern, &re.options, ctx, params)
        }
        literal => Ok(format!("{extract} = {}", params.push_bson(literal)?)),
    }
}

/// Multiple operators on one field join with AND, in the order written.
fn translate_operators(
    path: &FieldPath,
    ops: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let extract = ctx.dialect.json_extract(DOC_COLUMN, path);
    let mut clauses = Vec::with_capacity(ops.len());

    for (op, value) in ops {
        let clause = match op.as_str() {
            // Consumed together with $regex.
            "$options" => continue,
            "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$in" | "$nin" => {
                translate_value_op(&extract, op, value, ops, ctx, params)?
            }
            "$exists" => {
                let exists = truthy(op, value)?;
                ctx.dialect.path_exists(DOC_COLUMN, path, exists)
            }
            "$type" => translate_type(path, value, ctx)?,
            "$size" => {
                let length = ctx.dialect.json_array_length(DOC_COLUMN, path);
                let n = integer(op, value)?;
                format!("{length} = {}", params.push(ParamValue::Int(n)))
            }
            "$regex" => {
                let (pattern, options) = regex_parts(value, ops)?;
                translate_regex(&extract, &pattern, &options, ctx, params)?
            }
            "$elemMatch" => {
                let inner = value.as_document().ok_or_else(|| {
                    Error::new(Reason::MalformedExpression {
                        context: "$elemMatch takes a filter document".to_string(),
                    })
                })?;
                translate_elem_match(path, inner, ctx, params)?
            }
            "$all" => translate_all(path, value, ctx, params)?,
            "$not" => match value {
                Bson::Document(inner) => {
                    format!("NOT ({})", translate_operators(path, inner, ctx, params)?)
                }
                Bson::RegularExpression(re) => {
                    let like = translate_regex(&extract, &re.pattern, &re.options, ctx, params)?;
                    format!("NOT ({like})")
                }
                _ => {
                    return Err(Error::new(Reason::MalformedExpression {
                        context: "$not takes an operator document or a regex".to_string(),
                    }))
                }
            },
            name => {
                return Err(Error::new(Reason::UnsupportedOperator {
                    name: name.to_string(),
                }))
            }
        };
        clauses.push(clause);
    }

    if clauses.is_empty() {
        return Err(Error::new(Reason::MalformedExpression {
            context: format!("no operators given for `{path}`"),
        }));
    }
    Ok(clauses.into_iter().join(" AND "))
}

/// Comparison operators applicable to any target expression; also used for
/// `$elemMatch` element predicates.
fn translate_value_op(
    target: &str,
    op: &str,
    value: &Bson,
    siblings: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    Ok(match op {
        "$eq" => match value {
            Bson::Null => format!("{target} IS NULL"),
            v => format!("{target} = {}", params.push_bson(v)?),
        },
        "$ne" => match value {
            Bson::Null => format!("{target} IS NOT NULL"),
            v => format!("{target} != {}", params.push_bson(v)?),
        },
        "$gt" => format!("{target} > {}", params.push_bson(value)?),
        "$gte" => format!("{target} >= {}", params.push_bson(value)?),
        "$lt" => format!("{target} < {}", params.push_bson(value)?),
        "$lte" => format!("{target} <= {}", params.push_bson(value)?),
        "$in" | "$nin" => {
            let values = value.as_array().ok_or_else(|| {
                Error::new(Reason::MalformedExpression {
                    context: format!("{op} takes an array"),
                })
            })?;
            let negated = op == "$nin";
            if values.is_empty() {
                // `IN ()` is not valid SQL; an empty list can never match.
                return Ok(if negated { "TRUE" } else { "FALSE" }.to_string());
            }
            let placeholders = values
                .iter()
                .map(|v| params.push_bson(v).map(str::to_string))
                .collect::<Result<Vec<_>>>()?;
            let not = if negated { " NOT" } else { "" };
            format!("{target}{not} IN ({})", placeholders.into_iter().join(", "))
        }
        "$regex" => {
            let (pattern, options) = regex_parts(value, siblings)?;
            translate_regex(target, &pattern, &options, ctx, params)?
        }
        name => {
            return Err(Error::new(Reason::UnsupportedOperator {
                name: name.to_string(),
            }))
        }
    })
}

fn translate_type(path: &FieldPath, value: &Bson, ctx: &mut Context) -> Result<String> {
    let aliases: Vec<String> = match value {
        Bson::Array(list) => list
            .iter()
            .map(|v| type_alias(v))
            .collect::<Result<Vec<_>>>()?,
        single => vec![type_alias(single)?],
    };

    let mut names = Vec::new();
    for alias in &aliases {
        let mapped = ctx.dialect.type_names(alias).ok_or_else(|| {
            Error::new(Reason::MalformedExpression {
                context: format!("unknown type alias `{alias}`"),
            })
        })?;
        names.extend(mapped);
    }
    names.dedup();

    let json_type = ctx.dialect.json_type(DOC_COLUMN, path);
    Ok(if names.len() == 1 {
        format!("{json_type} = '{}'", names[0])
    } else {
        format!(
            "{json_type} IN ({})",
            names.iter().map(|n| format!("'{n}'")).join(", ")
        )
    })
}

/// MongoDB type aliases, accepting both the string and numeric spellings.
fn type_alias(value: &Bson) -> Result<String> {
    match value {
        Bson::String(s) => Ok(s.clone()),
        Bson::Int32(n) => type_code(i64::from(*n)),
        Bson::Int64(n) => type_code(*n),
        _ => Err(Error::new(Reason::MalformedExpression {
            context: "$type takes a type name or code".to_string(),
        })),
    }
}

fn type_code(code: i64) -> Result<String> {
    let alias = match code {
        1 => "double",
        2 => "string",
        3 => "object",
        4 => "array",
        7 => "objectId",
        8 => "bool",
        9 => "date",
        10 => "null",
        11 => "regex",
        16 => "int",
        18 => "long",
        _ => {
            return Err(Error::new(Reason::MalformedExpression {
                context: format!("unknown type code {code}"),
            }))
        }
    };
    Ok(alias.to_string())
}

fn translate_elem_match(
    path: &FieldPath,
    inner: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let array = ctx.dialect.array_expr(DOC_COLUMN, path);
    let alias = "elem";
    let element = ctx.dialect.element_ref(alias);

    let mut clauses = Vec::with_capacity(inner.len());
    for (key, value) in inner {
        if key.starts_with('$') {
            if key == "$options" {
                continue;
            }
            clauses.push(translate_value_op(
                &element, key, value, inner, ctx, params,
            )?);
        } else {
            let sub = FieldPath::parse(key)?;
            let target = ctx.dialect.element_extract(alias, &sub);
            match value {
                Bson::Document(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => {
                    for (op, v) in ops {
                        if op == "$options" {
                            continue;
                        }
                        clauses.push(translate_value_op(&target, op, v, ops, ctx, params)?);
                    }
                }
                Bson::Null => clauses.push(format!("{target} IS NULL")),
                literal => clauses.push(format!("{target} = {}", params.push_bson(literal)?)),
            }
        }
    }

    if clauses.is_empty() {
        return Err(Error::new(Reason::MalformedExpression {
            context: "$elemMatch requires at least one condition".to_string(),
        }));
    }
    Ok(ctx
        .dialect
        .array_exists(&array, alias, &clauses.into_iter().join(" AND ")))
}

/// One existence test per required element.
fn translate_all(
    path: &FieldPath,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let required = value.as_array().ok_or_else(|| {
        Error::new(Reason::MalformedExpression {
            context: "$all takes an array".to_string(),
        })
    })?;
    if required.is_empty() {
        return Ok("FALSE".to_string());
    }

    let array = ctx.dialect.array_expr(DOC_COLUMN, path);
    let alias = "elem";
    let element = ctx.dialect.element_ref(alias);
    let clauses = required
        .iter()
        .map(|v| {
            let predicate = format!("{element} = {}", params.push_bson(v)?);
            Ok(ctx.dialect.array_exists(&array, alias, &predicate))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(clauses.into_iter().join(" AND "))
}

fn regex_parts(value: &Bson, siblings: &Document) -> Result<(String, String)> {
    match value {
        Bson::String(pattern) => {
            let options = siblings
                .get_str("$options")
                .unwrap_or_default()
                .to_string();
            Ok((pattern.clone(), options))
        }
        Bson::RegularExpression(re) => Ok((re.pattern.clone(), re.options.clone())),
        _ => Err(Error::new(Reason::MalformedExpression {
            context: "$regex takes a pattern".to_string(),
        })),
    }
}

fn translate_regex(
    target: &str,
    pattern: &str,
    options: &str,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let like = regex_to_like(pattern);
    let case_insensitive = options.contains('i');
    let placeholder = params.push(ParamValue::String(like));
    Ok(ctx.dialect.like_match(target, placeholder, case_insensitive))
}

/// Best-effort regex-to-LIKE conversion: anchors control the surrounding
/// `%` wildcards, `.*` becomes `%` and `.` becomes `_`. Patterns beyond
/// that subset match literally.
fn regex_to_like(pattern: &str) -> String {
    let anchored_start = pattern.starts_with('^');
    let anchored_end = pattern.ends_with('$');

    let start = usize::from(anchored_start);
    let end = pattern.len() - usize::from(anchored_end);
    let body = &pattern[start..end.max(start)];

    let mut like = body.replace(".*", "%").replace('.', "_");
    if !anchored_start {
        like.insert(0, '%');
    }
    if !anchored_end {
        like.push('%');
    }
    like
}

fn truthy(name: &str, value: &Bson) -> Result<bool> {
    match value {
        Bson::Boolean(b) => Ok(*b),
        Bson::Int32(n) => Ok(*n != 0),
        Bson::Int64(n) => Ok(*n != 0),
        Bson::Double(f) => Ok(*f != 0.0),
        _ => Err(Error::new(Reason::MalformedExpression {
            context: format!("{name} takes a boolean"),
        })),
    }
}

fn integer(name: &str, value: &Bson) -> Result<i64> {
    match value {
        Bson::Int32(n) => Ok(i64::from(*n)),
        Bson::Int64(n) => Ok(*n),
        _ => Err(Error::new(Reason::MalformedExpression {
            context: format!("{name} takes an integer"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use insta::assert_snapshot;

    use super::*;
    use crate::sql::Dialect;

    fn translate(filter: Document) -> (String, usize) {
        translate_on(Dialect::Sqlite, filter)
    }

    fn translate_on(dialect: Dialect, filter: Document) -> (String, usize) {
        let mut ctx = Context::new(dialect, "users").unwrap();
        let mut params = ParamBuf::new();
        let sql = translate_filter(&filter, &mut ctx, &mut params).unwrap();
        (sql, params.len())
    }

    fn translate_err(filter: Document) -> Error {
        let mut ctx = Context::new(Dialect::Sqlite, "users").unwrap();
        let mut params = ParamBuf::new();
        translate_filter(&filter, &mut ctx, &mut params).unwrap_err()
    }

    #[test]
    fn implicit_equality_and_comparison() {
        let (sql, n) = translate(doc! { "status": "active", "age": { "$gte": 18 } });
        assert_snapshot!(sql, @"json_extract(data, '$.status') = ? AND json_extract(data, '$.age') >= ?");
        assert_eq!(n, 2);
    }

    #[test]
    fn injection_attempt_fails_validation() {
        let err = translate_err(doc! { "foo'; DROP TABLE users;--": 1 });
        assert_eq!(
            err.reason,
            Reason::Validation {
                name: "foo'; DROP TABLE users;--".to_string()
            }
        );
    }

    #[test]
    fn logical_operators_nest() {
        let (sql, n) = translate(doc! {
            "$or": [ { "a": 1 }, { "b": { "$lt": 5 } } ]
        });
        assert_snapshot!(sql, @"((json_extract(data, '$.a') = ?) OR (json_extract(data, '$.b') < ?))");
        assert_eq!(n, 2);

        let (sql, _) = translate(doc! { "$nor": [ { "a": 1 }, { "b": 2 } ] });
        assert_snapshot!(sql, @"NOT ((json_extract(data, '$.a') = ?) OR (json_extract(data, '$.b') = ?))");
    }

    #[test]
    fn empty_in_degenerates_to_constant() {
        let (sql, n) = translate(doc! { "a": { "$in": [] } });
        assert_eq!(sql, "FALSE");
        assert_eq!(n, 0);

        let (sql, n) = translate(doc! { "a": { "$nin": [] } });
        assert_eq!(sql, "TRUE");
        assert_eq!(n, 0);
    }

    #[test]
    fn in_binds_each_element() {
        let (sql, n) = translate(doc! { "a": { "$in": [1, 2, 3] } });
        assert_snapshot!(sql, @"json_extract(data, '$.a') IN (?, ?, ?)");
        assert_eq!(n, 3);
    }

    #[test]
    fn null_matches_are_special_cased() {
        let (sql, n) = translate(doc! { "a": null });
        assert_snapshot!(sql, @"json_extract(data, '$.a') IS NULL");
        assert_eq!(n, 0);

        let (sql, _) = translate(doc! { "a": { "$ne": null } });
        assert_snapshot!(sql, @"json_extract(data, '$.a') IS NOT NULL");
    }

    #[test]
    fn exists_checks_the_path() {
        let (sql, _) = translate(doc! { "a.b": { "$exists": true } });
        assert_snapshot!(sql, @"json_type(data, '$.a.b') IS NOT NULL");

        let (sql, _) = translate(doc! { "a.b": { "$exists": false } });
        assert_snapshot!(sql, @"json_type(data, '$.a.b') IS NULL");
    }

    #[test]
    fn type_maps_aliases_and_codes() {
        let (sql, _) = translate(doc! { "a": { "$type": "string" } });
        assert_snapshot!(sql, @"json_type(data, '$.a') = 'text'");

        let (sql, _) = translate(doc! { "a": { "$type": "number" } });
        assert_snapshot!(sql, @"json_type(data, '$.a') IN ('integer', 'real')");

        let (sql, _) = translate(doc! { "a": { "$type": 4 } });
        assert_snapshot!(sql, @"json_type(data, '$.a') = 'array'");
    }

    #[test]
    fn size_compares_array_length() {
        let (sql, n) = translate(doc! { "tags": { "$size": 3 } });
        assert_snapshot!(sql, @"json_array_length(json_extract(data, '$.tags')) = ?");
        assert_eq!(n, 1);
    }

    #[test]
    fn regex_lowers_to_like() {
        let (sql, _) = translate(doc! { "name": { "$regex": "^Jo", "$options": "i" } });
        assert_snapshot!(sql, @"LOWER(json_extract(data, '$.name')) LIKE LOWER(?)");

        let (sql, _) = translate_on(
            Dialect::ClickHouse,
            doc! { "name": { "$regex": "^Jo", "$options": "i" } },
        );
        assert_snapshot!(sql, @"JSONExtractRaw(data, 'name') ILIKE ?");
    }

    #[test]
    fn regex_pattern_becomes_like_pattern() {
        assert_eq!(regex_to_like("^Jo"), "Jo%");
        assert_eq!(regex_to_like("net$"), "%net");
        assert_eq!(regex_to_like("^a.*b$"), "a%b");
        assert_eq!(regex_to_like("mid"), "%mid%");
    }

    #[test]
    fn elem_match_emits_an_existence_test() {
        let (sql, n) = translate(doc! {
            "results": { "$elemMatch": { "score": { "$gt": 8 }, "kind": "unit" } }
        });
        assert_snapshot!(sql, @"EXISTS (SELECT 1 FROM json_each(json_extract(data, '$.results')) AS elem WHERE json_extract(elem.value, '$.score') > ? AND json_extract(elem.value, '$.kind') = ?)");
        assert_eq!(n, 2);
    }

    #[test]
    fn elem_match_on_clickhouse_uses_array_exists() {
        let (sql, _) = translate_on(
            Dialect::ClickHouse,
            doc! { "scores": { "$elemMatch": { "$gte": 90 } } },
        );
        assert_snapshot!(sql, @"arrayExists(elem -> elem >= ?, JSONExtractArrayRaw(data, 'scores'))");
    }

    #[test]
    fn all_requires_every_element() {
        let (sql, n) = translate(doc! { "tags": { "$all": ["a", "b"] } });
        assert_snapshot!(sql, @"EXISTS (SELECT 1 FROM json_each(json_extract(data, '$.tags')) AS elem WHERE elem.value = ?) AND EXISTS (SELECT 1 FROM json_each(json_extract(data, '$.tags')) AS elem WHERE elem.value = ?)");
        assert_eq!(n, 2);
    }

    #[test]
    fn not_wraps_the_inner_predicate() {
        let (sql, _) = translate(doc! { "a": { "$not": { "$gt": 5 } } });
        assert_snapshot!(sql, @"NOT (json_extract(data, '$.a') > ?)");
    }

    #[test]
    fn multiple_operators_join_in_written_order() {
        let (sql, n) = translate(doc! { "a": { "$gte": 1, "$lt": 10 } });
        assert_snapshot!(sql, @"json_extract(data, '$.a') >= ? AND json_extract(data, '$.a') < ?");
        assert_eq!(n, 2);
    }

    #[test]
    fn where_is_rejected() {
        let err = translate_err(doc! { "$where": "this.a > 1" });
        assert_eq!(
            err.reason,
            Reason::UnsupportedOperator {
                name: "$where".to_string()
            }
        );
    }
}
