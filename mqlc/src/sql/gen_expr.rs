//! Translation of value expressions into SQL fragments.
//!
//! An expression is a literal, a `$`-prefixed field reference, or an
//! operator object with a single `$`-operator key. Literals are bound as
//! parameters; only field names and operator spellings reach the SQL text.

use std::collections::BTreeMap;

use bson::{Bson, Document};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use super::dialect::{CastKind, DatePart, UnaryMath};
use super::{Context, DOC_COLUMN};
use crate::ident::FieldPath;
use crate::params::ParamBuf;
use crate::{Error, Reason, Result};

/// Nesting bound; deeper input is rejected rather than recursed into.
const MAX_DEPTH: usize = 64;

/// Prefix of the deferred-function literal smuggled through SQL results.
pub(crate) const FUNCTION_MARKER: &str = "__FUNCTION__";

/// Payload encoded behind [FUNCTION_MARKER]: enough for the executor to
/// gather argument values from each result document and invoke the
/// sandboxed function once per batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct FunctionPayload {
    pub body: String,
    pub args: Vec<FunctionArg>,
    /// Literal argument values, keyed by their position in `args`.
    pub literals: BTreeMap<usize, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum FunctionArg {
    Field { path: String },
    Literal { index: usize },
}

pub(crate) fn translate_expr(
    expr: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    translate_nested(expr, ctx, params, 0)
}

fn translate_nested(
    expr: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    if depth > MAX_DEPTH {
        return Err(Error::new(Reason::MalformedExpression {
            context: format!("nesting exceeds depth {MAX_DEPTH}"),
        }));
    }

    Ok(match expr {
        Bson::String(s) if s.starts_with("$$") => {
            let name = &s[2..];
            match ctx.variables.get(name) {
                Some(resolved) => resolved.clone(),
                None => {
                    return Err(Error::new(Reason::UnsupportedExpression {
                        found: format!("system variable `{s}`"),
                    }))
                }
            }
        }
        Bson::String(s) if s.starts_with('$') => translate_field_ref(s, ctx)?,
        Bson::Null => "NULL".to_string(),
        Bson::Document(doc) => translate_document(doc, ctx, params, depth)?,
        literal => params.push_bson(literal)?.to_string(),
    })
}

pub(crate) fn translate_field_ref(reference: &str, ctx: &Context) -> Result<String> {
    let path = FieldPath::parse(&reference[1..])?;
    Ok(ctx.dialect.json_extract(DOC_COLUMN, &path))
}

fn translate_document(
    doc: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let operator_keys = doc.keys().filter(|k| k.starts_with('$')).count();

    if operator_keys == 0 {
        // An object literal; values may themselves be expressions.
        let pairs = doc
            .iter()
            .map(|(key, value)| {
                let path = FieldPath::parse(key)?;
                let value = translate_nested(value, ctx, params, depth + 1)?;
                Ok((path.dotted(), value))
            })
            .collect::<Result<Vec<_>>>()?;
        return Ok(ctx.dialect.json_object(&pairs));
    }

    if operator_keys != doc.len() || doc.len() != 1 {
        return Err(Error::new(Reason::MalformedExpression {
            context: "an operator object must have exactly one operator key".to_string(),
        }));
    }

    let (name, value) = doc.iter().next().expect("len checked above");
    translate_operator(name, value, ctx, params, depth)
}

fn translate_operator(
    name: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let depth = depth + 1;
    Ok(match name {
        "$add" => variadic_infix(name, value, "+", 2, ctx, params, depth)?,
        "$subtract" => binary_infix(name, value, "-", ctx, params, depth)?,
        "$multiply" => variadic_infix(name, value, "*", 2, ctx, params, depth)?,
        "$divide" => binary_infix(name, value, "/", ctx, params, depth)?,
        "$mod" => binary_infix(name, value, "%", ctx, params, depth)?,

        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
            translate_comparison(name, value, ctx, params, depth)?
        }

        "$and" => variadic_infix(name, value, "AND", 1, ctx, params, depth)?,
        "$or" => variadic_infix(name, value, "OR", 1, ctx, params, depth)?,
        "$not" => {
            let inner = unary_arg(name, value, ctx, params, depth)?;
            format!("NOT ({inner})")
        }

        "$concat" => {
            let parts = args_of(name, value, 1)?
                .iter()
                .map(|arg| translate_nested(arg, ctx, params, depth))
                .collect::<Result<Vec<_>>>()?;
            ctx.dialect.concat(&parts)
        }
        "$substr" | "$substrCP" => {
            let [input, start, len] = n_args(name, value)?;
            let input = translate_nested(input, ctx, params, depth)?;
            let start = translate_nested(start, ctx, params, depth)?;
            let len = translate_nested(len, ctx, params, depth)?;
            // SQL substrings are 1-based.
            ctx.dialect.substring(&input, &format!("({start} + 1)"), &len)
        }
        "$toLower" => {
            let input = unary_arg(name, value, ctx, params, depth)?;
            ctx.dialect.lower(&input)
        }
        "$toUpper" => {
            let input = unary_arg(name, value, ctx, params, depth)?;
            ctx.dialect.upper(&input)
        }
        "$strLenCP" => {
            let input = unary_arg(name, value, ctx, params, depth)?;
            ctx.dialect.str_length(&input)
        }
        "$indexOfCP" => {
            let [haystack, needle] = n_args(name, value)?;
            let haystack = translate_nested(haystack, ctx, params, depth)?;
            let needle = translate_nested(needle, ctx, params, depth)?;
            format!("({} - 1)", ctx.dialect.str_position(&haystack, &needle))
        }
        "$replaceAll" => {
            let spec = doc_arg(name, value)?;
            let input = named_arg(name, spec, "input", ctx, params, depth)?;
            let find = named_arg(name, spec, "find", ctx, params, depth)?;
            let replacement = named_arg(name, spec, "replacement", ctx, params, depth)?;
            ctx.dialect.str_replace(&input, &find, &replacement)
        }
        "$trim" => {
            let spec = doc_arg(name, value)?;
            let input = named_arg(name, spec, "input", ctx, params, depth)?;
            ctx.dialect.trim(&input)
        }

        "$abs" => unary_math(UnaryMath::Abs, name, value, ctx, params, depth)?,
        "$ceil" => unary_math(UnaryMath::Ceil, name, value, ctx, params, depth)?,
        "$floor" => unary_math(UnaryMath::Floor, name, value, ctx, params, depth)?,
        "$min" => {
            let args = translate_args(name, value, 1, ctx, params, depth)?;
            ctx.dialect.scalar_min(&args)
        }
        "$max" => {
            let args = translate_args(name, value, 1, ctx, params, depth)?;
            ctx.dialect.scalar_max(&args)
        }

        "$cond" => translate_cond(value, ctx, params, depth)?,
        "$ifNull" => {
            let args = translate_args(name, value, 2, ctx, params, depth)?;
            ctx.dialect.coalesce(&args)
        }
        "$switch" => translate_switch(value, ctx, params, depth)?,

        "$year" => date_part(DatePart::Year, name, value, ctx, params, depth)?,
        "$month" => date_part(DatePart::Month, name, value, ctx, params, depth)?,
        "$dayOfMonth" => date_part(DatePart::DayOfMonth, name, value, ctx, params, depth)?,
        "$hour" => date_part(DatePart::Hour, name, value, ctx, params, depth)?,
        "$minute" => date_part(DatePart::Minute, name, value, ctx, params, depth)?,
        "$second" => date_part(DatePart::Second, name, value, ctx, params, depth)?,

        "$toInt" => cast(CastKind::Int, name, value, ctx, params, depth)?,
        "$toLong" => cast(CastKind::Int, name, value, ctx, params, depth)?,
        "$toDouble" => cast(CastKind::Double, name, value, ctx, params, depth)?,
        "$toString" => cast(CastKind::Text, name, value, ctx, params, depth)?,
        "$toDate" => cast(CastKind::Date, name, value, ctx, params, depth)?,
        "$toDecimal" => cast(CastKind::Decimal, name, value, ctx, params, depth)?,

        "$literal" => params.push_bson(value)?.to_string(),

        "$expr" => translate_nested(value, ctx, params, depth)?,

        "$function" => translate_function(value, ctx)?,

        _ => {
            return Err(Error::new(Reason::UnsupportedOperator {
                name: name.to_string(),
            }))
        }
    })
}

/// `$eq` through `$lte`, with `IS [NOT] NULL` when one side is the null
/// literal.
fn translate_comparison(
    name: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let [a, b] = n_args(name, value)?;

    if matches!(a, Bson::Null) || matches!(b, Bson::Null) {
        let operand = if matches!(a, Bson::Null) { b } else { a };
        let operand = translate_nested(operand, ctx, params, depth)?;
        return Ok(match name {
            "$eq" => format!("({operand} IS NULL)"),
            "$ne" => format!("({operand} IS NOT NULL)"),
            _ => {
                return Err(Error::new(Reason::MalformedExpression {
                    context: format!("{name} cannot order against null"),
                }))
            }
        });
    }

    let op = match name {
        "$eq" => "=",
        "$ne" => "!=",
        "$gt" => ">",
        "$gte" => ">=",
        "$lt" => "<",
        "$lte" => "<=",
        _ => unreachable!("caller matched the operator"),
    };
    let a = translate_nested(a, ctx, params, depth)?;
    let b = translate_nested(b, ctx, params, depth)?;
    Ok(format!("({a} {op} {b})"))
}

fn translate_cond(
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let (cond, then, otherwise) = match value {
        Bson::Array(args) if args.len() == 3 => (&args[0], &args[1], &args[2]),
        Bson::Document(doc) => {
            let get = |key: &str| {
                doc.get(key).ok_or_else(|| {
                    Error::new(Reason::MalformedExpression {
                        context: format!("$cond is missing `{key}`"),
                    })
                })
            };
            (get("if")?, get("then")?, get("else")?)
        }
        _ => {
            return Err(Error::new(Reason::MalformedExpression {
                context: "$cond takes [if, then, else] or {if, then, else}".to_string(),
            }))
        }
    };

    let cond = translate_nested(cond, ctx, params, depth)?;
    let then = translate_nested(then, ctx, params, depth)?;
    let otherwise = translate_nested(otherwise, ctx, params, depth)?;
    Ok(format!("CASE WHEN {cond} THEN {then} ELSE {otherwise} END"))
}

fn translate_switch(
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let spec = doc_arg("$switch", value)?;
    let branches = spec
        .get_array("branches")
        .map_err(|_| {
            Error::new(Reason::MalformedExpression {
                context: "$switch requires a `branches` array".to_string(),
            })
        })?
        .iter()
        .map(|branch| {
            let branch = branch.as_document().ok_or_else(|| {
                Error::new(Reason::MalformedExpression {
                    context: "$switch branches must be documents".to_string(),
                })
            })?;
            let case = named_arg("$switch", branch, "case", ctx, params, depth)?;
            let then = named_arg("$switch", branch, "then", ctx, params, depth)?;
            Ok(format!("WHEN {case} THEN {then}"))
        })
        .collect::<Result<Vec<_>>>()?;

    if branches.is_empty() {
        return Err(Error::new(Reason::MalformedExpression {
            context: "$switch requires at least one branch".to_string(),
        }));
    }

    let default = match spec.get("default") {
        Some(default) => translate_nested(default, ctx, params, depth)?,
        None => "NULL".to_string(),
    };
    Ok(format!(
        "CASE {} ELSE {default} END",
        branches.iter().join(" ")
    ))
}

/// `$function` never evaluates; it emits a quoted marker literal that the
/// executor resolves after rows come back. The payload is caller data
/// only, and the enclosing quotes are escaped by doubling.
fn translate_function(value: &Bson, ctx: &mut Context) -> Result<String> {
    let spec = doc_arg("$function", value)?;

    let body = spec.get_str("body").map_err(|_| {
        Error::new(Reason::MalformedExpression {
            context: "$function requires a string `body`".to_string(),
        })
    })?;
    if let Ok(lang) = spec.get_str("lang") {
        if lang != "js" {
            return Err(Error::new(Reason::MalformedExpression {
                context: format!("$function lang must be \"js\", not \"{lang}\""),
            }));
        }
    }

    let raw_args = match spec.get("args") {
        Some(Bson::Array(args)) => args.as_slice(),
        None => &[],
        Some(_) => {
            return Err(Error::new(Reason::MalformedExpression {
                context: "$function `args` must be an array".to_string(),
            }))
        }
    };

    let mut args = Vec::with_capacity(raw_args.len());
    let mut literals = BTreeMap::new();
    for (index, arg) in raw_args.iter().enumerate() {
        match arg {
            Bson::String(s) if s.starts_with('$') && !s.starts_with("$$") => {
                let path = FieldPath::parse(&s[1..])?;
                args.push(FunctionArg::Field {
                    path: path.dotted(),
                });
                ctx.function_fields.push(path);
            }
            literal => {
                literals.insert(index, literal.clone().into_relaxed_extjson());
                args.push(FunctionArg::Literal { index });
            }
        }
    }

    let payload = FunctionPayload {
        body: body.to_string(),
        args,
        literals,
    };
    let json = serde_json::to_string(&payload).map_err(|e| {
        Error::new(Reason::MalformedExpression {
            context: format!("$function payload failed to encode: {e}"),
        })
    })?;
    Ok(format!("'{FUNCTION_MARKER}{}'", json.replace('\'', "''")))
}

fn args_of<'a>(name: &str, value: &'a Bson, min: usize) -> Result<&'a [Bson]> {
    match value {
        Bson::Array(args) if args.len() >= min => Ok(args),
        _ => Err(Error::new(Reason::MalformedExpression {
            context: format!("{name} takes an array of at least {min} arguments"),
        })),
    }
}

fn n_args<'a, const N: usize>(name: &str, value: &'a Bson) -> Result<[&'a Bson; N]> {
    let args = args_of(name, value, N)?;
    if args.len() != N {
        return Err(Error::new(Reason::MalformedExpression {
            context: format!("{name} takes exactly {N} arguments"),
        }));
    }
    Ok(std::array::from_fn(|i| &args[i]))
}

fn doc_arg<'a>(name: &str, value: &'a Bson) -> Result<&'a Document> {
    value.as_document().ok_or_else(|| {
        Error::new(Reason::MalformedExpression {
            context: format!("{name} takes a document"),
        })
    })
}

fn named_arg(
    name: &str,
    spec: &Document,
    key: &str,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let value = spec.get(key).ok_or_else(|| {
        Error::new(Reason::MalformedExpression {
            context: format!("{name} is missing `{key}`"),
        })
    })?;
    translate_nested(value, ctx, params, depth)
}

fn unary_arg(
    name: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    // Accept both `{$op: expr}` and `{$op: [expr]}`.
    let arg = match value {
        Bson::Array(args) if args.len() == 1 => &args[0],
        Bson::Array(_) => {
            return Err(Error::new(Reason::MalformedExpression {
                context: format!("{name} takes a single argument"),
            }))
        }
        other => other,
    };
    translate_nested(arg, ctx, params, depth)
}

fn translate_args(
    name: &str,
    value: &Bson,
    min: usize,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<Vec<String>> {
    args_of(name, value, min)?
        .iter()
        .map(|arg| translate_nested(arg, ctx, params, depth))
        .collect()
}

fn variadic_infix(
    name: &str,
    value: &Bson,
    op: &str,
    min: usize,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let args = translate_args(name, value, min, ctx, params, depth)?;
    Ok(format!("({})", args.iter().join(&format!(" {op} "))))
}

fn binary_infix(
    name: &str,
    value: &Bson,
    op: &str,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let [a, b] = n_args(name, value)?;
    let a = translate_nested(a, ctx, params, depth)?;
    let b = translate_nested(b, ctx, params, depth)?;
    Ok(format!("({a} {op} {b})"))
}

fn unary_math(
    op: UnaryMath,
    name: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let arg = unary_arg(name, value, ctx, params, depth)?;
    Ok(ctx.dialect.unary_math(op, &arg))
}

fn date_part(
    part: DatePart,
    name: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let arg = unary_arg(name, value, ctx, params, depth)?;
    Ok(ctx.dialect.date_part(part, &arg))
}

fn cast(
    kind: CastKind,
    name: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
    depth: usize,
) -> Result<String> {
    let arg = unary_arg(name, value, ctx, params, depth)?;
    Ok(ctx.dialect.cast(&arg, kind))
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use insta::assert_snapshot;

    use super::*;
    use crate::sql::Dialect;

    fn translate(expr: Bson) -> (String, usize) {
        let mut ctx = Context::new(Dialect::Sqlite, "users").unwrap();
        let mut params = ParamBuf::new();
        let sql = translate_expr(&expr, &mut ctx, &mut params).unwrap();
        (sql, params.len())
    }

    fn translate_err(expr: Bson) -> Error {
        let mut ctx = Context::new(Dialect::Sqlite, "users").unwrap();
        let mut params = ParamBuf::new();
        translate_expr(&expr, &mut ctx, &mut params).unwrap_err()
    }

    #[test]
    fn field_refs_extract() {
        let (sql, n) = translate(Bson::String("$address.city".into()));
        assert_snapshot!(sql, @"json_extract(data, '$.address.city')");
        assert_eq!(n, 0);
    }

    #[test]
    fn literals_bind() {
        let (sql, n) = translate(Bson::String("plain".into()));
        assert_eq!(sql, "?");
        assert_eq!(n, 1);

        let (sql, n) = translate(Bson::Null);
        assert_eq!(sql, "NULL");
        assert_eq!(n, 0);
    }

    #[test]
    fn arithmetic_is_infix() {
        let (sql, n) = translate(Bson::Document(doc! { "$add": ["$a", 2, "$c"] }));
        assert_snapshot!(sql, @"(json_extract(data, '$.a') + ? + json_extract(data, '$.c'))");
        assert_eq!(n, 1);
    }

    #[test]
    fn substr_corrects_for_one_based_sql() {
        let (sql, _) = translate(Bson::Document(doc! { "$substr": ["$name", 0, 3] }));
        assert_snapshot!(sql, @"SUBSTR(json_extract(data, '$.name'), (? + 1), ?)");
    }

    #[test]
    fn cond_becomes_case() {
        let (sql, _) = translate(Bson::Document(doc! {
            "$cond": { "if": { "$gte": ["$age", 18] }, "then": "adult", "else": "minor" }
        }));
        assert_snapshot!(sql, @"CASE WHEN (json_extract(data, '$.age') >= ?) THEN ? ELSE ? END");
    }

    #[test]
    fn switch_becomes_multi_branch_case() {
        let (sql, _) = translate(Bson::Document(doc! {
            "$switch": {
                "branches": [
                    { "case": { "$lt": ["$n", 10] }, "then": "small" },
                    { "case": { "$lt": ["$n", 100] }, "then": "medium" },
                ],
                "default": "large"
            }
        }));
        assert_snapshot!(sql, @"CASE WHEN (json_extract(data, '$.n') < ?) THEN ? WHEN (json_extract(data, '$.n') < ?) THEN ? ELSE ? END");
    }

    #[test]
    fn null_comparison_uses_is_null() {
        let (sql, n) = translate(Bson::Document(doc! { "$eq": ["$a", null] }));
        assert_snapshot!(sql, @"(json_extract(data, '$.a') IS NULL)");
        assert_eq!(n, 0);
    }

    #[test]
    fn system_variables_are_rejected() {
        let err = translate_err(Bson::String("$$NOW".into()));
        assert!(matches!(
            err.reason,
            Reason::UnsupportedExpression { .. }
        ));
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = translate_err(Bson::Document(doc! { "$zip": [1, 2] }));
        assert_eq!(
            err.reason,
            Reason::UnsupportedOperator {
                name: "$zip".to_string()
            }
        );
    }

    #[test]
    fn depth_is_bounded() {
        let mut expr = Bson::Int32(1);
        for _ in 0..100 {
            expr = Bson::Document(doc! { "$abs": expr });
        }
        let err = translate_err(expr);
        assert!(matches!(err.reason, Reason::MalformedExpression { .. }));
    }

    #[test]
    fn function_emits_escaped_marker() {
        let mut ctx = Context::new(Dialect::Sqlite, "users").unwrap();
        let mut params = ParamBuf::new();
        let sql = translate_expr(
            &Bson::Document(doc! {
                "$function": { "body": "(x, y) => x + y", "args": ["$a", 2], "lang": "js" }
            }),
            &mut ctx,
            &mut params,
        )
        .unwrap();

        assert!(sql.starts_with("'__FUNCTION__"));
        assert!(sql.ends_with('\''));
        assert!(params.is_empty());
        // The referenced field is recorded so `$project` can carry it.
        assert_eq!(ctx.function_fields.len(), 1);

        let payload: FunctionPayload =
            serde_json::from_str(&sql[FUNCTION_MARKER.len() + 1..sql.len() - 1]).unwrap();
        assert_eq!(payload.body, "(x, y) => x + y");
        assert_eq!(
            payload.args,
            vec![
                FunctionArg::Field { path: "a".into() },
                FunctionArg::Literal { index: 1 }
            ]
        );
        assert_eq!(payload.literals[&1], serde_json::json!(2));
    }
}
