//! Per-stage translation of aggregation pipeline stages.
//!
//! Stages are parsed into a typed [Stage] first; unknown directives are
//! rejected at parse time. Each translator emits partial clauses for the
//! planner to accumulate, or a full CTE body for stages that cannot
//! collapse into a single SELECT.

use bson::{Bson, Document};
use itertools::Itertools;

use super::dialect::Accumulator;
use super::{gen_expr, gen_filter, Context, Fragment, DOC_COLUMN};
use crate::ident::{self, FieldPath};
use crate::params::ParamBuf;
use crate::{Error, Reason, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stage {
    Match(Document),
    Project(Document),
    Group(Document),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Count(String),
    Lookup(Document),
    Unwind(UnwindSpec),
    AddFields(Document),
    Bucket(Document),
    Facet(Document),
    Search(Document),
    ReplaceRoot(Document),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UnwindSpec {
    pub path: FieldPath,
    pub include_array_index: Option<FieldPath>,
    pub preserve_null_and_empty: bool,
}

/// How the planner treats a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageCategory {
    /// Accumulates onto the running SELECT.
    Simple,
    /// Rewrites the document envelope; at most one per SELECT.
    ShapeTransform,
    /// Needs its own CTE and flushes anything pending.
    Flushing,
}

impl Stage {
    /// Parse one raw stage document. `$sortByCount` expands to its
    /// `$group` + `$sort` equivalent, hence the Vec.
    pub fn parse(doc: &Document) -> Result<Vec<Stage>> {
        let (name, payload) = doc.iter().exactly_one().map_err(|_| {
            Error::new(Reason::MalformedStage {
                stage: "pipeline".to_string(),
                details: "a stage must have exactly one key".to_string(),
            })
        })?;

        let stage = match name.as_str() {
            "$match" => Stage::Match(payload_doc(name, payload)?.clone()),
            "$project" => {
                let spec = payload_doc(name, payload)?;
                if spec.is_empty() {
                    return Err(malformed(name, "the projection is empty"));
                }
                Stage::Project(spec.clone())
            }
            "$group" => {
                let spec = payload_doc(name, payload)?;
                if !spec.contains_key("_id") {
                    return Err(malformed(name, "`_id` is required"));
                }
                Stage::Group(spec.clone())
            }
            "$sort" => {
                let spec = payload_doc(name, payload)?;
                if spec.is_empty() {
                    return Err(malformed(name, "no sort keys given"));
                }
                Stage::Sort(spec.clone())
            }
            "$limit" => Stage::Limit(non_negative(name, payload)?),
            "$skip" => Stage::Skip(non_negative(name, payload)?),
            "$count" => {
                let field = payload.as_str().ok_or_else(|| {
                    malformed(name, "the output field name must be a string")
                })?;
                ident::validate_field_path(field)?;
                Stage::Count(field.to_string())
            }
            "$lookup" => Stage::Lookup(payload_doc(name, payload)?.clone()),
            "$unwind" => Stage::Unwind(parse_unwind(payload)?),
            "$addFields" | "$set" => {
                let spec = payload_doc(name, payload)?;
                if spec.is_empty() {
                    return Err(malformed(name, "no fields given"));
                }
                Stage::AddFields(spec.clone())
            }
            "$bucket" => Stage::Bucket(payload_doc(name, payload)?.clone()),
            "$facet" => {
                let spec = payload_doc(name, payload)?;
                if spec.is_empty() {
                    return Err(malformed(name, "at least one facet is required"));
                }
                Stage::Facet(spec.clone())
            }
            "$search" => Stage::Search(payload_doc(name, payload)?.clone()),
            "$replaceRoot" => Stage::ReplaceRoot(payload_doc(name, payload)?.clone()),
            "$sortByCount" => {
                return Ok(vec![
                    Stage::Group(bson::doc! {
                        "_id": payload.clone(),
                        "count": { "$sum": 1 },
                    }),
                    Stage::Sort(bson::doc! { "count": -1 }),
                ])
            }
            _ => {
                return Err(Error::new(Reason::UnsupportedStage {
                    name: name.to_string(),
                }))
            }
        };
        Ok(vec![stage])
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::Group(_) => "$group",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Count(_) => "$count",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::AddFields(_) => "$addFields",
            Stage::Bucket(_) => "$bucket",
            Stage::Facet(_) => "$facet",
            Stage::Search(_) => "$search",
            Stage::ReplaceRoot(_) => "$replaceRoot",
        }
    }

    pub fn category(&self) -> StageCategory {
        match self {
            Stage::Match(_) | Stage::Sort(_) | Stage::Limit(_) | Stage::Skip(_) => {
                StageCategory::Simple
            }
            Stage::Project(_)
            | Stage::Group(_)
            | Stage::Count(_)
            | Stage::AddFields(_)
            | Stage::Bucket(_)
            | Stage::ReplaceRoot(_) => StageCategory::ShapeTransform,
            Stage::Lookup(_) | Stage::Unwind(_) | Stage::Facet(_) | Stage::Search(_) => {
                StageCategory::Flushing
            }
        }
    }
}

fn malformed(stage: &str, details: &str) -> Error {
    Error::new(Reason::MalformedStage {
        stage: stage.to_string(),
        details: details.to_string(),
    })
}

fn payload_doc<'a>(name: &str, payload: &'a Bson) -> Result<&'a Document> {
    payload
        .as_document()
        .ok_or_else(|| malformed(name, "the stage payload must be a document"))
}

fn non_negative(name: &str, payload: &Bson) -> Result<i64> {
    let n = match payload {
        Bson::Int32(n) => i64::from(*n),
        Bson::Int64(n) => *n,
        _ => return Err(malformed(name, "takes an integer")),
    };
    if n < 0 {
        return Err(malformed(name, "must not be negative"));
    }
    Ok(n)
}

fn parse_unwind(payload: &Bson) -> Result<UnwindSpec> {
    match payload {
        Bson::String(path) if path.starts_with('$') => Ok(UnwindSpec {
            path: FieldPath::parse(&path[1..])?,
            include_array_index: None,
            preserve_null_and_empty: false,
        }),
        Bson::Document(spec) => {
            let path = spec
                .get_str("path")
                .ok()
                .filter(|p| p.starts_with('$'))
                .ok_or_else(|| malformed("$unwind", "requires a `$`-prefixed `path`"))?;
            let include_array_index = spec
                .get_str("includeArrayIndex")
                .ok()
                .map(|field| {
                    ident::validate_identifier(field)?;
                    FieldPath::parse(field)
                })
                .transpose()?;
            Ok(UnwindSpec {
                path: FieldPath::parse(&path[1..])?,
                include_array_index,
                preserve_null_and_empty: spec
                    .get_bool("preserveNullAndEmptyArrays")
                    .unwrap_or(false),
            })
        }
        _ => Err(malformed("$unwind", "takes a path or an options document")),
    }
}

/// `$match`: a WHERE fragment.
pub(crate) fn translate_match(
    filter: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    gen_filter::translate_filter(filter, ctx, params)
}

/// `$project`: a SELECT expression; exclusion when every value (except
/// `_id`'s) is falsy, inclusion otherwise.
pub(crate) fn translate_project(
    spec: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let exclusion = spec
        .iter()
        .all(|(key, value)| key == "_id" || is_falsy(value));

    if exclusion {
        let paths = spec
            .iter()
            .filter(|(_, value)| is_falsy(value))
            .map(|(key, _)| FieldPath::parse(key))
            .collect::<Result<Vec<_>>>()?;
        return ctx.dialect.json_remove(DOC_COLUMN, &paths);
    }

    ctx.function_fields.clear();
    let mut pairs = Vec::with_capacity(spec.len());
    for (key, value) in spec {
        if key == "_id" && is_falsy(value) {
            continue;
        }
        let path = FieldPath::parse(key)?;
        let sql = match value {
            Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => {
                ctx.dialect.json_extract(DOC_COLUMN, &path)
            }
            Bson::String(reference) if reference.starts_with('$') => {
                gen_expr::translate_field_ref(reference, ctx)?
            }
            Bson::Document(_) => gen_expr::translate_expr(value, ctx, params)?,
            literal => params.push_bson(literal)?.to_string(),
        };
        pairs.push((path.dotted(), sql));
    }

    // Any `$function` in the projection needs its source fields in the
    // output envelope, whether or not they were projected, so the executor
    // can gather arguments later.
    let function_fields = std::mem::take(&mut ctx.function_fields);
    for path in function_fields {
        if pairs.iter().any(|(name, _)| *name == path.dotted()) {
            continue;
        }
        let sql = ctx.dialect.json_extract(DOC_COLUMN, &path);
        pairs.push((path.dotted(), sql));
    }

    Ok(ctx.dialect.json_object(&pairs))
}

pub(crate) fn is_falsy(value: &Bson) -> bool {
    matches!(value, Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false))
        || matches!(value, Bson::Double(f) if *f == 0.0)
}

/// `$group`: a grouped SELECT expression plus its GROUP BY keys. The
/// two come back as separate fragments because a WHERE clause binds its
/// parameters between theirs.
pub(crate) fn translate_group(
    spec: &Document,
    ctx: &mut Context,
) -> Result<(Fragment, Option<Fragment>)> {
    let id = spec.get("_id").ok_or_else(|| malformed("$group", "`_id` is required"))?;

    let mut select_params = ParamBuf::new();
    let mut pairs = Vec::with_capacity(spec.len());
    let mut group_keys = Vec::new();

    match id {
        Bson::Null => {
            pairs.push(("_id".to_string(), "NULL".to_string()));
        }
        Bson::String(reference) if reference.starts_with('$') => {
            let key = gen_expr::translate_field_ref(reference, ctx)?;
            pairs.push(("_id".to_string(), key.clone()));
            group_keys.push(key);
        }
        Bson::Document(compound) if compound.keys().all(|k| !k.starts_with('$')) => {
            let mut id_pairs = Vec::with_capacity(compound.len());
            for (key, value) in compound {
                let name = FieldPath::parse(key)?;
                let sql = gen_expr::translate_expr(value, ctx, &mut select_params)?;
                id_pairs.push((name.dotted(), sql.clone()));
                group_keys.push(sql);
            }
            pairs.push(("_id".to_string(), ctx.dialect.json_object(&id_pairs)));
        }
        expr => {
            let key = gen_expr::translate_expr(expr, ctx, &mut select_params)?;
            pairs.push(("_id".to_string(), key.clone()));
            group_keys.push(key);
        }
    }

    for (key, value) in spec {
        if key == "_id" {
            continue;
        }
        let name = FieldPath::parse(key)?;
        pairs.push((
            name.dotted(),
            translate_accumulator(key, value, ctx, &mut select_params)?,
        ));
    }

    let group_by = if group_keys.is_empty() {
        None
    } else {
        // Rebind the key expressions: GROUP BY comes after the whole
        // SELECT list (and any WHERE clause) in the emitted SQL.
        let mut group_params = ParamBuf::new();
        let rebound = match id {
            Bson::Document(compound) if compound.keys().all(|k| !k.starts_with('$')) => compound
                .iter()
                .map(|(_, value)| gen_expr::translate_expr(value, ctx, &mut group_params))
                .collect::<Result<Vec<_>>>()?,
            Bson::String(_) | Bson::Null => group_keys,
            expr => vec![gen_expr::translate_expr(expr, ctx, &mut group_params)?],
        };
        Some(Fragment {
            sql: rebound.into_iter().join(", "),
            params: group_params,
        })
    };

    Ok((
        Fragment {
            sql: ctx.dialect.json_object(&pairs),
            params: select_params,
        },
        group_by,
    ))
}

fn translate_accumulator(
    field: &str,
    value: &Bson,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let spec = value.as_document().ok_or_else(|| {
        malformed("$group", &format!("`{field}` must be an accumulator document"))
    })?;
    let (op, arg) = spec.iter().exactly_one().map_err(|_| {
        malformed("$group", &format!("`{field}` takes exactly one accumulator"))
    })?;

    let acc = match op.as_str() {
        "$sum" => {
            // `$sum: 1` is a row count.
            if matches!(arg, Bson::Int32(1) | Bson::Int64(1)) {
                return Ok(ctx.dialect.count_all());
            }
            Accumulator::Sum
        }
        "$count" => return Ok(ctx.dialect.count_all()),
        "$avg" => Accumulator::Avg,
        "$min" => Accumulator::Min,
        "$max" => Accumulator::Max,
        "$first" => Accumulator::First,
        "$last" => Accumulator::Last,
        "$push" => Accumulator::Push,
        "$addToSet" => Accumulator::AddToSet,
        name => {
            return Err(Error::new(Reason::UnsupportedOperator {
                name: name.to_string(),
            }))
        }
    };

    let arg = gen_expr::translate_expr(arg, ctx, params)?;
    Ok(ctx.dialect.aggregate(acc, &arg))
}

/// `$sort`: an ORDER BY list. Directions must be exactly 1 or -1.
pub(crate) fn translate_sort(spec: &Document, ctx: &Context) -> Result<String> {
    let keys = spec
        .iter()
        .map(|(key, direction)| {
            let path = FieldPath::parse(key)?;
            let extract = ctx.dialect.json_extract(DOC_COLUMN, &path);
            let direction = match sort_direction(direction) {
                Some(1) => "ASC",
                Some(-1) => "DESC",
                _ => {
                    return Err(malformed(
                        "$sort",
                        &format!("direction for `{key}` must be 1 or -1"),
                    ))
                }
            };
            Ok(format!("{extract} {direction}"))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(keys.into_iter().join(", "))
}

pub(crate) fn sort_direction(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        Bson::Double(f) if *f == 1.0 => Some(1),
        Bson::Double(f) if *f == -1.0 => Some(-1),
        _ => None,
    }
}

/// `$count`: a single-document COUNT(*) envelope.
pub(crate) fn translate_count(field: &str, ctx: &Context) -> String {
    ctx.dialect
        .json_object(&[(field.to_string(), ctx.dialect.count_all())])
}

/// `$addFields` / `$set`: a chain of sets over the envelope.
pub(crate) fn translate_add_fields(
    spec: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let mut doc = DOC_COLUMN.to_string();
    for (key, value) in spec {
        let path = FieldPath::parse(key)?;
        let sql = gen_expr::translate_expr(value, ctx, params)?;
        doc = ctx.dialect.json_set(doc, &path, &sql);
    }
    Ok(doc)
}

/// `$replaceRoot`: promotes a sub-document or a rebuilt object.
pub(crate) fn translate_replace_root(
    spec: &Document,
    ctx: &mut Context,
    params: &mut ParamBuf,
) -> Result<String> {
    let new_root = spec
        .get("newRoot")
        .ok_or_else(|| malformed("$replaceRoot", "`newRoot` is required"))?;
    match new_root {
        Bson::String(reference) if reference.starts_with('$') => {
            gen_expr::translate_field_ref(reference, ctx)
        }
        Bson::Document(_) => gen_expr::translate_expr(new_root, ctx, params),
        _ => Err(malformed(
            "$replaceRoot",
            "`newRoot` must be a field reference or a document",
        )),
    }
}

/// `$bucket`: a CASE over the boundaries, grouped by the bucket label.
pub(crate) fn translate_bucket(
    spec: &Document,
    ctx: &mut Context,
) -> Result<(Fragment, Option<Fragment>)> {
    let group_by = spec
        .get("groupBy")
        .ok_or_else(|| malformed("$bucket", "`groupBy` is required"))?;
    let boundaries = spec
        .get_array("boundaries")
        .map_err(|_| malformed("$bucket", "`boundaries` must be an array"))?;
    if boundaries.len() < 2 {
        return Err(malformed("$bucket", "at least two boundaries are required"));
    }

    let bucket_case = |ctx: &mut Context, params: &mut ParamBuf| -> Result<String> {
        let value = gen_expr::translate_expr(group_by, ctx, params)?;
        let mut arms = Vec::with_capacity(boundaries.len() - 1);
        for pair in boundaries.windows(2) {
            let low = params.push_bson(&pair[0])?.to_string();
            let high = params.push_bson(&pair[1])?.to_string();
            let label = params.push_bson(&pair[0])?;
            arms.push(format!(
                "WHEN {value} >= {low} AND {value} < {high} THEN {label}"
            ));
        }
        let default = match spec.get("default") {
            Some(default) => params.push_bson(default)?.to_string(),
            None => "NULL".to_string(),
        };
        Ok(format!("CASE {} ELSE {default} END", arms.join(" ")))
    };

    let mut select_params = ParamBuf::new();
    let bucket = bucket_case(ctx, &mut select_params)?;

    let mut pairs = vec![("_id".to_string(), bucket)];
    match spec.get("output") {
        Some(Bson::Document(output)) => {
            for (key, value) in output {
                let name = FieldPath::parse(key)?;
                pairs.push((
                    name.dotted(),
                    translate_accumulator(key, value, ctx, &mut select_params)?,
                ));
            }
        }
        None => {
            pairs.push(("count".to_string(), ctx.dialect.count_all()));
        }
        Some(_) => return Err(malformed("$bucket", "`output` must be a document")),
    }

    // The same CASE again for GROUP BY, with its own late-bound buffer.
    let mut group_params = ParamBuf::new();
    let group_key = bucket_case(ctx, &mut group_params)?;
    Ok((
        Fragment {
            sql: ctx.dialect.json_object(&pairs),
            params: select_params,
        },
        Some(Fragment {
            sql: group_key,
            params: group_params,
        }),
    ))
}

/// `$unwind`: a CTE joining each array element.
pub(crate) fn translate_unwind(spec: &UnwindSpec, ctx: &Context, source: &str) -> String {
    ctx.dialect.unwind_cte(
        source,
        &spec.path,
        spec.include_array_index.as_ref(),
        spec.preserve_null_and_empty,
    )
}

/// `$lookup` in its `localField`/`foreignField` form. The `let`/`pipeline`
/// form needs the planner (it translates a sub-pipeline) and lives there.
pub(crate) struct LookupSpec {
    pub from: String,
    pub as_path: FieldPath,
    pub kind: LookupKind,
}

pub(crate) enum LookupKind {
    Keys {
        local: FieldPath,
        foreign: FieldPath,
    },
    Pipeline {
        variables: Vec<(String, String)>,
        pipeline: Vec<Document>,
    },
}

pub(crate) fn parse_lookup(spec: &Document, ctx: &Context) -> Result<LookupSpec> {
    let from = spec
        .get_str("from")
        .map_err(|_| malformed("$lookup", "`from` is required"))?;
    ident::validate_identifier(from)?;
    let as_field = spec
        .get_str("as")
        .map_err(|_| malformed("$lookup", "`as` is required"))?;
    let as_path = FieldPath::parse(as_field)?;

    let kind = if spec.contains_key("pipeline") {
        let pipeline = spec
            .get_array("pipeline")
            .map_err(|_| malformed("$lookup", "`pipeline` must be an array"))?
            .iter()
            .map(|stage| {
                stage.as_document().cloned().ok_or_else(|| {
                    malformed("$lookup", "`pipeline` entries must be stage documents")
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut variables = Vec::new();
        if let Some(Bson::Document(lets)) = spec.get("let") {
            for (name, value) in lets {
                ident::validate_identifier(name)?;
                // Only field references are representable: a variable is
                // spliced into the sub-pipeline as correlated SQL, and a
                // bound value there would break placeholder ordering.
                let reference = value
                    .as_str()
                    .filter(|s| s.starts_with('$') && !s.starts_with("$$"))
                    .ok_or_else(|| {
                        malformed("$lookup", "`let` values must be field references")
                    })?;
                let path = FieldPath::parse(&reference[1..])?;
                variables.push((
                    name.to_string(),
                    ctx.dialect.json_extract("src.data", &path),
                ));
            }
        }
        LookupKind::Pipeline {
            variables,
            pipeline,
        }
    } else {
        let local = spec
            .get_str("localField")
            .map_err(|_| malformed("$lookup", "`localField` is required"))?;
        let foreign = spec
            .get_str("foreignField")
            .map_err(|_| malformed("$lookup", "`foreignField` is required"))?;
        LookupKind::Keys {
            local: FieldPath::parse(local)?,
            foreign: FieldPath::parse(foreign)?,
        }
    };

    Ok(LookupSpec {
        from: from.to_string(),
        as_path,
        kind,
    })
}
