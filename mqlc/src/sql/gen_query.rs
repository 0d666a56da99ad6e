//! Pipeline planning: stage order rewrites, flat-clause accumulation
//! versus CTE chaining, and final statement assembly.
//!
//! Fragments are assembled into SQL in textual order and their parameter
//! buffers concatenated in the same order, which keeps placeholders and
//! parameters aligned without any counting.

use bson::Document;
use itertools::Itertools;

use super::gen_stage::{self, Stage, StageCategory};
use super::{search, Context, FacetQuery, Fragment, SqlQuery};
use crate::ident;
use crate::params::ParamBuf;
use crate::{Error, Options, Reason, Result, WithErrorInfo};

pub(crate) fn plan(
    collection: &str,
    pipeline: &[Document],
    options: &Options,
) -> Result<SqlQuery> {
    let mut ctx = Context::new(options.dialect, collection)?;

    let mut stages: Vec<(usize, Stage)> = Vec::with_capacity(pipeline.len());
    for (index, raw) in pipeline.iter().enumerate() {
        for stage in Stage::parse(raw).with_stage(index)? {
            stages.push((index, stage));
        }
    }

    check_positions(&stages)?;

    let post_sort = stages
        .iter()
        .rev()
        .find_map(|(_, stage)| match stage {
            Stage::Sort(spec) => Some(spec.clone()),
            _ => None,
        });

    if options.optimize {
        optimize(&mut stages);
    }

    let mut planner = Planner::new(&mut ctx, collection.to_string());
    let facets = planner.run(&stages)?;
    let (sql, params) = planner.finish();

    Ok(SqlQuery {
        sql,
        params: params.into_values(),
        facets,
        post_sort,
    })
}

/// Translate a sub-pipeline (a `$lookup` pipeline) against `collection`,
/// reusing the surrounding context for dialect and variables.
fn plan_nested(
    collection: &str,
    pipeline: &[Document],
    ctx: &mut Context,
) -> Result<(String, ParamBuf)> {
    ident::validate_identifier(collection)?;

    let mut stages = Vec::with_capacity(pipeline.len());
    for (index, raw) in pipeline.iter().enumerate() {
        for stage in Stage::parse(raw).with_stage(index)? {
            stages.push((index, stage));
        }
    }

    let mut planner = Planner::new(ctx, collection.to_string());
    let facets = planner.run(&stages)?;
    if !facets.is_empty() {
        return Err(Error::new(Reason::MalformedStage {
            stage: "$facet".to_string(),
            details: "$facet cannot appear inside $lookup".to_string(),
        }));
    }
    Ok(planner.finish())
}

fn check_positions(stages: &[(usize, Stage)]) -> Result<()> {
    for (position, (index, stage)) in stages.iter().enumerate() {
        match stage {
            Stage::Search(_) if position != 0 => {
                return Err(Error::new(Reason::MalformedStage {
                    stage: "$search".to_string(),
                    details: "must be the first stage".to_string(),
                })
                .with_stage(*index));
            }
            Stage::Facet(_) if position + 1 != stages.len() => {
                return Err(Error::new(Reason::MalformedStage {
                    stage: "$facet".to_string(),
                    details: "must be the last stage".to_string(),
                })
                .with_stage(*index));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Clauses of a single SELECT, gathered before emission. Each slot keeps
/// the parameters its SQL binds.
#[derive(Default)]
struct Clauses {
    select: Option<Fragment>,
    wheres: Vec<Fragment>,
    group_by: Option<Fragment>,
    order_by: Option<Fragment>,
    limit: Option<i64>,
    offset: Option<i64>,
    transforms_shape: bool,
}

impl Clauses {
    fn is_empty(&self) -> bool {
        self.select.is_none()
            && self.wheres.is_empty()
            && self.group_by.is_none()
            && self.order_by.is_none()
            && self.limit.is_none()
            && self.offset.is_none()
    }
}

/// The planner is a two-state machine: while clauses accumulate they
/// overlay one pending SELECT; a stage that cannot share it seals the
/// pending clauses into a `stage_<n>` CTE and accumulation starts over
/// against that CTE as the new source.
struct Planner<'a> {
    ctx: &'a mut Context,
    ctes: Vec<(String, String)>,
    params: ParamBuf,
    source: String,
    pending: Clauses,
    cte_seq: usize,
}

impl<'a> Planner<'a> {
    fn new(ctx: &'a mut Context, source: String) -> Self {
        Planner {
            ctx,
            ctes: Vec::new(),
            params: ParamBuf::new(),
            source,
            pending: Clauses::default(),
            cte_seq: 0,
        }
    }

    fn run(&mut self, stages: &[(usize, Stage)]) -> Result<Vec<FacetQuery>> {
        for (index, stage) in stages {
            match stage.category() {
                StageCategory::Simple | StageCategory::ShapeTransform => {
                    self.accumulate(stage).with_stage(*index)?;
                }
                StageCategory::Flushing => {
                    if let Some(facets) = self.flush_stage(stage).with_stage(*index)? {
                        return Ok(facets);
                    }
                }
            }
        }
        Ok(Vec::new())
    }

    /// Overlay a simple or shape-transforming stage onto the pending
    /// SELECT, flushing first when the stage cannot share it.
    fn accumulate(&mut self, stage: &Stage) -> Result<()> {
        match stage {
            Stage::Match(filter) => {
                if self.pending.transforms_shape
                    || self.pending.limit.is_some()
                    || self.pending.offset.is_some()
                {
                    self.flush();
                }
                let mut params = ParamBuf::new();
                let sql = gen_stage::translate_match(filter, self.ctx, &mut params)?;
                self.pending.wheres.push(Fragment { sql, params });
            }
            Stage::Sort(spec) => {
                if self.pending.limit.is_some() || self.pending.offset.is_some() {
                    self.flush();
                }
                let sql = gen_stage::translate_sort(spec, self.ctx)?;
                self.pending.order_by = Some(Fragment {
                    sql,
                    params: ParamBuf::new(),
                });
            }
            Stage::Limit(n) => {
                self.pending.limit = Some(self.pending.limit.map_or(*n, |prev| prev.min(*n)));
            }
            Stage::Skip(n) => {
                if self.pending.limit.is_some() {
                    self.flush();
                }
                self.pending.offset = Some(self.pending.offset.unwrap_or(0) + n);
            }
            shape => {
                if self.pending.transforms_shape
                    || self.pending.group_by.is_some()
                    || self.pending.order_by.is_some()
                {
                    self.flush();
                }
                self.apply_shape(shape)?;
            }
        }
        Ok(())
    }

    fn apply_shape(&mut self, stage: &Stage) -> Result<()> {
        let (select, group_by) = match stage {
            Stage::Project(spec) => {
                let mut params = ParamBuf::new();
                let sql = gen_stage::translate_project(spec, self.ctx, &mut params)?;
                (Fragment { sql, params }, None)
            }
            Stage::Group(spec) => gen_stage::translate_group(spec, self.ctx)?,
            Stage::Bucket(spec) => gen_stage::translate_bucket(spec, self.ctx)?,
            Stage::Count(field) => (
                Fragment {
                    sql: gen_stage::translate_count(field, self.ctx),
                    params: ParamBuf::new(),
                },
                None,
            ),
            Stage::AddFields(spec) => {
                let mut params = ParamBuf::new();
                let sql = gen_stage::translate_add_fields(spec, self.ctx, &mut params)?;
                (Fragment { sql, params }, None)
            }
            Stage::ReplaceRoot(spec) => {
                let mut params = ParamBuf::new();
                let sql = gen_stage::translate_replace_root(spec, self.ctx, &mut params)?;
                (Fragment { sql, params }, None)
            }
            other => unreachable!("{} is not a shape transform", other.name()),
        };

        self.pending.select = Some(select);
        self.pending.group_by = group_by;
        self.pending.transforms_shape = true;
        Ok(())
    }

    /// A flushing stage: seal anything pending into a CTE, then emit the
    /// stage's own CTE (or, for `$facet`, terminate the plan).
    fn flush_stage(&mut self, stage: &Stage) -> Result<Option<Vec<FacetQuery>>> {
        self.flush();
        match stage {
            Stage::Search(spec) => {
                let mut params = ParamBuf::new();
                let body = search::translate_search_stage(spec, self.ctx, &mut params)?;
                self.push_cte(body, params);
            }
            Stage::Unwind(spec) => {
                let body = gen_stage::translate_unwind(spec, self.ctx, &self.source);
                self.push_cte(body, ParamBuf::new());
            }
            Stage::Lookup(spec) => {
                let lookup = gen_stage::parse_lookup(spec, self.ctx)?;
                match lookup.kind {
                    gen_stage::LookupKind::Keys { local, foreign } => {
                        let body = self.ctx.dialect.lookup_cte(
                            &self.source,
                            &lookup.from,
                            &local,
                            &foreign,
                            &lookup.as_path,
                        );
                        self.push_cte(body, ParamBuf::new());
                    }
                    gen_stage::LookupKind::Pipeline {
                        variables,
                        pipeline,
                    } => {
                        let saved = std::mem::take(&mut self.ctx.variables);
                        self.ctx.variables = variables.into_iter().collect();
                        let inner = plan_nested(&lookup.from, &pipeline, self.ctx);
                        self.ctx.variables = saved;
                        let (inner_sql, inner_params) = inner?;

                        let body = self.ctx.dialect.lookup_pipeline_cte(
                            &self.source,
                            &inner_sql,
                            &lookup.as_path,
                        )?;
                        self.push_cte(body, inner_params);
                    }
                }
            }
            Stage::Facet(spec) => return self.plan_facets(spec).map(Some),
            other => unreachable!("{} is not a flushing stage", other.name()),
        }
        Ok(None)
    }

    /// Each facet re-plans its sub-pipeline over the same input source,
    /// carrying the outer CTE chain and parameters so the facet query is
    /// self-contained. Facets never share parameter slots with each other.
    fn plan_facets(&mut self, spec: &Document) -> Result<Vec<FacetQuery>> {
        let mut facets = Vec::with_capacity(spec.len());
        for (name, sub) in spec {
            ident::validate_field_path(name)?;
            let pipeline = sub
                .as_array()
                .ok_or_else(|| {
                    Error::new(Reason::MalformedStage {
                        stage: "$facet".to_string(),
                        details: format!("facet `{name}` must be a pipeline array"),
                    })
                })?
                .iter()
                .map(|stage| {
                    stage.as_document().cloned().ok_or_else(|| {
                        Error::new(Reason::MalformedStage {
                            stage: "$facet".to_string(),
                            details: format!("facet `{name}` entries must be stage documents"),
                        })
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            let mut stages = Vec::with_capacity(pipeline.len());
            for (index, raw) in pipeline.iter().enumerate() {
                for stage in Stage::parse(raw).with_stage(index)? {
                    stages.push((index, stage));
                }
            }

            let mut sub_planner = Planner::new(self.ctx, self.source.clone());
            sub_planner.ctes = self.ctes.clone();
            sub_planner.params = self.params.clone();
            sub_planner.cte_seq = self.cte_seq;
            let nested = sub_planner.run(&stages)?;
            if !nested.is_empty() {
                return Err(Error::new(Reason::MalformedStage {
                    stage: "$facet".to_string(),
                    details: "facets cannot nest".to_string(),
                }));
            }
            let (sql, params) = sub_planner.finish();
            facets.push(FacetQuery {
                name: name.to_string(),
                sql,
                params: params.into_values(),
            });
        }
        Ok(facets)
    }

    fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let (sql, params) = assemble(&pending, &self.source, self.ctx);
        self.push_cte(sql, params);
    }

    fn push_cte(&mut self, body: String, params: ParamBuf) {
        let name = format!("stage_{}", self.cte_seq);
        self.cte_seq += 1;
        self.ctes.push((name.clone(), body));
        self.params.append(params);
        self.source = name;
    }

    fn finish(mut self) -> (String, ParamBuf) {
        let (final_sql, final_params) = if self.pending.is_empty() {
            (format!("SELECT data FROM {}", self.source), ParamBuf::new())
        } else {
            let pending = std::mem::take(&mut self.pending);
            assemble(&pending, &self.source, self.ctx)
        };
        self.params.append(final_params);

        let sql = if self.ctes.is_empty() {
            final_sql
        } else {
            let ctes = self
                .ctes
                .iter()
                .map(|(name, body)| format!("{name} AS ({body})"))
                .join(", ");
            format!("WITH {ctes} {final_sql}")
        };
        (sql, self.params)
    }
}

/// Emit one SELECT from accumulated clauses, concatenating parameter
/// buffers in the order their SQL appears.
fn assemble(clauses: &Clauses, source: &str, ctx: &Context) -> (String, ParamBuf) {
    let mut params = ParamBuf::new();
    let mut sql = String::from("SELECT ");

    match &clauses.select {
        Some(fragment) => {
            sql.push_str(&format!("{} AS data", fragment.sql));
            params.append(fragment.params.clone());
        }
        None => sql.push_str("data"),
    }
    sql.push_str(&format!(" FROM {source}"));

    if !clauses.wheres.is_empty() {
        let condition = clauses.wheres.iter().map(|f| f.sql.as_str()).join(" AND ");
        sql.push_str(&format!(" WHERE {condition}"));
        for fragment in &clauses.wheres {
            params.append(fragment.params.clone());
        }
    }

    if let Some(fragment) = &clauses.group_by {
        sql.push_str(&format!(" GROUP BY {}", fragment.sql));
        params.append(fragment.params.clone());
    }

    if let Some(fragment) = &clauses.order_by {
        sql.push_str(&format!(" ORDER BY {}", fragment.sql));
        params.append(fragment.params.clone());
    }

    let tail = ctx.dialect.limit_offset(clauses.limit, clauses.offset);
    if !tail.is_empty() {
        sql.push_str(&format!(" {tail}"));
    }

    (sql, params)
}

/// Rule-based stage rewrites: merge adjacent `$match`/`$limit` stages,
/// drop no-ops, and move `$match` upstream past projections that do not
/// rewrite the filtered fields.
fn optimize(stages: &mut Vec<(usize, Stage)>) {
    loop {
        let mut changed = false;

        stages.retain(|(_, stage)| {
            let noop = matches!(stage, Stage::Skip(0)) || matches!(stage, Stage::Limit(i64::MAX));
            if noop {
                changed = true;
            }
            !noop
        });

        let mut i = 0;
        while i + 1 < stages.len() {
            let merged = match (&stages[i].1, &stages[i + 1].1) {
                (Stage::Match(a), Stage::Match(b)) => {
                    Some(Stage::Match(bson::doc! { "$and": [a.clone(), b.clone()] }))
                }
                (Stage::Limit(a), Stage::Limit(b)) => Some(Stage::Limit(*a.min(b))),
                (Stage::Skip(a), Stage::Skip(b)) => Some(Stage::Skip(a + b)),
                _ => None,
            };
            if let Some(merged) = merged {
                stages[i].1 = merged;
                stages.remove(i + 1);
                changed = true;
                continue;
            }

            let push_upstream = match (&stages[i].1, &stages[i + 1].1) {
                (Stage::Project(projection), Stage::Match(filter)) => {
                    can_push_before_project(filter, projection)
                }
                (Stage::AddFields(assigned), Stage::Match(filter)) => {
                    can_push_before_add_fields(filter, assigned)
                }
                _ => false,
            };
            if push_upstream {
                stages.swap(i, i + 1);
                changed = true;
                // The moved filter may now be adjacent to another $match.
                i = i.saturating_sub(1);
                continue;
            }

            i += 1;
        }

        if !changed {
            break;
        }
    }

    log::debug!(
        "optimized pipeline: [{}]",
        stages.iter().map(|(_, s)| s.name()).join(", ")
    );
}

/// Top-level field paths a filter touches, or None when it contains
/// operators we cannot reason about (`$expr`, `$text`).
fn filter_paths(filter: &Document) -> Option<Vec<String>> {
    let mut paths = Vec::new();
    if collect_filter_paths(filter, &mut paths) {
        Some(paths)
    } else {
        None
    }
}

fn collect_filter_paths(filter: &Document, out: &mut Vec<String>) -> bool {
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let Some(subs) = value.as_array() else {
                    return false;
                };
                for sub in subs {
                    let Some(sub) = sub.as_document() else {
                        return false;
                    };
                    if !collect_filter_paths(sub, out) {
                        return false;
                    }
                }
            }
            key if key.starts_with('$') => return false,
            _ => out.push(key.to_string()),
        }
    }
    true
}

fn overlaps(a: &str, b: &str) -> bool {
    a == b
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'))
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('.'))
}

fn can_push_before_project(filter: &Document, projection: &Document) -> bool {
    let Some(paths) = filter_paths(filter) else {
        return false;
    };

    let exclusion = projection
        .iter()
        .all(|(key, value)| key == "_id" || gen_stage::is_falsy(value));

    if exclusion {
        // Safe unless the filter touches an excluded field.
        !projection
            .iter()
            .filter(|(_, value)| gen_stage::is_falsy(value))
            .any(|(excluded, _)| paths.iter().any(|path| overlaps(excluded, path)))
    } else {
        // Every filtered field must pass through as itself: included
        // verbatim, or living under a verbatim-included prefix.
        paths.iter().all(|path| {
            projection.iter().any(|(key, value)| {
                is_identity(value) && covers(key, path)
            })
        })
    }
}

/// Whether including `key` carries `path` through unchanged.
fn covers(key: &str, path: &str) -> bool {
    key == path || path.strip_prefix(key).is_some_and(|rest| rest.starts_with('.'))
}

fn is_identity(value: &bson::Bson) -> bool {
    matches!(
        value,
        bson::Bson::Int32(1) | bson::Bson::Int64(1) | bson::Bson::Boolean(true)
    )
}

fn can_push_before_add_fields(filter: &Document, assigned: &Document) -> bool {
    let Some(paths) = filter_paths(filter) else {
        return false;
    };
    !assigned
        .keys()
        .any(|key| paths.iter().any(|path| overlaps(key, path)))
}

#[cfg(test)]
mod tests {
    use bson::doc;
    use insta::assert_snapshot;

    use super::*;
    use crate::params::ParamValue;
    use crate::sql::Dialect;

    fn translate(pipeline: &[Document]) -> SqlQuery {
        plan("orders", pipeline, &Options::default()).unwrap()
    }

    #[test]
    fn empty_pipeline_selects_everything() {
        let query = translate(&[]);
        assert_snapshot!(query.sql, @"SELECT data FROM orders");
        assert!(query.params.is_empty());
    }

    #[test]
    fn group_sort_limit_stays_flat() {
        let query = translate(&[
            doc! { "$match": { "country": "US" } },
            doc! { "$group": { "_id": "$city", "n": { "$sum": 1 } } },
            doc! { "$sort": { "n": -1 } },
            doc! { "$limit": 5 },
        ]);
        assert_snapshot!(query.sql, @"SELECT json_object('_id', json_extract(data, '$.city'), 'n', COUNT(*)) AS data FROM orders WHERE json_extract(data, '$.country') = ? GROUP BY json_extract(data, '$.city') ORDER BY json_extract(data, '$.n') DESC LIMIT 5");
        assert_eq!(query.params, vec![ParamValue::String("US".into())]);
    }

    #[test]
    fn unwind_project_chains_ctes() {
        let query = translate(&[
            doc! { "$unwind": "$tags" },
            doc! { "$project": { "tag": "$tags" } },
        ]);
        assert_snapshot!(query.sql, @"WITH stage_0 AS (SELECT json_set(src.data, '$.tags', each.value) AS data FROM orders AS src JOIN json_each(json_extract(src.data, '$.tags')) AS each) SELECT json_object('tag', json_extract(data, '$.tags')) AS data FROM stage_0");
    }

    #[test]
    fn match_after_project_rename_needs_a_cte() {
        let query = translate(&[
            doc! { "$project": { "city": "$address.city" } },
            doc! { "$match": { "city": "Lisbon" } },
        ]);
        assert_snapshot!(query.sql, @"WITH stage_0 AS (SELECT json_object('city', json_extract(data, '$.address.city')) AS data FROM orders) SELECT data FROM stage_0 WHERE json_extract(data, '$.city') = ?");
    }

    #[test]
    fn match_pushes_past_identity_projection() {
        let query = translate(&[
            doc! { "$project": { "city": 1, "total": 1 } },
            doc! { "$match": { "city": "Lisbon" } },
        ]);
        // The filter moved ahead of the projection, so one SELECT suffices.
        assert_snapshot!(query.sql, @"SELECT json_object('city', json_extract(data, '$.city'), 'total', json_extract(data, '$.total')) AS data FROM orders WHERE json_extract(data, '$.city') = ?");
    }

    #[test]
    fn adjacent_limits_take_the_minimum() {
        let query = translate(&[doc! { "$limit": 10 }, doc! { "$limit": 3 }]);
        assert_snapshot!(query.sql, @"SELECT data FROM orders LIMIT 3");
    }

    #[test]
    fn skip_zero_is_dropped() {
        let query = translate(&[doc! { "$skip": 0 }]);
        assert_snapshot!(query.sql, @"SELECT data FROM orders");
    }

    #[test]
    fn limit_then_skip_cannot_share_a_select() {
        let query = translate(&[doc! { "$limit": 5 }, doc! { "$skip": 2 }]);
        assert_snapshot!(query.sql, @"WITH stage_0 AS (SELECT data FROM orders LIMIT 5) SELECT data FROM stage_0 LIMIT -1 OFFSET 2");
    }

    #[test]
    fn skip_then_limit_shares_a_select() {
        let query = translate(&[doc! { "$skip": 2 }, doc! { "$limit": 5 }]);
        assert_snapshot!(query.sql, @"SELECT data FROM orders LIMIT 5 OFFSET 2");
    }

    #[test]
    fn lookup_merges_foreign_matches() {
        let query = translate(&[doc! {
            "$lookup": {
                "from": "users",
                "localField": "user_id",
                "foreignField": "_id",
                "as": "user",
            }
        }]);
        assert_snapshot!(query.sql, @"WITH stage_0 AS (SELECT json_set(src.data, '$.user', COALESCE((SELECT json_group_array(json(f.data)) FROM users AS f WHERE json_extract(f.data, '$._id') = json_extract(src.data, '$.user_id')), json('[]'))) AS data FROM orders AS src) SELECT data FROM stage_0");
    }

    #[test]
    fn lookup_pipeline_mode_correlates_variables() {
        let query = translate(&[doc! {
            "$lookup": {
                "from": "payments",
                "let": { "order": "$_id" },
                "pipeline": [ { "$match": { "$expr": { "$eq": ["$order_id", "$$order"] } } } ],
                "as": "payments",
            }
        }]);
        assert_snapshot!(query.sql, @"WITH stage_0 AS (SELECT json_set(src.data, '$.payments', COALESCE((SELECT json_group_array(json(data)) FROM (SELECT data FROM payments WHERE ((json_extract(data, '$.order_id') = json_extract(src.data, '$._id'))))), json('[]'))) AS data FROM orders AS src) SELECT data FROM stage_0");
    }

    #[test]
    fn facets_share_the_prefix_but_not_parameters() {
        let query = translate(&[
            doc! { "$match": { "status": "paid" } },
            doc! { "$facet": {
                "by_city": [ { "$group": { "_id": "$city", "n": { "$sum": 1 } } } ],
                "recent": [ { "$sort": { "placed": -1 } }, { "$limit": 3 } ],
            } },
        ]);

        assert_eq!(query.facets.len(), 2);
        let by_city = &query.facets[0];
        assert_snapshot!(by_city.sql, @"WITH stage_0 AS (SELECT data FROM orders WHERE json_extract(data, '$.status') = ?) SELECT json_object('_id', json_extract(data, '$.city'), 'n', COUNT(*)) AS data FROM stage_0 GROUP BY json_extract(data, '$.city')");
        assert_eq!(by_city.params, vec![ParamValue::String("paid".into())]);

        let recent = &query.facets[1];
        assert_snapshot!(recent.sql, @"WITH stage_0 AS (SELECT data FROM orders WHERE json_extract(data, '$.status') = ?) SELECT data FROM stage_0 ORDER BY json_extract(data, '$.placed') DESC LIMIT 3");
        assert_eq!(recent.params, vec![ParamValue::String("paid".into())]);
    }

    #[test]
    fn search_must_come_first() {
        let err = plan(
            "articles",
            &[
                doc! { "$match": { "a": 1 } },
                doc! { "$search": { "text": { "query": "x" } } },
            ],
            &Options::default(),
        )
        .unwrap_err();
        assert!(matches!(err.reason, Reason::MalformedStage { .. }));
        assert_eq!(err.stage, Some(1));
    }

    #[test]
    fn optimizer_can_be_disabled() {
        let options = Options::default().no_optimize();
        let query = plan(
            "orders",
            &[doc! { "$limit": 10 }, doc! { "$limit": 3 }],
            &options,
        )
        .unwrap();
        assert_snapshot!(query.sql, @"SELECT data FROM orders LIMIT 3");
    }

    #[test]
    fn translation_is_deterministic() {
        let pipeline = [
            doc! { "$match": { "country": "US", "total": { "$gte": 10 } } },
            doc! { "$group": { "_id": "$city", "n": { "$sum": 1 } } },
            doc! { "$sort": { "n": -1 } },
        ];
        let a = translate(&pipeline);
        let b = translate(&pipeline);
        assert_eq!(a, b);
    }

    #[test]
    fn clickhouse_group_swaps_the_envelope() {
        let options = Options::default().with_dialect(Dialect::ClickHouse);
        let query = plan(
            "orders",
            &[
                doc! { "$match": { "country": "US" } },
                doc! { "$group": { "_id": "$city", "n": { "$sum": 1 } } },
            ],
            &options,
        )
        .unwrap();
        assert_snapshot!(query.sql, @"SELECT tuple('_id', JSONExtractRaw(data, 'city'), 'n', count()) AS data FROM orders WHERE JSONExtractRaw(data, 'country') = ? GROUP BY JSONExtractRaw(data, 'city')");
    }

    #[test]
    fn placeholders_match_parameters() {
        let query = translate(&[
            doc! { "$match": { "a": { "$in": [1, 2, 3] }, "b": "x" } },
            doc! { "$group": { "_id": "$c", "n": { "$sum": 1 } } },
            doc! { "$limit": 2 },
        ]);
        let placeholders = query.sql.matches('?').count();
        assert_eq!(placeholders, query.params.len());
    }
}
