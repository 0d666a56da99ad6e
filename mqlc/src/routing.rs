//! Routing of analytical SQL between the two analytical engines.
//!
//! A pure decision function: inspect the query text for features, score
//! its complexity, and pick between the lightweight local engine and the
//! ClickHouse cluster, honoring explicit and preferred choices and
//! falling back when an engine is down. Every decision is returned as a
//! serializable record explaining itself.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::{Error, Reason, Result};

const ROUTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result-size hint above which the local engine is considered too small.
const LARGE_RESULT_ROWS: u64 = 1_000_000;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// In-process analytical engine: fast to reach, no joins, windows,
    /// CTEs or set operations.
    Lite,
    /// The ClickHouse cluster; full SQL surface.
    ClickHouse,
}

impl Engine {
    fn other(self) -> Engine {
        match self {
            Engine::Lite => Engine::ClickHouse,
            Engine::ClickHouse => Engine::Lite,
        }
    }
}

/// Availability signals, supplied by the catalog client.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineCatalog {
    pub lite_available: bool,
    pub clickhouse_available: bool,
}

impl EngineCatalog {
    fn available(&self, engine: Engine) -> bool {
        match engine {
            Engine::Lite => self.lite_available,
            Engine::ClickHouse => self.clickhouse_available,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RoutingRequest {
    /// Caller-forced engine; wins over everything, with warnings.
    pub explicit_engine: Option<Engine>,
    /// Configured default, used when it is available.
    pub preferred_engine: Option<Engine>,
    /// Result-size hint in rows, when the caller has one.
    pub estimated_rows: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFeatures {
    pub joins: bool,
    pub implicit_join: bool,
    pub window_functions: bool,
    pub ctes: bool,
    pub recursive_ctes: bool,
    pub set_ops: bool,
    pub subqueries: bool,
    pub group_by: bool,
    pub having: bool,
    pub order_by: bool,
    pub distinct: bool,
    pub table_count: usize,
}

impl QueryFeatures {
    /// Features the lightweight engine cannot run.
    fn beyond_lite(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.joins || self.implicit_join {
            missing.push("joins");
        }
        if self.window_functions {
            missing.push("window functions");
        }
        if self.ctes {
            missing.push("common table expressions");
        }
        if self.set_ops {
            missing.push("set operations");
        }
        missing
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// The decision record handed back to the shell, with enough context to
/// log and to explain after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub engine: Engine,
    pub reason: String,
    pub features: QueryFeatures,
    pub fallback: bool,
    pub may_fail: bool,
    pub warnings: Vec<String>,
    pub complexity: Complexity,
    pub estimated_rows: Option<u64>,
    pub decided_at: DateTime<Utc>,
    pub version: String,
}

struct Patterns {
    join: Regex,
    implicit_join: Regex,
    window: Regex,
    cte: Regex,
    recursive_cte: Regex,
    set_op: Regex,
    subquery: Regex,
    group_by: Regex,
    having: Regex,
    order_by: Regex,
    distinct: Regex,
    table_head: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("static pattern")
        };
        Patterns {
            join: build(r"\bJOIN\b"),
            implicit_join: build(r"\bFROM\s+\w+(?:\s+\w+)?\s*,\s*\w+"),
            window: build(
                r"\bOVER\s*\(|\b(?:ROW_NUMBER|RANK|DENSE_RANK|LAG|LEAD|NTILE|FIRST_VALUE|LAST_VALUE)\s*\(",
            ),
            // `WITH` introducing a CTE, as opposed to `WITH TIME ZONE`
            // and the like.
            cte: build(r"\bWITH\s+(?:RECURSIVE\s+)?[A-Za-z_][A-Za-z0-9_]*\s+AS\s*\("),
            recursive_cte: build(r"\bWITH\s+RECURSIVE\b"),
            set_op: build(r"\b(?:UNION|INTERSECT|EXCEPT)\b"),
            subquery: build(r"\(\s*SELECT\b"),
            group_by: build(r"\bGROUP\s+BY\b"),
            having: build(r"\bHAVING\b"),
            order_by: build(r"\bORDER\s+BY\b"),
            distinct: build(r"\bSELECT\s+DISTINCT\b"),
            table_head: build(r"\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_.]*)"),
        }
    })
}

pub fn detect_features(sql: &str) -> QueryFeatures {
    let p = patterns();

    let mut tables: Vec<String> = p
        .table_head
        .captures_iter(sql)
        .map(|captures| captures[1].to_lowercase())
        .collect();
    tables.sort();
    tables.dedup();

    QueryFeatures {
        joins: p.join.is_match(sql),
        implicit_join: p.implicit_join.is_match(sql),
        window_functions: p.window.is_match(sql),
        ctes: p.cte.is_match(sql),
        recursive_ctes: p.recursive_cte.is_match(sql),
        set_ops: p.set_op.is_match(sql),
        subqueries: p.subquery.is_match(sql),
        group_by: p.group_by.is_match(sql),
        having: p.having.is_match(sql),
        order_by: p.order_by.is_match(sql),
        distinct: p.distinct.is_match(sql),
        table_count: tables.len(),
    }
}

fn complexity_score(features: &QueryFeatures) -> u32 {
    let mut score = 0;
    if features.joins || features.implicit_join {
        score += 2;
    }
    if features.window_functions {
        score += 2;
    }
    if features.ctes {
        score += 2;
    }
    if features.recursive_ctes {
        score += 3;
    }
    if features.subqueries {
        score += 1;
    }
    if features.set_ops {
        score += 1;
    }
    score
}

fn bucket(score: u32) -> Complexity {
    match score {
        0 => Complexity::Low,
        1..=2 => Complexity::Medium,
        _ => Complexity::High,
    }
}

/// Decide which analytical engine should run `sql`.
pub fn route(sql: &str, request: &RoutingRequest, catalog: &EngineCatalog) -> Result<RoutingDecision> {
    if !catalog.lite_available && !catalog.clickhouse_available {
        return Err(Error::new(Reason::NoEngineAvailable));
    }

    let features = detect_features(sql);
    let score = complexity_score(&features);
    let needs_full = features.joins
        || features.implicit_join
        || features.window_functions
        || features.ctes
        || features.set_ops
        || score >= 3
        || request.estimated_rows.is_some_and(|rows| rows > LARGE_RESULT_ROWS);

    let mut warnings = Vec::new();

    let (mut engine, reason) = if let Some(explicit) = request.explicit_engine {
        if explicit == Engine::Lite && needs_full {
            warnings.push(format!(
                "query uses {} beyond the lite engine",
                features.beyond_lite().join(", ")
            ));
        }
        (explicit, "explicitly requested".to_string())
    } else if let Some(preferred) = request.preferred_engine.filter(|p| catalog.available(*p)) {
        (preferred, "preferred engine is available".to_string())
    } else if needs_full {
        (
            Engine::ClickHouse,
            "query features require the full engine".to_string(),
        )
    } else {
        (Engine::Lite, "simple query".to_string())
    };

    let mut fallback = false;
    if !catalog.available(engine) {
        let other = engine.other();
        warnings.push(format!("{engine} is unavailable, falling back to {other}"));
        engine = other;
        fallback = true;
    }

    let mut may_fail = false;
    if engine == Engine::Lite {
        let missing = features.beyond_lite();
        if !missing.is_empty() {
            may_fail = true;
            for feature in missing {
                warnings.push(format!("{feature} may fail on {engine}"));
            }
        }
    }

    let decision = RoutingDecision {
        engine,
        reason,
        features,
        fallback,
        may_fail,
        warnings,
        complexity: bucket(score),
        estimated_rows: request.estimated_rows,
        decided_at: Utc::now(),
        version: ROUTER_VERSION.to_string(),
    };
    log::debug!(
        "routing to {} ({}); complexity {:?}",
        decision.engine,
        decision.reason,
        decision.complexity
    );
    Ok(decision)
}

/// Check that `engine` can run the detected features, for callers that
/// force an engine and want the mismatch as an error instead of a
/// warning.
pub fn require_features(engine: Engine, sql: &str) -> Result<()> {
    if engine == Engine::ClickHouse {
        return Ok(());
    }
    let features = detect_features(sql);
    match features.beyond_lite().first() {
        None => Ok(()),
        Some(feature) => Err(Error::new(Reason::FeatureUnavailable {
            feature: (*feature).to_string(),
            engine: engine.to_string(),
        })),
    }
}
