//! Capability map for SQL dialects.
//!
//! Every backend-specific SQL spelling lives behind [DialectHandler];
//! stage and expression translation never branch on the dialect
//! themselves. Adding a backend means implementing this trait, not
//! touching the translators.

use core::fmt::Debug;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ident::FieldPath;
use crate::{Error, Reason, Result};

/// SQL dialect.
///
/// `Sqlite` targets documents stored as JSON text in the `data` column of
/// an ordinary table. `ClickHouse` targets the same envelope on a
/// column-oriented cluster.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Serialize,
    Default,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::VariantNames,
)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    ClickHouse,
}

impl Dialect {
    pub(crate) fn handler(&self) -> Box<dyn DialectHandler> {
        match self {
            Dialect::Sqlite => Box::new(SqliteDialect),
            Dialect::ClickHouse => Box::new(ClickHouseDialect),
        }
    }
}

#[derive(Debug)]
pub struct SqliteDialect;
#[derive(Debug)]
pub struct ClickHouseDialect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CastKind {
    Int,
    Double,
    Text,
    Date,
    Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accumulator {
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
    Push,
    AddToSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatePart {
    Year,
    Month,
    DayOfMonth,
    Hour,
    Minute,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryMath {
    Abs,
    Ceil,
    Floor,
}

pub(crate) trait DialectHandler: Debug {
    /// Extract the value at `path` from the JSON document in `column`.
    fn json_extract(&self, column: &str, path: &FieldPath) -> String;

    /// The storage type of the value at `path`, or SQL NULL if absent.
    fn json_type(&self, column: &str, path: &FieldPath) -> String;

    /// Boolean test for the presence of `path`.
    fn path_exists(&self, column: &str, path: &FieldPath, exists: bool) -> String;

    fn json_array_length(&self, column: &str, path: &FieldPath) -> String;

    /// Values `json_type` yields for a MongoDB type alias, or None when
    /// the alias is unknown.
    fn type_names(&self, alias: &str) -> Option<Vec<&'static str>>;

    fn cast(&self, expr: &str, kind: CastKind) -> String;

    fn aggregate(&self, acc: Accumulator, expr: &str) -> String;

    fn count_all(&self) -> String;

    fn concat(&self, parts: &[String]) -> String;

    fn lower(&self, expr: &str) -> String;

    fn upper(&self, expr: &str) -> String;

    /// One-based substring.
    fn substring(&self, expr: &str, start: &str, len: &str) -> String;

    fn str_length(&self, expr: &str) -> String;

    /// One-based position of `needle` in `haystack`, 0 when absent.
    fn str_position(&self, haystack: &str, needle: &str) -> String;

    fn str_replace(&self, expr: &str, from: &str, to: &str) -> String;

    fn trim(&self, expr: &str) -> String {
        format!("TRIM({expr})")
    }

    fn coalesce(&self, args: &[String]) -> String {
        format!("COALESCE({})", args.iter().join(", "))
    }

    fn unary_math(&self, op: UnaryMath, expr: &str) -> String {
        match op {
            UnaryMath::Abs => format!("ABS({expr})"),
            UnaryMath::Ceil => format!("CEIL({expr})"),
            UnaryMath::Floor => format!("FLOOR({expr})"),
        }
    }

    fn scalar_min(&self, args: &[String]) -> String;

    fn scalar_max(&self, args: &[String]) -> String;

    /// LIKE-style pattern match; `placeholder` stands for the bound pattern.
    fn like_match(&self, expr: &str, placeholder: &str, case_insensitive: bool) -> String;

    fn date_part(&self, part: DatePart, expr: &str) -> String;

    /// Build a document from (name, value-SQL) pairs.
    fn json_object(&self, pairs: &[(String, String)]) -> String;

    /// Set `path` within `base` to `value`, yielding the rewritten document.
    fn json_set(&self, base: String, path: &FieldPath, value: &str) -> String;

    /// Remove the listed paths from the document in `base`.
    fn json_remove(&self, base: &str, paths: &[FieldPath]) -> Result<String>;

    /// Expression yielding the array at `path`, suitable for the unwind
    /// join and for the array predicates below.
    fn array_expr(&self, column: &str, path: &FieldPath) -> String;

    /// Existence test over array elements; `predicate` refers to the
    /// element through [DialectHandler::element_ref].
    fn array_exists(&self, array_expr: &str, alias: &str, predicate: &str) -> String;

    /// The SQL naming an element inside `array_exists` / the unwind join.
    fn element_ref(&self, alias: &str) -> String;

    /// Extract a sub-field of an array element.
    fn element_extract(&self, alias: &str, path: &FieldPath) -> String;

    /// CTE body for an unwind over `path` of `source`.
    fn unwind_cte(
        &self,
        source: &str,
        path: &FieldPath,
        index: Option<&FieldPath>,
        preserve: bool,
    ) -> String;

    /// CTE body joining `from_coll` rows into `source` documents under
    /// `as_path`, matching `local` against `foreign`.
    fn lookup_cte(
        &self,
        source: &str,
        from_coll: &str,
        local: &FieldPath,
        foreign: &FieldPath,
        as_path: &FieldPath,
    ) -> String;

    /// CTE body merging the rows of a translated sub-pipeline into
    /// `source` documents under `as_path`.
    fn lookup_pipeline_cte(
        &self,
        source: &str,
        inner_sql: &str,
        as_path: &FieldPath,
    ) -> Result<String>;

    /// Trailing LIMIT/OFFSET clause.
    fn limit_offset(&self, limit: Option<i64>, offset: Option<i64>) -> String;

    fn supports_text_search(&self) -> bool {
        false
    }
}

/// `$.a.b` form, digit segments addressing array positions.
fn sqlite_json_path(path: &FieldPath) -> String {
    let mut out = String::from("$");
    for segment in path.segments() {
        if segment.bytes().all(|b| b.is_ascii_digit()) {
            out.push_str(&format!("[{segment}]"));
        } else {
            out.push('.');
            out.push_str(segment);
        }
    }
    out
}

/// `'a', 'b'` argument list; ClickHouse JSON indices are 1-based.
fn clickhouse_json_args(path: &FieldPath) -> String {
    path.segments()
        .iter()
        .map(|segment| {
            if segment.bytes().all(|b| b.is_ascii_digit()) {
                let index: usize = segment.parse().unwrap_or(0);
                (index + 1).to_string()
            } else {
                format!("'{segment}'")
            }
        })
        .join(", ")
}

impl DialectHandler for SqliteDialect {
    fn json_extract(&self, column: &str, path: &FieldPath) -> String {
        format!("json_extract({column}, '{}')", sqlite_json_path(path))
    }

    fn json_type(&self, column: &str, path: &FieldPath) -> String {
        format!("json_type({column}, '{}')", sqlite_json_path(path))
    }

    fn path_exists(&self, column: &str, path: &FieldPath, exists: bool) -> String {
        let test = if exists { "IS NOT NULL" } else { "IS NULL" };
        format!("{} {test}", self.json_type(column, path))
    }

    fn json_array_length(&self, column: &str, path: &FieldPath) -> String {
        format!("json_array_length({})", self.json_extract(column, path))
    }

    fn type_names(&self, alias: &str) -> Option<Vec<&'static str>> {
        Some(match alias {
            "string" | "regex" | "objectId" | "date" => vec!["text"],
            "double" => vec!["real"],
            "int" | "integer" | "long" => vec!["integer"],
            "number" => vec!["integer", "real"],
            "bool" | "boolean" => vec!["true", "false"],
            "object" => vec!["object"],
            "array" => vec!["array"],
            "null" => vec!["null"],
            _ => return None,
        })
    }

    fn cast(&self, expr: &str, kind: CastKind) -> String {
        match kind {
            CastKind::Int => format!("CAST({expr} AS INTEGER)"),
            CastKind::Double => format!("CAST({expr} AS REAL)"),
            CastKind::Text => format!("CAST({expr} AS TEXT)"),
            CastKind::Date => format!("datetime({expr})"),
            CastKind::Decimal => format!("CAST({expr} AS NUMERIC)"),
        }
    }

    fn aggregate(&self, acc: Accumulator, expr: &str) -> String {
        match acc {
            Accumulator::Sum => format!("SUM({expr})"),
            Accumulator::Avg => format!("AVG({expr})"),
            Accumulator::Min => format!("MIN({expr})"),
            Accumulator::Max => format!("MAX({expr})"),
            Accumulator::First => format!("json_extract(json_group_array({expr}), '$[0]')"),
            Accumulator::Last => format!("json_extract(json_group_array({expr}), '$[#-1]')"),
            Accumulator::Push => format!("json_group_array({expr})"),
            Accumulator::AddToSet => format!("json_group_array(DISTINCT {expr})"),
        }
    }

    fn count_all(&self) -> String {
        "COUNT(*)".to_string()
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("({})", parts.iter().join(" || "))
    }

    fn lower(&self, expr: &str) -> String {
        format!("LOWER({expr})")
    }

    fn upper(&self, expr: &str) -> String {
        format!("UPPER({expr})")
    }

    fn substring(&self, expr: &str, start: &str, len: &str) -> String {
        format!("SUBSTR({expr}, {start}, {len})")
    }

    fn str_length(&self, expr: &str) -> String {
        format!("LENGTH({expr})")
    }

    fn str_position(&self, haystack: &str, needle: &str) -> String {
        format!("INSTR({haystack}, {needle})")
    }

    fn str_replace(&self, expr: &str, from: &str, to: &str) -> String {
        format!("REPLACE({expr}, {from}, {to})")
    }

    fn scalar_min(&self, args: &[String]) -> String {
        format!("MIN({})", args.iter().join(", "))
    }

    fn scalar_max(&self, args: &[String]) -> String {
        format!("MAX({})", args.iter().join(", "))
    }

    fn like_match(&self, expr: &str, placeholder: &str, case_insensitive: bool) -> String {
        if case_insensitive {
            format!("LOWER({expr}) LIKE LOWER({placeholder})")
        } else {
            format!("{expr} LIKE {placeholder}")
        }
    }

    fn date_part(&self, part: DatePart, expr: &str) -> String {
        let fmt = match part {
            DatePart::Year => "%Y",
            DatePart::Month => "%m",
            DatePart::DayOfMonth => "%d",
            DatePart::Hour => "%H",
            DatePart::Minute => "%M",
            DatePart::Second => "%S",
        };
        format!("CAST(strftime('{fmt}', {expr}) AS INTEGER)")
    }

    fn json_object(&self, pairs: &[(String, String)]) -> String {
        let args = pairs
            .iter()
            .map(|(name, value)| format!("'{name}', {value}"))
            .join(", ");
        format!("json_object({args})")
    }

    fn json_set(&self, base: String, path: &FieldPath, value: &str) -> String {
        format!("json_set({base}, '{}', {value})", sqlite_json_path(path))
    }

    fn json_remove(&self, base: &str, paths: &[FieldPath]) -> Result<String> {
        let args = paths
            .iter()
            .map(|path| format!("'{}'", sqlite_json_path(path)))
            .join(", ");
        Ok(format!("json_remove({base}, {args})"))
    }

    fn array_expr(&self, column: &str, path: &FieldPath) -> String {
        self.json_extract(column, path)
    }

    fn array_exists(&self, array_expr: &str, alias: &str, predicate: &str) -> String {
        format!("EXISTS (SELECT 1 FROM json_each({array_expr}) AS {alias} WHERE {predicate})")
    }

    fn element_ref(&self, alias: &str) -> String {
        format!("{alias}.value")
    }

    fn element_extract(&self, alias: &str, path: &FieldPath) -> String {
        format!(
            "json_extract({alias}.value, '{}')",
            sqlite_json_path(path)
        )
    }

    fn unwind_cte(
        &self,
        source: &str,
        path: &FieldPath,
        index: Option<&FieldPath>,
        preserve: bool,
    ) -> String {
        let array = self.array_expr("src.data", path);
        let join = if preserve { "LEFT JOIN" } else { "JOIN" };
        let mut doc = self.json_set("src.data".to_string(), path, "each.value");
        if let Some(index_path) = index {
            doc = self.json_set(doc, index_path, "each.key");
        }
        format!("SELECT {doc} AS data FROM {source} AS src {join} json_each({array}) AS each")
    }

    fn lookup_cte(
        &self,
        source: &str,
        from_coll: &str,
        local: &FieldPath,
        foreign: &FieldPath,
        as_path: &FieldPath,
    ) -> String {
        let foreign_key = self.json_extract("f.data", foreign);
        let local_key = self.json_extract("src.data", local);
        let matches = format!(
            "SELECT json_group_array(json(f.data)) FROM {from_coll} AS f WHERE {foreign_key} = {local_key}"
        );
        let merged = self.json_set(
            "src.data".to_string(),
            as_path,
            &format!("COALESCE(({matches}), json('[]'))"),
        );
        format!("SELECT {merged} AS data FROM {source} AS src")
    }

    fn lookup_pipeline_cte(
        &self,
        source: &str,
        inner_sql: &str,
        as_path: &FieldPath,
    ) -> Result<String> {
        let matches = format!("SELECT json_group_array(json(data)) FROM ({inner_sql})");
        let merged = self.json_set(
            "src.data".to_string(),
            as_path,
            &format!("COALESCE(({matches}), json('[]'))"),
        );
        Ok(format!("SELECT {merged} AS data FROM {source} AS src"))
    }

    fn limit_offset(&self, limit: Option<i64>, offset: Option<i64>) -> String {
        // SQLite will not take OFFSET without LIMIT.
        match (limit, offset) {
            (Some(limit), Some(offset)) => format!("LIMIT {limit} OFFSET {offset}"),
            (Some(limit), None) => format!("LIMIT {limit}"),
            (None, Some(offset)) => format!("LIMIT -1 OFFSET {offset}"),
            (None, None) => String::new(),
        }
    }

    fn supports_text_search(&self) -> bool {
        true
    }
}

impl DialectHandler for ClickHouseDialect {
    fn json_extract(&self, column: &str, path: &FieldPath) -> String {
        format!("JSONExtractRaw({column}, {})", clickhouse_json_args(path))
    }

    fn json_type(&self, column: &str, path: &FieldPath) -> String {
        format!("JSONType({column}, {})", clickhouse_json_args(path))
    }

    fn path_exists(&self, column: &str, path: &FieldPath, exists: bool) -> String {
        let test = format!("JSONHas({column}, {})", clickhouse_json_args(path));
        if exists {
            test
        } else {
            format!("NOT {test}")
        }
    }

    fn json_array_length(&self, column: &str, path: &FieldPath) -> String {
        format!("JSONLength({column}, {})", clickhouse_json_args(path))
    }

    fn type_names(&self, alias: &str) -> Option<Vec<&'static str>> {
        Some(match alias {
            "string" | "regex" | "objectId" | "date" => vec!["String"],
            "double" => vec!["Double"],
            "int" | "integer" | "long" => vec!["Int64"],
            "number" => vec!["Int64", "Double"],
            "bool" | "boolean" => vec!["Bool"],
            "object" => vec!["Object"],
            "array" => vec!["Array"],
            "null" => vec!["Null"],
            _ => return None,
        })
    }

    fn cast(&self, expr: &str, kind: CastKind) -> String {
        match kind {
            CastKind::Int => format!("toInt64({expr})"),
            CastKind::Double => format!("toFloat64({expr})"),
            CastKind::Text => format!("toString({expr})"),
            CastKind::Date => format!("toDateTime({expr})"),
            CastKind::Decimal => format!("toDecimal64({expr}, 4)"),
        }
    }

    fn aggregate(&self, acc: Accumulator, expr: &str) -> String {
        match acc {
            Accumulator::Sum => format!("sum({expr})"),
            Accumulator::Avg => format!("avg({expr})"),
            Accumulator::Min => format!("min({expr})"),
            Accumulator::Max => format!("max({expr})"),
            Accumulator::First => format!("any({expr})"),
            Accumulator::Last => format!("anyLast({expr})"),
            Accumulator::Push => format!("groupArray({expr})"),
            Accumulator::AddToSet => format!("groupUniqArray({expr})"),
        }
    }

    fn count_all(&self) -> String {
        "count()".to_string()
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("concat({})", parts.iter().join(", "))
    }

    fn lower(&self, expr: &str) -> String {
        format!("lower({expr})")
    }

    fn upper(&self, expr: &str) -> String {
        format!("upper({expr})")
    }

    fn substring(&self, expr: &str, start: &str, len: &str) -> String {
        format!("substring({expr}, {start}, {len})")
    }

    fn str_length(&self, expr: &str) -> String {
        format!("length({expr})")
    }

    fn str_position(&self, haystack: &str, needle: &str) -> String {
        format!("position({haystack}, {needle})")
    }

    fn str_replace(&self, expr: &str, from: &str, to: &str) -> String {
        format!("replaceAll({expr}, {from}, {to})")
    }

    fn scalar_min(&self, args: &[String]) -> String {
        format!("least({})", args.iter().join(", "))
    }

    fn scalar_max(&self, args: &[String]) -> String {
        format!("greatest({})", args.iter().join(", "))
    }

    fn like_match(&self, expr: &str, placeholder: &str, case_insensitive: bool) -> String {
        if case_insensitive {
            format!("{expr} ILIKE {placeholder}")
        } else {
            format!("{expr} LIKE {placeholder}")
        }
    }

    fn date_part(&self, part: DatePart, expr: &str) -> String {
        let func = match part {
            DatePart::Year => "toYear",
            DatePart::Month => "toMonth",
            DatePart::DayOfMonth => "toDayOfMonth",
            DatePart::Hour => "toHour",
            DatePart::Minute => "toMinute",
            DatePart::Second => "toSecond",
        };
        format!("{func}(parseDateTimeBestEffort({expr}))")
    }

    fn json_object(&self, pairs: &[(String, String)]) -> String {
        let args = pairs
            .iter()
            .map(|(name, value)| format!("'{name}', {value}"))
            .join(", ");
        format!("tuple({args})")
    }

    fn json_set(&self, base: String, path: &FieldPath, value: &str) -> String {
        format!("tupleConcat({base}, tuple('{}', {value}))", path.dotted())
    }

    fn json_remove(&self, _base: &str, _paths: &[FieldPath]) -> Result<String> {
        Err(Error::new(Reason::FeatureUnavailable {
            feature: "exclusion projection".to_string(),
            engine: Dialect::ClickHouse.to_string(),
        }))
    }

    fn array_expr(&self, column: &str, path: &FieldPath) -> String {
        format!(
            "JSONExtractArrayRaw({column}, {})",
            clickhouse_json_args(path)
        )
    }

    fn array_exists(&self, array_expr: &str, alias: &str, predicate: &str) -> String {
        format!("arrayExists({alias} -> {predicate}, {array_expr})")
    }

    fn element_ref(&self, alias: &str) -> String {
        alias.to_string()
    }

    fn element_extract(&self, alias: &str, path: &FieldPath) -> String {
        format!("JSONExtractRaw({alias}, {})", clickhouse_json_args(path))
    }

    fn unwind_cte(
        &self,
        source: &str,
        path: &FieldPath,
        index: Option<&FieldPath>,
        preserve: bool,
    ) -> String {
        let array = self.array_expr("src.data", path);
        let join = if preserve { "LEFT ARRAY JOIN" } else { "ARRAY JOIN" };
        match index {
            Some(index_path) => {
                let index_alias = index_path.dotted();
                format!(
                    "SELECT src.*, elem, {index_alias} FROM {source} AS src {join} {array} AS elem, arrayEnumerate({array}) AS {index_alias}"
                )
            }
            None => format!("SELECT src.*, elem FROM {source} AS src {join} {array} AS elem"),
        }
    }

    fn lookup_cte(
        &self,
        source: &str,
        from_coll: &str,
        local: &FieldPath,
        foreign: &FieldPath,
        as_path: &FieldPath,
    ) -> String {
        let foreign_key = self.json_extract("f.data", foreign);
        let local_key = self.json_extract("src.data", local);
        let merged = self.json_set(
            "src.data".to_string(),
            as_path,
            "groupArray(f.data)",
        );
        format!(
            "SELECT {merged} AS data FROM {source} AS src LEFT JOIN {from_coll} AS f ON {foreign_key} = {local_key} GROUP BY src.data"
        )
    }

    fn lookup_pipeline_cte(
        &self,
        _source: &str,
        _inner_sql: &str,
        _as_path: &FieldPath,
    ) -> Result<String> {
        Err(Error::new(Reason::FeatureUnavailable {
            feature: "correlated $lookup sub-pipelines".to_string(),
            engine: Dialect::ClickHouse.to_string(),
        }))
    }

    fn limit_offset(&self, limit: Option<i64>, offset: Option<i64>) -> String {
        let mut out = Vec::new();
        if let Some(limit) = limit {
            out.push(format!("LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            out.push(format!("OFFSET {offset}"));
        }
        out.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use insta::assert_snapshot;

    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::parse(p).unwrap()
    }

    #[test]
    fn dialect_from_str() {
        assert_eq!(Dialect::from_str("sqlite").unwrap(), Dialect::Sqlite);
        assert_eq!(
            Dialect::from_str("clickhouse").unwrap(),
            Dialect::ClickHouse
        );
        assert!(Dialect::from_str("postgres").is_err());
    }

    #[test]
    fn sqlite_extraction() {
        let d = SqliteDialect;
        assert_snapshot!(d.json_extract("data", &path("a.b")), @"json_extract(data, '$.a.b')");
        assert_snapshot!(d.json_extract("data", &path("items.0.sku")), @"json_extract(data, '$.items[0].sku')");
        assert_snapshot!(d.json_array_length("data", &path("tags")), @"json_array_length(json_extract(data, '$.tags'))");
    }

    #[test]
    fn clickhouse_extraction() {
        let d = ClickHouseDialect;
        assert_snapshot!(d.json_extract("data", &path("a.b")), @"JSONExtractRaw(data, 'a', 'b')");
        // JSON indices are 1-based on ClickHouse.
        assert_snapshot!(d.json_extract("data", &path("items.0")), @"JSONExtractRaw(data, 'items', 1)");
    }

    #[test]
    fn aggregates_differ_per_dialect() {
        let expr = "json_extract(data, '$.x')";
        assert_snapshot!(SqliteDialect.aggregate(Accumulator::AddToSet, expr), @"json_group_array(DISTINCT json_extract(data, '$.x'))");
        assert_snapshot!(ClickHouseDialect.aggregate(Accumulator::Last, expr), @"anyLast(json_extract(data, '$.x'))");
    }

    #[test]
    fn sqlite_pairs_offset_with_limit() {
        assert_eq!(SqliteDialect.limit_offset(None, Some(10)), "LIMIT -1 OFFSET 10");
        assert_eq!(ClickHouseDialect.limit_offset(None, Some(10)), "OFFSET 10");
    }

    #[test]
    fn clickhouse_has_no_exclusion_projection() {
        let err = ClickHouseDialect
            .json_remove("data", &[path("a")])
            .unwrap_err();
        assert!(matches!(
            err.reason,
            crate::Reason::FeatureUnavailable { .. }
        ));
    }
}
