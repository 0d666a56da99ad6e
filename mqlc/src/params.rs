//! Bound SQL parameters.
//!
//! User-supplied values never appear in SQL text; they are appended to a
//! [ParamBuf] and stand in the SQL as `?` placeholders. The buffer's order
//! is a contract: values appear in it exactly in the order their
//! placeholders appear in the emitted SQL.

use bson::Bson;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{Error, Reason, Result, WithErrorInfo};

/// A value bound at a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Date(DateTime<Utc>),
}

impl ParamValue {
    /// Convert a document value into a bindable parameter.
    ///
    /// Object ids bind as their hex form, composite values as their JSON
    /// text (which is what the JSON extraction functions yield for them on
    /// the other side of the comparison).
    pub fn from_bson(value: &Bson) -> Result<ParamValue> {
        Ok(match value {
            Bson::Null => ParamValue::Null,
            Bson::Boolean(b) => ParamValue::Bool(*b),
            Bson::Int32(n) => ParamValue::Int(i64::from(*n)),
            Bson::Int64(n) => ParamValue::Int(*n),
            Bson::Double(f) => ParamValue::Double(*f),
            Bson::String(s) => ParamValue::String(s.clone()),
            Bson::ObjectId(oid) => ParamValue::String(oid.to_hex()),
            Bson::DateTime(dt) => ParamValue::Date(dt.to_chrono()),
            Bson::Binary(bin) => ParamValue::Binary(bin.bytes.clone()),
            Bson::Decimal128(d) => ParamValue::String(d.to_string()),
            Bson::Document(_) | Bson::Array(_) => {
                let json = value.clone().into_relaxed_extjson();
                ParamValue::String(serde_json::to_string(&json).map_err(|e| {
                    Error::new(Reason::Execution {
                        message: e.to_string(),
                    })
                })?)
            }
            other => {
                return Err(Error::new(Reason::UnsupportedExpression {
                    found: format!("{:?} is not bindable as a parameter", other.element_type()),
                }))
            }
        })
    }
}

/// The ordered parameter vector threaded through translation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamBuf {
    values: Vec<ParamValue>,
}

impl ParamBuf {
    pub fn new() -> Self {
        ParamBuf::default()
    }

    /// Bind a value, returning the placeholder to splice into the SQL.
    pub fn push(&mut self, value: ParamValue) -> &'static str {
        self.values.push(value);
        "?"
    }

    /// Failures name the parameter position, never its value.
    pub fn push_bson(&mut self, value: &Bson) -> Result<&'static str> {
        let value = ParamValue::from_bson(value)
            .push_hint(format!("at parameter {}", self.values.len()))?;
        Ok(self.push(value))
    }

    /// Append another buffer, preserving its internal order.
    pub fn append(&mut self, other: ParamBuf) {
        self.values.extend(other.values);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[ParamValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<ParamValue> {
        self.values
    }
}
