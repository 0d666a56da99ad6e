//! In-memory re-sort of result documents.
//!
//! The SQL ORDER BY ranks whatever text sits in the envelope, which is
//! wrong once a sort key held a function marker. The pipeline's last
//! `$sort` is applied again here over resolved values: stable, missing
//! keys treated as null, nulls last ascending and first descending.

use std::cmp::Ordering;

use bson::{Bson, Document};

use super::get_path;
use crate::sql::sort_direction;
use crate::{Error, Reason, Result};

pub(crate) fn sort_documents(docs: &mut [Document], spec: &Document) -> Result<()> {
    let keys = spec
        .iter()
        .map(|(key, direction)| match sort_direction(direction) {
            Some(1) => Ok((key.clone(), true)),
            Some(-1) => Ok((key.clone(), false)),
            _ => Err(Error::new(Reason::MalformedStage {
                stage: "$sort".to_string(),
                details: format!("direction for `{key}` must be 1 or -1"),
            })),
        })
        .collect::<Result<Vec<_>>>()?;

    docs.sort_by(|a, b| {
        for (key, ascending) in &keys {
            let ord = compare_key(get_path(a, key), get_path(b, key), *ascending);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn compare_key(a: Option<&Bson>, b: Option<&Bson>, ascending: bool) -> Ordering {
    let a_null = matches!(a, None | Some(Bson::Null));
    let b_null = matches!(b, None | Some(Bson::Null));
    match (a_null, b_null) {
        (true, true) => Ordering::Equal,
        // Nulls sink to the end ascending and surface first descending.
        (true, false) => {
            if ascending {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, true) => {
            if ascending {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, false) => {
            let ord = compare_values(a.expect("checked non-null"), b.expect("checked non-null"));
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        }
    }
}

fn compare_values(a: &Bson, b: &Bson) -> Ordering {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.total_cmp(&y);
    }

    match (a, b) {
        (Bson::String(x), Bson::String(y)) => x.cmp(y),
        (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
        (Bson::DateTime(x), Bson::DateTime(y)) => x.cmp(y),
        (Bson::ObjectId(x), Bson::ObjectId(y)) => x.bytes().cmp(&y.bytes()),
        (Bson::Array(x), Bson::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = compare_values(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Bson::Document(x), Bson::Document(y)) => {
            for ((kx, vx), (ky, vy)) in x.iter().zip(y.iter()) {
                let ord = kx.cmp(ky).then_with(|| compare_values(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

/// Cross-type ordering, loosely following the conventional BSON ranking.
fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 1,
        Bson::String(_) => 2,
        Bson::Document(_) => 3,
        Bson::Array(_) => 4,
        Bson::Binary(_) => 5,
        Bson::ObjectId(_) => 6,
        Bson::Boolean(_) => 7,
        Bson::DateTime(_) => 8,
        Bson::Timestamp(_) => 9,
        Bson::RegularExpression(_) => 10,
        _ => 11,
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    fn values(docs: &[Document], key: &str) -> Vec<Option<Bson>> {
        docs.iter().map(|d| d.get(key).cloned()).collect()
    }

    #[test]
    fn sorts_ascending_with_nulls_last() {
        let mut docs = vec![
            doc! { "s": 4 },
            doc! { "s": null },
            doc! { "s": 1 },
            doc! { "other": true },
        ];
        sort_documents(&mut docs, &doc! { "s": 1 }).unwrap();
        assert_eq!(
            values(&docs, "s"),
            vec![
                Some(Bson::Int32(1)),
                Some(Bson::Int32(4)),
                Some(Bson::Null),
                None
            ]
        );
    }

    #[test]
    fn sorts_descending_with_nulls_first() {
        let mut docs = vec![doc! { "s": 4 }, doc! { "s": null }, doc! { "s": 1 }];
        sort_documents(&mut docs, &doc! { "s": -1 }).unwrap();
        assert_eq!(
            values(&docs, "s"),
            vec![Some(Bson::Null), Some(Bson::Int32(4)), Some(Bson::Int32(1))]
        );
    }

    #[test]
    fn secondary_keys_break_ties_stably() {
        let mut docs = vec![
            doc! { "g": "b", "n": 1 },
            doc! { "g": "a", "n": 2 },
            doc! { "g": "a", "n": 1 },
        ];
        sort_documents(&mut docs, &doc! { "g": 1, "n": -1 }).unwrap();
        assert_eq!(
            docs,
            vec![
                doc! { "g": "a", "n": 2 },
                doc! { "g": "a", "n": 1 },
                doc! { "g": "b", "n": 1 },
            ]
        );
    }

    #[test]
    fn mixed_numeric_widths_compare_by_value() {
        let mut docs = vec![
            doc! { "s": 2.5 },
            doc! { "s": 10i64 },
            doc! { "s": 3 },
        ];
        sort_documents(&mut docs, &doc! { "s": 1 }).unwrap();
        assert_eq!(
            values(&docs, "s"),
            vec![
                Some(Bson::Double(2.5)),
                Some(Bson::Int32(3)),
                Some(Bson::Int64(10))
            ]
        );
    }

    #[test]
    fn invalid_direction_is_rejected() {
        let mut docs = vec![doc! { "s": 1 }];
        let err = sort_documents(&mut docs, &doc! { "s": 2 }).unwrap_err();
        assert!(matches!(err.reason, Reason::MalformedStage { .. }));
    }
}
