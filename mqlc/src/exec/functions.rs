//! Resolution of deferred `$function` sites in result documents.
//!
//! The translator leaves `__FUNCTION__<json>` markers where a function's
//! value belongs. After rows come back, every marker site is located,
//! argument values are gathered from the surrounding document, sites are
//! grouped by function body, and each group goes to the sandbox as one
//! batched call. Results map back to sites by position.

use bson::{Bson, Document};

use super::{get_path, set_path, SandboxLoader};
use crate::sql::{FunctionArg, FunctionPayload, FUNCTION_MARKER};
use crate::{Error, Reason, Result};

#[derive(Debug)]
struct Site {
    doc_index: usize,
    path: String,
    payload: FunctionPayload,
}

pub(crate) async fn resolve(
    docs: &mut [Document],
    sandbox: Option<&dyn SandboxLoader>,
    lenient: bool,
) -> Result<()> {
    let sites = collect_sites(docs)?;
    if sites.is_empty() {
        return Ok(());
    }
    let Some(sandbox) = sandbox else {
        return Err(Error::new(Reason::SandboxUnavailable));
    };

    // Group by function body, keeping first-seen order and site order
    // within each group.
    let mut groups: Vec<(String, Vec<Site>)> = Vec::new();
    for site in sites {
        match groups.iter_mut().find(|(body, _)| *body == site.payload.body) {
            Some((_, sites)) => sites.push(site),
            None => groups.push((site.payload.body.clone(), vec![site])),
        }
    }
    log::debug!("resolving {} function group(s)", groups.len());

    for (body, sites) in groups {
        let args = sites
            .iter()
            .map(|site| gather_args(&docs[site.doc_index], &site.payload, &site.path))
            .collect::<Result<Vec<_>>>()?;

        match sandbox.execute_batch(&body, args).await {
            Ok(results) => {
                if results.len() != sites.len() {
                    return Err(Error::new(Reason::Execution {
                        message: format!(
                            "sandbox returned {} results for {} sites",
                            results.len(),
                            sites.len()
                        ),
                    }));
                }
                for (site, result) in sites.iter().zip(results) {
                    set_path(&mut docs[site.doc_index], &site.path, result);
                }
            }
            Err(err) if lenient => {
                for site in &sites {
                    let doc = &mut docs[site.doc_index];
                    set_path(doc, &site.path, Bson::Null);
                    record_site_error(doc, &site.path, &err);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn record_site_error(doc: &mut Document, path: &str, err: &Error) {
    let entry = Bson::Document(bson::doc! {
        "path": path,
        "error": err.to_string(),
    });
    match doc.get_mut("_functionErrors") {
        Some(Bson::Array(errors)) => errors.push(entry),
        _ => {
            doc.insert("_functionErrors", Bson::Array(vec![entry]));
        }
    }
}

fn collect_sites(docs: &[Document]) -> Result<Vec<Site>> {
    let mut sites = Vec::new();
    for (doc_index, doc) in docs.iter().enumerate() {
        walk_document(doc, doc_index, &mut String::new(), &mut sites)?;
    }
    Ok(sites)
}

fn walk_document(
    doc: &Document,
    doc_index: usize,
    prefix: &mut String,
    sites: &mut Vec<Site>,
) -> Result<()> {
    for (key, value) in doc {
        let saved = prefix.len();
        if !prefix.is_empty() {
            prefix.push('.');
        }
        prefix.push_str(key);
        walk_value(value, doc_index, prefix, sites)?;
        prefix.truncate(saved);
    }
    Ok(())
}

fn walk_value(
    value: &Bson,
    doc_index: usize,
    prefix: &mut String,
    sites: &mut Vec<Site>,
) -> Result<()> {
    match value {
        Bson::String(s) => {
            if let Some(encoded) = s.strip_prefix(FUNCTION_MARKER) {
                let payload: FunctionPayload = serde_json::from_str(encoded).map_err(|e| {
                    Error::new(Reason::Execution {
                        message: format!("malformed function marker at `{prefix}`: {e}"),
                    })
                })?;
                sites.push(Site {
                    doc_index,
                    path: prefix.clone(),
                    payload,
                });
            }
        }
        Bson::Document(doc) => walk_document(doc, doc_index, prefix, sites)?,
        Bson::Array(array) => {
            for (index, element) in array.iter().enumerate() {
                let saved = prefix.len();
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(&index.to_string());
                walk_value(element, doc_index, prefix, sites)?;
                prefix.truncate(saved);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Argument values for one site: field references come from the document
/// (the projection carried them along), literals from the payload.
fn gather_args(doc: &Document, payload: &FunctionPayload, site: &str) -> Result<Vec<Bson>> {
    payload
        .args
        .iter()
        .map(|arg| match arg {
            FunctionArg::Field { path } => {
                Ok(get_path(doc, path).cloned().unwrap_or(Bson::Null))
            }
            FunctionArg::Literal { index } => {
                let value = payload.literals.get(index).ok_or_else(|| {
                    Error::new(Reason::Execution {
                        message: format!("function marker at `{site}` lacks literal {index}"),
                    })
                })?;
                bson::to_bson(value).map_err(|e| {
                    Error::new(Reason::Execution {
                        message: format!("function literal {index} at `{site}`: {e}"),
                    })
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn sites_are_found_depth_first() {
        let payload = serde_json::json!({ "body": "f", "args": [], "literals": {} });
        let marker = format!("{FUNCTION_MARKER}{payload}");
        let docs = vec![
            doc! { "a": { "b": marker.clone() }, "c": [marker.clone(), 1] },
            doc! { "plain": "text" },
        ];
        let sites = collect_sites(&docs).unwrap();
        let paths: Vec<&str> = sites.iter().map(|s| s.path.as_str()).collect();
        assert_eq!(paths, vec!["a.b", "c.0"]);
        assert!(sites.iter().all(|s| s.doc_index == 0));
    }

    #[test]
    fn malformed_marker_is_reported_with_its_path() {
        let docs = vec![doc! { "x": format!("{FUNCTION_MARKER}{{not json") }];
        let err = collect_sites(&docs).unwrap_err();
        assert!(matches!(err.reason, Reason::Execution { .. }));
        assert!(err.to_string().contains("`x`"));
    }

    #[test]
    fn missing_argument_fields_become_null() {
        let payload = FunctionPayload {
            body: "f".to_string(),
            args: vec![FunctionArg::Field {
                path: "absent".to_string(),
            }],
            literals: Default::default(),
        };
        let args = gather_args(&doc! { "other": 1 }, &payload, "s").unwrap();
        assert_eq!(args, vec![Bson::Null]);
    }
}
