use std::collections::BTreeMap;

use url::Url;

use crate::error::SeshuError;

/// A source URL split into the parts a session stores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    pub domain: String,
    pub path: String,
    pub query_params: BTreeMap<String, Vec<String>>,
}

pub fn decompose(raw: &str) -> Result<UrlParts, SeshuError> {
    let parsed =
        Url::parse(raw).map_err(|e| SeshuError::Validation(format!("invalid URL {raw}: {e}")))?;

    let mut query_params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in parsed.query_pairs() {
        query_params
            .entry(k.into_owned())
            .or_default()
            .push(v.into_owned());
    }

    Ok(UrlParts {
        domain: parsed.host_str().unwrap_or_default().to_string(),
        path: parsed.path().to_string(),
        query_params,
    })
}

/// Canonical job key: lowercase scheme and host, no default port, no fragment,
/// sorted query parameters, no trailing slash.
///
/// The key stays unescaped so it can be handed straight to the fetch service.
/// Only the characters that carry query syntax are escaped inside keys and
/// values, so an encoded `&` or `=` keeps its meaning and the key decomposes
/// back into the same parameters.
pub fn normalize_url_key(raw: &str) -> Result<String, SeshuError> {
    let mut parsed = Url::parse(raw.trim())
        .map_err(|e| SeshuError::Validation(format!("invalid URL {raw}: {e}")))?;

    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    parsed.set_query(None);

    let path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    let base = parsed.to_string();
    let base = urlencoding::decode(&base)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(base);
    if pairs.is_empty() {
        return Ok(base);
    }

    let query: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", escape_query_syntax(k), escape_query_syntax(v)))
        .collect();
    Ok(format!("{base}?{}", query.join("&")))
}

fn escape_query_syntax(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '+' => out.push_str("%2B"),
            '#' => out.push_str("%23"),
            _ => out.push(c),
        }
    }
    out
}
