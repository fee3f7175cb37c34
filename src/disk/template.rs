//! Placeholder rendering for boot-loader and fstab templates.
//!
//! Templates carry `__NAME__` sentinel tokens for identifiers that are
//! only known once the image's filesystems exist (partition UUIDs). A
//! render that leaves any sentinel unresolved fails the build instead of
//! producing a config that cannot boot.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

/// Substitute every `__NAME__` token with its value, then fail if any
/// sentinel remains.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String> {
    let mut out = template.to_string();
    for (name, value) in values {
        out = out.replace(&format!("__{name}__"), value);
    }

    let leftover = find_sentinels(&out);
    if !leftover.is_empty() {
        bail!("unresolved placeholders: {}", leftover.join(", "));
    }
    Ok(out)
}

/// Scan for `__NAME__` tokens. A token body is uppercase alphanumerics
/// and underscores, non-empty, and does not itself begin or end with an
/// underscore (so `__ROOT_UUID__` is one token, not two).
pub fn find_sentinels(text: &str) -> Vec<String> {
    let bytes = text.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i + 4 <= bytes.len() {
        if &bytes[i..i + 2] != b"__" {
            i += 1;
            continue;
        }
        let Some(rel) = text[i + 2..].find("__") else {
            break;
        };
        let body = &text[i + 2..i + 2 + rel];
        if is_token_body(body) {
            let token = format!("__{body}__");
            if !found.contains(&token) {
                found.push(token);
            }
            i += 2 + rel + 2;
        } else {
            i += 1;
        }
    }
    found
}

fn is_token_body(body: &str) -> bool {
    !body.is_empty()
        && !body.starts_with('_')
        && !body.ends_with('_')
        && body
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_tokens_with_underscores_in_the_name() {
        let out = render(
            "root=UUID=__ROOT_UUID__ rw\nefi=__EFI_UUID__",
            &values(&[("ROOT_UUID", "abcd-1234"), ("EFI_UUID", "EF00-0001")]),
        )
        .unwrap();
        assert_eq!(out, "root=UUID=abcd-1234 rw\nefi=EF00-0001");
    }

    #[test]
    fn unresolved_sentinel_fails_and_is_named() {
        let err = render("root=__ROOT_UUID__ swap=__SWAP_UUID__", &values(&[("ROOT_UUID", "x")]))
            .unwrap_err();
        assert!(err.to_string().contains("__SWAP_UUID__"));
        assert!(!err.to_string().contains("__ROOT_UUID__"));
    }

    #[test]
    fn plain_dunder_noise_is_not_a_sentinel() {
        assert!(find_sentinels("____ and __ and __lower__ and __X_").is_empty());
        assert_eq!(find_sentinels("a __B2__ c"), vec!["__B2__".to_string()]);
    }

    #[test]
    fn duplicate_sentinels_reported_once() {
        assert_eq!(
            find_sentinels("__A__ text __A__"),
            vec!["__A__".to_string()]
        );
    }
}
