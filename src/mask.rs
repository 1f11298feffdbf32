//! Secret masking for log output.
//!
//! Only ever used to render values into log fields. The masked string must
//! never flow back into an adapter call or a comparison.

use once_cell::sync::Lazy;
use regex::Regex;

/// Issuer prefixes worth keeping visible, e.g. GitLab's `glpat-`, `gldt-`, `glrt-`.
static ISSUER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^gl[a-z]{2,6}-").unwrap());

const ELLIPSIS: &str = "...";

/// Mask a secret down to its recognisable edges.
///
/// `glpat-12345678` becomes `glpat-1...8`, `12345678` becomes `1...8`.
pub fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }

    if let Some(prefix) = ISSUER_PREFIX.find(secret) {
        let rest = &secret[prefix.end()..];
        if let (Some(first), Some(last)) = (rest.chars().next(), rest.chars().last()) {
            return format!("{}{}{}{}", prefix.as_str(), first, ELLIPSIS, last);
        }
    }

    // non-empty, so both exist
    let first = secret.chars().next().unwrap_or_default();
    let last = secret.chars().last().unwrap_or_default();
    format!("{}{}{}", first, ELLIPSIS, last)
}
