//! Storage Name Generation
//!
//! Names are derived from the cluster infrastructure name plus the product
//! name, optional extras and fresh randomness, so repeated creation attempts
//! never retry the same colliding candidate.

use crate::error::{Error, Result};
use uuid::Uuid;

/// Product segment embedded in every generated name
pub const PRODUCT_NAME: &str = "image-registry";

/// Maximum length of a generated bucket name
pub const MAX_BUCKET_NAME_LEN: usize = 62;

/// Maximum length of an Azure blob container name
pub const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Maximum length of an Azure storage account name
pub const MAX_ACCOUNT_NAME_LEN: usize = 24;

/// Hex characters of randomness closing every generated name
pub const RANDOM_SUFFIX_LEN: usize = 12;

/// Upper bound on create attempts with freshly generated names
pub const MAX_NAME_ATTEMPTS: usize = 5000;

/// Generate a backend legal storage name.
///
/// The result is `<infra>-image-registry[-<extra>]*-<random>`, lowercased,
/// with characters outside `[a-z0-9-]` replaced by `-` and repeated dashes
/// collapsed. Only the prefix is shortened to fit `max_len`; the random
/// suffix is always kept whole.
pub fn generate_storage_name(infra_name: &str, extras: &[&str], max_len: usize) -> Result<String> {
    if infra_name.trim().is_empty() {
        return Err(Error::Configuration(
            "cannot generate storage name: infrastructure name is empty".into(),
        ));
    }
    let budget = max_len
        .checked_sub(RANDOM_SUFFIX_LEN + 1)
        .filter(|b| *b > 0)
        .ok_or_else(|| {
            Error::Configuration(format!(
                "cannot generate storage name within {} characters",
                max_len
            ))
        })?;

    let mut parts = vec![infra_name, PRODUCT_NAME];
    parts.extend(extras.iter().copied().filter(|e| !e.is_empty()));
    let prefix = truncate(&sanitize(&parts.join("-")), budget);

    let random: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(RANDOM_SUFFIX_LEN)
        .collect();
    Ok(format!("{}-{}", prefix, random))
}

/// Generate an Azure storage account name: lowercase alphanumerics only,
/// at most 24 characters.
pub fn generate_account_name(infra_name: &str) -> Result<String> {
    let prefix: String = infra_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if prefix.is_empty() {
        return Err(Error::Configuration(format!(
            "cannot generate storage account name from infrastructure name {:?}",
            infra_name
        )));
    }

    let mut name: String = format!("{}registry", prefix).chars().take(16).collect();
    name.extend(Uuid::new_v4().simple().to_string().chars().take(8));
    name.truncate(MAX_ACCOUNT_NAME_LEN);
    Ok(name)
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars().map(|c| c.to_ascii_lowercase()) {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() {
            c
        } else {
            '-'
        };
        if c == '-' && (out.is_empty() || out.ends_with('-')) {
            continue;
        }
        out.push(c);
    }
    out
}

fn truncate(name: &str, max_len: usize) -> String {
    let mut out: String = name.chars().take(max_len).collect();
    while out.ends_with('-') {
        out.pop();
    }
    out
}
