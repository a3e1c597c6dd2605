//! Registration of tracked repositories.
//!
//! Rows are created here with no observed release; from then on only the
//! state store's conditional commit touches them.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{self, Pool};
use crate::store::StoreError;

static REPOSITORY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.-]+\.[A-Za-z]{2,}(/[A-Za-z0-9._-]+){2,}$").expect("valid regex")
});

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid repository id {0:?}: expected host/owner/name")]
    InvalidId(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Canonical repository id: scheme, trailing slashes and a `.git` suffix are
/// dropped, e.g. `https://github.com/acme/widget.git` → `github.com/acme/widget`.
pub fn normalize(raw: &str) -> Result<String, RegistryError> {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let without_slash = without_scheme.trim_end_matches('/');
    let id = without_slash.strip_suffix(".git").unwrap_or(without_slash);

    if REPOSITORY_ID.is_match(id) {
        Ok(id.to_string())
    } else {
        Err(RegistryError::InvalidId(raw.to_string()))
    }
}

/// Register `raw` if it is not tracked yet. Returns the canonical id and
/// whether a new row was created.
pub async fn register(pool: &Pool, raw: &str) -> Result<(String, bool), RegistryError> {
    let id = normalize(raw)?;
    let created = db::register_repository(pool, &id)
        .await
        .map_err(StoreError::from)?;
    if created {
        info!(%id, "repository registered");
    }
    Ok((id, created))
}

/// Outcome of registering a batch of ids.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registration {
    pub created: usize,
    /// Raw ids that are not valid repository ids, in input order.
    pub invalid: Vec<String>,
}

/// Register every id in `raws`. Invalid ids are logged and skipped so the
/// rest of the batch is still registered; a store failure stops the batch.
pub async fn register_all<'a, I>(pool: &Pool, raws: I) -> Result<Registration, RegistryError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut registration = Registration::default();
    for raw in raws {
        match register(pool, raw).await {
            Ok((_, true)) => registration.created += 1,
            Ok((_, false)) => {}
            Err(RegistryError::InvalidId(raw)) => {
                warn!(repository = %raw, "skipping invalid repository id");
                registration.invalid.push(raw);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(registration)
}
