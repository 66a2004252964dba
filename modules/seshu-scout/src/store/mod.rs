//! Draft sessions and scheduled jobs.
//!
//! Each store is a trait with a Postgres implementation and an in-memory one
//! for tests and local runs. Writes are last-writer-wins.

pub mod jobs;
pub mod sessions;

use std::sync::LazyLock;

use regex::Regex;
use seshu_common::SeshuError;

pub use jobs::{InMemoryJobStore, JobStore, PgJobStore};
pub use sessions::{InMemorySessionStore, PgSessionStore, SessionStore};

static RE_TABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap());

/// Table names are spliced into SQL, so only plain identifiers are accepted.
pub(crate) fn validate_table_name(kind: &str, name: &str) -> Result<(), SeshuError> {
    if name.is_empty() {
        return Err(SeshuError::Config(format!("{kind} table name is empty")));
    }
    if !RE_TABLE_NAME.is_match(name) {
        return Err(SeshuError::Config(format!(
            "{kind} table name {name:?} is not a plain identifier"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_must_be_plain_identifiers() {
        assert!(validate_table_name("sessions", "seshu_sessions").is_ok());
        assert!(matches!(
            validate_table_name("sessions", ""),
            Err(SeshuError::Config(_))
        ));
        assert!(validate_table_name("jobs", "jobs; DROP TABLE x").is_err());
        assert!(validate_table_name("jobs", "1jobs").is_err());
    }
}
