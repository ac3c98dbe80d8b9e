//! Parameter preprocessing for the tool surface.
//!
//! Wire requests carry ids, enums and timestamps as strings; everything
//! here parses them into the typed forms the core consumes, turning
//! malformed input into `Validation` errors with the offending field
//! named.

use chrono::{DateTime, Utc};
use flow_core::error::{OrchestratorError, Result};
use uuid::Uuid;

/// Parse a uuid parameter.
pub fn parse_uuid_param(value: &str, field: &str) -> Result<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|_| {
        OrchestratorError::Validation(format!("field '{field}' is not a valid UUID: '{value}'"))
    })
}

/// Parse an optional uuid parameter.
pub fn parse_optional_uuid(value: &Option<String>, field: &str) -> Result<Option<Uuid>> {
    match value {
        Some(raw) => Ok(Some(parse_uuid_param(raw, field)?)),
        None => Ok(None),
    }
}

/// Parse a list of uuid parameters.
pub fn parse_uuid_list(values: &[String], field: &str) -> Result<Vec<Uuid>> {
    values
        .iter()
        .map(|raw| parse_uuid_param(raw, field))
        .collect()
}

/// Parse an enum-like token parameter (entity kinds, triggers, roles,
/// priorities, dependency types...).
pub fn parse_token_param<T>(value: &str, field: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .trim()
        .parse()
        .map_err(|e: String| OrchestratorError::Validation(format!("field '{field}': {e}")))
}

/// Parse an optional enum-like token parameter.
pub fn parse_optional_token<T>(value: &Option<String>, field: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    match value {
        Some(raw) => Ok(Some(parse_token_param(raw, field)?)),
        None => Ok(None),
    }
}

/// Parse an RFC 3339 timestamp parameter.
pub fn parse_datetime_param(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            OrchestratorError::Validation(format!(
                "field '{field}' is not a valid RFC 3339 timestamp: '{value}'"
            ))
        })
}

/// Parse an optional RFC 3339 timestamp parameter.
pub fn parse_optional_datetime(value: &Option<String>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => Ok(Some(parse_datetime_param(raw, field)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_core::models::{EntityKind, Trigger};

    #[test]
    fn uuid_parsing() {
        let id = Uuid::new_v4();
        assert_eq!(parse_uuid_param(&id.to_string(), "id").unwrap(), id);

        let err = parse_uuid_param("nope", "parentId").unwrap_err();
        assert!(err.is_validation());
        assert!(format!("{err}").contains("parentId"));
    }

    #[test]
    fn token_parsing() {
        assert_eq!(
            parse_token_param::<EntityKind>("task", "kind").unwrap(),
            EntityKind::Task
        );
        assert_eq!(
            parse_token_param::<Trigger>("Complete", "trigger").unwrap(),
            Trigger::Complete
        );
        assert!(parse_token_param::<Trigger>("explode", "trigger").is_err());
    }

    #[test]
    fn datetime_parsing() {
        assert!(parse_datetime_param("2025-06-01T12:00:00Z", "from").is_ok());
        assert!(parse_datetime_param("yesterday", "from").is_err());
    }
}
