use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost_types::Timestamp;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::status::Status;

pub(crate) trait ToUsize {
    fn to_usize(&self) -> usize;
}

impl ToUsize for &str {
    fn to_usize(&self) -> usize {
        self.as_bytes().iter().map(|v| *v as usize).sum()
    }
}

/// Validates a short resource id (the part after the last `/`).
///
/// Ids must start with a letter, be 3 to 255 characters long, contain only
/// letters, numbers, dashes, underscores, periods, tildes, plus or percent
/// signs, and must not start with `goog`.
pub(crate) fn validate_resource_id(id: &str) -> Result<(), Status> {
    if id.len() < 3 || id.len() > 255 {
        return Err(Status::invalid_argument(format!(
            "resource id must be between 3 and 255 characters: {id}"
        )));
    }
    if !id.chars().next().unwrap().is_ascii_alphabetic() {
        return Err(Status::invalid_argument(format!(
            "resource id must start with a letter: {id}"
        )));
    }
    if id.starts_with("goog") {
        return Err(Status::invalid_argument(format!(
            "resource id must not start with 'goog': {id}"
        )));
    }
    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '+' | '%'));
    if !valid {
        return Err(Status::invalid_argument(format!("invalid character in resource id: {id}")));
    }
    Ok(())
}

/// Splits a fully qualified name of the form `projects/{p}/{collection}/{id}`
/// and returns `(project, id)`.
pub(crate) fn parse_resource_name<'a>(name: &'a str, collection: &str) -> Result<(&'a str, &'a str), Status> {
    let malformed = || Status::invalid_argument(format!("malformed resource name: {name}"));
    let rest = name.strip_prefix("projects/").ok_or_else(malformed)?;
    let (project, rest) = rest.split_once('/').ok_or_else(malformed)?;
    let (col, id) = rest.split_once('/').ok_or_else(malformed)?;
    if project.is_empty() || col != collection || id.is_empty() || id.contains('/') {
        return Err(malformed());
    }
    Ok((project, id))
}

pub(crate) fn resource_id(name: &str) -> &str {
    name.rfind('/').map_or(name, |i| &name[(i + 1)..])
}

pub(crate) fn to_timestamp(t: SystemTime) -> Timestamp {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    Timestamp {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

/// Runs `fut` under the caller's cancellation token and optional timeout.
///
/// Cancellation wins over an in-flight call with `Cancelled`; an expired
/// timeout surfaces `DeadlineExceeded`.
pub(crate) async fn run_call<T, F>(
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
    fut: F,
) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let deadline = async {
        match timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    select! {
        biased;
        v = fut => v,
        _ = cancelled => Err(Status::cancelled("cancelled")),
        _ = deadline => Err(Status::deadline_exceeded("call timeout expired")),
    }
}

pub(crate) fn check_cancelled(cancel: &Option<CancellationToken>) -> Result<(), Status> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(Status::cancelled("cancelled")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_resource_id() {
        assert!(validate_resource_id("abc").is_ok());
        assert!(validate_resource_id("test-topic_1.v2").is_ok());
        assert!(validate_resource_id("ab").is_err());
        assert!(validate_resource_id("1abc").is_err());
        assert!(validate_resource_id("google-topic").is_err());
        assert!(validate_resource_id("has space").is_err());
    }

    #[test]
    fn test_parse_resource_name() {
        let (project, id) = parse_resource_name("projects/p1/topics/t1", "topics").unwrap();
        assert_eq!(project, "p1");
        assert_eq!(id, "t1");
        assert!(parse_resource_name("projects/p1/topics/t1", "subscriptions").is_err());
        assert!(parse_resource_name("projects/p1/topics/", "topics").is_err());
        assert!(parse_resource_name("topics/t1", "topics").is_err());
        assert!(parse_resource_name("projects/p1/topics/t1/extra", "topics").is_err());
    }
}
