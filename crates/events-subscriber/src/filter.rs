//! Event filter construction.
//!
//! Filters are only checked for well-formedness here; the validator owns
//! the matching semantics (including regex syntax).

use std::str::FromStr;

use events_proto::{EventFilter, MatchMode};

use crate::Error;

/// Address prefix of the application's state namespace
/// (first 6 hex chars of SHA-512("cookiejar")).
pub const DEFAULT_NAMESPACE_PREFIX: &str = "ce2292";

/// Attribute key carrying the state address in state-delta events.
pub const ADDRESS_KEY: &str = "address";

/// One `(key, pattern, mode)` filter request, e.g. from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSpec {
    pub key: String,
    pub pattern: String,
    pub mode: MatchMode,
}

impl FilterSpec {
    pub fn new(key: impl Into<String>, pattern: impl Into<String>, mode: MatchMode) -> Self {
        Self {
            key: key.into(),
            pattern: pattern.into(),
            mode,
        }
    }
}

/// Parses `KEY:MODE:PATTERN`. The pattern may itself contain `:`.
impl FromStr for FilterSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(key), Some(mode), Some(pattern)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected KEY:MODE:PATTERN, got {s:?}"));
        };
        Ok(Self::new(key, pattern, parse_mode(mode)?))
    }
}

fn parse_mode(mode: &str) -> Result<MatchMode, String> {
    match mode.to_ascii_lowercase().as_str() {
        "exact" | "simple-any" => Ok(MatchMode::SimpleAny),
        "simple-all" => Ok(MatchMode::SimpleAll),
        "regex-any" => Ok(MatchMode::RegexAny),
        "regex-all" => Ok(MatchMode::RegexAll),
        other => Err(format!(
            "unknown match mode {other:?} (expected exact, simple-any, simple-all, regex-any or regex-all)"
        )),
    }
}

/// Filter matching every address under `prefix`.
pub fn namespace_filter(prefix: &str) -> EventFilter {
    EventFilter {
        key: ADDRESS_KEY.to_string(),
        match_string: format!("{prefix}.*"),
        filter_type: MatchMode::RegexAny,
    }
}

/// Build the ordered filter list for a subscription.
///
/// An empty input yields an empty list, which subscribes to every event of
/// the target type.
pub fn build_filters<I>(specs: I) -> Result<Vec<EventFilter>, Error>
where
    I: IntoIterator<Item = FilterSpec>,
{
    specs
        .into_iter()
        .map(|spec| {
            check_field("key", &spec.key)?;
            check_pattern(&spec.pattern, spec.mode)?;
            Ok(EventFilter {
                key: spec.key,
                match_string: spec.pattern,
                filter_type: spec.mode,
            })
        })
        .collect()
}

/// Simple modes compare exact values, so an empty pattern is a valid value.
fn check_pattern(pattern: &str, mode: MatchMode) -> Result<(), Error> {
    match mode {
        MatchMode::RegexAny | MatchMode::RegexAll => check_field("pattern", pattern),
        MatchMode::SimpleAny | MatchMode::SimpleAll => check_control("pattern", pattern),
    }
}

fn check_field(name: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::InvalidFilter(format!("{name} must not be empty")));
    }
    check_control(name, value)
}

fn check_control(name: &str, value: &str) -> Result<(), Error> {
    if value.chars().any(char::is_control) {
        return Err(Error::InvalidFilter(format!(
            "{name} {value:?} contains control characters"
        )));
    }
    Ok(())
}
