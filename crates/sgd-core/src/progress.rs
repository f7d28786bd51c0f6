//! Parse SteamCMD output lines into structured progress updates.
//!
//! `parse_line` is a pure function: one raw line in, a sparse update out.
//! Lines that match nothing produce the empty update; the parser never
//! fails and never logs. Percent monotonicity is the supervisor's job;
//! here a reported value is only clamped, not compared to history.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::job::FailureKind;

static PERCENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)progress:?\s*([0-9]+(?:\.[0-9]+)?)\s*(?:%|\()").unwrap());
static SPEED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+(?:\.[0-9]+)?)\s*([KMG]B)/s").unwrap());
static ETA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ETA:?\s*(\d+\w\s*\d+\w|\d+:\d+(?::\d+)?)").unwrap());

/// Error phrases SteamCMD emits for unrecoverable conditions. First match
/// wins; checked case-insensitively against the whole line.
const ERROR_MARKERS: &[(&str, FailureKind)] = &[
    ("invalid password", FailureKind::Auth),
    ("invalid login", FailureKind::Auth),
    ("two-factor code mismatch", FailureKind::SecondFactor),
    ("steam guard code required", FailureKind::SecondFactor),
    ("account logon denied", FailureKind::SecondFactor),
    ("no subscription", FailureKind::NotOwned),
    ("missing ownership", FailureKind::NotOwned),
    ("rate limit exceeded", FailureKind::RateLimited),
    ("too many login failures", FailureKind::RateLimited),
];

/// Sparse result of parsing one output line. Any subset of fields may be
/// present; multiple categories can match the same line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineUpdate {
    /// Percent complete, clamped to [0, 100].
    pub percent: Option<f32>,
    /// Rate as reported, normalized to "N.N UB/s".
    pub speed: Option<String>,
    /// ETA text as reported.
    pub eta: Option<String>,
    /// The tool entered its file-verification phase.
    pub validating: bool,
    /// Explicit success phrase for the finished app.
    pub success: bool,
    /// Explicit unrecoverable error phrase.
    pub error: Option<FailureKind>,
}

impl LineUpdate {
    pub fn is_empty(&self) -> bool {
        *self == LineUpdate::default()
    }
}

/// Parse one line of tool output. Unrecognized lines are not errors.
pub fn parse_line(line: &str) -> LineUpdate {
    let mut update = LineUpdate::default();
    let lower = line.to_ascii_lowercase();

    if let Some(caps) = PERCENT_RE.captures(line) {
        if let Ok(value) = caps[1].parse::<f32>() {
            update.percent = Some(value.clamp(0.0, 100.0));
        }
    }

    if let Some(caps) = SPEED_RE.captures(line) {
        update.speed = Some(format!("{} {}/s", &caps[1], &caps[2]));
    }

    if let Some(caps) = ETA_RE.captures(line) {
        update.eta = Some(caps[1].to_string());
    }

    // "Update state (0x81) verifying update, progress: 12.3 (...)"
    if lower.contains("verifying update") || lower.contains("verifying install") {
        update.validating = true;
    }

    // "Success! App '730' fully installed."
    if line.contains("Success!") && lower.contains("fully installed") {
        update.success = true;
    }

    for (marker, kind) in ERROR_MARKERS {
        if lower.contains(marker) {
            update.error = Some(*kind);
            break;
        }
    }

    update
}
