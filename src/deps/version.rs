//! Dotted-numeric version comparison
//!
//! Mod and game versions are plain dot-separated integers ("1.2.19").
//! Missing segments compare as zero, so "1.2" == "1.2.0".

use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version segment '{segment}' in '{version}'")]
    InvalidSegment { version: String, segment: String },
}

/// Compare two dotted-numeric version strings.
///
/// Total order for well-formed input. A non-numeric segment is an error,
/// never a silent "equal" - callers decide how to degrade.
pub fn compare(a: &str, b: &str) -> Result<Ordering, VersionError> {
    let left = parse_segments(a)?;
    let right = parse_segments(b)?;

    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }

    Ok(Ordering::Equal)
}

/// True if `candidate` is strictly newer than `current`.
///
/// Malformed input means "cannot determine", which is treated as not newer.
pub fn is_newer(candidate: &str, current: &str) -> bool {
    matches!(compare(candidate, current), Ok(Ordering::Greater))
}

fn parse_segments(version: &str) -> Result<Vec<u64>, VersionError> {
    version
        .trim()
        .split('.')
        .map(|segment| {
            segment
                .trim()
                .parse::<u64>()
                .map_err(|_| VersionError::InvalidSegment {
                    version: version.to_string(),
                    segment: segment.to_string(),
                })
        })
        .collect()
}
