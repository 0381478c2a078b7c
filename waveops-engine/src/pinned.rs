//! Pinned-JSON store
//!
//! Wave state is persisted inside the body of the coordination issue,
//! between two sentinel comment markers with a fenced JSON block in
//! between. Everything outside the block belongs to humans and is
//! preserved byte for byte. Replacement is textual; markdown is never
//! re-flowed.
//!
//! A body with a missing or duplicated sentinel is corrupt. The
//! coordinator surfaces that to the user and writes nothing; there is
//! no fallback location.

use crate::error::{WaveError, WaveResult};

/// Opening sentinel of the pinned block
pub const GUARD_START: &str = "<!-- wave-state:DO-NOT-EDIT -->";
/// Closing sentinel of the pinned block
pub const GUARD_END: &str = "<!-- /wave-state -->";

/// True iff exactly one of each sentinel is present
pub fn validate(body: &str) -> bool {
    body.matches(GUARD_START).count() == 1 && body.matches(GUARD_END).count() == 1
}

/// Extract the JSON payload between the sentinels, fence stripped
///
/// Returns `None` when either sentinel is missing.
pub fn extract(body: &str) -> Option<String> {
    let start = body.find(GUARD_START)?;
    let after = start + GUARD_START.len();
    let end = body[after..].find(GUARD_END)?;
    let interior = &body[after..after + end];
    Some(strip_fence(interior).to_string())
}

/// Splice `json` between the sentinels, preserving everything outside
///
/// Fails with guards-missing when a sentinel is absent, duplicated, or
/// out of order.
pub fn replace(body: &str, json: &str) -> WaveResult<String> {
    if !validate(body) {
        return Err(WaveError::GuardsMissing(describe_guards(body)));
    }
    let (start, end) = match (body.find(GUARD_START), body.find(GUARD_END)) {
        (Some(s), Some(e)) => (s, e),
        _ => return Err(WaveError::GuardsMissing(describe_guards(body))),
    };
    let after_start = start + GUARD_START.len();
    if end < after_start {
        return Err(WaveError::GuardsMissing(
            "end sentinel precedes start sentinel".to_string(),
        ));
    }

    let mut out = String::with_capacity(body.len() + json.len());
    out.push_str(&body[..after_start]);
    out.push_str("\n```json\n");
    out.push_str(json);
    out.push_str("\n```\n");
    out.push_str(&body[end..]);
    Ok(out)
}

/// Render a fresh body containing only the pinned block
///
/// Used when the coordination issue is created by the coordinator
/// itself rather than by a human.
pub fn render(json: &str) -> String {
    format!("{}\n```json\n{}\n```\n{}", GUARD_START, json, GUARD_END)
}

fn strip_fence(interior: &str) -> &str {
    let trimmed = interior.trim();
    let trimmed = trimmed.strip_prefix("```json").unwrap_or(trimmed);
    let trimmed = trimmed.strip_suffix("```").unwrap_or(trimmed);
    trimmed.trim()
}

fn describe_guards(body: &str) -> String {
    let starts = body.matches(GUARD_START).count();
    let ends = body.matches(GUARD_END).count();
    format!(
        "expected exactly one of each sentinel, found {} start and {} end",
        starts, ends
    )
}
