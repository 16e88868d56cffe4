use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

pub(crate) fn stable_hex_id(namespace: &str, key: &str) -> String {
    let payload = [namespace.trim(), key.trim()].join("|");
    let digest = Sha256::digest(payload.as_bytes());
    let hex = format!("{digest:x}");
    hex.chars().take(24).collect()
}

/// Content-derived assessment identifier: identical (plot, policy, window)
/// inputs always mint the same id, which makes the assessment insert
/// naturally idempotent.
pub fn assessment_id(
    plot_id: &str,
    policy_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> String {
    let key = format!(
        "{plot_id}|{policy_id}|{}|{}",
        window_start.to_rfc3339_opts(SecondsFormat::Secs, true),
        window_end.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    stable_hex_id("assessment", &key)
}

pub fn dedup_key_hash(kind: &str, dedup_key: &str) -> String {
    let payload = [kind.trim(), dedup_key.trim()].join("|");
    let digest = Sha256::digest(payload.as_bytes());
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn assessment_id_is_deterministic() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let a = assessment_id("plot-7", "policy-9", start, end);
        let b = assessment_id("plot-7", "policy-9", start, end);
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
    }

    #[test]
    fn assessment_id_varies_with_window() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap();
        assert_ne!(
            assessment_id("plot-7", "policy-9", start, end),
            assessment_id("plot-7", "policy-9", start, later)
        );
    }

    #[test]
    fn dedup_hash_is_stable() {
        assert_eq!(
            dedup_key_hash("weather.sweep", "plot-1"),
            dedup_key_hash("weather.sweep", " plot-1 ")
        );
    }
}
