//! Deterministic pseudonymization transforms: per-patient date shifting
//! and UID hashing under a site-owned root. Both are pure functions of
//! their inputs so repeated runs (and runs after a restart) produce
//! identical output.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

/// Stable random day offset in `[min_days, max_days]`, seeded by the
/// input identifier.
pub fn stable_date_shift(input_id: &str, min_days: i64, max_days: i64) -> i64 {
    if min_days >= max_days {
        return min_days;
    }
    let mut hasher = Sha256::new();
    hasher.update(b"date-shift/");
    hasher.update(input_id.as_bytes());
    let digest = hasher.finalize();
    let seed = u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    let span = (max_days - min_days + 1) as u64;
    min_days + (seed % span) as i64
}

/// Apply a day offset to a DICOM DA value (`YYYYMMDD`). Values that do not
/// parse are returned unchanged.
pub fn shift_da_value(value: &str, offset_days: i64) -> String {
    let trimmed = value.trim();
    match NaiveDate::parse_from_str(trimmed, "%Y%m%d") {
        Ok(date) => (date + chrono::Duration::days(offset_days))
            .format("%Y%m%d")
            .to_string(),
        Err(_) => value.to_string(),
    }
}

/// Replace a UID with a deterministic hash-derived UID under `root`.
///
/// The digest is rendered as decimal components so the result is a valid
/// UID; total length is kept within the 64-character limit.
pub fn hash_uid(uid: &str, root: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"uid/");
    hasher.update(uid.as_bytes());
    let digest = hasher.finalize();

    let mut out = String::from(root.trim_end_matches('.'));
    for chunk in digest.chunks(4) {
        let v = u32::from_be_bytes(chunk.try_into().expect("4-byte chunk"));
        let next = format!(".{}", v);
        if out.len() + next.len() > 64 {
            break;
        }
        out.push_str(&next);
    }
    out
}
