//! Deterministic idempotency keys for registration writes.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Derive the idempotency key for one logical registration.
///
/// The key is a SHA-256 over (user, site, action, submission time at
/// second precision), so an explicit retry of the same logical request
/// resends the same key and the server can suppress the duplicate. The
/// caller derives the key once per attempt and carries it through any
/// retry; a fresh session derives a fresh key. `action` is the record
/// kind, or `"auto"` when the server decides.
pub fn derive_key(
    user_id: &str,
    site_id: &str,
    action: &str,
    submitted_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update(b"|");
    hasher.update(site_id.as_bytes());
    hasher.update(b"|");
    hasher.update(action.as_bytes());
    hasher.update(b"|");
    hasher.update(
        submitted_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
            .as_bytes(),
    );
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
