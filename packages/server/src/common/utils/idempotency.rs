use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derive an idempotency key for a job submission.
///
/// SHA256 over the job type and the canonical JSON of the payload.
/// `serde_json::Value` keeps object keys sorted, so two payloads that differ
/// only in key order hash the same.
pub fn derive_idempotency_key(job_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash a key into the 64-bit space used by Postgres advisory locks.
pub fn advisory_lock_id(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
