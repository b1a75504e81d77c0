//! Backup code batches.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::BackupCode;
use crate::crypto::{CredentialHasher, random};

/// Freshly generated batch: plaintext for the caller, hashed rows for the store
pub struct BackupCodeBatch {
    pub plaintext: Vec<String>,
    pub codes: Vec<BackupCode>,
}

/// Generate `count` distinct codes of `length` decimal digits
///
/// Codes tied to `pending_device` stay unusable until that device is verified.
pub fn generate(
    hasher: &CredentialHasher,
    tenant_id: Uuid,
    identity_id: Uuid,
    pending_device: Option<Uuid>,
    count: usize,
    length: usize,
    now: DateTime<Utc>,
) -> BackupCodeBatch {
    let mut plaintext: Vec<String> = Vec::with_capacity(count);
    while plaintext.len() < count {
        let code = random::numeric_code(length);
        if !plaintext.contains(&code) {
            plaintext.push(code);
        }
    }

    let codes = plaintext
        .iter()
        .map(|code| BackupCode {
            id: Uuid::new_v4(),
            identity_id,
            tenant_id,
            hashed_code: hasher.hash_backup_code(identity_id, code),
            pending_device_id: pending_device,
            used: false,
            used_at: None,
            created_at: now,
        })
        .collect();

    BackupCodeBatch { plaintext, codes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_is_hashed_and_distinct() {
        let hasher = CredentialHasher::new("pepper-pepper-pe", b"0123456789abcdef0123456789abcdef").unwrap();
        let identity = Uuid::new_v4();
        let batch = generate(&hasher, Uuid::new_v4(), identity, None, 10, 8, Utc::now());

        assert_eq!(batch.plaintext.len(), 10);
        assert_eq!(batch.codes.len(), 10);
        for (plain, row) in batch.plaintext.iter().zip(&batch.codes) {
            assert_eq!(plain.len(), 8);
            assert!(plain.chars().all(|c| c.is_ascii_digit()));
            assert_ne!(&row.hashed_code, plain);
            assert_eq!(row.hashed_code, hasher.hash_backup_code(identity, plain));
            assert!(row.pending_device_id.is_none());
        }

        let mut unique = batch.plaintext.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 10);
    }
}
