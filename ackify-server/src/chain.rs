use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::signatures::Signature;
use crate::signing::rfc3339_nano;

/// Canonical record-hash of a ledger row: SHA-256 over the pipe-joined
/// fixed-order projection, base64-encoded. This is the value the *next*
/// row stores as `prev_hash`.
///
/// An absent user name renders as `<nil>`, an absent referer as the empty
/// string; both are part of the frozen projection.
pub fn record_hash(sig: &Signature) -> String {
    let projection = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        sig.id,
        sig.doc_id,
        sig.user_sub,
        sig.user_email,
        sig.user_name.as_deref().unwrap_or("<nil>"),
        rfc3339_nano(sig.signed_at),
        sig.payload_hash,
        sig.signature,
        sig.nonce,
        rfc3339_nano(sig.created_at),
        sig.referer.as_deref().unwrap_or(""),
    );
    BASE64_STANDARD.encode(Sha256::digest(projection.as_bytes()))
}

#[derive(Debug, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    pub checked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ChainReport {
    fn valid(checked: usize) -> Self {
        Self { valid: true, checked, broken_at: None, detail: None }
    }

    fn broken(checked: usize, id: i64, detail: String) -> Self {
        Self { valid: false, checked, broken_at: Some(id), detail: Some(detail) }
    }
}

/// Walk signatures in id order and verify every chain link. Reports the
/// first break only.
pub fn verify_chain(sigs: &[Signature]) -> ChainReport {
    let Some(first) = sigs.first() else {
        return ChainReport::valid(0);
    };
    if first.prev_hash.is_some() {
        return ChainReport::broken(
            sigs.len(),
            first.id,
            format!("genesis signature {} has a non-null prev_hash", first.id),
        );
    }
    for window in sigs.windows(2) {
        let (prev, current) = (&window[0], &window[1]);
        let expected = record_hash(prev);
        match current.prev_hash.as_deref() {
            Some(actual) if actual == expected => {}
            Some(_) => {
                return ChainReport::broken(
                    sigs.len(),
                    current.id,
                    format!(
                        "signature {} prev_hash does not match the record-hash of signature {}",
                        current.id, prev.id
                    ),
                );
            }
            None => {
                return ChainReport::broken(
                    sigs.len(),
                    current.id,
                    format!("signature {} is missing its prev_hash link", current.id),
                );
            }
        }
    }
    ChainReport::valid(sigs.len())
}

/// Compute the `(id, prev_hash)` updates that repair the chain: the genesis
/// row is nulled when it carries a link, and every later row is relinked when
/// its stored value is absent or mismatched. Running the plan twice yields an
/// empty second plan.
pub fn plan_rebuild(sigs: &[Signature]) -> Vec<(i64, Option<String>)> {
    let mut updates = Vec::new();
    let Some(first) = sigs.first() else {
        return updates;
    };
    if first.prev_hash.is_some() {
        updates.push((first.id, None));
    }
    for window in sigs.windows(2) {
        let (prev, current) = (&window[0], &window[1]);
        let expected = record_hash(prev);
        if current.prev_hash.as_deref() != Some(expected.as_str()) {
            updates.push((current.id, Some(expected)));
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn make_sig(id: i64, prev_hash: Option<String>) -> Signature {
        let ts = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap()
            + chrono::Duration::seconds(id);
        Signature {
            id,
            tenant_id: Uuid::nil(),
            doc_id: format!("doc-{id}"),
            user_sub: format!("user-{id}"),
            user_email: format!("user{id}@example.com"),
            user_name: if id % 2 == 0 { Some(format!("User {id}")) } else { None },
            signed_at: ts,
            payload_hash: format!("hash-{id}"),
            signature: format!("sig-{id}"),
            nonce: format!("nonce-{id}"),
            created_at: ts,
            referer: None,
            prev_hash,
        }
    }

    fn linked_chain(len: i64) -> Vec<Signature> {
        let mut sigs: Vec<Signature> = Vec::new();
        for id in 1..=len {
            let prev = sigs.last().map(record_hash);
            sigs.push(make_sig(id, prev));
        }
        sigs
    }

    #[test]
    fn empty_ledger_is_valid() {
        assert!(verify_chain(&[]).valid);
    }

    #[test]
    fn linked_chain_verifies() {
        let report = verify_chain(&linked_chain(5));
        assert!(report.valid);
        assert_eq!(report.checked, 5);
    }

    #[test]
    fn genesis_with_link_is_broken() {
        let mut sigs = linked_chain(3);
        sigs[0].prev_hash = Some("bogus".to_string());
        let report = verify_chain(&sigs);
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(1));
    }

    #[test]
    fn tampering_breaks_at_the_following_id() {
        let mut sigs = linked_chain(4);
        // Flip a chained field of record 2; record 3's stored link no longer
        // matches the recomputed record-hash.
        sigs[1].payload_hash.push('x');
        let report = verify_chain(&sigs);
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(3));
    }

    #[test]
    fn missing_link_is_reported() {
        let mut sigs = linked_chain(3);
        sigs[2].prev_hash = None;
        let report = verify_chain(&sigs);
        assert!(!report.valid);
        assert_eq!(report.broken_at, Some(3));
    }

    #[test]
    fn rebuild_plan_repairs_and_is_idempotent() {
        let mut sigs = linked_chain(4);
        sigs[0].prev_hash = Some("stray".to_string());
        sigs[2].prev_hash = None;
        let plan = plan_rebuild(&sigs);
        assert_eq!(plan.len(), 2);
        for (id, value) in plan {
            let sig = sigs.iter_mut().find(|s| s.id == id).unwrap();
            sig.prev_hash = value;
        }
        assert!(verify_chain(&sigs).valid);
        assert!(plan_rebuild(&sigs).is_empty());
    }

    #[test]
    fn record_hash_depends_on_every_chained_field() {
        let base = make_sig(1, None);
        let reference = record_hash(&base);
        let mut variant = base.clone();
        variant.user_name = Some("someone".to_string());
        assert_ne!(record_hash(&variant), reference);
        let mut variant = base.clone();
        variant.referer = Some("https://ref.example".to_string());
        assert_ne!(record_hash(&variant), reference);
        let mut variant = base;
        variant.nonce = "other".to_string();
        assert_ne!(record_hash(&variant), reference);
    }
}
