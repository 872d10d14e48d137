//! Per-tenant quota accounting.
//!
//! Counters live on the tenant record and change inside the same write
//! transaction as the object mutation they account for, so a committed
//! transaction always leaves `used_bytes` equal to the sum of live version
//! sizes. Reservation is predicate-and-update: the check and the increment
//! are one atomic step. `release` clamps at zero and never fails a request.

use uuid::Uuid;

use maxiofs_core::types::Tenant;
use maxiofs_core::{Error, Result, ids};
use maxiofs_meta::{MetaTxn, keys};

/// Signed deltas for one reservation or release.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaDelta {
    /// Bytes of object payload.
    pub bytes: i64,
    /// Bucket count.
    pub buckets: i64,
    /// Access-key count.
    pub keys: i64,
}

impl QuotaDelta {
    /// A pure byte delta.
    #[must_use]
    pub fn bytes(n: i64) -> Self {
        Self {
            bytes: n,
            ..Self::default()
        }
    }

    /// A pure bucket-count delta.
    #[must_use]
    pub fn buckets(n: i64) -> Self {
        Self {
            buckets: n,
            ..Self::default()
        }
    }

    /// A pure key-count delta.
    #[must_use]
    pub fn keys(n: i64) -> Self {
        Self {
            keys: n,
            ..Self::default()
        }
    }
}

/// Quota operations over tenant records. Stateless; all state is in the
/// MetaStore.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaTracker;

impl QuotaTracker {
    /// Atomically check the tenant's limits and apply `delta` inside `txn`.
    ///
    /// A limit of zero means unlimited. The boundary is inclusive: a write
    /// that lands exactly on the limit is admitted, one byte past is not.
    ///
    /// # Errors
    ///
    /// [`Error::QuotaExceeded`] without modifying the tenant.
    pub fn check_and_reserve(txn: &mut MetaTxn<'_>, tenant_id: Uuid, delta: QuotaDelta) -> Result<()> {
        let key = keys::tenant(tenant_id);
        let mut tenant: Tenant = txn
            .get(&key)?
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("unknown tenant {tenant_id}")))?;

        tenant.used_bytes = apply_checked(
            tenant.used_bytes,
            delta.bytes,
            tenant.max_bytes,
            "bytes",
        )?;
        tenant.used_buckets = apply_checked(
            tenant.used_buckets,
            delta.buckets,
            tenant.max_buckets,
            "buckets",
        )?;
        tenant.used_keys =
            apply_checked(tenant.used_keys, delta.keys, tenant.max_keys, "keys")?;

        tenant.updated_at = ids::now_secs();
        txn.put(&key, &tenant)
    }

    /// Unconditionally subtract `delta` inside `txn`, clamping at zero.
    pub fn release(txn: &mut MetaTxn<'_>, tenant_id: Uuid, delta: QuotaDelta) -> Result<()> {
        let key = keys::tenant(tenant_id);
        let Some(mut tenant) = txn.get::<Tenant>(&key)? else {
            // The tenant may already be gone during teardown; nothing to
            // release against.
            return Ok(());
        };

        tenant.used_bytes = subtract_clamped(tenant.used_bytes, delta.bytes);
        tenant.used_buckets = subtract_clamped(tenant.used_buckets, delta.buckets);
        tenant.used_keys = subtract_clamped(tenant.used_keys, delta.keys);
        tenant.updated_at = ids::now_secs();
        txn.put(&key, &tenant)
    }
}

/// Apply a signed delta against `(used, max)`; negative deltas clamp at 0,
/// positive deltas must not push past a non-zero `max`.
fn apply_checked(used: u64, delta: i64, max: u64, what: &str) -> Result<u64> {
    let next = if delta >= 0 {
        used.saturating_add(delta.unsigned_abs())
    } else {
        used.saturating_sub(delta.unsigned_abs())
    };
    if delta > 0 && max > 0 && next > max {
        return Err(Error::QuotaExceeded {
            what: what.to_owned(),
        });
    }
    Ok(next)
}

fn subtract_clamped(used: u64, delta: i64) -> u64 {
    if delta >= 0 {
        used.saturating_sub(delta.unsigned_abs())
    } else {
        used.saturating_add(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use maxiofs_meta::keys;

    fn used_bytes(env: &testutil::TestEnv) -> u64 {
        env.engine
            .meta()
            .get::<Tenant>(&keys::tenant(env.tenant_id))
            .unwrap()
            .unwrap()
            .used_bytes
    }

    #[test]
    fn test_should_admit_write_exactly_at_limit() {
        let env = testutil::env_with(1000, false);
        env.engine
            .meta()
            .update(|txn| {
                QuotaTracker::check_and_reserve(txn, env.tenant_id, QuotaDelta::bytes(1000))
            })
            .unwrap_or_else(|e| panic!("reserve failed: {e}"));
        assert_eq!(used_bytes(&env), 1000);
    }

    #[test]
    fn test_should_reject_one_byte_past_limit_without_increment() {
        let env = testutil::env_with(1000, false);
        let result = env.engine.meta().update(|txn| {
            QuotaTracker::check_and_reserve(txn, env.tenant_id, QuotaDelta::bytes(1001))
        });
        assert!(matches!(result, Err(Error::QuotaExceeded { .. })));
        assert_eq!(used_bytes(&env), 0, "failed reserve must not count");
    }

    #[test]
    fn test_should_treat_zero_limit_as_unlimited() {
        let env = testutil::env_with(0, false);
        env.engine
            .meta()
            .update(|txn| {
                QuotaTracker::check_and_reserve(
                    txn,
                    env.tenant_id,
                    QuotaDelta::bytes(10_000_000_000),
                )
            })
            .unwrap_or_else(|e| panic!("reserve failed: {e}"));
    }

    #[test]
    fn test_should_release_without_underflow() {
        let env = testutil::env_with(1000, false);
        env.engine
            .meta()
            .update(|txn| {
                QuotaTracker::check_and_reserve(txn, env.tenant_id, QuotaDelta::bytes(100))
            })
            .unwrap();

        env.engine
            .meta()
            .update(|txn| QuotaTracker::release(txn, env.tenant_id, QuotaDelta::bytes(500)))
            .unwrap_or_else(|e| panic!("release failed: {e}"));
        assert_eq!(used_bytes(&env), 0, "release clamps at zero");
    }

    #[test]
    fn test_should_account_buckets_and_keys_independently() {
        let env = testutil::env_with(0, false);
        env.engine
            .meta()
            .update(|txn| {
                QuotaTracker::check_and_reserve(txn, env.tenant_id, QuotaDelta::buckets(2))?;
                QuotaTracker::check_and_reserve(txn, env.tenant_id, QuotaDelta::keys(3))
            })
            .unwrap();

        let tenant = env
            .engine
            .meta()
            .get::<Tenant>(&keys::tenant(env.tenant_id))
            .unwrap()
            .unwrap();
        assert_eq!(tenant.used_buckets, 2);
        assert_eq!(tenant.used_keys, 3);
        assert_eq!(tenant.used_bytes, 0);
    }

    #[test]
    fn test_should_roll_back_reservation_on_transaction_abort() {
        let env = testutil::env_with(1000, false);
        let result = env.engine.meta().update(|txn| {
            QuotaTracker::check_and_reserve(txn, env.tenant_id, QuotaDelta::bytes(400))?;
            Err::<(), _>(Error::invalid_argument("simulated downstream failure"))
        });
        assert!(result.is_err());
        assert_eq!(used_bytes(&env), 0, "aborted txn must not leak quota");
    }
}
