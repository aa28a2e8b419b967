//! Tenant Session Binder.
//!
//! Every operation that touches tenant-scoped rows first opens a
//! transaction and, as its very first statement, sets
//! `app.current_tenant` for that transaction only. The row-level security
//! policies on `kv_buckets`, `kv_entries`, `obj_buckets` and `obj_metadata`
//! restrict visibility to rows `IS NOT DISTINCT FROM` that setting, and RLS
//! is FORCED so even the owning role can't bypass it by accident.
//!
//! The empty string is normalized to "absent" (global namespace) before it
//! ever reaches SQL, matching the data model's NULL-tenant uniqueness rule.

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::CResult;

/// Normalizes a caller-supplied tenant id: `""` and `None` both mean
/// "no tenant" (the global namespace).
pub fn normalize_tenant(tenant: Option<&str>) -> Option<String> {
    tenant.map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned)
}

/// A transaction with the tenant setting already applied. Every KV/object
/// operation borrows this for its duration and commits or rolls it back;
/// dropping it without committing rolls back implicitly.
pub struct TenantSession {
    pub tx: Transaction<'static, Postgres>,
    pub tenant: Option<String>,
}

impl TenantSession {
    /// Opens a transaction against `pool` and binds `tenant` to it. A
    /// failure here means the connection is unusable and the transaction
    /// (and its underlying connection checkout) is dropped rather than
    /// returned to the pool in an unknown state.
    pub async fn bind(pool: &PgPool, tenant: Option<&str>) -> CResult<TenantSession> {
        let tenant = normalize_tenant(tenant);
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT set_config('app.current_tenant', $1, true)")
            .bind(tenant.clone().unwrap_or_default())
            .execute(&mut *tx)
            .await?;
        Ok(TenantSession { tx, tenant })
    }

    /// Binds a transaction as the `kv_sweeper` role (granted `BYPASSRLS`
    /// by the sweeper-role migration), which ignores every tenant
    /// isolation policy regardless of `app.current_tenant` -- this
    /// session sees every tenant's rows at once. Used exclusively by the
    /// Expiry Sweeper, which sweeps every bucket in a single pass instead
    /// of impersonating one tenant at a time.
    pub async fn bind_privileged(pool: &PgPool) -> CResult<TenantSession> {
        let mut tx = pool.begin().await?;
        sqlx::query("SET ROLE kv_sweeper").execute(&mut *tx).await?;
        Ok(TenantSession { tx, tenant: None })
    }

    pub async fn commit(self) -> CResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> CResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_empty_and_whitespace_to_none() {
        assert_eq!(normalize_tenant(None), None);
        assert_eq!(normalize_tenant(Some("")), None);
        assert_eq!(normalize_tenant(Some("   ")), None);
        assert_eq!(normalize_tenant(Some(" acme ")), Some("acme".to_string()));
    }
}
