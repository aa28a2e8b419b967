#![allow(non_camel_case_types)]

//! `kv-core` is the data and consistency engine backing the unified
//! key-value and object store. A single PostgreSQL database holds every
//! tenant's data behind row-level security; this crate owns the SQL, the
//! revision/CAS protocol, the content-addressed chunk pipeline, and the
//! watch fan-out that the HTTP/WebSocket adapter in `kv-server` sits on
//! top of.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use sqlx::PgPool;
//! use kv_core::tenant::TenantSession;
//! use kv_core::kv;
//!
//! async fn run(pool: &PgPool) -> Result<(), kv_core::error::Error> {
//!     let mut session = TenantSession::bind(pool, Some("acme")).await?;
//!     let bucket = kv::create_bucket(&mut session.tx, session.tenant.as_deref(), "config", None, 65536, 10, None).await?;
//!     kv::put(&mut session.tx, &bucket, "greeting", b"hello", None, chrono::Utc::now()).await?;
//!     session.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod digest;
pub mod error;
pub mod kv;
pub mod model;
pub mod objects;
pub mod repo;
pub mod revision;
pub mod sweeper;
pub mod tenant;
pub mod watch;
