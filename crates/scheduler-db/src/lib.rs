//! Persistence layer for the clustered cron scheduler.
//!
//! One query module per aggregate (spec.md §3), plain `async fn`s over a
//! `PgPool` rather than a trait object -- the engine crate (`scheduler-core`)
//! is the only caller and there is exactly one backend, so a trait adds
//! indirection without buying substitutability. The distributed lock is the
//! exception: `queries::lock` backs the `scheduler_core::lock::LockService`
//! trait, which genuinely has more than one plausible backend (spec.md §6).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
