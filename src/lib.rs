//! In-memory query cache with optimistic mutations, version-guarded rollback
//! and staleness propagation.

pub mod cache;
pub mod config;
pub mod dashboard;
pub mod demo;
pub mod error;
pub mod infra;
pub mod remote;
