//! Core types and trait definitions for the cell-indexed subscription
//! registry.
//!
//! This crate has no database dependencies. Storage backends
//! (e.g. `cellreg-store-sqlite`) implement [`store::SubscriptionRepo`] on top
//! of these types.

pub mod cells;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod subscription;
pub mod version;

pub use error::{Error, Result};
