//! # seatbook-core
//!
//! Core crate for seatbook. Contains configuration schemas, typed
//! identifiers, the lock-strategy and isolation-level vocabulary shared by
//! the engine and the store, and the unified error system.
//!
//! This crate has **no** internal dependencies on other seatbook crates.

pub mod config;
pub mod error;
pub mod result;
pub mod types;

pub use error::{AppError, ErrorKind};
pub use result::AppResult;
