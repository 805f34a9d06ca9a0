//! Core types and trait definitions for Stride chat.
//!
//! This crate has no HTTP or database dependencies. It
//! describes the rows the hosted platform stores, the change payloads its
//! realtime transport emits, and the contract every platform backend
//! implements.

pub mod change;
pub mod error;
pub mod message;
pub mod platform;
pub mod query;
pub mod session;

pub use error::{Error, Result};
