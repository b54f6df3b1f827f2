//! Core library for the remlab federated remote-laboratory stack.
//!
//! Three tiers share this crate: the coupon-authenticated broker gateway,
//! the per-lab-server authority (identity, admission, persistence), and the
//! equipment state machine driving a physical or simulated rig. Message and
//! specification documents travel as XML between tiers.

pub mod auth;
pub mod authority;
pub mod broker;
pub mod config;
pub mod equipment;
pub mod error;
pub mod proto;
pub mod redirect;
pub mod registers;
pub mod validation;

pub use error::{AppResult, LabError};
