//! # wsgate-core
//!
//! Foundation types shared by the wsgate crates:
//!
//! - **Errors**: [`errors::GateError`] and one `thiserror` enum per failure domain
//! - **Logging**: [`logging::init_subscriber`] for the `tracing` subscriber

#![deny(unsafe_code)]

pub mod errors;
pub mod logging;

pub use errors::{GateError, Result};
