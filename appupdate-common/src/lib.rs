//! # appupdate Common
//!
//! Shared utilities for the appupdate crates.
//!
//! ## Logging
//!
//! ```no_run
//! use appupdate_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(status = "pending", "Update ready");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogFormat};
