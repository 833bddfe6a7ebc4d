//! Session configuration
//!
//! This module handles parsing and validation of tunnel session files.

mod parser;

pub use parser::{SessionConfig, TransportKind};
