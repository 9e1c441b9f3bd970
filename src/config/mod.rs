//! Client configuration
//!
//! This module handles parsing of `.conf` files with a [Client] section.

mod parser;

pub use parser::{ClientConfig, MAX_KEY_BITS, MIN_KEY_BITS};
