//! Shared utilities for the command line front end

pub mod ports;

pub use ports::*;
