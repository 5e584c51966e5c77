//! genibridge: GENIbus master bridge for pumps on a half-duplex RS-485 bus
//!
//! The crate polls and controls a set of pumps from a single master. Every external cycle it packs
//! as many task reads and writes as fit into each device's buffers, sends one telegram at a time,
//! and turns the responses into typed value updates.
//!
//! The wire level (checksum, APDUs, telegram framing, units) lives in [`protocol::genibus`]; the
//! engine (scheduler, demultiplexer, transport, orchestrator and threaded driver) in
//! [`api::genibus`], which is re-exported at the crate root. The command line front end is kept in
//! a hidden module.

pub mod api;
#[doc(hidden)]
pub mod cli;
pub mod error;
pub mod protocol;
#[doc(hidden)]
pub mod utils;

pub use api::*;
