//! V2V Wrapper Base Crate
//!
//! This crate contains the shared wire formats of the conversion-job
//! wrapper: the job request read on standard input, the bootstrap line
//! announced on standard output, and the state file polled by
//! downstream orchestrators. It does not contain any actual process
//! supervision logic.

pub mod api;
pub mod state;
