//! Store implementations for every collaborator interface.

pub mod memory;
pub mod postgres;
