// Expose modules for testing
pub mod cli;
pub mod domain;
pub mod export;
pub mod listener;
pub mod records;
pub mod tracer;
pub mod unwind;
