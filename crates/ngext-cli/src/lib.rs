//! Library surface of the ngext CLI, so command functions can be tested
//! against mock hosts and tunnel services.

pub mod commands;
pub mod selector;
