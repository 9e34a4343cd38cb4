pub mod config;
pub mod emit;
pub mod error;
pub mod job;
pub mod parse;
pub mod source;
