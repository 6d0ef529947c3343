pub mod bookmark;
pub mod cli;
pub mod config;
pub mod manifest;
pub mod runtime;
