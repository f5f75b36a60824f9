//! CLI module for ttpengine
//!
//! This module provides:
//! - Command implementations (run, validate, convert, abilities)
//! - Output handlers (console, JSON, quiet)

pub mod commands;
pub mod output;

pub use commands::{
    convert_technique, default_output_root, generate_abilities, run_ttp, validate_ttp,
};
pub use output::{OutputMode, create_handler};
