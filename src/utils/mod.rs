//! Shared utilities for parsing collaborator output.

pub mod json_extraction;
pub mod lenient;

pub use json_extraction::{
    find_matching_brace, json_candidates, parse_program, parse_structured, preview, Parsed,
};
