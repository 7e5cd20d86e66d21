//! Query module for VCTSDB continuous queries
//! Handles parsing, per-window rewriting and execution through the query engine.

pub mod parser;
pub mod rewriter;
pub mod engine;
pub mod executor;
