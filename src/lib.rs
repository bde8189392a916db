//! Feed cache and fan-out engine.
//!
//! Keeps a bounded, score-ordered feed per user and a denormalized cache
//! record per post, both fed by at-least-once bus events and refreshed in
//! bulk by the heating pipeline.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
