//! Passive-mode FTP retrieval.

pub mod control;
pub mod engine;
