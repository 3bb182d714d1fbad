//! File system helpers for directory-backed components.

pub mod metadata;
pub mod walker;
