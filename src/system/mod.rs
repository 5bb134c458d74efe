//! Host system helpers

pub mod resources;
