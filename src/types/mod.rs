//! Shared data types

pub mod message;
