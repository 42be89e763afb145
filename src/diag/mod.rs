//! On-cabinet diagnostics.

pub mod mice;
