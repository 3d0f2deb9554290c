// src/lib.rs

pub mod amr;
pub mod comm;
pub mod config;
pub mod error;
pub mod visualisation;

pub use error::{ClusterError, CommError, Result};
