#![warn(missing_docs)]

//! Archivum transport subsystem: bounded retry around every remote call

pub mod retry;

pub use retry::{RetryExecutor, RetryPolicy, Retryable};
