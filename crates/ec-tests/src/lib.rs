//! # ec-tests
//!
//! Integration tests for the ecchain sync core.
//!
//! This crate provides:
//! - Chain, fork and state trie generators
//! - An in-memory chain store and a scripted peer network
//! - Integration suites per component and property-based ordering tests

pub mod generators;
pub mod harness;



#[cfg(test)]
mod sync_tests;

#[cfg(test)]
mod fetcher_tests;



#[cfg(test)]
mod property_tests;

pub use generators::*;
pub use harness::*;
