//! tests/common/mod.rs
//!
//! Public facade for the test harness module.

// Not every test file uses every helper.
#![allow(dead_code)]
