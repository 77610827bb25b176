//! tests/integration/mod.rs

mod engine;
mod lifecycle;
