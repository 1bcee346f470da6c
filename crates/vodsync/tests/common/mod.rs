//! Shared test utilities for vodsync integration tests.
//!
//! This module provides:
//! - `TestHarness` with an in-memory database, a temp media directory and
//!   builders for every pipeline component
//! - Scripted fakes for the external collaborators (discovery, media
//!   server, token endpoint, upload API)

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::TestHarness;
