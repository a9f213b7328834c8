// lib.rs - Library root for the bookref server.
//
// The binary entry point in main.rs only parses arguments and starts the
// server from `backend`. Benches and integration tests use the same modules.

pub mod backend;
pub mod document_store;
pub mod project;
pub mod r_subprocess;
pub mod state;
pub mod xref;

// test_utils is available in test builds and when the `test-support` feature is enabled.
#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
