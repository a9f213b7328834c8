//
// test_utils/mod.rs
//
// Helpers shared by unit tests, integration tests and benchmarks
//

pub mod echo_renderer;
pub mod fixture_book;

pub use echo_renderer::EchoRenderer;
