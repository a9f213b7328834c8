//
// xref/mod.rs
//
// Cross-reference index for bookdown projects
//

pub mod config;
pub mod debounce;
pub mod index_store;
pub mod monitor;
pub mod overlay;
pub mod records;
pub mod renderer;
pub mod service;
pub mod types;



pub use config::*;
pub use debounce::*;
pub use index_store::*;
pub use monitor::*;
pub use overlay::*;
pub use records::*;
pub use renderer::*;
pub use service::*;
pub use types::*;
