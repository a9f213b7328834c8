//
// test_utils/echo_renderer.rs
//
// In-process renderer whose entries are the document's own lines
//

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::xref::Renderer;

/// Renderer that returns every line of the input as an entry.
///
/// Documents written for tests therefore contain index entries directly.
/// Counts its invocations so tests can tell whether a reindex happened.
#[derive(Debug, Default)]
pub struct EchoRenderer {
    calls: AtomicUsize,
}

impl EchoRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times `index` has run
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for EchoRenderer {
    async fn index(&self, content: &str) -> Vec<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        content.lines().map(str::to_string).collect()
    }
}
