//
// state.rs
//
// Copyright (C) 2024-2026 Posit Software, PBC. All rights reserved.
// Modifications copyright (C) 2026 Jonathan Marc Bearak
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tower_lsp::lsp_types::Url;

use crate::document_store::DocumentStore;
use crate::project::resolve_document_path;
use crate::xref::{XrefConfig, XrefService};

/// Server-wide state shared by the LSP handlers
pub struct WorldState {
    pub config: XrefConfig,
    pub workspace_root: Option<PathBuf>,
    pub documents: DocumentStore,
    /// Cross-reference service, present once the workspace is known
    pub xref: Option<Arc<XrefService>>,
}

impl WorldState {
    pub fn new(config: XrefConfig) -> Self {
        log::info!("Cross-reference configuration: {:?}", config);
        Self {
            config,
            workspace_root: None,
            documents: DocumentStore::new(),
            xref: None,
        }
    }

    /// Pick the workspace root from the client's folders, falling back to `root_uri`.
    pub fn set_workspace_root(&mut self, folders: &[Url], root_uri: Option<&Url>) {
        self.workspace_root = folders
            .iter()
            .chain(root_uri)
            .find_map(|uri| uri.to_file_path().ok());
        log::info!("Workspace root: {:?}", self.workspace_root);
    }

    /// Resolve a client-supplied document path against the workspace.
    pub fn resolve_path(&self, document_path: &str) -> Option<PathBuf> {
        resolve_document_path(document_path, self.workspace_root.as_deref())
    }

    /// Live contents of the open document backed by `path`
    pub fn open_contents(&self, path: &Path) -> Option<String> {
        let uri = self.documents.resolve_id(path)?;
        self.documents.get_by_id(&uri).map(|doc| doc.text())
    }

    pub fn xref_service(&self) -> Option<Arc<XrefService>> {
        self.xref.clone()
    }
}
