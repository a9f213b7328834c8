//
// backend.rs
//
// Copyright (C) 2022-2026 Posit Software, PBC. All rights reserved.
// Modifications copyright (C) 2026 Jonathan Marc Bearak
//

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::RwLock;
use tower_lsp::jsonrpc::Result;
use tower_lsp::lsp_types::*;
use tower_lsp::Client;
use tower_lsp::LanguageServer;
use tower_lsp::LspService;
use tower_lsp::Server;

use crate::project::BookProject;
use crate::r_subprocess::RSubprocess;
use crate::state::WorldState;
use crate::xref::{
    install_writer, ChangeKind, NullRenderer, PandocRenderer, PendingOverlayUpdates, Renderer,
    SourceEnumerator, StaticSources, XRef, XrefConfig, XrefService,
};

/// Custom request returning the cross-references visible from a document
pub const XREF_INDEX_METHOD: &str = "bookref/xrefIndexForFile";

/// Parameters for the bookref/xrefIndexForFile request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrefIndexParams {
    /// Filesystem path, `~`-prefixed path or `file://` URI
    pub document_path: String,
}

fn optional_path(section: &serde_json::Value, key: &str) -> Option<Option<PathBuf>> {
    let value = section.get(key)?;
    if value.is_null() {
        return Some(None);
    }
    let s = value.as_str()?.trim();
    Some((!s.is_empty()).then(|| PathBuf::from(s)))
}

/// Parse cross-reference configuration from LSP settings.
///
/// Accepts either the `bookref` section itself (initialization options) or a
/// settings object containing it (`workspace/didChangeConfiguration`). Fields
/// that are absent keep their defaults.
///
/// Returns `None` when there is no settings object to read.
pub fn parse_xref_config(settings: &serde_json::Value) -> Option<XrefConfig> {
    let section = settings.get("bookref").unwrap_or(settings);
    if !section.is_object() {
        return None;
    }

    let mut config = XrefConfig::default();

    if let Some(v) = optional_path(section, "pandocPath") {
        config.pandoc_path = v;
    }
    if let Some(v) = optional_path(section, "rPath") {
        config.r_path = v;
    }
    if let Some(v) = optional_path(section, "buildTarget") {
        config.build_target = v;
    }
    if let Some(v) = optional_path(section, "cacheDir") {
        config.cache_dir = v;
    }
    if let Some(v) = optional_path(section, "filterPath") {
        config.filter_path = v;
    }
    if let Some(v) = section.get("inputFormat").and_then(|v| v.as_str()) {
        if !v.trim().is_empty() {
            config.input_format = v.trim().to_string();
        }
    }
    if let Some(v) = section.get("settleDelayMs").and_then(|v| v.as_u64()) {
        config.settle_delay_ms = v;
    }
    if let Some(v) = section.get("initialScanGraceMs").and_then(|v| v.as_u64()) {
        config.initial_scan_grace_ms = v;
    }
    if let Some(v) = section.get("rendererTimeoutMs").and_then(|v| v.as_u64()) {
        config.renderer_timeout_ms = v;
    }
    if let Some(v) = section
        .get("maxConcurrentRenders")
        .and_then(|v| v.as_u64())
    {
        config.max_concurrent_renders = (v as usize).max(1);
    }
    if let Some(v) = section.get("overlayDebounceMs").and_then(|v| v.as_u64()) {
        config.overlay_debounce_ms = v;
    }
    if let Some(v) = section.get("watchEnabled").and_then(|v| v.as_bool()) {
        config.watch_enabled = v;
    }

    log::info!("Cross-reference configuration from settings:");
    log::info!("  buildTarget: {:?}", config.build_target);
    log::info!("  pandocPath: {:?}", config.pandoc_path);
    log::info!("  rPath: {:?}", config.r_path);
    log::info!("  cacheDir: {:?}", config.cache_dir);
    log::info!(
        "  settleDelayMs: {}, initialScanGraceMs: {}",
        config.settle_delay_ms,
        config.initial_scan_grace_ms
    );
    log::info!("  watchEnabled: {}", config.watch_enabled);

    Some(config)
}

fn change_kind(kind: FileChangeType) -> Option<ChangeKind> {
    match kind {
        FileChangeType::CREATED => Some(ChangeKind::Added),
        FileChangeType::CHANGED => Some(ChangeKind::Modified),
        FileChangeType::DELETED => Some(ChangeKind::Removed),
        _ => None,
    }
}

/// Build the cross-reference service for a workspace and start its monitor.
///
/// Tool discovery runs off the async runtime. Without pandoc every index is
/// empty; without R (or bookdown) the workspace is not treated as a book.
pub async fn start_xref_service(config: &XrefConfig, workspace_root: &Path) -> Arc<XrefService> {
    let project = Arc::new(BookProject::from_workspace(workspace_root, config));
    log::info!(
        "Book build root: {} (cache: {})",
        project.build_root().display(),
        project.cache_dir().display()
    );

    let r_path = config.r_path.clone();
    let r = tokio::task::spawn_blocking(move || RSubprocess::new(r_path))
        .await
        .ok()
        .flatten();

    let is_book = project.is_bookdown_book();
    let bookdown_installed = match &r {
        Some(r) if is_book => r.is_package_installed("bookdown").await,
        _ => false,
    };
    let book_context = is_book && bookdown_installed;
    log::info!(
        "Bookdown project: {}, bookdown installed: {}",
        is_book,
        bookdown_installed
    );

    let writer_path = match &config.filter_path {
        Some(path) => Some(path.clone()),
        None => match install_writer(project.cache_dir()) {
            Ok(path) => Some(path),
            Err(e) => {
                log::warn!("Failed to install cross-reference writer: {:#}", e);
                None
            }
        },
    };

    let pandoc = match writer_path {
        Some(writer_path) => {
            let discover_config = config.clone();
            tokio::task::spawn_blocking(move || {
                PandocRenderer::discover(&discover_config, writer_path)
            })
            .await
            .ok()
            .flatten()
        }
        None => None,
    };
    let has_pandoc = pandoc.is_some();
    let renderer: Arc<dyn Renderer> = match pandoc {
        Some(pandoc) => Arc::new(pandoc),
        None => {
            log::warn!("pandoc not found; cross-reference indexes will be empty");
            Arc::new(NullRenderer)
        }
    };

    let sources: Arc<dyn SourceEnumerator> = match r {
        Some(r) => Arc::new(r.with_timeout(config.renderer_timeout())),
        None => Arc::new(StaticSources::default()),
    };

    let service = Arc::new(XrefService::new(
        config.clone(),
        project,
        renderer,
        sources,
        book_context,
    ));

    if config.watch_enabled && has_pandoc {
        service.start_monitor(true);
    }
    service
}

pub struct Backend {
    client: Client,
    state: Arc<RwLock<WorldState>>,
    pending_overlay: Arc<PendingOverlayUpdates>,
}

impl Backend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            state: Arc::new(RwLock::new(WorldState::new(XrefConfig::default()))),
            pending_overlay: Arc::new(PendingOverlayUpdates::new()),
        }
    }

    async fn xref_service(&self) -> Option<Arc<XrefService>> {
        self.state.read().await.xref_service()
    }

    /// Replace the cross-reference service, replaying unsaved edits into the new one.
    async fn rebuild_xref_service(&self) {
        let (old, config, root) = {
            let mut state = self.state.write().await;
            (
                state.xref.take(),
                state.config.clone(),
                state.workspace_root.clone(),
            )
        };
        if let Some(old) = old {
            old.shutdown().await;
        }
        let root = match root {
            Some(root) => root,
            None => return,
        };

        let service = start_xref_service(&config, &root).await;
        let dirty: Vec<_> = {
            let mut state = self.state.write().await;
            state.xref = Some(service.clone());
            state
                .documents
                .dirty_documents()
                .filter_map(|doc| {
                    let path = doc.path.as_ref()?;
                    let reserved = service.reserve_document_update(path)?;
                    Some((reserved, doc.text()))
                })
                .collect()
        };
        for (reserved, text) in dirty {
            service.apply_reserved_update(reserved, &text).await;
        }
    }

    async fn register_file_watchers(&self) {
        let options = DidChangeWatchedFilesRegistrationOptions {
            watchers: vec![FileSystemWatcher {
                glob_pattern: GlobPattern::String("**/*.{Rmd,rmd,RMD}".to_string()),
                kind: None,
            }],
        };
        let register_options = match serde_json::to_value(options) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to encode file watcher options: {}", e);
                return;
            }
        };
        let registration = Registration {
            id: "bookref-watched-files".to_string(),
            method: "workspace/didChangeWatchedFiles".to_string(),
            register_options: Some(register_options),
        };
        if let Err(e) = self.client.register_capability(vec![registration]).await {
            log::trace!("Client declined file watcher registration: {}", e);
        }
    }

    /// Handle the bookref/xrefIndexForFile request
    async fn xref_index_for_file(&self, params: XrefIndexParams) -> Result<Vec<XRef>> {
        let (service, path, open_contents) = {
            let state = self.state.read().await;
            let path = match state.resolve_path(&params.document_path) {
                Some(path) => path,
                None => {
                    log::trace!("Cannot resolve document path {:?}", params.document_path);
                    return Ok(Vec::new());
                }
            };
            let open_contents = state.open_contents(&path);
            (state.xref_service(), path, open_contents)
        };

        let service = match service {
            Some(service) => service,
            None => return Ok(Vec::new()),
        };
        Ok(service
            .xref_index_for_file(&path, open_contents.as_deref())
            .await)
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Backend {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        log::info!("Initializing bookref");

        let mut state = self.state.write().await;
        let folders: Vec<Url> = params
            .workspace_folders
            .unwrap_or_default()
            .into_iter()
            .map(|folder| folder.uri)
            .collect();
        state.set_workspace_root(&folders, params.root_uri.as_ref());

        if let Some(config) = params
            .initialization_options
            .as_ref()
            .and_then(parse_xref_config)
        {
            state.config = config;
        }
        drop(state);

        Ok(InitializeResult {
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                            include_text: Some(true),
                        })),
                        ..Default::default()
                    },
                )),
                ..Default::default()
            },
            server_info: Some(ServerInfo {
                name: String::from("bookref"),
                version: Some(String::from(env!("CARGO_PKG_VERSION"))),
            }),
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        log::info!("bookref initialized");
        self.register_file_watchers().await;
        self.rebuild_xref_service().await;
        log::info!("Workspace initialization complete");
    }

    async fn shutdown(&self) -> Result<()> {
        log::info!("bookref shutting down");
        self.pending_overlay.cancel_all();
        let service = {
            let mut state = self.state.write().await;
            state.documents.clear();
            state.xref.take()
        };
        if let Some(service) = service {
            service.shutdown().await;
        }
        Ok(())
    }

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let doc = params.text_document;
        self.pending_overlay.cancel(&doc.uri);

        let (service, path) = {
            let mut state = self.state.write().await;
            let opened = state.documents.open(doc.uri, &doc.text, Some(doc.version));
            let path = opened.path.clone();
            (state.xref_service(), path)
        };
        if let (Some(service), Some(path)) = (service, path) {
            service.on_document_updated(&path, &doc.text, false).await;
        }
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let delay = {
            let mut state = self.state.write().await;
            if state
                .documents
                .update(
                    &uri,
                    params.content_changes,
                    Some(params.text_document.version),
                )
                .is_none()
            {
                log::trace!("Change for unknown document {}", uri);
                return;
            }
            state.config.overlay_debounce()
        };

        let (id, token) = self.pending_overlay.schedule(uri.clone());
        let state = self.state.clone();
        let pending = self.pending_overlay.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            // The overlay generation is claimed under the read lock, so a save
            // taking the write lock afterwards supersedes this render.
            let snapshot = {
                let state = state.read().await;
                let doc = state.documents.get_by_id(&uri);
                match (state.xref_service(), doc.and_then(|d| d.path.clone())) {
                    (Some(service), Some(path)) => doc.map(|d| {
                        let reserved = if d.dirty {
                            service
                                .reserve_document_update(&path)
                                .map(|reserved| (reserved, d.text()))
                        } else {
                            None
                        };
                        (service, path, d.dirty, reserved)
                    }),
                    _ => None,
                }
            };
            match snapshot {
                Some((service, _, _, Some((reserved, text)))) => {
                    service.apply_reserved_update(reserved, &text).await;
                }
                Some((service, path, false, None)) => {
                    service.on_document_updated(&path, "", false).await;
                }
                _ => {}
            }
            pending.complete(&uri, id);
        });
    }

    async fn did_save(&self, params: DidSaveTextDocumentParams) {
        let uri = params.text_document.uri;
        self.pending_overlay.cancel(&uri);

        let (service, path) = {
            let mut state = self.state.write().await;
            let path = state
                .documents
                .save(&uri, params.text.as_deref())
                .and_then(|doc| doc.path.clone());
            (state.xref_service(), path)
        };
        if let (Some(service), Some(path)) = (service, path) {
            service.on_document_updated(&path, "", false).await;
        }
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        self.pending_overlay.cancel(&uri);

        let (service, path) = {
            let mut state = self.state.write().await;
            let path = state.documents.close(&uri).and_then(|doc| doc.path);
            (state.xref_service(), path)
        };
        if let (Some(service), Some(path)) = (service, path) {
            service.on_document_removed(&path);
        }
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        log::trace!("Configuration changed");
        let new_config = match parse_xref_config(&params.settings) {
            Some(config) => config,
            None => {
                log::warn!("Failed to parse bookref configuration from settings, keeping existing configuration");
                return;
            }
        };

        let rebuild = {
            let mut state = self.state.write().await;
            let rebuild = state.config.index_settings_changed(&new_config);
            state.config = new_config;
            rebuild && state.workspace_root.is_some()
        };
        if rebuild {
            log::info!("Index settings changed, restarting cross-reference service");
            self.rebuild_xref_service().await;
        }
    }

    async fn did_change_watched_files(&self, params: DidChangeWatchedFilesParams) {
        let service = match self.xref_service().await {
            Some(service) => service,
            None => return,
        };
        for change in params.changes {
            let path = match change.uri.to_file_path() {
                Ok(path) => path,
                Err(_) => continue,
            };
            if let Some(kind) = change_kind(change.typ) {
                service.notify_file_change(path, kind);
            }
        }
    }
}

pub async fn start_lsp() -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let (service, socket) = LspService::build(Backend::new)
        .custom_method(XREF_INDEX_METHOD, Backend::xref_index_for_file)
        .finish();
    Server::new(stdin, stdout, socket).serve(service).await;

    Ok(())
}
