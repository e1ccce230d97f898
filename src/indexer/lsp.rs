//! Minimal language server client: Content-Length framed JSON-RPC over stdio.
//!
//! Requests are correlated by id through a pending table that a background
//! reader task resolves. Published diagnostics land in a map keyed by document
//! URI and server-initiated requests are answered with a `null` result.

use super::language::Language;
use super::symbols::{Symbol, SymbolKind};
use crate::error::{CodectxError, Result};
use lsp_types::notification::{
    DidCloseTextDocument, DidOpenTextDocument, Exit, Initialized, Notification, PublishDiagnostics,
};
use lsp_types::request::{DocumentSymbolRequest, Initialize, Request, Shutdown};
use lsp_types::{
    ClientCapabilities, ClientInfo, DiagnosticSeverity, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DocumentSymbol, DocumentSymbolClientCapabilities,
    DocumentSymbolParams, DocumentSymbolResponse, InitializeParams, InitializedParams,
    PublishDiagnosticsClientCapabilities, PublishDiagnosticsParams, Range, SymbolInformation,
    TextDocumentClientCapabilities, TextDocumentIdentifier, TextDocumentItem, Uri, WorkspaceFolder,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EXIT_WAIT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>>>;
type DiagnosticMap = Arc<Mutex<HashMap<Uri, Vec<lsp_types::Diagnostic>>>>;

/// A diagnostic published by the server for one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// 1-based
    pub line: usize,
    pub severity: &'static str,
    pub message: String,
    pub source: Option<String>,
}

impl From<&lsp_types::Diagnostic> for Diagnostic {
    fn from(diagnostic: &lsp_types::Diagnostic) -> Self {
        Self {
            line: diagnostic.range.start.line as usize + 1,
            severity: severity_label(diagnostic.severity),
            message: diagnostic.message.clone(),
            source: diagnostic.source.clone(),
        }
    }
}

fn severity_label(severity: Option<DiagnosticSeverity>) -> &'static str {
    match severity {
        Some(DiagnosticSeverity::ERROR) => "ERROR",
        Some(DiagnosticSeverity::WARNING) => "WARN",
        Some(DiagnosticSeverity::HINT) => "HINT",
        None | Some(_) => "INFO",
    }
}

pub struct LspSession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    diagnostics: DiagnosticMap,
    next_id: AtomicU64,
    request_timeout: Duration,
    child: Option<Child>,
    server_name: String,
    _reader: JoinHandle<()>,
    _writer: JoinHandle<()>,
}

impl LspSession {
    /// Spawn the server and complete the `initialize` handshake within `handshake_timeout`.
    pub async fn start(
        command: &[String],
        root: &Path,
        handshake_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CodectxError::LanguageServer("empty server command".to_string()))?;

        info!(server = %program, "starting language server");
        let mut child = Command::new(program)
            .args(args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CodectxError::LanguageServer(format!("failed to spawn {}: {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CodectxError::LanguageServer("server stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CodectxError::LanguageServer("server stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = program.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        debug!(server = %name, "{}", line.trim());
                    }
                }
            });
        }

        Self::connect(
            stdout,
            stdin,
            program,
            Some(child),
            root,
            handshake_timeout,
            request_timeout,
        )
        .await
    }

    /// Run the protocol over an already connected byte stream pair.
    pub(crate) async fn connect<R, W>(
        reader: R,
        mut writer: W,
        server_name: &str,
        child: Option<Child>,
        root: &Path,
        handshake_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics: DiagnosticMap = Arc::new(Mutex::new(HashMap::new()));

        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(64);
        let writer_task = tokio::spawn(async move {
            while let Some(body) = writer_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &body).await {
                    warn!(error = %e, "language server write failed");
                    break;
                }
            }
        });

        let reader_task = {
            let pending = Arc::clone(&pending);
            let diagnostics = Arc::clone(&diagnostics);
            let writer_tx = writer_tx.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(reader);
                loop {
                    match read_message(&mut reader).await {
                        Ok(Some(body)) => match serde_json::from_slice::<Value>(&body) {
                            Ok(message) => {
                                route_message(message, &pending, &diagnostics, &writer_tx).await
                            }
                            Err(e) => debug!(error = %e, "unparseable message from server"),
                        },
                        Ok(None) => {
                            debug!("language server closed stdout");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "language server read failed");
                            break;
                        }
                    }
                }
                // wake every waiter; their senders are dropped here
                if let Ok(mut map) = pending.lock() {
                    map.clear();
                }
            })
        };

        let mut session = Self {
            writer_tx,
            pending,
            diagnostics,
            next_id: AtomicU64::new(1),
            request_timeout,
            child,
            server_name: server_name.to_string(),
            _reader: reader_task,
            _writer: writer_task,
        };

        match session.handshake(root, handshake_timeout).await {
            Ok(()) => {
                info!(server = %session.server_name, "language server ready");
                Ok(session)
            }
            Err(e) => {
                session.terminate().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self, root: &Path, timeout: Duration) -> Result<()> {
        let root_uri = file_uri(root)?;
        let folder_name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            root_uri: Some(root_uri.clone()),
            workspace_folders: Some(vec![WorkspaceFolder {
                uri: root_uri,
                name: folder_name,
            }]),
            capabilities: ClientCapabilities {
                text_document: Some(TextDocumentClientCapabilities {
                    document_symbol: Some(DocumentSymbolClientCapabilities {
                        hierarchical_document_symbol_support: Some(true),
                        ..Default::default()
                    }),
                    publish_diagnostics: Some(PublishDiagnosticsClientCapabilities::default()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            client_info: Some(ClientInfo {
                name: "codectx".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            ..Default::default()
        };

        let result = self.request::<Initialize>(params, timeout).await?;
        debug!(server = %self.server_name, info = ?result.server_info, "initialize answered");
        self.notify::<Initialized>(InitializedParams {}).await
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    async fn request<R: Request>(&self, params: R::Params, timeout: Duration) -> Result<R::Result> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(CodectxError::poisoned)?
            .insert(id, tx);

        let body = encode(Some(id), R::METHOD, serde_json::to_value(params)?)?;
        if self.writer_tx.send(body).await.is_err() {
            self.forget(id);
            return Err(CodectxError::LanguageServer("server input closed".to_string()));
        }

        let value = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => value,
            Ok(Ok(Err(message))) => {
                return Err(CodectxError::LanguageServer(format!(
                    "{} failed: {}",
                    R::METHOD,
                    message
                )));
            }
            Ok(Err(_)) => {
                return Err(CodectxError::LanguageServer(format!(
                    "server exited before answering {}",
                    R::METHOD
                )));
            }
            Err(_) => {
                self.forget(id);
                return Err(CodectxError::Timeout(format!(
                    "{} after {}ms",
                    R::METHOD,
                    timeout.as_millis()
                )));
            }
        };

        serde_json::from_value(value).map_err(|e| {
            CodectxError::LanguageServer(format!("malformed {} response: {}", R::METHOD, e))
        })
    }

    fn forget(&self, id: u64) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&id);
        }
    }

    async fn notify<N: Notification>(&self, params: N::Params) -> Result<()> {
        let body = encode(None, N::METHOD, serde_json::to_value(params)?)?;
        self.writer_tx
            .send(body)
            .await
            .map_err(|_| CodectxError::LanguageServer("server input closed".to_string()))
    }

    /// Open the document, ask for its symbols, close it again.
    pub async fn document_symbols(
        &self,
        path: &Path,
        language: Language,
        text: &str,
    ) -> Result<Vec<Symbol>> {
        let uri = file_uri(path)?;
        self.notify::<DidOpenTextDocument>(DidOpenTextDocumentParams {
            text_document: TextDocumentItem::new(
                uri.clone(),
                language.language_id().to_string(),
                1,
                text.to_string(),
            ),
        })
        .await?;

        let result = self
            .request::<DocumentSymbolRequest>(
                DocumentSymbolParams {
                    text_document: TextDocumentIdentifier::new(uri.clone()),
                    work_done_progress_params: Default::default(),
                    partial_result_params: Default::default(),
                },
                self.request_timeout,
            )
            .await;

        let _ = self
            .notify::<DidCloseTextDocument>(DidCloseTextDocumentParams {
                text_document: TextDocumentIdentifier::new(uri),
            })
            .await;

        Ok(convert_symbols(result?))
    }

    /// Latest diagnostics the server published for `path`.
    pub fn diagnostics(&self, path: &Path) -> Vec<Diagnostic> {
        let Ok(uri) = file_uri(path) else {
            return Vec::new();
        };
        self.diagnostics
            .lock()
            .ok()
            .and_then(|map| map.get(&uri).map(|items| items.iter().map(Diagnostic::from).collect()))
            .unwrap_or_default()
    }

    /// Best-effort `shutdown` then `exit`, then kill and reap the process.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.request::<Shutdown>((), self.request_timeout).await {
            debug!(error = %e, "language server shutdown request failed");
        }
        let _ = self.notify::<Exit>(()).await;
        self.terminate().await;
    }

    async fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "language server kill failed");
            }
            match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, server = %self.server_name, "language server exited"),
                Ok(Err(e)) => warn!(error = %e, "failed to reap language server"),
                Err(_) => warn!(server = %self.server_name, "language server did not exit in time"),
            }
        }
    }
}

/// JSON-RPC body; `params` is left out when null (`shutdown`, `exit`).
fn encode(id: Option<u64>, method: &str, params: Value) -> Result<Vec<u8>> {
    let mut message = json!({ "jsonrpc": "2.0", "method": method });
    if let Some(id) = id {
        message["id"] = json!(id);
    }
    if !params.is_null() {
        message["params"] = params;
    }
    Ok(serde_json::to_vec(&message)?)
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    writer
        .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
        .await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one framed message. `Ok(None)` at end of stream.
///
/// Lines that are not headers (servers sometimes log to stdout) are skipped.
async fn read_message<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> std::io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }

    let mut body = vec![0u8; content_length.unwrap_or(0)];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

async fn route_message(
    message: Value,
    pending: &Pending,
    diagnostics: &DiagnosticMap,
    writer_tx: &mpsc::Sender<Vec<u8>>,
) {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned().filter(|id| !id.is_null());

    match (method, id) {
        (None, Some(id)) => {
            let Some(id) = id.as_u64() else {
                debug!(%id, "response with non-numeric id");
                return;
            };
            let sender = pending.lock().ok().and_then(|mut map| map.remove(&id));
            let Some(sender) = sender else {
                debug!(id, "response for unknown request");
                return;
            };
            let outcome = match message.get("error") {
                Some(error) => Err(error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string()),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = sender.send(outcome);
        }
        (Some(method), Some(id)) => {
            debug!(method, "answering server request with null");
            let reply = json!({ "jsonrpc": "2.0", "id": id, "result": Value::Null });
            if let Ok(body) = serde_json::to_vec(&reply) {
                let _ = writer_tx.send(body).await;
            }
        }
        (Some(method), None) if method == PublishDiagnostics::METHOD => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                Ok(published) => {
                    let uri = canonical_uri(&published.uri);
                    if let Ok(mut map) = diagnostics.lock() {
                        map.insert(uri, published.diagnostics);
                    }
                }
                Err(e) => debug!(error = %e, "malformed publishDiagnostics"),
            }
        }
        (Some(method), None) => debug!(method, "ignoring server notification"),
        (None, None) => debug!("message without method or id"),
    }
}

fn is_upper_snake(name: &str) -> bool {
    name.chars().any(|c| c.is_ascii_uppercase())
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Server symbol kinds to our coarse kinds; `None` drops the symbol.
pub fn map_symbol_kind(kind: lsp_types::SymbolKind, name: &str) -> Option<SymbolKind> {
    use lsp_types::SymbolKind as Lsp;
    match kind {
        Lsp::CLASS | Lsp::ENUM | Lsp::INTERFACE | Lsp::STRUCT => Some(SymbolKind::Class),
        Lsp::METHOD | Lsp::CONSTRUCTOR | Lsp::FUNCTION => Some(SymbolKind::Function),
        Lsp::CONSTANT | Lsp::ENUM_MEMBER => Some(SymbolKind::Constant),
        Lsp::MODULE | Lsp::NAMESPACE | Lsp::TYPE_PARAMETER => Some(SymbolKind::Type),
        Lsp::VARIABLE if is_upper_snake(name) => Some(SymbolKind::Constant),
        _ => None,
    }
}

fn to_symbol(name: &str, kind: SymbolKind, range: &Range, container: Option<String>) -> Symbol {
    let mut symbol =
        Symbol::new(name, kind, range.start.line as usize + 1).with_container(container);
    symbol.end_line = Some(range.end.line as usize + 1);
    symbol
}

/// Flattens hierarchical `DocumentSymbol`s and flat `SymbolInformation`s alike.
fn convert_symbols(response: Option<DocumentSymbolResponse>) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    match response {
        Some(DocumentSymbolResponse::Nested(items)) => {
            for item in &items {
                collect_nested(item, None, &mut symbols);
            }
        }
        Some(DocumentSymbolResponse::Flat(items)) => {
            symbols.extend(items.iter().filter_map(convert_flat));
        }
        None => {}
    }
    symbols.sort_by_key(|s| s.line);
    symbols
}

fn collect_nested(item: &DocumentSymbol, parent: Option<&str>, out: &mut Vec<Symbol>) {
    if let Some(kind) = map_symbol_kind(item.kind, &item.name) {
        out.push(to_symbol(&item.name, kind, &item.range, parent.map(str::to_string)));
    }
    for child in item.children.iter().flatten() {
        collect_nested(child, Some(&item.name), out);
    }
}

fn convert_flat(item: &SymbolInformation) -> Option<Symbol> {
    let kind = map_symbol_kind(item.kind, &item.name)?;
    let container = item.container_name.clone().filter(|c| !c.is_empty());
    Some(to_symbol(&item.name, kind, &item.location.range, container))
}

/// Percent-encoded `file://` URI for `path`, resolved against the working directory.
pub fn file_uri(path: &Path) -> Result<Uri> {
    let absolute = std::path::absolute(path)?;
    let url = url::Url::from_file_path(&absolute).map_err(|_| {
        CodectxError::LanguageServer(format!("cannot express {} as a file URI", absolute.display()))
    })?;
    Uri::from_str(url.as_str())
        .map_err(|e| CodectxError::LanguageServer(format!("invalid URI {}: {}", url, e)))
}

/// Re-derive a file URI from its path so server spellings (`%c3` vs `%C3`) match ours.
fn canonical_uri(uri: &Uri) -> Uri {
    url::Url::parse(uri.as_str())
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .and_then(|path| file_uri(&path).ok())
        .unwrap_or_else(|| uri.clone())
}

/// In-process language server for tests, speaking over a duplex pipe.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    pub(crate) enum SymbolReply {
        Result(Value),
        Error,
        Silent,
    }

    #[derive(Clone, Default)]
    pub(crate) struct ServerLog {
        pub opened: Arc<Mutex<Vec<String>>>,
        pub symbol_requests: Arc<AtomicUsize>,
    }

    impl ServerLog {
        pub(crate) fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }

        pub(crate) fn symbol_requests(&self) -> usize {
            self.symbol_requests.load(Ordering::SeqCst)
        }
    }

    async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: Value) {
        let _ = write_frame(writer, &serde_json::to_vec(&message).unwrap()).await;
    }

    /// A connected session whose server answers every documentSymbol with `reply`
    /// and publishes one warning for each document it is shown.
    pub(crate) async fn session(
        root: &Path,
        reply: SymbolReply,
        request_timeout: Duration,
    ) -> (LspSession, ServerLog) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);
        let log = ServerLog::default();

        let server_log = log.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            while let Ok(Some(body)) = read_message(&mut reader).await {
                let Ok(message) = serde_json::from_slice::<Value>(&body) else {
                    continue;
                };
                let id = message.get("id").cloned().unwrap_or(Value::Null);
                match message.get("method").and_then(Value::as_str) {
                    Some("initialize") => {
                        send(&mut server_write, json!({"jsonrpc": "2.0", "id": id, "result": {"capabilities": {}}})).await;
                    }
                    Some("textDocument/didOpen") => {
                        let uri = message["params"]["textDocument"]["uri"].as_str().unwrap_or_default().to_string();
                        server_log.opened.lock().unwrap().push(uri.clone());
                        send(
                            &mut server_write,
                            json!({
                                "jsonrpc": "2.0",
                                "method": "textDocument/publishDiagnostics",
                                "params": {
                                    "uri": uri,
                                    "diagnostics": [{
                                        "range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 5}},
                                        "severity": 2,
                                        "message": "unused import",
                                        "source": "fake"
                                    }]
                                }
                            }),
                        )
                        .await;
                    }
                    Some("textDocument/documentSymbol") => {
                        server_log.symbol_requests.fetch_add(1, Ordering::SeqCst);
                        match &reply {
                            SymbolReply::Result(result) => {
                                send(&mut server_write, json!({"jsonrpc": "2.0", "id": id, "result": result})).await;
                            }
                            SymbolReply::Error => {
                                send(
                                    &mut server_write,
                                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32603, "message": "internal error"}}),
                                )
                                .await;
                            }
                            SymbolReply::Silent => {}
                        }
                    }
                    Some("shutdown") => {
                        send(&mut server_write, json!({"jsonrpc": "2.0", "id": id, "result": null})).await;
                    }
                    Some("exit") => break,
                    _ => {}
                }
            }
        });

        let session = LspSession::connect(
            client_read,
            client_write,
            "fake-ls",
            None,
            root,
            Duration::from_secs(2),
            request_timeout,
        )
        .await
        .unwrap();
        (session, log)
    }
}

#[cfg(test)]
mod tests {
    use super::fake::SymbolReply;
    use super::*;
    use lsp_types::SymbolKind as Lsp;

    #[tokio::test]
    async fn test_read_message_framed() {
        let data = b"Content-Length: 13\r\n\r\n{\"test\":true}";
        let mut reader = BufReader::new(&data[..]);
        let body = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(body, b"{\"test\":true}");
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_message_skips_stray_lines() {
        let data = b"starting server...\r\n\r\nContent-Length: 2\r\nContent-Type: application/vscode-jsonrpc\r\n\r\n{}";
        let mut reader = BufReader::new(&data[..]);
        let body = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_write_frame_header() {
        let mut out = Vec::new();
        write_frame(&mut out, b"{\"a\":1}").await.unwrap();
        assert_eq!(out, b"Content-Length: 7\r\n\r\n{\"a\":1}");
    }

    #[test]
    fn test_encode_omits_null_params() {
        let exit: Value = serde_json::from_slice(&encode(None, "exit", Value::Null).unwrap()).unwrap();
        assert_eq!(exit, json!({"jsonrpc": "2.0", "method": "exit"}));

        let request: Value =
            serde_json::from_slice(&encode(Some(4), "x/y", json!({"a": 1})).unwrap()).unwrap();
        assert_eq!(request["id"], 4);
        assert_eq!(request["params"]["a"], 1);
    }

    #[tokio::test]
    async fn test_route_resolves_pending_response() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics: DiagnosticMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, _writer_rx) = mpsc::channel(4);
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        route_message(
            json!({"jsonrpc": "2.0", "id": 7, "result": [1, 2]}),
            &pending,
            &diagnostics,
            &writer_tx,
        )
        .await;

        assert_eq!(rx.await.unwrap().unwrap(), json!([1, 2]));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_route_error_response() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics: DiagnosticMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, _writer_rx) = mpsc::channel(4);
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, tx);

        route_message(
            json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32601, "message": "no such method"}}),
            &pending,
            &diagnostics,
            &writer_tx,
        )
        .await;

        assert_eq!(rx.await.unwrap().unwrap_err(), "no such method");
    }

    #[tokio::test]
    async fn test_route_answers_server_request_with_null() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics: DiagnosticMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::channel(4);

        route_message(
            json!({"jsonrpc": "2.0", "id": "cfg-1", "method": "workspace/configuration", "params": {}}),
            &pending,
            &diagnostics,
            &writer_tx,
        )
        .await;

        let reply: Value = serde_json::from_slice(&writer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply["id"], "cfg-1");
        assert!(reply["result"].is_null());
    }

    #[tokio::test]
    async fn test_route_stores_diagnostics_under_canonical_uri() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let diagnostics: DiagnosticMap = Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, _writer_rx) = mpsc::channel(4);

        route_message(
            json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {
                    "uri": "file:///p/caf%c3%a9.py",
                    "diagnostics": [{
                        "range": {"start": {"line": 4, "character": 0}, "end": {"line": 4, "character": 3}},
                        "severity": 1,
                        "message": "undefined name 'x'",
                        "source": "pyflakes"
                    }]
                }
            }),
            &pending,
            &diagnostics,
            &writer_tx,
        )
        .await;

        let map = diagnostics.lock().unwrap();
        let items = &map[&file_uri(Path::new("/p/café.py")).unwrap()];
        assert_eq!(items.len(), 1);
        let converted = Diagnostic::from(&items[0]);
        assert_eq!(converted.line, 5);
        assert_eq!(converted.severity, "ERROR");
        assert_eq!(converted.source.as_deref(), Some("pyflakes"));
    }

    #[test]
    fn test_symbol_kind_mapping() {
        assert_eq!(map_symbol_kind(Lsp::CLASS, "Foo"), Some(SymbolKind::Class));
        assert_eq!(map_symbol_kind(Lsp::STRUCT, "Point"), Some(SymbolKind::Class));
        assert_eq!(map_symbol_kind(Lsp::METHOD, "run"), Some(SymbolKind::Function));
        assert_eq!(map_symbol_kind(Lsp::ENUM_MEMBER, "Red"), Some(SymbolKind::Constant));
        assert_eq!(map_symbol_kind(Lsp::MODULE, "os"), Some(SymbolKind::Type));
        assert_eq!(map_symbol_kind(Lsp::VARIABLE, "MAX_SIZE"), Some(SymbolKind::Constant));
        assert_eq!(map_symbol_kind(Lsp::VARIABLE, "counter"), None);
        assert_eq!(map_symbol_kind(Lsp::PROPERTY, "field"), None);
    }

    #[test]
    fn test_convert_hierarchical_symbols() {
        let response: DocumentSymbolResponse = serde_json::from_value(json!([{
            "name": "Foo",
            "kind": 5,
            "range": {"start": {"line": 0, "character": 0}, "end": {"line": 9, "character": 0}},
            "selectionRange": {"start": {"line": 0, "character": 6}, "end": {"line": 0, "character": 9}},
            "children": [{
                "name": "bar",
                "kind": 6,
                "range": {"start": {"line": 2, "character": 4}, "end": {"line": 4, "character": 0}},
                "selectionRange": {"start": {"line": 2, "character": 8}, "end": {"line": 2, "character": 11}}
            }, {
                "name": "tmp",
                "kind": 13,
                "range": {"start": {"line": 5, "character": 4}, "end": {"line": 5, "character": 9}},
                "selectionRange": {"start": {"line": 5, "character": 4}, "end": {"line": 5, "character": 7}}
            }]
        }]))
        .unwrap();

        let symbols = convert_symbols(Some(response));
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "Foo");
        assert_eq!((symbols[0].line, symbols[0].end_line), (1, Some(10)));
        assert_eq!(symbols[1].name, "bar");
        assert_eq!(symbols[1].line, 3);
        assert_eq!(symbols[1].container.as_deref(), Some("Foo"));
    }

    #[test]
    fn test_convert_flat_symbol_information() {
        let response: DocumentSymbolResponse = serde_json::from_value(json!([{
            "name": "main",
            "kind": 12,
            "location": {"uri": "file:///p/main.go", "range": {"start": {"line": 11, "character": 0}, "end": {"line": 14, "character": 1}}},
            "containerName": ""
        }]))
        .unwrap();

        let symbols = convert_symbols(Some(response));
        assert_eq!(symbols, vec![{
            let mut s = Symbol::new("main", SymbolKind::Function, 12);
            s.end_line = Some(15);
            s
        }]);
        assert!(convert_symbols(None).is_empty());
    }

    #[test]
    fn test_file_uri_percent_encodes() {
        let uri = |p: &str| file_uri(Path::new(p)).unwrap().as_str().to_string();
        assert_eq!(uri("/p/café.py"), "file:///p/caf%C3%A9.py");
        assert_eq!(uri("/p/a#b.py"), "file:///p/a%23b.py");
        assert_eq!(uri("/p/100%.py"), "file:///p/100%25.py");
        assert_eq!(uri("/tmp/my project/a.py"), "file:///tmp/my%20project/a.py");
    }

    #[tokio::test]
    async fn test_handshake_symbols_and_diagnostics() {
        let reply = SymbolReply::Result(json!([{
            "name": "Cafe",
            "kind": 5,
            "range": {"start": {"line": 2, "character": 0}, "end": {"line": 6, "character": 0}},
            "selectionRange": {"start": {"line": 2, "character": 6}, "end": {"line": 2, "character": 10}}
        }]));
        let (session, log) = fake::session(Path::new("/p"), reply, Duration::from_secs(2)).await;
        assert_eq!(session.server_name(), "fake-ls");

        let path = Path::new("/p/café.py");
        let symbols = session
            .document_symbols(path, Language::Python, "import os\n\nclass Cafe:\n    pass\n")
            .await
            .unwrap();
        assert_eq!(symbols.len(), 1);
        assert_eq!((symbols[0].name.as_str(), symbols[0].line), ("Cafe", 3));

        assert_eq!(log.opened(), vec!["file:///p/caf%C3%A9.py".to_string()]);
        let diagnostics = session.diagnostics(path);
        assert_eq!(
            diagnostics,
            vec![Diagnostic {
                line: 1,
                severity: "WARN",
                message: "unused import".to_string(),
                source: Some("fake".to_string()),
            }]
        );
        assert!(session.diagnostics(Path::new("/p/other.py")).is_empty());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (session, log) =
            fake::session(Path::new("/p"), SymbolReply::Silent, Duration::from_millis(100)).await;

        let result = session
            .document_symbols(Path::new("/p/a.py"), Language::Python, "x = 1\n")
            .await;
        assert!(matches!(result, Err(CodectxError::Timeout(_))));
        assert_eq!(log.symbol_requests(), 1);
        assert!(session.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_reply_fails_request() {
        let (session, _log) =
            fake::session(Path::new("/p"), SymbolReply::Error, Duration::from_secs(2)).await;
        let result = session
            .document_symbols(Path::new("/p/a.py"), Language::Python, "x = 1\n")
            .await;
        assert!(matches!(result, Err(CodectxError::LanguageServer(_))));
    }

    #[tokio::test]
    async fn test_start_missing_binary_fails() {
        let command = vec!["codectx-no-such-language-server".to_string()];
        let result = LspSession::start(
            &command,
            Path::new("."),
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(result, Err(CodectxError::LanguageServer(_))));
    }
}
