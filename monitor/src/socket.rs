//! Unix socket server for the live feed

use crate::error::Result;
use crate::protocol::{GetRowsParams, Request, Response, RowsData, StatusData, TargetData};
use crate::session::{Row, SessionSnapshot};
use crate::sink::Sink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

pub struct SocketServer {
    path: PathBuf,
    listener: UnixListener,
    broadcast_tx: broadcast::Sender<String>,
}

impl SocketServer {
    pub async fn bind(path: &Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        let (broadcast_tx, _) = broadcast::channel(100);
        info!("Feed listening on {:?}", path);
        Ok(Self { path: path.to_path_buf(), listener, broadcast_tx })
    }

    pub fn broadcast_sender(&self) -> broadcast::Sender<String> {
        self.broadcast_tx.clone()
    }

    pub async fn accept(&self) -> std::io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn socket_path() -> PathBuf {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/run/user/{}/trainwatch.sock", uid))
    }

    /// Accepts clients forever, one task per connection.
    pub async fn serve<H>(self, handler: Arc<H>)
    where
        H: RequestHandler + Send + Sync + 'static,
    {
        loop {
            match self.accept().await {
                Ok(stream) => {
                    let handler = Arc::clone(&handler);
                    let broadcast_rx = self.broadcast_tx.subscribe();
                    tokio::spawn(async move {
                        handle_client(stream, broadcast_rx, handler).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn encode(response: &Response) -> String {
    match serde_json::to_string(response) {
        Ok(json) => json + "\n",
        Err(e) => format!("{{\"type\":\"error\",\"message\":\"{}\"}}\n", e),
    }
}

pub async fn handle_client<H>(
    stream: UnixStream,
    mut broadcast_rx: broadcast::Receiver<String>,
    handler: Arc<H>,
) where
    H: RequestHandler + Send + Sync + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                match result {
                    Ok(0) => break,
                    Ok(_) => {
                        let response = match serde_json::from_str::<Request>(&line) {
                            Ok(request) => handler.handle(request).await,
                            Err(e) => {
                                warn!("Invalid request: {}", e);
                                Response::Error { message: e.to_string() }
                            }
                        };
                        if let Err(e) = writer.write_all(encode(&response).as_bytes()).await {
                            error!("Failed to write response: {}", e);
                            break;
                        }
                        line.clear();
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        break;
                    }
                }
            }
            result = broadcast_rx.recv() => {
                match result {
                    Ok(msg) => {
                        if let Err(e) = writer.write_all((msg + "\n").as_bytes()).await {
                            error!("Failed to broadcast: {}", e);
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Feed client lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

#[async_trait::async_trait]
pub trait RequestHandler {
    async fn handle(&self, request: Request) -> Response;
}

/// Answers feed requests from controller snapshots.
pub struct FeedHandler {
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl FeedHandler {
    pub fn new(snapshots: watch::Receiver<SessionSnapshot>) -> Self {
        Self { snapshots }
    }
}

#[async_trait::async_trait]
impl RequestHandler for FeedHandler {
    async fn handle(&self, request: Request) -> Response {
        // Cloning a snapshot shares its row store rather than copying rows
        let snapshot = self.snapshots.borrow().clone();
        match request {
            Request::Ping => Response::Pong,
            Request::GetStatus => Response::Status { data: StatusData::from(&snapshot) },
            Request::GetRows { params: GetRowsParams { since } } => {
                let offset = since.unwrap_or(0).min(snapshot.rows.len());
                Response::Rows {
                    data: RowsData {
                        offset,
                        rows: snapshot.rows.slice_from(offset),
                        is_final: false,
                    },
                }
            }
        }
    }
}

/// Pushes announcements and row batches to every connected feed client.
pub struct FeedSink {
    tx: broadcast::Sender<String>,
    delivered: usize,
}

impl FeedSink {
    pub fn new(tx: broadcast::Sender<String>) -> Self {
        Self { tx, delivered: 0 }
    }

    fn push(&self, response: &Response) {
        // No connected clients is not an error
        let _ = self.tx.send(encode(response).trim_end().to_string());
    }
}

impl Sink for FeedSink {
    fn announce_target(&mut self, label: &str) {
        self.delivered = 0;
        self.push(&Response::Target { data: TargetData { label: label.to_string() } });
    }

    fn deliver(&mut self, rows: &[Row], is_final: bool) -> Result<()> {
        let data = RowsData { offset: self.delivered, rows: rows.to_vec(), is_final };
        self.delivered += rows.len();
        self.push(&Response::Rows { data });
        Ok(())
    }
}
