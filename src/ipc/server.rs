//! Local socket connection server.
//!
//! Listens on a Unix domain socket (Linux/macOS) or named pipe (Windows)
//! using the `interprocess` crate. Every accepted connection gets its own
//! [`RpcPeer`] with the sidecar method table; the registry and the
//! orchestrators are shared by all of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::{
    tokio::prelude::*, GenericFilePath, ListenerOptions, ToFsName,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::ipc::methods;
use crate::orchestrator::{ClientHandle, Orchestrators};
use crate::rpc::RpcPeer;
use crate::{AppError, Result};

/// Per-connection limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Outbound frame queue capacity.
    pub outbound_queue: usize,
    /// Longest accepted inbound frame.
    pub max_line_bytes: usize,
    /// Reverse request deadline; `None` waits indefinitely.
    pub reverse_timeout: Option<Duration>,
}

impl From<&GlobalConfig> for ConnectionSettings {
    fn from(config: &GlobalConfig) -> Self {
        Self {
            outbound_queue: config.outbound_queue,
            max_line_bytes: config.max_line_bytes,
            reverse_timeout: config.timeouts.reverse_request(),
        }
    }
}

/// Generated socket path: a unique name in the temp dir, or a unique pipe
/// name on Windows.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    let name = format!("agent-sidecar-{}", uuid::Uuid::new_v4());
    if cfg!(windows) {
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    } else {
        std::env::temp_dir().join(format!("{name}.sock"))
    }
}

type LivePeers = Arc<Mutex<HashMap<String, Arc<RpcPeer>>>>;

/// Accept loop over a bound local socket.
pub struct ConnectionServer {
    socket_path: PathBuf,
    listener: LocalSocketListener,
    orchestrators: Orchestrators,
    settings: ConnectionSettings,
    peers: LivePeers,
    next_connection: AtomicU64,
}

impl std::fmt::Debug for ConnectionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionServer")
            .field("socket_path", &self.socket_path)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ConnectionServer {
    /// Bind `socket_path`, replacing a stale socket file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the name is invalid or the listener
    /// cannot be created.
    pub fn bind(
        socket_path: &Path,
        orchestrators: Orchestrators,
        settings: ConnectionSettings,
    ) -> Result<Self> {
        remove_stale_socket(socket_path)?;

        let name = socket_path
            .to_fs_name::<GenericFilePath>()
            .map_err(|err| {
                AppError::Ipc(format!(
                    "invalid socket path '{}': {err}",
                    socket_path.display()
                ))
            })?;
        let listener = ListenerOptions::new()
            .name(name)
            .create_tokio()
            .map_err(|err| AppError::Ipc(format!("failed to create listener: {err}")))?;

        info!(socket_path = %socket_path.display(), "connection server listening");

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            orchestrators,
            settings,
            peers: Arc::new(Mutex::new(HashMap::new())),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Path clients connect to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown` fires, then stop every live
    /// peer and cancel all running queries.
    pub async fn run(self, shutdown: CancellationToken) {
        let span = info_span!("connection_server", socket_path = %self.socket_path.display());
        async {
            loop {
                tokio::select! {
                    biased;

                    () = shutdown.cancelled() => {
                        info!("connection server shutting down");
                        break;
                    }

                    accepted = self.listener.accept() => match accepted {
                        Ok(stream) => self.spawn_connection(stream),
                        Err(err) => warn!(%err, "accept failed"),
                    },
                }
            }

            self.shutdown().await;
        }
        .instrument(span)
        .await;
    }

    fn spawn_connection(&self, stream: LocalSocketStream) {
        let connection_id = format!("conn-{}", self.next_connection.fetch_add(1, Ordering::SeqCst));
        let orchestrators = self.orchestrators.clone();
        let settings = self.settings;
        let peers = Arc::clone(&self.peers);

        let span = info_span!("connection", connection_id = %connection_id);
        tokio::spawn(
            async move {
                info!("client connected");
                let (reader, writer) = stream.split();
                let peer = RpcPeer::with_limits(
                    connection_id.clone(),
                    writer,
                    settings.outbound_queue,
                    settings.max_line_bytes,
                );
                let client = ClientHandle::new(Arc::clone(&peer), settings.reverse_timeout);
                methods::register(&peer, orchestrators, client).await;

                peers.lock().await.insert(connection_id.clone(), Arc::clone(&peer));
                peer.serve(reader).await;
                peers.lock().await.remove(&connection_id);

                info!("client disconnected");
            }
            .instrument(span),
        );
    }

    async fn shutdown(&self) {
        let peers: Vec<Arc<RpcPeer>> = self.peers.lock().await.drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.stop().await;
        }

        let cancelled = self.orchestrators.cancel_all().await;
        info!(
            connections = peers.len(),
            cancelled_queries = cancelled,
            "connection server stopped"
        );

        if let Err(err) = remove_stale_socket(&self.socket_path) {
            warn!(%err, "failed to remove socket file");
        }
    }
}

#[cfg(unix)]
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Ipc(format!(
            "failed to remove stale socket {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(not(unix))]
fn remove_stale_socket(_path: &Path) -> Result<()> {
    Ok(())
}
