//! The serving side of ncproxy: a TCP accept loop handing every inbound
//! connection to its own ssh front end.

pub mod frontend;
pub mod pump;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use thrussh::server;
use thrussh_keys::key;
use tokio::net::{TcpListener, TcpSocket};

use crate::capture::Sink;
use crate::rules::RuleSet;

const LISTEN_BACKLOG: u32 = 100;

/// Everything a session needs that outlives any one connection. Built once
/// by the launcher and shared read-only across all sessions.
pub struct ProxyContext {
    pub upstream_host: String,
    pub upstream_port: u16,
    pub rules: Arc<RuleSet>,
    /// Identity offered to the upstream server during publickey auth.
    pub client_key: Option<Arc<key::KeyPair>>,
    /// base64 of the public key the upstream must present, when pinned.
    pub server_host_key: Option<String>,
    pub serverlog: Sink,
    pub clientlog: Sink,
}

/// Bind the listening socket with address reuse enabled.
pub fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let socket = TcpSocket::new_v4().context("creating listen socket")?;
    socket.set_reuseaddr(true).context("enabling address reuse")?;
    socket
        .bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .context("binding listen socket")?;
    socket.listen(LISTEN_BACKLOG).context("listening for client connections")
}

/// Accept connections forever. Each connection runs its ssh transport in its
/// own task, so one misbehaving client never takes the others down.
pub async fn serve(
    listener: TcpListener,
    config: Arc<server::Config>,
    ctx: Arc<ProxyContext>,
) -> anyhow::Result<()> {
    log::info!("listening for client connection ...");
    loop {
        let (socket, peer) = listener.accept().await.context("accepting client connection")?;
        log::info!("incoming client connection from {} (srcport: {})", peer.ip(), peer.port());
        let config = Arc::clone(&config);
        let handler = frontend::Frontend::new(Arc::clone(&ctx), peer);
        tokio::spawn(async move {
            if let Err(err) = server::run_stream(config, socket, handler).await {
                log::warn!("connection failed: {:#}", err);
            }
        });
    }
}
