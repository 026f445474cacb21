//! One running NETCONF session.
//!
//! The pump multiplexes the inbound channel (events forwarded by the
//! frontend) and the upstream channel, pushes every read through the relay
//! and delivers whatever comes out. It exits as soon as either side goes
//! away and then tears down the upstream leg; the inbound transport belongs
//! to the frontend.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use thrussh::{client, server};
use thrussh::{ChannelId, ChannelMsg, CryptoVec, Disconnect};
use tokio::sync::mpsc;

use super::frontend::UpstreamHandler;
use super::ProxyContext;
use crate::relay::{Relay, Traffic};

/// What the frontend forwards from the inbound channel.
#[derive(Debug)]
pub enum ClientEvent {
    Data(Vec<u8>),
    Eof,
    Closed,
}

enum ClosedBy {
    Client,
    Server,
}

pub async fn run(
    ctx: Arc<ProxyContext>,
    mut client_handle: server::Handle,
    client_channel: ChannelId,
    mut upstream: client::Handle<UpstreamHandler>,
    mut server_channel: client::Channel,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
) {
    log::info!("NETCONF messaging capture");
    let mut relay = Relay::new(Arc::clone(&ctx.rules));

    let closed_by = 'session: loop {
        let traffic = tokio::select! {
            event = events.recv() => match event {
                Some(ClientEvent::Data(bytes)) => relay.pump_client(&bytes),
                Some(ClientEvent::Eof) | Some(ClientEvent::Closed) | None => {
                    break 'session Some(ClosedBy::Client);
                }
            },
            msg = server_channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => relay.pump_server(&data),
                Some(ChannelMsg::ExitStatus { .. } | ChannelMsg::Eof | ChannelMsg::Close)
                | None => {
                    break 'session Some(ClosedBy::Server);
                }
                // window adjustments, subsystem confirmations and the like
                Some(_) => continue,
            },
        };
        if let Err(err) =
            deliver(&ctx, traffic, &mut client_handle, client_channel, &mut server_channel).await
        {
            log::error!("session transfer failed: {:#}", err);
            break 'session None;
        }
    };

    match closed_by {
        Some(ClosedBy::Server) => log::warn!("connection closed by peer; server down"),
        Some(ClosedBy::Client) => log::warn!("connection closed by peer; client down"),
        None => {}
    }

    if let Err(err) = ctx.serverlog.flush().and(ctx.clientlog.flush()) {
        log::error!("flushing capture sinks: {:#}", err);
    }
    log::info!("NETCONF communication finished");

    // tear down the upstream leg; errors past this point only mean the
    // other side beat us to it
    let _ = server_channel.eof().await;
    let _ = upstream.disconnect(Disconnect::ByApplication, "session finished", "en").await;
    let _ = client_handle.eof(client_channel).await;
    let _ = client_handle.close(client_channel).await;
}

async fn deliver(
    ctx: &ProxyContext,
    traffic: Traffic,
    client_handle: &mut server::Handle,
    client_channel: ChannelId,
    server_channel: &mut client::Channel,
) -> anyhow::Result<()> {
    // captures first: a message is recorded before the peer can react to it
    if !traffic.server_capture.is_empty() {
        ctx.serverlog.record(&traffic.server_capture)?;
    }
    if !traffic.client_capture.is_empty() {
        ctx.clientlog.record(&traffic.client_capture)?;
    }
    if !traffic.to_server.is_empty() {
        server_channel
            .data(&traffic.to_server[..])
            .await
            .context("writing to server channel")?;
    }
    if !traffic.to_client.is_empty() {
        client_handle
            .data(client_channel, CryptoVec::from_slice(&traffic.to_client))
            .await
            .map_err(|_| anyhow!("client channel went away"))?;
    }
    Ok(())
}
