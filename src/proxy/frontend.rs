//! Inbound SSH termination and credential mirroring.
//!
//! Every accepted connection gets one `Frontend`. Authentication does not
//! check the client against any local database: instead the proxy dials the
//! real NETCONF server and tries to authenticate there with what the client
//! presented, so the client sees exactly the outcome the server decided.
//! Once the `netconf` subsystem comes up on both legs, the channel pair is
//! handed to a pump task and the frontend only forwards channel events.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Context};
use futures::future;
use thrussh::client;
use thrussh::server::{self, Auth, Session};
use thrussh::{ChannelId, Pty};
use thrussh_keys::key;
use thrussh_keys::PublicKeyBase64;
use tokio::sync::mpsc;

use super::{pump, ProxyContext};

type Boxed<T> = Pin<Box<dyn Future<Output = Result<T, anyhow::Error>> + Send>>;

pub struct Frontend {
    ctx: Arc<ProxyContext>,
    peer: SocketAddr,
    /// Upstream transport established during auth, consumed by the
    /// subsystem request.
    upstream: Option<client::Handle<UpstreamHandler>>,
    /// Channel event feed into the running pump, once there is one.
    pump_tx: Option<mpsc::UnboundedSender<pump::ClientEvent>>,
    pump_channel: Option<ChannelId>,
}

impl Frontend {
    pub fn new(ctx: Arc<ProxyContext>, peer: SocketAddr) -> Frontend {
        Frontend { ctx, peer, upstream: None, pump_tx: None, pump_channel: None }
    }

    fn unit(self, session: Session) -> Boxed<(Frontend, Session)> {
        Box::pin(future::ready(Ok((self, session))))
    }

    fn notify(&self, channel: ChannelId, event: pump::ClientEvent) {
        if self.pump_channel == Some(channel) {
            if let Some(tx) = &self.pump_tx {
                // a closed receiver just means the pump is already gone
                let _ = tx.send(event);
            }
        }
    }
}

impl server::Handler for Frontend {
    type Error = anyhow::Error;
    type FutureAuth = Boxed<(Frontend, Auth)>;
    type FutureUnit = Boxed<(Frontend, Session)>;
    type FutureBool = Boxed<(Frontend, Session, bool)>;

    fn finished_auth(self, auth: Auth) -> Self::FutureAuth {
        Box::pin(future::ready(Ok((self, auth))))
    }

    fn finished_bool(self, b: bool, session: Session) -> Self::FutureBool {
        Box::pin(future::ready(Ok((self, session, b))))
    }

    fn finished(self, session: Session) -> Self::FutureUnit {
        Box::pin(future::ready(Ok((self, session))))
    }

    fn auth_password(mut self, user: &str, password: &str) -> Self::FutureAuth {
        log::debug!("password auth attempt from {} for user '{}'", self.peer, user);
        let user = user.to_string();
        let password = password.to_string();
        Box::pin(async move {
            match connect_upstream(&self.ctx, &user, Some(&password)).await {
                Ok(handle) => {
                    self.upstream = Some(handle);
                    Ok((self, Auth::Accept))
                }
                Err(err) => {
                    log::error!("server session setup/authentication failed: {:#}", err);
                    Ok((self, Auth::Reject))
                }
            }
        })
    }

    fn auth_publickey(mut self, user: &str, public_key: &key::PublicKey) -> Self::FutureAuth {
        log::debug!(
            "publickey auth attempt from {} for user '{}' ({})",
            self.peer,
            user,
            public_key.fingerprint(),
        );
        let user = user.to_string();
        Box::pin(async move {
            // the client's private key is not ours to use, so the upstream
            // leg authenticates with the proxy's own identity instead
            if self.ctx.client_key.is_none() {
                log::error!("publickey auth needs --clientprivatekey to be configured");
                return Ok((self, Auth::Reject));
            }
            match connect_upstream(&self.ctx, &user, None).await {
                Ok(handle) => {
                    self.upstream = Some(handle);
                    Ok((self, Auth::Accept))
                }
                Err(err) => {
                    log::error!("server session setup/authentication failed: {:#}", err);
                    Ok((self, Auth::Reject))
                }
            }
        })
    }

    fn channel_open_session(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        log::debug!("session channel {:?} opened by {}", channel, self.peer);
        self.unit(session)
    }

    fn channel_eof(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        self.notify(channel, pump::ClientEvent::Eof);
        self.unit(session)
    }

    fn channel_close(self, channel: ChannelId, session: Session) -> Self::FutureUnit {
        self.notify(channel, pump::ClientEvent::Closed);
        self.unit(session)
    }

    fn data(self, channel: ChannelId, data: &[u8], session: Session) -> Self::FutureUnit {
        if self.pump_channel == Some(channel) {
            self.notify(channel, pump::ClientEvent::Data(data.to_vec()));
        } else {
            log::warn!("dropping {} bytes sent outside the netconf subsystem", data.len());
        }
        self.unit(session)
    }

    fn shell_request(self, channel: ChannelId, mut session: Session) -> Self::FutureUnit {
        log::error!("shell request is not supported");
        session.channel_failure(channel);
        self.unit(session)
    }

    fn exec_request(self, channel: ChannelId, _data: &[u8], mut session: Session) -> Self::FutureUnit {
        log::error!("exec request is not supported");
        session.channel_failure(channel);
        self.unit(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn pty_request(
        self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        mut session: Session,
    ) -> Self::FutureUnit {
        log::error!("pty request is not supported");
        session.channel_failure(channel);
        self.unit(session)
    }

    fn subsystem_request(
        mut self,
        channel: ChannelId,
        name: &str,
        mut session: Session,
    ) -> Self::FutureUnit {
        log::debug!("subsystem request '{}' on channel {:?}", name, channel);
        let name = name.to_string();
        Box::pin(async move {
            if name != "netconf" {
                log::error!("subsystem {} is not supported", name);
                session.channel_failure(channel);
                return Ok((self, session));
            }
            if self.pump_tx.is_some() {
                log::error!("only one netconf channel is supported per connection");
                session.channel_failure(channel);
                return Ok((self, session));
            }
            let mut upstream = match self.upstream.take() {
                Some(handle) => handle,
                None => {
                    log::error!("netconf subsystem requested before authentication");
                    session.channel_failure(channel);
                    return Ok((self, session));
                }
            };

            let server_channel = match open_netconf_channel(&mut upstream).await {
                Ok(ch) => ch,
                Err(err) => {
                    log::warn!(
                        "NETCONF over SSH to {} failed: {:#}",
                        self.ctx.upstream_host,
                        err,
                    );
                    session.channel_failure(channel);
                    session.close(channel);
                    return Ok((self, session));
                }
            };

            session.channel_success(channel);
            let (tx, rx) = mpsc::unbounded_channel();
            self.pump_tx = Some(tx);
            self.pump_channel = Some(channel);
            tokio::spawn(pump::run(
                Arc::clone(&self.ctx),
                session.handle(),
                channel,
                upstream,
                server_channel,
                rx,
            ));
            Ok((self, session))
        })
    }
}

/// The handler side of the outbound leg. Its only real job is checking the
/// upstream host key against the pinned one, when pinning is configured.
pub struct UpstreamHandler {
    pinned_host_key: Option<String>,
}

impl client::Handler for UpstreamHandler {
    type Error = anyhow::Error;
    type FutureUnit = future::Ready<Result<(Self, client::Session), anyhow::Error>>;
    type FutureBool = future::Ready<Result<(Self, bool), anyhow::Error>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        future::ready(Ok((self, b)))
    }

    fn finished(self, session: client::Session) -> Self::FutureUnit {
        future::ready(Ok((self, session)))
    }

    fn check_server_key(self, server_public_key: &key::PublicKey) -> Self::FutureBool {
        let ok = match &self.pinned_host_key {
            Some(expected) => &server_public_key.public_key_base64() == expected,
            None => true,
        };
        if !ok {
            log::error!(
                "server host key mismatch ({})",
                server_public_key.fingerprint(),
            );
        }
        self.finished_bool(ok)
    }
}

/// Dial the configured NETCONF server and authenticate as the inbound client
/// did. The configured client identity key is offered first when present,
/// then the mirrored password. Any failure here turns into an inbound auth
/// rejection of the same category.
async fn connect_upstream(
    ctx: &ProxyContext,
    user: &str,
    password: Option<&str>,
) -> anyhow::Result<client::Handle<UpstreamHandler>> {
    let config = Arc::new({
        let mut config = client::Config::default();
        config.connection_timeout = None;
        config
    });
    let handler = UpstreamHandler { pinned_host_key: ctx.server_host_key.clone() };
    let mut handle =
        client::connect(config, (ctx.upstream_host.as_str(), ctx.upstream_port), handler)
            .await
            .with_context(|| {
                format!("connecting to {}:{}", ctx.upstream_host, ctx.upstream_port)
            })?;

    let mut authenticated = false;
    if let Some(client_key) = &ctx.client_key {
        authenticated = handle
            .authenticate_publickey(user, Arc::clone(client_key))
            .await
            .context("offering client private key to server")?;
        if !authenticated {
            log::debug!("server declined the configured client private key");
        }
    }
    if !authenticated {
        if let Some(password) = password {
            authenticated = handle
                .authenticate_password(user, password)
                .await
                .context("password authentication with server")?;
        }
    }
    if !authenticated {
        bail!("server rejected authentication for user '{}'", user);
    }
    Ok(handle)
}

async fn open_netconf_channel(
    upstream: &mut client::Handle<UpstreamHandler>,
) -> anyhow::Result<client::Channel> {
    let mut channel =
        upstream.channel_open_session().await.context("opening server session channel")?;
    channel
        .request_subsystem(true, "netconf")
        .await
        .context("requesting netconf subsystem")?;
    Ok(channel)
}
