//! WebSocket autoupdate server.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── AutoupdateServer ── Consumer per connection
//! Client B ──┘          │
//!                       ├── ElementCache (restricted reads)
//!                       ├── FanoutBus (change notices)
//!                       └── NotifyRelay (client-to-client)
//! ```
//!
//! Each connection authenticates via a `?token=` query parameter, receives
//! the server constants, and then enters a select loop over its websocket
//! frames, the change-notice bus and the notify relay. All messages are JSON
//! text frames in the envelope format of [`crate::protocol`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::cache::element_cache::AutoupdateError;
use crate::consumer::{Consumer, SessionAuth};
use crate::fanout::NotifyRelay;
use crate::hub::AutoupdateHub;
use crate::protocol::{
    ClientEnvelope, ServerMessage, ERROR_INTERNAL, ERROR_NOT_AUTHORIZED, ERROR_WRONG_FORMAT,
};
use crate::registry::UserContext;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Change-notice channel capacity per connection
    pub broadcast_capacity: usize,
    /// Notify relay channel capacity per connection
    pub notify_capacity: usize,
    /// Accept connections without a valid token as anonymous
    pub anonymous_enabled: bool,
    /// Handshake and outbound-send deadline; a connection that cannot
    /// complete the handshake or accept a pushed frame in time is dropped
    pub startup_timeout_secs: u64,
    /// Constants pushed to every client right after connect
    pub constants: Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9010".to_string(),
            broadcast_capacity: 256,
            notify_capacity: 64,
            anonymous_enabled: true,
            startup_timeout_secs: 30,
            constants: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_connections: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
}

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The autoupdate server.
pub struct AutoupdateServer {
    config: ServerConfig,
    hub: Arc<AutoupdateHub>,
    auth: Arc<dyn SessionAuth>,
    notify: Arc<NotifyRelay>,
    stats: Arc<RwLock<ServerStats>>,
}

impl AutoupdateServer {
    pub fn new(config: ServerConfig, hub: Arc<AutoupdateHub>, auth: Arc<dyn SessionAuth>) -> Self {
        let notify = Arc::new(NotifyRelay::new(config.notify_capacity));
        Self {
            config,
            hub,
            auth,
            notify,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Start listening for WebSocket connections.
    ///
    /// Builds the cache before accepting anything, so the first client never
    /// observes an empty snapshot. Runs the accept loop until the listener
    /// fails. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.hub.cache().ensure_cache(false).await?;
        log::info!(
            "Cache ready at change id {}",
            self.hub.cache().get_current_change_id().await?
        );

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Autoupdate server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let auth = self.auth.clone();
            let notify = self.notify.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, hub, auth, notify, stats, config).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<AutoupdateHub>,
        auth: Arc<dyn SessionAuth>,
        notify: Arc<NotifyRelay>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture the auth token from the handshake query string.
        let mut token: Option<String> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            token = req.uri().query().and_then(|q| {
                q.split('&')
                    .find_map(|p| p.strip_prefix("token="))
                    .map(str::to_string)
            });
            Ok(resp)
        };
        let deadline = Duration::from_secs(config.startup_timeout_secs);
        let ws_stream = timeout(
            deadline,
            tokio_tungstenite::accept_hdr_async(stream, callback),
        )
        .await??;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let user = match auth.authenticate(token.as_deref()) {
            Some(user) => user,
            None if config.anonymous_enabled => UserContext::anonymous(),
            None => {
                log::info!("Refusing unauthorized connection from {addr}");
                {
                    let mut s = stats.write().await;
                    s.refused_connections += 1;
                    s.active_connections -= 1;
                }
                let refusal = ServerMessage::error(ERROR_NOT_AUTHORIZED, "Not authorized");
                Self::send(&mut ws_sender, &refusal, None, deadline).await?;
                timeout(deadline, ws_sender.send(Message::Close(None))).await??;
                return Ok(());
            }
        };

        log::info!(
            "WebSocket connection established from {addr} (user {}{})",
            user.user_id,
            if user.anonymous { ", anonymous" } else { "" }
        );

        let cache = hub.cache().clone();
        let mut consumer = Consumer::new(user);
        let mut notice_rx = hub.bus().subscribe();
        let mut notify_rx = notify.subscribe();

        // The session runs in an inner block so the stats decrement below
        // covers every exit, including send failures mid-push.
        let session: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            // The constants and the push baseline go out before any frame is
            // read, so a client can immediately getElements against a change
            // id it will also be pushed from.
            Self::send(
                &mut ws_sender,
                &ServerMessage::Constants(config.constants.clone()),
                None,
                deadline,
            )
            .await?;
            consumer.start_listening(cache.get_current_change_id().await?);

            loop {
                tokio::select! {
                    // Incoming WebSocket frame
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                }

                                let (envelope, request) =
                                    match ClientEnvelope::parse(text.as_str()) {
                                        Ok(parsed) => parsed,
                                        Err(e) => {
                                            // Malformed input answers with an
                                            // error message; the connection
                                            // stays open.
                                            log::warn!("Malformed message from {addr}: {e}");
                                            {
                                                let mut s = stats.write().await;
                                                s.malformed_messages += 1;
                                            }
                                            let error = ServerMessage::error(
                                                ERROR_WRONG_FORMAT,
                                                e.to_string(),
                                            );
                                            Self::send(&mut ws_sender, &error, None, deadline)
                                                .await?;
                                            continue;
                                        }
                                    };

                                match consumer.handle_request(&cache, &notify, request).await {
                                    Ok(replies) => {
                                        for reply in &replies {
                                            Self::send(
                                                &mut ws_sender,
                                                reply,
                                                Some(&envelope.id),
                                                deadline,
                                            )
                                            .await?;
                                        }
                                    }
                                    Err(e) => {
                                        Self::log_session_error(addr, &e);
                                        let error =
                                            ServerMessage::error(ERROR_INTERNAL, "Internal error");
                                        Self::send(
                                            &mut ws_sender,
                                            &error,
                                            Some(&envelope.id),
                                            deadline,
                                        )
                                        .await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                return Ok(());
                            }

                            Some(Ok(Message::Ping(data))) => {
                                timeout(deadline, ws_sender.send(Message::Pong(data))).await??;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                return Ok(());
                            }

                            _ => {}
                        }
                    }

                    // Change notice from this or another worker
                    notice = notice_rx.recv() => {
                        match notice {
                            Ok(notice) => {
                                match consumer.handle_notice(&cache, notice).await {
                                    Ok(messages) => {
                                        for message in &messages {
                                            Self::send(&mut ws_sender, message, None, deadline)
                                                .await?;
                                        }
                                    }
                                    Err(e) => {
                                        Self::log_session_error(addr, &e);
                                        let error =
                                            ServerMessage::error(ERROR_INTERNAL, "Internal error");
                                        Self::send(&mut ws_sender, &error, None, deadline)
                                            .await?;
                                    }
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                // Harmless: the next notice covers everything
                                // since the consumer's baseline.
                                log::warn!("Connection {addr} lagged by {n} change notices");
                            }
                            Err(RecvError::Closed) => return Ok(()),
                        }
                    }

                    // Notify from another connection
                    envelope = notify_rx.recv() => {
                        match envelope {
                            Ok(envelope) => {
                                if let Some(message) = consumer.handle_notify(&envelope) {
                                    Self::send(&mut ws_sender, &message, None, deadline).await?;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Connection {addr} dropped {n} notify messages");
                            }
                            Err(RecvError::Closed) => return Ok(()),
                        }
                    }
                }
            }
        }
        .await;

        consumer.close();
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        session
    }

    /// Encode and send one message, bounded by the configured deadline so a
    /// stalled client cannot pin the connection task.
    async fn send(
        sender: &mut WsSender,
        message: &ServerMessage,
        in_response: Option<&str>,
        deadline: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let text = message.encode(in_response)?;
        timeout(deadline, sender.send(Message::Text(text.into()))).await??;
        Ok(())
    }

    /// A failing restriction pass poisons only the current reply, not the
    /// connection.
    fn log_session_error(addr: SocketAddr, e: &AutoupdateError) {
        log::error!("Session error for {addr}: {e}");
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the notify relay (for publishing server-side notifications).
    pub fn notify(&self) -> &Arc<NotifyRelay> {
        &self.notify
    }

    /// Get the hub backing this server.
    pub fn hub(&self) -> &Arc<AutoupdateHub> {
        &self.hub
    }
}
