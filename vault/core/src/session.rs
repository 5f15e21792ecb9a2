//! Portal Session
//!
//! Composition root wiring the client components together for one user
//! session: REST client, health monitor, chat socket, connection-state
//! aggregator and chat controller. Front-ends construct one of these and
//! talk to the components through it.

use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;

use crate::api::ApiClient;
use crate::chat::{ChatSession, SocketResponseSource};
use crate::config::PortalConfig;
use crate::connection::{ConnectionCapabilities, ConnectionMonitor};
use crate::health::HealthMonitor;
use crate::protocol::ChatContext;
use crate::transport::{ChatSocket, SocketConnector};

/// Client session owning every portal component
pub struct PortalSession {
    config: PortalConfig,
    api: ApiClient,
    health: HealthMonitor,
    socket: ChatSocket,
    connection: ConnectionMonitor,
    chat: ChatSession,
}

impl PortalSession {
    /// Build a session from validated configuration
    ///
    /// # Errors
    ///
    /// Fails when the configuration is invalid or an HTTP client cannot be
    /// constructed.
    pub fn new(config: PortalConfig) -> anyhow::Result<Self> {
        let socket = ChatSocket::new(config.transport.clone());
        Self::assemble(config, socket)
    }

    /// Build a session using a custom socket connector
    ///
    /// # Errors
    ///
    /// Same as [`PortalSession::new`].
    pub fn with_connector(
        config: PortalConfig,
        connector: Arc<dyn SocketConnector>,
    ) -> anyhow::Result<Self> {
        let socket = ChatSocket::with_connector(config.transport.clone(), connector);
        Self::assemble(config, socket)
    }

    fn assemble(config: PortalConfig, socket: ChatSocket) -> anyhow::Result<Self> {
        config.validate().context("Invalid portal configuration")?;

        let api = ApiClient::new(&config.api).context("Failed to create REST client")?;
        let health = HealthMonitor::new(&config.api.base_url, config.health.clone())
            .context("Failed to create health monitor")?;
        let connection = ConnectionMonitor::new(&health, &socket);
        let chat = ChatSession::new(Arc::new(SocketResponseSource::new(socket.clone())));

        Ok(Self {
            config,
            api,
            health,
            socket,
            connection,
            chat,
        })
    }

    /// Start health polling
    pub fn start(&self) {
        tracing::info!(
            api = %self.config.api.base_url,
            ws = %self.config.transport.ws_base_url,
            "Starting portal session"
        );
        self.health.start_monitoring();
    }

    /// Switch to an existing conversation
    ///
    /// Clears the chat (cancelling any in-flight turn) and binds the socket to
    /// the conversation.
    pub fn open_conversation(&self, conversation_id: &str) {
        if self.chat.conversation_id().as_deref() != Some(conversation_id) {
            self.chat.set_conversation(Some(conversation_id.to_string()));
        }
        self.socket.connect(conversation_id);
    }

    /// Start a fresh conversation and return its id
    pub fn new_chat(&self) -> String {
        let id = Uuid::new_v4().to_string();
        tracing::info!(conversation_id = %id, "Starting new conversation");
        self.open_conversation(&id);
        id
    }

    /// Retry the chat connection after it gave up or was closed
    ///
    /// Returns `false` when the socket is open or already retrying, or when
    /// no conversation has been opened.
    pub fn reconnect(&self) -> bool {
        let status = self.socket.status();
        if status.is_connected() || status.is_pending() {
            return false;
        }
        let Some(id) = self
            .socket
            .conversation_id()
            .or_else(|| self.chat.conversation_id())
        else {
            return false;
        };

        tracing::info!(conversation_id = %id, status = %status, "Reconnecting on request");
        self.socket.connect(&id);
        true
    }

    /// Focus the assistant on one repository, or on everything
    pub fn set_repository(&self, repo: Option<&str>) {
        let context = repo.map_or_else(ChatContext::global, ChatContext::repo);
        self.chat.set_context(context);
    }

    /// Stop polling, cancel the current turn and close the socket
    pub fn stop(&self) {
        self.chat.cancel_generation();
        self.health.stop_monitoring();
        self.socket.disconnect();
        tracing::info!("Portal session stopped");
    }

    /// Stop everything and release listener registrations
    pub fn dispose(self) {
        self.stop();
        self.connection.detach();
    }

    /// Resolved configuration
    #[must_use]
    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// REST client
    #[must_use]
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Health monitor
    #[must_use]
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// Chat socket
    #[must_use]
    pub fn socket(&self) -> &ChatSocket {
        &self.socket
    }

    /// Connection-state aggregator
    #[must_use]
    pub fn connection(&self) -> &ConnectionMonitor {
        &self.connection
    }

    /// Chat controller
    #[must_use]
    pub fn chat(&self) -> &ChatSession {
        &self.chat
    }

    /// Current derived capabilities
    #[must_use]
    pub fn capabilities(&self) -> ConnectionCapabilities {
        self.connection.capabilities()
    }
}

impl std::fmt::Debug for PortalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalSession")
            .field("api", &self.config.api.base_url)
            .field("socket", &self.socket.status())
            .field("conversation_id", &self.socket.conversation_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{TurnOutcome, APOLOGY};
    use crate::transport::mock::{settle, MockConnector, OpenOutcome};
    use crate::transport::{ConnectionStatus, TransportConfig};
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> PortalConfig {
        let mut config = PortalConfig::for_backend("http://127.0.0.1:9");
        config.transport = TransportConfig {
            ws_base_url: "ws://127.0.0.1:9".into(),
            ..TransportConfig::for_testing()
        };
        config
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = test_config();
        config.transport.ws_base_url = "ftp://nowhere".into();
        let err = PortalSession::new(config).unwrap_err();
        assert!(format!("{err:#}").contains("ws://"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_chat_binds_socket_and_chat() {
        let (connector, mut peers) = MockConnector::accepting();
        let session = PortalSession::with_connector(test_config(), connector).unwrap();

        let id = session.new_chat();
        settle().await;
        let peer = peers.try_recv().unwrap();

        assert_eq!(peer.url, format!("ws://127.0.0.1:9/ws/chat/{id}"));
        assert_eq!(session.socket().status(), ConnectionStatus::Connected);
        assert_eq!(session.chat().conversation_id(), Some(id));
        assert_eq!(session.capabilities().socket, ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_chat_turn_through_session() {
        let (connector, mut peers) = MockConnector::accepting();
        let session = PortalSession::with_connector(test_config(), connector).unwrap();
        session.open_conversation("conv-1");
        session.set_repository(Some("backend-api"));
        settle().await;
        let mut peer = peers.try_recv().unwrap();

        let chat = session.chat().clone();
        let turn = tokio::spawn(async move { chat.send_message("hello").await });
        settle().await;

        let sent = peer.drain_json();
        assert_eq!(sent[0]["context"], json!({"scope": "repo", "repoName": "backend-api"}));

        peer.send_json(&json!({"type": "text", "content": "Hi!"}));
        peer.send_json(&json!({"type": "done"}));

        assert_eq!(turn.await.unwrap(), TurnOutcome::Completed);
        assert_eq!(session.chat().messages()[1].content, "Hi!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disconnects() {
        let (connector, mut peers) = MockConnector::accepting();
        let session = PortalSession::with_connector(test_config(), connector).unwrap();
        session.open_conversation("conv-1");
        settle().await;
        let _peer = peers.try_recv().unwrap();
        let socket = session.socket().clone();

        session.dispose();
        assert_eq!(socket.status(), ConnectionStatus::Disconnected);
        assert_eq!(socket.conversation_id(), None);
    }

    fn no_retry_config() -> PortalConfig {
        let mut config = test_config();
        config.transport.reconnect_enabled = false;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_while_failed_ends_with_apology() {
        let (connector, _peers) = MockConnector::refusing();
        let session = PortalSession::with_connector(no_retry_config(), connector).unwrap();
        session.open_conversation("conv-1");
        settle().await;
        assert_eq!(session.socket().status(), ConnectionStatus::Failed);

        let outcome = tokio::time::timeout(Duration::from_secs(5), session.chat().send_message("hi"))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Failed);
        assert_eq!(session.chat().messages()[1].content, APOLOGY);
        assert!(!session.chat().is_streaming());
        assert_eq!(session.socket().queued_messages(), 0);

        // the session is not wedged
        let again = tokio::time::timeout(Duration::from_secs(5), session.chat().send_message("again"))
            .await
            .unwrap();
        assert_eq!(again, TurnOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_after_server_close_ends_with_apology() {
        let (connector, mut peers) = MockConnector::accepting();
        let session = PortalSession::with_connector(test_config(), connector).unwrap();
        session.open_conversation("conv-1");
        settle().await;
        let peer = peers.try_recv().unwrap();

        peer.close(1000);
        settle().await;
        assert_eq!(session.socket().status(), ConnectionStatus::Disconnected);

        let outcome = tokio::time::timeout(Duration::from_secs(5), session.chat().send_message("hi"))
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_recovers_from_failed() {
        let (connector, mut peers) = MockConnector::accepting();
        connector.script(&[OpenOutcome::Refuse]);
        let session =
            PortalSession::with_connector(no_retry_config(), Arc::clone(&connector) as _).unwrap();

        assert!(!session.reconnect());

        session.open_conversation("conv-1");
        settle().await;
        assert_eq!(session.socket().status(), ConnectionStatus::Failed);
        assert_eq!(session.capabilities().socket, ConnectionStatus::Failed);

        assert!(session.reconnect());
        settle().await;
        let peer = peers.try_recv().unwrap();

        assert!(peer.url.ends_with("/ws/chat/conv-1"));
        assert_eq!(session.socket().status(), ConnectionStatus::Connected);
        assert_eq!(connector.opens(), 2);
        assert!(!session.reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_turn_does_not_leak_into_next() {
        let (connector, mut peers) = MockConnector::accepting();
        let session = PortalSession::with_connector(test_config(), connector).unwrap();
        session.open_conversation("conv-1");
        settle().await;
        let mut peer = peers.try_recv().unwrap();

        let chat = session.chat().clone();
        let first = tokio::spawn(async move { chat.send_message("first").await });
        settle().await;
        peer.send_json(&json!({"type": "text", "content": "old-"}));
        settle().await;

        assert!(session.chat().cancel_generation());
        assert_eq!(first.await.unwrap(), TurnOutcome::Cancelled);
        assert_eq!(session.chat().messages()[1].content, "old-");

        let chat = session.chat().clone();
        let second = tokio::spawn(async move { chat.send_message("second").await });
        settle().await;

        // the rest of the cancelled answer arrives after the new message
        peer.send_json(&json!({"type": "text", "content": "tail-of-first"}));
        peer.send_json(&json!({"type": "done"}));
        settle().await;
        assert!(session.chat().is_streaming());

        peer.send_json(&json!({"type": "text", "content": "fresh"}));
        peer.send_json(&json!({"type": "done"}));

        assert_eq!(second.await.unwrap(), TurnOutcome::Completed);
        let messages = session.chat().messages();
        assert_eq!(messages[1].content, "old-");
        assert_eq!(messages[3].content, "fresh");

        let sent: Vec<String> = peer
            .drain_json()
            .into_iter()
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(sent, vec!["message", "cancel", "message"]);
    }
}
