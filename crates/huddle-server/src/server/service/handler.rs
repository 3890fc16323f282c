//! HTTP entry point for the chat relay.
//!
//! This module defines [`ChatService`], which owns the shared [`Hub`] and the
//! [`WorkerPool`] and exposes them through an axum [`Router`]:
//!
//! - `GET /ws/chat` upgrades to a WebSocket and joins the room.
//! - `GET /health` reports readiness and current load.
//!
//! ## Responsibilities
//!
//! - Build the exclusive section, queue and registry from [`ServerConfig`].
//! - Spawn the worker pool.
//! - Refuse new connections once shutdown begins, drain the pool, then close
//!   every open connection with a going-away frame.

use crate::server::{
    config::ServerConfig,
    pool::manager::WorkerPool,
    session::{
        Hub,
        conversation::Conversation,
        queue::InboundQueue,
    },
    streaming::connection::handle_connection,
};
use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use huddle_core::{Error, engine::GenerationEngine, prompt::PromptTemplate};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// The chat relay: one room, one shared conversation, many clients.
#[derive(Clone)]
pub struct ChatService {
    config: Arc<ServerConfig>,
    hub: Arc<Hub>,
    worker_pool: Arc<WorkerPool>,
    connections: CancellationToken,
    serving: Arc<AtomicBool>,
}

impl ChatService {
    /// Creates the relay with the engine named in `config` and spawns its
    /// workers on the current runtime.
    pub fn new(config: ServerConfig) -> Self {
        let engine = config.engine.build();
        Self::with_engine(config, engine)
    }

    /// Like [`ChatService::new`] but with an explicit engine.
    pub fn with_engine(config: ServerConfig, engine: Box<dyn GenerationEngine>) -> Self {
        let conversation = Conversation::new(
            engine,
            PromptTemplate::new(config.system_prompt.clone()),
            config.history_limit,
            config.generation_timeout,
        );
        let queue = InboundQueue::new(config.queue_capacity, config.backpressure);
        let hub = Arc::new(Hub::new(conversation, queue, config.send_timeout));
        let worker_pool = WorkerPool::spawn(
            config.num_workers,
            Arc::clone(&hub),
            config.shutdown_timeout,
        );

        Self {
            config: Arc::new(config),
            hub,
            worker_pool: Arc::new(worker_pool),
            connections: CancellationToken::new(),
            serving: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws/chat", get(chat_socket))
            .route("/health", get(health))
            .layer(
                ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
            )
            .with_state(self.clone())
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }

    /// Initiates a graceful shutdown.
    ///
    /// New connections are refused, queued messages get up to the configured
    /// timeout to be answered, workers are stopped, and finally every open
    /// connection is closed with code 1001.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.serving.store(false, Ordering::Release);
        let drained = self.worker_pool.shutdown().await;

        tracing::info!("Closing {} open connections", self.hub.registry.len());
        self.connections.cancel();
        drained
    }
}

async fn chat_socket(State(service): State<ChatService>, ws: WebSocketUpgrade) -> Response {
    if !service.is_serving() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let id = service.hub.registry.allocate_id();
    let hub = Arc::clone(&service.hub);
    let outbound_buffer = service.config.outbound_buffer_size;
    let shutdown = service.connections.clone();

    ws.on_failed_upgrade(move |e| tracing::warn!("WebSocket upgrade for {id} failed: {e}"))
        .on_upgrade(move |socket| handle_connection(id, socket, hub, outbound_buffer, shutdown))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
    queued: usize,
    workers: usize,
}

async fn health(State(service): State<ChatService>) -> (StatusCode, Json<Health>) {
    let serving = service.is_serving();
    let body = Health {
        status: if serving { "serving" } else { "shutting_down" },
        connections: service.hub.registry.len(),
        queued: service.hub.queue.len(),
        workers: service.worker_pool.len(),
    };
    let code = if serving {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::SleepyEngine;
    use axum::{body::Body, http::Request};
    use core::time::Duration;
    use futures::{SinkExt, StreamExt};
    use huddle_core::{
        EngineError,
        engine::EchoEngine,
        types::{AI_SENDER, Envelope},
    };
    use std::net::SocketAddr;
    use tokio::{net::TcpStream, time::timeout};
    use tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
    };
    use tower::ServiceExt;

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config() -> ServerConfig {
        ServerConfig {
            server_addr: "127.0.0.1:0".into(),
            send_timeout: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        }
    }

    async fn serve(service: &ChatService) -> anyhow::Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = service.router();
        tokio::spawn(async move { axum::serve(listener, router).await });
        Ok(addr)
    }

    async fn connect(addr: SocketAddr) -> anyhow::Result<Client> {
        let (client, _) = connect_async(format!("ws://{addr}/ws/chat")).await?;
        Ok(client)
    }

    async fn wait_for_clients(service: &ChatService, count: usize) {
        for _ in 0..100 {
            if service.hub().registry.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} clients, found {}",
            service.hub().registry.len()
        );
    }

    async fn say(client: &mut Client, sender: &str, content: &str, id: &str) -> anyhow::Result<()> {
        let frame = serde_json::json!({ "sender": sender, "content": content, "id": id });
        client.send(WsMessage::Text(frame.to_string().into())).await?;
        Ok(())
    }

    async fn next_envelope(client: &mut Client) -> anyhow::Result<Envelope> {
        loop {
            let frame = timeout(Duration::from_secs(2), client.next())
                .await?
                .ok_or_else(|| anyhow::anyhow!("connection closed"))??;
            if let WsMessage::Text(text) = frame {
                return Ok(serde_json::from_str(text.as_str())?);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_client_round_trip() -> anyhow::Result<()> {
        let service = ChatService::with_engine(test_config(), Box::new(EchoEngine::default()));
        let addr = serve(&service).await?;
        let mut a = connect(addr).await?;
        wait_for_clients(&service, 1).await;

        say(&mut a, "A", "hi", "m1").await?;

        assert_eq!(
            next_envelope(&mut a).await?,
            Envelope::UserMessage {
                sender: "A".into(),
                content: "hi".into(),
                id: "m1".into(),
            }
        );
        assert_eq!(
            next_envelope(&mut a).await?,
            Envelope::AiResponse {
                sender: AI_SENDER.into(),
                recipient: "A".into(),
                content: "You said: hi".into(),
                id: "m1".into(),
            }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn both_clients_see_each_others_messages() -> anyhow::Result<()> {
        let service = ChatService::with_engine(test_config(), Box::new(EchoEngine::default()));
        let addr = serve(&service).await?;
        let mut a = connect(addr).await?;
        let mut b = connect(addr).await?;
        wait_for_clients(&service, 2).await;

        say(&mut b, "B", "hello room", "b1").await?;

        for client in [&mut a, &mut b] {
            assert!(matches!(
                next_envelope(client).await?,
                Envelope::UserMessage { ref sender, .. } if sender == "B"
            ));
            assert!(matches!(
                next_envelope(client).await?,
                Envelope::AiResponse { ref recipient, ref id, .. } if recipient == "B" && id == "b1"
            ));
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_senders_get_their_own_replies() -> anyhow::Result<()> {
        let service = ChatService::with_engine(test_config(), Box::new(EchoEngine::default()));
        let addr = serve(&service).await?;
        let mut a = connect(addr).await?;
        let mut b = connect(addr).await?;
        wait_for_clients(&service, 2).await;

        let (sent_a, sent_b) = tokio::join!(say(&mut a, "A", "one", "1"), say(&mut b, "B", "two", "2"));
        sent_a?;
        sent_b?;

        for client in [&mut a, &mut b] {
            let mut replies = Vec::new();
            while replies.len() < 2 {
                if let Envelope::AiResponse { recipient, id, .. } = next_envelope(client).await? {
                    replies.push((id, recipient));
                }
            }
            // Reply order follows who entered the exclusive section first.
            replies.sort();
            assert_eq!(
                replies,
                [("1".to_string(), "A".to_string()), ("2".to_string(), "B".to_string())]
            );
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn malformed_frames_keep_the_connection_open() -> anyhow::Result<()> {
        let service = ChatService::with_engine(test_config(), Box::new(EchoEngine::default()));
        let addr = serve(&service).await?;
        let mut a = connect(addr).await?;
        wait_for_clients(&service, 1).await;

        a.send(WsMessage::Text("{not json".into())).await?;
        a.send(WsMessage::Text(r#"{"sender":"A"}"#.into())).await?;
        say(&mut a, "A", "valid", "m1").await?;

        // The first envelope belongs to the valid frame: nothing was queued
        // for the malformed ones.
        assert_eq!(next_envelope(&mut a).await?.id(), "m1");
        assert_eq!(next_envelope(&mut a).await?.id(), "m1");
        assert_eq!(service.hub().registry.len(), 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn history_resets_when_the_room_empties() -> anyhow::Result<()> {
        let prompts = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let seen = Arc::clone(&prompts);
        let engine = move |prompt: &str| -> core::result::Result<String, EngineError> {
            seen.lock().push(prompt.to_string());
            Ok("noted".into())
        };
        let service = ChatService::with_engine(test_config(), Box::new(engine));
        let addr = serve(&service).await?;

        let mut a = connect(addr).await?;
        wait_for_clients(&service, 1).await;
        say(&mut a, "A", "remember the password is swordfish", "a1").await?;
        next_envelope(&mut a).await?;
        next_envelope(&mut a).await?;
        assert_eq!(service.hub().conversation.history_len().await, 1);

        a.close(None).await?;
        drop(a);
        wait_for_clients(&service, 0).await;
        assert_eq!(service.hub().conversation.history_len().await, 0);

        let mut b = connect(addr).await?;
        wait_for_clients(&service, 1).await;
        say(&mut b, "B", "what is the password?", "b1").await?;
        next_envelope(&mut b).await?;
        next_envelope(&mut b).await?;

        let prompts = prompts.lock();
        assert_eq!(prompts.len(), 2);
        assert!(!prompts[1].contains("swordfish"), "{}", prompts[1]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn generations_are_serialized_across_workers() -> anyhow::Result<()> {
        let engine = SleepyEngine::new(Duration::from_millis(50));
        let peak = Arc::clone(&engine.peak);
        let service = ChatService::with_engine(test_config(), Box::new(engine));
        let addr = serve(&service).await?;
        let mut a = connect(addr).await?;
        let mut b = connect(addr).await?;
        wait_for_clients(&service, 2).await;

        for i in 0..3 {
            say(&mut a, "A", "from a", &format!("a{i}")).await?;
            say(&mut b, "B", "from b", &format!("b{i}")).await?;
        }

        let mut responses = 0;
        while responses < 6 {
            if matches!(next_envelope(&mut a).await?, Envelope::AiResponse { .. }) {
                responses += 1;
            }
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(service.hub().conversation.history_len().await, 6);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn health_reports_serving() -> anyhow::Result<()> {
        let service = ChatService::with_engine(test_config(), Box::new(EchoEngine::default()));
        let response = service
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let json: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(json["status"], "serving");
        assert_eq!(json["workers"], 4);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn shutdown_closes_clients_with_going_away() -> anyhow::Result<()> {
        let service = ChatService::with_engine(test_config(), Box::new(EchoEngine::default()));
        let addr = serve(&service).await?;
        let mut a = connect(addr).await?;
        wait_for_clients(&service, 1).await;

        service.shutdown().await?;
        assert!(!service.is_serving());

        let close = loop {
            match timeout(Duration::from_secs(2), a.next()).await? {
                Some(Ok(WsMessage::Close(frame))) => break frame,
                Some(Ok(_)) => continue,
                other => anyhow::bail!("expected close frame, got {other:?}"),
            }
        };
        let close = close.ok_or_else(|| anyhow::anyhow!("close frame without code"))?;
        assert_eq!(u16::from(close.code), huddle_core::error::CLOSE_GOING_AWAY);

        let response = service
            .router()
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        assert!(connect(addr).await.is_err());
        Ok(())
    }
}
