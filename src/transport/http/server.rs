use std::{
    fmt,
    marker::PhantomData,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use dashmap::DashMap;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::CONTENT_TYPE_MSGPACK;
use crate::{
    channel::{report_failure, ExceptionCallback, MessageChannel, SharedChannel, SharedReceiver},
    codec::{self, WireMessage},
    config::HttpServerConfig,
    error::ChannelError,
};

struct Outbound {
    frame: Bytes,
    on_error: Option<ExceptionCallback>,
}

struct Session {
    queue: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<mpsc::UnboundedReceiver<Outbound>>,
    closed: CancellationToken,
    last_seen_ms: AtomicU64,
}

impl Session {
    fn new(now_ms: u64) -> Self {
        let (queue, pending) = mpsc::unbounded_channel();
        Session {
            queue,
            pending: Mutex::new(pending),
            closed: CancellationToken::new(),
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_seen_ms.fetch_max(now_ms, Ordering::Relaxed);
    }

    fn is_idle(&self, now_ms: u64, idle_ms: u64) -> bool {
        // A held queue lock means a poll is waiting.
        now_ms.saturating_sub(self.last_seen_ms.load(Ordering::Relaxed)) >= idle_ms
            && self.pending.try_lock().is_ok()
    }

    /// Refuses further messages and fails the ones nobody fetched. Returns how many were failed.
    async fn close(&self) -> usize {
        self.closed.cancel();
        let mut pending = self.pending.lock().await;
        pending.close();
        let mut unsent = 0;
        while let Ok(Outbound { on_error, .. }) = pending.try_recv() {
            unsent += 1;
            report_failure(on_error, ChannelError::ConnectionClosed);
        }
        unsent
    }
}

/// A channel queueing messages for one long-poll session.
///
/// Sends fail with [`ChannelError::ConnectionClosed`] once the session was closed or expired.
pub struct SessionChannel<M> {
    session_id: String,
    session: Arc<Session>,
    phantom: PhantomData<fn(M)>,
}

impl<M> SessionChannel<M> {
    /// The session this channel delivers to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl<M> fmt::Debug for SessionChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionChannel")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl<M: WireMessage> MessageChannel<M> for SessionChannel<M> {
    fn send(&self, message: M, on_error: Option<ExceptionCallback>) {
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(err) => return report_failure(on_error, err.into()),
        };
        if let Err(mpsc::error::SendError(outbound)) = self.session.queue.send(Outbound { frame, on_error }) {
            report_failure(outbound.on_error, ChannelError::ConnectionClosed);
        }
    }
}

struct ServerState<M> {
    config: HttpServerConfig,
    receiver: SharedReceiver<M>,
    sessions: DashMap<String, Arc<Session>>,
    started: Instant,
}

impl<M: WireMessage> ServerState<M> {
    fn serves(&self, broker: &str) -> bool {
        self.config.broker_id.as_str() == broker
    }

    fn now_ms(&self) -> u64 {
        duration_ms(self.started.elapsed())
    }

    fn open_session(&self, session_id: &str) -> Arc<Session> {
        let now_ms = self.now_ms();
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id, "opened long-poll session");
                Arc::new(Session::new(now_ms))
            })
            .value()
            .clone();
        session.touch(now_ms);
        session
    }

    fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    fn channel(&self, session_id: &str, session: Arc<Session>) -> SharedChannel<M> {
        Arc::new(SessionChannel {
            session_id: session_id.to_string(),
            session,
            phantom: PhantomData,
        })
    }

    async fn close_session(&self, session_id: &str) -> bool {
        match self.sessions.remove(session_id) {
            Some((_, session)) => {
                let unsent = session.close().await;
                debug!(session_id, unsent, "closed long-poll session");
                true
            }
            None => false,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serves one broker over HTTP long-polling.
///
/// A session opens with the first message its client posts and ends when the client deletes it or
/// stops polling for [`HttpServerConfig::session_idle_timeout`].
pub struct HttpBrokerServer<M> {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
    expiry: JoinHandle<()>,
    state: Arc<ServerState<M>>,
}

impl<M: WireMessage> HttpBrokerServer<M> {
    /// Binds to `config.bind` and starts serving.
    pub async fn bind(
        config: HttpServerConfig,
        receiver: SharedReceiver<M>,
    ) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;
        let state = Arc::new(ServerState {
            config,
            receiver,
            sessions: DashMap::new(),
            started: Instant::now(),
        });

        let router = Router::new()
            .route("/:broker/messages/:session", post(post_messages::<M>))
            .route("/:broker/poll/:session", get(poll_messages::<M>))
            .route("/:broker/sessions/:session", delete(close_session::<M>))
            .with_state(state.clone());

        info!(%local_addr, broker = %state.config.broker_id, "http broker listening");
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, router).await {
                error!(error = %err, "http broker stopped");
            }
        });
        let expiry = tokio::spawn(expire_sessions(state.clone()));

        Ok(HttpBrokerServer {
            local_addr,
            handle,
            expiry,
            state,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The base url clients connect to.
    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// A channel to an open session.
    pub fn channel(&self, session_id: &str) -> Option<SharedChannel<M>> {
        self.state
            .session(session_id)
            .map(|session| self.state.channel(session_id, session))
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    /// Stops serving and closes every session, failing the messages still queued for them.
    pub async fn shutdown(self) {
        self.handle.abort();
        self.expiry.abort();

        let session_ids: Vec<String> = self.state.sessions.iter().map(|entry| entry.key().clone()).collect();
        for session_id in session_ids {
            self.state.close_session(&session_id).await;
        }
        info!(local_addr = %self.local_addr, "http broker shut down");
    }
}

impl<M> Drop for HttpBrokerServer<M> {
    fn drop(&mut self) {
        self.handle.abort();
        self.expiry.abort();
    }
}

impl<M> fmt::Debug for HttpBrokerServer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBrokerServer")
            .field("local_addr", &self.local_addr)
            .field("broker_id", &self.state.config.broker_id)
            .finish()
    }
}

async fn expire_sessions<M: WireMessage>(state: Arc<ServerState<M>>) {
    let idle = state.config.session_idle_timeout;
    let mut interval = tokio::time::interval((idle / 2).max(Duration::from_millis(10)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now_ms = state.now_ms();
        let idle_ms = duration_ms(idle);
        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle(now_ms, idle_ms))
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in expired {
            if state.close_session(&session_id).await {
                info!(%session_id, "expired idle long-poll session");
            }
        }
    }
}

async fn post_messages<M: WireMessage>(
    State(state): State<Arc<ServerState<M>>>,
    Path((broker, session_id)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    if !state.serves(&broker) {
        return StatusCode::NOT_FOUND;
    }

    let frames = match codec::decode_frames(&body) {
        Ok(frames) => frames,
        Err(err) => {
            warn!(%session_id, error = %err, "rejecting malformed message body");
            return StatusCode::BAD_REQUEST;
        }
    };
    let mut messages = Vec::with_capacity(frames.len());
    for frame in frames {
        match codec::decode::<M>(&frame) {
            Ok(message) => messages.push(message),
            Err(err) => {
                warn!(%session_id, error = %err, "rejecting undecodable message");
                return StatusCode::BAD_REQUEST;
            }
        }
    }

    let session = state.open_session(&session_id);
    let reply_channel = state.channel(&session_id, session);
    for message in messages {
        state.receiver.on_message(message, reply_channel.clone());
    }
    StatusCode::ACCEPTED
}

async fn poll_messages<M: WireMessage>(
    State(state): State<Arc<ServerState<M>>>,
    Path((broker, session_id)): Path<(String, String)>,
) -> Response {
    if !state.serves(&broker) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(session) = state.session(&session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    session.touch(state.now_ms());

    let mut pending = session.pending.lock().await;
    let first = tokio::select! {
        biased;
        _ = session.closed.cancelled() => None,
        first = tokio::time::timeout(state.config.poll_timeout, pending.recv()) => first.ok().flatten(),
    };
    let mut frames = Vec::new();
    if let Some(Outbound { frame, .. }) = first {
        frames.push(frame);
        while frames.len() < state.config.max_batch {
            match pending.try_recv() {
                Ok(Outbound { frame, .. }) => frames.push(frame),
                Err(_) => break,
            }
        }
    }
    drop(pending);
    session.touch(state.now_ms());

    match codec::encode_frames(frames) {
        Ok(body) => ([(CONTENT_TYPE, CONTENT_TYPE_MSGPACK)], body).into_response(),
        Err(err) => {
            error!(%session_id, error = %err, "failed to encode poll response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn close_session<M: WireMessage>(
    State(state): State<Arc<ServerState<M>>>,
    Path((broker, session_id)): Path<(String, String)>,
) -> StatusCode {
    if !state.serves(&broker) {
        return StatusCode::NOT_FOUND;
    }
    state.close_session(&session_id).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        broker::BrokerId,
        channel::receiver_fn,
        transport::http::{messages_path, poll_path, session_path},
    };

    async fn echo_server(config: HttpServerConfig) -> Result<HttpBrokerServer<String>, ChannelError> {
        HttpBrokerServer::<String>::bind(
            config,
            Arc::new(receiver_fn(|msg: String, reply: SharedChannel<String>| {
                reply.send(format!("{msg}!"), None)
            })),
        )
        .await
    }

    async fn post(
        http: &reqwest::Client,
        server: &HttpBrokerServer<String>,
        path: String,
        messages: &[&str],
    ) -> Result<reqwest::StatusCode, Box<dyn std::error::Error>> {
        let frames = messages
            .iter()
            .map(|msg| codec::encode(&msg.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        let resp = http
            .post(format!("{}{path}", server.url()))
            .body(codec::encode_frames(frames)?)
            .send()
            .await?;
        Ok(resp.status())
    }

    fn failure_recorder() -> (
        impl Fn() -> Option<ExceptionCallback>,
        mpsc::UnboundedReceiver<ChannelError>,
    ) {
        let (tx, rx) = unbounded_channel();
        let callback = move || -> Option<ExceptionCallback> {
            let tx = tx.clone();
            Some(Box::new(move |err| {
                let _ = tx.send(err);
            }))
        };
        (callback, rx)
    }

    #[tokio::test]
    async fn idle_poll_returns_empty_after_timeout() -> Result<(), Box<dyn std::error::Error>> {
        let server = echo_server(HttpServerConfig::default().poll_timeout(Duration::from_millis(50))).await?;
        let http = reqwest::Client::new();

        assert_eq!(post(&http, &server, messages_path("cap", "s1"), &[]).await?, 202);
        let resp = http.get(format!("{}{}", server.url(), poll_path("cap", "s1"))).send().await?;
        assert!(resp.status().is_success());
        assert!(codec::decode_frames(&resp.bytes().await?)?.is_empty());

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn polls_never_open_sessions() -> Result<(), Box<dyn std::error::Error>> {
        let server = echo_server(HttpServerConfig::default()).await?;
        let http = reqwest::Client::new();

        for i in 0..5 {
            let resp = http
                .get(format!("{}{}", server.url(), poll_path("cap", &format!("stranger-{i}"))))
                .send()
                .await?;
            assert_eq!(resp.status(), 404);
        }
        assert_eq!(server.session_count(), 0);
        assert!(server.channel("stranger-0").is_none());

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_broker_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let server = echo_server(HttpServerConfig::default().broker_id(BrokerId::from_static("home"))).await?;
        let http = reqwest::Client::new();

        assert_eq!(post(&http, &server, messages_path("elsewhere", "s1"), &["hi"]).await?, 404);
        let resp = http.get(format!("{}{}", server.url(), poll_path("elsewhere", "s1"))).send().await?;
        assert_eq!(resp.status(), 404);
        let resp = http.delete(format!("{}{}", server.url(), session_path("elsewhere", "s1"))).send().await?;
        assert_eq!(resp.status(), 404);
        assert_eq!(server.session_count(), 0);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn deleted_session_refuses_replies() -> Result<(), Box<dyn std::error::Error>> {
        let server = echo_server(HttpServerConfig::default()).await?;
        let http = reqwest::Client::new();
        let (on_error, mut failures) = failure_recorder();

        assert_eq!(post(&http, &server, messages_path("cap", "s1"), &[]).await?, 202);
        let channel = server.channel("s1").ok_or("session not open")?;
        channel.send("queued".to_string(), on_error());

        let resp = http.delete(format!("{}{}", server.url(), session_path("cap", "s1"))).send().await?;
        assert_eq!(resp.status(), 204);
        assert_eq!(server.session_count(), 0);

        channel.send("late".to_string(), on_error());
        for _ in 0..2 {
            let err = tokio::time::timeout(Duration::from_secs(5), failures.recv()).await?;
            assert!(matches!(err, Some(ChannelError::ConnectionClosed)));
        }

        let resp = http.get(format!("{}{}", server.url(), poll_path("cap", "s1"))).send().await?;
        assert_eq!(resp.status(), 404);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn idle_sessions_expire() -> Result<(), Box<dyn std::error::Error>> {
        let server = echo_server(
            HttpServerConfig::default()
                .poll_timeout(Duration::from_millis(20))
                .session_idle_timeout(Duration::from_millis(100)),
        )
        .await?;
        let http = reqwest::Client::new();
        let (on_error, mut failures) = failure_recorder();

        assert_eq!(post(&http, &server, messages_path("cap", "s1"), &[]).await?, 202);
        let channel = server.channel("s1").ok_or("session not open")?;
        channel.send("never fetched".to_string(), on_error());

        let err = tokio::time::timeout(Duration::from_secs(5), failures.recv()).await?;
        assert!(matches!(err, Some(ChannelError::ConnectionClosed)));
        assert_eq!(server.session_count(), 0);

        server.shutdown().await;
        Ok(())
    }
}
