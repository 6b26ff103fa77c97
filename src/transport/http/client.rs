use std::{fmt, marker::PhantomData, sync::Arc};

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{messages_path, poll_path, session_path, CONTENT_TYPE_MSGPACK};
use crate::{
    channel::{report_failure, ExceptionCallback, MessageChannel, SharedChannel, SharedReceiver},
    codec::{self, WireMessage},
    config::HttpClientConfig,
    error::ChannelError,
};

struct Outbound {
    frame: Bytes,
    on_error: Option<ExceptionCallback>,
}

/// A channel posting messages to an HTTP broker.
pub struct HttpChannel<M> {
    queue: mpsc::UnboundedSender<Outbound>,
    phantom: PhantomData<fn(M)>,
}

impl<M> Clone for HttpChannel<M> {
    fn clone(&self) -> Self {
        HttpChannel {
            queue: self.queue.clone(),
            phantom: PhantomData,
        }
    }
}

impl<M> fmt::Debug for HttpChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpChannel")
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

impl<M: WireMessage> MessageChannel<M> for HttpChannel<M> {
    fn send(&self, message: M, on_error: Option<ExceptionCallback>) {
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(err) => return report_failure(on_error, err.into()),
        };
        if let Err(mpsc::error::SendError(outbound)) = self.queue.send(Outbound { frame, on_error }) {
            report_failure(outbound.on_error, ChannelError::ConnectionClosed);
        }
    }
}

/// A long-poll session with an [`HttpBrokerServer`](super::HttpBrokerServer).
///
/// Outbound messages are batched into as few POST requests as possible while a request is in flight.
/// Messages queued by the server are fetched by a poll loop and handed to the receiver together with
/// a channel back to the server. The session is opened by the first POST; if the server forgot it,
/// the receiver is told through
/// [`MessageReceiver::on_disconnect`](crate::channel::MessageReceiver::on_disconnect) and a new one is
/// opened.
///
/// Dropping the client stops both loops; [`close`](Self::close) also deletes the session.
pub struct HttpBrokerClient<M: 'static> {
    session_id: String,
    channel: HttpChannel<M>,
    http: reqwest::Client,
    session_url: String,
    receiver: SharedReceiver<M>,
    shutdown: CancellationToken,
    send_handle: JoinHandle<()>,
    poll_handle: JoinHandle<()>,
}

impl<M: WireMessage> HttpBrokerClient<M> {
    /// Opens a new session with the broker at `config.url`.
    pub fn connect(config: &HttpClientConfig, receiver: SharedReceiver<M>) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ChannelError::Http(err.to_string()))?;

        let session_id = Uuid::new_v4().to_string();
        let base = config.url.trim_end_matches('/');
        let broker = config.broker_id.as_str();
        let messages_url = format!("{base}{}", messages_path(broker, &session_id));
        let poll_url = format!("{base}{}", poll_path(broker, &session_id));
        let session_url = format!("{base}{}", session_path(broker, &session_id));

        let (queue, queue_rx) = mpsc::unbounded_channel();
        let channel = HttpChannel {
            queue,
            phantom: PhantomData,
        };

        let shutdown = CancellationToken::new();
        let send_handle = tokio::spawn(send_loop(
            http.clone(),
            messages_url.clone(),
            queue_rx,
            shutdown.clone(),
        ));
        let poll_handle = tokio::spawn(poll_loop(
            PollUrls {
                poll: poll_url,
                open: messages_url,
            },
            http.clone(),
            config.poll_interval,
            receiver.clone(),
            Arc::new(channel.clone()),
        ));
        debug!(%session_id, url = %config.url, "http broker session opened");

        Ok(HttpBrokerClient {
            session_id,
            channel,
            http,
            session_url,
            receiver,
            shutdown,
            send_handle,
            poll_handle,
        })
    }

    /// A channel to the server.
    pub fn channel(&self) -> SharedChannel<M> {
        Arc::new(self.channel.clone())
    }

    /// The id identifying this client's session on the server.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stops polling and asks the server to drop the session.
    ///
    /// A POST in flight is allowed to finish. Messages not yet posted, and later sends on channels of
    /// this client, fail with [`ChannelError::ConnectionClosed`].
    pub async fn close(mut self) {
        self.poll_handle.abort();
        self.shutdown.cancel();
        if let Err(err) = (&mut self.send_handle).await {
            warn!(session_id = %self.session_id, error = %err, "send loop failed");
        }
        match self.http.delete(&self.session_url).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => debug!(session_id = %self.session_id, status = %resp.status(), "session close refused"),
            Err(err) => debug!(session_id = %self.session_id, error = %err, "session close failed"),
        }
    }
}

impl<M: 'static> Drop for HttpBrokerClient<M> {
    fn drop(&mut self) {
        self.poll_handle.abort();
        self.shutdown.cancel();
        self.receiver.on_disconnect();
        debug!(session_id = %self.session_id, "http broker session closed");
    }
}

impl<M: 'static> fmt::Debug for HttpBrokerClient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpBrokerClient")
            .field("session_id", &self.session_id)
            .finish()
    }
}

async fn send_loop(
    http: reqwest::Client,
    url: String,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) {
    let mut batch = Vec::new();
    loop {
        let first = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            first = queue.recv() => match first {
                Some(first) => first,
                None => break,
            },
        };
        batch.push(first);
        while let Ok(next) = queue.try_recv() {
            batch.push(next);
        }

        let (frames, callbacks): (Vec<_>, Vec<_>) = batch
            .drain(..)
            .map(|Outbound { frame, on_error }| (frame, on_error))
            .unzip();
        trace!(count = frames.len(), "posting messages");

        let failure = match codec::encode_frames(frames) {
            Ok(body) => {
                let resp = http
                    .post(&url)
                    .header(CONTENT_TYPE, CONTENT_TYPE_MSGPACK)
                    .body(body)
                    .send()
                    .await;
                match resp {
                    Ok(resp) if resp.status().is_success() => None,
                    Ok(resp) => Some(ChannelError::HttpStatus(resp.status().as_u16())),
                    Err(err) => Some(ChannelError::Http(err.to_string())),
                }
            }
            Err(err) => Some(ChannelError::Codec(err)),
        };

        if let Some(failure) = failure {
            warn!(error = %failure, "failed to post messages");
            let reason = failure.to_string();
            for on_error in callbacks {
                let err = match &failure {
                    ChannelError::HttpStatus(status) => ChannelError::HttpStatus(*status),
                    _ => ChannelError::Http(reason.clone()),
                };
                report_failure(on_error, err);
            }
        }
    }

    queue.close();
    while let Ok(Outbound { on_error, .. }) = queue.try_recv() {
        report_failure(on_error, ChannelError::ConnectionClosed);
    }
}

struct PollUrls {
    poll: String,
    open: String,
}

async fn poll_loop<M: WireMessage>(
    urls: PollUrls,
    http: reqwest::Client,
    interval: std::time::Duration,
    receiver: SharedReceiver<M>,
    reply_channel: SharedChannel<M>,
) {
    let mut open = false;
    loop {
        match poll_once::<M>(&http, &urls.poll).await {
            Ok(messages) => {
                open = true;
                for message in messages {
                    receiver.on_message(message, reply_channel.clone());
                }
            }
            Err(ChannelError::HttpStatus(404)) => {
                if open {
                    warn!("server dropped the session");
                    receiver.on_disconnect();
                    open = false;
                }
                match open_session(&http, &urls.open).await {
                    Ok(()) => trace!("opened session"),
                    Err(ChannelError::HttpStatus(404)) => {
                        info!(url = %urls.open, "broker not served, polling stopped");
                        return;
                    }
                    Err(err) => warn!(error = %err, "failed to open session"),
                }
            }
            Err(err) => warn!(error = %err, "poll failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

async fn open_session(http: &reqwest::Client, url: &str) -> Result<(), ChannelError> {
    let resp = http
        .post(url)
        .header(CONTENT_TYPE, CONTENT_TYPE_MSGPACK)
        .body(Bytes::new())
        .send()
        .await
        .map_err(|err| ChannelError::Http(err.to_string()))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(ChannelError::HttpStatus(resp.status().as_u16()))
    }
}

async fn poll_once<M: WireMessage>(http: &reqwest::Client, url: &str) -> Result<Vec<M>, ChannelError> {
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|err| ChannelError::Http(err.to_string()))?;
    if !resp.status().is_success() {
        return Err(ChannelError::HttpStatus(resp.status().as_u16()));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|err| ChannelError::Http(err.to_string()))?;

    codec::decode_frames(&body)?
        .iter()
        .map(|frame| codec::decode::<M>(frame).map_err(ChannelError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::{
        broker::BrokerId,
        channel::{receiver_fn, MessageReceiver},
        config::HttpServerConfig,
        transport::http::HttpBrokerServer,
    };

    #[tokio::test]
    async fn client_and_server_exchange_messages() -> Result<(), Box<dyn std::error::Error>> {
        let server = HttpBrokerServer::<String>::bind(
            HttpServerConfig::default(),
            Arc::new(receiver_fn(|msg: String, reply: SharedChannel<String>| {
                reply.send(format!("{msg}!"), None)
            })),
        )
        .await?;

        let (tx, mut rx) = unbounded_channel();
        let client = HttpBrokerClient::<String>::connect(
            &HttpClientConfig::new(server.url()),
            Arc::new(receiver_fn(move |msg: String, _reply: SharedChannel<String>| {
                let _ = tx.send(msg);
            })),
        )?;

        client.channel().send("hello".to_string(), None);
        let reply = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(reply.as_deref(), Some("hello!"));
        assert_eq!(server.session_count(), 1);

        client.close().await;
        assert_eq!(server.session_count(), 0);
        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn wrong_broker_fails_send() -> Result<(), Box<dyn std::error::Error>> {
        let server = HttpBrokerServer::<String>::bind(
            HttpServerConfig::default(),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;

        let client = HttpBrokerClient::<String>::connect(
            &HttpClientConfig::new(server.url()).broker_id(BrokerId::from_static("elsewhere")),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )?;

        let (tx, mut rx) = unbounded_channel();
        client.channel().send(
            "lost".to_string(),
            Some(Box::new(move |err| {
                let _ = tx.send(err);
            })),
        );
        let err = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert!(matches!(err, Some(ChannelError::HttpStatus(404))));

        client.close().await;
        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn close_fails_unposted_messages() -> Result<(), Box<dyn std::error::Error>> {
        let server = HttpBrokerServer::<String>::bind(
            HttpServerConfig::default(),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;
        let client = HttpBrokerClient::<String>::connect(
            &HttpClientConfig::new(server.url()),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )?;

        let (tx, mut rx) = unbounded_channel();
        let channel = client.channel();
        for i in 0..3 {
            let tx = tx.clone();
            channel.send(
                format!("queued-{i}"),
                Some(Box::new(move |err| {
                    let _ = tx.send(err);
                })),
            );
        }
        drop(tx);
        client.close().await;

        let mut failures = Vec::new();
        while let Some(err) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await? {
            failures.push(err);
        }
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|err| matches!(err, ChannelError::ConnectionClosed)));

        server.shutdown().await;
        Ok(())
    }

    struct Recorder {
        messages: mpsc::UnboundedSender<String>,
        disconnects: mpsc::UnboundedSender<()>,
    }

    impl MessageReceiver<String> for Recorder {
        fn on_message(&self, message: String, _reply_channel: SharedChannel<String>) {
            let _ = self.messages.send(message);
        }

        fn on_disconnect(&self) {
            let _ = self.disconnects.send(());
        }
    }

    #[tokio::test]
    async fn forgotten_session_is_reported_and_reopened() -> Result<(), Box<dyn std::error::Error>> {
        let server = HttpBrokerServer::<String>::bind(
            HttpServerConfig::default(),
            Arc::new(receiver_fn(|msg: String, reply: SharedChannel<String>| {
                reply.send(format!("{msg}!"), None)
            })),
        )
        .await?;
        let (messages, mut messages_rx) = unbounded_channel();
        let (disconnects, mut disconnects_rx) = unbounded_channel();
        let client = HttpBrokerClient::<String>::connect(
            &HttpClientConfig::new(server.url()),
            Arc::new(Recorder {
                messages,
                disconnects,
            }),
        )?;

        client.channel().send("first".to_string(), None);
        let reply = tokio::time::timeout(Duration::from_secs(5), messages_rx.recv()).await?;
        assert_eq!(reply.as_deref(), Some("first!"));

        let resp = reqwest::Client::new()
            .delete(format!("{}{}", server.url(), session_path("cap", client.session_id())))
            .send()
            .await?;
        assert_eq!(resp.status(), 204);

        let disconnected = tokio::time::timeout(Duration::from_secs(5), disconnects_rx.recv()).await?;
        assert_eq!(disconnected, Some(()));

        client.channel().send("second".to_string(), None);
        let reply = tokio::time::timeout(Duration::from_secs(5), messages_rx.recv()).await?;
        assert_eq!(reply.as_deref(), Some("second!"));

        client.close().await;
        server.shutdown().await;
        Ok(())
    }
}
