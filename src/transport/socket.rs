//! TCP transport carrying length-delimited MessagePack frames.
//!
//! A [`SocketServer`] accepts connections and a [`SocketClient`] opens one. Both sides of a connection
//! behave the same way: inbound frames are decoded and handed to the receiver together with a channel
//! back over the same connection, and outbound messages are encoded on `send` and queued for a single
//! writer, so messages on one connection are written in the order they were sent.
//!
//! The server serves at most [`SocketConfig::max_connections`] connections at once; further clients
//! wait in the listen backlog until a connection closes.
//!
//! When a connection ends, messages still waiting in its queue are failed with
//! [`ChannelError::ConnectionClosed`]. A [`SocketClient`] also tells its receiver through
//! [`MessageReceiver::on_disconnect`](crate::channel::MessageReceiver::on_disconnect).

use std::{fmt, marker::PhantomData, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{
        mpsc::{self, error::TrySendError},
        Semaphore,
    },
    task::{JoinHandle, JoinSet},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    channel::{report_failure, ExceptionCallback, MessageChannel, SharedChannel, SharedReceiver},
    codec::{self, WireMessage},
    config::SocketConfig,
    error::ChannelError,
};

struct Outbound {
    frame: Bytes,
    on_error: Option<ExceptionCallback>,
}

/// A channel writing to one TCP connection.
pub struct SocketChannel<M> {
    peer: SocketAddr,
    queue: mpsc::Sender<Outbound>,
    phantom: PhantomData<fn(M)>,
}

impl<M> SocketChannel<M> {
    /// The address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns `true` once the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl<M> Clone for SocketChannel<M> {
    fn clone(&self) -> Self {
        SocketChannel {
            peer: self.peer,
            queue: self.queue.clone(),
            phantom: PhantomData,
        }
    }
}

impl<M> fmt::Debug for SocketChannel<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketChannel")
            .field("peer", &self.peer)
            .finish()
    }
}

impl<M: WireMessage> MessageChannel<M> for SocketChannel<M> {
    fn send(&self, message: M, on_error: Option<ExceptionCallback>) {
        let frame = match codec::encode(&message) {
            Ok(frame) => frame,
            Err(err) => return report_failure(on_error, err.into()),
        };

        match self.queue.try_send(Outbound { frame, on_error }) {
            Ok(()) => {}
            Err(TrySendError::Full(outbound)) => {
                report_failure(outbound.on_error, ChannelError::MailboxFull)
            }
            Err(TrySendError::Closed(outbound)) => {
                report_failure(outbound.on_error, ChannelError::ConnectionClosed)
            }
        }
    }
}

/// Splits a connected stream into a channel and the task driving it.
fn connection<M: WireMessage>(
    stream: TcpStream,
    peer: SocketAddr,
    receiver: SharedReceiver<M>,
    send_queue_capacity: usize,
    shutdown: CancellationToken,
) -> (SocketChannel<M>, impl std::future::Future<Output = ()> + Send + 'static) {
    let (queue, mut queue_rx) = mpsc::channel::<Outbound>(send_queue_capacity.max(1));
    let channel = SocketChannel {
        peer,
        queue,
        phantom: PhantomData,
    };
    let reply_channel: SharedChannel<M> = Arc::new(channel.clone());

    let task = async move {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let mut frames_in = FramedRead::new(read_half, codec::frame_codec());
        let mut frames_out = FramedWrite::new(write_half, codec::frame_codec());

        let write = async {
            while let Some(Outbound { frame, on_error }) = queue_rx.recv().await {
                if let Err(err) = frames_out.send(frame).await {
                    warn!(%peer, error = %err, "failed to write frame");
                    report_failure(on_error, err.into());
                    break;
                }
            }
        };

        let read = async move {
            while let Some(frame) = frames_in.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%peer, error = %err, "failed to read frame");
                        break;
                    }
                };
                match codec::decode::<M>(&frame) {
                    Ok(message) => receiver.on_message(message, reply_channel.clone()),
                    Err(err) => warn!(%peer, error = %err, "dropping undecodable frame"),
                }
            }
        };

        // Shutdown wins over frames still waiting to be written.
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => trace!(%peer, "closing connection"),
            _ = write => {}
            _ = read => {}
        }

        queue_rx.close();
        let mut unsent = 0usize;
        while let Ok(Outbound { on_error, .. }) = queue_rx.try_recv() {
            unsent += 1;
            report_failure(on_error, ChannelError::ConnectionClosed);
        }
        debug!(%peer, unsent, "connection closed");
    };

    (channel, task)
}

/// Accepts TCP connections and serves each one.
pub struct SocketServer<M> {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    phantom: PhantomData<fn(M)>,
}

impl<M: WireMessage> SocketServer<M> {
    /// Binds to `config.host:config.port` and starts accepting connections.
    pub async fn bind(config: &SocketConfig, receiver: SharedReceiver<M>) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "socket server listening");

        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            receiver,
            Arc::new(Semaphore::new(config.max_connections.max(1))),
            config.send_queue_capacity,
            shutdown.clone(),
        ));

        Ok(SocketServer {
            local_addr,
            shutdown,
            phantom: PhantomData,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes all open ones.
    pub fn shutdown(self) {
        self.shutdown.cancel();
        info!(local_addr = %self.local_addr, "socket server shut down");
    }
}

impl<M> fmt::Debug for SocketServer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

async fn accept_loop<M: WireMessage>(
    listener: TcpListener,
    receiver: SharedReceiver<M>,
    permits: Arc<Semaphore>,
    send_queue_capacity: usize,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();
    'accept: loop {
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let (stream, peer) = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => break accepted,
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                },
                Some(res) = connections.join_next() => log_join_error(res),
                _ = shutdown.cancelled() => break 'accept,
            }
        };

        trace!(%peer, "accepted connection");
        let (_channel, task) = connection(
            stream,
            peer,
            receiver.clone(),
            send_queue_capacity,
            shutdown.clone(),
        );
        connections.spawn(async move {
            let _permit = permit;
            task.await;
        });
    }

    drop(listener);
    while let Some(res) = connections.join_next().await {
        log_join_error(res);
    }
}

fn log_join_error(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        if err.is_panic() {
            error!(error = %err, "connection task panicked");
        }
    }
}

/// A single outbound TCP connection.
pub struct SocketClient<M> {
    channel: SocketChannel<M>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl<M: WireMessage> SocketClient<M> {
    /// Connects to `config.host:config.port`.
    ///
    /// Messages sent by the server are handed to `receiver`, which is told once the connection is
    /// lost.
    pub async fn connect(config: &SocketConfig, receiver: SharedReceiver<M>) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(config.address()).await?;
        let peer = stream.peer_addr()?;
        let shutdown = CancellationToken::new();
        let (channel, task) = connection(
            stream,
            peer,
            receiver.clone(),
            config.send_queue_capacity,
            shutdown.clone(),
        );
        let handle = tokio::spawn(async move {
            task.await;
            receiver.on_disconnect();
        });
        debug!(%peer, "socket client connected");

        Ok(SocketClient {
            channel,
            shutdown,
            handle,
        })
    }

    /// A channel to the server.
    pub fn channel(&self) -> SharedChannel<M> {
        Arc::new(self.channel.clone())
    }

    /// The server's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.channel.peer
    }

    /// Returns `true` while the connection is open.
    pub fn is_connected(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Closes the connection, failing messages not yet written.
    pub async fn close(self) {
        self.shutdown.cancel();
        if let Err(err) = self.handle.await {
            error!(peer = %self.channel.peer, error = %err, "connection task failed");
        }
    }
}

impl<M> fmt::Debug for SocketClient<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketClient")
            .field("peer", &self.channel.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::unbounded_channel;

    use super::*;
    use crate::channel::{receiver_fn, MessageReceiver};

    fn local_config() -> SocketConfig {
        SocketConfig::default().port(0)
    }

    #[tokio::test]
    async fn client_and_server_exchange_frames() -> Result<(), Box<dyn std::error::Error>> {
        let server = SocketServer::<String>::bind(
            &local_config(),
            Arc::new(receiver_fn(|msg: String, reply: SharedChannel<String>| {
                reply.send(msg.to_uppercase(), None)
            })),
        )
        .await?;

        let (tx, mut rx) = unbounded_channel();
        let client = SocketClient::<String>::connect(
            &local_config().port(server.local_addr().port()),
            Arc::new(receiver_fn(move |msg: String, _reply: SharedChannel<String>| {
                let _ = tx.send(msg);
            })),
        )
        .await?;

        let channel = client.channel();
        channel.send("first".to_string(), None);
        channel.send("second".to_string(), None);

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(first.as_deref(), Some("FIRST"));
        assert_eq!(second.as_deref(), Some("SECOND"));

        client.close().await;
        server.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn closed_connection_reports_failure() -> Result<(), Box<dyn std::error::Error>> {
        let server = SocketServer::<String>::bind(
            &local_config(),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;
        let client = SocketClient::<String>::connect(
            &local_config().port(server.local_addr().port()),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;

        let channel = client.channel();
        client.close().await;

        let (tx, mut rx) = unbounded_channel();
        channel.send(
            "lost".to_string(),
            Some(Box::new(move |err| {
                let _ = tx.send(err);
            })),
        );
        let err = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert!(matches!(err, Some(ChannelError::ConnectionClosed)));

        server.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn close_fails_unsent_messages() -> Result<(), Box<dyn std::error::Error>> {
        let server = SocketServer::<String>::bind(
            &local_config(),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;
        let client = SocketClient::<String>::connect(
            &local_config().port(server.local_addr().port()),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;

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

        server.shutdown();
        Ok(())
    }

    struct DisconnectSignal(tokio::sync::mpsc::UnboundedSender<()>);

    impl MessageReceiver<String> for DisconnectSignal {
        fn on_message(&self, _message: String, _reply_channel: SharedChannel<String>) {}

        fn on_disconnect(&self) {
            let _ = self.0.send(());
        }
    }

    #[tokio::test]
    async fn server_shutdown_disconnects_client() -> Result<(), Box<dyn std::error::Error>> {
        let server = SocketServer::<String>::bind(
            &local_config(),
            Arc::new(receiver_fn(|_msg: String, _reply: SharedChannel<String>| {})),
        )
        .await?;
        let (tx, mut rx) = unbounded_channel();
        let client = SocketClient::<String>::connect(
            &local_config().port(server.local_addr().port()),
            Arc::new(DisconnectSignal(tx)),
        )
        .await?;
        assert!(client.is_connected());

        server.shutdown();
        let disconnected = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
        assert_eq!(disconnected, Some(()));
        Ok(())
    }
}
