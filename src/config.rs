//! Configuration of transports and the invocation server.
//!
//! Every config has sensible defaults, builder-style setters, and can be deserialized with serde
//! (durations are given in milliseconds).

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::broker::BrokerId;

const DEFAULT_PORT: u16 = 5660;
const DEFAULT_BROKER: BrokerId = BrokerId::from_static("cap");

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration of the TCP socket transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Host to bind to (server) or connect to (client).
    pub host: String,
    /// Port to bind to (server) or connect to (client). `0` binds an ephemeral port.
    pub port: u16,
    /// Maximum number of connections a server serves at once.
    pub max_connections: usize,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
}

impl SocketConfig {
    /// Sets the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the maximum number of concurrently served connections.
    pub fn max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Sets the capacity of each connection's outbound queue.
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }

    /// The `host:port` address string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_connections: 64,
            send_queue_capacity: 1000,
        }
    }
}

/// Configuration of the HTTP long-poll server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Address to bind to.
    pub bind: SocketAddr,
    /// The broker served; requests for other brokers are answered with 404.
    pub broker_id: BrokerId,
    /// How long a poll request waits for a message before returning empty.
    #[serde(with = "duration_ms")]
    pub poll_timeout: Duration,
    /// Maximum number of messages returned by a single poll.
    pub max_batch: usize,
    /// Sessions nobody polled for this long are dropped. Must exceed the poll timeout.
    #[serde(with = "duration_ms")]
    pub session_idle_timeout: Duration,
}

impl HttpServerConfig {
    /// Sets the bind address.
    pub fn bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Sets the broker id.
    pub fn broker_id(mut self, broker_id: BrokerId) -> Self {
        self.broker_id = broker_id;
        self
    }

    /// Sets the poll timeout.
    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Sets the maximum batch size of a poll.
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Sets how long a session may go without polls before it is dropped.
    pub fn session_idle_timeout(mut self, session_idle_timeout: Duration) -> Self {
        self.session_idle_timeout = session_idle_timeout;
        self
    }
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        HttpServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            broker_id: DEFAULT_BROKER,
            poll_timeout: Duration::from_secs(10),
            max_batch: 128,
            session_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration of the HTTP long-poll client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Base url of the server, e.g. `http://127.0.0.1:8080`.
    pub url: String,
    /// The broker to talk to.
    pub broker_id: BrokerId,
    /// Delay between two polls.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Timeout of a single HTTP request. Must exceed the server's poll timeout.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
}

impl HttpClientConfig {
    /// Creates a config for the server at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        HttpClientConfig {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Sets the broker id.
    pub fn broker_id(mut self, broker_id: BrokerId) -> Self {
        self.broker_id = broker_id;
        self
    }

    /// Sets the delay between polls.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the request timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            url: "http://127.0.0.1:8080".to_string(),
            broker_id: DEFAULT_BROKER,
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration of the invocation server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationServerConfig {
    /// Names of the execution interceptors wrapped around every invocation, outermost first.
    ///
    /// Known names are `tracing` and `require-client-id`.
    pub execution_interceptors: Vec<String>,
}

impl InvocationServerConfig {
    /// Appends an execution interceptor by name.
    pub fn execution_interceptor(mut self, name: impl Into<String>) -> Self {
        self.execution_interceptors.push(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configs_deserialize_with_defaults() {
        let config: HttpClientConfig = serde_json::from_str(
            r#"{ "url": "http://localhost:9000", "poll_interval": 250 }"#,
        )
        .unwrap();

        assert_eq!(config.url, "http://localhost:9000");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.broker_id, DEFAULT_BROKER);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn oversized_durations_saturate() {
        let config = HttpClientConfig {
            poll_interval: Duration::MAX,
            ..HttpClientConfig::default()
        };

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["poll_interval"], serde_json::json!(u64::MAX));
    }

    #[test]
    fn socket_builder_clamps_sizes() {
        let config = SocketConfig::default()
            .port(0)
            .max_connections(0)
            .send_queue_capacity(0);

        assert_eq!(config.address(), "127.0.0.1:0");
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.send_queue_capacity, 1);
    }
}
