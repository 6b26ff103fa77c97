//! Named endpoints and the registry that maps them to channels and receivers.
//!
//! A [`Messaging`] context replaces process-wide singletons: construct one, register the brokers your
//! application talks to, and pass it to whoever needs to look them up.

use std::{borrow::Cow, fmt, sync::Arc};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{SharedChannel, SharedReceiver},
    error::ConfigError,
};

/// Identifies a broker, a named channel/receiver pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BrokerId(Cow<'static, str>);

impl BrokerId {
    /// Creates a broker id from a static name.
    pub const fn from_static(name: &'static str) -> Self {
        BrokerId(Cow::Borrowed(name))
    }

    /// Creates a broker id, rejecting empty names.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ConfigError::EmptyBrokerId);
        }
        Ok(BrokerId(name))
    }

    /// The broker's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry of the brokers known to this process.
///
/// Channels are outbound (how to reach a broker), receivers are inbound (who handles messages
/// arriving at a broker hosted here).
pub struct Messaging<M> {
    channels: DashMap<BrokerId, SharedChannel<M>>,
    receivers: DashMap<BrokerId, SharedReceiver<M>>,
}

impl<M: 'static> Messaging<M> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Messaging {
            channels: DashMap::new(),
            receivers: DashMap::new(),
        }
    }

    /// Creates an empty registry already wrapped for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registers the channel reaching `broker`.
    ///
    /// Returns `false` and leaves the registry untouched if one is already registered.
    pub fn register_channel(&self, broker: BrokerId, channel: SharedChannel<M>) -> bool {
        match self.channels.entry(broker) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(channel);
                true
            }
        }
    }

    /// Returns the channel reaching `broker`.
    pub fn channel(&self, broker: &BrokerId) -> Option<SharedChannel<M>> {
        self.channels.get(broker).map(|channel| channel.value().clone())
    }

    /// Removes the channel reaching `broker`.
    pub fn remove_channel(&self, broker: &BrokerId) -> bool {
        self.channels.remove(broker).is_some()
    }

    /// Sets the receiver handling messages arriving at `broker`, replacing any previous one.
    pub fn set_receiver(&self, broker: BrokerId, receiver: SharedReceiver<M>) {
        self.receivers.insert(broker, receiver);
    }

    /// Returns the receiver handling messages arriving at `broker`.
    pub fn receiver(&self, broker: &BrokerId) -> Option<SharedReceiver<M>> {
        self.receivers
            .get(broker)
            .map(|receiver| receiver.value().clone())
    }

    /// Removes the receiver of `broker`.
    pub fn remove_receiver(&self, broker: &BrokerId) -> bool {
        self.receivers.remove(broker).is_some()
    }

    /// Names of all brokers with a registered channel.
    pub fn channel_names(&self) -> Vec<BrokerId> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Returns `true` if neither channels nor receivers are registered.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.receivers.is_empty()
    }

    /// Removes all channels and receivers.
    pub fn clear(&self) {
        self.channels.clear();
        self.receivers.clear();
    }
}

impl<M: 'static> Default for Messaging<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for Messaging<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messaging")
            .field("channels", &self.channels.len())
            .field("receivers", &self.receivers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NoReplyChannel;

    #[test]
    fn empty_broker_ids_are_rejected() {
        assert_eq!(BrokerId::new(""), Err(ConfigError::EmptyBrokerId));
        assert_eq!(BrokerId::new("server").unwrap().as_str(), "server");
    }

    #[test]
    fn channels_register_once() {
        let messaging = Messaging::<String>::new();
        let broker = BrokerId::from_static("server");

        assert!(messaging.register_channel(broker.clone(), Arc::new(NoReplyChannel)));
        assert!(!messaging.register_channel(broker.clone(), Arc::new(NoReplyChannel)));
        assert!(messaging.channel(&broker).is_some());
        assert_eq!(messaging.channel_names(), vec![broker.clone()]);

        assert!(messaging.remove_channel(&broker));
        assert!(messaging.channel(&broker).is_none());
        assert!(messaging.is_empty());
    }
}
