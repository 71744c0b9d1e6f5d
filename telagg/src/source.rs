//! Feed and discovery sources.
//!
//! The engine never talks to instrument drivers directly. It consumes two
//! capabilities:
//!
//! - [`FeedSource`]: subscribe a handler to a feed; the source invokes it on
//!   its own threads for every published batch.
//! - [`DiscoverySource`]: watch announcements of sources and the feeds they
//!   advertise.
//!
//! [`LocalHub`] implements both in-process. It is what the CLI's synthetic
//! feeds publish through, and what the tests drive.
//!
//! # Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use telagg::feed::{Delivery, FeedAddress, FeedMeta, Sample};
//! use telagg::source::{FeedSource, LocalHub};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = LocalHub::new();
//! let address = FeedAddress::new("dev1", "therm")?;
//! hub.declare_feed(FeedMeta { address: address.clone(), buffered: false, buffer_time: None });
//!
//! let seen = Arc::new(Mutex::new(0));
//! let counter = Arc::clone(&seen);
//! let _handle = hub.subscribe("dev1", "therm", Box::new(move |delivery: Delivery| {
//!     *counter.lock().unwrap() += delivery.samples.len();
//! }))?;
//!
//! hub.publish(&address, vec![Sample::new("ch1", 0.0, 1.0)])?;
//! assert_eq!(*seen.lock().unwrap(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubscriptionError};
use crate::feed::{Delivery, FeedAddress, FeedMeta, Sample};

/// Callback invoked for every batch published on a subscribed feed.
pub type FeedHandler = Box<dyn Fn(Delivery) + Send + Sync>;

/// Callback invoked for every discovery announcement.
pub type DiscoveryHandler = Box<dyn Fn(DiscoveryEvent) + Send + Sync>;

/// Capability to subscribe to feeds published by drivers.
pub trait FeedSource: Send + Sync {
    /// Subscribes `handler` to `feed_name` on `source_addr`.
    ///
    /// The handler may be called concurrently for different feeds, on
    /// threads owned by the source. Dropping the returned handle ends the
    /// subscription.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] if the source cannot subscribe.
    fn subscribe(
        &self,
        source_addr: &str,
        feed_name: &str,
        handler: FeedHandler,
    ) -> Result<SubscriptionHandle>;
}

/// Capability to watch source announcements.
pub trait DiscoverySource: Send + Sync {
    /// Registers `handler` for discovery events.
    ///
    /// Sources already known when the watcher attaches are replayed as
    /// [`DiscoveryAction::Added`] events.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError`] if the watch cannot be established.
    fn watch(&self, handler: DiscoveryHandler) -> Result<SubscriptionHandle>;
}

/// Keeps a subscription alive; dropping it unsubscribes.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    /// Creates a handle that runs `cancel` when dropped.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Creates a handle with nothing to cancel.
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Whether a source appeared or went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryAction {
    /// The source is available.
    Added,
    /// The source is gone.
    Removed,
}

/// A feed advertised by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedFeed {
    /// Name of the feed.
    pub feed_name: String,
    /// Whether the feed asks to be recorded.
    #[serde(default)]
    pub aggregate: bool,
    /// Whether the source batches samples itself.
    #[serde(default)]
    pub buffered: bool,
    /// Accumulation window requested for engine-side buffering.
    #[serde(with = "crate::config::opt_seconds", default)]
    pub buffer_time: Option<Duration>,
}

/// A source and the feeds it publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Address of the source (agent).
    pub address: String,
    /// Feeds the source publishes.
    #[serde(default)]
    pub feeds: Vec<AdvertisedFeed>,
}

/// A discovery announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEvent {
    /// What happened to the source.
    pub action: DiscoveryAction,
    /// The source concerned.
    pub source: SourceInfo,
}

type SharedFeedHandler = Arc<FeedHandler>;
type SharedDiscoveryHandler = Arc<DiscoveryHandler>;

struct HubFeed {
    meta: FeedMeta,
    subscribers: HashMap<u64, SharedFeedHandler>,
}

#[derive(Default)]
struct HubInner {
    feeds: RwLock<HashMap<FeedAddress, HubFeed>>,
    sources: RwLock<BTreeMap<String, SourceInfo>>,
    watchers: RwLock<HashMap<u64, SharedDiscoveryHandler>>,
    next_id: AtomicU64,
}

/// In-process feed and discovery source.
///
/// Publishing delivers synchronously on the publisher's thread, so each
/// publisher behaves like an independent driver thread. Cloning a hub
/// yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a feed available for subscription, replacing its metadata if
    /// it already exists. Existing subscribers are kept.
    pub fn declare_feed(&self, meta: FeedMeta) {
        let mut feeds = write(&self.inner.feeds);
        match feeds.get_mut(&meta.address) {
            Some(feed) => feed.meta = meta,
            None => {
                feeds.insert(
                    meta.address.clone(),
                    HubFeed {
                        meta,
                        subscribers: HashMap::new(),
                    },
                );
            }
        }
    }

    /// Announces a source: declares its feeds and notifies watchers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a feed address is malformed; nothing
    /// is declared in that case.
    pub fn announce(&self, info: SourceInfo) -> Result<()> {
        let metas = info
            .feeds
            .iter()
            .map(|feed| {
                Ok(FeedMeta {
                    address: FeedAddress::new(&info.address, &feed.feed_name)?,
                    buffered: feed.buffered,
                    buffer_time: feed.buffer_time,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        for meta in metas {
            self.declare_feed(meta);
        }
        write(&self.inner.sources).insert(info.address.clone(), info.clone());

        self.notify(&DiscoveryEvent {
            action: DiscoveryAction::Added,
            source: info,
        });
        Ok(())
    }

    /// Withdraws a previously announced source and notifies watchers.
    ///
    /// Its feeds stay declared so existing subscriptions keep working if the
    /// source comes back.
    pub fn withdraw(&self, source_addr: &str) {
        let removed = write(&self.inner.sources).remove(source_addr);
        if let Some(info) = removed {
            self.notify(&DiscoveryEvent {
                action: DiscoveryAction::Removed,
                source: info,
            });
        }
    }

    /// Publishes samples on a feed, calling every subscriber on this thread.
    ///
    /// Returns the number of subscribers the batch was delivered to.
    ///
    /// # Errors
    ///
    /// Returns [`SubscriptionError::UnknownFeed`] if the feed was never
    /// declared.
    pub fn publish(&self, address: &FeedAddress, samples: Vec<Sample>) -> Result<usize> {
        let (meta, handlers) = {
            let feeds = read(&self.inner.feeds);
            let Some(feed) = feeds.get(address) else {
                return Err(SubscriptionError::UnknownFeed {
                    source_addr: address.source().to_string(),
                    feed: address.feed().to_string(),
                }
                .into());
            };
            let handlers: Vec<_> = feed.subscribers.values().cloned().collect();
            (feed.meta.clone(), handlers)
        };

        for handler in &handlers {
            handler(Delivery {
                samples: samples.clone(),
                meta: meta.clone(),
            });
        }
        Ok(handlers.len())
    }

    /// Number of live subscriptions on a feed.
    pub fn subscriber_count(&self, address: &FeedAddress) -> usize {
        read(&self.inner.feeds)
            .get(address)
            .map_or(0, |feed| feed.subscribers.len())
    }

    fn notify(&self, event: &DiscoveryEvent) {
        let watchers: Vec<_> = read(&self.inner.watchers).values().cloned().collect();
        for watcher in watchers {
            watcher(event.clone());
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl FeedSource for LocalHub {
    fn subscribe(
        &self,
        source_addr: &str,
        feed_name: &str,
        handler: FeedHandler,
    ) -> Result<SubscriptionHandle> {
        let address = FeedAddress::new(source_addr, feed_name)?;
        let id = self.next_id();
        {
            let mut feeds = write(&self.inner.feeds);
            let Some(feed) = feeds.get_mut(&address) else {
                return Err(SubscriptionError::UnknownFeed {
                    source_addr: source_addr.to_string(),
                    feed: feed_name.to_string(),
                }
                .into());
            };
            feed.subscribers.insert(id, Arc::new(handler));
        }

        let inner: Weak<HubInner> = Arc::downgrade(&self.inner);
        Ok(SubscriptionHandle::new(move || {
            if let Some(inner) = inner.upgrade()
                && let Some(feed) = write(&inner.feeds).get_mut(&address)
            {
                feed.subscribers.remove(&id);
            }
        }))
    }
}

impl DiscoverySource for LocalHub {
    fn watch(&self, handler: DiscoveryHandler) -> Result<SubscriptionHandle> {
        let id = self.next_id();
        let handler: SharedDiscoveryHandler = Arc::new(handler);
        write(&self.inner.watchers).insert(id, Arc::clone(&handler));

        let known: Vec<SourceInfo> = read(&self.inner.sources).values().cloned().collect();
        for source in known {
            handler(DiscoveryEvent {
                action: DiscoveryAction::Added,
                source,
            });
        }

        let inner: Weak<HubInner> = Arc::downgrade(&self.inner);
        Ok(SubscriptionHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                write(&inner.watchers).remove(&id);
            }
        }))
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn meta(source: &str, feed: &str) -> FeedMeta {
        FeedMeta {
            address: FeedAddress::new(source, feed).unwrap(),
            buffered: false,
            buffer_time: None,
        }
    }

    #[test]
    fn test_subscribe_unknown_feed_fails() {
        let hub = LocalHub::new();
        let err = hub.subscribe("dev1", "therm", Box::new(|_| {})).unwrap_err();
        assert!(matches!(
            err,
            crate::TelaggError::Subscription(SubscriptionError::UnknownFeed { .. })
        ));
    }

    #[test]
    fn test_publish_reaches_subscribers_until_dropped() {
        let hub = LocalHub::new();
        let m = meta("dev1", "therm");
        hub.declare_feed(m.clone());

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let handle = hub
            .subscribe(
                "dev1",
                "therm",
                Box::new(move |d: Delivery| sink.lock().unwrap().extend(d.samples)),
            )
            .unwrap();

        assert_eq!(hub.publish(&m.address, vec![Sample::new("a", 0.0, 1.0)]).unwrap(), 1);
        assert_eq!(hub.subscriber_count(&m.address), 1);

        drop(handle);
        assert_eq!(hub.subscriber_count(&m.address), 0);
        assert_eq!(hub.publish(&m.address, vec![Sample::new("a", 1.0, 2.0)]).unwrap(), 0);

        assert_eq!(*received.lock().unwrap(), vec![Sample::new("a", 0.0, 1.0)]);
    }

    #[test]
    fn test_publish_undeclared_feed_fails() {
        let hub = LocalHub::new();
        let address = FeedAddress::new("dev1", "therm").unwrap();
        assert!(hub.publish(&address, Vec::new()).is_err());
    }

    #[test]
    fn test_watch_replays_known_sources() {
        let hub = LocalHub::new();
        hub.announce(SourceInfo {
            address: "dev1".to_string(),
            feeds: vec![AdvertisedFeed {
                feed_name: "therm".to_string(),
                aggregate: true,
                buffered: false,
                buffer_time: Some(Duration::from_secs(1)),
            }],
        })
        .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _handle = hub
            .watch(Box::new(move |e: DiscoveryEvent| sink.lock().unwrap().push(e)))
            .unwrap();

        hub.withdraw("dev1");
        hub.withdraw("dev1");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, DiscoveryAction::Added);
        assert_eq!(events[0].source.address, "dev1");
        assert_eq!(events[1].action, DiscoveryAction::Removed);

        let address = FeedAddress::new("dev1", "therm").unwrap();
        assert!(hub.publish(&address, Vec::new()).is_ok());
    }

    #[test]
    fn test_discovery_event_json() {
        let event: DiscoveryEvent = serde_json::from_str(
            r#"{
                "action": "added",
                "source": {
                    "address": "observatory.lakeshore",
                    "feeds": [{ "feed_name": "temps", "aggregate": true, "buffer_time": 1.5 }]
                }
            }"#,
        )
        .unwrap();
        assert_eq!(event.action, DiscoveryAction::Added);
        let feed = &event.source.feeds[0];
        assert!(feed.aggregate);
        assert!(!feed.buffered);
        assert_eq!(feed.buffer_time, Some(Duration::from_millis(1500)));
    }
}
