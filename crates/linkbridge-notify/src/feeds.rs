//! One [`LatestValue`] per topic, shared by every target on that topic.
//!
//! The first [`TopicFeeds::acquire`] for a topic adds a subscriber entry on
//! the bridge; the matching last [`TopicFeeds::release`] removes it.  Sharing
//! the source lets targets on the same topic reuse one encoding per cycle.

use std::collections::HashMap;
use std::sync::Arc;

use linkbridge_middleware::{Bridge, EntryKey, SubscriberOptions};
use linkbridge_types::BridgeError;
use parking_lot::Mutex;
use tracing::debug;

use crate::source::LatestValue;

const FEED_ENTRY_ID: &str = "notify:feed";

struct Feed {
    source: Arc<LatestValue>,
    users: usize,
}

pub struct TopicFeeds {
    bridge: Arc<Bridge>,
    client: u64,
    feeds: Mutex<HashMap<String, Feed>>,
}

impl TopicFeeds {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        let client = bridge.ids().next_id();
        Self {
            bridge,
            client,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// The client id feed subscriptions are recorded under.
    pub fn client_id(&self) -> u64 {
        self.client
    }

    /// The shared source for `topic`, subscribing on first use.  Topics the
    /// bridge's allow-list forbids are refused.
    pub fn acquire(&self, topic: &str) -> Result<Arc<LatestValue>, BridgeError> {
        self.bridge.settings().topics.check(topic)?;
        let mut feeds = self.feeds.lock();
        if let Some(feed) = feeds.get_mut(topic) {
            feed.users += 1;
            return Ok(Arc::clone(&feed.source));
        }

        let source = LatestValue::new(topic);
        self.bridge.subscribers().subscribe(
            topic,
            None,
            EntryKey::new(self.client, FEED_ENTRY_ID),
            SubscriberOptions::default(),
            source.sink(),
        )?;
        debug!(topic, "topic feed opened");
        feeds.insert(
            topic.to_string(),
            Feed {
                source: Arc::clone(&source),
                users: 1,
            },
        );
        Ok(source)
    }

    /// Drop one user of `topic`'s feed.
    pub fn release(&self, topic: &str) {
        let mut feeds = self.feeds.lock();
        let Some(feed) = feeds.get_mut(topic) else {
            return;
        };
        feed.users -= 1;
        if feed.users == 0 {
            feeds.remove(topic);
            self.bridge
                .subscribers()
                .unsubscribe(topic, &EntryKey::new(self.client, FEED_ENTRY_ID));
            debug!(topic, "topic feed closed");
        }
    }

    pub fn users(&self, topic: &str) -> usize {
        self.feeds.lock().get(topic).map_or(0, |f| f.users)
    }
}
