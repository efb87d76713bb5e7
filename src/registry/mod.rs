//! Bidirectional user/channel interest index.
//!
//! Both maps live behind one mutex so the "first interest" and "last interest
//! removed" decisions are computed from a single consistent snapshot. Callers
//! use those decisions to drive the broker bridge: subscribe on the first
//! interested user, unsubscribe when the last one leaves. The registry itself
//! never talks to the broker.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Default)]
struct Interests {
    /// user_id -> channels the user is interested in
    by_user: HashMap<String, HashSet<String>>,
    /// channel -> user_ids interested in it
    by_channel: HashMap<String, HashSet<String>>,
}

/// In-memory interest registry shared by all connection tasks.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: Mutex<Interests>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` is interested in `channel`.
    ///
    /// Returns true iff this is the channel's first interested user, i.e. the
    /// caller should subscribe at the broker.
    pub fn add_interest(&self, user: &str, channel: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        inner
            .by_user
            .entry(user.to_string())
            .or_default()
            .insert(channel.to_string());

        let users = inner.by_channel.entry(channel.to_string()).or_default();
        let was_empty = users.is_empty();
        users.insert(user.to_string());

        if was_empty {
            tracing::debug!(user_id = %user, channel = %channel, "First interest in channel");
        }
        was_empty
    }

    /// Remove `user`'s interest in `channel`.
    ///
    /// Returns true iff the channel's interest set is now empty, i.e. the
    /// caller should unsubscribe at the broker. Removing an interest that was
    /// never registered is a no-op returning false.
    pub fn remove_interest(&self, user: &str, channel: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        if let Some(channels) = inner.by_user.get_mut(user) {
            channels.remove(channel);
            if channels.is_empty() {
                inner.by_user.remove(user);
            }
        }

        match inner.by_channel.get_mut(channel) {
            Some(users) => {
                let removed = users.remove(user);
                if users.is_empty() {
                    inner.by_channel.remove(channel);
                    if removed {
                        tracing::debug!(user_id = %user, channel = %channel, "Last interest in channel removed");
                    }
                    removed
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Snapshot of the channels `user` is interested in.
    pub fn channels_for(&self, user: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .by_user
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the users interested in `channel`.
    pub fn users_for(&self, channel: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .by_channel
            .get(channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove `user` from every channel they belong to.
    ///
    /// Returns the channels whose interest set became empty, for batch
    /// unsubscription at the broker.
    pub fn drop_user(&self, user: &str) -> Vec<String> {
        let mut inner = self.inner.lock().expect("registry lock poisoned");

        let channels = match inner.by_user.remove(user) {
            Some(set) => set,
            None => return Vec::new(),
        };

        let mut emptied = Vec::new();
        for channel in channels {
            if let Some(users) = inner.by_channel.get_mut(&channel) {
                users.remove(user);
                if users.is_empty() {
                    inner.by_channel.remove(&channel);
                    emptied.push(channel);
                }
            }
        }

        if !emptied.is_empty() {
            tracing::debug!(user_id = %user, emptied = ?emptied, "Dropped user, channels emptied");
        }
        emptied
    }

    /// Number of channels with at least one interested user.
    pub fn channel_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").by_channel.len()
    }

    /// Number of users with at least one interest.
    pub fn user_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").by_user.len()
    }
}
