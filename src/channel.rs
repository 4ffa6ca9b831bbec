//! Channel struct definition
//!
//! A named group of members. Membership has its own lock, independent of
//! the registry's, so broadcasts in different channels never contend.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::connection::Member;
use crate::error::SendError;
use crate::event::{EventLog, ServerEvent};
use crate::types::{ChannelName, ConnectionId};

/// Chat channel
///
/// Does not know which other channels a member belongs to; keeping a
/// connection in at most one channel is the join protocol's job.
#[derive(Debug)]
pub struct Channel {
    name: ChannelName,
    members: Mutex<HashMap<ConnectionId, Member>>,
    events: EventLog,
}

impl Channel {
    /// Create an empty channel
    pub fn new(name: ChannelName, events: EventLog) -> Self {
        Self {
            name,
            members: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    /// Add a member
    ///
    /// Returns false (and keeps the existing entry) if already present.
    pub fn add_member(&self, member: Member) -> bool {
        let mut members = self.members.lock();
        if members.contains_key(&member.id) {
            return false;
        }
        members.insert(member.id, member);
        true
    }

    /// Remove a member, returning it if it was present
    pub fn remove_member(&self, id: ConnectionId) -> Option<Member> {
        self.members.lock().remove(&id)
    }

    /// Check if a connection is a member
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.lock().contains_key(&id)
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Display names of current members, sorted
    pub fn member_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .members
            .lock()
            .values()
            .map(|m| m.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop every member, returning how many there were
    pub fn clear(&self) -> usize {
        let mut members = self.members.lock();
        let count = members.len();
        members.clear();
        count
    }

    /// Queue `line` for every member except `exclude`.
    ///
    /// Best effort: a member whose queue is closed or full is skipped and
    /// logged, and its own read loop is left to notice the disconnect.
    /// Returns the number of members the line was queued for.
    pub fn broadcast(&self, line: &str, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        let mut failed: Vec<(String, SendError)> = Vec::new();

        {
            let members = self.members.lock();
            for member in members.values() {
                if Some(member.id) == exclude {
                    continue;
                }
                match member.try_send(line.to_string()) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((member.name.clone(), e)),
                }
            }
        }

        // Listener callbacks run outside the membership lock
        for (to, error) in failed {
            self.events.emit(ServerEvent::DeliveryFailed {
                channel: self.name.clone(),
                to,
                error: error.to_string(),
            });
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecorder;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn channel() -> Channel {
        Channel::new(ChannelName::parse("lobby").unwrap(), EventLog::default())
    }

    fn member(name: &str) -> (Member, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (Member::new(ConnectionId::new(), name.to_string(), tx), rx)
    }

    #[test]
    fn test_channel_creation() {
        let channel = channel();
        assert_eq!(channel.name().as_str(), "lobby");
        assert_eq!(channel.member_count(), 0);
    }

    #[test]
    fn test_add_member_idempotent() {
        let channel = channel();
        let (alice, _rx) = member("Alice");

        assert!(channel.add_member(alice.clone()));
        assert!(!channel.add_member(alice.clone()));
        assert_eq!(channel.member_count(), 1);
        assert!(channel.contains(alice.id));
    }

    #[test]
    fn test_remove_member_idempotent() {
        let channel = channel();
        let (alice, _rx) = member("Alice");
        channel.add_member(alice.clone());

        assert_eq!(channel.remove_member(alice.id).map(|m| m.name), Some("Alice".to_string()));
        assert!(channel.remove_member(alice.id).is_none());
        assert!(!channel.contains(alice.id));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let channel = channel();
        let (alice, mut alice_rx) = member("Alice");
        let (bob, mut bob_rx) = member("Bob");
        let (carol, mut carol_rx) = member("Carol");
        channel.add_member(alice.clone());
        channel.add_member(bob);
        channel.add_member(carol);

        let delivered = channel.broadcast("[Alice] hi", Some(alice.id));

        assert_eq!(delivered, 2);
        assert_eq!(bob_rx.recv().await.as_deref(), Some("[Alice] hi"));
        assert_eq!(carol_rx.recv().await.as_deref(), Some("[Alice] hi"));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_survives_closed_member() {
        let recorder = EventRecorder::new();
        let channel = Channel::new(
            ChannelName::parse("lobby").unwrap(),
            EventLog::new(recorder.clone()),
        );
        let (alice, _alice_rx) = member("Alice");
        let (bob, bob_rx) = member("Bob");
        let (carol, mut carol_rx) = member("Carol");
        let (dave, mut dave_rx) = member("Dave");
        channel.add_member(alice.clone());
        channel.add_member(bob);
        channel.add_member(carol);
        channel.add_member(dave);

        // Bob's transport is gone
        drop(bob_rx);

        let delivered = channel.broadcast("[Alice] hi", Some(alice.id));

        assert_eq!(delivered, 2);
        assert_eq!(carol_rx.recv().await.as_deref(), Some("[Alice] hi"));
        assert_eq!(dave_rx.recv().await.as_deref(), Some("[Alice] hi"));
        // Failed member is left in place for its own handler to clean up
        assert_eq!(channel.member_count(), 4);

        let failures: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::DeliveryFailed { to, .. } if to == "Bob"))
            .collect();
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_broadcast_without_exclusion_reaches_all() {
        let channel = channel();
        let (alice, _a) = member("Alice");
        let (bob, _b) = member("Bob");
        channel.add_member(alice);
        channel.add_member(bob);

        assert_eq!(channel.broadcast("notice", None), 2);
    }

    #[test]
    fn test_clear_and_member_names() {
        let channel = channel();
        let (bob, _b) = member("Bob");
        let (alice, _a) = member("Alice");
        channel.add_member(bob);
        channel.add_member(alice);

        assert_eq!(channel.member_names(), vec!["Alice", "Bob"]);
        assert_eq!(channel.clear(), 2);
        assert_eq!(channel.member_count(), 0);
    }

    #[test]
    fn test_channels_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Arc<Channel>>();
    }
}
