//! Channel registry
//!
//! The authoritative name → channel map. Every mutation of the map happens
//! under one write lock, and only in-memory work is done while holding it.
//! The registry lock and a channel's membership lock are never held at the
//! same time: the channel is copied out first, then operated on.
//!
//! Each server run works against one [`RunEpoch`]. `clear` starts a new
//! epoch, and session operations carrying an older one are refused, so a
//! handling unit that outlives its run cannot repopulate the registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::channel::Channel;
use crate::connection::Member;
use crate::error::ChatError;
use crate::event::{EventLog, ServerEvent};
use crate::types::{ChannelName, ConnectionId};

/// Registry generation a server run was started under
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RunEpoch(u64);

struct Slot {
    /// Creation order, for listing
    seq: u64,
    channel: Arc<Channel>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<ChannelName, Slot>,
    next_seq: u64,
    epoch: u64,
}

impl Inner {
    fn insert(&mut self, name: &ChannelName, events: &EventLog) -> Arc<Channel> {
        let channel = Arc::new(Channel::new(name.clone(), events.clone()));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.channels.insert(
            name.clone(),
            Slot {
                seq,
                channel: channel.clone(),
            },
        );
        channel
    }

    fn names(&self) -> Vec<ChannelName> {
        let mut slots: Vec<(u64, &ChannelName)> = self
            .channels
            .iter()
            .map(|(name, slot)| (slot.seq, name))
            .collect();
        slots.sort_unstable_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, name)| name.clone()).collect()
    }

    /// `None` means any epoch (operator calls)
    fn check(&self, epoch: Option<RunEpoch>) -> Result<(), ChatError> {
        match epoch {
            Some(RunEpoch(e)) if e != self.epoch => Err(ChatError::RunEnded),
            _ => Ok(()),
        }
    }
}

/// Shared registry of live channels
pub struct ChannelRegistry {
    inner: RwLock<Inner>,
    events: EventLog,
}

impl ChannelRegistry {
    pub fn new(events: EventLog) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    /// Current run epoch
    pub fn epoch(&self) -> RunEpoch {
        RunEpoch(self.inner.read().epoch)
    }

    /// Create an empty channel.
    ///
    /// Returns false, without touching the existing channel, if the name is
    /// already taken.
    pub fn create(&self, name: &ChannelName) -> bool {
        matches!(self.try_create(name, None), Ok(true))
    }

    /// [`create`](Self::create) on behalf of a session of run `epoch`.
    ///
    /// Fails with `RunEnded` once the registry has been cleared since.
    pub fn create_in(&self, epoch: RunEpoch, name: &ChannelName) -> Result<bool, ChatError> {
        self.try_create(name, Some(epoch))
    }

    fn try_create(&self, name: &ChannelName, epoch: Option<RunEpoch>) -> Result<bool, ChatError> {
        let names = {
            let mut inner = self.inner.write();
            inner.check(epoch)?;
            if inner.channels.contains_key(name) {
                None
            } else {
                inner.insert(name, &self.events);
                Some(inner.names())
            }
        };

        match names {
            Some(channels) => {
                self.events.emit(ServerEvent::ChannelCreated {
                    channel: name.clone(),
                    implicit: false,
                });
                self.events.emit(ServerEvent::ChannelsChanged { channels });
                Ok(true)
            }
            None => {
                self.events.emit(ServerEvent::ChannelExists {
                    channel: name.clone(),
                });
                Ok(false)
            }
        }
    }

    /// Remove a channel, returning whether it existed.
    ///
    /// Members are not notified. The removed channel's membership is
    /// cleared, so its former members are in no live channel; their handlers
    /// find out the next time they use the name.
    pub fn delete(&self, name: &ChannelName) -> bool {
        matches!(self.try_delete(name, None), Ok(true))
    }

    /// [`delete`](Self::delete) on behalf of a session of run `epoch`
    pub fn delete_in(&self, epoch: RunEpoch, name: &ChannelName) -> Result<bool, ChatError> {
        self.try_delete(name, Some(epoch))
    }

    fn try_delete(&self, name: &ChannelName, epoch: Option<RunEpoch>) -> Result<bool, ChatError> {
        let removed = {
            let mut inner = self.inner.write();
            inner.check(epoch)?;
            inner
                .channels
                .remove(name)
                .map(|slot| (slot.channel, inner.names()))
        };

        let Some((channel, channels)) = removed else {
            self.events.emit(ServerEvent::ChannelMissing {
                channel: name.clone(),
            });
            return Ok(false);
        };

        let members = channel.clear();
        self.events.emit(ServerEvent::ChannelDeleted {
            channel: name.clone(),
            members,
        });
        self.events.emit(ServerEvent::ChannelsChanged { channels });
        Ok(true)
    }

    /// Ensure the channel exists, then add `member` to it.
    ///
    /// Concurrent joins on a missing name converge on one channel. If a
    /// concurrent delete removes the channel between resolving it and adding
    /// the member, the member is taken back out and the join starts over, so
    /// the returned channel was live when the member was added. Fails with
    /// `RunEnded`, leaving the member in no channel, once the registry has
    /// been cleared since `epoch`.
    pub fn join(
        &self,
        epoch: RunEpoch,
        name: &ChannelName,
        member: Member,
    ) -> Result<Arc<Channel>, ChatError> {
        loop {
            let (channel, names) = {
                let mut inner = self.inner.write();
                inner.check(Some(epoch))?;
                if let Some(slot) = inner.channels.get(name) {
                    (slot.channel.clone(), None)
                } else {
                    let channel = inner.insert(name, &self.events);
                    (channel, Some(inner.names()))
                }
            };

            if let Some(channels) = names {
                self.events.emit(ServerEvent::ChannelCreated {
                    channel: name.clone(),
                    implicit: true,
                });
                self.events.emit(ServerEvent::ChannelsChanged { channels });
            }

            channel.add_member(member.clone());

            if self.is_live(name, &channel) {
                self.events.emit(ServerEvent::Joined {
                    channel: name.clone(),
                    name: member.name.clone(),
                });
                return Ok(channel);
            }

            channel.remove_member(member.id);
            debug!("Channel {} was deleted during a join, retrying", name);
        }
    }

    /// Remove a connection from the named channel.
    ///
    /// A no-op returning false if the channel no longer exists or the
    /// connection is not a member of the instance now holding the name.
    pub fn leave(&self, name: &ChannelName, id: ConnectionId) -> bool {
        let Some(channel) = self.get(name.as_str()) else {
            return false;
        };

        match channel.remove_member(id) {
            Some(member) => {
                self.events.emit(ServerEvent::Left {
                    channel: name.clone(),
                    name: member.name,
                });
                true
            }
            None => false,
        }
    }

    /// Look up a live channel
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.inner
            .read()
            .channels
            .get(name)
            .map(|slot| slot.channel.clone())
    }

    /// Point-in-time snapshot of channel names, in creation order
    pub fn names(&self) -> Vec<ChannelName> {
        self.inner.read().names()
    }

    pub fn len(&self) -> usize {
        self.inner.read().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every channel and start a new epoch, returning how many
    /// channels there were
    pub fn clear(&self) -> usize {
        let removed = {
            let mut inner = self.inner.write();
            inner.epoch += 1;
            std::mem::take(&mut inner.channels)
        };
        let count = removed.len();
        for slot in removed.into_values() {
            slot.channel.clear();
        }
        if count > 0 {
            self.events
                .emit(ServerEvent::ChannelsChanged { channels: Vec::new() });
        }
        count
    }

    fn is_live(&self, name: &ChannelName, channel: &Arc<Channel>) -> bool {
        self.inner
            .read()
            .channels
            .get(name)
            .is_some_and(|slot| Arc::ptr_eq(&slot.channel, channel))
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ChannelRegistry")
            .field("channels", &inner.names())
            .field("epoch", &inner.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecorder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{OnceLock, Weak};
    use tokio::sync::mpsc;

    fn name(s: &str) -> ChannelName {
        ChannelName::parse(s).unwrap()
    }

    fn member(display: &str) -> (Member, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (Member::new(ConnectionId::new(), display.to_string(), tx), rx)
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(EventLog::default())
    }

    fn join(registry: &ChannelRegistry, channel: &str, member: &Member) -> Arc<Channel> {
        registry
            .join(registry.epoch(), &name(channel), member.clone())
            .unwrap()
    }

    fn implicit_creations(recorder: &EventRecorder) -> usize {
        recorder
            .events()
            .iter()
            .filter(|e| matches!(e, ServerEvent::ChannelCreated { implicit: true, .. }))
            .count()
    }

    #[test]
    fn test_create_and_exists() {
        let recorder = EventRecorder::new();
        let registry = ChannelRegistry::new(EventLog::new(recorder.clone()));

        assert!(registry.create(&name("lobby")));
        assert!(!registry.create(&name("lobby")));
        assert_eq!(registry.len(), 1);

        let events = recorder.events();
        assert!(events.contains(&ServerEvent::ChannelCreated {
            channel: name("lobby"),
            implicit: false,
        }));
        assert!(events.contains(&ServerEvent::ChannelExists {
            channel: name("lobby"),
        }));
    }

    #[test]
    fn test_delete_missing_is_not_an_error() {
        let registry = registry();
        registry.create(&name("lobby"));

        assert!(!registry.delete(&name("absent")));
        assert_eq!(registry.names(), vec![name("lobby")]);
    }

    #[test]
    fn test_join_creates_missing_channel() {
        let recorder = EventRecorder::new();
        let registry = ChannelRegistry::new(EventLog::new(recorder.clone()));
        let (alice, _rx) = member("Alice");

        let channel = join(&registry, "nosuch", &alice);

        assert_eq!(implicit_creations(&recorder), 1);
        assert!(registry.get("nosuch").is_some());
        assert_eq!(channel.member_count(), 1);
        assert!(channel.contains(alice.id));
    }

    #[test]
    fn test_join_existing_channel_does_not_create() {
        let recorder = EventRecorder::new();
        let registry = ChannelRegistry::new(EventLog::new(recorder.clone()));
        registry.create(&name("lobby"));
        let (alice, _rx) = member("Alice");

        let channel = join(&registry, "lobby", &alice);

        assert_eq!(implicit_creations(&recorder), 0);
        assert!(Arc::ptr_eq(&channel, &registry.get("lobby").unwrap()));
    }

    #[test]
    fn test_leave_then_join_moves_membership() {
        let registry = registry();
        let (alice, _rx) = member("Alice");

        let a = join(&registry, "a", &alice);
        assert!(registry.leave(&name("a"), alice.id));
        let b = join(&registry, "b", &alice);

        assert!(!a.contains(alice.id));
        assert!(b.contains(alice.id));
    }

    #[test]
    fn test_leave_missing_channel_is_noop() {
        let registry = registry();
        let (alice, _rx) = member("Alice");
        assert!(!registry.leave(&name("gone"), alice.id));
    }

    #[test]
    fn test_delete_then_join_gives_fresh_channel() {
        let registry = registry();
        let (alice, _a) = member("Alice");
        let (bob, _b) = member("Bob");

        let old = join(&registry, "lobby", &alice);
        assert!(registry.delete(&name("lobby")));
        assert_eq!(old.member_count(), 0);

        let fresh = join(&registry, "lobby", &bob);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.member_count(), 1);
        assert!(!fresh.contains(alice.id));

        // Alice's stale leave does not touch the new instance
        assert!(!registry.leave(&name("lobby"), alice.id));
        assert!(fresh.contains(bob.id));
    }

    #[test]
    fn test_names_in_creation_order() {
        let registry = registry();
        for n in ["zeta", "alpha", "mid"] {
            registry.create(&name(n));
        }
        registry.delete(&name("alpha"));
        registry.create(&name("alpha"));

        assert_eq!(
            registry.names(),
            vec![name("zeta"), name("mid"), name("alpha")]
        );
    }

    #[test]
    fn test_clear() {
        let registry = registry();
        let (alice, _rx) = member("Alice");
        let channel = join(&registry, "lobby", &alice);
        registry.create(&name("games"));

        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
        assert_eq!(channel.member_count(), 0);
    }

    #[test]
    fn test_stale_epoch_is_refused() {
        let registry = registry();
        let (alice, _rx) = member("Alice");
        let run = registry.epoch();
        registry.create_in(run, &name("lobby")).unwrap();

        registry.clear();

        assert!(matches!(
            registry.create_in(run, &name("lobby")),
            Err(ChatError::RunEnded)
        ));
        assert!(matches!(
            registry.join(run, &name("lobby"), alice.clone()),
            Err(ChatError::RunEnded)
        ));
        assert!(matches!(
            registry.delete_in(run, &name("lobby")),
            Err(ChatError::RunEnded)
        ));
        assert!(registry.is_empty());

        // Operator calls and the new run are unaffected
        assert!(registry.create(&name("games")));
        let next = registry.epoch();
        assert_ne!(next, run);
        assert!(registry.join(next, &name("games"), alice).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_converge_on_one_channel() {
        let recorder = EventRecorder::new();
        let registry = Arc::new(ChannelRegistry::new(EventLog::new(recorder.clone())));
        let mut handles = Vec::new();
        let mut receivers = Vec::new();

        for i in 0..32 {
            let (m, rx) = member(&format!("user{}", i));
            receivers.push(rx);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { join(&registry, "lobby", &m) }));
        }

        let mut channels = Vec::new();
        for handle in handles {
            channels.push(handle.await.unwrap());
        }

        let first = channels[0].clone();
        assert!(channels.iter().all(|c| Arc::ptr_eq(c, &first)));
        assert_eq!(implicit_creations(&recorder), 1);
        assert_eq!(first.member_count(), 32);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_delete_during_join_retries_on_live_channel() {
        // Deletes the channel a join has just created, before the member
        // is added to it
        let target: Arc<OnceLock<Weak<ChannelRegistry>>> = Arc::default();
        let deleted: Arc<parking_lot::Mutex<Option<Arc<Channel>>>> = Arc::default();
        let fired = AtomicBool::new(false);

        let hook = target.clone();
        let victim = deleted.clone();
        let events = EventLog::new(Arc::new(move |event: &ServerEvent| {
            let ServerEvent::ChannelCreated {
                channel,
                implicit: true,
            } = event
            else {
                return;
            };
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(registry) = hook.get().and_then(Weak::upgrade) {
                *victim.lock() = registry.get(channel.as_str());
                assert!(registry.delete(channel));
            }
        }));
        let registry = Arc::new(ChannelRegistry::new(events));
        target.set(Arc::downgrade(&registry)).unwrap();
        let (alice, _rx) = member("Alice");

        let channel = join(&registry, "lobby", &alice);

        let first = deleted.lock().take().expect("hook did not run");
        assert!(!Arc::ptr_eq(&first, &channel));
        assert_eq!(first.member_count(), 0);
        assert!(Arc::ptr_eq(&channel, &registry.get("lobby").unwrap()));
        assert!(channel.contains(alice.id));
    }

    #[test]
    fn test_concurrent_create_delete_join_leaves_no_ghosts() {
        let registry = registry();
        let names = ["a", "b", "c"];
        const THREADS: usize = 6;

        let (seen, last): (Vec<Vec<Arc<Channel>>>, Vec<(Member, Option<Arc<Channel>>)>) =
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..THREADS)
                    .map(|t| {
                        let registry = &registry;
                        scope.spawn(move || {
                            let (m, _rx) = member(&format!("user{}", t));
                            let mut seen = Vec::new();
                            let mut current: Option<Arc<Channel>> = None;
                            for i in 0..300 {
                                let channel = name(names[(t + i) % names.len()]);
                                match (t + i) % 3 {
                                    0 => {
                                        registry.create(&channel);
                                    }
                                    1 => {
                                        registry.delete(&channel);
                                    }
                                    _ => {
                                        if let Some(old) = current.take() {
                                            old.remove_member(m.id);
                                        }
                                        let joined = registry
                                            .join(registry.epoch(), &channel, m.clone())
                                            .unwrap();
                                        seen.push(joined.clone());
                                        current = Some(joined);
                                    }
                                }
                            }
                            (seen, (m, current))
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .unzip()
            });

        let live: Vec<Arc<Channel>> = names.iter().filter_map(|n| registry.get(n)).collect();
        let is_live = |c: &Arc<Channel>| live.iter().any(|l| Arc::ptr_eq(l, c));

        // A deleted instance never keeps a member
        for channel in seen.iter().flatten() {
            if !is_live(channel) {
                assert_eq!(channel.member_count(), 0, "ghost in deleted {}", channel.name());
            }
        }

        // Each member is in its last joined channel if that one is still
        // live, and in no channel at all otherwise
        for (m, current) in &last {
            let holding: Vec<_> = live.iter().filter(|c| c.contains(m.id)).collect();
            match current {
                Some(c) if is_live(c) => {
                    assert_eq!(holding.len(), 1);
                    assert!(Arc::ptr_eq(holding[0], c));
                }
                _ => assert!(holding.is_empty()),
            }
        }
    }
}
