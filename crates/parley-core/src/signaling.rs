//! Call signaling.
//!
//! Relays call-control envelopes between peers and tracks the ephemeral call
//! rooms they establish. Rooms exist only while they have participants.

use crate::connection::{ConnectionHandle, ConnectionId, Delivery};
use crate::notify::{NoopNotifier, OfflineNotifier};
use crate::registry::{FanOut, Registry};
use dashmap::DashMap;
use parley_protocol::{codec, Envelope, EnvelopeKind, Payload, RoomId, Signal, UserId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

/// One call room.
#[derive(Debug)]
pub struct CallRoom {
    id: RoomId,
    is_group: bool,
    participants: Mutex<HashMap<UserId, ConnectionHandle>>,
}

impl CallRoom {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>, is_group: bool) -> Self {
        Self {
            id: id.into(),
            is_group,
            participants: Mutex::new(HashMap::new()),
        }
    }

    /// Room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the room belongs to a group call.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.is_group
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, ConnectionHandle>> {
        // Participant maps stay consistent across a panic; recover the guard.
        self.participants.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add or replace a participant.
    pub fn add(&self, handle: ConnectionHandle) {
        self.lock().insert(handle.user_id(), handle);
    }

    /// Remove a participant.
    ///
    /// With `connection` set, the participant is only removed if it joined
    /// through that connection. Returns `true` if a participant was removed.
    pub fn remove(&self, user_id: UserId, connection: Option<ConnectionId>) -> bool {
        let mut participants = self.lock();
        match (participants.get(&user_id), connection) {
            (Some(handle), Some(connection)) if handle.id() != connection => false,
            (Some(_), _) => participants.remove(&user_id).is_some(),
            (None, _) => false,
        }
    }

    /// Whether the room has no participants.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of participants.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether a user is a participant.
    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.lock().contains_key(&user_id)
    }

    /// Participant ids, sorted.
    #[must_use]
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Deliver a payload to every participant except `exclude`.
    pub fn broadcast(&self, payload: &Payload, exclude: UserId) -> FanOut {
        let targets: Vec<ConnectionHandle> = self
            .lock()
            .values()
            .filter(|h| h.user_id() != exclude)
            .cloned()
            .collect();

        let mut fan_out = FanOut::default();
        for handle in targets {
            fan_out.record(handle.user_id(), handle.try_send(payload.clone()));
        }
        fan_out
    }
}

/// The process-wide call room table.
///
/// The table lock is always taken before a room lock, never the reverse.
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<CallRoom>>,
    registry: Arc<Registry>,
    notifier: Arc<dyn OfflineNotifier>,
}

impl RoomManager {
    /// Create an empty room table.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            rooms: DashMap::new(),
            registry,
            notifier: Arc::new(NoopNotifier),
        }
    }

    /// Use a custom offline notifier for unanswered direct offers.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn OfflineNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Add a connection to a room, creating the room if needed.
    pub fn join(&self, room_id: &str, is_group: bool, handle: &ConnectionHandle) {
        // Added under the table entry so a concurrent reap cannot drop the room
        // between lookup and insertion.
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                debug!(room = room_id, is_group, "Call room created");
                Arc::new(CallRoom::new(room_id, is_group))
            });
        room.add(handle.clone());
        trace!(room = room_id, user_id = handle.user_id(), "Joined call room");
    }

    /// Remove a user from a room, deleting the room if it becomes empty.
    ///
    /// Returns `true` if the user was a participant.
    pub fn leave(&self, room_id: &str, user_id: UserId, connection: Option<ConnectionId>) -> bool {
        let Some(room) = self.room(room_id) else {
            return false;
        };
        let removed = room.remove(user_id, connection);
        if removed {
            trace!(room = room_id, user_id, "Left call room");
        }
        self.reap(room_id);
        removed
    }

    /// Remove a connection from every room it participates in.
    ///
    /// Rooms that become empty are deleted. Returns the number of rooms left.
    pub fn leave_all(&self, user_id: UserId, connection: ConnectionId) -> usize {
        let mut left = 0;
        self.rooms.retain(|room_id, room| {
            if room.remove(user_id, Some(connection)) {
                left += 1;
                trace!(room = %room_id, user_id, "Left call room on disconnect");
            }
            let keep = !room.is_empty();
            if !keep {
                debug!(room = %room_id, "Call room closed");
            }
            keep
        });
        left
    }

    fn reap(&self, room_id: &str) {
        if self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
            debug!(room = room_id, "Call room closed");
        }
    }

    fn room(&self, room_id: &str) -> Option<Arc<CallRoom>> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    /// Whether a room exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Number of participants in a room, `0` if it does not exist.
    #[must_use]
    pub fn participant_count(&self, room_id: &str) -> usize {
        self.room(room_id).map_or(0, |r| r.len())
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Participant ids of a room, sorted. Empty if it does not exist.
    #[must_use]
    pub fn participants(&self, room_id: &str) -> Vec<UserId> {
        self.room(room_id).map(|r| r.user_ids()).unwrap_or_default()
    }

    /// Handle a signaling envelope from `sender`.
    ///
    /// The sender identity is overwritten with the authenticated one before
    /// relaying. Returns what happened to the relayed copies.
    pub async fn handle(
        &self,
        sender: &ConnectionHandle,
        kind: EnvelopeKind,
        mut signal: Signal,
    ) -> FanOut {
        let user_id = sender.user_id();
        signal.sender_id = user_id;
        signal.sender_username = Some(sender.display_name().to_string());

        let target = signal.target();
        let group = signal.group();
        let room_id = signal.room().map(str::to_string);

        let Some(envelope) = Envelope::signal(kind, signal) else {
            warn!(user_id, kind = %kind, "Not a signaling envelope");
            return FanOut::default();
        };
        let payload = match codec::encode(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user_id, kind = %kind, error = %e, "Failed to encode signal");
                return FanOut::default();
            }
        };

        let mut fan_out = FanOut::default();
        match kind {
            EnvelopeKind::CallOffer => {
                if let Some(to) = target {
                    let delivery = self.registry.send_to_user(to, &payload);
                    if delivery == Delivery::Offline {
                        self.notifier.notify_offline(to, &envelope).await;
                    }
                    fan_out.record(to, delivery);
                }
                if let Some(group_id) = group {
                    if let Some(room_id) = &room_id {
                        self.join(room_id, true, sender);
                    }
                    self.relay_to_group(group_id, user_id, &payload, &mut fan_out)
                        .await;
                }
            }
            EnvelopeKind::CallAnswer => {
                if let Some(room_id) = &room_id {
                    self.join(room_id, group.is_some(), sender);
                }
                if let Some(to) = target {
                    fan_out.record(to, self.registry.send_to_user(to, &payload));
                }
            }
            EnvelopeKind::CallReject | EnvelopeKind::CallEnd => {
                if let Some(to) = target {
                    fan_out.record(to, self.registry.send_to_user(to, &payload));
                }
                if let Some(group_id) = group {
                    self.relay_to_group(group_id, user_id, &payload, &mut fan_out)
                        .await;
                }
                if let Some(room_id) = &room_id {
                    self.leave(room_id, user_id, None);
                }
            }
            EnvelopeKind::IceCandidate => {
                if let Some(to) = target {
                    fan_out.record(to, self.registry.send_to_user(to, &payload));
                } else if let Some(room) = room_id.as_deref().and_then(|id| self.room(id)) {
                    fan_out = room.broadcast(&payload, user_id);
                }
            }
            _ => {}
        }

        trace!(
            user_id,
            kind = %kind,
            room = room_id.as_deref().unwrap_or(""),
            queued = fan_out.queued,
            "Signal relayed"
        );
        fan_out
    }

    async fn relay_to_group(
        &self,
        group_id: parley_protocol::GroupId,
        sender: UserId,
        payload: &Payload,
        fan_out: &mut FanOut,
    ) {
        match self
            .registry
            .send_to_group_members(group_id, sender, payload)
            .await
        {
            Ok(group_fan_out) => {
                fan_out.queued += group_fan_out.queued;
                fan_out.dropped += group_fan_out.dropped;
                fan_out.offline.extend(group_fan_out.offline);
            }
            Err(e) => warn!(group_id, error = %e, "Failed to load group members for signal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Identity;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<Registry>, RoomManager) {
        let store = MemoryStore::new();
        store.add_group(7, &[1, 2, 3]);
        let registry = Arc::new(Registry::new(Arc::new(store)));
        let rooms = RoomManager::new(registry.clone());
        (registry, rooms)
    }

    fn connect(
        registry: &Registry,
        user_id: UserId,
        name: &str,
    ) -> (ConnectionHandle, mpsc::Receiver<Payload>) {
        let (handle, rx) = ConnectionHandle::new(Identity::new(user_id, name), 16);
        registry.register(handle.clone());
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Payload>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            out.push(payload.decode().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_direct_offer_stamps_sender() {
        let (registry, rooms) = setup();
        let (ann, _ann_rx) = connect(&registry, 1, "ann");
        let (_bob, mut bob_rx) = connect(&registry, 2, "bob");

        let forged = Signal {
            sender_id: 99,
            sender_username: Some("mallory".to_string()),
            ..Signal::to_user(2).with_sdp("v=0")
        };
        let fan_out = rooms.handle(&ann, EnvelopeKind::CallOffer, forged).await;
        assert_eq!(fan_out.queued, 1);

        let got = drain(&mut bob_rx);
        match &got[..] {
            [Envelope::CallOffer(signal)] => {
                assert_eq!(signal.sender_id, 1);
                assert_eq!(signal.sender_username.as_deref(), Some("ann"));
                assert_eq!(signal.sdp.as_deref(), Some("v=0"));
            }
            other => panic!("Expected one CallOffer, got {:?}", other),
        }
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_group_offer_creates_room_and_reaches_group() {
        let (registry, rooms) = setup();
        let (ann, mut ann_rx) = connect(&registry, 1, "ann");
        let (_bob, mut bob_rx) = connect(&registry, 2, "bob");
        let (_cyd, mut cyd_rx) = connect(&registry, 3, "cyd");

        rooms
            .handle(&ann, EnvelopeKind::CallOffer, Signal::to_group(7).in_room("r1"))
            .await;

        assert!(rooms.room_exists("r1"));
        assert_eq!(rooms.participants("r1"), vec![1]);
        assert!(drain(&mut ann_rx).is_empty());
        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert_eq!(drain(&mut cyd_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_offer_with_target_and_group_reaches_both() {
        let (registry, rooms) = setup();
        let (ann, _ann_rx) = connect(&registry, 1, "ann");
        let (_bob, mut bob_rx) = connect(&registry, 2, "bob");
        let (_cyd, mut cyd_rx) = connect(&registry, 3, "cyd");
        let (_dan, mut dan_rx) = connect(&registry, 4, "dan");

        let offer = Signal {
            group_id: Some(7),
            ..Signal::to_user(4).in_room("r2")
        };
        let fan_out = rooms.handle(&ann, EnvelopeKind::CallOffer, offer).await;

        assert_eq!(fan_out.queued, 3);
        assert_eq!(rooms.participants("r2"), vec![1]);
        for rx in [&mut bob_rx, &mut cyd_rx, &mut dan_rx] {
            assert!(matches!(&drain(rx)[..], [Envelope::CallOffer(_)]));
        }
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let (registry, rooms) = setup();
        let (ann, _ann_rx) = connect(&registry, 1, "ann");
        let (bob, mut bob_rx) = connect(&registry, 2, "bob");

        rooms
            .handle(&ann, EnvelopeKind::CallOffer, Signal::to_group(7).in_room("r1"))
            .await;
        rooms
            .handle(&bob, EnvelopeKind::CallAnswer, Signal::to_user(1).in_room("r1"))
            .await;
        assert_eq!(rooms.participant_count("r1"), 2);

        drain(&mut bob_rx);
        let candidate = serde_json::json!({"candidate": "candidate:1 1 UDP 1 10.0.0.1 9 typ host"});
        let fan_out = rooms
            .handle(
                &ann,
                EnvelopeKind::IceCandidate,
                Signal::default().in_room("r1").with_candidate(candidate),
            )
            .await;
        assert_eq!(fan_out.queued, 1);
        assert!(matches!(&drain(&mut bob_rx)[..], [Envelope::IceCandidate(_)]));

        rooms
            .handle(&ann, EnvelopeKind::CallEnd, Signal::default().in_room("r1"))
            .await;
        assert_eq!(rooms.participants("r1"), vec![2]);
        rooms
            .handle(&bob, EnvelopeKind::CallEnd, Signal::default().in_room("r1"))
            .await;
        assert!(!rooms.room_exists("r1"));
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_ice_candidate_never_creates_room() {
        let (registry, rooms) = setup();
        let (ann, _rx) = connect(&registry, 1, "ann");

        let fan_out = rooms
            .handle(&ann, EnvelopeKind::IceCandidate, Signal::default().in_room("ghost"))
            .await;
        assert_eq!(fan_out.attempted(), 0);
        assert!(!rooms.room_exists("ghost"));
    }

    #[tokio::test]
    async fn test_answer_without_room_still_relays() {
        let (registry, rooms) = setup();
        let (bob, _bob_rx) = connect(&registry, 2, "bob");
        let (_ann, mut ann_rx) = connect(&registry, 1, "ann");

        let fan_out = rooms
            .handle(&bob, EnvelopeKind::CallAnswer, Signal::to_user(1).with_sdp("v=0"))
            .await;
        assert_eq!(fan_out.queued, 1);
        assert_eq!(rooms.room_count(), 0);
        assert!(matches!(&drain(&mut ann_rx)[..], [Envelope::CallAnswer(_)]));
    }

    #[tokio::test]
    async fn test_reject_reaches_target_and_group() {
        let (registry, rooms) = setup();
        let (bob, mut bob_rx) = connect(&registry, 2, "bob");
        let (_ann, mut ann_rx) = connect(&registry, 1, "ann");
        let (_cyd, mut cyd_rx) = connect(&registry, 3, "cyd");

        let signal = Signal {
            to: Some(1),
            group_id: Some(7),
            ..Signal::default()
        };
        rooms.handle(&bob, EnvelopeKind::CallReject, signal).await;

        // Caller gets the direct copy plus the group copy.
        assert_eq!(drain(&mut ann_rx).len(), 2);
        assert_eq!(drain(&mut cyd_rx).len(), 1);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_leave_all_only_removes_that_connection() {
        let (registry, rooms) = setup();
        let (old, _old_rx) = connect(&registry, 1, "ann");
        let (bob, _bob_rx) = connect(&registry, 2, "bob");

        rooms.join("r1", false, &old);
        rooms.join("r1", false, &bob);
        rooms.join("r2", false, &old);

        let (new, _new_rx) = connect(&registry, 1, "ann");
        rooms.join("r3", false, &new);

        assert_eq!(rooms.leave_all(1, old.id()), 2);
        assert_eq!(rooms.participants("r1"), vec![2]);
        assert!(!rooms.room_exists("r2"));
        assert_eq!(rooms.participants("r3"), vec![1]);
    }

    #[tokio::test]
    async fn test_leave_unknown_room() {
        let (_registry, rooms) = setup();
        assert!(!rooms.leave("nope", 1, None));
        assert_eq!(rooms.participant_count("nope"), 0);
        assert!(rooms.participants("nope").is_empty());
    }

    #[test]
    fn test_broadcast_excludes_sender() {
        let room = CallRoom::new("r1", true);
        let (a, mut a_rx) = ConnectionHandle::new(Identity::new(1, "a"), 4);
        let (b, mut b_rx) = ConnectionHandle::new(Identity::new(2, "b"), 4);
        room.add(a);
        room.add(b);

        let fan_out = room.broadcast(&Payload::from("ice"), 1);
        assert_eq!(fan_out.queued, 1);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.try_recv().unwrap().as_str(), "ice");
        assert!(room.is_group());
        assert!(room.contains(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_and_leave() {
        let (registry, rooms) = setup();
        let rooms = Arc::new(rooms);
        let (ann, _a) = connect(&registry, 1, "ann");
        let (bob, _b) = connect(&registry, 2, "bob");

        let mut tasks = Vec::new();
        for i in 0..200 {
            let rooms = rooms.clone();
            let (ann, bob) = (ann.clone(), bob.clone());
            tasks.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    rooms.join("busy", false, &ann);
                    rooms.leave("busy", 1, None);
                } else {
                    rooms.join("busy", false, &bob);
                    rooms.leave("busy", 2, None);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(!rooms.room_exists("busy"));
    }
}
