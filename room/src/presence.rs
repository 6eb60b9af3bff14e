//! Room membership over the shared store
//!
//! Two-party rooms keep both roles on the room document itself. Mesh rooms
//! keep one participant document per client id. In both cases a member
//! counts as active only while its `lastSeen` is fresh; staleness is derived
//! on read and never written back outside of a join.

use log::{debug, info, warn};
use room_core::{is_live, ClientId, Error, Role, RoomCode, Seat, SharedClock, Topology};
use serde_json::{json, Value};
use store::{layout, run_transaction, Fields, ReadSet, SharedStore, StoreError, Subscription, Write};
use store::{DocPath, DocumentSnapshot, Query, QuerySnapshot};

/// Result of a join attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined(Seat),
    Full,
    Error(String),
}

fn u64_field(fields: &Fields, name: &str) -> Option<u64> {
    fields.get(name).and_then(Value::as_u64)
}

fn bool_field(fields: &Fields, name: &str) -> bool {
    fields.get(name).and_then(Value::as_bool).unwrap_or(false)
}

/// Normalized two-party room document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomRecord {
    pub created_at: u64,
    pub host_joined: bool,
    pub guest_joined: bool,
    pub host_last_seen: u64,
    pub guest_last_seen: u64,
}

impl RoomRecord {
    /// Read a room document, filling anything missing or malformed.
    pub fn normalize(fields: Option<&Fields>, now: u64) -> Self {
        let Some(fields) = fields else {
            return Self {
                created_at: now,
                host_joined: false,
                guest_joined: false,
                host_last_seen: 0,
                guest_last_seen: 0,
            };
        };
        Self {
            created_at: u64_field(fields, "createdAt").unwrap_or(now),
            host_joined: bool_field(fields, "hostJoined"),
            guest_joined: bool_field(fields, "guestJoined"),
            host_last_seen: u64_field(fields, "hostLastSeen").unwrap_or(0),
            guest_last_seen: u64_field(fields, "guestLastSeen").unwrap_or(0),
        }
    }

    fn slot(&self, role: Role) -> (bool, u64) {
        match role {
            Role::Host => (self.host_joined, self.host_last_seen),
            Role::Guest => (self.guest_joined, self.guest_last_seen),
        }
    }

    fn set_slot(&mut self, role: Role, joined: bool, last_seen: u64) {
        match role {
            Role::Host => {
                self.host_joined = joined;
                self.host_last_seen = last_seen;
            }
            Role::Guest => {
                self.guest_joined = joined;
                self.guest_last_seen = last_seen;
            }
        }
    }

    pub fn is_active(&self, role: Role, now: u64, stale_ms: u64) -> bool {
        let (joined, last_seen) = self.slot(role);
        joined && is_live(last_seen, now, stale_ms)
    }

    /// Same record with every stale role rewritten as vacated.
    pub fn vacate_stale(&self, now: u64, stale_ms: u64) -> Self {
        let mut next = *self;
        for role in [Role::Host, Role::Guest] {
            if !self.is_active(role, now, stale_ms) {
                next.set_slot(role, false, 0);
            }
        }
        next
    }

    fn to_fields(self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("createdAt".into(), json!(self.created_at));
        fields.insert("hostJoined".into(), json!(self.host_joined));
        fields.insert("guestJoined".into(), json!(self.guest_joined));
        fields.insert("hostLastSeen".into(), json!(self.host_last_seen));
        fields.insert("guestLastSeen".into(), json!(self.guest_last_seen));
        fields
    }
}

/// Normalized mesh participant document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    pub id: String,
    pub joined_at: u64,
    pub last_seen: u64,
}

impl ParticipantRecord {
    /// Falls back to the document id when the record has no `id` field.
    pub fn normalize(doc_id: &str, fields: &Fields) -> Self {
        Self {
            id: fields
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or(doc_id)
                .to_string(),
            joined_at: u64_field(fields, "joinedAt").unwrap_or(0),
            last_seen: u64_field(fields, "lastSeen").unwrap_or(0),
        }
    }

    pub fn seat(&self) -> Option<Seat> {
        ClientId::parse(&self.id).map(Seat::Client)
    }
}

/// Membership as last delivered by a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceView {
    TwoParty(RoomRecord),
    /// Sorted by join time
    Mesh(Vec<ParticipantRecord>),
}

impl PresenceView {
    /// Seats that are active at `now`, ourselves included.
    pub fn active_seats(&self, now: u64, stale_ms: u64) -> Vec<Seat> {
        match self {
            PresenceView::TwoParty(record) => [Role::Host, Role::Guest]
                .into_iter()
                .filter(|role| record.is_active(*role, now, stale_ms))
                .map(Seat::Role)
                .collect(),
            PresenceView::Mesh(participants) => participants
                .iter()
                .filter(|p| is_live(p.last_seen, now, stale_ms))
                .filter_map(ParticipantRecord::seat)
                .collect(),
        }
    }
}

fn mesh_participants(docs: &[(String, Fields)]) -> Vec<ParticipantRecord> {
    let mut participants: Vec<ParticipantRecord> = docs
        .iter()
        .map(|(id, fields)| ParticipantRecord::normalize(id, fields))
        .collect();
    participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
    participants
}

enum WatchSource {
    Room(Subscription<DocumentSnapshot>),
    Participants(Subscription<QuerySnapshot>),
}

/// Live membership feed, normalized on delivery
pub struct PresenceWatch {
    source: WatchSource,
    clock: SharedClock,
}

impl PresenceWatch {
    /// Next view, or `None` once the store ended the subscription.
    pub async fn recv(&mut self) -> Option<PresenceView> {
        match &mut self.source {
            WatchSource::Room(sub) => {
                let snapshot = sub.recv().await?;
                let now = self.clock.now_ms();
                Some(PresenceView::TwoParty(RoomRecord::normalize(
                    snapshot.data.as_ref(),
                    now,
                )))
            }
            WatchSource::Participants(sub) => {
                let snapshot = sub.recv().await?;
                Some(PresenceView::Mesh(mesh_participants(&snapshot.docs)))
            }
        }
    }
}

/// Join, heartbeat, leave and watch one room
#[derive(Clone)]
pub struct PresenceAdapter {
    store: SharedStore,
    clock: SharedClock,
    code: RoomCode,
    topology: Topology,
    max_participants: usize,
    stale_ms: u64,
}

impl PresenceAdapter {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        code: RoomCode,
        topology: Topology,
        max_participants: usize,
        stale_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            code,
            topology,
            max_participants,
            stale_ms,
        }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn max_participants(&self) -> usize {
        match self.topology {
            Topology::TwoParty => self.max_participants.min(2),
            Topology::Mesh => self.max_participants,
        }
    }

    /// Reserve a seat, treating stale members as gone.
    pub async fn join(&self, client: &ClientId) -> JoinOutcome {
        let result = match self.topology {
            Topology::TwoParty => self.join_two_party().await,
            Topology::Mesh => self.join_mesh(client).await,
        };
        match result {
            Ok(Some(seat)) => {
                info!("Joined room {} as {}", self.code, seat);
                JoinOutcome::Joined(seat)
            }
            Ok(None) => {
                info!("Room {} is full", self.code);
                JoinOutcome::Full
            }
            Err(e) => {
                warn!("Join of room {} failed: {}", self.code, e);
                JoinOutcome::Error(e.to_string())
            }
        }
    }

    async fn join_two_party(&self) -> Result<Option<Seat>, StoreError> {
        let path = layout::room(&self.code);
        let reads = ReadSet::new().doc(path.clone());
        let stale_ms = self.stale_ms;
        let capacity = self.max_participants();
        let clock = self.clock.clone();

        run_transaction(self.store.as_ref(), &reads, |view| {
            let now = clock.now_ms();
            let mut next = RoomRecord::normalize(view.doc(&path), now).vacate_stale(now, stale_ms);

            let free = [Role::Host, Role::Guest]
                .into_iter()
                .take(capacity)
                .find(|role| !next.slot(*role).0);
            let Some(role) = free else {
                return Ok((None, Vec::new()));
            };
            next.set_slot(role, true, now);
            let write = Write::Set {
                path: path.clone(),
                fields: next.to_fields(),
                merge: true,
            };
            Ok((Some(Seat::Role(role)), vec![write]))
        })
        .await
    }

    async fn join_mesh(&self, client: &ClientId) -> Result<Option<Seat>, StoreError> {
        let room = layout::room(&self.code);
        let participants = layout::participants(&self.code);
        let own = participants.doc(client.as_str());
        let reads = ReadSet::new()
            .doc(room.clone())
            .collection(participants.clone());
        let stale_ms = self.stale_ms;
        let capacity = self.max_participants();
        let clock = self.clock.clone();

        run_transaction(self.store.as_ref(), &reads, |view| {
            let now = clock.now_ms();
            let active: Vec<ParticipantRecord> = mesh_participants(view.collection(&participants))
                .into_iter()
                .filter(|p| is_live(p.last_seen, now, stale_ms))
                .collect();

            let mut writes = Vec::new();
            if view.doc(&room).is_none() {
                let mut fields = Fields::new();
                fields.insert("createdAt".into(), json!(now));
                writes.push(Write::Set {
                    path: room.clone(),
                    fields,
                    merge: true,
                });
            }

            let mut fields = Fields::new();
            fields.insert("id".into(), json!(client.as_str()));
            fields.insert("lastSeen".into(), json!(now));
            if active.iter().any(|p| p.id == client.as_str()) {
                debug!("Client {} keeps its existing slot", client);
            } else if active.len() >= capacity {
                return Ok((None, Vec::new()));
            } else {
                fields.insert("joinedAt".into(), json!(now));
            }
            writes.push(Write::Set {
                path: own.clone(),
                fields,
                merge: true,
            });
            Ok((Some(Seat::Client(client.clone())), writes))
        })
        .await
    }

    fn seat_path(&self, seat: &Seat) -> DocPath {
        match seat {
            Seat::Role(_) => layout::room(&self.code),
            Seat::Client(id) => layout::participants(&self.code).doc(id.as_str()),
        }
    }

    /// Stamp our liveness.
    pub async fn heartbeat(&self, seat: &Seat) -> Result<(), Error> {
        let now = self.clock.now_ms();
        let mut fields = Fields::new();
        match seat {
            Seat::Role(role) => {
                fields.insert(format!("{}Joined", role.as_str()), json!(true));
                fields.insert(format!("{}LastSeen", role.as_str()), json!(now));
            }
            Seat::Client(id) => {
                fields.insert("id".into(), json!(id.as_str()));
                fields.insert("lastSeen".into(), json!(now));
            }
        }
        self.store.set(&self.seat_path(seat), fields, true).await?;
        debug!("Heartbeat for {} in room {}", seat, self.code);
        Ok(())
    }

    /// Give up our seat. Other clients would evict us by staleness anyway.
    pub async fn leave(&self, seat: &Seat) -> Result<(), Error> {
        let path = self.seat_path(seat);
        match seat {
            Seat::Role(role) => {
                let mut fields = Fields::new();
                fields.insert(format!("{}Joined", role.as_str()), json!(false));
                fields.insert(format!("{}LastSeen", role.as_str()), json!(0));
                self.store.set(&path, fields, true).await?;
            }
            Seat::Client(_) => self.store.delete(&path).await?,
        }
        info!("{} left room {}", seat, self.code);
        Ok(())
    }

    pub fn subscribe(&self) -> Result<PresenceWatch, Error> {
        let source = match self.topology {
            Topology::TwoParty => {
                WatchSource::Room(self.store.watch_document(&layout::room(&self.code))?)
            }
            Topology::Mesh => WatchSource::Participants(
                self.store
                    .watch_query(Query::new(layout::participants(&self.code)))?,
            ),
        };
        Ok(PresenceWatch {
            source,
            clock: self.clock.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_core::{Clock, ManualClock, STALE_MS};
    use std::sync::Arc;
    use store::{DocumentStore, MemoryStore};

    const START: u64 = 1_700_000_000_000;

    fn setup(topology: Topology, max: usize) -> (MemoryStore, ManualClock, PresenceAdapter) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(START);
        let adapter = PresenceAdapter::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            RoomCode::parse("4821").unwrap(),
            topology,
            max,
            STALE_MS,
        );
        (store, clock, adapter)
    }

    fn client(name: &str) -> ClientId {
        ClientId::parse(&format!("{}-client", name)).unwrap()
    }

    #[tokio::test]
    async fn two_party_assigns_host_then_guest_then_full() {
        let (store, _clock, presence) = setup(Topology::TwoParty, 2);

        assert_eq!(presence.join(&client("a")).await, JoinOutcome::Joined(Seat::Role(Role::Host)));
        assert_eq!(presence.join(&client("b")).await, JoinOutcome::Joined(Seat::Role(Role::Guest)));
        assert_eq!(presence.join(&client("c")).await, JoinOutcome::Full);

        let code = RoomCode::parse("4821").unwrap();
        let doc = store.get(&layout::room(&code)).await.unwrap();
        let record = RoomRecord::normalize(doc.data.as_ref(), 0);
        assert_eq!(record.created_at, START);
        assert!(record.host_joined && record.guest_joined);
    }

    #[tokio::test]
    async fn stale_role_is_taken_over() {
        let (_store, clock, presence) = setup(Topology::TwoParty, 2);
        presence.join(&client("a")).await;
        presence.join(&client("b")).await;

        clock.advance(STALE_MS + 1);
        presence.heartbeat(&Seat::Role(Role::Guest)).await.unwrap();

        assert_eq!(presence.join(&client("c")).await, JoinOutcome::Joined(Seat::Role(Role::Host)));
    }

    #[tokio::test]
    async fn heartbeat_restores_eligibility() {
        let (_store, clock, presence) = setup(Topology::TwoParty, 2);
        presence.join(&client("a")).await;
        let mut watch = presence.subscribe().unwrap();

        clock.advance(STALE_MS + 1);
        let view = watch.recv().await.unwrap();
        assert!(view.active_seats(clock.now_ms(), STALE_MS).is_empty());

        presence.heartbeat(&Seat::Role(Role::Host)).await.unwrap();
        let view = watch.recv().await.unwrap();
        assert_eq!(
            view.active_seats(clock.now_ms(), STALE_MS),
            vec![Seat::Role(Role::Host)]
        );
    }

    #[tokio::test]
    async fn leave_frees_the_role() {
        let (_store, _clock, presence) = setup(Topology::TwoParty, 2);
        presence.join(&client("a")).await;
        presence.join(&client("b")).await;

        presence.leave(&Seat::Role(Role::Host)).await.unwrap();
        assert_eq!(presence.join(&client("c")).await, JoinOutcome::Joined(Seat::Role(Role::Host)));
    }

    #[tokio::test]
    async fn mesh_capacity_and_rejoin() {
        let (_store, clock, presence) = setup(Topology::Mesh, 2);
        let a = client("a");
        let b = client("b");

        assert_eq!(presence.join(&a).await, JoinOutcome::Joined(Seat::Client(a.clone())));
        clock.advance(10);
        assert_eq!(presence.join(&b).await, JoinOutcome::Joined(Seat::Client(b.clone())));
        assert_eq!(presence.join(&client("c")).await, JoinOutcome::Full);

        // A reconnecting client keeps its slot and its join time
        clock.advance(10);
        assert_eq!(presence.join(&a).await, JoinOutcome::Joined(Seat::Client(a.clone())));

        let mut watch = presence.subscribe().unwrap();
        let PresenceView::Mesh(participants) = watch.recv().await.unwrap() else {
            panic!("expected a mesh view");
        };
        let ids: Vec<&str> = participants.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);
        assert_eq!(participants[0].joined_at, START);
        assert_eq!(participants[0].last_seen, START + 20);
    }

    #[tokio::test]
    async fn mesh_leave_deletes_the_record() {
        let (store, _clock, presence) = setup(Topology::Mesh, 2);
        let a = client("a");
        presence.join(&a).await;
        presence.leave(&Seat::Client(a.clone())).await.unwrap();

        let code = RoomCode::parse("4821").unwrap();
        let doc = store
            .get(&layout::participants(&code).doc(a.as_str()))
            .await
            .unwrap();
        assert!(!doc.exists());
        assert!(presence.join(&client("b")).await != JoinOutcome::Full);
    }

    #[tokio::test]
    async fn mesh_stale_member_is_not_counted() {
        let (_store, clock, presence) = setup(Topology::Mesh, 1);
        presence.join(&client("a")).await;
        assert_eq!(presence.join(&client("b")).await, JoinOutcome::Full);

        clock.advance(STALE_MS + 1);
        let b = client("b");
        assert_eq!(presence.join(&b).await, JoinOutcome::Joined(Seat::Client(b)));
    }

    #[tokio::test]
    async fn unavailable_store_reports_an_error() {
        let (store, _clock, presence) = setup(Topology::TwoParty, 2);
        store.set_offline(true);
        assert!(matches!(presence.join(&client("a")).await, JoinOutcome::Error(_)));
    }

    #[test]
    fn malformed_room_document_is_normalized() {
        let mut fields = Fields::new();
        fields.insert("hostJoined".into(), json!("yes"));
        fields.insert("hostLastSeen".into(), json!(-4));
        let record = RoomRecord::normalize(Some(&fields), 99);
        assert_eq!(record.created_at, 99);
        assert!(!record.host_joined);
        assert_eq!(record.host_last_seen, 0);
    }
}
