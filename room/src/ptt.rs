//! Push-to-talk lease lock
//!
//! One `state/ptt` document per room. A holder owns the channel until
//! `expiresAt`, so a client that vanishes without releasing blocks the
//! others for at most one lease.

use log::{debug, info};
use room_core::{Error, RoomCode, Seat, SharedClock, Topology};
use serde_json::{json, Value};
use store::{layout, run_transaction, DocPath, DocumentSnapshot, Fields, ReadSet};
use store::{SharedStore, Subscription, Write};

const NO_HOLDER: &str = "none";

/// Normalized lock record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PttState {
    pub holder: Option<Seat>,
    pub expires_at: u64,
    pub updated_at: u64,
}

impl PttState {
    pub fn free(now: u64) -> Self {
        Self {
            holder: None,
            expires_at: 0,
            updated_at: now,
        }
    }

    /// Read a lock document as of `now`. Expired claims and holders that do
    /// not fit the room topology read as free.
    pub fn normalize(fields: Option<&Fields>, now: u64, topology: Topology) -> Self {
        let Some(fields) = fields else {
            return Self::free(now);
        };
        let holder = fields
            .get("holder")
            .and_then(Value::as_str)
            .and_then(Seat::from_key)
            .filter(|seat| match topology {
                Topology::TwoParty => seat.role().is_some(),
                Topology::Mesh => seat.role().is_none(),
            });
        let expires_at = fields.get("expiresAt").and_then(Value::as_u64).unwrap_or(0);
        let updated_at = fields
            .get("updatedAt")
            .and_then(Value::as_u64)
            .unwrap_or(now);

        if holder.is_none() || expires_at <= now {
            return Self {
                holder: None,
                expires_at: 0,
                updated_at,
            };
        }
        Self {
            holder,
            expires_at,
            updated_at,
        }
    }

    pub fn is_held_by(&self, seat: &Seat) -> bool {
        self.holder.as_ref() == Some(seat)
    }

    /// The same state re-read at a later `now`.
    pub fn at(&self, now: u64) -> Self {
        if self.holder.is_some() && self.expires_at <= now {
            return Self {
                holder: None,
                expires_at: 0,
                updated_at: self.updated_at,
            };
        }
        self.clone()
    }

    fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        let holder = self.holder.as_ref().map(Seat::key).unwrap_or(NO_HOLDER);
        fields.insert("holder".into(), json!(holder));
        fields.insert("expiresAt".into(), json!(self.expires_at));
        fields.insert("updatedAt".into(), json!(self.updated_at));
        fields
    }
}

/// Live lock feed, normalized on delivery
pub struct PttWatch {
    sub: Subscription<DocumentSnapshot>,
    clock: SharedClock,
    topology: Topology,
}

impl PttWatch {
    pub async fn recv(&mut self) -> Option<PttState> {
        let snapshot = self.sub.recv().await?;
        Some(PttState::normalize(
            snapshot.data.as_ref(),
            self.clock.now_ms(),
            self.topology,
        ))
    }
}

/// Lease lock operations for one room
#[derive(Clone)]
pub struct PttLock {
    store: SharedStore,
    clock: SharedClock,
    path: DocPath,
    topology: Topology,
    lease_ms: u64,
}

impl PttLock {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        code: &RoomCode,
        topology: Topology,
        lease_ms: u64,
    ) -> Self {
        Self {
            store,
            clock,
            path: layout::ptt(code),
            topology,
            lease_ms,
        }
    }

    fn reads(&self) -> ReadSet {
        ReadSet::new().doc(self.path.clone())
    }

    fn write(&self, state: &PttState) -> Write {
        Write::Set {
            path: self.path.clone(),
            fields: state.to_fields(),
            merge: true,
        }
    }

    /// Create a free lock record if none exists yet.
    pub async fn ensure(&self) -> Result<(), Error> {
        let created = run_transaction(self.store.as_ref(), &self.reads(), |view| {
            if view.doc(&self.path).is_some() {
                return Ok((false, Vec::new()));
            }
            let state = PttState::free(self.clock.now_ms());
            Ok((true, vec![self.write(&state)]))
        })
        .await?;
        if created {
            debug!("Created PTT lock at {}", self.path);
        }
        Ok(())
    }

    /// Claim the channel. Returns whether `seat` now holds it.
    pub async fn acquire(&self, seat: &Seat) -> Result<bool, Error> {
        let acquired = run_transaction(self.store.as_ref(), &self.reads(), |view| {
            let now = self.clock.now_ms();
            let current = PttState::normalize(view.doc(&self.path), now, self.topology);
            if current.holder.is_some() && !current.is_held_by(seat) {
                return Ok((false, Vec::new()));
            }
            let claim = PttState {
                holder: Some(seat.clone()),
                expires_at: now + self.lease_ms,
                updated_at: now,
            };
            Ok((true, vec![self.write(&claim)]))
        })
        .await?;
        if acquired {
            info!("{} acquired the PTT lock", seat);
        } else {
            debug!("{} was refused the PTT lock", seat);
        }
        Ok(acquired)
    }

    /// Extend the lease. Returns `false` when `seat` no longer holds it.
    pub async fn refresh(&self, seat: &Seat) -> Result<bool, Error> {
        let refreshed = run_transaction(self.store.as_ref(), &self.reads(), |view| {
            let now = self.clock.now_ms();
            let current = PttState::normalize(view.doc(&self.path), now, self.topology);
            if !current.is_held_by(seat) {
                return Ok((false, Vec::new()));
            }
            let extended = PttState {
                holder: Some(seat.clone()),
                expires_at: now + self.lease_ms,
                updated_at: now,
            };
            Ok((true, vec![self.write(&extended)]))
        })
        .await?;
        Ok(refreshed)
    }

    /// Free the channel if `seat` holds it. Returns whether it did.
    pub async fn release(&self, seat: &Seat) -> Result<bool, Error> {
        let released = run_transaction(self.store.as_ref(), &self.reads(), |view| {
            let now = self.clock.now_ms();
            let current = PttState::normalize(view.doc(&self.path), now, self.topology);
            if !current.is_held_by(seat) {
                return Ok((false, Vec::new()));
            }
            Ok((true, vec![self.write(&PttState::free(now))]))
        })
        .await?;
        if released {
            info!("{} released the PTT lock", seat);
        }
        Ok(released)
    }

    pub fn watch(&self) -> Result<PttWatch, Error> {
        Ok(PttWatch {
            sub: self.store.watch_document(&self.path)?,
            clock: self.clock.clone(),
            topology: self.topology,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_core::{ClientId, Clock, ManualClock, Role, PTT_LEASE_MS};
    use std::sync::Arc;
    use store::{DocumentStore, MemoryStore};

    const START: u64 = 1_700_000_000_000;

    fn host() -> Seat {
        Seat::Role(Role::Host)
    }

    fn guest() -> Seat {
        Seat::Role(Role::Guest)
    }

    fn setup() -> (MemoryStore, ManualClock, PttLock) {
        let store = MemoryStore::new();
        let clock = ManualClock::new(START);
        let lock = PttLock::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            &RoomCode::parse("4821").unwrap(),
            Topology::TwoParty,
            PTT_LEASE_MS,
        );
        (store, clock, lock)
    }

    async fn current(store: &MemoryStore, clock: &ManualClock) -> PttState {
        let doc = store
            .get(&layout::ptt(&RoomCode::parse("4821").unwrap()))
            .await
            .unwrap();
        PttState::normalize(doc.data.as_ref(), clock.now_ms(), Topology::TwoParty)
    }

    #[tokio::test]
    async fn ensure_creates_once() {
        let (store, clock, lock) = setup();
        lock.ensure().await.unwrap();
        assert_eq!(current(&store, &clock).await, PttState::free(START));

        lock.acquire(&host()).await.unwrap();
        lock.ensure().await.unwrap();
        assert!(current(&store, &clock).await.is_held_by(&host()));
    }

    #[tokio::test]
    async fn only_one_holder_at_a_time() {
        let (store, clock, lock) = setup();
        lock.ensure().await.unwrap();

        assert!(lock.acquire(&host()).await.unwrap());
        assert!(!lock.acquire(&guest()).await.unwrap());
        // Re-acquiring our own claim extends it
        clock.advance(500);
        assert!(lock.acquire(&host()).await.unwrap());
        assert_eq!(current(&store, &clock).await.expires_at, START + 500 + PTT_LEASE_MS);

        assert!(lock.release(&host()).await.unwrap());
        assert!(lock.acquire(&guest()).await.unwrap());
        assert!(!lock.acquire(&host()).await.unwrap());
    }

    #[tokio::test]
    async fn release_by_non_holder_is_a_no_op() {
        let (store, clock, lock) = setup();
        lock.acquire(&host()).await.unwrap();

        assert!(!lock.release(&guest()).await.unwrap());
        assert!(current(&store, &clock).await.is_held_by(&host()));
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken() {
        let (_store, clock, lock) = setup();
        assert!(lock.acquire(&host()).await.unwrap());

        clock.advance(PTT_LEASE_MS - 1);
        assert!(!lock.acquire(&guest()).await.unwrap());

        clock.advance(1);
        assert!(lock.acquire(&guest()).await.unwrap());
        // The old holder can no longer refresh
        assert!(!lock.refresh(&host()).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_keeps_the_lease_alive() {
        let (_store, clock, lock) = setup();
        lock.acquire(&host()).await.unwrap();
        for _ in 0..5 {
            clock.advance(1_000);
            assert!(lock.refresh(&host()).await.unwrap());
        }
        assert!(!lock.acquire(&guest()).await.unwrap());
        assert!(!lock.refresh(&guest()).await.unwrap());
    }

    #[tokio::test]
    async fn watch_reports_normalized_states() {
        let (_store, clock, lock) = setup();
        let mut watch = lock.watch().unwrap();
        // Absent document reads as free
        assert_eq!(watch.recv().await.unwrap().holder, None);

        lock.acquire(&host()).await.unwrap();
        assert_eq!(watch.recv().await.unwrap().holder, Some(host()));

        lock.release(&host()).await.unwrap();
        assert_eq!(watch.recv().await.unwrap().holder, None);
        assert_eq!(clock.now_ms(), START);
    }

    #[test]
    fn normalization_rules() {
        let now = 10_000;
        let mut fields = Fields::new();
        fields.insert("holder".into(), json!("guest"));
        fields.insert("expiresAt".into(), json!(now));
        let expired = PttState::normalize(Some(&fields), now, Topology::TwoParty);
        assert_eq!(expired.holder, None);
        assert_eq!(expired.expires_at, 0);
        assert_eq!(expired.updated_at, now);

        fields.insert("expiresAt".into(), json!(now + 1));
        let held = PttState::normalize(Some(&fields), now, Topology::TwoParty);
        assert_eq!(held.holder, Some(guest()));
        assert_eq!(held.at(now + 1).holder, None);

        // Mesh rooms only accept client ids as holders
        assert_eq!(PttState::normalize(Some(&fields), now, Topology::Mesh).holder, None);
        let client = ClientId::parse("aaaaaaaa-1").unwrap();
        fields.insert("holder".into(), json!(client.as_str()));
        assert_eq!(
            PttState::normalize(Some(&fields), now, Topology::Mesh).holder,
            Some(Seat::Client(client))
        );

        fields.insert("holder".into(), json!("somebody"));
        assert_eq!(PttState::normalize(Some(&fields), now, Topology::TwoParty).holder, None);
    }
}
