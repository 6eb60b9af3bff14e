//! Offer, answer and ICE candidate exchange through the shared store
//!
//! Two-party rooms use one fixed offer slot and one fixed answer slot,
//! overwritten on each publish, and candidates tagged with the owner role.
//! Mesh rooms append every record to shared collections tagged with the
//! sender and recipient, and each client queries for the records addressed
//! to it by a given peer.

use log::{debug, trace, warn};
use room_core::{Error, RoomCode, Seat, SessionId, SharedClock, Topology};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use store::{
    from_fields, layout, to_fields, ChangeKind, DocPath, DocumentSnapshot, Query, QuerySnapshot,
    SharedStore, Subscription,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peer::{IceCandidate, SdpType, SessionDescription};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalRecord {
    #[serde(rename = "type")]
    sdp_type: SdpType,
    sdp: String,
    created_at: u64,
    session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateRecord {
    candidate: IceCandidate,
    created_at: u64,
    session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// One record received from a remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundSignal {
    pub record_id: String,
    pub session_id: SessionId,
    pub created_at: u64,
    pub payload: SignalPayload,
}

/// Ids of records already handed to the consumer.
#[derive(Debug, Default)]
pub struct ProcessedIds {
    seen: HashSet<String>,
}

impl ProcessedIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `id` and returns true the first time it is seen.
    pub fn first_time(&mut self, id: &str) -> bool {
        self.seen.insert(id.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Inbound records from one remote peer. Dropping it ends the underlying
/// store subscriptions.
pub struct PeerSignals {
    receiver: mpsc::UnboundedReceiver<InboundSignal>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerSignals {
    pub async fn recv(&mut self) -> Option<InboundSignal> {
        self.receiver.recv().await
    }
}

impl Drop for PeerSignals {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Publishes and subscribes to signaling records for one local seat.
#[derive(Clone)]
pub struct SignalingExchange {
    store: SharedStore,
    clock: SharedClock,
    code: RoomCode,
    local: Seat,
    topology: Topology,
}

impl SignalingExchange {
    pub fn new(
        store: SharedStore,
        clock: SharedClock,
        code: RoomCode,
        local: Seat,
        topology: Topology,
    ) -> Self {
        Self {
            store,
            clock,
            code,
            local,
            topology,
        }
    }

    pub fn local(&self) -> &Seat {
        &self.local
    }

    /// Publish an offer or answer for `to`.
    pub async fn publish_description(
        &self,
        to: &Seat,
        session: &SessionId,
        desc: &SessionDescription,
    ) -> Result<(), Error> {
        let mut record = SignalRecord {
            sdp_type: desc.sdp_type,
            sdp: desc.sdp.clone(),
            created_at: self.clock.now_ms(),
            session_id: session.as_str().to_string(),
            from: None,
            to: None,
        };
        debug!(
            "Publishing {:?} for session {} to {}",
            desc.sdp_type, session, to
        );
        match self.topology {
            Topology::TwoParty => {
                let slot = match desc.sdp_type {
                    SdpType::Offer => layout::offer(&self.code),
                    SdpType::Answer => layout::answer(&self.code),
                };
                self.store.set(&slot, to_fields(&record)?, false).await?;
            }
            Topology::Mesh => {
                record.from = Some(self.local.key().to_string());
                record.to = Some(to.key().to_string());
                self.store
                    .add(&layout::signals(&self.code), to_fields(&record)?)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn publish_candidate(
        &self,
        to: &Seat,
        session: &SessionId,
        candidate: &IceCandidate,
    ) -> Result<(), Error> {
        let mut record = CandidateRecord {
            candidate: candidate.clone(),
            created_at: self.clock.now_ms(),
            session_id: session.as_str().to_string(),
            owner: None,
            from: None,
            to: None,
        };
        match self.topology {
            Topology::TwoParty => record.owner = Some(self.local.key().to_string()),
            Topology::Mesh => {
                record.from = Some(self.local.key().to_string());
                record.to = Some(to.key().to_string());
            }
        }
        trace!("Publishing candidate for session {} to {}", session, to);
        self.store
            .add(&layout::candidates(&self.code), to_fields(&record)?)
            .await?;
        Ok(())
    }

    /// Subscribe to everything `remote` sends us.
    pub fn subscribe(&self, remote: &Seat) -> Result<PeerSignals, Error> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        match self.topology {
            Topology::TwoParty => {
                // The remote only ever writes the slot matching its side
                let slot = if remote.offers_to(&self.local) {
                    layout::offer(&self.code)
                } else {
                    layout::answer(&self.code)
                };
                let docs = self.store.watch_document(&slot)?;
                tasks.push(spawn_slot_reader(slot, docs, sender.clone()));

                let candidates = Query::new(layout::candidates(&self.code))
                    .where_eq("owner", remote.key());
                let feed = self.store.watch_query(candidates)?;
                tasks.push(spawn_candidate_reader(feed, sender));
            }
            Topology::Mesh => {
                let signals = Query::new(layout::signals(&self.code))
                    .where_eq("from", remote.key())
                    .where_eq("to", self.local.key());
                let feed = self.store.watch_query(signals)?;
                tasks.push(spawn_signal_reader(feed, sender.clone()));

                let candidates = Query::new(layout::candidates(&self.code))
                    .where_eq("from", remote.key())
                    .where_eq("to", self.local.key());
                let feed = self.store.watch_query(candidates)?;
                tasks.push(spawn_candidate_reader(feed, sender));
            }
        }

        Ok(PeerSignals { receiver, tasks })
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }
}

fn description_signal(record_id: String, record: SignalRecord) -> InboundSignal {
    InboundSignal {
        record_id,
        session_id: SessionId::from(record.session_id.as_str()),
        created_at: record.created_at,
        payload: SignalPayload::Description(SessionDescription {
            sdp_type: record.sdp_type,
            sdp: record.sdp,
        }),
    }
}

/// Added documents of a query snapshot in creation order.
fn added_in_order<T: DeserializeOwned>(
    snapshot: QuerySnapshot,
    created_at: impl Fn(&T) -> u64,
) -> Vec<(String, T)> {
    let mut added: Vec<(String, T)> = snapshot
        .changes
        .into_iter()
        .filter(|change| change.kind == ChangeKind::Added)
        .filter_map(|change| match from_fields::<T>(&change.data) {
            Ok(record) => Some((change.id, record)),
            Err(e) => {
                debug!("Skipping malformed signaling record {}: {}", change.id, e);
                None
            }
        })
        .collect();
    added.sort_by_key(|(_, record)| created_at(record));
    added
}

fn spawn_slot_reader(
    slot: DocPath,
    mut docs: Subscription<DocumentSnapshot>,
    sender: mpsc::UnboundedSender<InboundSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut processed = ProcessedIds::new();
        while let Some(snapshot) = docs.recv().await {
            let Some(data) = snapshot.data else {
                continue;
            };
            let record: SignalRecord = match from_fields(&data) {
                Ok(record) => record,
                Err(e) => {
                    warn!("Malformed signal in {}: {}", slot, e);
                    continue;
                }
            };
            let record_id = singleton_record_id(&record);
            if !processed.first_time(&record_id) {
                continue;
            }
            if sender.send(description_signal(record_id, record)).is_err() {
                break;
            }
        }
    })
}

fn spawn_signal_reader(
    mut feed: Subscription<QuerySnapshot>,
    sender: mpsc::UnboundedSender<InboundSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut processed = ProcessedIds::new();
        while let Some(snapshot) = feed.recv().await {
            for (id, record) in added_in_order(snapshot, |r: &SignalRecord| r.created_at) {
                if !processed.first_time(&id) {
                    continue;
                }
                if sender.send(description_signal(id, record)).is_err() {
                    return;
                }
            }
        }
    })
}

fn spawn_candidate_reader(
    mut feed: Subscription<QuerySnapshot>,
    sender: mpsc::UnboundedSender<InboundSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut processed = ProcessedIds::new();
        while let Some(snapshot) = feed.recv().await {
            for (id, record) in added_in_order(snapshot, |r: &CandidateRecord| r.created_at) {
                if !processed.first_time(&id) {
                    continue;
                }
                let signal = InboundSignal {
                    record_id: id,
                    session_id: SessionId::from(record.session_id.as_str()),
                    created_at: record.created_at,
                    payload: SignalPayload::Candidate(record.candidate),
                };
                if sender.send(signal).is_err() {
                    return;
                }
            }
        }
    })
}

/// Singleton slots are overwritten in place, so the record identity is
/// derived from its content.
fn singleton_record_id(record: &SignalRecord) -> String {
    let kind = match record.sdp_type {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    };
    format!("{}:{}:{}", kind, record.session_id, record.created_at)
}
