//! In-memory bus fake for pipeline tests
//!
//! Mimics the adapter's store semantics (create-if-absent and
//! revision-guarded updates) with yield points between fetch and write so
//! concurrent callers interleave the way they would against the real bus.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tanq_domain::observation::CREATOR;
use tanq_domain::{DomainName, ReportHistory};
use tanq_ports::{BusError, BusMessage, EventBus};

const SEEN_PREFIX: &str = "seen";
const OBSERVATION_PREFIX: &str = "observations";
const PRIVATE_PREFIX: &str = "private";

type FakeStore = Mutex<HashMap<String, (Vec<u8>, u64)>>;

pub struct FakeBus {
    seen: FakeStore,
    globally_new: FakeStore,
    markers: FakeStore,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    globally_new_writes: AtomicUsize,
    now: AtomicI64,
    event_tx: Mutex<Option<mpsc::Sender<BusMessage>>>,
    event_rx: Mutex<Option<mpsc::Receiver<BusMessage>>>,
}

impl FakeBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            seen: Mutex::new(HashMap::new()),
            globally_new: Mutex::new(HashMap::new()),
            markers: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            globally_new_writes: AtomicUsize::new(0),
            now: AtomicI64::new(1_700_000_000),
            event_tx: Mutex::new(Some(tx)),
            event_rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue events for delivery through `subscribe`.
    pub async fn stage_events(&self, events: Vec<BusMessage>) {
        let tx = self
            .event_tx
            .lock()
            .unwrap()
            .clone()
            .expect("subscription already closed");
        for event in events {
            tx.send(event).await.unwrap();
        }
    }

    /// Simulate the upstream subscription terminating.
    pub async fn close_subscription(&self) {
        self.event_tx.lock().unwrap().take();
    }

    pub fn history(&self, key: &str) -> Option<ReportHistory> {
        let seen = self.seen.lock().unwrap();
        let (value, _) = seen.get(key)?;
        Some(serde_json::from_slice(value).unwrap())
    }

    pub fn has_globally_new(&self, key: &str) -> bool {
        self.globally_new.lock().unwrap().contains_key(key)
    }

    pub fn globally_new_writes(&self) -> usize {
        self.globally_new_writes.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// True when no store was touched and nothing was published.
    pub fn is_unwritten(&self) -> bool {
        self.seen.lock().unwrap().is_empty()
            && self.globally_new.lock().unwrap().is_empty()
            && self.markers.lock().unwrap().is_empty()
            && self.published.lock().unwrap().is_empty()
    }

    fn tick(&self) -> i64 {
        self.now.fetch_add(1, Ordering::SeqCst)
    }

    /// Create-if-absent followed by revision-guarded refresh, shared by the
    /// globally-new and edge-marker paths.
    async fn upsert(store: &FakeStore, key: String, value: Vec<u8>) -> Result<(), BusError> {
        let existing = store.lock().unwrap().get(&key).cloned();
        tokio::task::yield_now().await;
        match existing {
            None => {
                store
                    .lock()
                    .unwrap()
                    .entry(key)
                    .or_insert((value, 1));
                Ok(())
            }
            Some((_, revision)) => {
                let mut map = store.lock().unwrap();
                match map.get_mut(&key) {
                    Some((stored, rev)) if *rev == revision => {
                        *stored = value;
                        *rev += 1;
                        Ok(())
                    }
                    _ => Err(BusError::RevisionConflict { key }),
                }
            }
        }
    }
}

impl EventBus for FakeBus {
    async fn subscribe(
        &self,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        self.event_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(BusError::Subscribe {
                message: "subscription already taken".to_string(),
            })
    }

    async fn add_domain(
        &self,
        _cancel: &CancellationToken,
        domain: &DomainName,
        reporter: &str,
    ) -> Result<bool, BusError> {
        let key = domain.subject(SEEN_PREFIX, "");

        let existing = self.seen.lock().unwrap().get(&key).cloned();
        tokio::task::yield_now().await;

        let (value, revision) = match existing {
            None => {
                let history = ReportHistory::first(reporter, self.tick());
                let payload = serde_json::to_vec(&history).unwrap();
                let mut seen = self.seen.lock().unwrap();
                match seen.entry(key.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert((payload, 1));
                        return Ok(false);
                    }
                    // Lost the create race; continue on the existing entry.
                    Entry::Occupied(slot) => slot.get().clone(),
                }
            }
            Some(entry) => entry,
        };

        let mut history: ReportHistory = serde_json::from_slice(&value).unwrap();
        if !history.record(reporter, self.tick()) {
            return Ok(true);
        }
        let payload = serde_json::to_vec(&history).unwrap();

        tokio::task::yield_now().await;
        let mut seen = self.seen.lock().unwrap();
        match seen.get_mut(&key) {
            Some((stored, rev)) if *rev == revision => {
                *stored = payload;
                *rev += 1;
                Ok(true)
            }
            _ => Err(BusError::RevisionConflict { key }),
        }
    }

    async fn set_observation_globally_new(
        &self,
        _cancel: &CancellationToken,
        domain: &DomainName,
    ) -> Result<(), BusError> {
        let prefix = format!("{OBSERVATION_PREFIX}.globally_new");
        let key = domain.subject(&prefix, "");
        self.globally_new_writes.fetch_add(1, Ordering::SeqCst);
        Self::upsert(&self.globally_new, key, CREATOR.as_bytes().to_vec()).await
    }

    async fn refresh_edge_marker(
        &self,
        _cancel: &CancellationToken,
        domain: &DomainName,
        reporter: &str,
    ) -> Result<(), BusError> {
        let key = domain.subject(PRIVATE_PREFIX, reporter);
        let value = self.tick().to_string().into_bytes();
        Self::upsert(&self.markers, key, value).await
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((subject.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        Ok(())
    }
}
