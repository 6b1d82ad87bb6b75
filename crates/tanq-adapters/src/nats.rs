//! NATS JetStream message bus adapter
//!
//! Wraps the bus connection, the core-NATS event subscription, and the
//! three KV stores the analyst works against:
//! - `seen_domains`: per-domain report histories, no TTL, created if absent
//! - `globally_new`: fleet-wide first-sight markers, pre-provisioned by the
//!   platform and bound read/write
//! - the private bucket: TTL-bounded per-edge markers, created if absent
//!
//! All KV keys are the domain's labels reversed under a configured prefix,
//! so the stores shard along the DNS hierarchy and operators can watch
//! whole TLDs with subject wildcards.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tanq_domain::observation::CREATOR;
use tanq_domain::{DomainName, ReportHistory};
use tanq_ports::{BusError, BusMessage, Clock, EventBus, SIGNIFICANT_HEADERS};

/// Timeout for the initial connection and KV binds.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the raw message buffer between the subscription and the
/// worker pool's job queue. Bounded so bus bursts back-pressure into the
/// client instead of growing the heap.
const RAW_BUFFER: usize = 100;

/// Entry lifetime in the private (per-edge marker) bucket.
const PRIVATE_TTL: Duration = Duration::from_secs(60);

/// Bus adapter configuration, taken from the `[nats]` config table.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Literal subject of the event subscription.
    pub event_subject: String,
    /// Prefix for observation publishes and `globally_new` keys.
    pub observation_subject_prefix: String,
    /// Prefix for per-edge marker keys.
    pub private_subject_prefix: String,
    /// Prefix for report-history keys.
    pub seen_domains_subject_prefix: String,
    pub globally_new_bucket: String,
    pub private_bucket: String,
    pub seen_domains_bucket: String,
}

impl NatsConfig {
    /// Key in `seen_domains` holding the report history for `domain`.
    fn seen_key(&self, domain: &DomainName) -> String {
        domain.subject(&self.seen_domains_subject_prefix, "")
    }

    /// Key in `globally_new` marking first sight of `domain`, which doubles
    /// as the observation publish subject.
    fn globally_new_key(&self, domain: &DomainName) -> String {
        let prefix = format!("{}.globally_new", self.observation_subject_prefix);
        domain.subject(&prefix, "")
    }

    /// Key in the private bucket for the `(domain, reporter)` marker.
    fn edge_marker_key(&self, domain: &DomainName, reporter: &str) -> String {
        domain.subject(&self.private_subject_prefix, reporter)
    }
}

/// Message bus backed by NATS with JetStream KV.
pub struct NatsEventBus {
    client: async_nats::Client,
    seen_domains: kv::Store,
    globally_new: kv::Store,
    private: kv::Store,
    config: NatsConfig,
    clock: Arc<dyn Clock>,
}

impl NatsEventBus {
    /// Connect and bind the KV stores.
    ///
    /// `seen_domains` and the private bucket are created when absent; the
    /// `globally_new` bucket must already exist, so a missing one is a
    /// startup error rather than something to paper over here.
    pub async fn connect(config: NatsConfig, clock: Arc<dyn Clock>) -> Result<Self, BusError> {
        info!(url = %config.url, "Connecting to NATS");

        let connect = async_nats::ConnectOptions::new()
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(&config.url);
        let client = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| BusError::Timeout {
                operation: "connect".to_string(),
            })?
            .map_err(|e| BusError::Connection {
                message: format!("failed to connect to NATS: {e}"),
            })?;

        let jetstream = jetstream::new(client.clone());

        let seen_domains =
            Self::ensure_bucket(&jetstream, &config.seen_domains_bucket, None).await?;
        let private =
            Self::ensure_bucket(&jetstream, &config.private_bucket, Some(PRIVATE_TTL)).await?;

        let globally_new = tokio::time::timeout(
            CONNECT_TIMEOUT,
            jetstream.get_key_value(&config.globally_new_bucket),
        )
        .await
        .map_err(|_| BusError::Timeout {
            operation: "bind globally_new bucket".to_string(),
        })?
        .map_err(|e| BusError::Connection {
            message: format!(
                "globally_new bucket '{}' is not available: {e}",
                config.globally_new_bucket
            ),
        })?;

        info!(
            seen_domains = %config.seen_domains_bucket,
            globally_new = %config.globally_new_bucket,
            private = %config.private_bucket,
            "KV stores bound"
        );

        Ok(Self {
            client,
            seen_domains,
            globally_new,
            private,
            config,
            clock,
        })
    }

    /// Bind a bucket, creating it when absent.
    async fn ensure_bucket(
        jetstream: &jetstream::Context,
        bucket: &str,
        max_age: Option<Duration>,
    ) -> Result<kv::Store, BusError> {
        let bind = async {
            match jetstream.get_key_value(bucket).await {
                Ok(store) => Ok(store),
                Err(_) => jetstream
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        history: 1,
                        max_age: max_age.unwrap_or_default(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| BusError::Connection {
                        message: format!("failed to create bucket '{bucket}': {e}"),
                    }),
            }
        };

        tokio::time::timeout(CONNECT_TIMEOUT, bind)
            .await
            .map_err(|_| BusError::Timeout {
                operation: format!("bind bucket '{bucket}'"),
            })?
    }

    /// Fetch a KV entry, racing the cancellation token. Delete and purge
    /// markers count as absent.
    async fn fetch_entry(
        &self,
        cancel: &CancellationToken,
        store: &kv::Store,
        key: &str,
    ) -> Result<Option<kv::Entry>, BusError> {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled),
            entry = store.entry(key) => entry.map_err(|e| BusError::Kv {
                key: key.to_string(),
                message: e.to_string(),
            })?,
        };
        Ok(entry.filter(|e| e.operation == kv::Operation::Put))
    }

    /// Create-if-absent, racing the cancellation token. `Ok(false)` means
    /// the key already existed.
    async fn try_create(
        &self,
        cancel: &CancellationToken,
        store: &kv::Store,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, BusError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled),
            outcome = store.create(key, value.into()) => outcome,
        };
        match outcome {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(BusError::Kv {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Revision-guarded update, racing the cancellation token. Failures
    /// surface as revision conflicts; the duplicate delivery converges.
    async fn update_entry(
        &self,
        cancel: &CancellationToken,
        store: &kv::Store,
        key: &str,
        value: Vec<u8>,
        revision: u64,
    ) -> Result<(), BusError> {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BusError::Cancelled),
            outcome = store.update(key, value.into(), revision) => outcome,
        };
        outcome.map(|_| ()).map_err(|e| {
            debug!(key = %key, revision, error = %e, "KV update failed");
            BusError::RevisionConflict {
                key: key.to_string(),
            }
        })
    }
}

impl EventBus for NatsEventBus {
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BusMessage>, BusError> {
        let subject = self.config.event_subject.clone();
        let mut subscriber =
            self.client
                .subscribe(subject.clone())
                .await
                .map_err(|e| BusError::Subscribe {
                    message: format!("subscribe on '{subject}' failed: {e}"),
                })?;

        info!(subject = %subject, "Event subscription active");

        let (tx, rx) = mpsc::channel(RAW_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    msg = subscriber.next() => match msg {
                        Some(msg) => {
                            if tx.send(normalize_message(msg)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!(subject = %subject, "Subscription stream ended");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = subscriber.unsubscribe().await {
                warn!(subject = %subject, error = %e, "Unsubscribe failed");
            }
            info!(subject = %subject, "Event subscription closed");
        });

        Ok(rx)
    }

    async fn add_domain(
        &self,
        cancel: &CancellationToken,
        domain: &DomainName,
        reporter: &str,
    ) -> Result<bool, BusError> {
        let key = self.config.seen_key(domain);

        let entry = match self.fetch_entry(cancel, &self.seen_domains, &key).await? {
            Some(entry) => entry,
            None => {
                let history = ReportHistory::first(reporter, self.clock.now_unix());
                let payload = match serde_json::to_vec(&history) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(key = %key, error = %e, "Failed to encode report history");
                        return Ok(false);
                    }
                };
                if self
                    .try_create(cancel, &self.seen_domains, &key, payload)
                    .await?
                {
                    debug!(domain = %domain, key = %key, "Stored first report history");
                    return Ok(false);
                }
                // Lost the create race to a concurrent reporter; re-fetch and
                // take the existing-domain path.
                debug!(domain = %domain, key = %key, "Create race lost, domain already stored");
                match self.fetch_entry(cancel, &self.seen_domains, &key).await? {
                    Some(entry) => entry,
                    None => {
                        return Err(BusError::Kv {
                            key,
                            message: "entry vanished after create conflict".to_string(),
                        })
                    }
                }
            }
        };

        let mut history: ReportHistory = match serde_json::from_slice(&entry.value) {
            Ok(history) => history,
            Err(e) => {
                // A poison value must not wedge the pipeline, but it must
                // not masquerade as first sight either.
                error!(key = %key, error = %e, "Undecodable report history, leaving entry as is");
                return Ok(true);
            }
        };

        if !history.record(reporter, self.clock.now_unix()) {
            debug!(domain = %domain, reporter = %reporter, "Reporter already in history");
            return Ok(true);
        }

        let payload = match serde_json::to_vec(&history) {
            Ok(payload) => payload,
            Err(e) => {
                error!(key = %key, error = %e, "Failed to re-encode report history");
                return Ok(true);
            }
        };

        self.update_entry(cancel, &self.seen_domains, &key, payload, entry.revision)
            .await?;
        debug!(domain = %domain, reporter = %reporter, "Recorded new reporter");
        Ok(true)
    }

    async fn set_observation_globally_new(
        &self,
        cancel: &CancellationToken,
        domain: &DomainName,
    ) -> Result<(), BusError> {
        let key = self.config.globally_new_key(domain);
        let value = CREATOR.as_bytes().to_vec();

        match self.fetch_entry(cancel, &self.globally_new, &key).await? {
            None => {
                if self
                    .try_create(cancel, &self.globally_new, &key, value)
                    .await?
                {
                    debug!(domain = %domain, key = %key, "Marked domain globally new");
                    return Ok(());
                }
                // Someone else marked it between our fetch and create; the
                // marker exists, which is all the contract asks for.
                debug!(domain = %domain, key = %key, "Globally-new marker already present");
                Ok(())
            }
            Some(entry) => {
                self.update_entry(cancel, &self.globally_new, &key, value, entry.revision)
                    .await?;
                debug!(domain = %domain, key = %key, "Refreshed globally-new marker");
                Ok(())
            }
        }
    }

    async fn refresh_edge_marker(
        &self,
        cancel: &CancellationToken,
        domain: &DomainName,
        reporter: &str,
    ) -> Result<(), BusError> {
        let key = self.config.edge_marker_key(domain, reporter);
        let value = self.clock.now_unix().to_string().into_bytes();

        match self.fetch_entry(cancel, &self.private, &key).await? {
            None => {
                self.try_create(cancel, &self.private, &key, value).await?;
                debug!(key = %key, "Created edge marker");
                Ok(())
            }
            Some(entry) => {
                self.update_entry(cancel, &self.private, &key, value, entry.revision)
                    .await?;
                debug!(key = %key, "Refreshed edge marker");
                Ok(())
            }
        }
    }

    async fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), Bytes::copy_from_slice(payload))
            .await
            .map_err(|e| BusError::Publish {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;
        debug!(subject = %subject, "Published observation");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(|e| BusError::Connection {
            message: format!("flush failed: {e}"),
        })?;
        info!("Bus connection flushed");
        Ok(())
    }
}

/// Convert a raw bus message, keeping only the whitelisted headers. A
/// multi-valued header collapses to its first value.
fn normalize_message(msg: async_nats::Message) -> BusMessage {
    let async_nats::Message {
        subject,
        headers,
        payload,
        ..
    } = msg;
    normalize_parts(subject.to_string(), headers.as_ref(), payload)
}

fn normalize_parts(
    subject: String,
    raw_headers: Option<&async_nats::HeaderMap>,
    payload: Bytes,
) -> BusMessage {
    let mut headers = HashMap::new();
    if let Some(raw) = raw_headers {
        for name in SIGNIFICANT_HEADERS {
            if let Some(value) = raw.get(*name) {
                headers.insert((*name).to_string(), value.as_str().to_string());
            }
        }
    }
    BusMessage {
        subject,
        headers,
        data: payload,
    }
}
