//! Event-processing engine
//!
//! The producer drains the bus receive channel into a bounded job queue; a
//! fixed pool of workers runs the per-event pipeline:
//!
//! empty payload → schema validation → qname extraction → ignore-suffix
//! filter → thumbprint check → seen-domains update → (first sight only)
//! globally-new marker + observation publish → per-edge marker refresh.
//!
//! Every per-event failure is local: log, drop the event, keep consuming.
//! The bus redelivers at least once and the stores are updated
//! idempotently, so a dropped event converges on the next delivery.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tanq_domain::{DomainName, SuffixFilter, TAG_GLOBALLY_NEW};
use tanq_ports::{BusMessage, EventBus, TapirCodec, Validator};

use crate::errors::InitError;

/// Worker pool bounds.
#[derive(Debug, Clone, Copy)]
pub struct AppConfig {
    pub workers: usize,
    pub queue: usize,
}

/// The analyst core: subscription producer, worker pool, and the per-event
/// coordinator, generic over its injected collaborators.
pub struct App<B, C, V> {
    bus: Arc<B>,
    codec: Arc<C>,
    validator: Arc<V>,
    filter: SuffixFilter,
    /// Prefix for observation publish subjects.
    observation_prefix: String,
    config: AppConfig,
}

impl<B, C, V> App<B, C, V>
where
    B: EventBus + Send + Sync + 'static,
    C: TapirCodec + Send + Sync + 'static,
    V: Validator + Send + Sync + 'static,
{
    pub fn new(
        bus: Arc<B>,
        codec: Arc<C>,
        validator: Arc<V>,
        filter: SuffixFilter,
        observation_prefix: String,
        config: AppConfig,
    ) -> Result<Self, InitError> {
        if config.workers == 0 {
            return Err(InitError::BadParam("worker count must be at least 1".into()));
        }
        if config.queue == 0 {
            return Err(InitError::BadParam("job queue must hold at least 1".into()));
        }
        Ok(Self {
            bus,
            codec,
            validator,
            filter,
            observation_prefix,
            config,
        })
    }

    /// Run until cancelled or until the subscription ends. On the way out
    /// the job queue is closed, the workers drain what is left, and the
    /// call returns only after every worker has exited.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), tanq_ports::BusError> {
        let mut bus_rx = self.bus.subscribe(cancel.child_token()).await?;

        let (job_tx, job_rx) = mpsc::channel::<BusMessage>(self.config.queue);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.workers {
            let jobs = job_rx.clone();
            let bus = self.bus.clone();
            let codec = self.codec.clone();
            let validator = self.validator.clone();
            let filter = self.filter.clone();
            let observation_prefix = self.observation_prefix.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                loop {
                    let msg = { jobs.lock().await.recv().await };
                    match msg {
                        Some(msg) => {
                            handle_message(
                                bus.as_ref(),
                                codec.as_ref(),
                                validator.as_ref(),
                                &filter,
                                &observation_prefix,
                                &cancel,
                                msg,
                            )
                            .await;
                        }
                        None => break,
                    }
                }
                debug!(worker_id, "Worker exiting");
            });
        }
        info!(workers = self.config.workers, queue = self.config.queue, "Worker pool started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Stopping event producer");
                    break;
                }
                msg = bus_rx.recv() => match msg {
                    // A full job queue blocks here, pushing backpressure
                    // into the bounded bus buffer.
                    Some(msg) => {
                        if job_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("Bus receive channel closed");
                        break;
                    }
                },
            }
        }

        drop(job_tx);
        while workers.join_next().await.is_some() {}
        info!("Worker pool drained");
        Ok(())
    }
}

/// The per-event state machine.
async fn handle_message<B, C, V>(
    bus: &B,
    codec: &C,
    validator: &V,
    filter: &SuffixFilter,
    observation_prefix: &str,
    cancel: &CancellationToken,
    msg: BusMessage,
) where
    B: EventBus,
    C: TapirCodec,
    V: Validator,
{
    debug!(
        bytes = msg.data.len(),
        headers = msg.headers.len(),
        "Received message"
    );

    if msg.data.is_empty() {
        warn!("Message had no data, won't handle");
        return;
    }

    if !validator.validate(&msg.data) {
        warn!("Invalid message");
        return;
    }

    let domain = match codec.extract_domain(&msg.data) {
        Ok(domain) => domain,
        Err(e) => {
            error!(error = %e, "Error reading domain from message");
            return;
        }
    };

    if filter.matches(&domain) {
        debug!(domain = %domain, "Domain under ignored suffix, dropping");
        return;
    }

    let Some(thumbprint) = msg.thumbprint().map(str::to_string) else {
        error!(domain = %domain, "Missing thumbprint for new_qname event");
        return;
    };

    let already_existed = match bus.add_domain(cancel, &domain, &thumbprint).await {
        Ok(already_existed) => already_existed,
        Err(e) => {
            error!(domain = %domain, error = %e, "Error storing domain report");
            return;
        }
    };

    if already_existed {
        debug!("Handled event for existing domain '{}'", domain);
    } else {
        info!("Got event for unseen domain '{}'", domain);
        first_sight(bus, codec, observation_prefix, cancel, &domain).await;
    }

    if let Err(e) = bus.refresh_edge_marker(cancel, &domain, &thumbprint).await {
        error!(domain = %domain, error = %e, "Error refreshing edge marker");
    }
}

/// Record the fleet-wide first sight: set the KV marker and publish the
/// observation. Only the single caller that won the seen-domains race gets
/// here, so downstream sees at most one notification per domain.
async fn first_sight<B, C>(
    bus: &B,
    codec: &C,
    observation_prefix: &str,
    cancel: &CancellationToken,
    domain: &DomainName,
) where
    B: EventBus,
    C: TapirCodec,
{
    if let Err(e) = bus.set_observation_globally_new(cancel, domain).await {
        error!(domain = %domain, error = %e, "Error marking domain globally new");
        return;
    }

    let payload = match codec.build_observation(domain, TAG_GLOBALLY_NEW) {
        Ok(payload) => payload,
        Err(e) => {
            error!(domain = %domain, error = %e, "Error generating observation message");
            return;
        }
    };

    let subject = domain.subject(&format!("{observation_prefix}.globally_new"), "");
    match bus.publish(&subject, &payload).await {
        Ok(()) => debug!(subject = %subject, "Published observation message"),
        Err(e) => error!(subject = %subject, error = %e, "Error publishing observation message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBus;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::Duration;
    use tanq_adapters::LibTapir;
    use tanq_ports::{AcceptAll, HEADER_KEY_THUMBPRINT};

    const OBS_PREFIX: &str = "observations";

    fn event(qname: &str, thumbprint: Option<&str>) -> BusMessage {
        let mut headers = HashMap::new();
        if let Some(tp) = thumbprint {
            headers.insert(HEADER_KEY_THUMBPRINT.to_string(), tp.to_string());
        }
        BusMessage {
            subject: "events.new_qname".to_string(),
            headers,
            data: Bytes::from(format!(r#"{{"qname": "{qname}"}}"#)),
        }
    }

    async fn handle(bus: &FakeBus, msg: BusMessage) {
        let cancel = CancellationToken::new();
        handle_message(
            bus,
            &LibTapir::new(),
            &AcceptAll,
            &SuffixFilter::default(),
            OBS_PREFIX,
            &cancel,
            msg,
        )
        .await;
    }

    #[tokio::test]
    async fn test_first_global_sight() {
        let bus = FakeBus::new();
        handle(&bus, event("new.example.com.", Some("E1"))).await;

        let history = bus.history("seen.com.example.new").unwrap();
        assert_eq!(history.len(), 1);
        assert!(history.contains("E1"));

        assert!(bus.has_globally_new("observations.globally_new.com.example.new"));
        assert_eq!(bus.globally_new_writes(), 1);

        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0].0,
            "observations.globally_new.com.example.new"
        );
        let obs: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(obs["added"][0]["name"], "new.example.com");
        assert_eq!(obs["added"][0]["tag_mask"], 2048);
    }

    #[tokio::test]
    async fn test_second_reporter_same_domain() {
        let bus = FakeBus::new();
        handle(&bus, event("new.example.com.", Some("E1"))).await;
        handle(&bus, event("new.example.com", Some("E2"))).await;

        let history = bus.history("seen.com.example.new").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.contains("E1"));
        assert!(history.contains("E2"));

        // The existing-domain path must not produce another downstream
        // notification.
        assert_eq!(bus.globally_new_writes(), 1);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_from_same_reporter() {
        let bus = FakeBus::new();
        handle(&bus, event("new.example.com", Some("E1"))).await;
        let before = bus.history("seen.com.example.new").unwrap();

        handle(&bus, event("new.example.com", Some("E1"))).await;
        let after = bus.history("seen.com.example.new").unwrap();

        assert_eq!(before, after);
        assert_eq!(bus.globally_new_writes(), 1);
    }

    #[tokio::test]
    async fn test_replay_converges() {
        let bus = FakeBus::new();
        for _ in 0..5 {
            handle(&bus, event("replayed.test", Some("E1"))).await;
        }
        let history = bus.history("seen.test.replayed").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(bus.globally_new_writes(), 1);
        assert_eq!(bus.published().len(), 1);
    }

    #[tokio::test]
    async fn test_ignored_suffix_writes_nothing() {
        let bus = FakeBus::new();
        let cancel = CancellationToken::new();
        handle_message(
            &bus,
            &LibTapir::new(),
            &AcceptAll,
            &SuffixFilter::new(["arpa"]),
            OBS_PREFIX,
            &cancel,
            event("1.0.0.127.in-addr.arpa.", Some("E1")),
        )
        .await;

        assert!(bus.is_unwritten());
    }

    #[tokio::test]
    async fn test_missing_thumbprint_writes_nothing() {
        let bus = FakeBus::new();
        handle(&bus, event("x.test", None)).await;
        assert!(bus.is_unwritten());
    }

    #[tokio::test]
    async fn test_empty_payload_writes_nothing() {
        let bus = FakeBus::new();
        let mut msg = event("x.test", Some("E1"));
        msg.data = Bytes::new();
        handle(&bus, msg).await;
        assert!(bus.is_unwritten());
    }

    #[tokio::test]
    async fn test_undecodable_payload_writes_nothing() {
        let bus = FakeBus::new();

        let mut msg = event("x.test", Some("E1"));
        msg.data = Bytes::from_static(b"{not json");
        handle(&bus, msg).await;

        let mut msg = event("x.test", Some("E1"));
        msg.data = Bytes::from_static(br#"{"qname": "x.test", "unknown_field": 1}"#);
        handle(&bus, msg).await;

        assert!(bus.is_unwritten());
    }

    #[tokio::test]
    async fn test_rejecting_validator_drops_event() {
        struct RejectAll;
        impl Validator for RejectAll {
            fn validate(&self, _data: &[u8]) -> bool {
                false
            }
        }

        let bus = FakeBus::new();
        let cancel = CancellationToken::new();
        handle_message(
            &bus,
            &LibTapir::new(),
            &RejectAll,
            &SuffixFilter::default(),
            OBS_PREFIX,
            &cancel,
            event("x.test", Some("E1")),
        )
        .await;

        assert!(bus.is_unwritten());
    }

    #[tokio::test]
    async fn test_concurrent_first_sight() {
        let bus = Arc::new(FakeBus::new());

        let a = {
            let bus = bus.clone();
            tokio::spawn(async move { handle(&bus, event("d.test", Some("A"))).await })
        };
        let b = {
            let bus = bus.clone();
            tokio::spawn(async move { handle(&bus, event("d.test", Some("B"))).await })
        };
        a.await.unwrap();
        b.await.unwrap();

        let history = bus.history("seen.test.d").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.contains("A"));
        assert!(history.contains("B"));

        // Exactly one of the two observed first sight.
        assert_eq!(bus.globally_new_writes(), 1);
        assert!(bus.published().len() <= 1);
    }

    #[tokio::test]
    async fn test_run_drains_and_stops_on_cancel() {
        let bus = Arc::new(FakeBus::new());
        let events = vec![
            event("a.test", Some("E1")),
            event("b.test", Some("E1")),
            event("c.test", Some("E1")),
        ];
        bus.stage_events(events).await;

        let app = App::new(
            bus.clone(),
            Arc::new(LibTapir::new()),
            Arc::new(AcceptAll),
            SuffixFilter::default(),
            OBS_PREFIX.to_string(),
            AppConfig { workers: 2, queue: 2 },
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let runner = tokio::spawn(app.run(cancel.clone()));

        // Give the pool a moment to chew through the staged events, then
        // cancel and require bounded termination.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("app did not stop in time")
            .unwrap()
            .unwrap();

        assert!(bus.history("seen.test.a").is_some());
        assert!(bus.history("seen.test.b").is_some());
        assert!(bus.history("seen.test.c").is_some());
    }

    #[tokio::test]
    async fn test_run_stops_when_subscription_ends() {
        let bus = Arc::new(FakeBus::new());
        bus.stage_events(vec![event("x.test", Some("E1"))]).await;
        bus.close_subscription().await;

        let app = App::new(
            bus.clone(),
            Arc::new(LibTapir::new()),
            Arc::new(AcceptAll),
            SuffixFilter::default(),
            OBS_PREFIX.to_string(),
            AppConfig { workers: 1, queue: 1 },
        )
        .unwrap();

        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), app.run(cancel))
            .await
            .expect("app did not stop after subscription closed")
            .unwrap();

        assert!(bus.history("seen.test.x").is_some());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let bus = Arc::new(FakeBus::new());
        let result = App::new(
            bus,
            Arc::new(LibTapir::new()),
            Arc::new(AcceptAll),
            SuffixFilter::default(),
            OBS_PREFIX.to_string(),
            AppConfig { workers: 0, queue: 10 },
        );
        assert!(result.is_err());
    }
}
