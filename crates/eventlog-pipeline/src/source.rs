// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event source side of the pipeline.
//!
//! An [`EventSubscription`] delivers [`RawEvent`]s on its own thread through a
//! callback. The callback built by [`EventSourceAdapter::callback`] normalizes
//! each delivery into an [`EventRecord`] and pushes it into the shared queue;
//! it never calls into the sink. Bad deliveries are counted and skipped so a
//! single malformed event cannot take the subscription down.
//!
//! Two subscriptions ship with the crate:
//! - [`UdpEventSource`]: receives one JSON event per datagram from an event
//!   forwarder on a dedicated thread.
//! - [`ManualSource`]: delivered to directly through a [`ManualSourceHandle`],
//!   for embedding and tests.

use std::collections::HashSet;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, trace, warn};

use crate::errors::{MalformedEventError, SubscriptionError};
use crate::event::{system_time_from_millis, EventRecord, RawEvent};
use crate::queue::{BoundedQueue, PushOutcome};
use crate::stats::PipelineStats;

// Largest payload a UDP datagram can carry.
const BUFFER_SIZE: usize = 65_507;

// How often the receive thread wakes up to check for unsubscribe.
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Callback invoked for every raw event delivered by a subscription.
pub type EventCallback = Arc<dyn Fn(RawEvent) + Send + Sync>;

/// An event log subscription.
///
/// `subscribe` starts delivering events for `log_name` that pass
/// `filter_query` to `callback`; `unsubscribe` stops delivery and returns only
/// once no further callback can run.
///
/// `unsubscribe` blocks the calling thread. Implementations must bound the
/// wait: [`UdpEventSource`] returns within one receive poll interval plus
/// the callback in flight.
pub trait EventSubscription: Send {
    fn subscribe(
        &mut self,
        log_name: &str,
        filter_query: &str,
        callback: EventCallback,
    ) -> Result<(), SubscriptionError>;

    fn unsubscribe(&mut self);
}

/// Which events a subscription forwards.
///
/// The query is either `*` (everything) or a comma-separated list of event
/// ids, e.g. `4624,4625`. Events from a different log are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    log_name: String,
    event_ids: Option<HashSet<u32>>,
}

impl EventFilter {
    pub fn parse(log_name: &str, query: &str) -> Result<Self, SubscriptionError> {
        let query = query.trim();
        let event_ids = if query.is_empty() || query == "*" {
            None
        } else {
            let ids = query
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| {
                    id.parse::<u32>()
                        .map_err(|e| SubscriptionError::InvalidFilter {
                            query: query.to_string(),
                            reason: format!("'{id}' is not an event id: {e}"),
                        })
                })
                .collect::<Result<HashSet<u32>, _>>()?;
            if ids.is_empty() {
                return Err(SubscriptionError::InvalidFilter {
                    query: query.to_string(),
                    reason: "no event ids given".to_string(),
                });
            }
            Some(ids)
        };

        Ok(Self {
            log_name: log_name.to_string(),
            event_ids,
        })
    }

    /// Deliveries without a record always match: the adapter has to see them
    /// to account for them.
    pub fn matches(&self, raw: &RawEvent) -> bool {
        let Some(record) = raw.record.as_ref() else {
            return true;
        };
        if let Some(log_name) = record.log_name.as_deref() {
            if !log_name.eq_ignore_ascii_case(&self.log_name) {
                return false;
            }
        }
        match (&self.event_ids, record.id) {
            (Some(ids), Some(id)) => ids.contains(&id),
            _ => true,
        }
    }
}

/// Turns raw deliveries into queued [`EventRecord`]s.
#[derive(Clone)]
pub struct EventSourceAdapter {
    queue: Arc<BoundedQueue>,
    stats: Arc<PipelineStats>,
}

impl EventSourceAdapter {
    pub fn new(queue: Arc<BoundedQueue>, stats: Arc<PipelineStats>) -> Self {
        Self { queue, stats }
    }

    /// Validates a raw event. Required: event id, provider name, log name and
    /// machine name. A missing creation time falls back to the receive time.
    pub fn normalize(raw: RawEvent) -> Result<EventRecord, MalformedEventError> {
        if let Some(error) = raw.error {
            return Err(MalformedEventError::Delivery(error));
        }
        let record = raw.record.ok_or(MalformedEventError::MissingRecord)?;

        let source_id = record.id.ok_or(MalformedEventError::MissingField("Id"))?;
        let provider_name = record
            .provider_name
            .ok_or(MalformedEventError::MissingField("ProviderName"))?;
        let log_name = record
            .log_name
            .ok_or(MalformedEventError::MissingField("LogName"))?;
        let machine_name = record
            .machine_name
            .ok_or(MalformedEventError::MissingField("MachineName"))?;
        let timestamp = match record.time_created {
            Some(millis) => system_time_from_millis(millis).unwrap_or_else(|| {
                warn!("TimeCreated {millis} is out of range, using receive time");
                SystemTime::now()
            }),
            None => SystemTime::now(),
        };

        Ok(EventRecord::new(
            source_id,
            provider_name,
            log_name,
            machine_name,
            record.record_id,
            timestamp,
        ))
    }

    /// Normalizes a delivery and pushes it into the queue.
    ///
    /// A malformed delivery is counted and returned as an error; it is never
    /// pushed.
    pub fn on_event(&self, raw: RawEvent) -> Result<PushOutcome, MalformedEventError> {
        let record = match Self::normalize(raw) {
            Ok(record) => record,
            Err(e) => {
                self.stats.record_malformed();
                warn!("Skipping malformed event: {e}");
                return Err(e);
            }
        };

        debug!(
            "Event received id={} record_id={:?} provider={}",
            record.source_id(),
            record.record_id(),
            record.provider_name()
        );

        let outcome = self.queue.push(record);
        if outcome.is_accepted() {
            self.stats.record_accepted();
        }
        Ok(outcome)
    }

    /// Callback to hand to an [`EventSubscription`]. Errors are already
    /// counted and logged by [`Self::on_event`], so they stop here.
    pub fn callback(&self) -> EventCallback {
        let adapter = self.clone();
        Arc::new(move |raw| {
            let _ = adapter.on_event(raw);
        })
    }
}

type ManualSubscriber = Option<(EventFilter, EventCallback)>;

/// Subscription driven in-process through a [`ManualSourceHandle`].
#[derive(Default)]
pub struct ManualSource {
    subscriber: Arc<Mutex<ManualSubscriber>>,
}

/// Delivers events to a [`ManualSource`], from any thread.
#[derive(Clone)]
pub struct ManualSourceHandle {
    subscriber: Arc<Mutex<ManualSubscriber>>,
}

impl ManualSource {
    pub fn new() -> (Self, ManualSourceHandle) {
        let source = Self::default();
        let handle = ManualSourceHandle {
            subscriber: Arc::clone(&source.subscriber),
        };
        (source, handle)
    }
}

impl EventSubscription for ManualSource {
    fn subscribe(
        &mut self,
        log_name: &str,
        filter_query: &str,
        callback: EventCallback,
    ) -> Result<(), SubscriptionError> {
        let filter = EventFilter::parse(log_name, filter_query)?;
        let mut subscriber = self
            .subscriber
            .lock()
            .map_err(|_| SubscriptionError::Start("subscriber lock poisoned".to_string()))?;
        if subscriber.is_some() {
            return Err(SubscriptionError::AlreadySubscribed);
        }
        *subscriber = Some((filter, callback));
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Ok(mut subscriber) = self.subscriber.lock() {
            *subscriber = None;
        }
    }
}

impl ManualSourceHandle {
    /// Delivers one raw event. Returns `false` when nothing is subscribed or
    /// the event does not pass the subscription filter.
    ///
    /// The callback runs with the subscription lock held, so `unsubscribe`
    /// cannot return while a delivery is in progress.
    pub fn deliver(&self, raw: RawEvent) -> bool {
        let Ok(subscriber) = self.subscriber.lock() else {
            return false;
        };
        match subscriber.as_ref() {
            Some((filter, callback)) if filter.matches(&raw) => {
                callback(raw);
                true
            }
            _ => false,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscriber
            .lock()
            .map(|subscriber| subscriber.is_some())
            .unwrap_or(false)
    }
}

struct ReceiveWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Receives one JSON-encoded [`RawEvent`] per UDP datagram.
///
/// The receive loop runs on its own OS thread, which plays the part of the
/// event log's callback thread.
pub struct UdpEventSource {
    listen_addr: String,
    worker: Option<ReceiveWorker>,
}

impl UdpEventSource {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            worker: None,
        }
    }

    /// Address actually bound, once subscribed. Useful when listening on
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.worker.as_ref().map(|w| w.local_addr)
    }
}

impl EventSubscription for UdpEventSource {
    fn subscribe(
        &mut self,
        log_name: &str,
        filter_query: &str,
        callback: EventCallback,
    ) -> Result<(), SubscriptionError> {
        if self.worker.is_some() {
            return Err(SubscriptionError::AlreadySubscribed);
        }
        let filter = EventFilter::parse(log_name, filter_query)?;

        let bind_error = |source| SubscriptionError::Bind {
            addr: self.listen_addr.clone(),
            source,
        };
        let socket = UdpSocket::bind(&self.listen_addr).map_err(bind_error)?;
        socket
            .set_read_timeout(Some(RECV_POLL_INTERVAL))
            .map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("eventlog-source".to_string())
            .spawn(move || receive_loop(&socket, &filter, &callback, &thread_stop))
            .map_err(|e| SubscriptionError::Start(e.to_string()))?;

        debug!("Event source listening on {local_addr} for log {log_name}");
        self.worker = Some(ReceiveWorker {
            stop,
            thread,
            local_addr,
        });
        Ok(())
    }

    fn unsubscribe(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.thread.join().is_err() {
                error!("Event source thread panicked");
            }
            debug!("Event source on {} stopped", worker.local_addr);
        }
    }
}

impl Drop for UdpEventSource {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn receive_loop(
    socket: &UdpSocket,
    filter: &EventFilter,
    callback: &EventCallback,
    stop: &AtomicBool,
) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((amt, src)) => {
                let raw = RawEvent::from_json(&buf[..amt]);
                if filter.matches(&raw) {
                    callback(raw);
                } else {
                    trace!("Ignoring event from {src} outside the subscription filter");
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                error!("Failed to receive event: {e}");
                std::thread::sleep(RECV_POLL_INTERVAL);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::RawEventRecord;
    use crate::queue::OverflowPolicy;
    use tracing_test::traced_test;

    fn raw(id: u32) -> RawEvent {
        RawEvent::new(RawEventRecord {
            id: Some(id),
            provider_name: Some("Microsoft-Windows-Security-Auditing".to_string()),
            log_name: Some("Security".to_string()),
            machine_name: Some("HOST01".to_string()),
            record_id: Some(u64::from(id) * 10),
            time_created: Some(1_700_000_000_000),
        })
    }

    fn adapter() -> (EventSourceAdapter, Arc<BoundedQueue>, Arc<PipelineStats>) {
        let queue = Arc::new(BoundedQueue::new(16, OverflowPolicy::DropOldest));
        let stats = Arc::new(PipelineStats::new());
        (
            EventSourceAdapter::new(Arc::clone(&queue), Arc::clone(&stats)),
            queue,
            stats,
        )
    }

    #[test]
    fn test_normalize_well_formed_event() {
        let record = EventSourceAdapter::normalize(raw(4624)).unwrap();
        assert_eq!(record.source_id(), 4624);
        assert_eq!(record.provider_name(), "Microsoft-Windows-Security-Auditing");
        assert_eq!(record.log_name(), "Security");
        assert_eq!(record.machine_name(), "HOST01");
        assert_eq!(record.record_id(), Some(46240));
        assert_eq!(record.timestamp(), system_time_from_millis(1_700_000_000_000).unwrap());
    }

    #[test]
    fn test_normalize_missing_fields() {
        let mut event = raw(1);
        event.record.as_mut().unwrap().provider_name = None;
        assert_eq!(
            EventSourceAdapter::normalize(event),
            Err(MalformedEventError::MissingField("ProviderName"))
        );

        let mut event = raw(1);
        event.record.as_mut().unwrap().id = None;
        assert_eq!(
            EventSourceAdapter::normalize(event),
            Err(MalformedEventError::MissingField("Id"))
        );
    }

    #[test]
    fn test_normalize_missing_time_uses_receive_time() {
        let mut event = raw(1);
        event.record.as_mut().unwrap().time_created = None;
        let before = SystemTime::now();
        let record = EventSourceAdapter::normalize(event).unwrap();
        assert!(record.timestamp() >= before);
    }

    #[test]
    #[traced_test]
    fn test_normalize_out_of_range_time_uses_receive_time() {
        let mut event = raw(1);
        event.record.as_mut().unwrap().time_created = Some(u64::MAX);
        let before = SystemTime::now();

        let record = EventSourceAdapter::normalize(event).unwrap();

        assert!(record.timestamp() >= before);
        assert!(logs_contain("is out of range, using receive time"));
    }

    #[test]
    fn test_null_record_is_counted_not_propagated() {
        let (adapter, queue, stats) = adapter();
        let callback = adapter.callback();

        callback(RawEvent::empty());

        assert_eq!(stats.malformed(), 1);
        assert!(queue.is_empty());
        assert_eq!(stats.snapshot(queue.dropped()).accepted, 0);
    }

    #[test]
    #[traced_test]
    fn test_malformed_event_is_logged() {
        let (adapter, _queue, _stats) = adapter();
        let mut event = raw(7);
        event.record.as_mut().unwrap().machine_name = None;

        let _ = adapter.on_event(event);

        assert!(logs_contain(
            "Skipping malformed event: raw event is missing required field `MachineName`"
        ));
    }

    #[test]
    fn test_delivery_error_is_malformed() {
        let (adapter, queue, stats) = adapter();
        assert_eq!(
            adapter.on_event(RawEvent::delivery_error("channel gone")),
            Err(MalformedEventError::Delivery("channel gone".to_string()))
        );
        assert_eq!(stats.malformed(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_on_event_pushes_record() {
        let (adapter, queue, stats) = adapter();
        assert!(adapter.on_event(raw(5)).unwrap().is_accepted());
        assert_eq!(queue.pop().unwrap().source_id(), 5);
        assert_eq!(stats.snapshot(0).accepted, 1);
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(EventFilter::parse("Security", "*").unwrap().event_ids, None);
        assert_eq!(EventFilter::parse("Security", "").unwrap().event_ids, None);
        assert_eq!(
            EventFilter::parse("Security", "4624, 4625").unwrap().event_ids,
            Some(HashSet::from([4624, 4625]))
        );
        assert!(matches!(
            EventFilter::parse("Security", "4624,abc"),
            Err(SubscriptionError::InvalidFilter { .. })
        ));
        assert!(matches!(
            EventFilter::parse("Security", ","),
            Err(SubscriptionError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn test_filter_matches() {
        let filter = EventFilter::parse("security", "4624").unwrap();
        assert!(filter.matches(&raw(4624)));
        assert!(!filter.matches(&raw(4625)));
        assert!(filter.matches(&RawEvent::empty()));

        let mut other_log = raw(4624);
        other_log.record.as_mut().unwrap().log_name = Some("System".to_string());
        assert!(!filter.matches(&other_log));
    }

    #[test]
    fn test_manual_source_lifecycle() {
        let (mut source, handle) = ManualSource::new();
        let (adapter, queue, _stats) = adapter();

        assert!(!handle.deliver(raw(1)));
        source
            .subscribe("Security", "*", adapter.callback())
            .unwrap();
        assert!(handle.is_subscribed());
        assert!(matches!(
            source.subscribe("Security", "*", adapter.callback()),
            Err(SubscriptionError::AlreadySubscribed)
        ));

        assert!(handle.deliver(raw(1)));
        assert_eq!(queue.len(), 1);

        source.unsubscribe();
        assert!(!handle.is_subscribed());
        assert!(!handle.deliver(raw(2)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_udp_source_delivers_datagrams() {
        let (adapter, queue, stats) = adapter();
        let mut source = UdpEventSource::new("127.0.0.1:0");
        source
            .subscribe("Security", "4624", adapter.callback())
            .unwrap();
        let addr = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let payloads: [&[u8]; 3] = [
            br#"{"Id":4624,"ProviderName":"p","LogName":"Security","MachineName":"HOST01"}"#,
            br#"{"Id":4625,"ProviderName":"p","LogName":"Security","MachineName":"HOST01"}"#,
            b"null",
        ];
        for payload in payloads {
            sender.send_to(payload, addr).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while (queue.len() < 1 || stats.malformed() < 1) && std::time::Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(10));
        }
        source.unsubscribe();

        assert_eq!(queue.pop().unwrap().source_id(), 4624);
        assert!(queue.is_empty());
        assert_eq!(stats.malformed(), 1);
        assert!(source.local_addr().is_none());
    }

    #[test]
    fn test_udp_source_unsubscribe_is_bounded() {
        let (adapter, _queue, _stats) = adapter();
        let mut source = UdpEventSource::new("127.0.0.1:0");
        source.subscribe("Security", "*", adapter.callback()).unwrap();
        let addr = source.local_addr().unwrap();

        let started = std::time::Instant::now();
        source.unsubscribe();

        assert!(started.elapsed() < RECV_POLL_INTERVAL * 5);
        assert!(UdpSocket::bind(addr).is_ok());
    }

    #[test]
    fn test_udp_source_bind_failure() {
        let (adapter, _queue, _stats) = adapter();
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut source = UdpEventSource::new(taken.local_addr().unwrap().to_string());

        assert!(matches!(
            source.subscribe("Security", "*", adapter.callback()),
            Err(SubscriptionError::Bind { .. })
        ));
    }
}
