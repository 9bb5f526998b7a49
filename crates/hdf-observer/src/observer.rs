//! Service name → (publisher, subscribers) registry.
//!
//! # Delivery rules
//!
//! | Publisher policy | Subscribers notified |
//! |---|---|
//! | [`ServicePolicy::Private`] | only those registered with the publisher's device id |
//! | any other policy | all of them |
//!
//! Every record carries its own lock.  Publishing, notifying and subscribing
//! on one service name are serialized under that lock, so a subscriber is
//! called exactly once per publication no matter how `publish` and
//! `subscribe` race.  Callbacks run while the record lock is held and must
//! not publish or subscribe the same name again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use hdf_types::{DevId, HdfError, HdfResult, ServiceObject, ServicePolicy};
use tracing::{debug, warn};

/// Callback invoked when a subscribed service becomes available.
pub type ServiceCallback = Box<dyn Fn(&ServiceObject) -> HdfResult<()> + Send + Sync>;

/// Whether a subscriber has been handed the service yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Pending,
    Ready,
}

/// BKDR string hash (seed 131) used as the record key.
pub fn service_key(name: &str) -> u32 {
    const SEED: u32 = 131;
    name.bytes()
        .fold(0u32, |hash, byte| hash.wrapping_mul(SEED).wrapping_add(u32::from(byte)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal records
// ─────────────────────────────────────────────────────────────────────────────

struct Subscriber {
    dev_id: DevId,
    state: SubscriberState,
    callback: ServiceCallback,
}

impl Subscriber {
    fn deliver(&mut self, name: &str, service: &ServiceObject) {
        self.state = SubscriberState::Ready;
        if let Err(e) = (self.callback)(service) {
            warn!(service = name, subscriber = %self.dev_id, error = %e, "subscriber rejected service");
        }
    }
}

struct RecordState {
    publisher: Option<ServiceObject>,
    policy: ServicePolicy,
    dev_id: DevId,
    subscribers: Vec<Subscriber>,
}

impl RecordState {
    fn admits(&self, subscriber: DevId) -> bool {
        self.policy != ServicePolicy::Private || self.dev_id == subscriber
    }
}

struct ServiceRecord {
    name: String,
    state: Mutex<RecordState>,
}

impl ServiceRecord {
    fn new(name: &str, publisher: Option<(ServiceObject, DevId, ServicePolicy)>) -> Self {
        let (publisher, dev_id, policy) = match publisher {
            Some((service, dev_id, policy)) => (Some(service), dev_id, policy),
            None => (None, DevId::default(), ServicePolicy::None),
        };
        Self {
            name: name.to_string(),
            state: Mutex::new(RecordState {
                publisher,
                policy,
                dev_id,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-publication: store the new publisher and notify every admitted
    /// subscriber.
    fn republish(&self, dev_id: DevId, policy: ServicePolicy, service: ServiceObject) {
        let mut state = self.lock();
        state.publisher = Some(Arc::clone(&service));
        state.dev_id = dev_id;
        state.policy = policy;

        let mut notified = 0usize;
        let RecordState { subscribers, .. } = &mut *state;
        for subscriber in subscribers.iter_mut() {
            if subscriber.dev_id == dev_id || policy != ServicePolicy::Private {
                subscriber.deliver(&self.name, &service);
                notified += 1;
            }
        }
        debug!(service = %self.name, publisher = %dev_id, notified, "service republished");
    }

    /// Drop the publisher when it is still `dev_id`.  Subscribers stay and
    /// wait for the next publication.
    fn withdraw(&self, dev_id: DevId) -> bool {
        let mut state = self.lock();
        if state.publisher.is_none() || state.dev_id != dev_id {
            return false;
        }
        state.publisher = None;
        for subscriber in state.subscribers.iter_mut() {
            subscriber.state = SubscriberState::Pending;
        }
        true
    }

    fn subscribe(&self, mut subscriber: Subscriber) {
        let mut state = self.lock();
        if let Some(service) = state.publisher.clone() {
            if state.admits(subscriber.dev_id) {
                subscriber.deliver(&self.name, &service);
            }
        }
        state.subscribers.push(subscriber);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ServiceObserver
// ─────────────────────────────────────────────────────────────────────────────

/// Per-host publish/subscribe registry of device services.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use hdf_observer::ServiceObserver;
/// use hdf_types::{DevId, ServiceObject, ServicePolicy};
///
/// let observer = ServiceObserver::new();
/// let service: ServiceObject = Arc::new(42u32);
/// observer
///     .publish("sample_service", DevId::new(0, 5, 1), ServicePolicy::Public, service)
///     .unwrap();
///
/// let hits = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&hits);
/// observer
///     .subscribe("sample_service", DevId::new(0, 7, 1), move |_svc: &ServiceObject| {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     })
///     .unwrap();
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Default)]
pub struct ServiceObserver {
    records: Mutex<HashMap<u32, Arc<ServiceRecord>>>,
}

impl ServiceObserver {
    /// Create an observer with no records.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `service` under `name` on behalf of `dev_id`.
    ///
    /// A new record is created and inserted under the observer lock.  If the
    /// name already has a record (earlier publish or early subscribers) the
    /// publisher is replaced and subscribers are notified.
    ///
    /// # Errors
    ///
    /// [`HdfError::InvalidParam`] for an empty name.
    pub fn publish(
        &self,
        name: &str,
        dev_id: DevId,
        policy: ServicePolicy,
        service: ServiceObject,
    ) -> HdfResult<()> {
        if name.is_empty() {
            return Err(HdfError::InvalidParam("service name is empty".into()));
        }
        let key = service_key(name);
        let existing = {
            let mut records = self.lock_records();
            match records.get(&key) {
                Some(record) => Arc::clone(record),
                None => {
                    records.insert(
                        key,
                        Arc::new(ServiceRecord::new(name, Some((service, dev_id, policy)))),
                    );
                    debug!(service = name, publisher = %dev_id, ?policy, "service published");
                    return Ok(());
                }
            }
        };
        existing.republish(dev_id, policy, service);
        Ok(())
    }

    /// Subscribe `dev_id` to `name`.
    ///
    /// When the service is already published and visible to `dev_id`, the
    /// callback runs before this call returns.  The subscriber is recorded
    /// either way and is notified again on every re-publication.
    ///
    /// # Errors
    ///
    /// [`HdfError::InvalidParam`] for an empty name.
    pub fn subscribe<F>(&self, name: &str, dev_id: DevId, callback: F) -> HdfResult<()>
    where
        F: Fn(&ServiceObject) -> HdfResult<()> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(HdfError::InvalidParam("service name is empty".into()));
        }
        let record = {
            let mut records = self.lock_records();
            Arc::clone(
                records
                    .entry(service_key(name))
                    .or_insert_with(|| Arc::new(ServiceRecord::new(name, None))),
            )
        };
        record.subscribe(Subscriber {
            dev_id,
            state: SubscriberState::Pending,
            callback: Box::new(callback),
        });
        debug!(service = name, subscriber = %dev_id, "service subscribed");
        Ok(())
    }

    /// Withdraw `name` together with its subscriber list.
    ///
    /// Removing an unknown name succeeds.
    pub fn remove(&self, name: &str) -> HdfResult<()> {
        if self.lock_records().remove(&service_key(name)).is_some() {
            debug!(service = name, "service withdrawn");
        }
        Ok(())
    }

    /// Withdraw the publication of `name` made by `dev_id`.
    ///
    /// The record and its subscribers are kept, so the next publication of
    /// `name` notifies them again.  Nothing happens when the name is unknown
    /// or is currently published by another device.  Returns whether a
    /// publication was withdrawn.
    pub fn withdraw(&self, name: &str, dev_id: DevId) -> bool {
        let Some(record) = self.record(name) else {
            return false;
        };
        let withdrawn = record.withdraw(dev_id);
        if withdrawn {
            debug!(service = name, publisher = %dev_id, "publication withdrawn");
        }
        withdrawn
    }

    /// The current publisher of `name`, if any.
    pub fn service(&self, name: &str) -> Option<ServiceObject> {
        let record = self.record(name)?;
        let state = record.lock();
        state.publisher.clone()
    }

    pub fn is_published(&self, name: &str) -> bool {
        self.service(name).is_some()
    }

    /// Delivery state of every subscriber of `name`, in subscription order.
    pub fn subscriber_states(&self, name: &str) -> Vec<SubscriberState> {
        match self.record(name) {
            Some(record) => record.lock().subscribers.iter().map(|s| s.state).collect(),
            None => Vec::new(),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, name: &str) -> Option<Arc<ServiceRecord>> {
        self.lock_records().get(&service_key(name)).cloned()
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<u32, Arc<ServiceRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}
