//! Keyed device collection plus the service-request queue that feeds a
//! serial controller.
//!
//! The registry decouples "a device's desired configuration changed" from
//! "what wire command to send and when": device change hooks enqueue a
//! (key, token) pair through their [`ServiceQueue`] handle and wake the
//! owning controller; the controller's service-selection path drains the
//! queue on its own schedule.

use control_protocol::{ControlError, DeviceKey, LineEvent, ServiceToken};
use control_runtime::WakeSignal;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// A device under registry management.
///
/// Leaf device classes (valves, heaters, manometers) implement this to
/// participate in scheduling. `attach` hands the device its manager
/// reference: the queue handle its state-setters use to request service.
/// `mark_stale` zeroes the updates-received counter, meaning the device's
/// last known state cannot be trusted until it is re-serviced.
pub trait ManagedDevice: Send + 'static {
    fn attach(&mut self, queue: ServiceQueue);
    fn detach(&mut self);
    fn is_attached(&self) -> bool;

    /// Hand the device its parsed payload from a correlated response
    fn report(&mut self, line: &str);

    fn updates_received(&self) -> u32;
    fn mark_stale(&mut self);

    fn set_active(&mut self, active: bool);
    fn is_active(&self) -> bool;
}

/// Thread-safe service-request queue with the owning loop's wake signal.
///
/// Cloned into every registered device; any thread may enqueue. A device
/// may appear multiple times for different tokens.
#[derive(Clone, Debug)]
pub struct ServiceQueue {
    requests: Arc<Mutex<VecDeque<(DeviceKey, ServiceToken)>>>,
    wake: Arc<WakeSignal>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceQueue {
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        Self {
            requests: Arc::new(Mutex::new(VecDeque::new())),
            wake,
        }
    }

    /// Enqueue a service request and hurry the owning controller
    pub fn request_service(&self, key: DeviceKey, token: ServiceToken) {
        tracing::debug!(device = %key, token = %token, "service requested");
        lock(&self.requests).push_back((key, token));
        self.wake.set();
    }

    pub fn pop(&self) -> Option<(DeviceKey, ServiceToken)> {
        lock(&self.requests).pop_front()
    }

    pub fn len(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.requests).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.requests).clear()
    }
}

/// Bidirectional key↔device mapping with fail-closed registration.
pub struct DeviceRegistry<D: ManagedDevice> {
    devices: HashMap<DeviceKey, D>,
    queue: ServiceQueue,
    event_tx: Option<mpsc::Sender<LineEvent>>,
}

impl<D: ManagedDevice> DeviceRegistry<D> {
    pub fn new(wake: Arc<WakeSignal>) -> Self {
        Self {
            devices: HashMap::new(),
            queue: ServiceQueue::new(wake),
            event_tx: None,
        }
    }

    /// Report registration changes on the host event channel
    pub fn set_event_sink(&mut self, event_tx: mpsc::Sender<LineEvent>) {
        self.event_tx = Some(event_tx);
    }

    /// Handle devices clone to enqueue their own service requests
    pub fn queue(&self) -> ServiceQueue {
        self.queue.clone()
    }

    /// Bind a device under a textual `prefix+index` key.
    ///
    /// A malformed key fails closed: the device is not scheduled and the
    /// error carries the diagnostic. Re-registering an occupied key
    /// detaches and stales the prior occupant first; it is returned so
    /// the host can dispose of it.
    pub fn register(&mut self, key_text: &str, mut device: D) -> Result<Option<D>, ControlError> {
        let key = DeviceKey::parse(key_text).inspect_err(|e| {
            tracing::error!(key = key_text, error = %e, "device registration rejected");
        })?;

        let displaced = self.devices.remove(&key).map(|mut prior| {
            tracing::warn!(device = %key, "key already bound, detaching prior device");
            prior.detach();
            prior.mark_stale();
            prior.set_active(false);
            self.emit(LineEvent::DeviceDetached { key });
            prior
        });

        device.attach(self.queue.clone());
        device.set_active(true);
        self.devices.insert(key, device);
        tracing::info!(device = %key, "device registered");
        self.emit(LineEvent::DeviceRegistered { key });

        // A fresh binding starts stale: queue its initialization
        self.queue.request_service(key, ServiceToken::Init);
        Ok(displaced)
    }

    /// Unbind a device. It loses its manager reference and its last-known
    /// state is marked stale before it is handed back.
    pub fn remove(&mut self, key: &DeviceKey) -> Option<D> {
        self.devices.remove(key).map(|mut device| {
            device.detach();
            device.mark_stale();
            device.set_active(false);
            tracing::info!(device = %key, "device removed");
            self.emit(LineEvent::DeviceDetached { key: *key });
            device
        })
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&D> {
        self.devices.get(key)
    }

    pub fn get_mut(&mut self, key: &DeviceKey) -> Option<&mut D> {
        self.devices.get_mut(key)
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &DeviceKey> {
        self.devices.keys()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Force every device's last-known state stale (link loss); each is
    /// re-initialized once the link returns
    pub fn mark_all_stale(&mut self) {
        for (key, device) in self.devices.iter_mut() {
            device.mark_stale();
            self.queue.request_service(*key, ServiceToken::Init);
        }
    }

    fn emit(&self, event: LineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }
}
