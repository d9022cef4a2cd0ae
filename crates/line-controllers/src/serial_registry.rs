//! Binds a [`DeviceRegistry`] to a [`SerialController`]: translates
//! "which device needs service" into the wire text and expected response
//! count the controller transmits.
//!
//! [`SerialController`]: crate::serial::SerialController

use crate::registry::{DeviceRegistry, ManagedDevice, ServiceQueue};
use crate::serial::CommandSource;
use control_protocol::{Command, ControlError, DeviceKey, ServiceToken};
use control_runtime::WakeSignal;
use std::sync::Arc;

/// Device-family specific wire protocol.
///
/// One implementation per instrument family (valve bank, heater rack,
/// manometer drop). Produces opaque command text; the substrate never
/// interprets it.
pub trait DeviceFamily: Send + 'static {
    type Device: ManagedDevice;

    /// Command that re-synchronizes the registry's own aggregate state
    /// (sent whenever that state is invalid, before any device work)
    fn self_service_command(&mut self) -> Command;

    /// Validate and apply one line answering the self-service command
    fn validate_self_response(&mut self, line: &str, index: u32) -> bool;

    /// Translate a queued request into a command. `None` skips the
    /// request (already satisfied, device no longer relevant).
    fn command_for(
        &mut self,
        key: DeviceKey,
        device: &mut Self::Device,
        token: &ServiceToken,
    ) -> Option<Command>;

    /// Validate one line answering a device command; on acceptance the
    /// implementation hands the payload to `device.report`
    fn validate_response(
        &mut self,
        key: DeviceKey,
        device: &mut Self::Device,
        line: &str,
        index: u32,
    ) -> bool;

    /// Issued when the queue is empty; must not hurry
    fn idle_command(&mut self) -> Command {
        Command::idle()
    }
}

/// A [`DeviceRegistry`] that speaks for its devices on a serial link.
///
/// Implements [`CommandSource`]; plug it into a `SerialController`.
/// Service priority is fixed: own aggregate state first (re-synchronize
/// after startup or link loss), then the request queue, then idle.
pub struct SerialDeviceRegistry<F: DeviceFamily> {
    registry: DeviceRegistry<F::Device>,
    family: F,
    /// Updates-received counter for the registry's own aggregate state;
    /// zero means invalid/stale
    updates_received: u32,
    /// Request being serviced by the outstanding command; `None` during
    /// self-service or idle. Held so an abandoned command can be
    /// re-offered.
    current: Option<(DeviceKey, ServiceToken)>,
}

impl<F: DeviceFamily> SerialDeviceRegistry<F> {
    pub fn new(family: F, wake: Arc<WakeSignal>) -> Self {
        Self {
            registry: DeviceRegistry::new(wake),
            family,
            updates_received: 0,
            current: None,
        }
    }

    pub fn register(
        &mut self,
        key_text: &str,
        device: F::Device,
    ) -> Result<Option<F::Device>, ControlError> {
        self.registry.register(key_text, device)
    }

    pub fn queue(&self) -> ServiceQueue {
        self.registry.queue()
    }

    pub fn registry(&self) -> &DeviceRegistry<F::Device> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut DeviceRegistry<F::Device> {
        &mut self.registry
    }

    pub fn family_mut(&mut self) -> &mut F {
        &mut self.family
    }

    /// True once the registry's own aggregate state has been synchronized
    pub fn state_valid(&self) -> bool {
        self.updates_received > 0
    }
}

impl<F: DeviceFamily> CommandSource for SerialDeviceRegistry<F> {
    fn select_service(&mut self) -> Command {
        // Re-synchronize self before servicing anyone else
        if !self.state_valid() {
            self.current = None;
            tracing::debug!("registry state invalid, self-servicing first");
            return self.family.self_service_command();
        }

        let queue = self.registry.queue();
        while let Some((key, token)) = queue.pop() {
            let Some(device) = self.registry.get_mut(&key) else {
                tracing::debug!(device = %key, "request for unregistered device skipped");
                continue;
            };
            if !device.is_active() {
                tracing::debug!(device = %key, "request for deactivated device skipped");
                continue;
            }
            if let Some(cmd) = self.family.command_for(key, device, &token) {
                self.current = Some((key, token));
                return cmd;
            }
        }

        self.current = None;
        self.family.idle_command()
    }

    fn process_response(&mut self, line: &str, index: u32) -> bool {
        match self.current.as_ref().map(|(key, _)| *key) {
            None => {
                let accepted = self.family.validate_self_response(line, index);
                if accepted {
                    self.updates_received = self.updates_received.saturating_add(1);
                }
                accepted
            }
            Some(key) => match self.registry.get_mut(&key) {
                Some(device) => self.family.validate_response(key, device, line, index),
                None => {
                    // Target vanished mid-flight (re-registration race)
                    tracing::warn!(device = %key, "response for vanished device rejected");
                    false
                }
            },
        }
    }

    fn command_abandoned(&mut self) {
        // Re-offer the unserviced request; the next selection resends it.
        // Self-service needs no requeue: invalid state re-offers itself.
        if let Some((key, token)) = self.current.take() {
            tracing::debug!(device = %key, token = %token, "abandoned request re-offered");
            self.registry.queue().request_service(key, token);
        }
    }

    fn link_lost(&mut self) {
        self.updates_received = 0;
        self.current = None;
        self.registry.mark_all_stale();
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::registry::ManagedDevice;

    struct ValveDevice {
        queue: Option<ServiceQueue>,
        updates: u32,
        active: bool,
        last_report: Option<String>,
        desired_open: bool,
    }

    impl ValveDevice {
        fn new(desired_open: bool) -> Self {
            Self {
                queue: None,
                updates: 0,
                active: false,
                last_report: None,
                desired_open,
            }
        }
    }

    impl ManagedDevice for ValveDevice {
        fn attach(&mut self, queue: ServiceQueue) {
            self.queue = Some(queue);
        }
        fn detach(&mut self) {
            self.queue = None;
        }
        fn is_attached(&self) -> bool {
            self.queue.is_some()
        }
        fn report(&mut self, line: &str) {
            self.last_report = Some(line.to_string());
            self.updates += 1;
        }
        fn updates_received(&self) -> u32 {
            self.updates
        }
        fn mark_stale(&mut self) {
            self.updates = 0;
        }
        fn set_active(&mut self, active: bool) {
            self.active = active;
        }
        fn is_active(&self) -> bool {
            self.active
        }
    }

    /// Valve-bank protocol: `g r` reads the bank state, `n<idx> <0|1> r`
    /// drives one valve
    struct ValveBank;

    impl DeviceFamily for ValveBank {
        type Device = ValveDevice;

        fn self_service_command(&mut self) -> Command {
            Command::new("g r", 1, true)
        }

        fn validate_self_response(&mut self, line: &str, _index: u32) -> bool {
            line.chars().all(|c| c == '0' || c == '1')
        }

        fn command_for(
            &mut self,
            key: DeviceKey,
            device: &mut Self::Device,
            _token: &ServiceToken,
        ) -> Option<Command> {
            let bit = if device.desired_open { 1 } else { 0 };
            Some(Command::new(format!("n{} {} r", key.index(), bit), 1, true))
        }

        fn validate_response(
            &mut self,
            _key: DeviceKey,
            device: &mut Self::Device,
            line: &str,
            _index: u32,
        ) -> bool {
            if line == "err" {
                return false;
            }
            device.report(line);
            true
        }
    }

    fn bank() -> SerialDeviceRegistry<ValveBank> {
        SerialDeviceRegistry::new(ValveBank, Arc::new(WakeSignal::new()))
    }

    #[tokio::test]
    async fn test_invalid_state_self_services_first() {
        let mut reg = bank();
        reg.register("v1", ValveDevice::new(true)).unwrap();
        // Queue holds the registration init, but self-state is invalid
        assert!(!reg.state_valid());

        let cmd = reg.select_service();
        assert_eq!(cmd.message(), "g r");

        // Accepting the self response validates the aggregate state
        assert!(reg.process_response("0101", 0));
        assert!(reg.state_valid());

        // Next selection services the queued device
        let cmd = reg.select_service();
        assert_eq!(cmd.message(), "n1 1 r");
    }

    #[tokio::test]
    async fn test_device_response_routed_to_target() {
        let mut reg = bank();
        reg.register("v2", ValveDevice::new(false)).unwrap();
        reg.process_response_self_sync();

        let cmd = reg.select_service();
        assert_eq!(cmd.message(), "n2 0 r");
        assert!(reg.process_response("ok", 0));

        let key = DeviceKey::parse("v2").unwrap();
        let device = reg.registry().get(&key).unwrap();
        assert_eq!(device.last_report.as_deref(), Some("ok"));
        assert_eq!(device.updates_received(), 1);
    }

    #[tokio::test]
    async fn test_rejected_device_response() {
        let mut reg = bank();
        reg.register("v2", ValveDevice::new(false)).unwrap();
        reg.process_response_self_sync();

        let _ = reg.select_service();
        assert!(!reg.process_response("err", 0));

        let key = DeviceKey::parse("v2").unwrap();
        assert_eq!(reg.registry().get(&key).unwrap().updates_received(), 0);
    }

    #[tokio::test]
    async fn test_empty_queue_idles_without_hurry() {
        let mut reg = bank();
        reg.process_response_self_sync();

        let cmd = reg.select_service();
        assert!(cmd.is_idle());
        assert!(!cmd.hurry());
    }

    #[tokio::test]
    async fn test_link_lost_invalidates_self_and_devices() {
        let mut reg = bank();
        reg.register("v1", ValveDevice::new(true)).unwrap();
        reg.process_response_self_sync();

        // Simulate a serviced device
        let key = DeviceKey::parse("v1").unwrap();
        reg.registry_mut().get_mut(&key).unwrap().report("ok");
        reg.registry().queue().clear();

        reg.link_lost();
        assert!(!reg.state_valid());
        assert_eq!(reg.registry().get(&key).unwrap().updates_received(), 0);
        // Every device was queued for re-initialization
        assert_eq!(reg.queue().len(), 1);

        // And the very next selection is self-service again
        assert_eq!(reg.select_service().message(), "g r");
    }

    #[tokio::test]
    async fn test_abandoned_request_reoffered() {
        let mut reg = bank();
        reg.register("v1", ValveDevice::new(true)).unwrap();
        reg.process_response_self_sync();

        assert_eq!(reg.select_service().message(), "n1 1 r");
        assert!(reg.queue().is_empty());

        // Timeout abandonment puts the request back; the next selection
        // resends the same command
        reg.command_abandoned();
        assert_eq!(reg.queue().len(), 1);
        assert_eq!(reg.select_service().message(), "n1 1 r");
    }

    #[tokio::test]
    async fn test_request_for_removed_device_skipped() {
        let mut reg = bank();
        reg.register("v1", ValveDevice::new(true)).unwrap();
        reg.process_response_self_sync();

        let key = DeviceKey::parse("v1").unwrap();
        reg.registry_mut().remove(&key);
        // The registration init is still queued but must be skipped
        let cmd = reg.select_service();
        assert!(cmd.is_idle());
    }

    impl SerialDeviceRegistry<ValveBank> {
        /// Test helper: mark the aggregate state valid
        fn process_response_self_sync(&mut self) {
            self.updates_received = 1;
        }
    }
}
