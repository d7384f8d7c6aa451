use futures::channel::mpsc::Sender;
use log::warn;
use tokio::sync::watch;

use crate::device::state_machine::DeviceSession;
use crate::device::types::{DeviceInput, DeviceState};
use crate::device::values::{FromPayload, MeasuredValues};
use crate::error::{DeviceError, ValueError};

/// What a consumer can observe of the device at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub state: DeviceState,
    pub values: MeasuredValues,
}

impl DeviceSnapshot {
    pub fn of(session: &DeviceSession) -> Self {
        DeviceSnapshot {
            state: session.state(),
            values: session.values().clone(),
        }
    }
}

/// Read access to the state and the latest measured values of a running device.
///
/// All queries read the most recent snapshot and never block. [`DeviceMonitor::changed`] can be
/// awaited instead of polling; it only wakes up for state relevant events, not for every value
/// update.
#[derive(Debug, Clone)]
pub struct DeviceMonitor {
    snapshot: watch::Receiver<DeviceSnapshot>,
    inputs: Sender<DeviceInput>,
}

impl DeviceMonitor {
    pub fn new(snapshot: watch::Receiver<DeviceSnapshot>, inputs: Sender<DeviceInput>) -> Self {
        DeviceMonitor { snapshot, inputs }
    }

    pub fn state(&self) -> DeviceState {
        self.snapshot.borrow().state
    }

    /// Returns the decoded value and `true`, or `default` and `false` if there is no value for
    /// `name` or it has the wrong width for `T`.
    pub fn measured_value<T: FromPayload>(&self, name: &str, default: T) -> (T, bool) {
        self.snapshot.borrow().values.value_or(name, default)
    }

    pub fn try_measured_value<T: FromPayload>(&self, name: &str) -> Result<T, ValueError> {
        self.snapshot.borrow().values.decode(name)
    }

    pub fn measured_values(&self) -> MeasuredValues {
        self.snapshot.borrow().values.clone()
    }

    /// Waits for the next "device changed" signal. Returns `false` once the driver has stopped.
    pub async fn changed(&mut self) -> bool {
        self.snapshot.changed().await.is_ok()
    }

    /// Asks the driver to disconnect, clear all values and flags and start over.
    pub fn reset(&mut self) -> Result<(), DeviceError> {
        match self.inputs.try_send(DeviceInput::ResetRequested) {
            Ok(()) => Ok(()),
            Err(err) if err.is_disconnected() => Err(DeviceError::DriverStopped),
            Err(_) => {
                warn!("Device driver has not processed the previous request yet, reset dropped");
                Err(DeviceError::DriverBusy)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::channel;
    use futures::StreamExt;

    fn snapshot(state: DeviceState) -> DeviceSnapshot {
        DeviceSnapshot { state, values: MeasuredValues::new() }
    }

    #[tokio::test]
    async fn value_updates_are_visible_without_a_change_signal() {
        let (snapshot_sender, snapshot_receiver) = watch::channel(snapshot(DeviceState::Connected));
        let (input_sender, _input_receiver) = channel(4);
        let mut monitor = DeviceMonitor::new(snapshot_receiver, input_sender);

        snapshot_sender.send_if_modified(|current| {
            current.values.insert("finger_1", vec![0x2a]);
            false
        });

        assert_eq!(monitor.measured_value::<u8>("finger_1", 0), (42, true));
        assert_eq!(monitor.try_measured_value::<u8>("finger_1"), Ok(42));
        assert!(!monitor.snapshot.has_changed().unwrap());

        snapshot_sender.send_if_modified(|current| {
            current.state = DeviceState::Idle;
            current.values.clear();
            true
        });

        assert!(monitor.changed().await);
        assert_eq!(monitor.state(), DeviceState::Idle);
        assert_eq!(monitor.measured_value::<u8>("finger_1", 9), (9, false));
        assert!(monitor.measured_values().is_empty());

        drop(snapshot_sender);
        assert!(!monitor.changed().await);
    }

    #[tokio::test]
    async fn reset_is_forwarded_to_the_driver() {
        let (_snapshot_sender, snapshot_receiver) = watch::channel(snapshot(DeviceState::PermissionLikelyMissing));
        let (input_sender, mut input_receiver) = channel(4);
        let mut monitor = DeviceMonitor::new(snapshot_receiver, input_sender);

        monitor.reset().unwrap();
        assert_eq!(input_receiver.next().await, Some(DeviceInput::ResetRequested));

        drop(input_receiver);
        assert!(matches!(monitor.reset(), Err(DeviceError::DriverStopped)));
    }

    #[tokio::test]
    async fn reset_on_a_full_channel_is_reported_as_busy() {
        let (_snapshot_sender, snapshot_receiver) = watch::channel(snapshot(DeviceState::Connected));
        // no buffer: only the slot every sender is guaranteed
        let (input_sender, mut input_receiver) = channel(0);
        let mut monitor = DeviceMonitor::new(snapshot_receiver, input_sender);

        monitor.reset().unwrap();
        assert!(matches!(monitor.reset(), Err(DeviceError::DriverBusy)));

        assert_eq!(input_receiver.next().await, Some(DeviceInput::ResetRequested));
        monitor.reset().unwrap();
        assert_eq!(input_receiver.next().await, Some(DeviceInput::ResetRequested));
    }
}
