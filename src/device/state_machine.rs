use btleplug::api::BDAddr;
use indexmap::IndexMap;
use log::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::device::measurement::MeasurementSpec;
use crate::device::session::ServiceSession;
use crate::device::types::{
    CharacteristicDetails, Command, DeviceInput, DeviceState, DiscoveredPeripheral, LinkId, RadioStatus,
    ScanErrorKind, ScanId,
};
use crate::device::values::MeasuredValues;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Treat a generic scan error as a missing location permission.
    pub permission_heuristic: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            permission_heuristic: cfg!(any(target_os = "android", target_os = "ios")),
        }
    }
}

// the connection controller slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    id: LinkId,
    address: BDAddr,
    connected: bool,
}

/// Connection, discovery and subscription state for one target peripheral.
///
/// The session performs no I/O: every `DeviceInput` is turned into a list of `Command`s for the
/// radio driver, and the observable `DeviceState` is recomputed from the flags on each call to
/// [`DeviceSession::state`].
#[derive(Debug)]
pub struct DeviceSession {
    target: BDAddr,
    spec: MeasurementSpec,
    options: SessionOptions,
    radio: RadioStatus,

    scan: Option<ScanId>,
    target_found: bool,
    link: Option<Link>,
    services_discovered: bool,
    descriptor_written: bool,
    permission_error: bool,

    sessions: IndexMap<Uuid, ServiceSession>,
    values: MeasuredValues,
    next_id: u64,
}

impl DeviceSession {
    pub fn new(target: BDAddr, spec: MeasurementSpec, radio: RadioStatus, options: SessionOptions) -> Self {
        DeviceSession {
            target,
            spec,
            options,
            radio,
            scan: None,
            target_found: false,
            link: None,
            services_discovered: false,
            descriptor_written: false,
            permission_error: false,
            sessions: IndexMap::new(),
            values: MeasuredValues::new(),
            next_id: 0,
        }
    }

    /// Asks for the radio to be powered on if needed, resets and starts looking for the target.
    pub fn start(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();

        if self.radio == RadioStatus::PoweredOff {
            commands.push(Command::RequestRadioPowerOn);
        }

        self.disconnect_and_reset(&mut commands);
        self.update_device(&mut commands);
        commands
    }

    pub fn state(&self) -> DeviceState {
        match self.radio {
            RadioStatus::Unavailable => return DeviceState::RadioUnavailable,
            RadioStatus::PoweredOff => return DeviceState::RadioDisabled,
            RadioStatus::PoweredOn => {},
        }

        if !self.target_found {
            return match (self.scan.is_some(), self.permission_error) {
                (false, true) => DeviceState::PermissionLikelyMissing,
                (false, false) => DeviceState::Idle,
                (true, _) => DeviceState::ScanningForDevice,
            };
        }

        match self.link {
            None => DeviceState::DeviceFoundAwaitingLink,
            Some(_) if !self.services_discovered => DeviceState::DiscoveringServices,
            Some(_) if !self.descriptor_written => DeviceState::ServicesDiscoveredNegotiatingDetails,
            Some(_) => DeviceState::Connected,
        }
    }

    pub fn target(&self) -> BDAddr {
        self.target
    }

    pub fn spec(&self) -> &MeasurementSpec {
        &self.spec
    }

    pub fn values(&self) -> &MeasuredValues {
        &self.values
    }

    pub fn radio(&self) -> RadioStatus {
        self.radio
    }

    pub fn service_sessions(&self) -> impl Iterator<Item = &ServiceSession> {
        self.sessions.values()
    }

    /// Tears everything down. Calling it again right away has no further effect.
    pub fn reset(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        self.disconnect_and_reset(&mut commands);
        commands
    }

    pub fn handle(&mut self, input: DeviceInput) -> Vec<Command> {
        let mut commands = Vec::new();

        match input {
            DeviceInput::Tick => self.update_device(&mut commands),
            DeviceInput::ResetRequested => {
                info!("Reset requested");
                self.disconnect_and_reset(&mut commands);
                self.update_device(&mut commands);
                commands.push(Command::NotifyChanged);
            },
            DeviceInput::RadioStatusChanged(status) => self.on_radio_status(status, &mut commands),

            DeviceInput::PeripheralSeen(peripheral) => self.on_peripheral_seen(peripheral, &mut commands),
            DeviceInput::ScanFinished(scan) => self.on_scan_stopped(scan, "finished", &mut commands),
            DeviceInput::ScanCanceled(scan) => self.on_scan_stopped(scan, "canceled", &mut commands),
            DeviceInput::ScanError { scan, kind } => self.on_scan_error(scan, kind, &mut commands),

            DeviceInput::LinkReady { address } => self.on_link_ready(address, &mut commands),
            DeviceInput::LinkUnavailable { address, message } => {
                if self.target_found && self.link.is_none() && address == self.target {
                    warn!("Could not obtain a handle to {}: {}", address, message);
                    self.restart(&mut commands);
                }
            },
            DeviceInput::LinkConnected(link) => self.on_link_connected(link, &mut commands),
            DeviceInput::LinkDisconnected(link) => {
                if self.is_current_link(link, "disconnect") {
                    info!("Peripheral {} disconnected", self.target);
                    self.restart(&mut commands);
                }
            },
            DeviceInput::LinkError { link, message } => {
                if self.is_current_link(link, "link error") {
                    warn!("Link error: {}", message);
                    self.restart(&mut commands);
                }
            },

            DeviceInput::ServiceDiscovered { link, service } => self.on_service_discovered(link, service, &mut commands),
            DeviceInput::ServiceDiscoveryFinished(link) => {
                if self.is_current_link(link, "service discovery finished") {
                    info!("Service discovery finished, {} service(s) of interest", self.sessions.len());
                    if self.sessions.is_empty() {
                        warn!("The peripheral exposes none of the requested services");
                    }
                    self.services_discovered = true;
                    commands.push(Command::NotifyChanged);
                }
            },
            DeviceInput::ServiceDetailsDiscovered { link, service, characteristics } => {
                self.on_service_details(link, service, &characteristics, &mut commands)
            },
            DeviceInput::ServiceError { link, service, message } => {
                if self.is_current_link(link, "service error") {
                    warn!("Discovering service {} failed: {}", service, message);
                    self.restart(&mut commands);
                }
            },

            DeviceInput::DescriptorWritten { link, service, characteristic, value } => {
                self.on_descriptor_written(link, service, characteristic, &value, &mut commands)
            },
            DeviceInput::DescriptorWriteFailed { link, service: _, characteristic, message } => {
                if self.is_current_link(link, "descriptor write failure") {
                    warn!("Enabling notifications for {} failed: {}", self.spec.name_or_uuid(&characteristic), message);
                }
            },
            DeviceInput::CharacteristicChanged { link, service, characteristic, value } => {
                self.on_characteristic_changed(link, service, characteristic, value)
            },
        }

        commands
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current_link(&self, link: LinkId, what: &str) -> bool {
        match self.link {
            Some(current) if current.id == link => true,
            _ => {
                debug!("Ignoring {} for stale link {:?}", what, link);
                false
            },
        }
    }

    fn session_for(&mut self, service: &Uuid, what: &str) -> Option<&mut ServiceSession> {
        let session = self.sessions.get_mut(service);
        if session.is_none() {
            error!("Received {} for service {} which has no session", what, service);
        }
        session
    }

    fn update_device(&mut self, commands: &mut Vec<Command>) {
        if self.state() == DeviceState::Idle {
            self.start_device_discovery(commands);
        }
    }

    fn start_device_discovery(&mut self, commands: &mut Vec<Command>) {
        info!("Starting discovery of target device {}", self.target);

        self.disconnect_and_reset(commands);

        if self.scan.is_none() {
            let scan = ScanId(self.next_id());
            self.scan = Some(scan);
            commands.push(Command::StartScan(scan));
        }

        commands.push(Command::NotifyChanged);
    }

    // link level failures: tear down and look for the device again right away
    fn restart(&mut self, commands: &mut Vec<Command>) {
        self.disconnect_and_reset(commands);
        self.update_device(commands);
        commands.push(Command::NotifyChanged);
    }

    fn disconnect_and_reset(&mut self, commands: &mut Vec<Command>) {
        debug!("Disconnect and reset");

        if let Some(scan) = self.scan.take() {
            commands.push(Command::StopScan(scan));
        }

        if let Some(link) = self.link.take() {
            debug!("Disconnecting link {:?} to {} (connected: {})", link.id, link.address, link.connected);
            commands.push(Command::Disconnect(link.id));
        }

        self.sessions.clear();
        self.values.clear();

        self.target_found = false;
        self.services_discovered = false;
        self.descriptor_written = false;
        self.permission_error = false;
    }

    fn on_radio_status(&mut self, status: RadioStatus, commands: &mut Vec<Command>) {
        if status == self.radio {
            return;
        }

        info!("Bluetooth radio changed from {:?} to {:?}", self.radio, status);
        self.radio = status;

        match status {
            RadioStatus::PoweredOn => self.update_device(commands),
            RadioStatus::PoweredOff => {
                commands.push(Command::RequestRadioPowerOn);
                self.disconnect_and_reset(commands);
            },
            RadioStatus::Unavailable => self.disconnect_and_reset(commands),
        }

        commands.push(Command::NotifyChanged);
    }

    fn on_peripheral_seen(&mut self, peripheral: DiscoveredPeripheral, commands: &mut Vec<Command>) {
        let Some(scan) = self.scan else {
            trace!("Ignoring advertisement of {} outside of a scan", peripheral.address);
            return;
        };

        debug!(
            "Peripheral seen: {}, name: {:?}, rssi: {:?}, services: {:?}",
            peripheral.address,
            peripheral.name,
            peripheral.rssi,
            peripheral.services,
        );

        if peripheral.address == self.target {
            info!("Found target device {}", self.target);

            self.target_found = true;
            self.scan = None;
            commands.push(Command::StopScan(scan));
            commands.push(Command::PrepareLink { address: peripheral.address });
        }

        commands.push(Command::NotifyChanged);
    }

    fn on_scan_stopped(&mut self, scan: ScanId, how: &str, commands: &mut Vec<Command>) {
        if self.scan != Some(scan) {
            debug!("Scan {:?} {} after it was stopped", scan, how);
            return;
        }

        info!("Scan {} without finding {}", how, self.target);
        self.scan = None;
        commands.push(Command::NotifyChanged);
    }

    fn on_scan_error(&mut self, scan: ScanId, kind: ScanErrorKind, commands: &mut Vec<Command>) {
        if self.scan != Some(scan) {
            debug!("Ignoring error {:?} of stopped scan {:?}", kind, scan);
            return;
        }

        warn!("Device discovery error: {:?}", kind);

        self.disconnect_and_reset(commands);

        let permission_error = match kind {
            ScanErrorKind::PermissionDenied => true,
            ScanErrorKind::RadioOff => {
                self.on_radio_status(RadioStatus::PoweredOff, commands);
                return;
            },
            ScanErrorKind::Unknown => self.options.permission_heuristic,
            ScanErrorKind::Other => false,
        };
        if permission_error {
            warn!("Scanning is probably not permitted");
            self.permission_error = true;
        }

        commands.push(Command::NotifyChanged);
    }

    fn on_link_ready(&mut self, address: BDAddr, commands: &mut Vec<Command>) {
        if !self.target_found || address != self.target {
            debug!("Ignoring link handle for {} which is no longer wanted", address);
            return;
        }

        if self.link.is_some() {
            debug!("Link to {} already exists", address);
            return;
        }

        let link = LinkId(self.next_id());
        info!("Connecting to {}", address);

        self.link = Some(Link { id: link, address, connected: false });
        commands.push(Command::Connect { link, address });
        commands.push(Command::NotifyChanged);
    }

    fn on_link_connected(&mut self, link: LinkId, commands: &mut Vec<Command>) {
        if !self.is_current_link(link, "connect") {
            return;
        }

        if let Some(current) = self.link.as_mut() {
            if current.connected {
                debug!("Link {:?} is already connected", link);
                return;
            }
            current.connected = true;
        }

        info!("Connected to {}, discovering services", self.target);
        commands.push(Command::DiscoverServices(link));
        commands.push(Command::NotifyChanged);
    }

    fn on_service_discovered(&mut self, link: LinkId, service: Uuid, commands: &mut Vec<Command>) {
        if !self.is_current_link(link, "discovered service") {
            return;
        }

        let is_target = self.spec.is_target_service(&service);
        debug!("Service discovered: {}, is target: {}", service, is_target);

        if is_target && !self.sessions.contains_key(&service) {
            let (session, command) = ServiceSession::start(link, service);
            self.sessions.insert(service, session);
            commands.push(command);
        }

        commands.push(Command::NotifyChanged);
    }

    fn on_service_details(
        &mut self,
        link: LinkId,
        service: Uuid,
        characteristics: &[CharacteristicDetails],
        commands: &mut Vec<Command>,
    ) {
        if !self.is_current_link(link, "service details") {
            return;
        }

        let Some(session) = self.sessions.get_mut(&service) else {
            error!("Received details for service {} which has no session", service);
            return;
        };

        commands.extend(session.on_details_discovered(&self.spec, characteristics));
        commands.push(Command::NotifyChanged);
    }

    fn on_descriptor_written(
        &mut self,
        link: LinkId,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        commands: &mut Vec<Command>,
    ) {
        if !self.is_current_link(link, "descriptor write") {
            return;
        }

        if self.session_for(&service, "a descriptor write").is_none() {
            return;
        }

        info!("Descriptor of {} written: {:02x?}", self.spec.name_or_uuid(&characteristic), value);

        if !self.descriptor_written {
            info!("Peripheral {} ready", self.target);
            self.descriptor_written = true;
        }

        commands.push(Command::NotifyChanged);
    }

    fn on_characteristic_changed(&mut self, link: LinkId, service: Uuid, characteristic: Uuid, value: Vec<u8>) {
        if self.link.map(|current| current.id) != Some(link) {
            trace!("Dropping notification of {} from stale link {:?}", characteristic, link);
            return;
        }

        if self.session_for(&service, "a notification").is_none() {
            return;
        }

        trace!("Characteristic {} changed: {:02x?}", self.spec.name_or_uuid(&characteristic), value);

        match self.spec.name_of(&characteristic) {
            Some(name) => self.values.insert(name, value),
            None => trace!("Dropping value of unnamed characteristic {}", characteristic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::bleuuid::uuid_from_u16;

    fn target() -> BDAddr {
        BDAddr::from([0x30, 0x7B, 0xF5, 0x33, 0x2B, 0x9D])
    }

    fn session() -> DeviceSession {
        DeviceSession::new(
            target(),
            MeasurementSpec::smart_glove(),
            RadioStatus::PoweredOn,
            SessionOptions { permission_heuristic: false },
        )
    }

    fn seen(address: BDAddr) -> DeviceInput {
        DeviceInput::PeripheralSeen(DiscoveredPeripheral {
            address,
            name: None,
            rssi: Some(-60),
            services: vec![],
        })
    }

    fn started_scan(commands: &[Command]) -> ScanId {
        commands.iter().find_map(|command| match command {
            Command::StartScan(scan) => Some(*scan),
            _ => None,
        }).unwrap()
    }

    fn connect_link(commands: &[Command]) -> LinkId {
        commands.iter().find_map(|command| match command {
            Command::Connect { link, .. } => Some(*link),
            _ => None,
        }).unwrap()
    }

    #[test]
    fn start_scans_when_the_radio_is_on() {
        let mut device = session();
        assert_eq!(device.state(), DeviceState::Idle);

        let commands = device.start();
        let scan = started_scan(&commands);

        assert_eq!(device.state(), DeviceState::ScanningForDevice);
        assert!(!commands.contains(&Command::StopScan(scan)));

        // ticking while scanning starts nothing new
        assert!(device.handle(DeviceInput::Tick).is_empty());
    }

    #[test]
    fn other_peripherals_do_not_stop_the_scan() {
        let mut device = session();
        let scan = started_scan(&device.start());

        let commands = device.handle(seen(BDAddr::from([1, 2, 3, 4, 5, 6])));
        assert_eq!(commands, vec![Command::NotifyChanged]);
        assert_eq!(device.state(), DeviceState::ScanningForDevice);

        let commands = device.handle(seen(target()));
        assert!(commands.contains(&Command::StopScan(scan)));
        assert!(commands.contains(&Command::PrepareLink { address: target() }));
        assert_eq!(device.state(), DeviceState::DeviceFoundAwaitingLink);

        // the scan is over, later advertisements are not processed
        assert!(device.handle(seen(target())).is_empty());
    }

    #[test]
    fn late_events_of_a_previous_link_are_ignored() {
        let mut device = session();
        device.start();
        device.handle(seen(target()));
        let old_link = connect_link(&device.handle(DeviceInput::LinkReady { address: target() }));

        let commands = device.handle(DeviceInput::LinkError { link: old_link, message: "closed".to_string() });
        assert!(commands.contains(&Command::Disconnect(old_link)));
        assert_eq!(device.state(), DeviceState::ScanningForDevice);

        device.handle(seen(target()));
        let new_link = connect_link(&device.handle(DeviceInput::LinkReady { address: target() }));
        assert_ne!(old_link, new_link);

        assert!(device.handle(DeviceInput::LinkDisconnected(old_link)).is_empty());
        assert!(device.handle(DeviceInput::ServiceDiscoveryFinished(old_link)).is_empty());
        assert_eq!(device.state(), DeviceState::DiscoveringServices);
    }

    #[test]
    fn link_ready_for_an_abandoned_target_is_ignored() {
        let mut device = session();
        device.start();
        device.handle(seen(target()));
        device.reset();

        assert!(device.handle(DeviceInput::LinkReady { address: target() }).is_empty());
        assert_eq!(device.state(), DeviceState::Idle);
    }

    #[test]
    fn stale_scan_completion_does_not_end_the_new_scan() {
        let mut device = session();
        let first = started_scan(&device.start());

        device.handle(DeviceInput::ScanFinished(first));
        assert_eq!(device.state(), DeviceState::Idle);

        let second = started_scan(&device.handle(DeviceInput::Tick));
        assert_ne!(first, second);

        assert!(device.handle(DeviceInput::ScanCanceled(first)).is_empty());
        assert_eq!(device.state(), DeviceState::ScanningForDevice);
    }

    #[test]
    fn details_for_an_unknown_service_are_dropped() {
        let mut device = session();
        device.start();
        device.handle(seen(target()));
        let link = connect_link(&device.handle(DeviceInput::LinkReady { address: target() }));
        device.handle(DeviceInput::LinkConnected(link));

        let commands = device.handle(DeviceInput::ServiceDetailsDiscovered {
            link,
            service: uuid_from_u16(0x180f),
            characteristics: vec![],
        });

        assert!(commands.is_empty());
        assert_eq!(device.state(), DeviceState::DiscoveringServices);
    }

    #[test]
    fn repeated_connect_does_not_restart_service_discovery() {
        let mut device = session();
        device.start();
        device.handle(seen(target()));
        let link = connect_link(&device.handle(DeviceInput::LinkReady { address: target() }));

        let commands = device.handle(DeviceInput::LinkConnected(link));
        assert!(commands.contains(&Command::DiscoverServices(link)));

        assert!(device.handle(DeviceInput::LinkConnected(link)).is_empty());
        assert_eq!(device.state(), DeviceState::DiscoveringServices);
    }

    #[test]
    fn scan_failing_on_a_powered_off_radio_disables_the_device() {
        let mut device = session();
        let scan = started_scan(&device.start());

        let commands = device.handle(DeviceInput::ScanError { scan, kind: ScanErrorKind::RadioOff });
        assert!(commands.contains(&Command::StopScan(scan)));
        assert!(commands.contains(&Command::RequestRadioPowerOn));
        assert_eq!(device.state(), DeviceState::RadioDisabled);

        // not a permission problem: powering on scans again
        let commands = device.handle(DeviceInput::RadioStatusChanged(RadioStatus::PoweredOn));
        started_scan(&commands);
        assert_eq!(device.state(), DeviceState::ScanningForDevice);
    }

    #[test]
    fn radio_power_loss_tears_down_the_link() {
        let mut device = session();
        device.start();
        device.handle(seen(target()));
        let link = connect_link(&device.handle(DeviceInput::LinkReady { address: target() }));

        let commands = device.handle(DeviceInput::RadioStatusChanged(RadioStatus::PoweredOff));
        assert!(commands.contains(&Command::RequestRadioPowerOn));
        assert!(commands.contains(&Command::Disconnect(link)));
        assert_eq!(device.state(), DeviceState::RadioDisabled);

        let commands = device.handle(DeviceInput::RadioStatusChanged(RadioStatus::PoweredOn));
        started_scan(&commands);
        assert_eq!(device.state(), DeviceState::ScanningForDevice);
    }
}
