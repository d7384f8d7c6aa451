use std::fmt;
use btleplug::api::BDAddr;
use uuid::Uuid;

/// The single observable state of the device, derived from the state machine's flags on every
/// query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    RadioUnavailable,
    RadioDisabled,
    PermissionLikelyMissing,
    Idle,
    ScanningForDevice,
    DeviceFoundAwaitingLink,
    DiscoveringServices,
    ServicesDiscoveredNegotiatingDetails,
    /// At least one notification has been enabled. Other subscriptions may still be pending or
    /// may have failed; one completed descriptor write is taken as evidence of a working link.
    Connected,
    /// Never derived by the state machine; available to consumers as a neutral placeholder.
    Unknown,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            DeviceState::RadioUnavailable => "Bluetooth is not available on this device",
            DeviceState::RadioDisabled => "Bluetooth is turned off",
            DeviceState::PermissionLikelyMissing => "Not allowed to scan for devices, check the location/bluetooth permission and restart",
            DeviceState::Idle => "Not connected",
            DeviceState::ScanningForDevice => "Searching for device…",
            DeviceState::DeviceFoundAwaitingLink => "Device found, connecting…",
            DeviceState::DiscoveringServices => "Discovering services…",
            DeviceState::ServicesDiscoveredNegotiatingDetails => "Discovering characteristics…",
            DeviceState::Connected => "Connected",
            DeviceState::Unknown => "Unknown state",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioStatus {
    /// No usable adapter.
    Unavailable,
    PoweredOff,
    PoweredOn,
}

/// One advertisement, as seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeripheral {
    pub address: BDAddr,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanId(pub u64);

/// Identifies one connection to the peripheral. Results of operations issued for an older link
/// are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanErrorKind {
    PermissionDenied,
    /// The scan failed while the adapter reported its radio as powered off.
    RadioOff,
    /// A generic failure; on mobile platforms this usually means the location permission is
    /// missing.
    Unknown,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDetails {
    pub uuid: Uuid,
    /// Whether the characteristic carries a client characteristic configuration descriptor.
    pub notifiable: bool,
}

/// Everything that can happen to the device: radio and link events, completions of
/// operations, the periodic tick and consumer requests.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceInput {
    Tick,
    ResetRequested,
    RadioStatusChanged(RadioStatus),

    PeripheralSeen(DiscoveredPeripheral),
    ScanFinished(ScanId),
    ScanCanceled(ScanId),
    ScanError { scan: ScanId, kind: ScanErrorKind },

    LinkReady { address: BDAddr },
    LinkUnavailable { address: BDAddr, message: String },
    LinkConnected(LinkId),
    LinkDisconnected(LinkId),
    LinkError { link: LinkId, message: String },

    ServiceDiscovered { link: LinkId, service: Uuid },
    ServiceDiscoveryFinished(LinkId),
    ServiceDetailsDiscovered { link: LinkId, service: Uuid, characteristics: Vec<CharacteristicDetails> },
    ServiceError { link: LinkId, service: Uuid, message: String },

    DescriptorWritten { link: LinkId, service: Uuid, characteristic: Uuid, value: Vec<u8> },
    DescriptorWriteFailed { link: LinkId, service: Uuid, characteristic: Uuid, message: String },
    CharacteristicChanged { link: LinkId, service: Uuid, characteristic: Uuid, value: Vec<u8> },
}

/// Requests from the state machine to the radio driver. None of them block; each completes
/// later with one or more `DeviceInput`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartScan(ScanId),
    StopScan(ScanId),
    RequestRadioPowerOn,
    PrepareLink { address: BDAddr },
    Connect { link: LinkId, address: BDAddr },
    DiscoverServices(LinkId),
    DiscoverServiceDetails { link: LinkId, service: Uuid },
    EnableNotifications { link: LinkId, service: Uuid, characteristic: Uuid },
    Disconnect(LinkId),
    /// Wake consumers waiting for the "device changed" signal.
    NotifyChanged,
}
