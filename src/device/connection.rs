use std::collections::{HashMap, VecDeque};
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use btleplug::api::{BDAddr, Central, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{
    make_cccd_uuid, ENABLE_NOTIFICATION_VALUE, INPUT_CHANNEL_CAPACITY, SCAN_TIMEOUT, SHUTDOWN_TIMEOUT, UPDATE_DEVICE_INTERVAL,
};
use crate::device::measurement::MeasurementSpec;
use crate::device::monitor::{DeviceMonitor, DeviceSnapshot};
use crate::device::state_machine::{DeviceSession, SessionOptions};
use crate::device::types::{CharacteristicDetails, Command, DeviceInput, DiscoveredPeripheral, LinkId, RadioStatus, ScanErrorKind, ScanId};
use crate::error::{readable_thread_panic_error, DeviceError};

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

#[derive(Debug, Clone)]
pub struct DeviceOptions {
    pub target: BDAddr,
    pub spec: MeasurementSpec,
    pub update_interval: Duration,
    pub scan_timeout: Duration,
    pub session: SessionOptions,
}

impl DeviceOptions {
    pub fn new(target: BDAddr, spec: MeasurementSpec) -> Self {
        DeviceOptions {
            target,
            spec,
            update_interval: Duration::from_millis(UPDATE_DEVICE_INTERVAL),
            scan_timeout: Duration::from_millis(SCAN_TIMEOUT),
            session: SessionOptions::default(),
        }
    }
}

struct ActiveLink {
    id: LinkId,
    peripheral: Peripheral,
    cancel: CancellationToken,
}

/// Tasks that give radio resources back: a running scan, a link being disconnected. The driver
/// waits for them before it returns, the runtime may be dropped right after.
#[derive(Default)]
struct Teardown {
    tasks: Vec<JoinHandle<()>>,
}

impl Teardown {
    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(spawn(task));
    }

    /// Returns `false` if some task did not finish within `limit`.
    async fn finish(&mut self, limit: Duration) -> bool {
        let tasks = std::mem::take(&mut self.tasks);

        let all = async move {
            for task in tasks {
                if let Err(err) = task.await {
                    if err.is_panic() {
                        error!("Teardown task failed: {}", readable_thread_panic_error(&err.into_panic()));
                    }
                }
            }
        };

        match timeout(limit, all).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Giving up on pending teardown after {:?}", limit);
                false
            },
        }
    }
}

enum ScanOutcome {
    Finished,
    Canceled,
    Failed(btleplug::Error),
}

/// Runs one scan from start to stop. Only one scan holds `lock` at a time, so a canceled scan
/// is stopped on the adapter before the next one starts. Once `start` succeeds `stop` is always
/// called, also when `cancel` fired while starting.
async fn own_scan<Start, Stop, StopFuture>(
    lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    scan_timeout: Duration,
    start: Start,
    stop: Stop,
) -> ScanOutcome
where
    Start: Future<Output = btleplug::Result<()>>,
    Stop: FnOnce() -> StopFuture,
    StopFuture: Future<Output = btleplug::Result<()>>,
{
    let _guard = lock.lock().await;
    if cancel.is_cancelled() {
        return ScanOutcome::Canceled;
    }

    info!("Scanning for {:?}...", scan_timeout);

    if let Err(err) = start.await {
        return ScanOutcome::Failed(err);
    }

    let finished = tokio::select! {
        _ = cancel.cancelled() => false,
        _ = sleep(scan_timeout) => true,
    };

    if let Err(err) = stop().await {
        warn!("Failed to stop scan: {:?}", err);
    }

    if finished {
        ScanOutcome::Finished
    } else {
        ScanOutcome::Canceled
    }
}

/// Executes the commands of a `DeviceSession` against btleplug and feeds everything that
/// happens on the radio back into it.
struct Driver {
    manager: Manager,
    adapter: Option<Adapter>,
    session: DeviceSession,
    inputs: Sender<DeviceInput>,
    snapshot: watch::Sender<DeviceSnapshot>,
    // peripherals seen by the current scan
    seen: HashMap<BDAddr, PeripheralId>,
    prepared: Option<Peripheral>,
    link: Option<ActiveLink>,
    scan_cancel: Option<(ScanId, CancellationToken)>,
    scan_lock: Arc<Mutex<()>>,
    scan_timeout: Duration,
    teardown: Teardown,
    cancel: CancellationToken,
}

fn radio_status_from(state: CentralState) -> RadioStatus {
    match state {
        CentralState::PoweredOff => RadioStatus::PoweredOff,
        // some platforms can not tell, assume the radio is usable
        _ => RadioStatus::PoweredOn,
    }
}

async fn radio_status(adapter: &Adapter) -> RadioStatus {
    match adapter.adapter_state().await {
        Ok(state) => radio_status_from(state),
        Err(err) => {
            warn!("Could not query adapter state: {:?}", err);
            RadioStatus::PoweredOn
        },
    }
}

fn scan_error_kind(err: &btleplug::Error, radio: RadioStatus) -> ScanErrorKind {
    match err {
        btleplug::Error::PermissionDenied => ScanErrorKind::PermissionDenied,
        _ if radio == RadioStatus::PoweredOff => ScanErrorKind::RadioOff,
        btleplug::Error::Other(_) | btleplug::Error::RuntimeError(_) => ScanErrorKind::Unknown,
        _ => ScanErrorKind::Other,
    }
}

async fn attach_adapter(manager: &Manager) -> Option<(Adapter, CentralEvents)> {
    let adapters = match manager.adapters().await {
        Ok(adapters) => adapters,
        Err(err) => {
            warn!("Failed to list bluetooth adapters: {:?}", err);
            return None;
        },
    };

    let Some(adapter) = adapters.into_iter().next() else {
        warn!("No bluetooth adapter found");
        return None;
    };

    info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

    match adapter.events().await {
        Ok(events) => Some((adapter, events)),
        Err(err) => {
            warn!("Failed to subscribe to adapter events: {:?}", err);
            None
        },
    }
}

async fn next_central_event(events: &mut Option<CentralEvents>) -> Option<CentralEvent> {
    match events {
        Some(events) => events.next().await,
        None => pending().await,
    }
}

async fn report(mut inputs: Sender<DeviceInput>, input: DeviceInput) {
    if inputs.send(input).await.is_err() {
        debug!("Device driver stopped, dropping input");
    }
}

async fn forward_notifications(cancel: CancellationToken, peripheral: Peripheral, link: LinkId, inputs: Sender<DeviceInput>) {
    let mut notification_stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(err) => {
            report(inputs, DeviceInput::LinkError { link, message: err.to_string() }).await;
            return;
        },
    };

    report(inputs.clone(), DeviceInput::LinkConnected(link)).await;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            notification = notification_stream.next() => {
                let Some(notification) = notification else {
                    debug!("Notification stream of link {:?} ended", link);
                    break 'mainloop;
                };

                let service = peripheral
                    .characteristics()
                    .iter()
                    .find(|characteristic| characteristic.uuid == notification.uuid)
                    .map(|characteristic| characteristic.service_uuid);

                match service {
                    Some(service) => {
                        let input = DeviceInput::CharacteristicChanged {
                            link,
                            service,
                            characteristic: notification.uuid,
                            value: notification.value,
                        };
                        report(inputs.clone(), input).await;
                    },
                    None => warn!("Notification for unknown characteristic {}", notification.uuid),
                }
            },
        }
    }
}

impl Driver {
    async fn run(mut self, mut events: Option<CentralEvents>, mut inputs: Receiver<DeviceInput>, update_interval: Duration) {
        let mut tick = interval(update_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately, start() already covers it
        tick.tick().await;

        let commands = self.session.start();
        self.apply(commands).await;

        'mainloop: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break 'mainloop;
                },
                _ = tick.tick() => {
                    if self.adapter.is_none() {
                        if let Some((adapter, stream)) = attach_adapter(&self.manager).await {
                            let status = radio_status(&adapter).await;
                            self.adapter = Some(adapter);
                            events = Some(stream);
                            self.dispatch(DeviceInput::RadioStatusChanged(status)).await;
                        }
                    } else if self.session.radio() == RadioStatus::PoweredOff {
                        self.refresh_radio_status().await;
                    }

                    self.dispatch(DeviceInput::Tick).await;
                },
                event = next_central_event(&mut events) => match event {
                    Some(event) => self.on_central_event(event).await,
                    None => {
                        warn!("Adapter event stream ended");
                        events = None;
                        self.adapter = None;
                        self.dispatch(DeviceInput::RadioStatusChanged(RadioStatus::Unavailable)).await;
                    },
                },
                Some(input) = inputs.next() => {
                    self.dispatch(input).await;
                },
            }
        }

        info!("Stopping device driver");
        let commands = self.session.reset();
        self.apply(commands).await;

        if self.teardown.finish(Duration::from_millis(SHUTDOWN_TIMEOUT)).await {
            debug!("Device driver stopped");
        }
    }

    // not every platform reports power changes as adapter events
    async fn refresh_radio_status(&mut self) {
        let Some(adapter) = self.adapter.clone() else {
            return;
        };

        let status = radio_status(&adapter).await;
        self.dispatch(DeviceInput::RadioStatusChanged(status)).await;
    }

    async fn dispatch(&mut self, input: DeviceInput) {
        let commands = self.session.handle(input);
        self.apply(commands).await;
    }

    async fn apply(&mut self, commands: Vec<Command>) {
        let mut changed = false;
        let mut commands = VecDeque::from(commands);

        while let Some(command) = commands.pop_front() {
            if command == Command::NotifyChanged {
                changed = true;
                continue;
            }

            if let Some(input) = self.execute(command).await {
                commands.extend(self.session.handle(input));
            }
        }

        self.publish(changed);
    }

    fn publish(&self, changed: bool) {
        let snapshot = DeviceSnapshot::of(&self.session);

        self.snapshot.send_if_modified(|current| {
            if *current != snapshot {
                *current = snapshot;
            }
            changed
        });
    }

    // returns the result of commands that complete immediately
    async fn execute(&mut self, command: Command) -> Option<DeviceInput> {
        match command {
            Command::StartScan(scan) => self.start_scan(scan),
            Command::StopScan(scan) => return self.stop_scan(scan),
            Command::RequestRadioPowerOn => {
                warn!("Bluetooth is turned off and can not be turned on by this application, please enable it");
            },
            Command::PrepareLink { address } => return Some(self.prepare_link(address).await),
            Command::Connect { link, address } => return self.connect(link, address),
            Command::DiscoverServices(link) => self.discover_services(link),
            Command::DiscoverServiceDetails { link, service } => return self.discover_service_details(link, service),
            Command::EnableNotifications { link, service, characteristic } => {
                return self.enable_notifications(link, service, characteristic)
            },
            Command::Disconnect(link) => self.disconnect(link),
            Command::NotifyChanged => {},
        }

        None
    }

    fn link_peripheral(&self, link: LinkId) -> Option<Peripheral> {
        self.link
            .as_ref()
            .filter(|active| active.id == link)
            .map(|active| active.peripheral.clone())
    }

    async fn on_central_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Some(peripheral) = self.describe_peripheral(&id).await {
                    self.seen.insert(peripheral.address, id);
                    self.dispatch(DeviceInput::PeripheralSeen(peripheral)).await;
                }
            },
            CentralEvent::DeviceDisconnected(id) => {
                let link = self.link
                    .as_ref()
                    .filter(|active| active.peripheral.id() == id)
                    .map(|active| active.id);

                if let Some(link) = link {
                    self.dispatch(DeviceInput::LinkDisconnected(link)).await;
                }
            },
            CentralEvent::StateUpdate(state) => {
                self.dispatch(DeviceInput::RadioStatusChanged(radio_status_from(state))).await;
            },
            _ => {},
        }
    }

    async fn describe_peripheral(&self, id: &PeripheralId) -> Option<DiscoveredPeripheral> {
        let adapter = self.adapter.as_ref()?;

        let peripheral = match adapter.peripheral(id).await {
            Ok(peripheral) => peripheral,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripheral: {}", err);
                return None;
            },
        };

        match peripheral.properties().await {
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
                None
            },
            Ok(None) => {
                debug!("Peripheral has no properties");
                None
            },
            Ok(Some(properties)) => Some(DiscoveredPeripheral {
                address: properties.address,
                name: properties.local_name,
                rssi: properties.rssi,
                services: properties.services,
            }),
        }
    }

    fn start_scan(&mut self, scan: ScanId) {
        let Some(adapter) = self.adapter.clone() else {
            error!("Can not scan without a bluetooth adapter");
            return;
        };

        if let Some((previous, cancel)) = self.scan_cancel.take() {
            debug!("Scan {:?} replaced by {:?}", previous, scan);
            cancel.cancel();
        }
        self.seen.clear();
        self.prepared = None;

        let cancel = self.cancel.child_token();
        self.scan_cancel = Some((scan, cancel.clone()));
        let inputs = self.inputs.clone();
        let lock = self.scan_lock.clone();
        let scan_timeout = self.scan_timeout;

        self.teardown.spawn(async move {
            let outcome = own_scan(
                lock,
                cancel.clone(),
                scan_timeout,
                adapter.start_scan(ScanFilter::default()),
                || adapter.stop_scan(),
            ).await;

            match outcome {
                ScanOutcome::Finished => report(inputs, DeviceInput::ScanFinished(scan)).await,
                ScanOutcome::Canceled => debug!("Scan {:?} stopped", scan),
                ScanOutcome::Failed(_) if cancel.is_cancelled() => {},
                ScanOutcome::Failed(err) => {
                    warn!("Scanning failed {:?}", err);
                    let kind = scan_error_kind(&err, radio_status(&adapter).await);
                    report(inputs, DeviceInput::ScanError { scan, kind }).await;
                },
            }
        });
    }

    // the scan task stops the adapter itself once its token is cancelled
    fn stop_scan(&mut self, scan: ScanId) -> Option<DeviceInput> {
        match self.scan_cancel.take() {
            Some((current, cancel)) if current == scan => cancel.cancel(),
            other => self.scan_cancel = other,
        }

        Some(DeviceInput::ScanCanceled(scan))
    }

    async fn prepare_link(&mut self, address: BDAddr) -> DeviceInput {
        let result = match (self.adapter.as_ref(), self.seen.get(&address)) {
            (None, _) => Err(DeviceError::NoAdapter),
            (_, None) => Err(DeviceError::UnknownPeripheral { address: address.to_string() }),
            (Some(adapter), Some(id)) => adapter.peripheral(id).await.map_err(DeviceError::from),
        };

        match result {
            Ok(peripheral) => {
                self.prepared = Some(peripheral);
                DeviceInput::LinkReady { address }
            },
            Err(err) => DeviceInput::LinkUnavailable { address, message: err.to_string() },
        }
    }

    fn connect(&mut self, link: LinkId, address: BDAddr) -> Option<DeviceInput> {
        let Some(peripheral) = self.prepared.take().filter(|peripheral| peripheral.address() == address) else {
            error!("No peripheral handle prepared for {}", address);
            return Some(DeviceInput::LinkError { link, message: format!("no peripheral handle for {}", address) });
        };

        if let Some(previous) = self.link.take() {
            error!("Replacing active link {:?}", previous.id);
            previous.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        self.link = Some(ActiveLink { id: link, peripheral: peripheral.clone(), cancel: cancel.clone() });
        let inputs = self.inputs.clone();

        spawn(async move {
            info!("Connecting to peripheral {}...", address);

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = peripheral.connect() => result,
            };

            match result {
                Ok(()) => forward_notifications(cancel, peripheral, link, inputs).await,
                Err(err) => {
                    warn!("Connecting to peripheral failed: {:?}", err);
                    report(inputs, DeviceInput::LinkError { link, message: err.to_string() }).await;
                },
            }
        });

        None
    }

    fn discover_services(&mut self, link: LinkId) {
        let Some(peripheral) = self.link_peripheral(link) else {
            error!("Service discovery requested for link {:?} which is not active", link);
            return;
        };
        let inputs = self.inputs.clone();

        spawn(async move {
            info!("Discovering services...");

            if let Err(err) = peripheral.discover_services().await {
                warn!("Discovering services failed: {:?}", err);
                report(inputs, DeviceInput::LinkError { link, message: err.to_string() }).await;
                return;
            }

            for service in peripheral.services() {
                report(inputs.clone(), DeviceInput::ServiceDiscovered { link, service: service.uuid }).await;
            }

            report(inputs, DeviceInput::ServiceDiscoveryFinished(link)).await;
        });
    }

    // btleplug discovers characteristics and descriptors together with the services
    fn discover_service_details(&mut self, link: LinkId, service: Uuid) -> Option<DeviceInput> {
        let Some(peripheral) = self.link_peripheral(link) else {
            error!("Details of service {} requested for link {:?} which is not active", service, link);
            return None;
        };

        let Some(found) = peripheral.services().into_iter().find(|candidate| candidate.uuid == service) else {
            return Some(DeviceInput::ServiceError { link, service, message: "service is not present".to_string() });
        };

        let cccd = make_cccd_uuid();
        let characteristics = found.characteristics
            .iter()
            .map(|characteristic| CharacteristicDetails {
                uuid: characteristic.uuid,
                notifiable: characteristic.descriptors.iter().any(|descriptor| descriptor.uuid == cccd)
                    || characteristic.properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
            })
            .collect();

        Some(DeviceInput::ServiceDetailsDiscovered { link, service, characteristics })
    }

    fn enable_notifications(&mut self, link: LinkId, service: Uuid, characteristic: Uuid) -> Option<DeviceInput> {
        let Some(peripheral) = self.link_peripheral(link) else {
            error!("Notifications for {} requested without a valid link", characteristic);
            return None;
        };

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|candidate| candidate.uuid == characteristic && candidate.service_uuid == service);

        let Some(target) = target else {
            let message = DeviceError::MissingCharacteristic { characteristic }.to_string();
            return Some(DeviceInput::DescriptorWriteFailed { link, service, characteristic, message });
        };
        let inputs = self.inputs.clone();

        spawn(async move {
            // subscribing writes ENABLE_NOTIFICATION_VALUE to the configuration descriptor
            let input = match peripheral.subscribe(&target).await {
                Ok(()) => DeviceInput::DescriptorWritten {
                    link,
                    service,
                    characteristic,
                    value: ENABLE_NOTIFICATION_VALUE.to_vec(),
                },
                Err(err) => DeviceInput::DescriptorWriteFailed { link, service, characteristic, message: err.to_string() },
            };
            report(inputs, input).await;
        });

        None
    }

    fn disconnect(&mut self, link: LinkId) {
        match self.link.take() {
            Some(active) if active.id == link => {
                active.cancel.cancel();

                self.teardown.spawn(async move {
                    info!("Disconnecting link {:?}", active.id);
                    if let Err(err) = active.peripheral.disconnect().await {
                        warn!("Failed to disconnect: {:?}", err);
                    }
                });
            },
            other => {
                debug!("Link {:?} is not active, nothing to disconnect", link);
                self.link = other;
            },
        }
    }
}

/// Starts looking for `options.target` and keeps the connection alive until `cancel` is
/// cancelled.
pub async fn start_device(options: DeviceOptions, cancel: CancellationToken) -> Result<(DeviceMonitor, JoinHandle<()>), DeviceError> {
    let manager = Manager::new().await?;

    let (adapter, events) = match attach_adapter(&manager).await {
        Some((adapter, events)) => (Some(adapter), Some(events)),
        None => (None, None),
    };

    let radio = match &adapter {
        Some(adapter) => radio_status(adapter).await,
        None => RadioStatus::Unavailable,
    };

    let session = DeviceSession::new(options.target, options.spec, radio, options.session);
    let (input_sender, input_receiver) = channel::<DeviceInput>(INPUT_CHANNEL_CAPACITY);
    let (snapshot_sender, snapshot_receiver) = watch::channel(DeviceSnapshot::of(&session));

    let driver = Driver {
        manager,
        adapter,
        session,
        inputs: input_sender.clone(),
        snapshot: snapshot_sender,
        seen: HashMap::new(),
        prepared: None,
        link: None,
        scan_cancel: None,
        scan_lock: Arc::default(),
        scan_timeout: options.scan_timeout,
        teardown: Teardown::default(),
        cancel,
    };

    let handle = spawn(driver.run(events, input_receiver, options.update_interval));

    Ok((DeviceMonitor::new(snapshot_receiver, input_sender), handle))
}
