use indexmap::IndexSet;
use log::{debug, info};
use uuid::Uuid;

use crate::device::measurement::MeasurementSpec;
use crate::device::types::{CharacteristicDetails, Command, LinkId};

/// Per-service progress on the link: characteristic discovery and notification enablement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSession {
    link: LinkId,
    service: Uuid,
    details_discovered: bool,
    // requested by the measurement spec and exposed by the peripheral
    subscriptions: IndexSet<Uuid>,
}

impl ServiceSession {
    /// Creates the session and the command that starts discovering the service's details.
    pub fn start(link: LinkId, service: Uuid) -> (Self, Command) {
        let session = ServiceSession {
            link,
            service,
            details_discovered: false,
            subscriptions: IndexSet::new(),
        };

        (session, Command::DiscoverServiceDetails { link, service })
    }

    pub fn service(&self) -> Uuid {
        self.service
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn details_discovered(&self) -> bool {
        self.details_discovered
    }

    pub fn subscriptions(&self) -> &IndexSet<Uuid> {
        &self.subscriptions
    }

    pub fn owns(&self, characteristic: &Uuid) -> bool {
        self.subscriptions.contains(characteristic)
    }

    /// Records the characteristics the peripheral exposes for this service and returns a
    /// notification request for every interesting one that can notify.
    pub fn on_details_discovered(&mut self, spec: &MeasurementSpec, exposed: &[CharacteristicDetails]) -> Vec<Command> {
        let mut commands = Vec::new();

        if self.details_discovered {
            debug!("Details of service {} were already discovered", self.service);
            return commands;
        }
        self.details_discovered = true;

        let Some(targets) = spec.target_characteristics(&self.service) else {
            debug!("Ignoring service {}", self.service);
            return commands;
        };

        info!("Details of service {} discovered", self.service);

        for characteristic in targets {
            let Some(details) = exposed.iter().find(|details| details.uuid == *characteristic) else {
                info!("Characteristic {} not found on the peripheral", spec.name_or_uuid(characteristic));
                continue;
            };

            self.subscriptions.insert(*characteristic);

            if !details.notifiable {
                info!("Characteristic {} has no notification descriptor", spec.name_or_uuid(characteristic));
                continue;
            }

            debug!("Enabling notifications for {}", spec.name_or_uuid(characteristic));
            commands.push(Command::EnableNotifications {
                link: self.link,
                service: self.service,
                characteristic: *characteristic,
            });
        }

        commands
    }
}
