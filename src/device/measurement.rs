use btleplug::api::bleuuid::uuid_from_u16;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{GLOVE_CHARACTERISTICS, GLOVE_SERVICE};

/// Declares which GATT services and characteristics are interesting, and the display name
/// under which the value of each characteristic is stored.
///
/// Built once before the device is started and never mutated afterwards; the builder methods
/// consume `self`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementSpec {
    services_and_characteristics: IndexMap<Uuid, IndexSet<Uuid>>,
    #[serde(default)]
    characteristic_names: IndexMap<Uuid, String>,
}

impl MeasurementSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `characteristics` to the set of interesting characteristics of `service`.
    pub fn with_service(mut self, service: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        self.services_and_characteristics
            .entry(service)
            .or_default()
            .extend(characteristics);
        self
    }

    pub fn with_name(mut self, characteristic: Uuid, name: impl Into<String>) -> Self {
        self.characteristic_names.insert(characteristic, name.into());
        self
    }

    /// The five finger sensors and two IMU orientation bytes of the smart glove.
    pub fn smart_glove() -> Self {
        let service = uuid_from_u16(GLOVE_SERVICE);

        GLOVE_CHARACTERISTICS.iter().fold(
            Self::new().with_service(service, GLOVE_CHARACTERISTICS.iter().map(|(id, _)| uuid_from_u16(*id))),
            |spec, (id, name)| spec.with_name(uuid_from_u16(*id), *name),
        )
    }

    pub fn is_target_service(&self, service: &Uuid) -> bool {
        self.services_and_characteristics.contains_key(service)
    }

    pub fn target_characteristics(&self, service: &Uuid) -> Option<&IndexSet<Uuid>> {
        self.services_and_characteristics.get(service)
    }

    pub fn services(&self) -> impl Iterator<Item = &Uuid> {
        self.services_and_characteristics.keys()
    }

    pub fn name_of(&self, characteristic: &Uuid) -> Option<&str> {
        self.characteristic_names.get(characteristic).map(String::as_str)
    }

    /// Display names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.characteristic_names.values().map(String::as_str)
    }

    // used for log messages
    pub fn name_or_uuid(&self, characteristic: &Uuid) -> String {
        match self.name_of(characteristic) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => characteristic.to_string(),
        }
    }
}
