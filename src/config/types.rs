use std::str::FromStr;
use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};

use crate::device::constants::DEFAULT_TARGET_ADDRESS;
use crate::device::measurement::MeasurementSpec;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub target_address: String,
    pub measurement: MeasurementSpec,
}

impl Config {
    pub fn target_address(&self) -> Result<BDAddr, ConfigError> {
        BDAddr::from_str(self.target_address.trim()).map_err(|source| ConfigError::InvalidAddress {
            address: self.target_address.clone(),
            source,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            target_address: DEFAULT_TARGET_ADDRESS.to_string(),
            measurement: MeasurementSpec::smart_glove(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_the_glove() {
        let config = Config::default();

        assert_eq!(
            config.target_address().unwrap(),
            BDAddr::from([0x30, 0x7B, 0xF5, 0x33, 0x2B, 0x9D]),
        );
        assert_eq!(config.measurement, MeasurementSpec::smart_glove());
    }

    #[test]
    fn invalid_address_is_reported() {
        let config = Config { target_address: "not an address".to_string(), ..Config::default() };

        assert!(matches!(config.target_address(), Err(ConfigError::InvalidAddress { .. })));
    }

    #[test]
    fn serializes_to_camel_case() {
        let json = serde_json::to_string(&Config::default()).unwrap();

        assert!(json.contains("\"targetAddress\":\"30:7B:F5:33:2B:9D\""));
        assert!(json.contains("\"servicesAndCharacteristics\""));
        assert!(json.contains("\"characteristicNames\""));

        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Config::default());
    }
}
