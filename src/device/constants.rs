use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/**
 * How often (milliseconds) the device state is re-evaluated, restarting discovery when idle.
 */
pub const UPDATE_DEVICE_INTERVAL: u64 = 2000;

/**
 * How long (milliseconds) a single low energy scan may run before it is considered finished.
 */
pub const SCAN_TIMEOUT: u64 = 5000;

/**
 * How long (milliseconds) the driver waits for pending disconnects and stopped scans when it
 * shuts down.
 */
pub const SHUTDOWN_TIMEOUT: u64 = 3000;

/**
 * How often (milliseconds) the command line front end polls for the state and values.
 */
pub const POLL_DELAY: u64 = 500;

/**
 * Capacity of the channel that carries radio events and operation results to the state machine.
 */
pub const INPUT_CHANNEL_CAPACITY: usize = 128;

/**
 * The 16-bit id of the standard Client Characteristic Configuration descriptor.
 */
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: u16 = 0x2902;

/**
 * Value written to the client characteristic configuration descriptor to enable notifications.
 */
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/**
 * The smart glove the default config targets.
 */
pub const DEFAULT_TARGET_ADDRESS: &str = "30:7B:F5:33:2B:9D";

pub const GLOVE_SERVICE: u16 = 0x1101;

pub const GLOVE_CHARACTERISTICS: [(u16, &str); 7] = [
    (0x2101, "finger_1"),
    (0x2102, "finger_2"),
    (0x2103, "finger_3"),
    (0x2104, "finger_4"),
    (0x2105, "finger_5"),
    (0x2110, "imu_x"),
    (0x2111, "imu_y"),
];

pub fn make_cccd_uuid() -> Uuid {
    uuid_from_u16(CLIENT_CHARACTERISTIC_CONFIGURATION)
}
