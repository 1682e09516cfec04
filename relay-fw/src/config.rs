//! Node configuration constants.

/// Device name advertised over BLE (carried in the scan response; the ADV
/// payload itself only has room for flags + the 128-bit service UUID).
pub const DEVICE_NAME: &str = "QRx-Mesh-Node";

/// UUID for the relay service.
///
/// Must match the literal in the service definition in `ble.rs`; this copy
/// feeds the advertising payload.
pub const RELAY_SERVICE_UUID: u128 = 0x4fafc201_1fb5_459e_8fcc_c5c9c331914b;

/// How many clients can chat at once.
/// The nRF52840 handles 4 concurrent links comfortably. Keep in step with
/// `RelayConfig::default().max_clients` and the queue pool in `ble.rs`.
pub const MAX_CLIENTS: usize = 4;

/// Outbound notifications buffered per client before the relay dispatcher
/// backpressures.
pub const CLIENT_QUEUE_DEPTH: usize = 4;

/// Radio events awaiting the dispatch task.
pub const EVENT_QUEUE_DEPTH: usize = 8;
