/// Largest payload the relay will carry in one notification.
///
/// ATT_MTU of 247 minus the 3-byte ATT header. Writes can never exceed this
/// on the wire, so the firmware never has to fragment.
pub const MAX_PAYLOAD: usize = 244;

/// Relay tunables, fixed at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RelayConfig {
    /// How many clients may be attached at once. The node stops advertising
    /// when this many links are up.
    pub max_clients: u32,
    /// Visual dwell of the activity flash, in milliseconds.
    pub flash_duration_ms: u32,
    /// Pixel brightness, 0-255. Kept low; the indicator sits on a desk.
    pub brightness: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_clients: 4,
            flash_duration_ms: 15,
            brightness: 20,
        }
    }
}
