use crate::schema::ServiceHandles;

/// Largest transport unit this server negotiates. Also the reassembly capacity.
pub const MAX_MTU: u16 = 512;
/// ATT default transport unit before any exchange.
pub const MIN_MTU: u16 = 23;
/// Delay between the peer confirming a verified image and the restart.
pub const ACTIVATION_GRACE_MS: u64 = 1000;
/// Number of simultaneous peers.
pub const CONNECTIONS_MAX: usize = 1;

pub const ADVERTISE_NAME: &str = "OTA Battery Server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Local preferred MTU, clamped into `MIN_MTU..=MAX_MTU`.
    pub local_mtu: u16,
    pub activation_grace_ms: u64,
    pub handles: ServiceHandles,
}

impl ServerConfig {
    pub fn with_handles(handles: ServiceHandles) -> Self {
        Self {
            handles,
            ..Self::default()
        }
    }

    pub(crate) fn clamped_mtu(&self) -> u16 {
        self.local_mtu.clamp(MIN_MTU, MAX_MTU)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            local_mtu: MAX_MTU,
            activation_grace_ms: ACTIVATION_GRACE_MS,
            handles: ServiceHandles::default(),
        }
    }
}
