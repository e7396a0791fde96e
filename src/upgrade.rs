//! Firmware-upgrade control point.
//!
//! The peer drives the session by writing command bytes to the control-point
//! attribute and image chunks to the data attribute:
//!
//! ```text
//! Idle --Prepare--> Prepared --Download(size)--> Transferring --chunks--> Transferring
//! Transferring --Verify(crc ok)--> Verified --peer confirms--> restart into new image
//! Transferring --Verify(crc bad)--> Failed
//! any --Abort--> Idle          any --Prepare--> Prepared
//! ```
//!
//! Command parameters are little-endian. Status bytes go back on the control
//! point: Prepare/Download answer with a notification, Verify with an
//! indication that the peer has to confirm.

use log::{info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{ConnectionId, error::UpgradeError, store::ImageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    Prepare = 0x01,
    Download = 0x02,
    Verify = 0x03,
    Abort = 0x04,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum UpgradeStatus {
    Ok = 0x00,
    Bad = 0x01,
    Error = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpgradeState {
    #[default]
    Idle,
    Prepared,
    Transferring,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Notify,
    Indicate,
}

/// Status byte to send on the control point after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub status: UpgradeStatus,
    pub delivery: Delivery,
}

impl StatusReport {
    const fn notify(status: UpgradeStatus) -> Self {
        Self {
            status,
            delivery: Delivery::Notify,
        }
    }

    const fn indicate(status: UpgradeStatus) -> Self {
        Self {
            status,
            delivery: Delivery::Indicate,
        }
    }
}

/// Result of one control-point write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    pub report: Option<StatusReport>,
    pub result: Result<(), UpgradeError>,
}

impl CommandOutcome {
    fn ok(report: Option<StatusReport>) -> Self {
        Self {
            report,
            result: Ok(()),
        }
    }

    fn rejected(err: UpgradeError) -> Self {
        Self {
            report: Some(StatusReport::notify(UpgradeStatus::Error)),
            result: Err(err),
        }
    }
}

/// What a Handle Value Confirmation means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The verified image may be activated.
    Activate,
    /// An unfinished session was stopped.
    Stopped,
    Ignored,
}

const PARAM_LEN: usize = 4;

/// The single upgrade transfer, owned by whichever connection prepared it.
pub struct UpgradeSession<S> {
    store: S,
    state: UpgradeState,
    peer: Option<ConnectionId>,
    total_size: u32,
    received: u32,
    expected_checksum: Option<u32>,
}

impl<S: ImageStore> UpgradeSession<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            state: UpgradeState::Idle,
            peer: None,
            total_size: 0,
            received: 0,
            expected_checksum: None,
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.state
    }

    pub fn peer(&self) -> Option<ConnectionId> {
        self.peer
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn expected_checksum(&self) -> Option<u32> {
        self.expected_checksum
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn transition(&mut self, next: UpgradeState) {
        if self.state != next {
            info!("upgrade: {:?} -> {:?}", self.state, next);
        }
        self.state = next;
    }

    fn check_owner(&self, conn: ConnectionId) -> Result<(), UpgradeError> {
        match self.peer {
            Some(owner) if self.state != UpgradeState::Idle && owner != conn => {
                warn!("upgrade owned by conn {}, ignoring conn {}", owner, conn);
                Err(UpgradeError::NotOwner)
            }
            _ => Ok(()),
        }
    }

    /// Parses and applies one control-point write.
    pub fn command(&mut self, conn: ConnectionId, bytes: &[u8]) -> CommandOutcome {
        let Some((&id, params)) = bytes.split_first() else {
            return CommandOutcome::rejected(UpgradeError::Empty);
        };
        let Ok(command) = Command::try_from(id) else {
            warn!("upgrade: unknown command {:#04x}", id);
            return CommandOutcome::rejected(UpgradeError::UnknownCommand(id));
        };
        if let Err(e) = self.check_owner(conn) {
            return CommandOutcome::rejected(e);
        }

        match command {
            Command::Prepare => self.prepare(conn),
            Command::Download => self.download(params),
            Command::Verify => self.verify(params),
            Command::Abort => {
                self.abort();
                CommandOutcome::ok(None)
            }
        }
    }

    fn prepare(&mut self, conn: ConnectionId) -> CommandOutcome {
        if self.state != UpgradeState::Idle {
            info!("upgrade: restarting session from {:?}", self.state);
        }
        self.store.discard();
        self.total_size = 0;
        self.received = 0;
        self.expected_checksum = None;

        match self.store.open() {
            Ok(()) => {
                self.peer = Some(conn);
                self.transition(UpgradeState::Prepared);
                CommandOutcome::ok(Some(StatusReport::notify(UpgradeStatus::Ok)))
            }
            Err(e) => {
                warn!("upgrade: cannot open staging area: {}", e);
                self.abort();
                CommandOutcome::rejected(e.into())
            }
        }
    }

    fn download(&mut self, params: &[u8]) -> CommandOutcome {
        let Ok(size) = <[u8; PARAM_LEN]>::try_from(params) else {
            warn!("upgrade: download with {} parameter bytes", params.len());
            return CommandOutcome::rejected(UpgradeError::BadLength {
                expected: PARAM_LEN,
                actual: params.len(),
            });
        };
        if self.state != UpgradeState::Prepared {
            warn!("upgrade: download in state {:?}", self.state);
            return CommandOutcome::rejected(UpgradeError::InvalidState);
        }
        let total_size = u32::from_le_bytes(size);
        if let Err(e) = self.store.reserve(total_size) {
            warn!("upgrade: cannot stage {} bytes: {}", total_size, e);
            return CommandOutcome::rejected(e.into());
        }
        self.total_size = total_size;
        self.received = 0;
        info!("upgrade: expecting {} bytes", total_size);
        self.transition(UpgradeState::Transferring);
        CommandOutcome::ok(Some(StatusReport::notify(UpgradeStatus::Ok)))
    }

    fn verify(&mut self, params: &[u8]) -> CommandOutcome {
        let Ok(crc) = <[u8; PARAM_LEN]>::try_from(params) else {
            warn!("upgrade: verify with {} parameter bytes", params.len());
            return CommandOutcome::rejected(UpgradeError::BadLength {
                expected: PARAM_LEN,
                actual: params.len(),
            });
        };
        if self.state != UpgradeState::Transferring {
            warn!("upgrade: verify in state {:?}", self.state);
            return CommandOutcome::rejected(UpgradeError::InvalidState);
        }
        let expected = u32::from_le_bytes(crc);
        self.expected_checksum = Some(expected);
        info!("upgrade: verifying against crc {:#010x}", expected);

        let result = if self.received != self.total_size {
            warn!(
                "upgrade: only {} of {} bytes received",
                self.received, self.total_size
            );
            Err(UpgradeError::ChecksumMismatch)
        } else {
            match self.store.checksum() {
                Ok(actual) if actual == expected => self.store.commit().map_err(UpgradeError::from),
                Ok(actual) => {
                    warn!("upgrade: staged crc {:#010x} != {:#010x}", actual, expected);
                    Err(UpgradeError::ChecksumMismatch)
                }
                Err(e) => Err(e.into()),
            }
        };

        match result {
            Ok(()) => {
                self.transition(UpgradeState::Verified);
                CommandOutcome::ok(Some(StatusReport::indicate(UpgradeStatus::Ok)))
            }
            Err(e) => {
                self.transition(UpgradeState::Failed);
                CommandOutcome {
                    report: Some(StatusReport::indicate(UpgradeStatus::Bad)),
                    result: Err(e),
                }
            }
        }
    }

    /// Appends one image chunk. Only accepted while transferring.
    pub fn data(&mut self, conn: ConnectionId, chunk: &[u8]) -> Result<(), UpgradeError> {
        self.check_owner(conn)?;
        if self.state != UpgradeState::Transferring {
            warn!(
                "upgrade: {} byte chunk in state {:?}",
                chunk.len(),
                self.state
            );
            return Err(UpgradeError::InvalidState);
        }
        let len = u32::try_from(chunk.len()).map_err(|_| UpgradeError::Overrun)?;
        let end = self
            .received
            .checked_add(len)
            .filter(|end| *end <= self.total_size)
            .ok_or(UpgradeError::Overrun)?;
        self.store.write(self.received, chunk)?;
        self.received = end;
        log::trace!("upgrade: {}/{} bytes", self.received, self.total_size);
        Ok(())
    }

    /// Handles the peer confirming our last indication.
    pub fn confirm(&mut self, conn: ConnectionId) -> Confirmation {
        if self.peer != Some(conn) {
            return Confirmation::Ignored;
        }
        match self.state {
            UpgradeState::Verified => Confirmation::Activate,
            UpgradeState::Idle => Confirmation::Ignored,
            _ => {
                self.abort();
                Confirmation::Stopped
            }
        }
    }

    /// Drops the session if `conn` owns it.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        if self.peer == Some(conn) && self.state != UpgradeState::Idle {
            info!("upgrade: peer {} left, aborting", conn);
            self.abort();
        }
    }

    /// Discards anything staged and returns to `Idle`.
    pub fn abort(&mut self) {
        self.store.discard();
        self.peer = None;
        self.total_size = 0;
        self.received = 0;
        self.expected_checksum = None;
        self.transition(UpgradeState::Idle);
    }
}
