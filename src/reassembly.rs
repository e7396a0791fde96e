//! Queue of prepare-write fragments for one long write.

use log::{debug, warn};

use crate::{Handle, config::MAX_MTU, error::AttError};

const CAPACITY: usize = MAX_MTU as usize;

/// Reassembly state of a single in-flight long write.
///
/// Fragments must arrive back to back: each offset equals the number of bytes
/// already queued. Only one target handle is accepted per session.
pub struct LongWrite {
    in_use: bool,
    handle: Handle,
    written: usize,
    buf: [u8; CAPACITY],
}

impl LongWrite {
    pub const fn new() -> Self {
        Self {
            in_use: false,
            handle: 0,
            written: 0,
            buf: [0; CAPACITY],
        }
    }

    pub fn is_open(&self) -> bool {
        self.in_use
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Handle of the last accepted fragment, if any.
    pub fn target(&self) -> Option<Handle> {
        (self.in_use && self.handle != 0).then_some(self.handle)
    }

    /// Queues one fragment and returns the accepted bytes for the echo.
    ///
    /// `capacity` is the connection's transport unit; a rejected fragment
    /// leaves the queued bytes untouched.
    pub fn append(
        &mut self,
        handle: Handle,
        offset: u16,
        value: &[u8],
        capacity: usize,
    ) -> Result<&[u8], AttError> {
        if !self.in_use {
            self.buf.fill(0);
            self.written = 0;
            self.handle = 0;
            self.in_use = true;
            debug!("long write opened");
        }

        if self.handle != 0 && self.handle != handle {
            warn!(
                "long write to {:#06x} while {:#06x} is queued",
                handle, self.handle
            );
            return Err(AttError::OperationError);
        }
        if usize::from(offset) != self.written {
            warn!(
                "fragment offset {} does not follow {} queued bytes",
                offset, self.written
            );
            return Err(AttError::OperationError);
        }
        let capacity = capacity.min(CAPACITY);
        if capacity.saturating_sub(self.written) < value.len() {
            warn!(
                "fragment of {} bytes overflows {} byte queue",
                value.len(),
                capacity
            );
            return Err(AttError::OperationError);
        }

        let start = self.written;
        self.buf[start..start + value.len()].copy_from_slice(value);
        self.written += value.len();
        self.handle = handle;
        Ok(&self.buf[start..self.written])
    }

    /// Closes the session and hands out what was queued.
    pub fn take(&mut self) -> Option<(Handle, &[u8])> {
        if !self.in_use {
            return None;
        }
        self.in_use = false;
        debug!(
            "long write closed with {} bytes for {:#06x}",
            self.written, self.handle
        );
        Some((self.handle, &self.buf[..self.written]))
    }

    /// Drops the queued fragments without committing them.
    pub fn discard(&mut self) {
        if self.in_use {
            debug!("long write discarded after {} bytes", self.written);
        }
        self.in_use = false;
        self.written = 0;
        self.handle = 0;
    }
}

impl Default for LongWrite {
    fn default() -> Self {
        Self::new()
    }
}
