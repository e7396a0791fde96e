//! Staging storage for a downloaded firmware image.

use heapless::Vec;
use log::{debug, info};

use crate::error::StoreError;

/// Persistent staging area consumed by the upgrade session.
///
/// Writes are strictly sequential. The checksum is CRC-32 (IEEE) over every
/// byte written since [`ImageStore::open`].
pub trait ImageStore {
    /// Opens the staging area, dropping any previously staged bytes.
    fn open(&mut self) -> Result<(), StoreError>;

    /// Announces how many bytes the image will have.
    fn reserve(&mut self, total_size: u32) -> Result<(), StoreError>;

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StoreError>;

    fn checksum(&self) -> Result<u32, StoreError>;

    /// Marks the staged image to be booted on the next restart.
    fn commit(&mut self) -> Result<(), StoreError>;

    fn discard(&mut self);

    /// Marks the image that is running now as good, so the bootloader does
    /// not roll back to the previous one on the next restart.
    fn confirm_boot(&mut self) -> Result<(), StoreError>;
}

/// RAM-backed staging area of `N` bytes.
pub struct RamImageStore<const N: usize> {
    open: bool,
    reserved: u32,
    committed: bool,
    boot_confirmed: bool,
    data: Vec<u8, N>,
}

impl<const N: usize> RamImageStore<N> {
    pub const fn new() -> Self {
        Self {
            open: false,
            reserved: 0,
            committed: false,
            boot_confirmed: false,
            data: Vec::new(),
        }
    }

    pub fn staged(&self) -> &[u8] {
        &self.data
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    pub fn is_boot_confirmed(&self) -> bool {
        self.boot_confirmed
    }
}

impl<const N: usize> Default for RamImageStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ImageStore for RamImageStore<N> {
    fn open(&mut self) -> Result<(), StoreError> {
        self.data.clear();
        self.reserved = 0;
        self.committed = false;
        self.open = true;
        debug!("staging area opened ({} bytes)", N);
        Ok(())
    }

    fn reserve(&mut self, total_size: u32) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        if total_size as usize > N {
            return Err(StoreError::NoSpace);
        }
        self.reserved = total_size;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        if offset as usize != self.data.len() {
            return Err(StoreError::OutOfOrder { offset });
        }
        self.data
            .extend_from_slice(data)
            .map_err(|_| StoreError::NoSpace)
    }

    fn checksum(&self) -> Result<u32, StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        Ok(crc32fast::hash(&self.data))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if !self.open {
            return Err(StoreError::NotOpen);
        }
        self.committed = true;
        info!("staged image of {} bytes marked for activation", self.data.len());
        Ok(())
    }

    fn discard(&mut self) {
        self.data.clear();
        self.reserved = 0;
        self.committed = false;
        self.open = false;
    }

    fn confirm_boot(&mut self) -> Result<(), StoreError> {
        if !self.boot_confirmed {
            info!("running image confirmed");
        }
        self.boot_confirmed = true;
        Ok(())
    }
}
