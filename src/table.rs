//! Handle-addressed attribute values.

use heapless::Vec;
use log::warn;

use crate::{
    Handle,
    att::AttributeType,
    error::{AttError, SchemaError},
    schema::VALUE_BYTES,
};

/// Build-time description of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeDef {
    pub handle: Handle,
    pub attribute_type: AttributeType,
    pub max_len: usize,
    pub initial: &'static [u8],
}

/// Total value bytes `schema` needs, one `max_len` slot per attribute.
pub const fn value_bytes(schema: &[AttributeDef]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < schema.len() {
        total += schema[i].max_len;
        i += 1;
    }
    total
}

/// Where one attribute's value lives in the table's arena.
#[derive(Debug, Clone, Copy)]
pub struct Attribute {
    handle: Handle,
    attribute_type: AttributeType,
    max_len: usize,
    len: usize,
    start: usize,
}

impl Attribute {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn attribute_type(&self) -> AttributeType {
        self.attribute_type
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot(&self) -> core::ops::Range<usize> {
        self.start..self.start + self.max_len
    }
}

/// Fixed set of attributes sorted by handle.
///
/// Values share one arena of `B` bytes, each attribute owning exactly
/// `max_len` of it.
pub struct AttributeTable<const N: usize, const B: usize = VALUE_BYTES> {
    entries: Vec<Attribute, N>,
    arena: [u8; B],
}

impl<const N: usize, const B: usize> AttributeTable<N, B> {
    /// Builds the table; handles must be non-zero and strictly increasing.
    pub fn from_schema(schema: &[AttributeDef]) -> Result<Self, SchemaError> {
        let mut entries = Vec::new();
        let mut arena = [0; B];
        let mut last = 0;
        let mut used = 0;
        for def in schema {
            if def.handle <= last {
                return Err(SchemaError::BadHandle(def.handle));
            }
            last = def.handle;
            if def.initial.len() > def.max_len || B - used < def.max_len {
                return Err(SchemaError::CapacityExceeded(def.handle));
            }
            arena[used..used + def.initial.len()].copy_from_slice(def.initial);
            entries
                .push(Attribute {
                    handle: def.handle,
                    attribute_type: def.attribute_type,
                    max_len: def.max_len,
                    len: def.initial.len(),
                    start: used,
                })
                .map_err(|_| SchemaError::TooManyAttributes)?;
            used += def.max_len;
        }
        Ok(Self { entries, arena })
    }

    fn position(&self, handle: Handle) -> Option<usize> {
        self.entries
            .binary_search_by_key(&handle, |a| a.handle)
            .ok()
    }

    pub fn find(&self, handle: Handle) -> Option<&Attribute> {
        self.position(handle).map(|i| &self.entries[i])
    }

    pub fn value(&self, handle: Handle) -> Option<&[u8]> {
        self.find(handle)
            .map(|a| &self.arena[a.start..a.start + a.len])
    }

    /// Replaces the value of `handle`. Nothing changes on error.
    pub fn set(&mut self, handle: Handle, bytes: &[u8]) -> Result<(), AttError> {
        let ix = self.position(handle).ok_or(AttError::InvalidHandle)?;
        let attr = &mut self.entries[ix];
        if bytes.len() > attr.max_len {
            return Err(AttError::InvalidLength);
        }
        let slot = &mut self.arena[attr.slot()];
        slot.fill(0);
        slot[..bytes.len()].copy_from_slice(bytes);
        attr.len = bytes.len();
        if &slot[..bytes.len()] != bytes {
            warn!("attribute {:#06x} readback mismatch", handle);
            return Err(AttError::OperationError);
        }
        Ok(())
    }

    /// First handle in `from..=end` whose type is `attribute_type`.
    pub fn next_of_type(
        &self,
        from: Handle,
        end: Handle,
        attribute_type: &AttributeType,
    ) -> Option<Handle> {
        let start = self.entries.partition_point(|a| a.handle < from);
        self.entries[start..]
            .iter()
            .take_while(|a| a.handle <= end)
            .find(|a| a.attribute_type == *attribute_type)
            .map(|a| a.handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
