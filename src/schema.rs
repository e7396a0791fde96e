//! Attribute layout of the battery and firmware-upgrade services.

use crate::{
    Handle,
    att::AttributeType,
    config::MAX_MTU,
    table::{AttributeDef, value_bytes},
};

const fn uuid128(uuid: u128) -> AttributeType {
    AttributeType::Uuid128(uuid.to_le_bytes())
}

pub const BATTERY_SERVICE_UUID: u16 = 0x180F;
pub const BATTERY_LEVEL: AttributeType = AttributeType::Uuid16(0x2A19);

pub const OTA_SERVICE_UUID: u128 = 0xae5d1e47_5c13_43a0_8635_82ad38a1381f;
pub const OTA_CONTROL_POINT: AttributeType = uuid128(0xa3dd50bf_f7a7_4e99_838e_570a086c661b);
pub const OTA_DATA: AttributeType = uuid128(0xa2e86c7a_d961_4091_b74f_2409e72efe26);

pub const CCCD: AttributeType = AttributeType::CLIENT_CHARACTERISTIC_CONFIG;
pub const CCCD_NOTIFY: u16 = 0x0001;
pub const CCCD_INDICATE: u16 = 0x0002;

/// Subscription bits of a stored CCCD value; anything shorter than two bytes is off.
pub fn cccd_bits(value: Option<&[u8]>) -> u16 {
    match value {
        Some([lo, hi, ..]) => u16::from_le_bytes([*lo, *hi]),
        _ => 0,
    }
}

pub const BATTERY_LEVEL_INITIAL: u8 = 100;
/// Control-point writes carry a command byte and at most four parameter bytes.
pub const CONTROL_POINT_LEN: usize = 5;

pub const ATTRIBUTE_COUNT: usize = 5;

/// Value handles the server routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandles {
    pub battery_level: Handle,
    pub battery_level_cccd: Handle,
    pub control_point: Handle,
    pub control_point_cccd: Handle,
    pub data: Handle,
}

impl ServiceHandles {
    /// Layout used when the stack does not dictate handles.
    pub const DEFAULT: Self = Self {
        battery_level: 0x0008,
        battery_level_cccd: 0x0009,
        control_point: 0x000C,
        control_point_cccd: 0x000D,
        data: 0x000F,
    };

    pub fn is_cccd(&self, handle: Handle) -> bool {
        handle == self.battery_level_cccd || handle == self.control_point_cccd
    }
}

impl Default for ServiceHandles {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The attribute schema for `handles`, in ascending handle order.
///
/// Handles must be ordered as in [`ServiceHandles::DEFAULT`].
pub const fn attributes(handles: &ServiceHandles) -> [AttributeDef; ATTRIBUTE_COUNT] {
    [
        AttributeDef {
            handle: handles.battery_level,
            attribute_type: BATTERY_LEVEL,
            max_len: 1,
            initial: &[BATTERY_LEVEL_INITIAL],
        },
        AttributeDef {
            handle: handles.battery_level_cccd,
            attribute_type: CCCD,
            max_len: 2,
            initial: &[0, 0],
        },
        AttributeDef {
            handle: handles.control_point,
            attribute_type: OTA_CONTROL_POINT,
            max_len: CONTROL_POINT_LEN,
            initial: &[],
        },
        AttributeDef {
            handle: handles.control_point_cccd,
            attribute_type: CCCD,
            max_len: 2,
            initial: &[0, 0],
        },
        AttributeDef {
            handle: handles.data,
            attribute_type: OTA_DATA,
            max_len: MAX_MTU as usize,
            initial: &[],
        },
    ]
}

pub const DEFAULT_ATTRIBUTES: [AttributeDef; ATTRIBUTE_COUNT] =
    attributes(&ServiceHandles::DEFAULT);

/// Value arena of the default schema.
pub const VALUE_BYTES: usize = value_bytes(&DEFAULT_ATTRIBUTES);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::AttributeTable;

    #[test]
    fn default_schema_builds() {
        let table = AttributeTable::<ATTRIBUTE_COUNT>::from_schema(&DEFAULT_ATTRIBUTES).unwrap();
        assert_eq!(table.len(), ATTRIBUTE_COUNT);
        assert_eq!(
            table.value(ServiceHandles::DEFAULT.battery_level),
            Some(&[BATTERY_LEVEL_INITIAL][..])
        );
    }

    #[test]
    fn arena_holds_each_value_once() {
        assert_eq!(VALUE_BYTES, 1 + 2 + CONTROL_POINT_LEN + 2 + MAX_MTU as usize);
    }

    #[test]
    fn uuid_bytes_are_little_endian() {
        let AttributeType::Uuid128(bytes) = OTA_DATA else {
            panic!("expected a 128-bit type");
        };
        assert_eq!(bytes[15], 0xa2);
        assert_eq!(bytes[0], 0x26);
    }
}
