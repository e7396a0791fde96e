use ota_server::{ServiceHandles, config::MAX_MTU};
use trouble_host::prelude::*;

/// The stack stores prepared fragments in the data cell, so it has to hold a
/// whole long write.
const DATA_LEN: usize = MAX_MTU as usize;

#[gatt_server]
pub struct OtaBatteryServer {
    pub battery: BatteryService,
    pub ota: OtaService,
}

#[gatt_service(uuid = service::BATTERY)]
pub struct BatteryService {
    #[characteristic(uuid = characteristic::BATTERY_LEVEL, read, notify, value = 100)]
    pub level: u8,
}

#[gatt_service(uuid = "ae5d1e47-5c13-43a0-8635-82ad38a1381f")]
pub struct OtaService {
    /// Command byte plus up to four parameter bytes; status byte on notify/indicate.
    #[characteristic(uuid = "a3dd50bf-f7a7-4e99-838e-570a086c661b", read, write, notify, indicate)]
    pub control_point: u8,
    #[characteristic(uuid = "a2e86c7a-d961-4091-b74f-2409e72efe26", write, write_without_response, value = [0u8; DATA_LEN])]
    pub data: [u8; DATA_LEN],
}

impl OtaBatteryServer<'_> {
    /// Handles the stack assigned, in the shape the dispatcher routes on.
    pub fn service_handles(&self) -> ServiceHandles {
        let fallback = ServiceHandles::DEFAULT;
        ServiceHandles {
            battery_level: self.battery.level.handle,
            battery_level_cccd: self
                .battery
                .level
                .cccd_handle
                .unwrap_or(fallback.battery_level_cccd),
            control_point: self.ota.control_point.handle,
            control_point_cccd: self
                .ota
                .control_point
                .cccd_handle
                .unwrap_or(fallback.control_point_cccd),
            data: self.ota.data.handle,
        }
    }
}
