//! Simulated battery level.

use log::{debug, warn};

use crate::{
    schema::{BATTERY_LEVEL_INITIAL, CCCD_NOTIFY, cccd_bits},
    sender::{Transport, send_notification},
    server::GattServer,
    store::ImageStore,
};

/// Seconds between two level updates.
pub const UPDATE_PERIOD_SECS: u64 = 10;
pub const DRAIN_STEP: u8 = 2;

/// Level after one period: drains by [`DRAIN_STEP`], recharges to full once empty.
pub fn next_level(level: u8) -> u8 {
    if level == 0 {
        BATTERY_LEVEL_INITIAL
    } else {
        level.saturating_sub(DRAIN_STEP)
    }
}

impl<S: ImageStore, const N: usize, const B: usize> GattServer<S, N, B> {
    pub fn battery_level(&self) -> u8 {
        self.table
            .value(self.config.handles.battery_level)
            .and_then(|v| v.first().copied())
            .unwrap_or(0)
    }

    pub fn battery_notifications_enabled(&self) -> bool {
        cccd_bits(self.table.value(self.config.handles.battery_level_cccd)) & CCCD_NOTIFY != 0
    }

    /// Advances the level and notifies every subscribed connection.
    ///
    /// Returns how many connections were notified.
    pub fn drain_battery<T: Transport>(&mut self, transport: &mut T) -> usize {
        let handle = self.config.handles.battery_level;
        let level = next_level(self.battery_level());
        if let Err(e) = self.table.set(handle, &[level]) {
            warn!("battery level not stored: {}", e);
            return 0;
        }
        debug!("battery level {}%", level);

        if !self.battery_notifications_enabled() {
            return 0;
        }
        self.connections
            .iter()
            .filter(|c| send_notification(transport, c.id, handle, &[level]))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ServerConfig, ServiceHandles,
        sender::testing::{Recorder, Sent},
        store::RamImageStore,
    };

    const H: ServiceHandles = ServiceHandles::DEFAULT;

    #[test]
    fn level_drains_and_wraps() {
        assert_eq!(next_level(100), 98);
        assert_eq!(next_level(2), 0);
        assert_eq!(next_level(1), 0);
        assert_eq!(next_level(0), 100);
    }

    #[test]
    fn notifies_only_when_subscribed() {
        let mut s = GattServer::with_config(ServerConfig::default(), RamImageStore::<16>::new())
            .unwrap();
        s.connect(4).unwrap();
        let mut rec = Recorder::default();

        assert_eq!(s.drain_battery(&mut rec), 0);
        assert_eq!(s.battery_level(), 98);
        assert!(rec.take().is_empty());

        let mut cccd = [0x12, 0, 0, 0x01, 0x00];
        cccd[1..3].copy_from_slice(&H.battery_level_cccd.to_le_bytes());
        s.process_pdu(4, &cccd, &mut rec);
        rec.take();

        assert_eq!(s.drain_battery(&mut rec), 1);
        assert_eq!(
            rec.take(),
            vec![Sent::Notification(4, H.battery_level, vec![96])]
        );
    }

    #[test]
    fn failed_notification_is_not_counted() {
        let mut s = GattServer::with_config(ServerConfig::default(), RamImageStore::<16>::new())
            .unwrap();
        s.connect(4).unwrap();
        let mut rec = Recorder::default();
        let mut cccd = [0x12, 0, 0, 0x01, 0x00];
        cccd[1..3].copy_from_slice(&H.battery_level_cccd.to_le_bytes());
        s.process_pdu(4, &cccd, &mut rec);

        rec.fail_sends = true;
        assert_eq!(s.drain_battery(&mut rec), 0);
        assert_eq!(s.battery_level(), 98);
    }
}
