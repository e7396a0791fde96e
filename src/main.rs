#![no_std]
#![no_main]

use embassy_executor::Spawner;
use log::{LevelFilter, info, warn};
use ota_server::{ImageStore, config::ADVERTISE_NAME};
use rtt_target::{rprintln, rtt_init_print};

mod ble;
mod gatt;
mod nrf;

#[panic_handler]
fn panic(e: &core::panic::PanicInfo) -> ! {
    rprintln!("PANIC: {}", e);
    loop {}
}

struct RttLogger;
impl log::Log for RttLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LevelFilter::Info
    }
    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            rprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }
    fn flush(&self) {}
}
static LOGGER: RttLogger = RttLogger;

fn init_logging() {
    rtt_init_print!();
    log::set_logger(&LOGGER).unwrap();
    log::set_max_level(LevelFilter::Info);
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    init_logging();

    let p = embassy_nrf::init(Default::default());
    info!("{} starting", ADVERTISE_NAME);

    // keep the image we booted into before anything else can fail
    let mut image = ble::ImageStaging::new();
    if let Err(e) = image.confirm_boot() {
        warn!("running image not confirmed: {}", e);
    }

    let sdc = nrf::init_ble(nrf::BleResources::take(p), spawner);
    spawner.spawn(ble::activation_task()).unwrap();

    ble::run(sdc, image).await;
}
