use embassy_futures::{
    join::join,
    select::{Either, select},
};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::{Duration, Ticker, Timer};
use heapless::Vec;
use log::{info, warn};
use ota_server::{
    Action, ConnectionId, GattServer, Handle, RamImageStore, Request, Response, ServerConfig,
    Transport,
    battery::UPDATE_PERIOD_SECS,
    config::{ADVERTISE_NAME, CONNECTIONS_MAX, MAX_MTU},
    error::RequestError,
    schema::{CONTROL_POINT_LEN, OTA_SERVICE_UUID},
};
use static_cell::StaticCell;
use trouble_host::att::{AttClient, AttReq, AttRsp};
use trouble_host::gatt::GattConnectionEvent;
use trouble_host::prelude::*;

use crate::gatt::OtaBatteryServer;

const L2CAP_CHANNELS_MAX: usize = 2;

const PERIPHERAL_ADDR_BYTES: [u8; 6] = [0x3c, 0x0a, 0x7a, 0x51, 0xe5, 0xc0];

/// Staging area for the downloaded image. The storage medium is left to the board.
const IMAGE_CAPACITY: usize = 16 * 1024;

pub type ImageStaging = RamImageStore<IMAGE_CAPACITY>;

type OtaServer = GattServer<ImageStaging>;

static RESOURCES: StaticCell<
    HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX>,
> = StaticCell::new();
static GATT: StaticCell<OtaBatteryServer<'static>> = StaticCell::new();
static OTA: StaticCell<OtaServer> = StaticCell::new();

static ACTIVATE: Signal<CriticalSectionRawMutex, u64> = Signal::new();

/// Waits for a confirmed image, then resets into it after the grace delay.
#[embassy_executor::task]
pub async fn activation_task() -> ! {
    let after_ms = ACTIVATE.wait().await;
    info!("[ota] restarting into new image in {} ms", after_ms);
    Timer::after_millis(after_ms).await;
    cortex_m::peripheral::SCB::sys_reset()
}

/// Answer the dispatcher produced for the current request.
enum Reply {
    Read(Vec<u8, { MAX_MTU as usize }>),
    Write,
    Mtu(u16),
    Error(RequestError),
    /// Accepted here; the stack encodes the answer from its own table.
    Deferred,
}

struct Outgoing {
    handle: Handle,
    value: Vec<u8, CONTROL_POINT_LEN>,
    indicate: bool,
}

#[derive(Debug)]
struct OutboxFull;

/// Collects the dispatcher's output so it can be sent from async context.
#[derive(Default)]
struct Outbox {
    reply: Option<Reply>,
    pending: Vec<Outgoing, 4>,
}

impl Outbox {
    fn push(&mut self, handle: Handle, value: &[u8], indicate: bool) -> Result<(), OutboxFull> {
        let value = Vec::from_slice(value).map_err(|_| OutboxFull)?;
        self.pending
            .push(Outgoing {
                handle,
                value,
                indicate,
            })
            .map_err(|_| OutboxFull)
    }
}

impl Transport for Outbox {
    type Error = OutboxFull;

    fn respond(&mut self, _conn: ConnectionId, response: &Response<'_>) -> Result<(), OutboxFull> {
        let reply = match *response {
            Response::Read { value, blob: false } => {
                Reply::Read(Vec::from_slice(value).map_err(|_| OutboxFull)?)
            }
            Response::Write => Reply::Write,
            Response::ExchangeMtu { mtu } => Reply::Mtu(mtu),
            Response::Error(err) => Reply::Error(err),
            _ => Reply::Deferred,
        };
        self.reply = Some(reply);
        Ok(())
    }

    fn notify(&mut self, _conn: ConnectionId, handle: Handle, value: &[u8]) -> Result<(), OutboxFull> {
        self.push(handle, value, false)
    }

    fn indicate(&mut self, _conn: ConnectionId, handle: Handle, value: &[u8]) -> Result<(), OutboxFull> {
        self.push(handle, value, true)
    }
}

pub async fn run<C: Controller>(controller: C, image: ImageStaging) {
    let address = Address::random(PERIPHERAL_ADDR_BYTES);
    info!("Starting BLE Stack with address {:?}", address);

    let resources = RESOURCES.init(HostResources::new());
    let stack = trouble_host::new(controller, resources).set_random_address(address);
    let Host {
        mut peripheral,
        mut runner,
        ..
    } = stack.build();

    let gatt = GATT.init(
        OtaBatteryServer::new_with_config(GapConfig::Peripheral(PeripheralConfig {
            name: ADVERTISE_NAME,
            appearance: &appearance::power_device::GENERIC_POWER_DEVICE,
        }))
        .unwrap(),
    );
    let config = ServerConfig::with_handles(gatt.service_handles());
    let ota = OTA.init(OtaServer::with_config(config, image).unwrap());

    join(runner.run(), async {
        let mut adv_data = [0; 31];
        let mut scan_data = [0; 31];

        let len_adv = AdStructure::encode_slice(
            &[
                AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
                AdStructure::ServiceUuids16(&[[0x0f, 0x18]]),
                AdStructure::ServiceUuids128(&[OTA_SERVICE_UUID.to_le_bytes()]),
            ],
            &mut adv_data,
        )
        .unwrap();

        let len_scan = AdStructure::encode_slice(
            &[AdStructure::CompleteLocalName(ADVERTISE_NAME.as_bytes())],
            &mut scan_data,
        )
        .unwrap();

        let mut battery = Ticker::every(Duration::from_secs(UPDATE_PERIOD_SECS));

        loop {
            info!("Advertising...");

            let advertiser = peripheral
                .advertise(
                    &Default::default(),
                    Advertisement::ConnectableScannableUndirected {
                        adv_data: &adv_data[..len_adv],
                        scan_data: &scan_data[..len_scan],
                    },
                )
                .await
                .unwrap();

            let connection = match advertiser.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[adv] accept failed: {:?}", e);
                    continue;
                }
            };
            let gatt_conn = match connection.with_attribute_server(gatt) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("[gatt] attach failed: {:?}", e);
                    continue;
                }
            };
            let id = gatt_conn.raw().handle().raw();

            if ota.connect(id).is_ok() {
                serve(gatt, ota, &gatt_conn, id, &mut battery).await;
            }
            ota.disconnect(id);
        }
    })
    .await;
}

async fn serve<P: PacketPool>(
    gatt: &OtaBatteryServer<'_>,
    ota: &mut OtaServer,
    conn: &GattConnection<'_, '_, P>,
    id: ConnectionId,
    battery: &mut Ticker,
) {
    loop {
        match select(conn.next(), battery.next()).await {
            Either::First(GattConnectionEvent::Disconnected { reason }) => {
                info!("[gatt] disconnected: {:?}", reason);
                return;
            }
            Either::First(GattConnectionEvent::Gatt { event }) => {
                handle_event(gatt, ota, conn, id, event).await;
            }
            Either::First(_) => {}
            Either::Second(()) => {
                let mut outbox = Outbox::default();
                ota.drain_battery(&mut outbox);
                if let Err(e) = gatt.battery.level.set(gatt, &ota.battery_level()) {
                    warn!("[gatt] battery level not mirrored: {:?}", e);
                }
                flush(gatt, ota, conn, id, outbox).await;
            }
        }
    }
}

/// The dispatcher request carried by an event the stack did not classify.
fn classify<'a>(incoming: AttClient<'a>) -> Option<Request<'a>> {
    match incoming {
        AttClient::Request(AttReq::PrepareWrite {
            handle,
            offset,
            value,
        }) => Some(Request::PrepareWrite {
            handle,
            offset,
            value,
        }),
        AttClient::Request(AttReq::ExecuteWrite { flags }) => {
            Some(Request::ExecuteWrite { commit: flags == 0x01 })
        }
        AttClient::Request(AttReq::ReadBlob { handle, offset }) => Some(Request::Read {
            handle,
            offset,
            blob: true,
        }),
        AttClient::Confirmation(_) => Some(Request::Confirmation),
        _ => None,
    }
}

async fn handle_event<P: PacketPool>(
    gatt: &OtaBatteryServer<'_>,
    ota: &mut OtaServer,
    conn: &GattConnection<'_, '_, P>,
    id: ConnectionId,
    event: GattEvent<'_, '_, P>,
) {
    let mut outbox = Outbox::default();
    let handles = ota.config().handles;

    let (request, cccd) = match &event {
        GattEvent::Read(e) => (
            Some(Request::Read {
                handle: e.handle(),
                offset: 0,
                blob: false,
            }),
            false,
        ),
        GattEvent::Write(e) => (
            Some(Request::Write {
                handle: e.handle(),
                value: e.data(),
                ack: true,
            }),
            handles.is_cccd(e.handle()),
        ),
        GattEvent::Other(e) => (classify(e.payload().incoming()), false),
    };
    let action = request.and_then(|request| ota.process(id, request, &mut outbox));

    // The stack keeps its own subscription state, so it answers CCCD writes.
    let reply = outbox.reply.take();
    let rsp = match &reply {
        Some(Reply::Read(data)) => Some(AttRsp::Read { data }),
        Some(Reply::Write) if !cccd => Some(AttRsp::Write),
        Some(Reply::Mtu(mtu)) => Some(AttRsp::ExchangeMtu { mtu: *mtu }),
        Some(Reply::Error(err)) => Some(AttRsp::Error {
            request: err.opcode,
            handle: err.handle,
            code: AttErrorCode::from(err.kind.code()),
        }),
        _ => None,
    };
    let sent = match rsp {
        Some(rsp) => event.into_payload().reply(rsp).await,
        None => match event.accept() {
            Ok(reply) => {
                reply.send().await;
                Ok(())
            }
            Err(e) => Err(e),
        },
    };
    if let Err(e) = sent {
        warn!("[gatt] reply failed: {:?}", e);
    }

    if let Some(Action::Activate { after_ms }) = action {
        ACTIVATE.signal(after_ms);
    }
    flush(gatt, ota, conn, id, outbox).await;
}

/// Sends queued notifications and indications, mirroring values into the stack's table.
async fn flush<P: PacketPool>(
    gatt: &OtaBatteryServer<'_>,
    ota: &mut OtaServer,
    conn: &GattConnection<'_, '_, P>,
    id: ConnectionId,
    outbox: Outbox,
) {
    for out in outbox.pending {
        let Some(&value) = out.value.first() else {
            continue;
        };
        let sent = if out.handle == gatt.battery.level.handle {
            gatt.battery.level.notify(conn, &value).await
        } else if out.handle == gatt.ota.control_point.handle {
            if let Err(e) = gatt.ota.control_point.set(gatt, &value) {
                warn!("[gatt] status not mirrored: {:?}", e);
            }
            if out.indicate {
                gatt.ota.control_point.indicate(conn, &value).await
            } else {
                gatt.ota.control_point.notify(conn, &value).await
            }
        } else {
            warn!("[gatt] nothing to send on {:#06x}", out.handle);
            continue;
        };

        match sent {
            // The stack consumes the peer's confirmation of an indication.
            Ok(()) if out.indicate => {
                if let Some(Action::Activate { after_ms }) =
                    ota.process(id, Request::Confirmation, &mut Outbox::default())
                {
                    ACTIVATE.signal(after_ms);
                }
            }
            Ok(()) => {}
            Err(e) => warn!(
                "[gatt] {} on {:#06x} failed: {:?}",
                if out.indicate { "indication" } else { "notification" },
                out.handle,
                e
            ),
        }
    }
}
