//! Request dispatcher: routes decoded ATT requests to the attribute table,
//! the long-write queue of the requesting connection, or the upgrade session.
//!
//! Every request is handled to completion before the next one. Failures are
//! answered with an Error Response (unless the request is a command) and never
//! stop the dispatcher.

use heapless::Vec;
use log::{debug, info, warn};

use crate::{
    ConnectionId, Handle,
    att::{AttributeType, COMMAND_FLAG, HandleList, Opcode, Request, Response},
    config::{CONNECTIONS_MAX, MAX_MTU, MIN_MTU, ServerConfig},
    error::{AttError, RequestError, SchemaError},
    reassembly::LongWrite,
    schema::{self, ATTRIBUTE_COUNT, CCCD_INDICATE, CCCD_NOTIFY, VALUE_BYTES, cccd_bits},
    sender::{Transport, send_indication, send_notification, send_response},
    store::ImageStore,
    table::{AttributeDef, AttributeTable},
    upgrade::{Confirmation, Delivery, StatusReport, UpgradeSession},
};

/// Largest value in one Read By Type pair; the pair length is a single byte.
const MAX_PAIR_VALUE: usize = 253;

/// Follow-up the caller has to carry out after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Restart into the staged image once `after_ms` have passed.
    Activate { after_ms: u64 },
}

pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    mtu: u16,
    long_write: LongWrite,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            mtu: MIN_MTU,
            long_write: LongWrite::new(),
        }
    }
}

/// A failed request before it becomes an Error Response.
#[derive(Debug, Clone, Copy)]
struct Reject {
    kind: AttError,
    handle: Option<Handle>,
}

impl Reject {
    fn at(handle: Handle, kind: AttError) -> Self {
        Self {
            kind,
            handle: Some(handle),
        }
    }
}

impl From<AttError> for Reject {
    fn from(kind: AttError) -> Self {
        Self { kind, handle: None }
    }
}

pub struct GattServer<S, const N: usize = ATTRIBUTE_COUNT, const B: usize = VALUE_BYTES> {
    pub(crate) config: ServerConfig,
    pub(crate) table: AttributeTable<N, B>,
    pub(crate) connections: Vec<Connection, CONNECTIONS_MAX>,
    upgrade: UpgradeSession<S>,
    scratch: [u8; MAX_MTU as usize],
}

impl<S: ImageStore> GattServer<S> {
    /// Server over the battery and upgrade services laid out at `config.handles`.
    pub fn with_config(config: ServerConfig, store: S) -> Result<Self, SchemaError> {
        Self::new(config, &schema::attributes(&config.handles), store)
    }
}

impl<S: ImageStore, const N: usize, const B: usize> GattServer<S, N, B> {
    /// Builds the table from `schema`.
    ///
    /// Writes to `config.handles.control_point` and `config.handles.data` are
    /// routed to the upgrade session.
    pub fn new(config: ServerConfig, schema: &[AttributeDef], store: S) -> Result<Self, SchemaError> {
        Ok(Self {
            config,
            table: AttributeTable::from_schema(schema)?,
            connections: Vec::new(),
            upgrade: UpgradeSession::new(store),
            scratch: [0; MAX_MTU as usize],
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn table(&self) -> &AttributeTable<N, B> {
        &self.table
    }

    pub fn upgrade(&self) -> &UpgradeSession<S> {
        &self.upgrade
    }

    /// Negotiated transport unit of `conn`.
    pub fn mtu(&self, conn: ConnectionId) -> Option<u16> {
        self.position(conn).map(|ix| self.connections[ix].mtu)
    }

    pub fn long_write(&self, conn: ConnectionId) -> Option<&LongWrite> {
        self.position(conn).map(|ix| &self.connections[ix].long_write)
    }

    fn position(&self, conn: ConnectionId) -> Option<usize> {
        self.connections.iter().position(|c| c.id == conn)
    }

    /// Starts a fresh context for `conn` at the default transport unit.
    pub fn connect(&mut self, conn: ConnectionId) -> Result<(), AttError> {
        self.connections.retain(|c| c.id != conn);
        if self.connections.push(Connection::new(conn)).is_err() {
            warn!("no room for conn {} ({} max)", conn, CONNECTIONS_MAX);
            return Err(AttError::InsufficientResource);
        }
        info!("conn {} connected", conn);
        Ok(())
    }

    /// Drops the context of `conn`, its queued fragments and any upgrade it owns.
    ///
    /// Subscriptions are cleared once the last peer is gone.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(ix) = self.position(conn) {
            let mut gone = self.connections.swap_remove(ix);
            gone.long_write.discard();
        }
        self.upgrade.disconnect(conn);
        if self.connections.is_empty() {
            let handles = self.config.handles;
            for cccd in [handles.battery_level_cccd, handles.control_point_cccd] {
                if self.table.find(cccd).is_some() && self.table.set(cccd, &[0, 0]).is_err() {
                    warn!("cccd {:#06x} not cleared", cccd);
                }
            }
        }
        info!("conn {} disconnected", conn);
    }

    fn context(&mut self, conn: ConnectionId) -> Result<usize, AttError> {
        match self.position(conn) {
            Some(ix) => Ok(ix),
            None => {
                self.connect(conn)?;
                Ok(self.connections.len() - 1)
            }
        }
    }

    /// Decodes and handles one PDU received from `conn`.
    pub fn process_pdu<T: Transport>(
        &mut self,
        conn: ConnectionId,
        pdu: &[u8],
        transport: &mut T,
    ) -> Option<Action> {
        match Request::decode(pdu) {
            Ok(request) => self.process(conn, request, transport),
            Err(e) => {
                warn!("conn {}: dropping pdu: {}", conn, e);
                if let Some(&opcode) = pdu.first()
                    && opcode & COMMAND_FLAG == 0
                {
                    let handle = match pdu.get(1..3) {
                        Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
                        _ => 0,
                    };
                    let err = RequestError::new(opcode, handle, AttError::InvalidPdu);
                    send_response(transport, conn, &Response::Error(err));
                }
                None
            }
        }
    }

    /// Handles one decoded request from `conn`.
    pub fn process<T: Transport>(
        &mut self,
        conn: ConnectionId,
        request: Request<'_>,
        transport: &mut T,
    ) -> Option<Action> {
        let ix = match self.context(conn) {
            Ok(ix) => ix,
            Err(kind) => {
                finish(transport, conn, &request, Err(Reject::from(kind)));
                return None;
            }
        };
        let mtu = self.connections[ix].mtu;

        let result = match request {
            Request::Read {
                handle,
                offset,
                blob,
            } => self.read(handle, offset, blob, mtu),
            Request::ReadByType {
                start,
                end,
                attribute_type,
            } => self.read_by_type(start, end, &attribute_type, mtu),
            Request::ReadMultiple { handles, variable } => {
                self.read_multiple(handles, variable, mtu)
            }
            Request::Write { handle, value, .. } => self
                .write(conn, handle, value, transport)
                .map(|()| Response::Write),
            Request::PrepareWrite {
                handle,
                offset,
                value,
            } => self.prepare_write(ix, handle, offset, value),
            Request::ExecuteWrite { commit } => self.execute_write(conn, ix, commit, transport),
            Request::ExchangeMtu { mtu } => Ok(self.exchange_mtu(ix, mtu)),
            Request::Confirmation => return self.confirm(conn),
            Request::Unsupported { opcode } => Err(Reject::from(unsupported(opcode))),
        };
        finish(transport, conn, &request, result);
        None
    }

    fn read(
        &self,
        handle: Handle,
        offset: u16,
        blob: bool,
        mtu: u16,
    ) -> Result<Response<'_>, Reject> {
        let value = self.table.value(handle).ok_or(AttError::InvalidHandle)?;
        let offset = usize::from(offset);
        if offset >= value.len() {
            return Err(AttError::InvalidOffset.into());
        }
        let to_send = (value.len() - offset).min(usize::from(mtu) - 1);
        Ok(Response::Read {
            value: &value[offset..offset + to_send],
            blob,
        })
    }

    fn read_by_type(
        &mut self,
        start: Handle,
        end: Handle,
        attribute_type: &AttributeType,
        mtu: u16,
    ) -> Result<Response<'_>, Reject> {
        if start == 0 || start > end {
            return Err(Reject::at(start, AttError::InvalidHandle));
        }
        // opcode and pair length byte
        let capacity = usize::from(mtu) - 2;
        let mut pair_len = 0;
        let mut written = 0;
        let mut from = start;

        while let Some(handle) = self.table.next_of_type(from, end, attribute_type) {
            let Some(value) = self.table.value(handle) else {
                break;
            };
            if pair_len == 0 {
                pair_len = 2 + value.len().min(capacity - 2).min(MAX_PAIR_VALUE);
            } else if 2 + value.len() != pair_len {
                break;
            }
            if capacity - written < pair_len {
                break;
            }
            let pair = &mut self.scratch[written..written + pair_len];
            pair[..2].copy_from_slice(&handle.to_le_bytes());
            pair[2..].copy_from_slice(&value[..pair_len - 2]);
            written += pair_len;

            match handle.checked_add(1) {
                Some(next) if next <= end => from = next,
                _ => break,
            }
        }

        if written == 0 {
            return Err(Reject::at(start, AttError::InvalidHandle));
        }
        Ok(Response::ReadByType {
            pair_len: pair_len as u8,
            data: &self.scratch[..written],
        })
    }

    fn read_multiple(
        &mut self,
        handles: HandleList<'_>,
        variable: bool,
        mtu: u16,
    ) -> Result<Response<'_>, Reject> {
        let capacity = usize::from(mtu) - 1;
        let mut written = 0;

        for handle in handles.iter() {
            let value = self
                .table
                .value(handle)
                .ok_or(Reject::at(handle, AttError::UnlikelyError))?;
            let room = capacity - written;
            let out = &mut self.scratch[written..capacity];
            if variable {
                if room < 2 {
                    break;
                }
                let len = value.len().min(room - 2);
                out[..2].copy_from_slice(&(value.len() as u16).to_le_bytes());
                out[2..2 + len].copy_from_slice(&value[..len]);
                written += 2 + len;
            } else {
                if room == 0 {
                    break;
                }
                let len = value.len().min(room);
                out[..len].copy_from_slice(&value[..len]);
                written += len;
            }
        }

        Ok(Response::ReadMultiple {
            data: &self.scratch[..written],
            variable,
        })
    }

    /// Single-fragment write path, shared by Write and Execute Write.
    fn write<T: Transport>(
        &mut self,
        conn: ConnectionId,
        handle: Handle,
        value: &[u8],
        transport: &mut T,
    ) -> Result<(), Reject> {
        let handles = self.config.handles;
        if handle == handles.control_point {
            return self.control_point(conn, value, transport);
        }
        if handle == handles.data {
            let attr = self.table.find(handle).ok_or(AttError::InvalidHandle)?;
            if value.len() > attr.max_len() {
                return Err(AttError::InvalidLength.into());
            }
            self.upgrade.data(conn, value).map_err(AttError::from)?;
            return Ok(());
        }

        self.table.set(handle, value)?;
        if handles.is_cccd(handle) {
            let bits = cccd_bits(Some(value));
            info!(
                "conn {}: cccd {:#06x} notify={} indicate={}",
                conn,
                handle,
                bits & CCCD_NOTIFY != 0,
                bits & CCCD_INDICATE != 0
            );
        }
        Ok(())
    }

    fn control_point<T: Transport>(
        &mut self,
        conn: ConnectionId,
        value: &[u8],
        transport: &mut T,
    ) -> Result<(), Reject> {
        let outcome = self.upgrade.command(conn, value);
        if let Some(report) = outcome.report {
            self.report_status(conn, report, transport);
        }
        outcome.result.map_err(AttError::from)?;
        Ok(())
    }

    /// Stores the status in the control point and sends it if the peer subscribed.
    fn report_status<T: Transport>(
        &mut self,
        conn: ConnectionId,
        report: StatusReport,
        transport: &mut T,
    ) {
        let handles = self.config.handles;
        let status = [u8::from(report.status)];
        if let Err(e) = self.table.set(handles.control_point, &status) {
            warn!("cannot store upgrade status: {}", e);
        }

        let bits = cccd_bits(self.table.value(handles.control_point_cccd));
        match report.delivery {
            Delivery::Notify if bits & CCCD_NOTIFY != 0 => {
                send_notification(transport, conn, handles.control_point, &status);
            }
            Delivery::Indicate if bits & CCCD_INDICATE != 0 => {
                send_indication(transport, conn, handles.control_point, &status);
            }
            delivery => debug!(
                "conn {}: status {:?} held back, {:?} not enabled",
                conn, report.status, delivery
            ),
        }
    }

    fn prepare_write(
        &mut self,
        ix: usize,
        handle: Handle,
        offset: u16,
        value: &[u8],
    ) -> Result<Response<'_>, Reject> {
        let ctx = &mut self.connections[ix];
        let echo = ctx
            .long_write
            .append(handle, offset, value, usize::from(ctx.mtu))?;
        Ok(Response::PrepareWrite {
            handle,
            offset,
            value: echo,
        })
    }

    fn execute_write<T: Transport>(
        &mut self,
        conn: ConnectionId,
        ix: usize,
        commit: bool,
        transport: &mut T,
    ) -> Result<Response<'static>, Reject> {
        let long_write = &mut self.connections[ix].long_write;
        if !commit {
            long_write.discard();
            return Ok(Response::ExecuteWrite);
        }

        let mut staged = [0u8; MAX_MTU as usize];
        let Some((handle, bytes)) = long_write.take() else {
            warn!("conn {}: execute write with nothing queued", conn);
            return Err(AttError::OperationError.into());
        };
        let len = bytes.len();
        staged[..len].copy_from_slice(bytes);

        self.write(conn, handle, &staged[..len], transport)
            .map_err(|r| Reject::at(handle, r.kind))?;
        Ok(Response::ExecuteWrite)
    }

    fn exchange_mtu(&mut self, ix: usize, requested: u16) -> Response<'static> {
        let local = self.config.clamped_mtu();
        let ctx = &mut self.connections[ix];
        ctx.mtu = local.min(requested.max(MIN_MTU));
        info!(
            "conn {}: mtu {} (peer asked {}, local {})",
            ctx.id, ctx.mtu, requested, local
        );
        Response::ExchangeMtu { mtu: local }
    }

    fn confirm(&mut self, conn: ConnectionId) -> Option<Action> {
        match self.upgrade.confirm(conn) {
            Confirmation::Activate => {
                let after_ms = self.config.activation_grace_ms;
                info!("conn {}: image confirmed, activating in {} ms", conn, after_ms);
                Some(Action::Activate { after_ms })
            }
            Confirmation::Stopped => {
                info!("conn {}: upgrade stopped on confirmation", conn);
                None
            }
            Confirmation::Ignored => None,
        }
    }
}

fn unsupported(opcode: u8) -> AttError {
    if Opcode::try_from(opcode).is_ok() {
        AttError::RequestNotSupported
    } else {
        AttError::OperationError
    }
}

fn finish<T: Transport>(
    transport: &mut T,
    conn: ConnectionId,
    request: &Request<'_>,
    result: Result<Response<'_>, Reject>,
) {
    match result {
        Ok(response) => {
            if request.expects_response() {
                send_response(transport, conn, &response);
            }
        }
        Err(reject) => {
            let handle = reject.handle.unwrap_or_else(|| request.handle());
            let err = RequestError::new(request.opcode(), handle, reject.kind);
            warn!("conn {}: {}", conn, err);
            if request.expects_response() {
                send_response(transport, conn, &Response::Error(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ServiceHandles,
        sender::testing::{Recorder, Sent},
        store::RamImageStore,
        upgrade::UpgradeState,
    };

    type Server = GattServer<RamImageStore<2048>>;
    type Custom = GattServer<RamImageStore<16>, 2, 64>;

    const CONN: ConnectionId = 1;
    const H: ServiceHandles = ServiceHandles::DEFAULT;
    const LEVEL: AttributeType = AttributeType::Uuid16(0x2A19);

    fn server() -> Server {
        let mut s = Server::with_config(ServerConfig::default(), RamImageStore::new()).unwrap();
        s.connect(CONN).unwrap();
        s
    }

    /// One plain attribute at 0x10 next to the given second one.
    fn custom(max_len: usize, extra: AttributeDef) -> Custom {
        let defs = [
            AttributeDef {
                handle: 0x10,
                attribute_type: LEVEL,
                max_len,
                initial: &[],
            },
            extra,
        ];
        let mut s = Custom::new(ServerConfig::default(), &defs, RamImageStore::new()).unwrap();
        s.connect(CONN).unwrap();
        s
    }

    fn spare() -> AttributeDef {
        AttributeDef {
            handle: 0x20,
            attribute_type: AttributeType::Uuid16(0x2A00),
            max_len: 8,
            initial: b"spare",
        }
    }

    fn write_req(handle: Handle, value: &[u8]) -> Vec<u8, 64> {
        let mut pdu = Vec::new();
        pdu.push(0x12).unwrap();
        pdu.extend_from_slice(&handle.to_le_bytes()).unwrap();
        pdu.extend_from_slice(value).unwrap();
        pdu
    }

    fn prepare_req(handle: Handle, offset: u16, value: &[u8]) -> Vec<u8, 64> {
        let mut pdu = Vec::new();
        pdu.push(0x16).unwrap();
        pdu.extend_from_slice(&handle.to_le_bytes()).unwrap();
        pdu.extend_from_slice(&offset.to_le_bytes()).unwrap();
        pdu.extend_from_slice(value).unwrap();
        pdu
    }

    fn error_rsp(opcode: u8, handle: Handle, kind: AttError) -> std::vec::Vec<u8> {
        let [lo, hi] = handle.to_le_bytes();
        vec![0x01, opcode, lo, hi, kind.code()]
    }

    fn enable_status(s: &mut Server, rec: &mut Recorder) {
        s.process_pdu(CONN, &write_req(H.control_point_cccd, &[0x03, 0x00]), rec);
        rec.take();
    }

    #[test]
    fn write_read_scenario() {
        let mut s = custom(4, spare());
        let mut rec = Recorder::default();

        s.process_pdu(CONN, &write_req(0x10, &[1, 2]), &mut rec);
        s.process_pdu(CONN, &[0x0A, 0x10, 0x00], &mut rec);
        s.process_pdu(CONN, &write_req(0x10, &[1, 2, 3, 4, 5]), &mut rec);
        s.process_pdu(CONN, &[0x0A, 0x10, 0x00], &mut rec);

        assert_eq!(
            rec.responses(),
            vec![
                vec![0x13],
                vec![0x0B, 1, 2],
                error_rsp(0x12, 0x10, AttError::InvalidLength),
                vec![0x0B, 1, 2],
            ]
        );
    }

    #[test]
    fn read_offsets_and_truncation() {
        let mut s = custom(40, spare());
        let mut rec = Recorder::default();
        let value: std::vec::Vec<u8> = (0..40).collect();
        s.process_pdu(CONN, &write_req(0x10, &value), &mut rec);
        rec.take();

        s.process_pdu(CONN, &[0x0C, 0x10, 0x00, 37, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x0C, 0x10, 0x00, 40, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x0A, 0x10, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x0A, 0x11, 0x00], &mut rec);

        let rsp = rec.responses();
        assert_eq!(rsp[0], vec![0x0D, 37, 38, 39]);
        assert_eq!(rsp[1], error_rsp(0x0C, 0x10, AttError::InvalidOffset));
        // default transport unit leaves 22 bytes for the value
        assert_eq!(rsp[2].len(), 23);
        assert_eq!(&rsp[2][1..], &value[..22]);
        assert_eq!(rsp[3], error_rsp(0x0A, 0x11, AttError::InvalidHandle));
    }

    #[test]
    fn empty_value_has_no_valid_offset() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x0A, 0x0C, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x0C, 0x0C, 0x00, 0x00, 0x00], &mut rec);
        assert_eq!(
            rec.responses(),
            vec![
                vec![0x01, 0x0A, 0x0C, 0x00, 0x07],
                error_rsp(0x0C, 0x0C, AttError::InvalidOffset),
            ]
        );
    }

    #[test]
    fn read_by_type_packs_uniform_pairs() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x08, 0x01, 0x00, 0xff, 0xff, 0x02, 0x29], &mut rec);
        s.process_pdu(CONN, &[0x08, 0x0A, 0x00, 0xff, 0xff, 0x19, 0x2A], &mut rec);
        s.process_pdu(CONN, &[0x08, 0x05, 0x00, 0x01, 0x00, 0x19, 0x2A], &mut rec);
        assert_eq!(
            rec.responses(),
            vec![
                vec![0x09, 4, 0x09, 0x00, 0, 0, 0x0D, 0x00, 0, 0],
                error_rsp(0x08, 0x0A, AttError::InvalidHandle),
                error_rsp(0x08, 0x05, AttError::InvalidHandle),
            ]
        );
    }

    #[test]
    fn read_by_type_stops_at_different_length() {
        let mut s = custom(
            4,
            AttributeDef {
                attribute_type: LEVEL,
                ..spare()
            },
        );
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &write_req(0x10, &[7, 7]), &mut rec);
        rec.take();
        s.process_pdu(CONN, &[0x08, 0x01, 0x00, 0xff, 0xff, 0x19, 0x2A], &mut rec);
        assert_eq!(rec.responses(), vec![vec![0x09, 4, 0x10, 0x00, 7, 7]]);
    }

    #[test]
    fn read_multiple_plain_and_variable() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x0E, 0x08, 0x00, 0x09, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x20, 0x08, 0x00, 0x0C, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x0E, 0x08, 0x00, 0x30, 0x00], &mut rec);
        assert_eq!(
            rec.responses(),
            vec![
                vec![0x0F, 100, 0, 0],
                vec![0x21, 1, 0, 100, 0, 0],
                error_rsp(0x0E, 0x30, AttError::UnlikelyError),
            ]
        );
    }

    /// Three 8-byte levels at 0x10..=0x12 and a 30-byte name at 0x13.
    fn crowded() -> GattServer<RamImageStore<16>, 4, 64> {
        let level = |handle, initial: &'static [u8]| AttributeDef {
            handle,
            attribute_type: LEVEL,
            max_len: 8,
            initial,
        };
        let defs = [
            level(0x10, &[1; 8]),
            level(0x11, &[2; 8]),
            level(0x12, &[3; 8]),
            AttributeDef {
                handle: 0x13,
                attribute_type: AttributeType::Uuid16(0x2A00),
                max_len: 30,
                initial: &[4; 30],
            },
        ];
        let mut s = GattServer::new(ServerConfig::default(), &defs, RamImageStore::new()).unwrap();
        s.connect(CONN).unwrap();
        s
    }

    #[test]
    fn read_by_type_packs_what_fits() {
        let mut s = crowded();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x08, 0x01, 0x00, 0xff, 0xff, 0x19, 0x2A], &mut rec);
        s.process_pdu(CONN, &[0x08, 0x01, 0x00, 0xff, 0xff, 0x00, 0x2A], &mut rec);
        let rsp = rec.responses();

        // two 10-byte pairs fit in 21 bytes, the third does not
        let mut levels: std::vec::Vec<u8> = vec![0x09, 10, 0x10, 0x00];
        levels.extend([1; 8]);
        levels.extend([0x11, 0x00]);
        levels.extend([2; 8]);
        assert_eq!(rsp[0], levels);

        // a long value is cut so that one pair fills the unit
        let mut name: std::vec::Vec<u8> = vec![0x09, 21, 0x13, 0x00];
        name.extend([4; 19]);
        assert_eq!(rsp[1], name);
        assert_eq!(rsp[1].len(), 23);
    }

    #[test]
    fn read_multiple_stops_when_full() {
        let mut s = crowded();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x0E, 0x10, 0x00, 0x13, 0x00, 0x11, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x20, 0x13, 0x00, 0x10, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x20, 0x10, 0x00, 0x13, 0x00], &mut rec);
        let rsp = rec.responses();

        let mut plain: std::vec::Vec<u8> = vec![0x0F];
        plain.extend([1; 8]);
        plain.extend([4; 14]);
        assert_eq!(rsp[0], plain);

        // the length field carries the whole value even when it is cut
        let mut first_full: std::vec::Vec<u8> = vec![0x21, 30, 0x00];
        first_full.extend([4; 20]);
        assert_eq!(rsp[1], first_full);

        let mut second_cut: std::vec::Vec<u8> = vec![0x21, 8, 0x00];
        second_cut.extend([1; 8]);
        second_cut.extend([30, 0x00]);
        second_cut.extend([4; 10]);
        assert_eq!(rsp[2], second_cut);
        assert!(rsp.iter().all(|pdu| pdu.len() <= 23));
    }

    #[test]
    fn long_write_is_bounded_by_max_mtu() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x02, 0xff, 0xff], &mut rec);
        assert_eq!(s.mtu(CONN), Some(MAX_MTU));

        let fragment = |offset: u16, len: usize| {
            let mut pdu = vec![0x16];
            pdu.extend(H.data.to_le_bytes());
            pdu.extend(offset.to_le_bytes());
            pdu.extend(core::iter::repeat_n(0x5A, len));
            pdu
        };
        s.process_pdu(CONN, &fragment(0, 256), &mut rec);
        s.process_pdu(CONN, &fragment(256, 256), &mut rec);
        s.process_pdu(CONN, &fragment(512, 1), &mut rec);

        let rsp = rec.responses();
        assert_eq!(rsp[1].len(), 5 + 256);
        assert_eq!(rsp[2].len(), 5 + 256);
        assert_eq!(rsp[3], error_rsp(0x16, H.data, AttError::OperationError));
        assert_eq!(s.long_write(CONN).unwrap().written(), MAX_MTU as usize);
    }

    #[test]
    fn long_write_equals_single_write() {
        let mut s = custom(16, spare());
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &prepare_req(0x10, 0, &[1, 2, 3]), &mut rec);
        s.process_pdu(CONN, &prepare_req(0x10, 3, &[4, 5]), &mut rec);
        s.process_pdu(CONN, &[0x18, 0x01], &mut rec);
        s.process_pdu(CONN, &[0x0A, 0x10, 0x00], &mut rec);
        assert_eq!(
            rec.responses(),
            vec![
                vec![0x17, 0x10, 0x00, 0x00, 0x00, 1, 2, 3],
                vec![0x17, 0x10, 0x00, 0x03, 0x00, 4, 5],
                vec![0x19],
                vec![0x0B, 1, 2, 3, 4, 5],
            ]
        );
        assert!(!s.long_write(CONN).unwrap().is_open());
    }

    #[test]
    fn out_of_order_fragment_keeps_queue() {
        let mut s = custom(16, spare());
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &prepare_req(0x10, 0, &[1, 2, 3]), &mut rec);
        s.process_pdu(CONN, &prepare_req(0x10, 5, &[9]), &mut rec);
        assert_eq!(
            rec.responses()[1],
            error_rsp(0x16, 0x10, AttError::OperationError)
        );
        assert_eq!(s.long_write(CONN).unwrap().written(), 3);

        s.process_pdu(CONN, &prepare_req(0x10, 3, &[4]), &mut rec);
        s.process_pdu(CONN, &[0x18, 0x01], &mut rec);
        assert_eq!(s.table().value(0x10), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn cancel_discards_and_restarts_at_zero() {
        let mut s = custom(16, spare());
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &prepare_req(0x10, 0, &[1, 2, 3]), &mut rec);
        s.process_pdu(CONN, &[0x18, 0x00], &mut rec);
        s.process_pdu(CONN, &prepare_req(0x10, 0, &[8]), &mut rec);
        s.process_pdu(CONN, &[0x18, 0x01], &mut rec);
        let rsp = rec.responses();
        assert_eq!(rsp[1], vec![0x19]);
        assert_eq!(rsp[2], vec![0x17, 0x10, 0x00, 0x00, 0x00, 8]);
        assert_eq!(s.table().value(0x10), Some(&[8u8][..]));
    }

    #[test]
    fn execute_failures_close_the_queue() {
        let mut s = custom(4, spare());
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x18, 0x01], &mut rec);
        s.process_pdu(CONN, &prepare_req(0x10, 0, &[1, 2, 3]), &mut rec);
        s.process_pdu(CONN, &prepare_req(0x10, 3, &[4, 5, 6]), &mut rec);
        s.process_pdu(CONN, &[0x18, 0x01], &mut rec);
        let rsp = rec.responses();
        assert_eq!(rsp[0], error_rsp(0x18, 0x0000, AttError::OperationError));
        assert_eq!(rsp[3], error_rsp(0x18, 0x10, AttError::InvalidLength));
        assert!(!s.long_write(CONN).unwrap().is_open());
        assert_eq!(s.table().value(0x10), Some(&[][..]));
    }

    #[test]
    fn commands_never_get_responses() {
        let mut s = custom(4, spare());
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x52, 0x10, 0x00, 1, 2, 3, 4, 5], &mut rec);
        s.process_pdu(CONN, &[0x52, 0x10, 0x00, 1], &mut rec);
        s.process_pdu(CONN, &[0x7F, 0x00], &mut rec);
        assert!(rec.take().is_empty());
        assert_eq!(s.table().value(0x10), Some(&[1u8][..]));
    }

    #[test]
    fn unsupported_and_malformed_requests() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x04, 0x01, 0x00, 0xff, 0xff], &mut rec);
        s.process_pdu(CONN, &[0x0B, 0x00], &mut rec);
        s.process_pdu(CONN, &[0x16, 0x10], &mut rec);
        s.process_pdu(CONN, &[0x0A, 0x08, 0x00], &mut rec);
        assert_eq!(
            rec.responses(),
            vec![
                error_rsp(0x04, 0, AttError::OperationError),
                error_rsp(0x0B, 0, AttError::RequestNotSupported),
                error_rsp(0x16, 0, AttError::InvalidPdu),
                vec![0x0B, 100],
            ]
        );
    }

    #[test]
    fn mtu_is_the_smaller_of_both() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x02, 0x00, 0x01], &mut rec);
        assert_eq!(s.mtu(CONN), Some(256));
        s.process_pdu(CONN, &[0x02, 0x00, 0x04], &mut rec);
        assert_eq!(s.mtu(CONN), Some(512));
        s.process_pdu(CONN, &[0x02, 10, 0x00], &mut rec);
        assert_eq!(s.mtu(CONN), Some(23));
        assert_eq!(rec.responses()[0], vec![0x03, 0x00, 0x02]);
    }

    #[test]
    fn upgrade_through_the_control_point() {
        let mut s = server();
        let mut rec = Recorder::default();
        enable_status(&mut s, &mut rec);
        let image = [0x5Au8; 8];

        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x02, 8, 0, 0, 0]), &mut rec);
        s.process_pdu(CONN, &write_req(H.data, &image), &mut rec);
        let crc = crc32fast::hash(&image).to_le_bytes();
        let verify = [0x03, crc[0], crc[1], crc[2], crc[3]];
        s.process_pdu(CONN, &write_req(H.control_point, &verify), &mut rec);

        assert_eq!(
            rec.take(),
            vec![
                Sent::Notification(CONN, H.control_point, vec![0x00]),
                Sent::Response(CONN, vec![0x13]),
                Sent::Notification(CONN, H.control_point, vec![0x00]),
                Sent::Response(CONN, vec![0x13]),
                Sent::Response(CONN, vec![0x13]),
                Sent::Indication(CONN, H.control_point, vec![0x00]),
                Sent::Response(CONN, vec![0x13]),
            ]
        );
        assert_eq!(s.table().value(H.control_point), Some(&[0x00][..]));
        assert_eq!(s.upgrade().state(), UpgradeState::Verified);

        let action = s.process_pdu(CONN, &[0x1E], &mut rec);
        assert_eq!(action, Some(Action::Activate { after_ms: 1000 }));
        assert!(rec.take().is_empty());
    }

    #[test]
    fn checksum_mismatch_is_indicated_and_stopped_on_confirmation() {
        let mut s = server();
        let mut rec = Recorder::default();
        enable_status(&mut s, &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x02, 2, 0, 0, 0]), &mut rec);
        s.process_pdu(CONN, &write_req(H.data, &[1, 2]), &mut rec);
        rec.take();

        s.process_pdu(CONN, &write_req(H.control_point, &[0x03, 1, 2, 3, 4]), &mut rec);
        assert_eq!(
            rec.take(),
            vec![
                Sent::Indication(CONN, H.control_point, vec![0x01]),
                Sent::Response(
                    CONN,
                    error_rsp(0x12, H.control_point, AttError::ChecksumMismatch)
                ),
            ]
        );
        assert_eq!(s.upgrade().state(), UpgradeState::Failed);

        assert_eq!(s.process_pdu(CONN, &[0x1E], &mut rec), None);
        assert_eq!(s.upgrade().state(), UpgradeState::Idle);
    }

    #[test]
    fn status_is_held_back_without_subscription() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        assert_eq!(rec.take(), vec![Sent::Response(CONN, vec![0x13])]);
        assert_eq!(s.table().value(H.control_point), Some(&[0x00][..]));
    }

    #[test]
    fn malformed_verify_leaves_session_alone() {
        let mut s = server();
        let mut rec = Recorder::default();
        enable_status(&mut s, &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x02, 4, 0, 0, 0]), &mut rec);
        rec.take();

        s.process_pdu(CONN, &write_req(H.control_point, &[0x03, 1, 2, 3]), &mut rec);
        assert_eq!(
            rec.take(),
            vec![
                Sent::Notification(CONN, H.control_point, vec![0x02]),
                Sent::Response(
                    CONN,
                    error_rsp(0x12, H.control_point, AttError::InvalidLength)
                ),
            ]
        );
        assert_eq!(s.upgrade().state(), UpgradeState::Transferring);
    }

    #[test]
    fn data_outside_transfer_is_rejected() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &write_req(H.data, &[1, 2, 3]), &mut rec);
        assert_eq!(
            rec.responses(),
            vec![error_rsp(0x12, H.data, AttError::OperationError)]
        );
    }

    #[test]
    fn image_chunk_through_long_write() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &[0x02, 64, 0x00], &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        s.process_pdu(CONN, &write_req(H.control_point, &[0x02, 60, 0, 0, 0]), &mut rec);
        s.process_pdu(CONN, &prepare_req(H.data, 0, &[0xAA; 30]), &mut rec);
        s.process_pdu(CONN, &prepare_req(H.data, 30, &[0xBB; 30]), &mut rec);
        s.process_pdu(CONN, &[0x18, 0x01], &mut rec);
        assert_eq!(rec.responses().last(), Some(&vec![0x19]));
        assert_eq!(s.upgrade().received(), 60);
        assert_eq!(&s.upgrade().store().staged()[28..32], &[0xAA, 0xAA, 0xBB, 0xBB]);
    }

    #[test]
    fn disconnect_cancels_everything() {
        let mut s = server();
        let mut rec = Recorder::default();
        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        s.process_pdu(CONN, &prepare_req(H.battery_level, 0, &[1]), &mut rec);
        assert!(s.long_write(CONN).unwrap().is_open());

        s.disconnect(CONN);
        assert_eq!(s.upgrade().state(), UpgradeState::Idle);
        assert!(s.long_write(CONN).is_none());

        s.connect(CONN).unwrap();
        assert!(!s.long_write(CONN).unwrap().is_open());
        assert_eq!(s.mtu(CONN), Some(MIN_MTU));
    }

    #[test]
    fn subscriptions_end_with_the_link() {
        let mut s = server();
        let mut rec = Recorder::default();
        enable_status(&mut s, &mut rec);
        s.process_pdu(CONN, &write_req(H.battery_level_cccd, &[0x01, 0x00]), &mut rec);
        assert!(s.battery_notifications_enabled());

        s.disconnect(CONN);
        s.connect(CONN).unwrap();
        assert!(!s.battery_notifications_enabled());
        assert_eq!(s.table().value(H.control_point_cccd), Some(&[0u8, 0][..]));

        rec.take();
        s.process_pdu(CONN, &write_req(H.control_point, &[0x01]), &mut rec);
        assert_eq!(rec.take(), vec![Sent::Response(CONN, vec![0x13])]);
    }

    #[test]
    fn connections_are_bounded() {
        let mut s = server();
        let mut rec = Recorder::default();
        assert_eq!(s.connect(CONN + 1), Err(AttError::InsufficientResource));
        s.process_pdu(CONN + 1, &[0x0A, 0x08, 0x00], &mut rec);
        assert_eq!(
            rec.take(),
            vec![Sent::Response(
                CONN + 1,
                error_rsp(0x0A, 0x08, AttError::InsufficientResource)
            )]
        );
    }
}
