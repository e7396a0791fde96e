//! Outbound path: responses, notifications and indications.

use core::fmt::Debug;

use log::warn;

use crate::{
    ConnectionId, Handle,
    att::{Response, encode_handle_value},
    config::MAX_MTU,
    error::EncodeError,
};

/// Delivery of server output to the peer. Implemented by the BLE stack glue.
pub trait Transport {
    type Error: Debug;

    fn respond(&mut self, conn: ConnectionId, response: &Response<'_>) -> Result<(), Self::Error>;

    fn notify(&mut self, conn: ConnectionId, handle: Handle, value: &[u8])
    -> Result<(), Self::Error>;

    fn indicate(
        &mut self,
        conn: ConnectionId,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), Self::Error>;
}

/// Sends a notification; failures are logged and reported as `false`.
pub fn send_notification<T: Transport>(
    transport: &mut T,
    conn: ConnectionId,
    handle: Handle,
    value: &[u8],
) -> bool {
    match transport.notify(conn, handle, value) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "notification failed conn={} handle={:#06x} len={}: {:?}",
                conn,
                handle,
                value.len(),
                e
            );
            false
        }
    }
}

/// Sends an indication; failures are logged and reported as `false`.
pub fn send_indication<T: Transport>(
    transport: &mut T,
    conn: ConnectionId,
    handle: Handle,
    value: &[u8],
) -> bool {
    match transport.indicate(conn, handle, value) {
        Ok(()) => true,
        Err(e) => {
            warn!(
                "indication failed conn={} handle={:#06x} len={}: {:?}",
                conn,
                handle,
                value.len(),
                e
            );
            false
        }
    }
}

pub fn send_response<T: Transport>(
    transport: &mut T,
    conn: ConnectionId,
    response: &Response<'_>,
) -> bool {
    match transport.respond(conn, response) {
        Ok(()) => true,
        Err(e) => {
            warn!("response failed conn={}: {:?}", conn, e);
            false
        }
    }
}

#[derive(Debug)]
pub enum PduError<E> {
    Encode(EncodeError),
    Link(E),
}

/// Transport for links that carry raw ATT PDUs.
///
/// Every output is encoded into a scratch buffer of the largest MTU and handed
/// to `send` together with the connection it belongs to.
pub struct PduTransport<F> {
    send: F,
    scratch: [u8; MAX_MTU as usize],
}

impl<F, E> PduTransport<F>
where
    F: FnMut(ConnectionId, &[u8]) -> Result<(), E>,
{
    pub fn new(send: F) -> Self {
        Self {
            send,
            scratch: [0; MAX_MTU as usize],
        }
    }

    fn handle_value(
        &mut self,
        conn: ConnectionId,
        handle: Handle,
        value: &[u8],
        indicate: bool,
    ) -> Result<(), PduError<E>> {
        let len = encode_handle_value(handle, value, indicate, &mut self.scratch)
            .map_err(PduError::Encode)?;
        (self.send)(conn, &self.scratch[..len]).map_err(PduError::Link)
    }
}

impl<F, E> Transport for PduTransport<F>
where
    F: FnMut(ConnectionId, &[u8]) -> Result<(), E>,
    E: Debug,
{
    type Error = PduError<E>;

    fn respond(&mut self, conn: ConnectionId, response: &Response<'_>) -> Result<(), Self::Error> {
        let len = response
            .encode(&mut self.scratch)
            .map_err(PduError::Encode)?;
        (self.send)(conn, &self.scratch[..len]).map_err(PduError::Link)
    }

    fn notify(
        &mut self,
        conn: ConnectionId,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        self.handle_value(conn, handle, value, false)
    }

    fn indicate(
        &mut self,
        conn: ConnectionId,
        handle: Handle,
        value: &[u8],
    ) -> Result<(), Self::Error> {
        self.handle_value(conn, handle, value, true)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// What a [`Recorder`] saw, with values copied out.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Sent {
        Response(ConnectionId, Vec<u8>),
        Notification(ConnectionId, Handle, Vec<u8>),
        Indication(ConnectionId, Handle, Vec<u8>),
    }

    /// Transport that records encoded responses and handle-value sends.
    #[derive(Default)]
    pub struct Recorder {
        pub sent: Vec<Sent>,
        pub fail_sends: bool,
    }

    impl Recorder {
        pub fn take(&mut self) -> Vec<Sent> {
            core::mem::take(&mut self.sent)
        }

        pub fn responses(&self) -> Vec<Vec<u8>> {
            self.sent
                .iter()
                .filter_map(|s| match s {
                    Sent::Response(_, pdu) => Some(pdu.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl Transport for Recorder {
        type Error = &'static str;

        fn respond(&mut self, conn: ConnectionId, response: &Response<'_>) -> Result<(), Self::Error> {
            let mut buf = [0u8; MAX_MTU as usize];
            let len = response.encode(&mut buf).map_err(|_| "encode")?;
            self.sent.push(Sent::Response(conn, buf[..len].to_vec()));
            Ok(())
        }

        fn notify(
            &mut self,
            conn: ConnectionId,
            handle: Handle,
            value: &[u8],
        ) -> Result<(), Self::Error> {
            if self.fail_sends {
                return Err("link busy");
            }
            self.sent
                .push(Sent::Notification(conn, handle, value.to_vec()));
            Ok(())
        }

        fn indicate(
            &mut self,
            conn: ConnectionId,
            handle: Handle,
            value: &[u8],
        ) -> Result<(), Self::Error> {
            if self.fail_sends {
                return Err("link busy");
            }
            self.sent.push(Sent::Indication(conn, handle, value.to_vec()));
            Ok(())
        }
    }
}
