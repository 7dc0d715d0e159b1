//! Typed request/response calls over one IPC channel.
//!
//! The pattern every higher-level cross-core API follows: a fixed-size
//! message struct tagged with an event id, sent synchronously through a
//! pre-registered channel. The transport echoes the buffer in place, so
//! the server writes its response over the request bytes and the client
//! decodes the reply from the same buffer. One side of the channel has
//! no handler (pure client); the other implements the service.
//!
//! A proxy allows one in-flight call at a time — callers must not fan
//! out concurrent RPCs on the same [`RpcClient`].

use std::sync::Mutex;

use bytes::{BufMut, BytesMut};
use tandem_chip::result_code::RESULT_BAD_REQUEST;
use tracing::warn;

use crate::channel::{ChannelConfig, IpcChannel};
use crate::error::{AmpError, Result};

/// A fixed-size message travelling both directions on an RPC channel.
pub trait RpcMessage: Sized {
    /// Event id distinguishing this message type on its channel.
    const EVENT_ID: u16;

    /// Append the wire form to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Parse the wire form.
    ///
    /// # Errors
    ///
    /// [`AmpError::RpcDecode`] on length or content mismatch.
    fn decode(buf: &[u8]) -> Result<Self>;
}

/// Client proxy for one RPC channel.
#[derive(Debug)]
pub struct RpcClient {
    chan: IpcChannel,
    in_flight: Mutex<()>,
}

impl RpcClient {
    /// Wrap a channel handle.
    #[must_use]
    pub fn new(chan: IpcChannel) -> Self {
        Self {
            chan,
            in_flight: Mutex::new(()),
        }
    }

    /// Send `msg` and overwrite it with the server's response.
    ///
    /// Returns the server handler's result word.
    ///
    /// # Errors
    ///
    /// Transport/lifecycle errors from the send, or
    /// [`AmpError::RpcDecode`] if the echoed reply does not parse.
    pub fn call<M: RpcMessage>(&self, msg: &mut M) -> Result<u32> {
        let _serialized = self.in_flight.lock().unwrap();

        let mut buf = BytesMut::new();
        buf.put_u16_le(M::EVENT_ID);
        msg.encode(&mut buf);

        let reply = self.chan.send_sync(buf)?;
        if reply.payload.len() < 2 {
            return Err(AmpError::rpc_decode("reply shorter than event id"));
        }
        let event = u16::from_le_bytes([reply.payload[0], reply.payload[1]]);
        if event != M::EVENT_ID {
            return Err(AmpError::rpc_decode(format!(
                "event id mismatch: sent {:#06x}, got {event:#06x}",
                M::EVENT_ID
            )));
        }
        *msg = M::decode(&reply.payload[2..])?;
        Ok(reply.result)
    }
}

/// Build the server-side channel registration for a typed service.
///
/// The returned config decodes each request as `M`, runs `serve`, and
/// encodes the mutated message back into the echoed buffer. Decode
/// failures ACK with `RESULT_BAD_REQUEST` and leave the buffer alone.
pub fn rpc_server_channel<M>(
    name: impl Into<String>,
    serve: impl Fn(&mut M) -> u32 + Send + Sync + 'static,
) -> ChannelConfig
where
    M: RpcMessage + Send + 'static,
{
    let name = name.into();
    let log_name = name.clone();
    ChannelConfig::new(name).on_receive(move |payload, _req| {
        if payload.len() < 2 {
            warn!("rpc '{log_name}': request shorter than event id");
            return RESULT_BAD_REQUEST;
        }
        let event = u16::from_le_bytes([payload[0], payload[1]]);
        if event != M::EVENT_ID {
            warn!("rpc '{log_name}': unexpected event id {event:#06x}");
            return RESULT_BAD_REQUEST;
        }
        let mut msg = match M::decode(&payload[2..]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("rpc '{log_name}': {e}");
                return RESULT_BAD_REQUEST;
            }
        };
        let result = serve(&mut msg);
        payload.truncate(2);
        msg.encode(payload);
        result
    })
}

// ── Device-id service ────────────────────────────────────────────────────────

/// Channel name of the built-in device identification service.
pub const DEVICE_ID_CHANNEL: &str = "sysinfo";

/// Chip identification: served by the system core, queried by the
/// application core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceId {
    /// Chip family word.
    pub chip_id: u32,
    /// Silicon revision.
    pub revision: u32,
    /// Per-die unique id (fuse bank on silicon).
    pub unique_id: u64,
}

impl RpcMessage for DeviceId {
    const EVENT_ID: u16 = 0x0001;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.chip_id);
        buf.put_u32_le(self.revision);
        buf.put_u64_le(self.unique_id);
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != 16 {
            return Err(AmpError::rpc_decode(format!(
                "device id payload is {} bytes, want 16",
                buf.len()
            )));
        }
        Ok(Self {
            chip_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            revision: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            unique_id: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Server-side registration for [`DEVICE_ID_CHANNEL`], reporting the
/// chip constants plus the die's `unique_id`.
#[must_use]
pub fn device_id_server(unique_id: u64) -> ChannelConfig {
    rpc_server_channel(DEVICE_ID_CHANNEL, move |msg: &mut DeviceId| {
        msg.chip_id = tandem_chip::CHIP_ID;
        msg.revision = tandem_chip::CHIP_REVISION;
        msg.unique_id = unique_id;
        0
    })
}

/// Query the peer's device identification.
///
/// # Errors
///
/// Propagates transport and decode errors.
pub fn query_device_id(client: &RpcClient) -> Result<DeviceId> {
    let mut msg = DeviceId::default();
    client.call(&mut msg)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_codec_round_trip() {
        let msg = DeviceId {
            chip_id: tandem_chip::CHIP_ID,
            revision: 0xA2,
            unique_id: 0x0102_0304_0506_0708,
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(DeviceId::decode(&buf).unwrap(), msg);
    }

    #[test]
    fn short_payload_rejected() {
        assert!(matches!(
            DeviceId::decode(&[0u8; 3]),
            Err(AmpError::RpcDecode { .. })
        ));
    }
}
