//! Length-prefixed wire framing.
//!
//! Every frame is `[u32 total_length][u8 kind][payload]` with the length
//! little-endian and counting the kind byte plus the payload, but not itself.
//! Two payload disciplines exist: `Command` carries a 16-bit dispatch id and
//! an opaque body, `Named` carries a type name and a serialized body.

use serde::{Deserialize, Serialize};
use warren_utils::codec;

use crate::{NetError, NetResult};

/// Hard cap on a single framed message including the 4-byte length prefix.
/// Must be identical on both peers.
pub const PACKAGE_SIZE: usize = 64 * 1024;
/// Size of the length prefix.
pub const LEN_HEADER_SIZE: usize = 4;
/// Largest legal `total_length` value.
pub const MAX_TOTAL_LEN: usize = PACKAGE_SIZE - LEN_HEADER_SIZE;

pub const KIND_COMMAND: u8 = 0x01;
pub const KIND_NAMED: u8 = 0x02;

pub const CMD_NULL: u8 = 0;
pub const PARA_NULL: u8 = 0;

/// Channel-bus control command and its parameters.
pub const CMD_CHANNEL: u8 = 1;
pub const CHANNEL_QUIT: u8 = 2;
pub const CHANNEL_TERMINATE: u8 = 3;

/// Named frames carrying this type name transport their `fd` field as
/// `SCM_RIGHTS` ancillary data instead of payload bytes.
pub const CHANNEL_OPEN_NAME: &str = "hnet.wChannelOpen";

/// Control message handing a file descriptor to a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelOpen {
    pub slot: u32,
    pub pid: i32,
    pub fd: i32,
}

/// A decoded frame payload, borrowed from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Payload<'a> {
    Command { id: u16, body: &'a [u8] },
    Named { name: &'a str, body: &'a [u8] },
}

/// Appends a command frame for `(cmd, para)` with `body`.
pub fn frame_command(dst: &mut Vec<u8>, cmd: u8, para: u8, body: &[u8]) -> NetResult<()> {
    let total = 1 + 2 + body.len();
    if total > MAX_TOTAL_LEN {
        return Err(NetError::Framing(total as u32));
    }
    codec::put_fixed32(dst, total as u32);
    dst.push(KIND_COMMAND);
    dst.extend_from_slice(&codec::cmd_id(cmd, para).to_ne_bytes());
    dst.extend_from_slice(body);
    Ok(())
}

/// Appends a named frame for `name` with serialized `body`.
pub fn frame_named(dst: &mut Vec<u8>, name: &str, body: &[u8]) -> NetResult<()> {
    if name.len() > u16::MAX as usize {
        return Err(NetError::InvalidArgument("frame_named", "name too long"));
    }
    let total = 1 + 2 + name.len() + body.len();
    if total > MAX_TOTAL_LEN {
        return Err(NetError::Framing(total as u32));
    }
    codec::put_fixed32(dst, total as u32);
    dst.push(KIND_NAMED);
    let mut nl = [0u8; 2];
    codec::encode_fixed16(&mut nl, name.len() as u16);
    dst.extend_from_slice(&nl);
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(body);
    Ok(())
}

/// Appends a channel-open frame. The `fd` rides in the payload here; the
/// channel send path re-reads it and attaches it as ancillary data.
pub fn frame_channel_open(dst: &mut Vec<u8>, open: &ChannelOpen) -> NetResult<()> {
    let body = bitcode::serialize(open)
        .map_err(|_| NetError::InvalidArgument("frame_channel_open", "encode failed"))?;
    frame_named(dst, CHANNEL_OPEN_NAME, &body)
}

/// The zero-body keepalive frame, command id `(0, 0)`.
pub fn heartbeat() -> Vec<u8> {
    let mut f = Vec::with_capacity(LEN_HEADER_SIZE + 3);
    frame_command(&mut f, CMD_NULL, PARA_NULL, &[]).ok();
    f
}

#[inline]
pub fn is_heartbeat(payload: &Payload<'_>) -> bool {
    matches!(payload, Payload::Command { id, .. } if *id == codec::cmd_id(CMD_NULL, PARA_NULL))
}

/// Decodes the declared `total_length` of the frame starting at `buf`.
/// `buf` must hold at least the 4-byte prefix.
#[inline]
pub fn total_len(buf: &[u8]) -> u32 {
    codec::decode_fixed32(buf)
}

/// Validates a declared `total_length` against the framing bounds.
#[inline]
pub fn check_total_len(total: u32) -> NetResult<()> {
    if total == 0 || total as usize > MAX_TOTAL_LEN {
        return Err(NetError::Framing(total));
    }
    Ok(())
}

/// Parses one complete frame (`[len][kind][payload]`, all bytes present).
pub fn parse(frame: &[u8]) -> NetResult<Payload<'_>> {
    if frame.len() < LEN_HEADER_SIZE + 1 {
        return Err(NetError::Framing(frame.len() as u32));
    }
    let total = total_len(frame) as usize;
    check_total_len(total as u32)?;
    if frame.len() != LEN_HEADER_SIZE + total {
        return Err(NetError::Framing(total as u32));
    }

    let kind = frame[LEN_HEADER_SIZE];
    let payload = &frame[LEN_HEADER_SIZE + 1..];
    match kind {
        KIND_COMMAND => {
            if payload.len() < 2 {
                return Err(NetError::Framing(total as u32));
            }
            let id = u16::from_ne_bytes([payload[0], payload[1]]);
            Ok(Payload::Command { id, body: &payload[2..] })
        }
        KIND_NAMED => {
            if payload.len() < 2 {
                return Err(NetError::Framing(total as u32));
            }
            let name_len = codec::decode_fixed16(payload) as usize;
            if payload.len() < 2 + name_len {
                return Err(NetError::Framing(total as u32));
            }
            let name = core::str::from_utf8(&payload[2..2 + name_len])
                .map_err(|_| NetError::Framing(total as u32))?;
            Ok(Payload::Named { name, body: &payload[2 + name_len..] })
        }
        _ => Err(NetError::Framing(total as u32)),
    }
}

/// Reads the name of a named frame without a full parse. Used by the channel
/// send path to spot `CHANNEL_OPEN_NAME` frames.
pub fn peek_named(frame: &[u8]) -> Option<(&str, &[u8])> {
    match parse(frame) {
        Ok(Payload::Named { name, body }) => Some((name, body)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_roundtrip() {
        let mut f = Vec::new();
        frame_command(&mut f, 1, 7, b"hi!").unwrap();
        assert_eq!(f.len(), LEN_HEADER_SIZE + 1 + 2 + 3);
        assert_eq!(total_len(&f), 6);
        match parse(&f).unwrap() {
            Payload::Command { id, body } => {
                assert_eq!(warren_utils::codec::split_cmd_id(id), (1, 7));
                assert_eq!(body, b"hi!");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn named_roundtrip() {
        let mut f = Vec::new();
        frame_named(&mut f, "app.Ping", &[1, 2, 3]).unwrap();
        match parse(&f).unwrap() {
            Payload::Named { name, body } => {
                assert_eq!(name, "app.Ping");
                assert_eq!(body, &[1, 2, 3]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn channel_open_roundtrip() {
        let open = ChannelOpen { slot: 3, pid: 4242, fd: 17 };
        let mut f = Vec::new();
        frame_channel_open(&mut f, &open).unwrap();
        let (name, body) = peek_named(&f).unwrap();
        assert_eq!(name, CHANNEL_OPEN_NAME);
        assert_eq!(bitcode::deserialize::<ChannelOpen>(body).unwrap(), open);
    }

    #[test]
    fn one_byte_payload_is_legal() {
        let mut f = Vec::new();
        codec::put_fixed32(&mut f, 1);
        f.push(KIND_COMMAND);
        // A 1-byte total is within bounds but too short for a command id.
        assert!(matches!(parse(&f), Err(NetError::Framing(_))));
        assert!(check_total_len(1).is_ok());
    }

    #[test]
    fn max_payload_is_legal() {
        let body = vec![0xAB; MAX_TOTAL_LEN - 3];
        let mut f = Vec::new();
        frame_command(&mut f, 9, 9, &body).unwrap();
        assert_eq!(f.len(), PACKAGE_SIZE);
        match parse(&f).unwrap() {
            Payload::Command { body: got, .. } => assert_eq!(got, &body[..]),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn oversize_and_zero_lengths_rejected() {
        assert!(check_total_len(0).is_err());
        assert!(check_total_len(0xFFFF_FFFF).is_err());
        assert!(check_total_len(MAX_TOTAL_LEN as u32 + 1).is_err());
        let body = vec![0u8; MAX_TOTAL_LEN];
        let mut f = Vec::new();
        assert!(frame_command(&mut f, 0, 1, &body).is_err());
    }

    #[test]
    fn heartbeat_shape() {
        let hb = heartbeat();
        assert_eq!(hb.len(), LEN_HEADER_SIZE + 3);
        let p = parse(&hb).unwrap();
        assert!(is_heartbeat(&p));
    }
}
