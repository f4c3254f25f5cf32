//! C7: Control Codec. Serializes and parses the 13 control commands of spec.md §4.7.
//!
//! Every control message is framed identically: a 4-byte big-endian total size
//! (including itself), a 1-byte command, then the command-specific body. `encode`
//! produces that framed byte string; `decode` parses it back into a `ControlBody`.
//! Per REDESIGN FLAG 3, `STATUS_REQ`/`STATUS_RESP` use a consistent 2-byte big-endian
//! request/response number rather than the original's inconsistent byte assignment.
//! Per REDESIGN FLAG 2, `HRTBEAT_QUERY`/`HRTBEAT_ANSWER` read timestamp from bytes 0..4
//! of the body and sequence from bytes 4..8, rather than both from the same offset.

use p3_utils::error::P3Error;

pub const SIZE_PREFIX_LEN: usize = 4;
pub const CMD_LEN: usize = 1;
pub const FRAME_HEADER_LEN: usize = SIZE_PREFIX_LEN + CMD_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    SetKeyArray = 1,
    AckKeyArray = 2,
    ReplaceKey = 3,
    Rekey = 4,
    RekeyTest = 5,
    HeartbeatQuery = 6,
    HeartbeatAnswer = 7,
    StatusReq = 8,
    StatusResp = 9,
    UpdateInfo = 10,
    AckUpdate = 11,
    Shutdown = 12,
    AckShutdown = 13,
}

impl ControlCommand {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::SetKeyArray,
            2 => Self::AckKeyArray,
            3 => Self::ReplaceKey,
            4 => Self::Rekey,
            5 => Self::RekeyTest,
            6 => Self::HeartbeatQuery,
            7 => Self::HeartbeatAnswer,
            8 => Self::StatusReq,
            9 => Self::StatusResp,
            10 => Self::UpdateInfo,
            11 => Self::AckUpdate,
            12 => Self::Shutdown,
            13 => Self::AckShutdown,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// REPLACE_KEY (and SET_KEY_ARRAY entries) may carry either a raw key or a 2-byte
/// index into the peer's precomputed key array, per spec.md §3's "optional key-array"
/// and §4.7's "data(key or 2-byte idx)".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrIndex {
    Key(Vec<u8>),
    Index(u16),
}

/// Bit set in `ReplaceKey`/`SetKeyArray` flags when fields are key-array indices
/// rather than raw key material.
pub const RKEY_FLAG_INDEXED: u8 = 0x01;

/// Bit set in a `Rekey` ack's flags to signal an error (spec.md §4.8, `RKERR`).
pub const RKERR: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlBody {
    SetKeyArray { flags: u8, keys: Vec<Vec<u8>> },
    AckKeyArray { flags: u8 },
    ReplaceKey { flags: u8, data: KeyOrIndex, control: KeyOrIndex },
    Rekey { flags: u8, first_seq: u32 },
    RekeyTest { test_bytes: Vec<u8> },
    HeartbeatQuery { timestamp: u32, sequence: u32 },
    HeartbeatAnswer { timestamp: u32, sequence: u32 },
    StatusReq { flags: u8, request_no: u16 },
    StatusResp { flags: u8, response_no: u16 },
    UpdateInfo { flags: u8, body: Vec<u8> },
    AckUpdate { flags: u8 },
    Shutdown { flags: u8 },
    AckShutdown { flags: u8 },
}

impl ControlBody {
    pub fn command(&self) -> ControlCommand {
        match self {
            ControlBody::SetKeyArray { .. } => ControlCommand::SetKeyArray,
            ControlBody::AckKeyArray { .. } => ControlCommand::AckKeyArray,
            ControlBody::ReplaceKey { .. } => ControlCommand::ReplaceKey,
            ControlBody::Rekey { .. } => ControlCommand::Rekey,
            ControlBody::RekeyTest { .. } => ControlCommand::RekeyTest,
            ControlBody::HeartbeatQuery { .. } => ControlCommand::HeartbeatQuery,
            ControlBody::HeartbeatAnswer { .. } => ControlCommand::HeartbeatAnswer,
            ControlBody::StatusReq { .. } => ControlCommand::StatusReq,
            ControlBody::StatusResp { .. } => ControlCommand::StatusResp,
            ControlBody::UpdateInfo { .. } => ControlCommand::UpdateInfo,
            ControlBody::AckUpdate { .. } => ControlCommand::AckUpdate,
            ControlBody::Shutdown { .. } => ControlCommand::Shutdown,
            ControlBody::AckShutdown { .. } => ControlCommand::AckShutdown,
        }
    }

    fn encode_key_or_index(out: &mut Vec<u8>, v: &KeyOrIndex) {
        match v {
            KeyOrIndex::Key(k) => out.extend_from_slice(k),
            KeyOrIndex::Index(i) => out.extend_from_slice(&i.to_be_bytes()),
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            ControlBody::SetKeyArray { flags, keys } => {
                out.push(*flags);
                let array_size = keys.len() as u32;
                out.push((array_size >> 16) as u8);
                out.push((array_size >> 8) as u8);
                out.push(array_size as u8);
                for k in keys {
                    out.extend_from_slice(k);
                }
            }
            ControlBody::AckKeyArray { flags } => out.push(*flags),
            ControlBody::ReplaceKey { flags, data, control } => {
                out.push(*flags);
                Self::encode_key_or_index(out, data);
                Self::encode_key_or_index(out, control);
            }
            ControlBody::Rekey { flags, first_seq } => {
                out.push(*flags);
                out.extend_from_slice(&first_seq.to_be_bytes());
            }
            ControlBody::RekeyTest { test_bytes } => {
                out.push(test_bytes.len() as u8);
                out.extend_from_slice(test_bytes);
            }
            ControlBody::HeartbeatQuery { timestamp, sequence } | ControlBody::HeartbeatAnswer { timestamp, sequence } => {
                out.extend_from_slice(&timestamp.to_be_bytes());
                out.extend_from_slice(&sequence.to_be_bytes());
            }
            ControlBody::StatusReq { flags, request_no } => {
                out.push(*flags);
                out.extend_from_slice(&request_no.to_be_bytes());
            }
            ControlBody::StatusResp { flags, response_no } => {
                out.push(*flags);
                out.extend_from_slice(&response_no.to_be_bytes());
            }
            ControlBody::UpdateInfo { flags, body } => {
                out.push(*flags);
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(body);
            }
            ControlBody::AckUpdate { flags }
            | ControlBody::Shutdown { flags }
            | ControlBody::AckShutdown { flags } => out.push(*flags),
        }
    }
}

/// Frame and serialize a control message: `| 4 size incl. self | 1 cmd | body |`
/// (spec.md §3 "Control message", §4.7 "Outer framing").
pub fn encode(body: &ControlBody) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&[0u8; SIZE_PREFIX_LEN]);
    out.push(body.command().as_u8());
    body.encode_body(&mut out);
    let size = out.len() as u32;
    out[0..SIZE_PREFIX_LEN].copy_from_slice(&size.to_be_bytes());
    out
}

/// Parse a framed control message. `key_len` is the raw key width (derived from the
/// peer's configured key type) used to disambiguate `KeyOrIndex` fields when the
/// indexed flag bit is clear.
pub fn decode(buf: &[u8], key_len: usize) -> Result<ControlBody, P3Error> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(P3Error::BadControl("frame shorter than header"));
    }
    let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size != buf.len() {
        return Err(P3Error::BadControl("declared size does not match frame length"));
    }
    let cmd = ControlCommand::from_u8(buf[4]).ok_or(P3Error::BadControl("unknown command"))?;
    let body = &buf[FRAME_HEADER_LEN..];

    Ok(match cmd {
        ControlCommand::SetKeyArray => {
            if body.len() < 4 {
                return Err(P3Error::BadControl("SET_KEY_ARRAY too short"));
            }
            let flags = body[0];
            let array_size = ((body[1] as usize) << 16) | ((body[2] as usize) << 8) | body[3] as usize;
            let keys_region = &body[4..];
            if key_len == 0 || keys_region.len() != array_size * key_len {
                return Err(P3Error::BadControl("SET_KEY_ARRAY key region length mismatch"));
            }
            let keys = keys_region.chunks_exact(key_len).map(|c| c.to_vec()).collect();
            ControlBody::SetKeyArray { flags, keys }
        }
        ControlCommand::AckKeyArray => {
            require_len(body, 1, "ACK_KEY_ARRAY")?;
            ControlBody::AckKeyArray { flags: body[0] }
        }
        ControlCommand::ReplaceKey => {
            if body.is_empty() {
                return Err(P3Error::BadControl("REPLACE_KEY too short"));
            }
            let flags = body[0];
            let indexed = flags & RKEY_FLAG_INDEXED != 0;
            let rest = &body[1..];
            let field_len = if indexed { 2 } else { key_len };
            if field_len == 0 || rest.len() != field_len * 2 {
                return Err(P3Error::BadControl("REPLACE_KEY body length mismatch"));
            }
            let (data_bytes, control_bytes) = rest.split_at(field_len);
            let parse_field = |b: &[u8]| -> KeyOrIndex {
                if indexed {
                    KeyOrIndex::Index(u16::from_be_bytes([b[0], b[1]]))
                } else {
                    KeyOrIndex::Key(b.to_vec())
                }
            };
            ControlBody::ReplaceKey { flags, data: parse_field(data_bytes), control: parse_field(control_bytes) }
        }
        ControlCommand::Rekey => {
            require_len(body, 5, "REKEY")?;
            let flags = body[0];
            let first_seq = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
            ControlBody::Rekey { flags, first_seq }
        }
        ControlCommand::RekeyTest => {
            if body.is_empty() {
                return Err(P3Error::BadControl("REKEY_TEST too short"));
            }
            let len = body[0] as usize;
            if body.len() != 1 + len {
                return Err(P3Error::BadControl("REKEY_TEST length mismatch"));
            }
            ControlBody::RekeyTest { test_bytes: body[1..].to_vec() }
        }
        ControlCommand::HeartbeatQuery | ControlCommand::HeartbeatAnswer => {
            require_len(body, 8, "heartbeat message")?;
            let timestamp = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            let sequence = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
            if cmd == ControlCommand::HeartbeatQuery {
                ControlBody::HeartbeatQuery { timestamp, sequence }
            } else {
                ControlBody::HeartbeatAnswer { timestamp, sequence }
            }
        }
        ControlCommand::StatusReq => {
            require_len(body, 3, "STATUS_REQ")?;
            ControlBody::StatusReq { flags: body[0], request_no: u16::from_be_bytes([body[1], body[2]]) }
        }
        ControlCommand::StatusResp => {
            require_len(body, 3, "STATUS_RESP")?;
            ControlBody::StatusResp { flags: body[0], response_no: u16::from_be_bytes([body[1], body[2]]) }
        }
        ControlCommand::UpdateInfo => {
            if body.len() < 5 {
                return Err(P3Error::BadControl("UPDATE_INFO too short"));
            }
            let flags = body[0];
            let size = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
            if body.len() != 5 + size {
                return Err(P3Error::BadControl("UPDATE_INFO size mismatch"));
            }
            ControlBody::UpdateInfo { flags, body: body[5..].to_vec() }
        }
        ControlCommand::AckUpdate => {
            require_len(body, 1, "ACK_UPDATE")?;
            ControlBody::AckUpdate { flags: body[0] }
        }
        ControlCommand::Shutdown => {
            require_len(body, 1, "SHUTDOWN")?;
            ControlBody::Shutdown { flags: body[0] }
        }
        ControlCommand::AckShutdown => {
            require_len(body, 1, "ACK_SHUTDOWN")?;
            ControlBody::AckShutdown { flags: body[0] }
        }
    })
}

/// Role asymmetry table (spec.md §4.7): these commands arrive at, and are acted on
/// by, the Secondary side. Everything else (acks, answers, and `REPLACE_KEY` itself)
/// originates from the Primary.
pub fn is_secondary_handled(cmd: ControlCommand) -> bool {
    matches!(
        cmd,
        ControlCommand::SetKeyArray
            | ControlCommand::ReplaceKey
            | ControlCommand::RekeyTest
            | ControlCommand::HeartbeatQuery
            | ControlCommand::StatusReq
            | ControlCommand::UpdateInfo
            | ControlCommand::Shutdown
    )
}

fn require_len(body: &[u8], want: usize, what: &'static str) -> Result<(), P3Error> {
    if body.len() != want {
        Err(P3Error::BadControl(what))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_query_roundtrip_distinct_fields() {
        let body = ControlBody::HeartbeatQuery { timestamp: 0x11223344, sequence: 0x55667788 };
        let framed = encode(&body);
        let decoded = decode(&framed, 16).unwrap();
        match decoded {
            ControlBody::HeartbeatQuery { timestamp, sequence } => {
                assert_eq!(timestamp, 0x11223344);
                assert_eq!(sequence, 0x55667788);
                assert_ne!(timestamp, sequence);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn status_req_resp_use_two_byte_numbers() {
        let req = ControlBody::StatusReq { flags: 0, request_no: 4242 };
        let framed = encode(&req);
        assert_eq!(framed.len(), FRAME_HEADER_LEN + 3);
        let decoded = decode(&framed, 16).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn replace_key_raw_keys_roundtrip() {
        let body = ControlBody::ReplaceKey {
            flags: 0,
            data: KeyOrIndex::Key(vec![0xaa; 32]),
            control: KeyOrIndex::Key(vec![0xbb; 32]),
        };
        let framed = encode(&body);
        let decoded = decode(&framed, 32).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn replace_key_indexed_roundtrip() {
        let body = ControlBody::ReplaceKey { flags: RKEY_FLAG_INDEXED, data: KeyOrIndex::Index(7), control: KeyOrIndex::Index(9) };
        let framed = encode(&body);
        let decoded = decode(&framed, 32).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn rekey_ack_error_bit_detected() {
        let body = ControlBody::Rekey { flags: RKERR, first_seq: 101 };
        let framed = encode(&body);
        let decoded = decode(&framed, 16).unwrap();
        match decoded {
            ControlBody::Rekey { flags, .. } => assert_ne!(flags & RKERR, 0),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn truncated_frame_rejected() {
        let body = ControlBody::Shutdown { flags: 0 };
        let mut framed = encode(&body);
        framed.truncate(framed.len() - 1);
        assert!(decode(&framed, 16).is_err());
    }

    #[test]
    fn set_key_array_roundtrip() {
        let keys = vec![vec![1u8; 16], vec![2u8; 16], vec![3u8; 16]];
        let body = ControlBody::SetKeyArray { flags: 0, keys };
        let framed = encode(&body);
        let decoded = decode(&framed, 16).unwrap();
        assert_eq!(decoded, body);
    }
}
