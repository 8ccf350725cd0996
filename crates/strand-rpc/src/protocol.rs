//! Bit-stable wire codec for the native header format.
//!
//! The fixed part is 120 bytes, little endian throughout, followed by the
//! variable-length rpc name and the body. Field order and widths must not
//! change across releases; peers of different versions negotiate nothing.

use crate::addr::{EndPoint, HostAddr};
use crate::error::{Result, RpcError};
use crate::message::{
    ClientFields, ContextFlags, Gpid, Message, MessageHeader, ServerFields, ERROR_NAME_LEN,
};
use crate::net::HeaderFormat;
use crate::task::TaskCode;

/// Frame magic for the native format.
pub const MAGIC: u32 = 0x5352_4E44;

/// Native format version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header part in bytes.
pub const FIXED_HEADER_SIZE: usize = 120;

/// Upper bound on the announced body length.
pub const MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Upper bound on the announced rpc name length.
pub const MAX_RPC_NAME_LEN: usize = 256;

const CTX_IS_REQUEST: u8 = 0x01;
const CTX_IS_FORWARDED: u8 = 0x02;
const CTX_FORWARD_SUPPORTED: u8 = 0x04;

fn pack_context(ctx: ContextFlags) -> u8 {
    let mut b = 0u8;
    if ctx.is_request {
        b |= CTX_IS_REQUEST;
    }
    if ctx.is_forwarded {
        b |= CTX_IS_FORWARDED;
    }
    if ctx.is_forward_supported {
        b |= CTX_FORWARD_SUPPORTED;
    }
    b
}

fn unpack_context(b: u8) -> ContextFlags {
    ContextFlags {
        is_request: b & CTX_IS_REQUEST != 0,
        is_forwarded: b & CTX_IS_FORWARDED != 0,
        is_forward_supported: b & CTX_FORWARD_SUPPORTED != 0,
    }
}

/// Encode a message into one contiguous frame.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let hdr = &msg.header;
    let name = hdr.rpc_name.as_bytes();
    let mut buf = Vec::with_capacity(FIXED_HEADER_SIZE + name.len() + msg.body.len());

    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(PROTOCOL_VERSION);
    buf.push(pack_context(hdr.context));
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(&hdr.id.to_le_bytes());
    buf.extend_from_slice(&hdr.trace_id.to_le_bytes());
    buf.extend_from_slice(&hdr.rpc_code.to_le_bytes());
    buf.extend_from_slice(&hdr.from_addr.ip.to_le_bytes());
    buf.extend_from_slice(&hdr.from_addr.port.to_le_bytes());
    buf.extend_from_slice(&hdr.to_addr.ip.to_le_bytes());
    buf.extend_from_slice(&hdr.to_addr.port.to_le_bytes());
    buf.extend_from_slice(&hdr.client.timeout_ms.to_le_bytes());
    buf.extend_from_slice(&hdr.client.partition_hash.to_le_bytes());
    buf.extend_from_slice(&hdr.client.thread_hash.to_le_bytes());
    buf.extend_from_slice(&hdr.gpid.app_id.to_le_bytes());
    buf.extend_from_slice(&hdr.gpid.partition_index.to_le_bytes());
    buf.extend_from_slice(&hdr.server.error_code.to_le_bytes());
    buf.extend_from_slice(&hdr.server.error_name);
    buf.extend_from_slice(&(msg.body.len() as u32).to_le_bytes());
    debug_assert_eq!(buf.len(), FIXED_HEADER_SIZE);

    buf.extend_from_slice(name);
    buf.extend_from_slice(&msg.body);
    buf
}

/// Validate a fixed header and return the total frame length including the
/// variable parts. Transports use this to size their reads.
pub fn total_frame_len(fixed: &[u8]) -> Result<usize> {
    if fixed.len() < FIXED_HEADER_SIZE {
        return Err(RpcError::InvalidFrame {
            reason: format!("short header: {} bytes", fixed.len()),
        });
    }
    let magic = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(RpcError::InvalidMagic {
            expected: MAGIC,
            got: magic,
        });
    }
    let version = fixed[4];
    if version != PROTOCOL_VERSION {
        return Err(RpcError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            got: version,
        });
    }
    let name_len = u16::from_le_bytes(fixed[6..8].try_into().unwrap()) as usize;
    if name_len > MAX_RPC_NAME_LEN {
        return Err(RpcError::InvalidFrame {
            reason: format!("rpc name too long: {name_len}"),
        });
    }
    let body_len = u32::from_le_bytes(fixed[116..120].try_into().unwrap());
    if body_len > MAX_BODY_SIZE {
        return Err(RpcError::PayloadTooLarge {
            size: body_len,
            max_size: MAX_BODY_SIZE,
        });
    }
    Ok(FIXED_HEADER_SIZE + name_len + body_len as usize)
}

/// Decode one frame. Returns the message and the number of bytes consumed.
///
/// The decoded message carries no session; transports attach one before
/// handing it to the engine. The local task code is resolved when this
/// process has registered the rpc name, and left invalid otherwise.
pub fn decode_message(buf: &[u8]) -> Result<(Message, usize)> {
    let total = total_frame_len(buf)?;
    if buf.len() < total {
        return Err(RpcError::InvalidFrame {
            reason: format!("short frame: {} of {} bytes", buf.len(), total),
        });
    }

    let context = unpack_context(buf[5]);
    let name_len = u16::from_le_bytes(buf[6..8].try_into().unwrap()) as usize;
    let id = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    let trace_id = u64::from_le_bytes(buf[16..24].try_into().unwrap());
    let rpc_code = u32::from_le_bytes(buf[24..28].try_into().unwrap());
    let from_addr = EndPoint {
        ip: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        port: u16::from_le_bytes(buf[32..34].try_into().unwrap()),
    };
    let to_addr = EndPoint {
        ip: u32::from_le_bytes(buf[34..38].try_into().unwrap()),
        port: u16::from_le_bytes(buf[38..40].try_into().unwrap()),
    };
    let client = ClientFields {
        timeout_ms: i32::from_le_bytes(buf[40..44].try_into().unwrap()),
        partition_hash: u64::from_le_bytes(buf[44..52].try_into().unwrap()),
        thread_hash: i32::from_le_bytes(buf[52..56].try_into().unwrap()),
    };
    let gpid = Gpid {
        app_id: i32::from_le_bytes(buf[56..60].try_into().unwrap()),
        partition_index: i32::from_le_bytes(buf[60..64].try_into().unwrap()),
    };
    let mut server = ServerFields {
        error_code: u32::from_le_bytes(buf[64..68].try_into().unwrap()),
        error_name: [0; ERROR_NAME_LEN],
    };
    server.error_name.copy_from_slice(&buf[68..68 + ERROR_NAME_LEN]);

    let name_start = FIXED_HEADER_SIZE;
    let rpc_name = std::str::from_utf8(&buf[name_start..name_start + name_len])
        .map_err(|_| RpcError::InvalidFrame {
            reason: "rpc name is not utf-8".to_string(),
        })?
        .to_string();
    let body = buf[name_start + name_len..total].to_vec();

    let local_code = TaskCode::try_from_name(&rpc_name).unwrap_or(TaskCode::INVALID);
    let msg = Message {
        header: MessageHeader {
            id,
            trace_id,
            rpc_code,
            rpc_name,
            from_addr,
            to_addr,
            client,
            gpid,
            server,
            context,
        },
        body,
        server_addr: HostAddr::Invalid,
        local_code,
        hdr_format: HeaderFormat::Native,
        send_retry_count: 0,
        session: None,
    };
    Ok((msg, total))
}
