//! RPC message model: header, body, and routing state.
//!
//! Messages are owned exclusively by whichever component currently holds
//! them; hand-off to the matcher or a network transfers ownership, and
//! forwards/retries clone explicitly. Bodies are opaque bytes; the
//! [`encode_body`]/[`decode_body`] helpers serialize typed payloads with
//! bincode for callers that want them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::addr::{EndPoint, HostAddr};
use crate::error::{ErrCode, Result, RpcError};
use crate::net::{HeaderFormat, Session};
use crate::task::TaskCode;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Fixed width of the on-wire server error name.
pub const ERROR_NAME_LEN: usize = 48;

/// Serialize a serde-compatible body to bytes using bincode.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Deserialize a bincode body back into a typed value.
pub fn decode_body<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| RpcError::Serialization(e.to_string()))
}

/// Group partition id attached to replication-layer messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gpid {
    /// Application id; zero means "not a replication message".
    pub app_id: i32,
    /// Partition index within the application.
    pub partition_index: i32,
}

impl Gpid {
    /// Packed 64-bit value; zero iff both fields are zero.
    pub fn value(&self) -> u64 {
        ((self.app_id as u32 as u64) << 32) | (self.partition_index as u32 as u64)
    }

    /// Default thread hash derived from the partition identity.
    pub fn thread_hash(&self) -> i32 {
        (self.app_id.wrapping_mul(7919)).wrapping_add(self.partition_index)
    }
}

/// Per-client header fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientFields {
    /// Caller timeout budget in milliseconds.
    pub timeout_ms: i32,
    /// Hash routing the call to a partition under a URI destination.
    pub partition_hash: u64,
    /// Hash pinning handler execution to a worker; zero means unset.
    pub thread_hash: i32,
}

/// Per-server header fields, stamped on responses.
#[derive(Clone, Copy)]
pub struct ServerFields {
    /// Numeric error identity ([`ErrCode`] wire value).
    pub error_code: u32,
    /// Fixed-width truncated error name, NUL padded.
    pub error_name: [u8; ERROR_NAME_LEN],
}

impl Default for ServerFields {
    fn default() -> Self {
        ServerFields {
            error_code: 0,
            error_name: [0; ERROR_NAME_LEN],
        }
    }
}

impl ServerFields {
    /// Stamp an error identity and its truncated name.
    pub fn set_error(&mut self, err: ErrCode) {
        self.error_code = err.as_u32();
        self.error_name = [0; ERROR_NAME_LEN];
        let name = err.name().as_bytes();
        let n = name.len().min(ERROR_NAME_LEN);
        self.error_name[..n].copy_from_slice(&name[..n]);
    }

    /// The stamped error name with NUL padding stripped.
    pub fn error_name_str(&self) -> &str {
        let end = self
            .error_name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(ERROR_NAME_LEN);
        std::str::from_utf8(&self.error_name[..end]).unwrap_or("")
    }

    /// The stamped error identity.
    pub fn error(&self) -> ErrCode {
        ErrCode::from_u32(self.error_code)
    }
}

impl std::fmt::Debug for ServerFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerFields")
            .field("error_code", &self.error_code)
            .field("error_name", &self.error_name_str())
            .finish()
    }
}

/// Packed context bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextFlags {
    /// Request vs response.
    pub is_request: bool,
    /// Set when a server re-dispatched this request to another server.
    pub is_forwarded: bool,
    /// Whether the originating code tolerates forwarding at all.
    pub is_forward_supported: bool,
}

/// The framed message header. Field order and widths are wire-stable; see
/// [`crate::protocol`] for the codec.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    /// Process-unique request id; replies match on it.
    pub id: u64,
    /// Random tag that survives forwarding, for cross-node log correlation.
    pub trace_id: u64,
    /// Sender-local numeric rpc code, advisory on the wire.
    pub rpc_code: u32,
    /// Canonical rpc name; receivers dispatch on it when the numeric code
    /// is unknown to them.
    pub rpc_name: String,
    /// Sender primary address.
    pub from_addr: EndPoint,
    /// Concrete destination endpoint of this transmission.
    pub to_addr: EndPoint,
    /// Client-side fields.
    pub client: ClientFields,
    /// Replication partition identity; zero when unused.
    pub gpid: Gpid,
    /// Server-side response fields.
    pub server: ServerFields,
    /// Packed context bits.
    pub context: ContextFlags,
}

impl Default for MessageHeader {
    fn default() -> Self {
        MessageHeader {
            id: 0,
            trace_id: 0,
            rpc_code: 0,
            rpc_name: String::new(),
            from_addr: EndPoint::INVALID,
            to_addr: EndPoint::INVALID,
            client: ClientFields::default(),
            gpid: Gpid::default(),
            server: ServerFields::default(),
            context: ContextFlags::default(),
        }
    }
}

/// A framed RPC message plus the routing state that travels with it inside
/// the engine (but not on the wire).
#[derive(Clone)]
pub struct Message {
    /// Wire header.
    pub header: MessageHeader,
    /// Opaque body bytes.
    pub body: Vec<u8>,
    /// Logical destination; `to_addr` holds the concrete endpoint chosen
    /// from it for the current transmission.
    pub server_addr: HostAddr,
    /// Resolved local task code; `TaskCode::INVALID` until dispatch
    /// resolves the rpc name.
    pub local_code: TaskCode,
    /// Header format this message was (or will be) framed with.
    pub hdr_format: HeaderFormat,
    /// Number of resolver-level retries already attempted.
    pub send_retry_count: u32,
    /// Session the message arrived on, when connection oriented; replies
    /// prefer it.
    pub session: Option<Arc<dyn Session>>,
}

impl Message {
    /// Allocate a fresh process-unique message id.
    pub fn new_id() -> u64 {
        ID_COUNTER.fetch_add(1, Ordering::Relaxed)
    }

    /// Build a request message for `code` with the code's default timeout
    /// and forwarding policy. The destination is set by the caller before
    /// [`crate::engine::RpcEngine::call`].
    pub fn request(code: TaskCode) -> Message {
        let spec = code.spec();
        let mut header = MessageHeader {
            id: Message::new_id(),
            rpc_code: code.as_u32(),
            rpc_name: code.name().to_string(),
            ..MessageHeader::default()
        };
        header.client.timeout_ms = spec.rpc_timeout_ms();
        header.context.is_request = true;
        header.context.is_forward_supported = spec.is_forward_supported();
        Message {
            header,
            body: Vec::new(),
            server_addr: HostAddr::Invalid,
            local_code: code,
            hdr_format: HeaderFormat::Native,
            send_retry_count: 0,
            session: None,
        }
    }

    /// Set the logical destination.
    pub fn with_server_addr(mut self, addr: impl Into<HostAddr>) -> Message {
        self.server_addr = addr.into();
        self
    }

    /// Override the caller timeout budget.
    pub fn with_timeout_ms(mut self, timeout_ms: i32) -> Message {
        self.header.client.timeout_ms = timeout_ms;
        self
    }

    /// Attach a body.
    pub fn with_body(mut self, body: Vec<u8>) -> Message {
        self.body = body;
        self
    }

    /// Set the partition hash consulted by URI resolution.
    pub fn with_partition_hash(mut self, hash: u64) -> Message {
        self.header.client.partition_hash = hash;
        self
    }

    /// Build the response skeleton for this request: same id, trace id and
    /// rpc name, addresses swapped, context bits carried over, server
    /// fields cleared.
    pub fn create_response(&self) -> Message {
        let mut header = self.header.clone();
        header.context.is_request = false;
        header.server = ServerFields::default();
        header.to_addr = self.header.from_addr;
        header.from_addr = self.header.to_addr;
        Message {
            header,
            body: Vec::new(),
            server_addr: HostAddr::Invalid,
            local_code: self.local_code,
            hdr_format: self.hdr_format,
            send_retry_count: 0,
            session: self.session.clone(),
        }
    }

    /// The wire error carried by this message's server fields.
    pub fn error(&self) -> ErrCode {
        self.header.server.error()
    }

    /// Whether this message is a request.
    pub fn is_request(&self) -> bool {
        self.header.context.is_request
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.header.id)
            .field("trace_id", &format_args!("{:016x}", self.header.trace_id))
            .field("rpc_name", &self.header.rpc_name)
            .field("is_request", &self.header.context.is_request)
            .field("to", &self.header.to_addr)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_new_ids_are_unique() {
        let a = Message::new_id();
        let b = Message::new_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_request_defaults() {
        let code = TaskCode::register("RPC_MESSAGE_TEST_DEFAULTS");
        let msg = Message::request(code);
        assert!(msg.header.context.is_request);
        assert!(msg.header.id > 0);
        assert_eq!(msg.header.rpc_name, "RPC_MESSAGE_TEST_DEFAULTS");
        assert_eq!(msg.local_code, code);
        assert!(msg.server_addr.is_invalid());
    }

    #[test]
    fn test_create_response_swaps_addresses() {
        let code = TaskCode::register("RPC_MESSAGE_TEST_RESPONSE");
        let mut msg = Message::request(code);
        msg.header.from_addr = EndPoint::localhost(2000);
        msg.header.to_addr = EndPoint::localhost(3000);
        msg.header.server.set_error(ErrCode::Timeout);

        let resp = msg.create_response();
        assert!(!resp.header.context.is_request);
        assert_eq!(resp.header.id, msg.header.id);
        assert_eq!(resp.header.trace_id, msg.header.trace_id);
        assert_eq!(resp.header.to_addr, EndPoint::localhost(2000));
        assert_eq!(resp.header.from_addr, EndPoint::localhost(3000));
        assert_eq!(resp.error(), ErrCode::Ok);
    }

    #[test]
    fn test_server_fields_error_name_truncation() {
        let mut server = ServerFields::default();
        server.set_error(ErrCode::ServiceAlreadyRunning);
        assert_eq!(server.error_name_str(), "ERR_SERVICE_ALREADY_RUNNING");
        assert_eq!(server.error(), ErrCode::ServiceAlreadyRunning);
    }

    #[test]
    fn test_gpid_value_packing() {
        let gpid = Gpid {
            app_id: 2,
            partition_index: 7,
        };
        assert_eq!(gpid.value(), (2u64 << 32) | 7);
        assert_eq!(Gpid::default().value(), 0);
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        key: String,
        seq: u64,
    }

    #[test]
    fn test_body_codec_round_trip() {
        let payload = Payload {
            key: "alpha".to_string(),
            seq: 42,
        };
        let bytes = encode_body(&payload).unwrap();
        let decoded: Payload = decode_body(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }
}
