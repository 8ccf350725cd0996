#![warn(missing_docs)]

//! Strand RPC engine: per-node dispatch of outbound calls, reply matching
//! under timeout/retry pressure, logical destination routing, and inbound
//! request dispatch.
//!
//! This crate provides the RPC nucleus for Strand nodes, supporting:
//! - A sharded pending-call table with at-most-once completion semantics
//! - Three destination kinds: direct endpoint, replica group, resolved URI
//! - A forwarding protocol with server-side redirects for pure clients
//! - Pluggable networks selected by header format and channel

pub mod addr;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod message;
pub mod net;
pub mod protocol;
pub mod resolver;
pub mod task;
pub mod worker;

pub use addr::{EndPoint, GroupAddress, HostAddr, UriAddress, MAX_CLIENT_PORT};
pub use config::{ClientNetConfig, EngineConfig, ServerNetConfig};
pub use dispatch::{HandlerFuture, RequestHandler};
pub use engine::{Intercepted, RequestInterceptor, RpcEngine};
pub use error::{ErrCode, Result, RpcError};
pub use matcher::{ResponseFuture, ResponseTask, TaskState, MATCHER_BUCKET_NR};
pub use message::{decode_body, encode_body, Gpid, Message, MessageHeader};
pub use net::{HeaderFormat, Network, NetworkBuilder, RpcChannel, Session};
pub use resolver::{PartitionResolver, ResolveResult, UriResolverManager};
pub use task::{GrpcMode, TaskCode, TaskSpec, TaskTuning};
