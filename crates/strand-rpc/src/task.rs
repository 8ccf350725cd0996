//! Task codes and per-code specs.
//!
//! A [`TaskCode`] is an interned integer identifier for a logical RPC
//! operation. Its [`TaskSpec`] carries the scheduling and transport defaults
//! for that operation (timeout, resend window, channel, header format,
//! group-call mode) plus the hook slots used for fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::net::{HeaderFormat, RpcChannel};

/// Monotonic milliseconds since process start. All deadline arithmetic in
/// the engine uses this clock, never wall time.
pub fn now_ms() -> u64 {
    static CLOCK: OnceLock<Instant> = OnceLock::new();
    CLOCK.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// How a group-addressed call selects its target member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrpcMode {
    /// Send to the group's recorded (or guessed) leader.
    ToLeader,
    /// Send to a uniformly random member.
    ToAny,
    /// Fan out to every member. Not implemented; calling it is a bug.
    ToAll,
}

impl GrpcMode {
    fn as_u8(self) -> u8 {
        match self {
            GrpcMode::ToLeader => 0,
            GrpcMode::ToAny => 1,
            GrpcMode::ToAll => 2,
        }
    }

    fn from_u8(v: u8) -> GrpcMode {
        match v {
            1 => GrpcMode::ToAny,
            2 => GrpcMode::ToAll,
            _ => GrpcMode::ToLeader,
        }
    }
}

/// Vetoing hook over a message; returning `false` drops it.
pub type MessageHook = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Observation hook fired when a request-execution task is created.
pub type TaskCreateHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Interned identifier for a logical RPC operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskCode(u32);

struct CodeRegistry {
    by_name: HashMap<&'static str, u32>,
    specs: Vec<Arc<TaskSpec>>,
}

fn registry() -> &'static RwLock<CodeRegistry> {
    static REGISTRY: OnceLock<RwLock<CodeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let invalid = Arc::new(TaskSpec::new(TaskCode(0), "TASK_CODE_INVALID"));
        RwLock::new(CodeRegistry {
            by_name: HashMap::new(),
            specs: vec![invalid],
        })
    })
}

impl TaskCode {
    /// The sentinel code carried by messages whose rpc name has not been
    /// resolved locally yet.
    pub const INVALID: TaskCode = TaskCode(0);

    /// Intern `name`, returning the existing code when already registered.
    pub fn register(name: &str) -> TaskCode {
        if let Some(code) = TaskCode::try_from_name(name) {
            return code;
        }
        let mut reg = registry().write().unwrap();
        if let Some(&idx) = reg.by_name.get(name) {
            return TaskCode(idx);
        }
        let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
        let idx = reg.specs.len() as u32;
        let code = TaskCode(idx);
        reg.by_name.insert(leaked, idx);
        reg.specs.push(Arc::new(TaskSpec::new(code, leaked)));
        code
    }

    /// Look up an already-registered code by name.
    pub fn try_from_name(name: &str) -> Option<TaskCode> {
        let reg = registry().read().unwrap();
        reg.by_name.get(name).map(|&idx| TaskCode(idx))
    }

    /// Canonical name of the code.
    pub fn name(self) -> &'static str {
        let reg = registry().read().unwrap();
        reg.specs[self.0 as usize].name
    }

    /// The spec carrying this code's defaults and hooks.
    pub fn spec(self) -> Arc<TaskSpec> {
        let reg = registry().read().unwrap();
        reg.specs[self.0 as usize].clone()
    }

    /// Whether this is the invalid sentinel.
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }

    /// Numeric value, as stamped into headers for diagnostics.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TaskCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// File-configurable per-code tuning, applied onto the [`TaskSpec`] at
/// engine start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTuning {
    /// Default caller timeout in milliseconds.
    pub rpc_timeout_ms: Option<i32>,
    /// Resend window; 0 disables resend.
    pub rpc_request_resend_timeout_ms: Option<i32>,
    /// Outbound channel for this code.
    pub rpc_call_channel: Option<RpcChannel>,
    /// Header format for this code.
    pub rpc_call_header_format: Option<HeaderFormat>,
    /// Group-call member selection.
    pub grpc_mode: Option<GrpcMode>,
}

/// Scheduling and transport defaults for one task code, plus hook slots.
///
/// All fields are interior-mutable so tests and tools can retune a code
/// after registration; reads are lock-free.
pub struct TaskSpec {
    code: TaskCode,
    name: &'static str,
    rpc_timeout_ms: AtomicI32,
    rpc_request_resend_timeout_ms: AtomicI32,
    rpc_call_channel: AtomicU8,
    rpc_call_header_format: AtomicU8,
    grpc_mode: AtomicU8,
    forward_supported: AtomicBool,
    on_rpc_call: RwLock<Option<MessageHook>>,
    on_rpc_reply: RwLock<Option<MessageHook>>,
    on_rpc_request_enqueue: RwLock<Option<MessageHook>>,
    on_rpc_response_enqueue: RwLock<Option<MessageHook>>,
    on_task_create: RwLock<Option<TaskCreateHook>>,
}

impl TaskSpec {
    fn new(code: TaskCode, name: &'static str) -> Self {
        TaskSpec {
            code,
            name,
            rpc_timeout_ms: AtomicI32::new(5000),
            rpc_request_resend_timeout_ms: AtomicI32::new(0),
            rpc_call_channel: AtomicU8::new(RpcChannel::Tcp.as_u8()),
            rpc_call_header_format: AtomicU8::new(HeaderFormat::Native.as_u8()),
            grpc_mode: AtomicU8::new(GrpcMode::ToLeader.as_u8()),
            forward_supported: AtomicBool::new(true),
            on_rpc_call: RwLock::new(None),
            on_rpc_reply: RwLock::new(None),
            on_rpc_request_enqueue: RwLock::new(None),
            on_rpc_response_enqueue: RwLock::new(None),
            on_task_create: RwLock::new(None),
        }
    }

    /// The owning code.
    pub fn code(&self) -> TaskCode {
        self.code
    }

    /// The code's canonical name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Default caller timeout in milliseconds.
    pub fn rpc_timeout_ms(&self) -> i32 {
        self.rpc_timeout_ms.load(Ordering::Relaxed)
    }

    /// Set the default caller timeout.
    pub fn set_rpc_timeout_ms(&self, v: i32) {
        self.rpc_timeout_ms.store(v, Ordering::Relaxed);
    }

    /// Resend window in milliseconds; 0 disables resend.
    pub fn resend_timeout_ms(&self) -> i32 {
        self.rpc_request_resend_timeout_ms.load(Ordering::Relaxed)
    }

    /// Set the resend window.
    pub fn set_resend_timeout_ms(&self, v: i32) {
        self.rpc_request_resend_timeout_ms.store(v, Ordering::Relaxed);
    }

    /// Outbound channel used by calls of this code.
    pub fn rpc_call_channel(&self) -> RpcChannel {
        RpcChannel::from_u8(self.rpc_call_channel.load(Ordering::Relaxed))
    }

    /// Set the outbound channel.
    pub fn set_rpc_call_channel(&self, c: RpcChannel) {
        self.rpc_call_channel.store(c.as_u8(), Ordering::Relaxed);
    }

    /// Header format used by calls of this code.
    pub fn rpc_call_header_format(&self) -> HeaderFormat {
        HeaderFormat::from_u8(self.rpc_call_header_format.load(Ordering::Relaxed))
    }

    /// Set the header format.
    pub fn set_rpc_call_header_format(&self, f: HeaderFormat) {
        self.rpc_call_header_format.store(f.as_u8(), Ordering::Relaxed);
    }

    /// Group-call member selection mode.
    pub fn grpc_mode(&self) -> GrpcMode {
        GrpcMode::from_u8(self.grpc_mode.load(Ordering::Relaxed))
    }

    /// Set the group-call mode.
    pub fn set_grpc_mode(&self, m: GrpcMode) {
        self.grpc_mode.store(m.as_u8(), Ordering::Relaxed);
    }

    /// Whether requests of this code may be forwarded between servers.
    pub fn is_forward_supported(&self) -> bool {
        self.forward_supported.load(Ordering::Relaxed)
    }

    /// Set the forwarding policy.
    pub fn set_forward_supported(&self, v: bool) {
        self.forward_supported.store(v, Ordering::Relaxed);
    }

    /// Apply file-configured tuning.
    pub fn apply(&self, tuning: &TaskTuning) {
        if let Some(v) = tuning.rpc_timeout_ms {
            self.set_rpc_timeout_ms(v);
        }
        if let Some(v) = tuning.rpc_request_resend_timeout_ms {
            self.set_resend_timeout_ms(v);
        }
        if let Some(v) = tuning.rpc_call_channel {
            self.set_rpc_call_channel(v);
        }
        if let Some(v) = tuning.rpc_call_header_format {
            self.set_rpc_call_header_format(v);
        }
        if let Some(v) = tuning.grpc_mode {
            self.set_grpc_mode(v);
        }
    }

    /// Install (or clear) the outbound-call veto hook.
    pub fn set_rpc_call_hook(&self, hook: Option<MessageHook>) {
        *self.on_rpc_call.write().unwrap() = hook;
    }

    /// Install (or clear) the server-reply veto hook.
    pub fn set_rpc_reply_hook(&self, hook: Option<MessageHook>) {
        *self.on_rpc_reply.write().unwrap() = hook;
    }

    /// Install (or clear) the inbound request-enqueue veto hook.
    pub fn set_rpc_request_enqueue_hook(&self, hook: Option<MessageHook>) {
        *self.on_rpc_request_enqueue.write().unwrap() = hook;
    }

    /// Install (or clear) the client-side response-delivery veto hook.
    pub fn set_rpc_response_enqueue_hook(&self, hook: Option<MessageHook>) {
        *self.on_rpc_response_enqueue.write().unwrap() = hook;
    }

    /// Install (or clear) the task-creation observer.
    pub fn set_task_create_hook(&self, hook: Option<TaskCreateHook>) {
        *self.on_task_create.write().unwrap() = hook;
    }

    /// Run the outbound-call hook; `true` means "let the message through".
    pub fn rpc_call_allowed(&self, msg: &Message) -> bool {
        match self.on_rpc_call.read().unwrap().as_ref() {
            Some(hook) => hook(msg),
            None => true,
        }
    }

    /// Run the server-reply hook.
    pub fn rpc_reply_allowed(&self, msg: &Message) -> bool {
        match self.on_rpc_reply.read().unwrap().as_ref() {
            Some(hook) => hook(msg),
            None => true,
        }
    }

    /// Run the inbound request-enqueue hook.
    pub fn rpc_request_enqueue_allowed(&self, msg: &Message) -> bool {
        match self.on_rpc_request_enqueue.read().unwrap().as_ref() {
            Some(hook) => hook(msg),
            None => true,
        }
    }

    /// Run the client-side response-delivery hook.
    pub fn rpc_response_enqueue_allowed(&self, msg: &Message) -> bool {
        match self.on_rpc_response_enqueue.read().unwrap().as_ref() {
            Some(hook) => hook(msg),
            None => true,
        }
    }

    /// Fire the task-creation observer.
    pub fn notify_task_create(&self, msg: &Message) {
        if let Some(hook) = self.on_task_create.read().unwrap().as_ref() {
            hook(msg);
        }
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("code", &self.name)
            .field("rpc_timeout_ms", &self.rpc_timeout_ms())
            .field("resend_timeout_ms", &self.resend_timeout_ms())
            .field("channel", &self.rpc_call_channel())
            .field("grpc_mode", &self.grpc_mode())
            .finish()
    }
}
