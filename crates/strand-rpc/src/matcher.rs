//! The pending-call table: matches inbound replies to in-flight requests
//! and realizes timeouts and resends.
//!
//! Entries are sharded by request id across independently locked buckets.
//! For any id, exactly one of reply delivery and timeout delivery completes
//! the caller's response task; the loser finds the entry gone and becomes a
//! no-op. Shard locks are held only across map operations; no completion
//! or send runs under them.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::addr::{EndPoint, HostAddr};
use crate::engine::{Outbound, RpcEngine};
use crate::error::ErrCode;
use crate::message::{decode_body, Message};
use crate::net::Network;
use crate::task::{now_ms, GrpcMode};

/// Number of independently locked shards in the pending-call table.
pub const MATCHER_BUCKET_NR: usize = 13;

/// Lifecycle state of a response task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a completion; resends may be armed.
    Ready,
    /// Completed exactly once with an error and optional reply.
    Finished,
    /// Cancelled by the caller; completions are discarded.
    Cancelled,
}

const STATE_READY: u8 = 0;
const STATE_FINISHED: u8 = 1;
const STATE_CANCELLED: u8 = 2;

/// The caller-side handle for one in-flight request.
///
/// Owns the canonical request message: matcher resends and redirects read
/// and mutate it, and each transmission clones a wire copy from it. The
/// task completes exactly once; late completions are discarded.
pub struct ResponseTask {
    state: AtomicU8,
    request: Mutex<Message>,
    sender: Mutex<Option<oneshot::Sender<(ErrCode, Option<Message>)>>>,
}

impl ResponseTask {
    /// Wrap a request into a task plus the future its caller awaits.
    pub fn new(request: Message) -> (Arc<ResponseTask>, ResponseFuture) {
        let (tx, rx) = oneshot::channel();
        let task = Arc::new(ResponseTask {
            state: AtomicU8::new(STATE_READY),
            request: Mutex::new(request),
            sender: Mutex::new(Some(tx)),
        });
        (task, ResponseFuture { rx })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            STATE_FINISHED => TaskState::Finished,
            STATE_CANCELLED => TaskState::Cancelled,
            _ => TaskState::Ready,
        }
    }

    /// Cancel the call. The matcher will not resend a cancelled task, and
    /// any completion that still races in is discarded.
    pub fn cancel(&self) {
        let _ = self.state.compare_exchange(
            STATE_READY,
            STATE_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Snapshot the canonical request.
    pub fn request(&self) -> Message {
        self.request.lock().unwrap().clone()
    }

    /// Run `f` over the canonical request under its lock.
    pub(crate) fn with_request<R>(&self, f: impl FnOnce(&mut Message) -> R) -> R {
        f(&mut self.request.lock().unwrap())
    }

    /// Complete the task. `delay_ms > 0` defers delivery, so injected
    /// failures keep natural timing. Completing a finished or cancelled
    /// task is a no-op.
    pub(crate) fn complete(&self, err: ErrCode, reply: Option<Message>, delay_ms: u64) {
        if self
            .state
            .compare_exchange(STATE_READY, STATE_FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(tx) = self.sender.lock().unwrap().take() else {
            return;
        };
        if delay_ms == 0 {
            let _ = tx.send((err, reply));
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let _ = tx.send((err, reply));
            });
        }
    }
}

impl std::fmt::Debug for ResponseTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseTask")
            .field("state", &self.state())
            .finish()
    }
}

/// Awaits the completion of one call.
pub struct ResponseFuture {
    rx: oneshot::Receiver<(ErrCode, Option<Message>)>,
}

impl ResponseFuture {
    /// Wait for the call to complete. When the engine drops the call
    /// without completing it (cancellation or shutdown) this yields
    /// `NetworkFailure` with no reply.
    pub async fn wait(self) -> (ErrCode, Option<Message>) {
        match self.rx.await {
            Ok(done) => done,
            Err(_) => (ErrCode::NetworkFailure, None),
        }
    }
}

struct MatchEntry {
    task: Arc<ResponseTask>,
    timer: JoinHandle<()>,
    /// Absolute resend deadline in monotonic ms; 0 means resend disabled.
    deadline_ms: u64,
}

/// Sharded table of in-flight requests.
pub struct ClientMatcher {
    buckets: [Mutex<HashMap<u64, MatchEntry>>; MATCHER_BUCKET_NR],
}

impl ClientMatcher {
    pub(crate) fn new() -> Self {
        ClientMatcher {
            buckets: std::array::from_fn(|_| Mutex::new(HashMap::new())),
        }
    }

    fn bucket(&self, id: u64) -> &Mutex<HashMap<u64, MatchEntry>> {
        &self.buckets[(id % MATCHER_BUCKET_NR as u64) as usize]
    }

    /// Total number of in-flight entries.
    pub fn pending_count(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().unwrap().len()).sum()
    }

    #[cfg(test)]
    pub(crate) fn entry_deadline(&self, id: u64) -> Option<u64> {
        self.bucket(id).lock().unwrap().get(&id).map(|e| e.deadline_ms)
    }

    fn spawn_timer(&self, engine: &RpcEngine, id: u64, delay_ms: u64) -> JoinHandle<()> {
        let weak = engine.weak();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(engine) = weak.upgrade() {
                engine.on_request_timeout(id);
            }
        })
    }

    /// Register an outbound request and arm its timeout.
    ///
    /// When the code's resend window is shorter than the caller budget, the
    /// armed timer covers only the window and the entry remembers the full
    /// deadline; otherwise the timer covers the whole budget. Registering
    /// an id that is already in flight is a programming error.
    pub(crate) fn register(&self, engine: &RpcEngine, task: &Arc<ResponseTask>) {
        let (id, timeout_ms, spec) = task.with_request(|req| {
            (
                req.header.id,
                req.header.client.timeout_ms,
                req.local_code.spec(),
            )
        });
        let resend_ms = spec.resend_timeout_ms();
        let (arm_ms, deadline_ms) = if resend_ms > 0 && timeout_ms > resend_ms {
            (resend_ms as u64, now_ms() + timeout_ms.max(0) as u64)
        } else {
            (timeout_ms.max(0) as u64, 0)
        };

        let timer = self.spawn_timer(engine, id, arm_ms);
        let mut bucket = self.bucket(id).lock().unwrap();
        let prev = bucket.insert(
            id,
            MatchEntry {
                task: task.clone(),
                timer,
                deadline_ms,
            },
        );
        assert!(prev.is_none(), "request id {id} is already in flight");
    }

    /// Match an inbound reply (or a terminal network failure when `reply`
    /// is `None`) to its pending entry. Returns `false` when the id is
    /// unknown — already timed out, cancelled, or never registered — in
    /// which case the reply is discarded.
    pub(crate) fn on_reply(
        &self,
        engine: &RpcEngine,
        net: &dyn Network,
        id: u64,
        reply: Option<Message>,
        delay_ms: u64,
    ) -> bool {
        let entry = self.bucket(id).lock().unwrap().remove(&id);
        let Some(entry) = entry else {
            if let Some(reply) = reply {
                debug!(
                    id,
                    rpc = %reply.header.rpc_name,
                    "reply for unknown request id dropped"
                );
            }
            return false;
        };
        entry.timer.abort();
        let task = entry.task;
        let spec = task.with_request(|req| req.local_code.spec());

        let Some(reply) = reply else {
            // terminal network failure: give up on the recorded leader
            task.with_request(|req| {
                if let HostAddr::Group(group) = &req.server_addr {
                    if spec.grpc_mode() == GrpcMode::ToLeader
                        && group.is_update_leader_automatically()
                    {
                        group.leader_forward();
                    }
                }
            });
            task.complete(ErrCode::NetworkFailure, None, delay_ms);
            return true;
        };

        let err = reply.error();
        if err == ErrCode::ForwardToOthers {
            let new_addr: EndPoint = match decode_body(&reply.body) {
                Ok(ep) => ep,
                Err(e) => {
                    warn!(
                        id,
                        error = %e,
                        trace_id = format_args!("{:016x}", reply.header.trace_id),
                        "redirect reply carried an undecodable endpoint"
                    );
                    task.complete(ErrCode::NetworkFailure, None, delay_ms);
                    return true;
                }
            };
            task.with_request(|req| {
                if let HostAddr::Group(group) = &req.server_addr {
                    if spec.grpc_mode() == GrpcMode::ToLeader
                        && group.is_update_leader_automatically()
                    {
                        group.set_leader(new_addr);
                    }
                }
            });
            debug!(
                id,
                to = %new_addr,
                trace_id = format_args!("{:016x}", reply.header.trace_id),
                "following server redirect"
            );
            // the reissue registers a fresh entry under a fresh id
            engine.call_ip(new_addr, Outbound::Tracked(task), true, false);
            return true;
        }

        if reply.header.context.is_forwarded && err == ErrCode::Ok {
            let from = reply.header.from_addr;
            task.with_request(|req| {
                if let HostAddr::Group(group) = &req.server_addr {
                    if spec.grpc_mode() == GrpcMode::ToLeader
                        && group.is_update_leader_automatically()
                    {
                        group.set_leader(from);
                    }
                }
            });
        }

        if spec.rpc_response_enqueue_allowed(&reply) {
            task.complete(err, Some(reply), delay_ms);
        } else {
            debug!(
                rpc = %reply.header.rpc_name,
                trace_id = format_args!("{:016x}", reply.header.trace_id),
                "rpc reply dropped (fault injection)"
            );
            let timeout_ms = task.with_request(|req| req.header.client.timeout_ms);
            net.inject_drop(reply, false);
            // keep the veto indistinguishable from loss: the caller still
            // observes a naturally timed timeout
            task.complete(ErrCode::Timeout, None, timeout_ms.max(0) as u64);
        }
        true
    }

    /// Timeout delivery. Two-phase so resend work runs outside the shard
    /// lock: phase one classifies the entry, the resend decision and the
    /// fresh timer are prepared unlocked, and phase two re-verifies the
    /// entry before committing — a reply landing between the phases wins.
    pub(crate) fn on_timeout(&self, engine: &RpcEngine, id: u64) {
        enum Phase1 {
            Gone,
            Expired(Arc<ResponseTask>),
            Pending(Arc<ResponseTask>, u64),
        }

        let phase1 = {
            let mut bucket = self.bucket(id).lock().unwrap();
            match bucket.entry(id) {
                Entry::Vacant(_) => Phase1::Gone,
                Entry::Occupied(occ) if occ.get().deadline_ms == 0 => {
                    Phase1::Expired(occ.remove().task)
                }
                Entry::Occupied(occ) => {
                    Phase1::Pending(occ.get().task.clone(), occ.get().deadline_ms)
                }
            }
        };

        let (task, deadline_ms) = match phase1 {
            Phase1::Gone => return,
            Phase1::Expired(task) => {
                task.complete(ErrCode::Timeout, None, 0);
                return;
            }
            Phase1::Pending(task, deadline_ms) => (task, deadline_ms),
        };

        let now = now_ms();
        let mut resend = now < deadline_ms && task.state() == TaskState::Ready;
        let mut new_timer = if resend {
            let spec = task.with_request(|req| req.local_code.spec());
            let arm_ms = (spec.resend_timeout_ms().max(0) as u64).min(deadline_ms - now);
            Some(self.spawn_timer(engine, id, arm_ms))
        } else {
            None
        };

        let mut expired: Option<Arc<ResponseTask>> = None;
        {
            let mut bucket = self.bucket(id).lock().unwrap();
            match bucket.entry(id) {
                Entry::Occupied(mut occ) => {
                    if let Some(timer) = new_timer.take() {
                        occ.get_mut().timer = timer;
                    } else {
                        expired = Some(occ.remove().task);
                    }
                }
                Entry::Vacant(_) => {
                    // a reply arrived between the phases and already
                    // completed the task
                    resend = false;
                }
            }
        }
        if let Some(timer) = new_timer.take() {
            timer.abort();
        }
        if let Some(task) = expired {
            task.complete(ErrCode::Timeout, None, 0);
            return;
        }
        if !resend {
            return;
        }

        // resend outside the lock, reusing the same request id so the
        // registered entry still captures whichever reply arrives first
        let wire = task.request();
        debug!(
            id,
            trace_id = format_args!("{:016x}", wire.header.trace_id),
            "resending request"
        );
        let to = wire.header.to_addr;
        engine.call_ip(to, Outbound::Untracked(wire), false, false);
    }
}

impl Drop for ClientMatcher {
    fn drop(&mut self) {
        for bucket in &self.buckets {
            for (_, entry) in bucket.lock().unwrap().drain() {
                entry.timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_response_task_completes_once() {
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_ONCE");
        let (task, fut) = ResponseTask::new(Message::request(code));
        task.complete(ErrCode::Ok, None, 0);
        task.complete(ErrCode::Timeout, None, 0);
        let (err, reply) = fut.wait().await;
        assert_eq!(err, ErrCode::Ok);
        assert!(reply.is_none());
        assert_eq!(task.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn test_cancelled_task_discards_completion() {
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_CANCEL");
        let (task, fut) = ResponseTask::new(Message::request(code));
        task.cancel();
        assert_eq!(task.state(), TaskState::Cancelled);
        task.complete(ErrCode::Ok, None, 0);
        drop(task);
        let (err, _) = fut.wait().await;
        assert_eq!(err, ErrCode::NetworkFailure);
    }

    #[tokio::test]
    async fn test_delayed_completion_arrives_later() {
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_DELAY");
        let (task, fut) = ResponseTask::new(Message::request(code));
        let started = std::time::Instant::now();
        task.complete(ErrCode::Ok, None, 30);
        let (err, _) = fut.wait().await;
        assert_eq!(err, ErrCode::Ok);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    fn test_engine() -> Arc<RpcEngine> {
        crate::engine::RpcEngine::new(crate::config::EngineConfig::default())
    }

    fn test_net() -> Arc<dyn Network> {
        crate::net::sim::SimNetwork::create(&crate::net::NetworkContext {
            engine: std::sync::Weak::new(),
            channel: crate::net::RpcChannel::Tcp,
            header_format: crate::net::HeaderFormat::Native,
            buffer_block_size: 65536,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_synthetic_reply_completes_exactly_once() {
        let engine = test_engine();
        let net = test_net();
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_SYNTHETIC");

        let request = Message::request(code).with_timeout_ms(5000);
        let id = request.header.id;
        let reply = request.create_response();
        let (task, fut) = ResponseTask::new(request);

        engine.matcher().register(&engine, &task);
        assert_eq!(engine.matcher().pending_count(), 1);

        assert!(engine.matcher().on_reply(&engine, &*net, id, Some(reply), 0));
        let (err, msg) = fut.wait().await;
        assert_eq!(err, ErrCode::Ok);
        assert!(msg.is_some());
        assert_eq!(engine.matcher().pending_count(), 0);

        // a second arrival for the same id is an unknown-id no-op
        let late = Message::request(code).create_response();
        assert!(!engine.matcher().on_reply(&engine, &*net, id, Some(late), 0));
    }

    #[tokio::test]
    async fn test_timeout_without_resend_window_completes_timeout() {
        let engine = test_engine();
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_PLAIN_TIMEOUT");

        let request = Message::request(code).with_timeout_ms(5000);
        let id = request.header.id;
        let (task, fut) = ResponseTask::new(request);
        engine.matcher().register(&engine, &task);
        assert_eq!(engine.matcher().entry_deadline(id), Some(0));

        engine.matcher().on_timeout(&engine, id);
        let (err, msg) = fut.wait().await;
        assert_eq!(err, ErrCode::Timeout);
        assert!(msg.is_none());
        assert_eq!(engine.matcher().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_resend_window_wider_than_budget_disables_resend() {
        let engine = test_engine();
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_WIDE_WINDOW");
        code.spec().set_resend_timeout_ms(300);

        // window exceeds the budget: deadline must stay zero
        let request = Message::request(code).with_timeout_ms(100);
        let id = request.header.id;
        let (task, _fut) = ResponseTask::new(request);
        engine.matcher().register(&engine, &task);
        assert_eq!(engine.matcher().entry_deadline(id), Some(0));

        // budget exceeds the window: a real deadline is recorded
        let request = Message::request(code).with_timeout_ms(5000);
        let id2 = request.header.id;
        let (task2, _fut2) = ResponseTask::new(request);
        engine.matcher().register(&engine, &task2);
        assert!(engine.matcher().entry_deadline(id2).unwrap() > 0);
    }

    #[tokio::test]
    async fn test_cancelled_task_is_not_resent() {
        let engine = test_engine();
        let net = test_net();
        let code = crate::task::TaskCode::register("RPC_MATCHER_TEST_NO_RESEND_CANCELLED");
        code.spec().set_resend_timeout_ms(300);

        let request = Message::request(code).with_timeout_ms(5000);
        let id = request.header.id;
        let (task, _fut) = ResponseTask::new(request);
        engine.matcher().register(&engine, &task);
        task.cancel();

        // the fire finds the task out of Ready and abandons the entry
        engine.matcher().on_timeout(&engine, id);
        assert_eq!(engine.matcher().pending_count(), 0);
        assert!(!engine.matcher().on_reply(&engine, &*net, id, None, 0));
    }
}
