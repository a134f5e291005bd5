//! An in-process simulated completion queue and responder set, used by this
//! crate's own test suite in place of a real gRPC C-core binding.
//!
//! [`SimCompletionQueue`] is the real piece: a condvar-backed tag queue
//! implementing [`RpcCompletionQueue`] with the same shutdown-drains-
//! outstanding-tags contract a production binding must honor. Everything
//! below it (the unary/client-streaming/bidi-streaming call pairs,
//! [`SimAlarm`]) exists only to give that queue something realistic to
//! deliver tags for -- each models one RPC shape's client and server
//! handles sharing an in-process pipe instead of a wire.
//!
//! Server-streaming is covered by the trait definitions in
//! [`crate::rpc`] but has no `Sim*` implementation here: none of this
//! crate's own end-to-end scenarios exercise it, and a fourth near-
//! identical pipe pairing would not teach anything the other three don't
//! already cover.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use super::{
    new_read_slot, Alarm, BidiStreamingCall, BidiStreamingResponder, ClientStreamingCall,
    ClientStreamingResponder, CompletionEvent, Deadline, ReadSlot, Responder, RpcCompletionQueue,
    RpcStatus, ServerRpcCompletionQueue, StatusSlot, Tag, UnaryCall, UnaryResponder, UnaryResult,
    WriteOptions,
};

type ShutdownHook = Box<dyn FnOnce() + Send>;

struct SimState {
    ready: VecDeque<(Tag, bool)>,
    shutting_down: bool,
    interrupted: bool,
    hooks: Vec<ShutdownHook>,
}

/// An in-process completion queue: a condvar-guarded tag queue that
/// otherwise behaves like a real gRPC completion queue (`next`/`shutdown`
/// semantics, an idempotent wakeup distinct from any real tag).
pub struct SimCompletionQueue {
    inner: Mutex<SimState>,
    condvar: Condvar,
}

impl SimCompletionQueue {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SimState {
                ready: VecDeque::new(),
                shutting_down: false,
                interrupted: false,
                hooks: Vec::new(),
            }),
            condvar: Condvar::new(),
        })
    }

    /// Deliver `tag` the next time `next` is called.
    pub(crate) fn post(&self, tag: Tag, ok: bool) {
        let mut guard = self.inner.lock().unwrap();
        guard.ready.push_back((tag, ok));
        drop(guard);
        self.condvar.notify_all();
    }

    /// Register a closure to run exactly once, at `shutdown` time, if the
    /// queue has not already started shutting down. Returns `false` (and
    /// does not retain `hook`) if shutdown has already begun, so the
    /// caller can run its own shutdown-path logic immediately instead.
    pub(crate) fn add_shutdown_hook(&self, hook: ShutdownHook) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.shutting_down {
            false
        } else {
            guard.hooks.push(hook);
            true
        }
    }
}

impl RpcCompletionQueue for SimCompletionQueue {
    fn next(&self, deadline: Deadline) -> CompletionEvent {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some((tag, ok)) = guard.ready.pop_front() {
                return CompletionEvent::Tag { tag, ok };
            }
            if guard.interrupted {
                guard.interrupted = false;
                return CompletionEvent::Timeout;
            }
            if guard.shutting_down {
                return CompletionEvent::Shutdown;
            }
            match deadline {
                Deadline::Now => return CompletionEvent::Timeout,
                Deadline::Infinite => {
                    guard = self.condvar.wait(guard).unwrap();
                }
                Deadline::At(instant) => {
                    let now = Instant::now();
                    if instant <= now {
                        return CompletionEvent::Timeout;
                    }
                    let (g, _timeout) = self.condvar.wait_timeout(guard, instant - now).unwrap();
                    guard = g;
                }
            }
        }
    }

    fn shutdown(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.shutting_down = true;
        let hooks = std::mem::take(&mut guard.hooks);
        drop(guard);
        for hook in hooks {
            hook();
        }
        self.condvar.notify_all();
    }

    fn interrupt(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.interrupted = true;
        drop(guard);
        self.condvar.notify_all();
    }
}

impl ServerRpcCompletionQueue for SimCompletionQueue {}

/// A cancellable, deadline-scheduled alarm backed by a background thread.
///
/// Three things race to post the outstanding tag: the deadline elapsing, an
/// explicit [`cancel`](Alarm::cancel), or the owning [`SimCompletionQueue`]
/// shutting down -- `posted` guards so only the first of them actually
/// delivers the tag, matching gRPC's own `Alarm::Cancel`, which posts the
/// tag with `ok = false` immediately rather than waiting for the deadline.
pub struct SimAlarm {
    cq: Arc<SimCompletionQueue>,
    outstanding: Option<(Tag, Arc<AtomicBool>)>,
}

impl SimAlarm {
    #[must_use]
    pub fn new(cq: Arc<SimCompletionQueue>) -> Self {
        Self { cq, outstanding: None }
    }
}

impl Alarm for SimAlarm {
    fn set(&mut self, _cq: &dyn RpcCompletionQueue, deadline: Instant, tag: Tag) {
        let cq = Arc::clone(&self.cq);
        let posted = Arc::new(AtomicBool::new(false));
        self.outstanding = Some((tag, Arc::clone(&posted)));

        let posted_for_hook = Arc::clone(&posted);
        let cq_for_hook = Arc::clone(&cq);
        let registered = self.cq.add_shutdown_hook(Box::new(move || {
            if !posted_for_hook.swap(true, Ordering::SeqCst) {
                cq_for_hook.post(tag, false);
            }
        }));
        if !registered {
            cq.post(tag, false);
            return;
        }

        std::thread::spawn(move || {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            if !posted.swap(true, Ordering::SeqCst) {
                cq.post(tag, true);
            }
        });
    }

    fn cancel(&mut self) {
        if let Some((tag, posted)) = self.outstanding.take() {
            if !posted.swap(true, Ordering::SeqCst) {
                self.cq.post(tag, false);
            }
        }
    }
}

/// A single-producer, single-consumer in-process pipe of `T` values, with
/// completion-queue-tag-shaped reads: a `read` either delivers immediately
/// (an item is queued, or the pipe is closed) or remembers the tag and
/// posts it later, from whichever of `push`/`close`/queue-shutdown happens
/// first.
struct SimPipe<T> {
    cq: Arc<SimCompletionQueue>,
    state: Mutex<PipeState<T>>,
}

struct PipeState<T> {
    queue: VecDeque<T>,
    closed: bool,
    waiting: Option<(ReadSlot<T>, Tag)>,
}

impl<T: Send + 'static> SimPipe<T> {
    fn new(cq: Arc<SimCompletionQueue>) -> Arc<Self> {
        Arc::new(Self {
            cq,
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                closed: false,
                waiting: None,
            }),
        })
    }

    fn push(&self, item: T) {
        let mut guard = self.state.lock().unwrap();
        if let Some((slot, tag)) = guard.waiting.take() {
            drop(guard);
            *slot.lock().unwrap() = Some(item);
            self.cq.post(tag, true);
        } else {
            guard.queue.push_back(item);
        }
    }

    fn close(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.closed = true;
        drop(guard);
        self.fail_waiting();
    }

    /// If a reader is waiting, post its tag with `ok = false` and drop it.
    /// No-op if nobody is waiting (including: somebody already resolved
    /// the wait another way).
    fn fail_waiting(&self) {
        let mut guard = self.state.lock().unwrap();
        if let Some((_, tag)) = guard.waiting.take() {
            drop(guard);
            self.cq.post(tag, false);
        }
    }

    fn read(self: &Arc<Self>, tag: Tag) -> ReadSlot<T> {
        let slot = new_read_slot();
        let mut guard = self.state.lock().unwrap();
        if let Some(item) = guard.queue.pop_front() {
            drop(guard);
            *slot.lock().unwrap() = Some(item);
            self.cq.post(tag, true);
            return slot;
        }
        if guard.closed {
            drop(guard);
            self.cq.post(tag, false);
            return slot;
        }
        guard.waiting = Some((Arc::clone(&slot), tag));
        drop(guard);

        let this = Arc::clone(self);
        let registered = self.cq.add_shutdown_hook(Box::new(move || this.fail_waiting()));
        if !registered {
            self.fail_waiting();
        }
        slot
    }
}

// ---- Unary ----

/// Simulated unary service: the client provides the whole request up
/// front (mirroring gRPC's unary call, which sends the request as part of
/// starting the call), the server accepts it and replies once.
pub struct SimUnaryService<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    accepts: Arc<SimPipe<SimUnaryAccept<Req, Resp>>>,
}

/// One accepted unary call: the request message plus the responder used
/// to reply to it. Plays the role of [`crate::rpc::repeated_request::RepeatedRequestContext`]
/// for this RPC shape.
pub struct SimUnaryAccept<Req, Resp> {
    pub request: Req,
    pub responder: SimUnaryResponder<Resp>,
}

impl<Req, Resp> SimUnaryService<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    #[must_use]
    pub fn new(cq: Arc<SimCompletionQueue>) -> Self {
        Self {
            accepts: SimPipe::new(Arc::clone(&cq)),
            cq,
        }
    }

    /// Client-side: start a unary call.
    #[must_use]
    pub fn call(&self, request: Req) -> SimUnaryClientCall<Resp> {
        let result = SimPipe::new(Arc::clone(&self.cq));
        let responder = SimUnaryResponder {
            cq: Arc::clone(&self.cq),
            result: Arc::clone(&result),
        };
        self.accepts.push(SimUnaryAccept { request, responder });
        SimUnaryClientCall { result }
    }

    /// Server-side: post an accept tag, the `request` primitive's target
    /// for this service.
    #[must_use]
    pub fn request_call(&self, tag: Tag) -> ReadSlot<SimUnaryAccept<Req, Resp>> {
        self.accepts.read(tag)
    }
}

pub struct SimUnaryClientCall<Resp> {
    result: Arc<SimPipe<(Resp, RpcStatus)>>,
}

impl<Resp: Send + 'static> UnaryCall<Resp> for SimUnaryClientCall<Resp> {
    fn finish(&mut self, tag: Tag) -> UnaryResult<Resp> {
        self.result.read(tag)
    }
}

pub struct SimUnaryResponder<Resp> {
    cq: Arc<SimCompletionQueue>,
    result: Arc<SimPipe<(Resp, RpcStatus)>>,
}

impl<Resp: Send + 'static> Responder for SimUnaryResponder<Resp> {
    fn send_initial_metadata(&mut self, tag: Tag) {
        self.cq.post(tag, true);
    }
}

impl<Resp> UnaryResponder<Resp> for SimUnaryResponder<Resp>
where
    Resp: Default + Send + 'static,
{
    fn finish(&mut self, response: Resp, status: RpcStatus, tag: Tag) {
        self.result.push((response, status));
        self.cq.post(tag, true);
    }

    fn finish_with_error(&mut self, status: RpcStatus, tag: Tag) {
        self.result.push((Resp::default(), status));
        self.cq.post(tag, true);
    }
}

// ---- Client streaming ----

/// Simulated client-streaming service: the server accepts the call first
/// (no initial request message), then reads messages as the client writes
/// them.
pub struct SimClientStreamingService<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    accepts: Arc<SimPipe<SimClientStreamingResponder<Req, Resp>>>,
}

impl<Req, Resp> SimClientStreamingService<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    #[must_use]
    pub fn new(cq: Arc<SimCompletionQueue>) -> Self {
        Self {
            accepts: SimPipe::new(Arc::clone(&cq)),
            cq,
        }
    }

    #[must_use]
    pub fn call(&self) -> SimClientStreamingClientCall<Req, Resp> {
        let requests = SimPipe::new(Arc::clone(&self.cq));
        let result = SimPipe::new(Arc::clone(&self.cq));
        let responder = SimClientStreamingResponder {
            cq: Arc::clone(&self.cq),
            requests: Arc::clone(&requests),
            result: Arc::clone(&result),
        };
        self.accepts.push(responder);
        SimClientStreamingClientCall {
            cq: Arc::clone(&self.cq),
            requests,
            result,
        }
    }

    #[must_use]
    pub fn request_call(&self, tag: Tag) -> ReadSlot<SimClientStreamingResponder<Req, Resp>> {
        self.accepts.read(tag)
    }
}

pub struct SimClientStreamingClientCall<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    requests: Arc<SimPipe<Req>>,
    result: Arc<SimPipe<(Resp, RpcStatus)>>,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> for SimClientStreamingClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn write(&mut self, request: Req, _options: WriteOptions, tag: Tag) {
        self.requests.push(request);
        self.cq.post(tag, true);
    }

    fn writes_done(&mut self, tag: Tag) {
        self.requests.close();
        self.cq.post(tag, true);
    }

    fn finish(&mut self, tag: Tag) -> UnaryResult<Resp> {
        self.result.read(tag)
    }
}

pub struct SimClientStreamingResponder<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    requests: Arc<SimPipe<Req>>,
    result: Arc<SimPipe<(Resp, RpcStatus)>>,
}

impl<Req, Resp> Responder for SimClientStreamingResponder<Req, Resp> {
    fn send_initial_metadata(&mut self, tag: Tag) {
        self.cq.post(tag, true);
    }
}

impl<Req, Resp> ClientStreamingResponder<Req, Resp> for SimClientStreamingResponder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Default + Send + 'static,
{
    fn read(&mut self, tag: Tag) -> ReadSlot<Req> {
        self.requests.read(tag)
    }

    fn finish(&mut self, response: Resp, status: RpcStatus, tag: Tag) {
        self.result.push((response, status));
        self.cq.post(tag, true);
    }

    fn finish_with_error(&mut self, status: RpcStatus, tag: Tag) {
        self.result.push((Resp::default(), status));
        self.cq.post(tag, true);
    }
}

// ---- Bidirectional streaming ----

/// Simulated bidirectional-streaming service: two independent pipes
/// (client-to-server requests, server-to-client responses) plus a
/// server-to-client status pipe for the final `finish`.
pub struct SimBidiService<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    accepts: Arc<SimPipe<SimBidiResponder<Req, Resp>>>,
}

impl<Req, Resp> SimBidiService<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    #[must_use]
    pub fn new(cq: Arc<SimCompletionQueue>) -> Self {
        Self {
            accepts: SimPipe::new(Arc::clone(&cq)),
            cq,
        }
    }

    #[must_use]
    pub fn call(&self) -> SimBidiClientCall<Req, Resp> {
        let requests = SimPipe::new(Arc::clone(&self.cq));
        let responses = SimPipe::new(Arc::clone(&self.cq));
        let status = SimPipe::new(Arc::clone(&self.cq));
        let responder = SimBidiResponder {
            cq: Arc::clone(&self.cq),
            requests: Arc::clone(&requests),
            responses: Arc::clone(&responses),
            status: Arc::clone(&status),
        };
        self.accepts.push(responder);
        SimBidiClientCall {
            cq: Arc::clone(&self.cq),
            requests,
            responses,
            status,
        }
    }

    #[must_use]
    pub fn request_call(&self, tag: Tag) -> ReadSlot<SimBidiResponder<Req, Resp>> {
        self.accepts.read(tag)
    }
}

pub struct SimBidiClientCall<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    requests: Arc<SimPipe<Req>>,
    responses: Arc<SimPipe<Resp>>,
    status: Arc<SimPipe<RpcStatus>>,
}

impl<Req, Resp> BidiStreamingCall<Req, Resp> for SimBidiClientCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn read(&mut self, tag: Tag) -> ReadSlot<Resp> {
        self.responses.read(tag)
    }

    fn write(&mut self, request: Req, _options: WriteOptions, tag: Tag) {
        self.requests.push(request);
        self.cq.post(tag, true);
    }

    fn writes_done(&mut self, tag: Tag) {
        self.requests.close();
        self.cq.post(tag, true);
    }

    fn finish(&mut self, tag: Tag) -> StatusSlot {
        self.status.read(tag)
    }
}

pub struct SimBidiResponder<Req, Resp> {
    cq: Arc<SimCompletionQueue>,
    requests: Arc<SimPipe<Req>>,
    responses: Arc<SimPipe<Resp>>,
    status: Arc<SimPipe<RpcStatus>>,
}

impl<Req, Resp> Responder for SimBidiResponder<Req, Resp> {
    fn send_initial_metadata(&mut self, tag: Tag) {
        self.cq.post(tag, true);
    }
}

impl<Req, Resp> BidiStreamingResponder<Req, Resp> for SimBidiResponder<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn read(&mut self, tag: Tag) -> ReadSlot<Req> {
        self.requests.read(tag)
    }

    fn write(&mut self, response: Resp, _options: WriteOptions, tag: Tag) {
        self.responses.push(response);
        self.cq.post(tag, true);
    }

    fn write_and_finish(&mut self, response: Resp, _options: WriteOptions, status: RpcStatus, tag: Tag) {
        self.responses.push(response);
        self.status.push(status);
        self.cq.post(tag, true);
    }

    fn finish(&mut self, status: RpcStatus, tag: Tag) {
        self.status.push(status);
        self.cq.post(tag, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::GrpcContext;
    use crate::rpc::primitives;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    struct Request {
        integer: i64,
    }

    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    struct Response {
        integer: i64,
    }

    /// Poll every future in `futs` in turn, running exactly one queued
    /// completion-queue event between rounds, until all of them are
    /// `Ready`. Every event this module's primitives post is already
    /// queued by the time the polling round that triggered it returns, so
    /// `run_one` never actually blocks here.
    fn drive_to_completion<Q: crate::rpc::RpcCompletionQueue>(
        ctx: &Arc<GrpcContext<Q>>,
        cx: &mut Context<'_>,
        mut futs: Vec<Pin<&mut dyn Future<Output = ()>>>,
    ) {
        loop {
            let mut all_ready = true;
            for fut in &mut futs {
                if fut.as_mut().poll(cx).is_pending() {
                    all_ready = false;
                }
            }
            if all_ready {
                return;
            }
            ctx.run_one().unwrap();
        }
    }

    #[test]
    fn unary_round_trip() {
        let cq = SimCompletionQueue::new();
        let ctx = GrpcContext::new(Arc::clone(&cq));
        let service: Arc<SimUnaryService<Request, Response>> = Arc::new(SimUnaryService::new(Arc::clone(&cq)));

        let mut client_call = service.call(Request { integer: 7 });
        let ctx_for_server = Arc::clone(&ctx);
        let service_for_server = Arc::clone(&service);

        let client_result = std::cell::RefCell::new(None);
        let client = async {
            *client_result.borrow_mut() = primitives::finish_call(&ctx, &mut client_call).await;
        };
        futures::pin_mut!(client);

        let server_ok = std::cell::Cell::new(false);
        let server = async {
            let mut accept_slot = None;
            let accepted = primitives::request(&ctx_for_server, |tag| {
                accept_slot = Some(service_for_server.request_call(tag));
            })
            .await;
            assert!(accepted);
            let mut accept = accept_slot.unwrap().lock().unwrap().take().unwrap();
            let ok = primitives::finish_unary(
                &ctx_for_server,
                &mut accept.responder,
                Response {
                    integer: accept.request.integer * 2,
                },
                RpcStatus::ok(),
            )
            .await;
            server_ok.set(ok);
        };
        futures::pin_mut!(server);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        let futs: Vec<Pin<&mut dyn Future<Output = ()>>> = vec![client, server];
        drive_to_completion(&ctx, &mut cx, futs);

        assert!(server_ok.get());
        let (response, status) = client_result.into_inner().expect("unary result present");
        assert!(status.is_ok());
        assert_eq!(response.integer, 14);
    }

    #[test]
    fn client_streaming_accumulates_then_finishes() {
        let cq = SimCompletionQueue::new();
        let ctx = GrpcContext::new(Arc::clone(&cq));
        let service: Arc<SimClientStreamingService<i64, Response>> =
            Arc::new(SimClientStreamingService::new(Arc::clone(&cq)));

        let mut client_call = service.call();
        let ctx_for_client = Arc::clone(&ctx);
        let client_result = std::cell::RefCell::new(None);
        let client = async {
            primitives::write_client(&ctx_for_client, &mut client_call, 1, WriteOptions::NONE).await;
            primitives::write_client(&ctx_for_client, &mut client_call, 2, WriteOptions::NONE).await;
            primitives::write_client(&ctx_for_client, &mut client_call, 3, WriteOptions::NONE).await;
            primitives::writes_done::<_, i64, Response, _>(&ctx_for_client, &mut client_call).await;
            *client_result.borrow_mut() = primitives::finish_client_streaming_call(&ctx_for_client, &mut client_call).await;
        };
        futures::pin_mut!(client);

        let ctx_for_server = Arc::clone(&ctx);
        let service_for_server = Arc::clone(&service);
        let server = async {
            let mut accept_slot = None;
            let accepted = primitives::request(&ctx_for_server, |tag| {
                accept_slot = Some(service_for_server.request_call(tag));
            })
            .await;
            assert!(accepted);
            let mut responder = accept_slot.unwrap().lock().unwrap().take().unwrap();

            let mut sum = 0;
            while let Some(value) = primitives::read_client_streaming(&ctx_for_server, &mut responder).await {
                sum += value;
            }
            primitives::finish_client_streaming(&ctx_for_server, &mut responder, Response { integer: sum }, RpcStatus::ok()).await;
        };
        futures::pin_mut!(server);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        drive_to_completion(&ctx, &mut cx, vec![client, server]);

        let (response, status) = client_result.into_inner().expect("client-streaming result present");
        assert!(status.is_ok());
        assert_eq!(response.integer, 6);
    }

    #[test]
    fn alarm_fires_after_deadline() {
        let cq = SimCompletionQueue::new();
        let ctx = GrpcContext::new(Arc::clone(&cq));
        let mut alarm = SimAlarm::new(Arc::clone(&cq));

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(10);
        let fired = std::cell::Cell::new(false);
        let wait = async {
            fired.set(primitives::alarm_wait(&ctx, &mut alarm, deadline).await);
        };
        futures::pin_mut!(wait);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        ctx.run_one().unwrap();
        match wait.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => panic!("alarm should have fired by the time run_one returns"),
        }
        assert!(fired.get());
    }

    #[test]
    fn alarm_shutdown_race_reports_not_ok() {
        let cq = SimCompletionQueue::new();
        let ctx = GrpcContext::new(Arc::clone(&cq));
        let mut alarm = SimAlarm::new(Arc::clone(&cq));

        // Far enough out that the queue shuts down first.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3600);
        let fired = std::cell::Cell::new(true);
        let wait = async {
            fired.set(primitives::alarm_wait(&ctx, &mut alarm, deadline).await);
        };
        futures::pin_mut!(wait);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(wait.as_mut().poll(&mut cx).is_pending());

        cq.shutdown();
        ctx.run_one().unwrap();
        match wait.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => panic!("shutdown should have unblocked the alarm"),
        }
        assert!(!fired.get());
    }

    #[test]
    fn cancelling_token_forwards_to_alarm_cancel() {
        use crate::cancellation::CancellationToken;
        use std::sync::Mutex;

        let cq = SimCompletionQueue::new();
        let ctx = GrpcContext::new(Arc::clone(&cq));
        let alarm = Arc::new(Mutex::new(SimAlarm::new(Arc::clone(&cq))));
        let cancellation = CancellationToken::new();

        // Far enough out that only an explicit cancel (not the deadline)
        // can complete this before the test would time out.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3600);
        let ok = std::cell::Cell::new(true);
        let wait = async {
            ok.set(primitives::alarm_wait_cancellable(&ctx, &alarm, deadline, &cancellation).await);
        };
        futures::pin_mut!(wait);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(wait.as_mut().poll(&mut cx).is_pending());

        cancellation.cancel();
        ctx.run_one().unwrap();
        match wait.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => panic!("cancellation should have forwarded to Alarm::cancel and unblocked the wait"),
        }
        assert!(!ok.get());
    }

    #[test]
    fn already_cancelled_token_cancels_alarm_immediately() {
        use crate::cancellation::CancellationToken;
        use std::sync::Mutex;

        let cq = SimCompletionQueue::new();
        let ctx = GrpcContext::new(Arc::clone(&cq));
        let alarm = Arc::new(Mutex::new(SimAlarm::new(Arc::clone(&cq))));
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(3600);
        let ok = std::cell::Cell::new(true);
        let wait = async {
            ok.set(primitives::alarm_wait_cancellable(&ctx, &alarm, deadline, &cancellation).await);
        };
        futures::pin_mut!(wait);

        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(wait.as_mut().poll(&mut cx).is_pending());
        ctx.run_one().unwrap();
        match wait.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => panic!("an already-cancelled token should cancel the alarm as soon as it is armed"),
        }
        assert!(!ok.get());
    }
}
