//! RPC primitive operations (§4.4): thin `async fn` adapters over each
//! entry point a responder/call handle exposes.
//!
//! Every primitive shares one contract: invoke the underlying RPC call with
//! a fresh [`Operation`]'s address as the completion tag, suspend the
//! calling task, and resume it once [`GrpcContext`]'s run loop delivers
//! that tag, carrying the completion queue's boolean "ok". [`await_tag`] is
//! that shared shape; everything else in this module is a one-line wrapper
//! around it for a specific RPC entry point.
//!
//! The work counter is held for the lifetime of the tag, not just the
//! `await` -- `await_tag` pairs `work_started`/`work_finished` with the
//! [`Operation`]'s own completion, so the run loop stays alive for an
//! outstanding primitive even if the future awaiting it is itself dropped
//! before the tag comes back (the operation must never be freed before
//! the completion queue delivers its tag, per §4.4).

use std::future::poll_fn;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cancellation::CancellationToken;
use crate::completion::CompletionSlot;
use crate::context::GrpcContext;
use crate::operation::{container_of, Completion, Operation, OperationVTable};
use crate::rpc::{
    Alarm, BidiStreamingResponder, ClientStreamingCall, ClientStreamingResponder, RpcCompletionQueue,
    RpcStatus, ServerStreamingResponder, StatusSlot, Tag, UnaryCall, UnaryResponder, UnaryResult,
    WriteOptions,
};

#[repr(C)]
struct TagOp<Q> {
    op: Operation,
    slot: Arc<CompletionSlot<bool>>,
    ctx: Arc<GrpcContext<Q>>,
}

impl<Q: RpcCompletionQueue + 'static> TagOp<Q> {
    const VTABLE: OperationVTable = OperationVTable {
        complete: tag_op_complete::<Q>,
    };
}

unsafe fn tag_op_complete<Q: RpcCompletionQueue>(op: NonNull<Operation>, completion: Completion) {
    // SAFETY: `op` is the header of a live, exclusively-owned `TagOp<Q>`
    // allocated by `await_tag`, per the `Operation::complete` contract.
    let state: NonNull<TagOp<Q>> = unsafe { container_of(op) };
    let boxed = unsafe { Box::from_raw(state.as_ptr()) };
    boxed.slot.set(completion.ok());
    boxed.ctx.work_finished();
}

/// Post a tag through `start`, then suspend until the context's run loop
/// delivers it. Shared core of every primitive below.
#[tracing::instrument(level = "trace", skip_all)]
async fn await_tag<Q>(ctx: &Arc<GrpcContext<Q>>, start: impl FnOnce(Tag)) -> bool
where
    Q: RpcCompletionQueue + 'static,
{
    ctx.work_started();
    let slot = Arc::new(CompletionSlot::new());
    let boxed = Box::new(TagOp {
        op: Operation::new(&TagOp::<Q>::VTABLE),
        slot: Arc::clone(&slot),
        ctx: Arc::clone(ctx),
    });
    let raw = Box::into_raw(boxed);
    // SAFETY: `raw` was just allocated and embeds `Operation` as its first
    // field; it is exclusively owned until `start` hands its tag off to
    // the RPC runtime, which guarantees delivery exactly once.
    let op_ptr: NonNull<Operation> = unsafe { NonNull::new_unchecked(raw).cast() };
    // SAFETY: `op_ptr` stays live until `tag_op_complete` frees it, which
    // only happens once the completion queue delivers this tag back.
    let tag = unsafe { Tag::new(op_ptr) };
    tracing::trace!(?tag, "posting tag");
    start(tag);
    let ok = poll_fn(move |cx| slot.poll(cx)).await;
    tracing::trace!(ok, "tag delivered");
    ok
}

/// Post a server-side accept request (`RequestCall` / `Service::RequestXxx`
/// equivalent). `ok = true` means a call was accepted; `ok = false` means
/// the server completion queue is shutting down and the accept loop
/// (§4.5) should stop.
///
/// Generic over `start` rather than any particular responder trait because
/// every RPC kind's "request the next call" entry point has a different
/// signature (unary vs. streaming); callers pass a closure invoking the
/// one that matches their service method.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn request<Q>(ctx: &Arc<GrpcContext<Q>>, start: impl FnOnce(Tag)) -> bool
where
    Q: RpcCompletionQueue + 'static,
{
    await_tag(ctx, start).await
}

/// Arm `alarm` to fire at `deadline`, completing when the alarm's tag comes
/// back. `ok = false` if the alarm was cancelled or the context is
/// shutting down.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn alarm_wait<Q, Al>(ctx: &Arc<GrpcContext<Q>>, alarm: &mut Al, deadline: Instant) -> bool
where
    Q: RpcCompletionQueue + 'static,
    Al: Alarm,
{
    await_tag(ctx, |tag| alarm.set(ctx.completion_queue(), deadline, tag)).await
}

/// Arm `alarm` to fire at `deadline`, forwarding `cancellation` to
/// [`Alarm::cancel`] the moment it is cancelled (immediately, if it already
/// was by the time the alarm is armed, or whenever
/// [`CancellationToken::cancel`] is next called by any thread while the
/// wait is outstanding).
///
/// This is the realization of §4.4's "for primitives supporting it (alarm,
/// requests), cancellation signals are forwarded to the RPC library (e.g.,
/// `Alarm::Cancel`)" for the one primitive in this crate whose trait
/// actually exposes a `cancel` entry point. `alarm` is behind an `Arc<Mutex<
/// _>>` rather than a bare `&mut` because the registered callback may run
/// on whatever thread calls `cancel()`, concurrently with the run thread
/// delivering the alarm's own tag. The cancellation callback is registered
/// from inside the same closure that arms the alarm, after `set` returns,
/// so a token already cancelled before this call is only ever observed
/// once the alarm actually exists to cancel.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn alarm_wait_cancellable<Q, Al>(
    ctx: &Arc<GrpcContext<Q>>,
    alarm: &Arc<Mutex<Al>>,
    deadline: Instant,
    cancellation: &CancellationToken,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    Al: Alarm + 'static,
{
    await_tag(ctx, |tag| {
        alarm.lock().unwrap().set(ctx.completion_queue(), deadline, tag);
        let alarm_for_cancel = Arc::clone(alarm);
        cancellation.register(move || {
            alarm_for_cancel.lock().unwrap().cancel();
        });
    })
    .await
}

/// Send initial metadata ahead of the first response message.
pub async fn send_initial_metadata<Q, R>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: crate::rpc::Responder,
{
    await_tag(ctx, |tag| responder.send_initial_metadata(tag)).await
}

/// Read the next request message on a client-streaming server responder.
/// Returns `None` once the client half-closes the stream.
pub async fn read_client_streaming<Q, Req, Resp, R>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R) -> Option<Req>
where
    Q: RpcCompletionQueue + 'static,
    R: ClientStreamingResponder<Req, Resp>,
{
    let mut slot = None;
    let ok = await_tag(ctx, |tag| slot = Some(responder.read(tag))).await;
    if !ok {
        return None;
    }
    slot.expect("read started").lock().unwrap().take()
}

/// Read the next request message on a bidirectional-streaming server
/// responder. Returns `None` once the client half-closes the stream.
pub async fn read_bidi<Q, Req, Resp, R>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R) -> Option<Req>
where
    Q: RpcCompletionQueue + 'static,
    R: BidiStreamingResponder<Req, Resp>,
{
    let mut slot = None;
    let ok = await_tag(ctx, |tag| slot = Some(responder.read(tag))).await;
    if !ok {
        return None;
    }
    slot.expect("read started").lock().unwrap().take()
}

/// Write one response message on a bidirectional-streaming server
/// responder.
pub async fn write_bidi<Q, Req, Resp, R>(
    ctx: &Arc<GrpcContext<Q>>,
    responder: &mut R,
    response: Resp,
    options: WriteOptions,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: BidiStreamingResponder<Req, Resp>,
{
    await_tag(ctx, |tag| responder.write(response, options, tag)).await
}

/// Write the final response and finish a bidirectional-streaming RPC in one
/// step.
pub async fn write_and_finish_bidi<Q, Req, Resp, R>(
    ctx: &Arc<GrpcContext<Q>>,
    responder: &mut R,
    response: Resp,
    options: WriteOptions,
    status: RpcStatus,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: BidiStreamingResponder<Req, Resp>,
{
    await_tag(ctx, |tag| responder.write_and_finish(response, options, status, tag)).await
}

/// Finish a bidirectional-streaming RPC without writing a further response
/// message (the final status alone).
pub async fn finish_bidi<Q, Req, Resp, R>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R, status: RpcStatus) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: BidiStreamingResponder<Req, Resp>,
{
    await_tag(ctx, |tag| responder.finish(status, tag)).await
}

/// Finish a unary or client-streaming RPC with a response message and
/// status.
pub async fn finish_unary<Q, R, Resp>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R, response: Resp, status: RpcStatus) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: UnaryResponder<Resp>,
{
    await_tag(ctx, |tag| responder.finish(response, status, tag)).await
}

/// Finish a client-streaming RPC with a response message and status.
pub async fn finish_client_streaming<Q, R, Req, Resp>(
    ctx: &Arc<GrpcContext<Q>>,
    responder: &mut R,
    response: Resp,
    status: RpcStatus,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: ClientStreamingResponder<Req, Resp>,
{
    await_tag(ctx, |tag| responder.finish(response, status, tag)).await
}

/// Finish a server-streaming responder.
pub async fn finish_server_streaming<Q, R, Resp>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R, status: RpcStatus) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: ServerStreamingResponder<Resp>,
{
    await_tag(ctx, |tag| responder.finish(status, tag)).await
}

/// Write one response message on a server-streaming responder.
pub async fn write_server_streaming<Q, R, Resp>(
    ctx: &Arc<GrpcContext<Q>>,
    responder: &mut R,
    response: Resp,
    options: WriteOptions,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: ServerStreamingResponder<Resp>,
{
    await_tag(ctx, |tag| responder.write(response, options, tag)).await
}

/// Write the final response message on a server-streaming responder.
pub async fn write_last_server_streaming<Q, R, Resp>(
    ctx: &Arc<GrpcContext<Q>>,
    responder: &mut R,
    response: Resp,
    options: WriteOptions,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: ServerStreamingResponder<Resp>,
{
    await_tag(ctx, |tag| responder.write_last(response, options, tag)).await
}

/// Abandon the RPC with an error status instead of a response message.
pub async fn finish_with_error<Q, R, Resp>(ctx: &Arc<GrpcContext<Q>>, responder: &mut R, status: RpcStatus) -> bool
where
    Q: RpcCompletionQueue + 'static,
    R: UnaryResponder<Resp>,
{
    await_tag(ctx, |tag| responder.finish_with_error(status, tag)).await
}

/// Client-side: write one request message on a client-streaming or
/// bidirectional-streaming call.
pub async fn write_client<Q, Req, Resp, C>(
    ctx: &Arc<GrpcContext<Q>>,
    call: &mut C,
    request: Req,
    options: WriteOptions,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    C: ClientStreamingCall<Req, Resp>,
{
    await_tag(ctx, |tag| call.write(request, options, tag)).await
}

/// Client-side: half-close the stream, signalling no more requests will be
/// written.
pub async fn writes_done<Q, Req, Resp, C>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> bool
where
    Q: RpcCompletionQueue + 'static,
    C: ClientStreamingCall<Req, Resp>,
{
    await_tag(ctx, |tag| call.writes_done(tag)).await
}

/// Client-side: wait for a unary call's response message and final status.
pub async fn finish_call<Q, C, Resp>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> Option<(Resp, RpcStatus)>
where
    Q: RpcCompletionQueue + 'static,
    C: UnaryCall<Resp>,
{
    let mut slot: Option<UnaryResult<Resp>> = None;
    let ok = await_tag(ctx, |tag| slot = Some(call.finish(tag))).await;
    if !ok {
        return None;
    }
    slot.expect("finish started").lock().unwrap().take()
}

/// Client-side streaming call: wait for the response message and final
/// status once all writes and `writes_done` have been posted.
pub async fn finish_client_streaming_call<Q, C, Req, Resp>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> Option<(Resp, RpcStatus)>
where
    Q: RpcCompletionQueue + 'static,
    C: ClientStreamingCall<Req, Resp>,
{
    let mut slot: Option<UnaryResult<Resp>> = None;
    let ok = await_tag(ctx, |tag| slot = Some(call.finish(tag))).await;
    if !ok {
        return None;
    }
    slot.expect("finish started").lock().unwrap().take()
}

/// Client-side server-streaming call: read the next response message.
/// Returns `None` once the server half-closes the stream.
pub async fn read_server_streaming<Q, Resp, C>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> Option<Resp>
where
    Q: RpcCompletionQueue + 'static,
    C: crate::rpc::ServerStreamingCall<Resp>,
{
    let mut slot = None;
    let ok = await_tag(ctx, |tag| slot = Some(call.read(tag))).await;
    if !ok {
        return None;
    }
    slot.expect("read started").lock().unwrap().take()
}

/// Client-side server-streaming call: wait for the final status.
pub async fn finish_server_streaming_call<Q, Resp, C>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> RpcStatus
where
    Q: RpcCompletionQueue + 'static,
    C: crate::rpc::ServerStreamingCall<Resp>,
{
    let mut slot: Option<StatusSlot> = None;
    let ok = await_tag(ctx, |tag| slot = Some(call.finish(tag))).await;
    let status = slot.expect("finish started").lock().unwrap().take();
    status.unwrap_or_else(|| {
        debug_assert!(!ok, "finish tag completed ok without a status");
        RpcStatus {
            code: crate::rpc::StatusCode::Cancelled,
            message: "context shut down before the call finished".to_string(),
        }
    })
}

/// Client-side bidirectional-streaming call: read the next response
/// message. Returns `None` once the server half-closes the stream.
pub async fn read_bidi_client<Q, Req, Resp, C>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> Option<Resp>
where
    Q: RpcCompletionQueue + 'static,
    C: crate::rpc::BidiStreamingCall<Req, Resp>,
{
    let mut slot = None;
    let ok = await_tag(ctx, |tag| slot = Some(call.read(tag))).await;
    if !ok {
        return None;
    }
    slot.expect("read started").lock().unwrap().take()
}

/// Client-side bidirectional-streaming call: write one request message.
pub async fn write_bidi_client<Q, Req, Resp, C>(
    ctx: &Arc<GrpcContext<Q>>,
    call: &mut C,
    request: Req,
    options: WriteOptions,
) -> bool
where
    Q: RpcCompletionQueue + 'static,
    C: crate::rpc::BidiStreamingCall<Req, Resp>,
{
    await_tag(ctx, |tag| call.write(request, options, tag)).await
}

/// Client-side bidirectional-streaming call: half-close the stream.
pub async fn writes_done_bidi_client<Q, Req, Resp, C>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> bool
where
    Q: RpcCompletionQueue + 'static,
    C: crate::rpc::BidiStreamingCall<Req, Resp>,
{
    await_tag(ctx, |tag| call.writes_done(tag)).await
}

/// Client-side bidirectional-streaming call: wait for the final status.
pub async fn finish_bidi_client<Q, Req, Resp, C>(ctx: &Arc<GrpcContext<Q>>, call: &mut C) -> RpcStatus
where
    Q: RpcCompletionQueue + 'static,
    C: crate::rpc::BidiStreamingCall<Req, Resp>,
{
    let mut slot: Option<StatusSlot> = None;
    let ok = await_tag(ctx, |tag| slot = Some(call.finish(tag))).await;
    let status = slot.expect("finish started").lock().unwrap().take();
    status.unwrap_or_else(|| {
        debug_assert!(!ok, "finish tag completed ok without a status");
        RpcStatus {
            code: crate::rpc::StatusCode::Cancelled,
            message: "context shut down before the call finished".to_string(),
        }
    })
}
