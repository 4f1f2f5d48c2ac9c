use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tandem_core::{observability, CloseReason, EnqueueError, Frame, GatewayConfig, Hub, Session};
use tandem_models::gateway::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const PONG_MSG: &str = r#"{"type":"pong"}"#;
/// Bound on a single socket send or close.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
// Covers one timed-out write plus the timed-out close after it.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);
// Parked deadline for the idle timer when the timeout is disabled.
const IDLE_PARKED: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    ClientClosed,
    StreamEnded,
    ReadError,
    WriterStopped,
    QueueClosed,
    IdleTimeout,
    SlowConsumer,
}

enum Flow {
    Continue,
    Evict,
}

/// Reads frames until the socket fails or closes, the writer stops, the hub
/// closes the session's queue, or the idle timer fires. Always unregisters
/// the session and waits (bounded) for the writer before returning.
pub(crate) async fn run_reader<R, E>(
    mut stream: R,
    session: Arc<Session>,
    hub: Hub,
    config: GatewayConfig,
    mut writer: JoinHandle<()>,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let typing_limiter = NonZeroU32::new(config.max_typing_events_per_minute)
        .map(|per_minute| RateLimiter::direct(Quota::per_minute(per_minute)));
    let idle_timeout = config.idle_timeout;
    let idle_sleep = tokio::time::sleep(idle_timeout.unwrap_or(IDLE_PARKED));
    tokio::pin!(idle_sleep);
    let mut writer_done = false;

    let exit = loop {
        tokio::select! {
            msg = stream.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        tracing::debug!(
                            user_id = session.user_id(),
                            session_id = %session.id(),
                            error = %err,
                            "websocket read failed"
                        );
                        break ReaderExit::ReadError;
                    }
                    None => break ReaderExit::StreamEnded,
                };
                if let Some(timeout) = idle_timeout {
                    idle_sleep.as_mut().reset(Instant::now() + timeout);
                }
                let flow = match msg {
                    Message::Text(text) => {
                        handle_frame(text.as_str(), &session, &hub, typing_limiter.as_ref())
                    }
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => handle_frame(text, &session, &hub, typing_limiter.as_ref()),
                        Err(_) => {
                            tracing::debug!(
                                session_id = %session.id(),
                                bytes = bytes.len(),
                                "discarding non-UTF-8 binary frame"
                            );
                            Flow::Continue
                        }
                    },
                    Message::Close(_) => break ReaderExit::ClientClosed,
                    // Transport-level keepalives are answered by the socket itself.
                    Message::Ping(_) | Message::Pong(_) => Flow::Continue,
                };
                if let Flow::Evict = flow {
                    break ReaderExit::SlowConsumer;
                }
            }
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break ReaderExit::WriterStopped;
            }
            () = session.queue_closed() => break ReaderExit::QueueClosed,
            () = &mut idle_sleep, if idle_timeout.is_some() => break ReaderExit::IdleTimeout,
        }
    };

    match exit {
        ReaderExit::SlowConsumer => hub.evict(&session, CloseReason::SlowConsumer).await,
        _ => hub.unregister(&session).await,
    }
    tracing::debug!(
        user_id = session.user_id(),
        session_id = %session.id(),
        exit = ?exit,
        "session reader finished"
    );

    if !writer_done
        && tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
    {
        tracing::debug!(session_id = %session.id(), "writer did not drain in time; aborting");
        writer.abort();
    }
}

fn handle_frame(
    text: &str,
    session: &Arc<Session>,
    hub: &Hub,
    typing_limiter: Option<&DefaultDirectRateLimiter>,
) -> Flow {
    wire_log_ws_in(session, text);

    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(session_id = %session.id(), error = %err, "discarding frame");
            return Flow::Continue;
        }
    };

    let frame_type = envelope.kind();
    match envelope {
        Envelope::Typing { chat_id, .. } => {
            if typing_limiter.is_some_and(|limiter| limiter.check().is_err()) {
                tracing::debug!(
                    user_id = session.user_id(),
                    chat_id = %chat_id,
                    "typing rate limited (silent drop)"
                );
                return Flow::Continue;
            }
            // Never trust the client-supplied user_id.
            let stamped = Envelope::Typing {
                chat_id: chat_id.clone(),
                user_id: Some(session.user_id().to_string()),
            };
            match Frame::encode(&stamped) {
                Ok(frame) => hub.broadcast_to_chat(&chat_id, frame),
                Err(err) => {
                    tracing::warn!(chat_id = %chat_id, error = %err, "typing frame encoding failed")
                }
            }
            Flow::Continue
        }
        Envelope::Ping => match session.enqueue(Frame::from(PONG_MSG.to_string())) {
            Ok(()) | Err(EnqueueError::Closed) => Flow::Continue,
            Err(EnqueueError::Full) => {
                tracing::warn!(
                    user_id = session.user_id(),
                    session_id = %session.id(),
                    "outbound queue full on pong; evicting slow consumer"
                );
                Flow::Evict
            }
        },
        Envelope::NewMessage { .. } | Envelope::Pong => {
            tracing::trace!(
                session_id = %session.id(),
                frame_type,
                "ignoring client frame"
            );
            Flow::Continue
        }
    }
}

/// Sole writer of the socket. Drains the queue in order; once the queue is
/// closed and empty, sends the recorded close reason (if any) and closes the
/// sink. An evicted slow consumer gets the close frame without the backlog.
/// A failed or timed-out write stops it immediately.
pub(crate) async fn run_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Frame>,
    session: Arc<Session>,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    while let Some(frame) = outbound.recv().await {
        if session.close_reason() == Some(CloseReason::SlowConsumer) {
            break;
        }
        wire_log_ws_out(&session, frame.as_str());
        if !write_bounded(&mut sink, &session, Message::Text(frame.to_string().into())).await {
            drop(outbound);
            let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.close()).await;
            return;
        }
    }
    drop(outbound);

    if let Some(reason) = session.close_reason() {
        wire_log_ws_close(&session, reason);
        let close = Message::Close(Some(CloseFrame {
            code: reason.code(),
            reason: reason.description().to_string().into(),
        }));
        let _ = write_bounded(&mut sink, &session, close).await;
    }
    let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.close()).await;
}

async fn write_bounded<S>(sink: &mut S, session: &Session, msg: Message) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::debug!(
                user_id = session.user_id(),
                session_id = %session.id(),
                error = %err,
                "websocket write failed"
            );
            false
        }
        Err(_) => {
            tracing::debug!(
                user_id = session.user_id(),
                session_id = %session.id(),
                timeout_ms = WRITE_TIMEOUT.as_millis() as u64,
                "websocket write timed out"
            );
            false
        }
    }
}

fn wire_log_ws_in(session: &Session, payload: &str) {
    if !observability::wire_trace_enabled() {
        return;
    }
    let payload_preview = observability::wire_trace_payload_preview(payload);
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "in",
        user_id = session.user_id(),
        session_id = %session.id(),
        bytes = payload.len(),
        payload_preview = ?payload_preview,
        "server_in"
    );
}

fn wire_log_ws_out(session: &Session, payload: &str) {
    if !observability::wire_trace_enabled() {
        return;
    }
    let payload_preview = observability::wire_trace_payload_preview(payload);
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        user_id = session.user_id(),
        session_id = %session.id(),
        bytes = payload.len(),
        payload_preview = ?payload_preview,
        "server_out"
    );
}

fn wire_log_ws_close(session: &Session, reason: CloseReason) {
    if !observability::wire_trace_enabled() {
        return;
    }
    tracing::info!(
        target: "wire",
        transport = "gateway_ws",
        direction = "out",
        frame_type = "close",
        user_id = session.user_id(),
        session_id = %session.id(),
        code = reason.code(),
        reason = reason.description(),
        "server_out"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::Value;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};
    use tandem_core::{HubConfig, StaticParticipants};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    fn channel_sink(
        tx: UnboundedSender<Message>,
    ) -> impl Sink<Message, Error = io::Error> + Unpin + Send + 'static {
        Box::pin(futures_util::sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))?;
            Ok::<_, io::Error>(tx)
        }))
    }

    /// A peer that stopped reading: nothing is ever accepted or flushed.
    struct StalledSink {
        close_attempted: Arc<AtomicBool>,
    }

    impl Sink<Message> for StalledSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Message) -> io::Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.close_attempted.store(true, Ordering::SeqCst);
            Poll::Pending
        }
    }

    fn text(value: &str) -> Message {
        Message::Text(value.to_string().into())
    }

    fn drain(rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn hub() -> Hub {
        let resolver = StaticParticipants::from_chats([("c1", vec!["alice", "bob"])]);
        Hub::spawn(Arc::new(resolver), HubConfig::default())
    }

    #[test]
    fn pong_constant_matches_the_envelope_encoding() {
        assert_eq!(PONG_MSG, Envelope::Pong.encode().unwrap());
    }

    #[tokio::test]
    async fn writer_drains_in_order_then_sends_close_reason() {
        let (session, rx) = Session::new("alice", 4);
        session.enqueue(Frame::from("a".to_string())).unwrap();
        session.enqueue(Frame::from("b".to_string())).unwrap();
        session.close_queue(Some(CloseReason::Shutdown));

        let (tx, mut out) = unbounded_channel();
        run_writer(channel_sink(tx), rx, session).await;

        let written = drain(&mut out);
        assert_eq!(written.len(), 3);
        assert!(matches!(&written[0], Message::Text(t) if t.as_str() == "a"));
        assert!(matches!(&written[1], Message::Text(t) if t.as_str() == "b"));
        assert!(matches!(&written[2], Message::Close(Some(frame)) if frame.code == 1001));
    }

    #[tokio::test]
    async fn evicted_writer_skips_the_backlog() {
        let (session, rx) = Session::new("alice", 4);
        session.enqueue(Frame::from("a".to_string())).unwrap();
        session.enqueue(Frame::from("b".to_string())).unwrap();
        session.close_queue(Some(CloseReason::SlowConsumer));

        let (tx, mut out) = unbounded_channel();
        run_writer(channel_sink(tx), rx, session).await;

        let written = drain(&mut out);
        assert_eq!(written.len(), 1);
        assert!(matches!(&written[0], Message::Close(Some(frame)) if frame.code == 1013));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_is_abandoned() {
        let (session, rx) = Session::new("alice", 4);
        session.enqueue(Frame::from("stuck".to_string())).unwrap();
        let close_attempted = Arc::new(AtomicBool::new(false));
        let sink = StalledSink {
            close_attempted: close_attempted.clone(),
        };

        tokio::time::timeout(Duration::from_secs(60), run_writer(sink, rx, session))
            .await
            .expect("writer hung on a stalled socket");
        assert!(close_attempted.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn evicted_session_on_a_stalled_socket_still_ends() {
        let hub = hub();
        let close_attempted = Arc::new(AtomicBool::new(false));
        let sink = StalledSink {
            close_attempted: close_attempted.clone(),
        };
        let config = GatewayConfig {
            outbound_queue_capacity: 2,
            ..GatewayConfig::default()
        };
        let handle = crate::accept(
            &hub,
            "alice",
            sink,
            stream::pending::<Result<Message, io::Error>>(),
            &config,
        )
        .await
        .unwrap();
        let session = handle.session().clone();

        for n in 0..6 {
            hub.send_to_user("alice", Frame::from(format!("frame-{n}")));
        }
        tokio::time::timeout(Duration::from_secs(60), handle.closed())
            .await
            .expect("session tasks outlived the eviction");

        assert_eq!(session.close_reason(), Some(CloseReason::SlowConsumer));
        assert!(close_attempted.load(Ordering::SeqCst));
        let stats = hub.stats().await.unwrap();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.sessions, 0);
    }

    #[tokio::test]
    async fn reader_stops_when_the_hub_closes_the_queue() {
        let hub = hub();
        let (alice, alice_rx) = Session::new("alice", 8);
        hub.register(alice.clone()).await.unwrap();
        let (tx, mut out) = unbounded_channel();
        let writer = tokio::spawn(run_writer(channel_sink(tx), alice_rx, alice.clone()));

        let silent = stream::pending::<Result<Message, io::Error>>();
        let reader = tokio::spawn(run_reader(
            silent,
            alice.clone(),
            hub.clone(),
            GatewayConfig::default(),
            writer,
        ));
        hub.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader kept running after its queue closed")
            .unwrap();
        let written = drain(&mut out);
        assert!(matches!(written.last(), Some(Message::Close(Some(frame))) if frame.code == 1001));
    }

    #[tokio::test]
    async fn writer_closes_without_frame_on_plain_unregister() {
        let (session, rx) = Session::new("alice", 4);
        session.close_queue(None);
        let (tx, mut out) = unbounded_channel();
        run_writer(channel_sink(tx), rx, session).await;
        assert!(drain(&mut out).is_empty());
    }

    #[tokio::test]
    async fn writer_stops_on_first_write_error() {
        let (session, rx) = Session::new("alice", 4);
        session.enqueue(Frame::from("doomed".to_string())).unwrap();
        let failing = Box::pin(futures_util::sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(io::Error::other("connection reset"))
        }));

        run_writer(failing, rx, session.clone()).await;
        assert_eq!(
            session.enqueue(Frame::from("after".to_string())),
            Err(EnqueueError::Closed)
        );
    }

    #[tokio::test]
    async fn reader_stamps_typing_and_answers_ping() {
        let hub = hub();
        let (bob, mut bob_rx) = Session::new("bob", 8);
        hub.register(bob).await.unwrap();

        let (alice, alice_rx) = Session::new("alice", 8);
        hub.register(alice.clone()).await.unwrap();
        let (tx, mut out) = unbounded_channel();
        let writer = tokio::spawn(run_writer(channel_sink(tx), alice_rx, alice.clone()));

        let inbound = stream::iter(vec![
            Ok::<_, io::Error>(text("{not json")),
            Ok(text(r#"{"type":"bogus"}"#)),
            Ok(text(r#"{"type":"typing","chat_id":"c1","user_id":"mallory"}"#)),
            Ok(Message::Binary(br#"{"type":"ping"}"#.to_vec().into())),
        ]);
        run_reader(inbound, alice.clone(), hub.clone(), GatewayConfig::default(), writer).await;
        hub.stats().await.unwrap();

        let typing: Value = serde_json::from_str(bob_rx.try_recv().unwrap().as_str()).unwrap();
        assert_eq!(typing["type"], "typing");
        assert_eq!(typing["chat_id"], "c1");
        assert_eq!(typing["user_id"], "alice");

        let written = drain(&mut out);
        assert!(written
            .iter()
            .any(|msg| matches!(msg, Message::Text(t) if t.as_str() == PONG_MSG)));

        assert!(alice.is_closed());
        assert_eq!(hub.session_count("alice").await.unwrap(), 0);
        assert_eq!(hub.session_count("bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn typing_over_quota_is_dropped() {
        let hub = hub();
        let (bob, mut bob_rx) = Session::new("bob", 16);
        hub.register(bob).await.unwrap();

        let (alice, alice_rx) = Session::new("alice", 16);
        hub.register(alice.clone()).await.unwrap();
        let (tx, _out) = unbounded_channel();
        let writer = tokio::spawn(run_writer(channel_sink(tx), alice_rx, alice.clone()));

        let frames = (0..5)
            .map(|_| Ok::<_, io::Error>(text(r#"{"type":"typing","chat_id":"c1"}"#)))
            .collect::<Vec<_>>();
        let config = GatewayConfig {
            max_typing_events_per_minute: 2,
            ..GatewayConfig::default()
        };
        run_reader(stream::iter(frames), alice, hub.clone(), config, writer).await;
        hub.stats().await.unwrap();

        let mut received = 0;
        while bob_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
    }

    #[tokio::test]
    async fn idle_timeout_ends_the_session() {
        let hub = hub();
        let (alice, alice_rx) = Session::new("alice", 8);
        hub.register(alice.clone()).await.unwrap();
        let (tx, _out) = unbounded_channel();
        let writer = tokio::spawn(run_writer(channel_sink(tx), alice_rx, alice.clone()));

        let config = GatewayConfig {
            idle_timeout: Some(Duration::from_millis(50)),
            ..GatewayConfig::default()
        };
        let silent = stream::pending::<Result<Message, io::Error>>();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_reader(silent, alice.clone(), hub.clone(), config, writer),
        )
        .await
        .expect("idle timeout never fired");

        assert!(alice.is_closed());
        assert_eq!(hub.session_count("alice").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writer_failure_ends_the_reader() {
        let hub = hub();
        let (alice, alice_rx) = Session::new("alice", 8);
        hub.register(alice.clone()).await.unwrap();
        let failing = Box::pin(futures_util::sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(io::Error::other("connection reset"))
        }));
        let writer = tokio::spawn(run_writer(failing, alice_rx, alice.clone()));

        hub.send_to_user("alice", Frame::from("boom".to_string()));
        let silent = stream::pending::<Result<Message, io::Error>>();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_reader(silent, alice.clone(), hub.clone(), GatewayConfig::default(), writer),
        )
        .await
        .expect("reader kept running after writer failure");

        assert_eq!(hub.session_count("alice").await.unwrap(), 0);
    }
}
