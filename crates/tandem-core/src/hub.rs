use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::CoreError;
use crate::registry::SessionRegistry;
use crate::resolver::ParticipantResolver;
use crate::session::{CloseReason, EnqueueError, Frame, Session};

pub const DEFAULT_MAX_SESSIONS_PER_USER: usize = 5;
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_COMMAND_CAPACITY: usize = 4096;
/// Resolutions slower than this hold up every other hub command long enough
/// to be reported.
pub const SLOW_RESOLVE_THRESHOLD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 0 disables the limit.
    pub max_sessions_per_user: usize,
    pub resolve_timeout: Duration,
    /// Depth of the hub's command queue. Fan-out requests that find it full
    /// are dropped and counted.
    pub command_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub users: usize,
    pub sessions: usize,
    pub evictions: u64,
    pub dropped_broadcasts: u64,
    pub delivered_frames: u64,
    /// Participant lookups that exceeded [`SLOW_RESOLVE_THRESHOLD`].
    pub slow_resolutions: u64,
}

#[derive(Default)]
struct HubCounters {
    evictions: AtomicU64,
    dropped_broadcasts: AtomicU64,
    delivered_frames: AtomicU64,
    slow_resolutions: AtomicU64,
}

enum Command {
    Register {
        session: Arc<Session>,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    Unregister {
        session: Arc<Session>,
        reason: Option<CloseReason>,
    },
    SendToUser {
        user_id: String,
        frame: Frame,
    },
    BroadcastToChat {
        chat_id: String,
        frame: Frame,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
    SessionCount {
        user_id: String,
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the session hub.
///
/// All registry mutations and fan-out decisions run on a single task that
/// consumes commands in FIFO order, so a `register` that has returned is
/// observed by every command sent after it. Cloning the handle is cheap;
/// the hub stops once every handle is dropped or [`Hub::shutdown`] runs.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
    counters: Arc<HubCounters>,
}

impl Hub {
    pub fn spawn(resolver: Arc<dyn ParticipantResolver>, config: HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_capacity.max(1));
        let counters = Arc::new(HubCounters::default());
        let processor = HubProcessor {
            registry: SessionRegistry::new(),
            resolver,
            config,
            counters: counters.clone(),
            commands: rx,
        };
        tokio::spawn(processor.run());
        Self {
            commands: tx,
            counters,
        }
    }

    /// Adds `session` as a fan-out target. Fails when the session is already
    /// closed, when the user is at the session limit (the session's queue is
    /// then closed with [`CloseReason::SessionLimit`]), or after shutdown.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Register { session, reply })
            .await
            .map_err(|_| CoreError::HubClosed)?;
        rx.await.map_err(|_| CoreError::HubClosed)?
    }

    /// Removes `session` and closes its queue. Safe to call repeatedly.
    pub async fn unregister(&self, session: &Arc<Session>) {
        self.remove(session, None).await;
    }

    /// Like [`Hub::unregister`], but the writer will close the socket with
    /// `reason`.
    pub async fn evict(&self, session: &Arc<Session>, reason: CloseReason) {
        self.remove(session, Some(reason)).await;
    }

    async fn remove(&self, session: &Arc<Session>, reason: Option<CloseReason>) {
        let command = Command::Unregister {
            session: session.clone(),
            reason,
        };
        if self.commands.send(command).await.is_err() {
            // Hub is gone; nobody else will close this queue.
            session.close_queue(reason);
        }
    }

    /// Best-effort delivery to every live session of `user_id`. Never blocks.
    pub fn send_to_user(&self, user_id: &str, frame: Frame) {
        self.submit(Command::SendToUser {
            user_id: user_id.to_string(),
            frame,
        });
    }

    /// Resolves the chat's participants and sends `frame` to each of them.
    /// Never blocks; resolution failures are logged and the frame dropped.
    pub fn broadcast_to_chat(&self, chat_id: &str, frame: Frame) {
        self.submit(Command::BroadcastToChat {
            chat_id: chat_id.to_string(),
            frame,
        });
    }

    fn submit(&self, command: Command) {
        match self.commands.try_send(command) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters
                    .dropped_broadcasts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!("hub command queue full; dropping fan-out request");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("hub closed; dropping fan-out request");
            }
        }
    }

    pub async fn stats(&self) -> Result<HubStats, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply })
            .await
            .map_err(|_| CoreError::HubClosed)?;
        rx.await.map_err(|_| CoreError::HubClosed)
    }

    pub async fn session_count(&self, user_id: &str) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SessionCount {
                user_id: user_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| CoreError::HubClosed)?;
        rx.await.map_err(|_| CoreError::HubClosed)
    }

    /// Closes every session with [`CloseReason::Shutdown`] and stops the hub.
    /// Returns once the registry is empty.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

struct HubProcessor {
    registry: SessionRegistry,
    resolver: Arc<dyn ParticipantResolver>,
    config: HubConfig,
    counters: Arc<HubCounters>,
    commands: mpsc::Receiver<Command>,
}

impl HubProcessor {
    async fn run(mut self) {
        tracing::debug!("hub started");
        while let Some(command) = self.commands.recv().await {
            if let Command::Shutdown { reply } = command {
                self.stop();
                let _ = reply.send(());
                return;
            }
            self.handle(command).await;
        }
        // Every handle dropped.
        self.stop();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Register { session, reply } => {
                let _ = reply.send(self.register(session));
            }
            Command::Unregister { session, reason } => self.unregister(&session, reason),
            Command::SendToUser { user_id, frame } => {
                self.deliver(&user_id, &frame);
            }
            Command::BroadcastToChat { chat_id, frame } => {
                self.broadcast_to_chat(&chat_id, &frame).await;
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::SessionCount { user_id, reply } => {
                let _ = reply.send(self.registry.session_count(&user_id));
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, session: Arc<Session>) -> Result<(), CoreError> {
        if session.is_closed() {
            return Err(CoreError::SessionClosed(session.id()));
        }

        let user_id = session.user_id();
        let limit = self.config.max_sessions_per_user;
        if limit > 0
            && !self.registry.contains(user_id, session.id())
            && self.registry.session_count(user_id) >= limit
        {
            session.close_queue(Some(CloseReason::SessionLimit));
            tracing::info!(
                user_id,
                session_id = %session.id(),
                limit,
                "session refused: per-user limit reached"
            );
            return Err(CoreError::SessionLimit {
                user_id: user_id.to_string(),
                limit,
            });
        }

        tracing::debug!(user_id, session_id = %session.id(), "session registered");
        self.registry.insert(session);
        Ok(())
    }

    fn unregister(&mut self, session: &Arc<Session>, reason: Option<CloseReason>) {
        let removed = self
            .registry
            .remove(session.user_id(), session.id())
            .is_some();
        let closed = session.close_queue(reason);
        if closed && reason == Some(CloseReason::SlowConsumer) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        if removed {
            tracing::debug!(
                user_id = session.user_id(),
                session_id = %session.id(),
                reason = ?reason,
                "session unregistered"
            );
        }
    }

    /// Enqueues `frame` on every live session of `user_id`, evicting the ones
    /// that cannot take it. Returns the number of sessions reached.
    fn deliver(&mut self, user_id: &str, frame: &Frame) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for session in self.registry.sessions(user_id) {
            match session.enqueue(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => failed.push((session.clone(), err)),
            }
        }

        for (session, err) in failed {
            self.registry.remove(session.user_id(), session.id());
            match err {
                EnqueueError::Full => {
                    if session.close_queue(Some(CloseReason::SlowConsumer)) {
                        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    tracing::warn!(
                        user_id,
                        session_id = %session.id(),
                        "outbound queue full; evicting slow consumer"
                    );
                }
                EnqueueError::Closed => {
                    session.close_queue(None);
                    tracing::debug!(
                        user_id,
                        session_id = %session.id(),
                        "writer gone; dropping session"
                    );
                }
            }
        }

        self.counters
            .delivered_frames
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    async fn broadcast_to_chat(&mut self, chat_id: &str, frame: &Frame) {
        let started = Instant::now();
        let resolved = tokio::time::timeout(
            self.config.resolve_timeout,
            self.resolver.resolve_chat_participants(chat_id),
        )
        .await;
        let elapsed = started.elapsed();
        let resolve_ms = elapsed.as_millis() as u64;
        if elapsed >= SLOW_RESOLVE_THRESHOLD {
            self.counters
                .slow_resolutions
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(chat_id, resolve_ms, "slow participant resolution held up the hub");
        }

        let participants = match resolved {
            Ok(Ok(participants)) => participants,
            Ok(Err(err)) => {
                self.counters
                    .dropped_broadcasts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(chat_id, error = %err, "participant resolution failed; broadcast dropped");
                return;
            }
            Err(_) => {
                self.counters
                    .dropped_broadcasts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    chat_id,
                    timeout_ms = self.config.resolve_timeout.as_millis() as u64,
                    "participant resolution timed out; broadcast dropped"
                );
                return;
            }
        };

        let mut seen = HashSet::with_capacity(participants.len());
        let mut recipients = 0;
        for user_id in &participants {
            if seen.insert(user_id.as_str()) {
                recipients += self.deliver(user_id, frame);
            }
        }
        tracing::debug!(
            chat_id,
            participants = seen.len(),
            recipients,
            resolve_ms,
            "chat broadcast"
        );
    }

    fn stats(&self) -> HubStats {
        HubStats {
            users: self.registry.user_count(),
            sessions: self.registry.len(),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            dropped_broadcasts: self.counters.dropped_broadcasts.load(Ordering::Relaxed),
            delivered_frames: self.counters.delivered_frames.load(Ordering::Relaxed),
            slow_resolutions: self.counters.slow_resolutions.load(Ordering::Relaxed),
        }
    }

    fn stop(&mut self) {
        self.commands.close();
        let sessions = self.registry.drain();
        let count = sessions.len();
        for session in sessions {
            session.close_queue(Some(CloseReason::Shutdown));
        }
        // Anything still queued was sent before the close; answer it so no
        // caller waits forever and no accepted session is left open.
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Register { session, reply } => {
                    session.close_queue(Some(CloseReason::Shutdown));
                    let _ = reply.send(Err(CoreError::HubClosed));
                }
                Command::Unregister { session, reason } => {
                    session.close_queue(reason);
                }
                Command::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                Command::Stats { .. }
                | Command::SessionCount { .. }
                | Command::SendToUser { .. }
                | Command::BroadcastToChat { .. } => {}
            }
        }
        tracing::info!(sessions = count, "hub stopped");
    }
}
