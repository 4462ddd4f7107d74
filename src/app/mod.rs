use crate::domain::{
    ConnectionState, EventLog, EventRecord, FrameParser, LocalStatus, ReconnectPolicy,
    ReconnectState, Session, TokenMetrics, fold_record, is_live_eligible,
};
use crate::infra::{ApiClient, ApiError, EventSource};
use futures_util::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("no session selected")]
    NoSession,
}

/// Immutable view published to the UI collaborator after every mutation.
/// Readers never hold references into live controller state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonitorSnapshot {
    pub session: Option<Session>,
    pub connection: ConnectionState,
    pub events: Vec<EventRecord>,
    pub metrics: TokenMetrics,
}

struct Shared {
    session: Option<Session>,
    connection: ConnectionState,
    log: EventLog,
    metrics: TokenMetrics,
    /// Bumped on every supersession/cancel. A stream task only writes while
    /// its own generation is current, so a stale task can never touch state
    /// that belongs to its successor.
    generation: u64,
}

struct ActiveStream {
    session_id: String,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the one live stream task and every piece of state the UI reads:
/// connection state, event log, and running metrics. All writes funnel
/// through here; everything handed out is a snapshot.
pub struct SessionController {
    api: ApiClient,
    source: Arc<dyn EventSource>,
    policy: ReconnectPolicy,
    shared: Arc<Mutex<Shared>>,
    snapshot_tx: watch::Sender<MonitorSnapshot>,
    active: Option<ActiveStream>,
}

impl SessionController {
    pub fn new(api: ApiClient, source: Arc<dyn EventSource>, policy: ReconnectPolicy) -> Self {
        let (snapshot_tx, _) = watch::channel(MonitorSnapshot::default());
        Self {
            api,
            source,
            policy,
            shared: Arc::new(Mutex::new(Shared {
                session: None,
                connection: ConnectionState::Disconnected,
                log: EventLog::default(),
                metrics: TokenMetrics::default(),
                generation: 0,
            })),
            snapshot_tx,
            active: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        build_snapshot(&lock(&self.shared))
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.shared).connection.clone()
    }

    pub fn metrics(&self) -> TokenMetrics {
        lock(&self.shared).metrics
    }

    pub fn event_log(&self) -> Vec<EventRecord> {
        lock(&self.shared).log.snapshot()
    }

    /// Fetches the session's status document and selects it. Re-selecting the
    /// current session preserves its client-managed local status.
    pub async fn select_session_by_id(&mut self, session_id: &str) -> Result<(), ControllerError> {
        let fetched = self.api.fetch_session_status(session_id).await?;
        let session = {
            let shared = lock(&self.shared);
            match &shared.session {
                Some(existing) if existing.id == fetched.id => {
                    let mut merged = existing.clone();
                    merged.adopt_status(fetched);
                    merged
                }
                _ => fetched,
            }
        };
        self.select_session(session);
        Ok(())
    }

    /// Supersedes any prior stream and points the controller at `session`.
    ///
    /// Selecting the session that is already streaming leaves the stream,
    /// log, and metrics alone but adopts the incoming status document, so a
    /// re-fetch still refreshes `iteration`/`elapsed_secs`. Otherwise the
    /// previous task is cancelled exactly once, log/metrics/reconnect state
    /// reset, and a fresh stream task is spawned only if the liveness gate
    /// allows it. An ineligible session makes zero connection attempts;
    /// `Disconnected` is its steady state, not an error.
    pub fn select_session(&mut self, session: Session) {
        if let Some(active) = &self.active {
            if active.session_id == session.id && !active.task.is_finished() {
                let mut shared = lock(&self.shared);
                if let Some(current) = shared.session.as_mut() {
                    current.adopt_status(session);
                    publish(&self.snapshot_tx, &shared);
                }
                return;
            }
        }

        self.cancel_active();

        let eligible = is_live_eligible(&session);
        let session_id = session.id.clone();
        let generation = {
            let mut shared = lock(&self.shared);
            shared.generation += 1;
            shared.session = Some(session);
            shared.log.clear();
            shared.metrics = TokenMetrics::default();
            shared.connection = if eligible {
                ConnectionState::Connecting
            } else {
                ConnectionState::Disconnected
            };
            publish(&self.snapshot_tx, &shared);
            shared.generation
        };

        if !eligible {
            return;
        }

        let cancel = CancellationToken::new();
        let task = StreamTask {
            source: Arc::clone(&self.source),
            shared: Arc::clone(&self.shared),
            snapshot_tx: self.snapshot_tx.clone(),
            policy: self.policy,
            session_id: session_id.clone(),
            generation,
            cancel: cancel.clone(),
        };
        self.active = Some(ActiveStream {
            session_id,
            cancel,
            task: tokio::spawn(task.run()),
        });
    }

    /// Terminates the current stream task, if any, and settles on
    /// `Disconnected`. The token is taken out of `active`, so each task is
    /// cancelled at most once.
    pub fn cancel(&mut self) {
        self.cancel_active();
        let mut shared = lock(&self.shared);
        shared.connection = ConnectionState::Disconnected;
        publish(&self.snapshot_tx, &shared);
    }

    fn cancel_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        // Close the generation before waking the task so it cannot write
        // between observing the cancel and exiting.
        lock(&self.shared).generation += 1;
        active.cancel.cancel();
    }

    pub async fn pause(&mut self) -> Result<(), ControllerError> {
        let session_id = self.selected_id()?;
        self.api.pause_session(&session_id).await?;
        self.set_local_status(Some(LocalStatus::Paused));
        Ok(())
    }

    pub async fn resume(&mut self) -> Result<(), ControllerError> {
        let session_id = self.selected_id()?;
        self.api.resume_session(&session_id).await?;
        self.set_local_status(Some(LocalStatus::Running));
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), ControllerError> {
        let session_id = self.selected_id()?;
        self.api.stop_session(&session_id).await?;
        self.set_local_status(None);
        Ok(())
    }

    /// Re-fetches the status document for the selected session, preserving
    /// local status. Does not touch the stream.
    pub async fn refresh_status(&mut self) -> Result<(), ControllerError> {
        let session_id = self.selected_id()?;
        let fetched = self.api.fetch_session_status(&session_id).await?;
        let mut shared = lock(&self.shared);
        if let Some(session) = shared.session.as_mut() {
            session.adopt_status(fetched);
            publish(&self.snapshot_tx, &shared);
        }
        Ok(())
    }

    fn selected_id(&self) -> Result<String, ControllerError> {
        lock(&self.shared)
            .session
            .as_ref()
            .map(|session| session.id.clone())
            .ok_or(ControllerError::NoSession)
    }

    fn set_local_status(&mut self, status: Option<LocalStatus>) {
        let mut shared = lock(&self.shared);
        if let Some(session) = shared.session.as_mut() {
            session.local_status = status;
            publish(&self.snapshot_tx, &shared);
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
        }
    }
}

struct StreamTask {
    source: Arc<dyn EventSource>,
    shared: Arc<Mutex<Shared>>,
    snapshot_tx: watch::Sender<MonitorSnapshot>,
    policy: ReconnectPolicy,
    session_id: String,
    generation: u64,
    cancel: CancellationToken,
}

impl StreamTask {
    async fn run(self) {
        let mut reconnect = ReconnectState::default();

        loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => return,
                opened = self.source.open(&self.session_id) => opened,
            };

            let failure = match opened {
                Ok(mut stream) => {
                    if !self.set_connection(ConnectionState::Connected) {
                        return;
                    }
                    reconnect.mark_connected();
                    tracing::info!(session = %self.session_id, "event stream connected");

                    let mut parser = FrameParser::new();
                    let reason = loop {
                        let chunk = tokio::select! {
                            _ = self.cancel.cancelled() => return,
                            chunk = stream.next() => chunk,
                        };
                        match chunk {
                            Some(Ok(bytes)) => {
                                for record in parser.push_chunk(&bytes) {
                                    if !self.handle_frame(record) {
                                        return;
                                    }
                                }
                            }
                            Some(Err(error)) => break error.to_string(),
                            None => break "stream closed by server".to_string(),
                        }
                    };
                    tracing::info!(
                        session = %self.session_id,
                        reason = %reason,
                        last_event_id = parser.last_id().unwrap_or(""),
                        "event stream disconnected"
                    );
                    reason
                }
                Err(error) => {
                    tracing::warn!(session = %self.session_id, %error, "stream connect failed");
                    error.to_string()
                }
            };

            match self.policy.next_delay(&mut reconnect) {
                Some(delay) => {
                    let attempt = reconnect.attempt();
                    if !self.set_connection(ConnectionState::Reconnecting { attempt }) {
                        return;
                    }
                    tracing::debug!(session = %self.session_id, attempt, ?delay, "backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    let message = format!(
                        "gave up after {} attempts: {failure}",
                        reconnect.attempt()
                    );
                    tracing::warn!(session = %self.session_id, %message, "stream abandoned");
                    self.set_connection(ConnectionState::Error { message });
                    return;
                }
            }
        }
    }

    /// The sole mutation point for the event log: append at the display head,
    /// fold into metrics in arrival order, publish. Returns false when this
    /// task has been superseded.
    fn handle_frame(&self, record: EventRecord) -> bool {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return false;
        }
        fold_record(&mut shared.metrics, &record);
        shared.log.push_head(record);
        publish(&self.snapshot_tx, &shared);
        true
    }

    fn set_connection(&self, connection: ConnectionState) -> bool {
        let mut shared = lock(&self.shared);
        if shared.generation != self.generation {
            return false;
        }
        shared.connection = connection;
        publish(&self.snapshot_tx, &shared);
        true
    }
}

fn lock(shared: &Arc<Mutex<Shared>>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn build_snapshot(shared: &Shared) -> MonitorSnapshot {
    MonitorSnapshot {
        session: shared.session.clone(),
        connection: shared.connection.clone(),
        events: shared.log.snapshot(),
        metrics: shared.metrics,
    }
}

fn publish(snapshot_tx: &watch::Sender<MonitorSnapshot>, shared: &Shared) {
    snapshot_tx.send_replace(build_snapshot(shared));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionMode;
    use crate::infra::{EventByteStream, MonitorConfig, StreamError};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type ChunkSender = mpsc::UnboundedSender<Result<Bytes, StreamError>>;

    /// Scripted transport: each `open` consumes the next scripted connection,
    /// either a channel-fed byte stream or a connect failure.
    #[derive(Default)]
    struct FakeSource {
        scripts: Mutex<VecDeque<Result<mpsc::UnboundedReceiver<Result<Bytes, StreamError>>, StreamError>>>,
        opens: AtomicUsize,
    }

    impl FakeSource {
        fn script_stream(&self) -> ChunkSender {
            let (tx, rx) = mpsc::unbounded_channel();
            self.scripts.lock().expect("scripts lock").push_back(Ok(rx));
            tx
        }

        fn script_failure(&self, message: &str) {
            self.scripts
                .lock()
                .expect("scripts lock")
                .push_back(Err(StreamError::Connect(message.to_string())));
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl EventSource for FakeSource {
        async fn open(&self, _session_id: &str) -> Result<EventByteStream, StreamError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().expect("scripts lock").pop_front();
            match script {
                Some(Ok(rx)) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })
                .boxed()),
                Some(Err(error)) => Err(error),
                None => Err(StreamError::Connect("no scripted connection".to_string())),
            }
        }
    }

    fn session(id: &str, mode: SessionMode, local_status: Option<LocalStatus>) -> Session {
        Session {
            id: id.to_string(),
            mode,
            local_status,
            iteration: 1,
            hat: "builder".to_string(),
            elapsed_secs: 0.0,
        }
    }

    fn frame(topic: &str, payload: &str) -> Bytes {
        let data = format!(
            "{{\"topic\":\"{topic}\",\"ts\":\"2026-01-01T00:00:00Z\",\"payload\":{payload}}}"
        );
        Bytes::from(format!("event: workflow\ndata: {data}\n\n"))
    }

    fn controller(source: Arc<FakeSource>, policy: ReconnectPolicy) -> SessionController {
        let api = ApiClient::new(&MonitorConfig {
            base_url: url::Url::parse("http://localhost:0/").expect("base url"),
            auth_token: None,
        });
        SessionController::new(api, source, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_session_never_connects() {
        let source = Arc::new(FakeSource::default());
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());

        controller.select_session(session("done", SessionMode::Complete, None));
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        assert_eq!(source.opens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn locally_paused_complete_session_still_streams() {
        let source = Arc::new(FakeSource::default());
        let chunks = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session(
            "s1",
            SessionMode::Complete,
            Some(LocalStatus::Paused),
        ));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");
        assert_eq!(source.opens(), 1);
        drop(chunks);
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_streams_frames_in_order_and_reconnects() {
        let source = Arc::new(FakeSource::default());
        let first = source.script_stream();
        let second = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, None));
        assert_eq!(controller.connection_state(), ConnectionState::Connecting);

        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");

        first
            .send(Ok(frame("assistant", r#"{"usage":{"input_tokens":10,"output_tokens":5}}"#)))
            .expect("send");
        first
            .send(Ok(frame("assistant", r#"{"usage":{"input_tokens":20,"output_tokens":8}}"#)))
            .expect("send");
        first.send(Ok(frame("build.done", "\"ok\""))).expect("send");

        let snap = updates
            .wait_for(|snap| snap.events.len() == 3)
            .await
            .expect("three events")
            .clone();
        assert_eq!(snap.events[0].topic, "build.done", "newest first");
        assert_eq!(snap.events[2].topic, "assistant");
        assert_eq!(snap.metrics.input_tokens, 30);
        assert_eq!(snap.metrics.output_tokens, 13);

        // Server closes the stream: one reconnect attempt, then recovery.
        drop(first);
        updates
            .wait_for(|snap| snap.connection == (ConnectionState::Reconnecting { attempt: 1 }))
            .await
            .expect("reconnecting");
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("reconnected");
        assert_eq!(source.opens(), 2);

        // Events survive the reconnect; new frames keep arriving.
        second.send(Ok(frame("review.pass", "null"))).expect("send");
        let snap = updates
            .wait_for(|snap| snap.events.len() == 4)
            .await
            .expect("fourth event")
            .clone();
        assert_eq!(snap.events[0].topic, "review.pass");
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_dropped_without_breaking_the_stream() {
        let source = Arc::new(FakeSource::default());
        let chunks = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, None));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");

        chunks
            .send(Ok(Bytes::from("event: workflow\ndata: {broken\n\n")))
            .expect("send");
        chunks.send(Ok(frame("build.done", "null"))).expect("send");

        let snap = updates
            .wait_for(|snap| !snap.events.is_empty())
            .await
            .expect("event after malformed frame")
            .clone();
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].topic, "build.done");
        assert_eq!(snap.connection, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_failures_end_in_error_state() {
        let source = Arc::new(FakeSource::default());
        source.script_failure("connection refused");
        source.script_failure("connection refused");
        source.script_failure("connection refused");
        let policy = ReconnectPolicy {
            max_attempts: 2,
            ..ReconnectPolicy::default()
        };
        let mut controller = controller(Arc::clone(&source), policy);
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, None));
        let snap = updates
            .wait_for(|snap| matches!(snap.connection, ConnectionState::Error { .. }))
            .await
            .expect("error state")
            .clone();

        // Initial attempt plus two retries, then give-up with the last cause.
        assert_eq!(source.opens(), 3);
        let ConnectionState::Error { message } = snap.connection else {
            unreachable!();
        };
        assert!(message.contains("connection refused"), "{message}");

        // Terminal: no further automatic attempts.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.opens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn selecting_another_session_supersedes_cleanly() {
        let source = Arc::new(FakeSource::default());
        let stream_a = source.script_stream();
        let stream_b = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("a", SessionMode::Live, None));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("a connected");
        stream_a.send(Ok(frame("a.event", "null"))).expect("send");
        updates
            .wait_for(|snap| snap.events.len() == 1)
            .await
            .expect("a event");

        controller.select_session(session("b", SessionMode::Live, None));
        let snap = controller.snapshot();
        assert!(snap.events.is_empty(), "log resets on supersession");
        assert_eq!(snap.metrics, TokenMetrics::default());

        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("b connected");
        assert_eq!(source.opens(), 2);

        // A late frame from the dead stream must not cross over into B.
        let _ = stream_a.send(Ok(frame("a.late", "null")));
        stream_b.send(Ok(frame("b.event", "null"))).expect("send");
        let snap = updates
            .wait_for(|snap| !snap.events.is_empty())
            .await
            .expect("b event")
            .clone();
        assert_eq!(snap.events.len(), 1);
        assert_eq!(snap.events[0].topic, "b.event");
    }

    #[tokio::test(start_paused = true)]
    async fn reselecting_the_running_session_does_not_restart() {
        let source = Arc::new(FakeSource::default());
        let chunks = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, None));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");
        chunks.send(Ok(frame("keep.me", "null"))).expect("send");
        updates
            .wait_for(|snap| snap.events.len() == 1)
            .await
            .expect("event");

        controller.select_session(session("s1", SessionMode::Live, None));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(source.opens(), 1, "no restart while the stream is live");
        assert_eq!(controller.event_log().len(), 1, "log survives re-select");
    }

    #[tokio::test(start_paused = true)]
    async fn reselecting_adopts_the_fresh_status_document() {
        let source = Arc::new(FakeSource::default());
        let _chunks = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, Some(LocalStatus::Paused)));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");

        let mut refreshed = session("s1", SessionMode::Live, None);
        refreshed.iteration = 7;
        refreshed.elapsed_secs = 42.0;
        controller.select_session(refreshed);

        assert_eq!(source.opens(), 1, "stream keeps running");
        let snap = controller.snapshot();
        let current = snap.session.expect("session selected");
        assert_eq!(current.iteration, 7);
        assert_eq!(current.elapsed_secs, 42.0);
        assert_eq!(
            current.local_status,
            Some(LocalStatus::Paused),
            "client-managed status survives the refresh"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_disconnects_without_consulting_the_policy() {
        let source = Arc::new(FakeSource::default());
        let chunks = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, None));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");

        controller.cancel();
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(source.opens(), 1, "deliberate cancel never reconnects");
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
        drop(chunks);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent() {
        let source = Arc::new(FakeSource::default());
        let _chunks = source.script_stream();
        let mut controller = controller(Arc::clone(&source), ReconnectPolicy::default());
        let mut updates = controller.subscribe();

        controller.select_session(session("s1", SessionMode::Live, None));
        updates
            .wait_for(|snap| snap.connection == ConnectionState::Connected)
            .await
            .expect("connected");

        controller.cancel();
        controller.cancel();
        assert_eq!(controller.connection_state(), ConnectionState::Disconnected);
    }
}
