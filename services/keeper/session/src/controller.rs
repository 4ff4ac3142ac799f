//! Session lifecycle controller
//!
//! This module provides the [`SessionController`], the single task that owns the
//! [`Session`] record. Client events, heartbeat pokes, scheduled reconnects and
//! shutdown requests all reach it through channels, so every state change is
//! made from one execution context and in arrival order.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::classifier::{Disposition, ErrorClassifier};
use crate::client::{
    AuthClient, ClientEvent, Credentials, FailureEvent, FailureSource, LogOnDetails, TokenSink,
    WebSessionToken,
};
use crate::error::{AttemptKind, SessionError, TerminationReason};
use crate::retry::{RetryBudget, RetryPolicy};
use crate::session::{ScheduledReconnect, Session, SessionState};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Trait for observing lifecycle changes
pub trait LifecycleObserver: Send + Sync + fmt::Debug {
    /// State moved `from -> to`
    fn notify_state_changed(&self, from: SessionState, to: SessionState);
    /// A login attempt is starting
    fn notify_login_attempt(&self, attempt: u32, max_attempts: u32);
    /// A reconnect was scheduled
    fn notify_reconnect_scheduled(&self, attempt: u32, max_attempts: u32, delay: std::time::Duration);
    /// A failure was classified
    fn notify_failure(&self, event: &FailureEvent, disposition: Disposition);
    /// The session ended
    fn notify_terminated(&self, reason: &TerminationReason);
}

/// What asked for a login attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOrigin {
    /// Process driver
    Initial,
    /// Heartbeat watchdog
    Heartbeat,
    /// Backoff timer; ignored unless `epoch` matches the pending reconnect
    Scheduled {
        /// Reconnect epoch
        epoch: u64,
    },
}

impl fmt::Display for StartOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartOrigin::Initial => write!(f, "initial"),
            StartOrigin::Heartbeat => write!(f, "heartbeat"),
            StartOrigin::Scheduled { epoch } => write!(f, "scheduled#{}", epoch),
        }
    }
}

/// Requests serialized into the controller task
#[derive(Debug)]
pub(crate) enum Command {
    Start(StartOrigin),
    Shutdown {
        done: oneshot::Sender<TerminationReason>,
    },
}

enum Input {
    Command(Command),
    Client(Option<ClientEvent>),
}

/// Cloneable handle to a running controller
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    token: watch::Receiver<Option<WebSessionToken>>,
}

impl SessionHandle {
    /// Ask the controller to start a login attempt
    pub async fn request_start(&self, origin: StartOrigin) -> Result<(), SessionError> {
        self.commands
            .send(Command::Start(origin))
            .await
            .map_err(|_| SessionError::ControllerUnavailable)
    }

    /// Ask for shutdown; the receiver resolves once the session is terminated
    pub async fn request_shutdown(
        &self,
    ) -> Result<oneshot::Receiver<TerminationReason>, SessionError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { done })
            .await
            .map_err(|_| SessionError::ControllerUnavailable)?;
        Ok(rx)
    }

    /// Shut down and wait for the controller to confirm
    pub async fn shutdown(&self) -> Result<TerminationReason, SessionError> {
        let rx = self.request_shutdown().await?;
        rx.await.map_err(|_| SessionError::ControllerUnavailable)
    }

    /// Latest published state
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Watch the web session token (read-only; replaced at any time)
    pub fn subscribe_token(&self) -> watch::Receiver<Option<WebSessionToken>> {
        self.token.clone()
    }

    /// Whether the controller task is still receiving commands
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Handle wired to bare channels instead of a controller
    #[cfg(test)]
    pub(crate) fn detached(
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Command>, watch::Sender<SessionState>) {
        let (commands, commands_rx) = mpsc::channel(capacity);
        let (state_tx, state) = watch::channel(SessionState::Disconnected);
        let (_token_tx, token) = watch::channel(None);
        (
            Self {
                commands,
                state,
                token,
            },
            commands_rx,
            state_tx,
        )
    }
}

/// Owns the session and drives the auth client
pub struct SessionController {
    client: Arc<dyn AuthClient>,
    credentials: Credentials,
    budget: RetryBudget,
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    session: Session,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::Receiver<ClientEvent>,
    state_tx: watch::Sender<SessionState>,
    token_tx: watch::Sender<Option<WebSessionToken>>,
    token_sinks: Vec<Arc<dyn TokenSink>>,
    observer: Option<Arc<dyn LifecycleObserver>>,
    termination: Option<TerminationReason>,
}

impl fmt::Debug for SessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionController")
            .field("account", &self.credentials.account_name)
            .field("session", &self.session)
            .field("termination", &self.termination)
            .finish()
    }
}

impl SessionController {
    /// Create a controller and its handle.
    ///
    /// `events` is the channel the auth client publishes its lifecycle events on.
    pub fn new(
        client: Arc<dyn AuthClient>,
        credentials: Credentials,
        budget: RetryBudget,
        events: mpsc::Receiver<ClientEvent>,
    ) -> Result<(Self, SessionHandle), SessionError> {
        budget.validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (token_tx, token_rx) = watch::channel(None);

        let handle = SessionHandle {
            commands: commands_tx.clone(),
            state: state_rx,
            token: token_rx,
        };

        let controller = Self {
            client,
            credentials,
            policy: RetryPolicy::from_budget(&budget),
            session: Session::new(&budget),
            budget,
            classifier: ErrorClassifier::default(),
            commands_tx,
            commands_rx,
            events_rx: events,
            state_tx,
            token_tx,
            token_sinks: Vec::new(),
            observer: None,
            termination: None,
        };

        Ok((controller, handle))
    }

    /// Replace the failure classification table
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the backoff policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self.session.current_backoff_delay = policy.base_delay();
        self
    }

    /// Register a collaborator that receives each web session token
    pub fn add_token_sink(&mut self, sink: Arc<dyn TokenSink>) {
        self.token_sinks.push(sink);
    }

    /// Set the lifecycle observer
    pub fn set_observer<T>(&mut self, observer: Arc<T>)
    where
        T: LifecycleObserver + 'static,
    {
        self.observer = Some(observer);
    }

    /// Read-only view of the session record
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Budget in force
    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    /// Run until the session terminates, returning why it ended
    pub async fn run(mut self) -> TerminationReason {
        info!(
            account = %self.credentials.account_name,
            max_login_attempts = self.budget.max_login_attempts,
            max_reconnect_attempts = self.budget.max_reconnect_attempts,
            "Starting session controller"
        );

        if let Err(e) = self.start(StartOrigin::Initial).await {
            warn!("Initial login could not start: {}", e);
        }

        loop {
            if let Some(reason) = self.termination.clone() {
                info!("Session controller stopped: {}", reason);
                return reason;
            }

            let input = tokio::select! {
                biased;

                Some(command) = self.commands_rx.recv() => Input::Command(command),
                event = self.events_rx.recv() => Input::Client(event),
            };

            match input {
                Input::Command(command) => self.handle_command(command).await,
                Input::Client(Some(event)) => self.handle_client_event(event).await,
                Input::Client(None) => {
                    warn!("Auth client event stream closed");
                    self.terminate(TerminationReason::ClientClosed);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start(origin) => {
                if let Err(e) = self.start(origin).await {
                    debug!("Start ({}) ended the session: {}", origin, e);
                }
            }
            Command::Shutdown { done } => {
                let reason = self.shutdown().await;
                if done.send(reason).is_err() {
                    debug!("Shutdown requester went away before completion");
                }
            }
        }
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::LoggedOn => self.on_login_succeeded().await,
            ClientEvent::WebSession { token } => self.on_web_session_established(token).await,
            ClientEvent::Error { code, message } => {
                let source = if self.session.state == SessionState::Connected {
                    FailureSource::Runtime
                } else {
                    FailureSource::Login
                };
                self.on_failure(FailureEvent::new(code, message, source));
            }
            ClientEvent::Disconnected { code, message } => {
                self.on_disconnected(FailureEvent::new(code, message, FailureSource::Disconnect));
            }
        }
    }

    /// Begin a login attempt.
    ///
    /// Acts from `Disconnected`, or from `Reconnecting` when fired by the
    /// pending reconnect timer. Everything else is a no-op, so at most one
    /// login is ever in flight.
    pub async fn start(&mut self, origin: StartOrigin) -> Result<(), SessionError> {
        match (self.session.state, origin) {
            (SessionState::Disconnected, _) => {}
            (SessionState::Reconnecting, StartOrigin::Scheduled { epoch })
                if epoch == self.session.reconnect_epoch => {}
            (state, origin) => {
                match self.session.next_attempt_in() {
                    Some(remaining) => debug!(
                        "Start ({}) ignored in state {}, next attempt in {:?}",
                        origin, state, remaining
                    ),
                    None => debug!("Start ({}) ignored in state {}", origin, state),
                }
                return Ok(());
            }
        }

        // The timer that sent this has already fired; detach it
        self.session.pending_reconnect = None;
        self.session.reconnect_scheduled = false;

        let attempt = match self.session.attempts.record_login() {
            Ok(attempt) => attempt,
            Err(err) => {
                error!("Max login attempts reached");
                self.give_up(err.clone());
                return Err(err);
            }
        };

        self.transition(SessionState::Authenticating);
        let max = self.session.attempts.max_login_attempts();
        info!(attempt, max, origin = %origin, "Attempting to log in (attempt {}/{})", attempt, max);
        if let Some(ref observer) = self.observer {
            observer.notify_login_attempt(attempt, max);
        }

        let two_factor_code = match self.client.auth_code(&self.credentials.shared_secret) {
            Ok(code) => code,
            Err(e) => {
                error!("Failed to generate one-time code: {}", e);
                self.on_request_not_sent(FailureEvent::new(
                    e.code(),
                    e.to_string(),
                    FailureSource::Login,
                ));
                return Ok(());
            }
        };

        let details = LogOnDetails {
            account_name: self.credentials.account_name.clone(),
            password: self.credentials.password.clone(),
            two_factor_code,
        };

        if let Err(e) = self.client.log_on(details).await {
            warn!("Login request could not be sent: {}", e);
            self.on_request_not_sent(FailureEvent::new(
                e.code(),
                e.to_string(),
                FailureSource::Login,
            ));
        }

        Ok(())
    }

    /// Login accepted: reset counters and backoff, mark liveness, go online
    pub async fn on_login_succeeded(&mut self) {
        match self.session.state {
            SessionState::Authenticating | SessionState::Reconnecting => {}
            SessionState::Connected => {
                debug!("Duplicate login confirmation while connected");
                self.session.note_liveness();
                return;
            }
            state => {
                debug!("Login success discarded in state {}", state);
                return;
            }
        }

        self.session.cancel_pending_reconnect();
        self.session.reconnect_scheduled = false;
        self.session.attempts.reset();
        self.session.current_backoff_delay = self.policy.base_delay();
        self.session.note_liveness();
        self.session.confirmations_started = false;
        let session_id = Uuid::new_v4();
        self.session.session_id = Some(session_id);

        self.transition(SessionState::Connected);
        info!(session_id = %session_id, "Logged in");

        if let Err(e) = self.client.announce_online().await {
            warn!("Failed to announce online status: {}", e);
        }
    }

    /// Publish a web session token and start confirmation polling once per connected period
    pub async fn on_web_session_established(&mut self, token: WebSessionToken) {
        if self.session.state == SessionState::Terminated {
            debug!("Web session discarded after termination");
            return;
        }

        info!(web_session = %token.session_id, "Web session established");
        self.token_tx.send_replace(Some(token.clone()));
        for sink in &self.token_sinks {
            sink.apply_token(&token);
            debug!("Applied web session token to {}", sink.name());
        }
        self.session.note_liveness();

        if self.session.state == SessionState::Connected && !self.session.confirmations_started {
            match self
                .client
                .start_confirmation_polling(
                    self.budget.confirmation_interval,
                    &self.credentials.identity_secret,
                )
                .await
            {
                Ok(()) => {
                    self.session.confirmations_started = true;
                    debug!(
                        "Confirmation polling every {:?}",
                        self.budget.confirmation_interval
                    );
                }
                Err(e) => warn!("Failed to start confirmation polling: {}", e),
            }
        }
    }

    /// Classify a failure and act on it
    pub fn on_failure(&mut self, event: FailureEvent) {
        if self.session.state == SessionState::Terminated {
            debug!("Failure {} discarded after termination", event.code);
            return;
        }

        let disposition = self.classifier.classify(event.code);
        if let Some(ref observer) = self.observer {
            observer.notify_failure(&event, disposition);
        }
        let error = SessionError::from(&event);

        match disposition {
            Disposition::Fatal => {
                error!(code = %event.code, source = %event.source, "Fatal error: {}", error);
                self.terminate(TerminationReason::Fatal {
                    code: event.code,
                    message: event.message,
                });
            }
            Disposition::Retryable => {
                warn!(code = %event.code, source = %event.source, "Critical error: {}", error);
                self.schedule_reconnect(&event);
            }
            Disposition::Ignorable => {
                info!(
                    code = %event.code,
                    source = %event.source,
                    "Non-critical error, no reconnect: {}",
                    event.message
                );
            }
        }
    }

    /// Connection dropped
    pub fn on_disconnected(&mut self, event: FailureEvent) {
        match self.session.state {
            SessionState::Connected | SessionState::Authenticating => {
                warn!(
                    code = %event.code,
                    since_liveness = ?self.session.last_liveness().elapsed(),
                    "{}: {}",
                    SessionError::from(&event),
                    event.message
                );
                self.schedule_reconnect(&event);
            }
            state => {
                debug!("Disconnect ({}) ignored in state {}", event.code, state);
            }
        }
    }

    /// Cancel pending work, log off if connected, and terminate
    pub async fn shutdown(&mut self) -> TerminationReason {
        if let Some(ref reason) = self.termination {
            return reason.clone();
        }

        info!(
            since_liveness = ?self.session.last_liveness().elapsed(),
            "Shutting down session in state {}",
            self.session.state
        );
        self.session.cancel_pending_reconnect();
        self.session.reconnect_scheduled = false;

        if self.session.state == SessionState::Connected {
            if let Err(e) = self.client.log_off().await {
                warn!("Log off failed during shutdown: {}", e);
            }
        }

        self.terminate(TerminationReason::ShutdownRequested);
        TerminationReason::ShutdownRequested
    }

    fn schedule_reconnect(&mut self, event: &FailureEvent) {
        if self.session.reconnect_scheduled {
            debug!(
                "Reconnect already scheduled, ignoring {} failure {}",
                event.source, event.code
            );
            return;
        }

        if self.session.attempts.login_exhausted() {
            error!("Max login attempts reached");
            self.terminate(TerminationReason::AttemptLimitExceeded {
                kind: AttemptKind::Login,
                limit: self.session.attempts.max_login_attempts(),
            });
            return;
        }

        let attempt = match self.session.attempts.record_reconnect() {
            Ok(attempt) => attempt,
            Err(err) => {
                error!("Max reconnect attempts reached");
                self.give_up(err);
                return;
            }
        };

        let delay = self.policy.next_delay(attempt);
        self.session.current_backoff_delay = delay;
        self.session.reconnect_scheduled = true;
        self.session.reconnect_epoch += 1;
        let epoch = self.session.reconnect_epoch;

        let commands = self.commands_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Start(StartOrigin::Scheduled { epoch })).await;
        });
        self.session.pending_reconnect = Some(ScheduledReconnect {
            epoch,
            due: Instant::now() + delay,
            handle,
        });

        self.transition(SessionState::Reconnecting);
        let max = self.session.attempts.max_reconnect_attempts();
        info!(attempt, max, delay = ?delay, "Attempting to reconnect in {:?}", delay);
        if let Some(ref observer) = self.observer {
            observer.notify_reconnect_scheduled(attempt, max, delay);
        }
    }

    /// Failure before the login request left the client. Nothing is in
    /// flight, so anything short of fatal goes down the reconnect path.
    fn on_request_not_sent(&mut self, event: FailureEvent) {
        if self.classifier.classify(event.code) == Disposition::Fatal {
            self.on_failure(event);
            return;
        }

        if let Some(ref observer) = self.observer {
            observer.notify_failure(&event, Disposition::Retryable);
        }
        warn!(code = %event.code, "Login not sent, retrying: {}", event.message);
        self.schedule_reconnect(&event);
    }

    fn give_up(&mut self, err: SessionError) {
        match TerminationReason::try_from(err) {
            Ok(reason) => self.terminate(reason),
            Err(other) => error!("Unexpected attempt tracker error: {}", other),
        }
    }

    fn terminate(&mut self, reason: TerminationReason) {
        if self.session.state == SessionState::Terminated {
            return;
        }

        self.session.cancel_pending_reconnect();
        self.session.reconnect_scheduled = false;
        self.transition(SessionState::Terminated);

        if reason.is_clean() {
            info!("Session terminated: {}", reason);
        } else {
            error!("Session terminated: {}", reason);
        }
        if let Some(ref observer) = self.observer {
            observer.notify_terminated(&reason);
        }
        self.termination = Some(reason);
    }

    fn transition(&mut self, to: SessionState) -> bool {
        let from = self.session.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            warn!("Rejected illegal transition {} -> {}", from, to);
            return false;
        }

        self.session.state = to;
        if from == SessionState::Connected {
            self.session.confirmations_started = false;
        }
        self.state_tx.send_replace(to);

        debug!(
            from = %from,
            to = %to,
            login_attempts = self.session.attempts.login_attempts(),
            reconnect_attempts = self.session.attempts.reconnect_attempts(),
            "Session state {} -> {}",
            from,
            to
        );
        if let Some(ref observer) = self.observer {
            observer.notify_state_changed(from, to);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureCode;
    use crate::client::mock::{Call, RecordingClient, RecordingSink};
    use crate::client::ClientError;
    use crate::heartbeat::HeartbeatMonitor;
    use std::sync::Mutex;
    use std::time::Duration;

    fn credentials() -> Credentials {
        Credentials {
            account_name: "bot".to_string(),
            password: "hunter2".to_string(),
            shared_secret: "c2hhcmVk".to_string(),
            identity_secret: "aWRlbnRpdHk=".to_string(),
        }
    }

    fn budget(max_login: u32, max_reconnect: u32) -> RetryBudget {
        RetryBudget {
            max_login_attempts: max_login,
            max_reconnect_attempts: max_reconnect,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
            ..RetryBudget::default()
        }
    }

    fn controller(
        budget: RetryBudget,
    ) -> (
        SessionController,
        SessionHandle,
        Arc<RecordingClient>,
        mpsc::Sender<ClientEvent>,
    ) {
        let client = RecordingClient::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let (controller, handle) =
            SessionController::new(client.clone(), credentials(), budget, events_rx).unwrap();
        (controller, handle, client, events_tx)
    }

    fn timeout_failure() -> FailureEvent {
        FailureEvent::new(FailureCode::Timeout, "timed out", FailureSource::Login)
    }

    fn remote_disconnect() -> FailureEvent {
        FailureEvent::new(
            FailureCode::RemoteDisconnect,
            "closed by remote",
            FailureSource::Disconnect,
        )
    }

    /// Wait for the next command the controller would receive
    async fn next_command(controller: &mut SessionController, within: Duration) -> Option<Command> {
        tokio::time::timeout(within, controller.commands_rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[derive(Debug, Default)]
    struct RecordingObserver {
        transitions: Mutex<Vec<(SessionState, SessionState)>>,
        delays: Mutex<Vec<Duration>>,
        terminations: Mutex<Vec<TerminationReason>>,
    }

    impl LifecycleObserver for RecordingObserver {
        fn notify_state_changed(&self, from: SessionState, to: SessionState) {
            self.transitions.lock().unwrap().push((from, to));
        }
        fn notify_login_attempt(&self, _attempt: u32, _max_attempts: u32) {}
        fn notify_reconnect_scheduled(&self, _attempt: u32, _max_attempts: u32, delay: Duration) {
            self.delays.lock().unwrap().push(delay);
        }
        fn notify_failure(&self, _event: &FailureEvent, _disposition: Disposition) {}
        fn notify_terminated(&self, reason: &TerminationReason) {
            self.terminations.lock().unwrap().push(reason.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_logs_on_with_fresh_code() {
        let (mut controller, handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();

        assert_eq!(controller.session().state(), SessionState::Authenticating);
        assert_eq!(handle.state(), SessionState::Authenticating);
        assert_eq!(controller.session().login_attempts(), 1);
        assert_eq!(
            client.calls(),
            vec![Call::LogOn {
                two_factor_code: "8-1".to_string()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_noop_while_in_flight() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.start(StartOrigin::Initial).await.unwrap();
        controller.start(StartOrigin::Heartbeat).await.unwrap();

        assert_eq!(client.log_on_count(), 1);
        assert_eq!(controller.session().login_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counters_and_backoff() {
        let (mut controller, _handle, _client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        for _ in 0..3 {
            controller.on_failure(timeout_failure());
            let command = next_command(&mut controller, Duration::from_secs(60)).await;
            let Some(Command::Start(origin)) = command else {
                panic!("expected scheduled start");
            };
            controller.start(origin).await.unwrap();
        }
        assert_eq!(controller.session().reconnect_attempts(), 3);
        assert_eq!(controller.session().login_attempts(), 4);
        assert_eq!(controller.session().current_backoff_delay(), Duration::from_secs(4));

        controller.on_login_succeeded().await;

        assert_eq!(controller.session().state(), SessionState::Connected);
        assert_eq!(controller.session().reconnect_attempts(), 0);
        assert_eq!(controller.session().login_attempts(), 0);
        assert_eq!(controller.session().current_backoff_delay(), Duration::from_secs(1));
        assert!(controller.session().session_id().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_schedules_with_backoff() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));
        let observer = Arc::new(RecordingObserver::default());
        controller.set_observer(observer.clone());

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_failure(timeout_failure());

        assert_eq!(controller.session().state(), SessionState::Reconnecting);
        assert_eq!(controller.session().reconnect_attempts(), 1);
        assert!(controller.session().reconnect_scheduled());

        let started = Instant::now();
        let command = next_command(&mut controller, Duration::from_secs(60)).await;
        assert!(matches!(
            command,
            Some(Command::Start(StartOrigin::Scheduled { epoch: 1 }))
        ));
        assert!(started.elapsed() >= Duration::from_secs(1));

        controller.start(StartOrigin::Scheduled { epoch: 1 }).await.unwrap();
        assert_eq!(controller.session().state(), SessionState::Authenticating);
        assert!(!controller.session().reconnect_scheduled());
        assert_eq!(client.log_on_count(), 2);
        assert_eq!(*observer.delays.lock().unwrap(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_terminates() {
        let (mut controller, handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_failure(FailureEvent::new(
            FailureCode::Banned,
            "account banned",
            FailureSource::Login,
        ));

        assert_eq!(controller.session().state(), SessionState::Terminated);
        assert_eq!(handle.state(), SessionState::Terminated);
        assert_eq!(
            controller.termination,
            Some(TerminationReason::Fatal {
                code: FailureCode::Banned,
                message: "account banned".to_string()
            })
        );

        controller.start(StartOrigin::Initial).await.unwrap();
        assert_eq!(client.log_on_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignorable_failure_changes_nothing() {
        let (mut controller, _handle, _client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;
        controller.on_failure(FailureEvent::new(
            FailureCode::LoggedInElsewhere,
            "playing elsewhere",
            FailureSource::Runtime,
        ));

        assert_eq!(controller.session().state(), SessionState::Connected);
        assert_eq!(controller.session().reconnect_attempts(), 0);
        assert!(next_command(&mut controller, Duration::from_secs(120)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connected_schedules_exactly_once() {
        let (mut controller, _handle, _client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;

        controller.on_disconnected(remote_disconnect());
        assert_eq!(controller.session().state(), SessionState::Reconnecting);
        assert_eq!(controller.session().reconnect_attempts(), 1);

        // Redundant disconnect and a failure for the same cause
        controller.on_disconnected(remote_disconnect());
        controller.on_failure(FailureEvent::new(
            FailureCode::NoConnection,
            "no connection",
            FailureSource::Runtime,
        ));
        assert_eq!(controller.session().reconnect_attempts(), 1);

        assert!(next_command(&mut controller, Duration::from_secs(60)).await.is_some());
        assert!(next_command(&mut controller, Duration::from_secs(120)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_with_ignorable_code_still_reconnects_when_connected() {
        let (mut controller, _handle, _client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;
        controller.on_disconnected(FailureEvent::new(
            FailureCode::Other(999),
            "unknown",
            FailureSource::Disconnect,
        ));

        assert_eq!(controller.session().state(), SessionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_authenticating_reconnects() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));

        // Nothing to lose before the first login
        controller.on_disconnected(remote_disconnect());
        assert_eq!(controller.session().state(), SessionState::Disconnected);
        assert!(!controller.session().reconnect_scheduled());

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_disconnected(remote_disconnect());

        assert_eq!(controller.session().state(), SessionState::Reconnecting);
        assert_eq!(controller.session().reconnect_attempts(), 1);

        let Some(Command::Start(origin)) = next_command(&mut controller, Duration::from_secs(60)).await
        else {
            panic!("expected scheduled start");
        };
        controller.start(origin).await.unwrap();
        assert_eq!(client.log_on_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_budget_terminates_without_scheduling() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 2));

        controller.start(StartOrigin::Initial).await.unwrap();
        for _ in 0..2 {
            controller.on_failure(timeout_failure());
            let Some(Command::Start(origin)) =
                next_command(&mut controller, Duration::from_secs(60)).await
            else {
                panic!("expected scheduled start");
            };
            controller.start(origin).await.unwrap();
        }
        assert_eq!(controller.session().reconnect_attempts(), 2);

        controller.on_failure(timeout_failure());

        assert_eq!(controller.session().state(), SessionState::Terminated);
        assert_eq!(controller.session().reconnect_attempts(), 2);
        assert_eq!(
            controller.termination,
            Some(TerminationReason::AttemptLimitExceeded {
                kind: AttemptKind::Reconnect,
                limit: 2
            })
        );
        assert!(next_command(&mut controller, Duration::from_secs(120)).await.is_none());
        assert_eq!(client.log_on_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tenth_failed_login_terminates() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 20));

        controller.start(StartOrigin::Initial).await.unwrap();
        for attempt in 1..10 {
            controller.on_failure(timeout_failure());
            assert_eq!(controller.session().state(), SessionState::Reconnecting, "attempt {}", attempt);
            let Some(Command::Start(origin)) =
                next_command(&mut controller, Duration::from_secs(120)).await
            else {
                panic!("expected scheduled start");
            };
            controller.start(origin).await.unwrap();
        }
        assert_eq!(controller.session().login_attempts(), 10);

        controller.on_failure(timeout_failure());

        assert_eq!(controller.session().state(), SessionState::Terminated);
        assert_eq!(
            controller.termination,
            Some(TerminationReason::AttemptLimitExceeded {
                kind: AttemptKind::Login,
                limit: 10
            })
        );
        assert!(controller.session().pending_reconnect.is_none());
        assert!(next_command(&mut controller, Duration::from_secs(120)).await.is_none());
        assert_eq!(client.log_on_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_reconnecting_cancels_timer() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_failure(timeout_failure());
        assert_eq!(controller.session().state(), SessionState::Reconnecting);

        let reason = controller.shutdown().await;
        assert_eq!(reason, TerminationReason::ShutdownRequested);
        assert_eq!(controller.session().state(), SessionState::Terminated);

        // Well past the scheduled delay
        assert!(next_command(&mut controller, Duration::from_secs(300)).await.is_none());
        controller.start(StartOrigin::Scheduled { epoch: 1 }).await.unwrap();
        assert_eq!(client.log_on_count(), 1);
        assert_eq!(client.log_off_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_connected_logs_off() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;
        controller.shutdown().await;

        assert_eq!(client.log_off_count(), 1);

        // Late success after shutdown must not revive the session
        controller.on_login_succeeded().await;
        assert_eq!(controller.session().state(), SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_scheduled_start_is_ignored() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_failure(timeout_failure());
        controller.on_login_succeeded().await;
        controller.on_disconnected(remote_disconnect());
        assert_eq!(controller.session().reconnect_epoch, 2);

        controller.start(StartOrigin::Scheduled { epoch: 1 }).await.unwrap();
        assert_eq!(controller.session().state(), SessionState::Reconnecting);
        assert_eq!(client.log_on_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_web_session_updates_token_and_polls_once() {
        let (mut controller, handle, client, _events) = controller(budget(10, 5));
        let sink = Arc::new(RecordingSink::default());
        controller.add_token_sink(sink.clone());
        let token_rx = handle.subscribe_token();

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;

        let first = WebSessionToken {
            session_id: "one".to_string(),
            cookies: vec!["a=1".to_string()],
        };
        let second = WebSessionToken {
            session_id: "two".to_string(),
            cookies: vec!["a=2".to_string()],
        };
        controller.on_web_session_established(first.clone()).await;
        controller.on_web_session_established(second.clone()).await;

        assert_eq!(*token_rx.borrow(), Some(second.clone()));
        assert_eq!(*sink.tokens.lock().unwrap(), vec![first, second]);
        let polls = client
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::ConfirmationPolling { .. }))
            .count();
        assert_eq!(polls, 1);
        assert_eq!(controller.session().state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_on_error_is_treated_as_login_failure() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));
        *client.log_on_error.lock().unwrap() = Some(crate::client::ClientError::Transport(
            "connection refused".to_string(),
        ));

        controller.start(StartOrigin::Initial).await.unwrap();

        assert_eq!(controller.session().state(), SessionState::Reconnecting);
        assert_eq!(controller.session().reconnect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_transitions() {
        let (mut controller, _handle, _client, _events) = controller(budget(10, 5));
        let observer = Arc::new(RecordingObserver::default());
        controller.set_observer(observer.clone());

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;
        controller.shutdown().await;

        assert_eq!(
            *observer.transitions.lock().unwrap(),
            vec![
                (SessionState::Disconnected, SessionState::Authenticating),
                (SessionState::Authenticating, SessionState::Connected),
                (SessionState::Connected, SessionState::Terminated),
            ]
        );
        assert_eq!(
            *observer.terminations.lock().unwrap(),
            vec![TerminationReason::ShutdownRequested]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_recovers_then_shuts_down() {
        let (events_tx, events_rx) = mpsc::channel(64);
        let client = RecordingClient::scripted(
            events_tx.clone(),
            vec![
                vec![ClientEvent::Error {
                    code: FailureCode::ServiceUnavailable,
                    message: "busy".to_string(),
                }],
                vec![
                    ClientEvent::LoggedOn,
                    ClientEvent::WebSession {
                        token: WebSessionToken {
                            session_id: "sid".to_string(),
                            cookies: vec![],
                        },
                    },
                ],
            ],
        );
        let (controller, handle) =
            SessionController::new(client.clone(), credentials(), budget(10, 5), events_rx)
                .unwrap();

        let task = tokio::spawn(controller.run());

        let mut state = handle.subscribe_state();
        state
            .wait_for(|s| *s == SessionState::Connected)
            .await
            .unwrap();
        assert_eq!(client.log_on_count(), 2);

        let reason = handle.shutdown().await.unwrap();
        assert_eq!(reason, TerminationReason::ShutdownRequested);
        assert_eq!(task.await.unwrap(), TerminationReason::ShutdownRequested);
        assert_eq!(client.log_off_count(), 1);
        assert!(!handle.is_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_reports_client_closed() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let client = RecordingClient::new();
        let (controller, _handle) =
            SessionController::new(client, credentials(), budget(10, 5), events_rx).unwrap();
        drop(events_tx);

        assert_eq!(controller.run().await, TerminationReason::ClientClosed);
    }

    fn announce_count(client: &RecordingClient) -> usize {
        client
            .calls()
            .iter()
            .filter(|c| **c == Call::AnnounceOnline)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsent_login_with_ignorable_code_still_reconnects() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));
        *client.log_on_error.lock().unwrap() = Some(ClientError::Rejected {
            code: FailureCode::LoggedInElsewhere,
            message: "session in use".to_string(),
        });

        controller.start(StartOrigin::Initial).await.unwrap();

        assert_eq!(controller.session().state(), SessionState::Reconnecting);
        assert_eq!(controller.session().reconnect_attempts(), 1);

        *client.log_on_error.lock().unwrap() = None;
        let Some(Command::Start(origin)) =
            next_command(&mut controller, Duration::from_secs(60)).await
        else {
            panic!("expected scheduled start");
        };
        controller.start(origin).await.unwrap();

        assert_eq!(controller.session().state(), SessionState::Authenticating);
        assert_eq!(client.log_on_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsent_login_with_fatal_code_terminates() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));
        *client.log_on_error.lock().unwrap() = Some(ClientError::Rejected {
            code: FailureCode::Banned,
            message: "banned".to_string(),
        });

        controller.start(StartOrigin::Initial).await.unwrap();

        assert_eq!(controller.session().state(), SessionState::Terminated);
        assert_eq!(
            controller.termination,
            Some(TerminationReason::Fatal {
                code: FailureCode::Banned,
                message: "rejected (banned): banned".to_string()
            })
        );
        assert_eq!(client.log_on_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_requests_never_wedge_in_authenticating() {
        let (events_tx, events_rx) = mpsc::channel(8);
        let client = RecordingClient::new();
        *client.log_on_error.lock().unwrap() = Some(ClientError::Rejected {
            code: FailureCode::LoggedInElsewhere,
            message: "session in use".to_string(),
        });
        let (controller, handle) =
            SessionController::new(client.clone(), credentials(), budget(10, 5), events_rx)
                .unwrap();

        let heartbeat = HeartbeatMonitor::new(handle.clone(), Duration::from_secs(60)).spawn();
        let task = tokio::spawn(controller.run());

        let reason = tokio::time::timeout(Duration::from_secs(3600), task)
            .await
            .expect("controller gave up within the hour")
            .unwrap();

        assert_eq!(
            reason,
            TerminationReason::AttemptLimitExceeded {
                kind: AttemptKind::Reconnect,
                limit: 5
            }
        );
        assert_eq!(client.log_on_count(), 6);
        assert_eq!(handle.state(), SessionState::Terminated);
        heartbeat.await.unwrap();
        drop(events_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_announces_online_once_per_connected_period() {
        let (mut controller, _handle, client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        controller.on_login_succeeded().await;
        controller.on_login_succeeded().await;
        assert_eq!(announce_count(&client), 1);

        controller.on_disconnected(remote_disconnect());
        let Some(Command::Start(origin)) =
            next_command(&mut controller, Duration::from_secs(60)).await
        else {
            panic!("expected scheduled start");
        };
        controller.start(origin).await.unwrap();
        controller.on_login_succeeded().await;

        assert_eq!(announce_count(&client), 2);
        assert_eq!(controller.session().state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_and_web_session_refresh_liveness() {
        let (mut controller, _handle, _client, _events) = controller(budget(10, 5));

        controller.start(StartOrigin::Initial).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        controller.on_login_succeeded().await;
        assert_eq!(controller.session().last_liveness(), Instant::now());

        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(
            controller.session().last_liveness().elapsed(),
            Duration::from_secs(90)
        );
        controller
            .on_web_session_established(WebSessionToken {
                session_id: "sid".to_string(),
                cookies: vec![],
            })
            .await;
        assert_eq!(controller.session().last_liveness(), Instant::now());
    }
}
