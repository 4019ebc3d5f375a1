//! Realtime subscription client.
//!
//! [`RealtimeClient`] opens one long-lived streaming GET against the
//! backend's realtime endpoint, waits for the server handshake, registers
//! topic interest with a control request, and then delivers decoded events
//! to a caller-supplied handler until the subscription is cancelled.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::realtime::proto::{self, Event, SseFrame, SubscribeCommand};
use crate::session::AuthError;
use crate::transport::AuthTransport;

/// Streaming endpoint path on the backend. Used for both the event stream
/// GET and the subscription control POST.
pub const REALTIME_PATH: &str = "/api/realtime";

pub struct RealtimeDefaults;

impl RealtimeDefaults {
    /// Deadline covering the handshake plus the control request confirmation.
    pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    /// Single deadline for the whole subscribe sequence: stream connect,
    /// handshake, and control request acknowledgement.
    pub subscribe_timeout: Duration,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            subscribe_timeout: RealtimeDefaults::SUBSCRIBE_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum RealtimeError {
    /// Failure on the stream connection or the control request.
    #[error("realtime transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The session could not produce a token for the connection.
    #[error("realtime auth error: {0}")]
    Auth(#[from] AuthError),
    /// The stream opened but the first message was not a usable handshake.
    #[error("realtime handshake failed: {0}")]
    Handshake(String),
    /// The backend refused the subscription control request.
    #[error("subscription rejected ({status}): {message}")]
    SubscriptionRejected { status: StatusCode, message: String },
    /// A single event payload could not be decoded. Later events are
    /// unaffected.
    #[error("malformed event payload: {0}")]
    Decode(serde_json::Error),
    /// The subscription was cancelled through its token.
    #[error("subscription cancelled")]
    Cancelled,
    /// The subscribe sequence did not complete within its deadline.
    #[error("timed out waiting for subscription confirmation")]
    Timeout,
    /// The stream or its tasks ended in a way the protocol does not allow.
    #[error("realtime protocol error: {0}")]
    Protocol(String),
}

/// Handler invoked for every decoded event and for per-event decode
/// failures. Stream-fatal errors after a confirmed subscribe arrive here
/// too, once, right before delivery stops.
pub type EventHandler = Arc<dyn Fn(Result<Event, RealtimeError>) + Send + Sync>;

#[derive(Clone)]
pub struct RealtimeClient {
    transport: AuthTransport,
    options: RealtimeOptions,
}

impl RealtimeClient {
    pub fn new(transport: AuthTransport) -> Self {
        Self::with_options(transport, RealtimeOptions::default())
    }

    pub fn with_options(transport: AuthTransport, options: RealtimeOptions) -> Self {
        Self { transport, options }
    }

    /// Subscribes to `topics` with a token nobody else cancels.
    pub async fn subscribe<F>(
        &self,
        topics: impl IntoIterator<Item = impl Into<String>>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Result<Event, RealtimeError>) + Send + Sync + 'static,
    {
        self.subscribe_with_cancel(&CancellationToken::new(), topics, handler)
            .await
    }

    /// Subscribes to `topics`, tying the subscription's lifetime to `parent`.
    ///
    /// Opens the event stream, waits for the server's `connect` handshake,
    /// and registers the topics with a control request. Returns once the
    /// backend acknowledged the registration; events observed from the
    /// handshake onwards are already delivered to `handler` in stream order.
    ///
    /// Cancelling `parent` (or the returned subscription) closes the stream.
    /// A `parent` that is already cancelled fails fast without opening a
    /// connection.
    pub async fn subscribe_with_cancel<F>(
        &self,
        parent: &CancellationToken,
        topics: impl IntoIterator<Item = impl Into<String>>,
        handler: F,
    ) -> Result<Subscription, RealtimeError>
    where
        F: Fn(Result<Event, RealtimeError>) + Send + Sync + 'static,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        if topics.is_empty() {
            return Err(RealtimeError::Protocol(
                "at least one topic is required".to_string(),
            ));
        }
        if parent.is_cancelled() {
            return Err(RealtimeError::Cancelled);
        }

        let handler: EventHandler = Arc::new(handler);
        let cancel = parent.child_token();
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let reader = tokio::spawn(stream_worker(
            self.transport.clone(),
            handler,
            handshake_tx,
            cancel.clone(),
        ));
        let control = tokio::spawn(control_worker(
            self.transport.clone(),
            topics.clone(),
            handshake_rx,
            ready_tx,
            cancel.clone(),
        ));

        let outcome = tokio::select! {
            confirmed = ready_rx => match confirmed {
                Ok(Ok(client_id)) => Ok(client_id),
                Ok(Err(err)) => Err(err),
                // The control task dropped its sender. That happens on
                // cancellation too, so prefer reporting that.
                Err(_) if cancel.is_cancelled() => Err(RealtimeError::Cancelled),
                Err(_) => Err(RealtimeError::Protocol(
                    "control task stopped before confirming the subscription".to_string(),
                )),
            },
            _ = cancel.cancelled() => Err(RealtimeError::Cancelled),
            _ = tokio::time::sleep(self.options.subscribe_timeout) => Err(RealtimeError::Timeout),
        };

        match outcome {
            Ok(client_id) => {
                debug!(client_id = %client_id, topics = topics.len(), "subscription confirmed");
                Ok(Subscription {
                    topics,
                    client_id,
                    cancel,
                    reader: Some(reader),
                })
            }
            Err(err) => {
                // Tear both tasks down before reporting, so a failed
                // subscribe never leaves a half-open stream behind.
                cancel.cancel();
                let _ = control.await;
                let _ = reader.await;
                Err(err)
            }
        }
    }
}

/// A confirmed realtime subscription.
///
/// Dropping the handle closes the stream. Prefer [`Subscription::unsubscribe`]
/// to also wait until the read loop has fully stopped.
#[derive(Debug)]
pub struct Subscription {
    topics: Vec<String>,
    client_id: String,
    cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Topics this subscription registered.
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Connection identifier the backend assigned during the handshake.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Closes the stream and waits for the read loop to finish. After this
    /// returns, the handler will not be invoked again.
    pub async fn unsubscribe(mut self) {
        self.cancel.cancel();
        if let Some(reader) = self.reader.take() {
            let _ = reader.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens the stream, forwards the handshake, then delivers events until the
/// stream ends or the token fires.
async fn stream_worker(
    transport: AuthTransport,
    handler: EventHandler,
    handshake_tx: oneshot::Sender<Result<String, RealtimeError>>,
    cancel: CancellationToken,
) {
    let response = match open_event_stream(&transport, &cancel).await {
        Ok(Some(response)) => response,
        Ok(None) => return,
        Err(err) => {
            let _ = handshake_tx.send(Err(err));
            return;
        }
    };

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut carry = Vec::new();
    let mut handshake_tx = Some(handshake_tx);

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("event stream cancelled");
                return;
            }
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(chunk)) => {
                proto::append_chunk(&mut buffer, &mut carry, &chunk);
                while let Some(block) = proto::next_block(&mut buffer) {
                    let Some(frame) = proto::parse_frame(&block) else {
                        continue;
                    };
                    if frame.is_keep_alive() {
                        continue;
                    }
                    if let Some(tx) = handshake_tx.take() {
                        let handshake = handshake_from(&frame);
                        let failed = handshake.is_err();
                        let _ = tx.send(handshake);
                        if failed {
                            // A bad first frame is terminal. Stop reading so
                            // frames pipelined behind it are never delivered.
                            return;
                        }
                        continue;
                    }
                    if frame.is_connect() {
                        // Repeated handshake frames are control noise, not
                        // record events.
                        continue;
                    }
                    deliver(&handler, &frame);
                }
            }
            Some(Err(err)) => {
                report_stream_end(&mut handshake_tx, &handler, RealtimeError::Transport(err));
                return;
            }
            None => {
                report_stream_end(
                    &mut handshake_tx,
                    &handler,
                    RealtimeError::Protocol("event stream ended unexpectedly".to_string()),
                );
                return;
            }
        }
    }
}

/// Waits for the handshake from the stream task, then registers the topics.
async fn control_worker(
    transport: AuthTransport,
    topics: Vec<String>,
    handshake_rx: oneshot::Receiver<Result<String, RealtimeError>>,
    ready_tx: oneshot::Sender<Result<String, RealtimeError>>,
    cancel: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = cancel.cancelled() => return,
        handshake = handshake_rx => handshake,
    };
    let client_id = match handshake {
        Ok(Ok(client_id)) => client_id,
        Ok(Err(err)) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
        Err(_) => {
            let _ = ready_tx.send(Err(RealtimeError::Protocol(
                "stream task stopped before the handshake".to_string(),
            )));
            return;
        }
    };
    debug!(client_id = %client_id, "handshake received, registering topics");
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = send_subscribe_request(&transport, &client_id, &topics) => outcome,
    };
    let _ = ready_tx.send(outcome.map(|()| client_id));
}

async fn open_event_stream(
    transport: &AuthTransport,
    cancel: &CancellationToken,
) -> Result<Option<reqwest::Response>, RealtimeError> {
    let builder = transport
        .request(Method::GET, REALTIME_PATH)
        .await?
        .header(header::ACCEPT, "text/event-stream");
    let response = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        response = builder.send() => response?,
    };
    let status = response.status();
    if !status.is_success() {
        return Err(RealtimeError::Protocol(format!(
            "event stream request returned status {status}"
        )));
    }
    Ok(Some(response))
}

async fn send_subscribe_request(
    transport: &AuthTransport,
    client_id: &str,
    topics: &[String],
) -> Result<(), RealtimeError> {
    let command = SubscribeCommand {
        client_id: client_id.to_string(),
        subscriptions: topics.to_vec(),
    };
    let response = transport
        .request(Method::POST, REALTIME_PATH)
        .await?
        .json(&command)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RealtimeError::SubscriptionRejected {
            status,
            message: summarize_error_body(&body),
        });
    }
    Ok(())
}

fn handshake_from(frame: &SseFrame) -> Result<String, RealtimeError> {
    if !frame.is_connect() {
        return Err(RealtimeError::Handshake(format!(
            "expected a {} event first, got {}",
            proto::CONNECT_EVENT,
            frame.name.as_deref().unwrap_or("an unnamed event"),
        )));
    }
    match proto::decode_connect(frame) {
        Ok(client_id) if !client_id.is_empty() => Ok(client_id),
        Ok(_) => Err(RealtimeError::Handshake(
            "connect event carried an empty client id".to_string(),
        )),
        Err(err) => Err(RealtimeError::Handshake(format!(
            "malformed connect event: {err}"
        ))),
    }
}

fn deliver(handler: &EventHandler, frame: &SseFrame) {
    match Event::from_text(&frame.data) {
        Ok(event) => handler(Ok(event)),
        Err(err) => handler(Err(RealtimeError::Decode(err))),
    }
}

/// Routes a stream-terminating error. Before the handshake it belongs to the
/// pending subscribe call; afterwards the subscriber hears about it through
/// the handler.
fn report_stream_end(
    handshake_tx: &mut Option<oneshot::Sender<Result<String, RealtimeError>>>,
    handler: &EventHandler,
    err: RealtimeError,
) {
    match handshake_tx.take() {
        Some(tx) => {
            let _ = tx.send(Err(err));
        }
        None => {
            warn!(error = %err, "event stream terminated");
            handler(Err(err));
        }
    }
}

const ERROR_BODY_SNIPPET_LEN: usize = 220;

fn summarize_error_body(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        message: Option<String>,
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            if !message.is_empty() {
                return message;
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty error body".to_string();
    }
    trimmed.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::session::{CredentialRefresher, Principal, SessionOptions, SessionStore};

    struct NoRefresh;

    #[async_trait]
    impl CredentialRefresher for NoRefresh {
        async fn refresh(&self, _principal: &Principal) -> Result<SecretString, AuthError> {
            Err(AuthError::Transport("refresh disabled in tests".to_string()))
        }
    }

    fn client() -> RealtimeClient {
        let session = SessionStore::new(Arc::new(NoRefresh), SessionOptions::default());
        session.set(
            SecretString::new("tok".to_string()),
            Principal::admin("admin@example.com", SecretString::new("pw".into())),
        );
        // Nothing in these tests reaches the network.
        let transport = AuthTransport::new("http://127.0.0.1:9", session).unwrap();
        RealtimeClient::new(transport)
    }

    #[test]
    fn default_subscribe_timeout_is_thirty_seconds() {
        assert_eq!(
            RealtimeOptions::default().subscribe_timeout,
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn subscribe_rejects_an_empty_topic_list() {
        let err = client()
            .subscribe(Vec::<String>::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Protocol(_)));
    }

    #[tokio::test]
    async fn subscribe_fails_fast_on_a_cancelled_token() {
        let parent = CancellationToken::new();
        parent.cancel();
        let err = client()
            .subscribe_with_cancel(&parent, ["posts"], |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Cancelled));
    }

    #[test]
    fn handshake_requires_a_connect_event() {
        let frame = SseFrame {
            name: Some("update".to_string()),
            data: "{}".to_string(),
        };
        let err = handshake_from(&frame).unwrap_err();
        assert!(matches!(err, RealtimeError::Handshake(_)));

        let unnamed = SseFrame {
            name: None,
            data: "{\"clientId\":\"abc\"}".to_string(),
        };
        assert!(matches!(
            handshake_from(&unnamed),
            Err(RealtimeError::Handshake(_))
        ));
    }

    #[test]
    fn handshake_rejects_malformed_or_empty_client_ids() {
        let empty = SseFrame {
            name: Some(proto::CONNECT_EVENT.to_string()),
            data: "{\"clientId\":\"\"}".to_string(),
        };
        assert!(matches!(
            handshake_from(&empty),
            Err(RealtimeError::Handshake(_))
        ));

        let garbage = SseFrame {
            name: Some(proto::CONNECT_EVENT.to_string()),
            data: "not json".to_string(),
        };
        assert!(matches!(
            handshake_from(&garbage),
            Err(RealtimeError::Handshake(_))
        ));
    }

    #[test]
    fn handshake_accepts_a_valid_connect_frame() {
        let frame = SseFrame {
            name: Some(proto::CONNECT_EVENT.to_string()),
            data: "{\"clientId\":\"abc123\"}".to_string(),
        };
        assert_eq!(handshake_from(&frame).unwrap(), "abc123");
    }
}
