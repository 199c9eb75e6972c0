//! Session lifecycle supervision.
//!
//! One supervisor owns at most one negotiated session at a time. Teardown
//! is race-free under cancellation: an attempt that is still in flight when
//! cancellation arrives closes the resources it created instead of
//! installing them, and `shutdown` is safe from any state, any number of
//! times.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::api::CoordinatorClient;
use crate::config::ClientConfig;
use crate::queue::EventSink;
use crate::transport::webrtc::{MediaSink, NegotiatedSession, NegotiationError, negotiate};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error("session cancelled")]
    Cancelled,
}

pub struct SessionSupervisor {
    cancel: CancellationToken,
    active: AsyncMutex<Option<NegotiatedSession>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            active: AsyncMutex::new(None),
        }
    }

    /// Token observed by the negotiation attempt; exposed so a binary can
    /// wire external teardown hooks to it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Negotiate, install, and hold one session until the peer connection
    /// ends or the supervisor is cancelled. `Ok(())` means the session ran
    /// and ended on its own; resources are released on every exit path.
    pub async fn run(
        &self,
        api: &CoordinatorClient,
        session_id: &str,
        media: MediaSink,
        events: EventSink,
        config: &ClientConfig,
    ) -> Result<(), SessionError> {
        let negotiated = match negotiate(api, session_id, media, events, &self.cancel, config).await
        {
            Ok(session) => session,
            Err(NegotiationError::Cancelled) => return Err(SessionError::Cancelled),
            Err(err) => return Err(err.into()),
        };

        if self.cancel.is_cancelled() {
            // Cancellation landed after the attempt's last check; discard
            // the fresh resources instead of installing them.
            negotiated.close().await;
            return Err(SessionError::Cancelled);
        }

        let (state_tx, mut state_rx) = watch::channel(RTCPeerConnectionState::New);
        let state_tx = Arc::new(state_tx);
        let queue = Arc::clone(&negotiated.queue);
        negotiated
            .connection
            .on_peer_connection_state_change(Box::new(move |state| {
                let queue = Arc::clone(&queue);
                let state_tx = Arc::clone(&state_tx);
                Box::pin(async move {
                    tracing::debug!(target = "session", state = ?state, "peer connection state changed");
                    if is_terminal(state) {
                        queue.close();
                    }
                    let _ = state_tx.send(state);
                })
            }));

        let job_id = negotiated.job_id.clone();
        *self.active.lock().await = Some(negotiated);
        tracing::info!(target = "session", job_id = %job_id, "session installed");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown().await;
                    return Err(SessionError::Cancelled);
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        self.teardown().await;
                        return Ok(());
                    }
                    let state = *state_rx.borrow();
                    if is_terminal(state) {
                        tracing::info!(
                            target = "session",
                            job_id = %job_id,
                            state = ?state,
                            "peer connection ended"
                        );
                        self.teardown().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Cancel and release. Idempotent from any state.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.teardown().await;
    }

    async fn teardown(&self) {
        if let Some(session) = self.active.lock().await.take() {
            tracing::info!(
                target = "session",
                job_id = %session.job_id,
                "tearing down session resources"
            );
            session.close().await;
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn is_terminal(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Failed
            | RTCPeerConnectionState::Disconnected
            | RTCPeerConnectionState::Closed
    )
}
