//! WebRTC negotiation against the queue coordinator.
//!
//! The controller builds a receive-only peer connection, submits its offer
//! over REST, then waits for the answer to arrive asynchronously through
//! the queue channel. Media is forced through a TURN relay: in the target
//! networks direct paths rarely survive NAT, so candidate policy trades
//! efficiency for a connection that actually establishes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::api::API;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_remote::TrackRemote;

use crate::api::{ApiError, CoordinatorClient, OfferRequest};
use crate::config::{ClientConfig, ConfigError, IceSettings, websocket_base};
use crate::queue::{EventSink, QueueChannel, QueueConfig, QueueError};

mod ingest;

/// Where the first remote media track is delivered. The core attaches the
/// track handle and nothing more; decoding belongs to the consumer.
pub type MediaSink = mpsc::UnboundedSender<Arc<TrackRemote>>;

/// Progress of one negotiation attempt, owned by the controller and logged
/// on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    LocalDescriptionSet,
    GatheringCandidates,
    OfferSubmitted,
    AwaitingAnswer,
    Connected,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("local description unavailable after candidate gathering")]
    MissingLocalDescription,
}

/// A live, negotiated session. The caller (normally the session
/// supervisor) owns teardown of both halves.
#[derive(Debug)]
pub struct NegotiatedSession {
    pub connection: Arc<RTCPeerConnection>,
    pub job_id: String,
    pub queue: Arc<QueueChannel>,
}

impl NegotiatedSession {
    pub async fn close(&self) {
        self.queue.close();
        if let Err(err) = self.connection.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
        }
    }
}

/// Run one full negotiation attempt for `session_id`.
///
/// Every suspension point is followed by a cancellation check: the token
/// never aborts an in-flight await, it discards the result on resumption
/// and the freshly created resources are closed instead of returned.
pub async fn negotiate(
    api: &CoordinatorClient,
    session_id: &str,
    media: MediaSink,
    events: EventSink,
    cancel: &CancellationToken,
    config: &ClientConfig,
) -> Result<NegotiatedSession, NegotiationError> {
    let queue_endpoint = websocket_base(api.config().base_url())?;
    let mut queue_config = QueueConfig::new(queue_endpoint);
    queue_config.keepalive_interval = config.keepalive_interval;
    queue_config.reconnect_delay = config.reconnect_delay;

    if cancel.is_cancelled() {
        return Err(NegotiationError::Cancelled);
    }

    let mut state = NegotiationState::Idle;
    let engine = build_engine()?;
    let rtc_config = RTCConfiguration {
        ice_servers: ice_servers(&config.ice),
        ice_transport_policy: RTCIceTransportPolicy::Relay,
        ..Default::default()
    };
    let pc = Arc::new(
        engine
            .new_peer_connection(rtc_config)
            .await
            .map_err(to_setup_error)?,
    );

    // The telemetry channel is created before the offer so it is part of
    // the initial SDP; a worker that opens its own channel with the same
    // label lands in the same ingest path.
    let telemetry = pc
        .create_data_channel(
            &config.telemetry_label,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(to_setup_error)?;
    ingest::attach(&telemetry, events.clone());

    let remote_label = config.telemetry_label.clone();
    let remote_events = events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let events = remote_events.clone();
        let label = remote_label.clone();
        Box::pin(async move {
            if channel.label() == label {
                ingest::attach(&channel, events);
            } else {
                tracing::debug!(
                    target = "webrtc",
                    label = channel.label(),
                    "ignoring unexpected data channel"
                );
            }
        })
    }));

    let attached = Arc::new(AtomicBool::new(false));
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let media = media.clone();
        let attached = Arc::clone(&attached);
        Box::pin(async move {
            if attached.swap(true, Ordering::SeqCst) {
                tracing::debug!(
                    target = "webrtc",
                    kind = %track.kind(),
                    "additional remote track ignored"
                );
                return;
            }
            tracing::info!(target = "webrtc", kind = %track.kind(), "remote media track attached");
            let _ = media.send(track);
        })
    }));

    if let Err(err) = pc
        .add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
    {
        return Err(abort_attempt(&pc, None, &mut state, to_setup_error(err)).await);
    }

    let offer = match pc.create_offer(None).await {
        Ok(offer) => offer,
        Err(err) => return Err(abort_attempt(&pc, None, &mut state, to_setup_error(err)).await),
    };
    let mut gather = pc.gathering_complete_promise().await;
    if let Err(err) = pc.set_local_description(offer).await {
        return Err(abort_attempt(&pc, None, &mut state, to_setup_error(err)).await);
    }
    transition(&mut state, NegotiationState::LocalDescriptionSet);

    transition(&mut state, NegotiationState::GatheringCandidates);
    if !wait_for_gathering(&mut gather, config.gather_timeout).await {
        tracing::warn!(
            target = "webrtc",
            timeout_ms = config.gather_timeout.as_millis() as u64,
            "candidate gathering timed out; continuing with a partial candidate set"
        );
    }
    if cancel.is_cancelled() {
        return Err(abort_attempt(&pc, None, &mut state, NegotiationError::Cancelled).await);
    }

    let local = match pc.local_description().await {
        Some(local) => local,
        None => {
            return Err(abort_attempt(
                &pc,
                None,
                &mut state,
                NegotiationError::MissingLocalDescription,
            )
            .await);
        }
    };

    let submitted = api
        .submit_offer(
            session_id,
            OfferRequest {
                sdp: local.sdp.clone(),
                sdp_type: local.sdp_type.to_string(),
            },
        )
        .await;
    if cancel.is_cancelled() {
        return Err(abort_attempt(&pc, None, &mut state, NegotiationError::Cancelled).await);
    }
    let enqueued = match submitted {
        Ok(enqueued) => enqueued,
        Err(err) => return Err(abort_attempt(&pc, None, &mut state, err.into()).await),
    };
    transition(&mut state, NegotiationState::OfferSubmitted);
    tracing::info!(
        target = "webrtc",
        job_id = %enqueued.job_id,
        position = ?enqueued.position,
        "offer enqueued with coordinator"
    );

    let queue = match QueueChannel::open(queue_config, enqueued.job_id.clone(), events) {
        Ok(queue) => queue,
        Err(err) => return Err(abort_attempt(&pc, None, &mut state, err.into()).await),
    };
    transition(&mut state, NegotiationState::AwaitingAnswer);

    let outcome = queue.completion().await;
    if cancel.is_cancelled() {
        return Err(abort_attempt(&pc, Some(&queue), &mut state, NegotiationError::Cancelled).await);
    }
    let answer = match outcome {
        Ok(answer) => answer,
        Err(err) => return Err(abort_attempt(&pc, Some(&queue), &mut state, err.into()).await),
    };

    let description = match RTCSessionDescription::answer(answer.sdp) {
        Ok(description) => description,
        Err(err) => {
            return Err(abort_attempt(&pc, Some(&queue), &mut state, to_setup_error(err)).await);
        }
    };
    if let Err(err) = pc.set_remote_description(description).await {
        return Err(abort_attempt(&pc, Some(&queue), &mut state, to_setup_error(err)).await);
    }
    transition(&mut state, NegotiationState::Connected);
    tracing::info!(target = "webrtc", job_id = %enqueued.job_id, "remote answer applied; session live");

    Ok(NegotiatedSession {
        connection: pc,
        job_id: enqueued.job_id,
        queue,
    })
}

fn transition(state: &mut NegotiationState, next: NegotiationState) {
    tracing::debug!(target = "webrtc", from = ?*state, to = ?next, "negotiation state");
    *state = next;
}

/// Close whatever the attempt has created so far and hand the error back.
async fn abort_attempt(
    pc: &Arc<RTCPeerConnection>,
    queue: Option<&Arc<QueueChannel>>,
    state: &mut NegotiationState,
    err: NegotiationError,
) -> NegotiationError {
    if let Some(queue) = queue {
        queue.close();
    }
    if let Err(close_err) = pc.close().await {
        tracing::debug!(
            target = "webrtc",
            error = %close_err,
            "peer connection close failed during abort"
        );
    }
    let terminal = if matches!(err, NegotiationError::Cancelled) {
        NegotiationState::Closed
    } else {
        NegotiationState::Failed
    };
    transition(state, terminal);
    err
}

/// Wait for candidate gathering to finish, bounded by `limit`. Returns
/// false when the bound expired first; negotiation then proceeds with an
/// incomplete candidate set rather than hanging.
async fn wait_for_gathering(gather: &mut mpsc::Receiver<()>, limit: Duration) -> bool {
    tokio::time::timeout(limit, gather.recv()).await.is_ok()
}

fn build_engine() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn ice_servers(ice: &IceSettings) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    for url in &ice.stun_urls {
        servers.push(RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        });
    }
    if !ice.turn_urls.is_empty() {
        servers.push(RTCIceServer {
            urls: ice.turn_urls.clone(),
            username: ice.turn_username.clone(),
            credential: ice.turn_credential.clone(),
            ..Default::default()
        });
    }
    servers
}

fn to_setup_error(err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Setup(err.to_string())
}
