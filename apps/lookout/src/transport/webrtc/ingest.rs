//! Telemetry ingestion over the peer connection's data channel.
//!
//! The worker streams detection envelopes on a channel labeled for
//! telemetry. Whichever side opens the channel, inbound messages route
//! through [`attach`] into the session's event sink. Telemetry is lossy by
//! contract: anything unparseable is logged and dropped so a bad frame can
//! never disturb the media session.

use std::sync::Arc;

use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;

use crate::protocol::QueueEvent;
use crate::queue::EventSink;

pub(crate) fn attach(channel: &Arc<RTCDataChannel>, events: EventSink) {
    let label = channel.label().to_string();

    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        let label = open_label.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", label = %label, "telemetry channel open");
        })
    }));

    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        let label = close_label.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", label = %label, "telemetry channel closed");
        })
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let events = events.clone();
        let label = label.clone();
        Box::pin(async move {
            if let Some(event) = telemetry_event(&message.data, &label) {
                let _ = events.send(event);
            }
        })
    }));
}

fn telemetry_event(raw: &[u8], label: &str) -> Option<QueueEvent> {
    match serde_json::from_slice::<QueueEvent>(raw) {
        Ok(event @ QueueEvent::Logs { .. }) => Some(event),
        Ok(other) => {
            tracing::debug!(
                target = "webrtc",
                label = %label,
                event = ?other,
                "dropping non-telemetry payload on telemetry channel"
            );
            None
        }
        Err(err) => {
            tracing::debug!(
                target = "webrtc",
                label = %label,
                error = %err,
                "discarding malformed telemetry payload"
            );
            None
        }
    }
}
