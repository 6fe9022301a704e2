//! Signal channel: protocol events, outbound requests and the connection
//! lifecycle (connect, identify device, reconnect, teardown).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::SessionError;
use crate::handle::Handle;
use crate::participants::ParticipantRole;
use crate::resolvers::Credentials;
use crate::session::Session;
use crate::state::{SessionState, SignalStatus};
use crate::transitions::Transition;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalClient {
    pub id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub external_id: Option<String>,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub streams: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalKnocker {
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRoomSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SignalRoom {
    pub clients: Vec<SignalClient>,
    pub knockers: Vec<SignalKnocker>,
    pub session: Option<SignalRoomSession>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientMetadata {
    pub display_name: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnockResolution {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KnockMetadata {
    pub room_key: Option<String>,
    pub room_name: Option<String>,
}

/// Inbound protocol events, delivered in channel order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalEvent {
    Connect,
    Reconnecting,
    Disconnect,
    DeviceIdentified,
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        #[serde(default)]
        self_id: Option<String>,
        #[serde(default)]
        is_locked: bool,
        #[serde(default)]
        room: Option<SignalRoom>,
        #[serde(default)]
        error: Option<String>,
    },
    NewClient {
        client: SignalClient,
    },
    #[serde(rename_all = "camelCase")]
    ClientLeft {
        client_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AudioEnabled {
        client_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    VideoEnabled {
        client_id: String,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    ClientMetadataReceived {
        client_id: String,
        payload: ClientMetadata,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        sender_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    RoomKnocked {
        client_id: String,
        #[serde(default)]
        display_name: String,
    },
    #[serde(rename_all = "camelCase")]
    KnockerLeft {
        client_id: String,
    },
    #[serde(rename_all = "camelCase")]
    KnockHandled {
        client_id: String,
        resolution: KnockResolution,
        #[serde(default)]
        metadata: Option<KnockMetadata>,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareStarted {
        client_id: String,
        stream_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ScreenshareStopped {
        client_id: String,
        stream_id: String,
    },
    #[serde(rename_all = "camelCase")]
    CloudRecordingStarted {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    CloudRecordingStopped,
    #[serde(rename_all = "camelCase")]
    StreamingStarted {
        #[serde(default)]
        started_at: Option<DateTime<Utc>>,
    },
    StreamingStopped,
    #[serde(rename_all = "camelCase")]
    RoomSessionEnded {
        room_session_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_name: String,
    pub room_key: Option<String>,
    pub display_name: String,
    pub organization_id: String,
    pub external_id: Option<String>,
    pub self_id: Option<String>,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnockRoomRequest {
    pub room_name: String,
    pub room_key: Option<String>,
    pub display_name: String,
    pub organization_id: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnockAction {
    Accept,
    Reject,
}

/// Outbound protocol messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalRequest {
    #[serde(rename_all = "camelCase")]
    IdentifyDevice {
        device_credentials: Credentials,
    },
    JoinRoom(JoinRoomRequest),
    KnockRoom(KnockRoomRequest),
    LeaveRoom,
    ChatMessage {
        text: String,
    },
    StartRecording,
    StopRecording,
    #[serde(rename_all = "camelCase")]
    HandleKnock {
        action: KnockAction,
        client_id: String,
    },
    EnableAudio {
        enabled: bool,
    },
    EnableVideo {
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    StartScreenshare {
        stream_id: String,
        has_audio_track: bool,
    },
    #[serde(rename_all = "camelCase")]
    StopScreenshare {
        stream_id: String,
    },
}

/// A live bidirectional channel to the signaling server.
pub trait SignalChannel: Send + Sync {
    fn send(&self, request: SignalRequest) -> Result<(), SessionError>;

    /// Close the channel. The inbound event stream ends afterwards.
    fn disconnect(&self);
}

pub struct SignalLink {
    pub channel: Arc<dyn SignalChannel>,
    pub events: mpsc::UnboundedReceiver<SignalEvent>,
}

pub trait SignalConnector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<SignalLink, SessionError>>;
}

impl From<SignalEvent> for Transition {
    fn from(event: SignalEvent) -> Self {
        match event {
            SignalEvent::Connect => Transition::SignalConnected,
            SignalEvent::Reconnecting => Transition::SignalReconnecting,
            SignalEvent::Disconnect => Transition::SignalTransportDisconnected,
            SignalEvent::DeviceIdentified => Transition::DeviceIdentified,
            SignalEvent::RoomJoined {
                self_id,
                is_locked,
                room,
                error,
            } => Transition::RoomJoined {
                self_id,
                is_locked,
                room,
                error,
            },
            SignalEvent::NewClient { client } => Transition::ParticipantJoined(client),
            SignalEvent::ClientLeft { client_id } => Transition::ParticipantLeft { client_id },
            SignalEvent::AudioEnabled { client_id, enabled } => {
                Transition::AudioEnabledChanged { client_id, enabled }
            }
            SignalEvent::VideoEnabled { client_id, enabled } => {
                Transition::VideoEnabledChanged { client_id, enabled }
            }
            SignalEvent::ClientMetadataReceived { client_id, payload } => {
                Transition::ClientMetadataReceived {
                    client_id,
                    metadata: payload,
                }
            }
            SignalEvent::ChatMessage {
                sender_id,
                text,
                timestamp,
            } => Transition::ChatMessageReceived(crate::chat::ChatMessage::new(
                sender_id, text, timestamp,
            )),
            SignalEvent::RoomKnocked {
                client_id,
                display_name,
            } => Transition::KnockerJoined {
                client_id,
                display_name,
            },
            SignalEvent::KnockerLeft { client_id } => Transition::KnockerLeft { client_id },
            SignalEvent::KnockHandled {
                client_id,
                resolution,
                metadata,
            } => Transition::KnockHandled {
                client_id,
                resolution,
                metadata: metadata.unwrap_or_default(),
            },
            SignalEvent::ScreenshareStarted {
                client_id,
                stream_id,
            } => Transition::ScreenshareStarted {
                client_id,
                stream_id,
            },
            SignalEvent::ScreenshareStopped {
                client_id,
                stream_id,
            } => Transition::ScreenshareStopped {
                client_id,
                stream_id,
            },
            SignalEvent::CloudRecordingStarted { error, started_at } => {
                Transition::CloudRecordingStarted { error, started_at }
            }
            SignalEvent::CloudRecordingStopped => Transition::CloudRecordingStopped,
            SignalEvent::StreamingStarted { started_at } => {
                Transition::StreamingStarted { started_at }
            }
            SignalEvent::StreamingStopped => Transition::StreamingStopped,
            SignalEvent::RoomSessionEnded { room_session_id } => {
                Transition::RoomSessionEnded { room_session_id }
            }
        }
    }
}

/// Also re-arms after the channel closed under a live session.
pub fn should_connect(state: &SessionState) -> bool {
    state.app.wants_to_join && state.signal.status == SignalStatus::Empty
}

pub fn should_identify_device(state: &SessionState) -> bool {
    let signal = &state.signal;
    state.device_credentials.data.is_some()
        && signal.status == SignalStatus::Connected
        && !signal.device_identified
        && !signal.is_identifying_device
}

/// Tear the channel down once the room no longer needs it.
pub fn should_disconnect(state: &SessionState) -> bool {
    !state.app.wants_to_join && state.signal.channel.is_some() && !state.room.status.is_active()
}

/// Send on the current channel, if there is one.
pub(crate) fn send(session: &Session, request: SignalRequest) -> Result<(), SessionError> {
    let channel = session
        .snapshot()
        .signal
        .channel
        .clone()
        .ok_or(SessionError::NotConnected)?;
    channel.send(request)
}

pub(crate) async fn connect(session: &Session, connector: Arc<dyn SignalConnector>) {
    if !session.dispatch_if(should_connect, Transition::SignalConnecting) {
        return;
    }
    let link = match connector.connect().await {
        Ok(link) => link,
        Err(e) => {
            tracing::error!("signal connect failed: {e}");
            session.dispatch(Transition::SignalConnectFailed(e.to_string()));
            return;
        }
    };

    if !session.snapshot().app.wants_to_join {
        tracing::info!("intent withdrawn while connecting; closing fresh channel");
        link.channel.disconnect();
        session.dispatch(Transition::SignalDisconnected);
        return;
    }

    let handle = Handle::new(link.channel);
    session.dispatch(Transition::SignalChannelCreated(handle.clone()));
    tracing::info!(channel = handle.id(), "signal channel open");

    let session = session.clone();
    tokio::spawn(async move {
        event_loop(session, handle, link.events).await;
    });
}

async fn event_loop(
    session: Session,
    channel: Handle<dyn SignalChannel>,
    mut events: mpsc::UnboundedReceiver<SignalEvent>,
) {
    while let Some(event) = events.recv().await {
        if session.snapshot().signal.channel.as_ref() != Some(&channel) {
            tracing::debug!(channel = channel.id(), "dropping event from stale channel");
            continue;
        }
        tracing::debug!(?event, "signal event");
        session.dispatch(Transition::from(event));
    }

    let closed = session.dispatch_if(
        |s| s.signal.channel.as_ref() == Some(&channel),
        Transition::SignalChannelClosed,
    );
    if closed {
        tracing::warn!(channel = channel.id(), "signal channel closed by remote");
    }
    tracing::debug!("signal event loop ended");
}

pub(crate) fn identify_device(session: &Session) {
    let state = session.snapshot();
    let Some(credentials) = state.device_credentials.data.clone() else {
        return;
    };
    if !session.dispatch_if(should_identify_device, Transition::DeviceIdentifying) {
        return;
    }
    let request = SignalRequest::IdentifyDevice {
        device_credentials: credentials,
    };
    // A failed send leaves identification pending; the disconnect that
    // follows resets it.
    if let Err(e) = send(session, request) {
        tracing::warn!("identify_device not sent: {e}");
    }
}

pub(crate) fn disconnect(session: &Session) {
    let Some(channel) = session.snapshot().signal.channel.clone() else {
        return;
    };
    tracing::info!(channel = channel.id(), "closing signal channel");
    session.dispatch(Transition::SignalDisconnected);
    channel.disconnect();
}
