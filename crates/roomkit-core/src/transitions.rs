//! Named state transitions and the reducer that applies them.
//!
//! `reduce` is pure: it never calls collaborators and never fails. A
//! transition that does not apply to the current state (a late event from
//! a previous room, a duplicate roster event) leaves the state unchanged.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::admission::{StreamState, StreamUpdate};
use crate::chat::ChatMessage;
use crate::devices::{DeviceInfo, MediaStream, TrackKind};
use crate::errors::DeviceError;
use crate::handle::Handle;
use crate::participants::{RemoteParticipant, StreamType, WaitingParticipant};
use crate::resolvers::{Credentials, Organization};
use crate::room::ROOM_LOCKED;
use crate::signal::{
    ClientMetadata, KnockMetadata, KnockResolution, SignalChannel, SignalClient, SignalRoom,
};
use crate::state::{
    AppIntent, LocalMediaStatus, RecordingStatus, RoomSession, RoomStatus, ScreenshareStatus,
    SessionState, SignalStatus, StreamOwnership, TransportStatus,
};
use crate::transport::RtcManager;

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    AppStarted(AppIntent),
    AppStopped,

    DeviceCredentialsRequested,
    DeviceCredentialsFulfilled(Credentials),
    DeviceCredentialsRejected(String),
    OrganizationRequested,
    OrganizationFulfilled(Organization),
    OrganizationRejected(String),

    SignalConnecting,
    SignalChannelCreated(Handle<dyn SignalChannel>),
    SignalConnectFailed(String),
    SignalConnected,
    SignalReconnecting,
    /// The channel dropped but may come back on its own.
    SignalTransportDisconnected,
    /// The channel is gone for good.
    SignalDisconnected,
    /// The channel's event stream ended without us closing it.
    SignalChannelClosed,
    DeviceIdentifying,
    DeviceIdentified,

    RoomConnecting,
    RoomJoinFailed(String),
    RoomKnocking,
    RoomJoined {
        self_id: Option<String>,
        is_locked: bool,
        room: Option<SignalRoom>,
        error: Option<String>,
    },
    RoomDisconnecting,
    RoomLeft,
    RoomSessionEnded {
        room_session_id: String,
    },

    ParticipantJoined(SignalClient),
    ParticipantLeft {
        client_id: String,
    },
    AudioEnabledChanged {
        client_id: String,
        enabled: bool,
    },
    VideoEnabledChanged {
        client_id: String,
        enabled: bool,
    },
    ClientMetadataReceived {
        client_id: String,
        metadata: ClientMetadata,
    },
    ScreenshareStarted {
        client_id: String,
        stream_id: String,
    },
    ScreenshareStopped {
        client_id: String,
        stream_id: String,
    },
    RemoteStreamAdded {
        client_id: String,
        stream: Arc<MediaStream>,
        stream_type: Option<StreamType>,
    },

    AcceptingStreams,
    StreamBatchApplied(Vec<StreamUpdate>),

    KnockerJoined {
        client_id: String,
        display_name: String,
    },
    KnockerLeft {
        client_id: String,
    },
    KnockHandled {
        client_id: String,
        resolution: KnockResolution,
        metadata: KnockMetadata,
    },

    ChatMessageReceived(ChatMessage),
    CloudRecordingRequested,
    CloudRecordingStarted {
        error: Option<String>,
        started_at: Option<DateTime<Utc>>,
    },
    CloudRecordingStopped,
    StreamingStarted {
        started_at: Option<DateTime<Utc>>,
    },
    StreamingStopped,

    LocalMediaStarting,
    LocalMediaStarted {
        stream: Arc<MediaStream>,
        ownership: StreamOwnership,
        camera_enabled: bool,
        microphone_enabled: bool,
    },
    LocalMediaStartFailed(DeviceError),
    LocalMediaStopped,
    CameraEnabledChanged(bool),
    MicrophoneEnabledChanged(bool),
    DeviceSelected {
        kind: TrackKind,
        device_id: String,
    },
    DevicesUpdated(Vec<DeviceInfo>),
    DeviceBusy(String),
    DeviceSwitched {
        kind: TrackKind,
        device_id: String,
    },
    DeviceSwitchFailed {
        kind: TrackKind,
        device_id: Option<String>,
        error: DeviceError,
    },

    LocalScreenshareStarting,
    LocalScreenshareStarted(Arc<MediaStream>),
    LocalScreenshareFailed(DeviceError),
    LocalScreenshareStopped,

    TransportDispatcherCreated,
    TransportManagerCreated {
        manager: Handle<dyn RtcManager>,
        accept_from_both_sides: bool,
    },
    TransportManagerDestroyed,
    TransportInitialized,
    TransportDisconnected,
}

impl Transition {
    /// Stable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Transition::AppStarted(_) => "app_started",
            Transition::AppStopped => "app_stopped",
            Transition::DeviceCredentialsRequested => "device_credentials_requested",
            Transition::DeviceCredentialsFulfilled(_) => "device_credentials_fulfilled",
            Transition::DeviceCredentialsRejected(_) => "device_credentials_rejected",
            Transition::OrganizationRequested => "organization_requested",
            Transition::OrganizationFulfilled(_) => "organization_fulfilled",
            Transition::OrganizationRejected(_) => "organization_rejected",
            Transition::SignalConnecting => "signal_connecting",
            Transition::SignalChannelCreated(_) => "signal_channel_created",
            Transition::SignalConnectFailed(_) => "signal_connect_failed",
            Transition::SignalConnected => "signal_connected",
            Transition::SignalReconnecting => "signal_reconnecting",
            Transition::SignalTransportDisconnected => "signal_transport_disconnected",
            Transition::SignalDisconnected => "signal_disconnected",
            Transition::SignalChannelClosed => "signal_channel_closed",
            Transition::DeviceIdentifying => "device_identifying",
            Transition::DeviceIdentified => "device_identified",
            Transition::RoomConnecting => "room_connecting",
            Transition::RoomJoinFailed(_) => "room_join_failed",
            Transition::RoomKnocking => "room_knocking",
            Transition::RoomJoined { .. } => "room_joined",
            Transition::RoomDisconnecting => "room_disconnecting",
            Transition::RoomLeft => "room_left",
            Transition::RoomSessionEnded { .. } => "room_session_ended",
            Transition::ParticipantJoined(_) => "participant_joined",
            Transition::ParticipantLeft { .. } => "participant_left",
            Transition::AudioEnabledChanged { .. } => "audio_enabled_changed",
            Transition::VideoEnabledChanged { .. } => "video_enabled_changed",
            Transition::ClientMetadataReceived { .. } => "client_metadata_received",
            Transition::ScreenshareStarted { .. } => "screenshare_started",
            Transition::ScreenshareStopped { .. } => "screenshare_stopped",
            Transition::RemoteStreamAdded { .. } => "remote_stream_added",
            Transition::AcceptingStreams => "accepting_streams",
            Transition::StreamBatchApplied(_) => "stream_batch_applied",
            Transition::KnockerJoined { .. } => "knocker_joined",
            Transition::KnockerLeft { .. } => "knocker_left",
            Transition::KnockHandled { .. } => "knock_handled",
            Transition::ChatMessageReceived(_) => "chat_message_received",
            Transition::CloudRecordingRequested => "cloud_recording_requested",
            Transition::CloudRecordingStarted { .. } => "cloud_recording_started",
            Transition::CloudRecordingStopped => "cloud_recording_stopped",
            Transition::StreamingStarted { .. } => "streaming_started",
            Transition::StreamingStopped => "streaming_stopped",
            Transition::LocalMediaStarting => "local_media_starting",
            Transition::LocalMediaStarted { .. } => "local_media_started",
            Transition::LocalMediaStartFailed(_) => "local_media_start_failed",
            Transition::LocalMediaStopped => "local_media_stopped",
            Transition::CameraEnabledChanged(_) => "camera_enabled_changed",
            Transition::MicrophoneEnabledChanged(_) => "microphone_enabled_changed",
            Transition::DeviceSelected { .. } => "device_selected",
            Transition::DevicesUpdated(_) => "devices_updated",
            Transition::DeviceBusy(_) => "device_busy",
            Transition::DeviceSwitched { .. } => "device_switched",
            Transition::DeviceSwitchFailed { .. } => "device_switch_failed",
            Transition::LocalScreenshareStarting => "local_screenshare_starting",
            Transition::LocalScreenshareStarted(_) => "local_screenshare_started",
            Transition::LocalScreenshareFailed(_) => "local_screenshare_failed",
            Transition::LocalScreenshareStopped => "local_screenshare_stopped",
            Transition::TransportDispatcherCreated => "transport_dispatcher_created",
            Transition::TransportManagerCreated { .. } => "transport_manager_created",
            Transition::TransportManagerDestroyed => "transport_manager_destroyed",
            Transition::TransportInitialized => "transport_initialized",
            Transition::TransportDisconnected => "transport_disconnected",
        }
    }
}

/// Apply `transition` to `state`, returning the next state.
pub fn reduce(state: &SessionState, transition: &Transition) -> SessionState {
    let mut next = state.clone();
    match transition {
        Transition::AppStarted(intent) => {
            if intent.room_url != state.app.room_url {
                next.organization = Default::default();
            }
            next.app = AppIntent {
                wants_to_join: true,
                ..intent.clone()
            };
            if next.local_media.stream.is_some() {
                next.local_media.held_for_join = true;
            }
            // A finished attempt leaves terminal statuses behind; clear them
            // so the reactors can run the join again.
            if next.signal.status == SignalStatus::Disconnected && next.signal.channel.is_none() {
                next.signal = Default::default();
            }
            if matches!(
                next.room.status,
                RoomStatus::Disconnected | RoomStatus::RoomLocked | RoomStatus::KnockRejected
            ) {
                next.room.status = RoomStatus::Initializing;
                next.room.error = None;
            }
            if matches!(
                next.local_media.status,
                LocalMediaStatus::Stopped | LocalMediaStatus::Error
            ) {
                next.local_media.status = LocalMediaStatus::Empty;
                next.local_media.start_error = None;
            }
        }
        Transition::AppStopped => {
            next.app.wants_to_join = false;
            if matches!(
                next.room.status,
                RoomStatus::Initializing | RoomStatus::RoomLocked | RoomStatus::KnockRejected
            ) {
                next.room.status = RoomStatus::Disconnected;
            }
        }

        Transition::DeviceCredentialsRequested => {
            next.device_credentials.is_fetching = true;
        }
        Transition::DeviceCredentialsFulfilled(credentials) => {
            next.device_credentials.is_fetching = false;
            next.device_credentials.data = Some(credentials.clone());
            next.device_credentials.last_error = None;
        }
        Transition::DeviceCredentialsRejected(error) => {
            next.device_credentials.last_error = Some(error.clone());
        }
        Transition::OrganizationRequested => {
            next.organization.is_fetching = true;
        }
        Transition::OrganizationFulfilled(organization) => {
            next.organization.is_fetching = false;
            next.organization.data = Some(organization.clone());
            next.organization.error = false;
        }
        Transition::OrganizationRejected(_) => {
            next.organization.is_fetching = false;
            next.organization.error = true;
        }

        Transition::SignalConnecting => {
            next.signal.status = SignalStatus::Connecting;
        }
        Transition::SignalChannelCreated(channel) => {
            next.signal.channel = Some(channel.clone());
        }
        Transition::SignalConnectFailed(_) => {
            next.signal = Default::default();
            next.signal.status = SignalStatus::Disconnected;
        }
        Transition::SignalConnected => {
            next.signal.status = SignalStatus::Connected;
            next.signal.device_identified = false;
            next.signal.is_identifying_device = false;
        }
        Transition::SignalReconnecting => {
            next.signal.status = SignalStatus::Reconnect;
            next.signal.device_identified = false;
            next.signal.is_identifying_device = false;
            mark_reconnect(&mut next);
        }
        Transition::SignalTransportDisconnected => {
            next.signal.status = SignalStatus::Disconnected;
            next.signal.device_identified = false;
            next.signal.is_identifying_device = false;
            mark_reconnect(&mut next);
        }
        Transition::SignalDisconnected => {
            next.signal = Default::default();
            next.signal.status = SignalStatus::Disconnected;
        }
        Transition::SignalChannelClosed => {
            next.signal = Default::default();
            if !state.app.wants_to_join {
                next.signal.status = SignalStatus::Disconnected;
            } else {
                // Open a fresh channel and rebuild the transport on it.
                mark_reconnect(&mut next);
                let transport = &mut next.transport;
                transport.dispatcher_created = false;
                transport.manager = None;
                transport.manager_initialized = false;
                transport.is_accepting_streams = false;
            }
        }
        Transition::DeviceIdentifying => {
            next.signal.is_identifying_device = true;
        }
        Transition::DeviceIdentified => {
            next.signal.is_identifying_device = false;
            next.signal.device_identified = true;
        }

        Transition::RoomConnecting => {
            // Rejoining after a reconnect keeps the reconnect status so the
            // session id is not mistaken for a fresh one.
            if next.room.status != RoomStatus::Reconnect {
                next.room.status = RoomStatus::Connecting;
            }
            next.room.error = None;
        }
        Transition::RoomJoinFailed(error) => {
            next.room.status = RoomStatus::Disconnected;
            next.room.error = Some(error.clone());
        }
        Transition::RoomKnocking => {
            next.room.status = RoomStatus::Knocking;
        }
        Transition::RoomJoined {
            self_id,
            is_locked,
            room,
            error,
        } => room_joined(&mut next, self_id, *is_locked, room.as_ref(), error.as_deref()),
        Transition::RoomDisconnecting => {
            next.room.status = RoomStatus::Disconnecting;
        }
        Transition::RoomLeft => {
            next.room.status = RoomStatus::Disconnected;
            next.room.session = None;
            next.room.self_id = None;
            next.remote_participants.clear();
            next.waiting_participants.clear();
            next.chat.clear();
            next.cloud_recording = Default::default();
            next.live_stream = Default::default();
        }
        Transition::RoomSessionEnded { room_session_id } => {
            if next
                .room
                .session
                .as_ref()
                .is_some_and(|s| &s.id == room_session_id)
            {
                next.room.session = None;
            }
        }

        Transition::ParticipantJoined(client) => {
            if next.room.self_id.as_deref() != Some(client.id.as_str()) {
                next.remote_participants
                    .add_participant(RemoteParticipant::from_client(client, true));
                next.waiting_participants.retain(|w| w.id != client.id);
            }
        }
        Transition::ParticipantLeft { client_id } => {
            next.remote_participants.remove_participant(client_id);
        }
        Transition::AudioEnabledChanged { client_id, enabled } => {
            next.remote_participants.set_audio_enabled(client_id, *enabled);
        }
        Transition::VideoEnabledChanged { client_id, enabled } => {
            next.remote_participants.set_video_enabled(client_id, *enabled);
        }
        Transition::ClientMetadataReceived {
            client_id,
            metadata,
        } => {
            next.remote_participants.apply_metadata(client_id, metadata);
        }
        Transition::ScreenshareStarted {
            client_id,
            stream_id,
        } => {
            next.remote_participants.add_stream(client_id, stream_id);
        }
        Transition::ScreenshareStopped {
            client_id,
            stream_id,
        } => {
            next.remote_participants.stop_stream(client_id, stream_id);
        }
        Transition::RemoteStreamAdded {
            client_id,
            stream,
            stream_type,
        } => {
            next.remote_participants
                .bind_stream(client_id, stream.clone(), *stream_type);
        }

        Transition::AcceptingStreams => {
            next.transport.is_accepting_streams = true;
        }
        Transition::StreamBatchApplied(updates) => {
            for update in updates {
                let applied = next.remote_participants.apply_stream_update(update);
                // Withdrawn while the batch was in flight: the accept
                // already went out, so release it next round.
                if !applied && update.state == StreamState::DoneAccept {
                    next.remote_participants
                        .release_withdrawn(&update.client_id, &update.stream_id);
                }
            }
            next.transport.is_accepting_streams = false;
        }

        Transition::KnockerJoined {
            client_id,
            display_name,
        } => {
            if !next.waiting_participants.iter().any(|w| &w.id == client_id) {
                next.waiting_participants.push(WaitingParticipant {
                    id: client_id.clone(),
                    display_name: display_name.clone(),
                });
            }
        }
        Transition::KnockerLeft { client_id } => {
            next.waiting_participants.retain(|w| &w.id != client_id);
        }
        Transition::KnockHandled {
            client_id,
            resolution,
            metadata,
        } => {
            let own_knock = next.room.self_id.as_deref() == Some(client_id.as_str())
                && next.room.status == RoomStatus::Knocking;
            if own_knock {
                match resolution {
                    KnockResolution::Accepted => {
                        if metadata.room_key.is_some() {
                            next.app.room_key = metadata.room_key.clone();
                        }
                        next.room.status = RoomStatus::Initializing;
                    }
                    KnockResolution::Rejected => {
                        next.room.status = RoomStatus::KnockRejected;
                    }
                }
            } else {
                next.waiting_participants.retain(|w| &w.id != client_id);
            }
        }

        Transition::ChatMessageReceived(message) => {
            next.chat.push(message.clone());
        }
        Transition::CloudRecordingRequested => {
            next.cloud_recording.status = RecordingStatus::Requested;
            next.cloud_recording.error = None;
        }
        Transition::CloudRecordingStarted { error, started_at } => match error {
            Some(error) => {
                next.cloud_recording.status = RecordingStatus::Error;
                next.cloud_recording.error = Some(error.clone());
                next.cloud_recording.started_at = None;
            }
            None => {
                next.cloud_recording.status = RecordingStatus::Recording;
                next.cloud_recording.error = None;
                next.cloud_recording.started_at = *started_at;
            }
        },
        Transition::CloudRecordingStopped => {
            next.cloud_recording = Default::default();
        }
        Transition::StreamingStarted { started_at } => {
            next.live_stream.is_streaming = true;
            next.live_stream.started_at = *started_at;
        }
        Transition::StreamingStopped => {
            next.live_stream = Default::default();
        }

        Transition::LocalMediaStarting => {
            next.local_media.status = LocalMediaStatus::Starting;
            next.local_media.start_error = None;
        }
        Transition::LocalMediaStarted {
            stream,
            ownership,
            camera_enabled,
            microphone_enabled,
        } => {
            let media = &mut next.local_media;
            media.status = LocalMediaStatus::Started;
            media.ownership = *ownership;
            media.held_for_join = state.app.wants_to_join;
            media.camera_enabled = *camera_enabled;
            media.microphone_enabled = *microphone_enabled;
            if let Some(id) = track_device(stream, TrackKind::Video) {
                media.current_camera_device_id = Some(id);
            }
            if let Some(id) = track_device(stream, TrackKind::Audio) {
                media.current_microphone_device_id = Some(id);
            }
            media.stream = Some(stream.clone());
            media.start_error = None;
        }
        Transition::LocalMediaStartFailed(error) => {
            next.local_media.status = LocalMediaStatus::Error;
            next.local_media.start_error = Some(error.clone());
        }
        Transition::LocalMediaStopped => {
            let media = &mut next.local_media;
            media.status = LocalMediaStatus::Stopped;
            media.stream = None;
            media.held_for_join = false;
            media.busy_device_ids.clear();
            // The next stream is handed over as slot "0" again.
            next.transport.manager_initialized = false;
        }
        Transition::CameraEnabledChanged(enabled) => {
            next.local_media.camera_enabled = *enabled;
        }
        Transition::MicrophoneEnabledChanged(enabled) => {
            next.local_media.microphone_enabled = *enabled;
        }
        Transition::DeviceSelected { kind, device_id } => {
            set_current_device(&mut next, *kind, device_id);
        }
        Transition::DevicesUpdated(devices) => {
            next.local_media.devices = devices.clone();
        }
        Transition::DeviceBusy(device_id) => {
            if !next.local_media.is_busy(device_id) {
                next.local_media.busy_device_ids.push(device_id.clone());
            }
        }
        Transition::DeviceSwitched { kind, device_id } => {
            set_current_device(&mut next, *kind, device_id);
            next.local_media.busy_device_ids.retain(|id| id != device_id);
            match kind {
                TrackKind::Audio => next.local_media.microphone_device_error = None,
                TrackKind::Video => next.local_media.camera_device_error = None,
            }
        }
        Transition::DeviceSwitchFailed {
            kind,
            device_id,
            error,
        } => {
            if let Some(device_id) = device_id {
                next.local_media.busy_device_ids.retain(|id| id != device_id);
            }
            match kind {
                TrackKind::Audio => next.local_media.microphone_device_error = Some(error.clone()),
                TrackKind::Video => next.local_media.camera_device_error = Some(error.clone()),
            }
        }

        Transition::LocalScreenshareStarting => {
            next.local_screenshare.status = ScreenshareStatus::Starting;
            next.local_screenshare.error = None;
        }
        Transition::LocalScreenshareStarted(stream) => {
            next.local_screenshare.status = ScreenshareStatus::Active;
            next.local_screenshare.stream = Some(stream.clone());
        }
        Transition::LocalScreenshareFailed(error) => {
            next.local_screenshare.status = ScreenshareStatus::Empty;
            next.local_screenshare.stream = None;
            next.local_screenshare.error = Some(error.clone());
        }
        Transition::LocalScreenshareStopped => {
            next.local_screenshare.status = ScreenshareStatus::Empty;
            next.local_screenshare.stream = None;
        }

        Transition::TransportDispatcherCreated => {
            next.transport.dispatcher_created = true;
        }
        Transition::TransportManagerCreated {
            manager,
            accept_from_both_sides,
        } => {
            next.transport.manager = Some(manager.clone());
            next.transport.manager_initialized = false;
            next.transport.accept_from_both_sides = *accept_from_both_sides;
            next.transport.status = TransportStatus::Ready;
        }
        Transition::TransportManagerDestroyed => {
            next.transport.manager = None;
            next.transport.manager_initialized = false;
            next.transport.is_accepting_streams = false;
            next.transport.status = TransportStatus::Empty;
        }
        Transition::TransportInitialized => {
            next.transport.manager_initialized = true;
        }
        Transition::TransportDisconnected => {
            next.transport = Default::default();
        }
    }
    next
}

fn track_device(stream: &MediaStream, kind: TrackKind) -> Option<String> {
    stream
        .first_track(kind)
        .and_then(|t| t.device_id().map(str::to_string))
}

fn set_current_device(state: &mut SessionState, kind: TrackKind, device_id: &str) {
    let slot = match kind {
        TrackKind::Audio => &mut state.local_media.current_microphone_device_id,
        TrackKind::Video => &mut state.local_media.current_camera_device_id,
    };
    *slot = Some(device_id.to_string());
}

/// A dropped channel puts a live room and transport into their reconnect states.
fn mark_reconnect(state: &mut SessionState) {
    if matches!(
        state.room.status,
        RoomStatus::Connected | RoomStatus::Connecting
    ) {
        state.room.status = RoomStatus::Reconnect;
    }
    if state.transport.status == TransportStatus::Ready {
        state.transport.status = TransportStatus::Reconnect;
    }
}

fn room_joined(
    state: &mut SessionState,
    self_id: &Option<String>,
    is_locked: bool,
    room: Option<&SignalRoom>,
    error: Option<&str>,
) {
    if matches!(
        state.room.status,
        RoomStatus::Disconnecting | RoomStatus::Disconnected
    ) {
        return;
    }
    if self_id.is_some() {
        state.room.self_id = self_id.clone();
    }

    if let Some(error) = error {
        if error == ROOM_LOCKED || is_locked {
            state.room.status = RoomStatus::RoomLocked;
            state.room.error = None;
        } else {
            state.room.status = RoomStatus::Disconnected;
            state.room.error = Some(error.to_string());
        }
        state.room.session = None;
        return;
    }

    state.room.status = RoomStatus::Connected;
    state.room.error = None;

    let Some(room) = room else {
        return;
    };
    if let Some(session) = &room.session {
        state.room.session = Some(RoomSession {
            id: session.id.clone(),
            created_at: session.created_at,
        });
    }
    let own_id = state.room.self_id.clone();
    state.remote_participants.replace_all(
        room.clients
            .iter()
            .filter(|c| own_id.as_deref() != Some(c.id.as_str()))
            .map(|c| RemoteParticipant::from_client(c, false))
            .collect(),
    );
    state.waiting_participants = room
        .knockers
        .iter()
        .map(|k| WaitingParticipant {
            id: k.client_id.clone(),
            display_name: k.display_name.clone(),
        })
        .collect();
    if state.transport.status == TransportStatus::Reconnect && state.transport.manager.is_some() {
        state.transport.status = TransportStatus::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MediaTrack;
    use crate::signal::{SignalKnocker, SignalRoomSession};

    fn client(id: &str, streams: &[&str]) -> SignalClient {
        SignalClient {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            streams: streams.iter().map(|s| s.to_string()).collect(),
            ..SignalClient::default()
        }
    }

    fn joined(state: &SessionState, room: SignalRoom) -> SessionState {
        reduce(
            state,
            &Transition::RoomJoined {
                self_id: Some("me".into()),
                is_locked: false,
                room: Some(room),
                error: None,
            },
        )
    }

    fn connecting() -> SessionState {
        let mut state = SessionState::default();
        state.app.wants_to_join = true;
        state.room.status = RoomStatus::Connecting;
        state
    }

    #[test]
    fn room_joined_populates_session_and_roster() {
        let created_at = Utc::now();
        let state = joined(
            &connecting(),
            SignalRoom {
                clients: vec![client("me", &["0"]), client("p1", &["0"])],
                knockers: vec![SignalKnocker {
                    client_id: "k1".into(),
                    display_name: "Knocker".into(),
                }],
                session: Some(SignalRoomSession {
                    id: "s1".into(),
                    created_at,
                }),
            },
        );
        assert_eq!(state.room.status, RoomStatus::Connected);
        assert_eq!(state.room.session.as_ref().map(|s| s.id.as_str()), Some("s1"));
        assert_eq!(state.remote_participants.participant_count(), 1);
        let p1 = state.remote_participants.participant("p1").unwrap();
        assert!(!p1.new_joiner);
        assert_eq!(p1.stream_state("0"), Some(StreamState::OldAccept));
        assert_eq!(state.waiting_participants.len(), 1);
    }

    #[test]
    fn locked_room_clears_session() {
        let mut state = connecting();
        state.room.session = Some(RoomSession {
            id: "old".into(),
            created_at: Utc::now(),
        });
        let state = reduce(
            &state,
            &Transition::RoomJoined {
                self_id: Some("me".into()),
                is_locked: true,
                room: None,
                error: Some(ROOM_LOCKED.into()),
            },
        );
        assert_eq!(state.room.status, RoomStatus::RoomLocked);
        assert!(state.room.session.is_none());
        assert_eq!(state.room.self_id.as_deref(), Some("me"));
    }

    #[test]
    fn other_join_errors_are_recorded() {
        let state = reduce(
            &connecting(),
            &Transition::RoomJoined {
                self_id: None,
                is_locked: false,
                room: None,
                error: Some("room_full".into()),
            },
        );
        assert_eq!(state.room.status, RoomStatus::Disconnected);
        assert_eq!(state.room.error.as_deref(), Some("room_full"));
    }

    #[test]
    fn reconnect_then_room_joined_reaches_connected() {
        let mut state = joined(&connecting(), SignalRoom::default());
        state.room.session = Some(RoomSession {
            id: "s1".into(),
            created_at: Utc::now(),
        });
        state.transport.status = TransportStatus::Ready;
        state.transport.manager = Some(Handle::new(
            Arc::new(crate::test_support::FakeManager::default()) as Arc<dyn RtcManager>,
        ));

        let state = reduce(&state, &Transition::SignalReconnecting);
        assert_eq!(state.room.status, RoomStatus::Reconnect);
        assert_eq!(state.transport.status, TransportStatus::Reconnect);
        assert!(state.room.session.is_some());

        let state = reduce(&state, &Transition::RoomConnecting);
        assert_eq!(state.room.status, RoomStatus::Reconnect);
        let state = joined(&state, SignalRoom::default());
        assert_eq!(state.room.status, RoomStatus::Connected);
        assert_eq!(state.transport.status, TransportStatus::Ready);
    }

    #[test]
    fn closed_channel_under_live_session_rearms_connect() {
        let mut state = joined(&connecting(), SignalRoom::default());
        state.signal.status = SignalStatus::Connected;
        state.signal.device_identified = true;
        state.transport.dispatcher_created = true;
        state.transport.manager_initialized = true;
        state.transport.status = TransportStatus::Ready;
        state.transport.manager = Some(Handle::new(
            Arc::new(crate::test_support::FakeManager::default()) as Arc<dyn RtcManager>,
        ));

        let state = reduce(&state, &Transition::SignalChannelClosed);
        assert_eq!(state.signal.status, SignalStatus::Empty);
        assert!(state.signal.channel.is_none());
        assert!(!state.signal.device_identified);
        assert_eq!(state.room.status, RoomStatus::Reconnect);
        assert_eq!(state.transport.status, TransportStatus::Reconnect);
        assert!(!state.transport.dispatcher_created);
        assert!(state.transport.manager.is_none());
        assert!(crate::signal::should_connect(&state));

        let mut idle = SessionState::default();
        idle.signal.status = SignalStatus::Connected;
        let idle = reduce(&idle, &Transition::SignalChannelClosed);
        assert_eq!(idle.signal.status, SignalStatus::Disconnected);
        assert!(!crate::signal::should_connect(&idle));
    }

    #[test]
    fn stream_withdrawn_during_batch_is_released_next() {
        let state = joined(&connecting(), SignalRoom::default());
        let state = reduce(&state, &Transition::ParticipantJoined(client("p1", &[])));
        let state = reduce(
            &state,
            &Transition::ScreenshareStarted {
                client_id: "p1".into(),
                stream_id: "s1".into(),
            },
        );
        let state = reduce(&state, &Transition::AcceptingStreams);
        let state = reduce(
            &state,
            &Transition::ScreenshareStopped {
                client_id: "p1".into(),
                stream_id: "s1".into(),
            },
        );
        assert_eq!(
            state.remote_participants.participant("p1").unwrap().stream_state("s1"),
            None
        );
        let state = reduce(
            &state,
            &Transition::StreamBatchApplied(vec![StreamUpdate::new(
                "p1",
                "s1",
                StreamState::DoneAccept,
            )]),
        );
        assert!(!state.transport.is_accepting_streams);
        assert_eq!(
            state.remote_participants.participant("p1").unwrap().stream_state("s1"),
            Some(StreamState::ToUnaccept)
        );
    }

    #[test]
    fn room_joined_ignored_after_leaving() {
        let mut state = connecting();
        state.room.status = RoomStatus::Disconnected;
        let next = joined(&state, SignalRoom::default());
        assert_eq!(next, state);
    }

    #[test]
    fn stale_session_end_is_ignored() {
        let mut state = connecting();
        state.room.session = Some(RoomSession {
            id: "current".into(),
            created_at: Utc::now(),
        });
        let next = reduce(
            &state,
            &Transition::RoomSessionEnded {
                room_session_id: "stale".into(),
            },
        );
        assert!(next.room.session.is_some());
        let next = reduce(
            &next,
            &Transition::RoomSessionEnded {
                room_session_id: "current".into(),
            },
        );
        assert!(next.room.session.is_none());
    }

    #[test]
    fn duplicate_roster_events_never_duplicate_streams() {
        let mut state = joined(&connecting(), SignalRoom::default());
        let events = [
            Transition::ParticipantJoined(client("p1", &["0", "0"])),
            Transition::ParticipantJoined(client("p1", &["0"])),
            Transition::ScreenshareStarted {
                client_id: "p1".into(),
                stream_id: "s1".into(),
            },
            Transition::ScreenshareStarted {
                client_id: "p1".into(),
                stream_id: "s1".into(),
            },
            Transition::ScreenshareStopped {
                client_id: "p1".into(),
                stream_id: "s1".into(),
            },
            Transition::ScreenshareStarted {
                client_id: "p1".into(),
                stream_id: "s1".into(),
            },
        ];
        for event in &events {
            state = reduce(&state, event);
            let p1 = state.remote_participants.participant("p1").unwrap();
            let mut ids: Vec<&str> = p1.streams.iter().map(|s| s.id.as_str()).collect();
            let len = ids.len();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), len, "after {}", event.name());
        }
    }

    #[test]
    fn new_joiner_streams_are_tagged_new_accept() {
        let state = joined(&connecting(), SignalRoom::default());
        let state = reduce(&state, &Transition::ParticipantJoined(client("p2", &["0"])));
        let state = reduce(
            &state,
            &Transition::ScreenshareStarted {
                client_id: "p2".into(),
                stream_id: "s2".into(),
            },
        );
        let p2 = state.remote_participants.participant("p2").unwrap();
        assert!(p2.new_joiner);
        assert_eq!(p2.stream_state("0"), Some(StreamState::NewAccept));
        assert_eq!(p2.stream_state("s2"), Some(StreamState::NewAccept));
    }

    #[test]
    fn own_knock_accepted_rearms_connect_with_new_key() {
        let mut state = connecting();
        state.room.status = RoomStatus::Knocking;
        state.room.self_id = Some("me".into());
        let next = reduce(
            &state,
            &Transition::KnockHandled {
                client_id: "me".into(),
                resolution: KnockResolution::Accepted,
                metadata: KnockMetadata {
                    room_key: Some("key".into()),
                    room_name: None,
                },
            },
        );
        assert_eq!(next.room.status, RoomStatus::Initializing);
        assert_eq!(next.app.room_key.as_deref(), Some("key"));

        let rejected = reduce(
            &state,
            &Transition::KnockHandled {
                client_id: "me".into(),
                resolution: KnockResolution::Rejected,
                metadata: KnockMetadata::default(),
            },
        );
        assert_eq!(rejected.room.status, RoomStatus::KnockRejected);
    }

    #[test]
    fn handled_knocker_leaves_waiting_list() {
        let mut state = joined(&connecting(), SignalRoom::default());
        state = reduce(
            &state,
            &Transition::KnockerJoined {
                client_id: "k1".into(),
                display_name: "K".into(),
            },
        );
        state = reduce(
            &state,
            &Transition::KnockerJoined {
                client_id: "k1".into(),
                display_name: "K".into(),
            },
        );
        assert_eq!(state.waiting_participants.len(), 1);
        state = reduce(
            &state,
            &Transition::KnockHandled {
                client_id: "k1".into(),
                resolution: KnockResolution::Accepted,
                metadata: KnockMetadata::default(),
            },
        );
        assert!(state.waiting_participants.is_empty());
    }

    #[test]
    fn stopping_intent_finishes_idle_room() {
        let mut state = SessionState::default();
        state.app.wants_to_join = true;
        let state = reduce(&state, &Transition::AppStopped);
        assert!(!state.app.wants_to_join);
        assert_eq!(state.room.status, RoomStatus::Disconnected);

        let state = reduce(&state, &Transition::AppStarted(AppIntent::default()));
        assert!(state.app.wants_to_join);
        assert_eq!(state.room.status, RoomStatus::Initializing);
    }

    #[test]
    fn local_media_started_records_devices() {
        let stream = MediaStream::new(
            "local",
            vec![
                MediaTrack::new("a", TrackKind::Audio, Some("mic-1".into())),
                MediaTrack::new("v", TrackKind::Video, Some("cam-1".into())),
            ],
        );
        let state = reduce(
            &SessionState::default(),
            &Transition::LocalMediaStarted {
                stream,
                ownership: StreamOwnership::Exclusive,
                camera_enabled: true,
                microphone_enabled: false,
            },
        );
        assert_eq!(state.local_media.status, LocalMediaStatus::Started);
        assert_eq!(state.local_media.current_camera_device_id.as_deref(), Some("cam-1"));
        assert_eq!(state.local_media.current_microphone_device_id.as_deref(), Some("mic-1"));
        assert!(!state.local_media.microphone_enabled);
    }

    #[test]
    fn device_switch_clears_busy_mark() {
        let state = reduce(&SessionState::default(), &Transition::DeviceBusy("cam-2".into()));
        let state = reduce(&state, &Transition::DeviceBusy("cam-2".into()));
        assert_eq!(state.local_media.busy_device_ids, vec!["cam-2".to_string()]);
        let state = reduce(
            &state,
            &Transition::DeviceSwitched {
                kind: TrackKind::Video,
                device_id: "cam-2".into(),
            },
        );
        assert!(state.local_media.busy_device_ids.is_empty());
        assert_eq!(state.local_media.current_camera_device_id.as_deref(), Some("cam-2"));
    }

    #[test]
    fn stream_batch_releases_the_flag() {
        let state = reduce(&SessionState::default(), &Transition::AcceptingStreams);
        assert!(state.transport.is_accepting_streams);
        let state = reduce(&state, &Transition::StreamBatchApplied(Vec::new()));
        assert!(!state.transport.is_accepting_streams);
    }

    #[test]
    fn failed_credentials_stay_fetching() {
        let state = reduce(&SessionState::default(), &Transition::DeviceCredentialsRequested);
        let state = reduce(&state, &Transition::DeviceCredentialsRejected("boom".into()));
        assert!(state.device_credentials.is_fetching);
        assert!(state.device_credentials.data.is_none());
    }
}
