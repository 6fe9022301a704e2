//! The session state tree.
//!
//! Every section is a plain value. The tree is replaced wholesale on each
//! transition (see [`crate::transitions::reduce`]), so readers holding an
//! `Arc<SessionState>` always see a consistent snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::chat::ChatMessage;
use crate::devices::{DeviceInfo, MediaOptions, MediaStream, TrackKind};
use crate::errors::DeviceError;
use crate::handle::Handle;
use crate::participants::{RemoteParticipants, WaitingParticipant};
use crate::resolvers::{Credentials, Organization};
use crate::signal::SignalChannel;
use crate::transport::RtcManager;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub app: AppIntent,
    pub device_credentials: DeviceCredentials,
    pub organization: OrganizationState,
    pub signal: SignalConnection,
    pub room: RoomConnection,
    pub local_media: LocalMedia,
    pub local_screenshare: LocalScreenshare,
    pub transport: TransportConnection,
    pub remote_participants: RemoteParticipants,
    pub waiting_participants: Vec<WaitingParticipant>,
    pub chat: Vec<ChatMessage>,
    pub cloud_recording: CloudRecording,
    pub live_stream: LiveStream,
}

/// How the session should obtain local media when joining.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LocalMediaMode {
    /// Acquire devices with these options; the session owns the tracks.
    Options(MediaOptions),
    /// Use a caller-supplied stream; the caller keeps ownership of its tracks.
    External(Arc<MediaStream>),
    /// Join without local media.
    #[default]
    Skip,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppIntent {
    pub wants_to_join: bool,
    pub room_url: String,
    pub room_name: String,
    pub room_key: Option<String>,
    pub display_name: String,
    pub external_id: Option<String>,
    pub local_media: LocalMediaMode,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceCredentials {
    /// Stays `true` after a failed fetch; there is no automatic retry.
    pub is_fetching: bool,
    pub data: Option<Credentials>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrganizationState {
    pub is_fetching: bool,
    pub data: Option<Organization>,
    pub error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignalStatus {
    #[default]
    Empty,
    Connecting,
    Connected,
    Reconnect,
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalConnection {
    pub status: SignalStatus,
    pub device_identified: bool,
    pub is_identifying_device: bool,
    pub channel: Option<Handle<dyn SignalChannel>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoomStatus {
    #[default]
    Initializing,
    Connecting,
    Connected,
    Knocking,
    RoomLocked,
    KnockRejected,
    Reconnect,
    Disconnecting,
    Disconnected,
}

impl RoomStatus {
    /// Statuses in which the server may consider us present in the room.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RoomStatus::Connecting
                | RoomStatus::Connected
                | RoomStatus::Knocking
                | RoomStatus::Reconnect
                | RoomStatus::Disconnecting
        )
    }
}

/// One live instance of a meeting in a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomConnection {
    pub status: RoomStatus,
    pub session: Option<RoomSession>,
    pub self_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LocalMediaStatus {
    #[default]
    Empty,
    Starting,
    Started,
    Stopped,
    Error,
}

/// Whether the session may stop the local tracks it holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamOwnership {
    #[default]
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalMedia {
    pub status: LocalMediaStatus,
    pub stream: Option<Arc<MediaStream>>,
    pub ownership: StreamOwnership,
    /// Acquired for, or adopted by, a join; released when the intent is withdrawn.
    pub held_for_join: bool,
    pub camera_enabled: bool,
    pub microphone_enabled: bool,
    pub current_camera_device_id: Option<String>,
    pub current_microphone_device_id: Option<String>,
    pub devices: Vec<DeviceInfo>,
    pub busy_device_ids: Vec<String>,
    pub start_error: Option<DeviceError>,
    pub camera_device_error: Option<DeviceError>,
    pub microphone_device_error: Option<DeviceError>,
}

impl LocalMedia {
    pub fn selected_device(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.current_microphone_device_id.as_deref(),
            TrackKind::Video => self.current_camera_device_id.as_deref(),
        }
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.microphone_enabled,
            TrackKind::Video => self.camera_enabled,
        }
    }

    pub fn is_busy(&self, device_id: &str) -> bool {
        self.busy_device_ids.iter().any(|id| id == device_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScreenshareStatus {
    #[default]
    Empty,
    Starting,
    Active,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalScreenshare {
    pub status: ScreenshareStatus,
    pub stream: Option<Arc<MediaStream>>,
    pub error: Option<DeviceError>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportStatus {
    #[default]
    Empty,
    Ready,
    Reconnect,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportConnection {
    pub dispatcher_created: bool,
    pub manager: Option<Handle<dyn RtcManager>>,
    /// Slot "0" has been handed to the manager.
    pub manager_initialized: bool,
    pub status: TransportStatus,
    /// Held while an admission batch is being applied.
    pub is_accepting_streams: bool,
    /// Cached `should_accept_streams_from_both_sides()` of the current manager.
    pub accept_from_both_sides: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordingStatus {
    #[default]
    Idle,
    Requested,
    Recording,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudRecording {
    pub status: RecordingStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveStream {
    pub is_streaming: bool,
    pub started_at: Option<DateTime<Utc>>,
}
