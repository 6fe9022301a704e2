//! Caller-facing summaries derived from a state snapshot on demand.

use chrono::{DateTime, Utc};

use crate::chat::ChatMessage;
use crate::participants::{RemoteParticipant, WaitingParticipant};
use crate::state::{RecordingStatus, RoomStatus, ScreenshareStatus, SessionState};

#[derive(Debug, Clone, PartialEq)]
pub struct LocalParticipantView {
    pub id: Option<String>,
    pub display_name: String,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screensharing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    pub status: RoomStatus,
    pub room_name: String,
    pub session_id: Option<String>,
    pub local_participant: LocalParticipantView,
    pub remote_participants: Vec<RemoteParticipant>,
    /// Remote participants currently sharing a screen.
    pub presenters: Vec<String>,
    pub waiting_participants: Vec<WaitingParticipant>,
    pub chat: Vec<ChatMessage>,
    pub is_recording: bool,
    pub recording_started_at: Option<DateTime<Utc>>,
    pub is_streaming: bool,
    pub error: Option<String>,
}

pub fn room_view(state: &SessionState) -> RoomView {
    let has_stream = state.local_media.stream.is_some();
    let local_participant = LocalParticipantView {
        id: state.room.self_id.clone(),
        display_name: state.app.display_name.clone(),
        is_audio_enabled: has_stream && state.local_media.microphone_enabled,
        is_video_enabled: has_stream && state.local_media.camera_enabled,
        is_screensharing: state.local_screenshare.status == ScreenshareStatus::Active,
    };
    let remote_participants = state.remote_participants.participants().to_vec();
    let presenters = remote_participants
        .iter()
        .filter(|p| p.presentation_stream.is_some())
        .map(|p| p.id.clone())
        .collect();

    RoomView {
        status: state.room.status,
        room_name: state.app.room_name.clone(),
        session_id: state.room.session.as_ref().map(|s| s.id.clone()),
        local_participant,
        remote_participants,
        presenters,
        waiting_participants: state.waiting_participants.clone(),
        chat: state.chat.clone(),
        is_recording: state.cloud_recording.status == RecordingStatus::Recording,
        recording_started_at: state.cloud_recording.started_at,
        is_streaming: state.live_stream.is_streaming,
        error: state.room.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::MediaStream;
    use crate::participants::RemoteParticipant;
    use crate::signal::SignalClient;

    #[test]
    fn local_flags_need_a_stream() {
        let mut state = SessionState::default();
        state.local_media.camera_enabled = true;
        assert!(!room_view(&state).local_participant.is_video_enabled);
        state.local_media.stream = Some(MediaStream::new("local", vec![]));
        assert!(room_view(&state).local_participant.is_video_enabled);
    }

    #[test]
    fn presenters_are_listed() {
        let mut state = SessionState::default();
        let client = SignalClient {
            id: "p1".into(),
            ..SignalClient::default()
        };
        let mut p = RemoteParticipant::from_client(&client, false);
        p.presentation_stream = Some(MediaStream::new("share", vec![]));
        state.remote_participants.add_participant(p);
        assert_eq!(room_view(&state).presenters, vec!["p1".to_string()]);
    }

    #[test]
    fn views_compare_by_value() {
        let state = SessionState::default();
        assert_eq!(room_view(&state), room_view(&state.clone()));
    }
}
