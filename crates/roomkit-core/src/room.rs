//! Room admission: join, knock, leave, and moderator handling of knockers.

use crate::errors::SessionError;
use crate::session::Session;
use crate::signal::{self, JoinRoomRequest, KnockAction, KnockRoomRequest, SignalRequest};
use crate::state::{LocalMediaMode, LocalMediaStatus, RoomStatus, SessionState};
use crate::transitions::Transition;

/// Error code the server uses when a room needs lobby admission.
pub const ROOM_LOCKED: &str = "room_locked";

fn local_media_ready(state: &SessionState) -> bool {
    state.local_media.status == LocalMediaStatus::Started
        || state.app.local_media == LocalMediaMode::Skip
}

pub fn should_connect(state: &SessionState) -> bool {
    state.app.wants_to_join
        && state.organization.data.is_some()
        && state.signal.device_identified
        && local_media_ready(state)
        && matches!(
            state.room.status,
            RoomStatus::Initializing | RoomStatus::Reconnect
        )
}

pub fn should_leave(state: &SessionState) -> bool {
    !state.app.wants_to_join
        && matches!(
            state.room.status,
            RoomStatus::Connecting
                | RoomStatus::Connected
                | RoomStatus::Knocking
                | RoomStatus::Reconnect
        )
}

/// Camera/microphone flags to report while connected.
pub fn media_enablement(state: &SessionState) -> Option<(bool, bool)> {
    (state.room.status == RoomStatus::Connected).then_some((
        state.local_media.microphone_enabled,
        state.local_media.camera_enabled,
    ))
}

pub(crate) fn connect(session: &Session) {
    if !session.dispatch_if(should_connect, Transition::RoomConnecting) {
        tracing::debug!("room connect no longer wanted");
        return;
    }
    let state = session.snapshot();
    let Some(organization) = state.organization.data.as_ref() else {
        return;
    };
    let has_media = state.local_media.stream.is_some();
    let request = JoinRoomRequest {
        room_name: state.app.room_name.clone(),
        room_key: state.app.room_key.clone(),
        display_name: state.app.display_name.clone(),
        organization_id: organization.organization_id.clone(),
        external_id: state.app.external_id.clone(),
        self_id: state.room.self_id.clone(),
        is_audio_enabled: has_media && state.local_media.microphone_enabled,
        is_video_enabled: has_media && state.local_media.camera_enabled,
    };

    tracing::info!(room = %request.room_name, "joining room");
    if let Err(e) = signal::send(session, SignalRequest::JoinRoom(request)) {
        tracing::error!("join_room not sent: {e}");
        session.dispatch(Transition::RoomJoinFailed(e.to_string()));
    }
}

/// Ask to be let into a locked room.
pub(crate) fn knock(session: &Session) -> Result<(), SessionError> {
    let state = session.snapshot();
    if state.room.status != RoomStatus::RoomLocked {
        return Err(SessionError::Room(format!(
            "cannot knock while room is {:?}",
            state.room.status
        )));
    }
    let organization = state
        .organization
        .data
        .as_ref()
        .ok_or_else(|| SessionError::Room("organization not resolved".into()))?;
    let request = KnockRoomRequest {
        room_name: state.app.room_name.clone(),
        room_key: state.app.room_key.clone(),
        display_name: state.app.display_name.clone(),
        organization_id: organization.organization_id.clone(),
        external_id: state.app.external_id.clone(),
    };
    tracing::info!(room = %request.room_name, "knocking");
    signal::send(session, SignalRequest::KnockRoom(request))?;
    session.dispatch(Transition::RoomKnocking);
    Ok(())
}

pub(crate) fn leave(session: &Session) {
    session.dispatch(Transition::RoomDisconnecting);
    if let Err(e) = signal::send(session, SignalRequest::LeaveRoom) {
        tracing::warn!("leave_room not sent: {e}");
    }
    session.dispatch(Transition::RoomLeft);
}

/// Resolve a knock from someone waiting in the lobby. The waiting list is
/// updated when the server confirms with `knock_handled`.
pub(crate) fn handle_knock(
    session: &Session,
    client_id: &str,
    action: KnockAction,
) -> Result<(), SessionError> {
    let state = session.snapshot();
    if !state.waiting_participants.iter().any(|w| w.id == client_id) {
        return Err(SessionError::Room(format!(
            "no waiting participant '{client_id}'"
        )));
    }
    tracing::info!(%client_id, ?action, "handling knock");
    signal::send(
        session,
        SignalRequest::HandleKnock {
            action,
            client_id: client_id.to_string(),
        },
    )
}

pub(crate) fn report_media_enablement(session: &Session, audio: bool, video: bool) {
    for request in [
        SignalRequest::EnableAudio { enabled: audio },
        SignalRequest::EnableVideo { enabled: video },
    ] {
        if let Err(e) = signal::send(session, request) {
            tracing::debug!("media enablement not reported: {e}");
        }
    }
}

pub(crate) fn start_cloud_recording(session: &Session) -> Result<(), SessionError> {
    if session.snapshot().room.status != RoomStatus::Connected {
        return Err(SessionError::NotConnected);
    }
    signal::send(session, SignalRequest::StartRecording)?;
    session.dispatch(Transition::CloudRecordingRequested);
    Ok(())
}

pub(crate) fn stop_cloud_recording(session: &Session) -> Result<(), SessionError> {
    signal::send(session, SignalRequest::StopRecording)
}
