//! Local capture: start/stop, camera and microphone toggles, device
//! switching, hot-plug handling and local screenshare.
//!
//! The session owns the tracks it acquired itself ([`StreamOwnership::Exclusive`]).
//! A caller-supplied stream is only muted and unmuted, never stopped, unless
//! the whole session is being torn down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::devices::{
    DeviceKind, MediaConstraints, MediaDevices, MediaStream, TrackKind, diff_devices, next_device,
};
use crate::errors::{DeviceError, SessionError};
use crate::session::{Session, WeakSession};
use crate::signal::{self, SignalRequest};
use crate::state::{
    LocalMediaMode, LocalMediaStatus, ScreenshareStatus, SessionState, StreamOwnership,
};
use crate::transitions::Transition;
use crate::transport;

/// Media the join flow should acquire, if any.
pub fn should_start(state: &SessionState) -> Option<LocalMediaMode> {
    let wanted = state.app.wants_to_join
        && state.local_media.status == LocalMediaStatus::Empty
        && state.app.local_media != LocalMediaMode::Skip;
    wanted.then(|| state.app.local_media.clone())
}

pub fn should_stop(state: &SessionState) -> bool {
    let media = &state.local_media;
    !state.app.wants_to_join
        && ((media.held_for_join && media.stream.is_some())
            || state.local_screenshare.stream.is_some())
}

fn devices(session: &Session) -> Arc<dyn MediaDevices> {
    session.collaborators().devices.clone()
}

/// A stream may only be started while none is held or being acquired.
fn can_start(state: &SessionState) -> bool {
    !matches!(
        state.local_media.status,
        LocalMediaStatus::Starting | LocalMediaStatus::Started
    )
}

pub(crate) async fn start(session: &Session, mode: LocalMediaMode) -> Result<(), SessionError> {
    match mode {
        LocalMediaMode::Skip => Ok(()),
        LocalMediaMode::External(stream) => {
            tracing::info!(stream_id = stream.id(), "using caller-supplied local stream");
            let camera_enabled = stream.tracks_of(TrackKind::Video).iter().any(|t| t.is_enabled());
            let microphone_enabled =
                stream.tracks_of(TrackKind::Audio).iter().any(|t| t.is_enabled());
            let adopted = session.dispatch_if(
                can_start,
                Transition::LocalMediaStarted {
                    stream,
                    ownership: StreamOwnership::Shared,
                    camera_enabled,
                    microphone_enabled,
                },
            );
            if !adopted {
                return Err(already_started());
            }
            refresh_device_list(session).await;
            Ok(())
        }
        LocalMediaMode::Options(mut options) => {
            let mut for_join = false;
            let claimed = session.dispatch_if(
                |s| {
                    for_join = s.app.wants_to_join;
                    can_start(s)
                },
                Transition::LocalMediaStarting,
            );
            if !claimed {
                return Err(already_started());
            }
            let state = session.snapshot();
            if options.video_device_id.is_none() {
                options.video_device_id = state.local_media.current_camera_device_id.clone();
            }
            if options.audio_device_id.is_none() {
                options.audio_device_id = state.local_media.current_microphone_device_id.clone();
            }

            let constraints = MediaConstraints::from_options(&options);
            let stream = match devices(session).get_user_media(constraints).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::error!("get_user_media failed: {e}");
                    session.dispatch(Transition::LocalMediaStartFailed(e.clone()));
                    return Err(e.into());
                }
            };

            let config = session.config();
            let camera_enabled = options.video && config.camera_enabled_on_join;
            let microphone_enabled = options.audio && config.microphone_enabled_on_join;
            for track in stream.tracks_of(TrackKind::Video) {
                track.set_enabled(camera_enabled);
            }
            for track in stream.tracks_of(TrackKind::Audio) {
                track.set_enabled(microphone_enabled);
            }

            // A join-driven start is void once the intent is withdrawn.
            let committed = session.dispatch_if(
                |s| {
                    s.local_media.status == LocalMediaStatus::Starting
                        && (s.app.wants_to_join || !for_join)
                },
                Transition::LocalMediaStarted {
                    stream: stream.clone(),
                    ownership: StreamOwnership::Exclusive,
                    camera_enabled,
                    microphone_enabled,
                },
            );
            if !committed {
                tracing::info!(
                    stream_id = stream.id(),
                    "local media start superseded; releasing acquired stream"
                );
                stream.stop_all();
                session.dispatch_if(
                    |s| s.local_media.status == LocalMediaStatus::Starting,
                    Transition::LocalMediaStopped,
                );
                return Ok(());
            }
            tracing::info!(
                stream_id = stream.id(),
                camera_enabled,
                microphone_enabled,
                "local media started"
            );
            refresh_device_list(session).await;
            Ok(())
        }
    }
}

fn already_started() -> SessionError {
    DeviceError::Other("local media already started".into()).into()
}

/// Release local media. Tracks of a shared stream are left running unless
/// `stop_shared` is set.
pub(crate) fn stop(session: &Session, stop_shared: bool) {
    let state = session.snapshot();
    if let Some(stream) = &state.local_media.stream {
        if state.local_media.ownership == StreamOwnership::Exclusive || stop_shared {
            stream.stop_all();
        }
        transport::remove_local_stream(session, stream);
        tracing::info!(stream_id = stream.id(), "local media stopped");
        session.dispatch(Transition::LocalMediaStopped);
    }
    if let Some(stream) = &state.local_screenshare.stream {
        stream.stop_all();
        transport::remove_screenshare(session, stream);
        session.dispatch(Transition::LocalScreenshareStopped);
    }
}

pub(crate) async fn toggle_camera(
    session: &Session,
    enabled: Option<bool>,
) -> Result<(), SessionError> {
    let state = session.snapshot();
    let enabled = enabled.unwrap_or(!state.local_media.camera_enabled);
    let Some(stream) = state.local_media.stream.clone() else {
        session.dispatch(Transition::CameraEnabledChanged(enabled));
        return Ok(());
    };

    if state.local_media.ownership == StreamOwnership::Shared {
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(enabled);
        }
        session.dispatch(Transition::CameraEnabledChanged(enabled));
        return Ok(());
    }

    if !enabled {
        // Release the camera itself, not just the frames.
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(false);
            track.stop();
            stream.remove_track(track.id());
        }
        session.dispatch(Transition::CameraEnabledChanged(false));
        return Ok(());
    }

    if stream.has_track(TrackKind::Video) {
        for track in stream.tracks_of(TrackKind::Video) {
            track.set_enabled(true);
        }
        session.dispatch(Transition::CameraEnabledChanged(true));
        return Ok(());
    }

    let device_id = state.local_media.current_camera_device_id.clone();
    let constraints = MediaConstraints::single(TrackKind::Video, device_id.clone());
    let acquired = match devices(session).get_user_media(constraints).await {
        Ok(acquired) => acquired,
        Err(e) => {
            tracing::warn!("camera not re-acquired: {e}");
            session.dispatch(Transition::DeviceSwitchFailed {
                kind: TrackKind::Video,
                device_id,
                error: e.clone(),
            });
            return Err(e.into());
        }
    };
    let Some(track) = acquired.first_track(TrackKind::Video) else {
        acquired.stop_all();
        return Err(SessionError::Device(DeviceError::NotFound));
    };

    if !is_current_stream(&session.snapshot(), &stream) {
        tracing::debug!("local stream replaced while acquiring camera; discarding track");
        track.stop();
        return Ok(());
    }
    stream.add_track(track.clone());
    transport::replace_track(session, None, track.clone());
    if let Some(id) = track.device_id() {
        session.dispatch(Transition::DeviceSwitched {
            kind: TrackKind::Video,
            device_id: id.to_string(),
        });
    }
    session.dispatch(Transition::CameraEnabledChanged(true));
    Ok(())
}

/// Microphone toggles only mute the track; the device stays open.
pub(crate) fn toggle_microphone(session: &Session, enabled: Option<bool>) {
    let state = session.snapshot();
    let enabled = enabled.unwrap_or(!state.local_media.microphone_enabled);
    if let Some(stream) = &state.local_media.stream {
        for track in stream.tracks_of(TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }
    session.dispatch(Transition::MicrophoneEnabledChanged(enabled));
}

pub(crate) async fn set_device(
    session: &Session,
    kind: TrackKind,
    device_id: &str,
) -> Result<(), SessionError> {
    let state = session.snapshot();
    if state.local_media.selected_device(kind) == Some(device_id) {
        return Ok(());
    }
    let live = state
        .local_media
        .stream
        .as_ref()
        .is_some_and(|s| s.has_track(kind));
    if !live {
        session.dispatch(Transition::DeviceSelected {
            kind,
            device_id: device_id.to_string(),
        });
        return Ok(());
    }
    let id = Some(device_id.to_string());
    match kind {
        TrackKind::Audio => switch_stream(session, id, None).await,
        TrackKind::Video => switch_stream(session, None, id).await,
    }
}

/// Re-acquire the given kinds on new devices and splice the new tracks into
/// the live stream and the transport.
pub(crate) async fn switch_stream(
    session: &Session,
    audio_device_id: Option<String>,
    video_device_id: Option<String>,
) -> Result<(), SessionError> {
    let state = session.snapshot();
    let Some(stream) = state.local_media.stream.clone() else {
        for (kind, id) in [
            (TrackKind::Audio, audio_device_id),
            (TrackKind::Video, video_device_id),
        ] {
            if let Some(device_id) = id {
                session.dispatch(Transition::DeviceSelected { kind, device_id });
            }
        }
        return Ok(());
    };

    let mut requested: Vec<(TrackKind, String)> = Vec::new();
    for (kind, id) in [
        (TrackKind::Audio, audio_device_id),
        (TrackKind::Video, video_device_id),
    ] {
        let Some(device_id) = id else {
            continue;
        };
        if stream.has_track(kind) {
            requested.push((kind, device_id));
        } else {
            // A released camera has no track to replace; remember the choice.
            session.dispatch(Transition::DeviceSelected { kind, device_id });
        }
    }
    if requested.is_empty() {
        return Ok(());
    }

    // A single-kind switch claims its device so a concurrent hot-plug
    // switch cannot pick the same one.
    if let [(_, device_id)] = requested.as_slice() {
        session.dispatch(Transition::DeviceBusy(device_id.clone()));
    }

    let mut constraints = MediaConstraints::default();
    for (kind, id) in &requested {
        let single = MediaConstraints::single(*kind, Some(id.clone()));
        match kind {
            TrackKind::Audio => constraints.audio = single.audio,
            TrackKind::Video => constraints.video = single.video,
        }
    }

    let acquired = match devices(session).get_user_media(constraints).await {
        Ok(acquired) => acquired,
        Err(e) => {
            tracing::warn!("device switch failed: {e}");
            for (kind, id) in &requested {
                session.dispatch(Transition::DeviceSwitchFailed {
                    kind: *kind,
                    device_id: Some(id.clone()),
                    error: e.clone(),
                });
            }
            return Err(e.into());
        }
    };

    let fresh = session.snapshot();
    if !is_current_stream(&fresh, &stream) {
        tracing::debug!("local stream replaced during device switch; discarding tracks");
        acquired.stop_all();
        return Ok(());
    }

    for (kind, requested_id) in requested {
        let Some(new_track) = acquired.first_track(kind) else {
            session.dispatch(Transition::DeviceSwitchFailed {
                kind,
                device_id: Some(requested_id),
                error: DeviceError::NotFound,
            });
            continue;
        };
        let old_track = stream.first_track(kind);
        if let Some(old) = &old_track {
            stream.remove_track(old.id());
            if fresh.local_media.ownership == StreamOwnership::Exclusive {
                old.stop();
            }
        }
        new_track.set_enabled(fresh.local_media.is_enabled(kind));
        stream.add_track(new_track.clone());
        transport::replace_track(session, old_track, new_track.clone());

        let device_id = new_track
            .device_id()
            .map_or(requested_id, str::to_string);
        tracing::info!(?kind, %device_id, "switched local device");
        session.dispatch(Transition::DeviceSwitched { kind, device_id });
    }
    Ok(())
}

fn is_current_stream(state: &SessionState, stream: &Arc<MediaStream>) -> bool {
    state
        .local_media
        .stream
        .as_ref()
        .is_some_and(|s| Arc::ptr_eq(s, stream))
}

/// Re-enumerate devices. If a selected device disappeared, switch to the
/// next one in rotation.
pub(crate) async fn update_device_list(session: &Session) -> Result<(), SessionError> {
    let current = devices(session).enumerate_devices().await?;
    let state = session.snapshot();
    let previous = state.local_media.devices.clone();
    if previous == current {
        return Ok(());
    }
    let changes = diff_devices(&previous, &current);
    tracing::debug!(
        added = changes.added.len(),
        removed = changes.removed.len(),
        changed = changes.changed.len(),
        "device list changed"
    );
    session.dispatch(Transition::DevicesUpdated(current.clone()));

    let Some(stream) = state.local_media.stream.as_ref() else {
        return Ok(());
    };
    let mut audio = None;
    let mut video = None;
    for kind in [TrackKind::Audio, TrackKind::Video] {
        let Some(selected) = state.local_media.selected_device(kind) else {
            continue;
        };
        if !stream.has_track(kind) || !changes.removed.iter().any(|d| d.device_id == selected) {
            continue;
        }
        let Some(next) = next_device(
            &previous,
            &current,
            DeviceKind::from(kind),
            Some(selected),
            &state.local_media.busy_device_ids,
        ) else {
            tracing::warn!(?kind, %selected, "selected device removed and none left");
            continue;
        };
        tracing::info!(?kind, from = %selected, to = %next.device_id, "selected device removed");
        match kind {
            TrackKind::Audio => audio = Some(next.device_id.clone()),
            TrackKind::Video => video = Some(next.device_id.clone()),
        }
    }
    if audio.is_some() || video.is_some() {
        switch_stream(session, audio, video).await?;
    }
    Ok(())
}

async fn refresh_device_list(session: &Session) {
    if let Err(e) = update_device_list(session).await {
        tracing::warn!("device enumeration failed: {e}");
    }
}

/// Debounced hot-plug handling. Ends when the notifier or the session goes away.
pub(crate) async fn watch_device_changes(
    session: WeakSession,
    mut changes: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
) {
    while changes.recv().await.is_some() {
        let mut closed = false;
        loop {
            match tokio::time::timeout(debounce, changes.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }
        let Some(session) = session.upgrade() else {
            return;
        };
        refresh_device_list(&session).await;
        if closed {
            break;
        }
    }
    tracing::debug!("device change watcher ended");
}

pub(crate) async fn start_screenshare(session: &Session) -> Result<(), SessionError> {
    let acquired = session.dispatch_if(
        |s| s.local_screenshare.status == ScreenshareStatus::Empty,
        Transition::LocalScreenshareStarting,
    );
    if !acquired {
        return Err(SessionError::Room("screenshare already active".into()));
    }
    let stream = match devices(session).get_display_media().await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("get_display_media failed: {e}");
            session.dispatch(Transition::LocalScreenshareFailed(e.clone()));
            return Err(e.into());
        }
    };
    if session.snapshot().local_screenshare.status != ScreenshareStatus::Starting {
        stream.stop_all();
        return Ok(());
    }

    session.dispatch(Transition::LocalScreenshareStarted(stream.clone()));
    transport::add_screenshare(session, &stream);
    let request = SignalRequest::StartScreenshare {
        stream_id: stream.id().to_string(),
        has_audio_track: stream.has_track(TrackKind::Audio),
    };
    if let Err(e) = signal::send(session, request) {
        tracing::debug!("start_screenshare not sent: {e}");
    }
    tracing::info!(stream_id = stream.id(), "screenshare started");
    Ok(())
}

pub(crate) fn stop_screenshare(session: &Session) -> Result<(), SessionError> {
    let Some(stream) = session.snapshot().local_screenshare.stream.clone() else {
        return Err(SessionError::Room("no active screenshare".into()));
    };
    stream.stop_all();
    transport::remove_screenshare(session, &stream);
    let request = SignalRequest::StopScreenshare {
        stream_id: stream.id().to_string(),
    };
    if let Err(e) = signal::send(session, request) {
        tracing::debug!("stop_screenshare not sent: {e}");
    }
    session.dispatch(Transition::LocalScreenshareStopped);
    tracing::info!(stream_id = stream.id(), "screenshare stopped");
    Ok(())
}
