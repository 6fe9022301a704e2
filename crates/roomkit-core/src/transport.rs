//! Peer transport coordination.
//!
//! The transport itself (ICE, SFU/P2P routing) lives behind [`RtcManager`].
//! This module decides when a dispatcher is created, when the local stream
//! is handed over as slot "0", and when everything is torn down.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::devices::{MediaStream, MediaTrack, TrackKind};
use crate::errors::SessionError;
use crate::handle::Handle;
use crate::participants::StreamType;
use crate::session::Session;
use crate::signal::SignalChannel;
use crate::state::{LocalMediaStatus, SessionState, TransportStatus};
use crate::transitions::Transition;

pub use crate::admission::PRIMARY_SLOT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptStreamRequest {
    pub stream_id: String,
    pub client_id: String,
    pub should_add_local_video: bool,
    pub active_breakout: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// The peer-media engine for one room connection.
pub trait RtcManager: Send + Sync {
    fn add_new_stream(
        &self,
        slot_id: &str,
        stream: Arc<MediaStream>,
        audio_muted: bool,
        video_muted: bool,
    );
    fn accept_new_stream(&self, request: AcceptStreamRequest);
    fn disconnect(&self, stream_id: &str, active_breakout: bool);
    fn disconnect_all(&self);
    /// `old_track` is `None` when the previous track was already removed.
    fn replace_track(&self, old_track: Option<Arc<MediaTrack>>, new_track: Arc<MediaTrack>);
    fn remove_stream(&self, stream_id: &str, stream: Arc<MediaStream>, reason: &str);
    fn update_stream_resolution(&self, stream_id: &str, layer: Option<u8>, resolution: Resolution);
    fn should_accept_streams_from_both_sides(&self) -> bool;
}

/// Creates and destroys [`RtcManager`]s as the room comes and goes.
pub trait TransportDispatcher: Send + Sync {
    fn stop_manager(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaEnablement {
    pub audio: bool,
    pub video: bool,
}

/// Lets the transport ask which local kinds are currently enabled.
pub trait MediaConstraintsProvider: Send + Sync {
    fn media_enablement(&self) -> MediaEnablement;
}

/// Transport callbacks, delivered through the sender given at creation.
pub enum TransportEvent {
    ManagerCreated(Arc<dyn RtcManager>),
    ManagerDestroyed,
    StreamAdded {
        client_id: String,
        stream_id: String,
        stream: Arc<MediaStream>,
        stream_type: Option<StreamType>,
    },
}

pub trait TransportFactory: Send + Sync {
    fn create_dispatcher(
        &self,
        channel: Arc<dyn SignalChannel>,
        constraints: Arc<dyn MediaConstraintsProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportDispatcher>, SessionError>;
}

/// Constraints read from the live session state.
struct StateConstraints {
    state: watch::Receiver<Arc<SessionState>>,
}

impl MediaConstraintsProvider for StateConstraints {
    fn media_enablement(&self) -> MediaEnablement {
        let state = self.state.borrow();
        MediaEnablement {
            audio: state.local_media.microphone_enabled,
            video: state.local_media.camera_enabled,
        }
    }
}

pub fn should_connect(state: &SessionState) -> bool {
    state.app.wants_to_join && state.signal.channel.is_some() && !state.transport.dispatcher_created
}

pub fn should_initialize(state: &SessionState) -> bool {
    state.transport.manager.is_some()
        && !state.transport.manager_initialized
        && state.local_media.status == LocalMediaStatus::Started
}

pub fn should_disconnect(state: &SessionState) -> bool {
    !state.app.wants_to_join
        && (state.transport.dispatcher_created || state.transport.status != TransportStatus::Empty)
}

pub(crate) fn connect(session: &Session, factory: Arc<dyn TransportFactory>) {
    // Marked before creation: a failed factory must not be retried in a loop.
    if !session.dispatch_if(should_connect, Transition::TransportDispatcherCreated) {
        return;
    }
    let Some(channel) = session.snapshot().signal.channel.clone() else {
        return;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let constraints = Arc::new(StateConstraints {
        state: session.subscribe(),
    });
    match factory.create_dispatcher(channel.arc(), constraints, tx) {
        Ok(dispatcher) => {
            let generation = session.install_dispatcher(dispatcher);
            tracing::info!(generation, "transport dispatcher created");
            let session = session.clone();
            tokio::spawn(async move {
                event_loop(session, generation, rx).await;
            });
        }
        Err(e) => tracing::error!("transport dispatcher not created: {e}"),
    }
}

async fn event_loop(
    session: Session,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        if !session.is_current_dispatcher(generation) {
            tracing::debug!(generation, "dropping event from stale dispatcher");
            continue;
        }
        match event {
            TransportEvent::ManagerCreated(manager) => {
                let accept_from_both_sides = manager.should_accept_streams_from_both_sides();
                tracing::info!(accept_from_both_sides, "transport manager created");
                session.dispatch(Transition::TransportManagerCreated {
                    manager: Handle::new(manager),
                    accept_from_both_sides,
                });
            }
            TransportEvent::ManagerDestroyed => {
                tracing::info!("transport manager destroyed");
                session.dispatch(Transition::TransportManagerDestroyed);
            }
            TransportEvent::StreamAdded {
                client_id,
                stream_id,
                stream,
                stream_type,
            } => {
                tracing::debug!(%client_id, %stream_id, "remote stream added");
                session.dispatch(Transition::RemoteStreamAdded {
                    client_id,
                    stream,
                    stream_type,
                });
            }
        }
    }
    tracing::debug!(generation, "transport event loop ended");
}

/// Hand the local stream to the manager as slot "0".
pub(crate) fn initialize(session: &Session) {
    if !session.dispatch_if(should_initialize, Transition::TransportInitialized) {
        return;
    }
    let state = session.snapshot();
    let (Some(manager), Some(stream)) = (
        state.transport.manager.clone(),
        state.local_media.stream.clone(),
    ) else {
        return;
    };
    tracing::info!(stream_id = stream.id(), "adding local stream to transport");
    manager.add_new_stream(
        PRIMARY_SLOT,
        stream,
        !state.local_media.microphone_enabled,
        !state.local_media.camera_enabled,
    );
}

pub(crate) fn disconnect(session: &Session) {
    if let Some(manager) = session.snapshot().transport.manager.clone() {
        manager.disconnect_all();
    }
    if let Some(dispatcher) = session.take_dispatcher() {
        dispatcher.stop_manager();
    }
    tracing::info!("transport disconnected");
    session.dispatch(Transition::TransportDisconnected);
}

fn current_manager(session: &Session) -> Option<Handle<dyn RtcManager>> {
    session.snapshot().transport.manager.clone()
}

/// Mirror a local device switch into the transport.
pub(crate) fn replace_track(
    session: &Session,
    old_track: Option<Arc<MediaTrack>>,
    new_track: Arc<MediaTrack>,
) {
    let Some(manager) = current_manager(session) else {
        return;
    };
    tracing::debug!(
        kind = ?new_track.kind(),
        track_id = new_track.id(),
        "replacing transport track"
    );
    manager.replace_track(old_track, new_track);
}

/// Withdraw the local stream from slot "0" when it is released.
pub(crate) fn remove_local_stream(session: &Session, stream: &Arc<MediaStream>) {
    let state = session.snapshot();
    if !state.transport.manager_initialized {
        return;
    }
    if let Some(manager) = state.transport.manager.clone() {
        manager.remove_stream(PRIMARY_SLOT, stream.clone(), "stop");
    }
}

pub(crate) fn add_screenshare(session: &Session, stream: &Arc<MediaStream>) {
    if let Some(manager) = current_manager(session) {
        let has_audio = stream.has_track(TrackKind::Audio);
        manager.add_new_stream(stream.id(), stream.clone(), !has_audio, false);
    }
}

pub(crate) fn remove_screenshare(session: &Session, stream: &Arc<MediaStream>) {
    if let Some(manager) = current_manager(session) {
        manager.remove_stream(stream.id(), stream.clone(), "end");
    }
}

/// Tell the transport how large a remote stream is rendered.
pub(crate) fn report_stream_resolution(
    session: &Session,
    client_id: &str,
    stream_id: &str,
    resolution: Resolution,
) {
    let Some(manager) = current_manager(session) else {
        return;
    };
    let transport_id = if stream_id == PRIMARY_SLOT {
        client_id
    } else {
        stream_id
    };
    manager.update_stream_resolution(transport_id, None, resolution);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_needs_channel_and_no_dispatcher() {
        let mut state = SessionState::default();
        state.app.wants_to_join = true;
        assert!(!should_connect(&state));
        state.signal.channel = Some(Handle::new(Arc::new(crate::test_support::NullChannel)
            as Arc<dyn SignalChannel>));
        assert!(should_connect(&state));
        state.transport.dispatcher_created = true;
        assert!(!should_connect(&state));
    }

    #[test]
    fn disconnect_only_after_intent_withdrawn() {
        let mut state = SessionState::default();
        state.transport.dispatcher_created = true;
        state.app.wants_to_join = true;
        assert!(!should_disconnect(&state));
        state.app.wants_to_join = false;
        assert!(should_disconnect(&state));
        state.transport = Default::default();
        assert!(!should_disconnect(&state));
    }
}
