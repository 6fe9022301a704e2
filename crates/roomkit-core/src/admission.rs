//! Per-stream admission: when to pull a remote stream and when to let go.
//!
//! Every `(participant, stream)` pair carries a [`StreamState`]. Pending
//! states are turned into transport calls in batches; each call moves the
//! stream to its `Done*` state through [`StreamState::complete`].

use thiserror::Error;

use crate::participants::RemoteParticipants;
use crate::session::Session;
use crate::state::{SessionState, TransportStatus};
use crate::transitions::Transition;
use crate::transport::AcceptStreamRequest;

/// Slot id of a participant's camera/microphone stream.
pub const PRIMARY_SLOT: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    ToAccept,
    /// Announced by a participant who joined after us.
    NewAccept,
    /// Announced by a participant who was present when we joined.
    OldAccept,
    ToUnaccept,
    DoneAccept,
    DoneUnaccept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream state {0:?} has no pending transition")]
pub struct InvalidStreamTransition(pub StreamState);

impl StreamState {
    /// The state a stream ends up in once its pending action has been applied.
    pub fn complete(self) -> Result<StreamState, InvalidStreamTransition> {
        match self {
            StreamState::ToAccept | StreamState::NewAccept | StreamState::OldAccept => {
                Ok(StreamState::DoneAccept)
            }
            StreamState::ToUnaccept => Ok(StreamState::DoneUnaccept),
            StreamState::DoneAccept | StreamState::DoneUnaccept => {
                Err(InvalidStreamTransition(self))
            }
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, StreamState::DoneAccept | StreamState::DoneUnaccept)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    pub client_id: String,
    pub stream_id: String,
    pub state: StreamState,
}

impl StreamUpdate {
    pub fn new(
        client_id: impl Into<String>,
        stream_id: impl Into<String>,
        state: StreamState,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            stream_id: stream_id.into(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionAction {
    Accept {
        client_id: String,
        stream_id: String,
        from: StreamState,
    },
    Release {
        client_id: String,
        stream_id: String,
    },
}

impl AdmissionAction {
    pub fn client_id(&self) -> &str {
        match self {
            AdmissionAction::Accept { client_id, .. }
            | AdmissionAction::Release { client_id, .. } => client_id,
        }
    }

    pub fn stream_id(&self) -> &str {
        match self {
            AdmissionAction::Accept { stream_id, .. }
            | AdmissionAction::Release { stream_id, .. } => stream_id,
        }
    }

    pub fn update(&self) -> Result<StreamUpdate, InvalidStreamTransition> {
        let from = match self {
            AdmissionAction::Accept { from, .. } => *from,
            AdmissionAction::Release { .. } => StreamState::ToUnaccept,
        };
        Ok(StreamUpdate::new(self.client_id(), self.stream_id(), from.complete()?))
    }

    /// Stream id as the transport knows it: the primary slot is keyed by client id.
    pub fn transport_stream_id(&self) -> &str {
        if self.stream_id() == PRIMARY_SLOT {
            self.client_id()
        } else {
            self.stream_id()
        }
    }
}

/// Compute the admission batch for the current roster.
///
/// `accept_from_both_sides` decides which side of a simultaneous discovery
/// pulls: when set, we pull streams of participants who joined after us;
/// otherwise we pull streams of participants who were already present.
pub fn plan_admissions(
    status: TransportStatus,
    participants: &RemoteParticipants,
    accept_from_both_sides: bool,
) -> Vec<AdmissionAction> {
    if status != TransportStatus::Ready {
        return Vec::new();
    }
    let mut actions = Vec::new();
    for participant in participants.participants() {
        for entry in &participant.streams {
            let accept = match entry.state {
                StreamState::ToAccept => true,
                StreamState::NewAccept => accept_from_both_sides,
                StreamState::OldAccept => !accept_from_both_sides,
                StreamState::ToUnaccept => {
                    actions.push(AdmissionAction::Release {
                        client_id: participant.id.clone(),
                        stream_id: entry.id.clone(),
                    });
                    false
                }
                StreamState::DoneAccept | StreamState::DoneUnaccept => false,
            };
            if accept {
                actions.push(AdmissionAction::Accept {
                    client_id: participant.id.clone(),
                    stream_id: entry.id.clone(),
                    from: entry.state,
                });
            }
        }
    }
    actions
}

pub fn pending_admissions(state: &SessionState) -> Vec<AdmissionAction> {
    plan_admissions(
        state.transport.status,
        &state.remote_participants,
        state.transport.accept_from_both_sides,
    )
}

/// Apply one admission batch against the transport manager.
///
/// Batches are mutually exclusive: the `is_accepting_streams` flag is taken
/// with a guarded transition, and released together with the batch results.
pub(crate) fn accept_streams(session: &Session) {
    let acquired = session.dispatch_if(
        |s| !s.transport.is_accepting_streams,
        Transition::AcceptingStreams,
    );
    if !acquired {
        tracing::debug!("admission batch already in flight");
        return;
    }

    let state = session.snapshot();
    let Some(manager) = state.transport.manager.clone() else {
        session.dispatch(Transition::StreamBatchApplied(Vec::new()));
        return;
    };

    let mut updates = Vec::new();
    for action in pending_admissions(&state) {
        match &action {
            AdmissionAction::Accept {
                client_id,
                stream_id,
                ..
            } => {
                tracing::info!(%client_id, %stream_id, "accepting remote stream");
                manager.accept_new_stream(AcceptStreamRequest {
                    stream_id: action.transport_stream_id().to_string(),
                    client_id: client_id.clone(),
                    should_add_local_video: stream_id == PRIMARY_SLOT,
                    active_breakout: false,
                });
            }
            AdmissionAction::Release {
                client_id,
                stream_id,
            } => {
                tracing::info!(%client_id, %stream_id, "releasing remote stream");
                manager.disconnect(action.transport_stream_id(), false);
            }
        }
        match action.update() {
            Ok(update) => updates.push(update),
            Err(e) => tracing::warn!("admission action without transition: {e}"),
        }
    }
    session.dispatch(Transition::StreamBatchApplied(updates));
}
