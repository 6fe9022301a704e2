use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::admission::{StreamState, StreamUpdate};
use crate::devices::MediaStream;
use crate::signal::{ClientMetadata, SignalClient};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    #[default]
    Member,
    Visitor,
}

/// Kind hint the transport attaches to an arriving remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Webcam,
    Screenshare,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub state: StreamState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteParticipant {
    pub id: String,
    pub display_name: String,
    pub role: ParticipantRole,
    pub external_id: Option<String>,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub stream: Option<Arc<MediaStream>>,
    pub presentation_stream: Option<Arc<MediaStream>>,
    pub streams: Vec<StreamEntry>,
    /// Joined after us, as opposed to being present when we joined.
    pub new_joiner: bool,
}

impl RemoteParticipant {
    pub fn from_client(client: &SignalClient, new_joiner: bool) -> Self {
        let state = if new_joiner {
            StreamState::NewAccept
        } else {
            StreamState::OldAccept
        };
        let mut streams: Vec<StreamEntry> = Vec::with_capacity(client.streams.len());
        for id in &client.streams {
            if !streams.iter().any(|s| &s.id == id) {
                streams.push(StreamEntry {
                    id: id.clone(),
                    state,
                });
            }
        }
        Self {
            id: client.id.clone(),
            display_name: client.display_name.clone(),
            role: client.role,
            external_id: client.external_id.clone(),
            is_audio_enabled: client.is_audio_enabled,
            is_video_enabled: client.is_video_enabled,
            stream: None,
            presentation_stream: None,
            streams,
            new_joiner,
        }
    }

    /// State for a stream that starts after the participant is known.
    ///
    /// New joiners keep the tie-break tag so only one side pulls the stream.
    fn incoming_stream_state(&self) -> StreamState {
        if self.new_joiner {
            StreamState::NewAccept
        } else {
            StreamState::ToAccept
        }
    }

    pub fn stream_state(&self, stream_id: &str) -> Option<StreamState> {
        self.streams.iter().find(|s| s.id == stream_id).map(|s| s.state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitingParticipant {
    pub id: String,
    pub display_name: String,
}

/// Outcome of attaching an arrived remote stream to its participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamBinding {
    Primary,
    Presentation,
    Duplicate,
    UnknownParticipant,
}

/// Roster of remote participants, in join order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteParticipants {
    participants: Vec<RemoteParticipant>,
}

impl RemoteParticipants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster, dropping duplicate ids.
    pub fn replace_all(&mut self, participants: Vec<RemoteParticipant>) {
        self.participants.clear();
        for participant in participants {
            self.add_participant(participant);
        }
    }

    /// Returns `false` if a participant with this id is already present.
    pub fn add_participant(&mut self, participant: RemoteParticipant) -> bool {
        if self.participants.iter().any(|p| p.id == participant.id) {
            return false;
        }
        self.participants.push(participant);
        true
    }

    pub fn remove_participant(&mut self, id: &str) -> Option<RemoteParticipant> {
        let index = self.participants.iter().position(|p| p.id == id)?;
        Some(self.participants.remove(index))
    }

    pub fn participants(&self) -> &[RemoteParticipant] {
        &self.participants
    }

    pub fn participant(&self, id: &str) -> Option<&RemoteParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn participant_mut(&mut self, id: &str) -> Option<&mut RemoteParticipant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }

    pub fn set_audio_enabled(&mut self, id: &str, enabled: bool) {
        if let Some(p) = self.participant_mut(id) {
            p.is_audio_enabled = enabled;
        }
    }

    pub fn set_video_enabled(&mut self, id: &str, enabled: bool) {
        if let Some(p) = self.participant_mut(id) {
            p.is_video_enabled = enabled;
        }
    }

    pub fn apply_metadata(&mut self, id: &str, metadata: &ClientMetadata) {
        if let Some(p) = self.participant_mut(id) {
            if let Some(name) = &metadata.display_name {
                p.display_name = name.clone();
            }
            if metadata.external_id.is_some() {
                p.external_id = metadata.external_id.clone();
            }
        }
    }

    /// Announce a stream for a participant. An id already listed is re-armed
    /// only if it was released; pending or accepted entries are left alone.
    pub fn add_stream(&mut self, client_id: &str, stream_id: &str) {
        let Some(p) = self.participant_mut(client_id) else {
            return;
        };
        let state = p.incoming_stream_state();
        match p.streams.iter_mut().find(|s| s.id == stream_id) {
            Some(entry) => {
                if matches!(entry.state, StreamState::DoneUnaccept | StreamState::ToUnaccept) {
                    entry.state = state;
                }
            }
            None => p.streams.push(StreamEntry {
                id: stream_id.to_string(),
                state,
            }),
        }
    }

    /// Withdraw a stream. Accepted streams are queued for release; streams
    /// that were never accepted are simply forgotten.
    pub fn stop_stream(&mut self, client_id: &str, stream_id: &str) {
        let Some(p) = self.participant_mut(client_id) else {
            return;
        };
        if let Some(index) = p.streams.iter().position(|s| s.id == stream_id) {
            match p.streams[index].state {
                StreamState::DoneAccept => p.streams[index].state = StreamState::ToUnaccept,
                StreamState::ToAccept | StreamState::NewAccept | StreamState::OldAccept => {
                    p.streams.remove(index);
                }
                StreamState::ToUnaccept | StreamState::DoneUnaccept => {}
            }
        }
        if p
            .presentation_stream
            .as_ref()
            .is_some_and(|s| s.id() == stream_id)
        {
            p.presentation_stream = None;
        }
    }

    /// Queue a release for a stream the transport pulled after it had
    /// already been withdrawn here. Returns `false` if the participant is
    /// gone or the stream id is listed again.
    pub fn release_withdrawn(&mut self, client_id: &str, stream_id: &str) -> bool {
        let Some(p) = self.participant_mut(client_id) else {
            return false;
        };
        if p.streams.iter().any(|s| s.id == stream_id) {
            return false;
        }
        p.streams.push(StreamEntry {
            id: stream_id.to_string(),
            state: StreamState::ToUnaccept,
        });
        true
    }

    /// Apply one admission result. Re-applying an update is a no-op; an
    /// update that does not follow the transition table is rejected.
    pub fn apply_stream_update(&mut self, update: &StreamUpdate) -> bool {
        let Some(p) = self.participant_mut(&update.client_id) else {
            return false;
        };
        let Some(entry) = p.streams.iter_mut().find(|s| s.id == update.stream_id) else {
            return false;
        };
        if entry.state == update.state {
            return true;
        }
        match entry.state.complete() {
            Ok(next) if next == update.state => {
                entry.state = next;
                true
            }
            _ => {
                tracing::warn!(
                    client_id = %update.client_id,
                    stream_id = %update.stream_id,
                    "rejected stream transition {:?} -> {:?}",
                    entry.state,
                    update.state
                );
                false
            }
        }
    }

    /// Attach a stream delivered by the transport.
    ///
    /// The first untyped stream becomes the participant's primary stream;
    /// any other stream, or one typed as screenshare, becomes the
    /// presentation stream. A stream already bound is ignored.
    pub fn bind_stream(
        &mut self,
        client_id: &str,
        stream: Arc<MediaStream>,
        stream_type: Option<StreamType>,
    ) -> StreamBinding {
        let Some(p) = self.participant_mut(client_id) else {
            return StreamBinding::UnknownParticipant;
        };
        let bound = |slot: &Option<Arc<MediaStream>>| {
            slot.as_ref().is_some_and(|s| s.id() == stream.id())
        };
        if bound(&p.stream) || bound(&p.presentation_stream) {
            return StreamBinding::Duplicate;
        }
        if p.stream.is_some() || stream_type == Some(StreamType::Screenshare) {
            p.presentation_stream = Some(stream);
            StreamBinding::Presentation
        } else {
            p.stream = Some(stream);
            StreamBinding::Primary
        }
    }
}
