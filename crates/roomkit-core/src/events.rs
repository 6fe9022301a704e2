use std::sync::{Arc, PoisonError, RwLock};

use crate::chat::ChatMessage;
use crate::participants::{RemoteParticipant, WaitingParticipant};
use crate::state::{RoomStatus, SessionState};
use crate::transitions::Transition;

/// Discrete notifications emitted to listeners after a transition commits.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    RoomStatusChanged(RoomStatus),
    ParticipantJoined(RemoteParticipant),
    ParticipantLeft(String), // client id
    WaitingParticipantJoined(WaitingParticipant),
    WaitingParticipantLeft(String), // client id
    ChatMessageReceived(ChatMessage),
    KnockRejected,
    RoomSessionEnded(String), // room session id
}

/// Trait for receiving events from the session.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait SessionEventListener: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone, Default)]
pub struct EventEmitter {
    listeners: Arc<RwLock<Vec<Arc<dyn SessionEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn emit(&self, event: SessionEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

/// Notifications implied by one committed transition.
pub fn notifications(
    transition: &Transition,
    old: &SessionState,
    new: &SessionState,
) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    if old.room.status != new.room.status {
        events.push(SessionEvent::RoomStatusChanged(new.room.status));
        if new.room.status == RoomStatus::KnockRejected {
            events.push(SessionEvent::KnockRejected);
        }
    }

    for p in new.remote_participants.participants() {
        if old.remote_participants.participant(&p.id).is_none() {
            events.push(SessionEvent::ParticipantJoined(p.clone()));
        }
    }
    for p in old.remote_participants.participants() {
        if new.remote_participants.participant(&p.id).is_none() {
            events.push(SessionEvent::ParticipantLeft(p.id.clone()));
        }
    }

    for w in &new.waiting_participants {
        if !old.waiting_participants.iter().any(|o| o.id == w.id) {
            events.push(SessionEvent::WaitingParticipantJoined(w.clone()));
        }
    }
    for w in &old.waiting_participants {
        if !new.waiting_participants.iter().any(|n| n.id == w.id) {
            events.push(SessionEvent::WaitingParticipantLeft(w.id.clone()));
        }
    }

    match transition {
        Transition::ChatMessageReceived(message) => {
            events.push(SessionEvent::ChatMessageReceived(message.clone()));
        }
        Transition::RoomSessionEnded { room_session_id }
            if old.room.session.is_some() && new.room.session.is_none() =>
        {
            events.push(SessionEvent::RoomSessionEnded(room_session_id.clone()));
        }
        _ => {}
    }
    events
}
