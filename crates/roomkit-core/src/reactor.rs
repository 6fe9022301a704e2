//! Reactors: projections of session state paired with effects.
//!
//! After every transition the engine compares each effect's projection on
//! the previous and the current state. An effect whose projection changed
//! is spawned once, with the new projection.
//!
//! Every effect must dispatch a transition that changes its own projection
//! again (usually by making its trigger false). The loop guard catches
//! effects whose own dispatches keep re-firing them. Transitions are
//! attributed to the effect whose task dispatched them; anything else
//! (protocol events, caller API, background loops) is external and never
//! counts towards a streak.

use std::sync::{Mutex, PoisonError};

use tracing::Instrument;

use crate::admission::{self, AdmissionAction};
use crate::media;
use crate::resolvers;
use crate::room;
use crate::session::Session;
use crate::signal;
use crate::state::{LocalMediaMode, SessionState, TransportStatus};
use crate::transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    FetchCredentials,
    FetchOrganization,
    ConnectSignal,
    IdentifyDevice,
    DisconnectSignal,
    StartLocalMedia,
    StopLocalMedia,
    ConnectRoom,
    LeaveRoom,
    ReportMediaEnablement,
    ConnectTransport,
    InitializeTransport,
    DisconnectTransport,
    AcceptStreams,
}

impl Effect {
    pub const ALL: [Effect; 14] = [
        Effect::FetchCredentials,
        Effect::FetchOrganization,
        Effect::ConnectSignal,
        Effect::IdentifyDevice,
        Effect::DisconnectSignal,
        Effect::StartLocalMedia,
        Effect::StopLocalMedia,
        Effect::ConnectRoom,
        Effect::LeaveRoom,
        Effect::ReportMediaEnablement,
        Effect::ConnectTransport,
        Effect::InitializeTransport,
        Effect::DisconnectTransport,
        Effect::AcceptStreams,
    ];

    /// The part of the state this effect watches.
    pub fn project(self, state: &SessionState) -> Projection {
        match self {
            Effect::FetchCredentials => {
                Projection::Trigger(resolvers::should_fetch_credentials(state))
            }
            Effect::FetchOrganization => {
                Projection::Trigger(resolvers::should_fetch_organization(state))
            }
            Effect::ConnectSignal => Projection::Trigger(signal::should_connect(state)),
            Effect::IdentifyDevice => Projection::Trigger(signal::should_identify_device(state)),
            Effect::DisconnectSignal => Projection::Trigger(signal::should_disconnect(state)),
            Effect::StartLocalMedia => Projection::StartLocalMedia(media::should_start(state)),
            Effect::StopLocalMedia => Projection::Trigger(media::should_stop(state)),
            Effect::ConnectRoom => Projection::Trigger(room::should_connect(state)),
            Effect::LeaveRoom => Projection::Trigger(room::should_leave(state)),
            Effect::ReportMediaEnablement => {
                Projection::MediaEnablement(room::media_enablement(state))
            }
            Effect::ConnectTransport => Projection::Trigger(transport::should_connect(state)),
            Effect::InitializeTransport => {
                Projection::Trigger(transport::should_initialize(state))
            }
            Effect::DisconnectTransport => {
                Projection::Trigger(transport::should_disconnect(state))
            }
            Effect::AcceptStreams => Projection::AcceptStreams {
                ready: state.transport.status == TransportStatus::Ready
                    && state.transport.manager.is_some(),
                accepting: state.transport.is_accepting_streams,
                pending: admission::pending_admissions(state),
            },
        }
    }
}

/// Watched value of one effect. Compared by value, never by identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Projection {
    Trigger(bool),
    StartLocalMedia(Option<LocalMediaMode>),
    MediaEnablement(Option<(bool, bool)>),
    AcceptStreams {
        ready: bool,
        accepting: bool,
        pending: Vec<AdmissionAction>,
    },
}

tokio::task_local! {
    static RUNNING_EFFECT: Effect;
}

/// The effect whose run is executing on the current task, if any.
pub(crate) fn running_effect() -> Option<Effect> {
    RUNNING_EFFECT.try_with(|effect| *effect).ok()
}

/// Spawn one fired effect. Transitions it dispatches are attributed to it.
pub(crate) fn spawn(effect: Effect, projection: Projection, session: Session) {
    let span = tracing::debug_span!("effect", ?effect);
    let task = run(effect, projection, session).instrument(span);
    tokio::spawn(RUNNING_EFFECT.scope(effect, task));
}

/// An effect re-fired by its own dispatches too many times in a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDefect {
    pub effect: Effect,
    pub streak: usize,
    pub transition: &'static str,
}

#[derive(Debug, Default)]
struct LoopGuard {
    streaks: Vec<(Effect, usize)>,
    suppressed: Vec<Effect>,
    defects: Vec<LoopDefect>,
}

impl LoopGuard {
    /// Record one transition for `effect`. `own` is set when the transition
    /// was dispatched by a run of `effect` itself. Returns `false` if the
    /// effect must not run.
    fn record(
        &mut self,
        effect: Effect,
        changed: bool,
        own: bool,
        threshold: Option<usize>,
        transition: &'static str,
    ) -> bool {
        let index = match self.streaks.iter().position(|(e, _)| *e == effect) {
            Some(index) => index,
            None => {
                self.streaks.push((effect, 0));
                self.streaks.len() - 1
            }
        };
        if !own && !changed {
            return true;
        }
        if !own || !changed {
            // Fired from outside, or settled its own trigger.
            self.streaks[index].1 = 0;
            self.suppressed.retain(|e| *e != effect);
            return true;
        }
        self.streaks[index].1 += 1;
        let streak = self.streaks[index].1;
        let Some(threshold) = threshold else {
            return true;
        };
        if self.suppressed.contains(&effect) {
            return false;
        }
        if streak > threshold {
            tracing::error!(
                ?effect,
                streak,
                transition,
                "reactor keeps re-firing itself without settling; suppressing"
            );
            self.suppressed.push(effect);
            self.defects.push(LoopDefect {
                effect,
                streak,
                transition,
            });
            return false;
        }
        true
    }
}

pub struct ReactorEngine {
    effects: Vec<Effect>,
    loop_threshold: Option<usize>,
    guard: Mutex<LoopGuard>,
}

impl ReactorEngine {
    pub fn new(loop_threshold: Option<usize>) -> Self {
        Self {
            effects: Vec::new(),
            loop_threshold,
            guard: Mutex::new(LoopGuard::default()),
        }
    }

    pub fn register(&mut self, effect: Effect) {
        if !self.effects.contains(&effect) {
            self.effects.push(effect);
        }
    }

    /// Effects whose projection differs between `old` and `new`, in
    /// registration order, paired with their new projection. `source` is
    /// the effect that dispatched the transition, if any.
    pub fn triggered(
        &self,
        transition: &'static str,
        source: Option<Effect>,
        old: &SessionState,
        new: &SessionState,
    ) -> Vec<(Effect, Projection)> {
        let mut guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let mut fired = Vec::new();
        for &effect in &self.effects {
            let projection = effect.project(new);
            let changed = effect.project(old) != projection;
            let own = source == Some(effect);
            if guard.record(effect, changed, own, self.loop_threshold, transition) && changed {
                fired.push((effect, projection));
            }
        }
        fired
    }

    pub fn defects(&self) -> Vec<LoopDefect> {
        self.guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .defects
            .clone()
    }
}

/// Execute one fired effect. Effects re-read fresh state as they go; the
/// projection only says what changed.
async fn run(effect: Effect, projection: Projection, session: Session) {
    let collaborators = session.collaborators();
    match (effect, projection) {
        (_, Projection::Trigger(false)) => {}
        (Effect::FetchCredentials, _) => {
            resolvers::fetch_credentials(&session, collaborators.credentials.clone()).await;
        }
        (Effect::FetchOrganization, _) => {
            resolvers::fetch_organization(&session, collaborators.organizations.clone()).await;
        }
        (Effect::ConnectSignal, _) => {
            signal::connect(&session, collaborators.signal.clone()).await;
        }
        (Effect::IdentifyDevice, _) => signal::identify_device(&session),
        (Effect::DisconnectSignal, _) => signal::disconnect(&session),
        (Effect::StartLocalMedia, Projection::StartLocalMedia(Some(mode))) => {
            if let Err(e) = media::start(&session, mode).await {
                tracing::warn!("local media not started: {e}");
            }
        }
        (Effect::StartLocalMedia, _) => {}
        (Effect::StopLocalMedia, _) => media::stop(&session, true),
        (Effect::ConnectRoom, _) => room::connect(&session),
        (Effect::LeaveRoom, _) => room::leave(&session),
        (Effect::ReportMediaEnablement, Projection::MediaEnablement(Some((audio, video)))) => {
            room::report_media_enablement(&session, audio, video);
        }
        (Effect::ReportMediaEnablement, _) => {}
        (Effect::ConnectTransport, _) => {
            transport::connect(&session, collaborators.transport.clone());
        }
        (Effect::InitializeTransport, _) => transport::initialize(&session),
        (Effect::DisconnectTransport, _) => transport::disconnect(&session),
        (
            Effect::AcceptStreams,
            Projection::AcceptStreams {
                ready: true,
                accepting: false,
                pending,
            },
        ) if !pending.is_empty() => admission::accept_streams(&session),
        (Effect::AcceptStreams, _) => {}
    }
}
