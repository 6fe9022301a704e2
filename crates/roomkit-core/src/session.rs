//! The session context: store, reactors, collaborators and the caller API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::watch;

use crate::config::SessionConfig;
use crate::devices::{MediaDevices, MediaOptions, TrackKind};
use crate::errors::SessionError;
use crate::events::{self, EventEmitter, SessionEventListener};
use crate::reactor::{self, Effect, LoopDefect, ReactorEngine};
use crate::resolvers::{self, ApiClient, CredentialsService, OrganizationService};
use crate::signal::{KnockAction, SignalConnector};
use crate::state::{AppIntent, LocalMediaMode, SessionState};
use crate::store::SessionStore;
use crate::transitions::Transition;
use crate::transport::{Resolution, TransportDispatcher, TransportFactory};
use crate::views::{self, RoomView};
use crate::{chat, media, room, transport};

/// External services the session drives.
pub struct Collaborators {
    pub credentials: Arc<dyn CredentialsService>,
    pub organizations: Arc<dyn OrganizationService>,
    pub signal: Arc<dyn SignalConnector>,
    pub transport: Arc<dyn TransportFactory>,
    pub devices: Arc<dyn MediaDevices>,
}

impl Collaborators {
    /// Resolve credentials and organizations over HTTP against `config.api_base_url`.
    pub fn with_api(
        config: &SessionConfig,
        signal: Arc<dyn SignalConnector>,
        transport: Arc<dyn TransportFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let api = Arc::new(ApiClient::new(&config.api_base_url));
        Self {
            credentials: api.clone(),
            organizations: api,
            signal,
            transport,
            devices,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub room_url: String,
    pub display_name: String,
    pub room_key: Option<String>,
    pub external_id: Option<String>,
    /// `None` acquires camera and microphone.
    pub local_media: Option<LocalMediaMode>,
}

struct SessionInner {
    config: SessionConfig,
    collaborators: Collaborators,
    store: SessionStore,
    reactors: ReactorEngine,
    emitter: EventEmitter,
    dispatcher: Mutex<Option<(u64, Arc<dyn TransportDispatcher>)>>,
    dispatcher_generation: AtomicU64,
}

/// A join session. Cheap to clone; every clone drives the same state.
///
/// Must be created inside a tokio runtime: effects run as spawned tasks.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning reference held by background tasks.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let mut reactors = ReactorEngine::new(config.reactor_loop_threshold);
        for effect in Effect::ALL {
            reactors.register(effect);
        }
        let device_changes = collaborators.devices.device_changes();
        let debounce = config.device_change_debounce();

        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                collaborators,
                store: SessionStore::new(SessionState::default()),
                reactors,
                emitter: EventEmitter::new(),
                dispatcher: Mutex::new(None),
                dispatcher_generation: AtomicU64::new(0),
            }),
        };

        if let Some(changes) = device_changes {
            tokio::spawn(media::watch_device_changes(session.downgrade(), changes, debounce));
        }
        session
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn collaborators(&self) -> &Collaborators {
        &self.inner.collaborators
    }

    pub fn snapshot(&self) -> Arc<SessionState> {
        self.inner.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionState>> {
        self.inner.store.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionEventListener>) {
        self.inner.emitter.add_listener(listener);
    }

    pub fn room_view(&self) -> RoomView {
        views::room_view(&self.snapshot())
    }

    pub fn loop_defects(&self) -> Vec<LoopDefect> {
        self.inner.reactors.defects()
    }

    pub(crate) fn dispatch(&self, transition: Transition) {
        self.commit(transition, |_| true);
    }

    /// Dispatch only if `guard` holds on the state the transition applies to.
    pub(crate) fn dispatch_if(
        &self,
        guard: impl FnOnce(&SessionState) -> bool,
        transition: Transition,
    ) -> bool {
        self.commit(transition, guard)
    }

    fn commit(&self, transition: Transition, guard: impl FnOnce(&SessionState) -> bool) -> bool {
        let name = transition.name();
        let source = reactor::running_effect();
        let inner = &self.inner;
        let Some(commit) = inner.store.apply_if(&transition, guard, |old, new| {
            (
                inner.reactors.triggered(name, source, old, new),
                events::notifications(&transition, old, new),
            )
        }) else {
            return false;
        };
        tracing::debug!(transition = name, "dispatched");

        let (effects, notifications) = commit.observed;
        for event in notifications {
            inner.emitter.emit(event);
        }
        for (effect, projection) in effects {
            tracing::debug!(?effect, "reactor fired");
            reactor::spawn(effect, projection, self.clone());
        }
        true
    }

    /// Declare the intent to join a room. Everything else follows from the
    /// reactors.
    pub fn join(&self, options: JoinOptions) -> Result<(), SessionError> {
        let location = resolvers::parse_room_url(&options.room_url)?;
        let intent = AppIntent {
            wants_to_join: true,
            room_url: options.room_url,
            room_name: location.room_name,
            room_key: options.room_key,
            display_name: options.display_name,
            external_id: options.external_id,
            local_media: options.local_media.unwrap_or_else(|| {
                LocalMediaMode::Options(MediaOptions {
                    audio: true,
                    video: true,
                    ..Default::default()
                })
            }),
        };
        tracing::info!(room = %intent.room_name, "join requested");
        if !self.dispatch_if(|s| !s.app.wants_to_join, Transition::AppStarted(intent)) {
            return Err(SessionError::Room("already joining".into()));
        }
        Ok(())
    }

    /// Withdraw the join intent; the session winds down to empty states.
    pub fn leave(&self) {
        if self.dispatch_if(|s| s.app.wants_to_join, Transition::AppStopped) {
            tracing::info!("leave requested");
        }
    }

    pub fn knock(&self) -> Result<(), SessionError> {
        room::knock(self)
    }

    pub fn accept_waiting_participant(&self, client_id: &str) -> Result<(), SessionError> {
        room::handle_knock(self, client_id, KnockAction::Accept)
    }

    pub fn reject_waiting_participant(&self, client_id: &str) -> Result<(), SessionError> {
        room::handle_knock(self, client_id, KnockAction::Reject)
    }

    pub fn send_chat_message(&self, text: &str) -> Result<(), SessionError> {
        chat::send_message(self, text)
    }

    pub fn start_cloud_recording(&self) -> Result<(), SessionError> {
        room::start_cloud_recording(self)
    }

    pub fn stop_cloud_recording(&self) -> Result<(), SessionError> {
        room::stop_cloud_recording(self)
    }

    pub async fn start_screenshare(&self) -> Result<(), SessionError> {
        media::start_screenshare(self).await
    }

    pub fn stop_screenshare(&self) -> Result<(), SessionError> {
        media::stop_screenshare(self)
    }

    /// Acquire local media ahead of (or independently of) the join flow.
    pub async fn start_local_media(&self, mode: LocalMediaMode) -> Result<(), SessionError> {
        media::start(self, mode).await
    }

    pub fn stop_local_media(&self) {
        media::stop(self, false);
    }

    /// `None` flips the current state.
    pub async fn toggle_camera(&self, enabled: Option<bool>) -> Result<(), SessionError> {
        media::toggle_camera(self, enabled).await
    }

    /// `None` flips the current state.
    pub fn toggle_microphone(&self, enabled: Option<bool>) {
        media::toggle_microphone(self, enabled);
    }

    pub async fn set_device(&self, kind: TrackKind, device_id: &str) -> Result<(), SessionError> {
        media::set_device(self, kind, device_id).await
    }

    pub async fn switch_stream(
        &self,
        audio_device_id: Option<String>,
        video_device_id: Option<String>,
    ) -> Result<(), SessionError> {
        media::switch_stream(self, audio_device_id, video_device_id).await
    }

    pub async fn update_device_list(&self) -> Result<(), SessionError> {
        media::update_device_list(self).await
    }

    pub fn report_stream_resolution(
        &self,
        client_id: &str,
        stream_id: &str,
        resolution: Resolution,
    ) {
        transport::report_stream_resolution(self, client_id, stream_id, resolution);
    }

    /// Keep the dispatcher created by the transport effect. Returns the
    /// generation its callbacks are tagged with.
    pub(crate) fn install_dispatcher(&self, dispatcher: Arc<dyn TransportDispatcher>) -> u64 {
        let generation = self.inner.dispatcher_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace((generation, dispatcher));
        if let Some((_, stale)) = previous {
            tracing::warn!("replacing a live transport dispatcher");
            stale.stop_manager();
        }
        generation
    }

    pub(crate) fn is_current_dispatcher(&self, generation: u64) -> bool {
        self.inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|(current, _)| *current == generation)
    }

    pub(crate) fn take_dispatcher(&self) -> Option<Arc<dyn TransportDispatcher>> {
        self.inner
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|(_, dispatcher)| dispatcher)
    }
}
