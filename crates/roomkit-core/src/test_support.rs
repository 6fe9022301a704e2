//! In-memory collaborators for session tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::devices::{
    DeviceInfo, DeviceKind, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind,
};
use crate::errors::{DeviceError, SessionError};
use crate::events::{SessionEvent, SessionEventListener};
use crate::participants::StreamType;
use crate::resolvers::{Credentials, CredentialsService, Organization, OrganizationService};
use crate::session::{Collaborators, Session};
use crate::signal::{
    SignalChannel, SignalConnector, SignalEvent, SignalLink, SignalRequest, SignalRoom,
    SignalRoomSession,
};
use crate::room::ROOM_LOCKED;
use crate::state::SessionState;
use crate::transport::{
    AcceptStreamRequest, MediaConstraintsProvider, Resolution, RtcManager, TransportDispatcher,
    TransportEvent, TransportFactory,
};

/// Poll the session until `predicate` holds, or panic after two seconds.
pub(crate) async fn wait_for(
    session: &Session,
    predicate: impl Fn(&SessionState) -> bool,
) -> Arc<SessionState> {
    let mut rx = session.subscribe();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = session.snapshot();
        if predicate(state.as_ref()) {
            return state;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached; last state: {state:#?}");
        }
        let _ = tokio::time::timeout(Duration::from_millis(10), rx.changed()).await;
    }
}

/// A channel that accepts everything and answers nothing.
pub(crate) struct NullChannel;

impl SignalChannel for NullChannel {
    fn send(&self, _request: SignalRequest) -> Result<(), SessionError> {
        Ok(())
    }

    fn disconnect(&self) {}
}

#[derive(Default)]
pub(crate) struct FakeCredentials {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeCredentials {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl CredentialsService for FakeCredentials {
    fn fetch_credentials(&self) -> BoxFuture<'_, Result<Credentials, SessionError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::Credentials("HTTP 503".into()));
            }
            Ok(Credentials {
                device_id: "device-1".into(),
                token: "token".into(),
            })
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeOrganizations {
    fail: AtomicBool,
    subdomains: Mutex<Vec<String>>,
}

impl FakeOrganizations {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn subdomains(&self) -> Vec<String> {
        self.subdomains.lock().unwrap().clone()
    }
}

impl OrganizationService for FakeOrganizations {
    fn fetch_organization<'a>(
        &'a self,
        subdomain: &'a str,
    ) -> BoxFuture<'a, Result<Organization, SessionError>> {
        Box::pin(async move {
            self.subdomains.lock().unwrap().push(subdomain.to_string());
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::Organization("HTTP 404".into()));
            }
            Ok(Organization {
                organization_id: "org-1".into(),
                subdomain: subdomain.to_string(),
                organization_name: Some("Acme".into()),
            })
        })
    }
}

/// Server side of one signal connection. Answers `identify_device` and
/// `join_room` the way a signaling server would.
pub(crate) struct FakeChannel {
    events: Mutex<Option<mpsc::UnboundedSender<SignalEvent>>>,
    sent: Mutex<Vec<SignalRequest>>,
    room: Arc<Mutex<SignalRoom>>,
    locked: Arc<AtomicBool>,
}

impl FakeChannel {
    pub fn push(&self, event: SignalEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn sent(&self) -> Vec<SignalRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        self.events.lock().unwrap().is_none()
    }

    /// End the event stream from the server side.
    pub fn close(&self) {
        self.events.lock().unwrap().take();
    }
}

impl SignalChannel for FakeChannel {
    fn send(&self, request: SignalRequest) -> Result<(), SessionError> {
        if self.is_disconnected() {
            return Err(SessionError::Signal("channel closed".into()));
        }
        self.sent.lock().unwrap().push(request.clone());
        match request {
            SignalRequest::IdentifyDevice { .. } => self.push(SignalEvent::DeviceIdentified),
            SignalRequest::JoinRoom(join) => {
                if self.locked.load(Ordering::SeqCst) && join.room_key.is_none() {
                    self.push(SignalEvent::RoomJoined {
                        self_id: Some("me".into()),
                        is_locked: true,
                        room: None,
                        error: Some(ROOM_LOCKED.into()),
                    });
                } else {
                    self.push(SignalEvent::RoomJoined {
                        self_id: Some("me".into()),
                        is_locked: false,
                        room: Some(self.room.lock().unwrap().clone()),
                        error: None,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn disconnect(&self) {
        self.events.lock().unwrap().take();
    }
}

pub(crate) struct FakeSignal {
    refuse: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    room: Arc<Mutex<SignalRoom>>,
    locked: Arc<AtomicBool>,
}

impl Default for FakeSignal {
    fn default() -> Self {
        Self {
            refuse: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
            room: Arc::new(Mutex::new(SignalRoom {
                clients: vec![],
                knockers: vec![],
                session: Some(SignalRoomSession {
                    id: "session-1".into(),
                    created_at: chrono::Utc::now(),
                }),
            })),
            locked: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl FakeSignal {
    pub fn set_room(&self, room: SignalRoom) {
        *self.room.lock().unwrap() = room;
    }

    pub fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn set_locked(&self, locked: bool) {
        self.locked.store(locked, Ordering::SeqCst);
    }

    /// The most recently opened channel.
    pub fn channel(&self) -> Arc<FakeChannel> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no signal channel opened")
    }

    pub fn connects(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}

impl SignalConnector for FakeSignal {
    fn connect(&self) -> BoxFuture<'_, Result<SignalLink, SessionError>> {
        Box::pin(async move {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SessionError::Signal("connection refused".into()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SignalEvent::Connect);
            let channel = Arc::new(FakeChannel {
                events: Mutex::new(Some(tx)),
                sent: Mutex::new(Vec::new()),
                room: self.room.clone(),
                locked: self.locked.clone(),
            });
            self.channels.lock().unwrap().push(channel.clone());
            Ok(SignalLink {
                channel,
                events: rx,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ManagerCall {
    AddNewStream {
        slot_id: String,
        stream_id: String,
        audio_muted: bool,
        video_muted: bool,
    },
    Accept(AcceptStreamRequest),
    Disconnect(String),
    DisconnectAll,
    ReplaceTrack {
        old: Option<String>,
        new: String,
    },
    RemoveStream {
        stream_id: String,
        reason: String,
    },
    UpdateResolution {
        stream_id: String,
        resolution: Resolution,
    },
}

type AcceptHook = Box<dyn Fn(&AcceptStreamRequest) + Send + Sync>;

#[derive(Default)]
pub(crate) struct FakeManager {
    pub both_sides: bool,
    calls: Mutex<Vec<ManagerCall>>,
    on_accept: Mutex<Option<AcceptHook>>,
}

impl FakeManager {
    pub fn calls(&self) -> Vec<ManagerCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Run `hook` inside every `accept_new_stream`, while the batch is open.
    pub fn on_accept(&self, hook: impl Fn(&AcceptStreamRequest) + Send + Sync + 'static) {
        *self.on_accept.lock().unwrap() = Some(Box::new(hook));
    }

    fn record(&self, call: ManagerCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RtcManager for FakeManager {
    fn add_new_stream(
        &self,
        slot_id: &str,
        stream: Arc<MediaStream>,
        audio_muted: bool,
        video_muted: bool,
    ) {
        self.record(ManagerCall::AddNewStream {
            slot_id: slot_id.to_string(),
            stream_id: stream.id().to_string(),
            audio_muted,
            video_muted,
        });
    }

    fn accept_new_stream(&self, request: AcceptStreamRequest) {
        self.record(ManagerCall::Accept(request.clone()));
        if let Some(hook) = self.on_accept.lock().unwrap().as_ref() {
            hook(&request);
        }
    }

    fn disconnect(&self, stream_id: &str, _active_breakout: bool) {
        self.record(ManagerCall::Disconnect(stream_id.to_string()));
    }

    fn disconnect_all(&self) {
        self.record(ManagerCall::DisconnectAll);
    }

    fn replace_track(&self, old_track: Option<Arc<MediaTrack>>, new_track: Arc<MediaTrack>) {
        self.record(ManagerCall::ReplaceTrack {
            old: old_track.map(|t| t.id().to_string()),
            new: new_track.id().to_string(),
        });
    }

    fn remove_stream(&self, stream_id: &str, _stream: Arc<MediaStream>, reason: &str) {
        self.record(ManagerCall::RemoveStream {
            stream_id: stream_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn update_stream_resolution(
        &self,
        stream_id: &str,
        _layer: Option<u8>,
        resolution: Resolution,
    ) {
        self.record(ManagerCall::UpdateResolution {
            stream_id: stream_id.to_string(),
            resolution,
        });
    }

    fn should_accept_streams_from_both_sides(&self) -> bool {
        self.both_sides
    }
}

#[derive(Default)]
struct FakeDispatcher {
    stopped: AtomicBool,
}

impl TransportDispatcher for FakeDispatcher {
    fn stop_manager(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Creates a manager as soon as a dispatcher is requested.
pub(crate) struct FakeTransport {
    pub manager: Arc<FakeManager>,
    fail: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    dispatchers: Mutex<Vec<Arc<FakeDispatcher>>>,
}

impl FakeTransport {
    pub fn new(both_sides: bool) -> Self {
        Self {
            manager: Arc::new(FakeManager {
                both_sides,
                ..FakeManager::default()
            }),
            fail: AtomicBool::new(false),
            events: Mutex::new(None),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    pub fn push_stream(
        &self,
        client_id: &str,
        stream_id: &str,
        stream: Arc<MediaStream>,
        stream_type: Option<StreamType>,
    ) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(TransportEvent::StreamAdded {
                client_id: client_id.to_string(),
                stream_id: stream_id.to_string(),
                stream,
                stream_type,
            });
        }
    }

    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn dispatchers(&self) -> usize {
        self.dispatchers.lock().unwrap().len()
    }

    pub fn dispatcher_stopped(&self) -> bool {
        self.dispatchers
            .lock()
            .unwrap()
            .last()
            .is_some_and(|d| d.stopped.load(Ordering::SeqCst))
    }
}

impl TransportFactory for FakeTransport {
    fn create_dispatcher(
        &self,
        _channel: Arc<dyn SignalChannel>,
        _constraints: Arc<dyn MediaConstraintsProvider>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportDispatcher>, SessionError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SessionError::Transport("no peer connection factory".into()));
        }
        let _ = events.send(TransportEvent::ManagerCreated(self.manager.clone()));
        *self.events.lock().unwrap() = Some(events);
        let dispatcher = Arc::new(FakeDispatcher::default());
        self.dispatchers.lock().unwrap().push(dispatcher.clone());
        Ok(dispatcher)
    }
}

/// Two cameras and two microphones; acquisition picks the requested device
/// or the first of its kind.
pub(crate) struct FakeDevices {
    devices: Mutex<Vec<DeviceInfo>>,
    fail_next: Mutex<Option<DeviceError>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<MediaConstraints>>,
    acquired: Mutex<Vec<Arc<MediaStream>>>,
    changes_tx: mpsc::UnboundedSender<()>,
    changes_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    counter: AtomicUsize,
}

impl Default for FakeDevices {
    fn default() -> Self {
        let device = |id: &str, kind| DeviceInfo {
            device_id: id.to_string(),
            kind,
            label: id.to_uppercase(),
        };
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Self {
            devices: Mutex::new(vec![
                device("cam-1", DeviceKind::VideoInput),
                device("cam-2", DeviceKind::VideoInput),
                device("mic-1", DeviceKind::AudioInput),
                device("mic-2", DeviceKind::AudioInput),
            ]),
            fail_next: Mutex::new(None),
            delay: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
            acquired: Mutex::new(Vec::new()),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
            counter: AtomicUsize::new(0),
        }
    }
}

impl FakeDevices {
    pub fn fail_next(&self, error: DeviceError) {
        *self.fail_next.lock().unwrap() = Some(error);
    }

    /// Hold every `get_user_media` call for `delay` before answering.
    pub fn delay_acquisition(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }

    /// Every stream handed out by `get_user_media`, oldest first.
    pub fn acquired(&self) -> Vec<Arc<MediaStream>> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn unplug(&self, device_id: &str) {
        self.devices.lock().unwrap().retain(|d| d.device_id != device_id);
        let _ = self.changes_tx.send(());
    }

    /// A camera + microphone stream built outside the session.
    pub fn make_stream(&self, id: &str) -> Arc<MediaStream> {
        MediaStream::new(
            id,
            vec![
                MediaTrack::new(format!("{id}-audio"), TrackKind::Audio, Some("mic-1".into())),
                MediaTrack::new(format!("{id}-video"), TrackKind::Video, Some("cam-1".into())),
            ],
        )
    }

    fn pick(&self, kind: DeviceKind, requested: Option<&str>) -> Option<String> {
        let devices = self.devices.lock().unwrap();
        match requested {
            Some(id) => devices
                .iter()
                .find(|d| d.kind == kind && d.device_id == id)
                .map(|d| d.device_id.clone()),
            None => devices
                .iter()
                .find(|d| d.kind == kind)
                .map(|d| d.device_id.clone()),
        }
    }
}

impl MediaDevices for FakeDevices {
    fn enumerate_devices(&self) -> BoxFuture<'_, Result<Vec<DeviceInfo>, DeviceError>> {
        Box::pin(async move { Ok(self.devices.lock().unwrap().clone()) })
    }

    fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'_, Result<Arc<MediaStream>, DeviceError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(constraints.clone());
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.fail_next.lock().unwrap().take() {
                return Err(error);
            }
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let mut tracks = Vec::new();
            for (kind, request) in [
                (TrackKind::Audio, &constraints.audio),
                (TrackKind::Video, &constraints.video),
            ] {
                let Some(request) = request else {
                    continue;
                };
                let device_id = self
                    .pick(DeviceKind::from(kind), request.device_id.as_deref())
                    .ok_or(DeviceError::NotFound)?;
                tracks.push(MediaTrack::new(
                    format!("{kind:?}-{n}").to_lowercase(),
                    kind,
                    Some(device_id),
                ));
            }
            let stream = MediaStream::new(format!("local-{n}"), tracks);
            self.acquired.lock().unwrap().push(stream.clone());
            Ok(stream)
        })
    }

    fn get_display_media(&self) -> BoxFuture<'_, Result<Arc<MediaStream>, DeviceError>> {
        Box::pin(async move {
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(MediaStream::new(
                format!("screen-{n}"),
                vec![MediaTrack::new(format!("screen-video-{n}"), TrackKind::Video, None)],
            ))
        })
    }

    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.changes_rx.lock().unwrap().take()
    }
}

struct EventCapture {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl SessionEventListener for EventCapture {
    fn on_event(&self, event: SessionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A session wired to fresh fakes.
pub(crate) struct Harness {
    pub session: Session,
    pub credentials: Arc<FakeCredentials>,
    pub organizations: Arc<FakeOrganizations>,
    pub signal: Arc<FakeSignal>,
    pub transport: Arc<FakeTransport>,
    pub devices: Arc<FakeDevices>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_both_sides(false)
    }

    pub fn with_both_sides(both_sides: bool) -> Self {
        crate::logging::init_logging();
        let credentials = Arc::new(FakeCredentials::default());
        let organizations = Arc::new(FakeOrganizations::default());
        let signal = Arc::new(FakeSignal::default());
        let transport = Arc::new(FakeTransport::new(both_sides));
        let devices = Arc::new(FakeDevices::default());
        let config = SessionConfig {
            device_change_debounce_ms: 10,
            reactor_loop_threshold: Some(100),
            ..SessionConfig::default()
        };
        let session = Session::new(
            config,
            Collaborators {
                credentials: credentials.clone(),
                organizations: organizations.clone(),
                signal: signal.clone(),
                transport: transport.clone(),
                devices: devices.clone(),
            },
        );
        Self {
            session,
            credentials,
            organizations,
            signal,
            transport,
            devices,
        }
    }

    pub fn capture_events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        self.session.add_listener(Arc::new(EventCapture {
            events: events.clone(),
        }));
        events
    }
}
