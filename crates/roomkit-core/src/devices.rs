//! Capture devices, tracks and streams as seen by the session.
//!
//! The platform side implements [`MediaDevices`]; everything here is plain
//! data plus the device rotation used when a selected device is unplugged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
    AudioOutput,
}

impl DeviceKind {
    pub fn track_kind(self) -> Option<TrackKind> {
        match self {
            DeviceKind::AudioInput => Some(TrackKind::Audio),
            DeviceKind::VideoInput => Some(TrackKind::Video),
            DeviceKind::AudioOutput => None,
        }
    }
}

impl From<TrackKind> for DeviceKind {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => DeviceKind::AudioInput,
            TrackKind::Video => DeviceKind::VideoInput,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    #[serde(default)]
    pub label: String,
}

/// A single audio or video track.
///
/// Enabled/ended flags are interior so the same track can be shared by
/// reference between local media and the transport.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    device_id: Option<String>,
    enabled: AtomicBool,
    ended: AtomicBool,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, device_id: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            device_id,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Device this track captures from, when known.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Release the underlying device. Irreversible.
    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// A set of tracks. Compared by stream id.
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tracks: RwLock::new(tracks),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tracks_of(&self, kind: TrackKind) -> Vec<Arc<MediaTrack>> {
        self.tracks().into_iter().filter(|t| t.kind() == kind).collect()
    }

    pub fn first_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.tracks().into_iter().find(|t| t.kind() == kind)
    }

    pub fn has_track(&self, kind: TrackKind) -> bool {
        self.first_track(kind).is_some()
    }

    pub fn add_track(&self, track: Arc<MediaTrack>) {
        let mut tracks = self.tracks.write().unwrap_or_else(PoisonError::into_inner);
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn remove_track(&self, track_id: &str) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write().unwrap_or_else(PoisonError::into_inner);
        let index = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(index))
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Caller-provided options for acquiring local media.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaOptions {
    #[serde(default)]
    pub audio: bool,
    #[serde(default)]
    pub video: bool,
    #[serde(default)]
    pub audio_device_id: Option<String>,
    #[serde(default)]
    pub video_device_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRequest {
    pub device_id: Option<String>,
}

/// What `get_user_media` should capture. `None` means "not this kind".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<DeviceRequest>,
    pub video: Option<DeviceRequest>,
}

impl MediaConstraints {
    pub fn from_options(options: &MediaOptions) -> Self {
        Self {
            audio: options.audio.then(|| DeviceRequest {
                device_id: options.audio_device_id.clone(),
            }),
            video: options.video.then(|| DeviceRequest {
                device_id: options.video_device_id.clone(),
            }),
        }
    }

    pub fn single(kind: TrackKind, device_id: Option<String>) -> Self {
        let request = Some(DeviceRequest { device_id });
        match kind {
            TrackKind::Audio => Self { audio: request, video: None },
            TrackKind::Video => Self { audio: None, video: request },
        }
    }
}

/// Platform capture API.
pub trait MediaDevices: Send + Sync {
    fn enumerate_devices(&self) -> BoxFuture<'_, Result<Vec<DeviceInfo>, DeviceError>>;

    fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> BoxFuture<'_, Result<Arc<MediaStream>, DeviceError>>;

    fn get_display_media(&self) -> BoxFuture<'_, Result<Arc<MediaStream>, DeviceError>>;

    /// Hot-plug notifications. `None` if the platform cannot report them.
    fn device_changes(&self) -> Option<mpsc::UnboundedReceiver<()>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceChanges {
    pub added: Vec<DeviceInfo>,
    pub removed: Vec<DeviceInfo>,
    /// Same device id, different label or kind.
    pub changed: Vec<DeviceInfo>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

pub fn diff_devices(previous: &[DeviceInfo], current: &[DeviceInfo]) -> DeviceChanges {
    let mut changes = DeviceChanges::default();
    for device in current {
        match previous.iter().find(|d| d.device_id == device.device_id) {
            None => changes.added.push(device.clone()),
            Some(old) if old != device => changes.changed.push(device.clone()),
            Some(_) => {}
        }
    }
    for device in previous {
        if !current.iter().any(|d| d.device_id == device.device_id) {
            changes.removed.push(device.clone());
        }
    }
    changes
}

/// Pick the device to fall back to when `selected` went away.
///
/// Candidates are the devices of `kind` in `current`, ordered by rotating
/// the previous enumeration to start just after `selected`, followed by
/// devices that were not enumerated before. The first candidate not in
/// `busy` wins; if every candidate is busy the head of the rotation is used.
pub fn next_device<'a>(
    previous: &[DeviceInfo],
    current: &'a [DeviceInfo],
    kind: DeviceKind,
    selected: Option<&str>,
    busy: &[String],
) -> Option<&'a DeviceInfo> {
    let available: Vec<&'a DeviceInfo> = current
        .iter()
        .filter(|d| d.kind == kind && Some(d.device_id.as_str()) != selected)
        .collect();
    let before: Vec<&DeviceInfo> = previous.iter().filter(|d| d.kind == kind).collect();

    let start = selected
        .and_then(|id| before.iter().position(|d| d.device_id == id))
        .map_or(0, |i| i + 1);

    let mut rotation: Vec<&'a DeviceInfo> = Vec::with_capacity(available.len());
    for offset in 0..before.len() {
        let candidate = before[(start + offset) % before.len()];
        if let Some(found) = available.iter().find(|d| d.device_id == candidate.device_id) {
            rotation.push(*found);
        }
    }
    for device in &available {
        if !rotation.iter().any(|d| d.device_id == device.device_id) {
            rotation.push(*device);
        }
    }

    rotation
        .iter()
        .find(|d| !busy.contains(&d.device_id))
        .or_else(|| rotation.first())
        .copied()
}
