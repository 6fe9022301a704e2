//! Roomkit core session logic.
//!
//! Drives a participant through joining a video room: device credentials,
//! organization lookup, the signal channel, the media transport and local
//! capture. Platform code supplies the collaborators in [`Collaborators`];
//! everything else is pure Rust running on tokio.

pub mod admission;
pub mod chat;
pub mod config;
pub mod devices;
pub mod errors;
pub mod events;
pub mod handle;
pub mod logging;
pub mod media;
pub mod participants;
pub mod reactor;
pub mod resolvers;
pub mod room;
pub mod session;
pub mod signal;
pub mod state;
pub mod store;
pub mod transitions;
pub mod transport;
pub mod views;

#[cfg(test)]
pub(crate) mod test_support;

pub use chat::ChatMessage;
pub use config::SessionConfig;
pub use devices::{
    DeviceInfo, DeviceKind, MediaDevices, MediaOptions, MediaStream, MediaTrack, TrackKind,
};
pub use errors::{DeviceError, SessionError};
pub use events::{SessionEvent, SessionEventListener};
pub use participants::{RemoteParticipant, WaitingParticipant};
pub use reactor::LoopDefect;
pub use resolvers::{ApiClient, CredentialsService, OrganizationService};
pub use session::{Collaborators, JoinOptions, Session};
pub use signal::{SignalChannel, SignalConnector, SignalEvent, SignalRequest};
pub use state::{LocalMediaMode, RoomStatus, SessionState};
pub use transport::{RtcManager, TransportDispatcher, TransportFactory};
pub use views::{LocalParticipantView, RoomView};
