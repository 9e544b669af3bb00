//! Client side of the XDG desktop portal `RemoteDesktop` and `ScreenCast`
//! interfaces.
//!
//! - [`request`] correlates request handles with their `Response` signals.
//! - [`negotiator`] drives the CreateSession/SelectDevices/SelectSources/Start handshake.
//! - [`dbus`] is the zbus-backed [`PortalTransport`].
//! - [`stream`] decodes the `streams` entry of the Start results.

mod dbus;
mod negotiator;
mod request;
mod stream;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use zbus::zvariant::{OwnedObjectPath, OwnedValue};

pub use dbus::DbusPortal;
pub use negotiator::{new_handle_token, NegotiatedSession, NegotiationRequest, Negotiator};
pub use request::PendingRequests;
pub use stream::{build_streams_value, parse_streams, StreamDescriptor};

use crate::capture::{CaptureHandle, FrameSlot};
use crate::error::Result;
use crate::types::{DeviceTypes, PersistMode, SourceTypes};

/// Well-known bus name of the portal frontend.
pub const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Desktop";
/// D-Bus object path for the portal desktop interface.
pub const DESKTOP_PATH: &str = "/org/freedesktop/portal/desktop";
pub const REQUEST_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/request";
pub const SESSION_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/session";

pub const REMOTE_DESKTOP_INTERFACE: &str = "org.freedesktop.portal.RemoteDesktop";
pub const SCREEN_CAST_INTERFACE: &str = "org.freedesktop.portal.ScreenCast";
pub const REQUEST_INTERFACE: &str = "org.freedesktop.portal.Request";
pub const SESSION_INTERFACE: &str = "org.freedesktop.portal.Session";

// ScreenCast source type bitmask.
pub const SOURCE_TYPE_MONITOR: u32 = 1;
pub const SOURCE_TYPE_WINDOW: u32 = 2;
pub const SOURCE_TYPE_VIRTUAL: u32 = 4;

// ScreenCast cursor mode bitmask.
pub const CURSOR_MODE_HIDDEN: u32 = 1;
pub const CURSOR_MODE_EMBEDDED: u32 = 2;
pub const CURSOR_MODE_METADATA: u32 = 4;
pub const SUPPORTED_CURSOR_MODES: u32 =
    CURSOR_MODE_HIDDEN | CURSOR_MODE_EMBEDDED | CURSOR_MODE_METADATA;

/// Request status codes carried by `Request::Response`.
pub const RESPONSE_SUCCESS: u32 = 0;
pub const RESPONSE_CANCELLED: u32 = 1;
pub const RESPONSE_ENDED: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    CreateSession,
    SelectDevices,
    SelectSources,
    Start,
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeStep::CreateSession => "CreateSession",
            HandshakeStep::SelectDevices => "SelectDevices",
            HandshakeStep::SelectSources => "SelectSources",
            HandshakeStep::Start => "Start",
        };
        f.write_str(name)
    }
}

/// Payload of `org.freedesktop.portal.Request::Response`.
#[derive(Debug)]
pub struct Response {
    pub status: u32,
    pub results: HashMap<String, OwnedValue>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == RESPONSE_SUCCESS
    }
}

#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub handle_token: String,
    pub session_handle_token: String,
}

#[derive(Debug, Clone)]
pub struct SelectDevicesRequest {
    pub handle_token: String,
    pub types: DeviceTypes,
    pub persist_mode: PersistMode,
    pub restore_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelectSourcesRequest {
    pub handle_token: String,
    pub types: SourceTypes,
    pub multiple: bool,
    pub cursor_mode: u32,
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub handle_token: String,
    pub parent_window: String,
}

/// The portal operations the session needs.
///
/// Every request-creating method returns the request object path the portal
/// assigned; its outcome is delivered later through [`requests`](Self::requests).
pub trait PortalTransport: Send + Sync + 'static {
    /// Table fed by the transport's `Response` signal listener.
    fn requests(&self) -> Arc<PendingRequests>;

    /// Request path the portal will use for `handle_token`.
    fn request_path(&self, handle_token: &str) -> Result<OwnedObjectPath>;

    fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> impl Future<Output = Result<OwnedObjectPath>> + Send;

    fn select_devices(
        &self,
        session: &OwnedObjectPath,
        request: &SelectDevicesRequest,
    ) -> impl Future<Output = Result<OwnedObjectPath>> + Send;

    fn select_sources(
        &self,
        session: &OwnedObjectPath,
        request: &SelectSourcesRequest,
    ) -> impl Future<Output = Result<OwnedObjectPath>> + Send;

    fn start(
        &self,
        session: &OwnedObjectPath,
        request: &StartRequest,
    ) -> impl Future<Output = Result<OwnedObjectPath>> + Send;

    /// `org.freedesktop.portal.Request.Close`.
    fn close_request(&self, request: &OwnedObjectPath) -> impl Future<Output = Result<()>> + Send;

    /// `org.freedesktop.portal.Session.Close`.
    fn close_session(&self, session: &OwnedObjectPath) -> impl Future<Output = Result<()>> + Send;

    fn notify_keyboard_keysym(
        &self,
        session: &OwnedObjectPath,
        keysym: i32,
        state: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn notify_pointer_button(
        &self,
        session: &OwnedObjectPath,
        button: i32,
        state: u32,
    ) -> impl Future<Output = Result<()>> + Send;

    fn notify_pointer_motion(
        &self,
        session: &OwnedObjectPath,
        dx: f64,
        dy: f64,
    ) -> impl Future<Output = Result<()>> + Send;

    fn notify_pointer_motion_absolute(
        &self,
        session: &OwnedObjectPath,
        stream: u32,
        x: f64,
        y: f64,
    ) -> impl Future<Output = Result<()>> + Send;

    fn notify_pointer_axis_discrete(
        &self,
        session: &OwnedObjectPath,
        axis: u32,
        steps: i32,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Starts a frame consumer for `stream` that publishes into `slot`.
    fn open_capture(
        &self,
        session: &OwnedObjectPath,
        stream: &StreamDescriptor,
        slot: Arc<FrameSlot>,
    ) -> impl Future<Output = Result<Box<dyn CaptureHandle>>> + Send;
}

/// Request path prediction: `<prefix>/<sender>/<token>` where `sender` is
/// the caller's unique bus name without the leading `:` and with `.`
/// replaced by `_`.
pub fn predicted_request_path(unique_name: &str, handle_token: &str) -> Result<OwnedObjectPath> {
    let sender = unique_name.trim_start_matches(':').replace('.', "_");
    let path = format!("{REQUEST_PATH_PREFIX}/{sender}/{handle_token}");
    OwnedObjectPath::try_from(path).map_err(|err| zbus::Error::from(err).into())
}
