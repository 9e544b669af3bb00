//! zbus-backed portal transport.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use zbus::message::Type as MessageType;
use zbus::zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, MessageStream};

use super::{
    predicted_request_path, CreateSessionRequest, PendingRequests, PortalTransport, Response,
    SelectDevicesRequest, SelectSourcesRequest, StartRequest, StreamDescriptor,
    PORTAL_BUS_NAME, REQUEST_INTERFACE, REQUEST_PATH_PREFIX, SESSION_INTERFACE,
    SESSION_PATH_PREFIX,
};
use crate::capture::{CaptureHandle, FrameSlot, PipeWireCapture};
use crate::error::{Error, Result};

#[zbus::proxy(
    interface = "org.freedesktop.portal.RemoteDesktop",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait RemoteDesktop {
    async fn create_session(
        &self,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    async fn select_devices(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    async fn start(
        &self,
        session_handle: &ObjectPath<'_>,
        parent_window: &str,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    async fn notify_pointer_motion(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
        dx: f64,
        dy: f64,
    ) -> zbus::Result<()>;

    async fn notify_pointer_motion_absolute(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
        stream: u32,
        x: f64,
        y: f64,
    ) -> zbus::Result<()>;

    async fn notify_pointer_button(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
        button: i32,
        state: u32,
    ) -> zbus::Result<()>;

    async fn notify_pointer_axis_discrete(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
        axis: u32,
        steps: i32,
    ) -> zbus::Result<()>;

    async fn notify_keyboard_keysym(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
        keysym: i32,
        state: u32,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn available_device_types(&self) -> zbus::Result<u32>;
}

#[zbus::proxy(
    interface = "org.freedesktop.portal.ScreenCast",
    default_service = "org.freedesktop.portal.Desktop",
    default_path = "/org/freedesktop/portal/desktop"
)]
trait ScreenCast {
    async fn select_sources(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<OwnedObjectPath>;

    async fn open_pipe_wire_remote(
        &self,
        session_handle: &ObjectPath<'_>,
        options: HashMap<&str, Value<'_>>,
    ) -> zbus::Result<zbus::zvariant::OwnedFd>;

    #[zbus(property)]
    fn available_source_types(&self) -> zbus::Result<u32>;
}

#[zbus::proxy(
    interface = "org.freedesktop.portal.Request",
    default_service = "org.freedesktop.portal.Desktop"
)]
trait Request {
    async fn close(&self) -> zbus::Result<()>;
}

#[zbus::proxy(
    interface = "org.freedesktop.portal.Session",
    default_service = "org.freedesktop.portal.Desktop"
)]
trait Session {
    async fn close(&self) -> zbus::Result<()>;
}

/// Portal transport over the session bus.
///
/// Owns the signal listeners that feed [`PendingRequests`]; they are
/// subscribed before the first request can be issued and aborted on drop.
pub struct DbusPortal {
    connection: Connection,
    remote_desktop: RemoteDesktopProxy<'static>,
    screen_cast: ScreenCastProxy<'static>,
    requests: Arc<PendingRequests>,
    listeners: Vec<JoinHandle<()>>,
}

impl DbusPortal {
    /// Connects to the session bus. Must be called from within a tokio runtime.
    pub async fn connect() -> Result<Self> {
        let connection = Connection::session().await?;
        Self::with_connection(connection).await
    }

    pub async fn with_connection(connection: Connection) -> Result<Self> {
        let requests = Arc::new(PendingRequests::new());

        let responses = signal_stream(
            &connection,
            portal_signal_rule(REQUEST_INTERFACE, "Response", REQUEST_PATH_PREFIX)?,
        )
        .await?;
        let closed = signal_stream(
            &connection,
            portal_signal_rule(SESSION_INTERFACE, "Closed", SESSION_PATH_PREFIX)?,
        )
        .await?;
        let listeners = vec![
            tokio::spawn(listen_for_responses(responses, requests.clone())),
            tokio::spawn(listen_for_session_closed(closed)),
        ];

        let remote_desktop = RemoteDesktopProxy::new(&connection).await?;
        let screen_cast = ScreenCastProxy::new(&connection).await?;

        debug!(
            unique_name = ?connection.unique_name().map(|name| name.to_string()),
            "Connected to portal"
        );
        Ok(Self {
            connection,
            remote_desktop,
            screen_cast,
            requests,
            listeners,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Device and source types the portal backend offers.
    pub async fn available_types(&self) -> Result<(u32, u32)> {
        let devices = self.remote_desktop.available_device_types().await?;
        let sources = self.screen_cast.available_source_types().await?;
        Ok((devices, sources))
    }

    async fn open_pipewire_remote(&self, session: &OwnedObjectPath) -> Result<OwnedFd> {
        let fd = self
            .screen_cast
            .open_pipe_wire_remote(session, HashMap::new())
            .await?;
        debug!(session = %session, "Received PipeWire FD from portal");
        Ok(fd.into())
    }
}

impl Drop for DbusPortal {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

/// Matches `interface.member` signals from the portal frontend only, on
/// object paths under `path_namespace`. The bus resolves the well-known
/// sender name, so broadcasts from other peers never reach the stream.
fn portal_signal_rule(
    interface: &'static str,
    member: &'static str,
    path_namespace: &'static str,
) -> zbus::Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(PORTAL_BUS_NAME)?
        .interface(interface)?
        .member(member)?
        .path_namespace(path_namespace)?
        .build())
}

async fn signal_stream(connection: &Connection, rule: MatchRule<'static>) -> Result<MessageStream> {
    Ok(MessageStream::for_match_rule(rule, connection, None).await?)
}

async fn listen_for_responses(mut stream: MessageStream, requests: Arc<PendingRequests>) {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "Error on portal response stream");
                continue;
            }
        };

        let header = message.header();
        let Some(path) = header.path() else {
            continue;
        };
        let path = OwnedObjectPath::from(path.clone());

        match message
            .body()
            .deserialize::<(u32, HashMap<String, OwnedValue>)>()
        {
            Ok((status, results)) => {
                trace!(request = %path, status, "Portal response");
                requests.complete(&path, Response { status, results });
            }
            Err(err) => warn!(request = %path, %err, "Malformed Request::Response signal"),
        }
    }
    debug!("Portal response listener stopped");
}

async fn listen_for_session_closed(mut stream: MessageStream) {
    while let Some(message) = stream.next().await {
        let Ok(message) = message else { continue };
        if let Some(path) = message.header().path() {
            info!(session = %path, "Portal closed the session");
        }
    }
}

fn vardict<'a>(
    entries: impl IntoIterator<Item = (&'a str, Value<'a>)>,
) -> HashMap<&'a str, Value<'a>> {
    entries.into_iter().collect()
}

impl PortalTransport for DbusPortal {
    fn requests(&self) -> Arc<PendingRequests> {
        self.requests.clone()
    }

    fn request_path(&self, handle_token: &str) -> Result<OwnedObjectPath> {
        let unique_name = self
            .connection
            .unique_name()
            .ok_or_else(|| Error::InvalidState("bus connection has no unique name".into()))?;
        predicted_request_path(unique_name.as_str(), handle_token)
    }

    async fn create_session(&self, request: &CreateSessionRequest) -> Result<OwnedObjectPath> {
        let options = vardict([
            ("handle_token", Value::from(request.handle_token.as_str())),
            (
                "session_handle_token",
                Value::from(request.session_handle_token.as_str()),
            ),
        ]);
        Ok(self.remote_desktop.create_session(options).await?)
    }

    async fn select_devices(
        &self,
        session: &OwnedObjectPath,
        request: &SelectDevicesRequest,
    ) -> Result<OwnedObjectPath> {
        let mut options = vardict([
            ("handle_token", Value::from(request.handle_token.as_str())),
            ("types", Value::U32(request.types.bits())),
            ("persist_mode", Value::U32(request.persist_mode.as_u32())),
        ]);
        if let Some(token) = &request.restore_token {
            options.insert("restore_token", Value::from(token.as_str()));
        }
        Ok(self.remote_desktop.select_devices(session, options).await?)
    }

    async fn select_sources(
        &self,
        session: &OwnedObjectPath,
        request: &SelectSourcesRequest,
    ) -> Result<OwnedObjectPath> {
        let options = vardict([
            ("handle_token", Value::from(request.handle_token.as_str())),
            ("types", Value::U32(request.types.bits())),
            ("multiple", Value::Bool(request.multiple)),
            ("cursor_mode", Value::U32(request.cursor_mode)),
        ]);
        Ok(self.screen_cast.select_sources(session, options).await?)
    }

    async fn start(
        &self,
        session: &OwnedObjectPath,
        request: &StartRequest,
    ) -> Result<OwnedObjectPath> {
        let options = vardict([("handle_token", Value::from(request.handle_token.as_str()))]);
        Ok(self
            .remote_desktop
            .start(session, &request.parent_window, options)
            .await?)
    }

    async fn close_request(&self, request: &OwnedObjectPath) -> Result<()> {
        let proxy = RequestProxy::builder(&self.connection)
            .path(request)?
            .build()
            .await?;
        debug!(request = %request, "Closing portal request");
        Ok(proxy.close().await?)
    }

    async fn close_session(&self, session: &OwnedObjectPath) -> Result<()> {
        let proxy = SessionProxy::builder(&self.connection)
            .path(session)?
            .build()
            .await?;
        debug!(session = %session, "Closing portal session");
        Ok(proxy.close().await?)
    }

    async fn notify_keyboard_keysym(
        &self,
        session: &OwnedObjectPath,
        keysym: i32,
        state: u32,
    ) -> Result<()> {
        Ok(self
            .remote_desktop
            .notify_keyboard_keysym(session, HashMap::new(), keysym, state)
            .await?)
    }

    async fn notify_pointer_button(
        &self,
        session: &OwnedObjectPath,
        button: i32,
        state: u32,
    ) -> Result<()> {
        Ok(self
            .remote_desktop
            .notify_pointer_button(session, HashMap::new(), button, state)
            .await?)
    }

    async fn notify_pointer_motion(
        &self,
        session: &OwnedObjectPath,
        dx: f64,
        dy: f64,
    ) -> Result<()> {
        Ok(self
            .remote_desktop
            .notify_pointer_motion(session, HashMap::new(), dx, dy)
            .await?)
    }

    async fn notify_pointer_motion_absolute(
        &self,
        session: &OwnedObjectPath,
        stream: u32,
        x: f64,
        y: f64,
    ) -> Result<()> {
        Ok(self
            .remote_desktop
            .notify_pointer_motion_absolute(session, HashMap::new(), stream, x, y)
            .await?)
    }

    async fn notify_pointer_axis_discrete(
        &self,
        session: &OwnedObjectPath,
        axis: u32,
        steps: i32,
    ) -> Result<()> {
        Ok(self
            .remote_desktop
            .notify_pointer_axis_discrete(session, HashMap::new(), axis, steps)
            .await?)
    }

    async fn open_capture(
        &self,
        session: &OwnedObjectPath,
        stream: &StreamDescriptor,
        slot: Arc<FrameSlot>,
    ) -> Result<Box<dyn CaptureHandle>> {
        let fd = self.open_pipewire_remote(session).await?;
        let node_id = stream.node_id;
        // PipeWire setup blocks until the stream is connected.
        let capture =
            tokio::task::spawn_blocking(move || PipeWireCapture::start(fd, node_id, slot))
                .await
                .map_err(|err| Error::PipeWire(format!("capture setup task failed: {err}")))??;
        Ok(Box::new(capture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_rule_only_admits_the_portal() {
        let rule = portal_signal_rule(REQUEST_INTERFACE, "Response", REQUEST_PATH_PREFIX).unwrap();
        let rule = rule.to_string();

        assert!(rule.contains("type='signal'"));
        assert!(rule.contains("sender='org.freedesktop.portal.Desktop'"));
        assert!(rule.contains("interface='org.freedesktop.portal.Request'"));
        assert!(rule.contains("member='Response'"));
        assert!(rule.contains("path_namespace='/org/freedesktop/portal/desktop/request'"));
    }

    #[test]
    fn closed_rule_is_scoped_to_portal_sessions() {
        let rule = portal_signal_rule(SESSION_INTERFACE, "Closed", SESSION_PATH_PREFIX).unwrap();

        assert_eq!(
            rule.sender().map(|sender| sender.as_str()),
            Some(PORTAL_BUS_NAME)
        );
        assert!(rule
            .to_string()
            .contains("path_namespace='/org/freedesktop/portal/desktop/session'"));
    }
}
