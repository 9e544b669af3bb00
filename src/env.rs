//! Probes for whether the portal path can work in the current environment.

use std::fmt;
use std::path::PathBuf;

use tracing::debug;
use zbus::Connection;

use crate::portal::{DESKTOP_PATH, PORTAL_BUS_NAME, REMOTE_DESKTOP_INTERFACE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Wayland,
    X11,
    Unknown,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionType::Wayland => "wayland",
            SessionType::X11 => "x11",
            SessionType::Unknown => "unknown",
        })
    }
}

/// Classifies the graphical session from `XDG_SESSION_TYPE`, then
/// `WAYLAND_DISPLAY`/`DISPLAY`.
pub fn detect_session_type() -> SessionType {
    session_type_from(
        std::env::var("XDG_SESSION_TYPE").ok().as_deref(),
        std::env::var_os("WAYLAND_DISPLAY").is_some(),
        std::env::var_os("DISPLAY").is_some(),
    )
}

fn session_type_from(
    xdg_session_type: Option<&str>,
    wayland_display: bool,
    display: bool,
) -> SessionType {
    match xdg_session_type.map(str::to_ascii_lowercase).as_deref() {
        Some("wayland") => return SessionType::Wayland,
        Some("x11") => return SessionType::X11,
        _ => {}
    }
    if wayland_display {
        SessionType::Wayland
    } else if display {
        SessionType::X11
    } else {
        SessionType::Unknown
    }
}

pub fn is_wayland() -> bool {
    detect_session_type() == SessionType::Wayland
}

/// True if the portal frontend answers on the session bus and exposes
/// the RemoteDesktop interface.
pub async fn is_portal_available() -> bool {
    match introspect_portal().await {
        Ok(xml) => xml.contains(REMOTE_DESKTOP_INTERFACE),
        Err(err) => {
            debug!(%err, "Portal introspection failed");
            false
        }
    }
}

async fn introspect_portal() -> zbus::Result<String> {
    let connection = Connection::session().await?;
    let proxy = zbus::fdo::IntrospectableProxy::builder(&connection)
        .destination(PORTAL_BUS_NAME)?
        .path(DESKTOP_PATH)?
        .build()
        .await?;
    Ok(proxy.introspect().await?)
}

/// True if a PipeWire socket exists in the runtime directory.
pub fn is_pipewire_available() -> bool {
    let runtime_dir = std::env::var_os("PIPEWIRE_RUNTIME_DIR")
        .or_else(|| std::env::var_os("XDG_RUNTIME_DIR"))
        .map(PathBuf::from)
        .or_else(dirs::runtime_dir);
    let remote = std::env::var("PIPEWIRE_REMOTE").unwrap_or_else(|_| "pipewire-0".to_string());

    match runtime_dir {
        Some(dir) => dir.join(remote).exists(),
        None => false,
    }
}
