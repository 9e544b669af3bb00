//! Single-consent remote desktop sessions over the XDG desktop portal.
//!
//! One `RemoteDesktop` session asks the user once and then serves both input
//! injection (pointer and keyboard) and screen capture.
//!
//! ```no_run
//! use remote_desktop_portal::{PersistMode, Point, RemoteDesktop};
//!
//! # fn main() -> remote_desktop_portal::Result<()> {
//! let desktop = RemoteDesktop::new()?;
//! desktop.initialize(PersistMode::UntilRevoked, true)?;
//! desktop.click(Point::new(100, 200), 1)?;
//! desktop.key_combo(&["ctrl", "l"])?;
//! let png = desktop.capture_screenshot()?;
//! std::fs::write("screen.png", png)?;
//! desktop.close();
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod consent;
pub mod env;
pub mod error;
pub mod input;
pub mod portal;
pub mod session;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use session::{RemoteDesktop, SessionState};
pub use types::{Capabilities, MouseButton, PersistMode, Point, Rect, Size};
