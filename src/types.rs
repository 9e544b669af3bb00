//! Plain value types used across the public surface.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// 2D screen coordinates in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x + (self.width / 2) as i32,
            self.y + (self.height / 2) as i32,
        )
    }

    pub fn top_left(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn bottom_right(&self) -> Point {
        Point::new(self.x + self.width as i32, self.y + self.height as i32)
    }

    /// Edges are inclusive on both sides.
    pub fn contains(&self, point: Point) -> bool {
        let br = self.bottom_right();
        self.x <= point.x && point.x <= br.x && self.y <= point.y && point.y <= br.y
    }
}

bitflags! {
    /// What a session (or a stored consent) is allowed to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u32 {
        const INPUT = 1;
        const CAPTURE = 2;
    }
}

impl Capabilities {
    /// Lowercase names as stored in the consent file.
    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if self.contains(Capabilities::INPUT) {
            names.push("input".to_string());
        }
        if self.contains(Capabilities::CAPTURE) {
            names.push("capture".to_string());
        }
        names
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        names.iter().try_fold(Capabilities::empty(), |acc, name| {
            let flag = match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "input" => Capabilities::INPUT,
                "capture" => Capabilities::CAPTURE,
                other => {
                    return Err(Error::InvalidConsent(format!(
                        "unknown capability '{other}'"
                    )))
                }
            };
            Ok(acc | flag)
        })
    }
}

bitflags! {
    /// `types` bitmask for `RemoteDesktop.SelectDevices`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceTypes: u32 {
        const KEYBOARD = 1;
        const POINTER = 2;
        const TOUCHSCREEN = 4;
    }
}

bitflags! {
    /// `types` bitmask for `ScreenCast.SelectSources`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SourceTypes: u32 {
        const MONITOR = 1;
        const WINDOW = 2;
        const VIRTUAL = 4;
    }
}

/// How long the portal should remember the user's decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum PersistMode {
    /// Ask every time.
    Never,
    /// Remember while the application is running.
    WhileRunning,
    /// Remember until the user revokes the permission.
    #[default]
    UntilRevoked,
}

impl PersistMode {
    pub fn as_u32(self) -> u32 {
        match self {
            PersistMode::Never => 0,
            PersistMode::WhileRunning => 1,
            PersistMode::UntilRevoked => 2,
        }
    }

    pub fn persists(self) -> bool {
        self != PersistMode::Never
    }
}

impl From<PersistMode> for u32 {
    fn from(mode: PersistMode) -> Self {
        mode.as_u32()
    }
}

impl TryFrom<u32> for PersistMode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PersistMode::Never),
            1 => Ok(PersistMode::WhileRunning),
            2 => Ok(PersistMode::UntilRevoked),
            other => Err(format!("Unsupported persist_mode value {other}")),
        }
    }
}

/// Mouse buttons as numbered by X11 and most automation tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Middle,
    Right,
    Back,
    Forward,
}

impl MouseButton {
    pub const LEFT: u32 = 1;
    pub const MIDDLE: u32 = 2;
    pub const RIGHT: u32 = 3;

    pub fn from_number(number: u32) -> Result<Self> {
        match number {
            1 => Ok(MouseButton::Left),
            2 => Ok(MouseButton::Middle),
            3 => Ok(MouseButton::Right),
            8 => Ok(MouseButton::Back),
            9 => Ok(MouseButton::Forward),
            other => Err(Error::UnknownKey(format!("mouse button {other}"))),
        }
    }

    /// Linux evdev code expected by `NotifyPointerButton`.
    pub fn evdev_code(self) -> i32 {
        match self {
            MouseButton::Left => 0x110,
            MouseButton::Right => 0x111,
            MouseButton::Middle => 0x112,
            MouseButton::Back => 0x113,
            MouseButton::Forward => 0x114,
        }
    }
}
