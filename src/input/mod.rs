//! Translation of semantic input actions into ordered portal events.
//!
//! The translator is pure: it turns "press ctrl+c" or "type Hello" into a
//! plan of [`InputStep`]s with the required pacing already inserted. The
//! session executes the plan against the portal's `Notify*` calls.

mod keys;

use std::collections::BTreeMap;
use std::time::Duration;

use xkbcommon::xkb::{self, Keysym};

pub use keys::{char_keysym, keysym_name, normalize_key, resolve_key};

use crate::config::InputConfig;
use crate::error::Result;
use crate::types::{MouseButton, Point};

/// Key and button state as encoded by `NotifyKeyboardKeysym`/`NotifyPointerButton`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Released,
    Pressed,
}

impl KeyState {
    pub fn as_u32(self) -> u32 {
        match self {
            KeyState::Released => 0,
            KeyState::Pressed => 1,
        }
    }
}

/// Axis for `NotifyPointerAxisDiscrete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAxis {
    Vertical,
    Horizontal,
}

impl ScrollAxis {
    pub fn as_u32(self) -> u32 {
        match self {
            ScrollAxis::Vertical => 0,
            ScrollAxis::Horizontal => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputStep {
    Key { keysym: Keysym, state: KeyState },
    Button { code: i32, state: KeyState },
    MoveTo(Point),
    Scroll { axis: ScrollAxis, steps: i32 },
    Pause(Duration),
}

impl InputStep {
    fn press(keysym: Keysym) -> Self {
        InputStep::Key {
            keysym,
            state: KeyState::Pressed,
        }
    }

    fn release(keysym: Keysym) -> Self {
        InputStep::Key {
            keysym,
            state: KeyState::Released,
        }
    }
}

/// Builds event plans; holds only configuration, never session state.
#[derive(Debug, Clone)]
pub struct InputTranslator {
    key_spacing: Duration,
    click_spacing: Duration,
    aliases: BTreeMap<String, String>,
}

impl InputTranslator {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            key_spacing: config.key_spacing(),
            click_spacing: config.click_spacing(),
            aliases: config.key_aliases.clone(),
        }
    }

    pub fn resolve(&self, key: &str) -> Result<Keysym> {
        resolve_key(key, &self.aliases)
    }

    /// Presses every key in order, then releases them in reverse order.
    pub fn key_combo<S: AsRef<str>>(&self, keys: &[S]) -> Result<Vec<InputStep>> {
        let syms = keys
            .iter()
            .map(|key| self.resolve(key.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let events = syms
            .iter()
            .copied()
            .map(InputStep::press)
            .chain(syms.iter().rev().copied().map(InputStep::release));
        Ok(spaced(events, self.key_spacing))
    }

    pub fn press_key(&self, key: &str) -> Result<Vec<InputStep>> {
        self.key_combo(&[key])
    }

    /// Types `text` one character at a time, `interval` apart.
    ///
    /// ASCII uppercase letters are produced as Shift + the lowercase key so
    /// that the result does not depend on the compositor's keymap lookup.
    pub fn type_text(&self, text: &str, interval: Duration) -> Result<Vec<InputStep>> {
        let mut plan = Vec::new();
        for (index, ch) in text.chars().enumerate() {
            if index > 0 {
                push_pause(&mut plan, interval);
            }

            let events = if ch.is_ascii_uppercase() {
                let shift = Keysym::new(xkb::keysyms::KEY_Shift_L);
                let base = char_keysym(ch.to_ascii_lowercase())?;
                vec![
                    InputStep::press(shift),
                    InputStep::press(base),
                    InputStep::release(base),
                    InputStep::release(shift),
                ]
            } else {
                let sym = char_keysym(ch)?;
                vec![InputStep::press(sym), InputStep::release(sym)]
            };
            plan.extend(spaced(events, interval));
        }
        Ok(plan)
    }

    pub fn move_to(&self, point: Point) -> Vec<InputStep> {
        vec![InputStep::MoveTo(point)]
    }

    pub fn click(&self, point: Point, button: u32) -> Result<Vec<InputStep>> {
        let code = MouseButton::from_number(button)?.evdev_code();
        Ok(spaced(
            [
                InputStep::MoveTo(point),
                InputStep::Button {
                    code,
                    state: KeyState::Pressed,
                },
                InputStep::Button {
                    code,
                    state: KeyState::Released,
                },
            ],
            self.click_spacing,
        ))
    }

    pub fn drag(&self, from: Point, to: Point, button: u32) -> Result<Vec<InputStep>> {
        let code = MouseButton::from_number(button)?.evdev_code();
        Ok(spaced(
            [
                InputStep::MoveTo(from),
                InputStep::Button {
                    code,
                    state: KeyState::Pressed,
                },
                InputStep::MoveTo(to),
                InputStep::Button {
                    code,
                    state: KeyState::Released,
                },
            ],
            self.click_spacing,
        ))
    }

    /// Discrete wheel steps; positive `dy` scrolls down, positive `dx` right.
    pub fn scroll(&self, dx: i32, dy: i32) -> Vec<InputStep> {
        let mut events = Vec::new();
        if dy != 0 {
            events.push(InputStep::Scroll {
                axis: ScrollAxis::Vertical,
                steps: dy,
            });
        }
        if dx != 0 {
            events.push(InputStep::Scroll {
                axis: ScrollAxis::Horizontal,
                steps: dx,
            });
        }
        spaced(events, self.click_spacing)
    }
}

fn push_pause(plan: &mut Vec<InputStep>, pause: Duration) {
    if !pause.is_zero() {
        plan.push(InputStep::Pause(pause));
    }
}

/// Interleaves `pause` between consecutive events (not after the last one).
fn spaced(events: impl IntoIterator<Item = InputStep>, pause: Duration) -> Vec<InputStep> {
    let mut plan = Vec::new();
    for (index, event) in events.into_iter().enumerate() {
        if index > 0 {
            push_pause(&mut plan, pause);
        }
        plan.push(event);
    }
    plan
}
