use std::collections::BTreeMap;

use xkbcommon::xkb::{self, keysyms::KEY_NoSymbol, Keysym};

use crate::error::{Error, Result};

/// Built-in aliases from the names automation scripts tend to use to xkb keysym names.
const KEY_ALIASES: &[(&str, &str)] = &[
    ("return", "Return"),
    ("enter", "Return"),
    ("escape", "Escape"),
    ("esc", "Escape"),
    ("tab", "Tab"),
    ("space", "space"),
    ("backspace", "BackSpace"),
    ("delete", "Delete"),
    ("del", "Delete"),
    ("insert", "Insert"),
    ("home", "Home"),
    ("end", "End"),
    ("pageup", "Page_Up"),
    ("pagedown", "Page_Down"),
    ("left", "Left"),
    ("right", "Right"),
    ("up", "Up"),
    ("down", "Down"),
    ("arrowleft", "Left"),
    ("arrowright", "Right"),
    ("arrowup", "Up"),
    ("arrowdown", "Down"),
    ("ctrl", "Control_L"),
    ("control", "Control_L"),
    ("primary", "Control_L"),
    ("alt", "Alt_L"),
    ("option", "Alt_L"),
    ("altgr", "ISO_Level3_Shift"),
    ("shift", "Shift_L"),
    ("super", "Super_L"),
    ("logo", "Super_L"),
    ("meta", "Super_L"),
    ("win", "Super_L"),
    ("cmd", "Super_L"),
    ("command", "Super_L"),
    ("capslock", "Caps_Lock"),
    ("printscreen", "Print"),
    ("menu", "Menu"),
];

/// Maps common aliases (`enter`, `ctrl`, `win`, ...) to their xkb keysym name.
///
/// Names without an alias are returned unchanged.
pub fn normalize_key(key: &str) -> String {
    let lowered = key.trim().to_ascii_lowercase();
    KEY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| key.trim().to_string())
}

/// Resolves a key name to a keysym, consulting `user_aliases` first.
pub fn resolve_key(key: &str, user_aliases: &BTreeMap<String, String>) -> Result<Keysym> {
    let trimmed = key.trim();
    if trimmed.is_empty() {
        return Err(Error::UnknownKey(key.to_string()));
    }

    let aliased = user_aliases
        .get(trimmed)
        .or_else(|| user_aliases.get(&trimmed.to_ascii_lowercase()))
        .cloned()
        .unwrap_or_else(|| normalize_key(trimmed));

    let mut attempts: Vec<String> = Vec::new();
    let mut add_attempt = |value: String| {
        if !attempts.contains(&value) {
            attempts.push(value);
        }
    };

    add_attempt(aliased.clone());
    if aliased.chars().count() == 1 {
        add_attempt(aliased.to_lowercase());
    } else {
        add_attempt(aliased.to_ascii_lowercase());
        add_attempt(capitalize(&aliased));
    }

    for attempt in attempts {
        let sym = xkb::keysym_from_name(&attempt, xkb::KEYSYM_NO_FLAGS);
        if sym.raw() != KEY_NoSymbol {
            return Ok(sym);
        }
    }

    let mut chars = trimmed.chars();
    if let (Some(ch), None) = (chars.next(), chars.next()) {
        return char_keysym(ch);
    }

    Err(Error::UnknownKey(key.to_string()))
}

/// Keysym that produces `ch` when typed.
pub fn char_keysym(ch: char) -> Result<Keysym> {
    let sym = match ch {
        '\n' | '\r' => Keysym::new(xkb::keysyms::KEY_Return),
        '\t' => Keysym::new(xkb::keysyms::KEY_Tab),
        '\u{8}' => Keysym::new(xkb::keysyms::KEY_BackSpace),
        _ => xkb::utf32_to_keysym(ch as u32),
    };
    if sym.raw() == KEY_NoSymbol {
        Err(Error::UnknownKey(ch.escape_default().to_string()))
    } else {
        Ok(sym)
    }
}

pub fn keysym_name(sym: Keysym) -> String {
    let name = xkb::keysym_get_name(sym);
    if name.is_empty() {
        format!("0x{:x}", sym.raw())
    } else {
        name
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
