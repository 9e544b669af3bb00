//! Stream metadata carried by the `streams` entry of `Start` results.

use std::collections::HashMap;

use tracing::debug;
use zbus::zvariant::{OwnedValue, Str, Value};

use crate::error::Result;
use crate::types::{Point, Size, SourceTypes};

/// One PipeWire stream granted to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// PipeWire node ID.
    pub node_id: u32,
    /// Opaque identifier of the stream within the session.
    pub id: Option<String>,
    /// Logical position in compositor space.
    pub position: Option<Point>,
    /// Logical size; absent for some window sources.
    pub size: Option<Size>,
    pub source_type: Option<SourceTypes>,
}

impl StreamDescriptor {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            id: None,
            position: None,
            size: None,
            source_type: None,
        }
    }
}

/// Decodes `a(ua{sv})` into descriptors. Unknown or malformed optional
/// properties are skipped; a value that is not a stream array is an error.
pub fn parse_streams(value: &OwnedValue) -> Result<Vec<StreamDescriptor>> {
    let value: Value<'_> = value.try_clone().map_err(zbus::Error::from)?.into();
    let entries: Vec<(u32, HashMap<String, OwnedValue>)> =
        value.try_into().map_err(zbus::Error::from)?;

    let streams = entries
        .into_iter()
        .map(|(node_id, props)| {
            let descriptor = StreamDescriptor {
                node_id,
                id: string_prop(&props, "id"),
                position: pair_prop(&props, "position").map(|(x, y)| Point::new(x, y)),
                size: pair_prop(&props, "size")
                    .filter(|(w, h)| *w > 0 && *h > 0)
                    .map(|(w, h)| Size::new(w as u32, h as u32)),
                source_type: props
                    .get("source_type")
                    .and_then(|v| u32::try_from(v).ok())
                    .map(SourceTypes::from_bits_truncate),
            };
            debug!(?descriptor, "Parsed portal stream");
            descriptor
        })
        .collect();
    Ok(streams)
}

/// Encodes descriptors the way the portal frontend sends them.
pub fn build_streams_value(descriptors: &[StreamDescriptor]) -> zbus::Result<OwnedValue> {
    let mut entries: Vec<(u32, HashMap<String, OwnedValue>)> =
        Vec::with_capacity(descriptors.len());

    for descriptor in descriptors {
        let mut dict: HashMap<String, OwnedValue> = HashMap::new();
        if let Some(id) = &descriptor.id {
            dict.insert("id".to_string(), OwnedValue::from(Str::from(id.clone())));
        }
        if let Some(source_type) = descriptor.source_type {
            dict.insert(
                "source_type".to_string(),
                OwnedValue::from(source_type.bits()),
            );
        }
        if let Some(position) = descriptor.position {
            let value = OwnedValue::try_from(Value::new((position.x, position.y)))?;
            dict.insert("position".to_string(), value);
        }
        if let Some(size) = descriptor.size {
            let value =
                OwnedValue::try_from(Value::new((size.width as i32, size.height as i32)))?;
            dict.insert("size".to_string(), value);
        }
        entries.push((descriptor.node_id, dict));
    }

    OwnedValue::try_from(Value::new(entries)).map_err(Into::into)
}

fn string_prop(props: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    let value: Value<'_> = props.get(key)?.try_clone().ok()?.into();
    match value {
        Value::Str(s) => Some(s.to_string()),
        _ => None,
    }
}

fn pair_prop(props: &HashMap<String, OwnedValue>, key: &str) -> Option<(i32, i32)> {
    let value: Value<'_> = props.get(key)?.try_clone().ok()?.into();
    value.try_into().ok()
}
