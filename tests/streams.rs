use std::collections::HashMap;
use std::convert::TryInto;

use remote_desktop_portal::portal::{
    build_streams_value, parse_streams, StreamDescriptor, SOURCE_TYPE_MONITOR,
};
use remote_desktop_portal::types::{Point, Size, SourceTypes};
use zbus::zvariant::{OwnedValue, Value};

fn monitor() -> StreamDescriptor {
    StreamDescriptor {
        node_id: 42,
        id: Some("screen-1".to_string()),
        position: Some(Point::new(1920, 0)),
        size: Some(Size::new(2560, 1440)),
        source_type: Some(SourceTypes::MONITOR),
    }
}

#[test]
fn streams_value_encodes_portal_metadata() {
    let descriptor = monitor();
    let owned = build_streams_value(&[descriptor.clone()]).expect("should build streams value");

    let value: Value = owned.into();
    let entries: Vec<(u32, HashMap<String, OwnedValue>)> = value
        .try_into()
        .expect("streams value should decode into tuple array");

    assert_eq!(entries.len(), 1);
    let (node_id, props) = &entries[0];
    assert_eq!(*node_id, 42);

    let source_type =
        u32::try_from(props.get("source_type").unwrap().try_clone().unwrap()).unwrap();
    assert_eq!(source_type, SOURCE_TYPE_MONITOR);

    let id_value: Value = props.get("id").unwrap().try_clone().unwrap().into();
    let id = match id_value {
        Value::Str(s) => s.to_string(),
        other => panic!("unexpected id value: {other:?}"),
    };
    assert_eq!(Some(id), descriptor.id);

    let size_value: Value = props.get("size").unwrap().try_clone().unwrap().into();
    let size: (i32, i32) = size_value.try_into().unwrap();
    assert_eq!(size, (2560, 1440));

    let position_value: Value = props.get("position").unwrap().try_clone().unwrap().into();
    let position: (i32, i32) = position_value.try_into().unwrap();
    assert_eq!(position, (1920, 0));
}

#[test]
fn parsed_streams_keep_order_and_optional_fields() {
    let bare = StreamDescriptor::new(7);
    let owned = build_streams_value(&[monitor(), bare.clone()]).unwrap();

    let streams = parse_streams(&owned).unwrap();

    assert_eq!(streams, vec![monitor(), bare]);
}

#[test]
fn non_stream_value_is_rejected() {
    let owned = OwnedValue::from(5u32);
    assert!(parse_streams(&owned).is_err());
}
