//! Pending server timestamps in the local view.
//!
//! Until the backend assigns the real value, a server timestamp transform is
//! represented by a reserved map holding the local write time and the value
//! the field had before the write.

use std::collections::BTreeMap;

use crate::model::Timestamp;
use crate::value::{FirestoreValue, ValueKind};

const TYPE_KEY: &str = "__type__";
const TYPE_VALUE: &str = "server_timestamp";
const LOCAL_WRITE_TIME_KEY: &str = "__local_write_time__";
const PREVIOUS_VALUE_KEY: &str = "__previous_value__";

pub fn pending_server_timestamp(
    local_write_time: Timestamp,
    previous_value: Option<&FirestoreValue>,
) -> FirestoreValue {
    let mut fields = BTreeMap::new();
    fields.insert(TYPE_KEY.to_string(), FirestoreValue::from_string(TYPE_VALUE));
    fields.insert(
        LOCAL_WRITE_TIME_KEY.to_string(),
        FirestoreValue::from_timestamp(local_write_time),
    );
    // Chained pending timestamps keep the original pre-write value.
    let previous = previous_value.map(|value| {
        if is_server_timestamp(value) {
            previous_server_value(value).cloned()
        } else {
            Some(value.clone())
        }
    });
    if let Some(Some(previous)) = previous {
        fields.insert(PREVIOUS_VALUE_KEY.to_string(), previous);
    }
    FirestoreValue::from_map(fields)
}

pub fn is_server_timestamp(value: &FirestoreValue) -> bool {
    match value.kind() {
        ValueKind::Map(map) => matches!(
            map.fields().get(TYPE_KEY).map(|v| v.kind()),
            Some(ValueKind::String(tag)) if tag == TYPE_VALUE
        ),
        _ => false,
    }
}

pub fn local_write_time(value: &FirestoreValue) -> Option<Timestamp> {
    match value.as_map()?.fields().get(LOCAL_WRITE_TIME_KEY)?.kind() {
        ValueKind::Timestamp(ts) => Some(*ts),
        _ => None,
    }
}

pub fn previous_server_value(value: &FirestoreValue) -> Option<&FirestoreValue> {
    value.as_map()?.fields().get(PREVIOUS_VALUE_KEY)
}
