//! Minimal reflection-style field dump for verbose frames.

use heapscope_snapshot::{FieldKind, Place, SnapshotAccessor};

use super::pad;
use crate::harvest::type_name;

pub(super) fn field_lines<A: SnapshotAccessor>(
    accessor: &A,
    place: Place,
    indent: usize,
) -> Vec<String> {
    let Some(ty) = accessor.type_of(place) else {
        return Vec::new();
    };
    ty.fields
        .iter()
        .map(|field| {
            let value = match field.kind {
                FieldKind::Object => match accessor.read_object_field(place, &field.name) {
                    Some(obj) => format!("{:#x} ({})", obj.address, type_name(accessor, obj)),
                    None => "null".to_string(),
                },
                FieldKind::Value => match accessor.read_value_field(place, &field.name) {
                    Some(value) => format!("{{{}}}", type_name(accessor, value)),
                    None => "?".to_string(),
                },
                FieldKind::Primitive => accessor
                    .read_field_bytes(place, &field.name)
                    .map_or_else(|| "?".to_string(), |bytes| primitive(&bytes)),
            };
            format!("{}{} = {}", pad(indent), field.name, value)
        })
        .collect()
}

/// Integers up to four bytes print signed, eight-byte values print as hex.
fn primitive(bytes: &[u8]) -> String {
    match *bytes {
        [b] => i8::from_le_bytes([b]).to_string(),
        [a, b] => i16::from_le_bytes([a, b]).to_string(),
        [a, b, c, d] => i32::from_le_bytes([a, b, c, d]).to_string(),
        [a, b, c, d, e, f, g, h] => format!("{:#x}", u64::from_le_bytes([a, b, c, d, e, f, g, h])),
        _ => bytes.iter().map(|b| format!("{b:02x}")).collect(),
    }
}
