//! Assembles synthetic heaps, mostly for tests and fixtures.
//!
//! Types are declared on first mention. Setting a field on an object also
//! records the field on the object's type, in the order fields are first set,
//! so declaration order is whatever order the caller writes them in.

use std::collections::{BTreeMap, HashMap};

use crate::memory::{FieldRecord, FieldValue, ObjectRecord, SnapshotDocument, ThreadRecord};
use crate::{
    FieldDescriptor, FieldKind, Frame, MemorySnapshot, MethodDescriptor, TypeDescriptor, TypeId,
};

const FIRST_ADDRESS: u64 = 0x0000_7f00_0000_1000;
const ADDRESS_STRIDE: u64 = 0x40;
const FIRST_TYPE_ID: u64 = 0x0000_7ffa_0000_0100;
const FIRST_CODE_ADDRESS: u64 = 0x0000_7ffb_0000_0000;

#[derive(Debug)]
pub struct SnapshotBuilder {
    types: Vec<TypeDescriptor>,
    type_index: HashMap<String, usize>,
    objects: BTreeMap<u64, ObjectRecord>,
    threads: Vec<ThreadRecord>,
    next_address: u64,
    next_type_id: u64,
    next_code_address: u64,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuilder {
    pub fn new() -> Self {
        Self {
            types: Vec::new(),
            type_index: HashMap::new(),
            objects: BTreeMap::new(),
            threads: Vec::new(),
            next_address: FIRST_ADDRESS,
            next_type_id: FIRST_TYPE_ID,
            next_code_address: FIRST_CODE_ADDRESS,
        }
    }

    fn ensure_type(&mut self, name: &str) -> usize {
        if let Some(idx) = self.type_index.get(name) {
            return *idx;
        }
        let id = TypeId(self.next_type_id);
        self.next_type_id += 0x10;
        self.types.push(TypeDescriptor {
            id,
            name: name.to_string(),
            base_type: None,
            fields: Vec::new(),
            methods: Vec::new(),
        });
        let idx = self.types.len() - 1;
        self.type_index.insert(name.to_string(), idx);
        idx
    }

    /// Declares `name` (if new) and sets its base type.
    pub fn declare_type(&mut self, name: &str, base: Option<&str>) -> TypeId {
        let base_id = base.map(|base| {
            let idx = self.ensure_type(base);
            self.types[idx].id
        });
        let idx = self.ensure_type(name);
        if base_id.is_some() {
            self.types[idx].base_type = base_id;
        }
        self.types[idx].id
    }

    pub fn type_id(&mut self, name: &str) -> TypeId {
        let idx = self.ensure_type(name);
        self.types[idx].id
    }

    /// Appends a field to a type unless it already has one by that name.
    pub fn add_field(&mut self, type_name: &str, field: &str, kind: FieldKind) {
        let idx = self.ensure_type(type_name);
        Self::push_field(&mut self.types[idx], field, kind);
    }

    fn push_field(ty: &mut TypeDescriptor, field: &str, kind: FieldKind) {
        if ty.field(field).is_none() {
            ty.fields.push(FieldDescriptor {
                name: field.to_string(),
                kind,
            });
        }
    }

    /// Adds a method; jitted methods get a fresh code address, which is returned.
    pub fn add_method(&mut self, type_name: &str, method: &str, jitted: bool) -> Option<u64> {
        let idx = self.ensure_type(type_name);
        let native_code = jitted.then(|| {
            let code = self.next_code_address;
            self.next_code_address += 0x100;
            code
        });
        self.types[idx].methods.push(MethodDescriptor {
            name: method.to_string(),
            native_code,
        });
        native_code
    }

    fn allocate(&mut self, type_name: &str, interior: bool) -> u64 {
        let idx = self.ensure_type(type_name);
        let address = self.next_address;
        self.next_address += ADDRESS_STRIDE;
        self.objects.insert(
            address,
            ObjectRecord {
                address,
                type_id: self.types[idx].id,
                interior,
                fields: Vec::new(),
                elements: None,
            },
        );
        address
    }

    /// Allocates a heap object and returns its address.
    pub fn object(&mut self, type_name: &str) -> u64 {
        self.allocate(type_name, false)
    }

    /// Allocates an embedded value-type instance and returns its address.
    pub fn value(&mut self, type_name: &str) -> u64 {
        self.allocate(type_name, true)
    }

    /// Allocates an object array; `0` elements are null slots.
    pub fn array(&mut self, type_name: &str, elements: &[u64]) -> u64 {
        let address = self.allocate(type_name, false);
        if let Some(record) = self.objects.get_mut(&address) {
            record.elements = Some(elements.to_vec());
        }
        address
    }

    fn set_field(&mut self, owner: u64, field: &str, kind: FieldKind, value: FieldValue) {
        let Some(record) = self.objects.get_mut(&owner) else {
            debug_assert!(false, "no object at {owner:#x}");
            return;
        };
        match record.fields.iter_mut().find(|f| f.name == field) {
            Some(existing) => existing.value = value,
            None => record.fields.push(FieldRecord {
                name: field.to_string(),
                value,
            }),
        }
        let type_id = record.type_id;
        if let Some(ty) = self.types.iter_mut().find(|t| t.id == type_id) {
            Self::push_field(ty, field, kind);
        }
    }

    /// Points a reference field at `target`; `0` stores null.
    pub fn set_object(&mut self, owner: u64, field: &str, target: u64) {
        self.set_field(owner, field, FieldKind::Object, FieldValue::Object(target));
    }

    pub fn set_value(&mut self, owner: u64, field: &str, value: u64) {
        self.set_field(owner, field, FieldKind::Value, FieldValue::Value(value));
    }

    pub fn set_bytes(&mut self, owner: u64, field: &str, bytes: &[u8]) {
        self.set_field(
            owner,
            field,
            FieldKind::Primitive,
            FieldValue::Bytes(bytes.to_vec()),
        );
    }

    pub fn set_i32(&mut self, owner: u64, field: &str, value: i32) {
        self.set_bytes(owner, field, &value.to_le_bytes());
    }

    pub fn set_u32(&mut self, owner: u64, field: &str, value: u32) {
        self.set_bytes(owner, field, &value.to_le_bytes());
    }

    pub fn set_u64(&mut self, owner: u64, field: &str, value: u64) {
        self.set_bytes(owner, field, &value.to_le_bytes());
    }

    /// Adds a live thread. `frames` are `(owning type, method)`, innermost first.
    pub fn thread(&mut self, os_thread_id: u32, frames: &[(&str, &str)], roots: &[u64]) {
        let managed_thread_id = self.threads.len() as u32 + 1;
        self.threads.push(ThreadRecord {
            os_thread_id,
            managed_thread_id,
            frames: frames
                .iter()
                .map(|(owner, method)| Frame {
                    method_name: method.to_string(),
                    owning_type_name: owner.to_string(),
                })
                .collect(),
            roots: roots.to_vec(),
        });
    }

    pub fn document(&self) -> SnapshotDocument {
        SnapshotDocument {
            types: self.types.clone(),
            objects: self.objects.values().cloned().collect(),
            threads: self.threads.clone(),
        }
    }

    pub fn build(self) -> MemorySnapshot {
        MemorySnapshot::index(self.document())
    }
}
