//! In-memory heap snapshot, loadable from a JSON document.

use std::collections::{BTreeMap, HashMap};

use facet::Facet;

use crate::{
    Frame, MethodDescriptor, ObjectRef, Place, SnapshotAccessor, SnapshotError, ThreadHandle,
    TypeDescriptor, TypeId, ValueRef, is_or_derives_from,
};

/// Nesting bound when flattening value types into raw bytes.
const MAX_VALUE_NESTING: usize = 8;

// ── Serialized form ─────────────────────────────────────────────

/// The on-disk shape of a captured heap.
#[derive(Facet, Debug, Clone, Default)]
pub struct SnapshotDocument {
    pub types: Vec<TypeDescriptor>,
    pub objects: Vec<ObjectRecord>,
    #[facet(default)]
    pub threads: Vec<ThreadRecord>,
}

/// One heap object or one embedded value-type instance (`interior`).
#[derive(Facet, Debug, Clone)]
pub struct ObjectRecord {
    pub address: u64,
    pub type_id: TypeId,
    #[facet(default)]
    pub interior: bool,
    #[facet(default)]
    pub fields: Vec<FieldRecord>,
    /// Element addresses when the object is an object array; `0` is null.
    #[facet(default)]
    pub elements: Option<Vec<u64>>,
}

#[derive(Facet, Debug, Clone)]
pub struct FieldRecord {
    pub name: String,
    pub value: FieldValue,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum FieldValue {
    /// Address of the referenced object; `0` is null.
    Object(u64),
    /// Address of an interior value record.
    Value(u64),
    Bytes(Vec<u8>),
}

#[derive(Facet, Debug, Clone)]
pub struct ThreadRecord {
    pub os_thread_id: u32,
    pub managed_thread_id: u32,
    #[facet(default)]
    pub frames: Vec<Frame>,
    /// Addresses of objects referenced from the thread's stack.
    #[facet(default)]
    pub roots: Vec<u64>,
}

// ── Indexed snapshot ────────────────────────────────────────────

/// A fully materialized heap with lookup indexes.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    types: BTreeMap<TypeId, TypeDescriptor>,
    type_names: HashMap<String, TypeId>,
    objects: BTreeMap<u64, ObjectRecord>,
    methods: HashMap<u64, (TypeId, usize)>,
    threads: Vec<ThreadRecord>,
}

impl MemorySnapshot {
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        let document: SnapshotDocument =
            facet_json::from_str(json).map_err(|e| SnapshotError::Json(e.to_string()))?;
        Self::from_document(document)
    }

    /// Validates and indexes a document.
    pub fn from_document(document: SnapshotDocument) -> Result<Self, SnapshotError> {
        let mut type_ids = std::collections::HashSet::new();
        for ty in &document.types {
            if !type_ids.insert(ty.id) {
                return Err(SnapshotError::Invalid(format!(
                    "duplicate type id {} ({})",
                    ty.id, ty.name
                )));
            }
        }
        let mut addresses = std::collections::HashSet::new();
        for object in &document.objects {
            if object.address == 0 {
                return Err(SnapshotError::Invalid("object at null address".to_string()));
            }
            if !addresses.insert(object.address) {
                return Err(SnapshotError::Invalid(format!(
                    "duplicate object address {:#x}",
                    object.address
                )));
            }
            if !type_ids.contains(&object.type_id) {
                return Err(SnapshotError::Invalid(format!(
                    "object {:#x} has unknown type {}",
                    object.address, object.type_id
                )));
            }
        }
        Ok(Self::index(document))
    }

    pub(crate) fn index(document: SnapshotDocument) -> Self {
        let mut snapshot = Self::default();
        for ty in document.types {
            for (idx, method) in ty.methods.iter().enumerate() {
                if let Some(code) = method.native_code.filter(|code| *code != 0) {
                    snapshot.methods.insert(code, (ty.id, idx));
                }
            }
            snapshot.type_names.entry(ty.name.clone()).or_insert(ty.id);
            snapshot.types.insert(ty.id, ty);
        }
        for object in document.objects {
            snapshot.objects.insert(object.address, object);
        }
        snapshot.threads = document.threads;
        snapshot
    }

    pub fn to_document(&self) -> SnapshotDocument {
        SnapshotDocument {
            types: self.types.values().cloned().collect(),
            objects: self.objects.values().cloned().collect(),
            threads: self.threads.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        facet_json::to_string(&self.to_document()).map_err(|e| SnapshotError::Json(e.to_string()))
    }

    pub fn type_id_of(&self, name: &str) -> Option<TypeId> {
        self.type_names.get(name).copied()
    }

    /// The heap object at `address`, if there is one.
    pub fn object(&self, address: u64) -> Option<ObjectRef> {
        let record = self.objects.get(&address)?;
        if record.interior {
            return None;
        }
        Some(ObjectRef {
            address,
            type_id: record.type_id,
        })
    }

    pub fn object_count(&self) -> usize {
        self.objects.values().filter(|r| !r.interior).count()
    }

    fn field(&self, place: Place, name: &str) -> Option<&FieldValue> {
        let record = self.objects.get(&place.address())?;
        record
            .fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.value)
    }

    fn thread(&self, thread: ThreadHandle) -> Option<&ThreadRecord> {
        self.threads
            .iter()
            .find(|t| t.os_thread_id == thread.os_thread_id)
    }

    fn field_value_bytes(&self, value: &FieldValue, depth: usize) -> Option<Vec<u8>> {
        match value {
            FieldValue::Bytes(bytes) => Some(bytes.clone()),
            FieldValue::Object(address) => Some(address.to_le_bytes().to_vec()),
            FieldValue::Value(address) => self.value_bytes(*address, depth),
        }
    }

    /// Flattens a value record into the bytes its fields occupy.
    fn value_bytes(&self, address: u64, depth: usize) -> Option<Vec<u8>> {
        if depth == 0 {
            return None;
        }
        let record = self.objects.get(&address)?;
        let mut out = Vec::new();
        for field in &record.fields {
            out.extend(self.field_value_bytes(&field.value, depth - 1)?);
        }
        Some(out)
    }
}

impl SnapshotAccessor for MemorySnapshot {
    fn enumerate_objects_of_type(
        &self,
        type_name: &str,
    ) -> Result<impl Iterator<Item = ObjectRef>, SnapshotError> {
        if self.types.is_empty() {
            return Err(SnapshotError::Enumeration {
                type_name: type_name.to_string(),
                reason: "snapshot carries no type table".to_string(),
            });
        }
        let type_name = type_name.to_string();
        Ok(self
            .objects
            .values()
            .filter(move |r| !r.interior && is_or_derives_from(self, r.type_id, &type_name))
            .map(|r| ObjectRef {
                address: r.address,
                type_id: r.type_id,
            }))
    }

    fn read_object_field(&self, place: impl Into<Place>, field: &str) -> Option<ObjectRef> {
        match self.field(place.into(), field)? {
            FieldValue::Object(address) if *address != 0 => self.object(*address),
            _ => None,
        }
    }

    fn read_value_field(&self, place: impl Into<Place>, field: &str) -> Option<ValueRef> {
        match self.field(place.into(), field)? {
            FieldValue::Value(address) => {
                let record = self.objects.get(address)?;
                record.interior.then_some(ValueRef {
                    address: *address,
                    type_id: record.type_id,
                })
            }
            _ => None,
        }
    }

    fn read_field_bytes(&self, place: impl Into<Place>, field: &str) -> Option<Vec<u8>> {
        let value = self.field(place.into(), field)?;
        self.field_value_bytes(value, MAX_VALUE_NESTING)
    }

    fn read_array_elements(&self, array: ObjectRef) -> Option<Vec<Option<ObjectRef>>> {
        let record = self.objects.get(&array.address)?;
        let elements = record.elements.as_ref()?;
        Some(
            elements
                .iter()
                .map(|address| match *address {
                    0 => None,
                    address => self.object(address),
                })
                .collect(),
        )
    }

    fn type_descriptor(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(&id)
    }

    fn method_at(&self, code_address: u64) -> Option<(&TypeDescriptor, &MethodDescriptor)> {
        let (type_id, idx) = self.methods.get(&code_address)?;
        let ty = self.types.get(type_id)?;
        Some((ty, ty.methods.get(*idx)?))
    }

    fn enumerate_live_threads(&self) -> impl Iterator<Item = ThreadHandle> {
        self.threads.iter().map(|t| ThreadHandle {
            os_thread_id: t.os_thread_id,
            managed_thread_id: t.managed_thread_id,
        })
    }

    fn enumerate_stack_frames(&self, thread: ThreadHandle) -> impl Iterator<Item = Frame> {
        self.thread(thread)
            .into_iter()
            .flat_map(|t| t.frames.iter().cloned())
    }

    fn enumerate_stack_roots(&self, thread: ThreadHandle) -> impl Iterator<Item = ObjectRef> {
        self.thread(thread)
            .into_iter()
            .flat_map(|t| t.roots.iter())
            .filter_map(move |address| self.object(*address))
    }
}
