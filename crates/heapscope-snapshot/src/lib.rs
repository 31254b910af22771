//! Read-only access to a captured managed heap.
//!
//! The analysis crates never own heap memory: they hold `ObjectRef` /
//! `ValueRef` handles (address + type) and ask a [`SnapshotAccessor`] to read
//! through them. Every read may fail on a corrupt heap, so reads return
//! `Option` and callers treat `None` as "nothing to see on this path".
//!
//! [`MemorySnapshot`] is a complete in-memory accessor, loadable from a JSON
//! snapshot document, and [`SnapshotBuilder`] assembles synthetic heaps.

use std::fmt;

use facet::Facet;

mod builder;
mod memory;

pub use builder::SnapshotBuilder;
pub use memory::{
    FieldRecord, FieldValue, MemorySnapshot, ObjectRecord, SnapshotDocument, ThreadRecord,
};

/// Longest base-type chain we follow before assuming the type table loops.
const MAX_BASE_HOPS: usize = 64;

// ── Handles ─────────────────────────────────────────────────────

/// Identity of a runtime type (its method table address).
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[facet(transparent)]
pub struct TypeId(pub u64);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A reference to a heap object. Never owned: the snapshot outlives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub address: u64,
    pub type_id: TypeId,
}

/// A reference to a value-type instance embedded in an object or another value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueRef {
    pub address: u64,
    pub type_id: TypeId,
}

/// Anything fields can be read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Place {
    Object(ObjectRef),
    Value(ValueRef),
}

impl Place {
    pub fn address(self) -> u64 {
        match self {
            Self::Object(obj) => obj.address,
            Self::Value(value) => value.address,
        }
    }

    pub fn type_id(self) -> TypeId {
        match self {
            Self::Object(obj) => obj.type_id,
            Self::Value(value) => value.type_id,
        }
    }

    pub fn as_object(self) -> Option<ObjectRef> {
        match self {
            Self::Object(obj) => Some(obj),
            Self::Value(_) => None,
        }
    }
}

impl From<ObjectRef> for Place {
    fn from(value: ObjectRef) -> Self {
        Self::Object(value)
    }
}

impl From<ValueRef> for Place {
    fn from(value: ValueRef) -> Self {
        Self::Value(value)
    }
}

// ── Type metadata ───────────────────────────────────────────────

/// How a field stores its data.
#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
#[facet(rename_all = "snake_case")]
#[repr(u8)]
pub enum FieldKind {
    /// A reference to another heap object.
    Object,
    /// An embedded value-type instance.
    Value,
    /// Raw bytes (integers, booleans, pointers).
    Primitive,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    /// Entry point of the jitted code, if the method was ever compiled.
    pub native_code: Option<u64>,
}

/// Type metadata. `fields` are in declaration order.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub id: TypeId,
    pub name: String,
    pub base_type: Option<TypeId>,
    pub fields: Vec<FieldDescriptor>,
    pub methods: Vec<MethodDescriptor>,
}

impl TypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

// ── Threads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadHandle {
    pub os_thread_id: u32,
    pub managed_thread_id: u32,
}

/// One managed stack frame, innermost first.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub method_name: String,
    pub owning_type_name: String,
}

// ── Errors ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The heap cannot be walked at all.
    Enumeration { type_name: String, reason: String },
    /// A snapshot document could not be parsed.
    Json(String),
    /// A snapshot document parsed but is internally inconsistent.
    Invalid(String),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enumeration { type_name, reason } => {
                write!(f, "cannot enumerate objects of type {type_name}: {reason}")
            }
            Self::Json(err) => write!(f, "invalid snapshot json: {err}"),
            Self::Invalid(err) => write!(f, "invalid snapshot: {err}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

// ── Primitive reads ─────────────────────────────────────────────

/// Fixed-size little-endian values that can be decoded from field bytes.
pub trait Primitive: Sized {
    fn from_le_slice(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                fn from_le_slice(bytes: &[u8]) -> Option<Self> {
                    let raw = bytes.get(..std::mem::size_of::<$ty>())?;
                    Some(<$ty>::from_le_bytes(raw.try_into().ok()?))
                }
            }
        )*
    };
}

impl_primitive!(u8, i8, u16, i16, u32, i32, u64, i64);

impl Primitive for bool {
    fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        bytes.first().map(|b| *b != 0)
    }
}

// ── The accessor contract ───────────────────────────────────────

/// Read-only capability set over a captured heap.
///
/// Implementations must be side-effect free. Any read may come back empty
/// for any object; only [`SnapshotAccessor::enumerate_objects_of_type`] is
/// allowed to fail hard.
pub trait SnapshotAccessor {
    /// Every object whose type is, or derives from, `type_name`, in address order.
    fn enumerate_objects_of_type(
        &self,
        type_name: &str,
    ) -> Result<impl Iterator<Item = ObjectRef>, SnapshotError>;

    /// Follows a reference field. Null references come back as `None`.
    fn read_object_field(&self, place: impl Into<Place>, field: &str) -> Option<ObjectRef>;

    /// Steps into an embedded value-type field.
    fn read_value_field(&self, place: impl Into<Place>, field: &str) -> Option<ValueRef>;

    /// Raw little-endian backing bytes of any field.
    fn read_field_bytes(&self, place: impl Into<Place>, field: &str) -> Option<Vec<u8>>;

    fn read_primitive_field<T: Primitive>(
        &self,
        place: impl Into<Place>,
        field: &str,
    ) -> Option<T> {
        T::from_le_slice(&self.read_field_bytes(place, field)?)
    }

    /// Elements of an object array; `None` entries are null slots.
    fn read_array_elements(&self, array: ObjectRef) -> Option<Vec<Option<ObjectRef>>>;

    fn type_descriptor(&self, id: TypeId) -> Option<&TypeDescriptor>;

    fn type_of(&self, place: impl Into<Place>) -> Option<&TypeDescriptor> {
        self.type_descriptor(place.into().type_id())
    }

    /// The method whose jitted code starts at `code_address`, with its owner.
    fn method_at(&self, code_address: u64) -> Option<(&TypeDescriptor, &MethodDescriptor)>;

    fn enumerate_live_threads(&self) -> impl Iterator<Item = ThreadHandle>;

    fn enumerate_stack_frames(&self, thread: ThreadHandle) -> impl Iterator<Item = Frame>;

    fn enumerate_stack_roots(&self, thread: ThreadHandle) -> impl Iterator<Item = ObjectRef>;
}

/// Whether `type_id` is `base_name` or has it somewhere up its base chain.
pub fn is_or_derives_from<A: SnapshotAccessor>(
    accessor: &A,
    type_id: TypeId,
    base_name: &str,
) -> bool {
    let mut current = Some(type_id);
    for _ in 0..MAX_BASE_HOPS {
        let Some(id) = current else {
            return false;
        };
        let Some(ty) = accessor.type_descriptor(id) else {
            return false;
        };
        if ty.name == base_name {
            return true;
        }
        current = ty.base_type;
    }
    false
}
