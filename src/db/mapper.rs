//! Field Mapper.
//!
//! [`describe`] derives a [`RecordSchema`] for a record type without code generation: it
//! runs the type's own `Deserialize` impl against a probing deserializer that notes which
//! kind of value each field asks for. Schemas are computed once per type and shared.

use std::any::{TypeId, type_name};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde::de::{self, DeserializeOwned, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::de::value::StrDeserializer;
use serde::{Deserializer, Serialize};

use super::error::{StorageError, StorageResult};
use super::value::{OBJECT_ID_TOKEN, TIMESTAMP_TOKEN};

/// An application type persisted by a repository.
///
/// The logical field names are the serde field names. `#[serde(skip)]` drops a field from
/// the mapping entirely.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Explicit `(logical name, backend key)` pairs, used verbatim.
    ///
    /// Fields not listed here map to their lower-cased logical name.
    fn key_overrides() -> &'static [(&'static str, &'static str)] {
        &[]
    }
}

/// The shape of value a field declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Int,
    UInt,
    Float,
    Text,
    Bytes,
    Time,
    ObjectId,
    /// Nullable field; the inner kind is what a present value decodes as.
    Optional(Box<FieldKind>),
    Nested,
    Sequence,
    Map,
    Enum,
    /// Self-describing field such as an untyped JSON value.
    Dynamic,
}

impl FieldKind {
    /// Kind of a present value, looking through `Optional`.
    pub fn base(&self) -> &FieldKind {
        match self {
            FieldKind::Optional(inner) => inner.base(),
            other => other,
        }
    }

    /// True for kinds stored as opaque composite values.
    pub fn is_composite(&self) -> bool {
        matches!(
            self.base(),
            FieldKind::Nested | FieldKind::Sequence | FieldKind::Map
        )
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Optional(inner) => write!(f, "optional {}", inner),
            other => write!(f, "{}", format!("{:?}", other).to_lowercase()),
        }
    }
}

/// Mapping between one logical field and its backend representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub key: String,
    pub kind: FieldKind,
}

/// Ordered field descriptors for a record type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    type_name: &'static str,
    fields: Vec<FieldDescriptor>,
}

impl RecordSchema {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Look up a field by logical name or backend key.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| self.fields.iter().find(|f| f.key == name))
    }

    /// Backend key for a caller-supplied field name; unknown names are rejected.
    pub fn key_of(&self, name: &str) -> StorageResult<&str> {
        self.field(name).map(|f| f.key.as_str()).ok_or_else(|| {
            StorageError::invalid_query(format!(
                "unknown field '{}' for {}",
                name, self.type_name
            ))
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.key.as_str())
    }
}

type SchemaCache = DashMap<TypeId, Arc<RecordSchema>>;

fn cache() -> &'static SchemaCache {
    static SCHEMAS: OnceLock<SchemaCache> = OnceLock::new();
    SCHEMAS.get_or_init(DashMap::new)
}

/// Field descriptors for `T`, computed on first use and cached for the process lifetime.
///
/// Concurrent first callers for the same type wait on the cache shard while one of them
/// builds the schema.
pub fn describe<T: Record>() -> StorageResult<Arc<RecordSchema>> {
    let id = TypeId::of::<T>();
    if let Some(schema) = cache().get(&id) {
        return Ok(Arc::clone(schema.value()));
    }
    let entry = cache()
        .entry(id)
        .or_try_insert_with(|| build_schema::<T>().map(Arc::new))?;
    Ok(Arc::clone(entry.value()))
}

fn build_schema<T: Record>() -> StorageResult<RecordSchema> {
    let type_name = type_name::<T>();
    let state = RefCell::new(ProbeState::default());

    // A field whose visitor rejects the probe's placeholder ends the pass; the next pass
    // leaves it out so the fields after it get probed too.
    loop {
        let skipped_before = state.borrow().skip.len();
        match T::deserialize(RootProbe { state: &state }) {
            Ok(_) => break,
            Err(ProbeError::NotStruct) => {
                return Err(StorageError::NotStruct {
                    type_name: type_name.to_string(),
                });
            }
            Err(ProbeError::Unsupported { field, kind }) => {
                return Err(StorageError::UnsupportedFieldType { field, kind });
            }
            Err(ProbeError::Custom(_) | ProbeError::NotByte) => {
                if state.borrow().skip.len() == skipped_before {
                    break;
                }
            }
        }
    }

    let state = state.into_inner();
    let names = state.names.ok_or_else(|| StorageError::NotStruct {
        type_name: type_name.to_string(),
    })?;

    let overrides = T::key_overrides();
    for (name, _) in overrides {
        if !names.contains(name) {
            return Err(StorageError::InvalidMapping {
                type_name: type_name.to_string(),
                message: format!("key override for unknown field '{}'", name),
            });
        }
    }

    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(names.len());
    for name in names {
        let key = overrides
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, key)| key.to_string())
            .unwrap_or_else(|| name.to_lowercase());
        if key.is_empty() || !seen.insert(key.clone()) {
            return Err(StorageError::InvalidMapping {
                type_name: type_name.to_string(),
                message: format!("duplicate or empty backend key '{}'", key),
            });
        }
        fields.push(FieldDescriptor {
            name: name.to_string(),
            key,
            kind: state.kinds.get(name).cloned().unwrap_or(FieldKind::Dynamic),
        });
    }

    Ok(RecordSchema { type_name, fields })
}

// =============================================================================
// Probe
// =============================================================================

#[derive(Debug)]
enum ProbeError {
    NotStruct,
    Unsupported { field: String, kind: String },
    NotByte,
    Custom(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::NotStruct => f.write_str("not a struct"),
            ProbeError::NotByte => f.write_str("not a byte"),
            ProbeError::Unsupported { field, kind } => write!(f, "{} unsupported for {}", kind, field),
            ProbeError::Custom(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ProbeError {}

impl de::Error for ProbeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        ProbeError::Custom(msg.to_string())
    }
}

type ProbeResult<T> = Result<T, ProbeError>;

#[derive(Default)]
struct ProbeState {
    names: Option<&'static [&'static str]>,
    kinds: HashMap<&'static str, FieldKind>,
    skip: HashSet<&'static str>,
}

struct RootProbe<'a> {
    state: &'a RefCell<ProbeState>,
}

impl<'de> Deserializer<'de> for RootProbe<'_> {
    type Error = ProbeError;

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> ProbeResult<V::Value> {
        let pending = {
            let mut state = self.state.borrow_mut();
            state.names = Some(fields);
            fields
                .iter()
                .copied()
                .filter(|f| !state.skip.contains(f))
                .collect::<Vec<_>>()
        };
        visitor.visit_map(ProbeStruct {
            state: self.state,
            pending: pending.into_iter(),
            current: None,
        })
    }

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> ProbeResult<V::Value> {
        Err(ProbeError::NotStruct)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}

struct ProbeStruct<'a> {
    state: &'a RefCell<ProbeState>,
    pending: std::vec::IntoIter<&'static str>,
    current: Option<&'static str>,
}

impl<'de> MapAccess<'de> for ProbeStruct<'_> {
    type Error = ProbeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> ProbeResult<Option<K::Value>> {
        let Some(field) = self.pending.next() else {
            return Ok(None);
        };
        self.current = Some(field);
        seed.deserialize(StrDeserializer::<ProbeError>::new(field))
            .map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> ProbeResult<V::Value> {
        let field = self.current.take().unwrap_or_default();
        let slot = RefCell::new(None);
        let result = seed.deserialize(ProbeValue {
            field,
            slot: &slot,
        });

        let mut state = self.state.borrow_mut();
        if let Some(kind) = slot.into_inner() {
            state.kinds.insert(field, kind);
        }
        if let Err(ProbeError::Custom(_)) = &result {
            state.skip.insert(field);
        }
        result
    }
}

/// Deserializer standing in for one field value; records the requested kind.
struct ProbeValue<'a> {
    field: &'static str,
    slot: &'a RefCell<Option<FieldKind>>,
}

impl ProbeValue<'_> {
    fn record(&self, kind: FieldKind) {
        let mut slot = self.slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(kind);
        }
    }

    fn unsupported(&self, kind: &str) -> ProbeError {
        ProbeError::Unsupported {
            field: self.field.to_string(),
            kind: kind.to_string(),
        }
    }
}

const PLACEHOLDER_TIME: &str = "1970-01-01T00:00:00Z";
const PLACEHOLDER_OBJECT_ID: &str = "000000000000000000000000";

macro_rules! probe_scalar {
    ($($method:ident => $kind:expr, $visit:ident($dummy:expr);)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
            self.record($kind);
            visitor.$visit($dummy)
        }
    )*};
}

impl<'de> Deserializer<'de> for ProbeValue<'_> {
    type Error = ProbeError;

    probe_scalar! {
        deserialize_bool => FieldKind::Bool, visit_bool(false);
        deserialize_i8 => FieldKind::Int, visit_i8(0);
        deserialize_i16 => FieldKind::Int, visit_i16(0);
        deserialize_i32 => FieldKind::Int, visit_i32(0);
        deserialize_i64 => FieldKind::Int, visit_i64(0);
        deserialize_u8 => FieldKind::UInt, visit_u8(0);
        deserialize_u16 => FieldKind::UInt, visit_u16(0);
        deserialize_u32 => FieldKind::UInt, visit_u32(0);
        deserialize_u64 => FieldKind::UInt, visit_u64(0);
        deserialize_f32 => FieldKind::Float, visit_f32(0.0);
        deserialize_f64 => FieldKind::Float, visit_f64(0.0);
        deserialize_char => FieldKind::Text, visit_char('0');
        deserialize_str => FieldKind::Text, visit_str(PLACEHOLDER_TIME);
        deserialize_string => FieldKind::Text, visit_str(PLACEHOLDER_TIME);
        deserialize_bytes => FieldKind::Bytes, visit_bytes(&[]);
        deserialize_byte_buf => FieldKind::Bytes, visit_bytes(&[]);
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        self.record(FieldKind::Dynamic);
        visitor.visit_unit()
    }

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        self.record(FieldKind::Dynamic);
        visitor.visit_unit()
    }

    fn deserialize_i128<V: Visitor<'de>>(self, _visitor: V) -> ProbeResult<V::Value> {
        Err(self.unsupported("i128"))
    }

    fn deserialize_u128<V: Visitor<'de>>(self, _visitor: V) -> ProbeResult<V::Value> {
        Err(self.unsupported("u128"))
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        let inner = RefCell::new(None);
        let result = visitor.visit_some(ProbeValue {
            field: self.field,
            slot: &inner,
        });
        let kind = inner.into_inner().unwrap_or(FieldKind::Dynamic);
        self.record(FieldKind::Optional(Box::new(kind)));
        result
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> ProbeResult<V::Value> {
        self.record(FieldKind::Dynamic);
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> ProbeResult<V::Value> {
        match name {
            TIMESTAMP_TOKEN => {
                self.record(FieldKind::Time);
                visitor.visit_str(PLACEHOLDER_TIME)
            }
            OBJECT_ID_TOKEN => {
                self.record(FieldKind::ObjectId);
                visitor.visit_str(PLACEHOLDER_OBJECT_ID)
            }
            _ => visitor.visit_newtype_struct(self),
        }
    }

    /// Sequences of `u8` are byte fields; anything else is an opaque sequence.
    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        let bytes = Cell::new(false);
        let result = visitor.visit_seq(ElementSeq {
            bytes: &bytes,
            done: false,
        });
        self.record(if bytes.get() {
            FieldKind::Bytes
        } else {
            FieldKind::Sequence
        });
        result
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> ProbeResult<V::Value> {
        self.record(FieldKind::Sequence);
        visitor.visit_seq(EmptySeq)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> ProbeResult<V::Value> {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        self.record(FieldKind::Map);
        visitor.visit_map(EmptyMap)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> ProbeResult<V::Value> {
        self.record(FieldKind::Nested);
        visitor.visit_map(EmptyMap)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> ProbeResult<V::Value> {
        self.record(FieldKind::Enum);
        Err(de::Error::custom("enum placeholder"))
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        visitor.visit_unit()
    }
}

/// Offers one element to find out whether it is a `u8`; other element types see an empty
/// sequence.
struct ElementSeq<'a> {
    bytes: &'a Cell<bool>,
    done: bool,
}

impl<'de> SeqAccess<'de> for ElementSeq<'_> {
    type Error = ProbeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> ProbeResult<Option<T::Value>> {
        if std::mem::replace(&mut self.done, true) {
            return Ok(None);
        }
        match seed.deserialize(ElementProbe { bytes: self.bytes }) {
            Ok(value) => Ok(Some(value)),
            Err(ProbeError::NotByte) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct ElementProbe<'a> {
    bytes: &'a Cell<bool>,
}

impl<'de> Deserializer<'de> for ElementProbe<'_> {
    type Error = ProbeError;

    fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> ProbeResult<V::Value> {
        self.bytes.set(true);
        visitor.visit_u8(0)
    }

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> ProbeResult<V::Value> {
        Err(ProbeError::NotByte)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

struct EmptySeq;

impl<'de> SeqAccess<'de> for EmptySeq {
    type Error = ProbeError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, _seed: T) -> ProbeResult<Option<T::Value>> {
        Ok(None)
    }
}

struct EmptyMap;

impl<'de> MapAccess<'de> for EmptyMap {
    type Error = ProbeError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, _seed: K) -> ProbeResult<Option<K::Value>> {
        Ok(None)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, _seed: V) -> ProbeResult<V::Value> {
        Err(de::Error::custom("value without key"))
    }
}
