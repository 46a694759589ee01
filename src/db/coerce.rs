//! Value Coercer.
//!
//! Decoding is driven by the destination type: a record's `Deserialize` impl asks for the
//! kind it wants (`i64`, `String`, `Option<_>`, ...) and [`ValueDeserializer`] converts
//! whatever the driver returned into that kind, or fails with
//! [`StorageError::Conversion`]. Null sources decode to the destination's zero value.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::value::{StrDeserializer, StringDeserializer};
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, MapAccess, SeqAccess, VariantAccess,
    Visitor,
};
use serde::{Deserialize, Deserializer};

use super::error::{StorageError, StorageResult};
use super::mapper::{Record, RecordSchema};
use super::value::{Document, OBJECT_ID_TOKEN, ObjectId, TIMESTAMP_TOKEN, Value, format_time};

impl de::Error for StorageError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        StorageError::Decode {
            field: String::new(),
            message: msg.to_string(),
        }
    }
}

/// Attach a field path to a decode error raised below it, keeping the innermost path.
fn at_field(err: StorageError, path: &str) -> StorageError {
    match err {
        StorageError::Decode { field, message } if field.is_empty() => StorageError::Decode {
            field: path.to_string(),
            message,
        },
        other => other,
    }
}

fn join_path(parent: &str, child: &str) -> String {
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}.{}", parent, child)
    }
}

// =============================================================================
// Time layouts
// =============================================================================

enum TimeLayout {
    Rfc3339,
    DateTime(&'static str),
    Date(&'static str),
    Time(&'static str),
}

/// Layouts tried in order by [`parse_time`]; the first successful parse wins.
const TIME_LAYOUTS: &[TimeLayout] = &[
    TimeLayout::Rfc3339,
    TimeLayout::DateTime("%Y-%m-%d %H:%M:%S%.f"),
    TimeLayout::DateTime("%Y-%m-%dT%H:%M:%S%.f"),
    TimeLayout::Date("%Y-%m-%d"),
    TimeLayout::Time("%H:%M:%S%.f"),
];

/// Parse a textual timestamp: RFC3339, then date+time, then date only, then time only.
///
/// Zone-less layouts are read as UTC; a bare time lands on 0000-01-01.
pub fn parse_time(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    TIME_LAYOUTS.iter().find_map(|layout| match layout {
        TimeLayout::Rfc3339 => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        TimeLayout::DateTime(fmt) => NaiveDateTime::parse_from_str(s, fmt)
            .ok()
            .map(|dt| dt.and_utc()),
        TimeLayout::Date(fmt) => NaiveDate::parse_from_str(s, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc()),
        TimeLayout::Time(fmt) => NaiveTime::parse_from_str(s, fmt).ok().and_then(|t| {
            NaiveDate::from_ymd_opt(0, 1, 1).map(|d| d.and_time(t).and_utc())
        }),
    })
}

/// Boolean spellings accepted from text columns.
fn parse_bool(s: &str) -> Option<bool> {
    match s.trim() {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

// =============================================================================
// Public entry points
// =============================================================================

/// Coerce `raw` into `dest`.
///
/// A null source is a no-op: `dest` keeps whatever it held.
pub fn assign<F: DeserializeOwned>(dest: &mut F, field: &str, raw: Value) -> StorageResult<()> {
    if raw.is_null() {
        return Ok(());
    }
    *dest = coerce(field, raw)?;
    Ok(())
}

/// Coerce `raw` into a fresh `F`; null sources produce `F`'s zero value.
pub fn coerce<F: DeserializeOwned>(field: &str, raw: Value) -> StorageResult<F> {
    F::deserialize(ValueDeserializer::new(raw, field)).map_err(|e| at_field(e, field))
}

/// Rebuild a record from a row or document keyed by backend keys.
///
/// Columns absent from `row` decode as null, so projections leave unselected fields at
/// their zero value.
pub fn decode_record<T: Record>(schema: &RecordSchema, mut row: Document) -> StorageResult<T> {
    let entries = schema
        .fields()
        .iter()
        .map(|field| {
            let value = row
                .remove(&field.key)
                .or_else(|| row.remove(&field.name))
                .unwrap_or_default();
            (field.name.clone(), value)
        })
        .collect::<Vec<_>>();
    T::deserialize(RecordDeserializer { entries })
}

// =============================================================================
// Deserializers
// =============================================================================

struct RecordDeserializer {
    entries: Vec<(String, Value)>,
}

impl<'de> Deserializer<'de> for RecordDeserializer {
    type Error = StorageError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_map(EntryAccess::new(self.entries, String::new()))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

/// Deserializer over one raw value, coercing it into whatever kind the visitor requests.
pub(crate) struct ValueDeserializer {
    value: Value,
    field: String,
}

impl ValueDeserializer {
    pub(crate) fn new(value: Value, field: impl Into<String>) -> Self {
        Self {
            value,
            field: field.into(),
        }
    }

    fn conversion(&self, dest_kind: &str) -> StorageError {
        StorageError::Conversion {
            field: self.field.clone(),
            source_type: self.value.type_name().to_string(),
            dest_kind: dest_kind.to_string(),
        }
    }

    fn to_i64(&self, dest: &str) -> StorageResult<i64> {
        match &self.value {
            Value::Null => Ok(0),
            Value::Int(i) => Ok(*i),
            Value::UInt(u) => i64::try_from(*u).map_err(|_| self.conversion(dest)),
            Value::Float(f) if f.is_finite() && *f >= i64::MIN as f64 && *f < i64::MAX as f64 => {
                Ok(f.trunc() as i64)
            }
            Value::Text(s) => s.trim().parse::<i64>().map_err(|_| self.conversion(dest)),
            _ => Err(self.conversion(dest)),
        }
    }

    fn to_u64(&self, dest: &str) -> StorageResult<u64> {
        match &self.value {
            Value::Null => Ok(0),
            Value::UInt(u) => Ok(*u),
            Value::Int(i) => u64::try_from(*i).map_err(|_| self.conversion(dest)),
            Value::Float(f) if f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64 => {
                Ok(f.trunc() as u64)
            }
            Value::Text(s) => s.trim().parse::<u64>().map_err(|_| self.conversion(dest)),
            _ => Err(self.conversion(dest)),
        }
    }

    fn to_f64(&self, dest: &str) -> StorageResult<f64> {
        match &self.value {
            Value::Null => Ok(0.0),
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            Value::UInt(u) => Ok(*u as f64),
            Value::Text(s) => s.trim().parse::<f64>().map_err(|_| self.conversion(dest)),
            _ => Err(self.conversion(dest)),
        }
    }

    fn to_bool(&self) -> StorageResult<bool> {
        match &self.value {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            Value::UInt(u) => Ok(*u != 0),
            Value::Text(s) => parse_bool(s).ok_or_else(|| self.conversion("bool")),
            _ => Err(self.conversion("bool")),
        }
    }

    /// Default string rendering of any source value.
    fn into_text(self) -> String {
        match self.value {
            Value::Null => String::new(),
            Value::Text(s) => s,
            Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
            other => other.to_string(),
        }
    }

    /// Composite values stored as JSON text are expanded before structural decoding.
    fn expand_json(self, opening: char) -> Self {
        if let Value::Text(s) = &self.value
            && s.trim_start().starts_with(opening)
            && let Ok(json) = serde_json::from_str::<serde_json::Value>(s)
        {
            return Self {
                value: Value::from_json(json),
                field: self.field,
            };
        }
        self
    }

    fn deserialize_time<'de, V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        let instant = match &self.value {
            Value::Null => DateTime::<Utc>::default(),
            Value::Time(t) => *t,
            Value::Text(s) => parse_time(s).ok_or_else(|| self.conversion("time"))?,
            Value::Int(secs) => {
                DateTime::from_timestamp(*secs, 0).ok_or_else(|| self.conversion("time"))?
            }
            _ => return Err(self.conversion("time")),
        };
        visitor.visit_string(format_time(&instant))
    }

    fn deserialize_object_id<'de, V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        let oid = match &self.value {
            Value::ObjectId(oid) => *oid,
            Value::Text(s) => ObjectId::parse_str(s).map_err(|_| self.conversion("object_id"))?,
            Value::Bytes(b) => <[u8; 12]>::try_from(b.as_slice())
                .map(ObjectId::from_bytes)
                .map_err(|_| self.conversion("object_id"))?,
            Value::Null => ObjectId::from_bytes([0; 12]),
            _ => return Err(self.conversion("object_id")),
        };
        visitor.visit_string(oid.to_hex())
    }
}

macro_rules! deserialize_signed {
    ($($method:ident => $ty:ty, $visit:ident;)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
            let wide = self.to_i64(stringify!($ty))?;
            let narrow = <$ty>::try_from(wide).map_err(|_| self.conversion(stringify!($ty)))?;
            visitor.$visit(narrow)
        }
    )*};
}

macro_rules! deserialize_unsigned {
    ($($method:ident => $ty:ty, $visit:ident;)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
            let wide = self.to_u64(stringify!($ty))?;
            let narrow = <$ty>::try_from(wide).map_err(|_| self.conversion(stringify!($ty)))?;
            visitor.$visit(narrow)
        }
    )*};
}

impl<'de> Deserializer<'de> for ValueDeserializer {
    type Error = StorageError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        let field = self.field;
        match self.value {
            Value::Null => visitor.visit_unit(),
            Value::Bool(b) => visitor.visit_bool(b),
            Value::Int(i) => visitor.visit_i64(i),
            Value::UInt(u) => visitor.visit_u64(u),
            Value::Float(f) => visitor.visit_f64(f),
            Value::Text(s) => visitor.visit_string(s),
            Value::Bytes(b) => visitor.visit_byte_buf(b),
            Value::Time(t) => visitor.visit_string(format_time(&t)),
            Value::ObjectId(oid) => visitor.visit_string(oid.to_hex()),
            Value::Array(items) => visitor.visit_seq(ValueSeq::new(items, field)),
            Value::Document(doc) => visitor.visit_map(EntryAccess::new(doc.into_iter().collect(), field)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_bool(self.to_bool()?)
    }

    deserialize_signed! {
        deserialize_i8 => i8, visit_i8;
        deserialize_i16 => i16, visit_i16;
        deserialize_i32 => i32, visit_i32;
        deserialize_i64 => i64, visit_i64;
    }

    deserialize_unsigned! {
        deserialize_u8 => u8, visit_u8;
        deserialize_u16 => u16, visit_u16;
        deserialize_u32 => u32, visit_u32;
        deserialize_u64 => u64, visit_u64;
    }

    fn deserialize_i128<V: Visitor<'de>>(self, _visitor: V) -> StorageResult<V::Value> {
        Err(StorageError::UnsupportedFieldType {
            field: self.field,
            kind: "i128".to_string(),
        })
    }

    fn deserialize_u128<V: Visitor<'de>>(self, _visitor: V) -> StorageResult<V::Value> {
        Err(StorageError::UnsupportedFieldType {
            field: self.field,
            kind: "u128".to_string(),
        })
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_f32(self.to_f64("f32")? as f32)
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_f64(self.to_f64("f64")?)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        if let Value::Text(s) = &self.value {
            let mut chars = s.chars();
            if let (Some(c), None) = (chars.next(), chars.next()) {
                return visitor.visit_char(c);
            }
        }
        Err(self.conversion("char"))
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_string(self.into_text())
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_string(self.into_text())
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        self.deserialize_byte_buf(visitor)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        let bytes = match &self.value {
            Value::Null => Vec::new(),
            Value::Bytes(b) => b.clone(),
            Value::Text(s) => s.clone().into_bytes(),
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::Int(i) => u8::try_from(*i).ok(),
                    Value::UInt(u) => u8::try_from(*u).ok(),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| self.conversion("bytes"))?,
            _ => return Err(self.conversion("bytes")),
        };
        visitor.visit_byte_buf(bytes)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        match self.value {
            Value::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> StorageResult<V::Value> {
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> StorageResult<V::Value> {
        match name {
            TIMESTAMP_TOKEN => self.deserialize_time(visitor),
            OBJECT_ID_TOKEN => self.deserialize_object_id(visitor),
            _ => visitor.visit_newtype_struct(self),
        }
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        let this = self.expand_json('[');
        match this.value {
            Value::Null => visitor.visit_seq(ValueSeq::new(Vec::new(), this.field)),
            Value::Array(items) => visitor.visit_seq(ValueSeq::new(items, this.field)),
            Value::Bytes(bytes) => {
                let items = bytes.into_iter().map(|b| Value::Int(i64::from(b))).collect();
                visitor.visit_seq(ValueSeq::new(items, this.field))
            }
            // Plain text read into a byte sequence yields its UTF-8 bytes.
            Value::Text(s) => {
                let items = s.into_bytes().into_iter().map(|b| Value::Int(i64::from(b))).collect();
                visitor.visit_seq(ValueSeq::new(items, this.field))
            }
            _ => Err(this.conversion("sequence")),
        }
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> StorageResult<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        visitor: V,
    ) -> StorageResult<V::Value> {
        self.deserialize_seq(visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        let this = self.expand_json('{');
        match this.value {
            Value::Null => visitor.visit_map(EntryAccess::new(Vec::new(), this.field)),
            Value::Document(doc) => {
                visitor.visit_map(EntryAccess::new(doc.into_iter().collect(), this.field))
            }
            _ => Err(this.conversion("map")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> StorageResult<V::Value> {
        let this = self.expand_json('{');
        let mut doc = match this.value {
            Value::Null => Document::new(),
            Value::Document(doc) => doc,
            _ => {
                return Err(StorageError::UnsupportedFieldType {
                    field: this.field,
                    kind: format!("struct {} from {}", name, this.value.type_name()),
                });
            }
        };
        let entries = fields
            .iter()
            .map(|f| (f.to_string(), doc.remove(*f).unwrap_or_default()))
            .collect();
        visitor.visit_map(EntryAccess::new(entries, this.field))
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        visitor: V,
    ) -> StorageResult<V::Value> {
        let this = self.expand_json('{');
        match this.value {
            Value::Text(variant) => visitor.visit_enum(StringDeserializer::<StorageError>::new(variant)),
            Value::Document(doc) if doc.len() == 1 => match doc.into_iter().next() {
                Some((variant, value)) => {
                    let field = join_path(&this.field, &variant);
                    visitor.visit_enum(VariantAccessor {
                        variant,
                        value,
                        field,
                    })
                }
                None => Err(de::Error::custom("empty enum document")),
            },
            _ => Err(this.conversion("enum")),
        }
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        self.deserialize_string(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> StorageResult<V::Value> {
        visitor.visit_unit()
    }
}

struct ValueSeq {
    items: std::vec::IntoIter<Value>,
    field: String,
    index: usize,
}

impl ValueSeq {
    fn new(items: Vec<Value>, field: String) -> Self {
        Self {
            items: items.into_iter(),
            field,
            index: 0,
        }
    }
}

impl<'de> SeqAccess<'de> for ValueSeq {
    type Error = StorageError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> StorageResult<Option<T::Value>> {
        let Some(item) = self.items.next() else {
            return Ok(None);
        };
        let path = format!("{}[{}]", self.field, self.index);
        self.index += 1;
        seed.deserialize(ValueDeserializer::new(item, path.clone()))
            .map(Some)
            .map_err(|e| at_field(e, &path))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.items.len())
    }
}

/// Map access over prepared `(name, value)` pairs.
struct EntryAccess {
    entries: std::vec::IntoIter<(String, Value)>,
    pending: Option<(String, Value)>,
    parent: String,
}

impl EntryAccess {
    fn new(entries: Vec<(String, Value)>, parent: String) -> Self {
        Self {
            entries: entries.into_iter(),
            pending: None,
            parent,
        }
    }
}

impl<'de> MapAccess<'de> for EntryAccess {
    type Error = StorageError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> StorageResult<Option<K::Value>> {
        let Some((name, value)) = self.entries.next() else {
            return Ok(None);
        };
        let key = seed.deserialize(StrDeserializer::<StorageError>::new(&name))?;
        self.pending = Some((name, value));
        Ok(Some(key))
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> StorageResult<V::Value> {
        let (name, value) = self.pending.take().ok_or_else(|| StorageError::Decode {
            field: self.parent.clone(),
            message: "value requested before key".to_string(),
        })?;
        let path = join_path(&self.parent, &name);
        seed.deserialize(ValueDeserializer::new(value, path.clone()))
            .map_err(|e| at_field(e, &path))
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.entries.len())
    }
}

struct VariantAccessor {
    variant: String,
    value: Value,
    field: String,
}

impl<'de> EnumAccess<'de> for VariantAccessor {
    type Error = StorageError;
    type Variant = Self;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> StorageResult<(V::Value, Self)> {
        let variant = seed.deserialize(StrDeserializer::<StorageError>::new(&self.variant))?;
        Ok((variant, self))
    }
}

impl<'de> VariantAccess<'de> for VariantAccessor {
    type Error = StorageError;

    fn unit_variant(self) -> StorageResult<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> StorageResult<T::Value> {
        seed.deserialize(ValueDeserializer::new(self.value, self.field))
    }

    fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> StorageResult<V::Value> {
        ValueDeserializer::new(self.value, self.field).deserialize_seq(visitor)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> StorageResult<V::Value> {
        ValueDeserializer::new(self.value, self.field).deserialize_struct("", fields, visitor)
    }
}

/// Lets records carry untyped [`Value`] fields.
impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}
