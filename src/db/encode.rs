//! Record encoding for write paths.
//!
//! [`ValueSerializer`] lowers any `Serialize` value to a [`Value`] tree. Time and object id
//! newtypes are recognized by their marker names and kept native; everything else maps
//! onto the closest [`Value`] variant.

use std::fmt;

use serde::Serialize;
use serde::ser::{self, Impossible};

use super::error::{StorageError, StorageResult};
use super::mapper::{FieldKind, Record, RecordSchema};
use super::value::{Document, OBJECT_ID_TOKEN, ObjectId, TIMESTAMP_TOKEN, Value};
use super::coerce::parse_time;

impl ser::Error for StorageError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        StorageError::Encode {
            message: msg.to_string(),
        }
    }
}

/// Encode a single value, e.g. a filter operand or identifier.
pub fn to_value<V: Serialize + ?Sized>(value: &V) -> StorageResult<Value> {
    value.serialize(ValueSerializer)
}

/// Encode a record into `(backend key, value)` pairs in declaration order.
pub fn encode_record<T: Record>(schema: &RecordSchema, record: &T) -> StorageResult<Vec<(String, Value)>> {
    let mut doc = match to_value(record)? {
        Value::Document(doc) => doc,
        other => {
            return Err(StorageError::Encode {
                message: format!(
                    "{} encoded as {}, expected a document",
                    schema.type_name(),
                    other.type_name()
                ),
            });
        }
    };
    Ok(schema
        .fields()
        .iter()
        .map(|field| {
            let value = doc.remove(&field.name).unwrap_or_default();
            let value = match field.kind.base() {
                FieldKind::Bytes => into_bytes(value),
                _ => value,
            };
            (field.key.clone(), value)
        })
        .collect())
}

/// Byte fields serialized as `u8` sequences are stored natively.
fn into_bytes(value: Value) -> Value {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Int(i) => u8::try_from(*i).ok(),
                Value::UInt(u) => u8::try_from(*u).ok(),
                _ => None,
            })
            .collect::<Option<Vec<u8>>>()
            .map(Value::Bytes)
            .unwrap_or(Value::Array(items)),
        other => other,
    }
}

/// Encode a record into a document keyed by backend keys.
pub fn encode_document<T: Record>(schema: &RecordSchema, record: &T) -> StorageResult<Document> {
    Ok(encode_record(schema, record)?.into_iter().collect())
}

pub(crate) struct ValueSerializer;

impl ser::Serializer for ValueSerializer {
    type Ok = Value;
    type Error = StorageError;

    type SerializeSeq = SerializeVec;
    type SerializeTuple = SerializeVec;
    type SerializeTupleStruct = SerializeVec;
    type SerializeTupleVariant = SerializeTupleVariant;
    type SerializeMap = SerializeMap;
    type SerializeStruct = SerializeMap;
    type SerializeStructVariant = SerializeStructVariant;

    fn serialize_bool(self, v: bool) -> StorageResult<Value> {
        Ok(Value::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> StorageResult<Value> {
        Ok(Value::Int(i64::from(v)))
    }

    fn serialize_i16(self, v: i16) -> StorageResult<Value> {
        Ok(Value::Int(i64::from(v)))
    }

    fn serialize_i32(self, v: i32) -> StorageResult<Value> {
        Ok(Value::Int(i64::from(v)))
    }

    fn serialize_i64(self, v: i64) -> StorageResult<Value> {
        Ok(Value::Int(v))
    }

    fn serialize_u8(self, v: u8) -> StorageResult<Value> {
        Ok(Value::Int(i64::from(v)))
    }

    fn serialize_u16(self, v: u16) -> StorageResult<Value> {
        Ok(Value::Int(i64::from(v)))
    }

    fn serialize_u32(self, v: u32) -> StorageResult<Value> {
        Ok(Value::Int(i64::from(v)))
    }

    fn serialize_u64(self, v: u64) -> StorageResult<Value> {
        Ok(i64::try_from(v).map(Value::Int).unwrap_or(Value::UInt(v)))
    }

    fn serialize_f32(self, v: f32) -> StorageResult<Value> {
        Ok(Value::Float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> StorageResult<Value> {
        Ok(Value::Float(v))
    }

    fn serialize_char(self, v: char) -> StorageResult<Value> {
        Ok(Value::Text(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> StorageResult<Value> {
        Ok(Value::Text(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> StorageResult<Value> {
        Ok(Value::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> StorageResult<Value> {
        Ok(Value::Null)
    }

    fn serialize_some<V: Serialize + ?Sized>(self, value: &V) -> StorageResult<Value> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> StorageResult<Value> {
        Ok(Value::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> StorageResult<Value> {
        Ok(Value::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> StorageResult<Value> {
        Ok(Value::Text(variant.to_string()))
    }

    fn serialize_newtype_struct<V: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &V,
    ) -> StorageResult<Value> {
        let inner = value.serialize(ValueSerializer)?;
        match (name, inner) {
            (TIMESTAMP_TOKEN, Value::Text(s)) => parse_time(&s).map(Value::Time).ok_or_else(|| {
                StorageError::Encode {
                    message: format!("unrecognized time '{}'", s),
                }
            }),
            (OBJECT_ID_TOKEN, Value::Text(s)) => ObjectId::parse_str(&s)
                .map(Value::ObjectId)
                .map_err(|e| StorageError::Encode {
                    message: e.to_string(),
                }),
            (_, inner) => Ok(inner),
        }
    }

    fn serialize_newtype_variant<V: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        value: &V,
    ) -> StorageResult<Value> {
        let mut doc = Document::new();
        doc.insert(variant.to_string(), value.serialize(ValueSerializer)?);
        Ok(Value::Document(doc))
    }

    fn serialize_seq(self, len: Option<usize>) -> StorageResult<SerializeVec> {
        Ok(SerializeVec {
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> StorageResult<SerializeVec> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> StorageResult<SerializeVec> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        len: usize,
    ) -> StorageResult<SerializeTupleVariant> {
        Ok(SerializeTupleVariant {
            variant,
            items: Vec::with_capacity(len),
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> StorageResult<SerializeMap> {
        Ok(SerializeMap {
            doc: Document::new(),
            next_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> StorageResult<SerializeMap> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
        _len: usize,
    ) -> StorageResult<SerializeStructVariant> {
        Ok(SerializeStructVariant {
            variant,
            doc: Document::new(),
        })
    }
}

pub(crate) struct SerializeVec {
    items: Vec<Value>,
}

impl ser::SerializeSeq for SerializeVec {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_element<V: Serialize + ?Sized>(&mut self, value: &V) -> StorageResult<()> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> StorageResult<Value> {
        Ok(Value::Array(self.items))
    }
}

impl ser::SerializeTuple for SerializeVec {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_element<V: Serialize + ?Sized>(&mut self, value: &V) -> StorageResult<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> StorageResult<Value> {
        ser::SerializeSeq::end(self)
    }
}

impl ser::SerializeTupleStruct for SerializeVec {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_field<V: Serialize + ?Sized>(&mut self, value: &V) -> StorageResult<()> {
        ser::SerializeSeq::serialize_element(self, value)
    }

    fn end(self) -> StorageResult<Value> {
        ser::SerializeSeq::end(self)
    }
}

pub(crate) struct SerializeTupleVariant {
    variant: &'static str,
    items: Vec<Value>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_field<V: Serialize + ?Sized>(&mut self, value: &V) -> StorageResult<()> {
        self.items.push(value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> StorageResult<Value> {
        let mut doc = Document::new();
        doc.insert(self.variant.to_string(), Value::Array(self.items));
        Ok(Value::Document(doc))
    }
}

pub(crate) struct SerializeMap {
    doc: Document,
    next_key: Option<String>,
}

impl ser::SerializeMap for SerializeMap {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_key<K: Serialize + ?Sized>(&mut self, key: &K) -> StorageResult<()> {
        self.next_key = Some(key.serialize(MapKeySerializer)?);
        Ok(())
    }

    fn serialize_value<V: Serialize + ?Sized>(&mut self, value: &V) -> StorageResult<()> {
        let key = self.next_key.take().ok_or_else(|| StorageError::Encode {
            message: "map value serialized before its key".to_string(),
        })?;
        self.doc.insert(key, value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> StorageResult<Value> {
        Ok(Value::Document(self.doc))
    }
}

impl ser::SerializeStruct for SerializeMap {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_field<V: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &V,
    ) -> StorageResult<()> {
        self.doc.insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> StorageResult<Value> {
        Ok(Value::Document(self.doc))
    }
}

pub(crate) struct SerializeStructVariant {
    variant: &'static str,
    doc: Document,
}

impl ser::SerializeStructVariant for SerializeStructVariant {
    type Ok = Value;
    type Error = StorageError;

    fn serialize_field<V: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &V,
    ) -> StorageResult<()> {
        self.doc.insert(key.to_string(), value.serialize(ValueSerializer)?);
        Ok(())
    }

    fn end(self) -> StorageResult<Value> {
        let mut outer = Document::new();
        outer.insert(self.variant.to_string(), Value::Document(self.doc));
        Ok(Value::Document(outer))
    }
}

/// Map keys must render as strings; numbers and chars are stringified.
struct MapKeySerializer;

fn key_must_be_string() -> StorageError {
    StorageError::Encode {
        message: "map keys must be strings".to_string(),
    }
}

impl ser::Serializer for MapKeySerializer {
    type Ok = String;
    type Error = StorageError;

    type SerializeSeq = Impossible<String, StorageError>;
    type SerializeTuple = Impossible<String, StorageError>;
    type SerializeTupleStruct = Impossible<String, StorageError>;
    type SerializeTupleVariant = Impossible<String, StorageError>;
    type SerializeMap = Impossible<String, StorageError>;
    type SerializeStruct = Impossible<String, StorageError>;
    type SerializeStructVariant = Impossible<String, StorageError>;

    fn serialize_str(self, v: &str) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_char(self, v: char) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_bool(self, v: bool) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i8(self, v: i8) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i16(self, v: i16) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i32(self, v: i32) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_i64(self, v: i64) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u8(self, v: u8) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u16(self, v: u16) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u32(self, v: u32) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_u64(self, v: u64) -> StorageResult<String> {
        Ok(v.to_string())
    }

    fn serialize_f32(self, _v: f32) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_f64(self, _v: f64) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_bytes(self, _v: &[u8]) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_none(self) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_some<V: Serialize + ?Sized>(self, value: &V) -> StorageResult<String> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        variant: &'static str,
    ) -> StorageResult<String> {
        Ok(variant.to_string())
    }

    fn serialize_newtype_struct<V: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &V,
    ) -> StorageResult<String> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<V: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &V,
    ) -> StorageResult<String> {
        Err(key_must_be_string())
    }

    fn serialize_seq(self, _len: Option<usize>) -> StorageResult<Self::SerializeSeq> {
        Err(key_must_be_string())
    }

    fn serialize_tuple(self, _len: usize) -> StorageResult<Self::SerializeTuple> {
        Err(key_must_be_string())
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> StorageResult<Self::SerializeTupleStruct> {
        Err(key_must_be_string())
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> StorageResult<Self::SerializeTupleVariant> {
        Err(key_must_be_string())
    }

    fn serialize_map(self, _len: Option<usize>) -> StorageResult<Self::SerializeMap> {
        Err(key_must_be_string())
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> StorageResult<Self::SerializeStruct> {
        Err(key_must_be_string())
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> StorageResult<Self::SerializeStructVariant> {
        Err(key_must_be_string())
    }
}

impl Serialize for Value {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Time(t) => super::value::Timestamp(*t).serialize(serializer),
            Value::ObjectId(oid) => oid.serialize(serializer),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            other => other.to_json().serialize(serializer),
        }
    }
}
