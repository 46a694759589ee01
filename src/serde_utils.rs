//! Serde helpers for record types.

/// `chrono::DateTime<Utc>` fields stored as backend time values.
///
/// Reads native time values, unix seconds, or text in any layout [`parse_time`] accepts.
/// The field is reported to the mapper as a time field.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Event {
///     #[serde(with = "record_store::serde_utils::flexible_time")]
///     at: DateTime<Utc>,
/// }
/// ```
///
/// [`parse_time`]: crate::db::parse_time
pub mod flexible_time {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::db::Timestamp;

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        Timestamp(*value).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        Timestamp::deserialize(deserializer).map(Timestamp::into_inner)
    }

    /// Same as the parent module for `Option<DateTime<Utc>>`; null reads as `None`.
    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        use crate::db::Timestamp;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            value.map(Timestamp).serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<Timestamp>::deserialize(deserializer).map(|t| t.map(Timestamp::into_inner))
        }
    }
}
