/// Unlike the default `serde` instances from `localtime`, this encodes and decodes durations as
/// plain integers of milliseconds.
pub mod localtime {
    pub mod duration {
        use localtime::LocalDuration;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &LocalDuration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_u64(value.as_millis() as u64)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<LocalDuration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = u64::deserialize(deserializer)?;

            Ok(LocalDuration::from_millis(millis as u128))
        }
    }
}

