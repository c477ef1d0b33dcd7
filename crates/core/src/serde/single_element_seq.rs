//! De-/serialization functions to and from single element sequences.

use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serialize, Serializer};

/// Serialize the given value as a one-element sequence.
pub fn serialize<T: Serialize, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(1))?;
    seq.serialize_element(value)?;
    seq.end()
}

/// Deserialize a sequence that must hold exactly one element.
pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    let mut elements = Vec::<T>::deserialize(deserializer)?;
    if elements.len() != 1 {
        return Err(de::Error::invalid_length(
            elements.len(),
            &"exactly one element",
        ));
    }
    Ok(elements.remove(0))
}
