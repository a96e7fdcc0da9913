//! Field-name escaping for MongoDB.
//!
//! MongoDB reserves dots (nested paths), leading dollar signs (operators) and NUL
//! bytes in field names. Keys of stored documents are escaped on the way in and
//! restored on the way out; values are stored untouched.

use bson::{Bson, Document};

pub(crate) struct ValueSanitizer;

impl ValueSanitizer {
    const REPLACEMENTS: [(&'static str, &'static str); 3] = [
        (".", "__dot__"),
        ("$", "__dollar__"),
        ("\0", "__null__"),
    ];

    /// Escapes every key of `document`, recursing into embedded documents and arrays.
    pub(crate) fn sanitize_document(document: &Document) -> Document {
        document
            .iter()
            .map(|(k, v)| (Self::sanitize_string(k), Self::sanitize_value(v)))
            .collect()
    }

    fn sanitize_value(value: &Bson) -> Bson {
        match value {
            Bson::Array(arr) => Bson::Array(arr.iter().map(Self::sanitize_value).collect()),
            Bson::Document(doc) => Bson::Document(Self::sanitize_document(doc)),
            _ => value.clone(),
        }
    }

    pub(crate) fn sanitize_string(input: &str) -> String {
        let mut sanitized = input.to_string();
        for (target, replacement) in Self::REPLACEMENTS.iter() {
            sanitized = sanitized.replace(*target, *replacement);
        }
        sanitized
    }

    /// Escapes each segment of a dotted field path, keeping the dots as path separators.
    pub(crate) fn sanitize_path(path: &str) -> String {
        path.split('.')
            .map(Self::sanitize_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Inverse of [`sanitize_document`](Self::sanitize_document).
    pub(crate) fn restore_document(document: Document) -> Document {
        document
            .into_iter()
            .map(|(k, v)| (Self::restore_string(&k), Self::restore_value(v)))
            .collect()
    }

    fn restore_value(value: Bson) -> Bson {
        match value {
            Bson::Array(arr) => Bson::Array(arr.into_iter().map(Self::restore_value).collect()),
            Bson::Document(doc) => Bson::Document(Self::restore_document(doc)),
            other => other,
        }
    }

    pub(crate) fn restore_string(input: &str) -> String {
        let mut restored = input.to_string();
        for (target, replacement) in Self::REPLACEMENTS.iter().rev() {
            restored = restored.replace(*replacement, *target);
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn keys_are_escaped_and_values_kept() {
        let original = doc! {
            "a.b": "x.y",
            "$price": 3,
            "nested": { "k.1": [ { "$v": 1 } ] },
        };

        let sanitized = ValueSanitizer::sanitize_document(&original);
        assert_eq!(
            sanitized,
            doc! {
                "a__dot__b": "x.y",
                "__dollar__price": 3,
                "nested": { "k__dot__1": [ { "__dollar__v": 1 } ] },
            }
        );
        assert_eq!(ValueSanitizer::restore_document(sanitized), original);
    }

    #[test]
    fn paths_escape_per_segment() {
        assert_eq!(ValueSanitizer::sanitize_path("address.$zip"), "address.__dollar__zip");
        assert_eq!(ValueSanitizer::sanitize_path("plain"), "plain");
    }
}
