//! Native transformer implementations.
//!
//! Like templates, a few transformers are built in and run without the
//! sandbox. They are keyed by object ID; a tenant-authored transformer never
//! collides with these.

use uuid::Uuid;

use tokenweave_core::ids;

/// A native transformation function: (data, parameters) to output.
pub type NativeTransformFn = fn(&str, &str) -> String;

fn passthrough(data: &str, _parameters: &str) -> String {
    data.to_string()
}

fn uuid_token(_data: &str, _parameters: &str) -> String {
    Uuid::new_v4().to_string()
}

/// Native implementation for a transformer ID, if one exists.
pub fn native_transformer(id: Uuid) -> Option<NativeTransformFn> {
    match id {
        ids::PASSTHROUGH_TRANSFORMER => Some(passthrough),
        ids::UUID_TRANSFORMER => Some(uuid_token),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_echoes() {
        let transform = native_transformer(ids::PASSTHROUGH_TRANSFORMER).unwrap();
        assert_eq!(transform("hello", ""), "hello");
    }

    #[test]
    fn uuid_token_is_fresh_each_call() {
        let transform = native_transformer(ids::UUID_TRANSFORMER).unwrap();
        let first = transform("data", "");
        let second = transform("data", "");
        assert_ne!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn unknown_ids_have_no_native_implementation() {
        assert!(native_transformer(Uuid::new_v4()).is_none());
    }
}
