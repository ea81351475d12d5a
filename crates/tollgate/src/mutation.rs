//! Helpers for building the proxy's header/body mutation messages.

use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::service::ext_proc::v3::{body_mutation, BodyMutation, HeaderMutation};

/// Append a set-header entry. Values travel in `raw_value`; the deprecated
/// string field stays empty.
pub fn set_header(mutation: &mut HeaderMutation, key: &str, value: &[u8]) {
    mutation.set_headers.push(HeaderValueOption {
        header: Some(HeaderValue {
            key: key.to_string(),
            raw_value: value.to_vec(),
            ..Default::default()
        }),
        ..Default::default()
    });
}

pub fn remove_header(mutation: &mut HeaderMutation, key: &str) {
    mutation.remove_headers.push(key.to_string());
}

/// Lower a translator's transport-agnostic header mutation onto the wire type.
pub fn from_translator(source: janusllm::HeaderMutation) -> HeaderMutation {
    let mut mutation = HeaderMutation::default();
    for (key, value) in source.set {
        set_header(&mut mutation, &key, value.as_bytes());
    }
    for key in source.remove {
        remove_header(&mut mutation, &key);
    }
    mutation
}

pub fn replace_body(body: Vec<u8>) -> BodyMutation {
    BodyMutation {
        mutation: Some(body_mutation::Mutation::Body(body)),
    }
}
