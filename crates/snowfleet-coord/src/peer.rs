use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The payload of a slot registration node: where a server can be reached.
///
/// Stored as `{"rpc": [...], "thrift": [...]}`; `thrift` may be absent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Endpoints serving the ID RPC protocol, first one preferred.
    #[serde(rename = "rpc")]
    pub rpc_endpoints: Vec<String>,
    /// Endpoints of a secondary protocol. Informational only.
    #[serde(rename = "thrift", default)]
    pub secondary_endpoints: Vec<String>,
}

impl PeerRecord {
    pub fn new(rpc_endpoints: Vec<String>) -> Self {
        Self {
            rpc_endpoints,
            secondary_endpoints: Vec::new(),
        }
    }

    pub fn with_secondary_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.secondary_endpoints = endpoints;
        self
    }

    /// The endpoint peers dial first.
    pub fn primary_endpoint(&self) -> Option<&str> {
        self.rpc_endpoints.first().map(String::as_str)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Backend(e.to_string()))
    }

    /// Decodes the payload stored at `path`.
    pub fn from_json(path: &str, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::MalformedPeerRecord {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_wire_field_names() {
        let record = PeerRecord::new(vec!["10.0.0.1:50051".into()])
            .with_secondary_endpoints(vec!["10.0.0.1:9090".into()]);
        let json: serde_json::Value = serde_json::from_slice(&record.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"rpc": ["10.0.0.1:50051"], "thrift": ["10.0.0.1:9090"]})
        );
    }

    #[test]
    fn secondary_endpoints_are_optional() {
        let record = PeerRecord::from_json("/x", br#"{"rpc":["a:1","b:2"]}"#).unwrap();
        assert_eq!(record.primary_endpoint(), Some("a:1"));
        assert!(record.secondary_endpoints.is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = PeerRecord::from_json("/svc/1/0000000000", b"not json").unwrap_err();
        assert!(matches!(err, Error::MalformedPeerRecord { path, .. } if path == "/svc/1/0000000000"));
    }
}
