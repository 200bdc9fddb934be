use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use url::Url;

use crate::did_key::{DidKey, DidKeyError};

/// Service type of the account's hosting PDS.
pub const PDS_SERVICE_TYPE: &str = "AtprotoPersonalDataServer";
/// Fragment id of the PDS service entry.
pub const PDS_SERVICE_ID: &str = "#atproto_pds";
/// Service type of a labeler.
pub const LABELER_SERVICE_TYPE: &str = "AtprotoLabeler";
/// Fragment id of the labeler service entry.
pub const LABELER_SERVICE_ID: &str = "#atproto_labeler";

/// DID Document representation.
///
/// Only the fields atproto clients use are modeled explicitly. All other
/// fields are captured in `extra_data` so documents survive a round trip
/// through a session unchanged.
///
/// Example
/// ```
/// use tern_common::did_doc::DidDocument;
/// use serde_json::json;
/// let doc: DidDocument = serde_json::from_value(json!({
///   "id": "did:plc:alice",
///   "alsoKnownAs": ["at://alice.example"],
///   "service": [{"id":"#atproto_pds","type":"AtprotoPersonalDataServer","serviceEndpoint":"https://pds.example"}],
/// })).unwrap();
/// assert_eq!(doc.id, "did:plc:alice");
/// assert_eq!(doc.pds_endpoint().unwrap().as_str(), "https://pds.example/");
/// assert_eq!(doc.handle().as_deref(), Some("alice.example"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    /// Document identifier (e.g., `did:plc:...` or `did:web:...`)
    #[builder(into)]
    pub id: SmolStr,

    /// Alternate identifiers for the subject, such as at://<handle>
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub also_known_as: Option<Vec<SmolStr>>,

    /// Verification methods (keys) for this DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<Vec<VerificationMethod>>,

    /// Services associated with this DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<Vec<Service>>,

    /// Forward‑compatible capture of unmodeled fields
    #[serde(flatten)]
    #[builder(default)]
    pub extra_data: BTreeMap<SmolStr, Value>,
}

impl DidDocument {
    /// Handles from `alsoKnownAs` entries like `at://<handle>`.
    pub fn handles(&self) -> Vec<SmolStr> {
        self.also_known_as
            .as_ref()
            .map(|v| {
                v.iter()
                    .filter_map(|s| s.strip_prefix("at://"))
                    .filter(|h| !h.is_empty() && !h.contains('/'))
                    .map(SmolStr::new)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First handle, if any.
    pub fn handle(&self) -> Option<SmolStr> {
        self.handles().into_iter().next()
    }

    /// Endpoint of the first service matching `id` (e.g. `#atproto_pds`) or `type`.
    pub fn service_endpoint(&self, id: &str, r#type: &str) -> Option<Url> {
        let services = self.service.as_ref()?;
        services
            .iter()
            .find(|s| s.id.ends_with(id) && s.r#type == r#type)
            .or_else(|| services.iter().find(|s| s.r#type == r#type))
            .and_then(Service::endpoint_url)
    }

    /// The `AtprotoPersonalDataServer` endpoint.
    pub fn pds_endpoint(&self) -> Option<Url> {
        self.service_endpoint(PDS_SERVICE_ID, PDS_SERVICE_TYPE)
    }

    /// The `AtprotoLabeler` endpoint.
    pub fn labeler_endpoint(&self) -> Option<Url> {
        self.service_endpoint(LABELER_SERVICE_ID, LABELER_SERVICE_TYPE)
    }

    /// First Multikey `publicKeyMultibase`, preferring the `#atproto` method.
    pub fn atproto_multikey(&self) -> Option<&str> {
        let methods = self.verification_method.as_ref()?;
        methods
            .iter()
            .find(|m| m.id.ends_with("#atproto"))
            .or_else(|| methods.iter().find(|m| m.r#type == "Multikey"))
            .and_then(|m| m.public_key_multibase.as_deref())
    }

    /// Decode the atproto signing key.
    pub fn atproto_key(&self) -> Result<Option<DidKey>, DidKeyError> {
        self.atproto_multikey().map(DidKey::parse).transpose()
    }
}

/// Verification method (key) entry in a DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// Identifier for this key material within the document
    #[builder(into)]
    pub id: SmolStr,
    /// Key type (e.g., `Multikey`)
    #[serde(rename = "type")]
    #[builder(into)]
    pub r#type: SmolStr,
    /// Optional controller DID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub controller: Option<SmolStr>,
    /// Multikey `publicKeyMultibase` (base58btc)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(into)]
    pub public_key_multibase: Option<SmolStr>,

    /// Forward‑compatible capture of unmodeled fields
    #[serde(flatten)]
    #[builder(default)]
    pub extra_data: BTreeMap<SmolStr, Value>,
}

/// Service entry in a DID Document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[builder(start_fn = new)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Service identifier
    #[builder(into)]
    pub id: SmolStr,
    /// Service type (e.g., `AtprotoPersonalDataServer`)
    #[serde(rename = "type")]
    #[builder(into)]
    pub r#type: SmolStr,
    /// String or object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<Value>,

    /// Forward‑compatible capture of unmodeled fields
    #[serde(flatten)]
    #[builder(default)]
    pub extra_data: BTreeMap<SmolStr, Value>,
}

impl Service {
    /// Endpoint as a URL; accepts a string or an object with a `url` field.
    pub fn endpoint_url(&self) -> Option<Url> {
        match self.service_endpoint.as_ref()? {
            Value::String(s) => Url::parse(s).ok(),
            Value::Object(obj) => obj.get("url")?.as_str().and_then(|s| Url::parse(s).ok()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::did_key::{Curve, DidKeyPair};
    use serde_json::json;

    #[test]
    fn finds_services_by_id_and_type() {
        let doc: DidDocument = serde_json::from_value(json!({
            "id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz",
            "service": [
                {"id": "#atproto_labeler", "type": "AtprotoLabeler", "serviceEndpoint": "https://mod.example"},
                {"id": "did:plc:ewvi7nxzyoun6zhxrhs64oiz#atproto_pds", "type": "AtprotoPersonalDataServer", "serviceEndpoint": {"url": "https://pds.example"}}
            ]
        }))
        .unwrap();
        assert_eq!(doc.pds_endpoint().unwrap().as_str(), "https://pds.example/");
        assert_eq!(
            doc.labeler_endpoint().unwrap().as_str(),
            "https://mod.example/"
        );
    }

    #[test]
    fn decodes_atproto_key() {
        let key = DidKeyPair::from_bytes(Curve::K256, &[3u8; 32])
            .unwrap()
            .public_key();
        let doc = DidDocument::new()
            .id("did:plc:alice")
            .verification_method(vec![
                VerificationMethod::new()
                    .id("did:plc:alice#atproto")
                    .r#type("Multikey")
                    .public_key_multibase(key.multibase())
                    .build(),
            ])
            .build();
        assert_eq!(doc.atproto_key().unwrap(), Some(key));
    }

    #[test]
    fn keeps_unknown_fields() {
        let input = json!({
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": "did:web:example.com",
        });
        let doc: DidDocument = serde_json::from_value(input.clone()).unwrap();
        assert!(doc.extra_data.contains_key("@context"));
        assert_eq!(serde_json::to_value(&doc).unwrap(), input);
        assert!(doc.handles().is_empty());
        assert_eq!(doc.pds_endpoint(), None);
    }
}
