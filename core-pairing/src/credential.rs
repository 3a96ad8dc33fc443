//! Pairing credential parsing and validation
//!
//! A pairing credential is the trust record a device hands out when the user
//! taps "Trust" on it. It arrives as a JSON document holding the device and
//! host identifiers plus the PEM encoded certificates and host key that the
//! transport service needs to open a session.
//!
//! ## Security
//!
//! - The `Debug` implementation never prints certificates or key material
//! - Key material is only serialized when handing it to the transport or
//!   persisting it through `SecureStore`

use crate::error::{PairingError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bridge_traits::PairingMaterial;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_DEVICE_ID_LEN: usize = 64;

/// Validated trust material for one device.
///
/// Immutable once constructed; a re-import replaces the whole value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingCredential {
    device_id: String,
    host_id: String,
    system_buid: String,
    device_certificate: String,
    host_certificate: String,
    root_certificate: String,
    host_private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wifi_mac_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    escrow_bag: Option<String>,
}

impl PairingCredential {
    /// Parse and validate raw credential bytes.
    ///
    /// # Errors
    ///
    /// Returns `PairingError::MalformedCredential` when the bytes are not a
    /// JSON credential document or any field fails structural validation.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PairingError::MalformedCredential(
                "credential is empty".to_string(),
            ));
        }

        let credential: PairingCredential = serde_json::from_slice(bytes)
            .map_err(|e| PairingError::MalformedCredential(format!("not a credential document: {}", e)))?;
        credential.validate()?;
        Ok(credential)
    }

    /// Structural validation of every field.
    pub fn validate(&self) -> Result<()> {
        validate_device_id(&self.device_id)?;
        require_non_empty("host_id", &self.host_id)?;
        require_non_empty("system_buid", &self.system_buid)?;

        validate_pem("device_certificate", &self.device_certificate, |label| {
            label == "CERTIFICATE"
        })?;
        validate_pem("host_certificate", &self.host_certificate, |label| {
            label == "CERTIFICATE"
        })?;
        validate_pem("root_certificate", &self.root_certificate, |label| {
            label == "CERTIFICATE"
        })?;
        validate_pem("host_private_key", &self.host_private_key, |label| {
            label.ends_with("PRIVATE KEY")
        })?;

        if let Some(ref mac) = self.wifi_mac_address {
            validate_mac_address(mac)?;
        }

        if let Some(ref bag) = self.escrow_bag {
            let decoded = STANDARD.decode(bag.trim()).map_err(|_| {
                PairingError::MalformedCredential("escrow_bag is not valid base64".to_string())
            })?;
            if decoded.is_empty() {
                return Err(PairingError::MalformedCredential(
                    "escrow_bag is empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn system_buid(&self) -> &str {
        &self.system_buid
    }

    pub fn wifi_mac_address(&self) -> Option<&str> {
        self.wifi_mac_address.as_deref()
    }

    pub fn has_escrow_bag(&self) -> bool {
        self.escrow_bag.is_some()
    }

    /// Canonical serialized form, used for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            PairingError::StorageError(format!("failed to serialize credential: {}", e))
        })
    }

    /// Material handed to the transport service when opening a session.
    pub fn material(&self) -> Result<PairingMaterial> {
        Ok(PairingMaterial {
            device_id: self.device_id.clone(),
            host_id: self.host_id.clone(),
            payload: Bytes::from(self.to_bytes()?),
        })
    }
}

impl fmt::Debug for PairingCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingCredential")
            .field("device_id", &self.device_id)
            .field("host_id", &self.host_id)
            .field("system_buid", &self.system_buid)
            .field("certificates", &"[redacted]")
            .field("host_private_key", &"[redacted]")
            .field("has_escrow_bag", &self.escrow_bag.is_some())
            .finish()
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PairingError::MalformedCredential(format!(
            "{} is empty",
            field
        )));
    }
    Ok(())
}

fn validate_device_id(device_id: &str) -> Result<()> {
    require_non_empty("device_id", device_id)?;
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(PairingError::MalformedCredential(format!(
            "device_id longer than {} characters",
            MAX_DEVICE_ID_LEN
        )));
    }
    if !device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(PairingError::MalformedCredential(
            "device_id may only contain ASCII letters, digits and '-'".to_string(),
        ));
    }
    Ok(())
}

fn validate_mac_address(mac: &str) -> Result<()> {
    let octets: Vec<&str> = mac.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(PairingError::MalformedCredential(format!(
            "wifi_mac_address '{}' is not a MAC address",
            mac
        )));
    }
    Ok(())
}

/// Check a single PEM block: matching BEGIN/END labels and a base64 body.
fn validate_pem(field: &str, pem: &str, accept_label: impl Fn(&str) -> bool) -> Result<()> {
    let malformed = |reason: &str| {
        PairingError::MalformedCredential(format!("{} {}", field, reason))
    };

    let mut lines = pem.trim().lines().map(str::trim).filter(|l| !l.is_empty());

    let first = lines.next().ok_or_else(|| malformed("is empty"))?;
    let label = first
        .strip_prefix("-----BEGIN ")
        .and_then(|rest| rest.strip_suffix("-----"))
        .ok_or_else(|| malformed("is missing a PEM BEGIN marker"))?;
    if !accept_label(label) {
        return Err(malformed(&format!("has unexpected PEM type '{}'", label)));
    }

    let mut body = String::new();
    let mut closed = false;
    for line in lines {
        if let Some(end) = line
            .strip_prefix("-----END ")
            .and_then(|rest| rest.strip_suffix("-----"))
        {
            if end != label {
                return Err(malformed("has mismatched PEM END marker"));
            }
            closed = true;
            break;
        }
        body.push_str(line);
    }

    if !closed {
        return Err(malformed("is missing a PEM END marker"));
    }

    let decoded = STANDARD
        .decode(body.as_bytes())
        .map_err(|_| malformed("has a PEM body that is not valid base64"))?;
    if decoded.is_empty() {
        return Err(malformed("has an empty PEM body"));
    }

    Ok(())
}

/// Sample credentials for tests.
#[cfg(any(test, feature = "test-support"))]
pub mod fixtures {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    fn pem(label: &str, seed: &str) -> String {
        let body = STANDARD.encode(format!("{}-{}-der-bytes-for-testing", label, seed));
        format!("-----BEGIN {}-----\n{}\n-----END {}-----\n", label, body, label)
    }

    /// JSON value of a well-formed credential for `device_id`.
    pub fn credential_value(device_id: &str) -> serde_json::Value {
        serde_json::json!({
            "device_id": device_id,
            "host_id": "5A1E7B0C-HOST",
            "system_buid": "2C1D9F44-BUID",
            "device_certificate": pem("CERTIFICATE", "device"),
            "host_certificate": pem("CERTIFICATE", "host"),
            "root_certificate": pem("CERTIFICATE", "root"),
            "host_private_key": pem("RSA PRIVATE KEY", "host"),
            "wifi_mac_address": "a4:83:e7:12:34:56",
            "escrow_bag": STANDARD.encode("escrow"),
        })
    }

    /// Serialized well-formed credential for `device_id`.
    pub fn credential_bytes(device_id: &str) -> Vec<u8> {
        serde_json::to_vec(&credential_value(device_id)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{credential_bytes, credential_value};
    use super::*;

    fn parse_value(value: serde_json::Value) -> Result<PairingCredential> {
        PairingCredential::parse(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_parse_well_formed_credential() {
        let credential = PairingCredential::parse(&credential_bytes("00008030-001A")).unwrap();

        assert_eq!(credential.device_id(), "00008030-001A");
        assert_eq!(credential.host_id(), "5A1E7B0C-HOST");
        assert_eq!(credential.wifi_mac_address(), Some("a4:83:e7:12:34:56"));
        assert!(credential.has_escrow_bag());
    }

    #[test]
    fn test_rejects_non_json() {
        let err = PairingCredential::parse(b"<plist>not json</plist>").unwrap_err();
        assert!(matches!(err, PairingError::MalformedCredential(_)));

        let err = PairingCredential::parse(b"").unwrap_err();
        assert!(matches!(err, PairingError::MalformedCredential(_)));
    }

    #[test]
    fn test_rejects_missing_field() {
        let mut value = credential_value("D1");
        value.as_object_mut().unwrap().remove("host_private_key");

        let err = parse_value(value).unwrap_err();
        assert!(err.to_string().contains("host_private_key"));
    }

    #[test]
    fn test_rejects_bad_device_id() {
        for bad in ["", "D1/../etc", "device id", "D1:x"] {
            let mut value = credential_value("D1");
            value["device_id"] = serde_json::json!(bad);
            assert!(parse_value(value).is_err(), "accepted {:?}", bad);
        }

        let mut value = credential_value("D1");
        value["device_id"] = serde_json::json!("a".repeat(65));
        assert!(parse_value(value).is_err());
    }

    #[test]
    fn test_rejects_broken_pem() {
        let mut value = credential_value("D1");
        value["root_certificate"] =
            serde_json::json!("-----BEGIN CERTIFICATE-----\nAAAA\n");
        let err = parse_value(value).unwrap_err();
        assert!(err.to_string().contains("END marker"));

        let mut value = credential_value("D1");
        value["host_certificate"] = serde_json::json!(
            "-----BEGIN CERTIFICATE-----\n!!not base64!!\n-----END CERTIFICATE-----"
        );
        let err = parse_value(value).unwrap_err();
        assert!(err.to_string().contains("base64"));

        let mut value = credential_value("D1");
        value["host_private_key"] = serde_json::json!(
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----"
        );
        let err = parse_value(value).unwrap_err();
        assert!(err.to_string().contains("unexpected PEM type"));

        let mut value = credential_value("D1");
        value["device_certificate"] = serde_json::json!(
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END PRIVATE KEY-----"
        );
        let err = parse_value(value).unwrap_err();
        assert!(err.to_string().contains("mismatched"));
    }

    #[test]
    fn test_rejects_bad_optional_fields() {
        let mut value = credential_value("D1");
        value["wifi_mac_address"] = serde_json::json!("a4:83:e7");
        assert!(parse_value(value).is_err());

        let mut value = credential_value("D1");
        value["escrow_bag"] = serde_json::json!("%%%");
        assert!(parse_value(value).is_err());

        let mut value = credential_value("D1");
        let object = value.as_object_mut().unwrap();
        object.remove("wifi_mac_address");
        object.remove("escrow_bag");
        let credential = parse_value(value).unwrap();
        assert!(!credential.has_escrow_bag());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let credential = PairingCredential::parse(&credential_bytes("D1")).unwrap();
        let debug = format!("{:?}", credential);

        assert!(debug.contains("D1"));
        assert!(!debug.contains("BEGIN"));
        assert!(!debug.contains("PRIVATE KEY-----"));
    }

    #[test]
    fn test_canonical_bytes_reparse() {
        let credential = PairingCredential::parse(&credential_bytes("D1")).unwrap();
        let bytes = credential.to_bytes().unwrap();
        assert_eq!(PairingCredential::parse(&bytes).unwrap(), credential);

        let material = credential.material().unwrap();
        assert_eq!(material.device_id, "D1");
        assert_eq!(material.payload.as_ref(), bytes.as_slice());
    }
}
