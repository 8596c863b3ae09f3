//! Default credential material for a brand-new session.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use curve25519_dalek::montgomery::MontgomeryPoint;
use rand::{Rng, RngCore};

use crate::{errors::Error, value::Value, Result};

/// Builds the credential set of an unpaired session.
///
/// Key pairs are Curve25519 (clamped private scalar, Montgomery public point).
/// The signed pre-key is not signed here; the protocol client signs it before
/// the first upload.
pub fn fresh_creds() -> Value {
    let mut rng = rand::thread_rng();

    let identity = key_pair(&mut rng);
    let signed_pre_key = Value::object([
        ("keyPair", key_pair(&mut rng)),
        ("keyId", Value::from(1u32)),
    ]);

    let mut adv_secret = [0u8; 32];
    rng.fill_bytes(&mut adv_secret);

    let registration_id = u32::from(rng.gen::<u16>() & 0x3fff);

    Value::object([
        ("noiseKey", key_pair(&mut rng)),
        ("pairingEphemeralKeyPair", key_pair(&mut rng)),
        ("signedIdentityKey", identity),
        ("signedPreKey", signed_pre_key),
        ("registrationId", Value::from(registration_id)),
        ("advSecretKey", Value::from(STANDARD.encode(adv_secret))),
        ("processedHistoryMessages", Value::Array(Vec::new())),
        ("nextPreKeyId", Value::from(1u32)),
        ("firstUnuploadedPreKeyId", Value::from(1u32)),
        ("accountSyncCounter", Value::from(0u32)),
        (
            "accountSettings",
            Value::object([("unarchiveChats", Value::from(false))]),
        ),
        ("registered", Value::from(false)),
    ])
}

fn key_pair(rng: &mut impl RngCore) -> Value {
    let mut private = [0u8; 32];
    rng.fill_bytes(&mut private);
    private[0] &= 248;
    private[31] &= 127;
    private[31] |= 64;

    let public = MontgomeryPoint::mul_base_clamped(private);

    Value::object([
        ("private", Value::Bytes(private.to_vec())),
        ("public", Value::Bytes(public.to_bytes().to_vec())),
    ])
}

/// Shallow-merge a partial credential update into the cached set.
pub fn merge_creds(current: &mut Value, partial: Value) -> Result<()> {
    let Value::Object(fields) = partial else {
        return Err(Error::Decode(
            "credential update must be an object".to_string(),
        ));
    };

    match current.as_object_mut() {
        Some(map) => map.extend(fields),
        None => *current = Value::Object(fields),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes32(v: &Value, path: &[&str]) -> [u8; 32] {
        let mut cur = v;
        for p in path {
            cur = cur.get(p).unwrap();
        }
        cur.as_bytes().unwrap().try_into().unwrap()
    }

    #[test]
    fn fresh_creds_have_derived_public_keys() {
        let creds = fresh_creds();
        for pair in ["noiseKey", "pairingEphemeralKeyPair", "signedIdentityKey"] {
            let private = bytes32(&creds, &[pair, "private"]);
            let public = bytes32(&creds, &[pair, "public"]);
            assert_eq!(MontgomeryPoint::mul_base_clamped(private).to_bytes(), public);
        }
        let spk = bytes32(&creds, &["signedPreKey", "keyPair", "public"]);
        assert_eq!(spk.len(), 32);
    }

    #[test]
    fn fresh_creds_counters_and_registration() {
        let creds = fresh_creds();
        assert!(creds.get("registrationId").unwrap().as_u64().unwrap() < 16384);
        assert_eq!(creds.get("nextPreKeyId").unwrap().as_u64(), Some(1));
        assert_eq!(creds.get("registered"), Some(&Value::Bool(false)));
        let adv = creds.get("advSecretKey").unwrap().as_str().unwrap();
        assert_eq!(STANDARD.decode(adv).unwrap().len(), 32);
    }

    #[test]
    fn fresh_creds_are_not_reused() {
        assert_ne!(
            bytes32(&fresh_creds(), &["noiseKey", "private"]),
            bytes32(&fresh_creds(), &["noiseKey", "private"])
        );
    }

    #[test]
    fn merge_replaces_top_level_fields_only() {
        let mut creds = fresh_creds();
        let noise = creds.get("noiseKey").cloned();
        merge_creds(
            &mut creds,
            Value::object([
                ("registered", Value::from(true)),
                ("me", Value::object([("id", Value::from("123@s.whatsapp.net"))])),
            ]),
        )
        .unwrap();

        assert_eq!(creds.get("registered"), Some(&Value::Bool(true)));
        assert!(creds.get("me").is_some());
        assert_eq!(creds.get("noiseKey").cloned(), noise);
    }

    #[test]
    fn merge_rejects_non_object_updates() {
        let mut creds = fresh_creds();
        assert!(merge_creds(&mut creds, Value::from("nope")).is_err());
    }
}
