use crate::signature::{generate_webhook_secret, sign, validate, SignatureValidator};

const SECRET: &str = "whsec_test_secret";
const PAYLOAD: &[u8] = br#"{"id":"session-1","verification":{"decision":"approved"}}"#;

#[test]
fn test_valid_signature_accepted() {
    let signature = sign(PAYLOAD, SECRET);
    assert_eq!(signature.len(), 64);
    assert!(validate(PAYLOAD, &signature, SECRET));
    assert!(validate(PAYLOAD, &signature.to_uppercase(), SECRET));
}

#[test]
fn test_every_signature_bit_flip_rejected() {
    let signature = hex::decode(sign(PAYLOAD, SECRET)).unwrap();

    for byte in 0..signature.len() {
        for bit in 0..8 {
            let mut tampered = signature.clone();
            tampered[byte] ^= 1 << bit;
            assert!(
                !validate(PAYLOAD, &hex::encode(&tampered), SECRET),
                "flip at byte {byte} bit {bit} accepted"
            );
        }
    }
}

#[test]
fn test_payload_bit_flip_rejected() {
    let signature = sign(PAYLOAD, SECRET);

    for byte in 0..PAYLOAD.len() {
        let mut tampered = PAYLOAD.to_vec();
        tampered[byte] ^= 0x01;
        assert!(!validate(&tampered, &signature, SECRET));
    }
}

#[test]
fn test_malformed_inputs_rejected() {
    let signature = sign(PAYLOAD, SECRET);

    assert!(!validate(PAYLOAD, &signature, ""));
    assert!(!validate(PAYLOAD, "not-hex", SECRET));
    assert!(!validate(PAYLOAD, "", SECRET));
    assert!(!validate(PAYLOAD, &signature[..62], SECRET));
    assert!(!validate(PAYLOAD, &format!("{signature}00"), SECRET));
    assert!(!validate(PAYLOAD, &signature, "other-secret"));
}

#[test]
fn test_validator_requires_secret() {
    let unconfigured = SignatureValidator::new("");
    assert!(!unconfigured.is_configured());
    assert!(!unconfigured.verify(PAYLOAD, &sign(PAYLOAD, "")));

    let validator = SignatureValidator::new(SECRET);
    assert!(validator.is_configured());
    assert!(validator.verify(PAYLOAD, &sign(PAYLOAD, SECRET)));
    assert!(!format!("{validator:?}").contains(SECRET));
}

#[test]
fn test_generated_secrets() {
    let first = generate_webhook_secret();
    let second = generate_webhook_secret();

    // 32 bytes, unpadded base64
    assert_eq!(first.len(), 43);
    assert!(first
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    assert_ne!(first, second);
}
