//! Verification of Nitro Enclave attestation documents
//!
//! A document is a COSE_Sign1 structure (optionally CBOR tag 18):
//!
//! ```text
//! [ protected: bstr { 1: -35 }, unprotected: map, payload: bstr, signature: bstr ]
//! ```
//!
//! The payload is a CBOR map holding the module id, PCRs, the signing
//! certificate and the CA bundle leading up to the AWS Nitro root.
//! Checks run in this order: structure, certificate validity windows, root
//! fingerprint, chain signatures, document signature.

use crate::attestation::{AttestationDocument, DocumentVerifier, MAX_BOUND_FIELD_LEN};
use crate::config::AttestationConfig;
use crate::error::{EnclaveError, Result};
use ciborium::value::Value;
use ring::signature::{UnparsedPublicKey, ECDSA_P384_SHA384_FIXED};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

/// CBOR tag for COSE_Sign1
const COSE_SIGN1_TAG: u64 = 18;

/// COSE header label for the signature algorithm
const COSE_ALG_LABEL: i128 = 1;

/// COSE algorithm identifier for ECDSA P-384 with SHA-384
const COSE_ALG_ES384: i128 = -35;

const EXPECTED_DIGEST: &str = "SHA384";
const MAX_PCRS: usize = 32;
const VALID_PCR_LENGTHS: [usize; 3] = [32, 48, 64];

/// Verifies documents against a pinned root certificate
#[derive(Debug, Clone)]
pub struct NitroVerifier {
    root_fingerprint: [u8; 32],
}

impl NitroVerifier {
    /// Verifier trusting the root whose DER encoding hashes to `root_fingerprint`
    pub fn new(root_fingerprint: [u8; 32]) -> Self {
        Self { root_fingerprint }
    }

    pub fn from_config(config: &AttestationConfig) -> Result<Self> {
        Ok(Self::new(config.root_fingerprint()?))
    }

    /// Checks validity windows, the root pin and the chain up to the signing
    /// certificate, returning the signing key
    fn verify_certificates(&self, payload: &RawDocument, now: SystemTime) -> Result<Vec<u8>> {
        let leaf = parse_certificate(&payload.certificate, "signing certificate")?;
        let bundle = payload
            .cabundle
            .iter()
            .enumerate()
            .map(|(i, der)| parse_certificate(der, &format!("cabundle[{}]", i)))
            .collect::<Result<Vec<_>>>()?;

        let now_secs = now
            .duration_since(UNIX_EPOCH)
            .map_err(|_| EnclaveError::Config("system clock before Unix epoch".to_string()))?
            .as_secs() as i64;
        let windows: Vec<ValidityWindow> = bundle
            .iter()
            .chain(std::iter::once(&leaf))
            .map(|cert| ValidityWindow {
                subject: cert.subject().to_string(),
                not_before: cert.validity().not_before.timestamp(),
                not_after: cert.validity().not_after.timestamp(),
            })
            .collect();
        check_validity(&windows, now_secs)?;

        let root_der = &payload.cabundle[0];
        if Sha256::digest(root_der.as_slice()).as_slice() != &self.root_fingerprint[..] {
            return Err(EnclaveError::InvalidSignature(
                "root certificate does not match the trusted fingerprint".to_string(),
            ));
        }

        bundle[0]
            .verify_signature(None)
            .map_err(|e| EnclaveError::InvalidSignature(format!("root self-signature: {}", e)))?;
        for i in 1..bundle.len() {
            bundle[i]
                .verify_signature(Some(bundle[i - 1].public_key()))
                .map_err(|e| {
                    EnclaveError::InvalidSignature(format!("cabundle[{}] signature: {}", i, e))
                })?;
        }
        let issuer = &bundle[bundle.len() - 1];
        leaf.verify_signature(Some(issuer.public_key()))
            .map_err(|e| EnclaveError::InvalidSignature(format!("signing certificate: {}", e)))?;

        Ok(leaf.public_key().subject_public_key.data.to_vec())
    }
}

impl DocumentVerifier for NitroVerifier {
    fn verify(&self, raw: &[u8], now: SystemTime) -> Result<AttestationDocument> {
        let cose = CoseSign1::decode(raw)?;
        check_algorithm(&cose.protected)?;

        let payload: RawDocument = ciborium::de::from_reader(cose.payload.as_slice())
            .map_err(|e| EnclaveError::MalformedDocument(format!("invalid payload: {}", e)))?;
        check_structure(&payload)?;

        let leaf_key = self.verify_certificates(&payload, now)?;

        let to_be_signed = cose.sig_structure()?;
        UnparsedPublicKey::new(&ECDSA_P384_SHA384_FIXED, &leaf_key)
            .verify(&to_be_signed, &cose.signature)
            .map_err(|_| {
                EnclaveError::InvalidSignature("document signature does not verify".to_string())
            })?;

        debug!(module_id = %payload.module_id, "Attestation document verified");
        Ok(payload.into_document())
    }
}

/// The four parts of a COSE_Sign1 message
#[derive(Debug)]
struct CoseSign1 {
    protected: Vec<u8>,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

impl CoseSign1 {
    fn decode(raw: &[u8]) -> Result<Self> {
        let value: Value = ciborium::de::from_reader(raw)
            .map_err(|e| EnclaveError::MalformedDocument(format!("invalid CBOR: {}", e)))?;
        let value = match value {
            Value::Tag(COSE_SIGN1_TAG, inner) => *inner,
            other => other,
        };
        let items = match value {
            Value::Array(items) if items.len() == 4 => items,
            _ => {
                return Err(EnclaveError::MalformedDocument(
                    "expected a 4-element COSE_Sign1 array".to_string(),
                ))
            }
        };

        let mut items = items.into_iter();
        let protected = expect_bytes(items.next(), "protected header")?;
        match items.next() {
            Some(Value::Map(_)) => {}
            _ => {
                return Err(EnclaveError::MalformedDocument(
                    "unprotected header is not a map".to_string(),
                ))
            }
        }
        let payload = expect_bytes(items.next(), "payload")?;
        let signature = expect_bytes(items.next(), "signature")?;
        Ok(Self {
            protected,
            payload,
            signature,
        })
    }

    /// The Sig_structure the signature is computed over
    fn sig_structure(&self) -> Result<Vec<u8>> {
        let structure = Value::Array(vec![
            Value::Text("Signature1".to_string()),
            Value::Bytes(self.protected.clone()),
            Value::Bytes(Vec::new()),
            Value::Bytes(self.payload.clone()),
        ]);
        let mut out = Vec::new();
        ciborium::ser::into_writer(&structure, &mut out).map_err(|e| {
            EnclaveError::MalformedDocument(format!("failed to encode Sig_structure: {}", e))
        })?;
        Ok(out)
    }
}

fn expect_bytes(value: Option<Value>, what: &str) -> Result<Vec<u8>> {
    match value {
        Some(Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(EnclaveError::MalformedDocument(format!(
            "{} is not a byte string",
            what
        ))),
    }
}

fn check_algorithm(protected: &[u8]) -> Result<()> {
    let header: Value = ciborium::de::from_reader(protected).map_err(|e| {
        EnclaveError::MalformedDocument(format!("invalid protected header: {}", e))
    })?;
    let Value::Map(entries) = header else {
        return Err(EnclaveError::MalformedDocument(
            "protected header is not a map".to_string(),
        ));
    };

    let alg = entries.iter().find_map(|(key, value)| match (key, value) {
        (Value::Integer(k), Value::Integer(v)) if i128::from(*k) == COSE_ALG_LABEL => {
            Some(i128::from(*v))
        }
        _ => None,
    });
    match alg {
        Some(COSE_ALG_ES384) => Ok(()),
        Some(other) => Err(EnclaveError::MalformedDocument(format!(
            "unsupported signature algorithm {}",
            other
        ))),
        None => Err(EnclaveError::MalformedDocument(
            "protected header has no algorithm".to_string(),
        )),
    }
}

/// Document payload as encoded by the NSM
#[derive(Debug, Deserialize)]
struct RawDocument {
    module_id: String,
    digest: String,
    timestamp: u64,
    pcrs: BTreeMap<usize, ByteBuf>,
    certificate: ByteBuf,
    cabundle: Vec<ByteBuf>,
    public_key: Option<ByteBuf>,
    user_data: Option<ByteBuf>,
    nonce: Option<ByteBuf>,
}

impl RawDocument {
    fn into_document(self) -> AttestationDocument {
        AttestationDocument {
            module_id: self.module_id,
            digest: self.digest,
            timestamp: self.timestamp,
            measurements: self
                .pcrs
                .into_iter()
                .map(|(i, v)| (i, v.into_vec()))
                .collect(),
            certificate: self.certificate.into_vec(),
            cabundle: self.cabundle.into_iter().map(ByteBuf::into_vec).collect(),
            public_key: self.public_key.map(ByteBuf::into_vec),
            user_data: self.user_data.map(ByteBuf::into_vec),
            nonce: self.nonce.map(ByteBuf::into_vec),
        }
    }
}

fn check_structure(doc: &RawDocument) -> Result<()> {
    let malformed = |msg: String| Err(EnclaveError::MalformedDocument(msg));

    if doc.module_id.is_empty() {
        return malformed("empty module_id".to_string());
    }
    if doc.digest != EXPECTED_DIGEST {
        return malformed(format!("unexpected digest {}", doc.digest));
    }
    if doc.timestamp == 0 {
        return malformed("missing timestamp".to_string());
    }
    if doc.pcrs.is_empty() || doc.pcrs.len() > MAX_PCRS {
        return malformed(format!("invalid PCR count {}", doc.pcrs.len()));
    }
    for (index, value) in &doc.pcrs {
        if *index >= MAX_PCRS {
            return malformed(format!("PCR index {} out of range", index));
        }
        if !VALID_PCR_LENGTHS.contains(&value.len()) {
            return malformed(format!("PCR{} has invalid length {}", index, value.len()));
        }
    }
    if doc.certificate.is_empty() {
        return malformed("empty signing certificate".to_string());
    }
    if doc.cabundle.is_empty() {
        return malformed("empty cabundle".to_string());
    }
    if let Some(empty) = doc.cabundle.iter().position(|c| c.is_empty()) {
        return malformed(format!("cabundle[{}] is empty", empty));
    }
    for (name, field) in [
        ("public_key", &doc.public_key),
        ("user_data", &doc.user_data),
        ("nonce", &doc.nonce),
    ] {
        if let Some(value) = field {
            if value.len() > MAX_BOUND_FIELD_LEN {
                return malformed(format!("{} exceeds {} bytes", name, MAX_BOUND_FIELD_LEN));
            }
        }
    }
    Ok(())
}

fn parse_certificate<'a>(der: &'a [u8], what: &str) -> Result<X509Certificate<'a>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| EnclaveError::MalformedDocument(format!("invalid {}: {}", what, e)))?;
    Ok(cert)
}

/// Validity period of one certificate, in seconds since the Unix epoch
#[derive(Debug, Clone, PartialEq, Eq)]
struct ValidityWindow {
    subject: String,
    not_before: i64,
    not_after: i64,
}

fn check_validity(windows: &[ValidityWindow], now: i64) -> Result<()> {
    for window in windows {
        if now < window.not_before {
            return Err(EnclaveError::ExpiredCertificate(format!(
                "{} is not valid before {}",
                window.subject, window.not_before
            )));
        }
        if now > window.not_after {
            return Err(EnclaveError::ExpiredCertificate(format!(
                "{} expired at {}",
                window.subject, window.not_after
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn cbor(value: &Value) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(value, &mut out).unwrap();
        out
    }

    fn protected(alg: i64) -> Vec<u8> {
        cbor(&Value::Map(vec![(
            Value::Integer(1.into()),
            Value::Integer(alg.into()),
        )]))
    }

    fn payload(digest: &str, pcr_len: usize) -> Value {
        Value::Map(vec![
            (text("module_id"), text("i-0123-enc0123")),
            (text("digest"), text(digest)),
            (text("timestamp"), Value::Integer(1_700_000_000_000u64.into())),
            (
                text("pcrs"),
                Value::Map(vec![
                    (Value::Integer(0.into()), Value::Bytes(vec![0; pcr_len])),
                    (Value::Integer(1.into()), Value::Bytes(vec![1; pcr_len])),
                ]),
            ),
            (text("certificate"), Value::Bytes(vec![0x30, 0x00])),
            (text("cabundle"), Value::Array(vec![Value::Bytes(vec![0x30, 0x00])])),
            (text("public_key"), Value::Null),
            (text("user_data"), Value::Null),
            (text("nonce"), Value::Bytes(b"N1".to_vec())),
        ])
    }

    fn cose(protected: Vec<u8>, payload: &Value, tagged: bool) -> Vec<u8> {
        let array = Value::Array(vec![
            Value::Bytes(protected),
            Value::Map(vec![]),
            Value::Bytes(cbor(payload)),
            Value::Bytes(vec![0; 96]),
        ]);
        if tagged {
            cbor(&Value::Tag(COSE_SIGN1_TAG, Box::new(array)))
        } else {
            cbor(&array)
        }
    }

    fn verifier() -> NitroVerifier {
        NitroVerifier::from_config(&AttestationConfig::default()).unwrap()
    }

    fn assert_malformed(raw: &[u8]) {
        match verifier().verify(raw, SystemTime::now()) {
            Err(EnclaveError::MalformedDocument(_)) => {}
            other => panic!("expected MalformedDocument, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_garbage() {
        assert_malformed(b"");
        assert_malformed(b"not cbor at all");
        assert_malformed(&cbor(&Value::Array(vec![Value::Bytes(vec![])])));
    }

    #[test]
    fn test_rejects_wrong_algorithm() {
        assert_malformed(&cose(protected(-7), &payload("SHA384", 48), true));
        assert_malformed(&cose(cbor(&Value::Map(vec![])), &payload("SHA384", 48), true));
    }

    #[test]
    fn test_rejects_structural_violations() {
        assert_malformed(&cose(protected(-35), &payload("SHA256", 48), true));
        assert_malformed(&cose(protected(-35), &payload("SHA384", 20), false));
        assert_malformed(&cose(protected(-35), &Value::Map(vec![]), true));
    }

    #[test]
    fn test_unparseable_certificate_is_malformed() {
        // Well-formed envelope and payload; certificates are not valid DER.
        assert_malformed(&cose(protected(-35), &payload("SHA384", 48), true));
        assert_malformed(&cose(protected(-35), &payload("SHA384", 64), false));
    }

    #[test]
    fn test_decodes_envelope() {
        let raw = cose(protected(-35), &payload("SHA384", 48), true);
        let cose = CoseSign1::decode(&raw).unwrap();
        assert_eq!(cose.signature.len(), 96);
        check_algorithm(&cose.protected).unwrap();

        let doc: RawDocument = ciborium::de::from_reader(cose.payload.as_slice()).unwrap();
        check_structure(&doc).unwrap();
        let doc = doc.into_document();
        assert_eq!(doc.measurements.len(), 2);
        assert_eq!(doc.nonce.as_deref(), Some(&b"N1"[..]));
        assert!(doc.user_data.is_none());
    }

    #[test]
    fn test_sig_structure_layout() {
        let cose = CoseSign1 {
            protected: vec![0xa1, 0x01, 0x38, 0x22],
            payload: vec![0xaa],
            signature: vec![],
        };
        let encoded = cose.sig_structure().unwrap();
        let value: Value = ciborium::de::from_reader(encoded.as_slice()).unwrap();
        let Value::Array(items) = value else {
            panic!("not an array")
        };
        assert_eq!(items[0], text("Signature1"));
        assert_eq!(items[1], Value::Bytes(vec![0xa1, 0x01, 0x38, 0x22]));
        assert_eq!(items[2], Value::Bytes(vec![]));
        assert_eq!(items[3], Value::Bytes(vec![0xaa]));
    }

    #[test]
    fn test_validity_windows() {
        let windows = vec![
            ValidityWindow {
                subject: "CN=root".to_string(),
                not_before: 100,
                not_after: 10_000,
            },
            ValidityWindow {
                subject: "CN=leaf".to_string(),
                not_before: 500,
                not_after: 1_000,
            },
        ];
        check_validity(&windows, 700).unwrap();
        assert!(matches!(
            check_validity(&windows, 1_001),
            Err(EnclaveError::ExpiredCertificate(_))
        ));
        assert!(matches!(
            check_validity(&windows, 200),
            Err(EnclaveError::ExpiredCertificate(_))
        ));
    }

    #[test]
    fn test_oversized_bound_fields() {
        let raw = cose(protected(-35), &payload("SHA384", 48), true);
        let cose = CoseSign1::decode(&raw).unwrap();
        let mut doc: RawDocument = ciborium::de::from_reader(cose.payload.as_slice()).unwrap();
        doc.user_data = Some(ByteBuf::from(vec![0; MAX_BOUND_FIELD_LEN + 1]));
        assert!(matches!(
            check_structure(&doc),
            Err(EnclaveError::MalformedDocument(_))
        ));
    }

    /// A P-384 root and a signing certificate issued by it
    struct TestChain {
        root_der: Vec<u8>,
        leaf_der: Vec<u8>,
        leaf_pkcs8: Vec<u8>,
    }

    fn test_chain(leaf_expired: bool) -> TestChain {
        use rcgen::{
            BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, PKCS_ECDSA_P384_SHA384,
        };

        let root_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let mut root_params = CertificateParams::default();
        root_params
            .distinguished_name
            .push(DnType::CommonName, "test root");
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let root = root_params.self_signed(&root_key).unwrap();

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).unwrap();
        let mut leaf_params = CertificateParams::default();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "test enclave");
        if leaf_expired {
            leaf_params.not_before = rcgen::date_time_ymd(2020, 1, 1);
            leaf_params.not_after = rcgen::date_time_ymd(2021, 1, 1);
        }
        let leaf = leaf_params.signed_by(&leaf_key, &root, &root_key).unwrap();

        TestChain {
            root_der: root.der().to_vec(),
            leaf_der: leaf.der().to_vec(),
            leaf_pkcs8: leaf_key.serialize_der(),
        }
    }

    fn chain_payload(leaf_der: &[u8], root_der: &[u8], nonce: &[u8]) -> Vec<u8> {
        cbor(&Value::Map(vec![
            (text("module_id"), text("i-0123-enc0123")),
            (text("digest"), text("SHA384")),
            (text("timestamp"), Value::Integer(1_700_000_000_000u64.into())),
            (
                text("pcrs"),
                Value::Map(vec![(Value::Integer(0.into()), Value::Bytes(vec![7; 48]))]),
            ),
            (text("certificate"), Value::Bytes(leaf_der.to_vec())),
            (text("cabundle"), Value::Array(vec![Value::Bytes(root_der.to_vec())])),
            (text("public_key"), Value::Null),
            (text("user_data"), Value::Null),
            (text("nonce"), Value::Bytes(nonce.to_vec())),
        ]))
    }

    /// Signs `signed_payload` with the chain's leaf key and ships `sent_payload`
    fn signed_document(chain: &TestChain, signed_payload: &[u8], sent_payload: &[u8]) -> Vec<u8> {
        use ring::rand::SystemRandom;
        use ring::signature::{EcdsaKeyPair, ECDSA_P384_SHA384_FIXED_SIGNING};

        let rng = SystemRandom::new();
        let key =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, &chain.leaf_pkcs8, &rng)
                .unwrap();
        let to_be_signed = CoseSign1 {
            protected: protected(-35),
            payload: signed_payload.to_vec(),
            signature: vec![],
        }
        .sig_structure()
        .unwrap();
        let signature = key.sign(&rng, &to_be_signed).unwrap().as_ref().to_vec();

        cbor(&Value::Tag(
            COSE_SIGN1_TAG,
            Box::new(Value::Array(vec![
                Value::Bytes(protected(-35)),
                Value::Map(vec![]),
                Value::Bytes(sent_payload.to_vec()),
                Value::Bytes(signature),
            ])),
        ))
    }

    fn pinned(root_der: &[u8]) -> NitroVerifier {
        NitroVerifier::new(Sha256::digest(root_der).into())
    }

    #[test]
    fn test_verifies_signed_chain() {
        let chain = test_chain(false);
        let payload = chain_payload(&chain.leaf_der, &chain.root_der, b"N1");
        let raw = signed_document(&chain, &payload, &payload);

        let doc = pinned(&chain.root_der)
            .verify(&raw, SystemTime::now())
            .unwrap();
        assert_eq!(doc.nonce.as_deref(), Some(&b"N1"[..]));
        assert_eq!(doc.module_id, "i-0123-enc0123");
        assert_eq!(doc.measurements.get(0), Some(&[7u8; 48][..]));
        assert_eq!(doc.cabundle, vec![chain.root_der.clone()]);
    }

    #[test]
    fn test_tampered_payload_is_invalid_signature() {
        let chain = test_chain(false);
        let signed = chain_payload(&chain.leaf_der, &chain.root_der, b"N1");
        let sent = chain_payload(&chain.leaf_der, &chain.root_der, b"N2");
        let raw = signed_document(&chain, &signed, &sent);

        assert!(matches!(
            pinned(&chain.root_der).verify(&raw, SystemTime::now()),
            Err(EnclaveError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_expired_chain_wins_over_bad_signature() {
        let chain = test_chain(true);
        let signed = chain_payload(&chain.leaf_der, &chain.root_der, b"N1");
        let sent = chain_payload(&chain.leaf_der, &chain.root_der, b"N2");

        let raw = signed_document(&chain, &signed, &signed);
        assert!(matches!(
            pinned(&chain.root_der).verify(&raw, SystemTime::now()),
            Err(EnclaveError::ExpiredCertificate(_))
        ));

        let raw = signed_document(&chain, &signed, &sent);
        assert!(matches!(
            pinned(&chain.root_der).verify(&raw, SystemTime::now()),
            Err(EnclaveError::ExpiredCertificate(_))
        ));
    }

    #[test]
    fn test_untrusted_root_and_foreign_issuer() {
        let chain = test_chain(false);
        let payload = chain_payload(&chain.leaf_der, &chain.root_der, b"N1");
        let raw = signed_document(&chain, &payload, &payload);
        assert!(matches!(
            verifier().verify(&raw, SystemTime::now()),
            Err(EnclaveError::InvalidSignature(_))
        ));

        // Signing certificate issued by a root other than the pinned one.
        let other = test_chain(false);
        let payload = chain_payload(&chain.leaf_der, &other.root_der, b"N1");
        let raw = signed_document(&chain, &payload, &payload);
        assert!(matches!(
            pinned(&other.root_der).verify(&raw, SystemTime::now()),
            Err(EnclaveError::InvalidSignature(_))
        ));
    }
}
