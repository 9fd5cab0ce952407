//! Attestation documents and cross-attestation checks
//!
//! ```text
//!   local NSM ──► raw doc ──► verify ──► MeasurementSet (local) ─┐
//!                                                               ├─► compare + freshness
//!   peer/NSM ──► raw doc ──► verify ──► MeasurementSet (remote) ─┘
//! ```
//!
//! Verification itself lives behind [`DocumentVerifier`]; the production
//! implementation is [`crate::nitro::NitroVerifier`].

use crate::enclave::{AttestationSource, DocumentRequest};
use crate::error::{EnclaveError, Result};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tracing::{error, info, warn};

/// Largest nonce, user data, or public key a document may carry
pub const MAX_BOUND_FIELD_LEN: usize = 1024;

/// Platform configuration register values, keyed by register index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementSet(BTreeMap<usize, Vec<u8>>);

impl MeasurementSet {
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.0.get(&index).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.0.iter().map(|(i, v)| (*i, v.as_slice()))
    }

    /// Indices whose values differ or that only one side has
    pub fn differing_indices(&self, other: &MeasurementSet) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .0
            .keys()
            .chain(other.0.keys())
            .copied()
            .filter(|i| self.0.get(i) != other.0.get(i))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Hex rendering for logs
    pub fn to_hex_map(&self) -> BTreeMap<usize, String> {
        self.0.iter().map(|(i, v)| (*i, hex::encode(v))).collect()
    }
}

impl From<BTreeMap<usize, Vec<u8>>> for MeasurementSet {
    fn from(map: BTreeMap<usize, Vec<u8>>) -> Self {
        Self(map)
    }
}

impl FromIterator<(usize, Vec<u8>)> for MeasurementSet {
    fn from_iter<I: IntoIterator<Item = (usize, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A decoded, verified attestation document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationDocument {
    pub module_id: String,
    pub digest: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub measurements: MeasurementSet,
    pub certificate: Vec<u8>,
    pub cabundle: Vec<Vec<u8>>,
    pub public_key: Option<Vec<u8>>,
    pub user_data: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
}

impl AttestationDocument {
    /// JSON summary for logging; certificates are reduced to their sizes
    pub fn summary(&self) -> serde_json::Value {
        json!({
            "module_id": self.module_id,
            "digest": self.digest,
            "timestamp": self.timestamp,
            "pcrs": self.measurements.to_hex_map(),
            "nonce": self.nonce.as_ref().map(hex::encode),
            "user_data": self.user_data.as_ref().map(hex::encode),
            "public_key": self.public_key.as_ref().map(hex::encode),
            "certificate_len": self.certificate.len(),
            "cabundle_len": self.cabundle.len(),
        })
    }
}

/// Authenticates a raw document and decodes it
pub trait DocumentVerifier: Send + Sync {
    /// Verifies `raw` against the trusted root at time `now`.
    ///
    /// Expired or not-yet-valid certificates are reported as
    /// `ExpiredCertificate` even when signatures would also fail.
    fn verify(&self, raw: &[u8], now: SystemTime) -> Result<AttestationDocument>;
}

/// True iff both sets have the same indices with byte-equal values
pub fn compare_measurements(a: &MeasurementSet, b: &MeasurementSet) -> bool {
    a.0.len() == b.0.len() && a.0.iter().all(|(i, v)| b.0.get(i) == Some(v))
}

/// True iff the document carries exactly `expected_nonce`
///
/// A document without a nonce is never fresh.
pub fn check_freshness(document: &AttestationDocument, expected_nonce: &[u8]) -> bool {
    document.nonce.as_deref() == Some(expected_nonce)
}

/// Random nonce from the system CSPRNG
pub fn generate_nonce(len: usize) -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; len];
    SystemRandom::new().fill(&mut nonce).map_err(|_| {
        EnclaveError::AttestationRequestFailed("Failed to generate nonce".to_string())
    })?;
    Ok(nonce)
}

/// Most recently verified local measurements, shared across tasks
#[derive(Debug, Clone, Default)]
pub struct MeasurementCache {
    inner: Arc<RwLock<Option<Arc<MeasurementSet>>>>,
}

impl MeasurementCache {
    pub fn get(&self) -> Option<Arc<MeasurementSet>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn store(&self, measurements: MeasurementSet) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(measurements));
    }
}

/// Result of a cross-attestation check
#[derive(Debug)]
pub enum CrossCheckOutcome {
    /// Both documents verified, the remote one is fresh and the measurements match
    Trusted { measurements: MeasurementSet },
    /// The local document could not be obtained or verified
    LocalFailed(EnclaveError),
    /// The remote document did not verify
    RemoteFailed(EnclaveError),
    /// The remote document is authentic but not bound to the expected nonce
    NonceMismatch,
    /// Both documents are authentic but measure different software
    MeasurementMismatch { differing: Vec<usize> },
}

impl CrossCheckOutcome {
    pub fn is_trusted(&self) -> bool {
        matches!(self, CrossCheckOutcome::Trusted { .. })
    }
}

/// What the startup self-attestation concluded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupAttestation {
    Verified,
    /// No attestation interface (not running in an enclave)
    Skipped,
    Failed,
}

/// Requests, verifies and compares attestation documents
pub struct Attestor<S, V> {
    source: S,
    verifier: V,
    cache: MeasurementCache,
}

impl<S: AttestationSource, V: DocumentVerifier> Attestor<S, V> {
    pub fn new(source: S, verifier: V) -> Self {
        Self::with_cache(source, verifier, MeasurementCache::default())
    }

    /// Attestor publishing verified local measurements into `cache`
    pub fn with_cache(source: S, verifier: V, cache: MeasurementCache) -> Self {
        Self {
            source,
            verifier,
            cache,
        }
    }

    pub fn cache(&self) -> &MeasurementCache {
        &self.cache
    }

    /// Requests a raw document from the local attestation source
    pub fn request_document(&self, request: &DocumentRequest) -> Result<Vec<u8>> {
        self.source.request_document(request)
    }

    /// Requests a local document bound to `nonce`, verifies it, and caches
    /// its measurements
    pub fn request_and_verify_local(&self, nonce: &[u8]) -> Result<MeasurementSet> {
        let raw = self.source.request_document(&DocumentRequest::with_nonce(nonce))?;
        let document = self.verifier.verify(&raw, SystemTime::now())?;
        if !check_freshness(&document, nonce) {
            return Err(EnclaveError::MalformedDocument(
                "local document is not bound to the requested nonce".to_string(),
            ));
        }
        info!(document = %document.summary(), "Verified local attestation document");
        self.cache.store(document.measurements.clone());
        Ok(document.measurements)
    }

    /// Verifies a document obtained elsewhere and reports whether it carries
    /// `expected_nonce`
    pub fn verify_remote(
        &self,
        raw: &[u8],
        expected_nonce: &[u8],
        now: SystemTime,
    ) -> Result<(MeasurementSet, bool)> {
        let document = self.verifier.verify(raw, now)?;
        let fresh = check_freshness(&document, expected_nonce);
        Ok((document.measurements, fresh))
    }

    /// Verifies the local enclave and a remote document and decides whether
    /// the remote side runs the same measured software
    pub fn cross_check(
        &self,
        local_nonce: &[u8],
        remote_document: &[u8],
        remote_nonce: &[u8],
        now: SystemTime,
    ) -> CrossCheckOutcome {
        let local = match self.request_and_verify_local(local_nonce) {
            Ok(measurements) => measurements,
            Err(e) => return CrossCheckOutcome::LocalFailed(e),
        };

        let (remote, fresh) = match self.verify_remote(remote_document, remote_nonce, now) {
            Ok(result) => result,
            Err(e) => return CrossCheckOutcome::RemoteFailed(e),
        };

        if !fresh {
            return CrossCheckOutcome::NonceMismatch;
        }

        if !compare_measurements(&local, &remote) {
            return CrossCheckOutcome::MeasurementMismatch {
                differing: local.differing_indices(&remote),
            };
        }

        CrossCheckOutcome::Trusted {
            measurements: local,
        }
    }

    /// Cross-checks this enclave against a second document from its own
    /// attestation source
    pub fn self_check(&self, nonce_len: usize) -> Result<CrossCheckOutcome> {
        let local_nonce = generate_nonce(nonce_len)?;
        let remote_nonce = generate_nonce(nonce_len)?;
        let remote = match self.request_document(&DocumentRequest::with_nonce(&remote_nonce)) {
            Ok(raw) => raw,
            Err(e) => return Ok(CrossCheckOutcome::RemoteFailed(e)),
        };

        let outcome = self.cross_check(&local_nonce, &remote, &remote_nonce, SystemTime::now());
        match &outcome {
            CrossCheckOutcome::Trusted { measurements } => {
                info!(pcrs = ?measurements.to_hex_map(), "Cross-attestation succeeded")
            }
            CrossCheckOutcome::MeasurementMismatch { differing } => {
                warn!(differing = ?differing, "Attestation measurements differ")
            }
            other => warn!(outcome = ?other, "Cross-attestation failed"),
        }
        Ok(outcome)
    }

    /// Runs [`Self::self_check`] once. Failures are logged and reported but
    /// never returned as errors; networking does not depend on them.
    pub fn startup_check(&self, nonce_len: usize) -> StartupAttestation {
        match self.self_check(nonce_len) {
            Ok(CrossCheckOutcome::Trusted { .. }) => StartupAttestation::Verified,
            Ok(CrossCheckOutcome::LocalFailed(EnclaveError::AttestationUnavailable(reason)))
            | Ok(CrossCheckOutcome::RemoteFailed(EnclaveError::AttestationUnavailable(reason))) => {
                warn!(reason = %reason, "Attestation unavailable, skipping self-attestation");
                StartupAttestation::Skipped
            }
            Ok(outcome) => {
                error!(outcome = ?outcome, "Self-attestation failed, continuing without it");
                StartupAttestation::Failed
            }
            Err(e) => {
                error!(error = %e, "Self-attestation failed, continuing without it");
                StartupAttestation::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};

    /// Test document: a JSON body with a fake validity window and signature
    #[derive(Serialize, Deserialize)]
    struct FakeDoc {
        pcrs: BTreeMap<usize, Vec<u8>>,
        nonce: Option<Vec<u8>>,
        not_after: u64,
        signature_ok: bool,
    }

    struct FakeVerifier;

    impl DocumentVerifier for FakeVerifier {
        fn verify(&self, raw: &[u8], now: SystemTime) -> Result<AttestationDocument> {
            let doc: FakeDoc = serde_json::from_slice(raw)
                .map_err(|e| EnclaveError::MalformedDocument(e.to_string()))?;
            let now = now.duration_since(UNIX_EPOCH).unwrap().as_secs();
            if now > doc.not_after {
                return Err(EnclaveError::ExpiredCertificate("leaf expired".to_string()));
            }
            if !doc.signature_ok {
                return Err(EnclaveError::InvalidSignature("bad signature".to_string()));
            }
            Ok(AttestationDocument {
                module_id: "i-test-enc".to_string(),
                digest: "SHA384".to_string(),
                timestamp: now * 1000,
                measurements: doc.pcrs.into(),
                certificate: vec![1],
                cabundle: vec![vec![2]],
                public_key: None,
                user_data: None,
                nonce: doc.nonce,
            })
        }
    }

    /// Source that binds the requested nonce into documents with fixed PCRs
    struct FakeSource {
        pcrs: BTreeMap<usize, Vec<u8>>,
        requests: Mutex<Vec<DocumentRequest>>,
        available: bool,
    }

    impl FakeSource {
        fn new(pcrs: BTreeMap<usize, Vec<u8>>) -> Self {
            Self {
                pcrs,
                requests: Mutex::new(Vec::new()),
                available: true,
            }
        }
    }

    impl AttestationSource for FakeSource {
        fn request_document(&self, request: &DocumentRequest) -> Result<Vec<u8>> {
            if !self.available {
                return Err(EnclaveError::AttestationUnavailable("no NSM".to_string()));
            }
            self.requests.lock().unwrap().push(request.clone());
            Ok(fake_doc(self.pcrs.clone(), request.nonce.as_deref(), far_future(), true))
        }
    }

    fn far_future() -> u64 {
        (SystemTime::now() + Duration::from_secs(3600))
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn fake_doc(
        pcrs: BTreeMap<usize, Vec<u8>>,
        nonce: Option<&[u8]>,
        not_after: u64,
        signature_ok: bool,
    ) -> Vec<u8> {
        serde_json::to_vec(&FakeDoc {
            pcrs,
            nonce: nonce.map(<[u8]>::to_vec),
            not_after,
            signature_ok,
        })
        .unwrap()
    }

    fn pcrs(seed: u8) -> BTreeMap<usize, Vec<u8>> {
        (0..3).map(|i| (i, vec![seed + i as u8; 48])).collect()
    }

    fn set(seed: u8) -> MeasurementSet {
        pcrs(seed).into()
    }

    #[test]
    fn test_compare_is_reflexive_and_symmetric() {
        let a = set(1);
        let b = set(1);
        let c = set(2);
        assert!(compare_measurements(&a, &a));
        assert!(compare_measurements(&a, &b) && compare_measurements(&b, &a));
        assert!(!compare_measurements(&a, &c) && !compare_measurements(&c, &a));
        assert!(compare_measurements(&MeasurementSet::default(), &MeasurementSet::default()));
    }

    #[test]
    fn test_single_byte_difference() {
        let a = set(1);
        let mut map = pcrs(1);
        map.get_mut(&2).unwrap()[47] ^= 0x01;
        let b = MeasurementSet::from(map);
        assert!(!compare_measurements(&a, &b));
        assert_eq!(a.differing_indices(&b), vec![2]);
    }

    #[test]
    fn test_length_and_index_differences() {
        let a = set(1);
        let mut map = pcrs(1);
        map.get_mut(&0).unwrap().truncate(32);
        assert!(!compare_measurements(&a, &map.into()));

        let mut map = pcrs(1);
        map.remove(&1);
        let fewer = MeasurementSet::from(map);
        assert!(!compare_measurements(&a, &fewer));
        assert!(!compare_measurements(&fewer, &a));
        assert_eq!(a.differing_indices(&fewer), vec![1]);
    }

    #[test]
    fn test_freshness_requires_exact_nonce() {
        let verifier = FakeVerifier;
        let doc1 = verifier
            .verify(&fake_doc(pcrs(1), Some(b"N1"), far_future(), true), SystemTime::now())
            .unwrap();
        let doc2 = verifier
            .verify(&fake_doc(pcrs(1), Some(b"N2"), far_future(), true), SystemTime::now())
            .unwrap();

        assert!(compare_measurements(&doc1.measurements, &doc2.measurements));
        assert!(check_freshness(&doc1, b"N1"));
        assert!(!check_freshness(&doc1, b"N2"));
        assert!(!check_freshness(&doc1, b"N"));

        let unbound = verifier
            .verify(&fake_doc(pcrs(1), None, far_future(), true), SystemTime::now())
            .unwrap();
        assert!(!check_freshness(&unbound, b""));
    }

    #[test]
    fn test_expired_chain_is_not_reported_as_invalid_signature() {
        let attestor = Attestor::new(FakeSource::new(pcrs(1)), FakeVerifier);
        let raw = fake_doc(pcrs(1), Some(b"N1"), 1_000, false);
        let err = attestor.verify_remote(&raw, b"N1", SystemTime::now()).unwrap_err();
        assert!(matches!(err, EnclaveError::ExpiredCertificate(_)));
    }

    #[test]
    fn test_local_verification_fills_cache() {
        let source = FakeSource::new(pcrs(1));
        let attestor = Attestor::new(source, FakeVerifier);
        assert!(attestor.cache().get().is_none());

        let measurements = attestor.request_and_verify_local(b"N1").unwrap();
        assert_eq!(measurements, set(1));
        assert_eq!(*attestor.cache().get().unwrap(), set(1));

        let requests = attestor.source.requests.lock().unwrap();
        assert_eq!(requests[0], DocumentRequest::with_nonce(b"N1"));
    }

    #[test]
    fn test_cross_check_outcomes() {
        let attestor = Attestor::new(FakeSource::new(pcrs(1)), FakeVerifier);
        let now = SystemTime::now();

        let remote = fake_doc(pcrs(1), Some(b"R"), far_future(), true);
        assert!(attestor.cross_check(b"L", &remote, b"R", now).is_trusted());

        let forged = fake_doc(pcrs(1), Some(b"R"), far_future(), false);
        assert!(matches!(
            attestor.cross_check(b"L", &forged, b"R", now),
            CrossCheckOutcome::RemoteFailed(EnclaveError::InvalidSignature(_))
        ));

        assert!(matches!(
            attestor.cross_check(b"L", &remote, b"other", now),
            CrossCheckOutcome::NonceMismatch
        ));

        let different = fake_doc(pcrs(7), Some(b"R"), far_future(), true);
        match attestor.cross_check(b"L", &different, b"R", now) {
            CrossCheckOutcome::MeasurementMismatch { differing } => {
                assert_eq!(differing, vec![0, 1, 2])
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_cross_check_without_local_attestation() {
        let mut source = FakeSource::new(pcrs(1));
        source.available = false;
        let attestor = Attestor::new(source, FakeVerifier);
        let remote = fake_doc(pcrs(1), Some(b"R"), far_future(), true);
        assert!(matches!(
            attestor.cross_check(b"L", &remote, b"R", SystemTime::now()),
            CrossCheckOutcome::LocalFailed(EnclaveError::AttestationUnavailable(_))
        ));
    }

    #[test]
    fn test_self_check_uses_distinct_nonces() {
        let attestor = Attestor::new(FakeSource::new(pcrs(3)), FakeVerifier);
        let outcome = attestor.self_check(32).unwrap();
        assert!(outcome.is_trusted());

        let requests = attestor.source.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].nonce, requests[1].nonce);
        assert_eq!(requests[0].nonce.as_ref().map(Vec::len), Some(32));
    }

    #[test]
    fn test_generate_nonce() {
        let a = generate_nonce(32).unwrap();
        let b = generate_nonce(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_summary_hex_encodes_fields() {
        let doc = FakeVerifier
            .verify(&fake_doc(pcrs(1), Some(b"N1"), far_future(), true), SystemTime::now())
            .unwrap();
        let summary = doc.summary();
        assert_eq!(summary["nonce"], "4e31");
        assert_eq!(summary["digest"], "SHA384");
        assert_eq!(summary["pcrs"]["0"].as_str().unwrap().len(), 96);
    }

    #[test]
    fn test_startup_check_is_never_fatal() {
        let cache = MeasurementCache::default();
        let attestor = Attestor::with_cache(FakeSource::new(pcrs(4)), FakeVerifier, cache.clone());
        assert_eq!(attestor.startup_check(32), StartupAttestation::Verified);
        assert_eq!(*cache.get().unwrap(), set(4));

        let mut source = FakeSource::new(pcrs(4));
        source.available = false;
        let attestor = Attestor::new(source, FakeVerifier);
        assert_eq!(attestor.startup_check(32), StartupAttestation::Skipped);

        let attestor = Attestor::new(FakeSource::new(pcrs(4)), ExpiredVerifier);
        assert_eq!(attestor.startup_check(32), StartupAttestation::Failed);
        assert!(attestor.cache().get().is_none());
    }

    /// Every certificate has expired
    struct ExpiredVerifier;

    impl DocumentVerifier for ExpiredVerifier {
        fn verify(&self, _raw: &[u8], _now: SystemTime) -> Result<AttestationDocument> {
            Err(EnclaveError::ExpiredCertificate("leaf expired".to_string()))
        }
    }
}
