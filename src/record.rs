//! Certificate Record: per-file entity holding parsed material, OCSP
//! state, and identity (path + content hash).

use chrono::{DateTime, Utc};
use der::Decode;
use ring::digest::{Context as DigestContext, SHA256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{AuthorityInfoAccessSyntax, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAltName};
use x509_cert::Certificate as X509Certificate;

use crate::chain::{self, ValidatedChain};
use crate::error::RecordError;

const OID_OCSP_ACCESS_METHOD: &str = "1.3.6.1.5.5.7.48.1";
const OID_EKU_SERVER_AUTH: &str = "1.3.6.1.5.5.7.3.1";

/// Identity of a Certificate Record: `(absolute_path, content_hash)`.
/// For any file path, at most one record exists in the system at any
/// time (data model invariant 4) — callers key their record table by
/// `path` alone and use `content_hash` to detect a file that changed
/// underneath them between watch events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub path: PathBuf,
    pub content_hash: [u8; 32],
}

impl RecordId {
    /// Stable string identity used as the scheduler's dedup key. Stable
    /// for the lifetime of the record: it does not change across
    /// re-parses that leave the file content untouched.
    pub fn identity(&self) -> String {
        format!("{}#{}", self.path.display(), hex::encode(self.content_hash))
    }
}

/// Flags extracted from the KeyUsage extension that the validator and
/// the record's own eligibility check care about.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyUsageFlags {
    pub digital_signature: bool,
    pub key_cert_sign: bool,
    pub crl_sign: bool,
}

/// A single parsed certificate, leaf or intermediate.
#[derive(Debug, Clone)]
pub struct ParsedCert {
    pub der: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    pub san_dns_names: Vec<String>,
    pub is_ca: bool,
    pub key_usage: KeyUsageFlags,
    pub extended_key_usage: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: Vec<u8>,
    pub ocsp_urls: Vec<String>,
    pub subject_der: Vec<u8>,
    pub public_key_der: Vec<u8>,
}

impl ParsedCert {
    /// Parses one DER-encoded certificate into its relevant fields.
    /// Exposed beyond this module so tests can build a `ParsedCert`
    /// from freshly generated certificates without reimplementing this
    /// extraction logic.
    pub fn from_der(der_bytes: &[u8]) -> Result<Self, RecordError> {
        let cert = X509Certificate::from_der(der_bytes).map_err(|e| RecordError::Malformed {
            path: PathBuf::new(),
            reason: format!("X.509 parse failed: {e}"),
        })?;

        let tbs = &cert.tbs_certificate;
        let subject = tbs.subject.to_string();
        let issuer = tbs.issuer.to_string();
        let not_before = tbs.validity.not_before.to_system_time().into();
        let not_after = tbs.validity.not_after.to_system_time().into();
        let serial_number = tbs.serial_number.as_bytes().to_vec();

        use der::Encode;
        let subject_der = tbs
            .subject
            .to_der()
            .map_err(|e| RecordError::Malformed { path: PathBuf::new(), reason: e.to_string() })?;
        let public_key_der = tbs
            .subject_public_key_info
            .to_der()
            .map_err(|e| RecordError::Malformed { path: PathBuf::new(), reason: e.to_string() })?;

        let mut san_dns_names = Vec::new();
        let mut is_ca = false;
        let mut key_usage = KeyUsageFlags::default();
        let mut extended_key_usage = Vec::new();
        let mut ocsp_urls = Vec::new();

        if let Some(extensions) = &tbs.extensions {
            for ext in extensions {
                let oid = ext.extn_id.to_string();
                match oid.as_str() {
                    "2.5.29.17" => {
                        if let Ok(san) = SubjectAltName::from_der(ext.extn_value.as_bytes()) {
                            for name in &san.0 {
                                if let GeneralName::DnsName(dns) = name {
                                    san_dns_names.push(dns.to_string());
                                }
                            }
                        }
                    }
                    "2.5.29.19" => {
                        if let Ok(bc) = BasicConstraints::from_der(ext.extn_value.as_bytes()) {
                            is_ca = bc.ca;
                        }
                    }
                    "2.5.29.15" => {
                        if let Ok(ku) = KeyUsage::from_der(ext.extn_value.as_bytes()) {
                            key_usage.digital_signature = ku.digital_signature();
                            key_usage.key_cert_sign = ku.key_cert_sign();
                            key_usage.crl_sign = ku.crl_sign();
                        }
                    }
                    "2.5.29.37" => {
                        if let Ok(eku) = ExtendedKeyUsage::from_der(ext.extn_value.as_bytes()) {
                            for purpose in &eku.0 {
                                if purpose.to_string() == OID_EKU_SERVER_AUTH {
                                    extended_key_usage.push("server_auth".to_string());
                                } else {
                                    extended_key_usage.push(purpose.to_string());
                                }
                            }
                        }
                    }
                    "1.3.6.1.5.5.7.1.1" => {
                        if let Ok(aia) = AuthorityInfoAccessSyntax::from_der(ext.extn_value.as_bytes()) {
                            for access_desc in &aia.0 {
                                if access_desc.access_method.to_string() == OID_OCSP_ACCESS_METHOD {
                                    if let GeneralName::UniformResourceIdentifier(uri) =
                                        &access_desc.access_location
                                    {
                                        ocsp_urls.push(uri.to_string());
                                    }
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(ParsedCert {
            der: der_bytes.to_vec(),
            subject,
            issuer,
            san_dns_names,
            is_ca,
            key_usage,
            extended_key_usage,
            not_before,
            not_after,
            serial_number,
            ocsp_urls,
            subject_der,
            public_key_der,
        })
    }
}

/// Per-file entity holding parsed material, OCSP state, and identity.
/// See the data model invariants: eligibility (1), write-after-validate
/// (2), future-only scheduled expiry (3), one record per path (4).
pub struct CertRecord {
    pub id: RecordId,
    pub modtime: SystemTime,
    pub end_entity: Option<ParsedCert>,
    pub intermediates: Vec<ParsedCert>,
    pub validated_chain: ValidatedChain,
    pub ocsp_urls: Vec<String>,
    pub ocsp_request_der: Option<Vec<u8>>,
    pub ocsp_staple_der: Option<Vec<u8>>,
    pub staple_valid_until: Option<DateTime<Utc>>,
}

impl CertRecord {
    /// Construct a record for a not-yet-parsed file. `content_hash`
    /// must already have been computed by the caller via `hash_file`.
    pub fn new(path: PathBuf, content_hash: [u8; 32], modtime: SystemTime) -> Self {
        Self {
            id: RecordId { path, content_hash },
            modtime,
            end_entity: None,
            intermediates: Vec::new(),
            validated_chain: ValidatedChain::default(),
            ocsp_urls: Vec::new(),
            ocsp_request_der: None,
            ocsp_staple_der: None,
            staple_valid_until: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.id.path
    }

    /// Reads the file and returns a content digest. Deterministic for
    /// identical bytes.
    pub fn hash_file(path: &Path) -> Result<[u8; 32], RecordError> {
        let bytes = fs::read(path).map_err(|source| RecordError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut ctx = DigestContext::new(&SHA256);
        ctx.update(&bytes);
        let digest = ctx.finish();
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        Ok(out)
    }

    /// Reads the PEM-armoured file, splits into blocks, decodes each
    /// `CERTIFICATE` block, classifies each as CA (intermediate) or
    /// end-entity by the BasicConstraints `cA` bit, stores them in the
    /// record, extracts AIA OCSP URLs from the end-entity, then runs
    /// path validation. Idempotent: a second call replaces prior
    /// parsed state.
    pub fn parse_chain(&mut self, trust_store: &rustls::RootCertStore) -> Result<(), RecordError> {
        let path = self.id.path.clone();
        let pem_bytes = fs::read(&path).map_err(|source| RecordError::Io { path: path.clone(), source })?;

        let mut reader = std::io::BufReader::new(pem_bytes.as_slice());
        let mut end_entity: Option<ParsedCert> = None;
        let mut intermediates = Vec::new();

        for der in rustls_pemfile::certs(&mut reader) {
            let der = der.map_err(|e| RecordError::Malformed {
                path: path.clone(),
                reason: format!("PEM decode failed: {e}"),
            })?;
            let parsed = ParsedCert::from_der(der.as_ref())?;
            if parsed.is_ca {
                intermediates.push(parsed);
            } else if end_entity.is_none() {
                end_entity = Some(parsed);
            } else {
                // A second non-CA block: treat as malformed input rather
                // than silently discarding material a caller may expect
                // to be part of the chain.
                return Err(RecordError::Malformed {
                    path: path.clone(),
                    reason: "more than one end-entity certificate block found".to_string(),
                });
            }
        }

        let end_entity = end_entity.ok_or_else(|| RecordError::NoEndEntity(path.clone()))?;
        if intermediates.is_empty() {
            return Err(RecordError::NoIntermediates(path.clone()));
        }

        let ocsp_urls = end_entity.ocsp_urls.clone();

        let validated = chain::validate(&end_entity, &intermediates, None, trust_store)?;

        self.modtime = fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        self.end_entity = Some(end_entity);
        self.intermediates = intermediates;
        self.validated_chain = validated;
        self.ocsp_urls = ocsp_urls;
        // A fresh parse invalidates any request built against the old
        // material; the acquirer rebuilds it on next use.
        self.ocsp_request_der = None;

        Ok(())
    }

    /// A record is eligible for staple acquisition only when
    /// `end_entity` is set, `validated_chain` is non-empty, and
    /// `ocsp_urls` is non-empty (data model invariant 1).
    pub fn is_eligible(&self) -> bool {
        self.end_entity.is_some() && !self.validated_chain.certs.is_empty() && !self.ocsp_urls.is_empty()
    }

    /// The certificate among `intermediates` whose subject equals the
    /// leaf's issuer, found by search rather than by a positional index
    /// into the validated chain (Open Question resolution).
    pub fn issuer(&self) -> Option<&ParsedCert> {
        let leaf = self.end_entity.as_ref()?;
        self.intermediates.iter().find(|c| c.subject == leaf.issuer)
    }

    /// Builds an OCSP request for the pair `(end_entity, issuer)`. The
    /// request never includes a nonce. Requires the record to be
    /// eligible; otherwise fails with a precondition error. Reuses a
    /// previously built request across URL fallbacks within one
    /// acquisition attempt.
    pub fn build_request(&mut self) -> Result<&[u8], RecordError> {
        if !self.is_eligible() {
            return Err(RecordError::Precondition(format!(
                "record {} is not eligible for staple acquisition",
                self.id.identity()
            )));
        }
        if self.ocsp_request_der.is_none() {
            let leaf = self.end_entity.as_ref().expect("checked eligible");
            let issuer = self.issuer().ok_or_else(|| {
                RecordError::Precondition(format!(
                    "no intermediate matches issuer \"{}\" for {}",
                    leaf.issuer,
                    self.id.identity()
                ))
            })?;
            let der = crate::ocsp::build_request_der(leaf, issuer)
                .map_err(|e| RecordError::Malformed { path: self.id.path.clone(), reason: e.to_string() })?;
            self.ocsp_request_der = Some(der);
        }
        Ok(self.ocsp_request_der.as_deref().expect("just set"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_file_is_deterministic() {
        let mut f1 = tempfile::NamedTempFile::new().unwrap();
        f1.write_all(b"hello world").unwrap();
        let mut f2 = tempfile::NamedTempFile::new().unwrap();
        f2.write_all(b"hello world").unwrap();

        let h1 = CertRecord::hash_file(f1.path()).unwrap();
        let h2 = CertRecord::hash_file(f2.path()).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_file_missing_is_io_error() {
        let path = PathBuf::from("/nonexistent/path/to/a/cert.pem");
        let err = CertRecord::hash_file(&path).unwrap_err();
        assert!(matches!(err, RecordError::Io { .. }));
    }

    #[test]
    fn identity_is_stable_for_same_path_and_hash() {
        let id_a = RecordId { path: PathBuf::from("/a/b.pem"), content_hash: [1u8; 32] };
        let id_b = RecordId { path: PathBuf::from("/a/b.pem"), content_hash: [1u8; 32] };
        assert_eq!(id_a.identity(), id_b.identity());
    }

    #[test]
    fn not_eligible_before_parse() {
        let record = CertRecord::new(PathBuf::from("/a/b.pem"), [0u8; 32], SystemTime::now());
        assert!(!record.is_eligible());
    }
}
