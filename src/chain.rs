//! Chain Validator: builds a path from an end-entity certificate
//! through its intermediates to a locally trusted root, checking key
//! usage, extended key usage, and (when provided) an OCSP staple as
//! the authoritative revocation source for the leaf.

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};

use crate::error::ChainError;
use crate::record::ParsedCert;

/// The chain from leaf to trusted root, populated only after
/// successful path validation (data model invariant 2 depends on this
/// being re-run with the staple before any write to disk).
#[derive(Debug, Clone, Default)]
pub struct ValidatedChain {
    pub certs: Vec<ParsedCert>,
}

/// Builds a path from `end_entity` through `intermediates` to a
/// locally trusted root store. Requires key-usage `digital_signature`
/// and extended-key-usage `server_auth` ("extended-optional": missing
/// EKU is accepted, wrong EKU is rejected). If `optional_staple` is
/// provided, it is passed to the verifier as the authoritative
/// revocation source for the leaf.
pub fn validate(
    end_entity: &ParsedCert,
    intermediates: &[ParsedCert],
    optional_staple: Option<&[u8]>,
    trust_store: &RootCertStore,
) -> Result<ValidatedChain, ChainError> {
    validate_key_usage(end_entity)?;
    validate_extended_key_usage(end_entity)?;

    let leaf_der = CertificateDer::from(end_entity.der.clone());
    let intermediate_ders: Vec<CertificateDer<'_>> =
        intermediates.iter().map(|c| CertificateDer::from(c.der.clone())).collect();

    let server_name = end_entity
        .san_dns_names
        .first()
        .cloned()
        .ok_or_else(|| ChainError::InvalidCertificate("end-entity has no DNS SAN".to_string()))?;
    let server_name = ServerName::try_from(server_name)
        .map_err(|e| ChainError::InvalidCertificate(format!("invalid SAN as server name: {e}")))?;

    let config = ClientConfig::builder()
        .with_root_certificates(trust_store.clone())
        .with_no_client_auth();
    let verifier = config.verifier();
    let now = UnixTime::now();
    let ocsp_response = optional_staple.unwrap_or(&[]);

    verifier
        .verify_server_cert(&leaf_der, &intermediate_ders, &server_name, ocsp_response, now)
        .map_err(|e| classify_verify_error(&e))?;

    let mut certs = Vec::with_capacity(intermediates.len() + 1);
    certs.push(end_entity.clone());
    certs.extend(intermediates.iter().cloned());

    Ok(ValidatedChain { certs })
}

fn classify_verify_error(err: &rustls::Error) -> ChainError {
    use rustls::CertificateError as CE;
    match err {
        rustls::Error::InvalidCertificate(CE::Revoked) => {
            ChainError::Revoked("certificate revoked per stapled OCSP response".to_string())
        }
        rustls::Error::InvalidCertificate(CE::UnknownIssuer) => {
            ChainError::PathBuilding(format!("unable to build a path to a trusted root: {err}"))
        }
        rustls::Error::InvalidCertificate(_) => {
            ChainError::InvalidCertificate(format!("certificate invalid: {err}"))
        }
        _ => ChainError::PathValidation(format!("{err}")),
    }
}

fn validate_key_usage(cert: &ParsedCert) -> Result<(), ChainError> {
    if !cert.key_usage.digital_signature {
        return Err(ChainError::InvalidCertificate(
            "end-entity is missing the digitalSignature key usage".to_string(),
        ));
    }
    Ok(())
}

/// `server_auth` is extended-optional: an absent EKU extension is
/// accepted, but a present one that omits `server_auth` is rejected.
fn validate_extended_key_usage(cert: &ParsedCert) -> Result<(), ChainError> {
    if cert.extended_key_usage.is_empty() {
        return Ok(());
    }
    if cert.extended_key_usage.iter().any(|eku| eku == "server_auth") {
        return Ok(());
    }
    Err(ChainError::InvalidCertificate(
        "end-entity's extended key usage does not include server_auth".to_string(),
    ))
}
