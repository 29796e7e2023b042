//! OCSP request/response DER plumbing shared by the acquirer.
//!
//! The request built here never carries a nonce extension: most
//! responders (and Let's Encrypt in particular) serve pre-signed
//! responses, so a nonce buys nothing and some responders mishandle
//! it.

pub mod acquirer;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode};
use ring::digest::{Context as DigestContext, SHA256};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_ocsp::{
    BasicOcspResponse, CertId, CertStatus, OcspRequest, OcspResponse, OcspResponseStatus, Request,
    TbsRequest, Version,
};

use crate::record::ParsedCert;

const OID_SHA256: &str = "2.16.840.1.101.3.4.2.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

pub struct ParsedResponse {
    pub status: OcspStatus,
    pub der: Vec<u8>,
    pub next_update: Option<DateTime<Utc>>,
}

/// Builds an OCSP request DER for `(leaf, issuer)` with no nonce.
pub fn build_request_der(leaf: &ParsedCert, issuer: &ParsedCert) -> Result<Vec<u8>> {
    let mut hasher = DigestContext::new(&SHA256);
    hasher.update(&issuer.subject_der);
    let issuer_name_hash = hasher.finish();

    let mut hasher = DigestContext::new(&SHA256);
    hasher.update(&issuer.public_key_der);
    let issuer_key_hash = hasher.finish();

    let serial = SerialNumber::new(&leaf.serial_number).context("invalid certificate serial number")?;

    let cert_id = CertId {
        hash_algorithm: AlgorithmIdentifierOwned {
            oid: ObjectIdentifier::new_unwrap(OID_SHA256),
            parameters: None,
        },
        issuer_name_hash: OctetString::new(issuer_name_hash.as_ref().to_vec())
            .context("encoding issuer name hash")?,
        issuer_key_hash: OctetString::new(issuer_key_hash.as_ref().to_vec())
            .context("encoding issuer key hash")?,
        serial_number: serial,
    };

    let tbs_request = TbsRequest {
        version: Version::V1,
        requestor_name: None,
        request_list: vec![Request {
            req_cert: cert_id,
            single_request_extensions: None,
        }],
        request_extensions: None,
    };

    let request = OcspRequest {
        tbs_request,
        optional_signature: None,
    };

    request.to_der().context("encoding ocsp request")
}

/// Decodes an OCSP response, locating the single response for
/// `cert_serial` and classifying its `certStatus`.
pub fn parse_response_der(bytes: &[u8], cert_serial: &[u8]) -> Result<ParsedResponse> {
    let response = OcspResponse::from_der(bytes).context("decoding ocsp response")?;

    if response.response_status != OcspResponseStatus::Successful {
        return Err(anyhow!("ocsp response status: {:?}", response.response_status));
    }

    let response_bytes = response
        .response_bytes
        .as_ref()
        .ok_or_else(|| anyhow!("ocsp response has no response bytes"))?;

    let basic = BasicOcspResponse::from_der(response_bytes.response.as_bytes())
        .context("decoding basic ocsp response")?;

    let single = basic
        .tbs_response_data
        .responses
        .iter()
        .find(|resp| resp.cert_id.serial_number.as_bytes() == cert_serial)
        .ok_or_else(|| anyhow!("certificate not present in ocsp response"))?;

    let status = match &single.cert_status {
        CertStatus::Good(_) => OcspStatus::Good,
        CertStatus::Revoked(_) => OcspStatus::Revoked,
        CertStatus::Unknown(_) => OcspStatus::Unknown,
    };

    let next_update = single.next_update.as_ref().and_then(|t| {
        let unix = t.0.to_unix_duration().as_secs();
        DateTime::from_timestamp(unix as i64, 0)
    });

    Ok(ParsedResponse {
        status,
        der: bytes.to_vec(),
        next_update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_response_is_rejected() {
        let err = parse_response_der(&[0x01, 0x02, 0x03], &[0xAA]).unwrap_err();
        assert!(err.to_string().contains("decoding ocsp response"));
    }
}
