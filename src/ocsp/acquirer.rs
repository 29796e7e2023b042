//! Staple Acquirer: given a record, builds an OCSP request, iterates
//! responder URLs with bounded retry, validates the response against
//! the chain, and persists on success.
//!
//! State machine per acquisition attempt: `Building -> Sending ->
//! (NetworkFail | Empty | Revoked | Good | Unknown) -> (Retry | NextUrl
//! | Fail | Validated -> Persisted)`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use tokio::time::timeout as tokio_timeout;
use tracing::{info, warn};
use url::Url;

use crate::chain;
use crate::config::AcquirerConfig;
use crate::error::{AcquireError, ChainError, RecordError};
use crate::ocsp::{self, OcspStatus};
use crate::record::CertRecord;

/// `acquire(record) -> ok | OcspRenewError`. Never leaves bytes on
/// disk unless a staple was validated immediately before the write
/// (data model invariant 2 / testable property 4).
pub async fn acquire(
    record: &mut CertRecord,
    config: &AcquirerConfig,
    client: &Client,
    trust_store: &rustls::RootCertStore,
) -> Result<(), AcquireError> {
    if !record.is_eligible() {
        return Err(AcquireError::Chain(ChainError::InvalidCertificate(
            "record is not eligible for staple acquisition".to_string(),
        )));
    }

    record.build_request()?;
    let leaf_serial = record
        .end_entity
        .as_ref()
        .expect("checked eligible above")
        .serial_number
        .clone();
    let request_der = record
        .ocsp_request_der
        .clone()
        .expect("build_request populates this field");

    let urls = record.ocsp_urls.clone();

    for url in &urls {
        let mut retry = config.retry_max;
        let mut attempt = 0u32;

        while retry > 0 {
            attempt += 1;

            match post_request(client, url, &request_der).await {
                Ok(body) if body.is_empty() => {
                    // Empty is interpreted as deterministic misbehavior:
                    // terminal for the whole call, no further retries or
                    // URL fallback (testable property 6).
                    return Err(AcquireError::Empty);
                }
                Ok(body) => match ocsp::parse_response_der(&body, &leaf_serial) {
                    Ok(parsed) => match parsed.status {
                        OcspStatus::Good => {
                            return finish_good(record, parsed, trust_store, url, attempt).await;
                        }
                        OcspStatus::Revoked => {
                            // Terminal for this record: no more retries,
                            // no further URLs (testable property 5).
                            return Err(AcquireError::Revoked);
                        }
                        OcspStatus::Unknown => {
                            info!(url = %url, attempt, "ocsp responder returned status unknown");
                        }
                    },
                    Err(e) => {
                        warn!(url = %url, attempt, error = %e, "malformed ocsp response body");
                    }
                },
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "ocsp request failed");
                }
            }

            retry -= 1;
            if retry > 0 {
                // The k-th retry (1-indexed) sleeps k * step seconds:
                // 5s, 10s, ... for the default step, replacing the
                // source's `(RETRY_MAX - retry) * 5`, which sleeps 0s on
                // the first retry.
                let sleep_for = Duration::from_secs(u64::from(attempt) * config.retry_backoff_step_seconds);
                tokio::time::sleep(sleep_for).await;
            }
        }
    }

    Err(AcquireError::Exhausted)
}

async fn finish_good(
    record: &mut CertRecord,
    parsed: ocsp::ParsedResponse,
    trust_store: &rustls::RootCertStore,
    url: &str,
    attempt: u32,
) -> Result<(), AcquireError> {
    let staple_valid_until = parsed
        .next_update
        .unwrap_or_else(|| Utc::now() + chrono::Duration::days(1));

    let validated = chain::validate(
        record.end_entity.as_ref().expect("checked eligible above"),
        &record.intermediates,
        Some(&parsed.der),
        trust_store,
    )?;

    record.validated_chain = validated;
    record.ocsp_staple_der = Some(parsed.der.clone());
    record.staple_valid_until = Some(staple_valid_until);

    persist(record.path(), &parsed.der).await?;

    info!(url = %url, attempt, valid_until = %staple_valid_until, "ocsp staple acquired");
    Ok(())
}

async fn post_request(client: &Client, url: &str, body: &[u8]) -> Result<Vec<u8>, AcquireError> {
    let parsed_url =
        Url::parse(url).map_err(|e| AcquireError::Network(format!("invalid responder url {url}: {e}")))?;
    let host = parsed_url
        .host_str()
        .ok_or_else(|| AcquireError::Network(format!("responder url has no host: {url}")))?
        .to_string();

    let send = client
        .post(url)
        .header("Content-Type", "application/ocsp-request")
        .header("Accept", "application/ocsp-response")
        .header("Host", host)
        .body(body.to_vec())
        .send();

    let response = tokio_timeout(Duration::from_secs(10), send)
        .await
        .map_err(|_| AcquireError::Network("connect timed out".to_string()))?
        .map_err(|e| AcquireError::Network(e.to_string()))?;

    if !response.status().is_success() {
        return Err(AcquireError::Network(format!(
            "responder returned status {}",
            response.status()
        )));
    }

    let bytes = tokio_timeout(Duration::from_secs(5), response.bytes())
        .await
        .map_err(|_| AcquireError::Network("reading response body timed out".to_string()))?
        .map_err(|e| AcquireError::Network(e.to_string()))?;

    Ok(bytes.to_vec())
}

/// Writes the DER bytes atomically to `<path>.ocsp` (write-to-temp,
/// rename, same directory).
async fn persist(cert_path: &Path, der: &[u8]) -> Result<(), AcquireError> {
    let staple_path = staple_path_for(cert_path);
    let mut tmp_name = staple_path.clone().into_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, der).await.map_err(|source| {
        AcquireError::Record(RecordError::Io {
            path: tmp_path.clone(),
            source,
        })
    })?;
    tokio::fs::rename(&tmp_path, &staple_path).await.map_err(|source| {
        AcquireError::Record(RecordError::Io {
            path: staple_path.clone(),
            source,
        })
    })?;
    Ok(())
}

pub fn staple_path_for(cert_path: &Path) -> PathBuf {
    let mut s = cert_path.as_os_str().to_os_string();
    s.push(".ocsp");
    PathBuf::from(s)
}

/// Deletes `<path>.ocsp` if present; used by the orchestrator on a
/// `ChainValidationError` to keep a stale staple from being served.
pub fn delete_stale_staple(cert_path: &Path) {
    let staple_path = staple_path_for(cert_path);
    if let Err(e) = std::fs::remove_file(&staple_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %staple_path.display(), error = %e, "failed to delete stale ocsp staple");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staple_path_appends_suffix() {
        let p = staple_path_for(Path::new("/etc/certs/leaf.pem"));
        assert_eq!(p, PathBuf::from("/etc/certs/leaf.pem.ocsp"));
    }
}
