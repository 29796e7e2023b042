//! Acquirer behavior that does not require constructing a valid OCSP
//! response body: an empty response is terminal with no retry or URL
//! fallback, and a malformed response is retried and falls through to
//! the next responder URL before the whole call gives up.

mod common;

use std::path::PathBuf;
use std::time::SystemTime;

use reqwest::Client;
use rustls::RootCertStore;
use stapled::chain::ValidatedChain;
use stapled::config::AcquirerConfig;
use stapled::error::AcquireError;
use stapled::ocsp::acquirer;
use stapled::record::{CertRecord, ParsedCert, RecordId};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{generate_ca, generate_leaf, LeafOptions};

/// Builds an eligible record for a leaf signed by `ca`, with
/// `ocsp_urls` pointed at the given responder URLs. `validated_chain`
/// only needs to be non-empty for eligibility here: these tests never
/// reach a successful response, so `chain::validate` is never called.
fn eligible_record(ca_der: &[u8], leaf_der: &[u8], ocsp_urls: Vec<String>) -> CertRecord {
    let leaf = ParsedCert::from_der(leaf_der).expect("parse leaf");
    let issuer = ParsedCert::from_der(ca_der).expect("parse ca");

    let mut record = CertRecord::new(PathBuf::from("/certs/leaf.pem"), [7u8; 32], SystemTime::now());
    record.validated_chain = ValidatedChain { certs: vec![leaf.clone()] };
    record.ocsp_urls = ocsp_urls;
    record.end_entity = Some(leaf);
    record.intermediates = vec![issuer];
    record.id = RecordId { path: record.id.path.clone(), content_hash: [7u8; 32] };
    record
}

#[tokio::test]
async fn empty_response_body_is_terminal_with_no_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(Vec::<u8>::new()))
        .expect(1)
        .mount(&server)
        .await;

    let ca = generate_ca();
    let leaf_der = generate_leaf(&ca, LeafOptions::valid_server("example.com"));
    let mut record = eligible_record(&ca.der, &leaf_der, vec![server.uri()]);

    let config = AcquirerConfig { retry_max: 3, retry_backoff_step_seconds: 0 };
    let client = Client::builder().build().unwrap();
    let trust_store = RootCertStore::empty();

    let err = acquirer::acquire(&mut record, &config, &client, &trust_store).await.unwrap_err();
    assert!(matches!(err, AcquireError::Empty));
    // `.expect(1)` on the mock is itself verified on drop; reaching
    // this point with the right error confirms no further attempts
    // were made against the same responder.
}

#[tokio::test]
async fn malformed_response_is_retried_then_falls_through_to_the_next_url_until_exhausted() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    for server in [&first, &second] {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not a valid ocsp response".to_vec()))
            .mount(server)
            .await;
    }

    let ca = generate_ca();
    let leaf_der = generate_leaf(&ca, LeafOptions::valid_server("example.com"));
    let mut record = eligible_record(&ca.der, &leaf_der, vec![first.uri(), second.uri()]);

    let config = AcquirerConfig { retry_max: 2, retry_backoff_step_seconds: 0 };
    let client = Client::builder().build().unwrap();
    let trust_store = RootCertStore::empty();

    let err = acquirer::acquire(&mut record, &config, &client, &trust_store).await.unwrap_err();
    assert!(matches!(err, AcquireError::Exhausted));

    assert_eq!(first.received_requests().await.unwrap().len(), 2);
    assert_eq!(second.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn a_record_that_is_not_eligible_is_rejected_before_any_request_is_sent() {
    let config = AcquirerConfig { retry_max: 1, retry_backoff_step_seconds: 0 };
    let client = Client::builder().build().unwrap();
    let trust_store = RootCertStore::empty();

    let mut record = CertRecord::new(PathBuf::from("/certs/never-parsed.pem"), [0u8; 32], SystemTime::now());
    let err = acquirer::acquire(&mut record, &config, &client, &trust_store).await.unwrap_err();
    assert!(matches!(err, AcquireError::Chain(_)));
}
