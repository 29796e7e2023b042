//! Shared certificate-generation helpers for integration tests. Builds
//! a self-signed CA and leaf certificates signed by it.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType,
};
use std::time::{Duration, SystemTime};

pub struct GeneratedCa {
    pub certified_key: rcgen::CertifiedKey,
    pub der: Vec<u8>,
}

pub fn generate_ca() -> GeneratedCa {
    let mut params = CertificateParams::new(Vec::default()).expect("ca params");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(10 * 365 * 24 * 3600)).into();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "stapled test root CA");
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).expect("ca key");
    let cert = params.self_signed(&key_pair).expect("self sign ca");
    let der = cert.der().to_vec();

    let certified_key =
        rcgen::CertifiedKey::from_params_and_key_pair(params, key_pair).expect("certified key");

    GeneratedCa { certified_key, der }
}

pub struct LeafOptions {
    pub dns_name: String,
    pub key_usages: Vec<KeyUsagePurpose>,
    pub extended_key_usages: Vec<ExtendedKeyUsagePurpose>,
}

impl LeafOptions {
    pub fn valid_server(dns_name: &str) -> Self {
        Self {
            dns_name: dns_name.to_string(),
            key_usages: vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment],
            extended_key_usages: vec![ExtendedKeyUsagePurpose::ServerAuth],
        }
    }
}

pub fn generate_leaf(ca: &GeneratedCa, opts: LeafOptions) -> Vec<u8> {
    let mut params = CertificateParams::new(Vec::default()).expect("leaf params");
    params.subject_alt_names =
        vec![SanType::DnsName(opts.dns_name.clone().try_into().expect("valid dns name"))];
    params.key_usages = opts.key_usages;
    params.extended_key_usages = opts.extended_key_usages;

    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + Duration::from_secs(365 * 24 * 3600)).into();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, opts.dns_name.as_str());
    params.distinguished_name = dn;

    let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256).expect("leaf key");
    let cert = params
        .signed_by(&key_pair, &ca.certified_key.cert, &ca.certified_key.key_pair)
        .expect("sign leaf");
    cert.der().to_vec()
}
