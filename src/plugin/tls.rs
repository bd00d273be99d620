//! Per-process TLS material.
//!
//! The host mints a throwaway CA for every plugin launch and signs its own
//! client leaf with it. The plugin's server certificate is either self-signed
//! by the plugin (auto-mTLS) or minted by the host and delivered in a wrap
//! token. Either way the host trusts the server certificate only by the
//! SHA-256 fingerprint the plugin announces in its handshake line.
//!
//! Keys are ECDSA P-521. Certificates are valid from 30 seconds ago for
//! roughly thirty years.

use std::fmt;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, PKCS_ECDSA_P521_SHA512,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig,
    SignatureScheme,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::PluginError;

const NOT_BEFORE_SKEW: time::Duration = time::Duration::seconds(30);
const VALIDITY: time::Duration = time::Duration::hours(262_980);

/// The crypto provider used for every config built here.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Hex SHA-256 of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Fingerprint of the first certificate in a PEM bundle.
pub fn fingerprint_pem(cert_pem: &str) -> Result<String, PluginError> {
    let certs = parse_certs(cert_pem)?;
    Ok(fingerprint(&certs[0]))
}

pub fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, PluginError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(PluginError::Tls("no certificate found in PEM".to_string()));
    }
    Ok(certs)
}

pub fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, PluginError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_bytes()))?
        .ok_or_else(|| PluginError::Tls("no private key found in PEM".to_string()))
}

// ============================================================================
// Minting
// ============================================================================

/// A certificate and its key, PEM encoded.
#[derive(Clone)]
pub struct Leaf {
    pub cert_pem: String,
    pub key_pem: String,
    pub fingerprint: String,
}

impl fmt::Debug for Leaf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Leaf")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Leaf {
    fn from_parts(cert: &Certificate, key: &KeyPair) -> Self {
        Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            fingerprint: fingerprint(cert.der()),
        }
    }
}

fn base_params(common_name: &str) -> Result<CertificateParams, PluginError> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params.distinguished_name.push(DnType::CommonName, common_name);
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - NOT_BEFORE_SKEW;
    params.not_after = now + VALIDITY;
    Ok(params)
}

fn leaf_params(common_name: &str) -> Result<CertificateParams, PluginError> {
    let mut params = base_params(common_name)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyAgreement,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    Ok(params)
}

/// A self-signed certificate, used by a plugin under auto-mTLS.
pub fn self_signed_leaf(common_name: &str) -> Result<Leaf, PluginError> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)?;
    let cert = leaf_params(common_name)?.self_signed(&key)?;
    Ok(Leaf::from_parts(&cert, &key))
}

/// Throwaway CA minted for a single plugin launch.
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("fingerprint", &fingerprint(self.cert.der()))
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    pub fn generate() -> Result<Self, PluginError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)?;
        let mut params = base_params("dbplugin-ca")?;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let cert = params.self_signed(&key)?;
        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// A leaf signed by this CA.
    pub fn issue(&self, common_name: &str) -> Result<Leaf, PluginError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P521_SHA512)?;
        let cert = leaf_params(common_name)?.signed_by(&key, &self.cert, &self.key)?;
        Ok(Leaf::from_parts(&cert, &key))
    }
}

/// Server identity delivered to a plugin through a wrap token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterials {
    pub cert_pem: String,
    pub key_pem: String,
    /// CA that signed the host's client certificate.
    pub ca_pem: String,
}

impl fmt::Debug for TlsMaterials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterials")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"[redacted]")
            .field("ca_pem", &self.ca_pem)
            .finish()
    }
}

// ============================================================================
// rustls configs
// ============================================================================

/// Accepts exactly one server certificate, identified by fingerprint.
#[derive(Debug)]
struct PinnedServerCert {
    fingerprint: String,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if fingerprint(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Host side: present `client`, trust only the server certificate whose
/// fingerprint is `pinned`.
pub fn client_config(client: &Leaf, pinned: &str) -> Result<ClientConfig, PluginError> {
    let provider = provider();
    let verifier = PinnedServerCert {
        fingerprint: pinned.to_ascii_lowercase(),
        provider: Arc::clone(&provider),
    };
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(parse_certs(&client.cert_pem)?, parse_key(&client.key_pem)?)?;
    Ok(config)
}

/// Plugin side: serve `cert_pem`, require a client certificate signed by
/// `client_ca_pem`.
pub fn server_config(
    cert_pem: &str,
    key_pem: &str,
    client_ca_pem: &str,
) -> Result<ServerConfig, PluginError> {
    let provider = provider();

    let mut roots = RootCertStore::empty();
    for ca in parse_certs(client_ca_pem)? {
        roots.add(ca)?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| PluginError::Tls(format!("client verifier: {e}")))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Client config trusting exactly the CAs in `ca_pem`, for redeeming wrap
/// tokens against a test host.
pub fn ca_client_config(ca_pem: &str) -> Result<ClientConfig, PluginError> {
    let provider = provider();
    let mut roots = RootCertStore::empty();
    for ca in parse_certs(ca_pem)? {
        roots.add(ca)?;
    }
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth())
}
