//! TLS context construction for the broker connection
//!
//! Loads trust material and an optional client identity and turns them into a
//! rustls client configuration. Nothing here terminates the process: every
//! failure is a [`TlsError`] for the caller to act on.

use crate::config::TlsSection;
use rumqttc::tokio_rustls::rustls::crypto::ring as crypto_provider;
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use rumqttc::{TlsConfiguration, Transport};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// TLS setup errors
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read CA file {path}: {source}")]
    ReadCaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read client certificate {path}: {source}")]
    ReadCertificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to read client key {path}: {source}")]
    ReadPrivateKey {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed PEM in {origin}: {source}")]
    MalformedPem {
        origin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No certificates found in {0}")]
    NoCertificates(String),
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Client certificate and key are not a usable pair: {0}")]
    InvalidKeyPair(#[source] rustls::Error),
    #[error("Client private key does not belong to the client certificate")]
    KeyMismatch,
    #[error("Client certificate could not be parsed: {0}")]
    InvalidCertificate(String),
    #[error("Failed to load platform root certificates: {0}")]
    NativeRoots(#[source] std::io::Error),
}

/// Where the trust pool came from
#[derive(Debug, Clone, PartialEq)]
pub enum TrustSource {
    /// CA bundle read from disk
    CaFile(PathBuf),
    /// CA bundle supplied as bytes
    Pem,
    /// Platform root store
    NativeRoots,
}

/// PEM-encoded client certificate chain and private key
#[derive(Debug, Clone, Copy)]
pub struct IdentityPem<'a> {
    pub cert_chain: &'a [u8],
    pub private_key: &'a [u8],
}

/// Root store built from a PEM bundle
#[derive(Debug)]
pub struct TrustPool {
    pub roots: RootCertStore,
    /// Certificates accepted as trust anchors
    pub added: usize,
    /// Entries dropped because they were not valid certificates
    pub skipped: usize,
}

/// Read-only security context consumed once when the transport is built
#[derive(Debug, Clone)]
pub struct SecurityContext {
    client_config: Arc<ClientConfig>,
    trust_source: TrustSource,
    trusted_certificates: usize,
    skipped_certificates: usize,
    client_identity: bool,
}

impl SecurityContext {
    /// Build the context from file paths
    pub fn load(tls: &TlsSection) -> Result<Self, TlsError> {
        let (pool, trust_source) = match &tls.cafile {
            Some(path) => {
                let pem = std::fs::read(path).map_err(|source| TlsError::ReadCaFile {
                    path: path.clone(),
                    source,
                })?;
                (parse_ca_bundle(&pem), TrustSource::CaFile(path.clone()))
            }
            None => (native_trust_pool()?, TrustSource::NativeRoots),
        };

        let identity = match (&tls.cert, &tls.key) {
            (Some(cert_path), Some(key_path)) => Some(load_identity(cert_path, key_path)?),
            (Some(_), None) | (None, Some(_)) => {
                warn!("Client certificate and key must both be set, continuing without client identity");
                None
            }
            (None, None) => None,
        };

        Self::assemble(pool, trust_source, identity)
    }

    /// Build the context from in-memory PEM data. Without a CA bundle the
    /// platform root store is used.
    pub fn from_pem(
        ca_bundle: Option<&[u8]>,
        identity: Option<IdentityPem<'_>>,
    ) -> Result<Self, TlsError> {
        let (pool, trust_source) = match ca_bundle {
            Some(pem) => (parse_ca_bundle(pem), TrustSource::Pem),
            None => (native_trust_pool()?, TrustSource::NativeRoots),
        };

        let identity = identity
            .map(|pem| {
                Ok::<_, TlsError>((
                    parse_certificate_chain(pem.cert_chain, "client certificate")?,
                    parse_private_key(pem.private_key, "client key")?,
                ))
            })
            .transpose()?;

        Self::assemble(pool, trust_source, identity)
    }

    fn assemble(
        pool: TrustPool,
        trust_source: TrustSource,
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    ) -> Result<Self, TlsError> {
        let TrustPool {
            roots,
            added,
            skipped,
        } = pool;

        if let Some((cert_chain, key)) = &identity {
            check_key_pair(cert_chain, key)?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let client_identity = identity.is_some();
        let client_config = match identity {
            // Presented whenever the broker asks for a client certificate
            Some((cert_chain, key)) => builder
                .with_client_auth_cert(cert_chain, key)
                .map_err(TlsError::InvalidKeyPair)?,
            None => builder.with_no_client_auth(),
        };

        info!(
            trust_source = ?trust_source,
            trusted_certificates = added,
            client_identity,
            "TLS context ready"
        );

        Ok(Self {
            client_config: Arc::new(client_config),
            trust_source,
            trusted_certificates: added,
            skipped_certificates: skipped,
            client_identity,
        })
    }

    pub fn trust_source(&self) -> &TrustSource {
        &self.trust_source
    }

    /// Number of certificates in the trust pool
    pub fn trusted_certificates(&self) -> usize {
        self.trusted_certificates
    }

    /// Number of CA bundle entries that were dropped
    pub fn skipped_certificates(&self) -> usize {
        self.skipped_certificates
    }

    pub fn has_client_identity(&self) -> bool {
        self.client_identity
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Consume the context into a rumqttc TLS transport
    pub fn into_transport(self) -> Transport {
        Transport::tls_with_config(TlsConfiguration::Rustls(self.client_config))
    }
}

/// Parse every certificate in a PEM bundle into a root store.
///
/// Blocks that fail to decode or are not usable trust anchors are skipped;
/// an input with no valid certificate yields an empty pool.
pub fn parse_ca_bundle(pem: &[u8]) -> TrustPool {
    let mut reader = BufReader::new(pem);
    let mut malformed = 0usize;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|cert| match cert {
            Ok(cert) => Some(cert),
            Err(e) => {
                debug!("Skipping malformed PEM block in CA bundle: {}", e);
                malformed += 1;
                None
            }
        })
        .collect();

    let mut roots = RootCertStore::empty();
    let (added, rejected) = roots.add_parsable_certificates(certs);
    if rejected > 0 {
        debug!("Skipped {} CA certificates that failed to parse", rejected);
    }

    TrustPool {
        roots,
        added,
        skipped: malformed + rejected,
    }
}

fn native_trust_pool() -> Result<TrustPool, TlsError> {
    let certs = rustls_native_certs::load_native_certs().map_err(TlsError::NativeRoots)?;
    let mut roots = RootCertStore::empty();
    let (added, skipped) = roots.add_parsable_certificates(certs);
    Ok(TrustPool {
        roots,
        added,
        skipped,
    })
}

fn load_identity(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
    let cert_pem = std::fs::read(cert_path).map_err(|source| TlsError::ReadCertificate {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let key_pem = std::fs::read(key_path).map_err(|source| TlsError::ReadPrivateKey {
        path: key_path.to_path_buf(),
        source,
    })?;

    let cert_chain = parse_certificate_chain(&cert_pem, &cert_path.display().to_string())?;
    let key = parse_private_key(&key_pem, &key_path.display().to_string())?;
    Ok((cert_chain, key))
}

/// Message signed with the private key to prove it matches the certificate
const KEY_PAIR_CHALLENGE: &[u8] = b"mqtt-tls-client key pair check";

/// Check that `key` belongs to the leaf of `cert_chain`.
///
/// rustls accepts any loadable key at build time, so sign a challenge with the
/// key and verify it against the certificate's public key.
fn check_key_pair(
    cert_chain: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<(), TlsError> {
    let leaf = cert_chain
        .first()
        .ok_or_else(|| TlsError::NoCertificates("client certificate".to_string()))?;

    let algorithms = crypto_provider::default_provider().signature_verification_algorithms;
    let signing_key =
        crypto_provider::sign::any_supported_type(key).map_err(TlsError::InvalidKeyPair)?;
    let signer = signing_key
        .choose_scheme(&algorithms.supported_schemes())
        .ok_or_else(|| {
            TlsError::InvalidKeyPair(rustls::Error::General(
                "no supported signature scheme for client key".to_string(),
            ))
        })?;
    let signature = signer
        .sign(KEY_PAIR_CHALLENGE)
        .map_err(TlsError::InvalidKeyPair)?;

    let leaf = webpki::EndEntityCert::try_from(leaf)
        .map_err(|e| TlsError::InvalidCertificate(format!("{e:?}")))?;
    let scheme = signer.scheme();
    let verified = algorithms
        .mapping
        .iter()
        .filter(|(candidate, _)| *candidate == scheme)
        .flat_map(|(_, verifiers)| verifiers.iter())
        .any(|verifier| {
            leaf.verify_signature(*verifier, KEY_PAIR_CHALLENGE, &signature)
                .is_ok()
        });

    if verified {
        Ok(())
    } else {
        Err(TlsError::KeyMismatch)
    }
}

fn parse_certificate_chain(
    pem: &[u8],
    origin: &str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(pem);
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::MalformedPem {
            origin: origin.to_string(),
            source,
        })?;

    if chain.is_empty() {
        return Err(TlsError::NoCertificates(origin.to_string()));
    }
    Ok(chain)
}

fn parse_private_key(pem: &[u8], origin: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::MalformedPem {
            origin: origin.to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(origin.to_string()))
}
