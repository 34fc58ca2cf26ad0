//! TLS context loading tests
//!
//! Uses the PEM fixtures in `tests/fixtures`: a self-signed CA and a client
//! certificate it issued.

use mqtt_tls_client::config::TlsSection;
use mqtt_tls_client::tls::{SecurityContext, TlsError, TrustSource};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn full_tls_section() -> TlsSection {
    TlsSection {
        cafile: Some(fixture("ca.pem")),
        cert: Some(fixture("client.pem")),
        key: Some(fixture("client.key")),
    }
}

#[test]
fn test_load_with_ca_and_identity() {
    // Arrange
    let tls = full_tls_section();

    // Act
    let context = SecurityContext::load(&tls).unwrap();

    // Assert
    assert_eq!(context.trust_source(), &TrustSource::CaFile(fixture("ca.pem")));
    assert_eq!(context.trusted_certificates(), 1);
    assert_eq!(context.skipped_certificates(), 0);
    assert!(context.has_client_identity());
}

#[test]
fn test_load_without_identity() {
    let tls = TlsSection {
        cafile: Some(fixture("ca.pem")),
        ..Default::default()
    };

    let context = SecurityContext::load(&tls).unwrap();

    assert!(!context.has_client_identity());
    assert_eq!(context.trusted_certificates(), 1);
}

#[test]
fn test_cert_without_key_continues_without_identity() {
    let tls = TlsSection {
        cafile: Some(fixture("ca.pem")),
        cert: Some(fixture("client.pem")),
        key: None,
    };

    let context = SecurityContext::load(&tls).unwrap();

    assert!(!context.has_client_identity());
}

#[test]
fn test_unreadable_ca_file_is_error() {
    let tls = TlsSection {
        cafile: Some(PathBuf::from("/nonexistent/ca.pem")),
        ..Default::default()
    };

    let result = SecurityContext::load(&tls);

    match result {
        Err(TlsError::ReadCaFile { path, .. }) => {
            assert_eq!(path, PathBuf::from("/nonexistent/ca.pem"));
        }
        other => panic!("expected ReadCaFile, got {other:?}"),
    }
}

#[test]
fn test_garbage_ca_file_yields_empty_trust_pool() {
    // Arrange: a CA file with no certificates is not fatal
    let mut ca_file = NamedTempFile::new().unwrap();
    writeln!(ca_file, "not a certificate").unwrap();
    let tls = TlsSection {
        cafile: Some(ca_file.path().to_path_buf()),
        ..Default::default()
    };

    // Act
    let context = SecurityContext::load(&tls).unwrap();

    // Assert
    assert_eq!(context.trusted_certificates(), 0);
}

#[test]
fn test_unreadable_client_key_is_error() {
    let tls = TlsSection {
        key: Some(PathBuf::from("/nonexistent/client.key")),
        ..full_tls_section()
    };

    let result = SecurityContext::load(&tls);

    assert!(matches!(result, Err(TlsError::ReadPrivateKey { .. })));
}

#[test]
fn test_key_file_without_key_is_error() {
    // The CA certificate is not a private key
    let tls = TlsSection {
        key: Some(fixture("ca.pem")),
        ..full_tls_section()
    };

    let result = SecurityContext::load(&tls);

    assert!(matches!(result, Err(TlsError::NoPrivateKey(_))));
}

#[test]
fn test_certificate_file_without_certificate_is_error() {
    let tls = TlsSection {
        cert: Some(fixture("client.key")),
        ..full_tls_section()
    };

    let result = SecurityContext::load(&tls);

    assert!(matches!(result, Err(TlsError::NoCertificates(_))));
}

#[test]
fn test_mismatched_client_key_is_error() {
    // Arrange: the certificate's own key is replaced by an unrelated one
    let tls = TlsSection {
        key: Some(fixture("other.key")),
        ..full_tls_section()
    };

    // Act
    let result = SecurityContext::load(&tls);

    // Assert
    assert!(matches!(result, Err(TlsError::KeyMismatch)));
}
