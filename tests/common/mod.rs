//! Shared helpers for the integration suites
//!
//! - a self-signed TLS acceptor (server side) and a
//!   verification-free connector (client side), so TLS tests need no
//!   certificate files;
//! - the canned test message used by the POP3 suites.

#![allow(dead_code)] // each integration test binary uses a subset

use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// A canned 436-byte message; the POP3 suites rely on its exact size.
pub const TEST_MAIL: &[u8] = b"Message-ID: <N01BwLnh8dGBoD9gVz@msn.com>\r\n\
From: from@msn.com\r\n\
To: MddK0ftkv@outlook.com\r\n\
Subject: hello lorem ipsum foo bar\r\n\
Date: Mon, 24 Oct 2002 00:42:02 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: text/plain;\r\n\
\tcharset=\"windows-1251\";\r\n\
Content-Transfer-Encoding: 7bit\r\n\
X-Peer: ('2.2.1.9', 64593)\r\n\
X-MailFrom: from@msn.com\r\n\
X-RcptTo: MddK0ftkv@outlook.com\r\n\
\r\n\
Hello bro\r\n\
IlzVOJqu9Zp7twFAtzcV\r\n\
yQVk36B0mGU2gtWxXLr\r\n\
PeF0RtbI0mAuVPLQDHCi\r\n\
\r\n";

/// Install the ring crypto provider process-wide. Tests race to do
/// this; losing the race is fine.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Build a TLS acceptor around a fresh self-signed certificate.
pub fn self_signed_acceptor() -> TlsAcceptor {
    install_crypto_provider();
    let cert = rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()])
        .expect("generate self-signed cert");
    let cert_der = cert.cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der.into())
        .expect("build server TLS config");
    TlsAcceptor::from(Arc::new(config))
}

/// A client-side connector that accepts any certificate, for talking
/// to the self-signed test server.
pub fn trusting_connector() -> TlsConnector {
    install_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Certificate verifier that accepts everything (test certs are
/// self-signed).
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
