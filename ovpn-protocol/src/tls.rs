//! Control channel TLS
//!
//! The TLS session is driven as a memory BIO: ciphertext arriving in control
//! packets is pushed in with [`TlsSession::put_cipher_text`], and records to
//! send are pulled out with [`TlsSession::pull_cipher_text`]. The server is
//! verified against the configured CA only; its host name is not checked.

use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::settings::Handshake;
use crate::zeroing::SecretBuffer;
use crate::{Error, Result};

/// Name presented to the verifier; never matched against the certificate
const SERVER_NAME: &str = "openvpn.server";

const PLAIN_TEXT_CHUNK: usize = 4096;

/// A TLS client session fed through memory buffers
pub trait TlsSession: Send {
    /// Begin the handshake; the ClientHello becomes available to pull
    fn start(&mut self) -> Result<()>;

    /// Whether the handshake has completed
    fn is_connected(&self) -> bool;

    /// Feed ciphertext received from the server
    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()>;

    /// Take pending ciphertext to send, if any
    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>>;

    /// Queue plaintext for the server
    fn put_plain_text(&mut self, data: &[u8]) -> Result<()>;

    /// Take decrypted plaintext, if any
    fn pull_plain_text(&mut self) -> Result<Option<SecretBuffer>>;
}

/// Creates a fresh TLS session per negotiated key
pub trait TlsFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn TlsSession>>;
}

/// Accepts any server certificate that chains to the CA, whatever its name
#[derive(Debug)]
struct CaOnlyVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for CaOnlyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::Config("no certificate found in PEM".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| Error::Config("no private key found in PEM".into()))
}

/// Builds rustls client sessions from a [`Handshake`]
pub struct RustlsFactory {
    config: Arc<ClientConfig>,
}

impl RustlsFactory {
    pub fn new(handshake: &Handshake) -> Result<Self> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for cert in parse_certs(handshake.ca_pem())? {
            roots.add(cert)?;
        }
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CaOnlyVerifier { inner }));

        let mut config = match handshake {
            Handshake::CaOnly { .. } => builder.with_no_client_auth(),
            Handshake::CaCertKey { cert_pem, key_pem, .. } => {
                builder.with_client_auth_cert(parse_certs(cert_pem)?, parse_key(key_pem)?)?
            }
        };
        config.enable_sni = false;

        Ok(Self {
            config: Arc::new(config),
        })
    }
}

impl TlsFactory for RustlsFactory {
    fn create(&self) -> Result<Box<dyn TlsSession>> {
        let name = ServerName::try_from(SERVER_NAME).map_err(|e| Error::Tls(e.to_string()))?;
        let conn = ClientConnection::new(self.config.clone(), name)?;
        Ok(Box::new(RustlsSession { conn }))
    }
}

struct RustlsSession {
    conn: ClientConnection,
}

impl TlsSession for RustlsSession {
    fn start(&mut self) -> Result<()> {
        // the ClientHello is queued on construction
        if !self.conn.wants_write() {
            return Err(Error::Tls("no ClientHello queued".into()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.conn.is_handshaking()
    }

    fn put_cipher_text(&mut self, data: &[u8]) -> Result<()> {
        let mut rd = data;
        while !rd.is_empty() {
            let n = self.conn.read_tls(&mut rd)?;
            self.conn.process_new_packets()?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn pull_cipher_text(&mut self) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut out)?;
        }
        Ok((!out.is_empty()).then_some(out))
    }

    fn put_plain_text(&mut self, data: &[u8]) -> Result<()> {
        self.conn.writer().write_all(data)?;
        Ok(())
    }

    fn pull_plain_text(&mut self) -> Result<Option<SecretBuffer>> {
        let mut plain = SecretBuffer::new();
        let mut chunk = SecretBuffer::zeroed(PLAIN_TEXT_CHUNK);
        loop {
            match self.conn.reader().read(chunk.as_mut_bytes()) {
                Ok(0) => break,
                Ok(n) => plain.append(&chunk.as_bytes()[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Tls(e.to_string())),
            }
        }
        Ok((!plain.is_empty()).then_some(plain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = include_str!("../tests/fixtures/ca.pem");
    const CLIENT_CERT: &str = include_str!("../tests/fixtures/client.pem");
    const CLIENT_KEY: &str = include_str!("../tests/fixtures/client.key");

    #[test]
    fn test_client_hello_is_pulled() {
        let factory = RustlsFactory::new(&Handshake::CaOnly { ca_pem: CA.into() }).unwrap();
        let mut tls = factory.create().unwrap();
        tls.start().unwrap();
        assert!(!tls.is_connected());

        let hello = tls.pull_cipher_text().unwrap().unwrap();
        // handshake record
        assert_eq!(hello[0], 0x16);
        assert!(tls.pull_cipher_text().unwrap().is_none());
        assert!(tls.pull_plain_text().unwrap().is_none());
    }

    #[test]
    fn test_client_certificate_config() {
        let handshake = Handshake::CaCertKey {
            ca_pem: CA.into(),
            cert_pem: CLIENT_CERT.into(),
            key_pem: CLIENT_KEY.to_string().into(),
        };
        assert!(RustlsFactory::new(&handshake).is_ok());
    }

    #[test]
    fn test_bad_pem() {
        assert!(matches!(
            RustlsFactory::new(&Handshake::CaOnly { ca_pem: "garbage".into() }),
            Err(Error::Config(_))
        ));
        let handshake = Handshake::CaCertKey {
            ca_pem: CA.into(),
            cert_pem: CLIENT_CERT.into(),
            key_pem: String::new().into(),
        };
        assert!(matches!(RustlsFactory::new(&handshake), Err(Error::Config(_))));
    }

    #[test]
    fn test_garbage_cipher_text_fails() {
        let factory = RustlsFactory::new(&Handshake::CaOnly { ca_pem: CA.into() }).unwrap();
        let mut tls = factory.create().unwrap();
        tls.start().unwrap();
        tls.pull_cipher_text().unwrap();
        assert!(tls.put_cipher_text(&[0xFF; 64]).is_err());
    }
}
