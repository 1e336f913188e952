//! TLS verification policy.
//!
//! The handshake itself is done by rustls. This module decides what is verified:
//! the certificate chain ([`CertReqs`]), the hostname ([`AssertHostname`]) and
//! optionally a pinned certificate fingerprint.

use std::path::PathBuf;

/// Whether the server certificate chain must be verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertReqs {
    /// Accept any certificate. Each connection logs a warning.
    None,

    /// Verify the chain against the configured roots.
    #[default]
    Required,
}

/// Which name the certificate must be valid for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AssertHostname {
    /// The host being connected to.
    #[default]
    Default,

    /// Do not check the name.
    Disabled,

    /// A specific name, independent of the host being connected to.
    Name(String),
}

/// TLS settings shared by every connection of a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct TlsSettings {
    /// Chain verification.
    pub cert_reqs: CertReqs,

    /// PEM bundle of trusted roots. The platform roots are used when unset.
    pub ca_certs: Option<PathBuf>,

    /// Hostname verification.
    pub assert_hostname: AssertHostname,

    /// Expected SHA-1 or SHA-256 fingerprint of the server certificate, as hex with
    /// optional colons. When set, it replaces the hostname check.
    pub assert_fingerprint: Option<String>,

    /// PEM client certificate chain and private key.
    pub client_cert: Option<(PathBuf, PathBuf)>,
}

impl TlsSettings {
    /// Set chain verification.
    pub fn with_cert_reqs(mut self, cert_reqs: CertReqs) -> Self {
        self.cert_reqs = cert_reqs;
        self
    }

    /// Set the trusted roots bundle.
    pub fn with_ca_certs(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certs = Some(path.into());
        self
    }

    /// Set hostname verification.
    pub fn with_assert_hostname(mut self, assert_hostname: AssertHostname) -> Self {
        self.assert_hostname = assert_hostname;
        self
    }

    /// Pin the server certificate fingerprint.
    pub fn with_assert_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.assert_fingerprint = Some(fingerprint.into());
        self
    }

    /// Present a client certificate.
    pub fn with_client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some((cert.into(), key.into()));
        self
    }
}

#[cfg(feature = "tls")]
pub(crate) use self::connector::{Fingerprint, TlsConnector};

#[cfg(feature = "tls")]
mod connector {
    use std::fmt;
    use std::sync::Arc;

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::client::WebPkiServerVerifier;
    use rustls::crypto::CryptoProvider;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
    use sha1::Sha1;
    use sha2::{Digest, Sha256};
    use tokio::net::TcpStream;
    use tokio_rustls::client::TlsStream;
    use tracing::{trace, warn};

    use super::{AssertHostname, CertReqs, TlsSettings};
    use crate::client::Error;

    /// A pinned certificate digest.
    #[derive(Clone, PartialEq, Eq)]
    pub(crate) enum Fingerprint {
        Sha1([u8; 20]),
        Sha256([u8; 32]),
    }

    impl fmt::Debug for Fingerprint {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Fingerprint::Sha1(digest) => write!(f, "Sha1({})", hex::encode(digest)),
                Fingerprint::Sha256(digest) => write!(f, "Sha256({})", hex::encode(digest)),
            }
        }
    }

    impl Fingerprint {
        pub(crate) fn parse(fingerprint: &str) -> Result<Self, Error> {
            let normalized = fingerprint.replace(':', "").to_ascii_lowercase();
            if normalized.len() % 2 != 0 {
                return Err(Error::Ssl("Fingerprint is of invalid length.".into()));
            }

            match normalized.len() / 2 {
                20 | 32 => {}
                16 => return Err(Error::Ssl("MD5 fingerprints are not supported.".into())),
                _ => return Err(Error::Ssl("Fingerprint is of invalid length.".into())),
            }

            let bytes = hex::decode(&normalized)
                .map_err(|error| Error::Ssl(format!("Fingerprint is not valid hex: {error}")))?;

            if let Ok(digest) = <[u8; 20]>::try_from(bytes.as_slice()) {
                Ok(Fingerprint::Sha1(digest))
            } else if let Ok(digest) = <[u8; 32]>::try_from(bytes.as_slice()) {
                Ok(Fingerprint::Sha256(digest))
            } else {
                Err(Error::Ssl("Fingerprint is of invalid length.".into()))
            }
        }

        fn expected(&self) -> String {
            match self {
                Fingerprint::Sha1(digest) => hex::encode(digest),
                Fingerprint::Sha256(digest) => hex::encode(digest),
            }
        }

        /// Digest `cert` with the same algorithm as this fingerprint.
        fn digest(&self, cert: &[u8]) -> Vec<u8> {
            match self {
                Fingerprint::Sha1(_) => Sha1::digest(cert).to_vec(),
                Fingerprint::Sha256(_) => Sha256::digest(cert).to_vec(),
            }
        }

        pub(crate) fn check(&self, cert: &[u8]) -> Result<(), String> {
            let actual = self.digest(cert);
            let matched = match self {
                Fingerprint::Sha1(digest) => digest.as_slice() == actual.as_slice(),
                Fingerprint::Sha256(digest) => digest.as_slice() == actual.as_slice(),
            };
            if matched {
                Ok(())
            } else {
                Err(format!(
                    "Fingerprints did not match. Expected \"{}\", got \"{}\".",
                    self.expected(),
                    hex::encode(actual)
                ))
            }
        }
    }

    /// Verifier applying [`TlsSettings`] on top of the webpki chain verifier.
    #[derive(Debug)]
    struct PolicyVerifier {
        chain: Option<Arc<WebPkiServerVerifier>>,
        hostname: AssertHostname,
        fingerprint: Option<Fingerprint>,
        provider: Arc<CryptoProvider>,
    }

    fn is_name_mismatch(error: &rustls::Error) -> bool {
        matches!(
            error,
            rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. }
            )
        )
    }

    impl ServerCertVerifier for PolicyVerifier {
        fn verify_server_cert(
            &self,
            end_entity: &CertificateDer<'_>,
            intermediates: &[CertificateDer<'_>],
            server_name: &ServerName<'_>,
            ocsp_response: &[u8],
            now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            if let Some(fingerprint) = &self.fingerprint {
                fingerprint
                    .check(end_entity.as_ref())
                    .map_err(rustls::Error::General)?;
            }

            let Some(chain) = &self.chain else {
                return Ok(ServerCertVerified::assertion());
            };

            let expected = match &self.hostname {
                AssertHostname::Name(name) => ServerName::try_from(name.as_str())
                    .map_err(|_| rustls::Error::General(format!("invalid hostname '{name}'")))?,
                _ => server_name.clone(),
            };
            let check_hostname =
                self.fingerprint.is_none() && self.hostname != AssertHostname::Disabled;

            match chain.verify_server_cert(end_entity, intermediates, &expected, ocsp_response, now)
            {
                Ok(verified) => Ok(verified),
                Err(error) if is_name_mismatch(&error) && !check_hostname => {
                    trace!("ignoring hostname mismatch");
                    Ok(ServerCertVerified::assertion())
                }
                Err(error) if is_name_mismatch(&error) => Err(rustls::Error::General(format!(
                    "hostname '{}' doesn't match the certificate",
                    expected.to_str()
                ))),
                Err(error) => Err(error),
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

    fn crypto_provider() -> Result<Arc<CryptoProvider>, Error> {
        if let Some(provider) = CryptoProvider::get_default() {
            return Ok(provider.clone());
        }

        builtin_provider().map(Arc::new).ok_or_else(|| {
            Error::Ssl("no rustls crypto provider installed, enable tls-ring or tls-aws-lc".into())
        })
    }

    #[cfg(feature = "tls-ring")]
    fn builtin_provider() -> Option<CryptoProvider> {
        Some(rustls::crypto::ring::default_provider())
    }

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    fn builtin_provider() -> Option<CryptoProvider> {
        Some(rustls::crypto::aws_lc_rs::default_provider())
    }

    #[cfg(not(any(feature = "tls-ring", feature = "tls-aws-lc")))]
    fn builtin_provider() -> Option<CryptoProvider> {
        None
    }

    fn read_pem(path: &std::path::Path) -> Result<Vec<(String, Vec<u8>)>, Error> {
        let text = std::fs::read_to_string(path)
            .map_err(|error| Error::Ssl(format!("could not read {}: {error}", path.display())))?;

        let mut blocks = Vec::new();
        let mut current: Option<String> = None;
        for line in text.lines() {
            if line.starts_with("-----BEGIN ") {
                current = Some(String::new());
            }
            if let Some(block) = current.as_mut() {
                block.push_str(line);
                block.push('\n');
            }
            if line.starts_with("-----END ") {
                if let Some(block) = current.take() {
                    let (label, der) = pem_rfc7468::decode_vec(block.as_bytes()).map_err(|error| {
                        Error::Ssl(format!("invalid PEM in {}: {error}", path.display()))
                    })?;
                    blocks.push((label.to_owned(), der));
                }
            }
        }
        Ok(blocks)
    }

    fn root_store(settings: &TlsSettings) -> Result<RootCertStore, Error> {
        let mut roots = RootCertStore::empty();
        match &settings.ca_certs {
            Some(path) => {
                for (label, der) in read_pem(path)? {
                    if label == "CERTIFICATE" {
                        roots
                            .add(CertificateDer::from(der))
                            .map_err(|error| Error::Ssl(error.to_string()))?;
                    }
                }
            }
            None => {
                let native = rustls_native_certs::load_native_certs();
                for error in &native.errors {
                    warn!(%error, "could not load platform certificate");
                }
                roots.add_parsable_certificates(native.certs);
            }
        }
        Ok(roots)
    }

    fn client_identity(
        cert: &std::path::Path,
        key: &std::path::Path,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), Error> {
        let certs = read_pem(cert)?
            .into_iter()
            .filter(|(label, _)| label == "CERTIFICATE")
            .map(|(_, der)| CertificateDer::from(der))
            .collect();

        let (label, der) = read_pem(key)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Ssl(format!("no private key in {}", key.display())))?;
        let key = match label.as_str() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(der.into()),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(der.into()),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(der.into()),
            other => return Err(Error::Ssl(format!("unknown private key type: {other}"))),
        };
        Ok((certs, key))
    }

    /// Wraps TCP streams in TLS according to a pool's [`TlsSettings`].
    #[derive(Clone)]
    pub(crate) struct TlsConnector {
        config: Arc<rustls::ClientConfig>,
        verified: bool,
    }

    impl fmt::Debug for TlsConnector {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("TlsConnector")
                .field("verified", &self.verified)
                .finish()
        }
    }

    impl TlsConnector {
        #[cfg(test)]
        pub(crate) fn shares_config(&self, other: &TlsConnector) -> bool {
            Arc::ptr_eq(&self.config, &other.config)
        }

        pub(crate) fn new(settings: &TlsSettings) -> Result<Self, Error> {
            let provider = crypto_provider()?;
            let fingerprint = settings
                .assert_fingerprint
                .as_deref()
                .map(Fingerprint::parse)
                .transpose()?;

            let chain = match settings.cert_reqs {
                CertReqs::None => None,
                CertReqs::Required => Some(
                    WebPkiServerVerifier::builder_with_provider(
                        Arc::new(root_store(settings)?),
                        provider.clone(),
                    )
                    .build()
                    .map_err(|error| Error::Ssl(error.to_string()))?,
                ),
            };

            let verifier = PolicyVerifier {
                chain,
                hostname: settings.assert_hostname.clone(),
                fingerprint,
                provider: provider.clone(),
            };

            let builder = rustls::ClientConfig::builder_with_provider(provider)
                .with_safe_default_protocol_versions()
                .map_err(|error| Error::Ssl(error.to_string()))?
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier));

            let mut config = match &settings.client_cert {
                Some((cert, key)) => {
                    let (certs, key) = client_identity(cert, key)?;
                    builder
                        .with_client_auth_cert(certs, key)
                        .map_err(|error| Error::Ssl(error.to_string()))?
                }
                None => builder.with_no_client_auth(),
            };
            config.alpn_protocols.push(b"http/1.1".to_vec());

            Ok(Self {
                config: Arc::new(config),
                verified: settings.cert_reqs == CertReqs::Required,
            })
        }

        /// Run the TLS handshake for `hostname` over `stream`.
        pub(crate) async fn connect(
            &self,
            hostname: &str,
            stream: TcpStream,
        ) -> Result<TlsStream<TcpStream>, Error> {
            if !self.verified {
                warn!(
                    host = hostname,
                    "Unverified HTTPS request is being made. Adding certificate verification is strongly advised."
                );
            }

            let domain = ServerName::try_from(hostname.to_owned())
                .map_err(|error| Error::Ssl(format!("invalid server name {hostname}: {error}")))?;
            let connector = tokio_rustls::TlsConnector::from(self.config.clone());
            let stream = connector
                .connect(domain, stream)
                .await
                .map_err(|error| Error::Ssl(error.to_string()))?;
            trace!("tls handshake complete");
            Ok(stream)
        }
    }

}
