use std::sync::Arc;

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{
    error::{Error, Result},
    options::TlsOptions,
};

/// Cached rustls configuration. Building a `ClientConfig` is expensive so callers build one
/// `TlsConfig` per cluster and reuse it for every connection.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl TlsConfig {
    pub(crate) fn new(options: &TlsOptions) -> Result<Self> {
        let mut store = RootCertStore::empty();
        if let Some(ders) = &options.root_certificates {
            for der in ders {
                store
                    .add(der.clone())
                    .map_err(|e| Error::invalid_tls_config(e.to_string()))?;
            }
        } else {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        let builder = ClientConfig::builder().with_root_certificates(store);
        let mut config = builder.with_no_client_auth();

        if options.accept_all_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}

pub(crate) async fn connect(
    host: &str,
    tcp: TcpStream,
    cfg: &TlsConfig,
) -> Result<TlsStream<TcpStream>> {
    let name = ServerName::try_from(host.to_owned())
        .map_err(|e| Error::dns_resolve(format!("invalid server name {host:?}: {e}")))?;
    let stream = cfg
        .connector
        .connect(name, tcp)
        .await
        .map_err(Error::from)?;
    Ok(stream)
}

/// Verifier used when the cluster is configured to skip certificate validation
/// (`ssl=no_verify` on the connection string). Never the default.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
