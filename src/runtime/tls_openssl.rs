use std::pin::Pin;

use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::{
    error::{Error, Result},
    options::TlsOptions,
};

/// Alternate TLS backend selected via the `openssl-tls` feature, for deployments that
/// need to share OpenSSL's certificate store or FIPS build with the rest of the process.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: SslConnector,
}

impl TlsConfig {
    pub(crate) fn new(options: &TlsOptions) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(Error::from)?;

        if options.accept_all_certs {
            builder.set_verify(SslVerifyMode::NONE);
        }
        if let Some(path) = &options.ca_file_path {
            builder.set_ca_file(path).map_err(Error::from)?;
        }
        if let Some(path) = &options.cert_key_file_path {
            builder
                .set_certificate_file(path, SslFiletype::PEM)
                .map_err(Error::from)?;
            builder
                .set_private_key_file(path, SslFiletype::PEM)
                .map_err(Error::from)?;
        }

        Ok(Self {
            connector: builder.build(),
        })
    }
}

pub(crate) async fn connect(
    host: &str,
    tcp: TcpStream,
    cfg: &TlsConfig,
) -> Result<SslStream<TcpStream>> {
    let ssl = cfg
        .connector
        .configure()
        .map_err(Error::from)?
        .into_ssl(host)
        .map_err(Error::from)?;
    let mut stream = SslStream::new(ssl, tcp).map_err(Error::from)?;
    Pin::new(&mut stream).connect().await.map_err(Error::from)?;
    Ok(stream)
}
