use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// TLS setting taken from `STAYBOOK_TLS_CERT` and `STAYBOOK_TLS_KEY`.
#[derive(Debug, Clone, PartialEq)]
pub enum TlsSetting {
    Off,
    Files { cert: PathBuf, key: PathBuf },
    /// Only half of the pair was set. Holds the missing variable.
    Incomplete(&'static str),
}

impl TlsSetting {
    pub fn from_pair(cert: Option<String>, key: Option<String>) -> Self {
        match (cert, key) {
            (None, None) => TlsSetting::Off,
            (Some(cert), Some(key)) => TlsSetting::Files {
                cert: cert.into(),
                key: key.into(),
            },
            (Some(_), None) => TlsSetting::Incomplete("STAYBOOK_TLS_KEY"),
            (None, Some(_)) => TlsSetting::Incomplete("STAYBOOK_TLS_CERT"),
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, TlsSetting::Files { .. })
    }
}

/// Open a PEM file, naming it in any error.
fn pem_reader(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

fn read_chain(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let chain: Vec<_> = rustls_pemfile::certs(&mut pem_reader(path)?).collect::<Result<_, _>>()?;
    if chain.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("{}: no certificate in file", path.display()),
        ));
    }
    Ok(chain)
}

fn read_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem_reader(path)?)?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("{}: no private key in file", path.display()),
        )
    })
}

/// Build the acceptor for pgwire, or `None` when TLS is off.
pub fn acceptor(setting: &TlsSetting) -> io::Result<Option<TlsAcceptor>> {
    let (cert, key) = match setting {
        TlsSetting::Off => return Ok(None),
        TlsSetting::Files { cert, key } => (cert, key),
        TlsSetting::Incomplete(missing) => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("TLS needs a certificate and a key; {missing} is not set"),
            ));
        }
    };

    let mut server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(read_chain(cert)?, read_key(key)?)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    server.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server))))
}
