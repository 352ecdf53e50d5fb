use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls;

/// Server settings, read once from `BOARDLEDGER_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends before the background compactor rewrites a tenant's log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub reclaim_blocks_on_cancel: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "boardledger".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            reclaim_blocks_on_cancel: false,
        }
    }
}

fn var(name: &str) -> Option<String> {
    std::env::var(format!("BOARDLEDGER_{name}")).ok().filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(name: &str) -> io::Result<Option<T>> {
    match var(name) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, format!("BOARDLEDGER_{name}: cannot parse {raw:?}"))
        }),
    }
}

fn flag(name: &str) -> io::Result<Option<bool>> {
    match var(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("BOARDLEDGER_{name}: expected a boolean, got {v:?}"),
            )),
        },
    }
}

impl ServerConfig {
    /// Unset variables keep their defaults; malformed ones are an error
    /// rather than a silent fallback.
    pub fn from_env() -> io::Result<Self> {
        let d = Self::default();
        Ok(Self {
            port: parsed("PORT")?.unwrap_or(d.port),
            bind: var("BIND").unwrap_or(d.bind),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("PASSWORD").unwrap_or(d.password),
            max_connections: parsed("MAX_CONNECTIONS")?.unwrap_or(d.max_connections),
            compact_threshold: parsed("COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            metrics_port: parsed("METRICS_PORT")?,
            tls_cert: var("TLS_CERT"),
            tls_key: var("TLS_KEY"),
            reclaim_blocks_on_cancel: flag("RECLAIM_BLOCKS_ON_CANCEL")?.unwrap_or(d.reclaim_blocks_on_cancel),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// TLS is on when both a certificate and a key are configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

pub fn load_tls_acceptor(cert_path: Option<&str>, key_path: Option<&str>) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "set both BOARDLEDGER_TLS_CERT and BOARDLEDGER_TLS_KEY, or neither",
            ));
        }
    };

    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?)).collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, format!("no private key in {key_path}")))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.compact_threshold, 1000);
        assert!(!c.reclaim_blocks_on_cancel);
        assert!(c.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn half_configured_tls_is_rejected() {
        let err = load_tls_acceptor(Some("cert.pem"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_cert_file_is_io_error() {
        let err = load_tls_acceptor(Some("/nonexistent/cert.pem"), Some("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
