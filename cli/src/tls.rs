use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;

/// Certificate and key locations for `serve --tls`.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsConfig {
    /// Explicit paths win; missing ones default to `<data_dir>/tls/{cert,key}.pem`.
    pub fn resolve(data_dir: &Path, cert: Option<PathBuf>, key: Option<PathBuf>) -> Result<Self> {
        let tls_dir = data_dir.join("tls");
        if cert.is_none() || key.is_none() {
            std::fs::create_dir_all(&tls_dir)
                .with_context(|| format!("Failed to create TLS directory: {}", tls_dir.display()))?;
        }
        Ok(Self {
            cert_path: cert.unwrap_or_else(|| tls_dir.join("cert.pem")),
            key_path: key.unwrap_or_else(|| tls_dir.join("key.pem")),
        })
    }

    /// Reuse the existing pair or generate a self-signed one. Returns the
    /// certificate's SHA-256 fingerprint.
    pub fn ensure_cert(&self) -> Result<String> {
        if self.cert_path.exists() && self.key_path.exists() {
            return fingerprint_from_pem_file(&self.cert_path);
        }
        info!(path = %self.cert_path.display(), "generating self-signed TLS certificate");
        self.generate_self_signed()
    }

    fn generate_self_signed(&self) -> Result<String> {
        let mut params =
            rcgen::CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .context("failed to create certificate params")?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "brigade self-signed");
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, "brigade");
        params
            .subject_alt_names
            .push(rcgen::SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));

        let key_pair = rcgen::KeyPair::generate().context("failed to generate key pair")?;
        let cert = params
            .self_signed(&key_pair)
            .context("failed to generate self-signed certificate")?;

        std::fs::write(&self.cert_path, cert.pem()).with_context(|| {
            format!("Failed to write certificate to {}", self.cert_path.display())
        })?;
        std::fs::write(&self.key_path, key_pair.serialize_pem()).with_context(|| {
            format!("Failed to write private key to {}", self.key_path.display())
        })?;

        Ok(fingerprint(cert.der()))
    }
}

/// Colon-separated uppercase SHA-256 of DER bytes.
fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn fingerprint_from_pem_file(cert_path: &Path) -> Result<String> {
    let pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read certificate from {}", cert_path.display()))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .context("No certificate found in PEM file")?
        .context("Invalid certificate PEM")?;
    Ok(fingerprint(cert.as_ref()))
}
