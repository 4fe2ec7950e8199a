//! TLS material for the transport connection.

use std::path::Path;

use crate::config::TlsSettings;

use super::TransportError;

const BEGIN_CERT: &str = "-----BEGIN CERTIFICATE-----";
const END_CERT: &str = "-----END CERTIFICATE-----";

/// PEM-encoded CA chain used to verify the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    ca_chain_pem: String,
    certificates: usize,
}

impl TlsMaterial {
    /// Loads TLS material when enabled; `Ok(None)` for plain connections.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Tls` if TLS is enabled and the CA file is
    /// missing, unreadable or holds no well-formed certificate.
    pub fn from_settings(settings: &TlsSettings) -> Result<Option<Self>, TransportError> {
        if !settings.enabled {
            return Ok(None);
        }
        let path = settings
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransportError::Tls("tls.enabled requires tls.ca_cert_path".to_string()))?;
        Self::load(path).map(Some)
    }

    /// Reads and checks a PEM CA bundle.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Tls` if the file cannot be read or is not a
    /// sequence of complete certificate blocks.
    pub fn load(path: &Path) -> Result<Self, TransportError> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| TransportError::Tls(format!("cannot read {}: {e}", path.display())))?;
        Self::from_pem(pem).map_err(|reason| TransportError::Tls(format!("{}: {reason}", path.display())))
    }

    fn from_pem(pem: String) -> Result<Self, String> {
        let mut certificates = 0;
        let mut rest = pem.as_str();
        while let Some(start) = rest.find(BEGIN_CERT) {
            let body = &rest[start + BEGIN_CERT.len()..];
            let end = body
                .find(END_CERT)
                .ok_or_else(|| format!("certificate {} is not terminated", certificates + 1))?;
            if body[..end].trim().is_empty() {
                return Err(format!("certificate {} is empty", certificates + 1));
            }
            certificates += 1;
            rest = &body[end + END_CERT.len()..];
        }
        if certificates == 0 {
            return Err("no PEM certificate found".to_string());
        }
        Ok(Self {
            ca_chain_pem: pem,
            certificates,
        })
    }

    #[must_use]
    pub fn ca_chain_pem(&self) -> &str {
        &self.ca_chain_pem
    }

    /// Number of certificates in the chain.
    #[must_use]
    pub fn certificates(&self) -> usize {
        self.certificates
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("certificates", &self.certificates)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CERT: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUabc\n-----END CERTIFICATE-----\n";

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn disabled_tls_yields_none() {
        assert_eq!(TlsMaterial::from_settings(&TlsSettings::default()).unwrap(), None);
    }

    #[test]
    fn loads_chain_with_multiple_certificates() {
        let file = write_temp(&format!("{CERT}{CERT}"));
        let settings = TlsSettings {
            enabled: true,
            ca_cert_path: Some(file.path().to_path_buf()),
        };
        let material = TlsMaterial::from_settings(&settings).unwrap().unwrap();
        assert_eq!(material.certificates(), 2);
        assert!(material.ca_chain_pem().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn garbage_file_is_fatal() {
        let file = write_temp("not a certificate");
        assert!(matches!(TlsMaterial::load(file.path()), Err(TransportError::Tls(_))));
    }

    #[test]
    fn truncated_certificate_is_fatal() {
        let file = write_temp("-----BEGIN CERTIFICATE-----\nMIIB\n");
        let err = TlsMaterial::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("not terminated"));
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = TlsMaterial::load(Path::new("/nonexistent/ca.pem")).unwrap_err();
        assert!(matches!(err, TransportError::Tls(_)));
    }
}
