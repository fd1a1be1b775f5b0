//! Certificates and event helpers for the transport scenarios.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use slim_transport::{SurfaceEvent, TlsConfig};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

/// A CA plus server and client leaf certificates on disk.
pub struct Pki {
    pub ca: NamedTempFile,
    pub server_cert: NamedTempFile,
    pub server_key: NamedTempFile,
    pub client_cert: NamedTempFile,
    pub client_key: NamedTempFile,
}

fn pem_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(".pem").unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn path(file: &NamedTempFile) -> Option<PathBuf> {
    Some(file.path().to_path_buf())
}

impl Pki {
    pub fn generate() -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::default();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let server_key = rcgen::KeyPair::generate().unwrap();
        let server_cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();
        let client_key = rcgen::KeyPair::generate().unwrap();
        let client_cert = rcgen::CertificateParams::new(vec!["edge-client".to_string()])
            .unwrap()
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        Self {
            ca: pem_file(&ca_cert.pem()),
            server_cert: pem_file(&server_cert.pem()),
            server_key: pem_file(&server_key.serialize_pem()),
            client_cert: pem_file(&client_cert.pem()),
            client_key: pem_file(&client_key.serialize_pem()),
        }
    }

    /// Server side of mutual TLS.
    pub fn server_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_file: path(&self.server_cert),
            key_file: path(&self.server_key),
            ca_file: path(&self.ca),
            ..Default::default()
        }
    }

    /// Client side of mutual TLS, trusting only the test CA.
    pub fn client_tls(&self) -> TlsConfig {
        TlsConfig {
            cert_file: path(&self.client_cert),
            key_file: path(&self.client_key),
            ca_file: path(&self.ca),
            include_system_ca_certs_pool: false,
            ..Default::default()
        }
    }
}

pub async fn next_event(rx: &mut mpsc::Receiver<SurfaceEvent>) -> SurfaceEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event timeout")
        .expect("event channel closed")
}

/// Skips `Connected` events and returns the next frame payload.
pub async fn next_frame(rx: &mut mpsc::Receiver<SurfaceEvent>) -> (u64, Vec<u8>) {
    loop {
        match next_event(rx).await {
            SurfaceEvent::Frame { conn_id, frame } => return (conn_id, frame.payload),
            SurfaceEvent::Connected { .. } => continue,
            other => panic!("unexpected event {:?}", other),
        }
    }
}
