use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::sync::Arc;

/// First flight of a real rustls client for `hostname`. With `send_sni`
/// false the server_name extension is left out entirely.
pub fn rustls_client_hello(hostname: &str, send_sni: bool) -> Vec<u8> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config.enable_sni = send_sni;

    let name = ServerName::try_from(hostname.to_string()).unwrap();
    let mut conn = ClientConnection::new(Arc::new(config), name).unwrap();

    let mut hello = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut hello).unwrap();
    }
    hello
}
