// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! TLS transport implementation (rustls)
//!
//! Certificate material is PEM: a certificate chain, a PKCS#8 or RSA
//! private key, and optionally a CA bundle. On the server side a CA bundle
//! pins the client certificates (mutual auth is required exactly when one
//! is configured); on the client side it pins the roots the server must
//! chain to.

use super::error::Error;
use super::transport::Channel;
use rustls::{Certificate, ClientConnection, PrivateKey, RootCertStore, ServerConnection};
use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn read_certs(path: &Path) -> Result<Vec<Certificate>, Error> {
    let file = File::open(path)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificate in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> Result<PrivateKey, Error> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        let file = File::open(path)?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(file))?;
    }
    match keys.into_iter().next() {
        Some(key) => Ok(PrivateKey(key)),
        None => Err(Error::Tls(format!("no private key in {}", path.display()))),
    }
}

fn read_roots(path: &Path) -> Result<RootCertStore, Error> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(path)? {
        roots
            .add(&cert)
            .map_err(|e| Error::Tls(e.to_string()))?;
    }
    Ok(roots)
}

/// Server-side TLS material, built once and shared across accepted sockets.
pub struct TlsAcceptor {
    config: Arc<rustls::ServerConfig>,
}

impl TlsAcceptor {
    /// `ca` pins client certificates; when absent, clients are anonymous.
    pub fn from_pem(cert: &Path, key: &Path, ca: Option<&Path>) -> Result<TlsAcceptor, Error> {
        let certs = read_certs(cert)?;
        let key = read_key(key)?;
        let builder = rustls::ServerConfig::builder().with_safe_defaults();
        let config = match ca {
            Some(ca) => {
                let roots = read_roots(ca)?;
                let verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots);
                builder
                    .with_client_cert_verifier(verifier.boxed())
                    .with_single_cert(certs, key)
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key),
        }
        .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsAcceptor {
            config: Arc::new(config),
        })
    }

    pub fn accept(&self, stream: TcpStream) -> Result<TlsServerChannel, Error> {
        let peer = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "unknown".to_string(),
        };
        let conn = ServerConnection::new(self.config.clone())
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(TlsServerChannel {
            stream: rustls::StreamOwned::new(conn, stream),
            peer,
        })
    }
}

/// Client-side TLS material.
pub struct TlsConnector {
    config: Arc<rustls::ClientConfig>,
}

impl TlsConnector {
    /// `roots` pins the CAs the server certificate must chain to;
    /// `identity` supplies the client certificate for mutual auth.
    pub fn from_pem(roots: &Path, identity: Option<(&Path, &Path)>) -> Result<TlsConnector, Error> {
        let roots = read_roots(roots)?;
        let builder = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots);
        let config = match identity {
            Some((cert, key)) => builder
                .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
                .map_err(|e| Error::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };
        Ok(TlsConnector {
            config: Arc::new(config),
        })
    }

    pub fn connect(&self, server_name: &str, stream: TcpStream) -> Result<TlsClientChannel, Error> {
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let conn = ClientConnection::new(self.config.clone(), name)
            .map_err(|e| Error::Tls(e.to_string()))?;
        let peer = server_name.to_string();
        Ok(TlsClientChannel {
            stream: rustls::StreamOwned::new(conn, stream),
            peer,
        })
    }
}

pub struct TlsServerChannel {
    stream: rustls::StreamOwned<ServerConnection, TcpStream>,
    peer: String,
}

pub struct TlsClientChannel {
    stream: rustls::StreamOwned<ClientConnection, TcpStream>,
    peer: String,
}

impl Channel for TlsServerChannel {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.stream.write_all(buf)?;
        self.stream.flush()?;
        Ok(())
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.stream.sock.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        self.stream.sock.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

impl Channel for TlsClientChannel {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        self.stream.read_exact(buf)?;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.stream.write_all(buf)?;
        self.stream.flush()?;
        Ok(())
    }

    fn set_receive_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.stream.sock.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.stream.conn.send_close_notify();
        let _ = self.stream.flush();
        self.stream.sock.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}
