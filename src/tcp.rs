// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! TCP transport implementation

use super::error::Error;
use super::transport::Channel;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

/// Default TCP timeout
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// a set of options for the TCP connection
#[derive(Debug, Clone)]
pub struct Options {
    pub connection_timeout: Option<Duration>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    address: String,
}

impl Options {
    pub fn new(address: String) -> Options {
        Options {
            connection_timeout: None,
            read_timeout: TIMEOUT,
            write_timeout: TIMEOUT,
            address,
        }
    }
}

pub struct TcpChannel {
    stream: TcpStream,
    peer: String,
}

impl TcpChannel {
    /// Connects as an initiator.
    pub fn connect(options: Options) -> Result<TcpChannel, Error> {
        let stream = match options.connection_timeout {
            Some(timeout) => {
                // Trying connecting with timeout
                match options.address.parse::<std::net::SocketAddr>() {
                    Ok(socket_address) => TcpStream::connect_timeout(&socket_address, timeout)?,
                    Err(e) => return Err(Error::Connect(e.to_string())),
                }
            }
            None => {
                // Trying connecting with no timeout defined
                TcpStream::connect(&options.address)?
            }
        };
        stream.set_read_timeout(Some(options.read_timeout))?;
        stream.set_write_timeout(Some(options.write_timeout))?;
        Ok(TcpChannel {
            peer: options.address,
            stream,
        })
    }

    /// Wraps a socket the supervisor accepted.
    pub fn accepted(stream: TcpStream) -> Result<TcpChannel, Error> {
        let peer = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "unknown".to_string(),
        };
        stream.set_read_timeout(Some(TIMEOUT))?;
        stream.set_write_timeout(Some(TIMEOUT))?;
        Ok(TcpChannel { stream, peer })
    }
}

impl Channel for TcpChannel {
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
        self.stream.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        // both halves; the peer sees EOF instead of a reset
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }

    fn peer_label(&self) -> String {
        self.peer.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn exchanges_bytes_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut ch = TcpChannel::accepted(stream).unwrap();
            let mut buf = [0u8; 4];
            ch.read_exact(&mut buf).unwrap();
            ch.write_all(&buf).unwrap();
        });

        let mut opts = Options::new(addr.to_string());
        opts.read_timeout = Duration::from_secs(2);
        opts.write_timeout = Duration::from_secs(2);
        let mut ch = TcpChannel::connect(opts).unwrap();
        ch.write_all(&[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        ch.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        server.join().unwrap();
    }

    #[test]
    fn read_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut opts = Options::new(addr.to_string());
        opts.read_timeout = Duration::from_millis(50);
        let mut ch = TcpChannel::connect(opts).unwrap();
        let (_held, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1];
        assert!(ch.read_exact(&mut buf).is_err());
    }
}
