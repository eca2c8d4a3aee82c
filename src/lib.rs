// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! This crate implements both sides of the PeSIT E (Hors-SIT) file
//! transfer protocol: the framed wire codec, the mirrored session state
//! machines, a transfer engine with checkpoint/restart, and a connection
//! supervisor running one session per socket over TCP or TLS.
//! # Examples
//! ```no_run
//! # use pesit::{client, tcp, stream::MemorySource, transfer::CancelToken};
//! # use std::time::Duration;
//!
//! # fn main() {
//!     let mut opts = tcp::Options::new("127.0.0.1:5100".to_string());
//!     opts.read_timeout = Duration::from_secs(5);
//!     opts.write_timeout = Duration::from_secs(5);
//!     let channel = match tcp::TcpChannel::connect(opts) {
//!         Ok(ch) => ch,
//!         Err(e) => {
//!             println!("{:?}", e.to_string());
//!             return;
//!         }
//!     };
//!
//!     let mut options = client::Options::new("PARTNER-1", "SRV");
//!     options.password = Some("secret".to_string());
//!     let cl = client::Client::new(Box::new(channel), options);
//!
//!     let mut source = MemorySource::new(b"hello world".to_vec());
//!     match cl.send_file("VF1", &mut source, &CancelToken::new()) {
//!         Ok(report) => println!("sent {} bytes", report.bytes_transferred),
//!         Err(e) => println!("transfer failed: {}", e),
//!     }
//! # }
//! ```
pub mod client;
pub mod codec;
pub mod config;
pub mod constant;
pub mod error;
pub mod fpdu;
pub mod journal;
pub mod observer;
pub mod server;
pub mod session;
pub mod state;
pub mod stream;
pub mod supervisor;
pub mod tcp;
pub mod tls;
pub mod transfer;
pub mod transport;
pub mod validator;
