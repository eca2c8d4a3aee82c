// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Pluggable byte sources and sinks
//!
//! The transfer engine never assumes a file on disk: it reads from a
//! [`ByteSource`] and writes to a [`ByteSink`]. In-memory implementations
//! back the tests; filesystem adapters resolve the virtual-file path
//! template. Template expansion lives here, in the adapter, not in the
//! engine.

use super::config::Direction;
use super::error::Error;
use chrono::Utc;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub trait ByteSource: Send {
    /// Reads up to `buf.len()` bytes; 0 means end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Total size when known, used for reservation and progress ratios.
    fn size_hint(&self) -> Option<u64> {
        None
    }

    /// Advances past `n` bytes; used when a transfer restarts mid-file.
    /// The default reads and discards, seekable sources do better.
    fn skip(&mut self, mut n: u64) -> Result<(), Error> {
        let mut buf = [0u8; 8192];
        while n > 0 {
            let want = (buf.len() as u64).min(n) as usize;
            let got = self.read(&mut buf[..want])?;
            if got == 0 {
                return Ok(());
            }
            n -= got as u64;
        }
        Ok(())
    }
}

pub trait ByteSink: Send {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Cuts the sink back to `len` bytes so a restarted transfer appends
    /// from the last completed checkpoint.
    fn truncate(&mut self, len: u64) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;
}

pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> MemorySource {
        MemorySource { data, pos: 0 }
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        self.pos = (self.pos as u64 + n).min(self.data.len() as u64) as usize;
        Ok(())
    }
}

/// Appends into a shared buffer; the handle stays valid after the sink is
/// consumed, so tests and resume paths can inspect what arrived.
pub struct MemorySink {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink {
            buf: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_buffer(buf: Arc<Mutex<Vec<u8>>>) -> MemorySink {
        MemorySink { buf }
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<u8>>> {
        self.buf.clone()
    }
}

impl Default for MemorySink {
    fn default() -> MemorySink {
        MemorySink::new()
    }
}

impl ByteSink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.buf.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.buf.lock().unwrap().truncate(len as usize);
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    pub fn open(path: &Path) -> Result<FileSource, Error> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileSource { file, size })
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        Ok(self.file.read(buf)?)
    }

    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Current(n as i64))?;
        Ok(())
    }
}

pub struct FileSink {
    file: File,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<FileSink, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)?;
        Ok(FileSink { file })
    }
}

impl ByteSink for FileSink {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Everything an adapter may need to resolve a virtual file.
pub struct ResolveContext<'a> {
    pub virtual_file: &'a str,
    pub partner: &'a str,
    pub server: &'a str,
    pub direction: Direction,
    pub template: Option<&'a str>,
}

/// Resolves virtual files to concrete streams on the responder.
pub trait FileStore: Send + Sync {
    fn open_source(&self, ctx: &ResolveContext) -> Result<Box<dyn ByteSource>, Error>;
    fn open_sink(&self, ctx: &ResolveContext) -> Result<Box<dyn ByteSink>, Error>;
}

/// Expands `${...}` placeholders in a physical path template.
pub fn expand_template(template: &str, ctx: &ResolveContext) -> String {
    let direction = match ctx.direction {
        Direction::Send => "send",
        Direction::Receive => "receive",
        Direction::Both => "both",
    };
    template
        .replace("${file}", ctx.virtual_file)
        .replace("${virtualFile}", ctx.virtual_file)
        .replace("${partner}", ctx.partner)
        .replace("${serverId}", ctx.server)
        .replace("${direction}", direction)
        .replace("${date}", &Utc::now().format("%Y%m%d").to_string())
}

/// In-memory store keyed by virtual file id. Sinks are reused across
/// transfers of the same file so a restart finds its earlier bytes.
pub struct MemoryStore {
    sources: Mutex<HashMap<String, Vec<u8>>>,
    sinks: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            sources: Mutex::new(HashMap::new()),
            sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, virtual_file: &str, data: Vec<u8>) {
        self.sources
            .lock()
            .unwrap()
            .insert(virtual_file.to_string(), data);
    }

    pub fn sink_contents(&self, virtual_file: &str) -> Option<Vec<u8>> {
        self.sinks
            .lock()
            .unwrap()
            .get(virtual_file)
            .map(|b| b.lock().unwrap().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> MemoryStore {
        MemoryStore::new()
    }
}

impl FileStore for MemoryStore {
    fn open_source(&self, ctx: &ResolveContext) -> Result<Box<dyn ByteSource>, Error> {
        let sources = self.sources.lock().unwrap();
        match sources.get(ctx.virtual_file) {
            Some(data) => Ok(Box::new(MemorySource::new(data.clone()))),
            None => Err(Error::Config(format!(
                "no content for virtual file {}",
                ctx.virtual_file
            ))),
        }
    }

    fn open_sink(&self, ctx: &ResolveContext) -> Result<Box<dyn ByteSink>, Error> {
        let mut sinks = self.sinks.lock().unwrap();
        let buf = sinks
            .entry(ctx.virtual_file.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone();
        Ok(Box::new(MemorySink::with_buffer(buf)))
    }
}

/// Stores files under a root directory, applying the path template.
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: PathBuf) -> LocalDirStore {
        LocalDirStore { root }
    }

    fn resolve(&self, ctx: &ResolveContext) -> PathBuf {
        let template = ctx.template.unwrap_or("${file}");
        self.root.join(expand_template(template, ctx))
    }
}

impl FileStore for LocalDirStore {
    fn open_source(&self, ctx: &ResolveContext) -> Result<Box<dyn ByteSource>, Error> {
        Ok(Box::new(FileSource::open(&self.resolve(ctx))?))
    }

    fn open_sink(&self, ctx: &ResolveContext) -> Result<Box<dyn ByteSink>, Error> {
        Ok(Box::new(FileSink::create(&self.resolve(ctx))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_and_skips() {
        let mut src = MemorySource::new((0u8..100).collect());
        src.skip(10).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(src.read(&mut buf).unwrap(), 5);
        assert_eq!(buf, [10, 11, 12, 13, 14]);
        assert_eq!(src.size_hint(), Some(100));
        src.skip(1000).unwrap();
        assert_eq!(src.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn default_skip_reads_through() {
        struct Plain(MemorySource);
        impl ByteSource for Plain {
            fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
                self.0.read(buf)
            }
        }
        let mut src = Plain(MemorySource::new((0u8..50).collect()));
        src.skip(20).unwrap();
        let mut buf = [0u8; 1];
        src.read(&mut buf).unwrap();
        assert_eq!(buf[0], 20);
    }

    #[test]
    fn memory_sink_truncates() {
        let mut sink = MemorySink::new();
        let handle = sink.handle();
        sink.write(b"hello world").unwrap();
        sink.truncate(5).unwrap();
        sink.write(b"!").unwrap();
        sink.close().unwrap();
        assert_eq!(&*handle.lock().unwrap(), b"hello!");
    }

    #[test]
    fn template_expansion() {
        let ctx = ResolveContext {
            virtual_file: "VF1",
            partner: "P1",
            server: "SRV",
            direction: Direction::Receive,
            template: None,
        };
        let path = expand_template("${partner}/${direction}/${file}.dat", &ctx);
        assert_eq!(path, "P1/receive/VF1.dat");
    }

    #[test]
    fn memory_store_reuses_sink_buffers() {
        let store = MemoryStore::new();
        let ctx = ResolveContext {
            virtual_file: "VF1",
            partner: "P1",
            server: "SRV",
            direction: Direction::Receive,
            template: None,
        };
        let mut sink = store.open_sink(&ctx).unwrap();
        sink.write(b"abc").unwrap();
        drop(sink);
        let mut sink = store.open_sink(&ctx).unwrap();
        sink.truncate(2).unwrap();
        sink.write(b"Z").unwrap();
        assert_eq!(store.sink_contents("VF1").unwrap(), b"abZ");
    }
}
