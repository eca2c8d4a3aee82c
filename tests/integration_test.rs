use pesit::client::{Client, Options, SyncPreference};
use pesit::config::ServerConfig;
use pesit::error::{Diag, Error, D3_301, D3_304};
use pesit::fpdu::{ConnectBuilder, Fpdu, FpduKind};
use pesit::journal::{JournalKey, MemoryJournal, Outcome, TransferJournal};
use pesit::observer::TransferObserver;
use pesit::session::Session;
use pesit::state::Role;
use pesit::stream::{ByteSource, MemorySink, MemorySource, MemoryStore};
use pesit::supervisor::Supervisor;
use pesit::tcp::{Options as TcpOptions, TcpChannel};
use pesit::transfer::CancelToken;
use sha2::{Digest, Sha256};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn server_config(port: u16) -> ServerConfig {
    serde_json::from_str(&format!(
        r#"{{
            "server_id": "SRV",
            "bind_address": "127.0.0.1",
            "port": {},
            "partners": [
                {{"id": "P1", "secret": "x", "access_type": "both"}}
            ],
            "files": [
                {{"id": "VF1", "direction": "both"}},
                {{"id": "VF2", "direction": "send"}},
                {{"id": "SMALL", "direction": "receive", "record_length": 512}}
            ]
        }}"#,
        port
    ))
    .unwrap()
}

struct Fixture {
    supervisor: Supervisor,
    store: Arc<MemoryStore>,
    journal: Arc<MemoryJournal>,
}

fn start_server() -> Fixture {
    init_logs();
    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(MemoryJournal::new());
    let supervisor = Supervisor::start(
        server_config(0),
        store.clone(),
        journal.clone(),
        Arc::new(pesit::observer::LogObserver),
    )
    .unwrap();
    Fixture {
        supervisor,
        store,
        journal,
    }
}

fn dial(fixture: &Fixture) -> TcpChannel {
    let mut opts = TcpOptions::new(fixture.supervisor.local_addr().to_string());
    opts.read_timeout = Duration::from_secs(10);
    opts.write_timeout = Duration::from_secs(10);
    TcpChannel::connect(opts).unwrap()
}

fn client_options() -> Options {
    let mut options = Options::new("P1", "SRV");
    options.password = Some("x".to_string());
    options.base_timeout = Duration::from_secs(10);
    options
}

/// Deterministic byte stream, xorshift over the seed.
fn pseudo_random(seed: u32, len: usize) -> Vec<u8> {
    let mut state = seed;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        out.extend_from_slice(&state.to_be_bytes());
    }
    out.truncate(len);
    out
}

#[derive(Default)]
struct Recorder {
    bytes: Mutex<Vec<(u64, u32)>>,
    failed: Mutex<Option<(u32, Diag)>>,
    completed: Mutex<Option<(u32, u64)>>,
    cancel_at: Option<(u64, CancelToken)>,
}

impl TransferObserver for Recorder {
    fn on_bytes(&self, _transfer_id: u32, bytes: u64, _file_size: Option<u64>, sync_point: u32) {
        self.bytes.lock().unwrap().push((bytes, sync_point));
        if let Some((limit, token)) = &self.cancel_at {
            if bytes >= *limit {
                token.cancel();
            }
        }
    }

    fn on_complete(&self, transfer_id: u32, bytes: u64, _millis: u64) {
        *self.completed.lock().unwrap() = Some((transfer_id, bytes));
    }

    fn on_failed(&self, transfer_id: u32, diag: Diag, _message: &str) {
        *self.failed.lock().unwrap() = Some((transfer_id, diag));
    }
}

/// Source that breaks the session once `fail_after` bytes went out,
/// standing in for a transport torn down mid-transfer.
struct TruncatedSource {
    inner: MemorySource,
    fail_after: u64,
    delivered: u64,
}

impl ByteSource for TruncatedSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.delivered >= self.fail_after {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection torn down",
            )));
        }
        let n = self.inner.read(buf)?;
        self.delivered += n as u64;
        Ok(n)
    }

    fn size_hint(&self) -> Option<u64> {
        self.inner.size_hint()
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        self.inner.skip(n)
    }
}

#[test]
fn happy_send() {
    let fixture = start_server();
    let source_bytes = b"hello world".to_vec();

    let client = Client::new(Box::new(dial(&fixture)), client_options());
    let mut source = MemorySource::new(source_bytes.clone());
    let report = client
        .send_file("VF1", &mut source, &CancelToken::new())
        .unwrap();

    assert_eq!(report.bytes_transferred, 11);
    assert_eq!(report.records_transferred, 1);
    assert_eq!(report.sync_points, 0); // below a MiB, checkpointing is off
    assert_eq!(fixture.store.sink_contents("VF1").unwrap(), source_bytes);
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn happy_receive() {
    let fixture = start_server();
    let content = pseudo_random(42, 5 * 1024 * 1024);
    fixture.store.insert("VF2", content.clone());

    let client = Client::new(Box::new(dial(&fixture)), client_options());
    let mut sink = MemorySink::new();
    let handle = sink.handle();
    let report = client
        .receive_file("VF2", &mut sink, &CancelToken::new())
        .unwrap();

    assert_eq!(report.bytes_transferred, content.len() as u64);
    let received = handle.lock().unwrap().clone();
    assert_eq!(Sha256::digest(&received), Sha256::digest(&content));
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn resume_after_broken_transport() {
    let fixture = start_server();
    let content = pseudo_random(7, 20 * 1024 * 1024);
    const MIB: u64 = 1024 * 1024;

    // first attempt dies between sync points 7 and 8; the client keeps its
    // own journal, the responder writes into the fixture's
    let client_journal = Arc::new(MemoryJournal::new());
    let recorder = Arc::new(Recorder::default());
    let mut options = client_options();
    options.sync = SyncPreference::Fixed {
        interval_kb: 1024,
        window: 4,
    };
    let client = Client::with_collaborators(
        Box::new(dial(&fixture)),
        options.clone(),
        client_journal.clone(),
        recorder.clone(),
    );
    let mut source = TruncatedSource {
        inner: MemorySource::new(content.clone()),
        fail_after: 7 * MIB + MIB / 2,
        delivered: 0,
    };
    let err = client
        .send_file("VF1", &mut source, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));

    let (transfer_id, _) = recorder.failed.lock().unwrap().unwrap();
    let key = JournalKey::new("P1", "VF1", transfer_id);
    assert_eq!(client_journal.outcome(&key), Some(Outcome::Failed));
    let checkpoint = client_journal.restart_point(&key).unwrap();
    assert_eq!(checkpoint.sync_point, 7);
    assert_eq!(checkpoint.bytes, 7 * MIB);

    // second attempt continues from the checkpoint
    let client = Client::with_collaborators(
        Box::new(dial(&fixture)),
        options,
        client_journal.clone(),
        recorder.clone(),
    );
    let mut source = MemorySource::new(content.clone());
    let report = client
        .resume_send("VF1", transfer_id, &mut source, &CancelToken::new())
        .unwrap();

    assert_eq!(report.bytes_transferred, content.len() as u64);
    assert_eq!(client_journal.outcome(&key), Some(Outcome::Completed));
    assert_eq!(
        recorder.completed.lock().unwrap().unwrap(),
        (transfer_id, content.len() as u64)
    );
    // the responder saw the same checkpoints
    assert_eq!(
        fixture.journal.restart_point(&key).map(|cp| cp.sync_point),
        Some(20)
    );
    let received = fixture.store.sink_contents("VF1").unwrap();
    assert_eq!(received.len(), content.len());
    assert_eq!(Sha256::digest(&received), Sha256::digest(&content));
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn wrong_password_is_rejected_before_any_file_work() {
    let fixture = start_server();
    let mut options = client_options();
    options.password = Some("bad".to_string());

    let client = Client::new(Box::new(dial(&fixture)), options);
    let mut source = MemorySource::new(b"data".to_vec());
    let err = client
        .send_file("VF1", &mut source, &CancelToken::new())
        .unwrap_err();

    match err {
        Error::Rejected { diag } => {
            assert_eq!(diag.class, 3);
            assert_eq!(diag, D3_304);
        }
        other => panic!("expected rejection, got {}", other),
    }
    // no CREATE ever reached the store
    assert!(fixture.store.sink_contents("VF1").is_none());
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn unexpected_fpdu_aborts_with_diag() {
    let fixture = start_server();
    let mut session = Session::new(Box::new(dial(&fixture)), Role::Initiator);
    session.ctx.local_conn_id = 42;

    let connect = ConnectBuilder::new("P1", "SRV")
        .password("x")
        .build(42)
        .unwrap();
    let aconnect = session.send_fpdu_with_ack(&connect).unwrap();
    assert_eq!(aconnect.kind(), FpduKind::Aconnect);
    let dst = aconnect.id_src();

    // WRITE without CREATE/OPEN skips the whole file phase
    let write = Fpdu::new(FpduKind::Write, 42, dst);
    match session.send_fpdu_with_ack(&write) {
        Err(Error::RemoteAbort { diag }) => assert_eq!(diag, D3_301),
        other => panic!("expected abort, got {:?}", other.map(|f| f.to_string())),
    }
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn segmented_message_reassembly() {
    let fixture = start_server();
    // three segments of 254 bytes plus a tail
    let text = "abcdefgh".repeat(100);
    let client = Client::new(Box::new(dial(&fixture)), client_options());
    client.send_message(&text).unwrap();
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn stray_message_segment_aborts() {
    let fixture = start_server();
    let mut session = Session::new(Box::new(dial(&fixture)), Role::Initiator);
    session.ctx.local_conn_id = 9;

    let connect = ConnectBuilder::new("P1", "SRV")
        .password("x")
        .build(9)
        .unwrap();
    let aconnect = session.send_fpdu_with_ack(&connect).unwrap();
    let dst = aconnect.id_src();

    // MSGMM without a MSGDM first
    let stray = Fpdu::new(FpduKind::Msgmm, 9, dst)
        .with_param(pesit::fpdu::Param::string(pesit::constant::PI_91_MESSAGE, "def").unwrap());
    match session.send_fpdu_with_ack(&stray) {
        Err(Error::RemoteAbort { diag }) => assert_eq!(diag, D3_301),
        other => panic!("expected abort, got {:?}", other.map(|f| f.to_string())),
    }
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn chunk_size_follows_the_smaller_peer() {
    let fixture = start_server();
    // SMALL is configured with a 512 byte article on the server
    let content = pseudo_random(3, 2048);

    let client = Client::new(Box::new(dial(&fixture)), client_options());
    let mut source = MemorySource::new(content.clone());
    let report = client
        .send_file("SMALL", &mut source, &CancelToken::new())
        .unwrap();

    // min(4096 local, 512 negotiated) = 512 bytes per article
    assert_eq!(report.records_transferred, 4);
    assert_eq!(fixture.store.sink_contents("SMALL").unwrap(), content);
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn cancellation_preserves_checkpoint_state() {
    let fixture = start_server();
    let content = pseudo_random(11, 4 * 1024 * 1024);
    const MIB: u64 = 1024 * 1024;

    let cancel = CancelToken::new();
    let recorder = Arc::new(Recorder {
        cancel_at: Some((2 * MIB, cancel.clone())),
        ..Recorder::default()
    });
    let client_journal = Arc::new(MemoryJournal::new());
    let mut options = client_options();
    options.sync = SyncPreference::Fixed {
        interval_kb: 1024,
        window: 4,
    };
    let client = Client::with_collaborators(
        Box::new(dial(&fixture)),
        options,
        client_journal.clone(),
        recorder.clone(),
    );
    let mut source = MemorySource::new(content);
    let err = client.send_file("VF1", &mut source, &cancel).unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let (transfer_id, _) = recorder.failed.lock().unwrap().unwrap();
    let key = JournalKey::new("P1", "VF1", transfer_id);
    assert_eq!(client_journal.outcome(&key), Some(Outcome::Cancelled));
    // the last acknowledged checkpoint survives for a later resume
    let checkpoint = client_journal.restart_point(&key).unwrap();
    assert_eq!(checkpoint.sync_point, 2);
    assert_eq!(checkpoint.bytes, 2 * MIB);

    // progress never went backwards
    let bytes = recorder.bytes.lock().unwrap();
    for pair in bytes.windows(2) {
        assert!(pair[1].0 >= pair[0].0);
        assert!(pair[1].1 >= pair[0].1);
    }
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn sync_points_are_strictly_increasing() {
    let fixture = start_server();
    let content = pseudo_random(5, 3 * 1024 * 1024);

    let recorder = Arc::new(Recorder::default());
    let mut options = client_options();
    options.sync = SyncPreference::Fixed {
        interval_kb: 512,
        window: 4,
    };
    let client = Client::with_collaborators(
        Box::new(dial(&fixture)),
        options,
        Arc::new(MemoryJournal::new()),
        recorder.clone(),
    );
    let mut source = MemorySource::new(content);
    let report = client
        .send_file("VF1", &mut source, &CancelToken::new())
        .unwrap();
    assert_eq!(report.sync_points, 6);

    let bytes = recorder.bytes.lock().unwrap();
    let syncs: Vec<u32> = bytes
        .iter()
        .map(|(_, s)| *s)
        .filter(|s| *s > 0)
        .collect();
    for pair in syncs.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert_eq!(*syncs.last().unwrap(), 6);
    fixture.supervisor.shutdown(Duration::from_secs(2));
}

#[test]
fn connection_cap_refuses_extra_sockets() {
    init_logs();
    let mut config = server_config(0);
    config.max_connections = 1;
    let store = Arc::new(MemoryStore::new());
    let supervisor = Supervisor::start(
        config,
        store,
        Arc::new(MemoryJournal::new()),
        Arc::new(pesit::observer::LogObserver),
    )
    .unwrap();

    let addr = supervisor.local_addr().to_string();
    let mut opts = TcpOptions::new(addr.clone());
    opts.read_timeout = Duration::from_secs(2);
    opts.write_timeout = Duration::from_secs(2);
    let mut first = Session::new(
        Box::new(TcpChannel::connect(opts.clone()).unwrap()),
        Role::Initiator,
    );
    first.ctx.local_conn_id = 1;
    let connect = ConnectBuilder::new("P1", "SRV").password("x").build(1).unwrap();
    let aconnect = first.send_fpdu_with_ack(&connect).unwrap();
    assert_eq!(aconnect.kind(), FpduKind::Aconnect);

    // give the registry a moment, then the second socket must be cut
    std::thread::sleep(Duration::from_millis(100));
    let mut second = Session::new(
        Box::new(TcpChannel::connect(opts).unwrap()),
        Role::Initiator,
    );
    second.ctx.local_conn_id = 2;
    let connect = ConnectBuilder::new("P1", "SRV").password("x").build(2).unwrap();
    assert!(second.send_fpdu_with_ack(&connect).is_err());

    supervisor.shutdown(Duration::from_secs(2));
}
