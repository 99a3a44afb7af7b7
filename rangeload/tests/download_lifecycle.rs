//! End-to-end download scenarios against an in-process HTTP server.
//!
//! The test server is a minimal HTTP/1.1 responder on a local TCP socket:
//! it answers HEAD probes with size/validator metadata and GET requests with
//! full or ranged bodies, and can be told to fail, throttle, or ignore Range
//! headers to exercise the engine's retry, pause/resume, and failure paths.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use rangeload::hash::StreamingHasher;
use rangeload::{
    DownloadConfig, DownloadOrchestrator, HashAlgorithm, OrchestratorConfig, SessionManager,
    Status, TaskId, TaskRecord, WorkMode,
};

// =============================================================================
// Test server
// =============================================================================

#[derive(Clone)]
struct ServerState {
    data: Arc<RwLock<Vec<u8>>>,
    etag: Arc<RwLock<String>>,
    accept_ranges: bool,
    /// Respond 503 to this many GET requests before serving normally.
    fail_gets: Arc<AtomicUsize>,
    /// Serve 200 with the full body even when a Range header is present.
    ignore_range: bool,
    /// Sleep this long between 64KB body chunks.
    throttle: Option<Duration>,
    /// Demand RFC 7616 digest authentication before serving anything.
    digest: Option<DigestGate>,
}

#[derive(Clone)]
struct DigestGate {
    realm: String,
    nonce: String,
    username: String,
    password: String,
}

impl DigestGate {
    /// Validate a client `Authorization` header by recomputing the MD5
    /// response from the client's own nc/cnonce.
    fn accepts(&self, header: &str, method: &str) -> bool {
        let Some(rest) = header.strip_prefix("Digest ") else {
            return false;
        };
        let mut fields = std::collections::HashMap::new();
        for part in rest.split(',') {
            if let Some((key, value)) = part.trim().split_once('=') {
                fields.insert(key.trim(), value.trim().trim_matches('"'));
            }
        }
        let (Some(&username), Some(&uri), Some(&nonce), Some(&nc), Some(&cnonce), Some(&response)) = (
            fields.get("username"),
            fields.get("uri"),
            fields.get("nonce"),
            fields.get("nc"),
            fields.get("cnonce"),
            fields.get("response"),
        ) else {
            return false;
        };
        if username != self.username || nonce != self.nonce {
            return false;
        }
        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, self.password));
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let expected = md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));
        expected == response
    }

    fn challenge(&self) -> String {
        format!(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\"\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            self.realm, self.nonce
        )
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = StreamingHasher::new(HashAlgorithm::Md5);
    hasher.update(input.as_bytes());
    hasher.finalize()
}

struct TestServer {
    addr: SocketAddr,
    state: ServerState,
}

impl TestServer {
    async fn start(data: Vec<u8>, accept_ranges: bool) -> Self {
        let state = ServerState {
            data: Arc::new(RwLock::new(data)),
            etag: Arc::new(RwLock::new("\"v1\"".to_string())),
            accept_ranges,
            fail_gets: Arc::new(AtomicUsize::new(0)),
            ignore_range: false,
            throttle: None,
            digest: None,
        };
        Self::start_with(state).await
    }

    async fn start_with(state: ServerState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });
        Self { addr, state }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn replace_content(&self, data: Vec<u8>, etag: &str) {
        *self.state.data.write().await = data;
        *self.state.etag.write().await = etag.to_string();
    }
}

async fn handle_connection(mut stream: TcpStream, state: ServerState) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buffer.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let request = String::from_utf8_lossy(&buffer);
    let mut lines = request.lines();
    let request_line = lines.next().unwrap_or_default();
    let method = request_line.split_whitespace().next().unwrap_or_default();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
    };
    let range = header("range");

    let data = state.data.read().await.clone();
    let etag = state.etag.read().await.clone();
    let total = data.len();

    if let Some(gate) = &state.digest {
        let authorized = header("authorization")
            .map(|value| gate.accepts(&value, method))
            .unwrap_or(false);
        if !authorized {
            stream.write_all(gate.challenge().as_bytes()).await?;
            return stream.shutdown().await;
        }
    }

    if method == "HEAD" {
        let mut head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nContent-Type: application/octet-stream\r\nETag: {etag}\r\nLast-Modified: Tue, 01 Jul 2025 00:00:00 GMT\r\n"
        );
        if state.accept_ranges {
            head.push_str("Accept-Ranges: bytes\r\n");
        }
        head.push_str("Connection: close\r\n\r\n");
        stream.write_all(head.as_bytes()).await?;
        return stream.shutdown().await;
    }

    if state.fail_gets.load(Ordering::SeqCst) > 0 {
        state.fail_gets.fetch_sub(1, Ordering::SeqCst);
        let head =
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        stream.write_all(head.as_bytes()).await?;
        return stream.shutdown().await;
    }

    let ranged = range
        .filter(|_| state.accept_ranges && !state.ignore_range)
        .and_then(|value| parse_range(&value, total as u64));

    let (status_line, extra, body) = match ranged {
        Some((start, end)) => (
            "HTTP/1.1 206 Partial Content".to_string(),
            format!("Content-Range: bytes {start}-{end}/{total}\r\n"),
            data[start as usize..=end as usize].to_vec(),
        ),
        None => ("HTTP/1.1 200 OK".to_string(), String::new(), data),
    };

    let head = format!(
        "{status_line}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nETag: {etag}\r\n{extra}Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;

    for chunk in body.chunks(64 * 1024) {
        stream.write_all(chunk).await?;
        if let Some(delay) = state.throttle {
            tokio::time::sleep(delay).await;
        }
    }
    stream.shutdown().await
}

fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total - 1
    } else {
        end.parse().ok()?
    };
    (start <= end && end < total).then_some((start, end))
}

// =============================================================================
// Helpers
// =============================================================================

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31).wrapping_add(7)) as u8).collect()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = StreamingHasher::new(HashAlgorithm::Sha256);
    hasher.update(data);
    hasher.finalize()
}

async fn engine(work_dir: &std::path::Path) -> Arc<DownloadOrchestrator> {
    let sessions = SessionManager::new().unwrap();
    DownloadOrchestrator::new(OrchestratorConfig::new(work_dir), sessions)
        .await
        .unwrap()
}

async fn wait_for(
    engine: &Arc<DownloadOrchestrator>,
    task_id: &TaskId,
    wanted: Status,
) -> TaskRecord {
    for _ in 0..600 {
        if let Ok(record) = engine.get(task_id).await {
            if record.status == wanted {
                return record;
            }
            assert!(
                !(record.status.is_terminal() && record.status != wanted),
                "task ended in {} while waiting for {wanted}: {:?}",
                record.status,
                record.error
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task never reached {wanted}");
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn small_file_without_range_support() {
    let data = pattern(512);
    let server = TestServer::start(data.clone(), false).await;
    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/x.bin"), temp.path().join("out"));
    config.max_concurrency = 8;
    config.work_mode = WorkMode::Blocking;

    let record = engine.create(config).await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.progress.downloaded_size, 512);
    assert_eq!(record.progress.segments.len(), 1);
    assert_eq!(record.progress.segments[0].start, 0);
    assert_eq!(record.progress.segments[0].end, 511);

    let output = tokio::fs::read(record.output_file()).await.unwrap();
    assert_eq!(output, data);
}

#[tokio::test]
async fn large_file_four_segments() {
    let data = pattern(4_000_000);
    let server = TestServer::start(data.clone(), true).await;
    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/big.bin"), temp.path().join("out"));
    config.max_concurrency = 4;
    config.chunk_size = 1_048_576;
    config.work_mode = WorkMode::Blocking;

    let record = engine.create(config).await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.progress.total_size, 4_000_000);
    assert_eq!(record.progress.downloaded_size, 4_000_000);

    let ranges: Vec<(u64, u64)> = record
        .progress
        .segments
        .iter()
        .map(|s| (s.start, s.end))
        .collect();
    assert_eq!(
        ranges,
        vec![
            (0, 999_999),
            (1_000_000, 1_999_999),
            (2_000_000, 2_999_999),
            (3_000_000, 3_999_999),
        ]
    );

    let output = tokio::fs::read(record.output_file()).await.unwrap();
    assert_eq!(output.len(), 4_000_000);
    assert_eq!(sha256_hex(&output), sha256_hex(&data));

    // Scratch is gone after completion.
    for segment in &record.progress.segments {
        assert!(!segment.part_path.exists(), "{} left behind", segment.id);
    }
}

#[tokio::test]
async fn empty_file_completes_in_one_step() {
    let server = TestServer::start(Vec::new(), true).await;
    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/empty.bin"), temp.path().join("out"));
    config.work_mode = WorkMode::Blocking;

    let record = engine.create(config).await.unwrap();
    assert_eq!(record.status, Status::Completed);
    assert_eq!(record.progress.total_size, 0);

    let metadata = tokio::fs::metadata(record.output_file()).await.unwrap();
    assert_eq!(metadata.len(), 0);
}

#[tokio::test]
async fn checksum_mismatch_fails_and_keeps_parts() {
    let data = pattern(512);
    let server = TestServer::start(data, false).await;
    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/x.bin"), temp.path().join("out"));
    config.integrity.expected_checksum = Some("deadbeef".repeat(8));
    config.work_mode = WorkMode::NonBlocking;

    let created = engine.create(config).await.unwrap();
    let record = wait_for(&engine, &created.id, Status::Failed).await;

    assert_eq!(record.error.as_ref().unwrap().code, "ChecksumMismatch");

    // Part files remain for inspection; the corrupt output does not.
    assert!(record.progress.segments[0].part_path.exists());
    assert!(!record.output_file().exists());
}

#[tokio::test]
async fn transient_503_retries_until_success() {
    let data = pattern(512);
    let server = TestServer::start(data.clone(), false).await;
    server.state.fail_gets.store(2, Ordering::SeqCst);

    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/flaky.bin"), temp.path().join("out"));
    config.work_mode = WorkMode::Blocking;

    let started = std::time::Instant::now();
    let record = engine.create(config).await.unwrap();
    assert_eq!(record.status, Status::Completed);

    // Two retries with ~1s and ~2s backoff (with jitter) must have elapsed.
    assert!(started.elapsed() >= Duration::from_millis(1500));

    let output = tokio::fs::read(record.output_file()).await.unwrap();
    assert_eq!(output, data);
}

#[tokio::test]
async fn range_ignoring_server_fails_fast() {
    let data = pattern(2_000_000);
    let state = ServerState {
        data: Arc::new(RwLock::new(data)),
        etag: Arc::new(RwLock::new("\"v1\"".to_string())),
        accept_ranges: true,
        fail_gets: Arc::new(AtomicUsize::new(0)),
        ignore_range: true,
        throttle: None,
        digest: None,
    };
    let server = TestServer::start_with(state).await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/liar.bin"), temp.path().join("out"));
    config.max_concurrency = 2;
    config.work_mode = WorkMode::NonBlocking;

    let created = engine.create(config).await.unwrap();
    let record = wait_for(&engine, &created.id, Status::Failed).await;
    assert_eq!(record.error.unwrap().code, "RangeNotSatisfiable");
}

#[tokio::test]
async fn pause_persists_progress_and_resume_completes() {
    let data = pattern(8_000_000);
    let state = ServerState {
        data: Arc::new(RwLock::new(data.clone())),
        etag: Arc::new(RwLock::new("\"v1\"".to_string())),
        accept_ranges: true,
        fail_gets: Arc::new(AtomicUsize::new(0)),
        ignore_range: false,
        throttle: Some(Duration::from_millis(40)),
        digest: None,
    };
    let server = TestServer::start_with(state).await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/slow.bin"), temp.path().join("out"));
    config.max_concurrency = 4;
    config.work_mode = WorkMode::NonBlocking;

    let created = engine.create(config).await.unwrap();

    // Wait until some bytes have landed, then pause mid-flight.
    for _ in 0..600 {
        let record = engine.get(&created.id).await.unwrap();
        if record.progress.downloaded_size > 0 && record.status == Status::Downloading {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let paused = engine.pause(&created.id).await.unwrap();
    assert_eq!(paused.status, Status::Paused);
    let paused_bytes = paused.progress.downloaded_size;
    assert!(paused_bytes > 0, "pause happened before any progress");
    assert!(paused_bytes < 8_000_000, "download finished before pause");

    // The resume record on disk carries the per-segment counters.
    let resume_path = temp
        .path()
        .join(".download-resume")
        .join(format!("{}.resume.json", created.id));
    let resume_json = tokio::fs::read_to_string(&resume_path).await.unwrap();
    let resume: serde_json::Value = serde_json::from_str(&resume_json).unwrap();
    let recorded: u64 = resume["segments"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["downloaded"].as_u64().unwrap())
        .sum();
    assert_eq!(recorded, paused_bytes);

    // Pause is idempotent.
    let again = engine.pause(&created.id).await.unwrap();
    assert_eq!(again.status, Status::Paused);

    // Resume and finish; the result must be bit-identical to the source.
    engine.resume_task(&created.id).await.unwrap();
    let record = wait_for(&engine, &created.id, Status::Completed).await;
    assert_eq!(record.progress.downloaded_size, 8_000_000);

    let output = tokio::fs::read(record.output_file()).await.unwrap();
    assert_eq!(sha256_hex(&output), sha256_hex(&data));

    // Resume record cleaned up after completion.
    assert!(!resume_path.exists());
}

#[tokio::test]
async fn changed_etag_invalidates_resume_and_replans() {
    let old_data = pattern(8_000_000);
    let state = ServerState {
        data: Arc::new(RwLock::new(old_data)),
        etag: Arc::new(RwLock::new("\"v1\"".to_string())),
        accept_ranges: true,
        fail_gets: Arc::new(AtomicUsize::new(0)),
        ignore_range: false,
        throttle: Some(Duration::from_millis(40)),
        digest: None,
    };
    let server = TestServer::start_with(state).await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/volatile.bin"), temp.path().join("out"));
    config.max_concurrency = 4;
    config.work_mode = WorkMode::NonBlocking;

    let created = engine.create(config).await.unwrap();
    for _ in 0..600 {
        let record = engine.get(&created.id).await.unwrap();
        if record.progress.downloaded_size > 0 && record.status == Status::Downloading {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    engine.pause(&created.id).await.unwrap();

    // The resource changes while we are paused.
    let new_data: Vec<u8> = pattern(8_000_000).iter().map(|b| b ^ 0xFF).collect();
    server.replace_content(new_data.clone(), "\"v2\"").await;

    // Resume must discard the stale partition and fetch the new content.
    engine.resume_task(&created.id).await.unwrap();
    let record = wait_for(&engine, &created.id, Status::Completed).await;

    let output = tokio::fs::read(record.output_file()).await.unwrap();
    assert_eq!(sha256_hex(&output), sha256_hex(&new_data));
}

#[tokio::test]
async fn expected_checksum_accepts_correct_digest() {
    let data = pattern(512);
    let digest = sha256_hex(&data);
    let server = TestServer::start(data.clone(), false).await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/ok.bin"), temp.path().join("out"));
    config.integrity.expected_checksum = Some(digest);
    config.work_mode = WorkMode::Blocking;

    let record = engine.create(config).await.unwrap();
    assert_eq!(record.status, Status::Completed);
}

#[tokio::test]
async fn digest_protected_request_authenticates() {
    let state = ServerState {
        data: Arc::new(RwLock::new(b"guarded payload".to_vec())),
        etag: Arc::new(RwLock::new("\"v1\"".to_string())),
        accept_ranges: false,
        fail_gets: Arc::new(AtomicUsize::new(0)),
        ignore_range: false,
        throttle: None,
        digest: Some(DigestGate {
            realm: "downloads@test".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            username: "mufasa".to_string(),
            password: "circle-of-life".to_string(),
        }),
    };
    let server = TestServer::start_with(state).await;

    let sessions = SessionManager::new().unwrap();
    let session_state = rangeload::session::SessionState {
        auth: Some(rangeload::session::AuthCredentials::Digest {
            username: "mufasa".to_string(),
            password: "circle-of-life".to_string(),
        }),
        ..Default::default()
    };
    let id = sessions
        .create(Some("digest-session".to_string()), Some(session_state))
        .await;

    // The 401 challenge is answered and the retry succeeds.
    let mut options = rangeload::session::PreRequestOptions::new(server.url("/guarded.bin"));
    options.session_id = Some(id);
    let outcome = sessions.pre_request(options).await.unwrap();
    assert_eq!(outcome.status, 200);

    // Without digest credentials the gate stays shut.
    let anonymous = rangeload::session::PreRequestOptions::new(server.url("/guarded.bin"));
    let outcome = sessions.pre_request(anonymous).await.unwrap();
    assert_eq!(outcome.status, 401);
}

#[tokio::test]
async fn cancel_removes_scratch() {
    let data = pattern(8_000_000);
    let state = ServerState {
        data: Arc::new(RwLock::new(data)),
        etag: Arc::new(RwLock::new("\"v1\"".to_string())),
        accept_ranges: true,
        fail_gets: Arc::new(AtomicUsize::new(0)),
        ignore_range: false,
        throttle: Some(Duration::from_millis(40)),
        digest: None,
    };
    let server = TestServer::start_with(state).await;

    let temp = tempfile::TempDir::new().unwrap();
    let engine = engine(temp.path()).await;

    let mut config = DownloadConfig::new(server.url("/doomed.bin"), temp.path().join("out"));
    config.max_concurrency = 2;
    config.work_mode = WorkMode::NonBlocking;

    let created = engine.create(config).await.unwrap();
    for _ in 0..600 {
        let record = engine.get(&created.id).await.unwrap();
        if record.progress.downloaded_size > 0 && record.status == Status::Downloading {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let cancelled = engine.cancel(&created.id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);

    for segment in &cancelled.progress.segments {
        assert!(!segment.part_path.exists(), "{} not cleaned", segment.id);
    }
    let resume_path = temp
        .path()
        .join(".download-resume")
        .join(format!("{}.resume.json", created.id));
    assert!(!resume_path.exists());
}
