//! Fixtures shared by the unit tests: a scripted HTTP origin, a pipeline that
//! fakes generation, and an object store that records uploads.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::pipeline::Pipeline;
use crate::storage::{public_url, ObjectStore, StoredObject};

pub enum ServerResponse {
    Success(Vec<u8>),
    Status { code: u16, reason: &'static str },
    TruncatedBody { announced_len: usize, sent: Vec<u8> },
}

/// How long the fixture server waits for each scripted connection.
const ACCEPT_DEADLINE: Duration = Duration::from_secs(5);

/// Serves `responses` in order, one connection each, then exits. Gives up on
/// the rest of the script once no client shows up within `ACCEPT_DEADLINE`,
/// so a test that makes fewer requests fails on its counter instead of hanging.
pub fn spawn_sequence_server(
    responses: Vec<ServerResponse>,
) -> (String, Arc<AtomicUsize>, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let request_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&request_count);

    let handle = thread::spawn(move || {
        for response in responses {
            let Some(mut stream) = accept_before_deadline(&listener) else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            consume_request_headers(&mut stream);

            match response {
                ServerResponse::Success(body) => {
                    write_response(&mut stream, 200, "OK", body.len(), &body)
                }
                ServerResponse::Status { code, reason } => {
                    write_response(&mut stream, code, reason, 4, b"nope")
                }
                ServerResponse::TruncatedBody {
                    announced_len,
                    sent,
                } => write_response(&mut stream, 200, "OK", announced_len, &sent),
            }
            let _ = stream.flush();
        }
    });

    (format!("http://{addr}"), request_count, handle)
}

fn accept_before_deadline(listener: &TcpListener) -> Option<TcpStream> {
    let deadline = Instant::now() + ACCEPT_DEADLINE;
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                return Some(stream);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return None;
                }
                thread::sleep(Duration::from_millis(10));
            }
            Err(err) => panic!("fixture server accept failed: {err}"),
        }
    }
}

fn consume_request_headers(stream: &mut TcpStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let mut buffer = [0u8; 4096];
    let _ = stream.read(&mut buffer);
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    reason: &str,
    content_len: usize,
    body: &[u8],
) {
    let headers = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Length: {content_len}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(headers.as_bytes()).unwrap();
    stream.write_all(body).unwrap();
}

pub fn dir_entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|it| it.count()).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub enum FakeOutcome {
    /// Copy the input image to `<prefix>_00001_.webp`.
    WriteArtifact,
    WriteNothing,
    Fail(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCall {
    pub input_image: PathBuf,
    pub input_existed: bool,
    pub output_prefix: String,
}

pub struct FakePipeline {
    output_dir: PathBuf,
    outcome: FakeOutcome,
    delay: Duration,
    calls: Mutex<Vec<PipelineCall>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakePipeline {
    pub fn new(output_dir: &Path, outcome: FakeOutcome) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            outcome,
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<PipelineCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn write_artifact(&self, input_image: &Path, output_prefix: &str) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let artifact = self.output_dir.join(format!("{output_prefix}_00001_.webp"));
        std::fs::copy(input_image, artifact)?;
        Ok(())
    }
}

#[async_trait]
impl Pipeline for FakePipeline {
    async fn run(&self, input_image: &Path, output_prefix: &str) -> Result<()> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        self.calls.lock().unwrap().push(PipelineCall {
            input_image: input_image.to_path_buf(),
            input_existed: input_image.exists(),
            output_prefix: output_prefix.to_string(),
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match &self.outcome {
            FakeOutcome::WriteArtifact => self.write_artifact(input_image, output_prefix),
            FakeOutcome::WriteNothing => Ok(()),
            FakeOutcome::Fail(message) => Err(anyhow::anyhow!("{message}")),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub object: StoredObject,
    pub bytes: Vec<u8>,
}

pub struct RecordingStore {
    fail: bool,
    uploads: Mutex<Vec<RecordedUpload>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            fail: false,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn upload_file(
        &self,
        bucket: &str,
        object_name: &str,
        path: &Path,
    ) -> Result<StoredObject> {
        if self.fail {
            bail!("permission denied on bucket {bucket}");
        }

        let object = StoredObject {
            bucket: bucket.to_string(),
            name: object_name.to_string(),
            public_url: public_url(
                crate::config::DEFAULT_PUBLIC_BASE_URL,
                bucket,
                object_name,
            )?,
        };
        self.uploads.lock().unwrap().push(RecordedUpload {
            object: object.clone(),
            bytes: std::fs::read(path)?,
        });
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_server_stops_waiting_for_requests_that_never_come() {
        let (base, count, server) = spawn_sequence_server(vec![
            ServerResponse::Success(b"one".to_vec()),
            ServerResponse::Success(b"two".to_vec()),
        ]);

        let mut stream = TcpStream::connect(base.trim_start_matches("http://")).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).unwrap();
        assert!(reply.ends_with(b"one"));

        let started = Instant::now();
        server.join().unwrap();
        assert!(started.elapsed() < ACCEPT_DEADLINE + Duration::from_secs(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
