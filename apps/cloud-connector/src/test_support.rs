use crate::device::Device;
use crate::error::{ConnectorError, DeviceReadError, TransmissionError};
use crate::reading::Reading;
use crate::sink::CloudSink;
use crate::tsdb::TimeSeriesStore;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri};
use axum::Router;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub type SinkCalls = Arc<Mutex<Vec<(String, Reading)>>>;

#[derive(Clone, Copy)]
enum SinkMode {
    Accept,
    Fail,
    Panic,
}

pub struct RecordingSink {
    name: String,
    mode: SinkMode,
    calls: SinkCalls,
}

impl RecordingSink {
    pub fn new(name: &str) -> Self {
        Self::with_mode(name, SinkMode::Accept)
    }

    pub fn failing(name: &str) -> Self {
        Self::with_mode(name, SinkMode::Fail)
    }

    pub fn panicking(name: &str) -> Self {
        Self::with_mode(name, SinkMode::Panic)
    }

    fn with_mode(name: &str, mode: SinkMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> SinkCalls {
        self.calls.clone()
    }
}

#[async_trait]
impl CloudSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transmit(&self, reading: &Reading, device_name: &str) -> Result<(), TransmissionError> {
        self.calls
            .lock()
            .unwrap()
            .push((device_name.to_string(), reading.clone()));
        match self.mode {
            SinkMode::Accept => Ok(()),
            SinkMode::Fail => Err(TransmissionError::NotConnected(self.name.clone())),
            SinkMode::Panic => panic!("sink {} exploded", self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredWrite {
    pub reading: Reading,
    pub device: String,
    pub sinks: Vec<String>,
}

pub struct RecordingStore {
    exists: bool,
    fail_writes: bool,
    created: AtomicBool,
    writes: Mutex<Vec<StoredWrite>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            exists: true,
            fail_writes: false,
            created: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn missing() -> Self {
        Self {
            exists: false,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::new()
        }
    }

    pub fn created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<StoredWrite> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl TimeSeriesStore for RecordingStore {
    async fn exists(&self) -> Result<bool, ConnectorError> {
        Ok(self.exists || self.created())
    }

    async fn create(&self) -> Result<(), ConnectorError> {
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(
        &self,
        reading: &Reading,
        device_name: &str,
        sink_names: &[String],
    ) -> Result<bool, ConnectorError> {
        if self.fail_writes {
            return Err(ConnectorError::Store(sqlx::Error::PoolTimedOut));
        }
        self.writes.lock().unwrap().push(StoredWrite {
            reading: reading.clone(),
            device: device_name.to_string(),
            sinks: sink_names.to_vec(),
        });
        Ok(true)
    }
}

/// Scripted device: fails on the listed read numbers (1-based), can be held
/// mid-read until released, and counts closes.
pub struct ScriptedDevice {
    name: String,
    fail_on: Vec<usize>,
    fail_close: bool,
    reads: AtomicUsize,
    closes: Arc<AtomicUsize>,
    gate: Option<Arc<Gate>>,
}

#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_on: Vec::new(),
            fail_close: false,
            reads: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn failing_on(mut self, reads: &[usize]) -> Self {
        self.fail_on = reads.to_vec();
        self
    }

    pub fn always_failing(self) -> Self {
        let all: Vec<usize> = (1..=10_000).collect();
        self.failing_on(&all)
    }

    pub fn failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn closes(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_data(&self) -> Result<Reading, DeviceReadError> {
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail_on.contains(&read) {
            return Err(DeviceReadError::Timeout(std::time::Duration::from_secs(3)));
        }
        Ok(Reading::new().with("read", read as f64))
    }

    async fn close(&self) -> Result<(), DeviceReadError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(DeviceReadError::Closed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

pub struct HttpCapture {
    addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl HttpCapture {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

/// Local HTTP server that records every request and answers `status`.
pub async fn spawn_http_capture(status: StatusCode) -> HttpCapture {
    #[derive(Clone)]
    struct CaptureState {
        status: StatusCode,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    async fn capture(
        State(state): State<CaptureState>,
        method: Method,
        uri: Uri,
        body: Bytes,
    ) -> (StatusCode, &'static str) {
        state.requests.lock().unwrap().push(CapturedRequest {
            method: method.to_string(),
            path: uri.path().to_string(),
            body: body.to_vec(),
        });
        (state.status, "[1,\"Sent\"]")
    }

    let requests = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new().fallback(capture).with_state(CaptureState {
        status,
        requests: requests.clone(),
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    HttpCapture { addr, requests }
}
