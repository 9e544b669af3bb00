//! In-process portal used to drive `RemoteDesktop` without a session bus.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use remote_desktop_portal::capture::{CaptureHandle, FrameSlot};
use remote_desktop_portal::config::Config;
use remote_desktop_portal::portal::{
    build_streams_value, predicted_request_path, CreateSessionRequest, HandshakeStep,
    PendingRequests, PortalTransport, Response, SelectDevicesRequest, SelectSourcesRequest,
    StartRequest, StreamDescriptor,
};
use remote_desktop_portal::types::{PersistMode, Point, Size, SourceTypes};
use remote_desktop_portal::Result;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Str};

pub const SESSION_HANDLE: &str = "/org/freedesktop/portal/desktop/session/1_77/fake";
pub const UNIQUE_NAME: &str = ":1.77";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateSession,
    SelectDevices {
        persist_mode: PersistMode,
        restore_token: Option<String>,
    },
    SelectSources,
    Start,
    CloseRequest,
    CloseSession,
    OpenCapture(u32),
    Keysym { keysym: i32, state: u32 },
    Button { button: i32, state: u32 },
    Motion { dx: f64, dy: f64 },
    MotionAbsolute { stream: u32, x: f64, y: f64 },
    Axis { axis: u32, steps: i32 },
}

impl Call {
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Call::Keysym { .. }
                | Call::Button { .. }
                | Call::Motion { .. }
                | Call::MotionAbsolute { .. }
                | Call::Axis { .. }
        )
    }
}

/// How the fake answers one handshake step.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Status(u32),
    /// The call returns but no `Response` ever arrives.
    NoAnswer,
    /// The call succeeds after the given delay.
    Delay(Duration),
    /// The method call itself never returns.
    Stall,
}

struct FakeState {
    requests: Arc<PendingRequests>,
    calls: Mutex<Vec<(Instant, Call)>>,
    outcomes: Mutex<HashMap<HandshakeStep, Outcome>>,
    streams: Mutex<Vec<StreamDescriptor>>,
    restore_token: Mutex<Option<String>>,
    produce_frames: AtomicBool,
    divergent_paths: AtomicBool,
}

/// Cloneable handle; clones share state so a test can inspect the portal
/// after handing it to `RemoteDesktop`.
#[derive(Clone)]
pub struct FakePortal {
    state: Arc<FakeState>,
}

impl Default for FakePortal {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePortal {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState {
                requests: Arc::new(PendingRequests::new()),
                calls: Mutex::new(Vec::new()),
                outcomes: Mutex::new(HashMap::new()),
                streams: Mutex::new(vec![monitor_stream()]),
                restore_token: Mutex::new(Some("token-1".to_string())),
                produce_frames: AtomicBool::new(true),
                divergent_paths: AtomicBool::new(false),
            }),
        }
    }

    pub fn answer(&self, step: HandshakeStep, outcome: Outcome) -> &Self {
        self.state.outcomes.lock().unwrap().insert(step, outcome);
        self
    }

    pub fn with_streams(&self, streams: Vec<StreamDescriptor>) -> &Self {
        *self.state.streams.lock().unwrap() = streams;
        self
    }

    pub fn with_restore_token(&self, token: Option<&str>) -> &Self {
        *self.state.restore_token.lock().unwrap() = token.map(str::to_string);
        self
    }

    pub fn produce_frames(&self, produce: bool) -> &Self {
        self.state.produce_frames.store(produce, Ordering::SeqCst);
        self
    }

    /// Makes the fake hand back request paths that differ from the predicted ones.
    pub fn divergent_paths(&self, divergent: bool) -> &Self {
        self.state.divergent_paths.store(divergent, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn handshake_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|call| !call.is_input()).collect()
    }

    pub fn input_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_input).collect()
    }

    pub fn clear_calls(&self) {
        self.state.calls.lock().unwrap().clear();
    }

    pub fn pending_requests(&self) -> usize {
        self.state.requests.len()
    }

    fn record(&self, call: Call) {
        self.state.calls.lock().unwrap().push((Instant::now(), call));
    }

    /// Answers a request the way the portal does: the `Response` may arrive
    /// before the method call itself returns.
    fn respond(&self, step: HandshakeStep, handle_token: &str) -> Result<OwnedObjectPath> {
        let predicted = predicted_request_path(UNIQUE_NAME, handle_token)?;
        let path = if self.state.divergent_paths.load(Ordering::SeqCst) {
            predicted_request_path(UNIQUE_NAME, &format!("moved_{handle_token}"))?
        } else {
            predicted
        };

        let status = match self.outcome(step) {
            Outcome::Status(status) => Some(status),
            Outcome::Delay(_) => Some(0),
            Outcome::NoAnswer | Outcome::Stall => None,
        };
        if let Some(status) = status {
            let results = if status == 0 {
                self.results_for(step)
            } else {
                HashMap::new()
            };
            self.state.requests.complete(&path, Response { status, results });
        }
        Ok(path)
    }

    fn outcome(&self, step: HandshakeStep) -> Outcome {
        self.state
            .outcomes
            .lock()
            .unwrap()
            .get(&step)
            .copied()
            .unwrap_or(Outcome::Status(0))
    }

    /// Holds the method call back as scripted for `step`.
    async fn gate(&self, step: HandshakeStep) {
        match self.outcome(step) {
            Outcome::Stall => std::future::pending::<()>().await,
            Outcome::Delay(delay) => tokio::time::sleep(delay).await,
            Outcome::Status(_) | Outcome::NoAnswer => {}
        }
    }

    fn results_for(&self, step: HandshakeStep) -> HashMap<String, OwnedValue> {
        let mut results = HashMap::new();
        match step {
            HandshakeStep::CreateSession => {
                results.insert(
                    "session_handle".to_string(),
                    OwnedValue::from(Str::from(SESSION_HANDLE)),
                );
            }
            HandshakeStep::Start => {
                results.insert("devices".to_string(), OwnedValue::from(3u32));
                let selected_sources = self
                    .calls()
                    .iter()
                    .any(|call| matches!(call, Call::SelectSources));
                if selected_sources {
                    let streams = self.state.streams.lock().unwrap().clone();
                    results.insert(
                        "streams".to_string(),
                        build_streams_value(&streams).expect("streams value"),
                    );
                }
                if let Some(token) = self.state.restore_token.lock().unwrap().clone() {
                    results.insert(
                        "restore_token".to_string(),
                        OwnedValue::from(Str::from(token)),
                    );
                }
            }
            _ => {}
        }
        results
    }
}

pub fn monitor_stream() -> StreamDescriptor {
    StreamDescriptor {
        node_id: 42,
        id: Some("0".to_string()),
        position: Some(Point::new(100, 50)),
        size: Some(Size::new(64, 48)),
        source_type: Some(SourceTypes::MONITOR),
    }
}

impl PortalTransport for FakePortal {
    fn requests(&self) -> Arc<PendingRequests> {
        self.state.requests.clone()
    }

    fn request_path(&self, handle_token: &str) -> Result<OwnedObjectPath> {
        predicted_request_path(UNIQUE_NAME, handle_token)
    }

    async fn create_session(&self, request: &CreateSessionRequest) -> Result<OwnedObjectPath> {
        self.record(Call::CreateSession);
        self.gate(HandshakeStep::CreateSession).await;
        self.respond(HandshakeStep::CreateSession, &request.handle_token)
    }

    async fn select_devices(
        &self,
        _session: &OwnedObjectPath,
        request: &SelectDevicesRequest,
    ) -> Result<OwnedObjectPath> {
        self.record(Call::SelectDevices {
            persist_mode: request.persist_mode,
            restore_token: request.restore_token.clone(),
        });
        self.gate(HandshakeStep::SelectDevices).await;
        self.respond(HandshakeStep::SelectDevices, &request.handle_token)
    }

    async fn select_sources(
        &self,
        _session: &OwnedObjectPath,
        request: &SelectSourcesRequest,
    ) -> Result<OwnedObjectPath> {
        self.record(Call::SelectSources);
        self.gate(HandshakeStep::SelectSources).await;
        self.respond(HandshakeStep::SelectSources, &request.handle_token)
    }

    async fn start(
        &self,
        _session: &OwnedObjectPath,
        request: &StartRequest,
    ) -> Result<OwnedObjectPath> {
        self.record(Call::Start);
        self.gate(HandshakeStep::Start).await;
        self.respond(HandshakeStep::Start, &request.handle_token)
    }

    async fn close_request(&self, _request: &OwnedObjectPath) -> Result<()> {
        self.record(Call::CloseRequest);
        Ok(())
    }

    async fn close_session(&self, _session: &OwnedObjectPath) -> Result<()> {
        self.record(Call::CloseSession);
        Ok(())
    }

    async fn notify_keyboard_keysym(
        &self,
        _session: &OwnedObjectPath,
        keysym: i32,
        state: u32,
    ) -> Result<()> {
        self.record(Call::Keysym { keysym, state });
        Ok(())
    }

    async fn notify_pointer_button(
        &self,
        _session: &OwnedObjectPath,
        button: i32,
        state: u32,
    ) -> Result<()> {
        self.record(Call::Button { button, state });
        Ok(())
    }

    async fn notify_pointer_motion(
        &self,
        _session: &OwnedObjectPath,
        dx: f64,
        dy: f64,
    ) -> Result<()> {
        self.record(Call::Motion { dx, dy });
        Ok(())
    }

    async fn notify_pointer_motion_absolute(
        &self,
        _session: &OwnedObjectPath,
        stream: u32,
        x: f64,
        y: f64,
    ) -> Result<()> {
        self.record(Call::MotionAbsolute { stream, x, y });
        Ok(())
    }

    async fn notify_pointer_axis_discrete(
        &self,
        _session: &OwnedObjectPath,
        axis: u32,
        steps: i32,
    ) -> Result<()> {
        self.record(Call::Axis { axis, steps });
        Ok(())
    }

    async fn open_capture(
        &self,
        _session: &OwnedObjectPath,
        stream: &StreamDescriptor,
        slot: Arc<FrameSlot>,
    ) -> Result<Box<dyn CaptureHandle>> {
        self.record(Call::OpenCapture(stream.node_id));
        let size = stream.size.unwrap_or(Size::new(8, 8));
        let produce = self.state.produce_frames.load(Ordering::SeqCst);
        Ok(Box::new(FakeCapture::start(slot, size, produce)))
    }
}

/// Continuous source publishing a solid frame every few milliseconds.
pub struct FakeCapture {
    running: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
}

impl FakeCapture {
    fn start(slot: Arc<FrameSlot>, size: Size, produce: bool) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let producer = produce.then(|| {
            let running = running.clone();
            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let pixels = vec![0x40; (size.width * size.height * 4) as usize];
                    slot.publish(pixels, size.width, size.height);
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        });
        Self { running, producer }
    }
}

impl CaptureHandle for FakeCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(producer) = self.producer.take() {
            let _ = producer.join();
        }
    }
}

/// Config whose consent file lives in `dir`.
pub fn config_in(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.consent.token_path = Some(dir.path().join("consent.json"));
    config
}
