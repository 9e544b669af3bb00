//! The public, synchronous remote desktop session.
//!
//! `RemoteDesktop` owns a small multi-threaded tokio runtime. The portal's
//! signal listener runs on its workers while public calls `block_on` from the
//! caller's thread, so a caller waiting for a handshake step never starves
//! the task that delivers the step's completion.
//!
//! Calls made from inside another tokio runtime are moved off its scheduler
//! first: `block_in_place` on a multi-thread runtime, a scoped helper thread
//! on a current-thread one. Either way the calling task is blocked for the
//! duration of the call.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tracing::{debug, info, warn};
use zbus::zvariant::OwnedObjectPath;

use crate::capture::{Frame, FrameBridge, FrameSlot};
use crate::config::Config;
use crate::consent::{ConsentRecord, ConsentStore};
use crate::error::{Error, Result};
use crate::input::{InputStep, InputTranslator};
use crate::portal::{
    DbusPortal, NegotiatedSession, NegotiationRequest, Negotiator, PortalTransport,
    StreamDescriptor,
};
use crate::types::{Capabilities, PersistMode, Point, Size};

/// Lifecycle of a [`RemoteDesktop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Negotiating,
    Active,
    Closing,
    Closed,
    Failed(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Uninitialized => f.write_str("uninitialized"),
            SessionState::Negotiating => f.write_str("negotiating"),
            SessionState::Active => f.write_str("active"),
            SessionState::Closing => f.write_str("closing"),
            SessionState::Closed => f.write_str("closed"),
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Everything that exists only while the session is active.
struct ActiveSession {
    handle: OwnedObjectPath,
    capabilities: Capabilities,
    persist_mode: PersistMode,
    streams: Vec<StreamDescriptor>,
    bridge: Option<FrameBridge>,
    /// Last pointer position sent with relative motion.
    pointer: Mutex<Point>,
}

impl ActiveSession {
    fn bridge(&self) -> Result<&FrameBridge> {
        self.bridge.as_ref().ok_or(Error::StreamUnavailable)
    }
}

enum Lifecycle {
    Uninitialized,
    Negotiating,
    Active(Arc<ActiveSession>),
    Closing,
    Closed,
    Failed(String),
}

impl Lifecycle {
    fn state(&self) -> SessionState {
        match self {
            Lifecycle::Uninitialized => SessionState::Uninitialized,
            Lifecycle::Negotiating => SessionState::Negotiating,
            Lifecycle::Active(_) => SessionState::Active,
            Lifecycle::Closing => SessionState::Closing,
            Lifecycle::Closed => SessionState::Closed,
            Lifecycle::Failed(reason) => SessionState::Failed(reason.clone()),
        }
    }
}

/// A single-consent remote desktop session: input injection and screen
/// capture granted by one portal dialog.
///
/// Every method is synchronous. It is safe to call them from async code,
/// but they block the calling task; wrap them in `spawn_blocking` to keep
/// a current-thread runtime responsive.
pub struct RemoteDesktop<P: PortalTransport = DbusPortal> {
    config: Config,
    translator: InputTranslator,
    consent: ConsentStore,
    lifecycle: Mutex<Lifecycle>,
    transport: P,
    /// Taken on drop.
    runtime: Option<Runtime>,
}

impl RemoteDesktop<DbusPortal> {
    /// Connects to the session bus using the process-wide configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::with(Config::clone))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        let runtime = build_runtime()?;
        match run_blocking(&runtime, DbusPortal::connect()) {
            Ok(transport) => Ok(Self::assemble(config, transport, runtime)),
            Err(err) => {
                release_runtime(runtime);
                Err(err)
            }
        }
    }
}

impl<P: PortalTransport> RemoteDesktop<P> {
    /// Uses `transport` instead of the session bus.
    pub fn with_transport(config: Config, transport: P) -> Result<Self> {
        let runtime = build_runtime()?;
        Ok(Self::assemble(config, transport, runtime))
    }

    fn assemble(config: Config, transport: P, runtime: Runtime) -> Self {
        Self {
            translator: InputTranslator::new(&config.input),
            consent: ConsentStore::new(config.token_path()),
            config,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            transport,
            runtime: Some(runtime),
        }
    }

    /// Runs `future` to completion on the session runtime.
    fn block_on<F>(&self, future: F) -> Result<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| Error::InvalidState("runtime shut down".into()))?;
        Ok(run_blocking(runtime, future))
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn consent_store(&self) -> &ConsentStore {
        &self.consent
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle().state()
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Active(_))
    }

    /// Portal session handle while active.
    pub fn session_handle(&self) -> Option<OwnedObjectPath> {
        match &*self.lifecycle() {
            Lifecycle::Active(session) => Some(session.handle.clone()),
            _ => None,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        match &*self.lifecycle() {
            Lifecycle::Active(session) => session.capabilities,
            _ => Capabilities::empty(),
        }
    }

    /// Runs the portal handshake; shows the consent dialog unless a stored
    /// consent covers the request.
    ///
    /// Valid from `Uninitialized` and `Closed`. On failure the session is
    /// left `Failed` until [`close`](Self::close).
    pub fn initialize(&self, persist_mode: PersistMode, enable_capture: bool) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle();
            if !matches!(*lifecycle, Lifecycle::Uninitialized | Lifecycle::Closed) {
                return Err(Error::InvalidState(lifecycle.state().to_string()));
            }
            *lifecycle = Lifecycle::Negotiating;
        }

        let mut requested = Capabilities::INPUT;
        if enable_capture {
            requested |= Capabilities::CAPTURE;
        }
        let restore_token = self.restore_token_for(requested, persist_mode);
        info!(
            ?requested,
            ?persist_mode,
            restoring = restore_token.is_some(),
            "Initializing remote desktop session"
        );

        let request = NegotiationRequest {
            capabilities: requested,
            persist_mode,
            restore_token,
        };
        let result = self
            .block_on(self.establish(&request))
            .and_then(|result| result);

        match result {
            Ok((session, new_token)) => {
                let session = Arc::new(session);
                {
                    let mut lifecycle = self.lifecycle();
                    if !matches!(*lifecycle, Lifecycle::Negotiating) {
                        drop(lifecycle);
                        warn!("Session closed while negotiating, tearing down");
                        self.teardown(&session);
                        *self.lifecycle() = Lifecycle::Closed;
                        return Err(Error::InvalidState(SessionState::Closed.to_string()));
                    }
                    *lifecycle = Lifecycle::Active(session.clone());
                }
                self.remember_consent(&session, new_token);
                info!(
                    session = %session.handle,
                    capabilities = ?session.capabilities,
                    "Remote desktop session active"
                );
                Ok(())
            }
            Err(err) => {
                if err.is_permission_denied() && self.config.consent.invalidate_on_decline {
                    if let Err(invalidate_err) = self.consent.invalidate() {
                        warn!(%invalidate_err, "Failed to invalidate consent record");
                    }
                }
                warn!(%err, "Remote desktop initialization failed");
                let mut lifecycle = self.lifecycle();
                if matches!(*lifecycle, Lifecycle::Negotiating) {
                    *lifecycle = Lifecycle::Failed(err.to_string());
                } else if matches!(*lifecycle, Lifecycle::Closing) {
                    *lifecycle = Lifecycle::Closed;
                }
                Err(err)
            }
        }
    }

    fn restore_token_for(
        &self,
        requested: Capabilities,
        persist_mode: PersistMode,
    ) -> Option<String> {
        if !persist_mode.persists() {
            return None;
        }
        let record = self.consent.load()?;
        if ConsentStore::is_sufficient(&record, requested) {
            Some(record.restore_token)
        } else {
            info!(
                granted = ?record.granted,
                ?requested,
                "Stored consent does not cover the request, asking again"
            );
            None
        }
    }

    fn remember_consent(&self, session: &ActiveSession, restore_token: Option<String>) {
        if !session.persist_mode.persists() {
            return;
        }
        let Some(token) = restore_token else {
            debug!("Portal returned no restore token");
            return;
        };
        let record = ConsentRecord::new(token, session.capabilities, session.persist_mode);
        if let Err(err) = self.consent.save(&record) {
            warn!(path = %self.consent.path().display(), %err, "Failed to save consent record");
        }
    }

    async fn establish(
        &self,
        request: &NegotiationRequest,
    ) -> Result<(ActiveSession, Option<String>)> {
        let negotiated = Negotiator::new(&self.transport, &self.config.handshake)
            .negotiate(request)
            .await?;

        let bridge = if request.capabilities.contains(Capabilities::CAPTURE) {
            match self.open_bridge(&negotiated).await {
                Ok(bridge) => Some(bridge),
                Err(err) => {
                    let close = self.transport.close_session(&negotiated.session_handle);
                    if let Err(close_err) = close.await {
                        debug!(%close_err, "Session.Close failed");
                    }
                    return Err(err);
                }
            }
        } else {
            None
        };

        let mut capabilities = negotiated.granted(request.capabilities);
        if bridge.is_none() {
            capabilities.remove(Capabilities::CAPTURE);
        }
        let session = ActiveSession {
            handle: negotiated.session_handle,
            capabilities,
            persist_mode: request.persist_mode,
            streams: negotiated.streams,
            bridge,
            pointer: Mutex::new(Point::default()),
        };
        Ok((session, negotiated.restore_token))
    }

    async fn open_bridge(&self, negotiated: &NegotiatedSession) -> Result<FrameBridge> {
        let Some(stream) = negotiated.streams.first() else {
            warn!(
                session = %negotiated.session_handle,
                "Capture requested but no stream was granted"
            );
            return Err(Error::StreamUnavailable);
        };
        let slot = Arc::new(FrameSlot::new());
        let handle = self
            .transport
            .open_capture(&negotiated.session_handle, stream, slot.clone())
            .await?;
        Ok(FrameBridge::new(stream.clone(), slot, handle))
    }

    /// Ends the session. Safe to call in any state and more than once.
    ///
    /// While `initialize` is still negotiating, this only marks the session
    /// `Closing`; the negotiating call tears down whatever it obtained and
    /// leaves the session `Closed`.
    pub fn close(&self) {
        let previous = {
            let mut lifecycle = self.lifecycle();
            if matches!(*lifecycle, Lifecycle::Closed | Lifecycle::Closing) {
                return;
            }
            if matches!(*lifecycle, Lifecycle::Negotiating) {
                info!("Close requested while negotiating");
                *lifecycle = Lifecycle::Closing;
                return;
            }
            std::mem::replace(&mut *lifecycle, Lifecycle::Closing)
        };

        if let Lifecycle::Active(session) = previous {
            self.teardown(&session);
            info!(session = %session.handle, "Remote desktop session closed");
        }
        *self.lifecycle() = Lifecycle::Closed;
    }

    fn teardown(&self, session: &ActiveSession) {
        if let Some(bridge) = &session.bridge {
            bridge.stop();
        }
        if let Err(err) = self
            .block_on(self.transport.close_session(&session.handle))
            .and_then(|result| result)
        {
            warn!(session = %session.handle, %err, "Session.Close failed");
        }
    }

    fn active(&self) -> Result<Arc<ActiveSession>> {
        match &*self.lifecycle() {
            Lifecycle::Active(session) => Ok(session.clone()),
            _ => Err(Error::NotInitialized),
        }
    }

    pub fn click(&self, point: Point, button: u32) -> Result<()> {
        let session = self.active()?;
        let plan = self.translator.click(point, button)?;
        self.execute(&session, plan)
    }

    pub fn move_mouse(&self, point: Point) -> Result<()> {
        let session = self.active()?;
        self.execute(&session, self.translator.move_to(point))
    }

    pub fn drag(&self, from: Point, to: Point, button: u32) -> Result<()> {
        let session = self.active()?;
        let plan = self.translator.drag(from, to, button)?;
        self.execute(&session, plan)
    }

    /// Scrolls by discrete wheel steps; positive `dy` scrolls down.
    pub fn scroll(&self, dx: i32, dy: i32) -> Result<()> {
        let session = self.active()?;
        self.execute(&session, self.translator.scroll(dx, dy))
    }

    pub fn type_text(&self, text: &str, interval: Duration) -> Result<()> {
        let session = self.active()?;
        let plan = self.translator.type_text(text, interval)?;
        self.execute(&session, plan)
    }

    pub fn press_key(&self, key: &str) -> Result<()> {
        let session = self.active()?;
        let plan = self.translator.press_key(key)?;
        self.execute(&session, plan)
    }

    pub fn key_combo<S: AsRef<str>>(&self, keys: &[S]) -> Result<()> {
        let session = self.active()?;
        let plan = self.translator.key_combo(keys)?;
        self.execute(&session, plan)
    }

    /// PNG of the screen as of this call.
    pub fn capture_screenshot(&self) -> Result<Vec<u8>> {
        let session = self.active()?;
        let capture = &self.config.capture;
        session
            .bridge()?
            .capture_screenshot(capture.screenshot_max_staleness(), capture.screenshot_timeout())?
            .to_png()
    }

    /// PNG of the most recent frame within the configured staleness bound.
    pub fn get_frame(&self) -> Result<Vec<u8>> {
        let capture = &self.config.capture;
        self.frame(capture.frame_max_staleness(), capture.frame_timeout())?
            .to_png()
    }

    /// Raw RGBA frame no older than `max_staleness`, waiting up to `timeout`.
    pub fn frame(&self, max_staleness: Duration, timeout: Duration) -> Result<Frame> {
        let session = self.active()?;
        session.bridge()?.get_frame(max_staleness, timeout)
    }

    pub fn get_screen_size(&self) -> Result<Size> {
        let session = self.active()?;
        session
            .bridge
            .as_ref()
            .and_then(FrameBridge::size)
            .or_else(|| session.streams.first().and_then(|stream| stream.size))
            .ok_or(Error::StreamUnavailable)
    }

    fn execute(&self, session: &ActiveSession, plan: Vec<InputStep>) -> Result<()> {
        self.block_on(async {
            for step in plan {
                self.dispatch(session, step).await?;
            }
            Ok(())
        })
        .and_then(|result| result)
    }

    async fn dispatch(&self, session: &ActiveSession, step: InputStep) -> Result<()> {
        let handle = &session.handle;
        match step {
            InputStep::Key { keysym, state } => {
                self.transport
                    .notify_keyboard_keysym(handle, keysym.raw() as i32, state.as_u32())
                    .await
            }
            InputStep::Button { code, state } => {
                self.transport
                    .notify_pointer_button(handle, code, state.as_u32())
                    .await
            }
            InputStep::Scroll { axis, steps } => {
                self.transport
                    .notify_pointer_axis_discrete(handle, axis.as_u32(), steps)
                    .await
            }
            InputStep::MoveTo(point) => self.move_pointer(session, point).await,
            InputStep::Pause(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }

    /// Absolute motion within the captured stream when there is one,
    /// otherwise relative motion from the last position this session sent.
    async fn move_pointer(&self, session: &ActiveSession, point: Point) -> Result<()> {
        if let (Some(stream), Some(_)) = (session.streams.first(), &session.bridge) {
            let origin = stream.position.unwrap_or_default();
            let x = f64::from(point.x - origin.x);
            let y = f64::from(point.y - origin.y);
            return self
                .transport
                .notify_pointer_motion_absolute(&session.handle, stream.node_id, x, y)
                .await;
        }

        let (dx, dy) = {
            let mut last = session.pointer.lock().unwrap_or_else(PoisonError::into_inner);
            let delta = (f64::from(point.x - last.x), f64::from(point.y - last.y));
            *last = point;
            delta
        };
        self.transport
            .notify_pointer_motion(&session.handle, dx, dy)
            .await
    }
}

impl<P: PortalTransport> Drop for RemoteDesktop<P> {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            release_runtime(runtime);
        }
    }
}

/// `Runtime::block_on` that also works when the caller is itself inside a
/// tokio runtime.
fn run_blocking<F>(runtime: &Runtime, future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Err(_) => runtime.block_on(future),
        Ok(RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(|| runtime.block_on(future))
        }
        Ok(_) => std::thread::scope(|scope| {
            scope
                .spawn(|| runtime.block_on(future))
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
        }),
    }
}

/// Dropping a runtime blocks, which tokio forbids inside another runtime.
fn release_runtime(runtime: Runtime) {
    if Handle::try_current().is_ok() {
        runtime.shutdown_background();
    }
}

fn build_runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("remote-desktop-portal")
        .enable_all()
        .build()?)
}
