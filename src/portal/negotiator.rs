use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use super::{
    parse_streams, CreateSessionRequest, HandshakeStep, PortalTransport, Response,
    SelectDevicesRequest, SelectSourcesRequest, StartRequest, StreamDescriptor,
};
use crate::config::HandshakeConfig;
use crate::error::{Error, Result};
use crate::types::{Capabilities, DeviceTypes, PersistMode};

/// What the caller wants from the portal.
#[derive(Debug, Clone)]
pub struct NegotiationRequest {
    pub capabilities: Capabilities,
    pub persist_mode: PersistMode,
    pub restore_token: Option<String>,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone)]
pub struct NegotiatedSession {
    pub session_handle: OwnedObjectPath,
    pub streams: Vec<StreamDescriptor>,
    pub devices: Option<DeviceTypes>,
    pub restore_token: Option<String>,
}

impl NegotiatedSession {
    /// Capabilities the portal actually handed out.
    pub fn granted(&self, requested: Capabilities) -> Capabilities {
        let mut granted = Capabilities::empty();
        if requested.contains(Capabilities::INPUT)
            && self.devices.map_or(true, |devices| !devices.is_empty())
        {
            granted |= Capabilities::INPUT;
        }
        if requested.contains(Capabilities::CAPTURE) && !self.streams.is_empty() {
            granted |= Capabilities::CAPTURE;
        }
        granted
    }
}

/// Handle tokens must be valid object path elements.
pub fn new_handle_token() -> String {
    format!("rdp_{}", rand::random::<u32>())
}

/// Runs the portal handshake over a [`PortalTransport`].
pub struct Negotiator<'a, P: PortalTransport> {
    transport: &'a P,
    config: &'a HandshakeConfig,
}

impl<'a, P: PortalTransport> Negotiator<'a, P> {
    pub fn new(transport: &'a P, config: &'a HandshakeConfig) -> Self {
        Self { transport, config }
    }

    /// CreateSession, SelectDevices, SelectSources (capture only) and Start,
    /// strictly in that order. A failing step ends the handshake and closes
    /// the portal session if one was already created.
    pub async fn negotiate(&self, request: &NegotiationRequest) -> Result<NegotiatedSession> {
        let session_handle = self.create_session().await?;
        info!(session = %session_handle, "Portal session created");

        match self.configure_and_start(&session_handle, request).await {
            Ok(negotiated) => Ok(negotiated),
            Err(err) => {
                warn!(session = %session_handle, %err, "Handshake failed, closing portal session");
                let close = self.transport.close_session(&session_handle);
                match tokio::time::timeout(self.config.step_timeout(), close).await {
                    Ok(Ok(())) => {}
                    Ok(Err(close_err)) => {
                        debug!(session = %session_handle, %close_err, "Session.Close failed")
                    }
                    Err(_) => debug!(session = %session_handle, "Session.Close timed out"),
                }
                Err(err)
            }
        }
    }

    async fn create_session(&self) -> Result<OwnedObjectPath> {
        let step = HandshakeStep::CreateSession;
        let create = CreateSessionRequest {
            handle_token: new_handle_token(),
            session_handle_token: new_handle_token(),
        };
        let response = self
            .run_step(
                step,
                &create.handle_token,
                self.config.step_timeout(),
                self.transport.create_session(&create),
            )
            .await?;

        session_handle_from(&response).ok_or_else(|| Error::StepFailed {
            step,
            reason: "response carried no session_handle".into(),
        })
    }

    async fn configure_and_start(
        &self,
        session: &OwnedObjectPath,
        request: &NegotiationRequest,
    ) -> Result<NegotiatedSession> {
        let devices = SelectDevicesRequest {
            handle_token: new_handle_token(),
            types: self.config.device_types(),
            persist_mode: request.persist_mode,
            restore_token: request.restore_token.clone(),
        };
        debug!(
            session = %session,
            types = ?devices.types,
            persist_mode = ?devices.persist_mode,
            restoring = devices.restore_token.is_some(),
            "Selecting devices"
        );
        self.run_step(
            HandshakeStep::SelectDevices,
            &devices.handle_token,
            self.config.step_timeout(),
            self.transport.select_devices(session, &devices),
        )
        .await?;

        let capture = request.capabilities.contains(Capabilities::CAPTURE);
        if capture {
            let sources = SelectSourcesRequest {
                handle_token: new_handle_token(),
                types: self.config.source_types(),
                multiple: false,
                cursor_mode: self.config.cursor_mode,
            };
            debug!(session = %session, types = ?sources.types, "Selecting sources");
            self.run_step(
                HandshakeStep::SelectSources,
                &sources.handle_token,
                self.config.step_timeout(),
                self.transport.select_sources(session, &sources),
            )
            .await?;
        }

        let start = StartRequest {
            handle_token: new_handle_token(),
            parent_window: self.config.parent_window.clone(),
        };
        let response = self
            .run_step(
                HandshakeStep::Start,
                &start.handle_token,
                self.config.start_timeout(),
                self.transport.start(session, &start),
            )
            .await?;

        let streams = match response.results.get("streams") {
            Some(value) => parse_streams(value)?,
            None => Vec::new(),
        };
        let devices = response
            .results
            .get("devices")
            .and_then(|value| u32::try_from(value).ok())
            .map(DeviceTypes::from_bits_truncate);
        let restore_token = if request.persist_mode.persists() {
            string_result(&response, "restore_token")
        } else {
            None
        };

        info!(
            session = %session,
            streams = streams.len(),
            ?devices,
            has_restore_token = restore_token.is_some(),
            "Portal session started"
        );
        if capture && streams.is_empty() {
            warn!(session = %session, "Start returned no streams although capture was requested");
        }

        Ok(NegotiatedSession {
            session_handle: session.clone(),
            streams,
            devices,
            restore_token,
        })
    }

    /// Best-effort `Request.Close`, bounded by the step timeout.
    async fn close_request(&self, request: &OwnedObjectPath) {
        let close = self.transport.close_request(request);
        match tokio::time::timeout(self.config.step_timeout(), close).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(request = %request, %err, "Request.Close failed"),
            Err(_) => debug!(request = %request, "Request.Close timed out"),
        }
    }

    /// Registers a waiter, dispatches the call, then awaits the `Response`.
    ///
    /// One deadline covers both the method call and the response, so a
    /// portal that never replies to the call itself still times out.
    async fn run_step<F>(
        &self,
        step: HandshakeStep,
        handle_token: &str,
        timeout: Duration,
        dispatch: F,
    ) -> Result<Response>
    where
        F: Future<Output = Result<OwnedObjectPath>>,
    {
        let deadline = Instant::now() + timeout;
        let requests = self.transport.requests();
        let predicted = self.transport.request_path(handle_token)?;
        let receiver = requests.register(predicted.clone(), step, timeout);

        let request_path = match tokio::time::timeout_at(deadline, dispatch).await {
            Ok(Ok(path)) => path,
            Ok(Err(err)) => {
                requests.cancel(&predicted);
                return Err(Error::StepFailed {
                    step,
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                requests.cancel(&predicted);
                warn!(%step, request = %predicted, ?timeout, "Portal method call timed out");
                self.close_request(&predicted).await;
                return Err(Error::HandshakeTimeout { step, timeout });
            }
        };
        if request_path != predicted {
            debug!(
                %step,
                predicted = %predicted,
                actual = %request_path,
                "Request path differs from prediction"
            );
            requests.rekey(&predicted, request_path.clone());
        }

        let response = match tokio::time::timeout_at(deadline, receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(Error::StepFailed {
                    step,
                    reason: "request waiter was dropped".into(),
                })
            }
            Err(_) => {
                requests.cancel(&request_path);
                warn!(%step, request = %request_path, ?timeout, "Portal request timed out");
                self.close_request(&request_path).await;
                return Err(Error::HandshakeTimeout { step, timeout });
            }
        };

        if response.is_success() {
            debug!(%step, request = %request_path, "Step succeeded");
            Ok(response)
        } else {
            info!(%step, status = response.status, "Step was not granted");
            Err(Error::from_response_status(step, response.status))
        }
    }
}

fn string_result(response: &Response, key: &str) -> Option<String> {
    let value = response.results.get(key)?.try_clone().ok()?;
    match Value::from(value) {
        Value::Str(s) if !s.is_empty() => Some(s.to_string()),
        _ => None,
    }
}

/// `session_handle` is a string in current portals and an object path in
/// some older ones.
fn session_handle_from(response: &Response) -> Option<OwnedObjectPath> {
    let value: &OwnedValue = response.results.get("session_handle")?;
    match Value::from(value.try_clone().ok()?) {
        Value::Str(s) => OwnedObjectPath::try_from(s.as_str()).ok(),
        Value::ObjectPath(path) => Some(path.into()),
        _ => None,
    }
}
