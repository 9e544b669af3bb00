//! PipeWire stream consumer running on its own thread.

use std::io::Cursor;
use std::os::fd::OwnedFd;
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use ::pipewire as pw;
use pw::spa::param::format::{FormatProperties, MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::param::video::{VideoFormat, VideoInfoRaw};
use pw::spa::param::ParamType;
use pw::spa::pod::serialize::PodSerializer;
use pw::spa::pod::{self, Pod};
use pw::spa::utils::{Direction, Fraction, Rectangle, SpaTypes};
use pw::stream::{StreamFlags, StreamState};
use tracing::{debug, error, info, trace, warn};

use super::convert::{self, PixelFormat};
use super::{CaptureHandle, FrameSlot};
use crate::error::{Error, Result};

/// Message that makes the consumer loop quit.
struct Terminate;

struct ConsumerState {
    node_id: u32,
    format: VideoInfoRaw,
    pixel_format: Option<PixelFormat>,
    slot: Arc<FrameSlot>,
}

/// Continuous capture of one portal stream into a [`FrameSlot`].
pub struct PipeWireCapture {
    node_id: u32,
    terminate: Option<pw::channel::Sender<Terminate>>,
    thread: Option<JoinHandle<()>>,
}

impl PipeWireCapture {
    /// Connects to the PipeWire remote behind `fd` and starts consuming
    /// `node_id`. Returns once the stream is connected, or with the error
    /// that prevented it.
    pub fn start(fd: OwnedFd, node_id: u32, slot: Arc<FrameSlot>) -> Result<Self> {
        let (terminate_tx, terminate_rx) = pw::channel::channel::<Terminate>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let thread = std::thread::Builder::new()
            .name(format!("pipewire-capture-{node_id}"))
            .spawn(move || {
                let closing_slot = slot.clone();
                if let Err(err) = run(fd, node_id, slot, terminate_rx, &ready_tx) {
                    error!(node_id, %err, "PipeWire consumer failed");
                    let _ = ready_tx.send(Err(err));
                }
                closing_slot.close();
                debug!(node_id, "PipeWire consumer thread exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(node_id, "PipeWire capture started");
                Ok(Self {
                    node_id,
                    terminate: Some(terminate_tx),
                    thread: Some(thread),
                })
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::PipeWire("consumer thread exited during setup".into()))
            }
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }
}

impl CaptureHandle for PipeWireCapture {
    fn stop(&mut self) {
        if let Some(terminate) = self.terminate.take() {
            if terminate.send(Terminate).is_err() {
                debug!(node_id = self.node_id, "PipeWire loop already gone");
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(node_id = self.node_id, "PipeWire consumer thread panicked");
            }
        }
    }
}

impl Drop for PipeWireCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    fd: OwnedFd,
    node_id: u32,
    slot: Arc<FrameSlot>,
    terminate: pw::channel::Receiver<Terminate>,
    ready: &mpsc::Sender<Result<()>>,
) -> Result<()> {
    pw::init();

    let mainloop = pw::main_loop::MainLoopRc::new(None)?;
    let context = pw::context::ContextRc::new(&mainloop, None)?;
    let core = context.connect_fd_rc(fd, None)?;

    let _terminate = terminate.attach(mainloop.loop_(), {
        let mainloop = mainloop.clone();
        move |_| mainloop.quit()
    });

    let stream = pw::stream::StreamRc::new(
        core,
        "remote-desktop-portal-capture",
        pw::properties::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )?;

    let state = ConsumerState {
        node_id,
        format: VideoInfoRaw::default(),
        pixel_format: None,
        slot,
    };

    let _listener = stream
        .add_local_listener_with_user_data(state)
        .state_changed(|_stream, state, old, new| {
            debug!(node_id = state.node_id, ?old, ?new, "PipeWire stream state changed");
            if let StreamState::Error(message) = new {
                warn!(node_id = state.node_id, %message, "PipeWire stream error");
            }
        })
        .param_changed(|_stream, state, id, param| {
            let Some(param) = param else { return };
            if id != ParamType::Format.as_raw() {
                return;
            }
            let Ok((media_type, media_subtype)) = format_utils::parse_format(param) else {
                return;
            };
            if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
                return;
            }
            if state.format.parse(param).is_err() {
                warn!(node_id = state.node_id, "Failed to parse negotiated video format");
                return;
            }

            state.pixel_format = pixel_format(state.format.format());
            let size = state.format.size();
            info!(
                node_id = state.node_id,
                format = ?state.format.format(),
                width = size.width,
                height = size.height,
                "Negotiated video format"
            );
            if state.pixel_format.is_none() {
                warn!(
                    format = ?state.format.format(),
                    "Unsupported pixel format, frames will be dropped"
                );
            }
        })
        .process(|stream, state| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };
            let Some(format) = state.pixel_format else {
                return;
            };
            let size = state.format.size();
            if size.width == 0 || size.height == 0 {
                return;
            }

            let datas = buffer.datas_mut();
            let Some(data) = datas.first_mut() else {
                return;
            };
            let (offset, len, stride) = {
                let chunk = data.chunk();
                (chunk.offset() as usize, chunk.size() as usize, chunk.stride())
            };
            let stride = if stride > 0 {
                stride as usize
            } else {
                size.width as usize * format.bytes_per_pixel()
            };
            let Some(bytes) = data.data() else {
                trace!("Buffer is not mapped");
                return;
            };
            let end = offset.saturating_add(len).min(bytes.len());
            if offset >= end {
                return;
            }

            match convert::to_rgba(format, size.width, size.height, stride, &bytes[offset..end]) {
                Some(rgba) => {
                    state.slot.publish(rgba, size.width, size.height);
                }
                None => trace!(len, stride, "Skipping short buffer"),
            }
        })
        .register()?;

    let format = pod::object!(
        SpaTypes::ObjectParamFormat,
        ParamType::EnumFormat,
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(
            FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            VideoFormat::BGRx,
            VideoFormat::BGRx,
            VideoFormat::RGBx,
            VideoFormat::BGRA,
            VideoFormat::RGBA,
            VideoFormat::RGB
        ),
        pod::property!(
            FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            Rectangle {
                width: 1920,
                height: 1080
            },
            Rectangle {
                width: 1,
                height: 1
            },
            Rectangle {
                width: 8192,
                height: 8192
            }
        ),
        pod::property!(
            FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            Fraction { num: 30, denom: 1 },
            Fraction { num: 0, denom: 1 },
            Fraction { num: 1000, denom: 1 }
        ),
    );
    let format_bytes: Vec<u8> =
        PodSerializer::serialize(Cursor::new(Vec::new()), &pod::Value::Object(format))
            .map_err(|err| Error::PipeWire(format!("failed to serialize format pod: {err:?}")))?
            .0
            .into_inner();
    let format_pod = Pod::from_bytes(&format_bytes)
        .ok_or_else(|| Error::PipeWire("invalid format pod".into()))?;
    let mut params = [format_pod];

    stream.connect(
        Direction::Input,
        Some(node_id),
        StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
        &mut params,
    )?;
    debug!(node_id, "PipeWire stream connected");

    if ready.send(Ok(())).is_err() {
        return Ok(());
    }
    mainloop.run();
    Ok(())
}

fn pixel_format(format: VideoFormat) -> Option<PixelFormat> {
    match format {
        VideoFormat::BGRx => Some(PixelFormat::Bgrx),
        VideoFormat::RGBx => Some(PixelFormat::Rgbx),
        VideoFormat::BGRA => Some(PixelFormat::Bgra),
        VideoFormat::RGBA => Some(PixelFormat::Rgba),
        VideoFormat::RGB => Some(PixelFormat::Rgb),
        _ => None,
    }
}
