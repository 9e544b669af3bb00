//! Bridge from a continuously streaming capture source to bounded,
//! synchronous frame reads.
//!
//! The consumer side ([`PipeWireCapture`]) overwrites a single
//! [`FrameSlot`]; readers wait on it with a staleness bound and a deadline.

mod consumer;
pub mod convert;

use std::io::Cursor;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use tracing::{debug, trace, warn};

pub use consumer::PipeWireCapture;

use crate::error::{Error, Result};
use crate::portal::StreamDescriptor;
use crate::types::Size;

/// One decoded still image, RGBA8, tightly packed.
#[derive(Clone, Debug)]
pub struct Frame {
    pub pixels: Arc<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub captured_at: Instant,
    pub sequence: u64,
}

impl Frame {
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        PngEncoder::new(&mut out).write_image(
            &self.pixels,
            self.width,
            self.height,
            ColorType::Rgba8,
        )?;
        Ok(out.into_inner())
    }
}

#[derive(Default)]
struct SlotState {
    frame: Option<Frame>,
    sequence: u64,
    closed: bool,
}

/// Single-slot frame buffer: the producer overwrites, readers wait for freshness.
#[derive(Default)]
pub struct FrameSlot {
    state: Mutex<SlotState>,
    fresh: Condvar,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the current frame and wakes all waiters. Returns the new
    /// sequence number, or `None` once the slot is closed.
    pub fn publish(&self, pixels: Vec<u8>, width: u32, height: u32) -> Option<u64> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            warn!(
                len = pixels.len(),
                expected, width, height, "Dropping frame with mismatched buffer size"
            );
            return None;
        }

        let mut state = self.lock();
        if state.closed {
            return None;
        }

        let now = Instant::now();
        let captured_at = match &state.frame {
            Some(previous) if previous.captured_at > now => previous.captured_at,
            _ => now,
        };
        state.sequence += 1;
        let sequence = state.sequence;
        state.frame = Some(Frame {
            pixels: Arc::new(pixels),
            width,
            height,
            captured_at,
            sequence,
        });
        drop(state);

        trace!(sequence, width, height, "Published frame");
        self.fresh.notify_all();
        Some(sequence)
    }

    pub fn latest(&self) -> Option<Frame> {
        self.lock().frame.clone()
    }

    /// Sequence number of the most recent frame, 0 before the first one.
    pub fn sequence(&self) -> u64 {
        self.lock().sequence
    }

    /// Returns a frame no older than `max_staleness`, or one published
    /// after this call started, waiting at most `timeout` for it.
    pub fn wait_fresh(&self, max_staleness: Duration, timeout: Duration) -> Result<Frame> {
        self.wait(None, max_staleness, timeout)
    }

    /// Like [`wait_fresh`](Self::wait_fresh), with "after this call started"
    /// replaced by "after `sequence`".
    pub fn wait_newer_than(
        &self,
        sequence: u64,
        max_staleness: Duration,
        timeout: Duration,
    ) -> Result<Frame> {
        self.wait(Some(sequence), max_staleness, timeout)
    }

    fn wait(
        &self,
        baseline: Option<u64>,
        max_staleness: Duration,
        timeout: Duration,
    ) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let start_sequence = baseline.unwrap_or(state.sequence);

        loop {
            if state.closed {
                return Err(Error::StreamUnavailable);
            }
            if let Some(frame) = &state.frame {
                if frame.sequence > start_sequence || frame.age() <= max_staleness {
                    return Ok(frame.clone());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(?timeout, "No fresh frame before deadline");
                return Err(Error::FrameTimeout(timeout));
            }
            state = self
                .fresh
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Rejects further frames and wakes all waiters.
    pub fn close(&self) {
        self.lock().closed = true;
        self.fresh.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// A running frame producer feeding a [`FrameSlot`].
pub trait CaptureHandle: Send {
    /// Stops production and releases the source. Called at most once.
    fn stop(&mut self);

    /// False for sources that only produce a frame when asked to.
    fn is_continuous(&self) -> bool {
        true
    }

    /// Asks a single-shot source for one frame.
    fn trigger(&self) -> Result<()> {
        Ok(())
    }
}

/// Synchronous frame access for one negotiated stream.
pub struct FrameBridge {
    stream: StreamDescriptor,
    slot: Arc<FrameSlot>,
    handle: Mutex<Option<Box<dyn CaptureHandle>>>,
}

impl FrameBridge {
    pub fn new(
        stream: StreamDescriptor,
        slot: Arc<FrameSlot>,
        handle: Box<dyn CaptureHandle>,
    ) -> Self {
        debug!(
            node_id = stream.node_id,
            continuous = handle.is_continuous(),
            "Frame bridge active"
        );
        Self {
            stream,
            slot,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stream(&self) -> &StreamDescriptor {
        &self.stream
    }

    fn handle(&self) -> MutexGuard<'_, Option<Box<dyn CaptureHandle>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_frame(&self, max_staleness: Duration, timeout: Duration) -> Result<Frame> {
        self.slot.wait_fresh(max_staleness, timeout)
    }

    /// Like [`get_frame`](Self::get_frame), but single-shot sources are
    /// triggered first so the result reflects the screen at call time.
    pub fn capture_screenshot(&self, max_staleness: Duration, timeout: Duration) -> Result<Frame> {
        let baseline = self.slot.sequence();
        {
            let handle = self.handle();
            match handle.as_ref() {
                Some(handle) if !handle.is_continuous() => handle.trigger()?,
                Some(_) => {}
                None => return Err(Error::StreamUnavailable),
            }
        }
        self.slot.wait_newer_than(baseline, max_staleness, timeout)
    }

    /// Current frame dimensions, falling back to the stream metadata.
    pub fn size(&self) -> Option<Size> {
        self.slot
            .latest()
            .map(|frame| frame.size())
            .or(self.stream.size)
    }

    /// Stops the producer and wakes every waiter. Safe to call repeatedly.
    pub fn stop(&self) {
        let handle = self.handle().take();
        if let Some(mut handle) = handle {
            debug!(node_id = self.stream.node_id, "Stopping frame bridge");
            handle.stop();
        }
        self.slot.close();
    }
}

impl Drop for FrameBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;

    fn pixels(width: u32, height: u32) -> Vec<u8> {
        vec![0x7f; (width * height * 4) as usize]
    }

    #[test]
    fn fresh_frame_is_returned_immediately() {
        let slot = FrameSlot::new();
        slot.publish(pixels(2, 2), 2, 2);
        let frame = slot
            .wait_fresh(Duration::from_secs(5), Duration::ZERO)
            .expect("frame within staleness bound");
        assert_eq!(frame.size(), Size::new(2, 2));
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn stale_frame_waits_for_next_update() {
        let slot = Arc::new(FrameSlot::new());
        slot.publish(pixels(1, 1), 1, 1);
        thread::sleep(Duration::from_millis(20));

        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slot.publish(pixels(1, 1), 1, 1);
            })
        };

        let frame = slot
            .wait_fresh(Duration::from_millis(5), Duration::from_secs(2))
            .unwrap();
        assert_eq!(frame.sequence, 2);
        producer.join().unwrap();
    }

    #[test]
    fn empty_slot_times_out() {
        let slot = FrameSlot::new();
        let err = slot
            .wait_fresh(Duration::ZERO, Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(err, Error::FrameTimeout(d) if d == Duration::from_millis(30)));
    }

    #[test]
    fn timestamps_and_sequence_never_regress() {
        let slot = FrameSlot::new();
        let mut last: Option<Frame> = None;
        for _ in 0..5 {
            slot.publish(pixels(1, 1), 1, 1);
            let frame = slot.latest().unwrap();
            if let Some(previous) = &last {
                assert!(frame.captured_at >= previous.captured_at);
                assert!(frame.sequence > previous.sequence);
            }
            last = Some(frame);
        }
    }

    #[test]
    fn mismatched_buffers_are_rejected() {
        let slot = FrameSlot::new();
        assert!(slot.publish(vec![0; 3], 1, 1).is_none());
        assert!(slot.latest().is_none());
    }

    #[test]
    fn close_wakes_waiters() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = slot.clone();
            thread::spawn(move || slot.wait_fresh(Duration::ZERO, Duration::from_secs(10)))
        };
        thread::sleep(Duration::from_millis(20));
        slot.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::StreamUnavailable)));
        assert!(slot.publish(pixels(1, 1), 1, 1).is_none());
    }

    #[test]
    fn png_encoding_produces_a_png() {
        let slot = FrameSlot::new();
        slot.publish(pixels(3, 2), 3, 2);
        let png = slot.latest().unwrap().to_png().unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }

    struct OneShot {
        slot: Arc<FrameSlot>,
        triggers: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    impl CaptureHandle for OneShot {
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn is_continuous(&self) -> bool {
            false
        }

        fn trigger(&self) -> Result<()> {
            self.triggers.fetch_add(1, Ordering::SeqCst);
            self.slot.publish(pixels(4, 4), 4, 4);
            Ok(())
        }
    }

    #[test]
    fn single_shot_sources_are_triggered_for_screenshots() {
        let slot = Arc::new(FrameSlot::new());
        let triggers = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let bridge = FrameBridge::new(
            StreamDescriptor::new(9),
            slot.clone(),
            Box::new(OneShot {
                slot: slot.clone(),
                triggers: triggers.clone(),
                stops: stops.clone(),
            }),
        );

        let frame = bridge
            .capture_screenshot(Duration::ZERO, Duration::from_secs(1))
            .unwrap();
        assert_eq!(frame.size(), Size::new(4, 4));
        assert_eq!(triggers.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.size(), Some(Size::new(4, 4)));

        bridge.stop();
        bridge.stop();
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(matches!(
            bridge.capture_screenshot(Duration::ZERO, Duration::from_millis(10)),
            Err(Error::StreamUnavailable)
        ));
    }
}
