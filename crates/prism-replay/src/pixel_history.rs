//! Per-pixel event history.
//!
//! For one target pixel, walks the candidate events and reports which of
//! them modified it: clears and direct writes always count; draws count only
//! when an occlusion query scoped to that pixel reports at least one passing
//! sample. Each included event carries the value before and after it ran.
//!
//! State machine per query: `Setup → [ per event: PreEvent → Replay with
//! occlusion → PostEvent ] → ReadbackAndClassify → Teardown`.

use crate::driver::{BufferHandle, BufferUse, DrawReplay, DriverError, GpuDriver};
use crate::event::{EventKind, ReplayEvent};

/// Bytes reserved per event in the readback buffer: pre-modification and
/// post-modification values, 16 bytes each (widest target format).
const VALUE_BYTES: u64 = 16;
const EVENT_SLOT_BYTES: u64 = VALUE_BYTES * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Setup,
    PreEvent,
    Replay,
    PostEvent,
    ReadbackAndClassify,
    Teardown,
    Done,
}

#[derive(Debug, Clone)]
pub struct PixelHistoryQuery {
    pub target_id: u64,
    pub x: u32,
    pub y: u32,
    pub slice: u32,
    pub mip: u32,
    pub sample: u32,
}

/// One event that touched the pixel. Inclusion in the history already means
/// the event modified the pixel; draws that failed every sample are omitted.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelModification {
    pub event_id: u64,
    pub pre_value: [f32; 4],
    pub post_value: [f32; 4],
    /// Samples that passed depth/stencil/scissor for this pixel; zero for
    /// clears and direct writes (no query is run for them).
    pub samples_passed: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelHistory {
    pub modifications: Vec<PixelModification>,
    /// Non-empty on soft failure; callers display it instead of a history.
    pub status: String,
}

impl PixelHistory {
    fn failed(status: impl Into<String>) -> PixelHistory {
        PixelHistory {
            modifications: Vec::new(),
            status: status.into(),
        }
    }
}

/// Replays one candidate event for the history walk. The capture
/// collaborator supplies the draw state; events that cannot be expressed
/// report why.
pub trait EventReplayer {
    /// Copies the target pixel's current value into `readback` at `offset`.
    fn copy_pixel(
        &mut self,
        query: &PixelHistoryQuery,
        readback: BufferHandle,
        offset: u64,
    ) -> Result<(), DriverError>;

    /// Replays the event. For draws, returns the draw call to run under an
    /// occlusion query; for clears/direct writes, performs the write and
    /// returns `None`.
    fn replay(&mut self, event: &ReplayEvent) -> Result<Option<DrawReplay>, DriverError>;

    /// Constraints the engine cannot express yet for this event, if any.
    fn unsupported_reason(&self, event: &ReplayEvent) -> Option<&'static str>;
}

pub struct PixelHistoryEngine<D: GpuDriver> {
    state: HistoryState,
    _marker: std::marker::PhantomData<D>,
}

impl<D: GpuDriver> Default for PixelHistoryEngine<D> {
    fn default() -> Self {
        PixelHistoryEngine {
            state: HistoryState::Setup,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<D: GpuDriver> PixelHistoryEngine<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HistoryState {
        self.state
    }

    /// Runs the full history walk for one pixel.
    pub fn run<R: EventReplayer>(
        &mut self,
        driver: &mut D,
        replayer: &mut R,
        query: &PixelHistoryQuery,
        events: &[ReplayEvent],
    ) -> PixelHistory {
        self.state = HistoryState::Setup;
        if events.is_empty() {
            self.state = HistoryState::Done;
            return PixelHistory::default();
        }
        for event in events {
            // Documented gaps (secondary command buffers, multisample
            // resolve disambiguation, discard rectangles) fail the whole
            // query with a reason instead of returning a silently empty
            // history.
            if let Some(reason) = replayer.unsupported_reason(event) {
                self.state = HistoryState::Done;
                return PixelHistory::failed(reason);
            }
        }

        let readback_bytes = events.len() as u64 * EVENT_SLOT_BYTES;
        let readback = match driver.create_buffer(readback_bytes, BufferUse::Readback) {
            Ok(b) => b,
            Err(e) => {
                self.state = HistoryState::Done;
                return PixelHistory::failed(e.to_string());
            }
        };

        let mut raw: Vec<(u64, u64, EventKind, bool)> = Vec::with_capacity(events.len());
        for (i, event) in events.iter().enumerate() {
            let slot = i as u64 * EVENT_SLOT_BYTES;

            self.state = HistoryState::PreEvent;
            if let Err(e) = replayer.copy_pixel(query, readback, slot) {
                return self.abort(driver, readback, e);
            }

            self.state = HistoryState::Replay;
            let samples = match replayer.replay(event) {
                Ok(Some(draw)) => match driver.run_occlusion_draw(&draw, (query.x, query.y)) {
                    Ok(samples) => samples,
                    Err(e) => return self.abort(driver, readback, e),
                },
                Ok(None) => 0,
                Err(e) => return self.abort(driver, readback, e),
            };

            self.state = HistoryState::PostEvent;
            if let Err(e) = replayer.copy_pixel(query, readback, slot + VALUE_BYTES) {
                return self.abort(driver, readback, e);
            }

            raw.push((event.event_id, samples, event.kind, event.is_clear));
        }

        self.state = HistoryState::ReadbackAndClassify;
        let bytes = match driver.read_buffer(readback, 0, readback_bytes) {
            Ok(b) => b,
            Err(e) => return self.abort(driver, readback, e),
        };

        let mut modifications = Vec::new();
        for (i, (event_id, samples, kind, is_clear)) in raw.into_iter().enumerate() {
            let included = is_clear || kind.is_direct_write() || samples > 0;
            if !included {
                continue;
            }
            let slot = i * EVENT_SLOT_BYTES as usize;
            modifications.push(PixelModification {
                event_id,
                pre_value: decode_value(&bytes, slot),
                post_value: decode_value(&bytes, slot + VALUE_BYTES as usize),
                samples_passed: samples,
            });
        }

        self.state = HistoryState::Teardown;
        driver.destroy_buffer(readback);
        self.state = HistoryState::Done;
        PixelHistory {
            modifications,
            status: String::new(),
        }
    }

    fn abort(&mut self, driver: &mut D, readback: BufferHandle, err: DriverError) -> PixelHistory {
        if err.is_fatal() {
            tracing::error!(error = %err, "device lost during pixel history");
        }
        self.state = HistoryState::Teardown;
        driver.destroy_buffer(readback);
        self.state = HistoryState::Done;
        PixelHistory::failed(err.to_string())
    }
}

fn decode_value(bytes: &[u8], at: usize) -> [f32; 4] {
    let mut out = [0.0f32; 4];
    for (k, v) in out.iter_mut().enumerate() {
        let base = at + k * 4;
        if let Some(b) = bytes.get(base..base + 4) {
            let mut w = [0u8; 4];
            w.copy_from_slice(b);
            *v = f32::from_le_bytes(w);
        }
    }
    out
}
