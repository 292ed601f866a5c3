use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::core::{Clock, DownsamplingMethod, Frame, MeasurementFilter, Ticks};

const NO_WATERMARK: i64 = i64::MIN;

/// Maps raw timestamps onto the sub-second frame grid
///
/// Grid point `k` of a second sits at `floor(k * PER_SECOND / fps)` ticks past the second,
/// snapped down to `time_resolution`. Flooring picks the latest grid point not after the
/// timestamp; rounding picks the nearer neighbour, ties going to the earlier point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAlignment {
    frames_per_second: u32,
    time_resolution: i64,
    round_to_nearest: bool,
}

impl FrameAlignment {
    pub fn new(frames_per_second: u32, time_resolution: i64, round_to_nearest: bool) -> Self {
        Self {
            frames_per_second: frames_per_second.max(1),
            time_resolution: time_resolution.clamp(0, Ticks::PER_SECOND),
            round_to_nearest,
        }
    }

    pub fn frames_per_second(&self) -> u32 {
        self.frames_per_second
    }

    pub fn time_resolution(&self) -> i64 {
        self.time_resolution
    }

    pub fn round_to_nearest(&self) -> bool {
        self.round_to_nearest
    }

    pub fn ticks_per_frame(&self) -> f64 {
        Ticks::PER_SECOND as f64 / self.frames_per_second as f64
    }

    fn snap(&self, distance: i64) -> i64 {
        if self.time_resolution > 1 {
            distance - distance % self.time_resolution
        } else {
            distance
        }
    }

    fn grid_point(&self, index: i64) -> i64 {
        self.snap(index * Ticks::PER_SECOND / self.frames_per_second as i64)
    }

    /// Largest frame index whose unsnapped grid point is at or before `distance`
    fn index_at_or_before(&self, distance: i64) -> i64 {
        let fps = self.frames_per_second as i64;
        ((distance + 1) * fps - 1) / Ticks::PER_SECOND
    }

    /// Align `ticks` to its frame timestamp. Pure and idempotent.
    pub fn align(&self, ticks: Ticks) -> Ticks {
        let base = ticks.base_second();
        let snapped = self.snap(ticks.distance_beyond_second());

        // any grid point below `snapped + resolution` snaps to at most `snapped`
        let reach = (snapped + self.time_resolution.max(1) - 1).min(Ticks::PER_SECOND - 1);
        let index = self.index_at_or_before(reach);
        let lower = self.grid_point(index);

        if !self.round_to_nearest {
            return base + Ticks(lower);
        }

        let upper = if index + 1 < self.frames_per_second as i64 {
            self.grid_point(index + 1)
        } else {
            Ticks::PER_SECOND
        };

        if snapped - lower <= upper - snapped {
            base + Ticks(lower)
        } else {
            base + Ticks(upper)
        }
    }
}

impl Default for FrameAlignment {
    fn default() -> Self {
        Self::new(30, 0, false)
    }
}

/// Down-sampling policy stamped onto every new frame
#[derive(Clone, Default)]
pub struct FrameTemplate {
    pub method: DownsamplingMethod,
    pub filter: Option<Arc<dyn MeasurementFilter>>,
}

impl FrameTemplate {
    pub fn new(method: DownsamplingMethod, filter: Option<Arc<dyn MeasurementFilter>>) -> Self {
        Self { method, filter }
    }

    fn create(&self, timestamp: Ticks, created: Ticks) -> Frame {
        let frame = Frame::new(timestamp, created, self.method);
        match &self.filter {
            Some(filter) => frame.with_filter(filter.clone()),
            None => frame,
        }
    }
}

/// Ordered, indexed set of frames awaiting publication
///
/// Lookups of existing frames only touch the read side of the index. Creation, sealing and
/// popping serialize on the structural lock, which keeps the sorted sequence and the index
/// consistent and guarantees the popped frame is the one that was sealed.
pub struct FrameQueue {
    clock: Arc<dyn Clock>,
    alignment: RwLock<FrameAlignment>,
    template: RwLock<FrameTemplate>,
    frames: Mutex<VecDeque<Arc<Frame>>>,
    index: RwLock<HashMap<Ticks, Arc<Frame>>>,
    head: RwLock<Option<Arc<Frame>>>,
    last: RwLock<Option<Arc<Frame>>>,
    watermark: AtomicI64,
}

impl FrameQueue {
    pub fn new(clock: Arc<dyn Clock>, alignment: FrameAlignment, template: FrameTemplate) -> Self {
        Self {
            clock,
            alignment: RwLock::new(alignment),
            template: RwLock::new(template),
            frames: Mutex::new(VecDeque::new()),
            index: RwLock::new(HashMap::new()),
            head: RwLock::new(None),
            last: RwLock::new(None),
            watermark: AtomicI64::new(NO_WATERMARK),
        }
    }

    pub fn alignment(&self) -> FrameAlignment {
        *self.alignment.read()
    }

    pub fn set_alignment(&self, alignment: FrameAlignment) {
        *self.alignment.write() = alignment;
    }

    pub fn set_template(&self, template: FrameTemplate) {
        *self.template.write() = template;
    }

    pub fn align(&self, ticks: Ticks) -> Ticks {
        self.alignment.read().align(ticks)
    }

    /// Frame for the bucket containing `ticks`, created on demand.
    ///
    /// Returns `None` when the bucket is at or before the watermark, or would sort ahead of a
    /// head frame that is already being published.
    pub fn get_or_create_frame(&self, ticks: Ticks) -> Option<Arc<Frame>> {
        let aligned = self.align(ticks);
        if aligned.value() <= self.watermark.load(Ordering::Acquire) {
            return None;
        }

        if let Some(frame) = self.index.read().get(&aligned) {
            return Some(frame.clone());
        }

        let mut frames = self.frames.lock();

        if let Some(frame) = self.index.read().get(&aligned) {
            return Some(frame.clone());
        }

        // pop may have advanced the watermark while we waited for the lock
        if aligned.value() <= self.watermark.load(Ordering::Acquire) {
            return None;
        }

        if let Some(head) = frames.front() {
            if head.is_published() && aligned < head.timestamp() {
                return None;
            }
        }

        let frame = Arc::new(self.template.read().create(aligned, self.clock.now()));

        // timestamps mostly arrive in order, so search from the tail
        let position = frames
            .iter()
            .rposition(|queued| queued.timestamp() < aligned)
            .map_or(0, |p| p + 1);

        frames.insert(position, frame.clone());
        self.index.write().insert(aligned, frame.clone());

        if position == 0 {
            *self.head.write() = Some(frame.clone());
        }

        Some(frame)
    }

    /// Earliest queued frame
    pub fn head(&self) -> Option<Arc<Frame>> {
        self.head.read().clone()
    }

    /// Mark `frame` published if it is still the head. Returns false otherwise.
    pub fn seal_head(&self, frame: &Arc<Frame>) -> bool {
        let frames = self.frames.lock();
        match frames.front() {
            Some(head) if Arc::ptr_eq(head, frame) => head.mark_published(),
            _ => false,
        }
    }

    /// Remove the head and advance the watermark to its timestamp
    pub fn pop(&self) -> Option<Arc<Frame>> {
        let mut frames = self.frames.lock();
        self.pop_locked(&mut frames)
    }

    /// Pop only if `frame` is still the head; a concurrent clear may have replaced it
    pub fn pop_if(&self, frame: &Arc<Frame>) -> bool {
        let mut frames = self.frames.lock();
        let is_head = frames.front().is_some_and(|head| Arc::ptr_eq(head, frame));
        is_head && self.pop_locked(&mut frames).is_some()
    }

    fn pop_locked(&self, frames: &mut VecDeque<Arc<Frame>>) -> Option<Arc<Frame>> {
        let frame = frames.pop_front()?;

        self.index.write().remove(&frame.timestamp());
        self.watermark
            .fetch_max(frame.timestamp().value(), Ordering::AcqRel);
        *self.head.write() = frames.front().cloned();
        *self.last.write() = Some(frame.clone());

        Some(frame)
    }

    pub fn clear(&self) {
        let mut frames = self.frames.lock();
        frames.clear();
        self.index.write().clear();
        *self.head.write() = None;
        *self.last.write() = None;
        self.watermark.store(NO_WATERMARK, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Most recently popped frame
    pub fn last_published(&self) -> Option<Arc<Frame>> {
        self.last.read().clone()
    }

    /// Timestamp of the most recently popped frame, if any
    pub fn watermark(&self) -> Option<Ticks> {
        match self.watermark.load(Ordering::Acquire) {
            NO_WATERMARK => None,
            value => Some(Ticks(value)),
        }
    }

    /// Snapshot of queued frames for diagnostics
    pub fn examine_queue_state(&self, expected_measurements: usize) -> String {
        let frames: Vec<Arc<Frame>> = self.frames.lock().iter().cloned().collect();
        let mut state = String::new();

        let _ = writeln!(state, "Concentration queue state for {} frames:", frames.len());

        for (position, frame) in frames.iter().enumerate() {
            let expected = if expected_measurements > 0 {
                format!(" of {} expected", expected_measurements)
            } else {
                String::new()
            };

            let _ = writeln!(
                state,
                "  [{:>3}] {} - {} sorted{}{}",
                position,
                frame.timestamp(),
                frame.sorted_count(),
                expected,
                if frame.is_published() { ", published" } else { "" }
            );
        }

        state
    }
}
