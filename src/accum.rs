//! Frame counting and blend-weight policy for progressive accumulation.
//!
//! The clock is transactional: `begin_frame` computes what the frame *would*
//! contribute and `commit` records it only after the frame fully succeeded.
//! An aborted frame therefore leaves both the counter and any pending
//! invalidation untouched, which is what keeps the preview target rollback
//! guarantee honest.

/// What one frame contributes to the preview target.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameSample {
    /// 1-based index of this frame within the current accumulation run
    pub index: u32,
    /// Blend factor for the accumulate pass; 1.0 fully replaces the preview
    pub weight: f32,
}

#[derive(Debug)]
pub struct FrameClock {
    /// Frames committed since the last restart
    committed: u32,
    /// Restart requested; consumed by the next *committed* frame
    invalidated: bool,
    accumulate: bool,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            committed: 0,
            invalidated: true,
            accumulate: true,
        }
    }

    /// Requests a restart of the averaging run. Takes effect at the next
    /// `begin_frame`, so it is always observed before ray generation.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub fn accumulation_enabled(&self) -> bool {
        self.accumulate
    }

    /// Toggling accumulation restarts the run in either direction: blending
    /// a stale average back in after a stretch of replace-mode frames would
    /// resurrect dead history.
    pub fn set_accumulation(&mut self, enabled: bool) {
        if self.accumulate != enabled {
            self.accumulate = enabled;
            self.invalidated = true;
        }
    }

    /// The counter as of the last committed frame, kept >= 1.
    pub fn frame_counter(&self) -> u32 {
        self.committed.max(1)
    }

    pub fn begin_frame(&self) -> FrameSample {
        let index = if self.invalidated {
            1
        } else {
            self.committed + 1
        };
        let weight = if self.accumulate {
            1.0 / index as f32
        } else {
            1.0
        };
        FrameSample { index, weight }
    }

    pub fn commit(&mut self, sample: FrameSample) {
        self.invalidated = false;
        self.committed = sample.index;
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_frame(clock: &mut FrameClock) -> FrameSample {
        let sample = clock.begin_frame();
        clock.commit(sample);
        sample
    }

    #[test]
    fn counter_increases_and_weight_decreases() {
        let mut clock = FrameClock::new();
        let mut last_weight = f32::INFINITY;
        for expected in 1..=10 {
            let sample = run_frame(&mut clock);
            assert_eq!(sample.index, expected);
            assert!((sample.weight - 1.0 / expected as f32).abs() < 1e-7);
            assert!(sample.weight < last_weight);
            last_weight = sample.weight;
        }
        assert_eq!(clock.frame_counter(), 10);
    }

    #[test]
    fn invalidation_restarts_at_weight_one() {
        let mut clock = FrameClock::new();
        for _ in 0..5 {
            run_frame(&mut clock);
        }
        clock.invalidate();
        let sample = run_frame(&mut clock);
        assert_eq!(sample.index, 1);
        assert_eq!(sample.weight, 1.0);
        assert_eq!(run_frame(&mut clock).index, 2);
    }

    #[test]
    fn aborted_frame_leaves_counter_untouched() {
        let mut clock = FrameClock::new();
        for _ in 0..3 {
            run_frame(&mut clock);
        }
        // Frame fails after begin: no commit happens.
        let _aborted = clock.begin_frame();
        assert_eq!(clock.frame_counter(), 3);
        // The retry picks up exactly where the aborted frame would have.
        assert_eq!(run_frame(&mut clock).index, 4);
    }

    #[test]
    fn aborted_frame_preserves_pending_invalidation() {
        let mut clock = FrameClock::new();
        for _ in 0..3 {
            run_frame(&mut clock);
        }
        clock.invalidate();
        let _aborted = clock.begin_frame();
        // The restart must survive the abort and apply to the next frame.
        assert_eq!(run_frame(&mut clock).index, 1);
    }

    #[test]
    fn disabled_accumulation_always_replaces() {
        let mut clock = FrameClock::new();
        run_frame(&mut clock);
        clock.set_accumulation(false);
        for _ in 0..3 {
            assert_eq!(run_frame(&mut clock).weight, 1.0);
        }
    }

    #[test]
    fn toggling_accumulation_restarts_the_run() {
        let mut clock = FrameClock::new();
        for _ in 0..4 {
            run_frame(&mut clock);
        }
        clock.set_accumulation(false);
        assert_eq!(run_frame(&mut clock).index, 1);
        // Re-enabling restarts again instead of blending with stale frames.
        clock.set_accumulation(true);
        let sample = run_frame(&mut clock);
        assert_eq!(sample.index, 1);
        assert_eq!(sample.weight, 1.0);
        // Toggling to the current state is not an invalidation.
        clock.set_accumulation(true);
        assert_eq!(run_frame(&mut clock).index, 2);
    }

    #[test]
    fn counter_never_reads_below_one() {
        let clock = FrameClock::new();
        assert_eq!(clock.frame_counter(), 1);
    }
}
