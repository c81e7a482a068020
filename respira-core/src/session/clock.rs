//! Tick-driven elapsed-time engine.
//!
//! The clock knows nothing about audio or tasks: it counts ticks against the
//! segment durations of a plan and reports when a segment boundary or the end
//! of the plan is crossed. Each tick advances by at most one segment.

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("Clock already running")]
    AlreadyRunning,
    #[error("Clock not running")]
    NotRunning,
    #[error("Clock already paused")]
    AlreadyPaused,
    #[error("Clock not paused")]
    NotPaused,
    #[error("Plan has no segments")]
    Empty,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Advance {
    NoChange,
    SegmentAdvanced { index: usize },
    Completed,
}

#[derive(Debug, Default, Clone)]
pub struct SessionClock {
    /// Cumulative end second of each segment.
    boundaries: Vec<u32>,
    total: u32,
    elapsed: u32,
    index: usize,
    running: bool,
    paused: bool,
}

impl SessionClock {
    /// Build a clock for the given segment durations. The total is fixed here.
    pub fn new(durations: &[u32]) -> Self {
        let mut end = 0u32;
        let boundaries = durations
            .iter()
            .map(|d| {
                end = end.saturating_add(*d);
                end
            })
            .collect();
        Self {
            boundaries,
            total: end,
            ..Self::default()
        }
    }

    pub fn start(&mut self) -> Result<(), ClockError> {
        if self.running {
            return Err(ClockError::AlreadyRunning);
        }
        if self.boundaries.is_empty() {
            return Err(ClockError::Empty);
        }
        self.elapsed = 0;
        self.index = 0;
        self.paused = false;
        self.running = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<(), ClockError> {
        if !self.running {
            return Err(ClockError::NotRunning);
        }
        if self.paused {
            return Err(ClockError::AlreadyPaused);
        }
        self.paused = true;
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), ClockError> {
        if !self.running {
            return Err(ClockError::NotRunning);
        }
        if !self.paused {
            return Err(ClockError::NotPaused);
        }
        self.paused = false;
        Ok(())
    }

    /// Stop and rewind to zero. Segment layout and total are kept.
    pub fn reset(&mut self) {
        self.elapsed = 0;
        self.index = 0;
        self.running = false;
        self.paused = false;
    }

    /// Count one elapsed second.
    pub fn tick(&mut self) -> Advance {
        if !self.running || self.paused {
            return Advance::NoChange;
        }
        self.elapsed = self.elapsed.saturating_add(1);
        if self.elapsed >= self.total {
            self.running = false;
            return Advance::Completed;
        }
        match self.boundaries.get(self.index) {
            Some(end) if self.elapsed >= *end && self.index + 1 < self.boundaries.len() => {
                self.index += 1;
                Advance::SegmentAdvanced { index: self.index }
            }
            _ => Advance::NoChange,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn elapsed(&self) -> u32 {
        self.elapsed
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.elapsed)
    }

    pub fn segment_count(&self) -> usize {
        self.boundaries.len()
    }
}
