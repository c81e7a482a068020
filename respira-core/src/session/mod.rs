//! Breathing session orchestration: the elapsed-time clock and the async
//! sequencer built on it.

pub mod clock;
pub mod sequencer;

pub use clock::{Advance, ClockError, SessionClock};
pub use sequencer::{INHALE_SCALE, REST_SCALE, SessionDeps, SessionSequencer, WelcomeFlow};
