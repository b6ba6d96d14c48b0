//! Firmware-exit prompt logic, kept apart from the console so it can be tested.

use crate::config;

pub const PROMPT_TEXT: &str = "press 'f' to exit to firmware, 'c' to continue";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDecision {
    ExitToFirmware,
    Continue,
}

/// Map a keypress to a decision. Other keys are ignored.
pub fn decision_for(key: char) -> Option<PromptDecision> {
    match key.to_ascii_lowercase() {
        'f' => Some(PromptDecision::ExitToFirmware),
        'c' | '\r' | '\n' => Some(PromptDecision::Continue),
        _ => None,
    }
}

/// Countdown over keyboard polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Countdown {
    polls_left: usize,
    polls_per_second: usize,
}

impl Countdown {
    pub fn new(seconds: u32, poll_interval_us: usize) -> Self {
        let polls_per_second = (1_000_000 / poll_interval_us.max(1)).max(1);
        Self { polls_left: seconds as usize * polls_per_second, polls_per_second }
    }

    /// Prompt countdown with the configured timeout and polling interval.
    pub fn for_prompt() -> Self {
        Self::new(config::PROMPT_TIMEOUT_SECS, config::PROMPT_POLL_INTERVAL_US)
    }

    pub fn for_error_pause() -> Self {
        Self::new(config::ERROR_PAUSE_SECS, config::PROMPT_POLL_INTERVAL_US)
    }

    /// Consume one poll. Returns `false` once time is up.
    pub fn tick(&mut self) -> bool {
        if self.polls_left == 0 {
            return false;
        }
        self.polls_left -= 1;
        true
    }

    /// Whole seconds left, rounded up, for the on-screen countdown.
    pub fn seconds_left(&self) -> usize {
        self.polls_left.div_ceil(self.polls_per_second)
    }

    /// True on the poll that starts a new second.
    pub fn at_second_boundary(&self) -> bool {
        self.polls_left % self.polls_per_second == 0
    }
}

/// Keyboard and screen as seen by a running prompt.
pub trait PromptIo {
    /// Wait one polling interval and return the key pressed during it.
    fn poll_key(&mut self) -> Option<char>;

    /// Throw away keys typed before the wait started.
    fn discard_pending(&mut self) {}

    fn show_remaining(&mut self, _seconds: usize) {}
}

/// Wait for a decision. Timing out means [`PromptDecision::Continue`].
pub fn run_prompt<I: PromptIo + ?Sized>(mut countdown: Countdown, io: &mut I) -> PromptDecision {
    io.discard_pending();
    while countdown.tick() {
        if let Some(decision) = io.poll_key().and_then(decision_for) {
            return decision;
        }
        if countdown.at_second_boundary() {
            io.show_remaining(countdown.seconds_left());
        }
    }
    PromptDecision::Continue
}

/// Wait until any key is pressed or the countdown runs out.
/// Returns whether a key was pressed.
pub fn wait_for_key<I: PromptIo + ?Sized>(mut countdown: Countdown, io: &mut I) -> bool {
    io.discard_pending();
    while countdown.tick() {
        if io.poll_key().is_some() {
            return true;
        }
    }
    false
}
