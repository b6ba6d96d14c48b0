//! console.rs: banner, firmware-exit prompt and failure screen
//!
//! The console borrows the system table from `efi_main` for as long as it is
//! in use; nothing here keeps a global handle to stdin or stdout.

use core::fmt::Write;

use uefi::proto::console::text::{Color, Key};
use uefi::table::{Boot, SystemTable};

use crate::config;
use crate::error::BootError;
use crate::prompt::{self, Countdown, PromptDecision, PromptIo, PROMPT_TEXT};

pub struct Console<'a> {
    st: &'a mut SystemTable<Boot>,
}

impl<'a> Console<'a> {
    pub fn new(st: &'a mut SystemTable<Boot>) -> Self {
        Self { st }
    }

    pub fn banner(&mut self) {
        let out = self.st.stdout();
        let _ = out.clear();
        let _ = out.set_color(Color::LightCyan, Color::Black);
        let _ = out.write_str("\r\n  CobaltOS second-stage loader\r\n");
        let _ = out.set_color(Color::LightGray, Color::Black);
        let _ = writeln!(out, "  v{}  kernel: {}\r", env!("CARGO_PKG_VERSION"), config::KERNEL_PATH);
        match self.st.runtime_services().get_time() {
            Ok(now) => {
                let _ = writeln!(self.st.stdout(), "  Boot Time: {}\r", now);
                log::debug!("boot time {}", now);
            }
            Err(e) => log::warn!("clock unavailable: {:?}", e.status()),
        }
        let _ = self.st.stdout().set_color(Color::White, Color::Black);
    }

    /// Ask whether to continue booting. Disabled builds always continue.
    pub fn firmware_prompt(&mut self) -> PromptDecision {
        if !config::firmware_prompt_enabled() {
            return PromptDecision::Continue;
        }
        let _ = write!(self.st.stdout(), "\r\n  {} ({}s)\r\n", PROMPT_TEXT, config::PROMPT_TIMEOUT_SECS);
        let decision = prompt::run_prompt(Countdown::for_prompt(), self);
        let _ = self.st.stdout().write_str("\r\n");
        decision
    }

    /// Show `err` and hold it on screen until a key or the pause runs out.
    pub fn report_failure(&mut self, err: &BootError) {
        let out = self.st.stdout();
        let _ = out.set_color(Color::Red, Color::Black);
        let _ = write!(out, "\r\n  boot failed: {}\r\n", err);
        let _ = out.set_color(Color::LightGray, Color::Black);
        let _ = write!(out, "  returning to firmware in {}s, press any key\r\n", config::ERROR_PAUSE_SECS);
        let _ = out.set_color(Color::White, Color::Black);
        prompt::wait_for_key(Countdown::for_error_pause(), self);
    }
}

impl PromptIo for Console<'_> {
    fn poll_key(&mut self) -> Option<char> {
        self.st.boot_services().stall(config::PROMPT_POLL_INTERVAL_US);
        match self.st.stdin().read_key() {
            Ok(Some(Key::Printable(c))) => Some(char::from(c)),
            // Non-printable keys still end an error pause.
            Ok(Some(Key::Special(_))) => Some('\0'),
            _ => None,
        }
    }

    fn discard_pending(&mut self) {
        if let Err(e) = self.st.stdin().reset(false) {
            log::debug!("console input reset failed: {:?}", e.status());
        }
    }

    fn show_remaining(&mut self, seconds: usize) {
        let _ = write!(self.st.stdout(), "\r  {}s ", seconds);
    }
}
