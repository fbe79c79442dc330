//! Strips job-control bytes from viewer keystrokes before they reach the PTY,
//! so a stray Ctrl+C in a browser tab cannot kill the shared session. Only
//! applied to Web -> CLI input; local keystrokes bypass it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    EndOfFile,
    Suspend,
    Quit,
}

impl Signal {
    pub const ALL: [Signal; 4] = [
        Signal::Interrupt,
        Signal::EndOfFile,
        Signal::Suspend,
        Signal::Quit,
    ];

    pub fn byte(self) -> char {
        match self {
            Signal::Interrupt => '\u{03}',
            Signal::EndOfFile => '\u{04}',
            Signal::Suspend => '\u{1a}',
            Signal::Quit => '\u{1c}',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::EndOfFile => "EOF",
            Signal::Suspend => "SIGTSTP",
            Signal::Quit => "SIGQUIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputFilterConfig {
    pub block_sigint: bool,
    pub block_eof: bool,
    pub block_sigtstp: bool,
    pub block_sigquit: bool,
}

impl Default for InputFilterConfig {
    fn default() -> Self {
        Self {
            block_sigint: true,
            block_eof: true,
            block_sigtstp: true,
            block_sigquit: true,
        }
    }
}

impl InputFilterConfig {
    pub fn allow_all() -> Self {
        Self {
            block_sigint: false,
            block_eof: false,
            block_sigtstp: false,
            block_sigquit: false,
        }
    }

    pub fn blocks(&self, signal: Signal) -> bool {
        match signal {
            Signal::Interrupt => self.block_sigint,
            Signal::EndOfFile => self.block_eof,
            Signal::Suspend => self.block_sigtstp,
            Signal::Quit => self.block_sigquit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterResult {
    pub blocked: bool,
    pub data: String,
    pub blocked_signals: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InputFilter {
    config: InputFilterConfig,
}

impl InputFilter {
    pub fn new(config: InputFilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InputFilterConfig {
        &self.config
    }

    /// Remove every enabled control byte in a single pass, keeping all other
    /// characters in order. Each blocked signal is reported once.
    pub fn filter(&self, input: Option<&str>) -> FilterResult {
        let Some(input) = input else {
            return FilterResult::default();
        };

        let enabled: Vec<Signal> = Signal::ALL
            .into_iter()
            .filter(|signal| self.config.blocks(*signal))
            .collect();
        let mut found = [false; 4];
        let mut data = String::with_capacity(input.len());
        for ch in input.chars() {
            match enabled.iter().find(|signal| signal.byte() == ch) {
                Some(signal) => found[*signal as usize] = true,
                None => data.push(ch),
            }
        }

        let blocked_signals: Vec<&'static str> = Signal::ALL
            .into_iter()
            .filter(|signal| found[*signal as usize])
            .map(Signal::name)
            .collect();
        FilterResult {
            blocked: !blocked_signals.is_empty(),
            data,
            blocked_signals,
        }
    }
}
