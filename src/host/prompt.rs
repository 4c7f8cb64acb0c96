// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator prompts

use std::io::{BufRead, BufReader, Write};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

/// Asks the operator questions during a run
#[async_trait]
pub trait Prompter: Send + Sync {
    /// Yes/no question; an empty answer selects `default`
    async fn confirm(&self, question: &str, default: bool) -> bool;

    /// Free-form answer; `None` when the operator leaves it empty
    async fn ask(&self, question: &str) -> Option<String>;
}

/// Reads answers from the controlling terminal.
///
/// Lines are read on one detached thread for the life of the prompter and
/// handed over a channel. A question abandoned by an interrupt therefore
/// leaves the next typed line to the next question, and the pending read
/// never holds up process exit.
pub struct TerminalPrompter {
    lines: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self::from_reader(BufReader::new(std::io::stdin()))
    }

    pub fn from_reader<R: BufRead + Send + 'static>(input: R) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let spawned = std::thread::Builder::new()
            .name("nest-stdin".to_string())
            .spawn(move || {
                for line in input.lines() {
                    let Ok(line) = line else { break };
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Could not start stdin reader, prompts use their defaults");
        }

        Self {
            lines: Mutex::new(receiver),
        }
    }

    async fn read_answer(&self, prompt: &str) -> Option<String> {
        let mut stdout = std::io::stdout();
        let _ = write!(stdout, "{}", prompt);
        let _ = stdout.flush();

        self.lines
            .lock()
            .await
            .recv()
            .await
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn confirm(&self, question: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let prompt = format!("{} {} ", question, hint);
        match self.read_answer(&prompt).await {
            Some(answer) => parse_yes_no(&answer).unwrap_or(default),
            None => default,
        }
    }

    async fn ask(&self, question: &str) -> Option<String> {
        self.read_answer(&format!("{} ", question)).await
    }
}

/// Answers every confirmation with a fixed value and every question with
/// nothing. Used for `--non-interactive` runs.
pub struct FixedPrompter {
    answer: bool,
}

impl FixedPrompter {
    pub fn new(answer: bool) -> Self {
        Self { answer }
    }
}

#[async_trait]
impl Prompter for FixedPrompter {
    async fn confirm(&self, _question: &str, _default: bool) -> bool {
        self.answer
    }

    async fn ask(&self, _question: &str) -> Option<String> {
        None
    }
}

/// Interpret an operator answer. Unrecognised input yields `None`.
pub fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}
