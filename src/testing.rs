// SPDX-License-Identifier: AGPL-3.0-or-later
//! Test doubles for the host, network and operator boundaries

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;
use crate::fetch::Transport;
use crate::host::{CommandOutput, CommandRunner, HostCommand, Prompter, ELEVATION_COMMAND};

/// Records every command and answers from canned responses
#[derive(Default)]
pub struct RecordingRunner {
    programs: HashSet<String>,
    unavailable: HashSet<String>,
    dry_run: bool,
    responses: Vec<(String, CommandOutput)>,
    log: Mutex<Vec<HostCommand>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `program` resolvable on the fake search path
    pub fn with_program(mut self, program: &str) -> Self {
        self.programs.insert(program.to_string());
        self
    }

    /// Report dry-run mode to steps
    pub fn in_dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Fail to spawn `program`, as if it were not installed
    pub fn unavailable(mut self, program: &str) -> Self {
        self.unavailable.insert(program.to_string());
        self
    }

    /// Answer commands whose unelevated rendering starts with `prefix`
    pub fn respond(mut self, prefix: &str, status: i32, stdout: &str) -> Self {
        self.responses.push((
            prefix.to_string(),
            CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: if status == 0 {
                    String::new()
                } else {
                    format!("{} failed", prefix)
                },
            },
        ));
        self
    }

    pub fn commands(&self) -> Vec<HostCommand> {
        self.log.lock().unwrap().clone()
    }

    /// Unelevated renderings of every recorded command
    pub fn rendered(&self) -> Vec<String> {
        self.commands().iter().map(unelevated).collect()
    }

    pub fn ran(&self, prefix: &str) -> bool {
        self.rendered().iter().any(|command| command.starts_with(prefix))
    }
}

/// Rendering with the elevation wrapper and its `env` prefix removed
pub fn unelevated(command: &HostCommand) -> String {
    if command.program != ELEVATION_COMMAND {
        return command.display();
    }

    let mut args = command.args.iter().peekable();
    if args.peek().map(|arg| arg.as_str()) == Some("env") {
        args.next();
        while args.peek().map(|arg| arg.contains('=')).unwrap_or(false) {
            args.next();
        }
    }
    args.cloned().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        self.log.lock().unwrap().push(command.clone());
        let rendered = unelevated(command);
        let program = rendered.split_whitespace().next().unwrap_or_default();
        if self.unavailable.contains(program) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: not found", program),
            )
            .into());
        }
        Ok(self
            .responses
            .iter()
            .find(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    fn which(&self, program: &str) -> Option<PathBuf> {
        self.programs
            .contains(program)
            .then(|| PathBuf::from("/usr/bin").join(program))
    }

    fn dry_run(&self) -> bool {
        self.dry_run
    }
}

/// Transport answering from per-URL scripts; unknown URLs fail
#[derive(Default)]
pub struct ScriptedTransport {
    bodies: HashMap<String, Vec<u8>>,
    failures_before_success: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `url` always succeeds with `body`
    pub fn serve(mut self, url: &str, body: &str) -> Self {
        self.bodies.insert(url.to_string(), body.as_bytes().to_vec());
        self
    }

    /// `url` fails `failures` times, then serves `body`
    pub fn flaky(self, url: &str, failures: u32, body: &str) -> Self {
        self.failures_before_success
            .lock()
            .unwrap()
            .insert(url.to_string(), failures);
        self.serve(url, body)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), tokio::time::Instant::now()));

        if let Some(remaining) = self.failures_before_success.lock().unwrap().get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(format!("{}: connection reset", url));
            }
        }

        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| format!("{}: 503 Service Unavailable", url))
    }
}

/// Prompter replaying queued answers; an exhausted queue declines
#[derive(Default)]
pub struct ScriptedPrompter {
    confirms: Mutex<VecDeque<bool>>,
    answers: Mutex<VecDeque<Option<String>>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn confirm_with(self, answer: bool) -> Self {
        self.confirms.lock().unwrap().push_back(answer);
        self
    }

    pub fn answer_with(self, answer: Option<&str>) -> Self {
        self.answers
            .lock()
            .unwrap()
            .push_back(answer.map(str::to_string));
        self
    }

    pub fn questions(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn confirm(&self, question: &str, _default: bool) -> bool {
        self.asked.lock().unwrap().push(question.to_string());
        self.confirms.lock().unwrap().pop_front().unwrap_or(false)
    }

    async fn ask(&self, question: &str) -> Option<String> {
        self.asked.lock().unwrap().push(question.to_string());
        self.answers.lock().unwrap().pop_front().flatten()
    }
}
