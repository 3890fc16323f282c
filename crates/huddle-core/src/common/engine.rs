//! The seam between the relay and the text-completion engine.
//!
//! A [`GenerationEngine`] is expensive, blocking and **not** safe to call
//! concurrently. `generate` therefore takes `&mut self`: the relay keeps the
//! engine inside its exclusive section, so the only way to reach it is
//! through that section's guard.
//!
//! Two engines ship with the crate:
//!
//! - [`EchoEngine`] - replies with the last user instruction, optionally after
//!   a fixed delay. Useful for development and load tests.
//! - [`CommandEngine`] - pipes the prompt into an external completion program
//!   and returns what it prints.
//!
//! Any `FnMut(&str) -> Result<String, EngineError>` closure is also an engine.

use crate::{error::EngineError, prompt::last_instruction};
use core::time::Duration;
use std::{
    io::Write,
    process::{Command, Stdio},
    thread,
};

/// A blocking, non-reentrant text-completion function.
pub trait GenerationEngine: Send + 'static {
    /// Produces a completion for `prompt`.
    fn generate(&mut self, prompt: &str) -> Result<String, EngineError>;
}

impl<F> GenerationEngine for F
where
    F: FnMut(&str) -> Result<String, EngineError> + Send + 'static,
{
    fn generate(&mut self, prompt: &str) -> Result<String, EngineError> {
        self(prompt)
    }
}

/// Replies with the instruction it was asked about.
#[derive(Clone, Debug, Default)]
pub struct EchoEngine {
    delay: Duration,
}

impl EchoEngine {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl GenerationEngine for EchoEngine {
    fn generate(&mut self, prompt: &str) -> Result<String, EngineError> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let instruction = last_instruction(prompt).unwrap_or(prompt).trim();
        Ok(format!("You said: {instruction}"))
    }
}

/// Runs an external completion program once per prompt.
///
/// The prompt is written to the program's stdin; trimmed stdout becomes the
/// response. A non-zero exit status is reported as [`EngineError::Failed`]
/// carrying the program's stderr.
#[derive(Clone, Debug)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn spawn_error(&self, reason: impl ToString) -> EngineError {
        EngineError::Spawn {
            command: self.program.clone(),
            reason: reason.to_string(),
        }
    }
}

impl GenerationEngine for CommandEngine {
    fn generate(&mut self, prompt: &str) -> Result<String, EngineError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.spawn_error("stdin unavailable"))?;

        // Feed stdin from a helper thread so a chatty child cannot fill its
        // stdout pipe while we are still writing.
        let input = prompt.to_owned();
        let writer = thread::spawn(move || stdin.write_all(input.as_bytes()));

        let output = child.wait_with_output().map_err(|e| self.spawn_error(e))?;
        let written = writer.join().map_err(|_| EngineError::Panicked)?;

        // A failing program may exit before draining stdin, so its status
        // takes precedence over a broken pipe.
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Failed {
                reason: format!(
                    "`{}` exited with {}: {}",
                    self.program,
                    output.status,
                    stderr.trim()
                ),
            });
        }
        written.map_err(|e| self.spawn_error(e))?;

        let text = String::from_utf8(output.stdout).map_err(|e| EngineError::InvalidOutput {
            reason: e.to_string(),
        })?;
        Ok(text.trim().to_string())
    }
}
