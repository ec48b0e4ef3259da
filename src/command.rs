//! Command descriptors: the ready-to-execute form of one helper daemon.
//!
//! A [`Command`] carries the executable path, an ordered argument list and the
//! handles the child must inherit. Arguments are built from literal text and
//! handle references; a handle reference can only be created by moving the
//! handle into the [`CommandBuilder`], so every referenced handle is always
//! part of the inherited set.
//!
//! ```text
//! CommandBuilder::new("bin/logcat_receiver")
//!     .arg("log_pipe_fd", fifo)          →  -log_pipe_fd=<fd>
//!     .flag("subscriber_fds")            →  -subscriber_fds=
//!     .append(write_end_a)               →  -subscriber_fds=<fd>
//!     .append(",").append(write_end_b)   →  -subscriber_fds=<fd>,<fd>
//! ```
//!
//! Handle references are resolved to integer descriptor numbers by
//! [`Command::render_args`]. The process monitor realizing the command must
//! keep those numbers stable across exec (clear close-on-exec, do not dup).

use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Argument values
// ---------------------------------------------------------------------------

/// A value appended to an argument: literal text or an inherited handle.
#[derive(Debug)]
pub enum Value {
    Text(String),
    Handle(OwnedFd),
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Self {
        Value::Text(p.to_string_lossy().into_owned())
    }
}

impl From<&PathBuf> for Value {
    fn from(p: &PathBuf) -> Self {
        Value::from(p.as_path())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::Text(n.to_string())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Text(n.to_string())
    }
}

impl From<OwnedFd> for Value {
    fn from(fd: OwnedFd) -> Self {
        Value::Handle(fd)
    }
}

/// One piece of a built argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgPart {
    Text(String),
    /// Index into [`Command::inherited`].
    Handle(usize),
}

/// A single argv entry, possibly assembled from several parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Argument {
    parts: Vec<ArgPart>,
}

impl Argument {
    pub fn parts(&self) -> &[ArgPart] {
        &self.parts
    }

    fn render(&self, inherited: &[OwnedFd]) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                ArgPart::Text(text) => out.push_str(text),
                ArgPart::Handle(index) => out.push_str(&inherited[*index].as_raw_fd().to_string()),
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// An immutable, fully wired helper process description.
#[derive(Debug)]
pub struct Command {
    executable: PathBuf,
    arguments: Vec<Argument>,
    inherited: Vec<OwnedFd>,
}

impl Command {
    pub fn builder(executable: impl Into<PathBuf>) -> CommandBuilder {
        CommandBuilder::new(executable)
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Bare file name of the executable, used as the process label in logs.
    pub fn name(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.executable.display().to_string())
    }

    pub fn arguments(&self) -> &[Argument] {
        &self.arguments
    }

    pub fn inherited(&self) -> &[OwnedFd] {
        &self.inherited
    }

    /// Raw descriptor numbers of the inherited handles, in reference order.
    pub fn inherited_fds(&self) -> Vec<RawFd> {
        self.inherited.iter().map(AsRawFd::as_raw_fd).collect()
    }

    /// Resolve every argument to the text the child receives in argv.
    pub fn render_args(&self) -> Vec<String> {
        self.arguments
            .iter()
            .map(|arg| arg.render(&self.inherited))
            .collect()
    }

    /// Rendered value of `-flag=...`, if the command carries that flag.
    pub fn flag_value(&self, flag: &str) -> Option<String> {
        let prefix = format!("-{flag}=");
        self.render_args()
            .into_iter()
            .find_map(|arg| arg.strip_prefix(&prefix).map(str::to_owned))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable.display())?;
        for arg in self.render_args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Accumulates arguments and handles for one [`Command`].
#[derive(Debug)]
pub struct CommandBuilder {
    executable: PathBuf,
    arguments: Vec<Argument>,
    inherited: Vec<OwnedFd>,
}

impl CommandBuilder {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            arguments: Vec::new(),
            inherited: Vec::new(),
        }
    }

    /// Add `-flag=value`.
    pub fn arg(&mut self, flag: &str, value: impl Into<Value>) -> &mut Self {
        let part = self.part(value.into());
        self.arguments.push(Argument {
            parts: vec![ArgPart::Text(format!("-{flag}=")), part],
        });
        self
    }

    /// Add `-flag=` with the value to be filled by later [`append`](Self::append) calls.
    pub fn flag(&mut self, flag: &str) -> &mut Self {
        self.arguments.push(Argument {
            parts: vec![ArgPart::Text(format!("-{flag}="))],
        });
        self
    }

    /// Add a bare positional argument.
    pub fn positional(&mut self, value: impl Into<Value>) -> &mut Self {
        let part = self.part(value.into());
        self.arguments.push(Argument { parts: vec![part] });
        self
    }

    /// Extend the previously added argument. Starts a new one if there is none.
    pub fn append(&mut self, value: impl Into<Value>) -> &mut Self {
        let part = self.part(value.into());
        match self.arguments.last_mut() {
            Some(last) => last.parts.push(part),
            None => self.arguments.push(Argument { parts: vec![part] }),
        }
        self
    }

    pub fn build(self) -> Command {
        Command {
            executable: self.executable,
            arguments: self.arguments,
            inherited: self.inherited,
        }
    }

    fn part(&mut self, value: Value) -> ArgPart {
        match value {
            Value::Text(text) => ArgPart::Text(text),
            Value::Handle(fd) => {
                self.inherited.push(fd);
                ArgPart::Handle(self.inherited.len() - 1)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
