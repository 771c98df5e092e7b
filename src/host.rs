//! Dispatch targets.
//!
//! The configured host list is ordered and may repeat entries. Position in the list matters:
//! the selector walks it front to back and earlier entries win ties.

use std::ffi::OsStr;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use clap::ValueEnum;
use serde::Deserialize;
use void::Void;

use crate::serde::{positive, string_or_struct};

/// Name of the implicit local target.
pub const LOCALHOST: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    /// SSH destination, or `localhost`.
    pub name: String,
    /// Relative capacity. Active jobs are divided by this before comparison.
    #[serde(default = "default_weight", deserialize_with = "positive")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl HostEntry {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }

    pub fn is_local(&self) -> bool {
        self.name == LOCALHOST
    }
}

impl FromStr for HostEntry {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s, default_weight()))
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.weight == 1 {
            write!(f, "[{}]", self.name)
        } else {
            write!(f, "[{} (weight={})]", self.name, self.weight)
        }
    }
}

/// One entry of the `hosts` list as written in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec(#[serde(deserialize_with = "string_or_struct")] pub HostEntry);

/// Where one invocation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote(HostEntry),
}

impl Target {
    /// Host id under which the job is recorded in the state store.
    pub fn host_id(&self) -> &str {
        match self {
            Target::Local => LOCALHOST,
            Target::Remote(host) => &host.name,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Local => write!(f, "[{}]", LOCALHOST),
            Target::Remote(host) => host.fmt(f),
        }
    }
}

/// Program name of the direct entry point.
pub const DISPATCHER_NAME: &str = "rffmpeg";

/// Which binary of the suite is being wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Tool {
    Ffmpeg,
    Ffprobe,
}

impl Tool {
    /// Picks the tool from the name this binary was invoked under. `None` under the
    /// dispatcher's own name, where the tool is given as an argument instead.
    pub fn from_program_name(program: &OsStr) -> Option<Self> {
        let path = Path::new(program);
        if path.file_stem() == Some(OsStr::new(DISPATCHER_NAME)) {
            return None;
        }
        let name = path.file_name().unwrap_or(program).to_string_lossy();
        if name.contains("ffprobe") {
            Some(Tool::Ffprobe)
        } else {
            Some(Tool::Ffmpeg)
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Tool::Ffmpeg => f.write_str("ffmpeg"),
            Tool::Ffprobe => f.write_str("ffprobe"),
        }
    }
}
