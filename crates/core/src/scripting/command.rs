//! Provisioning commands understood by the executor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const BOOTSTRAP: &str = "bootstrap";
pub const INSTALL: &str = "install";
pub const UNINSTALL: &str = "uninstall";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptCommand {
    Bootstrap,
    Install,
    Uninstall,
}

impl ScriptCommand {
    pub const ALL: [ScriptCommand; 3] = [Self::Bootstrap, Self::Install, Self::Uninstall];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => BOOTSTRAP,
            Self::Install => INSTALL,
            Self::Uninstall => UNINSTALL,
        }
    }
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown script command: {s}"))
    }
}
