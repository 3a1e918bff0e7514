//! Shared value types for sessions and command invocations.

use serde::{Deserialize, Serialize};

/// Captured outcome of one external command invocation.
///
/// Produced once per invocation and never retried by the executor; retry
/// policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// Process exit code, or -1 when the process was ended by a signal.
    pub exit_code: i32,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_contains(&self, s: &str) -> bool {
        self.stdout.contains(s)
    }

    pub fn stderr_contains(&self, s: &str) -> bool {
        self.stderr.contains(s)
    }
}

/// Account type used when minting identities on the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    RodsAdmin,
    RodsUser,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RodsAdmin => "rodsadmin",
            Self::RodsUser => "rodsuser",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name and optional password of an identity to provision for a test.
///
/// A missing password means the account is pre-authenticated or shared, and
/// its session never removes service-side data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    pub password: Option<String>,
}

impl UserSpec {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: Some(password.into()),
        }
    }

    pub fn without_password(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: None,
        }
    }
}

/// Icommands a session is allowed to issue.
pub const KNOWN_ICOMMANDS: &[&str] = &[
    "iadmin", "iapitest", "ibun", "icd", "ichksum", "ichmod", "icp", "ienv", "ierror", "iexecmd",
    "iexit", "ifsck", "iget", "ihelp", "iinit", "ils", "ilsresc", "imcoll", "imeta",
    "imiscsvrinfo", "imkdir", "imv", "iphybun", "iphymv", "ips", "iput", "ipwd", "iqdel",
    "iqstat", "iquest", "ireg", "irepl", "irm", "irmtrash", "irodsFs", "irods-grid", "irsync",
    "irule", "iscan", "isysmeta", "iticket", "itrim", "iuserinfo", "ixmsg", "izonereport",
];

/// Whether `name` is one of the known icommands.
pub fn is_known_icommand(name: &str) -> bool {
    KNOWN_ICOMMANDS.contains(&name)
}
