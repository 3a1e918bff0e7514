//! Output expectations for asserted commands.
//!
//! An [`Expectation`] describes what a command's output should look like:
//! which stream to search, how to search it, and optionally which return code
//! is required. Any check that does not target stderr also requires stderr to
//! be empty.

use crate::types::CommandResult;
use regex::Regex;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("{0}")]
    Mismatch(Box<Mismatch>),
    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
    #[error("unknown check type: {0}")]
    UnknownCheckType(String),
}

/// Where and how expected results are searched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// Stdout and stderr must both be empty.
    Empty,
    /// Every expected result appears somewhere in stdout.
    Stdout,
    /// Every expected result appears somewhere in stderr.
    Stderr,
    /// A single stdout line contains all expected results.
    StdoutSingleline,
    /// A single stderr line contains all expected results.
    StderrSingleline,
    /// Every expected result appears on some stdout line.
    StdoutMultiline,
    /// Every expected result appears on some stderr line.
    StderrMultiline,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Stdout => "STDOUT",
            Self::Stderr => "STDERR",
            Self::StdoutSingleline => "STDOUT_SINGLELINE",
            Self::StderrSingleline => "STDERR_SINGLELINE",
            Self::StdoutMultiline => "STDOUT_MULTILINE",
            Self::StderrMultiline => "STDERR_MULTILINE",
        }
    }

    fn targets_stderr(self) -> bool {
        matches!(
            self,
            Self::Stderr | Self::StderrSingleline | Self::StderrMultiline
        )
    }
}

impl FromStr for CheckType {
    type Err = CheckError;

    fn from_str(s: &str) -> Result<Self, CheckError> {
        match s {
            "EMPTY" => Ok(Self::Empty),
            "STDOUT" => Ok(Self::Stdout),
            "STDERR" => Ok(Self::Stderr),
            "STDOUT_SINGLELINE" => Ok(Self::StdoutSingleline),
            "STDERR_SINGLELINE" => Ok(Self::StderrSingleline),
            "STDOUT_MULTILINE" => Ok(Self::StdoutMultiline),
            "STDERR_MULTILINE" => Ok(Self::StderrMultiline),
            other => Err(CheckError::UnknownCheckType(other.to_string())),
        }
    }
}

/// Expected shape of a command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub check: CheckType,
    pub expected: Vec<String>,
    pub use_regex: bool,
    pub desired_rc: Option<i32>,
    /// Invert the output match (the return-code check is never inverted).
    pub should_fail: bool,
}

impl Default for Expectation {
    fn default() -> Self {
        Self::empty()
    }
}

impl Expectation {
    pub fn new<I, S>(check: CheckType, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            check,
            expected: expected.into_iter().map(Into::into).collect(),
            use_regex: false,
            desired_rc: None,
            should_fail: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(CheckType::Empty, Vec::<String>::new())
    }

    pub fn stdout(expected: impl Into<String>) -> Self {
        Self::new(CheckType::Stdout, [expected])
    }

    pub fn stderr(expected: impl Into<String>) -> Self {
        Self::new(CheckType::Stderr, [expected])
    }

    pub fn stdout_singleline(expected: impl Into<String>) -> Self {
        Self::new(CheckType::StdoutSingleline, [expected])
    }

    pub fn stderr_singleline(expected: impl Into<String>) -> Self {
        Self::new(CheckType::StderrSingleline, [expected])
    }

    pub fn stdout_multiline<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CheckType::StdoutMultiline, expected)
    }

    pub fn stderr_multiline<I, S>(expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(CheckType::StderrMultiline, expected)
    }

    /// Treat expected results as regular expressions.
    pub fn regex(mut self) -> Self {
        self.use_regex = true;
        self
    }

    pub fn with_rc(mut self, rc: i32) -> Self {
        self.desired_rc = Some(rc);
        self
    }

    pub fn inverted(mut self) -> Self {
        self.should_fail = !self.should_fail;
        self
    }

    /// Evaluate the expectation against a command result.
    pub fn evaluate(&self, result: &CommandResult) -> Result<(), CheckError> {
        let matched = self.output_matches(result)?;
        let mut reasons = Vec::new();
        if matched == self.should_fail {
            reasons.push(if self.should_fail {
                "output matched but was expected not to".to_string()
            } else {
                "output did not match".to_string()
            });
        }
        if let Some(rc) = self.desired_rc {
            if rc != result.exit_code {
                reasons.push(format!(
                    "return code {} does not match desired {rc}",
                    result.exit_code
                ));
            }
        }
        if reasons.is_empty() {
            Ok(())
        } else {
            Err(CheckError::Mismatch(Box::new(Mismatch {
                reason: reasons.join("; "),
                expectation: self.clone(),
                result: result.clone(),
            })))
        }
    }

    fn output_matches(&self, result: &CommandResult) -> Result<bool, CheckError> {
        if !self.check.targets_stderr() && !result.stderr.is_empty() {
            return Ok(false);
        }
        let output = if self.check.targets_stderr() {
            &result.stderr
        } else {
            &result.stdout
        };
        let patterns = self.compile()?;

        match self.check {
            CheckType::Empty => Ok(result.stdout.is_empty()),
            CheckType::Stdout | CheckType::Stderr => {
                Ok(patterns.iter().all(|p| p.found_in(output)))
            }
            CheckType::StdoutMultiline | CheckType::StderrMultiline => Ok(patterns
                .iter()
                .all(|p| output.lines().any(|line| p.found_in(line)))),
            CheckType::StdoutSingleline | CheckType::StderrSingleline => Ok(output
                .lines()
                .any(|line| patterns.iter().all(|p| p.found_in(line)))),
        }
    }

    fn compile(&self) -> Result<Vec<Pattern<'_>>, CheckError> {
        self.expected
            .iter()
            .map(|expected| {
                if self.use_regex {
                    Regex::new(expected)
                        .map(Pattern::Regex)
                        .map_err(|source| CheckError::InvalidPattern {
                            pattern: expected.clone(),
                            source,
                        })
                } else {
                    Ok(Pattern::Literal(expected))
                }
            })
            .collect()
    }

    fn describe(&self) -> String {
        let regex = if self.use_regex { "regex " } else { "" };
        let negation = if self.should_fail { " (inverted)" } else { "" };
        format!(
            "{}{negation}: {regex}{:?}",
            self.check.as_str(),
            self.expected
        )
    }
}

enum Pattern<'a> {
    Literal(&'a str),
    Regex(Regex),
}

impl Pattern<'_> {
    fn found_in(&self, text: &str) -> bool {
        match self {
            Self::Literal(s) => text.contains(s),
            Self::Regex(re) => re.is_match(text),
        }
    }
}

/// A failed expectation with the output that failed it.
#[derive(Debug, Clone)]
pub struct Mismatch {
    pub reason: String,
    pub expectation: Expectation,
    pub result: CommandResult,
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason.trim_end())?;
        write!(f, "\n  expecting {}", self.expectation.describe())?;
        write!(f, "\n  return code: {}", self.result.exit_code)?;
        write!(f, "\n  stdout:")?;
        for line in self.result.stdout.lines() {
            write!(f, "\n    | {line}")?;
        }
        write!(f, "\n  stderr:")?;
        for line in self.result.stderr.lines() {
            write!(f, "\n    | {line}")?;
        }
        Ok(())
    }
}
