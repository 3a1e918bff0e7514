//! Session module: one identity's isolated client context.
//!
//! Key responsibilities:
//! - Own a scratch directory holding the identity's environment and
//!   authentication files
//! - Run icommands with the era's environment variables pointing at them
//! - Record every invocation in the server log
//! - Remove everything the session created on teardown
//!
//! Sessions that were opened with a password own a collection named after the
//! session id and remove it (and the trash) on teardown. Sessions without one
//! never touch service-side data.

use crate::executor::{self, CommandEnv, CommandSpec, ExecError};
use crate::interrupt::{self, InterruptConfig, InterruptOutcome};
use crate::log_monitor;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use iharness_core::codec::{self, CodecError};
use iharness_core::environment::keys;
use iharness_core::version::VersionError;
use iharness_core::{
    is_known_icommand, CheckError, CommandResult, EnvironmentDocument, Expectation, HarnessConfig,
    VersionEra,
};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Prefix of session scratch directories.
pub const SCRATCH_PREFIX: &str = "irods-testing-";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("`{command}` run by {user} failed its check: {source}")]
    Assertion {
        command: String,
        user: String,
        #[source]
        source: CheckError,
    },
    #[error("`{0}` is not a known icommand")]
    UnknownIcommand(String),
    #[error(transparent)]
    Version(#[from] VersionError),
    #[error("environment file error: {0}")]
    Codec(#[from] CodecError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("environment document has no `{0}`")]
    MissingField(&'static str),
    #[error("session {0} is already torn down")]
    TornDown(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    TornDown,
}

/// Extra options for a single invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Text written to the command's stdin.
    pub stdin: Option<String>,
    /// Base environment; the session's variables are layered on top.
    pub env: Option<CommandEnv>,
}

impl RunOptions {
    pub fn with_stdin(stdin: impl Into<String>) -> Self {
        Self {
            stdin: Some(stdin.into()),
            env: None,
        }
    }
}

/// A client context for one identity.
#[derive(Debug)]
pub struct Session {
    config: Arc<HarnessConfig>,
    era: VersionEra,
    user_name: String,
    zone_name: String,
    environment: EnvironmentDocument,
    environment_dirty: bool,
    password: Option<String>,
    manage_data: bool,
    collection_created: bool,
    session_id: String,
    scratch: Option<TempDir>,
    local_session_dir: PathBuf,
    environment_file: PathBuf,
    authentication_file: PathBuf,
    state: SessionState,
}

impl Session {
    /// Create the scratch directory, authenticate, and (when owning data)
    /// create and enter the session collection.
    ///
    /// Anything created before a failure is cleaned up before the error is
    /// returned.
    pub async fn open(
        config: Arc<HarnessConfig>,
        environment: EnvironmentDocument,
        password: Option<String>,
        manage_data: bool,
    ) -> Result<Self> {
        let era = config.protocol_version()?.era()?;
        let user_name = environment
            .user_name()
            .ok_or(SessionError::MissingField(keys::USER_NAME))?
            .to_string();
        let zone_name = environment
            .zone_name()
            .ok_or(SessionError::MissingField(keys::ZONE_NAME))?
            .to_string();

        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let scratch = match &config.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        let local_session_dir = scratch.path().to_path_buf();
        let dir_name = local_session_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let session_id = format!("{}--{dir_name}", Utc::now().format("%Y-%m-%dZ%H:%M:%S"));

        let mut session = Self {
            era,
            environment_file: local_session_dir.join(era.environment_file_name()),
            authentication_file: local_session_dir.join(era.authentication_file_name()),
            config,
            user_name,
            zone_name,
            environment,
            environment_dirty: true,
            password,
            manage_data,
            collection_created: false,
            session_id,
            scratch: Some(scratch),
            local_session_dir,
            state: SessionState::Active,
        };
        info!(
            user = %session.user_name,
            session_id = %session.session_id,
            era = era.as_str(),
            manage_data,
            "opening session"
        );

        if let Err(err) = session.initialize().await {
            warn!(user = %session.user_name, error = %err, "session setup failed");
            if let Err(cleanup) = session.teardown().await {
                warn!(user = %session.user_name, error = %cleanup, "cleanup after failed setup also failed");
            }
            return Err(err);
        }
        Ok(session)
    }

    async fn initialize(&mut self) -> Result<()> {
        if let Some(password) = self.password.clone() {
            self.check(CommandSpec::argv(["iinit", password.as_str()]), Expectation::empty())
                .await?;
        }
        if self.manage_data {
            let collection = self.session_collection();
            self.check(CommandSpec::argv(["imkdir", collection.as_str()]), Expectation::empty())
                .await?;
            self.collection_created = true;
            self.check(CommandSpec::argv(["icd", collection.as_str()]), Expectation::empty())
                .await?;
        }
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.user_name
    }

    pub fn zone_name(&self) -> &str {
        &self.zone_name
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn era(&self) -> VersionEra {
        self.era
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn manages_data(&self) -> bool {
        self.manage_data
    }

    pub fn local_session_dir(&self) -> &Path {
        &self.local_session_dir
    }

    pub fn environment_file(&self) -> &Path {
        &self.environment_file
    }

    pub fn authentication_file(&self) -> &Path {
        &self.authentication_file
    }

    pub fn home_collection(&self) -> String {
        format!("/{}/home/{}", self.zone_name, self.user_name)
    }

    pub fn session_collection(&self) -> String {
        format!("{}/{}", self.home_collection(), self.session_id)
    }

    pub fn session_trash_collection(&self) -> String {
        self.session_collection()
            .replacen("/home/", "/trash/home/", 1)
    }

    pub fn default_resource(&self) -> Option<&str> {
        self.environment.default_resource()
    }

    pub fn environment(&self) -> &EnvironmentDocument {
        &self.environment
    }

    /// Mutable access; the file is rewritten before the next command.
    pub fn environment_mut(&mut self) -> &mut EnvironmentDocument {
        self.environment_dirty = true;
        &mut self.environment
    }

    pub fn set_environment(&mut self, environment: EnvironmentDocument) {
        self.environment = environment;
        self.environment_dirty = true;
    }

    pub fn merge_environment(&mut self, overrides: &EnvironmentDocument) {
        self.environment.merge(overrides);
        self.environment_dirty = true;
    }

    pub fn set_default_resource(&mut self, resource: impl Into<String>) {
        let resource: String = resource.into();
        self.environment_mut().set(keys::DEFAULT_RESOURCE, resource);
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::TornDown => Err(SessionError::TornDown(self.session_id.clone())),
        }
    }

    /// Write the environment document if it changed since the last write.
    fn refresh_environment_file(&mut self) -> Result<()> {
        if self.environment_dirty {
            codec::write_document(
                &self.environment_file,
                &self.environment,
                self.era.environment_format(),
            )?;
            self.environment_dirty = false;
            debug!(path = %self.environment_file.display(), "environment file written");
        }
        Ok(())
    }

    fn command_env(&mut self, base: Option<CommandEnv>) -> Result<CommandEnv> {
        self.refresh_environment_file()?;
        let mut env = base.unwrap_or_default();
        env.set(
            self.era.environment_file_var(),
            self.environment_file.to_string_lossy(),
        );
        env.set(
            self.era.authentication_file_var(),
            self.authentication_file.to_string_lossy(),
        );
        Ok(match &self.config.icommands_dir {
            Some(dir) => env.with_search_dir(dir),
            None => env,
        })
    }

    /// Reject anything that is not an icommand.
    fn validate(command: &CommandSpec) -> Result<String> {
        let program = command.program_name().ok_or(ExecError::EmptyCommand)?;
        if is_known_icommand(&program) {
            Ok(program)
        } else {
            Err(SessionError::UnknownIcommand(program))
        }
    }

    /// Append a line to the server log. Failures are logged, never returned.
    fn write_server_log(&self, message: &str) {
        let written = log_monitor::resolve_log_path(&self.config.server_log_path)
            .and_then(|path| log_monitor::write_to_log(&path, message));
        if let Err(err) = written {
            warn!(
                path = %self.config.server_log_path.display(),
                error = %err,
                "could not write to server log"
            );
        }
    }

    fn describe(command: &CommandSpec, program: &str) -> String {
        if program == "iinit" {
            "iinit [hidden]".to_string()
        } else {
            command.to_string()
        }
    }

    pub async fn run(&mut self, command: impl Into<CommandSpec>) -> Result<CommandResult> {
        self.run_with(command, RunOptions::default()).await
    }

    pub async fn run_with(
        &mut self,
        command: impl Into<CommandSpec>,
        options: RunOptions,
    ) -> Result<CommandResult> {
        let command = command.into();
        self.ensure_active()?;
        let program = Self::validate(&command)?;
        let described = Self::describe(&command, &program);

        info!(user = %self.user_name, command = %described, "icommand");
        self.write_server_log(&format!(
            " --- IrodsSession: icommand executed by [{}] [{described}] --- \n",
            self.user_name
        ));

        let env = self.command_env(options.env)?;
        Ok(executor::run(&command, &env, options.stdin.as_deref()).await?)
    }

    /// Run `command` and match its output against `expectation`.
    pub async fn check(
        &mut self,
        command: impl Into<CommandSpec>,
        expectation: Expectation,
    ) -> Result<CommandResult> {
        self.check_with(command, expectation, RunOptions::default())
            .await
    }

    pub async fn check_with(
        &mut self,
        command: impl Into<CommandSpec>,
        expectation: Expectation,
        options: RunOptions,
    ) -> Result<CommandResult> {
        let command = command.into();
        let result = self.run_with(command.clone(), options).await?;
        match expectation.evaluate(&result) {
            Ok(()) => Ok(result),
            Err(source) => Err(SessionError::Assertion {
                command: command.to_string(),
                user: self.user_name.clone(),
                source,
            }),
        }
    }

    /// Like [`Session::check`], but a mismatch or error fails the test.
    pub async fn assert_icommand(
        &mut self,
        command: impl Into<CommandSpec>,
        expectation: Expectation,
    ) -> CommandResult {
        match self.check(command, expectation).await {
            Ok(result) => result,
            Err(err) => panic!("{err}"),
        }
    }

    /// Assert that the output does *not* match `expectation`.
    pub async fn assert_icommand_fail(
        &mut self,
        command: impl Into<CommandSpec>,
        expectation: Expectation,
    ) -> CommandResult {
        self.assert_icommand(command, expectation.inverted()).await
    }

    /// Run `command` and stop it once `watched` reaches `threshold_bytes`.
    pub async fn interrupt_icommand(
        &mut self,
        command: impl Into<CommandSpec>,
        watched: &Path,
        threshold_bytes: u64,
    ) -> Result<InterruptOutcome> {
        let config = InterruptConfig::new(threshold_bytes)
            .with_terminate_grace(self.config.terminate_grace());
        self.interrupt_icommand_with(command, watched, &config).await
    }

    pub async fn interrupt_icommand_with(
        &mut self,
        command: impl Into<CommandSpec>,
        watched: &Path,
        config: &InterruptConfig,
    ) -> Result<InterruptOutcome> {
        let command = command.into();
        self.ensure_active()?;
        Self::validate(&command)?;

        info!(user = %self.user_name, command = %command, threshold = config.threshold_bytes, "interrupt icommand");
        self.write_server_log(&format!(" --- interrupt icommand [{command}] --- \n"));

        let env = self.command_env(None)?;
        let mut outcome = interrupt::run_until_file_reaches_size(&command, &env, watched, config).await?;
        if let Some(diagnostics) = outcome.diagnostics_mut() {
            warn!(user = %self.user_name, command = %command, "interrupt failed; listing collection");
            diagnostics.collection_listing = match self.run(CommandSpec::argv(["ils", "-l"])).await {
                Ok(listing) => Some(listing.stdout),
                Err(err) => Some(format!("<ils -l failed: {err}>")),
            };
        }
        Ok(outcome)
    }

    /// Remove the session collection and trash (when owning), then the
    /// scratch directory.
    ///
    /// Every step is attempted; the first service-side failure is returned
    /// after the local files are gone. Calling it again is a no-op.
    pub async fn teardown(&mut self) -> Result<()> {
        if self.state == SessionState::TornDown {
            return Ok(());
        }

        let mut remote_error = None;
        if self.collection_created {
            let collection = self.session_collection();
            let steps = [
                CommandSpec::argv(["icd"]),
                CommandSpec::argv(["irm", "-rf", collection.as_str()]),
                CommandSpec::argv(["irmtrash"]),
            ];
            for step in steps {
                if let Err(err) = self.check(step, Expectation::empty()).await {
                    warn!(user = %self.user_name, error = %err, "remote cleanup step failed");
                    remote_error.get_or_insert(err);
                }
            }
        }

        self.state = SessionState::TornDown;
        let local = self.remove_scratch();
        info!(user = %self.user_name, session_id = %self.session_id, "session torn down");

        match (remote_error, local) {
            (Some(err), _) => Err(err),
            (None, Err(err)) => Err(err.into()),
            (None, Ok(())) => Ok(()),
        }
    }

    fn remove_scratch(&mut self) -> std::io::Result<()> {
        let Some(scratch) = self.scratch.take() else {
            return Ok(());
        };
        match scratch.close() {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Active && self.collection_created {
            warn!(
                user = %self.user_name,
                collection = %self.session_collection(),
                "session dropped without teardown; service-side data left behind"
            );
        }
    }
}

/// Run `body` with `session`, then tear the session down even if the body
/// panicked. A panic is resumed after teardown.
pub async fn with_session<T, F>(mut session: Session, body: F) -> Result<T>
where
    F: for<'s> FnOnce(&'s mut Session) -> BoxFuture<'s, T>,
{
    let outcome = AssertUnwindSafe(body(&mut session)).catch_unwind().await;
    let teardown = session.teardown().await;
    match outcome {
        Ok(value) => teardown.map(|()| value),
        Err(panic) => {
            if let Err(err) = teardown {
                warn!(error = %err, "teardown after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}
