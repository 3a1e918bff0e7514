//! Session manager: mints identities on the service and hands out sessions.

use crate::executor::CommandSpec;
use crate::session::{Result, Session, SessionError};
use futures::future::BoxFuture;
use futures::FutureExt;
use iharness_core::codec;
use iharness_core::{
    CheckType, ClientProfile, EnvironmentDocument, Expectation, HarnessConfig, Role, UserSpec,
    VersionEra,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates sessions from a shared [`HarnessConfig`].
#[derive(Debug, Clone)]
pub struct SessionManager {
    config: Arc<HarnessConfig>,
    era: VersionEra,
}

impl SessionManager {
    /// Resolve the service version and reject versions outside known eras.
    pub fn new(config: HarnessConfig) -> Result<Self> {
        Self::from_shared(Arc::new(config))
    }

    pub fn from_shared(config: Arc<HarnessConfig>) -> Result<Self> {
        let version = config.protocol_version()?;
        let era = version.era()?;
        info!(version = %version, era = era.as_str(), "session manager ready");
        Ok(Self { config, era })
    }

    pub fn config(&self) -> &Arc<HarnessConfig> {
        &self.config
    }

    pub fn era(&self) -> VersionEra {
        self.era
    }

    /// The service account's structured environment document.
    pub fn service_account_environment(&self) -> Result<EnvironmentDocument> {
        Ok(codec::decode_structured(&self.config.service_env_path)?)
    }

    /// Name and zone of the pre-existing admin, from the config or the
    /// service account environment.
    fn admin_identity(&self) -> Result<(String, String)> {
        if let (Some(name), Some(zone)) = (&self.config.admin_name, &self.config.zone_name) {
            return Ok((name.clone(), zone.clone()));
        }
        let service = self.service_account_environment()?;
        let name = match &self.config.admin_name {
            Some(name) => name.clone(),
            None => service
                .user_name()
                .ok_or(SessionError::MissingField("irods_user_name"))?
                .to_string(),
        };
        let zone = match &self.config.zone_name {
            Some(zone) => zone.clone(),
            None => service
                .zone_name()
                .ok_or(SessionError::MissingField("irods_zone_name"))?
                .to_string(),
        };
        Ok((name, zone))
    }

    pub fn zone_name(&self) -> Result<String> {
        Ok(self.admin_identity()?.1)
    }

    /// Default client environment for `user` using the configured port,
    /// resource and SSL settings.
    pub fn client_environment(&self, user: &str, host: &str, zone: &str) -> EnvironmentDocument {
        let profile = ClientProfile {
            port: self.config.port,
            default_resource: self.config.default_resource.clone(),
            use_ssl: self.config.use_ssl,
            ..ClientProfile::new(user, host, zone)
        };
        EnvironmentDocument::for_client(&profile)
    }

    /// Session for the pre-existing admin. Never removes service-side data.
    pub async fn admin_session(&self) -> Result<Session> {
        let (name, zone) = self.admin_identity()?;
        let environment = self.client_environment(&name, &self.config.icat_hostname, &zone);
        Session::open(
            Arc::clone(&self.config),
            environment,
            Some(self.config.admin_password.clone()),
            false,
        )
        .await
    }

    /// Session for an account that already exists. Never removes
    /// service-side data.
    pub async fn session_for_existing_user(
        &self,
        name: &str,
        password: Option<&str>,
        host: &str,
        zone: &str,
    ) -> Result<Session> {
        let environment = self.client_environment(name, host, zone);
        Session::open(
            Arc::clone(&self.config),
            environment,
            password.map(str::to_string),
            false,
        )
        .await
    }

    /// Create an account and open a session for it.
    ///
    /// The session owns a collection (and removes it on teardown) only when a
    /// password is given. If the password cannot be set or the session cannot
    /// be opened, the account is removed again.
    pub async fn provision(
        &self,
        role: Role,
        name: &str,
        password: Option<&str>,
        host: &str,
    ) -> Result<Session> {
        let zone = self.zone_name()?;
        let mut admin = self.admin_session().await?;
        let created = match Self::create_user_as(&mut admin, role, name, password).await {
            Err(CreateError::AfterCreate(err)) => {
                warn!(user = name, error = %err, "account setup failed; removing account");
                if let Err(cleanup) = Self::remove_user_as(&mut admin, name).await {
                    warn!(user = name, error = %cleanup, "could not remove half-created account");
                }
                Err(err)
            }
            other => other.map_err(CreateError::into_inner),
        };
        Self::close_admin(admin, created).await?;
        info!(user = name, role = %role, "account created");

        let environment = self.client_environment(name, host, &zone);
        let opened = Session::open(
            Arc::clone(&self.config),
            environment,
            password.map(str::to_string),
            password.is_some(),
        )
        .await;
        if opened.is_err() {
            if let Err(err) = self.remove_user(name).await {
                warn!(user = name, error = %err, "could not remove account after failed session setup");
            }
        }
        opened
    }

    async fn create_user_as(
        admin: &mut Session,
        role: Role,
        name: &str,
        password: Option<&str>,
    ) -> std::result::Result<(), CreateError> {
        admin
            .check(
                CommandSpec::argv(["iadmin", "mkuser", name, role.as_str()]),
                Expectation::empty(),
            )
            .await
            .map_err(CreateError::BeforeCreate)?;
        if let Some(password) = password {
            admin
                .check(
                    CommandSpec::argv(["iadmin", "moduser", name, "password", password]),
                    Expectation::empty(),
                )
                .await
                .map_err(CreateError::AfterCreate)?;
        }
        Ok(())
    }

    pub async fn remove_user(&self, name: &str) -> Result<()> {
        let mut admin = self.admin_session().await?;
        let removed = Self::remove_user_as(&mut admin, name).await;
        Self::close_admin(admin, removed).await
    }

    async fn remove_user_as(admin: &mut Session, name: &str) -> Result<()> {
        admin
            .check(
                CommandSpec::argv(["iadmin", "rmuser", name]),
                Expectation::empty(),
            )
            .await?;
        info!(user = name, "account removed");
        Ok(())
    }

    /// Create `group` and add each of `users` to it.
    pub async fn make_group_with_users(&self, group: &str, users: &[&str]) -> Result<()> {
        let mut admin = self.admin_session().await?;
        let made = Self::make_group_as(&mut admin, group, users).await;
        Self::close_admin(admin, made).await
    }

    async fn make_group_as(admin: &mut Session, group: &str, users: &[&str]) -> Result<()> {
        admin
            .check(
                CommandSpec::argv(["iadmin", "mkgroup", group]),
                Expectation::empty(),
            )
            .await?;
        for user in users {
            admin
                .check(
                    CommandSpec::argv(["iadmin", "atg", group, *user]),
                    Expectation::empty(),
                )
                .await?;
        }
        info!(group, members = users.len(), "group created");
        Ok(())
    }

    pub async fn remove_group(&self, group: &str) -> Result<()> {
        let mut admin = self.admin_session().await?;
        let removed = admin
            .check(
                CommandSpec::argv(["iadmin", "rmgroup", group]),
                Expectation::empty(),
            )
            .await
            .map(|_| ());
        Self::close_admin(admin, removed).await
    }

    /// Account names known to the service, without the `#zone` suffix.
    pub async fn list_users(&self) -> Result<Vec<String>> {
        let mut admin = self.admin_session().await?;
        let listed = admin
            .check(
                CommandSpec::argv(["iadmin", "lu"]),
                Expectation::new(CheckType::Stdout, Vec::<String>::new()).with_rc(0),
            )
            .await
            .map(|result| {
                result
                    .stdout
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| line.split('#').next().unwrap_or(line).to_string())
                    .collect()
            });
        Self::close_admin(admin, listed).await
    }

    /// Tear down a temporary admin session, preferring the error of the work
    /// it did.
    async fn close_admin<T>(mut admin: Session, result: Result<T>) -> Result<T> {
        let closed = admin.teardown().await;
        let value = result?;
        closed?;
        Ok(value)
    }
}

/// Where account creation stopped: before the account existed, or after.
enum CreateError {
    BeforeCreate(SessionError),
    AfterCreate(SessionError),
}

impl CreateError {
    fn into_inner(self) -> SessionError {
        match self {
            Self::BeforeCreate(err) | Self::AfterCreate(err) => err,
        }
    }
}

/// A set of provisioned admin and user sessions.
#[derive(Debug)]
pub struct SessionFixture {
    manager: SessionManager,
    pub admin_sessions: Vec<Session>,
    pub user_sessions: Vec<Session>,
}

impl SessionFixture {
    /// Provision every admin, then every user, against the configured host.
    ///
    /// If any step fails, what was already provisioned is torn down and
    /// removed before the error is returned.
    pub async fn setup(
        manager: &SessionManager,
        admins: &[UserSpec],
        users: &[UserSpec],
    ) -> Result<Self> {
        let mut fixture = Self {
            manager: manager.clone(),
            admin_sessions: Vec::with_capacity(admins.len()),
            user_sessions: Vec::with_capacity(users.len()),
        };
        let host = manager.config().hostname.clone();

        for (role, specs) in [(Role::RodsAdmin, admins), (Role::RodsUser, users)] {
            for spec in specs {
                let provisioned = manager
                    .provision(role, &spec.name, spec.password.as_deref(), &host)
                    .await;
                match provisioned {
                    Ok(session) => match role {
                        Role::RodsAdmin => fixture.admin_sessions.push(session),
                        Role::RodsUser => fixture.user_sessions.push(session),
                    },
                    Err(err) => {
                        warn!(user = %spec.name, error = %err, "fixture setup failed; rolling back");
                        if let Err(cleanup) = fixture.teardown().await {
                            warn!(error = %cleanup, "fixture rollback incomplete");
                        }
                        return Err(err);
                    }
                }
            }
        }
        info!(
            admins = fixture.admin_sessions.len(),
            users = fixture.user_sessions.len(),
            "fixture ready"
        );
        Ok(fixture)
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// The `index`th admin session, in provisioning order.
    pub fn admin(&mut self, index: usize) -> Option<&mut Session> {
        self.admin_sessions.get_mut(index)
    }

    pub fn user(&mut self, index: usize) -> Option<&mut Session> {
        self.user_sessions.get_mut(index)
    }

    /// Tear down every session and remove its account, most recently
    /// provisioned first.
    ///
    /// Continues past failures and returns the first one.
    pub async fn teardown(&mut self) -> Result<()> {
        let sessions: Vec<Session> = self
            .admin_sessions
            .drain(..)
            .chain(self.user_sessions.drain(..))
            .collect();
        if sessions.is_empty() {
            return Ok(());
        }

        let mut first_error: Option<SessionError> = None;
        let mut admin = match self.manager.admin_session().await {
            Ok(admin) => Some(admin),
            Err(err) => {
                warn!(error = %err, "no admin session; accounts will not be removed");
                first_error = Some(err);
                None
            }
        };

        for mut session in sessions.into_iter().rev() {
            let name = session.username().to_string();
            if let Err(err) = session.teardown().await {
                warn!(user = %name, error = %err, "session teardown failed");
                first_error.get_or_insert(err);
            }
            if let Some(admin) = admin.as_mut() {
                if let Err(err) = SessionManager::remove_user_as(admin, &name).await {
                    warn!(user = %name, error = %err, "account removal failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(admin) = admin.as_mut() {
            if let Err(err) = admin.teardown().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Set up a fixture, run `body` with it, and tear it down even if the body
/// panicked. A panic is resumed after teardown.
pub async fn with_fixture<T, F>(
    manager: &SessionManager,
    admins: &[UserSpec],
    users: &[UserSpec],
    body: F,
) -> Result<T>
where
    F: for<'f> FnOnce(&'f mut SessionFixture) -> BoxFuture<'f, T>,
{
    let mut fixture = SessionFixture::setup(manager, admins, users).await?;
    let outcome = AssertUnwindSafe(body(&mut fixture)).catch_unwind().await;
    let teardown = fixture.teardown().await;
    match outcome {
        Ok(value) => teardown.map(|()| value),
        Err(panic) => {
            if let Err(err) = teardown {
                warn!(error = %err, "fixture teardown after panic failed");
            }
            std::panic::resume_unwind(panic)
        }
    }
}
