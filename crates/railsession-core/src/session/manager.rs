//! The per-user session state machine.
//!
//! A manager owns one account's [`TicketService`] and decides, once per poll
//! interval, whether the account needs a heartbeat check, a login, or a
//! fresh copy of the credentials another process published.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::passengers::{resolve_members, MemberQuery};
use super::{Liveness, ReadyState, SessionError, SessionEvent, SessionHandle};
use crate::api::client::ApiClient;
use crate::api::{ApiError, TicketService};
use crate::auth::{
    AccountCredentials, CredentialBundle, HttpCaptchaSolver, HttpSlideSolver, LoginError,
    LoginProtocol,
};
use crate::cache::LocalStore;
use crate::cluster::{ClusterRole, CredentialStore, StoreError};
use crate::config::{Config, SessionConfig, UserConfig};
use crate::models::{CookieJar, Passenger, PassengerRecord, Profile};
use crate::utils::{exponential_backoff, jitter, Clock, SleepInterval};

/// Timing knobs for one session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub heartbeat_interval_secs: i64,
    pub poll_interval: Duration,
    pub retry_time: Duration,
    pub request_max_retry: u32,
    pub sleep: SleepInterval,
    pub single_pass: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            poll_interval: config.poll_interval(),
            retry_time: config.retry_time(),
            request_max_retry: config.request_max_retry.max(1),
            sleep: config.sleep_interval,
            single_pass: config.single_pass,
        }
    }
}

pub struct SessionManager {
    identity: String,
    role: ClusterRole,
    settings: SessionSettings,
    service: Box<dyn TicketService>,
    protocol: LoginProtocol,
    store: Option<Arc<dyn CredentialStore>>,
    local: LocalStore,
    clock: Clock,
    alive: Liveness,
    state: watch::Sender<ReadyState>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    profile: Profile,
    passengers: Vec<Passenger>,
    /// Used when clustering is off; mirrors the store otherwise
    heartbeat_at: i64,
    /// Credentials came from disk, the store or a login at least once
    cookies_adopted: bool,
    user_loaded: bool,
}

impl SessionManager {
    pub fn new(
        identity: impl Into<String>,
        role: ClusterRole,
        store: Option<Arc<dyn CredentialStore>>,
        service: Box<dyn TicketService>,
        mut protocol: LoginProtocol,
        local: LocalStore,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        if role.is_clustered() && store.is_none() {
            return Err(SessionError::StoreRequired(role));
        }

        let alive = Liveness::new();
        protocol.bind_liveness(alive.clone());
        let clock = protocol.clock;
        let (state, _) = watch::channel(ReadyState::NotReady);

        Ok(Self {
            identity: identity.into(),
            role,
            settings,
            service,
            protocol,
            store,
            local,
            clock,
            alive,
            state,
            events: None,
            profile: Profile::new(),
            passengers: Vec::new(),
            heartbeat_at: 0,
            cookies_adopted: false,
            user_loaded: false,
        })
    }

    /// Build a session for one configured user with the HTTP client and the
    /// solvers the config names.
    pub fn from_config(
        config: &Config,
        user: &UserConfig,
        store: Option<Arc<dyn CredentialStore>>,
    ) -> Result<Self, SessionError> {
        let role = config.role();
        let local = LocalStore::new(config.data_dir.clone()).map_err(SessionError::Setup)?;
        let service = ApiClient::new(
            config.service.base_url.clone(),
            Duration::from_secs(config.service.request_timeout_secs),
        )?;

        // Followers never log in, so they never need the password
        let account = if role.may_authenticate() {
            user.account()?
        } else {
            AccountCredentials {
                username: user.user_name.clone(),
                ..AccountCredentials::default()
            }
        };

        let mut protocol = LoginProtocol::new(
            user.variant,
            account,
            config.fingerprint.clone(),
            local.qr_dir(),
            config.session.sleep_interval,
            config.session.request_max_retry,
        );
        if let Some(url) = &config.captcha_service_url {
            let solver = HttpCaptchaSolver::new(url.clone()).map_err(SessionError::Setup)?;
            protocol = protocol.with_captcha_solver(Arc::new(solver));
        }
        if let Some(url) = &config.slide_solver_url {
            let solver = HttpSlideSolver::new(url.clone()).map_err(SessionError::Setup)?;
            protocol = protocol.with_slide_solver(Arc::new(solver));
        }

        Self::new(
            user.key.clone(),
            role,
            store,
            Box::new(service),
            protocol,
            local,
            SessionSettings::from(&config.session),
        )
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> ClusterRole {
        self.role
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.identity.clone(),
            self.alive.clone(),
            self.state.subscribe(),
            self.settings.retry_time,
        )
    }

    pub fn ready_state(&self) -> ReadyState {
        if !self.alive.is_alive() {
            return ReadyState::Destroyed;
        }
        *self.state.borrow()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn cookies(&self) -> &CookieJar {
        self.service.cookies()
    }

    pub fn destroy(&self) {
        if self.alive.kill() {
            info!(user = %self.identity, "Session destroyed");
        }
    }

    // ===== Main loop =====

    /// Drive the session until `destroy()`, or for one pass in single-pass
    /// mode.
    pub async fn run(&mut self) {
        info!(user = %self.identity, role = %self.role, variant = %self.protocol.variant(), "Session started");

        if self.role == ClusterRole::Single {
            self.load_user().await;
        }

        while self.alive.is_alive() {
            self.tick().await;
            if self.settings.single_pass {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        if !self.alive.is_alive() {
            self.set_state(ReadyState::Destroyed);
        }
        info!(user = %self.identity, "Session loop finished");
    }

    /// One pass of the loop.
    pub async fn tick(&mut self) {
        match self.role {
            ClusterRole::Follower => {
                if let Err(e) = self.load_from_remote().await {
                    warn!(user = %self.identity, error = %e, "Could not adopt published credentials");
                }
            }
            ClusterRole::Authority => {
                // Pick up what a previous authority published before logging in
                if !self.cookies_adopted {
                    if let Err(e) = self.load_from_remote().await {
                        warn!(user = %self.identity, error = %e, "Could not read published credentials");
                    }
                }
                self.check_heartbeat().await;
            }
            ClusterRole::Single => {
                self.check_heartbeat().await;
            }
        }
    }

    // ===== Heartbeat =====

    /// Re-validate the login once the heartbeat interval has passed,
    /// logging in again when it no longer holds. Returns whether the session
    /// is usable.
    pub async fn check_heartbeat(&mut self) -> bool {
        if !self.role.may_authenticate() {
            return self.ready_state() == ReadyState::Ready;
        }

        let last = self.last_heartbeat().await;
        let now = self.clock.now_secs();
        if last > 0 && now - last < self.settings.heartbeat_interval_secs {
            debug!(user = %self.identity, age_secs = now - last, "Heartbeat still fresh");
            return true;
        }

        match self.ensure_authenticated().await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(ApiError::SystemBusy) => {
                warn!(user = %self.identity, "Service busy, skipping this heartbeat");
                return false;
            }
            Err(e) => {
                warn!(user = %self.identity, error = %e, "Heartbeat check failed");
                return false;
            }
        }

        self.user_did_load();
        info!(
            user = %self.identity,
            name = %self.profile.display_name(),
            interval_secs = self.settings.heartbeat_interval_secs,
            "Heartbeat normal"
        );
        true
    }

    /// Make sure the account is logged in: validate what we have, fall back
    /// to the saved cookie file, and log in as a last resort.
    pub async fn ensure_authenticated(&mut self) -> Result<bool, ApiError> {
        let valid = if self.is_first_time().await {
            false
        } else {
            match self.validate_login().await {
                Ok(valid) => valid,
                Err(e) if e.is_auth_failure() => return Ok(self.handle_login(true).await),
                Err(e) => return Err(e),
            }
        };
        if valid {
            return Ok(true);
        }
        if self.load_user().await {
            return Ok(true);
        }
        Ok(self.handle_login(false).await)
    }

    async fn validate_login(&mut self) -> Result<bool, ApiError> {
        Ok(self.check_user_is_login().await? && self.can_access_passengers().await?)
    }

    /// Ask the service whether the cookies are still logged in. A positive
    /// answer refreshes the heartbeat and the profile.
    async fn check_user_is_login(&mut self) -> Result<bool, ApiError> {
        let max_retry = self.settings.request_max_retry;
        for attempt in 1..=max_retry {
            match self.service.check_login().await {
                Ok(true) => {
                    self.save_user().await;
                    self.set_last_heartbeat(self.clock.now_secs()).await;
                    return Ok(self.refresh_profile().await);
                }
                Ok(false) => debug!(user = %self.identity, attempt, "Service reports logged out"),
                Err(e @ (ApiError::SystemBusy | ApiError::SessionExpired)) => return Err(e),
                Err(e) => warn!(user = %self.identity, attempt, error = %e, "Login check failed"),
            }
            if attempt < max_retry {
                tokio::time::sleep(jitter(self.settings.sleep)).await;
            }
        }
        Ok(false)
    }

    /// The passenger list is behind the login wall, so reaching it proves the
    /// session works for booking.
    async fn can_access_passengers(&mut self) -> Result<bool, ApiError> {
        let max_retry = self.settings.request_max_retry;
        for attempt in 1..=max_retry {
            let reason = match self.service.fetch_passengers().await {
                Ok(listing) if !listing.passengers.is_empty() => return Ok(true),
                Ok(listing) => listing
                    .messages
                    .unwrap_or_else(|| "empty response".to_string()),
                Err(e @ (ApiError::SystemBusy | ApiError::SessionExpired)) => return Err(e),
                Err(e) => e.to_string(),
            };
            let wait = jitter(self.settings.sleep);
            warn!(user = %self.identity, attempt, %reason, wait_secs = wait.as_secs_f64(), "Passenger list unreachable");
            if attempt < max_retry {
                tokio::time::sleep(wait).await;
            }
        }
        Ok(false)
    }

    async fn refresh_profile(&mut self) -> bool {
        let max_retry = self.settings.request_max_retry;
        for attempt in 1..=max_retry {
            match self.service.fetch_profile().await {
                Ok(Some(profile)) => {
                    self.profile.merge(profile);
                    self.save_user().await;
                    return true;
                }
                Ok(None) => debug!(user = %self.identity, attempt, "Profile response had no user"),
                Err(e) => warn!(user = %self.identity, attempt, error = %e, "Profile fetch failed"),
            }
            if attempt < max_retry {
                tokio::time::sleep(jitter(self.settings.sleep)).await;
            }
        }
        false
    }

    // ===== Login =====

    /// Log in with the configured variant. Recoverable failures are retried
    /// with backoff until success or `destroy()`; rejected credentials
    /// return `false` at once and leave the session stale.
    pub async fn handle_login(&mut self, expired: bool) -> bool {
        if !self.role.may_authenticate() {
            warn!(user = %self.identity, "Followers never log in");
            return false;
        }
        if expired {
            warn!(user = %self.identity, "Login expired, logging in again");
        }
        self.set_state(ReadyState::Stale);
        info!(user = %self.identity, variant = %self.protocol.variant(), "Starting login");

        let mut attempt: u32 = 0;
        loop {
            if !self.alive.is_alive() {
                return false;
            }
            attempt += 1;

            match self.protocol.login(self.service.as_mut()).await {
                Ok(bundle) => {
                    self.absorb(bundle).await;
                    return true;
                }
                Err(LoginError::Cancelled) => {
                    info!(user = %self.identity, "Login cancelled");
                    return false;
                }
                Err(e) if !e.is_retryable() => {
                    error!(user = %self.identity, error = %e, "Login failed, waiting for the next heartbeat");
                    return false;
                }
                Err(e) => {
                    let wait = exponential_backoff(attempt);
                    warn!(
                        user = %self.identity,
                        attempt,
                        error = %e,
                        wait_secs = wait.as_secs_f64(),
                        "Login failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take over a login result, publish it, and mark the session usable.
    async fn absorb(&mut self, bundle: CredentialBundle) {
        let CredentialBundle {
            cookies,
            display_name,
        } = bundle;
        *self.service.cookies_mut() = cookies;
        self.profile.set_display_name(display_name);
        self.cookies_adopted = true;
        info!(user = %self.identity, name = %self.profile.display_name(), "Login succeeded, welcome");

        self.save_user().await;
        self.refresh_profile().await;
        self.set_last_heartbeat(self.clock.now_secs()).await;
        self.set_state(ReadyState::Ready);
    }

    // ===== Persistence =====

    /// Persist cookies locally and, on the authority, publish cookies and
    /// profile to the store.
    async fn save_user(&self) {
        if !self.role.may_authenticate() {
            return;
        }
        let jar = self.service.cookies();

        if self.role == ClusterRole::Authority {
            if let Some(store) = &self.store {
                match jar.to_bytes() {
                    Ok(bytes) => {
                        if let Err(e) = store.set_cookie(&self.identity, &bytes).await {
                            warn!(user = %self.identity, error = %e, "Failed to publish cookies");
                        }
                    }
                    Err(e) => warn!(user = %self.identity, error = %e, "Failed to encode cookies"),
                }
                if let Err(e) = store.set_info(&self.identity, &self.profile).await {
                    warn!(user = %self.identity, error = %e, "Failed to publish profile");
                }
            }
        }

        if let Err(e) = self.local.save_cookies(&self.identity, jar) {
            warn!(user = %self.identity, error = %format!("{:#}", e), "Failed to save cookie file");
        }
    }

    pub async fn last_heartbeat(&self) -> i64 {
        match (&self.store, self.role.is_clustered()) {
            (Some(store), true) => match store.get_heartbeat(&self.identity).await {
                Ok(at) => at,
                Err(e) => {
                    warn!(user = %self.identity, error = %e, "Failed to read heartbeat");
                    self.heartbeat_at
                }
            },
            _ => self.heartbeat_at,
        }
    }

    async fn set_last_heartbeat(&mut self, at: i64) {
        self.heartbeat_at = at;
        if let (Some(store), true) = (&self.store, self.role.is_clustered()) {
            if let Err(e) = store.set_heartbeat(&self.identity, at).await {
                warn!(user = %self.identity, error = %e, "Failed to publish heartbeat");
            }
        }
    }

    /// No credentials were ever saved for this user.
    async fn is_first_time(&self) -> bool {
        match (&self.store, self.role.is_clustered()) {
            (Some(store), true) => match store.get_cookie(&self.identity).await {
                Ok(cookie) => cookie.is_none(),
                Err(e) => {
                    warn!(user = %self.identity, error = %e, "Failed to read published cookies");
                    true
                }
            },
            _ => !self.local.has_cookies(&self.identity),
        }
    }

    /// Restore the single-node cookie file, once per process.
    async fn load_user(&mut self) -> bool {
        if self.role.is_clustered() || self.cookies_adopted {
            return false;
        }
        let jar = match self.local.load_cookies(&self.identity) {
            Ok(Some(jar)) => jar,
            Ok(None) => return false,
            Err(e) => {
                warn!(user = %self.identity, error = %format!("{:#}", e), "Ignoring unreadable cookie file");
                return false;
            }
        };
        *self.service.cookies_mut() = jar;
        self.cookies_adopted = true;
        self.did_load_user().await
    }

    /// Check restored credentials before trusting them.
    async fn did_load_user(&mut self) -> bool {
        info!(user = %self.identity, "Restored saved credentials, checking them");
        match self.validate_login().await {
            Ok(true) => {
                info!(user = %self.identity, name = %self.profile.display_name(), "Saved credentials still valid, welcome back");
                self.user_did_load();
                true
            }
            result => {
                if let Err(e) = result {
                    debug!(user = %self.identity, error = %e, "Validation of saved credentials failed");
                }
                info!(user = %self.identity, "Saved credentials have expired");
                self.set_last_heartbeat(0).await;
                false
            }
        }
    }

    fn user_did_load(&mut self) {
        self.set_state(ReadyState::Ready);
        if self.user_loaded {
            return;
        }
        self.user_loaded = true;
        self.emit(SessionEvent::UserLoaded {
            identity: self.identity.clone(),
        });
    }

    // ===== Replication =====

    /// Adopt the credentials the authority published. A follower keeps
    /// waiting `retry_time` between reads until both cookies and profile are
    /// present; the authority reads once.
    pub async fn load_from_remote(&mut self) -> Result<bool, SessionError> {
        let store = self
            .store
            .clone()
            .ok_or(SessionError::StoreRequired(self.role))?;

        loop {
            if !self.alive.is_alive() {
                return Ok(false);
            }

            match read_remote(store.as_ref(), &self.identity).await {
                Ok((Some(jar), Some(profile))) => return Ok(self.adopt(jar, profile).await),
                Ok(_) if self.role != ClusterRole::Follower => return Ok(false),
                Ok((cookie, info)) => info!(
                    user = %self.identity,
                    has_cookie = cookie.is_some(),
                    has_profile = info.is_some(),
                    retry_secs = self.settings.retry_time.as_secs(),
                    "Waiting for the authority to publish credentials"
                ),
                Err(e) if self.role != ClusterRole::Follower => return Err(e.into()),
                Err(e) => warn!(user = %self.identity, error = %e, "Failed to read published credentials"),
            }

            tokio::time::sleep(self.settings.retry_time).await;
        }
    }

    /// Replace cookies and profile together.
    async fn adopt(&mut self, jar: CookieJar, profile: Profile) -> bool {
        *self.service.cookies_mut() = jar;
        self.profile = profile;

        if self.cookies_adopted {
            debug!(user = %self.identity, "Refreshed credentials from the store");
            return true;
        }
        self.cookies_adopted = true;

        match self.role {
            ClusterRole::Follower => {
                info!(user = %self.identity, name = %self.profile.display_name(), "Adopted published credentials, welcome");
                self.user_did_load();
                true
            }
            _ => self.did_load_user().await,
        }
    }

    // ===== Passengers =====

    /// Resolve `members` (codes, names, or `*name` for an adult ticket) into
    /// booking records. Any unknown member fails the whole call.
    pub async fn get_passengers<S>(
        &mut self,
        members: &[S],
    ) -> Result<Vec<PassengerRecord>, SessionError>
    where
        S: AsRef<str> + Sync,
    {
        self.load_passengers().await?;

        let queries: Vec<MemberQuery> = members
            .iter()
            .map(|m| MemberQuery::parse(m.as_ref()))
            .collect();
        resolve_members(&self.passengers, &queries).map_err(|query| {
            warn!(user = %self.identity, member = %query.label(), "Passenger is not in the roster");
            SessionError::UnknownPassenger {
                identity: self.identity.clone(),
                member: query.label().to_string(),
            }
        })
    }

    /// Fill the roster from memory, a fresh snapshot file, or the service,
    /// retrying the service until it answers with a non-empty list.
    async fn load_passengers(&mut self) -> Result<(), SessionError> {
        if !self.passengers.is_empty() {
            return Ok(());
        }

        match self.local.load_passengers(&self.identity) {
            Ok(Some(snapshot)) if !snapshot.is_stale() && !snapshot.data.is_empty() => {
                debug!(user = %self.identity, age = %snapshot.age_display(), "Using passenger snapshot");
                self.passengers = snapshot.data;
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(user = %self.identity, error = %format!("{:#}", e), "Ignoring unreadable passenger snapshot"),
        }

        loop {
            if !self.alive.is_alive() {
                return Err(SessionError::Destroyed);
            }

            let reason = match self.service.fetch_passengers().await {
                Ok(listing) if !listing.passengers.is_empty() => {
                    if let Err(e) = self.local.save_passengers(&self.identity, &listing.passengers) {
                        warn!(user = %self.identity, error = %format!("{:#}", e), "Failed to save passenger snapshot");
                    }
                    info!(user = %self.identity, count = listing.passengers.len(), "Loaded passenger roster");
                    self.passengers = listing.passengers;
                    return Ok(());
                }
                Ok(listing) => listing
                    .messages
                    .unwrap_or_else(|| "empty response".to_string()),
                Err(e) if e.is_auth_failure() && self.role.may_authenticate() => {
                    if !self.handle_login(true).await {
                        if !self.alive.is_alive() {
                            return Err(SessionError::Destroyed);
                        }
                        return Err(SessionError::LoginFailed {
                            identity: self.identity.clone(),
                        });
                    }
                    e.to_string()
                }
                Err(e) => e.to_string(),
            };

            let wait = jitter(self.settings.sleep);
            warn!(user = %self.identity, %reason, wait_secs = wait.as_secs_f64(), "Could not fetch passengers, retrying");
            if self.role == ClusterRole::Follower {
                if let Err(e) = self.load_from_remote().await {
                    warn!(user = %self.identity, error = %e, "Could not refresh credentials");
                }
            }
            tokio::time::sleep(wait).await;
        }
    }

    // ===== State =====

    fn set_state(&self, state: ReadyState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(user = %self.identity, from = %previous, to = %state, "Session state changed");
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver just means nobody listens any more
            let _ = events.send(event);
        }
    }
}

/// Read cookies and profile in one go so they are adopted as a pair.
async fn read_remote(
    store: &dyn CredentialStore,
    identity: &str,
) -> Result<(Option<CookieJar>, Option<Profile>), StoreError> {
    let cookie = store.get_cookie(identity).await?;
    let info = store.get_info(identity).await?;

    let jar = match cookie {
        Some(bytes) => Some(CookieJar::from_bytes(&bytes).map_err(|e| StoreError::Corrupt {
            identity: identity.to_string(),
            field: "cookie",
            reason: e.to_string(),
        })?),
        None => None,
    };
    Ok((jar, info))
}
