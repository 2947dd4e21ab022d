//! Accounts, token refresh and the device-authorization login flow

use crate::error::{Error, Result};
use crate::models::sanitize_uuid;
use crate::storage::AccountStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{Duration, Instant};

/// Token marking an account that never talks to the auth servers.
pub const OFFLINE_TOKEN: &str = "PlayerLink/Offline";

/// Refresh when expiry is closer than this.
const REFRESH_MARGIN_HOURS: i64 = 6;

/// Display ticks per second for the device-code countdown.
pub const TICKS_PER_SECOND: u64 = 20;

// ============================================================================
// Account
// ============================================================================

#[derive(Debug, Clone)]
pub struct Account {
    pub uuid: String,
    pub name: String,
    pub auth_token: String,
    pub refresh_token: String,
    pub expiration: DateTime<Utc>,
}

impl Account {
    pub fn new(
        name: &str,
        uuid: &str,
        auth_token: String,
        refresh_token: String,
        expiration: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            uuid: sanitize_uuid(uuid)?,
            name: name.to_string(),
            auth_token,
            refresh_token,
            expiration,
        })
    }

    /// A local-only account that never authenticates.
    pub fn offline(name: &str, uuid: &str) -> Result<Self> {
        Self::new(
            name,
            uuid,
            OFFLINE_TOKEN.to_string(),
            String::new(),
            DateTime::UNIX_EPOCH,
        )
    }

    pub fn is_offline(&self) -> bool {
        self.auth_token == OFFLINE_TOKEN
    }

    pub fn is_expired(&self) -> bool {
        self.expiration <= Utc::now()
    }

    /// Expired or about to expire; checked before every authenticated
    /// operation.
    pub fn needs_refresh(&self) -> bool {
        self.expiration <= Utc::now() + ChronoDuration::hours(REFRESH_MARGIN_HOURS)
    }
}

impl PartialEq for Account {
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid && self.name == other.name
    }
}

impl Eq for Account {}

// ============================================================================
// Device flow
// ============================================================================

/// Everything the UI shows while the user authorizes out-of-band.
#[derive(Debug, Clone)]
pub struct DeviceFlowData {
    pub verification_uri: String,
    pub user_code: String,
    pub device_code: String,
    pub message: String,
    /// Seconds until the authorization server expires the code.
    pub expires_in: u64,
    /// Seconds between token polls.
    pub interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlowState {
    Idle,
    AwaitingUserAction,
    Polling,
    Success,
    Expired,
    Denied,
}

/// Tokens granted by a completed device flow or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
}

/// What one token poll produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Pending,
    Authorized(TokenSet),
    Declined,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFlowOutcome {
    Success(TokenSet),
    Expired,
    Denied,
}

type StatusSink = Box<dyn Fn(&str) + Send + Sync>;

/// Device-authorization grant state machine:
/// `Idle -> AwaitingUserAction -> Polling -> {Success, Expired, Denied}`.
/// The countdown is display-only; expiry is enforced by the
/// authorization server and, as a backstop, by the poll loop's
/// deadline.
pub struct DeviceFlow {
    data: DeviceFlowData,
    state: Mutex<DeviceFlowState>,
    remaining_ticks: Mutex<u64>,
    sink: Mutex<Option<StatusSink>>,
}

impl DeviceFlow {
    pub fn new(data: DeviceFlowData) -> Self {
        let remaining_ticks = data.expires_in * TICKS_PER_SECOND;
        Self {
            data,
            state: Mutex::new(DeviceFlowState::AwaitingUserAction),
            remaining_ticks: Mutex::new(remaining_ticks),
            sink: Mutex::new(None),
        }
    }

    pub fn data(&self) -> &DeviceFlowData {
        &self.data
    }

    pub fn state(&self) -> DeviceFlowState {
        *self.state.lock()
    }

    /// Replace the status sink. The old sink is cleared before the new
    /// one is installed, so a torn-down screen's controls can never see
    /// another push.
    pub fn set_status_sink(&self, sink: impl Fn(&str) + Send + Sync + 'static) {
        let mut slot = self.sink.lock();
        *slot = None;
        *slot = Some(Box::new(sink));
    }

    pub fn clear_status_sink(&self) {
        *self.sink.lock() = None;
    }

    fn push_status(&self, status: &str) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink(status);
        }
    }

    /// One display tick (20 per second). Returns the remaining whole
    /// seconds for the countdown label.
    pub fn tick(&self) -> u64 {
        let mut ticks = self.remaining_ticks.lock();
        *ticks = ticks.saturating_sub(1);
        *ticks / TICKS_PER_SECOND
    }

    pub fn remaining_seconds(&self) -> u64 {
        *self.remaining_ticks.lock() / TICKS_PER_SECOND
    }

    /// Poll `poll` every `interval` seconds until a terminal outcome.
    /// Stops with `Expired` once `expires_in` has elapsed even when the
    /// server never pushes a terminal status. Poll errors are pushed to
    /// the sink and polling continues until the deadline.
    pub async fn run<F, Fut>(&self, poll: F) -> DeviceFlowOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<PollOutcome>>,
    {
        *self.state.lock() = DeviceFlowState::Polling;
        self.push_status("auth.pending");
        let deadline = Instant::now() + Duration::from_secs(self.data.expires_in);
        let interval = Duration::from_secs(self.data.interval.max(1));
        loop {
            tokio::time::sleep(interval).await;
            if Instant::now() >= deadline {
                self.finish(DeviceFlowState::Expired, "auth.expired");
                return DeviceFlowOutcome::Expired;
            }
            match poll().await {
                Ok(PollOutcome::Pending) => self.push_status("auth.pending"),
                Ok(PollOutcome::Authorized(tokens)) => {
                    self.push_status("auth.working");
                    self.finish(DeviceFlowState::Success, "auth.finished");
                    return DeviceFlowOutcome::Success(tokens);
                }
                Ok(PollOutcome::Declined) => {
                    self.finish(DeviceFlowState::Denied, "auth.denied");
                    return DeviceFlowOutcome::Denied;
                }
                Ok(PollOutcome::Expired) => {
                    self.finish(DeviceFlowState::Expired, "auth.expired");
                    return DeviceFlowOutcome::Expired;
                }
                Err(err) => {
                    log::warn!("device flow poll failed: {err}");
                    self.push_status("auth.error");
                }
            }
        }
    }

    fn finish(&self, state: DeviceFlowState, status: &str) {
        *self.state.lock() = state;
        self.push_status(status);
    }
}

// ============================================================================
// Auth client
// ============================================================================

/// Provider endpoints for the device-authorization grant.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub device_code_url: String,
    pub token_url: String,
    pub profile_url: String,
    pub client_id: String,
    pub scope: String,
}

impl AuthConfig {
    #[cfg(test)]
    pub(crate) fn example() -> Self {
        Self {
            device_code_url: "https://auth.example.com/devicecode".to_string(),
            token_url: "https://auth.example.com/token".to_string(),
            profile_url: "https://auth.example.com/profile".to_string(),
            client_id: "client".to_string(),
            scope: "login offline_access".to_string(),
        }
    }
}

/// Talks to the provider's device-code, token and profile endpoints.
pub struct AuthClient {
    http: reqwest::Client,
    config: AuthConfig,
}

impl AuthClient {
    pub fn new(config: AuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http, config })
    }

    /// First step of the flow: ask the provider for a device code.
    pub async fn start_device_flow(&self) -> Result<DeviceFlow> {
        log::debug!("starting device auth flow");
        let response = self
            .http
            .post(&self.config.device_code_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("scope", self.config.scope.as_str()),
            ])
            .send()
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
        let data = DeviceFlowData {
            verification_uri: require_str(&body, "verification_uri")?,
            user_code: require_str(&body, "user_code")?,
            device_code: require_str(&body, "device_code")?,
            message: require_str(&body, "message")?,
            expires_in: require_u64(&body, "expires_in")?,
            interval: body.get("interval").and_then(Value::as_u64).unwrap_or(5),
        };
        log::debug!("displaying device code to user");
        Ok(DeviceFlow::new(data))
    }

    /// One token poll for a pending device flow.
    pub async fn poll_token(&self, device_code: &str) -> Result<PollOutcome> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("device_code", device_code),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
            ])
            .send()
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
        decode_poll(&body)
    }

    /// Resolve the authenticated profile for a fresh token set.
    pub async fn fetch_profile(&self, tokens: &TokenSet) -> Result<Account> {
        let response = self
            .http
            .get(&self.config.profile_url)
            .header("Authorization", format!("Bearer {}", tokens.access_token))
            .send()
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
        Account::new(
            &require_str(&body, "name")?,
            &require_str(&body, "id")?,
            tokens.access_token.clone(),
            tokens.refresh_token.clone(),
            Utc::now() + ChronoDuration::seconds(tokens.expires_in as i64),
        )
    }

    /// Single refresh attempt. Anything but a fresh token set means the
    /// user must go through the device flow again.
    pub async fn refresh(&self, account: &Account) -> Result<Account> {
        log::debug!("refreshing auth token for {}", account.name);
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("refresh_token", account.refresh_token.as_str()),
                ("scope", self.config.scope.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| Error::Decode(e.to_string()))?;
        if body.get("error").is_some() {
            return Err(Error::AuthExpired);
        }
        let tokens = TokenSet {
            access_token: require_str(&body, "access_token")?,
            refresh_token: require_str(&body, "refresh_token")?,
            expires_in: body
                .get("expires_in")
                .and_then(Value::as_u64)
                .unwrap_or(86400),
        };
        Account::new(
            &account.name,
            &account.uuid,
            tokens.access_token,
            tokens.refresh_token,
            Utc::now() + ChronoDuration::seconds(tokens.expires_in as i64),
        )
    }
}

fn decode_poll(body: &Value) -> Result<PollOutcome> {
    if let (Some(access), Some(refresh)) = (
        body.get("access_token").and_then(Value::as_str),
        body.get("refresh_token").and_then(Value::as_str),
    ) {
        return Ok(PollOutcome::Authorized(TokenSet {
            access_token: access.to_string(),
            refresh_token: refresh.to_string(),
            expires_in: body
                .get("expires_in")
                .and_then(Value::as_u64)
                .unwrap_or(86400),
        }));
    }
    match body.get("error").and_then(Value::as_str) {
        Some("authorization_pending") | Some("slow_down") => Ok(PollOutcome::Pending),
        Some("authorization_declined") | Some("access_denied") => Ok(PollOutcome::Declined),
        Some("expired_token") => Ok(PollOutcome::Expired),
        Some(other) => Err(Error::Decode(format!("token poll error `{other}`"))),
        None => Err(Error::Decode("token poll without token or error".into())),
    }
}

fn require_str(body: &Value, field: &str) -> Result<String> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Decode(format!("missing field `{field}`")))
}

fn require_u64(body: &Value, field: &str) -> Result<u64> {
    body.get(field)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Decode(format!("missing field `{field}`")))
}

// ============================================================================
// Account manager
// ============================================================================

/// Owns the persisted account list and the process-wide current
/// account. Login swaps are refused while a game session is active.
pub struct AccountManager {
    store: AccountStore,
    auth: AuthClient,
    current: Mutex<Option<Account>>,
    session_active: AtomicBool,
}

impl AccountManager {
    pub fn new(store: AccountStore, auth: AuthClient) -> Result<Self> {
        let current = store.current_account()?;
        Ok(Self {
            store,
            auth,
            current: Mutex::new(current),
            session_active: AtomicBool::new(false),
        })
    }

    pub fn accounts(&self) -> Result<Vec<Account>> {
        self.store.accounts()
    }

    pub fn current(&self) -> Option<Account> {
        self.current.lock().clone()
    }

    pub fn auth(&self) -> &AuthClient {
        &self.auth
    }

    /// The embedder flips this while a game session is running;
    /// switching identities mid-session is refused.
    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::Release);
    }

    pub fn login_permitted(&self) -> bool {
        !self.session_active.load(Ordering::Acquire)
    }

    pub fn add_account(&self, account: &Account) -> Result<()> {
        self.store.upsert(account)
    }

    pub fn remove_account(&self, uuid: &str) -> Result<()> {
        self.store.remove(uuid)
    }

    /// Gate and freshen an account before it becomes the session
    /// identity: one transparent refresh attempt when the token is near
    /// expiry; offline accounts skip the network entirely. On refresh
    /// failure the caller prompts a fresh device flow.
    pub async fn prepare_login(&self, account: Account) -> Result<Account> {
        if !self.login_permitted() {
            return Err(Error::SessionActive);
        }
        if account.is_offline() || !account.needs_refresh() {
            return Ok(account);
        }
        if account.is_expired() {
            log::debug!("token for {} expired, refreshing", account.name);
        }
        let refreshed = self.auth.refresh(&account).await.map_err(|err| {
            log::warn!("token refresh for {} failed: {err}", account.name);
            Error::AuthExpired
        })?;
        self.store.upsert(&refreshed)?;
        Ok(refreshed)
    }

    /// Record the account that just became the session identity.
    pub fn set_current(&self, account: &Account) -> Result<()> {
        self.store.upsert(account)?;
        self.store.set_current(&account.uuid)?;
        *self.current.lock() = Some(account.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use std::sync::Arc;

    fn account_expiring_in(hours: i64) -> Account {
        Account::new(
            "Tester",
            "067e61623b6f4ae2a1712470b63dff00",
            "token".to_string(),
            "refresh".to_string(),
            Utc::now() + ChronoDuration::hours(hours),
        )
        .unwrap()
    }

    #[test]
    fn account_expiry_and_refresh_margin() {
        assert!(account_expiring_in(-1).is_expired());
        assert!(account_expiring_in(-1).needs_refresh());
        // inside the margin: not expired yet but due for a refresh
        let soon = account_expiring_in(2);
        assert!(!soon.is_expired());
        assert!(soon.needs_refresh());
        let later = account_expiring_in(48);
        assert!(!later.is_expired());
        assert!(!later.needs_refresh());
    }

    #[test]
    fn offline_accounts_never_expire_into_refresh() {
        let offline = Account::offline("Tester", "067e61623b6f4ae2a1712470b63dff00").unwrap();
        assert!(offline.is_offline());
        // expiry is meaningless for offline accounts, the login path
        // checks is_offline first
        assert!(offline.is_expired());
    }

    #[test]
    fn decode_poll_outcomes() {
        assert_eq!(
            decode_poll(&json!({"error": "authorization_pending"})).unwrap(),
            PollOutcome::Pending
        );
        assert_eq!(
            decode_poll(&json!({"error": "authorization_declined"})).unwrap(),
            PollOutcome::Declined
        );
        assert_eq!(
            decode_poll(&json!({"error": "expired_token"})).unwrap(),
            PollOutcome::Expired
        );
        assert!(decode_poll(&json!({"error": "bad_verification_code"})).is_err());
        assert!(decode_poll(&json!({})).is_err());

        let authorized = decode_poll(&json!({
            "access_token": "a",
            "refresh_token": "r",
            "expires_in": 3600
        }))
        .unwrap();
        assert_eq!(
            authorized,
            PollOutcome::Authorized(TokenSet {
                access_token: "a".to_string(),
                refresh_token: "r".to_string(),
                expires_in: 3600
            })
        );
    }

    fn flow(expires_in: u64, interval: u64) -> DeviceFlow {
        DeviceFlow::new(DeviceFlowData {
            verification_uri: "https://auth.example.com/link".to_string(),
            user_code: "ABCD-1234".to_string(),
            device_code: "device".to_string(),
            message: "visit the link".to_string(),
            expires_in,
            interval,
        })
    }

    #[test]
    fn countdown_ticks_are_display_only() {
        let flow = flow(3, 1);
        assert_eq!(flow.remaining_seconds(), 3);
        for _ in 0..TICKS_PER_SECOND {
            flow.tick();
        }
        assert_eq!(flow.remaining_seconds(), 2);
        // running the countdown dry does not change the state machine
        for _ in 0..(3 * TICKS_PER_SECOND) {
            flow.tick();
        }
        assert_eq!(flow.remaining_seconds(), 0);
        assert_eq!(flow.state(), DeviceFlowState::AwaitingUserAction);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_expires_without_terminal_status() {
        let flow = flow(30, 5);
        let outcome = flow.run(|| async { Ok(PollOutcome::Pending) }).await;
        assert_eq!(outcome, DeviceFlowOutcome::Expired);
        assert_eq!(flow.state(), DeviceFlowState::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_returns_tokens_on_authorization() {
        let flow = flow(300, 5);
        let polls = Arc::new(PlMutex::new(0));
        let polls_in_fn = Arc::clone(&polls);
        let outcome = flow
            .run(move || {
                let polls = Arc::clone(&polls_in_fn);
                async move {
                    let mut count = polls.lock();
                    *count += 1;
                    if *count < 3 {
                        Ok(PollOutcome::Pending)
                    } else {
                        Ok(PollOutcome::Authorized(TokenSet {
                            access_token: "a".to_string(),
                            refresh_token: "r".to_string(),
                            expires_in: 3600,
                        }))
                    }
                }
            })
            .await;
        assert!(matches!(outcome, DeviceFlowOutcome::Success(_)));
        assert_eq!(flow.state(), DeviceFlowState::Success);
        assert_eq!(*polls.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn status_pushes_stop_after_sink_clear() {
        let flow = Arc::new(flow(10, 2));
        let statuses: Arc<PlMutex<Vec<String>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink_statuses = Arc::clone(&statuses);
        flow.set_status_sink(move |status| sink_statuses.lock().push(status.to_string()));

        flow.push_status("auth.pending");
        assert_eq!(statuses.lock().as_slice(), ["auth.pending"]);

        flow.clear_status_sink();
        flow.push_status("auth.finished");
        // nothing reached the torn-down sink
        assert_eq!(statuses.lock().as_slice(), ["auth.pending"]);
    }
}
