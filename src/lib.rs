//! PlayerLink Core Library
//!
//! Client-side integration layer for the PlayerLink social service:
//! typed requests, entity caches, channels and chat, relations, the
//! device-authorization login flow and presence updates. Screens and
//! widgets are external collaborators that call into this crate; no
//! rendering happens here.

pub mod auth;
pub mod cache;
pub mod channels;
pub mod chat;
pub mod error;
pub mod global;
pub mod models;
pub mod network;
pub mod presence;
pub mod relations;
pub mod semver;
pub mod storage;
pub mod users;

use std::path::Path;
use std::sync::Arc;

use url::Url;

pub use auth::*;
pub use cache::*;
pub use channels::*;
pub use chat::*;
pub use error::*;
pub use global::*;
pub use models::*;
pub use network::*;
pub use presence::*;
pub use relations::*;
pub use semver::*;
pub use storage::*;
pub use users::*;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub auth: AuthConfig,
    /// The running client's own version, for update checks.
    pub client_version: SemVer,
}

impl ClientConfig {
    pub fn new(api_url: &str, auth: AuthConfig, client_version: SemVer) -> Result<Self> {
        Ok(Self {
            api_url: Url::parse(api_url).map_err(|e| Error::Network(e.to_string()))?,
            auth,
            client_version,
        })
    }
}

/// Main client context. One of these replaces the usual pile of
/// process-wide singletons: construct it once, hand it to the screens
/// that need it, and drop it (or `shutdown`) on logout.
pub struct PlayerLink {
    config: ClientConfig,
    api: Arc<ApiClient>,
    users: Arc<UserService>,
    channels: ChannelService,
    relations: RelationService,
    global: GlobalDataService,
    presence: PresencePublisher,
    accounts: AccountManager,
    chat: ChatDispatcher,
}

impl PlayerLink {
    /// Wire up the services. `data_dir` holds the local account store.
    pub fn new(config: ClientConfig, data_dir: &Path) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        let users = Arc::new(UserService::new(Arc::clone(&api)));
        let channels = ChannelService::new(Arc::clone(&api), Arc::clone(&users));
        let relations = RelationService::new(Arc::clone(&api), Arc::clone(&users));
        let global = GlobalDataService::new(Arc::clone(&api));
        let presence = PresencePublisher::new(Arc::clone(&api));
        let store = AccountStore::new(data_dir)?;
        let accounts = AccountManager::new(store, AuthClient::new(config.auth.clone())?)?;

        Ok(Self {
            config,
            api,
            users,
            channels,
            relations,
            global,
            presence,
            accounts,
            chat: ChatDispatcher::new(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn users(&self) -> &UserService {
        &self.users
    }

    pub fn channels(&self) -> &ChannelService {
        &self.channels
    }

    pub fn relations(&self) -> &RelationService {
        &self.relations
    }

    pub fn global(&self) -> &GlobalDataService {
        &self.global
    }

    pub fn presence(&self) -> &PresencePublisher {
        &self.presence
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn chat(&self) -> &ChatDispatcher {
        &self.chat
    }

    /// Whether the service announces a newer release than the running
    /// client.
    pub async fn update_available(&self) -> Result<bool> {
        self.global
            .update_available(&self.config.client_version)
            .await
    }

    /// Authenticate this context as `account`. Offline accounts leave
    /// the context unauthenticated.
    pub async fn establish_session(&self, account: &Account) -> Result<()> {
        if account.is_offline() {
            log::debug!("offline account {}, skipping backend session", account.name);
            return Ok(());
        }
        self.api
            .set_session(account.auth_token.clone(), account.uuid.clone());
        let me = self.users.get(&account.uuid).await?;
        log::debug!("session established for {}", me.name);
        Ok(())
    }

    /// Tear down the current backend session.
    pub fn shutdown(&self) {
        self.api.clear_session();
        self.presence.reset();
    }

    /// Swap the active account: refused while a game session runs, the
    /// old backend session goes down before the new one comes up, and
    /// the switched-to account becomes the stored current account.
    pub async fn switch_account(&self, account: Account) -> Result<Account> {
        let account = self.accounts.prepare_login(account).await?;
        self.shutdown();
        self.establish_session(&account).await?;
        self.accounts.set_current(&account)?;
        Ok(account)
    }
}
