//! User directory access and account-level operations

use crate::cache::{OnlineStatusCache, TtlCache};
use crate::error::Result;
use crate::models::{
    sanitize_uuid, AccountSettings, Activity, OldUsername, Relation, Status, User,
};
use crate::network::{ApiClient, Response, Route};
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

const USER_CACHE_CAPACITY: usize = 400;
const USER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const ONLINE_CACHE_TTL: Duration = Duration::from_secs(60);

pub struct UserService {
    api: Arc<ApiClient>,
    cache: Arc<TtlCache<String, User>>,
    online: Arc<OnlineStatusCache>,
}

impl UserService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            cache: Arc::new(TtlCache::new(USER_CACHE_CAPACITY, USER_CACHE_TTL)),
            online: Arc::new(OnlineStatusCache::new(ONLINE_CACHE_TTL)),
        }
    }

    /// Fetch a user, served from the cache while fresh. Concurrent
    /// callers for the same uuid share one request.
    pub async fn get(&self, uuid: &str) -> Result<User> {
        let uuid = sanitize_uuid(uuid)?;
        let api = Arc::clone(&self.api);
        let fetch_uuid = uuid.clone();
        self.cache
            .get_or_fetch(uuid, move || async move {
                let response = api
                    .get(Route::Users.builder().path(&fetch_uuid).build())
                    .await?
                    .ok()?;
                decode_user(&response)
            })
            .await
    }

    /// Non-blocking online lookup; unknown users read as offline until
    /// the background probe lands. The own account is always online.
    /// Must run inside the client's async runtime since the probe is
    /// spawned onto it.
    pub fn online(&self, uuid: &str) -> bool {
        let Ok(uuid) = sanitize_uuid(uuid) else {
            return false;
        };
        if self.api.own_uuid().as_deref() == Some(uuid.as_str()) {
            return true;
        }
        let api = Arc::clone(&self.api);
        let probe_uuid = uuid.clone();
        self.online.get(&uuid, move || async move {
            let response = api
                .get(Route::Users.builder().path(&probe_uuid).build())
                .await?
                .ok()?;
            Ok(response.body_or::<String>("status.type", "offline".into()) == "online")
        })
    }

    pub fn invalidate(&self, uuid: &str) {
        if let Ok(uuid) = sanitize_uuid(uuid) {
            self.cache.invalidate(&uuid);
        }
    }

    /// Patch the relation on the cached copy after a transition, so the
    /// next read reflects it without a refetch.
    pub(crate) fn set_cached_relation(&self, uuid: &str, relation: Relation) {
        let key = uuid.to_string();
        if let Some(mut user) = self.cache.peek(&key) {
            user.relation = relation;
            self.cache.insert(key, user);
        }
    }

    // ========================================================================
    // Account operations
    // ========================================================================

    pub async fn settings(&self) -> Result<AccountSettings> {
        let response = self
            .api
            .get(Route::AccountSettings.builder().build())
            .await?
            .ok()?;
        Ok(AccountSettings {
            show_registered: response.body("show_registered")?,
            retain_usernames: response.body("retain_usernames")?,
            show_last_online: response.body("show_last_online")?,
            show_activity: response.body("show_activity")?,
            allow_friends_image_access: response.body_or("allow_friends_image_access", true),
        })
    }

    pub async fn update_settings(&self, settings: &AccountSettings) -> Result<()> {
        self.api
            .patch(
                Route::AccountSettings
                    .builder()
                    .field("show_registered", settings.show_registered)
                    .field("retain_usernames", settings.retain_usernames)
                    .field("show_last_online", settings.show_last_online)
                    .field("show_activity", settings.show_activity)
                    .field(
                        "allow_friends_image_access",
                        settings.allow_friends_image_access,
                    )
                    .build(),
            )
            .await?
            .ok()?;
        Ok(())
    }

    /// Toggle whether a historical username is publicly visible.
    pub async fn set_username_public(&self, name: &str, public: bool) -> Result<()> {
        self.api
            .post(
                Route::AccountUsernames
                    .builder()
                    .path(name)
                    .query("public", public)
                    .build(),
            )
            .await?
            .ok()?;
        Ok(())
    }

    pub async fn delete_username(&self, name: &str) -> Result<()> {
        self.api
            .delete(Route::AccountUsernames.builder().path(name).build())
            .await?
            .ok()?;
        Ok(())
    }

    /// Export the account's data to `target`.
    pub async fn export_data(&self, target: &Path) -> Result<()> {
        let response = self
            .api
            .get(Route::AccountData.builder().build())
            .await?
            .ok()?;
        if let Err(err) = std::fs::write(target, response.plain_body()) {
            log::warn!(
                "failed to write account export to {}: {err}",
                target.display()
            );
            return Err(err.into());
        }
        Ok(())
    }

    /// Delete the own account; true on success.
    pub async fn delete_account(&self) -> Result<bool> {
        Ok(!self
            .api
            .delete(Route::Account.builder().build())
            .await?
            .is_error())
    }
}

pub(crate) fn decode_user(response: &Response) -> Result<User> {
    let online = response.body_or::<String>("status.type", "offline".into()) == "online";
    let last_online = response.body_opt::<DateTime<Utc>>("status.last_online")?;
    let activity = match response.body_opt::<String>("status.activity.title")? {
        Some(title) => Some(Activity {
            title,
            description: response.body("status.activity.description")?,
            started: response.body("status.activity.started")?,
        }),
        None => None,
    };
    let previous_usernames = response
        .body_or::<Vec<String>>("previous_usernames", Vec::new())
        .into_iter()
        .map(|name| OldUsername { name, public: true })
        .collect();

    User::new(
        &response.body::<String>("uuid")?,
        response.body("username")?,
        Relation::from_id(&response.body_or::<String>("relation", "none".into())),
        response.body("registered")?,
        Status {
            online,
            last_online,
            activity,
        },
        previous_usernames,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Response;

    #[test]
    fn decodes_a_full_user() {
        let response = Response::from_parts(
            200,
            r#"{
                "uuid": "067e6162-3b6f-4ae2-a171-2470b63dff00",
                "username": "Alice",
                "relation": "friend",
                "registered": "2023-05-01T00:00:00Z",
                "status": {
                    "type": "online",
                    "last_online": "2024-02-01T10:00:00Z",
                    "activity": {
                        "title": "title.in_game",
                        "description": "somewhere",
                        "started": "2024-02-01T09:30:00Z"
                    }
                },
                "previous_usernames": ["OldAlice"]
            }"#
            .to_string(),
        );
        let user = decode_user(&response).unwrap();
        assert_eq!(user.uuid, "067e61623b6f4ae2a1712470b63dff00");
        assert_eq!(user.name, "Alice");
        assert_eq!(user.relation, Relation::Friend);
        assert!(user.status.online);
        assert_eq!(user.status.title(), "title.in_game");
        assert_eq!(
            user.previous_usernames,
            vec![OldUsername {
                name: "OldAlice".to_string(),
                public: true
            }]
        );
    }

    #[test]
    fn decodes_a_minimal_user() {
        let response = Response::from_parts(
            200,
            r#"{
                "uuid": "067e61623b6f4ae2a1712470b63dff00",
                "username": "Bob",
                "registered": "2023-05-01T00:00:00Z",
                "status": {"type": "offline"}
            }"#
            .to_string(),
        );
        let user = decode_user(&response).unwrap();
        assert_eq!(user.relation, Relation::None);
        assert!(!user.status.online);
        assert_eq!(user.status.title(), "offline");
        assert!(user.status.activity.is_none());
        assert!(user.previous_usernames.is_empty());
    }

    #[test]
    fn unknown_relation_does_not_fail_the_fetch() {
        let response = Response::from_parts(
            200,
            r#"{
                "uuid": "067e61623b6f4ae2a1712470b63dff00",
                "username": "Bob",
                "relation": "superfriend",
                "registered": "2023-05-01T00:00:00Z",
                "status": {"type": "offline"}
            }"#
            .to_string(),
        );
        let user = decode_user(&response).unwrap();
        assert_eq!(user.relation, Relation::None);
    }

    #[test]
    fn missing_required_fields_fail() {
        let response = Response::from_parts(200, r#"{"uuid": "abc"}"#.to_string());
        assert!(decode_user(&response).is_err());
    }
}
