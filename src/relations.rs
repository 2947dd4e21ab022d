//! Friend/block relationship transitions

use crate::error::{Error, Result};
use crate::models::{sanitize_uuid, Relation, User};
use crate::network::{ApiClient, Response, Route};
use crate::users::UserService;
use futures::future::try_join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Notification-worthy result of a relation transition. `None` from a
/// transition means the relation was already in the target state and
/// there is nothing to announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationOutcome {
    RequestSent,
    RequestAccepted,
    RequestDenied,
    RequestCancelled,
    FriendRemoved,
    UserBlocked,
    UserUnblocked,
    /// 404: the target uuid does not belong to any account.
    NoSuchAccount,
    /// 403: the target does not accept this transition.
    Forbidden,
}

/// Incoming and outgoing pending friend requests.
#[derive(Debug, Clone, Default)]
pub struct FriendRequests {
    pub incoming: Vec<User>,
    pub outgoing: Vec<User>,
}

pub struct RelationService {
    api: Arc<ApiClient>,
    users: Arc<UserService>,
    known: Mutex<HashMap<String, Relation>>,
}

impl RelationService {
    pub fn new(api: Arc<ApiClient>, users: Arc<UserService>) -> Self {
        Self {
            api,
            users,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// The single primitive every transition goes through.
    pub async fn set_relation(&self, uuid: &str, relation: Relation) -> Result<Response> {
        let uuid = sanitize_uuid(uuid)?;
        self.api
            .post(
                Route::Users
                    .builder()
                    .path(uuid)
                    .query("relation", relation.id())
                    .build(),
            )
            .await
    }

    pub async fn add_friend(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::Request, RelationOutcome::RequestSent)
            .await
    }

    pub async fn accept_friend_request(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::Friend, RelationOutcome::RequestAccepted)
            .await
    }

    pub async fn deny_friend_request(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::None, RelationOutcome::RequestDenied)
            .await
    }

    pub async fn cancel_friend_request(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::None, RelationOutcome::RequestCancelled)
            .await
    }

    pub async fn remove_friend(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::None, RelationOutcome::FriendRemoved)
            .await
    }

    pub async fn block_user(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::Blocked, RelationOutcome::UserBlocked)
            .await
    }

    pub async fn unblock_user(&self, uuid: &str) -> Result<Option<RelationOutcome>> {
        self.transition(uuid, Relation::None, RelationOutcome::UserUnblocked)
            .await
    }

    async fn transition(
        &self,
        uuid: &str,
        target: Relation,
        changed: RelationOutcome,
    ) -> Result<Option<RelationOutcome>> {
        let uuid = sanitize_uuid(uuid)?;
        let response = self.set_relation(&uuid, target).await?;
        if let Some(err) = response.error() {
            return match err.http_code {
                404 => Ok(Some(RelationOutcome::NoSuchAccount)),
                403 => Ok(Some(RelationOutcome::Forbidden)),
                _ => Err(Error::Api {
                    http_code: err.http_code,
                    message: err.message.clone(),
                }),
            };
        }
        self.users.set_cached_relation(&uuid, target);
        if self.track(&uuid, target) {
            Ok(Some(changed))
        } else {
            Ok(None)
        }
    }

    /// Record the locally known relation; true when it changed. Keeps
    /// repeated transitions from announcing the same state twice even
    /// though the network call is re-sent.
    fn track(&self, uuid: &str, relation: Relation) -> bool {
        self.known.lock().insert(uuid.to_string(), relation) != Some(relation)
    }

    // ========================================================================
    // Relation listings
    // ========================================================================

    pub async fn friend_uuids(&self) -> Result<Vec<String>> {
        self.api
            .get(Route::AccountRelationsFriends.builder().build())
            .await?
            .ok()?
            .json()
    }

    pub async fn friends(&self) -> Result<Vec<User>> {
        let uuids = self.friend_uuids().await?;
        try_join_all(uuids.iter().map(|uuid| self.users.get(uuid))).await
    }

    pub async fn friend_requests(&self) -> Result<FriendRequests> {
        let response = self
            .api
            .get(Route::AccountRelationsRequests.builder().build())
            .await?
            .ok()?;
        let incoming_ids: Vec<String> = response.body("in")?;
        let outgoing_ids: Vec<String> = response.body("out")?;
        let incoming = try_join_all(incoming_ids.iter().map(|uuid| self.users.get(uuid))).await?;
        let outgoing = try_join_all(outgoing_ids.iter().map(|uuid| self.users.get(uuid))).await?;
        Ok(FriendRequests { incoming, outgoing })
    }

    pub async fn blocked(&self) -> Result<Vec<User>> {
        let response = self
            .api
            .get(Route::AccountRelationsBlocked.builder().build())
            .await?
            .ok()?;
        let uuids: Vec<String> = response.json()?;
        try_join_all(uuids.iter().map(|uuid| self.users.get(uuid))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::semver::SemVer;
    use crate::ClientConfig;

    fn service() -> RelationService {
        let config = ClientConfig::new(
            "https://api.example.com/v1",
            AuthConfig::example(),
            SemVer::new(1, 0, 0),
        )
        .unwrap();
        let api = Arc::new(ApiClient::new(&config).unwrap());
        RelationService::new(Arc::clone(&api), Arc::new(UserService::new(api)))
    }

    #[test]
    fn repeated_transitions_do_not_reannounce() {
        let service = service();
        let uuid = "067e61623b6f4ae2a1712470b63dff00";

        // blocking twice ends blocked, but only the first call is a
        // state change worth a notification
        assert!(service.track(uuid, Relation::Blocked));
        assert!(!service.track(uuid, Relation::Blocked));

        assert!(service.track(uuid, Relation::None));
        assert!(service.track(uuid, Relation::Request));
        assert!(service.track(uuid, Relation::Friend));
        assert!(!service.track(uuid, Relation::Friend));
    }
}
