//! Presence publishing with change de-duplication

use crate::error::Result;
use crate::models::Activity;
use crate::network::{ApiClient, Route};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

/// Seconds between presence publisher ticks.
pub const STATUS_UPDATE_DELAY_SECS: u64 = 20;

/// High-level activity the client reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityContext {
    MainMenu,
    InMenu,
    ServerList,
    Settings,
    /// Playing somewhere that cannot be classified further.
    InGameUnknown { description: String },
    /// Playing on a recognized server.
    InGame {
        server: String,
        game_type: String,
        game_mode: String,
        map: String,
    },
}

impl ActivityContext {
    /// The (title, description) pair as the UI keys its translations.
    pub fn render(&self) -> (String, String) {
        match self {
            ActivityContext::MainMenu => {
                ("title.online".to_string(), "description.menu.main_menu".to_string())
            }
            ActivityContext::InMenu => {
                ("title.online".to_string(), "description.menu.in_menu".to_string())
            }
            ActivityContext::ServerList => (
                "title.online".to_string(),
                "description.menu.server_list".to_string(),
            ),
            ActivityContext::Settings => {
                ("title.online".to_string(), "description.menu.settings".to_string())
            }
            ActivityContext::InGameUnknown { description } => {
                ("title.in_game_unknown".to_string(), description.clone())
            }
            ActivityContext::InGame {
                server,
                game_type,
                game_mode,
                map,
            } => {
                let description = match (game_mode.is_empty(), map.is_empty()) {
                    (false, false) => format!("{game_type} - {game_mode} - {map}"),
                    (false, true) => format!("{game_type} - {game_mode}"),
                    (true, false) => format!("{game_type} - {map}"),
                    (true, true) => game_type.clone(),
                };
                (format!("title.in_game.{server}"), description)
            }
        }
    }
}

pub struct PresencePublisher {
    api: Arc<ApiClient>,
    last: Mutex<Option<Activity>>,
}

impl PresencePublisher {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            last: Mutex::new(None),
        }
    }

    /// Publish the context unless it matches the last published
    /// activity. Returns whether a request went out. The replacement
    /// activity carries its own start time, which is what the server
    /// shows as "elapsed".
    pub async fn publish(&self, context: &ActivityContext) -> Result<bool> {
        let (title, description) = context.render();
        if !changed(self.last.lock().as_ref(), &title, &description) {
            return Ok(false);
        }
        let activity = Activity {
            title,
            description,
            started: Utc::now(),
        };
        self.api
            .post(
                Route::AccountActivity
                    .builder()
                    .field("title", activity.title.as_str())
                    .field("description", activity.description.as_str())
                    .field("started", activity.started.to_rfc3339())
                    .build(),
            )
            .await?
            .ok()?;
        // only a delivered update counts as published
        *self.last.lock() = Some(activity);
        Ok(true)
    }

    /// Forget the last published activity, e.g. on session teardown.
    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

fn changed(last: Option<&Activity>, title: &str, description: &str) -> bool {
    match last {
        Some(prev) => prev.title != title || prev.description != description,
        None => true,
    }
}
