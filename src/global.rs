//! Global service metadata

use crate::cache::SingleFlightCell;
use crate::error::Result;
use crate::models::GlobalData;
use crate::network::{ApiClient, Route};
use crate::semver::SemVer;
use std::sync::Arc;
use tokio::time::Duration;

const GLOBAL_TTL: Duration = Duration::from_secs(5 * 60);

pub struct GlobalDataService {
    api: Arc<ApiClient>,
    cache: SingleFlightCell<GlobalData>,
}

impl GlobalDataService {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            cache: SingleFlightCell::new(GLOBAL_TTL),
        }
    }

    /// Service-wide metadata, cached for five minutes with at most one
    /// refresh in flight. `force` bypasses the TTL.
    pub async fn get(&self, force: bool) -> Result<GlobalData> {
        let api = Arc::clone(&self.api);
        self.cache
            .get_or_refresh(force, move || async move {
                let response = api.get(Route::Global.builder().build()).await?.ok()?;
                Ok(GlobalData {
                    total_players: response.body("total_players")?,
                    online_players: response.body("online_players")?,
                    latest_version: SemVer::parse_lossy(
                        &response.body::<String>("latest_version")?,
                    ),
                    notes: response.body_or("notes", String::new()),
                })
            })
            .await
    }

    /// Whether the service announces a release newer than `current`.
    pub async fn update_available(&self, current: &SemVer) -> Result<bool> {
        let data = self.get(false).await?;
        Ok(data.latest_version != SemVer::EMPTY && data.latest_version > *current)
    }
}
