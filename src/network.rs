//! Request/response plumbing for the social service HTTP API

use crate::error::{Error, Result};
use crate::ClientConfig;
use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

// ============================================================================
// Routes
// ============================================================================

/// Named remote endpoints. The verb is picked by the `ApiClient` method
/// used to execute the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Users,
    Account,
    AccountSettings,
    AccountActivity,
    AccountUsernames,
    AccountData,
    AccountRelationsFriends,
    AccountRelationsRequests,
    AccountRelationsBlocked,
    Channels,
    Global,
}

impl Route {
    pub fn path(&self) -> &'static str {
        match self {
            Route::Users => "users",
            Route::Account => "account",
            Route::AccountSettings => "account/settings",
            Route::AccountActivity => "account/activity",
            Route::AccountUsernames => "account/usernames",
            Route::AccountData => "account/data",
            Route::AccountRelationsFriends => "account/relations/friends",
            Route::AccountRelationsRequests => "account/relations/requests",
            Route::AccountRelationsBlocked => "account/relations/blocked",
            Route::Channels => "channels",
            Route::Global => "global",
        }
    }

    fn requires_auth(&self) -> bool {
        !matches!(self, Route::Global)
    }

    pub fn builder(self) -> RequestBuilder {
        RequestBuilder::new(self)
    }
}

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone)]
pub struct Request {
    route: Route,
    path: Vec<String>,
    query: Vec<(String, String)>,
    body: Map<String, Value>,
}

impl Request {
    pub fn route(&self) -> Route {
        self.route
    }
}

pub struct RequestBuilder {
    route: Route,
    path: Vec<String>,
    query: Vec<(String, String)>,
    body: Map<String, Value>,
}

impl RequestBuilder {
    fn new(route: Route) -> Self {
        Self {
            route,
            path: Vec::new(),
            query: Vec::new(),
            body: Map::new(),
        }
    }

    /// Append a path segment, e.g. a user id.
    pub fn path(mut self, segment: impl Into<String>) -> Self {
        self.path.push(segment.into());
        self
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    /// Add a body field; nested maps and lists go in as `Value`s.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> Request {
        Request {
            route: self.route,
            path: self.path,
            query: self.query,
            body: self.body,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Error carrier for a well-formed non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub http_code: u16,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    body: Value,
    plain_body: String,
    error: Option<ApiError>,
}

impl Response {
    pub(crate) fn from_parts(status: u16, text: String) -> Self {
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let error = if (200..300).contains(&status) {
            None
        } else {
            let message = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Some(ApiError {
                http_code: status,
                message,
            })
        };
        Self {
            status,
            body,
            plain_body: text,
            error,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    pub fn plain_body(&self) -> &str {
        &self.plain_body
    }

    pub fn body_value(&self) -> &Value {
        &self.body
    }

    /// Require a 2xx response, converting the error carrier. 404 keeps
    /// its identity so callers can tell "no such thing" from failure.
    pub fn ok(self) -> Result<Self> {
        match &self.error {
            None => Ok(self),
            Some(err) if err.http_code == 404 => Err(Error::NotFound(err.message.clone())),
            Some(err) => Err(Error::Api {
                http_code: err.http_code,
                message: err.message.clone(),
            }),
        }
    }

    fn lookup(&self, path: &str) -> Option<&Value> {
        let mut current = &self.body;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current)
    }

    /// Typed access by dotted field path (`"status.activity.title"`).
    /// A missing or mistyped required field fails fast.
    pub fn body<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self
            .lookup(path)
            .ok_or_else(|| Error::Decode(format!("missing field `{path}`")))?;
        serde_json::from_value(value.clone())
            .map_err(|_| Error::Decode(format!("unexpected type at `{path}`")))
    }

    /// `Ok(None)` when the field is absent or null.
    pub fn body_opt<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.lookup(path) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|_| Error::Decode(format!("unexpected type at `{path}`"))),
        }
    }

    pub fn body_or<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.body_opt(path).ok().flatten().unwrap_or(default)
    }

    /// Decode the whole body, e.g. a top-level array.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| Error::Decode(format!("unexpected body shape: {e}")))
    }
}

// ============================================================================
// HTTP API Client
// ============================================================================

pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: RwLock<Option<String>>,
    own_uuid: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_url.clone(),
            token: RwLock::new(None),
            own_uuid: RwLock::new(None),
        })
    }

    pub fn set_session(&self, token: String, own_uuid: String) {
        *self.token.write() = Some(token);
        *self.own_uuid.write() = Some(own_uuid);
    }

    pub fn clear_session(&self) {
        *self.token.write() = None;
        *self.own_uuid.write() = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }

    /// The authenticated account's uuid, if any.
    pub fn own_uuid(&self) -> Option<String> {
        self.own_uuid.read().clone()
    }

    pub async fn get(&self, request: Request) -> Result<Response> {
        self.execute(Method::GET, request).await
    }

    pub async fn post(&self, request: Request) -> Result<Response> {
        self.execute(Method::POST, request).await
    }

    pub async fn patch(&self, request: Request) -> Result<Response> {
        self.execute(Method::PATCH, request).await
    }

    pub async fn delete(&self, request: Request) -> Result<Response> {
        self.execute(Method::DELETE, request).await
    }

    async fn execute(&self, method: Method, request: Request) -> Result<Response> {
        let url = self.url_for(&request)?;
        log::debug!("{} {}", method, url);

        let mut builder = self.http.request(method, url);
        if request.route.requires_auth() {
            let token = self.token.read().clone().ok_or(Error::NotLoggedIn)?;
            builder = builder.header("Authorization", token);
        }
        if !request.body.is_empty() {
            builder = builder.json(&Value::Object(request.body));
        }

        let response = builder.send().await.map_err(|e| {
            log::error!("API traffic failed: {e}");
            Error::Network(e.to_string())
        })?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Response::from_parts(status, text))
    }

    fn url_for(&self, request: &Request) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Network("API base url cannot be a base".into()))?;
            for part in request.route.path().split('/') {
                segments.push(part);
            }
            for part in &request.path {
                segments.push(part);
            }
        }
        for (key, value) in &request.query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url)
    }
}
