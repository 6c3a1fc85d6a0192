//! Tools that put the loaded secrets to work
//!
//! Each tool asks the [`SecretGate`] for the one secret it needs before it
//! looks at its arguments. A tool whose secret did not load fails with an
//! error naming the secret and nothing more.
//!
//! | Tool                   | Secret                 | Backend                     |
//! |------------------------|------------------------|-----------------------------|
//! | `github_search_issues` | `GITHUB_TOKEN`         | GitHub issue search API     |
//! | `query_database`       | `DB_CONNECTION_STRING` | PostgreSQL, SELECT only     |
//! | `send_notification`    | `WEBHOOK_URL`          | Slack-compatible webhook    |
//!
//! Outbound calls go through [`IssueSearch`], [`SqlQuery`] and [`Notifier`].

use crate::error::{Error, Result};
use crate::secrets::{SecretGate, SecretValue};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

pub const SEARCH_ISSUES_TOOL: &str = "github_search_issues";
pub const QUERY_DATABASE_TOOL: &str = "query_database";
pub const SEND_NOTIFICATION_TOOL: &str = "send_notification";

pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
pub const DB_CONNECTION_STRING: &str = "DB_CONNECTION_STRING";
pub const WEBHOOK_URL: &str = "WEBHOOK_URL";

pub const GITHUB_API_URL: &str = "https://api.github.com";

const TOOL_NAMES: [&str; 3] = [SEARCH_ISSUES_TOOL, QUERY_DATABASE_TOOL, SEND_NOTIFICATION_TOOL];

const MAX_ISSUES: i64 = 50;
const MAX_ROWS: i64 = 1000;
const GITHUB_TIMEOUT: Duration = Duration::from_secs(15);
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

const FORBIDDEN_SQL: [&str; 8] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "EXEC",
];

/// Arguments of `github_search_issues`
#[derive(Debug, Deserialize)]
pub struct SearchIssuesArgs {
    pub query: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_max_results")]
    pub max_results: i64,
}

fn default_max_results() -> i64 {
    10
}

/// Arguments of `query_database`
#[derive(Debug, Deserialize)]
pub struct QueryDatabaseArgs {
    pub sql: String,
    #[serde(default = "default_max_rows")]
    pub max_rows: i64,
}

fn default_max_rows() -> i64 {
    100
}

/// Arguments of `send_notification`
#[derive(Debug, Deserialize)]
pub struct SendNotificationArgs {
    pub message: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    #[serde(default = "default_urgency")]
    pub urgency: String,
}

fn default_channel() -> String {
    "general".to_string()
}

fn default_urgency() -> String {
    "normal".to_string()
}

/// A validated issue search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueQuery {
    pub q: String,
    pub per_page: u32,
}

impl IssueQuery {
    /// Scopes the query to `repo` when one is given; clamps the page size to 1..=50
    pub fn from_args(args: &SearchIssuesArgs) -> Self {
        let repo = args.repo.trim();
        let q = if repo.is_empty() {
            args.query.clone()
        } else {
            format!("{} repo:{}", args.query, repo)
        };
        Self {
            q,
            per_page: args.max_results.clamp(1, MAX_ISSUES) as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub url: String,
    pub updated_at: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuePage {
    pub total_count: u64,
    pub issues: Vec<Issue>,
}

#[derive(Debug, Serialize)]
struct SearchIssuesOutput {
    total_count: u64,
    returned: usize,
    issues: Vec<Issue>,
}

/// Rejects anything but a single SELECT statement free of write keywords
///
/// Keywords are matched as whole words, so a column named `updated_at`
/// passes while `UPDATE` does not.
pub fn check_read_only(sql: &str) -> Result<()> {
    let statement = sql.trim().trim_end_matches(';').trim_end();
    let upper = statement.to_uppercase();
    let mut words = upper
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty());

    if words.next() != Some("SELECT") {
        return Err(Error::ToolInput(
            "Only SELECT queries are permitted (read-only mode)".to_string(),
        ));
    }
    if let Some(keyword) = words.find(|word| FORBIDDEN_SQL.contains(word)) {
        return Err(Error::ToolInput(format!(
            "Query contains forbidden keyword: {}",
            keyword
        )));
    }
    if statement.contains(';') {
        return Err(Error::ToolInput(
            "Only a single statement is permitted".to_string(),
        ));
    }
    Ok(())
}

/// Rows returned by a query, each column as text or null
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowSet {
    pub row_count: usize,
    pub truncated: bool,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::High => "high",
        }
    }
}

impl FromStr for Urgency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Urgency::Low),
            "normal" => Ok(Urgency::Normal),
            "high" => Ok(Urgency::High),
            _ => Err(Error::ToolInput(
                "urgency must be 'low', 'normal', or 'high'".to_string(),
            )),
        }
    }
}

/// Body posted to a Slack-compatible webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub channel: String,
    pub text: String,
    pub username: String,
    pub icon_emoji: String,
}

impl WebhookPayload {
    pub fn new(channel: &str, message: &str, urgency: Urgency, username: &str) -> Self {
        let icon = match urgency {
            Urgency::High => ":lock:",
            Urgency::Low | Urgency::Normal => ":robot_face:",
        };
        Self {
            channel: format!("#{}", channel),
            text: format!("[{}] {}", urgency.as_str().to_uppercase(), message),
            username: username.to_string(),
            icon_emoji: icon.to_string(),
        }
    }
}

/// Searches issues on behalf of `github_search_issues`
#[async_trait]
pub trait IssueSearch: Send + Sync {
    async fn search(&self, token: &SecretValue, query: &IssueQuery) -> Result<IssuePage>;
}

/// Runs a validated read-only query on behalf of `query_database`
#[async_trait]
pub trait SqlQuery: Send + Sync {
    async fn fetch(&self, connection: &SecretValue, sql: &str, max_rows: usize) -> Result<RowSet>;
}

/// Delivers a webhook payload on behalf of `send_notification`
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post(&self, webhook: &SecretValue, payload: &WebhookPayload) -> Result<()>;
}

/// Strips the request URL, which for the webhook is itself a secret
fn backend_error(e: reqwest::Error) -> Error {
    Error::Backend(e.without_url().to_string())
}

/// GitHub's `/search/issues` endpoint
#[derive(Debug, Clone)]
pub struct GithubSearch {
    client: Client,
    api_url: String,
}

impl GithubSearch {
    pub fn new(client: Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize)]
struct SearchItem {
    number: u64,
    title: String,
    state: String,
    html_url: String,
    updated_at: String,
    #[serde(default)]
    labels: Vec<SearchLabel>,
}

#[derive(Deserialize)]
struct SearchLabel {
    name: String,
}

#[async_trait]
impl IssueSearch for GithubSearch {
    async fn search(&self, token: &SecretValue, query: &IssueQuery) -> Result<IssuePage> {
        let per_page = query.per_page.to_string();
        let response = self
            .client
            .get(format!("{}/search/issues", self.api_url.trim_end_matches('/')))
            .query(&[
                ("q", query.q.as_str()),
                ("per_page", per_page.as_str()),
                ("sort", "updated"),
            ])
            .bearer_auth(token.expose())
            .header(ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .timeout(GITHUB_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(backend_error)?;

        let body: SearchResponse = response.json().await.map_err(backend_error)?;
        Ok(IssuePage {
            total_count: body.total_count,
            issues: body
                .items
                .into_iter()
                .map(|item| Issue {
                    number: item.number,
                    title: item.title,
                    state: item.state,
                    url: item.html_url,
                    updated_at: item.updated_at,
                    labels: item.labels.into_iter().map(|l| l.name).collect(),
                })
                .collect(),
        })
    }
}

/// One short-lived PostgreSQL connection per query
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresQuery;

#[async_trait]
impl SqlQuery for PostgresQuery {
    async fn fetch(&self, connection: &SecretValue, sql: &str, max_rows: usize) -> Result<RowSet> {
        let (client, conn) = tokio_postgres::connect(connection.expose(), NoTls)
            .await
            .map_err(|e| Error::Backend(format!("Cannot connect to database: {}", e)))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Database connection closed with error");
            }
        });

        let messages = client
            .simple_query(sql)
            .await
            .map_err(|e| Error::Backend(format!("Query failed: {}", e)))?;

        Ok(collect_rows(messages, max_rows))
    }
}

fn collect_rows(messages: Vec<SimpleQueryMessage>, max_rows: usize) -> RowSet {
    let mut rows = Vec::new();
    let mut total = 0usize;

    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            total += 1;
            if rows.len() >= max_rows {
                continue;
            }
            let mut object = serde_json::Map::new();
            for (index, column) in row.columns().iter().enumerate() {
                let value = row
                    .get(index)
                    .map_or(serde_json::Value::Null, |v| serde_json::Value::from(v));
                object.insert(column.name().to_string(), value);
            }
            rows.push(object);
        }
    }

    RowSet {
        row_count: rows.len(),
        truncated: total > max_rows,
        rows,
    }
}

/// Slack-compatible incoming webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
}

impl WebhookNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn post(&self, webhook: &SecretValue, payload: &WebhookPayload) -> Result<()> {
        self.client
            .post(webhook.expose())
            .json(payload)
            .timeout(WEBHOOK_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(backend_error)?;
        Ok(())
    }
}

/// The secret-consuming tools, served next to `attestation_status`
pub struct Toolbox {
    secrets: Arc<SecretGate>,
    username: String,
    issues: Box<dyn IssueSearch>,
    database: Box<dyn SqlQuery>,
    notifier: Box<dyn Notifier>,
}

impl fmt::Debug for Toolbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolbox")
            .field("username", &self.username)
            .field("secrets", &self.secrets.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Toolbox {
    /// Tools backed by GitHub, PostgreSQL and a webhook
    pub fn new(secrets: Arc<SecretGate>, server_name: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("{}/{}", server_name, env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_backends(
            secrets,
            server_name,
            GithubSearch::new(client.clone(), GITHUB_API_URL),
            PostgresQuery,
            WebhookNotifier::new(client),
        ))
    }

    pub fn with_backends(
        secrets: Arc<SecretGate>,
        server_name: &str,
        issues: impl IssueSearch + 'static,
        database: impl SqlQuery + 'static,
        notifier: impl Notifier + 'static,
    ) -> Self {
        Self {
            secrets,
            username: server_name.to_string(),
            issues: Box::new(issues),
            database: Box::new(database),
            notifier: Box::new(notifier),
        }
    }

    pub fn handles(&self, name: &str) -> bool {
        TOOL_NAMES.contains(&name)
    }

    /// Entries for `tools/list`
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        vec![
            serde_json::json!({
                "name": SEARCH_ISSUES_TOOL,
                "description": "Search GitHub issues, optionally scoped to one repository.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "query": { "type": "string", "description": "Search keywords, e.g. 'bug label:critical'" },
                        "repo": { "type": "string", "description": "Optional owner/repo filter" },
                        "max_results": { "type": "integer", "minimum": 1, "maximum": MAX_ISSUES, "default": 10 }
                    },
                    "required": ["query"]
                }
            }),
            serde_json::json!({
                "name": QUERY_DATABASE_TOOL,
                "description": "Run a read-only SELECT against the configured PostgreSQL database.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "sql": { "type": "string", "description": "A single SELECT statement" },
                        "max_rows": { "type": "integer", "minimum": 1, "maximum": MAX_ROWS, "default": 100 }
                    },
                    "required": ["sql"]
                }
            }),
            serde_json::json!({
                "name": SEND_NOTIFICATION_TOOL,
                "description": "Post a notification to the configured Slack-compatible webhook. \
                                This is a write action; confirm with the user first.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "message": { "type": "string" },
                        "channel": { "type": "string", "default": "general" },
                        "urgency": { "type": "string", "enum": ["low", "normal", "high"], "default": "normal" }
                    },
                    "required": ["message"]
                }
            }),
        ]
    }

    /// Runs a tool
    ///
    /// `Error::Rpc` means the call itself was malformed (unknown tool or
    /// arguments that do not fit the schema). Every other error is a tool
    /// failure the caller reports as tool output.
    pub async fn call(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let arguments = arguments.unwrap_or_else(|| serde_json::json!({}));
        match name {
            SEARCH_ISSUES_TOOL => self.search_issues(arguments).await,
            QUERY_DATABASE_TOOL => self.query_database(arguments).await,
            SEND_NOTIFICATION_TOOL => self.send_notification(arguments).await,
            _ => Err(Error::Rpc(format!("Invalid params: unknown tool {}", name))),
        }
    }

    async fn search_issues(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let token = self.secrets.require(GITHUB_TOKEN)?;
        let args: SearchIssuesArgs = parse_arguments(arguments)?;
        let query = IssueQuery::from_args(&args);

        let mut page = self.issues.search(token, &query).await?;
        page.issues.truncate(query.per_page as usize);

        info!(
            tool = SEARCH_ISSUES_TOOL,
            query = %query.q,
            results = page.issues.len(),
            "Issue search finished"
        );
        Ok(serde_json::to_value(SearchIssuesOutput {
            total_count: page.total_count,
            returned: page.issues.len(),
            issues: page.issues,
        })?)
    }

    async fn query_database(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let connection = self.secrets.require(DB_CONNECTION_STRING)?;
        let args: QueryDatabaseArgs = parse_arguments(arguments)?;
        let preview: String = args.sql.chars().take(80).collect();

        if let Err(e) = check_read_only(&args.sql) {
            warn!(tool = QUERY_DATABASE_TOOL, sql = %preview, "Rejected query");
            return Err(e);
        }
        let max_rows = args.max_rows.clamp(1, MAX_ROWS) as usize;

        let rows = self.database.fetch(connection, &args.sql, max_rows).await?;
        info!(tool = QUERY_DATABASE_TOOL, sql = %preview, rows = rows.row_count, "Query finished");
        Ok(serde_json::to_value(rows)?)
    }

    async fn send_notification(&self, arguments: serde_json::Value) -> Result<serde_json::Value> {
        let webhook = self.secrets.require(WEBHOOK_URL)?;
        let args: SendNotificationArgs = parse_arguments(arguments)?;
        let urgency: Urgency = args.urgency.parse()?;

        let payload = WebhookPayload::new(&args.channel, &args.message, urgency, &self.username);
        self.notifier.post(webhook, &payload).await?;

        info!(
            tool = SEND_NOTIFICATION_TOOL,
            channel = %args.channel,
            urgency = urgency.as_str(),
            length = args.message.len(),
            "Notification delivered"
        );
        Ok(serde_json::json!({
            "status": "delivered",
            "channel": args.channel,
            "urgency": urgency.as_str(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        }))
    }
}

fn parse_arguments<T: DeserializeOwned>(arguments: serde_json::Value) -> Result<T> {
    serde_json::from_value(arguments).map_err(|e| Error::Rpc(format!("Invalid params: {}", e)))
}

/// In-memory backends and a secret gate for handler tests
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::ffi::OsString;
    use std::sync::Mutex;

    pub(crate) fn gate(env: &[(&str, &str)]) -> Arc<SecretGate> {
        let env: HashMap<String, OsString> = env
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        Arc::new(SecretGate::load_with(
            [GITHUB_TOKEN, DB_CONNECTION_STRING, WEBHOOK_URL],
            |name| env.get(name).cloned(),
        ))
    }

    #[derive(Default)]
    pub(crate) struct FakeIssues {
        pub(crate) issues: Vec<Issue>,
        pub(crate) seen: Arc<Mutex<Vec<IssueQuery>>>,
    }

    #[async_trait]
    impl IssueSearch for FakeIssues {
        async fn search(&self, _token: &SecretValue, query: &IssueQuery) -> Result<IssuePage> {
            self.seen.lock().unwrap().push(query.clone());
            Ok(IssuePage {
                total_count: self.issues.len() as u64,
                issues: self.issues.clone(),
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDatabase {
        pub(crate) available_rows: usize,
        pub(crate) seen: Arc<Mutex<Vec<(String, usize)>>>,
    }

    #[async_trait]
    impl SqlQuery for FakeDatabase {
        async fn fetch(
            &self,
            _connection: &SecretValue,
            sql: &str,
            max_rows: usize,
        ) -> Result<RowSet> {
            self.seen.lock().unwrap().push((sql.to_string(), max_rows));
            let rows: Vec<_> = (0..self.available_rows.min(max_rows))
                .map(|n| {
                    let mut row = serde_json::Map::new();
                    row.insert("n".to_string(), serde_json::Value::from(n.to_string()));
                    row
                })
                .collect();
            Ok(RowSet {
                row_count: rows.len(),
                truncated: self.available_rows > max_rows,
                rows,
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeNotifier {
        pub(crate) fail: bool,
        pub(crate) posted: Arc<Mutex<Vec<(String, WebhookPayload)>>>,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn post(&self, webhook: &SecretValue, payload: &WebhookPayload) -> Result<()> {
            if self.fail {
                return Err(Error::Backend(
                    "HTTP status server error (500 Internal Server Error)".to_string(),
                ));
            }
            self.posted
                .lock()
                .unwrap()
                .push((webhook.expose().to_string(), payload.clone()));
            Ok(())
        }
    }

    pub(crate) fn toolbox(env: &[(&str, &str)]) -> Toolbox {
        Toolbox::with_backends(
            gate(env),
            "mcp-tee-server",
            FakeIssues::default(),
            FakeDatabase::default(),
            FakeNotifier::default(),
        )
    }
}
