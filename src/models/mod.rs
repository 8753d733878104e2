use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A bug-bounty program tracked by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// Platform tag the project was indexed from (e.g. "immunefi").
    pub platform: String,
    pub description: Option<String>,
    pub max_bounty: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    GithubRepo,
    GithubFile,
    DeployedContract,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::GithubRepo => "github_repo",
            AssetType::GithubFile => "github_file",
            AssetType::DeployedContract => "deployed_contract",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "github_repo" => Some(AssetType::GithubRepo),
            "github_file" => Some(AssetType::GithubFile),
            "deployed_contract" => Some(AssetType::DeployedContract),
            _ => None,
        }
    }
}

/// A scoped asset belonging to a project: a repository, a file, or a deployed
/// contract. The canonical `identifier` is a URL and is unique across assets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: Uuid,
    pub identifier: String,
    pub project_id: Uuid,
    pub asset_type: AssetType,
    pub source_url: Option<String>,
    pub local_path: Option<String>,
    /// Proxy contracts link to the asset holding their current implementation.
    /// Changed only by the proxy reconciliation job, which also appends one
    /// entry to `extra_data.implementation_history` per change.
    pub implementation_id: Option<Uuid>,
    /// Open-ended JSON object used as a flexible audit trail
    /// (`is_not_proxy`, `implementation_history`, `is_implementation`, ...).
    pub extra_data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    /// True once the proxy monitor has determined this contract is not a
    /// proxy. Sticky: never cleared by the monitor itself.
    pub fn is_not_proxy(&self) -> bool {
        self.extra_data
            .get("is_not_proxy")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn implementation_history(&self) -> Vec<ImplementationRecord> {
        self.extra_data
            .get("implementation_history")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| serde_json::from_value(e.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Fields for inserting a new asset; id and timestamps are assigned by the
/// database layer.
#[derive(Debug, Clone)]
pub struct NewAsset {
    pub identifier: String,
    pub project_id: Uuid,
    pub asset_type: AssetType,
    pub source_url: Option<String>,
    pub local_path: Option<String>,
    pub extra_data: Value,
}

/// One audit-trail entry recorded when a proxy's implementation changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImplementationRecord {
    pub address: String,
    pub url: String,
    pub block_number: u64,
    pub timestamp: i64,
}

/// Lifecycle states of a background job.
///
/// Transitions are monotonic: Pending -> Running -> one of the terminal
/// states. A terminal state is never overwritten.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

/// Total bytes of output lines retained per job result; further lines are
/// dropped after a truncation notice.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Immutable outcome snapshot produced once at a job's terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub message: String,
    /// Structured data for programmatic consumers.
    pub data: Value,
    /// Ordered log-style output lines.
    pub outputs: Vec<String>,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    truncated: bool,
}

impl JobResult {
    /// Outcome with an explicit success flag; used by batch jobs whose
    /// overall result depends on a failure counter.
    pub fn new<S: Into<String>>(success: bool, message: S) -> Self {
        let message = message.into();
        Self {
            success,
            error: (!success).then(|| message.clone()),
            message,
            data: Value::Object(Default::default()),
            outputs: Vec::new(),
            truncated: false,
        }
    }

    pub fn success<S: Into<String>>(message: S) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Value::Object(Default::default()),
            outputs: Vec::new(),
            error: None,
            truncated: false,
        }
    }

    pub fn failure<S: Into<String>>(error: S) -> Self {
        let error = error.into();
        Self {
            success: false,
            message: error.clone(),
            data: Value::Object(Default::default()),
            outputs: Vec::new(),
            error: Some(error),
            truncated: false,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Append one output line, respecting the total size bound.
    pub fn add_output<S: Into<String>>(&mut self, line: S) {
        if self.truncated {
            return;
        }
        let line = line.into();
        let used: usize = self.outputs.iter().map(|l| l.len()).sum();
        if used + line.len() > MAX_OUTPUT_BYTES {
            self.truncated = true;
            self.outputs.push("... output truncated ...".to_string());
            return;
        }
        self.outputs.push(line);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Snapshot of a tracked job returned by status queries. The job itself stays
/// inside the manager; callers only ever see these copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JobResult>,
}
