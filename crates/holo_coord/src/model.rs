//! Persisted records for global transactions and their branches.
//!
//! Field names are shared by every storage backend: the SQL schema uses them
//! as column names and the KV backend uses them as JSON keys.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Result token a participant returns when the branch completed.
pub const RESULT_SUCCESS: &str = "SUCCESS";
/// Result token a participant returns when the branch definitively failed.
pub const RESULT_FAILURE: &str = "FAILURE";
/// Result token a participant returns when the branch is still in flight.
pub const RESULT_ONGOING: &str = "ONGOING";

/// Branch id used when consulting a message transaction's `query_prepared` URL.
pub const MSG_QUERY_BRANCH_ID: &str = "00";

pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}

/// Global transaction status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransStatus {
    Prepared,
    Submitted,
    Succeed,
    Failed,
    Aborting,
}

impl TransStatus {
    pub const ACTIVE: [TransStatus; 3] = [
        TransStatus::Prepared,
        TransStatus::Submitted,
        TransStatus::Aborting,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransStatus::Prepared => "prepared",
            TransStatus::Submitted => "submitted",
            TransStatus::Succeed => "succeed",
            TransStatus::Failed => "failed",
            TransStatus::Aborting => "aborting",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransStatus::Succeed | TransStatus::Failed)
    }
}

/// Branch status. Monotonic: once `succeed` or `failed` it never changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Prepared,
    Succeed,
    Failed,
}

impl BranchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchStatus::Prepared => "prepared",
            BranchStatus::Succeed => "succeed",
            BranchStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BranchStatus::Prepared)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransType {
    Saga,
    Tcc,
    Xa,
    Msg,
}

impl TransType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransType::Saga => "saga",
            TransType::Tcc => "tcc",
            TransType::Xa => "xa",
            TransType::Msg => "msg",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Grpc,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Grpc => "grpc",
        }
    }
}

/// Branch operation. Which ops appear depends on the transaction type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BranchOp {
    Action,
    Compensate,
    Try,
    Confirm,
    Cancel,
    Commit,
    Rollback,
    Msg,
}

impl BranchOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchOp::Action => "action",
            BranchOp::Compensate => "compensate",
            BranchOp::Try => "try",
            BranchOp::Confirm => "confirm",
            BranchOp::Cancel => "cancel",
            BranchOp::Commit => "commit",
            BranchOp::Rollback => "rollback",
            BranchOp::Msg => "msg",
        }
    }
}

macro_rules! impl_text_enum {
    ($ty:ty, [$($variant:expr),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                let raw = raw.trim();
                $(
                    if raw.eq_ignore_ascii_case($variant.as_str()) {
                        return Ok($variant);
                    }
                )+
                anyhow::bail!("invalid {} value '{raw}'", stringify!($ty))
            }
        }
    };
}

impl_text_enum!(
    TransStatus,
    [
        TransStatus::Prepared,
        TransStatus::Submitted,
        TransStatus::Succeed,
        TransStatus::Failed,
        TransStatus::Aborting,
    ]
);
impl_text_enum!(
    BranchStatus,
    [BranchStatus::Prepared, BranchStatus::Succeed, BranchStatus::Failed]
);
impl_text_enum!(TransType, [TransType::Saga, TransType::Tcc, TransType::Xa, TransType::Msg]);
impl_text_enum!(Protocol, [Protocol::Http, Protocol::Grpc]);
impl_text_enum!(
    BranchOp,
    [
        BranchOp::Action,
        BranchOp::Compensate,
        BranchOp::Try,
        BranchOp::Confirm,
        BranchOp::Cancel,
        BranchOp::Commit,
        BranchOp::Rollback,
        BranchOp::Msg,
    ]
);

/// Participant-supplied overrides, persisted as the `options` blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransOptions {
    /// Seconds after creation before an unconfirmed transaction is failed. 0 = use default.
    #[serde(default)]
    pub timeout_to_fail: u64,
    /// Baseline cron interval in seconds. 0 = use default.
    #[serde(default)]
    pub retry_interval: u64,
    /// Process inline on submit and report the outcome to the caller.
    #[serde(default)]
    pub wait_result: bool,
    /// Extra headers forwarded with every HTTP branch call.
    #[serde(default)]
    pub branch_headers: Vec<(String, String)>,
}

/// One row per business transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransGlobal {
    pub gid: String,
    pub trans_type: TransType,
    pub status: TransStatus,
    pub protocol: Protocol,
    #[serde(default)]
    pub query_prepared: String,
    #[serde(default)]
    pub options: TransOptions,
    #[serde(default)]
    pub custom_data: String,
    /// Seconds between cron checks.
    pub next_cron_interval: u64,
    pub next_cron_time: u64,
    /// Lease token of the replica that last claimed this transaction.
    #[serde(default)]
    pub owner: String,
    pub create_time: u64,
    pub update_time: u64,
    #[serde(default)]
    pub commit_time: Option<u64>,
    #[serde(default)]
    pub finish_time: Option<u64>,
    #[serde(default)]
    pub rollback_time: Option<u64>,
}

impl TransGlobal {
    /// Build a fresh record stamped with the current time. Cron fields are
    /// filled in by the coordinator before the record is saved.
    pub fn new(gid: impl Into<String>, trans_type: TransType, status: TransStatus) -> Self {
        let now = unix_time_ms();
        Self {
            gid: gid.into(),
            trans_type,
            status,
            protocol: Protocol::Http,
            query_prepared: String::new(),
            options: TransOptions::default(),
            custom_data: String::new(),
            next_cron_interval: 0,
            next_cron_time: now,
            owner: String::new(),
            create_time: now,
            update_time: now,
            commit_time: None,
            finish_time: None,
            rollback_time: None,
        }
    }
}

/// One participant call within a global transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransBranch {
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub url: String,
    /// Opaque request body, forwarded untouched.
    #[serde(default)]
    pub bin_data: Vec<u8>,
    pub status: BranchStatus,
    pub create_time: u64,
    pub update_time: u64,
    #[serde(default)]
    pub finish_time: Option<u64>,
}

impl TransBranch {
    pub fn new(
        gid: impl Into<String>,
        branch_id: impl Into<String>,
        op: BranchOp,
        url: impl Into<String>,
        bin_data: Vec<u8>,
    ) -> Self {
        let now = unix_time_ms();
        Self {
            gid: gid.into(),
            branch_id: branch_id.into(),
            op,
            url: url.into(),
            bin_data,
            status: BranchStatus::Prepared,
            create_time: now,
            update_time: now,
            finish_time: None,
        }
    }

    pub fn same_identity(&self, other: &TransBranch) -> bool {
        self.gid == other.gid && self.branch_id == other.branch_id && self.op == other.op
    }
}

/// A branch status change applied without the global status lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchStatusUpdate {
    pub gid: String,
    pub branch_id: String,
    pub op: BranchOp,
    pub status: BranchStatus,
    pub finish_time: u64,
}
