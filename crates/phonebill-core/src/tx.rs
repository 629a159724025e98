//! Transaction options passed to the storage backend
//!
//! A [`TxOption`] tells a session how to run one transaction. The engine
//! itself only reads the label and the retry limit.

use serde::Deserialize;
use std::fmt;

/// Concurrency control mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TxMode {
    /// Optimistic concurrency control
    #[serde(alias = "occ")]
    Occ,
    /// Long transaction that declares its write set up front
    #[serde(alias = "ltx")]
    Ltx,
}

impl fmt::Display for TxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxMode::Occ => f.write_str("OCC"),
            TxMode::Ltx => f.write_str("LTX"),
        }
    }
}

/// Tables of the benchmark schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    History,
    Contracts,
    Billing,
}

impl Table {
    pub fn table_name(&self) -> &'static str {
        match self {
            Table::History => "history",
            Table::Contracts => "contracts",
            Table::Billing => "billing",
        }
    }
}

/// Label attached to every transaction, used as the counter and statistics key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TxLabel {
    BatchMain,
    OnlineMasterDelete,
    OnlineMasterInsert,
    OnlineMasterUpdate,
    OnlineHistoryInsert,
    OnlineHistoryUpdate,
    BatchInitialize,
    Initialize,
    TestDataGenerator,
    CheckResult,
    Ddl,
    Test,
    Default,
}

impl TxLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxLabel::BatchMain => "BATCH_MAIN",
            TxLabel::OnlineMasterDelete => "ONLINE_MASTER_DELETE",
            TxLabel::OnlineMasterInsert => "ONLINE_MASTER_INSERT",
            TxLabel::OnlineMasterUpdate => "ONLINE_MASTER_UPDATE",
            TxLabel::OnlineHistoryInsert => "ONLINE_HISTORY_INSERT",
            TxLabel::OnlineHistoryUpdate => "ONLINE_HISTORY_UPDATE",
            TxLabel::BatchInitialize => "BATCH_INITIALIZE",
            TxLabel::Initialize => "INITIALIZE",
            TxLabel::TestDataGenerator => "TEST_DATA_GENERATOR",
            TxLabel::CheckResult => "CHECK_RESULT",
            TxLabel::Ddl => "DDL",
            TxLabel::Test => "TEST",
            TxLabel::Default => "DEFAULT",
        }
    }
}

impl fmt::Display for TxLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session should run one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOption {
    pub mode: TxMode,
    pub label: TxLabel,
    /// Tables an LTX declares for writing, empty for OCC
    pub write_preserve: Vec<Table>,
    /// How many times a retriable failure is retried before giving up
    pub retry_limit: u32,
}

impl TxOption {
    pub fn occ(retry_limit: u32, label: TxLabel) -> Self {
        Self {
            mode: TxMode::Occ,
            label,
            write_preserve: Vec::new(),
            retry_limit,
        }
    }

    pub fn ltx(retry_limit: u32, label: TxLabel, write_preserve: &[Table]) -> Self {
        Self {
            mode: TxMode::Ltx,
            label,
            write_preserve: write_preserve.to_vec(),
            retry_limit,
        }
    }

    /// Builds the option for the given mode, dropping the write set for OCC
    pub fn of_mode(
        mode: TxMode,
        retry_limit: u32,
        label: TxLabel,
        write_preserve: &[Table],
    ) -> Self {
        match mode {
            TxMode::Occ => Self::occ(retry_limit, label),
            TxMode::Ltx => Self::ltx(retry_limit, label, write_preserve),
        }
    }
}

impl Default for TxOption {
    fn default() -> Self {
        Self::occ(0, TxLabel::Default)
    }
}

impl fmt::Display for TxOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}", self.mode, self.label)?;
        if !self.write_preserve.is_empty() {
            let tables: Vec<&str> = self.write_preserve.iter().map(Table::table_name).collect();
            write!(f, ", wp={}", tables.join(","))?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_display() {
        let occ = TxOption::occ(3, TxLabel::OnlineHistoryInsert);
        assert_eq!(occ.to_string(), "OCC[ONLINE_HISTORY_INSERT]");

        let ltx = TxOption::ltx(3, TxLabel::BatchMain, &[Table::History, Table::Billing]);
        assert_eq!(ltx.to_string(), "LTX[BATCH_MAIN, wp=history,billing]");
    }

    #[test]
    fn test_of_mode_drops_write_set_for_occ() {
        let option = TxOption::of_mode(TxMode::Occ, 0, TxLabel::BatchMain, &[Table::History]);
        assert!(option.write_preserve.is_empty());
        let option = TxOption::of_mode(TxMode::Ltx, 0, TxLabel::BatchMain, &[Table::History]);
        assert_eq!(option.write_preserve, vec![Table::History]);
    }
}
