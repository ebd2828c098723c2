//! Remote control signals addressed to a worker.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

use crate::schema::cronlease_signals;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[db_enum(existing_type_path = "crate::schema::sql_types::WorkerSignal")]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    /// Stop the worker
    #[db_enum(rename = "TERM")]
    Term,
    /// Log a status snapshot and push a heartbeat
    #[db_enum(rename = "USR1")]
    Usr1,
    /// Leave quiet mode
    #[db_enum(rename = "CONT")]
    Cont,
    /// Enter quiet mode
    #[db_enum(rename = "TSTP")]
    Tstp,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Term => "TERM",
            SignalKind::Usr1 => "USR1",
            SignalKind::Cont => "CONT",
            SignalKind::Tstp => "TSTP",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "TERM" => Ok(SignalKind::Term),
            "USR1" => Ok(SignalKind::Usr1),
            "CONT" => Ok(SignalKind::Cont),
            "TSTP" => Ok(SignalKind::Tstp),
            _ => Err(format!(
                "unknown signal '{}'; expected one of TERM, USR1, CONT, TSTP",
                s
            )),
        }
    }
}

/// A signal as stored in the signal table.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = cronlease_signals)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct SignalRecord {
    pub id: i64,
    /// Addressed worker
    pub worker_id: String,
    pub signal: SignalKind,
    pub sent_at: DateTime<Utc>,
    /// Set when the worker fetches the signal; `None` while pending
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = cronlease_signals)]
pub struct NewSignal {
    pub worker_id: String,
    pub signal: SignalKind,
    pub sent_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parse_accepts_sig_prefix() {
        assert_eq!("SIGTSTP".parse::<SignalKind>().unwrap(), SignalKind::Tstp);
        assert_eq!("term".parse::<SignalKind>().unwrap(), SignalKind::Term);
        assert!("HUP".parse::<SignalKind>().is_err());
    }
}
