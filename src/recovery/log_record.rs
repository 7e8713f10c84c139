use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::common::types::ClientId;
use crate::index::IndexKind;

#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("malformed log record: {0}")]
    Malformed(String),
}

/// The action recorded by an edit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for EditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditAction::Insert => write!(f, "INSERT"),
            EditAction::Update => write!(f, "UPDATE"),
            EditAction::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for EditAction {
    type Err = LogRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(EditAction::Insert),
            "UPDATE" => Ok(EditAction::Update),
            "DELETE" => Ok(EditAction::Delete),
            other => Err(LogRecordError::Malformed(format!("unknown action: {}", other))),
        }
    }
}

/// One line of the write-ahead log. Records are human-readable text,
/// one per line:
///
/// ```text
/// < create btree table accounts >
/// < 6f9619ff-8b86-d011-b42d-00c04fc964ff start >
/// < 6f9619ff-8b86-d011-b42d-00c04fc964ff, accounts, INSERT, 1, 0, 10 >
/// < 6f9619ff-8b86-d011-b42d-00c04fc964ff commit >
/// < checkpoint [6f9619ff-8b86-d011-b42d-00c04fc964ff] >
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Table {
        kind: IndexKind,
        name: String,
    },
    Start {
        id: ClientId,
    },
    Commit {
        id: ClientId,
    },
    Edit {
        id: ClientId,
        table: String,
        action: EditAction,
        key: i64,
        oldval: i64,
        newval: i64,
    },
    Checkpoint {
        ids: Vec<ClientId>,
    },
}

impl LogRecord {
    /// The transaction this record belongs to, if any.
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            LogRecord::Start { id } | LogRecord::Commit { id } | LogRecord::Edit { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogRecord::Table { kind, name } => write!(f, "< create {} table {} >", kind, name),
            LogRecord::Start { id } => write!(f, "< {} start >", id),
            LogRecord::Commit { id } => write!(f, "< {} commit >", id),
            LogRecord::Edit { id, table, action, key, oldval, newval } => {
                write!(f, "< {}, {}, {}, {}, {}, {} >", id, table, action, key, oldval, newval)
            }
            LogRecord::Checkpoint { ids } => {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                write!(f, "< checkpoint [{}] >", ids.join(","))
            }
        }
    }
}

impl FromStr for LogRecord {
    type Err = LogRecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let inner = line
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| LogRecordError::Malformed(line.to_string()))?
            .trim();

        if inner.contains(',') && !inner.starts_with("checkpoint") {
            // Edit record: id, table, action, key, oldval, newval
            let fields: Vec<&str> = inner.split(',').map(str::trim).collect();
            if fields.len() != 6 {
                return Err(LogRecordError::Malformed(line.to_string()));
            }
            let id = parse_id(fields[0], line)?;
            let action = fields[2].parse()?;
            let key = parse_i64(fields[3], line)?;
            let oldval = parse_i64(fields[4], line)?;
            let newval = parse_i64(fields[5], line)?;
            return Ok(LogRecord::Edit {
                id,
                table: fields[1].to_string(),
                action,
                key,
                oldval,
                newval,
            });
        }

        let tokens: Vec<&str> = inner.split_whitespace().collect();
        match tokens.as_slice() {
            ["create", kind, "table", name] => {
                let kind = kind
                    .parse()
                    .map_err(|_| LogRecordError::Malformed(line.to_string()))?;
                Ok(LogRecord::Table { kind, name: name.to_string() })
            }
            [id, "start"] => Ok(LogRecord::Start { id: parse_id(id, line)? }),
            [id, "commit"] => Ok(LogRecord::Commit { id: parse_id(id, line)? }),
            ["checkpoint", ids] => {
                let ids = ids
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .ok_or_else(|| LogRecordError::Malformed(line.to_string()))?;
                let ids = ids
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| parse_id(s.trim(), line))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(LogRecord::Checkpoint { ids })
            }
            _ => Err(LogRecordError::Malformed(line.to_string())),
        }
    }
}

fn parse_id(s: &str, line: &str) -> Result<ClientId, LogRecordError> {
    ClientId::parse_str(s).map_err(|_| LogRecordError::Malformed(line.to_string()))
}

fn parse_i64(s: &str, line: &str) -> Result<i64, LogRecordError> {
    s.parse().map_err(|_| LogRecordError::Malformed(line.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: LogRecord) {
        let line = record.to_string();
        let parsed: LogRecord = line.parse().unwrap();
        assert_eq!(parsed, record, "round trip failed for {}", line);
    }

    #[test]
    fn test_round_trips() {
        let id = uuid::Uuid::new_v4();
        round_trip(LogRecord::Table { kind: IndexKind::Hash, name: "t".to_string() });
        round_trip(LogRecord::Table { kind: IndexKind::BTree, name: "nums".to_string() });
        round_trip(LogRecord::Start { id });
        round_trip(LogRecord::Commit { id });
        round_trip(LogRecord::Edit {
            id,
            table: "t".to_string(),
            action: EditAction::Insert,
            key: 1,
            oldval: 0,
            newval: 10,
        });
        round_trip(LogRecord::Edit {
            id,
            table: "t".to_string(),
            action: EditAction::Delete,
            key: -5,
            oldval: -50,
            newval: 0,
        });
        round_trip(LogRecord::Checkpoint { ids: vec![] });
        round_trip(LogRecord::Checkpoint { ids: vec![id, uuid::Uuid::new_v4()] });
    }

    #[test]
    fn test_malformed_lines_rejected() {
        for line in [
            "",
            "garbage",
            "< >",
            "< something else entirely >",
            "< create wedge table t >",
            "< not-a-uuid start >",
            "< 6f9619ff-8b86-d011-b42d-00c04fc964ff, t, INSERT, 1, 0 >",
            "< 6f9619ff-8b86-d011-b42d-00c04fc964ff, t, UPSERT, 1, 0, 10 >",
            "< checkpoint 1,2 >",
        ] {
            assert!(line.parse::<LogRecord>().is_err(), "accepted: {:?}", line);
        }
    }
}
