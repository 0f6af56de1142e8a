//! Conversions from library errors into CutoverError

use super::types::CutoverError;

impl From<redb::Error> for CutoverError {
    fn from(err: redb::Error) -> Self {
        CutoverError::storage("redb", err)
    }
}

impl From<redb::TransactionError> for CutoverError {
    fn from(err: redb::TransactionError) -> Self {
        CutoverError::storage("begin transaction", err)
    }
}

impl From<redb::TableError> for CutoverError {
    fn from(err: redb::TableError) -> Self {
        CutoverError::storage("open table", err)
    }
}

impl From<redb::StorageError> for CutoverError {
    fn from(err: redb::StorageError) -> Self {
        CutoverError::storage("table access", err)
    }
}

impl From<redb::DatabaseError> for CutoverError {
    fn from(err: redb::DatabaseError) -> Self {
        CutoverError::storage("open database", err)
    }
}

impl From<redb::CommitError> for CutoverError {
    fn from(err: redb::CommitError) -> Self {
        CutoverError::storage("commit", err)
    }
}

impl From<bincode::Error> for CutoverError {
    fn from(err: bincode::Error) -> Self {
        CutoverError::serialization("bincode", err)
    }
}

impl From<serde_json::Error> for CutoverError {
    fn from(err: serde_json::Error) -> Self {
        CutoverError::serialization("json", err)
    }
}

impl From<std::io::Error> for CutoverError {
    fn from(err: std::io::Error) -> Self {
        CutoverError::IoError(Box::new(err))
    }
}

impl From<tokio::task::JoinError> for CutoverError {
    fn from(err: tokio::task::JoinError) -> Self {
        CutoverError::internal(format!("Task join error: {}", err))
    }
}
