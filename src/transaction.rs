//! Nested transaction bookkeeping for one connection.
//!
//! A connection owns a stack of transaction names. Only the outermost
//! boundary touches the database: BEGIN on the 0→1 push, COMMIT on the 1→0
//! pop. Rollback is deliberately asymmetric: it unwinds the whole stack and
//! issues exactly one physical ROLLBACK at any depth, so a nested failure
//! aborts the entire unit of work.

use crate::error::{OrmError, Result};

/// Physical statement a stack operation requires of the backend, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    None,
    Begin,
    Commit,
    Rollback,
}

/// Per-connection stack of named transactions, innermost last.
#[derive(Debug, Default)]
pub struct TransactionStack {
    names: Vec<String>,
    counter: u64,
}

impl TransactionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.names.len()
    }

    pub fn is_active(&self) -> bool {
        !self.names.is_empty()
    }

    pub fn innermost(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }

    /// Pushes a transaction scope. Returns the scope name and whether the
    /// caller must issue a physical BEGIN.
    pub fn begin(&mut self, name: Option<&str>) -> (String, TxAction) {
        self.counter += 1;
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("txn-{}", self.counter));
        self.names.push(name.clone());
        let action = if self.names.len() == 1 {
            TxAction::Begin
        } else {
            TxAction::None
        };
        (name, action)
    }

    /// Pops the innermost scope. A physical COMMIT is required only on the
    /// depth 1→0 transition; committing with an empty stack is an error,
    /// never a silent success.
    pub fn commit(&mut self, name: Option<&str>) -> Result<TxAction> {
        let innermost = self.names.last().ok_or(OrmError::NoActiveTransaction)?;
        if let Some(expected) = name {
            if innermost != expected {
                return Err(OrmError::Transaction(format!(
                    "commit of {} does not match innermost transaction {}",
                    expected, innermost
                )));
            }
        }
        self.names.pop();
        Ok(if self.names.is_empty() {
            TxAction::Commit
        } else {
            TxAction::None
        })
    }

    /// Empties the entire stack regardless of depth. The caller issues
    /// exactly one physical ROLLBACK.
    pub fn rollback(&mut self) -> Result<TxAction> {
        if self.names.is_empty() {
            return Err(OrmError::NoActiveTransaction);
        }
        self.names.clear();
        Ok(TxAction::Rollback)
    }
}
