//! The user function contract.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::LogicError;
use crate::record::Key;
use crate::record::Payload;
use crate::record::Record;

/// A record to send downstream once the effects that produced it are
/// committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emit {
    pub key: Key,
    pub payload: Payload,
}

impl Emit {
    pub fn new(key: impl Into<Key>, payload: impl Into<Payload>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Result of applying a record to a key's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied<S> {
    /// The key's new state. `None` discards it.
    pub state: Option<S>,
    pub emit: Vec<Emit>,
}

impl<S> Applied<S> {
    pub fn state(state: S) -> Self {
        Self {
            state: Some(state),
            emit: Vec::new(),
        }
    }

    pub fn discard() -> Self {
        Self {
            state: None,
            emit: Vec::new(),
        }
    }

    pub fn emit(mut self, emit: Emit) -> Self {
        self.emit.push(emit);
        self
    }
}

/// Business logic run for each fresh record of a key.
///
/// `apply` must be a pure function of the state and the record: it is
/// re-run from the last checkpoint whenever a record is redelivered
/// after a crash, and anything it does other than returning a value
/// happens again.
pub trait Logic: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn apply(
        &self,
        state: Option<&Self::State>,
        record: &Record,
    ) -> Result<Applied<Self::State>, LogicError>;
}

/// Counts records per key and forwards each to an `out` key. Used by
/// tests and the benchmark.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountLogic;

impl Logic for CountLogic {
    type State = u64;

    fn apply(&self, state: Option<&u64>, record: &Record) -> Result<Applied<u64>, LogicError> {
        let count = state.copied().unwrap_or(0) + 1;
        Ok(Applied::state(count).emit(Emit::new(
            format!("out-{}", record.key()).as_str(),
            record.payload().clone(),
        )))
    }
}

#[test]
fn count_logic_counts() {
    let record = Record::new("x", "a");
    let applied = CountLogic.apply(Some(&41), &record).unwrap();
    assert_eq!(applied.state, Some(42));
    assert_eq!(applied.emit, vec![Emit::new("out-x", "a")]);
}
