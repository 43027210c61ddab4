use crate::runtime::value::Value;

/// The runtime's "currently pending error" slot (`$!`).
///
/// Lowered code only talks to it through `rt_errinfo` and `rt_set_errinfo`;
/// the interpreter routes those calls here so tests can observe and seed it.
pub trait AmbientErrors {
    fn errinfo(&self) -> Value;
    fn set_errinfo(&mut self, value: Value);
}

/// An in-memory ambient error cell, one per logical thread.
#[derive(Debug, Clone)]
pub struct AmbientCell {
    current: Value,
    writes: u64,
}

impl AmbientCell {
    pub fn new() -> Self {
        Self {
            current: Value::Nil,
            writes: 0,
        }
    }

    pub fn with_pending(value: Value) -> Self {
        Self {
            current: value,
            writes: 0,
        }
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }
}

impl Default for AmbientCell {
    fn default() -> Self {
        Self::new()
    }
}

impl AmbientErrors for AmbientCell {
    fn errinfo(&self) -> Value {
        self.current.clone()
    }

    fn set_errinfo(&mut self, value: Value) {
        self.writes += 1;
        self.current = value;
    }
}
