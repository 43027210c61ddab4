use crate::ir::LocalId;
use crate::runtime::value::Value;

/// Closure storage for one method activation. Every region function of the
/// method reads and writes the same locals through its `closure` argument.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    locals: Vec<Value>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locals that were never assigned read as `nil`.
    pub fn get(&self, local: LocalId) -> Value {
        self.locals
            .get(local.0 as usize)
            .cloned()
            .unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, local: LocalId, value: Value) {
        let idx = local.0 as usize;
        if idx >= self.locals.len() {
            self.locals.resize(idx + 1, Value::Nil);
        }
        self.locals[idx] = value;
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }
}

/// Per-activation frame stack slots.
#[derive(Debug, Default)]
pub struct SlotStack {
    slots: Vec<Value>,
    peak: usize,
    allocations: u64,
}

impl SlotStack {
    pub fn alloc(&mut self) -> usize {
        self.slots.push(Value::Nil);
        self.allocations += 1;
        self.peak = self.peak.max(self.slots.len());
        self.slots.len() - 1
    }

    pub fn get(&self, slot: usize) -> Option<&Value> {
        self.slots.get(slot)
    }

    pub fn set(&mut self, slot: usize, value: Value) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) => {
                *entry = value;
                true
            }
            None => false,
        }
    }

    pub fn mark(&self) -> usize {
        self.slots.len()
    }

    pub fn release_to(&mut self, mark: usize) {
        self.slots.truncate(mark);
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_locals_read_as_nil() {
        let mut env = Environment::new();
        env.set(LocalId(3), Value::Int(1));
        assert_eq!(env.get(LocalId(0)), Value::Nil);
        assert_eq!(env.get(LocalId(3)), Value::Int(1));
        assert_eq!(env.get(LocalId(9)), Value::Nil);
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn released_slots_keep_the_peak() {
        let mut stack = SlotStack::default();
        let mark = stack.mark();
        let a = stack.alloc();
        stack.alloc();
        assert!(stack.set(a, Value::Int(7)));
        stack.release_to(mark);
        assert!(stack.get(a).is_none());
        assert_eq!(stack.peak(), 2);
        assert_eq!(stack.allocations(), 2);
    }
}
