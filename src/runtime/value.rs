use crate::ir::FuncRef;
use std::fmt;
use std::rc::Rc;

/// A raised error object.
#[derive(Debug)]
pub struct Exception {
    pub class: String,
    pub message: Option<String>,
    /// Line recorded from the `pc` of the raising frame.
    pub line: i64,
}

impl Exception {
    pub fn new(class: impl Into<String>, message: Option<String>, line: i64) -> Self {
        Self {
            class: class.into(),
            message,
            line,
        }
    }

    /// `rescue Exception` and `rescue StandardError` match anything raised.
    pub fn is_a(&self, class: &str) -> bool {
        self.class == class || matches!(class, "Exception" | "StandardError")
    }
}

/// Runtime values seen by the interpreter.
///
/// `Nil`, `Undef` and `Retry` are the three protocol sentinels; no user
/// value can compare equal to them.
#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Undef,
    Retry,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Exception(Rc<Exception>),
    Func(FuncRef),
    /// A stack slot created by `alloca`.
    Ptr(usize),
    /// A method activation's closure storage.
    Env(usize),
}

impl Value {
    pub fn exception(class: impl Into<String>, message: Option<String>) -> Self {
        Value::Exception(Rc::new(Exception::new(class, message, 0)))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Value::Undef)
    }

    pub fn as_exception(&self) -> Option<&Exception> {
        match self {
            Value::Exception(exception) => Some(exception),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Undef => "undef",
            Value::Retry => "retry",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Exception(_) => "exception",
            Value::Func(_) => "function",
            Value::Ptr(_) => "pointer",
            Value::Env(_) => "closure",
        }
    }

    /// Debug-style rendering used in outcomes and diagnostics.
    pub fn inspect(&self) -> String {
        match self {
            Value::Str(text) => format!("{text:?}"),
            Value::Exception(exception) => match &exception.message {
                Some(message) => format!("#<{}: {}>", exception.class, message),
                None => format!("#<{}>", exception.class),
            },
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil)
            | (Value::Undef, Value::Undef)
            | (Value::Retry, Value::Retry) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::Func(a), Value::Func(b)) => a == b,
            (Value::Ptr(a), Value::Ptr(b)) | (Value::Env(a), Value::Env(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Undef => write!(f, "undef"),
            Value::Retry => write!(f, "retry"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(v) => write!(f, "{v}"),
            Value::Exception(exception) => match &exception.message {
                Some(message) => write!(f, "{message}"),
                None => write!(f, "{}", exception.class),
            },
            Value::Func(_) => write!(f, "<function>"),
            Value::Ptr(slot) => write!(f, "<slot {slot}>"),
            Value::Env(env) => write!(f, "<closure {env}>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceptions_compare_by_identity() {
        let first = Value::exception("Timeout", None);
        let second = Value::exception("Timeout", None);
        assert_eq!(first, first.clone());
        assert_ne!(first, second);
    }

    #[test]
    fn sentinels_never_equal_user_values() {
        for user in [Value::Int(0), Value::Bool(false), Value::Str("".into())] {
            assert_ne!(user, Value::Nil);
            assert_ne!(user, Value::Undef);
            assert_ne!(user, Value::Retry);
        }
    }

    #[test]
    fn puts_renders_message_or_class() {
        assert_eq!(Value::exception("Boom", Some("bad".into())).to_string(), "bad");
        assert_eq!(Value::exception("Boom", None).to_string(), "Boom");
        assert_eq!(Value::exception("Boom", None).inspect(), "#<Boom>");
    }
}
