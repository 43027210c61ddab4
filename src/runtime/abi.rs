/// Runtime entry points that lowered code calls into.
///
/// The first five make up the exception protocol; the rest back the
/// statements of region scripts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RuntimeFn {
    /// `rt_try(fn, pc, closure, cfp, errctx, out) -> value`
    Try,
    /// `rt_errinfo() -> value`
    ErrInfo,
    /// `rt_set_errinfo(value)`
    SetErrInfo,
    /// `rt_raise_if_not_nil(value)`
    RaiseIfNotNil,
    /// `rt_block_return_undef(pc, closure, cfp) -> undef`
    BlockReturnUndef,
    /// `rt_raise(pc, class, message)`, never returns normally; an empty
    /// message means none was given
    Raise,
    /// `rt_isa(exception, class) -> bool`
    IsA,
    /// `rt_puts(value)`
    Puts,
    /// `rt_int_add(lhs, rhs) -> value`
    IntAdd,
}

/// How an entry point's arguments and result are typed at the LLVM level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiType {
    /// a tagged runtime value (`i64`)
    Value,
    /// an opaque pointer
    Ptr,
    /// an `i1`
    Bool,
    Void,
}

impl RuntimeFn {
    pub const ALL: [RuntimeFn; 9] = [
        RuntimeFn::Try,
        RuntimeFn::ErrInfo,
        RuntimeFn::SetErrInfo,
        RuntimeFn::RaiseIfNotNil,
        RuntimeFn::BlockReturnUndef,
        RuntimeFn::Raise,
        RuntimeFn::IsA,
        RuntimeFn::Puts,
        RuntimeFn::IntAdd,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            RuntimeFn::Try => "rt_try",
            RuntimeFn::ErrInfo => "rt_errinfo",
            RuntimeFn::SetErrInfo => "rt_set_errinfo",
            RuntimeFn::RaiseIfNotNil => "rt_raise_if_not_nil",
            RuntimeFn::BlockReturnUndef => "rt_block_return_undef",
            RuntimeFn::Raise => "rt_raise",
            RuntimeFn::IsA => "rt_isa",
            RuntimeFn::Puts => "rt_puts",
            RuntimeFn::IntAdd => "rt_int_add",
        }
    }

    pub fn params(self) -> &'static [AbiType] {
        use AbiType::*;
        match self {
            RuntimeFn::Try => &[Ptr, Value, Ptr, Value, Value, Ptr],
            RuntimeFn::ErrInfo => &[],
            RuntimeFn::SetErrInfo | RuntimeFn::RaiseIfNotNil | RuntimeFn::Puts => &[Value],
            RuntimeFn::BlockReturnUndef => &[Value, Ptr, Value],
            RuntimeFn::Raise => &[Value, Value, Value],
            RuntimeFn::IsA => &[Value, Value],
            RuntimeFn::IntAdd => &[Value, Value],
        }
    }

    pub fn returns(self) -> AbiType {
        match self {
            RuntimeFn::Try
            | RuntimeFn::ErrInfo
            | RuntimeFn::BlockReturnUndef
            | RuntimeFn::IntAdd => AbiType::Value,
            RuntimeFn::IsA => AbiType::Bool,
            RuntimeFn::SetErrInfo
            | RuntimeFn::RaiseIfNotNil
            | RuntimeFn::Raise
            | RuntimeFn::Puts => AbiType::Void,
        }
    }

    pub fn arity(self) -> usize {
        self.params().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_are_distinct_and_prefixed() {
        let mut symbols: Vec<_> = RuntimeFn::ALL.iter().map(|rt| rt.symbol()).collect();
        assert!(symbols.iter().all(|symbol| symbol.starts_with("rt_")));
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), RuntimeFn::ALL.len());
    }

    #[test]
    fn guarded_call_takes_the_full_exception_context() {
        assert_eq!(RuntimeFn::Try.arity(), 6);
        assert_eq!(RuntimeFn::BlockReturnUndef.arity(), 3);
        assert_eq!(RuntimeFn::SetErrInfo.returns(), AbiType::Void);
    }
}
