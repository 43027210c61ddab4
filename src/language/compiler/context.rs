use super::{LowerError, LowerResult};
use crate::ir::{Callee, IrBuilder};
use crate::runtime::abi::RuntimeFn;
use std::collections::HashMap;
use std::fmt;

/// Identifies one compiled function of a method: the method itself or one of
/// the regions of a `begin` construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

impl RegionId {
    pub fn offset(self, by: u32) -> RegionId {
        RegionId(self.0 + by)
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region {}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionType {
    Method,
    Body,
    Handlers,
    Else,
    Ensure,
    /// Statically absent region; calls go to the do-nothing stand-in.
    Unused,
}

impl FunctionType {
    pub fn name(self) -> &'static str {
        match self {
            FunctionType::Method => "method",
            FunctionType::Body => "body",
            FunctionType::Handlers => "handlers",
            FunctionType::Else => "else",
            FunctionType::Ensure => "ensure",
            FunctionType::Unused => "unused",
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The region ids making up one exception construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExceptionRegions {
    pub body: RegionId,
    pub handlers: RegionId,
    pub else_region: RegionId,
    pub ensure: RegionId,
}

impl ExceptionRegions {
    pub const SPAN: u32 = 4;

    /// The layout the region allocator uses: handlers, ensure and else follow
    /// the body id in that order.
    pub fn from_body(body: RegionId) -> Self {
        Self::new(body, body.offset(1), body.offset(3), body.offset(2))
    }

    pub fn new(
        body: RegionId,
        handlers: RegionId,
        else_region: RegionId,
        ensure: RegionId,
    ) -> Self {
        Self {
            body,
            handlers,
            else_region,
            ensure,
        }
    }
}

pub struct DefinedRegion<B: IrBuilder> {
    pub kind: FunctionType,
    pub function: B::Function,
    pub init: B::Block,
    pub line_ptr: B::Value,
}

enum RegionSlot<B: IrBuilder> {
    Defined(DefinedRegion<B>),
    Unused,
}

/// Per-method bookkeeping shared by the region compiler and the exception
/// lowering: which function implements each region, and where its
/// initializer block and line-number slot are.
pub struct EmitterContext<B: IrBuilder> {
    regions: HashMap<RegionId, RegionSlot<B>>,
}

impl<B: IrBuilder> Default for EmitterContext<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: IrBuilder> EmitterContext<B> {
    pub fn new() -> Self {
        Self {
            regions: HashMap::new(),
        }
    }

    pub fn define_region(
        &mut self,
        id: RegionId,
        kind: FunctionType,
        function: B::Function,
        init: B::Block,
        line_ptr: B::Value,
    ) {
        self.regions.insert(
            id,
            RegionSlot::Defined(DefinedRegion {
                kind,
                function,
                init,
                line_ptr,
            }),
        );
    }

    pub fn mark_unused(&mut self, id: RegionId) {
        self.regions.insert(id, RegionSlot::Unused);
    }

    pub fn region_type(&self, id: RegionId) -> LowerResult<FunctionType> {
        match self.slot(id)? {
            RegionSlot::Defined(region) => Ok(region.kind),
            RegionSlot::Unused => Ok(FunctionType::Unused),
        }
    }

    /// The callable for `id`; unused regions resolve to `rt_block_return_undef`.
    pub fn region_function(&self, id: RegionId) -> LowerResult<Callee<B::Function>> {
        match self.slot(id)? {
            RegionSlot::Defined(region) => Ok(Callee::Function(region.function)),
            RegionSlot::Unused => Ok(Callee::Runtime(RuntimeFn::BlockReturnUndef)),
        }
    }

    pub fn defined(&self, id: RegionId) -> LowerResult<&DefinedRegion<B>> {
        match self.slot(id)? {
            RegionSlot::Defined(region) => Ok(region),
            RegionSlot::Unused => Err(LowerError::UnusedRegion(id)),
        }
    }

    pub fn function(&self, id: RegionId) -> LowerResult<B::Function> {
        self.defined(id).map(|region| region.function)
    }

    pub fn function_initializer(&self, id: RegionId) -> LowerResult<B::Block> {
        self.defined(id).map(|region| region.init)
    }

    pub fn line_number_ptr(&self, id: RegionId) -> LowerResult<B::Value> {
        self.defined(id).map(|region| region.line_ptr)
    }

    fn slot(&self, id: RegionId) -> LowerResult<&RegionSlot<B>> {
        self.regions.get(&id).ok_or(LowerError::UnknownRegion(id))
    }
}
