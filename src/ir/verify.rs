//! Structural checks over a finished [`Module`].

use super::{BlockId, Function, InstKind, Module, Operand};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("`{function}`: block `{block}` has no terminator")]
    Unterminated { function: String, block: String },
    #[error("`{function}`: block `{block}` branches to a block that does not exist")]
    MissingTarget { function: String, block: String },
    #[error("`{function}`: stack slot allocated in `{block}` instead of the initializer block")]
    AllocaOutsideInit { function: String, block: String },
    #[error("`{function}`: value used in `{block}` is out of range")]
    UnknownValue { function: String, block: String },
}

pub fn verify_module(module: &Module) -> Result<(), Vec<VerifyError>> {
    let errors: Vec<_> = module.functions.iter().flat_map(verify_function).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn verify_function(func: &Function) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    let reachable = reachable_blocks(func);
    let error_ctx = |idx: usize| {
        (
            func.name.clone(),
            func.blocks
                .get(idx)
                .map(|block| block.name.clone())
                .unwrap_or_default(),
        )
    };

    for (idx, block) in func.blocks.iter().enumerate() {
        let id = BlockId(idx as u32);
        for inst in &block.insts {
            if matches!(inst.kind, InstKind::Alloca) && id != func.init {
                let (function, block) = error_ctx(idx);
                errors.push(VerifyError::AllocaOutsideInit { function, block });
            }
            if operands(&inst.kind)
                .into_iter()
                .any(|operand| !value_in_range(func, operand))
            {
                let (function, block) = error_ctx(idx);
                errors.push(VerifyError::UnknownValue { function, block });
            }
        }
        match &block.terminator {
            Some(terminator) => {
                if terminator
                    .successors()
                    .iter()
                    .any(|target| func.block(*target).is_none())
                {
                    let (function, block) = error_ctx(idx);
                    errors.push(VerifyError::MissingTarget { function, block });
                }
            }
            None if reachable.contains(&id) => {
                let (function, block) = error_ctx(idx);
                errors.push(VerifyError::Unterminated { function, block });
            }
            None => {}
        }
    }
    errors
}

fn reachable_blocks(func: &Function) -> HashSet<BlockId> {
    let mut seen = HashSet::new();
    let mut work = vec![func.init];
    while let Some(id) = work.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(terminator) = func.block(id).and_then(|block| block.terminator) {
            work.extend(terminator.successors());
        }
    }
    seen
}

fn value_in_range(func: &Function, operand: Operand) -> bool {
    match operand {
        Operand::Value(id) => id.index() < func.value_count(),
        Operand::Const(_) | Operand::Func(_) => true,
    }
}

fn operands(kind: &InstKind) -> Vec<Operand> {
    match kind {
        InstKind::Alloca | InstKind::LocalGet { .. } => Vec::new(),
        InstKind::Load { ptr } => vec![*ptr],
        InstKind::Store { ptr, value } => vec![*ptr, *value],
        InstKind::Call { args, .. } => args.clone(),
        InstKind::ICmp { lhs, rhs, .. } | InstKind::And { lhs, rhs } => vec![*lhs, *rhs],
        InstKind::Select {
            cond,
            then_value,
            else_value,
        } => vec![*cond, *then_value, *else_value],
        InstKind::LocalSet { value, .. } => vec![*value],
    }
}
