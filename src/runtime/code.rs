//! Compiled code objects and the code table
//!
//! Each installed code object occupies a private range of addresses so that a
//! frame's program counter identifies both the code object and the offset
//! inside it, the way return addresses do for real generated code.

use super::class::ClassId;
use super::function::FunctionId;
use super::Value;
use crate::deopt::{DeoptInfo, DeoptReason};
use std::rc::Rc;

/// Code handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u32);

/// Identifies a program point shared by baseline and optimized code
pub type DeoptId = usize;

const CODE_BASE_ADDRESS: usize = 0x10_000;
const CODE_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    Unoptimized,
    Optimized,
}

/// Deopt metadata recorded for one program point of optimized code
#[derive(Debug, Clone)]
pub struct DeoptTableEntry {
    pub pc_offset: usize,
    pub reason: DeoptReason,
    pub info: Rc<DeoptInfo>,
}

/// A static call site inside optimized code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCallEntry {
    pub pc_offset: usize,
    pub target_function: FunctionId,
    /// Code the call is currently patched to
    pub target_code: Option<CodeId>,
}

/// Tables the compiler produces for a code object
#[derive(Debug, Clone)]
pub struct CodeSpec {
    pub kind: CodeKind,
    /// Instruction size in bytes
    pub size: usize,
    /// Number of stack slots of a frame running this code
    pub frame_size: usize,
    pub deopt_table: Vec<DeoptTableEntry>,
    /// `(pc offset, target)` of each static call
    pub static_calls: Vec<(usize, FunctionId)>,
    /// `(deopt id, pc offset)` of each program point baseline code can resume at
    pub deopt_id_pcs: Vec<(DeoptId, usize)>,
    /// `(pc offset, deopt id)` of each loop check where OSR may enter
    pub osr_points: Vec<(usize, DeoptId)>,
    /// `(pc offset, token position)`, sorted by offset
    pub token_positions: Vec<(usize, usize)>,
    /// Constants referenced by the code and its deopt instructions
    pub object_pool: Vec<Value>,
    /// `(declaring class, field slot)` of each field whose guard the code relies on
    pub guarded_fields: Vec<(ClassId, usize)>,
}

impl CodeSpec {
    /// Baseline code with a frame of `frame_size` slots
    pub fn unoptimized(size: usize, frame_size: usize) -> Self {
        Self {
            kind: CodeKind::Unoptimized,
            size,
            frame_size,
            deopt_table: Vec::new(),
            static_calls: Vec::new(),
            deopt_id_pcs: Vec::new(),
            osr_points: Vec::new(),
            token_positions: Vec::new(),
            object_pool: Vec::new(),
            guarded_fields: Vec::new(),
        }
    }

    /// Optimized code with a frame of `frame_size` slots
    pub fn optimized(size: usize, frame_size: usize) -> Self {
        Self {
            kind: CodeKind::Optimized,
            ..Self::unoptimized(size, frame_size)
        }
    }

    pub fn with_deopt_point(
        mut self,
        pc_offset: usize,
        reason: DeoptReason,
        info: DeoptInfo,
    ) -> Self {
        self.deopt_table.push(DeoptTableEntry {
            pc_offset,
            reason,
            info: Rc::new(info),
        });
        self
    }

    pub fn with_static_call(mut self, pc_offset: usize, target: FunctionId) -> Self {
        self.static_calls.push((pc_offset, target));
        self
    }

    pub fn with_resume_point(mut self, deopt_id: DeoptId, pc_offset: usize) -> Self {
        self.deopt_id_pcs.push((deopt_id, pc_offset));
        self
    }

    pub fn with_osr_point(mut self, pc_offset: usize, deopt_id: DeoptId) -> Self {
        self.osr_points.push((pc_offset, deopt_id));
        self
    }

    pub fn with_token_position(mut self, pc_offset: usize, token_pos: usize) -> Self {
        self.token_positions.push((pc_offset, token_pos));
        self.token_positions.sort_unstable();
        self
    }

    pub fn with_constant(mut self, value: Value) -> Self {
        self.object_pool.push(value);
        self
    }

    pub fn with_field_guard(mut self, class: ClassId, slot: usize) -> Self {
        self.guarded_fields.push((class, slot));
        self
    }
}

/// An installed code object
#[derive(Debug, Clone)]
pub struct Code {
    pub id: CodeId,
    pub function: FunctionId,
    pub kind: CodeKind,
    pub entry_point: usize,
    pub size: usize,
    pub frame_size: usize,
    /// The OSR entry this code was compiled for
    pub osr_id: Option<DeoptId>,
    /// Dead code keeps no references alive for the collector
    pub alive: bool,
    deopt_table: Vec<DeoptTableEntry>,
    static_calls: Vec<StaticCallEntry>,
    deopt_id_pcs: Vec<(DeoptId, usize)>,
    osr_points: Vec<(usize, DeoptId)>,
    token_positions: Vec<(usize, usize)>,
    object_pool: Vec<Value>,
    guarded_fields: Vec<(ClassId, usize)>,
}

impl Code {
    pub fn is_optimized(&self) -> bool {
        self.kind == CodeKind::Optimized
    }

    /// Whether `pc` falls inside this code
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.entry_point && pc < self.entry_point + self.size
    }

    fn offset(&self, pc: usize) -> Option<usize> {
        self.contains(pc).then(|| pc - self.entry_point)
    }

    /// Deopt metadata recorded for `pc`
    pub fn deopt_info_at(&self, pc: usize) -> Option<(DeoptReason, Rc<DeoptInfo>)> {
        let offset = self.offset(pc)?;
        self.deopt_table
            .iter()
            .find(|entry| entry.pc_offset == offset)
            .map(|entry| (entry.reason, Rc::clone(&entry.info)))
    }

    /// Address baseline execution resumes at for `deopt_id`
    pub fn pc_for_deopt_id(&self, deopt_id: DeoptId) -> Option<usize> {
        self.deopt_id_pcs
            .iter()
            .find(|(id, _)| *id == deopt_id)
            .map(|(_, offset)| self.entry_point + offset)
    }

    /// Deopt id of the OSR point at `pc`
    pub fn deopt_id_for_osr(&self, pc: usize) -> Option<DeoptId> {
        let offset = self.offset(pc)?;
        self.osr_points
            .iter()
            .find(|(point, _)| *point == offset)
            .map(|(_, id)| *id)
    }

    /// Token position of the closest mapped offset at or before `pc`
    pub fn token_pos_at(&self, pc: usize) -> Option<usize> {
        let offset = self.offset(pc)?;
        self.token_positions
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map(|(_, pos)| *pos)
    }

    pub fn static_call_at(&self, pc: usize) -> Option<&StaticCallEntry> {
        let offset = self.offset(pc)?;
        self.static_calls.iter().find(|call| call.pc_offset == offset)
    }

    pub(crate) fn static_call_at_mut(&mut self, pc: usize) -> Option<&mut StaticCallEntry> {
        let offset = self.offset(pc)?;
        self.static_calls
            .iter_mut()
            .find(|call| call.pc_offset == offset)
    }

    pub fn static_calls(&self) -> &[StaticCallEntry] {
        &self.static_calls
    }

    pub fn object_pool(&self) -> &[Value] {
        &self.object_pool
    }

    /// Whether the code was compiled against the guard of `class`'s field `slot`
    pub fn guards_field(&self, class: ClassId, slot: usize) -> bool {
        self.guarded_fields.contains(&(class, slot))
    }
}

/// All installed code objects of an isolate
#[derive(Debug)]
pub struct CodeTable {
    codes: Vec<Code>,
    next_address: usize,
}

impl CodeTable {
    pub fn new() -> Self {
        Self {
            codes: Vec::new(),
            next_address: CODE_BASE_ADDRESS,
        }
    }

    /// Install `spec` for `function`, assigning it a fresh address range
    pub fn install(&mut self, function: FunctionId, spec: CodeSpec, osr_id: Option<DeoptId>) -> CodeId {
        let id = CodeId(self.codes.len() as u32);
        let size = spec.size.max(1);
        let entry_point = self.next_address;
        self.next_address = (entry_point + size + CODE_ALIGNMENT - 1) / CODE_ALIGNMENT * CODE_ALIGNMENT;
        self.codes.push(Code {
            id,
            function,
            kind: spec.kind,
            entry_point,
            size,
            frame_size: spec.frame_size,
            osr_id,
            alive: true,
            deopt_table: spec.deopt_table,
            static_calls: spec
                .static_calls
                .into_iter()
                .map(|(pc_offset, target_function)| StaticCallEntry {
                    pc_offset,
                    target_function,
                    target_code: None,
                })
                .collect(),
            deopt_id_pcs: spec.deopt_id_pcs,
            osr_points: spec.osr_points,
            token_positions: spec.token_positions,
            object_pool: spec.object_pool,
            guarded_fields: spec.guarded_fields,
        });
        id
    }

    pub fn get(&self, id: CodeId) -> Option<&Code> {
        self.codes.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: CodeId) -> Option<&mut Code> {
        self.codes.get_mut(id.0 as usize)
    }

    /// Code object containing `pc`
    pub fn lookup_by_pc(&self, pc: usize) -> Option<&Code> {
        let index = self.codes.partition_point(|code| code.entry_point <= pc);
        let code = self.codes.get(index.checked_sub(1)?)?;
        code.contains(pc).then_some(code)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Code> {
        self.codes.iter()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

impl Default for CodeTable {
    fn default() -> Self {
        Self::new()
    }
}
