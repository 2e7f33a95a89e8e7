//! Deopt metadata emitted by the optimizing compiler
//!
//! For every program point where optimized code speculates, the compiler
//! records how to rebuild the baseline frames that would be live at that
//! point. One [`DeoptInfo`] describes all of them: the optimized function's
//! own frame plus one frame per inlined callee.

use crate::runtime::{ClassId, DeoptId, FunctionId};

/// Where the value of one destination slot comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptInstr {
    /// Entry of the optimized code's object pool
    Constant(usize),
    /// Tagged value held in a CPU register
    CpuRegister(usize),
    /// Tagged value in a slot of the optimized frame
    StackSlot(usize),
    /// Unboxed integer in a CPU register
    Int64Register(usize),
    /// Unboxed integer in a slot of the optimized frame
    Int64StackSlot(usize),
    /// Unboxed double in an FPU register
    DoubleFpuRegister(usize),
    /// Unboxed double in a slot of the optimized frame
    DoubleStackSlot(usize),
    /// Instance whose allocation was elided, by index into
    /// [`DeoptInfo::objects`]
    MaterializedObject(usize),
}

impl DeoptInstr {
    /// Whether the value only exists after a heap allocation
    pub fn is_deferred(&self) -> bool {
        matches!(
            self,
            DeoptInstr::Int64Register(_)
                | DeoptInstr::Int64StackSlot(_)
                | DeoptInstr::DoubleFpuRegister(_)
                | DeoptInstr::DoubleStackSlot(_)
                | DeoptInstr::MaterializedObject(_)
        )
    }
}

/// An instance the optimized code kept in registers and slots instead of
/// allocating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDesc {
    pub class: ClassId,
    pub fields: Vec<DeoptInstr>,
}

/// One baseline frame to rebuild
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeoptFrameDesc {
    pub function: FunctionId,
    /// Program point the frame resumes at in baseline code
    pub deopt_id: DeoptId,
    pub slots: Vec<DeoptInstr>,
}

/// Deopt metadata for one program point
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeoptInfo {
    /// Frames to rebuild, outermost first. The last one is the innermost
    /// inlined callee and is where execution resumes.
    pub frames: Vec<DeoptFrameDesc>,
    pub objects: Vec<ObjectDesc>,
}

impl DeoptInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame(mut self, function: FunctionId, deopt_id: DeoptId, slots: Vec<DeoptInstr>) -> Self {
        self.frames.push(DeoptFrameDesc {
            function,
            deopt_id,
            slots,
        });
        self
    }

    pub fn with_object(mut self, class: ClassId, fields: Vec<DeoptInstr>) -> Self {
        self.objects.push(ObjectDesc { class, fields });
        self
    }

    /// Slots of all destination frames together
    pub fn dest_size(&self) -> usize {
        self.frames.iter().map(|frame| frame.slots.len()).sum()
    }
}
