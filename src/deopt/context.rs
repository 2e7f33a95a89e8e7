//! State of one in-flight deoptimization

use super::info::{DeoptInfo, DeoptInstr};
use super::DeoptReason;
use crate::gc::ObjectId;
use crate::runtime::{CodeId, FunctionId, Value, Word};
use std::rc::Rc;

/// Register contents saved by the deoptimization stub
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SavedRegisters {
    pub cpu: Vec<Word>,
    pub fpu: Vec<f64>,
}

impl SavedRegisters {
    pub fn new(cpu: Vec<Word>, fpu: Vec<f64>) -> Self {
        Self { cpu, fpu }
    }
}

/// A destination slot value that is only available after reading the
/// captured state
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum SlotValue {
    Ready(Word),
    Mint(i64),
    Double(f64),
    Object(usize),
}

/// A destination slot whose value still has to be allocated
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DeferredSlot {
    /// Destination frame, counted from the outermost rebuilt frame
    pub frame: usize,
    pub slot: usize,
    pub instr: DeoptInstr,
}

/// Holds everything the optimized frame contained once its storage is
/// reused for the baseline frames. Lives from frame capture until
/// materialization finishes.
#[derive(Debug)]
pub struct DeoptContext {
    pub(crate) code: CodeId,
    pub(crate) function: FunctionId,
    pub(crate) frame_index: usize,
    pub(crate) pc: usize,
    pub(crate) reason: DeoptReason,
    pub(crate) info: Rc<DeoptInfo>,
    /// Copy of the optimized frame's slots
    scratch: Vec<Word>,
    registers: SavedRegisters,
    /// Copy of the optimized code's object pool, which stops being traced
    /// once the code is dead
    constants: Vec<Value>,
    pub(crate) deferred: Vec<DeferredSlot>,
    pub(crate) resume_pc: Option<usize>,
}

impl DeoptContext {
    pub(crate) fn new(
        code: CodeId,
        function: FunctionId,
        frame_index: usize,
        pc: usize,
        reason: DeoptReason,
        info: Rc<DeoptInfo>,
        scratch: Vec<Word>,
        registers: SavedRegisters,
        constants: Vec<Value>,
    ) -> Self {
        Self {
            code,
            function,
            frame_index,
            pc,
            reason,
            info,
            scratch,
            registers,
            constants,
            deferred: Vec::new(),
            resume_pc: None,
        }
    }

    /// Slots needed by all destination frames
    pub fn dest_size(&self) -> usize {
        self.info.dest_size()
    }

    pub fn source_size(&self) -> usize {
        self.scratch.len()
    }

    pub fn reason(&self) -> DeoptReason {
        self.reason
    }

    /// Faulting address in the optimized code
    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    fn cpu(&self, register: usize) -> Result<Word, String> {
        self.registers
            .cpu
            .get(register)
            .copied()
            .ok_or_else(|| format!("cpu register {} was not saved", register))
    }

    fn fpu(&self, register: usize) -> Result<f64, String> {
        self.registers
            .fpu
            .get(register)
            .copied()
            .ok_or_else(|| format!("fpu register {} was not saved", register))
    }

    fn slot(&self, index: usize) -> Result<Word, String> {
        self.scratch
            .get(index)
            .copied()
            .ok_or_else(|| format!("slot {} outside the {}-slot optimized frame", index, self.scratch.len()))
    }

    fn int64(word: Word) -> Result<i64, String> {
        match word {
            Word::Int(n) => Ok(n),
            Word::Tagged(Value::Smi(n)) => Ok(n),
            other => Err(format!("expected an unboxed integer, found {:?}", other)),
        }
    }

    fn double(word: Word) -> Result<f64, String> {
        match word {
            Word::Float(d) => Ok(d),
            other => Err(format!("expected an unboxed double, found {:?}", other)),
        }
    }

    /// Read the value `instr` describes from the captured state
    pub(crate) fn read(&self, instr: DeoptInstr) -> Result<SlotValue, String> {
        Ok(match instr {
            DeoptInstr::Constant(index) => {
                let value = self
                    .constants
                    .get(index)
                    .copied()
                    .ok_or_else(|| format!("object pool has no entry {}", index))?;
                SlotValue::Ready(Word::Tagged(value))
            }
            DeoptInstr::CpuRegister(register) => SlotValue::Ready(self.cpu(register)?),
            DeoptInstr::StackSlot(index) => SlotValue::Ready(self.slot(index)?),
            DeoptInstr::Int64Register(register) => Self::integer(Self::int64(self.cpu(register)?)?),
            DeoptInstr::Int64StackSlot(index) => Self::integer(Self::int64(self.slot(index)?)?),
            DeoptInstr::DoubleFpuRegister(register) => SlotValue::Double(self.fpu(register)?),
            DeoptInstr::DoubleStackSlot(index) => SlotValue::Double(Self::double(self.slot(index)?)?),
            DeoptInstr::MaterializedObject(index) => {
                if index >= self.info.objects.len() {
                    return Err(format!("no materialized object {}", index));
                }
                SlotValue::Object(index)
            }
        })
    }

    fn integer(value: i64) -> SlotValue {
        if Value::is_smi_value(value) {
            SlotValue::Ready(Word::Tagged(Value::Smi(value)))
        } else {
            SlotValue::Mint(value)
        }
    }

    /// Heap references only the context still holds
    pub fn roots(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.scratch
            .iter()
            .chain(self.registers.cpu.iter())
            .filter_map(Word::as_object)
            .chain(self.constants.iter().filter_map(Value::as_object))
    }
}
