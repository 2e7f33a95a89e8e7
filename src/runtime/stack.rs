//! Execution stack of generated-code frames

use super::Value;
use crate::gc::ObjectId;

/// A stack slot. Optimized code may keep numbers unboxed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Word {
    Tagged(Value),
    Int(i64),
    Float(f64),
}

impl Default for Word {
    fn default() -> Self {
        Word::Tagged(Value::Null)
    }
}

impl Word {
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Word::Tagged(value) => value.as_object(),
            _ => None,
        }
    }
}

impl From<Value> for Word {
    fn from(value: Value) -> Self {
        Word::Tagged(value)
    }
}

/// Slots every frame uses besides its own: return address and saved frame
/// pointer
pub const FRAME_HEADER_SLOTS: usize = 2;

/// A generated-code frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Address execution continues at in this frame
    pub pc: usize,
    /// Index of the first slot in the stack
    pub base: usize,
    /// Number of slots
    pub size: usize,
    /// Deoptimize this frame when control returns to it
    pub lazy_deopt: bool,
}

/// Frames are stored outermost first
#[derive(Debug, Clone)]
pub struct Stack {
    words: Vec<Word>,
    frames: Vec<Frame>,
    limit: usize,
}

impl Stack {
    /// Stack holding at most `limit` slots before it reports overflow
    pub fn new(limit: usize) -> Self {
        Self {
            words: Vec::new(),
            frames: Vec::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    /// Slots in use, frame headers included
    pub fn used(&self) -> usize {
        self.words.len() + self.frames.len() * FRAME_HEADER_SLOTS
    }

    /// Whether the stack grew past its limit
    pub fn is_overflowed(&self) -> bool {
        self.used() > self.limit
    }

    /// Push a frame with the given slots, returning its index
    pub fn push_frame(&mut self, pc: usize, slots: Vec<Word>) -> usize {
        let base = self.words.len();
        let size = slots.len();
        self.words.extend(slots);
        self.frames.push(Frame {
            pc,
            base,
            size,
            lazy_deopt: false,
        });
        self.frames.len() - 1
    }

    pub fn pop_frame(&mut self) -> Option<Frame> {
        let frame = self.frames.pop()?;
        self.words.truncate(frame.base);
        Some(frame)
    }

    /// Drop frames until `depth` remain
    pub fn truncate_frames(&mut self, depth: usize) {
        while self.frames.len() > depth {
            self.pop_frame();
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frame(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    pub fn frame_mut(&mut self, index: usize) -> Option<&mut Frame> {
        self.frames.get_mut(index)
    }

    pub fn top_index(&self) -> Option<usize> {
        self.frames.len().checked_sub(1)
    }

    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Frames, outermost first
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn slots(&self, index: usize) -> Option<&[Word]> {
        let frame = self.frames.get(index)?;
        self.words.get(frame.base..frame.base + frame.size)
    }

    pub fn slots_mut(&mut self, index: usize) -> Option<&mut [Word]> {
        let frame = self.frames.get(index)?;
        self.words.get_mut(frame.base..frame.base + frame.size)
    }

    /// All slots of all frames
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// Replace the frame at `index` with `replacement` frames (outermost
    /// first), moving every frame above it. Returns `false` if `index` is
    /// out of range.
    pub fn replace_frame(&mut self, index: usize, replacement: Vec<(usize, Vec<Word>)>) -> bool {
        let Some(old) = self.frames.get(index).copied() else {
            return false;
        };
        let new_size: usize = replacement.iter().map(|(_, slots)| slots.len()).sum();

        let mut new_frames = Vec::with_capacity(replacement.len());
        let mut new_words = Vec::with_capacity(new_size);
        let mut base = old.base;
        for (pc, slots) in replacement {
            new_frames.push(Frame {
                pc,
                base,
                size: slots.len(),
                lazy_deopt: false,
            });
            base += slots.len();
            new_words.extend(slots);
        }

        self.words.splice(old.base..old.base + old.size, new_words);
        let shift = new_size as isize - old.size as isize;
        for frame in &mut self.frames[index + 1..] {
            frame.base = (frame.base as isize + shift) as usize;
        }
        self.frames.splice(index..=index, new_frames);
        true
    }

    /// Heap references held in any slot
    pub fn roots(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.words.iter().filter_map(Word::as_object)
    }
}
