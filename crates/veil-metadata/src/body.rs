//! Method bodies
//!
//! Instructions carry a stable [`InstrId`]. Branch operands name their target
//! by id rather than by position or byte offset, so instructions can be
//! inserted anywhere without patching branches.

use crate::encoder::{DecodeError, ImageReader, ImageWriter};
use crate::module::{FieldRef, MethodRef};
use crate::opcode::{Opcode, OperandKind};
use crate::types::TypeSignature;
use std::ops::Index;

/// Stable identity of an instruction within its body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

/// Instruction operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    /// Local variable slot
    Local(u16),
    /// Argument slot (`this` is slot 0 for instance methods)
    Arg(u16),
    /// Branch target
    Label(InstrId),
    Method(MethodRef),
    Field(FieldRef),
    Type(TypeSignature),
}

/// A single instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: InstrId,
    pub opcode: Opcode,
    pub operand: Operand,
}

impl Instruction {
    /// Local slot accessed by a load, store or address-of instruction
    pub fn local_index(&self) -> Option<u16> {
        if let Some(index) = self.opcode.implicit_local() {
            return Some(index);
        }
        match (&self.operand, self.opcode.operand_kind()) {
            (Operand::Local(index), OperandKind::Local | OperandKind::ShortLocal) => Some(*index),
            _ => None,
        }
    }

    /// Argument slot accessed by a load, store or address-of instruction
    pub fn arg_index(&self) -> Option<u16> {
        if let Some(index) = self.opcode.implicit_arg() {
            return Some(index);
        }
        match (&self.operand, self.opcode.operand_kind()) {
            (Operand::Arg(index), OperandKind::Arg | OperandKind::ShortArg) => Some(*index),
            _ => None,
        }
    }

    /// Constant pushed by an `ldc.i4` family instruction
    pub fn i4_constant(&self) -> Option<i32> {
        if let Some(value) = self.opcode.implicit_i4() {
            return Some(value);
        }
        match (&self.operand, self.opcode) {
            (Operand::I32(value), Opcode::LdcI4 | Opcode::LdcI4S) => Some(*value),
            _ => None,
        }
    }

    fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_u32(self.id.0);
        writer.emit_u16(self.opcode.to_u16());
        match &self.operand {
            Operand::None => {}
            Operand::I32(v) => writer.emit_i32(*v),
            Operand::I64(v) => writer.emit_i64(*v),
            Operand::F32(v) => writer.emit_f32(*v),
            Operand::F64(v) => writer.emit_f64(*v),
            Operand::String(s) => writer.emit_string(s),
            Operand::Local(i) | Operand::Arg(i) => writer.emit_u16(*i),
            Operand::Label(target) => writer.emit_u32(target.0),
            Operand::Method(m) => m.encode(writer),
            Operand::Field(f) => f.encode(writer),
            Operand::Type(t) => t.encode(writer),
        }
    }

    fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let id = InstrId(reader.read_u32()?);
        let offset = reader.position();
        let raw = reader.read_u16()?;
        let opcode = Opcode::from_u16(raw).ok_or(DecodeError::InvalidOpcode(raw, offset))?;
        let operand = match opcode.operand_kind() {
            OperandKind::None => Operand::None,
            OperandKind::ShortLocal | OperandKind::Local => Operand::Local(reader.read_u16()?),
            OperandKind::ShortArg | OperandKind::Arg => Operand::Arg(reader.read_u16()?),
            OperandKind::ShortI4 | OperandKind::I4 => Operand::I32(reader.read_i32()?),
            OperandKind::I8 => Operand::I64(reader.read_i64()?),
            OperandKind::R4 => Operand::F32(reader.read_f32()?),
            OperandKind::R8 => Operand::F64(reader.read_f64()?),
            OperandKind::String => Operand::String(reader.read_string()?),
            OperandKind::Method => Operand::Method(MethodRef::decode(reader)?),
            OperandKind::Field => Operand::Field(FieldRef::decode(reader)?),
            OperandKind::Type => Operand::Type(TypeSignature::decode(reader)?),
            OperandKind::Label => Operand::Label(InstrId(reader.read_u32()?)),
        };
        Ok(Self {
            id,
            opcode,
            operand,
        })
    }
}

/// Ordered instruction stream with id allocation
#[derive(Debug, Clone, Default)]
pub struct InstructionList {
    instructions: Vec<Instruction>,
    next_id: u32,
}

impl InstructionList {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&mut self) -> InstrId {
        let id = InstrId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Append an instruction and return its id
    pub fn push(&mut self, opcode: Opcode, operand: Operand) -> InstrId {
        let id = self.fresh_id();
        self.instructions.push(Instruction {
            id,
            opcode,
            operand,
        });
        id
    }

    /// Insert an instruction directly after `index`
    pub fn insert_after(&mut self, index: usize, opcode: Opcode, operand: Operand) -> InstrId {
        let id = self.fresh_id();
        self.instructions.insert(
            index + 1,
            Instruction {
                id,
                opcode,
                operand,
            },
        );
        id
    }

    /// Insert an instruction at `index` with a fresh id. Branches keep their
    /// targets, so the new instruction is only reached by falling through.
    pub fn insert(&mut self, index: usize, opcode: Opcode, operand: Operand) -> InstrId {
        let id = self.fresh_id();
        self.instructions.insert(
            index,
            Instruction {
                id,
                opcode,
                operand,
            },
        );
        id
    }

    /// Insert an instruction directly before `index`
    ///
    /// The inserted instruction takes over the id of the instruction it
    /// precedes, which receives a fresh id. Branches that targeted the old
    /// instruction therefore land on the inserted one and still execute both.
    pub fn insert_before(&mut self, index: usize, opcode: Opcode, operand: Operand) -> InstrId {
        let fresh = self.fresh_id();
        let inherited = std::mem::replace(&mut self.instructions[index].id, fresh);
        self.instructions.insert(
            index,
            Instruction {
                id: inherited,
                opcode,
                operand,
            },
        );
        inherited
    }

    /// Position of the instruction with the given id
    pub fn position_of(&self, id: InstrId) -> Option<usize> {
        self.instructions.iter().position(|i| i.id == id)
    }

    /// Replace the operand of the instruction with id `id`, typically to
    /// resolve a forward branch once its target has been emitted
    pub fn patch(&mut self, id: InstrId, operand: Operand) -> bool {
        match self.position_of(id) {
            Some(index) => {
                self.instructions[index].operand = operand;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Instruction> {
        self.instructions.iter()
    }

    pub fn as_slice(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Rewrite every short ("macro") form into its general form
    pub fn expand_macros(&mut self) {
        for instr in &mut self.instructions {
            let expanded = match instr.opcode {
                op if op.implicit_local().is_some() || op == Opcode::LdlocS || op == Opcode::StlocS => {
                    let index = instr.local_index();
                    let long = if op.is_ldloc() { Opcode::Ldloc } else { Opcode::Stloc };
                    index.map(|i| (long, Operand::Local(i)))
                }
                Opcode::LdlocaS => Some((Opcode::Ldloca, instr.operand.clone())),
                op if op.implicit_arg().is_some() || op == Opcode::LdargS => {
                    instr.arg_index().map(|i| (Opcode::Ldarg, Operand::Arg(i)))
                }
                Opcode::LdargaS => Some((Opcode::Ldarga, instr.operand.clone())),
                Opcode::StargS => Some((Opcode::Starg, instr.operand.clone())),
                op if op.implicit_i4().is_some() || op == Opcode::LdcI4S => {
                    instr.i4_constant().map(|v| (Opcode::LdcI4, Operand::I32(v)))
                }
                Opcode::BrS => Some((Opcode::Br, instr.operand.clone())),
                Opcode::BrfalseS => Some((Opcode::Brfalse, instr.operand.clone())),
                Opcode::BrtrueS => Some((Opcode::Brtrue, instr.operand.clone())),
                _ => None,
            };
            if let Some((opcode, operand)) = expanded {
                instr.opcode = opcode;
                instr.operand = operand;
            }
        }
    }

    /// Rewrite general forms of local, argument and constant instructions into
    /// their shortest encoding. Branches keep their long form.
    pub fn optimize_macros(&mut self) {
        for instr in &mut self.instructions {
            let optimized = match (instr.opcode, &instr.operand) {
                (Opcode::Ldloc, Operand::Local(i)) => Some(short_local(
                    *i,
                    [Opcode::Ldloc0, Opcode::Ldloc1, Opcode::Ldloc2, Opcode::Ldloc3],
                    Opcode::LdlocS,
                )),
                (Opcode::Stloc, Operand::Local(i)) => Some(short_local(
                    *i,
                    [Opcode::Stloc0, Opcode::Stloc1, Opcode::Stloc2, Opcode::Stloc3],
                    Opcode::StlocS,
                )),
                (Opcode::Ldloca, Operand::Local(i)) if *i <= u8::MAX as u16 => {
                    Some((Opcode::LdlocaS, Operand::Local(*i)))
                }
                (Opcode::Ldarg, Operand::Arg(i)) => Some(match *i {
                    0 => (Opcode::Ldarg0, Operand::None),
                    1 => (Opcode::Ldarg1, Operand::None),
                    2 => (Opcode::Ldarg2, Operand::None),
                    3 => (Opcode::Ldarg3, Operand::None),
                    i if i <= u8::MAX as u16 => (Opcode::LdargS, Operand::Arg(i)),
                    i => (Opcode::Ldarg, Operand::Arg(i)),
                }),
                (Opcode::Ldarga, Operand::Arg(i)) if *i <= u8::MAX as u16 => {
                    Some((Opcode::LdargaS, Operand::Arg(*i)))
                }
                (Opcode::Starg, Operand::Arg(i)) if *i <= u8::MAX as u16 => {
                    Some((Opcode::StargS, Operand::Arg(*i)))
                }
                (Opcode::LdcI4, Operand::I32(v)) => Some(match *v {
                    -1 => (Opcode::LdcI4M1, Operand::None),
                    0 => (Opcode::LdcI4_0, Operand::None),
                    1 => (Opcode::LdcI4_1, Operand::None),
                    2 => (Opcode::LdcI4_2, Operand::None),
                    3 => (Opcode::LdcI4_3, Operand::None),
                    4 => (Opcode::LdcI4_4, Operand::None),
                    5 => (Opcode::LdcI4_5, Operand::None),
                    6 => (Opcode::LdcI4_6, Operand::None),
                    7 => (Opcode::LdcI4_7, Operand::None),
                    8 => (Opcode::LdcI4_8, Operand::None),
                    v if i8::try_from(v).is_ok() => (Opcode::LdcI4S, Operand::I32(v)),
                    v => (Opcode::LdcI4, Operand::I32(v)),
                }),
                _ => None,
            };
            if let Some((opcode, operand)) = optimized {
                instr.opcode = opcode;
                instr.operand = operand;
            }
        }
    }
}

fn short_local(index: u16, implicit: [Opcode; 4], short: Opcode) -> (Opcode, Operand) {
    match index {
        0..=3 => (implicit[index as usize], Operand::None),
        i if i <= u8::MAX as u16 => (short, Operand::Local(i)),
        i if short == Opcode::LdlocS => (Opcode::Ldloc, Operand::Local(i)),
        i => (Opcode::Stloc, Operand::Local(i)),
    }
}

impl Index<usize> for InstructionList {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Instruction {
        &self.instructions[index]
    }
}

impl<'a> IntoIterator for &'a InstructionList {
    type Item = &'a Instruction;
    type IntoIter = std::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.instructions.iter()
    }
}

/// Local variable declaration; the slot index is its position in the table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalVariable {
    pub ty: TypeSignature,
}

/// Method body
#[derive(Debug, Clone)]
pub struct MethodBody {
    pub init_locals: bool,
    pub max_stack: u16,
    pub locals: Vec<LocalVariable>,
    pub instructions: InstructionList,
}

impl Default for MethodBody {
    fn default() -> Self {
        Self {
            init_locals: true,
            max_stack: 8,
            locals: Vec::new(),
            instructions: InstructionList::new(),
        }
    }
}

impl MethodBody {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a new local and return its slot
    pub fn add_local(&mut self, ty: TypeSignature) -> u16 {
        self.locals.push(LocalVariable { ty });
        (self.locals.len() - 1) as u16
    }

    /// Append an instruction
    pub fn emit(&mut self, opcode: Opcode, operand: Operand) -> InstrId {
        self.instructions.push(opcode, operand)
    }

    /// Append an instruction without an operand
    pub fn emit_op(&mut self, opcode: Opcode) -> InstrId {
        self.instructions.push(opcode, Operand::None)
    }

    pub(crate) fn encode(&self, writer: &mut ImageWriter) {
        writer.emit_bool(self.init_locals);
        writer.emit_u16(self.max_stack);
        writer.emit_u32(self.locals.len() as u32);
        for local in &self.locals {
            local.ty.encode(writer);
        }
        writer.emit_u32(self.instructions.next_id);
        writer.emit_u32(self.instructions.len() as u32);
        for instr in &self.instructions {
            instr.encode(writer);
        }
    }

    pub(crate) fn decode(reader: &mut ImageReader<'_>) -> Result<Self, DecodeError> {
        let init_locals = reader.read_bool()?;
        let max_stack = reader.read_u16()?;
        let local_count = reader.read_count()?;
        let mut locals = Vec::with_capacity(local_count);
        for _ in 0..local_count {
            locals.push(LocalVariable {
                ty: TypeSignature::decode(reader)?,
            });
        }
        let next_id = reader.read_u32()?;
        let count = reader.read_count()?;
        let mut instructions = Vec::with_capacity(count);
        for _ in 0..count {
            instructions.push(Instruction::decode(reader)?);
        }
        Ok(Self {
            init_locals,
            max_stack,
            locals,
            instructions: InstructionList {
                instructions,
                next_id,
            },
        })
    }
}
