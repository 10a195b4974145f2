//! CIL opcodes
//!
//! This module defines the subset of the CIL instruction set that method bodies
//! in a veil image may contain. Opcode values match their ECMA-335 encoding;
//! two-byte opcodes carry the `0xFE` prefix in their high byte.

/// CIL opcode enumeration
///
/// Short ("macro") forms such as `ldloc.0` or `ldc.i4.s` are kept distinct from
/// their long forms so that bodies can be expanded before rewriting and
/// compacted again afterwards.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Base instructions =====
    /// No operation
    Nop = 0x00,

    /// Load argument 0
    Ldarg0 = 0x02,
    /// Load argument 1
    Ldarg1 = 0x03,
    /// Load argument 2
    Ldarg2 = 0x04,
    /// Load argument 3
    Ldarg3 = 0x05,

    /// Load local 0
    Ldloc0 = 0x06,
    /// Load local 1
    Ldloc1 = 0x07,
    /// Load local 2
    Ldloc2 = 0x08,
    /// Load local 3
    Ldloc3 = 0x09,

    /// Store to local 0
    Stloc0 = 0x0A,
    /// Store to local 1
    Stloc1 = 0x0B,
    /// Store to local 2
    Stloc2 = 0x0C,
    /// Store to local 3
    Stloc3 = 0x0D,

    /// Load argument (operand: u8 index)
    LdargS = 0x0E,
    /// Load argument address (operand: u8 index)
    LdargaS = 0x0F,
    /// Store argument (operand: u8 index)
    StargS = 0x10,
    /// Load local (operand: u8 index)
    LdlocS = 0x11,
    /// Load local address (operand: u8 index)
    LdlocaS = 0x12,
    /// Store local (operand: u8 index)
    StlocS = 0x13,

    /// Push null reference
    Ldnull = 0x14,
    /// Push -1
    LdcI4M1 = 0x15,
    /// Push 0
    LdcI4_0 = 0x16,
    /// Push 1
    LdcI4_1 = 0x17,
    /// Push 2
    LdcI4_2 = 0x18,
    /// Push 3
    LdcI4_3 = 0x19,
    /// Push 4
    LdcI4_4 = 0x1A,
    /// Push 5
    LdcI4_5 = 0x1B,
    /// Push 6
    LdcI4_6 = 0x1C,
    /// Push 7
    LdcI4_7 = 0x1D,
    /// Push 8
    LdcI4_8 = 0x1E,
    /// Push int32 (operand: i8)
    LdcI4S = 0x1F,
    /// Push int32 (operand: i32)
    LdcI4 = 0x20,
    /// Push int64 (operand: i64)
    LdcI8 = 0x21,
    /// Push float32 (operand: f32)
    LdcR4 = 0x22,
    /// Push float64 (operand: f64)
    LdcR8 = 0x23,

    /// Duplicate top of stack
    Dup = 0x25,
    /// Pop top of stack
    Pop = 0x26,
    /// Call method (operand: method)
    Call = 0x28,
    /// Return from method
    Ret = 0x2A,

    /// Unconditional short branch (operand: label)
    BrS = 0x2B,
    /// Branch if false, short form (operand: label)
    BrfalseS = 0x2C,
    /// Branch if true, short form (operand: label)
    BrtrueS = 0x2D,
    /// Unconditional branch (operand: label)
    Br = 0x38,
    /// Branch if false (operand: label)
    Brfalse = 0x39,
    /// Branch if true (operand: label)
    Brtrue = 0x3A,
    /// Branch if equal (operand: label)
    Beq = 0x3B,
    /// Branch if greater or equal (operand: label)
    Bge = 0x3C,
    /// Branch if greater (operand: label)
    Bgt = 0x3D,
    /// Branch if less or equal (operand: label)
    Ble = 0x3E,
    /// Branch if less (operand: label)
    Blt = 0x3F,

    /// Add
    Add = 0x58,
    /// Subtract
    Sub = 0x59,
    /// Multiply
    Mul = 0x5A,
    /// Convert to native int
    ConvI = 0xD3,
    /// Convert to unsigned native int
    ConvU = 0xE0,

    // ===== Object model instructions =====
    /// Call virtual method (operand: method)
    Callvirt = 0x6F,
    /// Push string literal (operand: string)
    Ldstr = 0x72,
    /// Allocate object and call constructor (operand: method)
    Newobj = 0x73,
    /// Cast to class (operand: type)
    Castclass = 0x74,
    /// Type test (operand: type)
    Isinst = 0x75,
    /// Throw exception
    Throw = 0x7A,
    /// Load instance field (operand: field)
    Ldfld = 0x7B,
    /// Load instance field address (operand: field)
    Ldflda = 0x7C,
    /// Store instance field (operand: field)
    Stfld = 0x7D,
    /// Load static field (operand: field)
    Ldsfld = 0x7E,
    /// Store static field (operand: field)
    Stsfld = 0x80,
    /// Box value type (operand: type)
    Box = 0x8C,
    /// Create one-dimensional array (operand: type)
    Newarr = 0x8D,
    /// Load array length
    Ldlen = 0x8E,
    /// Load array element (operand: type)
    Ldelem = 0xA3,
    /// Store array element (operand: type)
    Stelem = 0xA4,
    /// Unbox to value (operand: type)
    UnboxAny = 0xA5,

    // ===== Two-byte instructions (0xFE prefix) =====
    /// Compare equal
    Ceq = 0xFE01,
    /// Compare greater than
    Cgt = 0xFE02,
    /// Compare less than
    Clt = 0xFE04,
    /// Load method pointer (operand: method)
    Ldftn = 0xFE06,
    /// Load argument (operand: u16 index)
    Ldarg = 0xFE09,
    /// Load argument address (operand: u16 index)
    Ldarga = 0xFE0A,
    /// Store argument (operand: u16 index)
    Starg = 0xFE0B,
    /// Load local (operand: u16 index)
    Ldloc = 0xFE0C,
    /// Load local address (operand: u16 index)
    Ldloca = 0xFE0D,
    /// Store local (operand: u16 index)
    Stloc = 0xFE0E,
    /// Initialize value type at address (operand: type)
    Initobj = 0xFE15,
}

/// Kind of operand an opcode expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Local index that fits in one byte
    ShortLocal,
    /// Local index
    Local,
    /// Argument index that fits in one byte
    ShortArg,
    /// Argument index
    Arg,
    /// 8-bit integer constant
    ShortI4,
    /// 32-bit integer constant
    I4,
    /// 64-bit integer constant
    I8,
    /// 32-bit float constant
    R4,
    /// 64-bit float constant
    R8,
    /// String literal
    String,
    /// Method reference
    Method,
    /// Field reference
    Field,
    /// Type signature
    Type,
    /// Branch target
    Label,
}

impl Opcode {
    /// Every opcode known to the image format
    pub const ALL: &'static [Opcode] = &[
        Self::Nop,
        Self::Ldarg0,
        Self::Ldarg1,
        Self::Ldarg2,
        Self::Ldarg3,
        Self::Ldloc0,
        Self::Ldloc1,
        Self::Ldloc2,
        Self::Ldloc3,
        Self::Stloc0,
        Self::Stloc1,
        Self::Stloc2,
        Self::Stloc3,
        Self::LdargS,
        Self::LdargaS,
        Self::StargS,
        Self::LdlocS,
        Self::LdlocaS,
        Self::StlocS,
        Self::Ldnull,
        Self::LdcI4M1,
        Self::LdcI4_0,
        Self::LdcI4_1,
        Self::LdcI4_2,
        Self::LdcI4_3,
        Self::LdcI4_4,
        Self::LdcI4_5,
        Self::LdcI4_6,
        Self::LdcI4_7,
        Self::LdcI4_8,
        Self::LdcI4S,
        Self::LdcI4,
        Self::LdcI8,
        Self::LdcR4,
        Self::LdcR8,
        Self::Dup,
        Self::Pop,
        Self::Call,
        Self::Ret,
        Self::BrS,
        Self::BrfalseS,
        Self::BrtrueS,
        Self::Br,
        Self::Brfalse,
        Self::Brtrue,
        Self::Beq,
        Self::Bge,
        Self::Bgt,
        Self::Ble,
        Self::Blt,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::ConvI,
        Self::ConvU,
        Self::Callvirt,
        Self::Ldstr,
        Self::Newobj,
        Self::Castclass,
        Self::Isinst,
        Self::Throw,
        Self::Ldfld,
        Self::Ldflda,
        Self::Stfld,
        Self::Ldsfld,
        Self::Stsfld,
        Self::Box,
        Self::Newarr,
        Self::Ldlen,
        Self::Ldelem,
        Self::Stelem,
        Self::UnboxAny,
        Self::Ceq,
        Self::Cgt,
        Self::Clt,
        Self::Ldftn,
        Self::Ldarg,
        Self::Ldarga,
        Self::Starg,
        Self::Ldloc,
        Self::Ldloca,
        Self::Stloc,
        Self::Initobj,
    ];

    /// Convert an encoded value to an opcode
    ///
    /// Returns None if the value does not correspond to a known opcode.
    pub fn from_u16(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.to_u16() == value)
    }

    /// Convert opcode to its encoded value
    #[inline]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Get the assembler mnemonic of the opcode
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Ldarg0 => "ldarg.0",
            Self::Ldarg1 => "ldarg.1",
            Self::Ldarg2 => "ldarg.2",
            Self::Ldarg3 => "ldarg.3",
            Self::Ldloc0 => "ldloc.0",
            Self::Ldloc1 => "ldloc.1",
            Self::Ldloc2 => "ldloc.2",
            Self::Ldloc3 => "ldloc.3",
            Self::Stloc0 => "stloc.0",
            Self::Stloc1 => "stloc.1",
            Self::Stloc2 => "stloc.2",
            Self::Stloc3 => "stloc.3",
            Self::LdargS => "ldarg.s",
            Self::LdargaS => "ldarga.s",
            Self::StargS => "starg.s",
            Self::LdlocS => "ldloc.s",
            Self::LdlocaS => "ldloca.s",
            Self::StlocS => "stloc.s",
            Self::Ldnull => "ldnull",
            Self::LdcI4M1 => "ldc.i4.m1",
            Self::LdcI4_0 => "ldc.i4.0",
            Self::LdcI4_1 => "ldc.i4.1",
            Self::LdcI4_2 => "ldc.i4.2",
            Self::LdcI4_3 => "ldc.i4.3",
            Self::LdcI4_4 => "ldc.i4.4",
            Self::LdcI4_5 => "ldc.i4.5",
            Self::LdcI4_6 => "ldc.i4.6",
            Self::LdcI4_7 => "ldc.i4.7",
            Self::LdcI4_8 => "ldc.i4.8",
            Self::LdcI4S => "ldc.i4.s",
            Self::LdcI4 => "ldc.i4",
            Self::LdcI8 => "ldc.i8",
            Self::LdcR4 => "ldc.r4",
            Self::LdcR8 => "ldc.r8",
            Self::Dup => "dup",
            Self::Pop => "pop",
            Self::Call => "call",
            Self::Ret => "ret",
            Self::BrS => "br.s",
            Self::BrfalseS => "brfalse.s",
            Self::BrtrueS => "brtrue.s",
            Self::Br => "br",
            Self::Brfalse => "brfalse",
            Self::Brtrue => "brtrue",
            Self::Beq => "beq",
            Self::Bge => "bge",
            Self::Bgt => "bgt",
            Self::Ble => "ble",
            Self::Blt => "blt",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::ConvI => "conv.i",
            Self::ConvU => "conv.u",
            Self::Callvirt => "callvirt",
            Self::Ldstr => "ldstr",
            Self::Newobj => "newobj",
            Self::Castclass => "castclass",
            Self::Isinst => "isinst",
            Self::Throw => "throw",
            Self::Ldfld => "ldfld",
            Self::Ldflda => "ldflda",
            Self::Stfld => "stfld",
            Self::Ldsfld => "ldsfld",
            Self::Stsfld => "stsfld",
            Self::Box => "box",
            Self::Newarr => "newarr",
            Self::Ldlen => "ldlen",
            Self::Ldelem => "ldelem",
            Self::Stelem => "stelem",
            Self::UnboxAny => "unbox.any",
            Self::Ceq => "ceq",
            Self::Cgt => "cgt",
            Self::Clt => "clt",
            Self::Ldftn => "ldftn",
            Self::Ldarg => "ldarg",
            Self::Ldarga => "ldarga",
            Self::Starg => "starg",
            Self::Ldloc => "ldloc",
            Self::Ldloca => "ldloca",
            Self::Stloc => "stloc",
            Self::Initobj => "initobj",
        }
    }

    /// Get the operand kind this opcode expects
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Self::LdlocS | Self::LdlocaS | Self::StlocS => OperandKind::ShortLocal,
            Self::Ldloc | Self::Ldloca | Self::Stloc => OperandKind::Local,
            Self::LdargS | Self::LdargaS | Self::StargS => OperandKind::ShortArg,
            Self::Ldarg | Self::Ldarga | Self::Starg => OperandKind::Arg,
            Self::LdcI4S => OperandKind::ShortI4,
            Self::LdcI4 => OperandKind::I4,
            Self::LdcI8 => OperandKind::I8,
            Self::LdcR4 => OperandKind::R4,
            Self::LdcR8 => OperandKind::R8,
            Self::Ldstr => OperandKind::String,
            Self::Call | Self::Callvirt | Self::Newobj | Self::Ldftn => OperandKind::Method,
            Self::Ldfld | Self::Ldflda | Self::Stfld | Self::Ldsfld | Self::Stsfld => {
                OperandKind::Field
            }
            Self::Castclass
            | Self::Isinst
            | Self::Box
            | Self::Newarr
            | Self::Ldelem
            | Self::Stelem
            | Self::UnboxAny
            | Self::Initobj => OperandKind::Type,
            Self::BrS
            | Self::BrfalseS
            | Self::BrtrueS
            | Self::Br
            | Self::Brfalse
            | Self::Brtrue
            | Self::Beq
            | Self::Bge
            | Self::Bgt
            | Self::Ble
            | Self::Blt => OperandKind::Label,
            _ => OperandKind::None,
        }
    }

    /// Check if this opcode transfers control to a label
    pub fn is_branch(self) -> bool {
        self.operand_kind() == OperandKind::Label
    }

    /// Check if this opcode invokes a method
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::Callvirt | Self::Newobj)
    }

    /// Check if control never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(self, Self::Ret | Self::Throw | Self::Br | Self::BrS)
    }

    /// Check if this opcode loads a local variable
    pub fn is_ldloc(self) -> bool {
        matches!(
            self,
            Self::Ldloc0 | Self::Ldloc1 | Self::Ldloc2 | Self::Ldloc3 | Self::LdlocS | Self::Ldloc
        )
    }

    /// Check if this opcode stores a local variable
    pub fn is_stloc(self) -> bool {
        matches!(
            self,
            Self::Stloc0 | Self::Stloc1 | Self::Stloc2 | Self::Stloc3 | Self::StlocS | Self::Stloc
        )
    }

    /// Check if this opcode takes the address of a local variable
    pub fn is_ldloca(self) -> bool {
        matches!(self, Self::LdlocaS | Self::Ldloca)
    }

    /// Check if this opcode loads an argument
    pub fn is_ldarg(self) -> bool {
        matches!(
            self,
            Self::Ldarg0 | Self::Ldarg1 | Self::Ldarg2 | Self::Ldarg3 | Self::LdargS | Self::Ldarg
        )
    }

    /// Local index implied by a macro opcode such as `ldloc.2`
    pub fn implicit_local(self) -> Option<u16> {
        match self {
            Self::Ldloc0 | Self::Stloc0 => Some(0),
            Self::Ldloc1 | Self::Stloc1 => Some(1),
            Self::Ldloc2 | Self::Stloc2 => Some(2),
            Self::Ldloc3 | Self::Stloc3 => Some(3),
            _ => None,
        }
    }

    /// Argument index implied by a macro opcode such as `ldarg.1`
    pub fn implicit_arg(self) -> Option<u16> {
        match self {
            Self::Ldarg0 => Some(0),
            Self::Ldarg1 => Some(1),
            Self::Ldarg2 => Some(2),
            Self::Ldarg3 => Some(3),
            _ => None,
        }
    }

    /// Constant implied by a macro opcode such as `ldc.i4.5`
    pub fn implicit_i4(self) -> Option<i32> {
        match self {
            Self::LdcI4M1 => Some(-1),
            Self::LdcI4_0 => Some(0),
            Self::LdcI4_1 => Some(1),
            Self::LdcI4_2 => Some(2),
            Self::LdcI4_3 => Some(3),
            Self::LdcI4_4 => Some(4),
            Self::LdcI4_5 => Some(5),
            Self::LdcI4_6 => Some(6),
            Self::LdcI4_7 => Some(7),
            Self::LdcI4_8 => Some(8),
            _ => None,
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
