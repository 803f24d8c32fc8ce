//! Instruction set of the compiled program unit.
//!
//! Every instruction is one two-byte word `[opcode, arg]`. Opcodes below
//! [`HAVE_ARGUMENT`] ignore their argument byte. Arguments wider than a
//! byte are carried by up to [`MAX_EXTENDED_ARGS`] preceding
//! `EXTENDED_ARG` words, most significant byte first.
//!
//! Jumps come in two flavours:
//! - relative (`JUMP_FORWARD`, `FOR_ITER`, `SETUP_EXCEPT`): the target is
//!   the offset of the following instruction plus `arg`;
//! - absolute (`JUMP_ABSOLUTE`, `POP_JUMP_IF_*`, `JUMP_IF_*_OR_POP`): the
//!   target is `arg`.

/// Opcodes at or above this value use their argument.
pub const HAVE_ARGUMENT: u8 = 90;

/// Most `EXTENDED_ARG` prefixes one instruction may carry (32-bit arguments).
pub const MAX_EXTENDED_ARGS: usize = 3;

macro_rules! opcodes {
    ($($name:ident = $value:literal => $text:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $value,)*
        }

        impl Opcode {
            /// Decode a raw opcode byte.
            pub fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Mnemonic used by the disassembler.
            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$name => $text,)*
                }
            }
        }
    };
}

opcodes! {
    PopTop = 1 => "POP_TOP",
    RotTwo = 2 => "ROT_TWO",
    RotThree = 3 => "ROT_THREE",
    DupTop = 4 => "DUP_TOP",
    DupTopTwo = 5 => "DUP_TOP_TWO",
    Nop = 9 => "NOP",
    UnaryPositive = 10 => "UNARY_POSITIVE",
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    UnaryNot = 12 => "UNARY_NOT",
    BinaryPower = 19 => "BINARY_POWER",
    BinaryMultiply = 20 => "BINARY_MULTIPLY",
    BinaryModulo = 22 => "BINARY_MODULO",
    BinaryAdd = 23 => "BINARY_ADD",
    BinarySubtract = 24 => "BINARY_SUBTRACT",
    BinarySubscr = 25 => "BINARY_SUBSCR",
    BinaryFloorDivide = 26 => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide = 27 => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide = 28 => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide = 29 => "INPLACE_TRUE_DIVIDE",
    Reraise = 48 => "RERAISE",
    InplaceAdd = 55 => "INPLACE_ADD",
    InplaceSubtract = 56 => "INPLACE_SUBTRACT",
    InplaceMultiply = 57 => "INPLACE_MULTIPLY",
    InplaceModulo = 59 => "INPLACE_MODULO",
    StoreSubscr = 60 => "STORE_SUBSCR",
    DeleteSubscr = 61 => "DELETE_SUBSCR",
    GetIter = 68 => "GET_ITER",
    LoadAssertionError = 74 => "LOAD_ASSERTION_ERROR",
    ReturnValue = 83 => "RETURN_VALUE",
    PopBlock = 87 => "POP_BLOCK",
    PopExcept = 89 => "POP_EXCEPT",
    StoreName = 90 => "STORE_NAME",
    DeleteName = 91 => "DELETE_NAME",
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    ForIter = 93 => "FOR_ITER",
    StoreAttr = 95 => "STORE_ATTR",
    DeleteAttr = 96 => "DELETE_ATTR",
    StoreGlobal = 97 => "STORE_GLOBAL",
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    LoadConst = 100 => "LOAD_CONST",
    LoadName = 101 => "LOAD_NAME",
    BuildTuple = 102 => "BUILD_TUPLE",
    BuildList = 103 => "BUILD_LIST",
    BuildSet = 104 => "BUILD_SET",
    BuildMap = 105 => "BUILD_MAP",
    LoadAttr = 106 => "LOAD_ATTR",
    CompareOp = 107 => "COMPARE_OP",
    ImportName = 108 => "IMPORT_NAME",
    ImportFrom = 109 => "IMPORT_FROM",
    JumpForward = 110 => "JUMP_FORWARD",
    JumpIfFalseOrPop = 111 => "JUMP_IF_FALSE_OR_POP",
    JumpIfTrueOrPop = 112 => "JUMP_IF_TRUE_OR_POP",
    JumpAbsolute = 113 => "JUMP_ABSOLUTE",
    PopJumpIfFalse = 114 => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue = 115 => "POP_JUMP_IF_TRUE",
    LoadGlobal = 116 => "LOAD_GLOBAL",
    SetupExcept = 121 => "SETUP_EXCEPT",
    LoadFast = 124 => "LOAD_FAST",
    StoreFast = 125 => "STORE_FAST",
    DeleteFast = 126 => "DELETE_FAST",
    RaiseVarargs = 130 => "RAISE_VARARGS",
    CallFunction = 131 => "CALL_FUNCTION",
    MakeFunction = 132 => "MAKE_FUNCTION",
    BuildSlice = 133 => "BUILD_SLICE",
    ExtendedArg = 144 => "EXTENDED_ARG",
    FormatValue = 155 => "FORMAT_VALUE",
    BuildString = 157 => "BUILD_STRING",
    LoadMethod = 160 => "LOAD_METHOD",
    CallMethod = 161 => "CALL_METHOD",
}

/// `MAKE_FUNCTION` flag: a tuple of default values sits below the code object.
pub const MAKE_FUNCTION_DEFAULTS: u32 = 0x01;

/// `FORMAT_VALUE` flag: a format-spec string sits on top of the value.
pub const FORMAT_VALUE_HAS_SPEC: u32 = 0x04;

/// `COMPARE_OP` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt = 0,
    LtE = 1,
    Eq = 2,
    NotEq = 3,
    Gt = 4,
    GtE = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    /// `isinstance`-style test of an exception against a type or tuple of types.
    ExceptionMatch = 10,
}

impl Comparison {
    pub fn from_arg(arg: u32) -> Option<Self> {
        Some(match arg {
            0 => Self::Lt,
            1 => Self::LtE,
            2 => Self::Eq,
            3 => Self::NotEq,
            4 => Self::Gt,
            5 => Self::GtE,
            6 => Self::In,
            7 => Self::NotIn,
            8 => Self::Is,
            9 => Self::IsNot,
            10 => Self::ExceptionMatch,
            _ => return None,
        })
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::LtE => "<=",
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Gt => ">",
            Self::GtE => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::ExceptionMatch => "exception match",
        }
    }
}

/// How an instruction transfers control, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    Relative,
    Absolute,
}

impl Opcode {
    pub fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    pub fn jump_kind(self) -> Option<JumpKind> {
        match self {
            Self::JumpForward | Self::ForIter | Self::SetupExcept => Some(JumpKind::Relative),
            Self::JumpAbsolute
            | Self::PopJumpIfFalse
            | Self::PopJumpIfTrue
            | Self::JumpIfFalseOrPop
            | Self::JumpIfTrueOrPop => Some(JumpKind::Absolute),
            _ => None,
        }
    }

    pub fn is_jump(self) -> bool {
        self.jump_kind().is_some()
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::JumpForward
                | Self::JumpAbsolute
                | Self::ReturnValue
                | Self::RaiseVarargs
                | Self::Reraise
        )
    }

    /// Net operand-stack change: `(fallthrough, taken_jump)`.
    ///
    /// For `SETUP_EXCEPT` the jump effect is the handler's entry depth
    /// relative to the setup point: the raised exception is pushed.
    pub fn stack_effect(self, arg: u32) -> (i32, i32) {
        let n = arg as i32;
        let e = match self {
            Self::Nop
            | Self::RotTwo
            | Self::RotThree
            | Self::UnaryPositive
            | Self::UnaryNegative
            | Self::UnaryNot
            | Self::GetIter
            | Self::PopBlock
            | Self::PopExcept
            | Self::LoadAttr
            | Self::DeleteName
            | Self::DeleteGlobal
            | Self::DeleteFast
            | Self::ExtendedArg => 0,
            Self::PopTop | Self::Reraise | Self::ReturnValue => -1,
            Self::DupTop
            | Self::LoadAssertionError
            | Self::LoadConst
            | Self::LoadName
            | Self::LoadGlobal
            | Self::LoadFast
            | Self::LoadMethod
            | Self::ImportName
            | Self::ImportFrom => 1,
            Self::DupTopTwo => 2,
            Self::BinaryPower
            | Self::BinaryMultiply
            | Self::BinaryModulo
            | Self::BinaryAdd
            | Self::BinarySubtract
            | Self::BinarySubscr
            | Self::BinaryFloorDivide
            | Self::BinaryTrueDivide
            | Self::InplaceFloorDivide
            | Self::InplaceTrueDivide
            | Self::InplaceAdd
            | Self::InplaceSubtract
            | Self::InplaceMultiply
            | Self::InplaceModulo
            | Self::CompareOp
            | Self::StoreName
            | Self::StoreGlobal
            | Self::StoreFast
            | Self::DeleteAttr => -1,
            Self::StoreAttr | Self::DeleteSubscr => -2,
            Self::StoreSubscr => -3,
            Self::UnpackSequence => n - 1,
            Self::BuildTuple
            | Self::BuildList
            | Self::BuildSet
            | Self::BuildString
            | Self::BuildSlice => 1 - n,
            Self::BuildMap => 1 - 2 * n,
            Self::RaiseVarargs => -n,
            Self::CallFunction => -n,
            Self::CallMethod => -n - 1,
            Self::MakeFunction => -((arg & MAKE_FUNCTION_DEFAULTS) as i32),
            Self::FormatValue => {
                if arg & FORMAT_VALUE_HAS_SPEC != 0 {
                    -1
                } else {
                    0
                }
            }
            Self::ForIter => return (1, -1),
            Self::SetupExcept => return (0, 1),
            Self::JumpIfFalseOrPop | Self::JumpIfTrueOrPop => return (-1, 0),
            Self::PopJumpIfFalse | Self::PopJumpIfTrue => -1,
            Self::JumpForward | Self::JumpAbsolute => 0,
        };
        (e, e)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
