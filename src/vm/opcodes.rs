use crate::vm::value::JsValue;

#[derive(Debug, Clone)]
pub enum OpCode {
    Push(JsValue),
    Pop,
    Dup,
    /// [a, b] -> [a, b, a, b]
    Dup2,
    LoadThis,

    /// Create a binding in the current scope (var/let/const/function)
    Declare(String),
    /// Assign to the nearest existing binding, or create a global one
    Store(String),
    Load(String),
    /// typeof on a bare identifier: never throws for unbound names
    TypeOfName(String),
    /// Pop the value of a top-level expression statement into the frame's completion slot
    Completion,
    LoadCompletion,

    NewObject,
    NewArray,
    /// [obj, value] -> [value]
    SetProp(String),
    /// [obj] -> [value]
    GetProp(String),
    /// [obj, key, value] -> [value]
    SetPropComputed,
    /// [obj, key] -> [value]
    GetPropComputed,
    /// [array, value] -> [array]
    ArrayPush,
    /// Push a function closed over the current scope. Arrow functions also
    /// capture the current `this`.
    MakeFunction {
        address: usize,
        params: Vec<String>,
        name: String,
        arrow: bool,
    },

    /// [this, callee, args...] -> [result]
    Call(usize),
    /// [callee, args...] -> [object]
    Construct(usize),
    Return,

    Jump(usize),
    JumpIfFalse(usize),
    JumpIfTrue(usize),

    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    /// Unary plus (ToNumber)
    Plus,
    Not,
    BitNot,
    TypeOf,
    Eq,   // ===
    Ne,   // !==
    EqEq, // ==
    NeEq, // !=
    Lt,
    LtEq,
    Gt,
    GtEq,
    BitAnd,
    BitOr,
    Xor,
    ShiftLeft,
    ShiftRight,
    ShiftRightUnsigned,

    // === Exception handling ===
    /// Pops the exception value and unwinds to the innermost handler
    Throw,
    /// Register a handler; on throw the stack is restored and the exception
    /// is pushed before jumping to `catch_addr`
    SetupTry { catch_addr: usize },
    PopTry,
}

impl OpCode {
    /// Shift every code address by `offset`; used when appending a compiled
    /// unit to the end of the loaded program.
    pub fn rebase(self, offset: usize) -> OpCode {
        match self {
            OpCode::Jump(addr) => OpCode::Jump(addr + offset),
            OpCode::JumpIfFalse(addr) => OpCode::JumpIfFalse(addr + offset),
            OpCode::JumpIfTrue(addr) => OpCode::JumpIfTrue(addr + offset),
            OpCode::SetupTry { catch_addr } => OpCode::SetupTry {
                catch_addr: catch_addr + offset,
            },
            OpCode::MakeFunction {
                address,
                params,
                name,
                arrow,
            } => OpCode::MakeFunction {
                address: address + offset,
                params,
                name,
                arrow,
            },
            other => other,
        }
    }
}
