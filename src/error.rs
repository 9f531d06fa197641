use thiserror::Error;

/// Fatal runtime conditions. Any of these halts the engine and is
/// recorded in its error slot until the embedder calls `reset`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemeError {
    #[error("unbound identifier: {0}")]
    UnboundIdentifier(String),

    #[error("malformed special form: {0}")]
    MalformedSpecialForm(String),

    /// A non-procedure ended up in call position.
    #[error("cannot apply {0}")]
    ApplyError(String),

    #[error("{name}: expected {expected} argument(s), got {got}")]
    ArityError {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("division by zero")]
    DivideByZero,

    #[error("no matching syntax-rules clause for {0}")]
    NoMatchingMacroClause(String),

    /// A collection did not reclaim enough space for the pending allocation.
    #[error("out of memory: {requested} words requested")]
    OutOfMemory { requested: usize },

    #[error("type error: {0}")]
    TypeError(String),

    #[error("integer overflow in {0}")]
    ArithmeticOverflow(&'static str),

    #[error("call depth exceeded ({0} frames)")]
    CallDepthExceeded(usize),

    #[error("operand stack exhausted ({0} values)")]
    StackExhausted(usize),

    #[error("read error: {0}")]
    ReadError(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// The engine still holds an earlier error.
    #[error("engine halted: {0}")]
    Halted(String),
}

impl From<std::io::Error> for SchemeError {
    fn from(err: std::io::Error) -> Self {
        SchemeError::Io(err.to_string())
    }
}

pub type SchemeResult<T> = Result<T, SchemeError>;

/// Reasons a closure could not be compiled. These never reach the
/// program: the closure simply stays on the interpreted path.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("define not at top level of body: {0}")]
    DefineNotAtTopLevel(String),

    #[error("unresolved identifier: {0}")]
    UnresolvedIdentifier(String),

    #[error("malformed form: {0}")]
    Malformed(String),

    #[error("unsupported in compiled code: {0}")]
    Unsupported(&'static str),

    #[error("no room in the heap for compiled code")]
    NoRoom,

    /// Macro expansion during compilation failed; the interpreter will
    /// report the same failure if the call site is ever reached.
    #[error("expansion failed: {0}")]
    Expansion(SchemeError),
}
