use std::fmt;

use crate::compiler::Compiled;
use crate::primitives::Builtin;

/// Unique identifier for an interned symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

macro_rules! handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            /// Arena slot this handle addresses.
            #[inline]
            pub fn slot(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// Handle to a cons cell in the arena.
    PairId
);
handle!(
    /// Handle to a fixed-length vector object.
    VectorId
);
handle!(
    /// Handle to an immutable string object.
    StrId
);
handle!(
    /// Handle to a closure object (interpreted or compiled).
    ClosureId
);
handle!(
    /// Handle to a `syntax-rules` transformer.
    RulesId
);
handle!(
    /// Handle to an environment frame.
    FrameId
);
handle!(
    /// Handle to a single binding node inside an environment frame.
    /// Compiled closures capture these by identity.
    BindingId
);

/// Special-form keywords. They are ordinary values bound in the base
/// environment, so shadowing a keyword is just shadowing a binding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Keyword {
    Lambda,
    Define,
    DefineSyntax,
    Set,
    If,
    Begin,
    Quote,
    SyntaxRules,
}

impl Keyword {
    pub const ALL: [Keyword; 8] = [
        Keyword::Lambda,
        Keyword::Define,
        Keyword::DefineSyntax,
        Keyword::Set,
        Keyword::If,
        Keyword::Begin,
        Keyword::Quote,
        Keyword::SyntaxRules,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Keyword::Lambda => "lambda",
            Keyword::Define => "define",
            Keyword::DefineSyntax => "define-syntax",
            Keyword::Set => "set!",
            Keyword::If => "if",
            Keyword::Begin => "begin",
            Keyword::Quote => "quote",
            Keyword::SyntaxRules => "syntax-rules",
        }
    }
}

/// A runtime value. Inline kinds carry their payload directly; heap kinds
/// carry an arena handle, so copying a `Value` never copies heap data.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// The empty list, which also terminates every proper list.
    Null,
    Bool(bool),
    Int(i64),
    Char(char),
    Symbol(SymbolId),
    Pair(PairId),
    Vector(VectorId),
    Str(StrId),
    Closure(ClosureId),
    Rules(RulesId),
    Keyword(Keyword),
    /// Native procedure, including the engine's internal sentinels.
    Builtin(Builtin),
    /// Result of forms evaluated for effect.
    Unspecified,
    Eof,
}

impl Value {
    #[inline]
    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    #[inline]
    pub fn is_pair(self) -> bool {
        matches!(self, Value::Pair(_))
    }

    #[inline]
    pub fn is_symbol(self) -> bool {
        matches!(self, Value::Symbol(_))
    }

    /// Only `#f` is false.
    #[inline]
    pub fn is_truthy(self) -> bool {
        !matches!(self, Value::Bool(false))
    }

    #[inline]
    pub fn as_pair(self) -> Option<PairId> {
        match self {
            Value::Pair(id) => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_symbol(self) -> Option<SymbolId> {
        match self {
            Value::Symbol(id) => Some(id),
            _ => None,
        }
    }

    #[inline]
    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_closure(self) -> Option<ClosureId> {
        match self {
            Value::Closure(id) => Some(id),
            _ => None,
        }
    }

    /// The arena slot this value points at, if it is a heap kind.
    #[inline]
    pub fn heap_slot(self) -> Option<u32> {
        match self {
            Value::Pair(id) => Some(id.0),
            Value::Vector(id) => Some(id.0),
            Value::Str(id) => Some(id.0),
            Value::Closure(id) => Some(id.0),
            Value::Rules(id) => Some(id.0),
            _ => None,
        }
    }

    /// Procedures are the values `apply` accepts.
    pub fn is_procedure(self) -> bool {
        matches!(self, Value::Closure(_) | Value::Builtin(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Char(c) => write!(f, "Char({:?})", c),
            Value::Symbol(id) => write!(f, "Sym({})", id.0),
            Value::Pair(id) => write!(f, "Pair({})", id.0),
            Value::Vector(id) => write!(f, "Vector({})", id.0),
            Value::Str(id) => write!(f, "Str({})", id.0),
            Value::Closure(id) => write!(f, "Closure({})", id.0),
            Value::Rules(id) => write!(f, "Rules({})", id.0),
            Value::Keyword(k) => write!(f, "Keyword({})", k.name()),
            Value::Builtin(b) => write!(f, "Builtin({})", b.name()),
            Value::Unspecified => write!(f, "Unspecified"),
            Value::Eof => write!(f, "Eof"),
        }
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId({})", self.0)
    }
}

/// A closure object. It starts interpreted and is rewritten in place to
/// the compiled form once it has been called often enough.
pub struct Closure {
    pub calls: u32,
    pub code: ClosureCode,
}

pub enum ClosureCode {
    Interpreted(Lambda),
    Compiled(Box<Compiled>),
}

/// Source form of a closure: parameter list, body forms, defining environment.
#[derive(Clone, Copy)]
pub struct Lambda {
    pub params: Value,
    pub body: Value,
    pub env: FrameId,
    /// Set once compilation has been tried and failed, so it is not retried.
    pub compile_failed: bool,
}

impl Closure {
    pub fn interpreted(params: Value, body: Value, env: FrameId) -> Self {
        Closure {
            calls: 0,
            code: ClosureCode::Interpreted(Lambda {
                params,
                body,
                env,
                compile_failed: false,
            }),
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.code, ClosureCode::Compiled(_))
    }

    /// The parameter list the closure was defined with.
    pub fn params(&self) -> Value {
        match &self.code {
            ClosureCode::Interpreted(lambda) => lambda.params,
            ClosureCode::Compiled(compiled) => compiled.params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_false_is_falsy() {
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Null.is_truthy());
        assert!(Value::Int(0).is_truthy());
    }

    #[test]
    fn inline_kinds_have_no_heap_slot() {
        assert_eq!(Value::Int(7).heap_slot(), None);
        assert_eq!(Value::Keyword(Keyword::If).heap_slot(), None);
        assert_eq!(Value::Pair(PairId(3)).heap_slot(), Some(3));
        assert_eq!(Value::Closure(ClosureId(9)).heap_slot(), Some(9));
    }
}
