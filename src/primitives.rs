use std::io::{BufRead, Write};

use smallvec::SmallVec;

use crate::engine::Engine;
use crate::env::{bind, lookup_chain};
use crate::error::{SchemeError, SchemeResult};
use crate::heap::{Mutator, Object};
use crate::printer;
use crate::reader;
use crate::value::{PairId, SymbolId, Value, VectorId};

/// Native procedures. The first group is bound by name in the base
/// environment; the second group is internal and only ever pushed by
/// the interpreter's special-form handlers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Builtin {
    Add,
    Sub,
    Mul,
    Div,
    Cons,
    Car,
    Cdr,
    Eq,
    Lt,
    Gt,
    NumEq,
    IsNull,
    IsPair,
    Not,
    List,
    SetCar,
    SetCdr,
    Vector,
    VectorRef,
    VectorLength,
    Display,
    Newline,
    Read,

    /// Returns its last argument; drives `begin`, `quote` and closure bodies.
    ReturnLast,
    /// `(name value)` in the current environment frame.
    Define,
    /// `(name value)` on the nearest existing binding.
    SetBang,
    DefineSyntax,
    /// `(then else test)`; continues with the selected branch.
    If,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, n: usize) -> bool {
        match self {
            Arity::Exact(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }

    fn describe(self) -> String {
        match self {
            Arity::Exact(k) => k.to_string(),
            Arity::AtLeast(k) => format!("at least {}", k),
        }
    }
}

/// What the engine does after a builtin returns.
pub(crate) enum Flow {
    /// Return this value to the caller.
    Return(Value),
    /// Evaluate this expression in place of the current call.
    Eval(Value),
}

impl Builtin {
    /// Procedures visible to programs, in binding order.
    pub const GLOBALS: [Builtin; 23] = [
        Builtin::Add,
        Builtin::Sub,
        Builtin::Mul,
        Builtin::Div,
        Builtin::Cons,
        Builtin::Car,
        Builtin::Cdr,
        Builtin::Eq,
        Builtin::Lt,
        Builtin::Gt,
        Builtin::NumEq,
        Builtin::IsNull,
        Builtin::IsPair,
        Builtin::Not,
        Builtin::List,
        Builtin::SetCar,
        Builtin::SetCdr,
        Builtin::Vector,
        Builtin::VectorRef,
        Builtin::VectorLength,
        Builtin::Display,
        Builtin::Newline,
        Builtin::Read,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Add => "+",
            Builtin::Sub => "-",
            Builtin::Mul => "*",
            Builtin::Div => "/",
            Builtin::Cons => "cons",
            Builtin::Car => "car",
            Builtin::Cdr => "cdr",
            Builtin::Eq => "eq?",
            Builtin::Lt => "<",
            Builtin::Gt => ">",
            Builtin::NumEq => "=",
            Builtin::IsNull => "null?",
            Builtin::IsPair => "pair?",
            Builtin::Not => "not",
            Builtin::List => "list",
            Builtin::SetCar => "set-car!",
            Builtin::SetCdr => "set-cdr!",
            Builtin::Vector => "vector",
            Builtin::VectorRef => "vector-ref",
            Builtin::VectorLength => "vector-length",
            Builtin::Display => "display",
            Builtin::Newline => "newline",
            Builtin::Read => "read",
            Builtin::ReturnLast => "return-last",
            Builtin::Define => "define",
            Builtin::SetBang => "set!",
            Builtin::DefineSyntax => "define-syntax",
            Builtin::If => "if",
        }
    }

    pub fn arity(self) -> Arity {
        match self {
            Builtin::Add | Builtin::Mul | Builtin::List | Builtin::Vector => Arity::AtLeast(0),
            Builtin::Sub | Builtin::Div | Builtin::Lt | Builtin::Gt | Builtin::NumEq => {
                Arity::AtLeast(1)
            }
            Builtin::Car
            | Builtin::Cdr
            | Builtin::IsNull
            | Builtin::IsPair
            | Builtin::Not
            | Builtin::VectorLength
            | Builtin::Display => Arity::Exact(1),
            Builtin::Cons
            | Builtin::Eq
            | Builtin::SetCar
            | Builtin::SetCdr
            | Builtin::VectorRef
            | Builtin::Define
            | Builtin::SetBang
            | Builtin::DefineSyntax => Arity::Exact(2),
            Builtin::Newline | Builtin::Read => Arity::Exact(0),
            Builtin::ReturnLast => Arity::AtLeast(0),
            Builtin::If => Arity::Exact(3),
        }
    }
}

impl Engine {
    /// Run `builtin` on the arguments above `base`; the callee sits at `base`.
    pub(crate) fn call_builtin(&mut self, builtin: Builtin, base: usize) -> SchemeResult<Flow> {
        let args: SmallVec<[Value; 4]> = SmallVec::from_slice(&self.stack[base + 1..]);
        let arity = builtin.arity();
        if !arity.accepts(args.len()) {
            return Err(SchemeError::ArityError {
                name: builtin.name().to_string(),
                expected: arity.describe(),
                got: args.len(),
            });
        }

        let result = match builtin {
            Builtin::Add => fold_ints(&args, 0, "+", i64::checked_add)?,
            Builtin::Mul => fold_ints(&args, 1, "*", i64::checked_mul)?,
            Builtin::Sub => {
                if args.len() == 1 {
                    let n = int_arg("-", args[0])?;
                    Value::Int(n.checked_neg().ok_or(SchemeError::ArithmeticOverflow("-"))?)
                } else {
                    let first = int_arg("-", args[0])?;
                    fold_ints(&args[1..], first, "-", i64::checked_sub)?
                }
            }
            Builtin::Div => {
                if args.len() == 1 {
                    Value::Int(divide(1, int_arg("/", args[0])?)?)
                } else {
                    let mut acc = int_arg("/", args[0])?;
                    for &arg in &args[1..] {
                        acc = divide(acc, int_arg("/", arg)?)?;
                    }
                    Value::Int(acc)
                }
            }
            Builtin::Lt => compare_chain("<", &args, |a, b| a < b)?,
            Builtin::Gt => compare_chain(">", &args, |a, b| a > b)?,
            Builtin::NumEq => compare_chain("=", &args, |a, b| a == b)?,
            Builtin::Cons => self.cons(args[0], args[1])?,
            Builtin::Car => self.heap.car(self.pair_arg("car", args[0])?),
            Builtin::Cdr => self.heap.cdr(self.pair_arg("cdr", args[0])?),
            Builtin::Eq => Value::Bool(args[0] == args[1]),
            Builtin::IsNull => Value::Bool(args[0].is_null()),
            Builtin::IsPair => Value::Bool(args[0].is_pair()),
            Builtin::Not => Value::Bool(!args[0].is_truthy()),
            Builtin::List => self.list(&args)?,
            Builtin::SetCar => {
                let id = self.pair_arg("set-car!", args[0])?;
                self.heap.set_car(id, args[1]);
                Value::Unspecified
            }
            Builtin::SetCdr => {
                let id = self.pair_arg("set-cdr!", args[0])?;
                self.heap.set_cdr(id, args[1]);
                Value::Unspecified
            }
            Builtin::Vector => {
                let slot = self.allocate(Object::Vector(args.to_vec()))?;
                Value::Vector(VectorId(slot))
            }
            Builtin::VectorRef => {
                let items = self.heap.vector(vector_arg("vector-ref", args[0])?);
                let index = int_arg("vector-ref", args[1])?;
                usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get(i).copied())
                    .ok_or_else(|| {
                        SchemeError::TypeError(format!(
                            "vector-ref: index {} out of range for length {}",
                            index,
                            items.len()
                        ))
                    })?
            }
            Builtin::VectorLength => {
                let items = self.heap.vector(vector_arg("vector-length", args[0])?);
                Value::Int(items.len() as i64)
            }
            Builtin::Display => {
                let text = printer::display(&self.heap, &self.symbols, args[0]);
                self.output.write_all(text.as_bytes())?;
                self.output.flush()?;
                Value::Unspecified
            }
            Builtin::Newline => {
                self.output.write_all(b"\n")?;
                self.output.flush()?;
                Value::Unspecified
            }
            Builtin::Read => self.read_datum()?,

            Builtin::ReturnLast => args.last().copied().unwrap_or(Value::Unspecified),
            Builtin::Define => {
                let name = self.symbol_arg("define", args[0])?;
                let env = self.env;
                bind(self, env, name, args[1])?;
                Value::Unspecified
            }
            Builtin::SetBang => {
                let name = self.symbol_arg("set!", args[0])?;
                let binding = lookup_chain(&self.heap, self.env, name).ok_or_else(|| {
                    SchemeError::UnboundIdentifier(self.symbols.name(name).to_string())
                })?;
                self.heap.binding_mut(binding).value = args[1];
                Value::Unspecified
            }
            Builtin::DefineSyntax => {
                let name = self.symbol_arg("define-syntax", args[0])?;
                if !matches!(args[1], Value::Rules(_)) {
                    return Err(SchemeError::MalformedSpecialForm(format!(
                        "define-syntax {}: value is not a syntax-rules transformer",
                        self.symbols.name(name)
                    )));
                }
                let env = self.env;
                bind(self, env, name, args[1])?;
                Value::Unspecified
            }
            Builtin::If => {
                let branch = if args[2].is_truthy() { args[0] } else { args[1] };
                return Ok(Flow::Eval(branch));
            }
        };
        Ok(Flow::Return(result))
    }

    fn pair_arg(&self, who: &str, value: Value) -> SchemeResult<PairId> {
        value.as_pair().ok_or_else(|| {
            SchemeError::TypeError(format!(
                "{}: expected a pair, got {}",
                who,
                printer::render(&self.heap, &self.symbols, value)
            ))
        })
    }

    fn symbol_arg(&self, who: &str, value: Value) -> SchemeResult<SymbolId> {
        value.as_symbol().ok_or_else(|| {
            SchemeError::MalformedSpecialForm(format!(
                "{}: expected a symbol, got {}",
                who,
                printer::render(&self.heap, &self.symbols, value)
            ))
        })
    }

    /// Read one datum from the engine's input, pulling more lines until
    /// the parentheses balance.
    fn read_datum(&mut self) -> SchemeResult<Value> {
        loop {
            if !self.pending_input.trim().is_empty() && reader::paren_depth(&self.pending_input) <= 0
            {
                let text = std::mem::take(&mut self.pending_input);
                return match reader::read_one_at(self, &text, 0)? {
                    Some((value, end)) => {
                        self.pending_input = text[end..].to_string();
                        Ok(value)
                    }
                    None => Ok(Value::Eof),
                };
            }

            let mut line = String::new();
            if self.input.read_line(&mut line)? == 0 {
                if self.pending_input.trim().is_empty() {
                    return Ok(Value::Eof);
                }
                let text = std::mem::take(&mut self.pending_input);
                return match reader::read_one_at(self, &text, 0)? {
                    Some((value, _)) => Ok(value),
                    None => Ok(Value::Eof),
                };
            }
            self.pending_input.push_str(&line);
        }
    }
}

fn int_arg(who: &str, value: Value) -> SchemeResult<i64> {
    value
        .as_int()
        .ok_or_else(|| SchemeError::TypeError(format!("{}: expected an integer, got {:?}", who, value)))
}

fn vector_arg(who: &str, value: Value) -> SchemeResult<VectorId> {
    match value {
        Value::Vector(id) => Ok(id),
        other => Err(SchemeError::TypeError(format!(
            "{}: expected a vector, got {:?}",
            who, other
        ))),
    }
}

fn fold_ints(
    args: &[Value],
    init: i64,
    who: &'static str,
    op: fn(i64, i64) -> Option<i64>,
) -> SchemeResult<Value> {
    let mut acc = init;
    for &arg in args {
        acc = op(acc, int_arg(who, arg)?).ok_or(SchemeError::ArithmeticOverflow(who))?;
    }
    Ok(Value::Int(acc))
}

fn divide(a: i64, b: i64) -> SchemeResult<i64> {
    if b == 0 {
        return Err(SchemeError::DivideByZero);
    }
    a.checked_div(b).ok_or(SchemeError::ArithmeticOverflow("/"))
}

fn compare_chain(who: &str, args: &[Value], holds: fn(i64, i64) -> bool) -> SchemeResult<Value> {
    let mut prev = int_arg(who, args[0])?;
    let mut result = true;
    for &arg in &args[1..] {
        let next = int_arg(who, arg)?;
        result &= holds(prev, next);
        prev = next;
    }
    Ok(Value::Bool(result))
}
