use tracing::debug;

use crate::engine::Engine;
use crate::error::CompileError;
use crate::heap::Mutator;
use crate::scope::{self, Class, Node, NodeId, Resolved, ScopeNode};
use crate::value::{BindingId, ClosureCode, ClosureId, FrameId, SymbolId, Value};

/// One bytecode instruction. Each instruction declares how far the
/// instruction pointer moves after it runs; control transfers manage the
/// pointer themselves.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Instr {
    PushConst(Value),
    /// Push the argument or local at `base + slot`.
    StackRef(u32),
    /// Pop into `base + slot`, then push the unspecified value.
    StackSet(u32),
    CaptureRef(u32),
    CaptureSet(u32),
    /// Read a boxed variable from the invocation scope.
    ScopeRef(SymbolId),
    ScopeSet(SymbolId),
    /// Create the invocation scope and bind the boxed variables.
    EnterScope,
    /// Close over the invocation scope with the indexed lambda template.
    MakeClosure(u32),
    Pop,
    Jump(i32),
    /// Pop the test; jump when it is `#f`.
    JumpIfFalse(i32),
    Call(u32),
    TailCall(u32),
    Return,
}

/// A variable stored in the invocation scope, seeded from its argument
/// slot when it is a parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Boxed {
    pub symbol: SymbolId,
    pub param: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Template {
    pub params: Value,
    pub body: Value,
}

/// Bytecode for a closure whose body resolved statically.
///
/// A compiled activation keeps its arguments and locals on the operand
/// stack starting at the frame base. Variables an inner lambda may observe
/// live instead in a per-invocation scope frame built by `EnterScope`, so
/// interpreted inner closures see and update the same bindings.
#[derive(Debug, PartialEq)]
pub struct Compiled {
    pub code: Box<[Instr]>,
    /// Bindings read and written by `CaptureRef`/`CaptureSet`.
    pub captures: Box<[BindingId]>,
    pub boxed: Box<[Boxed]>,
    pub lambdas: Box<[Template]>,
    pub arity: usize,
    /// Stack slots reserved after the arguments for leading defines.
    pub locals: usize,
    /// Operand depth the body needs above its locals.
    pub required_stack: usize,
    /// Source kept for printing, tracing and `Closure::params`.
    pub params: Value,
    pub body: Value,
    pub env: FrameId,
}

impl Compiled {
    /// Arena words charged for this closure.
    pub fn words(&self) -> usize {
        6 + self.code.len() * 2 + self.captures.len() + self.boxed.len() * 2 + self.lambdas.len() * 2
    }

    /// Heap values referenced from the code and lambda templates.
    pub fn constants(&self) -> impl Iterator<Item = Value> + '_ {
        let pushed = self.code.iter().filter_map(|instr| match *instr {
            Instr::PushConst(value) => Some(value),
            _ => None,
        });
        let templates = self.lambdas.iter().flat_map(|t| [t.params, t.body]);
        pushed.chain(templates)
    }
}

/// Lower a resolved body.
pub fn generate(resolved: Resolved, params: Value, body: Value, env: FrameId) -> Box<Compiled> {
    let boxed: Vec<Boxed> = resolved
        .scope
        .iter()
        .filter_map(|node| match node.class {
            Class::MutableParameter => Some(Boxed {
                symbol: node.symbol,
                param: Some(node.slot),
            }),
            Class::MutableLocal => Some(Boxed {
                symbol: node.symbol,
                param: None,
            }),
            _ => None,
        })
        .collect();

    let mut emitter = Emitter {
        scope: &resolved.scope,
        code: Vec::new(),
        lambdas: Vec::new(),
        depth: 0,
        max_depth: 0,
    };
    if !boxed.is_empty() {
        emitter.emit(Instr::EnterScope, 0);
    }
    emitter.sequence(&resolved.body, true);
    emitter.emit(Instr::Return, -1);

    Box::new(Compiled {
        code: emitter.code.into_boxed_slice(),
        captures: resolved.captures.into_boxed_slice(),
        boxed: boxed.into_boxed_slice(),
        lambdas: emitter.lambdas.into_boxed_slice(),
        arity: resolved.arity,
        locals: resolved.locals,
        required_stack: emitter.max_depth,
        params,
        body,
        env,
    })
}

struct Emitter<'s> {
    scope: &'s [ScopeNode],
    code: Vec<Instr>,
    lambdas: Vec<Template>,
    depth: usize,
    max_depth: usize,
}

impl Emitter<'_> {
    fn emit(&mut self, instr: Instr, effect: isize) -> usize {
        self.code.push(instr);
        self.depth = self.depth.saturating_add_signed(effect);
        self.max_depth = self.max_depth.max(self.depth);
        self.code.len() - 1
    }

    /// Point the jump at `at` to the next instruction emitted.
    fn patch(&mut self, at: usize) {
        let offset = (self.code.len() - at) as i32;
        if let Instr::Jump(target) | Instr::JumpIfFalse(target) = &mut self.code[at] {
            *target = offset;
        }
    }

    fn load(&self, id: NodeId) -> Instr {
        let node = self.scope[id];
        match node.class {
            Class::Parameter | Class::Local => Instr::StackRef(node.slot),
            Class::MutableParameter | Class::MutableLocal => Instr::ScopeRef(node.symbol),
            Class::Closure => Instr::CaptureRef(node.slot),
        }
    }

    fn store(&self, id: NodeId) -> Instr {
        let node = self.scope[id];
        match node.class {
            Class::Parameter | Class::Local => Instr::StackSet(node.slot),
            Class::MutableParameter | Class::MutableLocal => Instr::ScopeSet(node.symbol),
            Class::Closure => Instr::CaptureSet(node.slot),
        }
    }

    fn sequence(&mut self, items: &[Node], tail: bool) {
        let Some((last, init)) = items.split_last() else {
            self.emit(Instr::PushConst(Value::Unspecified), 1);
            return;
        };
        for item in init {
            self.node(item, false);
            self.emit(Instr::Pop, -1);
        }
        self.node(last, tail);
    }

    fn node(&mut self, node: &Node, tail: bool) {
        match node {
            Node::Const(value) => {
                self.emit(Instr::PushConst(*value), 1);
            }
            Node::Ref(id) => {
                self.emit(self.load(*id), 1);
            }
            Node::Set(id, value) | Node::Define(id, value) => {
                self.node(value, false);
                self.emit(self.store(*id), 0);
            }
            Node::If(test, then, otherwise) => {
                self.node(test, false);
                let branch = self.emit(Instr::JumpIfFalse(0), -1);
                let baseline = self.depth;
                self.node(then, tail);
                let skip = self.emit(Instr::Jump(0), 0);
                self.depth = baseline;
                self.patch(branch);
                match otherwise {
                    Some(otherwise) => self.node(otherwise, tail),
                    None => {
                        self.emit(Instr::PushConst(Value::Unspecified), 1);
                    }
                }
                self.patch(skip);
            }
            Node::Begin(items) => self.sequence(items, tail),
            Node::Lambda { params, body } => {
                let index = self.lambdas.len() as u32;
                self.lambdas.push(Template {
                    params: *params,
                    body: *body,
                });
                self.emit(Instr::MakeClosure(index), 1);
            }
            Node::Apply(items) => {
                for item in items {
                    self.node(item, false);
                }
                let argc = items.len().saturating_sub(1);
                let instr = if tail {
                    Instr::TailCall(argc as u32)
                } else {
                    Instr::Call(argc as u32)
                };
                self.emit(instr, -(argc as isize));
            }
        }
    }
}

impl Engine {
    /// Replace an interpreted closure's code with bytecode. Failure is not
    /// an error for the program: the closure is marked and stays
    /// interpreted.
    pub(crate) fn try_compile(&mut self, id: ClosureId) {
        let lambda = match &self.heap.closure(id).code {
            ClosureCode::Interpreted(lambda) => *lambda,
            ClosureCode::Compiled(_) => return,
        };

        let mark = self.protected();
        let outcome = scope::resolve(self, lambda.params, lambda.body, lambda.env)
            .map(|resolved| generate(resolved, lambda.params, lambda.body, lambda.env))
            .and_then(|compiled| self.install(id, compiled));
        self.release(mark);

        match outcome {
            Ok(()) => {
                self.stats.compiled += 1;
                debug!(target: "ember::compiler", closure = id.slot(), "compiled closure");
            }
            Err(err) => {
                self.stats.compile_failures += 1;
                if let ClosureCode::Interpreted(lambda) = &mut self.heap.closure_mut(id).code {
                    lambda.compile_failed = true;
                }
                debug!(
                    target: "ember::compiler",
                    closure = id.slot(),
                    error = %err,
                    "closure stays interpreted"
                );
            }
        }
    }

    fn install(&mut self, id: ClosureId, compiled: Box<Compiled>) -> Result<(), CompileError> {
        let compiled = match self.heap.install_compiled(id, compiled) {
            Ok(()) => return Ok(()),
            Err(compiled) => compiled,
        };
        // Expansions are still protected; the closure itself is reachable
        // from whoever is calling it.
        self.collect_garbage();
        self.heap
            .install_compiled(id, compiled)
            .map_err(|_| CompileError::NoRoom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn compile(engine: &mut Engine, params: &str, body: &str) -> Box<Compiled> {
        let params = engine.parse(params).unwrap().unwrap();
        let pin = engine.pin(params);
        let body = engine.parse(body).unwrap().unwrap();
        let env = engine.global_frame();
        let resolved = scope::resolve(engine, params, body, env).unwrap();
        engine.unpin(pin);
        generate(resolved, params, body, env)
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn tail_application_becomes_tail_call() {
        let mut engine = engine();
        let compiled = compile(&mut engine, "(f x)", "((f x))");
        assert_eq!(
            &compiled.code[..],
            &[Instr::StackRef(0), Instr::StackRef(1), Instr::TailCall(1), Instr::Return]
        );
        assert_eq!(compiled.required_stack, 2);
    }

    #[test]
    fn nested_application_is_an_ordinary_call() {
        let mut engine = engine();
        let compiled = compile(&mut engine, "(x)", "((car (cdr x)))");
        assert_eq!(
            &compiled.code[..],
            &[
                Instr::CaptureRef(0),
                Instr::CaptureRef(1),
                Instr::StackRef(0),
                Instr::Call(1),
                Instr::TailCall(1),
                Instr::Return,
            ]
        );
        assert_eq!(compiled.captures.len(), 2);
    }

    #[test]
    fn conditional_jumps_land_on_the_branches() {
        let mut engine = engine();
        let compiled = compile(&mut engine, "(x)", "((if x 1 2))");
        assert_eq!(
            &compiled.code[..],
            &[
                Instr::StackRef(0),
                Instr::JumpIfFalse(3),
                Instr::PushConst(Value::Int(1)),
                Instr::Jump(2),
                Instr::PushConst(Value::Int(2)),
                Instr::Return,
            ]
        );
    }

    #[test]
    fn body_sequence_discards_intermediate_values() {
        let mut engine = engine();
        let compiled = compile(&mut engine, "()", "(1 2)");
        assert_eq!(
            &compiled.code[..],
            &[
                Instr::PushConst(Value::Int(1)),
                Instr::Pop,
                Instr::PushConst(Value::Int(2)),
                Instr::Return,
            ]
        );
    }

    #[test]
    fn boxed_parameters_enter_a_scope() {
        let mut engine = engine();
        let compiled = compile(&mut engine, "(n)", "((lambda () n))");
        assert_eq!(compiled.code[0], Instr::EnterScope);
        assert_eq!(compiled.boxed.len(), 1);
        assert_eq!(compiled.boxed[0].param, Some(0));
        assert_eq!(compiled.code[1], Instr::MakeClosure(0));
        assert_eq!(compiled.lambdas.len(), 1);
    }

    #[test]
    fn constants_include_templates() {
        let mut engine = engine();
        let compiled = compile(&mut engine, "()", "('(a b) (lambda (y) y))");
        let constants: Vec<Value> = compiled.constants().collect();
        assert_eq!(constants.len(), 3);
        assert!(constants[0].is_pair());
    }
}
