use std::io::{self, BufRead, Write};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use crate::compiler::{Boxed, Compiled, Instr};
use crate::config::EngineConfig;
use crate::env::{bind, create_frame, lookup_chain, lookup_local};
use crate::error::{SchemeError, SchemeResult};
use crate::heap::{GcStats, Heap, Mutator, Object, Pair};
use crate::primitives::{Builtin, Flow};
use crate::printer;
use crate::reader::{self, ReaderHost};
use crate::symbol::SymbolTable;
use crate::syntax_rules::{self, SyntaxRules};
use crate::value::{BindingId, Closure, ClosureCode, ClosureId, FrameId, Keyword, Lambda, RulesId, SymbolId, Value};

/// Which of the two step functions drives the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunMode {
    Interpreting,
    Bytecode,
}

/// Where a suspended caller picks up again.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Resume {
    /// Continue walking the rest of an application list.
    Interpreting { expr: Value },
    /// Continue a compiled body at `ip` with its frame base.
    Bytecode { ip: usize, base: usize },
}

/// A suspended caller. `sp` is the stack height the callee's value lands at.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CallFrame {
    closure: Option<ClosureId>,
    sp: usize,
    argc: usize,
    env: FrameId,
    resume: Resume,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub collections: usize,
    pub compiled: usize,
    pub compile_failures: usize,
    /// Deepest call-frame stack seen during the last evaluation.
    pub peak_call_depth: usize,
}

/// Handle to a value the embedder keeps alive across evaluations.
#[derive(Debug, PartialEq, Eq)]
pub struct Pin(usize);

/// The evaluation machine. All interpreter state lives here so the
/// collector can find every root.
pub struct Engine {
    pub(crate) heap: Heap,
    pub(crate) symbols: SymbolTable,
    pub(crate) config: EngineConfig,

    /// Operand stack shared by both execution modes.
    pub(crate) stack: Vec<Value>,
    calls: Vec<CallFrame>,
    /// Closure whose body is running; `None` at top level.
    closure: Option<ClosureId>,
    ip: usize,
    /// Index of the first argument of the running compiled body.
    base: usize,
    /// Values pushed so far for the application list being walked.
    argc: usize,
    /// Remaining application list (or atom) being interpreted.
    expr: Value,
    pub(crate) env: FrameId,
    mode: RunMode,
    global: FrameId,

    /// Intermediates protected across allocations.
    scratch: Vec<Value>,
    pins: Vec<Option<Value>>,
    free_pins: Vec<usize>,

    running: bool,
    error: Option<SchemeError>,

    pub(crate) output: Box<dyn Write>,
    pub(crate) input: Box<dyn BufRead>,
    /// Text read from `input` but not yet consumed by `read`.
    pub(crate) pending_input: String,

    pub(crate) stats: EngineStats,
}

impl Engine {
    pub fn new(config: EngineConfig) -> SchemeResult<Self> {
        let mut heap = Heap::new(config.heap_words);
        let global = create_frame(&mut heap, None)?;
        let mut engine = Engine {
            heap,
            symbols: SymbolTable::new(),
            config,
            stack: Vec::with_capacity(1024),
            calls: Vec::with_capacity(256),
            closure: None,
            ip: 0,
            base: 0,
            argc: 0,
            expr: Value::Null,
            env: global,
            mode: RunMode::Interpreting,
            global,
            scratch: Vec::new(),
            pins: Vec::new(),
            free_pins: Vec::new(),
            running: false,
            error: None,
            output: Box::new(io::stdout()),
            input: Box::new(io::BufReader::new(io::stdin())),
            pending_input: String::new(),
            stats: EngineStats::default(),
        };
        engine.install_globals()?;
        debug!(
            target: "ember::engine",
            heap_words = engine.config.heap_words,
            compile_threshold = engine.config.compile_threshold,
            "engine ready"
        );
        Ok(engine)
    }

    /// Bind keywords and builtins in the base frame. Inserting medians
    /// first keeps the binding tree balanced.
    fn install_globals(&mut self) -> SchemeResult<()> {
        let mut entries: Vec<(SymbolId, Value)> =
            Vec::with_capacity(Keyword::ALL.len() + Builtin::GLOBALS.len());
        for &keyword in Keyword::ALL.iter() {
            entries.push((self.symbols.intern(keyword.name()), Value::Keyword(keyword)));
        }
        for &builtin in Builtin::GLOBALS.iter() {
            entries.push((self.symbols.intern(builtin.name()), Value::Builtin(builtin)));
        }
        entries.sort_by_key(|&(symbol, _)| symbol);
        self.bind_balanced(&entries)
    }

    fn bind_balanced(&mut self, entries: &[(SymbolId, Value)]) -> SchemeResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mid = entries.len() / 2;
        let (symbol, value) = entries[mid];
        let global = self.global;
        bind(self, global, symbol, value)?;
        self.bind_balanced(&entries[..mid])?;
        self.bind_balanced(&entries[mid + 1..])
    }

    // --- embedding API ---

    /// Evaluate one expression in the global environment.
    ///
    /// The result is only guaranteed to stay valid until the next
    /// allocation; pin it to keep it longer.
    pub fn evaluate(&mut self, expr: Value) -> SchemeResult<Value> {
        if let Some(err) = &self.error {
            return Err(SchemeError::Halted(err.to_string()));
        }
        self.stack.clear();
        self.calls.clear();
        self.scratch.clear();
        self.closure = None;
        self.env = self.global;
        self.mode = RunMode::Interpreting;
        self.expr = expr;
        self.argc = 0;
        self.base = 0;
        self.ip = 0;
        self.stats.peak_call_depth = 0;
        self.running = true;

        let result = self.run();
        if result.is_ok() {
            self.stack.clear();
            self.expr = Value::Null;
        }
        result
    }

    /// Read and evaluate every form in `text`, returning the last value.
    pub fn eval_str(&mut self, text: &str) -> SchemeResult<Value> {
        let mut pos = 0;
        let mut last = Value::Unspecified;
        while let Some((expr, next)) = reader::read_one_at(self, text, pos)? {
            pos = next;
            last = self.evaluate(expr)?;
        }
        Ok(last)
    }

    /// Read the first datum in `text` without evaluating it.
    pub fn parse(&mut self, text: &str) -> SchemeResult<Option<Value>> {
        Ok(reader::read_one_at(self, text, 0)?.map(|(value, _)| value))
    }

    /// Print a value the way `write` would.
    pub fn render(&self, value: Value) -> String {
        printer::render(&self.heap, &self.symbols, value)
    }

    /// Print a value the way `display` would.
    pub fn display_string(&self, value: Value) -> String {
        printer::display(&self.heap, &self.symbols, value)
    }

    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    pub fn symbol_name(&self, symbol: SymbolId) -> &str {
        self.symbols.name(symbol)
    }

    /// Current value of a global, if bound.
    pub fn lookup_global(&self, name: &str) -> Option<Value> {
        let symbol = self.symbols.lookup(name)?;
        lookup_chain(&self.heap, self.global, symbol).map(|b| self.heap.binding(b).value)
    }

    /// Whether `value` is a closure that has been compiled to bytecode.
    pub fn is_compiled(&self, value: Value) -> bool {
        value
            .as_closure()
            .is_some_and(|id| self.heap.closure(id).is_compiled())
    }

    pub fn list_to_vec(&self, value: Value) -> Option<Vec<Value>> {
        self.heap.list_to_vec(value)
    }

    pub fn global_frame(&self) -> FrameId {
        self.global
    }

    /// Clear a halted state so evaluation can continue. Globals survive.
    pub fn reset(&mut self) {
        if let Some(err) = self.error.take() {
            debug!(target: "ember::engine", error = %err, "reset");
        }
        self.stack.clear();
        self.calls.clear();
        self.scratch.clear();
        self.closure = None;
        self.env = self.global;
        self.expr = Value::Null;
        self.mode = RunMode::Interpreting;
        self.argc = 0;
        self.running = false;
    }

    pub fn last_error(&self) -> Option<&SchemeError> {
        self.error.as_ref()
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    pub fn set_input(&mut self, input: Box<dyn BufRead>) {
        self.input = input;
        self.pending_input.clear();
    }

    /// Keep `value` reachable until the pin is released.
    pub fn pin(&mut self, value: Value) -> Pin {
        match self.free_pins.pop() {
            Some(index) => {
                self.pins[index] = Some(value);
                Pin(index)
            }
            None => {
                self.pins.push(Some(value));
                Pin(self.pins.len() - 1)
            }
        }
    }

    pub fn pinned(&self, pin: &Pin) -> Value {
        self.pins[pin.0].unwrap_or(Value::Unspecified)
    }

    pub fn unpin(&mut self, pin: Pin) {
        self.pins[pin.0] = None;
        self.free_pins.push(pin.0);
    }

    /// Run a full collection over the engine's roots.
    pub fn collect_garbage(&mut self) -> GcStats {
        self.collect_with(None)
    }

    fn collect_with(&mut self, pending: Option<&Object>) -> GcStats {
        let mut roots: Vec<u32> =
            Vec::with_capacity(self.stack.len() + self.calls.len() * 3 + self.scratch.len() + 8);
        roots.extend(self.stack.iter().filter_map(|v| v.heap_slot()));
        for frame in &self.calls {
            roots.extend(frame.closure.map(ClosureId::slot));
            roots.push(frame.env.slot());
            if let Resume::Interpreting { expr } = frame.resume {
                roots.extend(expr.heap_slot());
            }
        }
        roots.extend(self.closure.map(ClosureId::slot));
        roots.push(self.env.slot());
        roots.extend(self.expr.heap_slot());
        roots.push(self.global.slot());
        roots.extend(self.scratch.iter().filter_map(|v| v.heap_slot()));
        roots.extend(self.pins.iter().flatten().filter_map(|v| v.heap_slot()));
        if let Some(object) = pending {
            object.trace(&mut roots);
        }
        let stats = self.heap.collect(roots);
        self.stats.collections += 1;
        stats
    }

    // --- machine ---

    fn run(&mut self) -> SchemeResult<Value> {
        while self.running {
            let step = match self.mode {
                RunMode::Interpreting => self.step_interpreter(),
                RunMode::Bytecode => self.step_bytecode(),
            };
            if let Err(err) = step {
                self.running = false;
                warn!(target: "ember::engine", error = %err, "evaluation halted");
                self.error = Some(err.clone());
                return Err(err);
            }
        }
        Ok(self.stack.first().copied().unwrap_or(Value::Unspecified))
    }

    fn push(&mut self, value: Value) -> SchemeResult<()> {
        if self.stack.len() >= self.config.max_stack {
            return Err(SchemeError::StackExhausted(self.stack.len()));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Unspecified)
    }

    fn push_frame(&mut self, sp: usize, resume: Resume) -> SchemeResult<()> {
        if self.calls.len() >= self.config.max_call_depth {
            return Err(SchemeError::CallDepthExceeded(self.calls.len()));
        }
        self.calls.push(CallFrame {
            closure: self.closure,
            sp,
            argc: self.argc,
            env: self.env,
            resume,
        });
        self.stats.peak_call_depth = self.stats.peak_call_depth.max(self.calls.len());
        Ok(())
    }

    /// Suspend the current list walk and start evaluating `expr`.
    fn call_eval(&mut self, expr: Value) -> SchemeResult<()> {
        let sp = self.stack.len();
        self.push_frame(sp, Resume::Interpreting { expr: self.expr })?;
        self.argc = 0;
        self.expr = expr;
        self.mode = RunMode::Interpreting;
        Ok(())
    }

    /// Deliver `value` to the innermost suspended caller.
    fn call_return(&mut self, value: Value) -> SchemeResult<()> {
        let Some(frame) = self.calls.pop() else {
            self.stack.clear();
            self.stack.push(value);
            self.running = false;
            return Ok(());
        };
        self.stack.truncate(frame.sp);
        self.push(value)?;
        self.argc = frame.argc + 1;
        self.closure = frame.closure;
        self.env = frame.env;
        match frame.resume {
            Resume::Interpreting { expr } => {
                self.mode = RunMode::Interpreting;
                self.expr = expr;
            }
            Resume::Bytecode { ip, base } => {
                self.mode = RunMode::Bytecode;
                self.ip = ip;
                self.base = base;
                self.expr = Value::Null;
            }
        }
        Ok(())
    }

    /// Evaluate `expr` in place of the current application.
    fn eval_in_place(&mut self, expr: Value) {
        let base = self.stack.len() - self.argc;
        self.stack.truncate(base);
        self.argc = 0;
        self.expr = expr;
        self.mode = RunMode::Interpreting;
    }

    /// The list being walked is a `ReturnLast` list, so its final element
    /// is in tail position.
    fn in_tail_list(&self) -> bool {
        self.argc > 0
            && self.stack[self.stack.len() - self.argc] == Value::Builtin(Builtin::ReturnLast)
    }

    fn resolve(&self, symbol: SymbolId) -> SchemeResult<Value> {
        lookup_chain(&self.heap, self.env, symbol)
            .map(|b| self.heap.binding(b).value)
            .ok_or_else(|| SchemeError::UnboundIdentifier(self.symbols.name(symbol).to_string()))
    }

    fn resolve_atom(&self, atom: Value) -> SchemeResult<Value> {
        match atom {
            Value::Symbol(symbol) => self.resolve(symbol),
            other => Ok(other),
        }
    }

    fn step_interpreter(&mut self) -> SchemeResult<()> {
        trace!(target: "ember::engine", depth = self.calls.len(), argc = self.argc, "interpret");
        match self.expr {
            Value::Pair(id) => {
                let Pair { car: head, cdr: rest } = self.heap.pair(id);
                match head {
                    Value::Pair(_) if rest.is_null() && self.in_tail_list() => {
                        self.eval_in_place(head);
                    }
                    Value::Pair(_) => {
                        self.expr = rest;
                        self.call_eval(head)?;
                    }
                    Value::Symbol(symbol) => {
                        let value = self.resolve(symbol)?;
                        if self.argc == 0 {
                            match value {
                                Value::Keyword(keyword) => return self.special_form(keyword, rest),
                                Value::Rules(rules) => return self.expand_macro(rules),
                                _ => {}
                            }
                        }
                        self.expr = rest;
                        self.push(value)?;
                        self.argc += 1;
                    }
                    atom => {
                        self.expr = rest;
                        self.push(atom)?;
                        self.argc += 1;
                    }
                }
                Ok(())
            }
            Value::Null => {
                let base = self.stack.len() - self.argc;
                self.apply(base)
            }
            atom if self.argc > 0 => Err(SchemeError::MalformedSpecialForm(format!(
                "improper argument list ending in {}",
                self.render(atom)
            ))),
            atom => {
                let value = self.resolve_atom(atom)?;
                self.call_return(value)
            }
        }
    }

    // --- special forms ---

    fn malformed(&self, keyword: Keyword, args: Value) -> SchemeError {
        SchemeError::MalformedSpecialForm(format!("({} . {})", keyword.name(), self.render(args)))
    }

    fn form_args(&self, keyword: Keyword, args: Value) -> SchemeResult<Vec<Value>> {
        self.heap
            .list_to_vec(args)
            .ok_or_else(|| self.malformed(keyword, args))
    }

    /// Push the callee (and any operands known up front) for a special
    /// form, then let the list walk or an inner evaluation finish it.
    fn special_form(&mut self, keyword: Keyword, args: Value) -> SchemeResult<()> {
        trace!(target: "ember::engine", form = keyword.name(), "special form");
        let base = self.stack.len();
        let parts = args.as_pair().map(|p| self.heap.pair(p));
        match keyword {
            Keyword::Quote => {
                let [datum] = self.exact_args::<1>(keyword, args)?;
                self.push(Value::Builtin(Builtin::ReturnLast))?;
                self.push(datum)?;
                self.expr = Value::Null;
            }
            Keyword::Lambda => {
                let Some(Pair { car: params, cdr: body }) = parts else {
                    return Err(self.malformed(keyword, args));
                };
                self.check_lambda(keyword, params, body, args)?;
                let closure = self.make_closure(params, body)?;
                self.push(Value::Builtin(Builtin::ReturnLast))?;
                self.push(closure)?;
                self.expr = Value::Null;
            }
            Keyword::Define => {
                let Some(Pair { car: target, cdr: rest }) = parts else {
                    return Err(self.malformed(keyword, args));
                };
                match target {
                    Value::Symbol(_) => {
                        self.exact_args::<1>(keyword, rest)?;
                        self.push(Value::Builtin(Builtin::Define))?;
                        self.push(target)?;
                        self.expr = rest;
                    }
                    // (define (name . params) body ...)
                    Value::Pair(signature) => {
                        let Pair { car: name, cdr: params } = self.heap.pair(signature);
                        if !name.is_symbol() {
                            return Err(self.malformed(keyword, args));
                        }
                        self.check_lambda(keyword, params, rest, args)?;
                        self.push(Value::Builtin(Builtin::Define))?;
                        self.push(name)?;
                        let closure = self.make_closure(params, rest)?;
                        self.push(closure)?;
                        self.expr = Value::Null;
                    }
                    _ => return Err(self.malformed(keyword, args)),
                }
            }
            Keyword::Set | Keyword::DefineSyntax => {
                let [target, _] = self.exact_args::<2>(keyword, args)?;
                let Some(Pair { cdr: rest, .. }) = parts.filter(|_| target.is_symbol()) else {
                    return Err(self.malformed(keyword, args));
                };
                let builtin = match keyword {
                    Keyword::Set => Builtin::SetBang,
                    _ => Builtin::DefineSyntax,
                };
                self.push(Value::Builtin(builtin))?;
                self.push(target)?;
                self.expr = rest;
            }
            Keyword::If => {
                let items = self.form_args(keyword, args)?;
                let (test, then, otherwise) = match items[..] {
                    [test, then] => (test, then, Value::Unspecified),
                    [test, then, otherwise] => (test, then, otherwise),
                    _ => return Err(self.malformed(keyword, args)),
                };
                self.push(Value::Builtin(Builtin::If))?;
                self.push(then)?;
                self.push(otherwise)?;
                self.expr = Value::Null;
                self.argc = 3;
                if test.is_pair() {
                    return self.call_eval(test);
                }
                let value = self.resolve_atom(test)?;
                self.push(value)?;
            }
            Keyword::Begin => {
                if !self.heap.is_proper_list(args) {
                    return Err(self.malformed(keyword, args));
                }
                self.push(Value::Builtin(Builtin::ReturnLast))?;
                self.expr = args;
            }
            Keyword::SyntaxRules => {
                let Some(Pair { car: literals, cdr: clauses }) = parts else {
                    return Err(self.malformed(keyword, args));
                };
                syntax_rules::validate(&self.heap, literals, clauses).map_err(|reason| {
                    SchemeError::MalformedSpecialForm(format!("syntax-rules: {}", reason))
                })?;
                let slot = self.allocate(Object::Rules(SyntaxRules { literals, clauses }))?;
                self.push(Value::Builtin(Builtin::ReturnLast))?;
                self.push(Value::Rules(RulesId(slot)))?;
                self.expr = Value::Null;
            }
        }
        self.argc = self.stack.len() - base;
        Ok(())
    }

    fn exact_args<const N: usize>(&self, keyword: Keyword, args: Value) -> SchemeResult<[Value; N]> {
        self.form_args(keyword, args)?
            .try_into()
            .map_err(|_| self.malformed(keyword, args))
    }

    /// Parameters must be a symbol or a (possibly dotted) list of distinct
    /// symbols, and the body must be a non-empty proper list.
    fn check_lambda(&self, keyword: Keyword, params: Value, body: Value, args: Value) -> SchemeResult<()> {
        let mut seen: SmallVec<[SymbolId; 8]> = SmallVec::new();
        let mut cursor = params;
        loop {
            match cursor {
                Value::Null => break,
                Value::Symbol(symbol) => {
                    seen.push(symbol);
                    break;
                }
                Value::Pair(id) => {
                    let Pair { car, cdr } = self.heap.pair(id);
                    let symbol = car.as_symbol().ok_or_else(|| self.malformed(keyword, args))?;
                    seen.push(symbol);
                    cursor = cdr;
                }
                _ => return Err(self.malformed(keyword, args)),
            }
        }
        let mut sorted = seen.clone();
        sorted.sort();
        sorted.dedup();
        if sorted.len() != seen.len() || body.is_null() || !self.heap.is_proper_list(body) {
            return Err(self.malformed(keyword, args));
        }
        Ok(())
    }

    fn make_closure(&mut self, params: Value, body: Value) -> SchemeResult<Value> {
        let slot = self.allocate(Object::Closure(Closure::interpreted(params, body, self.env)))?;
        Ok(Value::Closure(ClosureId(slot)))
    }

    /// Replace the current form with its expansion and keep going.
    fn expand_macro(&mut self, rules: RulesId) -> SchemeResult<()> {
        let form = self.expr;
        let expansion = syntax_rules::expand(self, rules, form)?
            .ok_or_else(|| SchemeError::NoMatchingMacroClause(self.render(form)))?;
        trace!(target: "ember::engine", expansion = %self.render(expansion), "expanded");
        self.eval_in_place(expansion);
        Ok(())
    }

    // --- application ---

    /// Apply the callee at `base` to everything above it.
    fn apply(&mut self, base: usize) -> SchemeResult<()> {
        let Some(&callee) = self.stack.get(base) else {
            return Err(SchemeError::ApplyError("()".into()));
        };
        match callee {
            Value::Builtin(builtin) => match self.call_builtin(builtin, base)? {
                Flow::Return(value) => self.call_return(value),
                Flow::Eval(expr) => {
                    self.stack.truncate(base);
                    self.argc = 0;
                    self.expr = expr;
                    self.mode = RunMode::Interpreting;
                    Ok(())
                }
            },
            Value::Closure(id) => self.apply_closure(id, base),
            other => Err(SchemeError::ApplyError(self.render(other))),
        }
    }

    fn apply_closure(&mut self, id: ClosureId, base: usize) -> SchemeResult<()> {
        let threshold = self.config.compile_threshold;
        let closure = self.heap.closure_mut(id);
        closure.calls = closure.calls.saturating_add(1);
        let hot = threshold > 0
            && closure.calls >= threshold
            && matches!(&closure.code, ClosureCode::Interpreted(l) if !l.compile_failed);
        if hot {
            self.try_compile(id);
        }

        match &self.heap.closure(id).code {
            ClosureCode::Compiled(compiled) if self.syntax_in_arguments(base) => {
                // Syntax arriving as an argument may be applied by name, which
                // only the list-walking interpreter dispatches.
                let lambda = Lambda {
                    params: compiled.params,
                    body: compiled.body,
                    env: compiled.env,
                    compile_failed: false,
                };
                self.enter_interpreted(id, base, lambda)
            }
            ClosureCode::Compiled(compiled) => {
                let shape = (compiled.arity, compiled.locals, compiled.required_stack, compiled.env);
                self.enter_compiled(id, base, shape)
            }
            ClosureCode::Interpreted(lambda) => {
                let lambda = *lambda;
                self.enter_interpreted(id, base, lambda)
            }
        }
    }

    fn syntax_in_arguments(&self, base: usize) -> bool {
        self.stack[base + 1..]
            .iter()
            .any(|v| matches!(v, Value::Keyword(_) | Value::Rules(_)))
    }

    fn enter_compiled(
        &mut self,
        id: ClosureId,
        base: usize,
        (arity, locals, required, env): (usize, usize, usize, FrameId),
    ) -> SchemeResult<()> {
        let argc = self.stack.len() - base - 1;
        if argc != arity {
            return Err(SchemeError::ArityError {
                name: "#<procedure>".into(),
                expected: arity.to_string(),
                got: argc,
            });
        }
        if self.stack.len() + locals + required > self.config.max_stack {
            return Err(SchemeError::StackExhausted(self.stack.len()));
        }
        self.stack.resize(self.stack.len() + locals, Value::Unspecified);
        self.stack.reserve(required);
        self.closure = Some(id);
        self.base = base + 1;
        self.ip = 0;
        self.env = env;
        self.expr = Value::Null;
        self.mode = RunMode::Bytecode;
        Ok(())
    }

    fn enter_interpreted(&mut self, id: ClosureId, base: usize, lambda: Lambda) -> SchemeResult<()> {
        let frame = create_frame(self, Some(lambda.env))?;
        self.env = frame;
        self.bind_params(frame, lambda.params, base)?;
        self.stack.truncate(base);
        self.stack.push(Value::Builtin(Builtin::ReturnLast));
        self.argc = 1;
        self.expr = lambda.body;
        self.closure = Some(id);
        self.mode = RunMode::Interpreting;
        Ok(())
    }

    fn bind_params(&mut self, frame: FrameId, params: Value, base: usize) -> SchemeResult<()> {
        let end = self.stack.len();
        let argc = end - base - 1;
        let (required, variadic) = param_shape(&self.heap, params);
        let accepted = if variadic { argc >= required } else { argc == required };
        if !accepted {
            return Err(SchemeError::ArityError {
                name: "#<procedure>".into(),
                expected: if variadic {
                    format!("at least {}", required)
                } else {
                    required.to_string()
                },
                got: argc,
            });
        }

        let mut index = base + 1;
        let mut cursor = params;
        loop {
            match cursor {
                Value::Pair(id) => {
                    let Pair { car, cdr } = self.heap.pair(id);
                    if let Value::Symbol(symbol) = car {
                        let value = self.stack[index];
                        bind(self, frame, symbol, value)?;
                    }
                    index += 1;
                    cursor = cdr;
                }
                Value::Symbol(rest) => {
                    let items: SmallVec<[Value; 8]> = SmallVec::from_slice(&self.stack[index..end]);
                    let list = self.list(&items)?;
                    let mark = self.protected();
                    self.protect(list);
                    let bound = bind(self, frame, rest, list);
                    self.release(mark);
                    return bound.map(|_| ());
                }
                _ => return Ok(()),
            }
        }
    }

    // --- bytecode ---

    fn compiled(&self, id: ClosureId) -> &Compiled {
        match &self.heap.closure(id).code {
            ClosureCode::Compiled(compiled) => compiled,
            ClosureCode::Interpreted(_) => unreachable!("bytecode mode in an interpreted closure"),
        }
    }

    fn step_bytecode(&mut self) -> SchemeResult<()> {
        let Some(id) = self.closure else {
            unreachable!("bytecode mode without a closure");
        };
        let instr = self.compiled(id).code[self.ip];
        trace!(target: "ember::engine", ip = self.ip, ?instr, "execute");
        let delta = self.execute(id, instr)?;
        self.ip = self.ip.wrapping_add_signed(delta);
        Ok(())
    }

    /// Run one instruction and report how far the instruction pointer
    /// moves. Transfers report zero: they have already set it.
    fn execute(&mut self, id: ClosureId, instr: Instr) -> SchemeResult<isize> {
        match instr {
            Instr::PushConst(value) => self.push(value)?,
            Instr::StackRef(slot) => {
                let value = self.stack[self.base + slot as usize];
                self.push(value)?;
            }
            Instr::StackSet(slot) => {
                let value = self.pop();
                self.stack[self.base + slot as usize] = value;
                self.push(Value::Unspecified)?;
            }
            Instr::CaptureRef(index) => {
                let binding = self.compiled(id).captures[index as usize];
                let value = self.heap.binding(binding).value;
                self.push(value)?;
            }
            Instr::CaptureSet(index) => {
                let binding = self.compiled(id).captures[index as usize];
                let value = self.pop();
                self.heap.binding_mut(binding).value = value;
                self.push(Value::Unspecified)?;
            }
            Instr::ScopeRef(symbol) => {
                let binding = self.scope_binding(symbol)?;
                let value = self.heap.binding(binding).value;
                self.push(value)?;
            }
            Instr::ScopeSet(symbol) => {
                let binding = self.scope_binding(symbol)?;
                let value = self.pop();
                self.heap.binding_mut(binding).value = value;
                self.push(Value::Unspecified)?;
            }
            Instr::EnterScope => self.enter_scope(id)?,
            Instr::MakeClosure(index) => {
                let template = self.compiled(id).lambdas[index as usize];
                let closure = self.make_closure(template.params, template.body)?;
                self.push(closure)?;
            }
            Instr::Pop => {
                self.pop();
            }
            Instr::Jump(offset) => return Ok(offset as isize),
            Instr::JumpIfFalse(offset) => {
                if !self.pop().is_truthy() {
                    return Ok(offset as isize);
                }
            }
            Instr::Call(argc) => {
                let callee = self.stack.len() - argc as usize - 1;
                let resume = Resume::Bytecode {
                    ip: self.ip + 1,
                    base: self.base,
                };
                self.push_frame(callee, resume)?;
                self.apply(callee)?;
                return Ok(0);
            }
            Instr::TailCall(argc) => {
                let count = argc as usize + 1;
                let start = self.stack.len() - count;
                let callee = self.base - 1;
                self.stack.copy_within(start.., callee);
                self.stack.truncate(callee + count);
                self.apply(callee)?;
                return Ok(0);
            }
            Instr::Return => {
                let value = self.pop();
                self.call_return(value)?;
                return Ok(0);
            }
        }
        Ok(1)
    }

    fn scope_binding(&self, symbol: SymbolId) -> SchemeResult<BindingId> {
        lookup_local(&self.heap, self.env, symbol)
            .ok_or_else(|| SchemeError::UnboundIdentifier(self.symbols.name(symbol).to_string()))
    }

    fn enter_scope(&mut self, id: ClosureId) -> SchemeResult<()> {
        let boxed: SmallVec<[Boxed; 8]> = SmallVec::from_slice(&self.compiled(id).boxed);
        let parent = self.env;
        let frame = create_frame(self, Some(parent))?;
        self.env = frame;
        for entry in boxed {
            let value = match entry.param {
                Some(slot) => self.stack[self.base + slot as usize],
                None => Value::Unspecified,
            };
            bind(self, frame, entry.symbol, value)?;
        }
        Ok(())
    }
}

/// Number of required parameters and whether a rest parameter follows.
fn param_shape(heap: &Heap, params: Value) -> (usize, bool) {
    let mut required = 0;
    let mut cursor = params;
    loop {
        match cursor {
            Value::Pair(id) => {
                required += 1;
                cursor = heap.cdr(id);
            }
            Value::Symbol(_) => return (required, true),
            _ => return (required, false),
        }
    }
}

impl Mutator for Engine {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Allocate, collecting once if the arena is full. The pending object's
    /// children count as roots for that collection.
    fn allocate(&mut self, object: Object) -> SchemeResult<u32> {
        let object = match self.heap.try_alloc(object) {
            Ok(slot) => return Ok(slot),
            Err(object) => object,
        };
        let stats = self.collect_with(Some(&object));
        let requested = object.words();
        self.heap.try_alloc(object).map_err(|_| {
            warn!(
                target: "ember::gc",
                requested,
                live_words = stats.live_words,
                capacity = self.heap.capacity(),
                "allocation failed after collection"
            );
            SchemeError::OutOfMemory { requested }
        })
    }

    fn protect(&mut self, value: Value) {
        self.scratch.push(value);
    }

    fn protected(&self) -> usize {
        self.scratch.len()
    }

    fn release(&mut self, mark: usize) {
        self.scratch.truncate(mark);
    }
}

impl ReaderHost for Engine {
    fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default()).unwrap()
    }

    fn eval(engine: &mut Engine, text: &str) -> String {
        let value = engine.eval_str(text).unwrap();
        engine.render(value)
    }

    #[test]
    fn globals_are_installed() {
        let engine = engine();
        assert_eq!(engine.lookup_global("if"), Some(Value::Keyword(Keyword::If)));
        assert_eq!(engine.lookup_global("car"), Some(Value::Builtin(Builtin::Car)));
        assert_eq!(engine.lookup_global("return-last"), None);
    }

    #[test]
    fn atoms_evaluate_to_themselves_or_their_binding() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "42"), "42");
        assert_eq!(eval(&mut engine, "#t"), "#t");
        assert_eq!(eval(&mut engine, "car"), "#<primitive car>");
    }

    #[test]
    fn if_selects_a_branch() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "(if #f 1 2)"), "2");
        assert_eq!(eval(&mut engine, "(if '() 1 2)"), "1");
        assert_eq!(eval(&mut engine, "(if (eq? 1 1) 'yes 'no)"), "yes");
        assert_eq!(eval(&mut engine, "(if #f #f)"), "#<unspecified>");
    }

    #[test]
    fn begin_returns_its_last_value() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "(begin 1 2 (+ 1 2))"), "3");
    }

    #[test]
    fn rest_parameters_collect_extra_arguments() {
        let mut engine = engine();
        assert_eq!(eval(&mut engine, "((lambda (a . rest) rest) 1 2 3)"), "(2 3)");
        assert_eq!(eval(&mut engine, "((lambda args args))"), "()");
    }

    #[test]
    fn define_shorthand_builds_a_closure() {
        let mut engine = engine();
        eval(&mut engine, "(define (square x) (* x x))");
        assert_eq!(eval(&mut engine, "(square 9)"), "81");
    }

    #[test]
    fn errors_halt_until_reset() {
        let mut engine = engine();
        let err = engine.eval_str("(car 1)").unwrap_err();
        assert!(matches!(err, SchemeError::TypeError(_)));
        assert!(matches!(
            engine.eval_str("1").unwrap_err(),
            SchemeError::Halted(_)
        ));
        engine.reset();
        assert_eq!(eval(&mut engine, "1"), "1");
    }

    #[test]
    fn arity_is_checked_for_closures() {
        let mut engine = engine();
        let err = engine.eval_str("((lambda (x) x))").unwrap_err();
        assert_eq!(
            err,
            SchemeError::ArityError {
                name: "#<procedure>".into(),
                expected: "1".into(),
                got: 0
            }
        );
    }

    #[test]
    fn pins_survive_collection() {
        let mut engine = engine();
        let list = engine.eval_str("(list 1 2 3)").unwrap();
        let pin = engine.pin(list);
        engine.collect_garbage();
        assert_eq!(engine.render(engine.pinned(&pin)), "(1 2 3)");
        engine.unpin(pin);
    }

    #[test]
    fn hot_closures_are_compiled() {
        let mut engine = engine();
        eval(&mut engine, "(define (add a b) (+ a b))");
        for _ in 0..3 {
            assert_eq!(eval(&mut engine, "(add 2 3)"), "5");
        }
        let add = engine.lookup_global("add").unwrap();
        assert!(engine.is_compiled(add));
        assert_eq!(engine.stats().compiled, 1);
    }
}
