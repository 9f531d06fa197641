use crate::engine::Engine;
use crate::env::lookup_chain;
use crate::error::{CompileError, SchemeError};
use crate::heap::{Mutator, Pair};
use crate::printer;
use crate::syntax_rules;
use crate::value::{BindingId, FrameId, Keyword, RulesId, SymbolId, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    /// Positional argument, read from the operand stack.
    Parameter,
    /// Argument an inner closure may observe; lives in the invocation scope.
    MutableParameter,
    /// Binding captured from the defining environment.
    Closure,
    /// Leading body `define`, held in a stack slot after the parameters.
    Local,
    /// Local an inner closure may observe; lives in the invocation scope.
    MutableLocal,
}

impl Class {
    fn boxed(self) -> Class {
        match self {
            Class::Parameter => Class::MutableParameter,
            Class::Local => Class::MutableLocal,
            other => other,
        }
    }

    fn is_frame_slot(self) -> bool {
        !matches!(self, Class::Closure)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ScopeNode {
    pub symbol: SymbolId,
    pub class: Class,
    /// Stack slot relative to the first argument, or capture-table index.
    pub slot: u32,
}

pub type NodeId = usize;

/// A body expression with every identifier resolved to a scope node.
#[derive(Debug)]
pub enum Node {
    Const(Value),
    Ref(NodeId),
    Set(NodeId, Box<Node>),
    Define(NodeId, Box<Node>),
    If(Box<Node>, Box<Node>, Option<Box<Node>>),
    Begin(Vec<Node>),
    /// An inner lambda, created at run time as an interpreted closure.
    Lambda { params: Value, body: Value },
    /// Callee followed by arguments.
    Apply(Vec<Node>),
}

/// A resolved closure body. References point into `scope`, whose classes
/// can still change after a reference is recorded (a parameter becomes
/// boxed once an inner lambda mentions it); the code generator only reads
/// the final state.
#[derive(Debug)]
pub struct Resolved {
    pub arity: usize,
    pub locals: usize,
    pub scope: Vec<ScopeNode>,
    pub captures: Vec<BindingId>,
    pub body: Vec<Node>,
}

enum Definition {
    Expr(Value),
    Procedure { params: Value, body: Value },
}

enum Syntax {
    Keyword(Keyword),
    Macro(RulesId),
}

/// Resolve the body of a closure defined in `env`.
///
/// Macro expansions produced on the way are protected on the engine; the
/// caller releases them once the compiled code is installed.
pub fn resolve(
    engine: &mut Engine,
    params: Value,
    body: Value,
    env: FrameId,
) -> Result<Resolved, CompileError> {
    let mut resolver = Resolver {
        engine,
        env,
        scope: Vec::new(),
        captures: Vec::new(),
        arity: 0,
        locals: 0,
    };
    resolver.register_params(params)?;

    let forms = resolver
        .engine
        .heap()
        .list_to_vec(body)
        .filter(|forms| !forms.is_empty())
        .ok_or(CompileError::Malformed("closure body".into()))?;

    // Leading defines are registered before any body is walked, so sibling
    // definitions may refer to each other.
    let mut definitions = Vec::new();
    for &form in &forms {
        match resolver.definition(form)? {
            Some(def) => definitions.push(def),
            None => break,
        }
    }
    resolver.check_definition_order(&definitions)?;
    let nodes: Vec<NodeId> = definitions
        .iter()
        .map(|(name, _)| resolver.register_local(*name))
        .collect();

    let mut body = Vec::with_capacity(forms.len());
    let leading = definitions.len();
    for (node, (_, def)) in nodes.into_iter().zip(definitions) {
        let value = match def {
            Definition::Expr(expr) => resolver.expr(expr)?,
            Definition::Procedure { params, body } => resolver.lambda(params, body)?,
        };
        body.push(Node::Define(node, Box::new(value)));
    }
    for &form in &forms[leading..] {
        body.push(resolver.expr(form)?);
    }

    Ok(Resolved {
        arity: resolver.arity,
        locals: resolver.locals,
        scope: resolver.scope,
        captures: resolver.captures,
        body,
    })
}

struct Resolver<'e> {
    engine: &'e mut Engine,
    env: FrameId,
    scope: Vec<ScopeNode>,
    captures: Vec<BindingId>,
    arity: usize,
    locals: usize,
}

impl Resolver<'_> {
    fn name(&self, symbol: SymbolId) -> String {
        self.engine.symbols.name(symbol).to_string()
    }

    fn pair(&self, value: Value) -> Option<Pair> {
        value.as_pair().map(|id| self.engine.heap().pair(id))
    }

    fn list(&self, value: Value, what: &str) -> Result<Vec<Value>, CompileError> {
        self.engine
            .heap()
            .list_to_vec(value)
            .ok_or_else(|| CompileError::Malformed(what.to_string()))
    }

    fn register_params(&mut self, params: Value) -> Result<(), CompileError> {
        let list = self
            .engine
            .heap()
            .list_to_vec(params)
            .ok_or(CompileError::Unsupported("rest parameters"))?;
        for param in list {
            let Value::Symbol(symbol) = param else {
                return Err(CompileError::Malformed("parameter is not a symbol".into()));
            };
            if self.frame_slot(symbol).is_some() {
                return Err(CompileError::Malformed(format!(
                    "duplicate parameter {}",
                    self.name(symbol)
                )));
            }
            self.scope.push(ScopeNode {
                symbol,
                class: Class::Parameter,
                slot: self.arity as u32,
            });
            self.arity += 1;
        }
        Ok(())
    }

    /// A `define` sharing a parameter's name writes the parameter.
    fn register_local(&mut self, symbol: SymbolId) -> NodeId {
        if let Some(id) = self.frame_slot(symbol) {
            return id;
        }
        self.scope.push(ScopeNode {
            symbol,
            class: Class::Local,
            slot: (self.arity + self.locals) as u32,
        });
        self.locals += 1;
        self.scope.len() - 1
    }

    /// Parameter or local named `symbol`.
    fn frame_slot(&self, symbol: SymbolId) -> Option<NodeId> {
        self.scope
            .iter()
            .position(|n| n.symbol == symbol && n.class.is_frame_slot())
    }

    fn global_value(&self, symbol: SymbolId) -> Option<Value> {
        let heap = self.engine.heap();
        lookup_chain(heap, self.env, symbol).map(|b| heap.binding(b).value)
    }

    /// Special-form keyword or macro named by `head`, unless a parameter
    /// or local shadows it.
    fn syntax_of(&self, head: Value) -> Option<Syntax> {
        let symbol = head.as_symbol()?;
        if self.frame_slot(symbol).is_some() {
            return None;
        }
        match self.global_value(symbol)? {
            Value::Keyword(keyword) => Some(Syntax::Keyword(keyword)),
            Value::Rules(rules) => Some(Syntax::Macro(rules)),
            _ => None,
        }
    }

    /// Resolve an identifier: lexical scope first, then the defining
    /// environment, where a hit becomes a capture slot.
    fn reference(&mut self, symbol: SymbolId) -> Result<NodeId, CompileError> {
        if let Some(id) = self.scope.iter().position(|n| n.symbol == symbol) {
            return Ok(id);
        }
        let binding = lookup_chain(self.engine.heap(), self.env, symbol)
            .ok_or_else(|| CompileError::UnresolvedIdentifier(self.name(symbol)))?;

        if let Some(index) = self.captures.iter().position(|&b| b == binding) {
            if let Some(id) = self
                .scope
                .iter()
                .position(|n| n.class == Class::Closure && n.slot as usize == index)
            {
                return Ok(id);
            }
        }
        self.captures.push(binding);
        self.scope.push(ScopeNode {
            symbol,
            class: Class::Closure,
            slot: (self.captures.len() - 1) as u32,
        });
        Ok(self.scope.len() - 1)
    }

    /// Recognise a `define` form and split it into name and value.
    fn definition(&self, form: Value) -> Result<Option<(SymbolId, Definition)>, CompileError> {
        let Some(Pair { car: head, cdr: args }) = self.pair(form) else {
            return Ok(None);
        };
        if !matches!(self.syntax_of(head), Some(Syntax::Keyword(Keyword::Define))) {
            return Ok(None);
        }
        let malformed = || CompileError::Malformed("define".into());
        let Pair { car: target, cdr: rest } = self.pair(args).ok_or_else(malformed)?;
        match target {
            Value::Symbol(name) => {
                let [expr]: [Value; 1] = self.list(rest, "define")?.try_into().map_err(|_| malformed())?;
                Ok(Some((name, Definition::Expr(expr))))
            }
            Value::Pair(sig) => {
                let Pair { car: name, cdr: params } = self.engine.heap().pair(sig);
                let name = name.as_symbol().ok_or_else(malformed)?;
                Ok(Some((name, Definition::Procedure { params, body: rest })))
            }
            _ => Err(malformed()),
        }
    }

    fn expr(&mut self, form: Value) -> Result<Node, CompileError> {
        match form {
            Value::Symbol(symbol) => {
                let id = self.reference(symbol)?;
                let node = self.scope[id];
                if node.class == Class::Closure {
                    let binding = self.captures[node.slot as usize];
                    if matches!(
                        self.engine.heap().binding(binding).value,
                        Value::Keyword(_) | Value::Rules(_)
                    ) {
                        return Err(CompileError::Unsupported("syntax used as a value"));
                    }
                }
                Ok(Node::Ref(id))
            }
            Value::Pair(id) => {
                let Pair { car: head, cdr: args } = self.engine.heap().pair(id);
                match self.syntax_of(head) {
                    Some(Syntax::Keyword(keyword)) => self.special(keyword, args),
                    Some(Syntax::Macro(rules)) => {
                        let expansion = self.expand(rules, form)?;
                        self.expr(expansion)
                    }
                    None => {
                        let items = self.list(form, "improper application")?;
                        let nodes = items
                            .into_iter()
                            .map(|item| self.expr(item))
                            .collect::<Result<_, _>>()?;
                        Ok(Node::Apply(nodes))
                    }
                }
            }
            Value::Null => Err(CompileError::Malformed("empty application".into())),
            other => Ok(Node::Const(other)),
        }
    }

    fn expand(&mut self, rules: RulesId, form: Value) -> Result<Value, CompileError> {
        let expansion = syntax_rules::expand(&mut *self.engine, rules, form)
            .map_err(CompileError::Expansion)?
            .ok_or_else(|| {
                let text = printer::render(self.engine.heap(), &self.engine.symbols, form);
                CompileError::Expansion(SchemeError::NoMatchingMacroClause(text))
            })?;
        self.engine.protect(expansion);
        Ok(expansion)
    }

    fn special(&mut self, keyword: Keyword, args: Value) -> Result<Node, CompileError> {
        let items = self.list(args, keyword.name())?;
        let malformed = || CompileError::Malformed(keyword.name().to_string());
        match keyword {
            Keyword::Quote => match items[..] {
                [datum] => Ok(Node::Const(datum)),
                _ => Err(malformed()),
            },
            Keyword::If => match items[..] {
                [test, then] => Ok(Node::If(
                    Box::new(self.expr(test)?),
                    Box::new(self.expr(then)?),
                    None,
                )),
                [test, then, otherwise] => Ok(Node::If(
                    Box::new(self.expr(test)?),
                    Box::new(self.expr(then)?),
                    Some(Box::new(self.expr(otherwise)?)),
                )),
                _ => Err(malformed()),
            },
            Keyword::Begin => {
                let nodes = items
                    .into_iter()
                    .map(|item| self.expr(item))
                    .collect::<Result<_, _>>()?;
                Ok(Node::Begin(nodes))
            }
            Keyword::Set => match items[..] {
                [Value::Symbol(target), value] => {
                    let node = self.reference(target)?;
                    Ok(Node::Set(node, Box::new(self.expr(value)?)))
                }
                _ => Err(malformed()),
            },
            Keyword::Lambda => match self.pair(args) {
                Some(Pair { car: params, cdr: body }) => self.lambda(params, body),
                None => Err(malformed()),
            },
            Keyword::Define => {
                let name = items
                    .first()
                    .and_then(|&target| match target {
                        Value::Symbol(s) => Some(s),
                        Value::Pair(sig) => self.engine.heap().car(sig).as_symbol(),
                        _ => None,
                    })
                    .map(|s| self.name(s))
                    .unwrap_or_default();
                Err(CompileError::DefineNotAtTopLevel(name))
            }
            Keyword::DefineSyntax | Keyword::SyntaxRules => {
                Err(CompileError::Unsupported("syntax definitions"))
            }
        }
    }

    /// An inner lambda stays interpreted. Any parameter or local it might
    /// mention moves into the invocation scope so the two can share it.
    fn lambda(&mut self, params: Value, body: Value) -> Result<Node, CompileError> {
        match self.engine.heap().list_to_vec(body) {
            Some(forms) if !forms.is_empty() => {}
            _ => return Err(CompileError::Malformed("lambda body".into())),
        }
        self.box_mentioned(params);
        self.box_mentioned(body);
        Ok(Node::Lambda { params, body })
    }

    fn box_mentioned(&mut self, form: Value) {
        let (symbols, uses_macro) = self.mentioned(form);
        for symbol in symbols {
            if let Some(id) = self.frame_slot(symbol) {
                self.scope[id].class = self.scope[id].class.boxed();
            }
        }
        // A macro template can name anything; box the whole frame.
        if uses_macro {
            for node in &mut self.scope {
                node.class = node.class.boxed();
            }
        }
    }

    /// Every symbol occurring in `form`, and whether any of them names a
    /// macro not shadowed by a parameter or local.
    fn mentioned(&self, form: Value) -> (Vec<SymbolId>, bool) {
        let mut symbols = Vec::new();
        let mut pending = vec![form];
        let mut uses_macro = false;
        while let Some(value) = pending.pop() {
            match value {
                Value::Symbol(symbol) => {
                    if self.frame_slot(symbol).is_none() {
                        uses_macro |= matches!(self.global_value(symbol), Some(Value::Rules(_)));
                    }
                    if !symbols.contains(&symbol) {
                        symbols.push(symbol);
                    }
                }
                Value::Pair(id) => {
                    let pair = self.engine.heap().pair(id);
                    pending.push(pair.cdr);
                    pending.push(pair.car);
                }
                _ => {}
            }
        }
        (symbols, uses_macro)
    }

    /// A definition whose value is a procedure runs none of its body when
    /// the definition is evaluated.
    fn is_deferred(&self, definition: &Definition) -> bool {
        match *definition {
            Definition::Procedure { .. } => true,
            Definition::Expr(expr) => self
                .pair(expr)
                .is_some_and(|p| matches!(self.syntax_of(p.car), Some(Syntax::Keyword(Keyword::Lambda)))),
        }
    }

    /// Fail when evaluating a definition's value could read a sibling that
    /// is not defined yet, directly or through a procedure it calls. The
    /// interpreter resolves such a read past the invocation frame, which a
    /// preallocated slot cannot reproduce. Must run before the locals are
    /// registered, so only parameters shadow sibling names.
    fn check_definition_order(&self, definitions: &[(SymbolId, Definition)]) -> Result<(), CompileError> {
        let sibling = |symbol: SymbolId| {
            if self.frame_slot(symbol).is_some() {
                return None;
            }
            definitions.iter().position(|(name, _)| *name == symbol)
        };
        let mentions: Vec<(Vec<usize>, bool)> = definitions
            .iter()
            .map(|(_, def)| {
                let form = match *def {
                    Definition::Expr(expr) => expr,
                    Definition::Procedure { body, .. } => body,
                };
                let (symbols, uses_macro) = self.mentioned(form);
                (symbols.into_iter().filter_map(&sibling).collect(), uses_macro)
            })
            .collect();

        for (index, (_, def)) in definitions.iter().enumerate() {
            if self.is_deferred(def) {
                continue;
            }
            let mut seen = vec![false; definitions.len()];
            let mut work = vec![index];
            while let Some(at) = work.pop() {
                let (siblings, uses_macro) = &mentions[at];
                if *uses_macro {
                    return Err(CompileError::Unsupported("macro use in a body definition"));
                }
                for &other in siblings {
                    if other >= index {
                        return Err(CompileError::Unsupported("forward reference to a body definition"));
                    }
                    if !seen[other] {
                        seen[other] = true;
                        work.push(other);
                    }
                }
            }
        }
        Ok(())
    }
}
