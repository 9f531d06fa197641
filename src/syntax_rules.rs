use smallvec::SmallVec;

use crate::error::{SchemeError, SchemeResult};
use crate::heap::{Heap, Mutator};
use crate::symbol::sym;
use crate::value::{RulesId, SymbolId, Value};

/// A `syntax-rules` transformer: the literal keywords and the
/// `(pattern template)` clauses, both kept as the lists they were written
/// as. The first clause whose pattern matches wins. Expansion is not
/// hygienic; template symbols are copied verbatim.
pub struct SyntaxRules {
    pub literals: Value,
    pub clauses: Value,
}

#[derive(Clone, Debug)]
enum Bound {
    One(Value),
    /// One entry per element matched by an ellipsis.
    Many(Vec<Bound>),
}

type Bindings = SmallVec<[(SymbolId, Bound); 8]>;

/// Check the shape of `(syntax-rules (literal ...) (pattern template) ...)`.
pub fn validate(heap: &Heap, literals: Value, clauses: Value) -> Result<(), &'static str> {
    let literals = heap
        .list_to_vec(literals)
        .ok_or("literal list must be a proper list")?;
    if !literals.iter().all(|v| v.is_symbol()) {
        return Err("literals must be symbols");
    }
    let clauses = heap
        .list_to_vec(clauses)
        .ok_or("clauses must form a proper list")?;
    for clause in clauses {
        match heap.list_to_vec(clause) {
            Some(parts) if parts.len() == 2 && parts[0].is_pair() => {}
            _ => return Err("each clause must be (pattern template)"),
        }
    }
    Ok(())
}

/// Expand `form` with the first matching clause of `rules`.
/// Returns `Ok(None)` when no clause matches.
pub fn expand<M: Mutator>(m: &mut M, rules: RulesId, form: Value) -> SchemeResult<Option<Value>> {
    let heap = m.heap();
    let transformer = heap.rules(rules);
    let literals: SmallVec<[SymbolId; 4]> = heap
        .list_to_vec(transformer.literals)
        .unwrap_or_default()
        .into_iter()
        .filter_map(Value::as_symbol)
        .collect();
    let clauses = heap.list_to_vec(transformer.clauses).unwrap_or_default();

    let matched = clauses.into_iter().find_map(|clause| {
        let parts = heap.list_to_vec(clause)?;
        let mut bindings = Bindings::new();
        match_form(heap, &literals, parts[0], form, &mut bindings).then_some((parts[1], bindings))
    });
    let Some((template, bindings)) = matched else {
        return Ok(None);
    };

    let mark = m.protected();
    let result = instantiate(m, template, &bindings);
    m.release(mark);
    result.map(Some)
}

/// The keyword position of the pattern is ignored.
fn match_form(
    heap: &Heap,
    literals: &[SymbolId],
    pattern: Value,
    form: Value,
    out: &mut Bindings,
) -> bool {
    match (pattern, form) {
        (Value::Pair(p), Value::Pair(f)) => {
            match_pattern(heap, literals, heap.cdr(p), heap.cdr(f), out)
        }
        _ => false,
    }
}

fn match_pattern(
    heap: &Heap,
    literals: &[SymbolId],
    pattern: Value,
    input: Value,
    out: &mut Bindings,
) -> bool {
    match pattern {
        Value::Symbol(s) if s == sym::UNDERSCORE => true,
        Value::Symbol(s) if literals.contains(&s) => input == pattern,
        Value::Symbol(s) => {
            out.push((s, Bound::One(input)));
            true
        }
        Value::Pair(p) => {
            let pair = heap.pair(p);
            if let Value::Pair(next) = pair.cdr {
                let next = heap.pair(next);
                if next.car == Value::Symbol(sym::ELLIPSIS) {
                    return next.cdr.is_null()
                        && match_ellipsis(heap, literals, pair.car, input, out);
                }
            }
            match input {
                Value::Pair(i) => {
                    let item = heap.pair(i);
                    match_pattern(heap, literals, pair.car, item.car, out)
                        && match_pattern(heap, literals, pair.cdr, item.cdr, out)
                }
                _ => false,
            }
        }
        other => other == input,
    }
}

/// Match every element of the remaining input list against `sub`.
fn match_ellipsis(
    heap: &Heap,
    literals: &[SymbolId],
    sub: Value,
    input: Value,
    out: &mut Bindings,
) -> bool {
    let Some(items) = heap.list_to_vec(input) else {
        return false;
    };
    let mut per_item: Vec<Bindings> = Vec::with_capacity(items.len());
    for item in items {
        let mut bindings = Bindings::new();
        if !match_pattern(heap, literals, sub, item, &mut bindings) {
            return false;
        }
        per_item.push(bindings);
    }

    let mut vars = Vec::new();
    pattern_vars(heap, literals, sub, &mut vars);
    for var in vars {
        let seq = per_item
            .iter_mut()
            .filter_map(|b| take(b, var))
            .collect();
        out.push((var, Bound::Many(seq)));
    }
    true
}

fn pattern_vars(heap: &Heap, literals: &[SymbolId], pattern: Value, out: &mut Vec<SymbolId>) {
    match pattern {
        Value::Symbol(s) => {
            if s != sym::UNDERSCORE && s != sym::ELLIPSIS && !literals.contains(&s) {
                out.push(s);
            }
        }
        Value::Pair(p) => {
            let pair = heap.pair(p);
            pattern_vars(heap, literals, pair.car, out);
            pattern_vars(heap, literals, pair.cdr, out);
        }
        _ => {}
    }
}

fn take(bindings: &mut Bindings, var: SymbolId) -> Option<Bound> {
    let index = bindings.iter().position(|(s, _)| *s == var)?;
    Some(bindings.remove(index).1)
}

fn lookup(bindings: &Bindings, var: SymbolId) -> Option<&Bound> {
    bindings.iter().find(|(s, _)| *s == var).map(|(_, b)| b)
}

fn instantiate<M: Mutator>(m: &mut M, template: Value, bindings: &Bindings) -> SchemeResult<Value> {
    match template {
        Value::Symbol(s) => match lookup(bindings, s) {
            Some(Bound::One(v)) => Ok(*v),
            Some(Bound::Many(_)) => Err(SchemeError::MalformedSpecialForm(
                "pattern variable bound under an ellipsis used without one".into(),
            )),
            None => Ok(template),
        },
        Value::Pair(_) => {
            let mut items = Vec::new();
            let mut current = template;
            let tail = loop {
                let Value::Pair(p) = current else {
                    break instantiate(m, current, bindings)?;
                };
                let pair = m.heap().pair(p);
                let repeated = match pair.cdr {
                    Value::Pair(next) => {
                        let next = m.heap().pair(next);
                        (next.car == Value::Symbol(sym::ELLIPSIS)).then_some(next.cdr)
                    }
                    _ => None,
                };
                match repeated {
                    Some(after) => {
                        for value in instantiate_ellipsis(m, pair.car, bindings)? {
                            items.push(value);
                        }
                        current = after;
                    }
                    None => {
                        let value = instantiate(m, pair.car, bindings)?;
                        m.protect(value);
                        items.push(value);
                        current = pair.cdr;
                    }
                }
            };
            m.protect(tail);
            m.list_with_tail(&items, tail)
        }
        other => Ok(other),
    }
}

/// Variables in `template` bound under an ellipsis, each listed once.
fn ellipsis_vars(heap: &Heap, template: Value, bindings: &Bindings) -> Vec<SymbolId> {
    let mut mentioned = Vec::new();
    pattern_vars(heap, &[], template, &mut mentioned);
    let mut vars = Vec::new();
    for var in mentioned {
        if !vars.contains(&var) && matches!(lookup(bindings, var), Some(Bound::Many(_))) {
            vars.push(var);
        }
    }
    vars
}

/// Instantiate `template` once per element bound by the ellipsis variables
/// it mentions.
fn instantiate_ellipsis<M: Mutator>(
    m: &mut M,
    template: Value,
    bindings: &Bindings,
) -> SchemeResult<Vec<Value>> {
    let vars = ellipsis_vars(m.heap(), template, bindings);

    let mut len = None;
    for &var in &vars {
        if let Some(Bound::Many(seq)) = lookup(bindings, var) {
            match len {
                None => len = Some(seq.len()),
                Some(n) if n != seq.len() => {
                    return Err(SchemeError::MalformedSpecialForm(
                        "ellipsis variables matched different lengths".into(),
                    ))
                }
                Some(_) => {}
            }
        }
    }
    let Some(len) = len else {
        return Err(SchemeError::MalformedSpecialForm(
            "ellipsis in template follows no pattern variable".into(),
        ));
    };

    let mut results = Vec::with_capacity(len);
    for i in 0..len {
        let mut local = bindings.clone();
        for (var, bound) in local.iter_mut() {
            if vars.contains(var) {
                if let Bound::Many(seq) = bound {
                    *bound = seq[i].clone();
                }
            }
        }
        let value = instantiate(m, template, &local)?;
        m.protect(value);
        results.push(value);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Object;
    use crate::printer::render;
    use crate::reader::{read_one_at, ReaderHost};
    use crate::symbol::SymbolTable;

    struct Host {
        heap: Heap,
        symbols: SymbolTable,
    }

    impl Mutator for Host {
        fn heap(&self) -> &Heap {
            &self.heap
        }
        fn heap_mut(&mut self) -> &mut Heap {
            &mut self.heap
        }
        fn allocate(&mut self, object: Object) -> SchemeResult<u32> {
            self.heap.allocate(object)
        }
    }

    impl ReaderHost for Host {
        fn intern(&mut self, name: &str) -> SymbolId {
            self.symbols.intern(name)
        }
    }

    fn read(host: &mut Host, text: &str) -> Value {
        read_one_at(host, text, 0).unwrap().unwrap().0
    }

    /// Build a transformer from `(literals clause ...)` source text.
    fn rules(host: &mut Host, text: &str) -> RulesId {
        let rules_form = read(host, text);
        let pair = host.heap.pair(rules_form.as_pair().unwrap());
        validate(&host.heap, pair.car, pair.cdr).unwrap();
        let slot = host
            .heap
            .allocate(Object::Rules(SyntaxRules {
                literals: pair.car,
                clauses: pair.cdr,
            }))
            .unwrap();
        RulesId(slot)
    }

    fn expand_text(host: &mut Host, rules: RulesId, text: &str) -> Option<String> {
        let form = read(host, text);
        expand(host, rules, form)
            .unwrap()
            .map(|v| render(&host.heap, &host.symbols, v))
    }

    fn host() -> Host {
        Host {
            heap: Heap::new(1 << 16),
            symbols: SymbolTable::new(),
        }
    }

    #[test]
    fn ellipsis_matches_zero_or_more() {
        let mut host = host();
        let r = rules(&mut host, "(() ((_ x ...) (list x ...)))");
        assert_eq!(expand_text(&mut host, r, "(m)").as_deref(), Some("(list)"));
        assert_eq!(expand_text(&mut host, r, "(m 1)").as_deref(), Some("(list 1)"));
        assert_eq!(
            expand_text(&mut host, r, "(m 1 (f 2) 3)").as_deref(),
            Some("(list 1 (f 2) 3)")
        );
    }

    #[test]
    fn first_matching_clause_wins() {
        let mut host = host();
        let r = rules(&mut host, "(() ((_ a) (one a)) ((_ a b) (two a b)) ((_ a ...) (many)))");
        assert_eq!(expand_text(&mut host, r, "(m 1)").as_deref(), Some("(one 1)"));
        assert_eq!(expand_text(&mut host, r, "(m 1 2)").as_deref(), Some("(two 1 2)"));
        assert_eq!(expand_text(&mut host, r, "(m 1 2 3)").as_deref(), Some("(many)"));
    }

    #[test]
    fn literals_match_by_identity() {
        let mut host = host();
        let r = rules(&mut host, "((=>) ((_ a => b) (b a)))");
        assert_eq!(expand_text(&mut host, r, "(m 1 => f)").as_deref(), Some("(f 1)"));
        assert_eq!(expand_text(&mut host, r, "(m 1 -> f)"), None);
    }

    #[test]
    fn nested_patterns_under_ellipsis() {
        let mut host = host();
        let r = rules(
            &mut host,
            "(() ((_ ((name val) ...) body ...) ((lambda (name ...) body ...) val ...)))",
        );
        assert_eq!(
            expand_text(&mut host, r, "(my-let ((a 1) (b 2)) (+ a b))").as_deref(),
            Some("((lambda (a b) (+ a b)) 1 2)")
        );
    }

    #[test]
    fn repeated_template_variables_are_listed_once() {
        let mut host = host();
        let template = read(&mut host, "(f x y x y x)");
        let x = host.symbols.intern("x");
        let y = host.symbols.intern("y");
        let mut bindings = Bindings::new();
        bindings.push((x, Bound::Many(vec![Bound::One(Value::Int(1))])));
        bindings.push((y, Bound::Many(vec![Bound::One(Value::Int(2))])));
        assert_eq!(ellipsis_vars(&host.heap, template, &bindings), vec![x, y]);

        let r = rules(&mut host, "(() ((_ (a b) ...) (list (f a b a) ...)))");
        assert_eq!(
            expand_text(&mut host, r, "(m (1 2) (3 4))").as_deref(),
            Some("(list (f 1 2 1) (f 3 4 3))")
        );
    }

    #[test]
    fn shape_mismatch_is_no_match() {
        let mut host = host();
        let r = rules(&mut host, "(() ((_ (a b)) (pair a b)))");
        assert_eq!(expand_text(&mut host, r, "(m 1)"), None);
        assert_eq!(expand_text(&mut host, r, "(m (1))"), None);
        assert_eq!(expand_text(&mut host, r, "(m (1 2))").as_deref(), Some("(pair 1 2)"));
    }

    #[test]
    fn validate_rejects_bad_clauses() {
        let mut host = host();
        let rules_form = read(&mut host, "((x) (a b c))");
        let pair = host.heap.pair(rules_form.as_pair().unwrap());
        assert!(validate(&host.heap, pair.car, pair.cdr).is_err());
        let rules_form = read(&mut host, "((1) ((_) x))");
        let pair = host.heap.pair(rules_form.as_pair().unwrap());
        assert!(validate(&host.heap, pair.car, pair.cdr).is_err());
    }
}
