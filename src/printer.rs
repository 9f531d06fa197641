use crate::heap::Heap;
use crate::symbol::{sym, SymbolTable};
use crate::value::{ClosureCode, Value};

/// Lists longer than this are cut off, which also stops cdr-cycles.
const MAX_LIST_ITEMS: usize = 100_000;

/// Render a value the way `write` would: strings quoted, chars escaped.
pub fn render(heap: &Heap, symbols: &SymbolTable, val: Value) -> String {
    let mut out = String::new();
    print_inner(val, heap, symbols, &mut out, 0, false);
    out
}

/// Render a value the way `display` would: strings and chars raw.
pub fn display(heap: &Heap, symbols: &SymbolTable, val: Value) -> String {
    let mut out = String::new();
    print_inner(val, heap, symbols, &mut out, 0, true);
    out
}

fn print_inner(
    val: Value,
    heap: &Heap,
    symbols: &SymbolTable,
    out: &mut String,
    depth: usize,
    raw: bool,
) {
    if depth > 1000 {
        out.push_str("...");
        return;
    }

    match val {
        Value::Null => out.push_str("()"),
        Value::Bool(true) => out.push_str("#t"),
        Value::Bool(false) => out.push_str("#f"),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Char(c) if raw => out.push(c),
        Value::Char(c) => match c {
            ' ' => out.push_str("#\\space"),
            '\n' => out.push_str("#\\newline"),
            '\t' => out.push_str("#\\tab"),
            c => {
                out.push_str("#\\");
                out.push(c);
            }
        },
        Value::Symbol(id) => out.push_str(symbols.name(id)),
        Value::Str(id) if raw => out.push_str(heap.string(id)),
        Value::Str(id) => print_string(heap.string(id), out),
        Value::Vector(id) => {
            out.push_str("#(");
            for (i, &item) in heap.vector(id).iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                print_inner(item, heap, symbols, out, depth + 1, raw);
            }
            out.push(')');
        }
        Value::Pair(id) => {
            // (quote x) -> 'x
            let pair = heap.pair(id);
            if pair.car == Value::Symbol(sym::QUOTE) {
                if let Value::Pair(rest) = pair.cdr {
                    let rest = heap.pair(rest);
                    if rest.cdr.is_null() {
                        out.push('\'');
                        print_inner(rest.car, heap, symbols, out, depth + 1, raw);
                        return;
                    }
                }
            }

            out.push('(');
            let mut current = val;
            let mut first = true;
            let mut count = 0;
            loop {
                match current {
                    Value::Null => break,
                    Value::Pair(id) => {
                        if count >= MAX_LIST_ITEMS {
                            out.push_str(" ...");
                            break;
                        }
                        if !first {
                            out.push(' ');
                        }
                        let pair = heap.pair(id);
                        print_inner(pair.car, heap, symbols, out, depth + 1, raw);
                        current = pair.cdr;
                        first = false;
                        count += 1;
                    }
                    tail => {
                        out.push_str(" . ");
                        print_inner(tail, heap, symbols, out, depth + 1, raw);
                        break;
                    }
                }
            }
            out.push(')');
        }
        Value::Closure(id) => match &heap.closure(id).code {
            ClosureCode::Interpreted(_) => out.push_str("#<procedure>"),
            ClosureCode::Compiled(_) => out.push_str("#<procedure:compiled>"),
        },
        Value::Rules(_) => out.push_str("#<syntax-rules>"),
        Value::Keyword(k) => {
            out.push_str("#<syntax ");
            out.push_str(k.name());
            out.push('>');
        }
        Value::Builtin(b) => {
            out.push_str("#<primitive ");
            out.push_str(b.name());
            out.push('>');
        }
        Value::Unspecified => out.push_str("#<unspecified>"),
        Value::Eof => out.push_str("#<eof>"),
    }
}

fn print_string(text: &str, out: &mut String) {
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Mutator, Object};
    use crate::value::StrId;

    #[test]
    fn prints_lists_and_dotted_pairs() {
        let mut heap = Heap::new(1024);
        let symbols = SymbolTable::new();
        let list = heap.list(&[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(render(&heap, &symbols, list), "(1 2)");
        let pair = heap.cons(Value::Int(7), Value::Int(7)).unwrap();
        assert_eq!(render(&heap, &symbols, pair), "(7 . 7)");
    }

    #[test]
    fn quote_forms_print_abbreviated() {
        let mut heap = Heap::new(1024);
        let symbols = SymbolTable::new();
        let quoted = heap
            .list(&[Value::Symbol(sym::QUOTE), Value::Symbol(sym::IF)])
            .unwrap();
        assert_eq!(render(&heap, &symbols, quoted), "'if");
    }

    #[test]
    fn strings_differ_between_write_and_display() {
        let mut heap = Heap::new(1024);
        let symbols = SymbolTable::new();
        let slot = heap.allocate(Object::Str("a \"b\"".to_string())).unwrap();
        let text = Value::Str(StrId(slot));
        assert_eq!(render(&heap, &symbols, text), "\"a \\\"b\\\"\"");
        assert_eq!(display(&heap, &symbols, text), "a \"b\"");
        assert_eq!(render(&heap, &symbols, Value::Char(' ')), "#\\space");
        assert_eq!(display(&heap, &symbols, Value::Char('x')), "x");
    }

    #[test]
    fn cyclic_lists_terminate() {
        let mut heap = Heap::new(1024);
        let symbols = SymbolTable::new();
        let cell = heap.cons(Value::Int(1), Value::Null).unwrap();
        let id = cell.as_pair().unwrap();
        heap.set_cdr(id, cell);
        assert!(render(&heap, &symbols, cell).ends_with("...)"));
    }
}
