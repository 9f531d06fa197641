//! End-to-end evaluation through the public engine API.

use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use ember::{Engine, EngineConfig, SchemeError};

fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

fn interpreted() -> Engine {
    Engine::new(EngineConfig::default().with_compile_threshold(0)).unwrap()
}

fn eval(engine: &mut Engine, text: &str) -> String {
    match engine.eval_str(text) {
        Ok(value) => engine.render(value),
        Err(e) => panic!("{} failed: {}", text, e),
    }
}

/// Output sink the test can inspect after the engine has written to it.
#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }
}

// ============================================================================
// Core evaluation
// ============================================================================

#[test]
fn adds_integers() {
    let mut engine = engine();
    assert_eq!(eval(&mut engine, "(+ 1 2 3)"), "6");
}

#[test]
fn recursive_definition_counts_down() {
    let mut engine = engine();
    assert_eq!(
        eval(&mut engine, "(define (f x) (if (eq? x 0) 0 (f (- x 1)))) (f 5)"),
        "0"
    );
}

#[test]
fn lambda_application_builds_a_pair() {
    let mut engine = engine();
    assert_eq!(eval(&mut engine, "((lambda (x) (cons x x)) 7)"), "(7 . 7)");
}

#[test]
fn quote_returns_data_unevaluated() {
    let mut engine = engine();
    assert_eq!(eval(&mut engine, "'(a (b . c) #(1 2))"), "(a (b . c) #(1 2))");
    assert_eq!(eval(&mut engine, "(quote x)"), "x");
}

#[test]
fn closures_capture_their_environment() {
    let mut engine = engine();
    eval(&mut engine, "(define (adder n) (lambda (x) (+ x n)))");
    eval(&mut engine, "(define add5 (adder 5))");
    for _ in 0..5 {
        assert_eq!(eval(&mut engine, "(add5 10)"), "15");
    }
}

#[test]
fn set_updates_the_nearest_binding() {
    let mut engine = engine();
    eval(&mut engine, "(define counter 0)");
    eval(&mut engine, "(define (bump) (set! counter (+ counter 1)) counter)");
    for expected in 1..=6 {
        assert_eq!(eval(&mut engine, "(bump)"), expected.to_string());
    }
    assert_eq!(eval(&mut engine, "counter"), "6");
}

#[test]
fn set_of_an_unbound_name_fails() {
    let mut engine = engine();
    let err = engine.eval_str("(set! nowhere 1)").unwrap_err();
    assert_eq!(err, SchemeError::UnboundIdentifier("nowhere".into()));
}

#[test]
fn local_state_through_shared_scope() {
    let mut engine = engine();
    eval(
        &mut engine,
        "(define (make-counter)
           (define n 0)
           (lambda () (set! n (+ n 1)) n))",
    );
    eval(&mut engine, "(define c (make-counter))");
    eval(&mut engine, "(define d (make-counter))");
    for _ in 0..4 {
        eval(&mut engine, "(c)");
    }
    assert_eq!(eval(&mut engine, "(c)"), "5");
    assert_eq!(eval(&mut engine, "(d)"), "1");
    // Enough fresh counters for make-counter itself to be compiled.
    eval(&mut engine, "(define e (make-counter))");
    assert_eq!(eval(&mut engine, "(e)"), "1");
    assert_eq!(eval(&mut engine, "(e)"), "2");
}

#[test]
fn unbound_identifier_is_reported() {
    let mut engine = engine();
    let err = engine.eval_str("(+ 1 mystery)").unwrap_err();
    assert_eq!(err, SchemeError::UnboundIdentifier("mystery".into()));
}

#[test]
fn applying_a_non_procedure_fails() {
    let mut engine = engine();
    let err = engine.eval_str("(1 2)").unwrap_err();
    assert!(matches!(err, SchemeError::ApplyError(_)));
}

#[test]
fn division_by_zero_halts_the_engine() {
    let mut engine = engine();
    assert_eq!(engine.eval_str("(/ 1 0)").unwrap_err(), SchemeError::DivideByZero);
    assert!(engine.last_error().is_some());
    engine.reset();
    assert_eq!(eval(&mut engine, "(/ 7 2)"), "3");
}

#[test]
fn malformed_special_forms_are_rejected() {
    let mut engine = engine();
    for text in ["(if)", "(quote)", "(lambda (x))", "(define)", "(lambda (x x) x)"] {
        let err = engine.eval_str(text).unwrap_err();
        assert!(
            matches!(err, SchemeError::MalformedSpecialForm(_)),
            "{} gave {:?}",
            text,
            err
        );
        engine.reset();
    }
}

#[test]
fn keywords_can_be_shadowed() {
    let mut engine = engine();
    assert_eq!(eval(&mut engine, "((lambda (if) (if 1 2)) +)"), "3");
}

/// Outcome of `call` after `definition`, repeated past the point where an
/// eagerly compiling engine has promoted the callee.
fn outcomes(threshold: u32, definition: &str, call: &str) -> Vec<Result<String, SchemeError>> {
    let mut engine = Engine::new(EngineConfig::default().with_compile_threshold(threshold)).unwrap();
    eval(&mut engine, definition);
    (0..4)
        .map(|_| {
            let result = engine.eval_str(call).map(|value| engine.render(value));
            engine.reset();
            result
        })
        .collect()
}

#[test]
fn reading_a_later_definition_fails_in_both_tiers() {
    let definition = "(define (f x) (define a b) (define b 1) a)";
    let interpreted = outcomes(0, definition, "(f 1)");
    assert_eq!(interpreted, outcomes(1, definition, "(f 1)"));
    assert!(interpreted
        .iter()
        .all(|r| *r == Err(SchemeError::UnboundIdentifier("b".into()))));

    // A global of the same name is what the interpreter finds.
    let mut engine = Engine::new(EngineConfig::default().with_compile_threshold(1)).unwrap();
    eval(&mut engine, "(define b 'outer)");
    eval(&mut engine, definition);
    for _ in 0..4 {
        assert_eq!(eval(&mut engine, "(f 1)"), "outer");
    }
}

#[test]
fn syntax_passed_as_an_argument_is_dispatched_in_both_tiers() {
    let mut engine = engine();
    eval(&mut engine, "(define (g k a b) (k a b))");
    for _ in 0..3 {
        assert_eq!(eval(&mut engine, "(g + 1 2)"), "3");
    }
    let g = engine.lookup_global("g").unwrap();
    assert!(engine.is_compiled(g));
    for _ in 0..3 {
        assert_eq!(eval(&mut engine, "(g if 1 2)"), "2");
        assert_eq!(eval(&mut engine, "(g if #f 2)"), "#<unspecified>");
    }
    assert_eq!(
        outcomes(0, "(define (g k a b) (k a b))", "(g if #f 2)"),
        outcomes(1, "(define (g k a b) (k a b))", "(g if #f 2)")
    );
}

// ============================================================================
// Tail calls
// ============================================================================

fn assert_loop_runs_in_constant_depth(mut engine: Engine) {
    eval(
        &mut engine,
        "(define (loop n acc) (if (eq? n 0) acc (loop (- n 1) (+ acc 1))))",
    );
    assert_eq!(eval(&mut engine, "(loop 100000 0)"), "100000");
    assert!(engine.stats().peak_call_depth < 16, "{:?}", engine.stats());
}

#[test]
fn interpreted_tail_calls_do_not_grow_the_stack() {
    assert_loop_runs_in_constant_depth(interpreted());
}

#[test]
fn compiled_tail_calls_do_not_grow_the_stack() {
    let engine = engine();
    assert_loop_runs_in_constant_depth(engine);
}

#[test]
fn deep_non_tail_recursion_hits_the_limit() {
    let mut engine =
        Engine::new(EngineConfig::default().with_max_call_depth(1000)).unwrap();
    eval(&mut engine, "(define (sum n) (if (eq? n 0) 0 (+ n (sum (- n 1)))))");
    assert_eq!(eval(&mut engine, "(sum 100)"), "5050");
    let err = engine.eval_str("(sum 100000)").unwrap_err();
    assert!(matches!(err, SchemeError::CallDepthExceeded(_)));
}

// ============================================================================
// Macros
// ============================================================================

#[test]
fn syntax_rules_with_ellipsis() {
    let mut engine = engine();
    eval(
        &mut engine,
        "(define-syntax my-list (syntax-rules () ((_ x ...) (list x ...))))",
    );
    assert_eq!(eval(&mut engine, "(my-list 1 2 3)"), "(1 2 3)");
    assert_eq!(eval(&mut engine, "(my-list)"), "()");
}

#[test]
fn macro_without_matching_clause_fails() {
    let mut engine = engine();
    eval(
        &mut engine,
        "(define-syntax pair-of (syntax-rules () ((_ a b) (cons a b))))",
    );
    let err = engine.eval_str("(pair-of 1)").unwrap_err();
    assert!(matches!(err, SchemeError::NoMatchingMacroClause(_)));
}

#[test]
fn macros_expand_inside_compiled_closures() {
    let mut engine = engine();
    eval(
        &mut engine,
        "(define-syntax unless (syntax-rules () ((_ c body) (if c #f body))))",
    );
    eval(&mut engine, "(define (safe-div a b) (unless (eq? b 0) (/ a b)))");
    for _ in 0..4 {
        assert_eq!(eval(&mut engine, "(safe-div 10 2)"), "5");
        assert_eq!(eval(&mut engine, "(safe-div 10 0)"), "#f");
    }
    let safe_div = engine.lookup_global("safe-div").unwrap();
    assert!(engine.is_compiled(safe_div));
}

#[test]
fn define_syntax_requires_a_transformer() {
    let mut engine = engine();
    let err = engine.eval_str("(define-syntax bad 5)").unwrap_err();
    assert!(matches!(err, SchemeError::MalformedSpecialForm(_)));
}

// ============================================================================
// Memory
// ============================================================================

#[test]
fn garbage_is_reclaimed_under_a_small_heap() {
    let mut engine = Engine::new(EngineConfig::default().with_heap_words(20_000)).unwrap();
    eval(
        &mut engine,
        "(define (churn n) (if (eq? n 0) 'done (begin (list 1 2 3 4 5) (churn (- n 1)))))",
    );
    assert_eq!(eval(&mut engine, "(churn 20000)"), "done");
    assert!(engine.stats().collections > 0);
}

#[test]
fn live_data_exhausting_the_heap_reports_out_of_memory() {
    let mut engine = Engine::new(EngineConfig::default().with_heap_words(20_000)).unwrap();
    eval(
        &mut engine,
        "(define (grow n acc) (if (eq? n 0) acc (grow (- n 1) (cons n acc))))",
    );
    let err = engine.eval_str("(define big (grow 100000 '()))").unwrap_err();
    assert!(matches!(err, SchemeError::OutOfMemory { .. }));
    engine.reset();
    assert_eq!(eval(&mut engine, "(car (grow 3 '()))"), "1");
}

#[test]
fn pinned_values_survive_between_evaluations() {
    let mut engine = Engine::new(EngineConfig::default().with_heap_words(20_000)).unwrap();
    let list = engine.eval_str("(list 1 2 3)").unwrap();
    let pin = engine.pin(list);
    eval(&mut engine, "(define (churn n) (if (eq? n 0) 0 (begin (cons 1 2) (churn (- n 1)))))");
    eval(&mut engine, "(churn 10000)");
    assert_eq!(engine.render(engine.pinned(&pin)), "(1 2 3)");
    engine.unpin(pin);
}

// ============================================================================
// I/O
// ============================================================================

#[test]
fn display_writes_to_the_configured_output() {
    let mut engine = engine();
    let out = SharedBuffer::default();
    engine.set_output(Box::new(out.clone()));
    eval(&mut engine, "(display \"hi\") (display '(1 \"two\")) (newline)");
    assert_eq!(out.contents(), "hi(1 two)\n");
}

#[test]
fn read_pulls_data_from_the_configured_input() {
    let mut engine = engine();
    engine.set_input(Box::new(io::Cursor::new("(1 2\n 3) foo\n")));
    assert_eq!(eval(&mut engine, "(read)"), "(1 2 3)");
    assert_eq!(eval(&mut engine, "(read)"), "foo");
    assert_eq!(eval(&mut engine, "(read)"), "#<eof>");
}
