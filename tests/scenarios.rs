//! End-to-end scenarios: whole programs through the reader, evaluator
//! and scheduler, exercising the public embedding surface.

use emberlisp::extension::ExtContext;
use emberlisp::{sym, HostValue, Runtime, RuntimeConfig, Value};

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default()).unwrap()
}

fn small_runtime(heap_cells: usize) -> Runtime {
    Runtime::new(RuntimeConfig {
        heap_cells,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

#[test]
fn addition() {
    let mut rt = runtime();
    assert_eq!(rt.eval_program("(+ 1 2)").unwrap(), Value::Int(3));
}

#[test]
fn define_then_call() {
    let mut rt = runtime();
    let v = rt
        .eval_program("(define f (lambda (x) (* x x))) (f 7)")
        .unwrap();
    assert_eq!(v, Value::Int(49));
}

#[test]
fn let_prebinds_with_letrec_semantics() {
    // `b` sees `a` already patched to 1 by the time its value runs.
    let mut rt = runtime();
    let v = rt
        .eval_program("(let ((a 1) (b (+ a 1))) (+ a b))")
        .unwrap();
    assert_eq!(v, Value::Int(3));
}

#[test]
fn if_selects_by_truthiness() {
    let mut rt = runtime();
    let yes = rt.intern("yes").unwrap();
    let v = rt.eval_program("(if (= 1 1) 'yes 'no)").unwrap();
    assert_eq!(v, Value::Symbol(yes));
    let no = rt.intern("no").unwrap();
    let v = rt.eval_program("(if (= 1 2) 'yes 'no)").unwrap();
    assert_eq!(v, Value::Symbol(no));
    // Anything but nil is true.
    let v = rt.eval_program("(if 0 'yes 'no)").unwrap();
    assert_eq!(v, Value::Symbol(yes));
}

#[test]
fn recv_gets_a_host_message() {
    let mut rt = runtime();
    let cid = rt.load_program("(recv (m m))").unwrap();
    rt.run_until_idle().unwrap();
    assert!(rt.take_result(cid).is_none());
    assert!(rt.send_message(cid, HostValue::Int(42)));
    rt.run_until_idle().unwrap();
    assert_eq!(rt.take_result(cid), Some(Value::Int(42)));
}

#[test]
fn dropped_conses_come_back_after_one_gc() {
    let mut rt = runtime();
    rt.eval_program(
        "(define churn (lambda (n) (if (= n 0) 'done (churn (- n (car (cons 1 1)))))))",
    )
    .unwrap();
    rt.gc_now().unwrap();
    let free_before = rt.heap_num_free();
    let done = rt.intern("done").unwrap();
    assert_eq!(
        rt.eval_program("(churn 2000)").unwrap(),
        Value::Symbol(done)
    );
    rt.gc_now().unwrap();
    assert!(
        rt.heap_num_free() + 1 >= free_before,
        "free {} before, {} after",
        free_before,
        rt.heap_num_free()
    );
}

// ---------------------------------------------------------------------
// Laws
// ---------------------------------------------------------------------

#[test]
fn quote_returns_the_exact_word() {
    let mut rt = runtime();
    let xyz = rt.intern("xyz").unwrap();
    assert_eq!(rt.eval_program("'xyz").unwrap(), Value::Symbol(xyz));
    assert_eq!(rt.eval_program("(quote 5)").unwrap(), Value::Int(5));
}

#[test]
fn progn_laws() {
    let mut rt = runtime();
    assert_eq!(rt.eval_program("(progn)").unwrap(), emberlisp::NIL);
    assert_eq!(rt.eval_program("(progn 7)").unwrap(), Value::Int(7));
    assert_eq!(rt.eval_program("(progn 1 2)").unwrap(), Value::Int(2));
    // Side effects happen in order.
    let v = rt
        .eval_program("(define x 1) (progn (define x 2) (define x (+ x 10)) x)")
        .unwrap();
    assert_eq!(v, Value::Int(12));
}

#[test]
fn define_is_visible_to_later_programs() {
    let mut rt = runtime();
    rt.eval_program("(define k 41)").unwrap();
    assert_eq!(rt.eval_program("(+ k 1)").unwrap(), Value::Int(42));
}

#[test]
fn deep_tail_recursion_runs_in_constant_stack() {
    let mut rt = Runtime::new(RuntimeConfig {
        ctx_stack_cap: 64,
        ctx_stack_grow: false,
        ..RuntimeConfig::default()
    })
    .unwrap();
    let ok = rt.intern("ok").unwrap();
    let v = rt
        .eval_program(
            "(define loop (lambda (n) (if (= n 0) 'ok (loop (- n 1))))) (loop 100000)",
        )
        .unwrap();
    assert_eq!(v, Value::Symbol(ok));
}

#[test]
fn letrec_supports_self_reference() {
    let mut rt = runtime();
    let v = rt
        .eval_program(
            "(letrec ((fact (lambda (n) (if (= n 0) 1 (* n (fact (- n 1))))))) (fact 5))",
        )
        .unwrap();
    assert_eq!(v, Value::Int(120));
}

#[test]
fn cond_takes_the_first_true_clause() {
    let mut rt = runtime();
    let b = rt.intern("b").unwrap();
    let v = rt
        .eval_program("(cond ((= 1 2) 'a) ((= 1 1) 'b) (t 'c))")
        .unwrap();
    assert_eq!(v, Value::Symbol(b));
    assert_eq!(rt.eval_program("(cond)").unwrap(), emberlisp::NIL);
}

// ---------------------------------------------------------------------
// Errors as values
// ---------------------------------------------------------------------

#[test]
fn unbound_symbol_fails_with_eval_error() {
    let mut rt = runtime();
    assert_eq!(
        rt.eval_program("no-such-binding").unwrap(),
        Value::Symbol(sym::EVAL_ERROR)
    );
}

#[test]
fn arity_mismatch_fails_with_eval_error() {
    let mut rt = runtime();
    let v = rt
        .eval_program("(define f (lambda (x) x)) (f 1 2)")
        .unwrap();
    assert_eq!(v, Value::Symbol(sym::EVAL_ERROR));
}

#[test]
fn calling_a_non_callable_fails_with_eval_error() {
    let mut rt = runtime();
    assert_eq!(
        rt.eval_program("(1 2 3)").unwrap(),
        Value::Symbol(sym::EVAL_ERROR)
    );
}

#[test]
fn error_conditions_propagate_through_if() {
    // (car 5) is a type error; the branch is never taken.
    let mut rt = runtime();
    assert_eq!(
        rt.eval_program("(if (car 5) 'yes 'no)").unwrap(),
        Value::Symbol(sym::TYPE_ERROR)
    );
}

#[test]
fn define_of_non_symbol_fails() {
    let mut rt = runtime();
    assert_eq!(
        rt.eval_program("(define 5 1)").unwrap(),
        Value::Symbol(sym::EVAL_ERROR)
    );
    assert_eq!(
        rt.eval_program("(define nil 1)").unwrap(),
        Value::Symbol(sym::EVAL_ERROR)
    );
}

// ---------------------------------------------------------------------
// Allocation-failure retry
// ---------------------------------------------------------------------

#[test]
fn evaluation_survives_a_tiny_heap_through_gc_retry() {
    let mut rt = small_runtime(192);
    let ok = rt.intern("ok").unwrap();
    let v = rt
        .eval_program("(define f (lambda (n) (if (= n 0) 'ok (f (- n 1))))) (f 500)")
        .unwrap();
    assert_eq!(v, Value::Symbol(ok));
    assert!(rt.gc_runs() > 0);
}

#[test]
fn a_hopeless_allocation_fails_with_out_of_memory() {
    // The accumulator stays rooted, so no amount of collection can make
    // room: the context must fail instead of spinning.
    let mut rt = small_runtime(96);
    let v = rt
        .eval_program(
            "(define g (lambda (n acc) (if (= n 0) acc (g (- n 1) (cons n acc)))))
             (g 100 nil)",
        )
        .unwrap();
    assert_eq!(v, Value::Symbol(sym::OUT_OF_MEMORY));
}

// ---------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------

#[test]
fn spawn_send_recv_between_contexts() {
    let mut rt = runtime();
    let v = rt
        .eval_program(
            "(define worker (lambda (p) (send p 99)))
             (spawn worker (self))
             (recv (m m))",
        )
        .unwrap();
    assert_eq!(v, Value::Int(99));
}

#[test]
fn messages_from_one_sender_arrive_in_order() {
    let mut rt = runtime();
    let cid = rt
        .load_program("(let ((a (recv (x x))) (b (recv (x x)))) (cons a b))")
        .unwrap();
    rt.run_until_idle().unwrap();
    assert!(rt.send_message(cid, HostValue::Int(1)));
    assert!(rt.send_message(cid, HostValue::Int(2)));
    rt.run_until_idle().unwrap();
    let v = rt.take_result(cid).unwrap();
    assert_eq!(rt.print_value(v), "(1 . 2)");
}

#[test]
fn recv_matches_patterns_in_order() {
    let mut rt = runtime();
    let cid = rt
        .load_program("(recv ((ping n) (cons 'ping n)) (other (cons 'other other)))")
        .unwrap();
    rt.run_until_idle().unwrap();
    // A bare int does not match (ping n), so the second clause binds it.
    assert!(rt.send_message(cid, HostValue::Int(5)));
    rt.run_until_idle().unwrap();
    let v = rt.take_result(cid).unwrap();
    assert_eq!(rt.print_value(v), "(other . 5)");
}

#[test]
fn recv_nb_answers_no_match_when_empty() {
    let mut rt = runtime();
    assert_eq!(
        rt.eval_program("(recv-nb (m m))").unwrap(),
        Value::Symbol(sym::NO_MATCH)
    );
}

#[test]
fn mailbox_overflow_rejects_the_send() {
    let mut rt = Runtime::new(RuntimeConfig {
        mailbox_cap: 2,
        ..RuntimeConfig::default()
    })
    .unwrap();
    let cid = rt.load_program("(recv (m m))").unwrap();
    // Park the receiver first so deliveries queue up.
    rt.run_until_idle().unwrap();
    // It wakes on the first send but we never run it again before the
    // rest arrive.
    assert!(rt.send_message(cid, HostValue::Int(1)));
    assert!(rt.send_message(cid, HostValue::Int(2)));
    assert!(!rt.send_message(cid, HostValue::Int(3)));
}

#[test]
fn sleep_wakes_and_finishes() {
    let mut rt = runtime();
    let woke = rt.intern("woke").unwrap();
    let v = rt.eval_program("(progn (sleep 1000) 'woke)").unwrap();
    assert_eq!(v, Value::Symbol(woke));
}

#[test]
fn yield_requeues_and_completes() {
    let mut rt = runtime();
    assert_eq!(rt.eval_program("(yield)").unwrap(), emberlisp::TRUE);
}

#[test]
fn kill_removes_a_spinning_context() {
    let mut rt = runtime();
    let v = rt
        .eval_program("(define spin (lambda (x) (spin x))) (kill (spawn spin 1))")
        .unwrap();
    assert_eq!(v, emberlisp::TRUE);
    rt.run_until_idle().unwrap();
    assert_eq!(rt.num_contexts(), 0);
}

#[test]
fn event_wait_takes_a_host_event() {
    let mut rt = runtime();
    let cid = rt.load_program("(event-wait 'tick)").unwrap();
    rt.run_until_idle().unwrap();
    assert!(rt.take_result(cid).is_none());
    assert!(rt.push_event("tick", HostValue::Int(5)).unwrap());
    rt.run_until_idle().unwrap();
    assert_eq!(rt.take_result(cid), Some(Value::Int(5)));
}

#[test]
fn host_port_crosses_threads() {
    let mut rt = runtime();
    let cid = rt.load_program("(recv (m m))").unwrap();
    rt.run_until_idle().unwrap();
    let port = rt.port();
    let t = std::thread::spawn(move || {
        port.send_message(cid, HostValue::Int(7));
    });
    t.join().unwrap();
    rt.run_until_idle().unwrap();
    assert_eq!(rt.take_result(cid), Some(Value::Int(7)));
}

// ---------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------

fn ext_double(_ext: &mut ExtContext, args: &[Value]) -> Value {
    match args.first() {
        Some(&Value::Int(n)) => Value::Int(n * 2),
        _ => Value::Symbol(sym::TYPE_ERROR),
    }
}

fn ext_make_pair(ext: &mut ExtContext, args: &[Value]) -> Value {
    let a = args.first().copied().unwrap_or(emberlisp::NIL);
    ext.heap.cons(a, a)
}

#[test]
fn extensions_apply_like_fundamentals() {
    let mut rt = runtime();
    assert!(rt.add_extension("double", ext_double));
    assert!(rt.add_extension("make-pair", ext_make_pair));
    assert_eq!(rt.eval_program("(double 21)").unwrap(), Value::Int(42));
    let v = rt.eval_program("(make-pair 3)").unwrap();
    assert_eq!(rt.print_value(v), "(3 . 3)");
    // Extensions compose with evaluation.
    assert_eq!(
        rt.eval_program("(+ (double 10) 1)").unwrap(),
        Value::Int(21)
    );
}

// ---------------------------------------------------------------------
// Strings, arrays, misc surface
// ---------------------------------------------------------------------

#[test]
fn strings_are_byte_arrays() {
    let mut rt = runtime();
    rt.eval_program("(define s \"hi\")").unwrap();
    assert_eq!(
        rt.eval_program("(array-read s 0)").unwrap(),
        Value::Int(b'h' as i32)
    );
    // Size includes the trailing NUL.
    assert_eq!(rt.eval_program("(array-size s)").unwrap(), Value::Int(3));
}

#[test]
fn eval_fundamental_re_enters_the_loop() {
    let mut rt = runtime();
    assert_eq!(
        rt.eval_program("(eval (cons '+ (cons 1 (cons 2 nil))))").unwrap(),
        Value::Int(3)
    );
}

#[test]
fn first_match_wins_shadowing_in_let() {
    let mut rt = runtime();
    rt.eval_program("(define x 1)").unwrap();
    assert_eq!(
        rt.eval_program("(let ((x 2)) x)").unwrap(),
        Value::Int(2)
    );
    // The global binding is untouched.
    assert_eq!(rt.eval_program("x").unwrap(), Value::Int(1));
}

#[test]
fn iterators_see_parked_contexts() {
    let mut rt = runtime();
    let cid = rt.load_program("(recv (m m))").unwrap();
    rt.run_until_idle().unwrap();
    let mut blocked = Vec::new();
    rt.blocked_iterator(|view| blocked.push(view.id));
    assert_eq!(blocked, vec![cid]);
    let mut running = 0;
    rt.running_iterator(|_| running += 1);
    assert_eq!(running, 0);
}

// ---------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------

#[test]
fn image_round_trips_the_global_environment() {
    let dir = std::env::temp_dir().join("emberlisp-image-test");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("boot.img");

    let mut rt = runtime();
    rt.eval_program("(define x 42) (define s \"hi\") (define lst '(1 2 3))")
        .unwrap();
    emberlisp::image::save(&mut rt, &path, None).unwrap();

    let mut rt2 = runtime();
    emberlisp::image::boot(&mut rt2, &path).unwrap();
    assert_eq!(rt2.eval_program("x").unwrap(), Value::Int(42));
    assert_eq!(
        rt2.eval_program("(array-read s 1)").unwrap(),
        Value::Int(b'i' as i32)
    );
    assert_eq!(rt2.eval_program("(car (cdr lst))").unwrap(), Value::Int(2));
    // Restored strings are read-only.
    assert_eq!(
        rt2.eval_program("(array-write s 0 0)").unwrap(),
        Value::Symbol(sym::TYPE_ERROR)
    );
    // Redefinition still works over the restored environment.
    rt2.eval_program("(define x 1)").unwrap();
    assert_eq!(rt2.eval_program("x").unwrap(), Value::Int(1));

    std::fs::remove_file(&path).ok();
}
