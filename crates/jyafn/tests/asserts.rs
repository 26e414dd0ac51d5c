mod common;

use jyafn::{Error, Graph, InvocationError, Layout, RefValue, Value};

#[test]
fn failed_assertions_surface_their_message() {
    let guard = Graph::begin("asserts");
    let x = jyafn::scalar_input("x").unwrap();
    jyafn::assert_(x.gt(0.0).unwrap(), "x must be positive").unwrap();
    jyafn::ret(RefValue::Unit).unwrap();
    let graph = guard.finish().unwrap();
    assert_eq!(graph.output_layout(), Some(&Layout::Unit));

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    assert_eq!(fun.call_args(&[Value::Scalar(1.0)]).unwrap(), Value::Unit);
    let err = fun.call_args(&[Value::Scalar(-1.0)]).unwrap_err();
    match err {
        Error::Invocation(InvocationError::AssertionFailed(message)) => {
            assert_eq!(message, "x must be positive");
        }
        other => panic!("expected an assertion failure, got {other}"),
    }
}

#[test]
fn assertion_messages_round_trip_through_dump() {
    let guard = Graph::begin("asserts");
    let x = jyafn::scalar_input("x").unwrap();
    jyafn::assert_(x.lt(100.0).unwrap(), "x too large").unwrap();
    jyafn::assert_(x.gt(0.0).unwrap(), "x must be positive").unwrap();
    jyafn::ret(x + 0.0).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let reloaded = jyafn::Function::load(&fun.dump().unwrap()).unwrap();
    let err = reloaded.call_args(&[Value::Scalar(-3.0)]).unwrap_err();
    assert!(err.to_string().contains("x must be positive"), "{err}");
    let err = reloaded.call_args(&[Value::Scalar(300.0)]).unwrap_err();
    assert!(err.to_string().contains("x too large"), "{err}");
    assert_eq!(
        common::scalar(&reloaded.call_args(&[Value::Scalar(3.0)]).unwrap()),
        3.0
    );
}

#[test]
fn constant_false_assertions_fail_at_compile_time() {
    let guard = Graph::begin("doomed");
    let x = jyafn::scalar_input("x").unwrap();
    let never = jyafn::const_bool(false).unwrap();
    jyafn::assert_(never, "unsatisfiable").unwrap();
    jyafn::ret(x + 1.0).unwrap();
    let graph = guard.finish().unwrap();
    let err = graph.compile().unwrap_err();
    assert!(err.to_string().contains("unsatisfiable"), "{err}");
}

#[test]
fn constant_true_assertions_are_elided() {
    let guard = Graph::begin("fine");
    let x = jyafn::scalar_input("x").unwrap();
    let always = jyafn::const_bool(true).unwrap();
    jyafn::assert_(always, "always holds").unwrap();
    jyafn::ret(x * 2.0).unwrap();
    let graph = guard.finish().unwrap();
    let Some(fun) = common::compile(&graph) else {
        return;
    };
    assert_eq!(
        common::scalar(&fun.call_args(&[Value::Scalar(4.0)]).unwrap()),
        8.0
    );
}
