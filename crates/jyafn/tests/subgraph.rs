mod common;

use jyafn::{Graph, Layout, Value};

fn simple() -> Graph {
    jyafn::graph(
        "simple",
        &[("a", Layout::Scalar), ("b", Layout::Scalar)],
        |args| {
            let a = args[0].single()?;
            let b = args[1].single()?;
            Ok((2.0 * a + b).into())
        },
    )
    .unwrap()
}

#[test]
fn call_a_graph_from_a_graph() {
    let simple = simple();
    let guard = Graph::begin("call_simple");
    let a = jyafn::scalar_input("a").unwrap();
    let b = jyafn::scalar_input("b").unwrap();
    let out = jyafn::call_graph(&simple, &[a.into(), b.into()]).unwrap();
    jyafn::ret(out).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call_args(&[Value::Scalar(2.0), Value::Scalar(3.0)]).unwrap();
    assert_eq!(common::scalar(&out), 7.0);

    // The embedded artifact survives dump/load.
    let again = jyafn::Function::load(&fun.dump().unwrap()).unwrap();
    let out = again
        .call_args(&[Value::Scalar(2.0), Value::Scalar(3.0)])
        .unwrap();
    assert_eq!(common::scalar(&out), 7.0);
}

#[test]
fn symbols_flow_across_the_call() {
    let classify = jyafn::graph("classify", &[("c", Layout::Symbol)], |args| {
        let c = args[0].single()?;
        Ok(c.eq("blue")?.choose(1.0, 0.0)?.into())
    })
    .unwrap();

    let guard = Graph::begin("outer");
    let color = jyafn::input("color", Layout::Symbol).unwrap();
    let score = jyafn::call_graph(&classify, &[color]).unwrap();
    jyafn::ret(score).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    // "blue" was interned by the callee and remapped into the caller's
    // table at embed time, so the caller encodes it to the id the callee
    // compares against.
    let out = fun.call_args(&[Value::from("blue")]).unwrap();
    assert_eq!(common::scalar(&out), 1.0);
    let out = fun.call_args(&[Value::from("red")]).unwrap();
    assert_eq!(common::scalar(&out), 0.0);
}

#[test]
fn callee_assertions_reach_the_outer_caller() {
    let checked = jyafn::graph("checked", &[("x", Layout::Scalar)], |args| {
        let x = args[0].single()?;
        jyafn::assert_(x.gt(0.0)?, "x must be positive")?;
        Ok(x.sqrt()?.into())
    })
    .unwrap();

    let guard = Graph::begin("outer");
    let x = jyafn::scalar_input("x").unwrap();
    let y = jyafn::call_graph(&checked, &[x.into()]).unwrap();
    jyafn::ret(y.single().unwrap() + 1.0).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    assert_eq!(
        common::scalar(&fun.call_args(&[Value::Scalar(4.0)]).unwrap()),
        3.0
    );
    let err = fun.call_args(&[Value::Scalar(-4.0)]).unwrap_err();
    assert!(err.to_string().contains("x must be positive"), "{err}");
}

#[test]
fn callees_can_be_built_while_the_caller_is_open() {
    let outer = Graph::begin("outer");
    let x = jyafn::scalar_input("x").unwrap();

    // A nested begin/finish targets its own graph and leaves the outer
    // one on the stack underneath.
    let inner = Graph::begin("inner");
    let y = jyafn::scalar_input("y").unwrap();
    jyafn::ret(y * 10.0).unwrap();
    let inner = inner.finish().unwrap();

    let out = jyafn::call_graph(&inner, &[x.into()]).unwrap();
    jyafn::ret(out).unwrap();
    let graph = outer.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call_args(&[Value::Scalar(4.0)]).unwrap();
    assert_eq!(common::scalar(&out), 40.0);
}

#[test]
fn same_callee_embeds_once() {
    let simple = simple();
    let guard = Graph::begin("outer");
    let a = jyafn::scalar_input("a").unwrap();
    let b = jyafn::scalar_input("b").unwrap();
    let first = jyafn::call_graph(&simple, &[a.into(), b.into()]).unwrap();
    let second = jyafn::call_graph(&simple, &[b.into(), a.into()]).unwrap();
    jyafn::ret(first.single().unwrap() + second.single().unwrap()).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    // 2a + b + 2b + a = 3(a + b)
    let out = fun.call_args(&[Value::Scalar(1.0), Value::Scalar(2.0)]).unwrap();
    assert_eq!(common::scalar(&out), 9.0);
}
