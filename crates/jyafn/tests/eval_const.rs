mod common;

use jyafn::{Graph, Value};

#[test]
fn constant_conditions_collapse_before_codegen() {
    let guard = Graph::begin("func");
    let a = jyafn::scalar_input("a").unwrap();
    let always = jyafn::const_bool(true).unwrap();
    let kept = (a + 0.0).exp().unwrap() * 1.0;
    let discarded = jyafn::constant(-1e-100).unwrap();
    jyafn::ret(always.choose(kept, discarded).unwrap()).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call_args(&[Value::Scalar(1.0)]).unwrap();
    assert_eq!(common::scalar(&out), 1.0f64.exp());
}

#[test]
fn input_free_graphs_fold_to_their_interpreted_value() {
    // Everything below is constant, so the compiled body is a single
    // store of the folded result.
    let guard = Graph::begin("all_const");
    let two = jyafn::constant(2.0).unwrap();
    let three = jyafn::constant(3.0).unwrap();
    let expr = (two * three + 1.0).sqrt().unwrap().max(2.0).unwrap();
    let flag = expr.gt(2.5).unwrap();
    jyafn::ret(flag.choose(expr, 0.0).unwrap()).unwrap();
    let graph = guard.finish().unwrap();

    // Host-side interpretation of the same expression.
    let expected = (2.0f64 * 3.0 + 1.0).sqrt().max(2.0);
    assert!(expected > 2.5);

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call(&Value::Struct(vec![])).unwrap();
    assert_eq!(common::scalar(&out), expected);
}

#[test]
fn folding_uses_ieee_semantics() {
    let guard = Graph::begin("ieee");
    let nan = jyafn::constant(f64::NAN).unwrap();
    let two = jyafn::constant(2.0).unwrap();
    // minNum: the one-sided NaN is ignored.
    let low = nan.min(two).unwrap();
    // NaN compares unequal to itself.
    let weird = nan.eq(nan).unwrap();
    jyafn::ret(weird.choose(0.0, low).unwrap()).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call(&Value::Struct(vec![])).unwrap();
    assert_eq!(common::scalar(&out), 2.0);
}
