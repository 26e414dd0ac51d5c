mod common;

use jyafn::{Graph, Layout, Value};

#[test]
fn branchless_relu() {
    let guard = Graph::begin("relu");
    let a = jyafn::scalar_input("a").unwrap();
    let s = a.sqrt().unwrap();
    jyafn::ret(a.ge(0.0).unwrap().choose(s, 0.0).unwrap()).unwrap();
    let graph = guard.finish().unwrap();

    let Some(relu) = common::compile(&graph) else {
        return;
    };
    for (x, expected) in [(-1.0, 0.0), (0.0, 0.0), (1.0, 1.0)] {
        let out = relu.call_args(&[Value::Scalar(x)]).unwrap();
        assert_eq!(common::scalar(&out), expected, "relu({x})");
    }
}

#[test]
fn symbols_choose_symbols() {
    let guard = Graph::begin("logic_with_symbols");
    let color = jyafn::input("favorite_color", Layout::Symbol)
        .unwrap()
        .single()
        .unwrap();
    let out = color
        .eq("blue")
        .unwrap()
        .choose("off you go", "aaaaaah!")
        .unwrap();
    jyafn::ret(out).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let answer = fun.call_args(&[Value::from("blue")]).unwrap();
    assert_eq!(answer, Value::from("off you go"));
    let answer = fun.call_args(&[Value::from("yellow")]).unwrap();
    assert_eq!(answer, Value::from("aaaaaah!"));
}

#[test]
fn boolean_algebra_and_tests() {
    let guard = Graph::begin("bools");
    let x = jyafn::scalar_input("x").unwrap();
    let positive = x.gt(0.0).unwrap();
    let small = x.lt(10.0).unwrap();
    let nan = x.is_nan().unwrap();
    let ok = (positive & small) & !nan;
    jyafn::ret(ok).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    for (x, expected) in [
        (5.0, true),
        (-5.0, false),
        (50.0, false),
        (f64::NAN, false),
    ] {
        let out = fun.call_args(&[Value::Scalar(x)]).unwrap();
        assert_eq!(out, Value::Bool(expected), "x = {x}");
    }
}

#[test]
fn min_max_folds() {
    let guard = Graph::begin("reductions");
    let a = jyafn::scalar_input("a").unwrap();
    let b = jyafn::scalar_input("b").unwrap();
    let c = jyafn::scalar_input("c").unwrap();
    let low = jyafn::min([a, b, c]).unwrap();
    let high = jyafn::max([a, b, c]).unwrap();
    jyafn::ret(jyafn::RefValue::Tuple(vec![low.into(), high.into()])).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun
        .call_args(&[Value::Scalar(3.0), Value::Scalar(-1.0), Value::Scalar(2.0)])
        .unwrap();
    assert_eq!(
        out,
        Value::Tuple(vec![Value::Scalar(-1.0), Value::Scalar(3.0)])
    );
}
