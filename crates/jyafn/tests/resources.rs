mod common;

use jyafn::{Error, Graph, Layout, RefValue, ResourceType, Value};

fn dummy(payload: &[u8]) -> Result<jyafn::Resource, Error> {
    ResourceType::from_json(r#"{"type":"Dummy"}"#)?.load("my_resource", payload)
}

#[test]
fn dummy_resource_end_to_end() {
    let resource = dummy(b"2.5").unwrap();
    let guard = Graph::begin("with_resources");
    let x = jyafn::scalar_input("x").unwrap();
    let result = resource
        .call("get", RefValue::struct_of([("x", RefValue::from(x))]))
        .unwrap();
    jyafn::ret(result).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call_args(&[Value::Scalar(2.5)]).unwrap();
    assert_eq!(common::scalar(&out), 1.0);

    // The payload travels with the artifact.
    let reloaded = jyafn::Function::load(&fun.dump().unwrap()).unwrap();
    let out = reloaded.call_args(&[Value::Scalar(5.0)]).unwrap();
    assert_eq!(common::scalar(&out), 2.0);
}

#[test]
fn bad_payloads_fail_at_load_time() {
    let err = dummy(b"0.0").unwrap_err();
    assert!(matches!(err, Error::Resource(_)), "{err}");
    assert!(err.to_string().contains("positive"), "{err}");
}

#[test]
fn unknown_methods_fail_at_build_time() {
    let resource = dummy(b"2.5").unwrap();
    let guard = Graph::begin("with_resources");
    let x = jyafn::scalar_input("x").unwrap();
    let err = resource
        .call("doesnt_exist", RefValue::struct_of([("x", RefValue::from(x))]))
        .unwrap_err();
    assert!(err.to_string().contains("doesnt_exist"), "{err}");
    drop(guard);
}

#[test]
fn failing_methods_surface_as_resource_errors() {
    let resource = dummy(b"2.5").unwrap();
    let guard = Graph::begin("with_resources");
    let x = jyafn::scalar_input("x").unwrap();
    let result = resource
        .call("err", RefValue::struct_of([("x", RefValue::from(x))]))
        .unwrap();
    jyafn::ret(result).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let err = fun.call_args(&[Value::Scalar(2.5)]).unwrap_err();
    match err {
        Error::Resource(e) => assert!(e.to_string().contains("my_resource"), "{e}"),
        other => panic!("expected a resource error, got {other}"),
    }
}

#[test]
fn square_matrix_methods() {
    let data = [2.0f64, 1.0, 1.0, 2.0];
    let payload: Vec<u8> = data.iter().flat_map(|x| x.to_le_bytes()).collect();
    let matrix = ResourceType::from_json(r#"{"type":"SquareMatrix"}"#)
        .unwrap()
        .load("m", &payload)
        .unwrap();

    let guard = Graph::begin("linalg");
    let b = jyafn::input("b", Layout::tensor(&[2])).unwrap();
    let solved = matrix
        .call("solve", RefValue::struct_of([("b", b)]))
        .unwrap();
    let det = matrix.call("det", RefValue::Unit).unwrap();
    jyafn::ret(RefValue::Tuple(vec![solved, det])).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun
        .call_args(&[Value::List(vec![Value::Scalar(2.0), Value::Scalar(1.0)])])
        .unwrap();
    let solved = out.at(0).unwrap();
    let det = out.at(1).unwrap();
    assert_eq!(
        solved,
        &Value::List(vec![Value::Scalar(1.0), Value::Scalar(0.0)])
    );
    assert!((common::scalar(det) - 3.0).abs() < 1e-12);
}

#[test]
fn square_matrix_inverse_via_artifact() {
    let data = [4.0f64, 0.0, 0.0, 2.0];
    let payload: Vec<u8> = data.iter().flat_map(|x| x.to_le_bytes()).collect();
    let matrix = ResourceType::from_json(r#"{"type":"SquareMatrix"}"#)
        .unwrap()
        .load("diag", &payload)
        .unwrap();

    let guard = Graph::begin("inverse");
    let inv = matrix.call("inv", RefValue::Unit).unwrap();
    jyafn::ret(inv).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let reloaded = jyafn::Function::load(&fun.dump().unwrap()).unwrap();
    let out = reloaded.call(&Value::Struct(vec![])).unwrap();
    assert_eq!(
        out,
        Value::List(vec![
            Value::List(vec![Value::Scalar(0.25), Value::Scalar(0.0)]),
            Value::List(vec![Value::Scalar(0.0), Value::Scalar(0.5)]),
        ])
    );
}

#[test]
fn missing_extensions_are_reported_at_load() {
    let ty = ResourceType::from_json(
        r#"{"type":"External","extension":"definitely_not_installed","resource":"Dummy"}"#,
    )
    .unwrap();
    let err = ty.load("r", b"payload").unwrap_err();
    assert!(
        err.to_string().contains("unavailable"),
        "{err}"
    );
}
