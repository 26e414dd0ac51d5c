mod common;

use jyafn::{Dataset, Graph, Value};

#[test]
fn datasets_map_through_a_function() {
    let guard = Graph::begin("a_fun");
    let a = jyafn::scalar_input("a").unwrap();
    let b = jyafn::scalar_input("b").unwrap();
    jyafn::ret(2.0 * a + b + 1.0).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };

    let rows = vec![
        Value::struct_of([("a", Value::Scalar(3.0)), ("b", Value::Scalar(1.0))]),
        Value::struct_of([("a", Value::Scalar(2.0)), ("b", Value::Scalar(2.0))]),
        Value::struct_of([("a", Value::Scalar(1.0)), ("b", Value::Scalar(3.0))]),
    ];
    let data = Dataset::build(fun.input_layout().clone(), rows.clone()).unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data.decode().unwrap(), rows);

    let mapped = data.map(&fun).unwrap();
    assert_eq!(mapped.layout(), fun.output_layout());
    assert_eq!(
        mapped.decode().unwrap(),
        vec![Value::Scalar(8.0), Value::Scalar(7.0), Value::Scalar(6.0)]
    );
}

#[test]
fn mapping_the_wrong_shape_fails() {
    let guard = Graph::begin("scalar_only");
    let a = jyafn::scalar_input("a").unwrap();
    jyafn::ret(a + 1.0).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let data = Dataset::build(jyafn::Layout::Scalar, vec![Value::Scalar(1.0)]).unwrap();
    assert!(data.map(&fun).is_err());
}

#[test]
fn failing_rows_name_their_index() {
    let guard = Graph::begin("guarded");
    let a = jyafn::scalar_input("a").unwrap();
    jyafn::assert_(a.gt(0.0).unwrap(), "a must be positive").unwrap();
    jyafn::ret(a * 2.0).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let rows = vec![
        Value::struct_of([("a", Value::Scalar(1.0))]),
        Value::struct_of([("a", Value::Scalar(-1.0))]),
    ];
    let data = Dataset::build(fun.input_layout().clone(), rows).unwrap();
    let err = data.map(&fun).unwrap_err();
    assert!(err.to_string().contains("row 1"), "{err}");
    assert!(err.to_string().contains("a must be positive"), "{err}");
}
