mod common;

use jyafn::{Error, Graph, Layout, RefValue, SerializationError, Value};

#[test]
fn struct_return_with_declared_output_layout() {
    let guard = Graph::begin("k");
    let a = jyafn::scalar_input("a").unwrap();
    let b = jyafn::scalar_input("b").unwrap();
    jyafn::ret(RefValue::struct_of([("result", (2.0 * a + b + 1.0).into())])).unwrap();
    let graph = guard.finish().unwrap();

    assert_eq!(
        graph.output_layout().unwrap().to_json(),
        r#"{"type":"struct","fields":[["result",{"type":"scalar"}]]}"#
    );

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.call_args(&[Value::Scalar(1.0), Value::Scalar(2.0)]).unwrap();
    assert_eq!(out.field("result"), Some(&Value::Scalar(5.0)));
    assert_eq!(
        fun.output_layout().to_json(),
        r#"{"type":"struct","fields":[["result",{"type":"scalar"}]]}"#
    );
}

#[test]
fn artifacts_behave_identically_after_reload() {
    let guard = Graph::begin("a_fun");
    let a = jyafn::scalar_input("a").unwrap();
    let b = jyafn::scalar_input("b").unwrap();
    let c = jyafn::input("c", Layout::Symbol).unwrap().single().unwrap();
    let bump = c.eq("gold").unwrap().choose(100.0, 0.0).unwrap();
    jyafn::ret(2.0 * a + b + 1.0 + bump).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let bytes = fun.dump().unwrap();
    let reloaded = jyafn::Function::load(&bytes).unwrap();

    for (a, b, c) in [(5.0, 6.0, "a"), (5.0, 6.0, "gold"), (-1.0, 0.5, "x")] {
        let args = [Value::Scalar(a), Value::Scalar(b), Value::from(c)];
        let first = fun.call_args(&args).unwrap();
        let second = reloaded.call_args(&args).unwrap();
        assert_eq!(first, second, "inputs ({a}, {b}, {c:?})");
    }

    // Round-tripping the bytes is stable, too.
    assert_eq!(reloaded.dump().unwrap(), bytes);
}

#[test]
fn files_round_trip() -> anyhow::Result<()> {
    let guard = Graph::begin("to_disk");
    let a = jyafn::scalar_input("a")?;
    jyafn::ret(a * 3.0)?;
    let graph = guard.finish()?;

    let Some(fun) = common::compile(&graph) else {
        return Ok(());
    };
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("to_disk.jyafn");
    fun.write(&path)?;
    let reloaded = jyafn::Function::read(&path)?;
    assert_eq!(
        common::scalar(&reloaded.call_args(&[Value::Scalar(2.0)])?),
        6.0
    );
    Ok(())
}

#[test]
fn mangled_artifacts_are_rejected() {
    let guard = Graph::begin("fragile");
    let a = jyafn::scalar_input("a").unwrap();
    jyafn::ret(a + 1.0).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let bytes = fun.dump().unwrap();

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'?';
    assert!(matches!(
        jyafn::Function::load(&bad_magic),
        Err(Error::Serialization(SerializationError::BadMagic))
    ));

    assert!(matches!(
        jyafn::Function::load(&bytes[..bytes.len() / 2]),
        Err(Error::Serialization(SerializationError::Truncated))
    ));

    let mut bad_version = bytes.clone();
    bad_version[4..8].copy_from_slice(&42u32.to_le_bytes());
    assert!(matches!(
        jyafn::Function::load(&bad_version),
        Err(Error::Serialization(SerializationError::UnsupportedVersion(42)))
    ));
}

#[test]
fn json_description_is_available() {
    let guard = Graph::begin("described");
    let a = jyafn::scalar_input("a").unwrap();
    jyafn::assert_(a.is_finite().unwrap(), "a must be finite").unwrap();
    jyafn::ret(a * a).unwrap();
    let mut graph = guard.finish().unwrap();
    graph.set_metadata("jyafn.doc", "Squares a number.");

    // The graph itself has a JSON debug form.
    let graph_json = graph.to_json();
    assert!(graph_json.contains("described"), "{graph_json}");

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let description: serde_json::Value = serde_json::from_str(&fun.to_json()).unwrap();
    assert_eq!(description["name"], "described");
    assert_eq!(description["metadata"]["jyafn.doc"], "Squares a number.");
    assert_eq!(description["input_layout"]["type"], "struct");
    assert_eq!(description["asserts"][0], "a must be finite");
}
