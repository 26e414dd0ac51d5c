mod common;

use jyafn::{Graph, Layout, Value};

#[test]
fn make_date_reformats_on_output() {
    let guard = Graph::begin("make_date");
    let dt = jyafn::input("dt", Layout::datetime()).unwrap();
    jyafn::ret_with(dt, Layout::datetime_fmt("%Y-%m-%d")).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.eval(r#"{"dt": "2024-05-14T12:34:56.789012"}"#).unwrap();
    assert_eq!(out, "\"2024-05-14\"");
}

#[test]
fn return_day_extracts_the_field() {
    let guard = Graph::begin("return_day");
    let dt = jyafn::input("dt", Layout::datetime()).unwrap().single().unwrap();
    jyafn::ret(dt.day().unwrap()).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    let out = fun.eval(r#"{"dt": "2024-05-14T01:02:03.0"}"#).unwrap();
    assert_eq!(out, "14.0");
}

#[test]
fn timestamps_convert_both_ways() {
    let guard = Graph::begin("stamps");
    let t = jyafn::scalar_input("t").unwrap();
    let dt = jyafn::fromtimestamp(t).unwrap();
    let hour = dt.hour().unwrap();
    let back = dt.timestamp().unwrap();
    jyafn::ret(jyafn::RefValue::Tuple(vec![hour.into(), back.into()])).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    // 1971-01-01T07:00:00 UTC.
    let secs = 365.0 * jyafn::DAY + 7.0 * jyafn::HOUR;
    let out = fun.call_args(&[Value::Scalar(secs)]).unwrap();
    assert_eq!(
        out,
        Value::Tuple(vec![Value::Scalar(7.0), Value::Scalar(secs)])
    );
}

#[test]
fn parse_and_format_run_at_call_time() {
    let guard = Graph::begin("reshape");
    let text = jyafn::input("text", Layout::Symbol).unwrap().single().unwrap();
    let dt = jyafn::parse_datetime(text, "%Y-%m-%d").unwrap();
    let year = dt.format("%Y").unwrap();
    jyafn::ret(jyafn::RefValue::Tuple(vec![
        dt.day().unwrap().into(),
        year.into(),
    ]))
    .unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    // The input symbol is not in the artifact's table: it arrives as a
    // per-call dynamic symbol, and the formatted year leaves as one.
    let out = fun.call_args(&[Value::from("2031-07-04")]).unwrap();
    assert_eq!(
        out,
        Value::Tuple(vec![Value::Scalar(4.0), Value::from("2031")])
    );

    let err = fun.call_args(&[Value::from("not a date")]).unwrap_err();
    assert!(err.to_string().contains("not a date"), "{err}");
}

#[test]
fn constant_datetimes_fold() {
    let stamp = chrono::DateTime::parse_from_rfc3339("2020-02-29T12:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    let guard = Graph::begin("leap");
    let x = jyafn::scalar_input("x").unwrap();
    let day = jyafn::make_datetime(stamp).unwrap().day().unwrap();
    jyafn::ret(x + day).unwrap();
    let graph = guard.finish().unwrap();

    let Some(fun) = common::compile(&graph) else {
        return;
    };
    assert_eq!(
        common::scalar(&fun.call_args(&[Value::Scalar(0.5)]).unwrap()),
        29.5
    );
}
