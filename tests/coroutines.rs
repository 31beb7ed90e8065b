use moonrise::state::State;
use moonrise::value::Value;
use moonrise::MULTRET;
use pretty_assertions::assert_eq;
use std::rc::Rc;

fn eval(l: &Rc<State>, source: &str) -> Vec<Value> {
    let f = l
        .load_string(source, "test")
        .unwrap_or_else(|e| panic!("load failed: {e}\n{source}"));
    l.push(Value::Function(f));
    l.pcall(0, MULTRET, None)
        .unwrap_or_else(|e| panic!("call failed: {e}\n{source}"));
    let n = l.get_top();
    let values = (1..=n).map(|i| l.get(i)).collect();
    l.set_top(0);
    values
}

#[test]
fn yield_and_resume_round_trip() {
    let l = State::new();
    let vals = eval(
        &l,
        "local c = coroutine.create(function()\n  for i = 1, 3 do coroutine.yield(i) end\nend)\n\
         local a1, b1 = coroutine.resume(c)\nlocal a2, b2 = coroutine.resume(c)\n\
         local a3, b3 = coroutine.resume(c)\nlocal a4, b4 = coroutine.resume(c)\n\
         return a1, b1, a2, b2, a3, b3, a4, b4",
    );
    // true,1, true,2, true,3, true — the final resume carries no values
    assert_eq!(
        vals,
        vec![
            Value::Bool(true),
            Value::Number(1.0),
            Value::Bool(true),
            Value::Number(2.0),
            Value::Bool(true),
            Value::Number(3.0),
            Value::Bool(true),
            Value::Nil,
        ]
    );

    // in a multi-value position only the last call expands
    let vals = eval(
        &l,
        "local c = coroutine.create(function() coroutine.yield(1) end)\n\
         return coroutine.resume(c), coroutine.resume(c)",
    );
    assert_eq!(vals, vec![Value::Bool(true), Value::Bool(true)]);
}

#[test]
fn values_cross_both_directions() {
    let l = State::new();
    let vals = eval(
        &l,
        "local c = coroutine.create(function(a, b)\n  local got = coroutine.yield(a + b)\n\
         return got * 2\nend)\n\
         local _, first = coroutine.resume(c, 3, 4)\nlocal _, second = coroutine.resume(c, 10)\n\
         return first, second",
    );
    assert_eq!(vals, vec![Value::Number(7.0), Value::Number(20.0)]);
}

#[test]
fn statuses() {
    let l = State::new();
    let vals = eval(
        &l,
        "local c\nc = coroutine.create(function()\n  coroutine.yield(coroutine.status(c))\nend)\n\
         local before = coroutine.status(c)\nlocal _, inside = coroutine.resume(c)\n\
         local between = coroutine.status(c)\ncoroutine.resume(c)\nlocal after = coroutine.status(c)\n\
         return before, inside, between, after",
    );
    assert_eq!(
        vals,
        vec![
            Value::string("suspended"),
            Value::string("running"),
            Value::string("suspended"),
            Value::string("dead"),
        ]
    );
}

#[test]
fn dead_coroutines_reject_resume() {
    let l = State::new();
    let vals = eval(
        &l,
        "local c = coroutine.create(function() end)\ncoroutine.resume(c)\n\
         local ok, err = coroutine.resume(c)\nreturn ok, err",
    );
    assert_eq!(vals[0], Value::Bool(false));
    assert_eq!(vals[1], Value::string("can not resume a dead thread"));
}

#[test]
fn errors_become_rejected_resumes() {
    let l = State::new();
    let vals = eval(
        &l,
        "local c = coroutine.create(function() error('inner') end)\n\
         local ok, err = coroutine.resume(c)\n\
         return ok, coroutine.status(c), err",
    );
    assert_eq!(vals[0], Value::Bool(false));
    assert_eq!(vals[1], Value::string("dead"));
    let Value::String(err) = &vals[2] else {
        panic!("expected error string, got {:?}", vals[2]);
    };
    assert!(
        err.to_string_lossy().contains("inner"),
        "{}",
        err.to_string_lossy()
    );
}

#[test]
fn wrap_propagates_values_and_errors() {
    let l = State::new();
    let vals = eval(
        &l,
        "local gen = coroutine.wrap(function()\n  coroutine.yield(1)\n  coroutine.yield(2)\nend)\n\
         return gen(), gen()",
    );
    assert_eq!(vals, vec![Value::Number(1.0), Value::Number(2.0)]);

    let vals = eval(
        &l,
        "local bad = coroutine.wrap(function() error('exploded') end)\n\
         local ok, err = pcall(bad)\nreturn ok",
    );
    assert_eq!(vals[0], Value::Bool(false));
}

#[test]
fn nested_coroutines() {
    let l = State::new();
    let vals = eval(
        &l,
        "local inner = coroutine.create(function()\n  coroutine.yield('deep')\nend)\n\
         local outer = coroutine.create(function()\n  local _, v = coroutine.resume(inner)\n\
         coroutine.yield(v .. '-up')\nend)\n\
         local _, out = coroutine.resume(outer)\nreturn out",
    );
    assert_eq!(vals, vec![Value::string("deep-up")]);
}

#[test]
fn yields_pair_with_resumes_in_order() {
    let l = State::new();
    let vals = eval(
        &l,
        "local log = {}\nlocal c = coroutine.create(function()\n  table.insert(log, 'a')\n\
         coroutine.yield()\n  table.insert(log, 'c')\nend)\n\
         coroutine.resume(c)\ntable.insert(log, 'b')\ncoroutine.resume(c)\n\
         return table.concat(log)",
    );
    assert_eq!(vals, vec![Value::string("abc")]);
}

#[test]
fn generators_drive_loops() {
    let l = State::new();
    let vals = eval(
        &l,
        "local function range(n)\n  return coroutine.wrap(function()\n    for i = 1, n do coroutine.yield(i) end\n  end)\nend\n\
         local s = 0\nfor i in range(5) do s = s + i end\nreturn s",
    );
    assert_eq!(vals, vec![Value::Number(15.0)]);
}

#[test]
fn host_level_coroutine_api() {
    let l = State::new();
    let f = l
        .load_string("coroutine.yield(1) coroutine.yield(2) return 3", "co")
        .unwrap();
    let th = l.new_thread();

    let moonrise::state::ResumeResult::Yield(vals) = l.resume(&th, f.clone(), &[]) else {
        panic!("expected yield");
    };
    assert_eq!(vals, vec![Value::Number(1.0)]);

    let moonrise::state::ResumeResult::Yield(vals) = l.resume(&th, f.clone(), &[]) else {
        panic!("expected yield");
    };
    assert_eq!(vals, vec![Value::Number(2.0)]);

    let moonrise::state::ResumeResult::Ok(vals) = l.resume(&th, f, &[]) else {
        panic!("expected completion");
    };
    assert_eq!(vals, vec![Value::Number(3.0)]);
}
