//! Precompiled-chunk round trips through dump/undump and the loader's
//! auto-detection of binary versus source chunks.

use moonrise::state::State;
use moonrise::value::Value;
use moonrise::MULTRET;
use pretty_assertions::assert_eq;
use std::io::Write;
use std::rc::Rc;

fn call_chunk(l: &Rc<State>, f: Rc<moonrise::value::Function>, args: &[Value]) -> Vec<Value> {
    l.push(Value::Function(f));
    for arg in args {
        l.push(arg.clone());
    }
    l.pcall(args.len() as i32, MULTRET, None).unwrap();
    let n = l.get_top();
    let values = (1..=n).map(|i| l.get(i)).collect();
    l.set_top(0);
    values
}

#[test]
fn dump_then_load_preserves_behavior() {
    let l = State::new();
    let f = l
        .load_string(
            "local acc = 0\nfor i = 1, select('#', ...) do acc = acc + select(i, ...) end\nreturn acc",
            "sum",
        )
        .unwrap();

    let args = [Value::Number(1.0), Value::Number(2.0), Value::Number(39.0)];
    let direct = call_chunk(&l, f.clone(), &args);

    let bytes = l.dump_function(&f, false).unwrap();
    let reloaded = l.load(&bytes, "sum").unwrap();
    let roundtrip = call_chunk(&l, reloaded, &args);

    assert_eq!(direct, roundtrip);
    assert_eq!(direct, vec![Value::Number(42.0)]);
}

#[test]
fn stripped_dumps_still_execute() {
    let l = State::new();
    let f = l
        .load_string("return (function(a, b) return a * b end)(6, 7)", "mul")
        .unwrap();
    let bytes = l.dump_function(&f, true).unwrap();
    let reloaded = l.load(&bytes, "mul").unwrap();
    assert_eq!(call_chunk(&l, reloaded, &[]), vec![Value::Number(42.0)]);
}

#[test]
fn nested_prototypes_survive_the_round_trip() {
    let l = State::new();
    let f = l
        .load_string(
            "local function outer(n)\n  local function inner(m) return m + 1 end\n  return inner(n) * 2\nend\n\
             return outer(20)",
            "nested",
        )
        .unwrap();
    let bytes = l.dump_function(&f, false).unwrap();
    let reloaded = l.load(&bytes, "nested").unwrap();
    assert_eq!(call_chunk(&l, reloaded, &[]), vec![Value::Number(42.0)]);
}

#[test]
fn load_from_file() {
    let l = State::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunk.lua");
    std::fs::write(&path, "value = 'from disk'").unwrap();

    l.do_file(path.to_str().unwrap()).unwrap();
    assert_eq!(l.get_global("value"), Value::string("from disk"));
}

#[test]
fn binary_chunk_files_are_recognized() {
    let l = State::new();
    let f = l.load_string("return 'binary ok'", "bin").unwrap();
    let bytes = l.dump_function(&f, false).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chunk.out");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&bytes).unwrap();
    drop(file);

    let reloaded = l.load_file(path.to_str().unwrap()).unwrap();
    assert_eq!(call_chunk(&l, reloaded, &[]), vec![Value::string("binary ok")]);
}

#[test]
fn garbage_is_rejected() {
    let l = State::new();
    assert!(l.load(b"\x1bnot a real chunk", "bad").is_err());
    assert!(l.load_string("local = broken", "bad").is_err());
    assert!(l.load_file("/nonexistent/path.lua").is_err());
}

#[test]
fn host_functions_refuse_to_dump() {
    let l = State::new();
    let f = l.new_function(|_| Ok(0));
    assert!(l.dump_function(&f, false).is_err());
}
