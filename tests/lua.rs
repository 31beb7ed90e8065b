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

fn eval1(l: &Rc<State>, source: &str) -> Value {
    eval(l, source).into_iter().next().unwrap_or(Value::Nil)
}

fn numbers(values: &[Value]) -> Vec<f64> {
    values
        .iter()
        .map(|v| v.as_number().expect("number result"))
        .collect()
}

#[test]
fn arithmetic_and_precedence() {
    let l = State::new();
    assert_eq!(eval1(&l, "return 2 + 3 * 4"), Value::Number(14.0));
    assert_eq!(eval1(&l, "return 2 ^ 3 ^ 2"), Value::Number(512.0));
    assert_eq!(eval1(&l, "return (2 + 3) * 4"), Value::Number(20.0));
    assert_eq!(eval1(&l, "return 7 % 3"), Value::Number(1.0));
    assert_eq!(eval1(&l, "return -1 % 3"), Value::Number(2.0));
    assert_eq!(eval1(&l, "local a = '10' return a + 5"), Value::Number(15.0));
    assert_eq!(eval1(&l, "return -(-3)"), Value::Number(3.0));
}

#[test]
fn strings_and_concat() {
    let l = State::new();
    assert_eq!(eval1(&l, "return 'a' .. 'b' .. 'c'"), Value::string("abc"));
    assert_eq!(eval1(&l, "return 'n=' .. 5"), Value::string("n=5"));
    assert_eq!(eval1(&l, "return #'hello'"), Value::Number(5.0));
    assert_eq!(eval1(&l, "return ('abc'):upper()"), Value::string("ABC"));
    assert_eq!(
        eval1(&l, "return string.format('%d/%s/%06.2f', 42, 'x', 3.25)"),
        Value::string("42/x/003.25")
    );
    assert_eq!(
        eval1(&l, "return string.sub('hello world', -5)"),
        Value::string("world")
    );
}

#[test]
fn locals_and_multiple_assignment() {
    let l = State::new();
    let vals = eval(&l, "local a, b, c = 1, 2 return a, b, c");
    assert_eq!(vals[0], Value::Number(1.0));
    assert_eq!(vals[1], Value::Number(2.0));
    assert_eq!(vals[2], Value::Nil);
    let vals = eval(&l, "local a, b = 1, 2 a, b = b, a return a, b");
    assert_eq!(numbers(&vals), vec![2.0, 1.0]);
    let vals = eval(&l, "local function two() return 1, 2 end local a, b = two() return b, a");
    assert_eq!(numbers(&vals), vec![2.0, 1.0]);
}

#[test]
fn control_flow() {
    let l = State::new();
    assert_eq!(
        eval1(
            &l,
            "local n = 0 while n < 10 do n = n + 1 end return n"
        ),
        Value::Number(10.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local n = 0 repeat n = n + 3 until n > 10 return n"
        ),
        Value::Number(12.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local s = 0 for i = 1, 100 do if i % 2 == 0 then s = s + i end end return s"
        ),
        Value::Number(2550.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local n = 0 for i = 10, 1, -2 do n = n + 1 end return n"
        ),
        Value::Number(5.0)
    );
    assert_eq!(
        eval1(
            &l,
            "for i = 1, 100 do if i == 7 then return i end end return -1"
        ),
        Value::Number(7.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local n = 0 for i = 1, 10 do if i > 4 then break end n = i end return n"
        ),
        Value::Number(4.0)
    );
}

#[test]
fn logical_operators() {
    let l = State::new();
    assert_eq!(eval1(&l, "return 1 and 2"), Value::Number(2.0));
    assert_eq!(eval1(&l, "return nil and 2"), Value::Nil);
    assert_eq!(eval1(&l, "return false or 'x'"), Value::string("x"));
    assert_eq!(eval1(&l, "return nil or false"), Value::Bool(false));
    assert_eq!(eval1(&l, "return not nil"), Value::Bool(true));
    assert_eq!(
        eval1(&l, "local a = 5 return a > 3 and a < 10"),
        Value::Bool(true)
    );
    assert_eq!(
        eval1(&l, "local t = {} return t.x and t.x.y or 'fallback'"),
        Value::string("fallback")
    );
}

#[test]
fn tables_and_constructors() {
    let l = State::new();
    assert_eq!(eval1(&l, "local t = {1, 2, 3} return #t"), Value::Number(3.0));
    assert_eq!(
        eval1(&l, "local t = {x = 1, [2 + 2] = 'four'} return t[4]"),
        Value::string("four")
    );
    assert_eq!(
        eval1(&l, "local t = {} t[1] = 'a' t.key = 'b' return t[1] .. t.key"),
        Value::string("ab")
    );
    assert_eq!(
        eval1(
            &l,
            "local function three() return 1, 2, 3 end local t = {three()} return #t"
        ),
        Value::Number(3.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local t = {} for i = 1, 100 do t[i] = i * i end return t[81]"
        ),
        Value::Number(6561.0)
    );
    // boundary after deletion is either side of the hole
    let n = eval1(&l, "local t = {1,2,3,4,5} t[3] = nil return #t")
        .as_number()
        .unwrap();
    assert!(n == 2.0 || n == 5.0, "got {n}");
}

#[test]
fn table_library() {
    let l = State::new();
    assert_eq!(
        eval1(
            &l,
            "local t = {3, 1, 2} table.sort(t) return t[1] .. t[2] .. t[3]"
        ),
        Value::string("123")
    );
    assert_eq!(
        eval1(
            &l,
            "local t = {3, 1, 2} table.sort(t, function(a, b) return a > b end) \
             return t[1] .. t[2] .. t[3]"
        ),
        Value::string("321")
    );
    assert_eq!(
        eval1(&l, "local t = {'a', 'b'} table.insert(t, 'c') return table.concat(t, '-')"),
        Value::string("a-b-c")
    );
    assert_eq!(
        eval1(&l, "local t = {'a', 'b', 'c'} return table.remove(t, 1) .. #t"),
        Value::string("a2")
    );
    // an inconsistent comparator is detected rather than looping
    assert_eq!(
        eval1(
            &l,
            "local t = {1, 2, 3, 4, 5, 6, 7, 8, 9, 10}\n\
             local ok = pcall(table.sort, t, function(a, b) return true end)\nreturn ok"
        ),
        Value::Bool(false)
    );
}

#[test]
fn generic_for_and_next() {
    let l = State::new();
    assert_eq!(
        eval1(
            &l,
            "local t = {10, 20, 30} local s = 0 for i, v in ipairs(t) do s = s + i * v end return s"
        ),
        Value::Number(140.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local t = {a = 1, b = 2, c = 3} local s = 0 for _, v in pairs(t) do s = s + v end return s"
        ),
        Value::Number(6.0)
    );
    assert_eq!(
        eval1(
            &l,
            "local t = {x = 1} local k, v = next(t) return k, v"
        ),
        Value::string("x")
    );
}

#[test]
fn closures_capture_by_reference() {
    let l = State::new();
    let vals = eval(
        &l,
        "local i = 0\nlocal f = function() i = i + 1 return i end\nreturn f(), f(), f()",
    );
    assert_eq!(numbers(&vals), vec![1.0, 2.0, 3.0]);

    // independent captures per call
    let vals = eval(
        &l,
        "local function counter()\n  local n = 0\n  return function() n = n + 1 return n end\nend\n\
         local a, b = counter(), counter()\nreturn a(), a(), b()",
    );
    assert_eq!(numbers(&vals), vec![1.0, 2.0, 1.0]);

    // upvalues shared between sibling closures
    let vals = eval(
        &l,
        "local function pair()\n  local n = 0\n  local function inc() n = n + 1 end\n\
         local function get() return n end\n  return inc, get\nend\n\
         local inc, get = pair()\ninc() inc()\nreturn get()",
    );
    assert_eq!(numbers(&vals), vec![2.0]);
}

#[test]
fn upvalues_close_on_scope_exit() {
    let l = State::new();
    let vals = eval(
        &l,
        "local fns = {}\nfor i = 1, 3 do\n  local x = i * 10\n  fns[i] = function() return x end\nend\n\
         return fns[1](), fns[2](), fns[3]()",
    );
    assert_eq!(numbers(&vals), vec![10.0, 20.0, 30.0]);
}

#[test]
fn vararg_functions() {
    let l = State::new();
    assert_eq!(
        eval1(&l, "local function n(...) return select('#', ...) end return n(1, nil, 3)"),
        Value::Number(3.0)
    );
    let vals = eval(
        &l,
        "local function tail(...) return ... end return tail(1, 2, 3)",
    );
    assert_eq!(numbers(&vals), vec![1.0, 2.0, 3.0]);
    assert_eq!(
        eval1(
            &l,
            "local function f(a, ...) local b, c = ... return a + b + c end return f(1, 2, 3)"
        ),
        Value::Number(6.0)
    );
    // legacy arg table
    assert_eq!(
        eval1(&l, "local function f(...) return arg.n end return f('x', 'y')"),
        Value::Number(2.0)
    );
}

#[test]
fn tail_calls_do_not_grow_the_stack() {
    let l = State::new();
    assert_eq!(
        eval1(
            &l,
            "local function f(n, a)\n  if n == 0 then return a else return f(n - 1, a + n) end\nend\n\
             return f(100000, 0)"
        ),
        Value::Number(5000050000.0)
    );
}

#[test]
fn deep_plain_recursion_overflows_cleanly() {
    let l = State::new();
    let f = l
        .load_string(
            "local function f(n) if n == 0 then return 0 end return 1 + f(n - 1) end return f(100000)",
            "deep",
        )
        .unwrap();
    l.push(Value::Function(f));
    let err = l.pcall(0, MULTRET, None).unwrap_err();
    assert!(err.to_string().contains("stack overflow"), "{err}");
    l.set_top(0);
}

#[test]
fn method_calls() {
    let l = State::new();
    assert_eq!(
        eval1(
            &l,
            "local obj = {value = 10}\nfunction obj:get() return self.value end\n\
             function obj:add(n) self.value = self.value + n return self end\n\
             return obj:add(5):get()"
        ),
        Value::Number(15.0)
    );
}

#[test]
fn metatables() {
    let l = State::new();
    // __index chain
    assert_eq!(
        eval1(
            &l,
            "local a, b = {}, {}\nsetmetatable(a, {__index = b})\nb.x = 42\nreturn a.x"
        ),
        Value::Number(42.0)
    );
    // __index function
    assert_eq!(
        eval1(
            &l,
            "local t = setmetatable({}, {__index = function(t, k) return k .. '!' end})\nreturn t.hi"
        ),
        Value::string("hi!")
    );
    // __newindex redirects writes
    assert_eq!(
        eval1(
            &l,
            "local log = {}\nlocal t = setmetatable({}, {__newindex = function(t, k, v) rawset(log, k, v) end})\n\
             t.x = 7\nreturn log.x, rawget(t, 'x')"
        ),
        Value::Number(7.0)
    );
    // arithmetic metamethods
    assert_eq!(
        eval1(
            &l,
            "local mt = {__add = function(a, b) return a.n + b.n end}\n\
             local a = setmetatable({n = 3}, mt)\nlocal b = setmetatable({n = 4}, mt)\nreturn a + b"
        ),
        Value::Number(7.0)
    );
    // __eq fires only when shared
    assert_eq!(
        eval1(
            &l,
            "local mt = {__eq = function() return true end}\n\
             local a = setmetatable({}, mt)\nlocal b = setmetatable({}, mt)\nreturn a == b"
        ),
        Value::Bool(true)
    );
    // __call
    assert_eq!(
        eval1(
            &l,
            "local t = setmetatable({}, {__call = function(self, x) return x * 2 end})\nreturn t(21)"
        ),
        Value::Number(42.0)
    );
    // __tostring
    assert_eq!(
        eval1(
            &l,
            "local t = setmetatable({}, {__tostring = function() return 'pretty' end})\nreturn tostring(t)"
        ),
        Value::string("pretty")
    );
    // __metatable locks out replacement
    assert_eq!(
        eval1(
            &l,
            "local t = setmetatable({}, {__metatable = 'locked'})\n\
             local ok = pcall(setmetatable, t, {})\nreturn ok, getmetatable(t)"
        ),
        Value::Bool(false)
    );
}

#[test]
fn errors_and_protected_calls() {
    let l = State::new();
    assert_eq!(
        eval1(&l, "local ok, err = pcall(function() error('boom') end) return ok"),
        Value::Bool(false)
    );
    // string errors gain position info and a traceback
    let err = eval1(&l, "local ok, err = pcall(function() error('boom') end) return err");
    let Value::String(err) = err else {
        panic!("expected string error, got {err:?}");
    };
    let text = err.to_string_lossy().into_owned();
    assert!(text.contains("boom"), "{text}");
    assert!(text.contains("test:"), "{text}");
    assert!(text.contains("stack traceback:"), "{text}");
    // non-string error values pass through unwrapped
    assert_eq!(
        eval1(
            &l,
            "local ok, err = pcall(function() error({code = 7}) end)\nreturn err.code"
        ),
        Value::Number(7.0)
    );
    // errors unwind to the innermost protected call
    assert_eq!(
        eval1(
            &l,
            "local ok = pcall(function()\n  local ok2 = pcall(error)\n  error('outer')\nend)\nreturn ok"
        ),
        Value::Bool(false)
    );
    assert_eq!(
        eval1(&l, "return pcall(function() return 1 + nil end)"),
        Value::Bool(false)
    );
    // runtime errors carry position info
    assert_eq!(
        eval1(
            &l,
            "local _, err = pcall(function() error('x') end)\nreturn err ~= 'x'"
        ),
        Value::Bool(true)
    );
}

#[test]
fn assert_and_select() {
    let l = State::new();
    assert_eq!(eval1(&l, "return assert(42)"), Value::Number(42.0));
    let e = eval1(&l, "local ok, e = pcall(assert, false, 'why') return e");
    let Value::String(e) = e else {
        panic!("expected string, got {e:?}");
    };
    assert!(e.to_string_lossy().contains("why"));
    let vals = eval(&l, "return select(2, 'a', 'b', 'c')");
    assert_eq!(vals.len(), 2);
    assert_eq!(vals[0], Value::string("b"));
}

#[test]
fn math_library() {
    let l = State::new();
    assert_eq!(eval1(&l, "return math.floor(3.7)"), Value::Number(3.0));
    assert_eq!(eval1(&l, "return math.max(1, 9, 4)"), Value::Number(9.0));
    assert_eq!(eval1(&l, "return math.fmod(-1, 3)"), Value::Number(-1.0));
    assert_eq!(
        eval1(&l, "local r = math.random() return r >= 0 and r < 1"),
        Value::Bool(true)
    );
    assert_eq!(
        eval1(&l, "math.randomseed(7) local r = math.random(5, 10) return r >= 5 and r <= 10"),
        Value::Bool(true)
    );
}

#[test]
fn number_formatting() {
    let l = State::new();
    assert_eq!(eval1(&l, "return tostring(5)"), Value::string("5"));
    assert_eq!(eval1(&l, "return tostring(0.5)"), Value::string("0.5"));
    assert_eq!(eval1(&l, "return tostring(1/0)"), Value::string("inf"));
    assert_eq!(eval1(&l, "return tonumber('0x10')"), Value::Number(16.0));
    assert_eq!(eval1(&l, "return tonumber('ff', 16)"), Value::Number(255.0));
    assert_eq!(eval1(&l, "return tonumber('zz')"), Value::Nil);
}

#[test]
fn channels() {
    let l = State::new();
    let vals = eval(
        &l,
        "local ch = channel.make(2)\nch:send('a')\nch:send('b')\n\
         local ok1, v1 = ch:receive()\nlocal ok2, v2 = ch:receive()\nlocal ok3 = ch:receive()\n\
         return v1, v2, ok3",
    );
    assert_eq!(vals[0], Value::string("a"));
    assert_eq!(vals[1], Value::string("b"));
    assert_eq!(vals[2], Value::Bool(false));

    // bounded channels reject overflow
    assert_eq!(
        eval1(
            &l,
            "local ch = channel.make(1)\nch:send(1)\nlocal ok = pcall(function() ch:send(2) end)\nreturn ok"
        ),
        Value::Bool(false)
    );

    // channels are forbidden as table keys
    assert_eq!(
        eval1(
            &l,
            "local ch = channel.make(1)\nlocal ok = pcall(function() local t = {} t[ch] = 1 end)\nreturn ok"
        ),
        Value::Bool(false)
    );
}

#[test]
fn environments() {
    let l = State::new();
    assert_eq!(
        eval1(
            &l,
            "local f = function() return x end\nsetfenv(f, {x = 'sandboxed'})\nreturn f()"
        ),
        Value::string("sandboxed")
    );
}

#[test]
fn host_functions_and_globals() {
    let l = State::new();
    l.register("double", |l| {
        let n = l.check_number(1)?;
        l.push(Value::Number(n * 2.0));
        Ok(1)
    });
    assert_eq!(eval1(&l, "return double(21)"), Value::Number(42.0));

    l.set_global("answer", Value::Number(42.0)).unwrap();
    assert_eq!(eval1(&l, "return answer"), Value::Number(42.0));
    assert_eq!(l.get_global("answer"), Value::Number(42.0));
}

#[test]
fn string_coercion_in_arithmetic_and_compare() {
    let l = State::new();
    assert_eq!(eval1(&l, "return '2' * '3'"), Value::Number(6.0));
    assert_eq!(eval1(&l, "return 'abc' < 'abd'"), Value::Bool(true));
    assert_eq!(
        eval1(&l, "return pcall(function() return 'a' .. true end)"),
        Value::Bool(false)
    );
    assert_eq!(
        eval1(&l, "return pcall(function() return 1 < 'x' end)"),
        Value::Bool(false)
    );
}
