use criterion::{black_box, criterion_group, criterion_main, Criterion};
use moonrise::state::State;
use moonrise::value::Value;
use moonrise::MULTRET;
use std::rc::Rc;

fn run(l: &Rc<State>, source: &str) {
    let f = l.load_string(source, "bench").unwrap();
    l.push(Value::Function(f));
    l.pcall(0, MULTRET, None).unwrap();
    l.set_top(0);
}

fn bench_numeric_loop(c: &mut Criterion) {
    let l = State::new();
    c.bench_function("numeric_loop", |b| {
        b.iter(|| {
            run(
                &l,
                black_box("local s = 0 for i = 1, 10000 do s = s + i end return s"),
            )
        })
    });
}

fn bench_function_calls(c: &mut Criterion) {
    let l = State::new();
    c.bench_function("function_calls", |b| {
        b.iter(|| {
            run(
                &l,
                black_box(
                    "local function add(a, b) return a + b end\n\
                     local s = 0 for i = 1, 2000 do s = add(s, i) end return s",
                ),
            )
        })
    });
}

fn bench_table_fill(c: &mut Criterion) {
    let l = State::new();
    c.bench_function("table_fill", |b| {
        b.iter(|| {
            run(
                &l,
                black_box("local t = {} for i = 1, 5000 do t[i] = i end return #t"),
            )
        })
    });
}

fn bench_compile(c: &mut Criterion) {
    let l = State::new();
    c.bench_function("compile", |b| {
        b.iter(|| {
            l.load_string(
                black_box(
                    "local function fib(n) if n < 2 then return n end return fib(n - 1) + fib(n - 2) end\n\
                     return fib(10)",
                ),
                "bench",
            )
            .unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_numeric_loop,
    bench_function_calls,
    bench_table_fill,
    bench_compile
);
criterion_main!(benches);
