use ferry_lang::lifecycle::FunctionRef;
use ferry_lang::opaque;
use ferry_lang::{Expected, Persistence, PushMany, Read, Type, Value, Vm};

use crate::{standard, Buffer, Output};

fn machine() -> (Vm, Persistence, Output) {
    let output = Output::memory();
    let persistence = standard(output.clone()).build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();
    (vm, persistence, output)
}

fn call<A: PushMany, R: Read>(vm: &mut Vm, library: &str, name: &str, args: A) -> Expected<R> {
    assert_eq!(vm.get_global(library), Type::Table);
    vm.get_field(-1, name).unwrap();
    let mut function = FunctionRef::new(vm, -1).unwrap();
    vm.pop(2);
    function.call(vm, args)
}

fn method<A: PushMany, R: Read>(vm: &mut Vm, object: &Value, name: &str, args: A) -> Expected<R> {
    vm.push_value(object.clone());
    vm.get_field(-1, name).unwrap();
    let mut function = FunctionRef::new(vm, -1).unwrap();
    vm.pop(2);
    function.call(vm, args)
}

#[test]
fn print_joins_with_tabs() {
    let (mut vm, _, output) = machine();
    let _: Value = call(&mut vm, "lib", "print", (1_i64, "two", true, Value::Nil)).unwrap();
    assert_eq!(output.take_lines(), vec![String::from("1\ttwo\ttrue\tnil")]);
    assert_eq!(vm.top(), 0);
}

#[test]
fn help_describes_the_library() {
    let (mut vm, _, output) = machine();
    let _: Value = call(&mut vm, "lib", "help", ()).unwrap();
    assert_eq!(output.take_lines().len(), 5);
    let _: Value = call(&mut vm, "lib", "help", ("type",)).unwrap();
    assert_eq!(
        output.take_lines(),
        vec![String::from(
            "type(value): returns the type name of `value`"
        )]
    );
    let err = call::<_, Value>(&mut vm, "lib", "help", ("missing",)).unwrap_err();
    assert_eq!(err.message(), "no help for `missing`");
}

#[test]
fn type_names_include_opaque_identities() {
    let (mut vm, _, _) = machine();
    let name: String = call(&mut vm, "lib", "type", (1_i64,)).unwrap();
    assert_eq!(name, "integer");
    let buffer: Value = call(&mut vm, "buffer", "new", ()).unwrap();
    let name: String = call(&mut vm, "lib", "type", (buffer,)).unwrap();
    assert_eq!(name, "Buffer");
    let text: String = call(&mut vm, "lib", "tostring", (1.5_f64,)).unwrap();
    assert_eq!(text, "1.5");
}

#[test]
fn error_raises_its_message() {
    let (mut vm, _, _) = machine();
    let err = call::<_, Value>(&mut vm, "lib", "error", ("boom",)).unwrap_err();
    assert_eq!(err.message(), "boom");
    assert_eq!(vm.top(), 0);
}

#[test]
fn buffers_collect_strings() {
    let (mut vm, _, _) = machine();
    let buffer: Value = call(&mut vm, "buffer", "new", ("a",)).unwrap();
    let len: usize = method(&mut vm, &buffer, "push", (buffer.clone(), "b", 3_i64)).unwrap();
    assert_eq!(len, 3);
    let joined: String = method(&mut vm, &buffer, "join", (buffer.clone(), ", ")).unwrap();
    assert_eq!(joined, "a, b, 3");
    let joined: String = method(&mut vm, &buffer, "join", (buffer.clone(),)).unwrap();
    assert_eq!(joined, "ab3");
    let _: Value = method(&mut vm, &buffer, "clear", (buffer.clone(),)).unwrap();
    let len: usize = method(&mut vm, &buffer, "len", (buffer.clone(),)).unwrap();
    assert_eq!(len, 0);

    let err = method::<_, usize>(&mut vm, &buffer, "len", (1_i64,)).unwrap_err();
    assert_eq!(
        err.message(),
        "bad argument #1: expected Buffer, found integer"
    );
}

fn drain(vm: &mut Vm, generator: &Value) -> Vec<i64> {
    let mut values = Vec::new();
    while let Some(value) = call::<_, Option<i64>>(vm, "gen", "next", (generator.clone(),)).unwrap()
    {
        values.push(value);
    }
    values
}

#[test]
fn ranges_count_in_both_directions() {
    let (mut vm, _, _) = machine();
    let up: Value = call(&mut vm, "gen", "range", (1_i64, 4_i64)).unwrap();
    assert_eq!(drain(&mut vm, &up), vec![1, 2, 3]);
    let next: Option<i64> = call(&mut vm, "gen", "next", (up,)).unwrap();
    assert_eq!(next, None);

    let down: Value = call(&mut vm, "gen", "range", (3_i64, 0_i64, -1_i64)).unwrap();
    assert_eq!(drain(&mut vm, &down), vec![3, 2, 1]);

    let empty: Value = call(&mut vm, "gen", "range", (5_i64, 5_i64)).unwrap();
    assert_eq!(drain(&mut vm, &empty), Vec::<i64>::new());

    let created: i64 = call(&mut vm, "gen", "created", ()).unwrap();
    assert_eq!(created, 3);
    assert_eq!(vm.top(), 0);
}

#[test]
fn ranges_reject_bad_arguments() {
    let (mut vm, _, _) = machine();
    let err = call::<_, Value>(&mut vm, "gen", "range", (1_i64, 2_i64, 0_i64)).unwrap_err();
    assert_eq!(err.message(), "range step cannot be zero");
    let err = call::<_, Value>(&mut vm, "gen", "next", (1_i64,)).unwrap_err();
    assert_eq!(
        err.message(),
        "bad argument #1: expected thread, found integer"
    );
}

#[test]
fn standard_state_survives_snapshots() {
    let (mut vm, persistence, _) = machine();
    let buffer: Value = call(&mut vm, "buffer", "new", ("kept",)).unwrap();
    vm.push_value(buffer);
    vm.set_global("notes");
    let counter: Value = call(&mut vm, "gen", "range", (10_i64, 13_i64)).unwrap();
    let first: Option<i64> = call(&mut vm, "gen", "next", (counter.clone(),)).unwrap();
    assert_eq!(first, Some(10));
    vm.push_value(counter);
    vm.set_global("counter");
    let bytes = persistence.snapshot(&mut vm).unwrap();
    drop(vm);

    let (mut fresh, persistence, output) = machine();
    persistence.restore(&mut fresh, &bytes).unwrap();

    fresh.get_global("counter");
    let counter = fresh.pop_value();
    assert_eq!(drain(&mut fresh, &counter), vec![11, 12]);
    let created: i64 = call(&mut fresh, "gen", "created", ()).unwrap();
    assert_eq!(created, 1);

    fresh.get_global("notes");
    assert_eq!(
        opaque::test::<Buffer>(&fresh, -1).map(Buffer::parts),
        Some(&[String::from("kept")][..])
    );
    fresh.pop(1);

    let _: Value = call(&mut fresh, "lib", "print", ("restored",)).unwrap();
    assert_eq!(output.take_lines(), vec![String::from("restored")]);
}
