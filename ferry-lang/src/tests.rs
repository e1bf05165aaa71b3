use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::adapter::{Outcome, Verdict, VerdictKind};
use crate::convert::{
    FieldReader, FieldWriter, Fields, Nil, Push, Read, Record, StackEstimate, Variadic,
};
use crate::error::{Category, Error, Expected};
use crate::lifecycle::{CoroutineRef, FunctionRef, Master, Step, Weak};
use crate::opaque::{self, Handle, Opaque, OpaqueType};
use crate::persist::{Feature, Permanents, Persistence};
use crate::runtime::function::{Callback, Raised, Transfer};
use crate::runtime::value::{Type, Value};
use crate::vm::{Status, Vm};
use crate::ErrorKind;

fn round_trip<T>(vm: &mut Vm, value: T) -> T
where
    T: Push + Read + Clone,
{
    let top = vm.top();
    value.push(vm).unwrap();
    let read = T::read(vm, -1).unwrap();
    vm.pop(1);
    assert_eq!(vm.top(), top);
    read
}

#[test]
fn scalars_round_trip() {
    let mut vm = Vm::new();
    assert_eq!(round_trip(&mut vm, 42_i64), 42);
    assert_eq!(round_trip(&mut vm, -7_i8), -7);
    assert_eq!(round_trip(&mut vm, u32::MAX), u32::MAX);
    assert!(round_trip(&mut vm, true));
    assert_eq!(round_trip(&mut vm, 1.5_f64), 1.5);
    assert_eq!(round_trip(&mut vm, String::from("hello")), "hello");
    assert_eq!(round_trip(&mut vm, 'é'), 'é');
}

#[test]
fn containers_round_trip() {
    let mut vm = Vm::new();
    assert_eq!(round_trip(&mut vm, vec![1_i64, 2, 3]), vec![1, 2, 3]);
    assert_eq!(round_trip(&mut vm, [true, false]), [true, false]);
    assert_eq!(round_trip(&mut vm, Some(4_u8)), Some(4));
    assert_eq!(round_trip(&mut vm, None::<u8>), None);
    assert_eq!(
        round_trip(&mut vm, (String::from("pair"), 2_i32)),
        (String::from("pair"), 2)
    );
    let map = BTreeMap::from([(String::from("a"), 1_i64), (String::from("b"), 2)]);
    assert_eq!(round_trip(&mut vm, map.clone()), map);
}

#[test]
fn mismatched_types_fail() {
    let mut vm = Vm::new();
    vm.push_string("12");
    let err = i64::read(&mut vm, -1).unwrap_err();
    assert_eq!(err.category(), Category::Conversion);
    assert_eq!(err.message(), "expected integer, found string");
    vm.pop(1);

    vm.push_float(1.0);
    assert_eq!(
        bool::read(&mut vm, -1).unwrap_err().message(),
        "expected boolean, found float"
    );
    assert!(i64::read(&mut vm, -1).is_err());
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn narrowing_never_wraps() {
    let mut vm = Vm::new();
    vm.push_int(300);
    assert_eq!(
        u8::read(&mut vm, -1).unwrap_err().message(),
        "integer 300 is out of range for u8"
    );
    assert_eq!(u16::read(&mut vm, -1).unwrap(), 300);
    vm.pop(1);

    vm.push_int(-1);
    assert_eq!(
        u32::read(&mut vm, -1).unwrap_err().message(),
        "negative integer -1 cannot be read as u32"
    );
    vm.pop(1);

    assert!(u64::MAX.push(&mut vm).is_err());
    assert_eq!(vm.top(), 0);
}

#[test]
fn integers_widen_only_when_exact() {
    let mut vm = Vm::new();
    vm.push_int(3);
    assert_eq!(f64::read(&mut vm, -1).unwrap(), 3.0);
    vm.pop(1);
    vm.push_int((1 << 53) + 1);
    assert!(f64::read(&mut vm, -1).is_err());
    vm.pop(1);
    vm.push_float(0.1);
    assert!(f32::read(&mut vm, -1).is_err());
    vm.pop(1);
}

#[test]
fn element_errors_carry_position() {
    let mut vm = Vm::new();
    vec![Value::from(1_i64), Value::from("two")]
        .push(&mut vm)
        .unwrap();
    let err = Vec::<i64>::read(&mut vm, -1).unwrap_err();
    assert_eq!(err.message(), "in index [2]\nexpected integer, found string");
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn fixed_sequences_check_length() {
    let mut vm = Vm::new();
    vec![1_i64, 2, 3].push(&mut vm).unwrap();
    assert!(<[i64; 2]>::read(&mut vm, -1).is_err());
    assert_eq!(<[i64; 3]>::read(&mut vm, -1).unwrap(), [1, 2, 3]);
    vm.pop(1);
}

#[test]
fn pairs_reject_longer_sequences() {
    let mut vm = Vm::new();
    vec![1_i64, 2, 3].push(&mut vm).unwrap();
    assert_eq!(
        <(i64, i64)>::read(&mut vm, -1).unwrap_err().message(),
        "expected a pair, found a sequence of 3 elements"
    );
    vm.pop(1);
    assert_eq!(round_trip(&mut vm, (1_i64, None::<i64>)), (1, None));
    assert_eq!(vm.top(), 0);
}

#[test]
fn hashed_and_keyed_containers_round_trip() {
    let mut vm = Vm::new();
    let scores = HashMap::from([(String::from("ada"), 3_i64), (String::from("grace"), 5)]);
    assert_eq!(round_trip(&mut vm, scores.clone()), scores);

    let mut flags = HashMap::with_hasher(ahash::RandomState::new());
    flags.insert(1_i64, true);
    flags.insert(-4, false);
    assert_eq!(round_trip(&mut vm, flags.clone()), flags);

    let tags = BTreeSet::from([String::from("red"), String::from("blue")]);
    assert_eq!(round_trip(&mut vm, tags.clone()), tags);
    let ids = HashSet::from([1_u32, 2, 3]);
    assert_eq!(round_trip(&mut vm, ids.clone()), ids);

    let mut names = kempt::Map::new();
    names.insert(2_i64, String::from("two"));
    names.insert(1, String::from("one"));
    names.push(&mut vm).unwrap();
    let read = kempt::Map::<i64, String>::read(&mut vm, -1).unwrap();
    vm.pop(1);
    assert_eq!(read.len(), 2);
    assert_eq!(read.get(&1_i64).map(String::as_str), Some("one"));
    assert_eq!(read.get(&2_i64).map(String::as_str), Some("two"));
    assert_eq!(vm.top(), 0);
}

#[test]
fn keyed_errors_name_the_key() {
    let mut vm = Vm::new();
    vm.new_table();
    vm.push_int(1);
    vm.set_field(-2, "a").unwrap();
    vm.push_string("many");
    vm.set_field(-2, "b").unwrap();

    assert_eq!(
        HashMap::<String, i64>::read(&mut vm, -1).unwrap_err().message(),
        "in value for key b\nexpected integer, found string"
    );
    assert_eq!(
        BTreeMap::<i64, Value>::read(&mut vm, -1).unwrap_err().message(),
        "in key a\nexpected integer, found string"
    );
    assert_eq!(
        kempt::Map::<String, bool>::read(&mut vm, -1).unwrap_err().message(),
        "in value for key a\nexpected boolean, found integer"
    );
    assert_eq!(
        BTreeSet::<String>::read(&mut vm, -1).unwrap_err().message(),
        "in value for key a\nexpected boolean, found integer"
    );
    vm.pop(1);

    vm.new_table();
    vm.push_bool(false);
    vm.set_field(-2, "gone").unwrap();
    assert_eq!(
        HashSet::<String>::read(&mut vm, -1).unwrap_err().message(),
        "set members must map to true"
    );
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn exhausted_pushes_leave_the_stack_alone() {
    let mut vm = Vm::builder().max_stack(1).build();
    assert_eq!(vec![1_i64, 2, 3].push(&mut vm), Err(Error::StackExhausted));
    assert_eq!(vm.top(), 0);
    assert_eq!(
        BTreeMap::from([(1_i64, 2_i64)]).push(&mut vm),
        Err(Error::StackExhausted)
    );
    assert_eq!(vm.top(), 0);
    assert_eq!(
        BTreeSet::from([String::from("x")]).push(&mut vm),
        Err(Error::StackExhausted)
    );
    assert_eq!(vm.top(), 0);
}

#[derive(Debug, Clone, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

impl Record for Point {
    fn write_fields(self, fields: &mut FieldWriter<'_>) -> Expected<()> {
        fields.field("x", self.x)?;
        fields.field("y", self.y)
    }

    fn read_fields(fields: &mut FieldReader<'_>) -> Expected<Self> {
        Ok(Self {
            x: fields.field("x")?,
            y: fields.field("y")?,
        })
    }
}

#[test]
fn records_visit_named_fields() {
    let mut vm = Vm::new();
    let point = Fields(Point { x: 1, y: -2 });
    assert_eq!(round_trip(&mut vm, point.clone()), point);

    vm.new_table();
    vm.push_string("wide");
    vm.set_field(-2, "x").unwrap();
    let err = Fields::<Point>::read(&mut vm, -1).unwrap_err();
    assert_eq!(err.message(), "in field `x`\nexpected integer, found string");
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn estimates_are_composed() {
    assert_eq!(<i64 as Push>::ESTIMATE, StackEstimate::Slots(1));
    assert_eq!(<Vec<i64> as Push>::ESTIMATE, StackEstimate::Slots(2));
    assert_eq!(<Fields<Point> as Push>::ESTIMATE, StackEstimate::Unknown);
    assert_eq!(
        StackEstimate::Slots(2).max(StackEstimate::Slots(5)),
        StackEstimate::Slots(5)
    );
}

#[test]
fn error_context_and_degradation() {
    let err = Error::conversion("expected integer, found string").prepend_context("in key a");
    assert_eq!(err.message(), "in key a\nexpected integer, found string");
    assert_eq!(err.kind(), "conversion");

    assert_eq!(
        Error::OutOfMemory.prepend_context("in index [1]"),
        Error::OutOfMemory
    );
    let lifetime = Error::VmUnreachable.prepend_context("calling back");
    assert_eq!(lifetime.category(), Category::Lifetime);
    assert_eq!(
        lifetime.message(),
        "calling back\ncannot reach the virtual machine"
    );
}

#[test]
fn adapter_short_circuits_on_bad_arguments() {
    let called = Arc::new(AtomicBool::new(false));
    let mut vm = Vm::new();
    vm.push_fn({
        let called = called.clone();
        move |_vm: &mut Vm, _count: i64, _name: String| {
            called.store(true, Ordering::Relaxed);
            Outcome::NONE
        }
    });
    vm.push_string("not a number");
    vm.push_string("name");
    assert_eq!(vm.protected_call(2, 0), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("bad argument #1: expected integer, found string")
    );
    vm.pop(1);
    assert_eq!(vm.top(), 0);
    assert!(!called.load(Ordering::Relaxed));
}

#[test]
fn adapter_latches_the_first_failure() {
    let mut vm = Vm::new();
    vm.push_fn(|_vm: &mut Vm, _a: bool, _b: bool| ());
    vm.push_int(1);
    vm.push_string("two");
    assert_eq!(vm.protected_call(2, 0), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("bad argument #1: expected boolean, found integer")
    );
    vm.pop(1);
}

#[test]
fn adapter_returns_values() {
    let mut vm = Vm::new();
    vm.push_fn(|_vm: &mut Vm, a: i64, b: i64| -> Expected<i64> { Ok(a + b) });
    vm.push_int(2);
    vm.push_int(3);
    assert_eq!(vm.protected_call(2, 1), Status::Ok);
    assert_eq!(vm.to_int(-1), Some(5));
    vm.pop(1);

    vm.push_fn(|_vm: &mut Vm, values: Variadic<i64>| -> Expected<i64> {
        Ok(values.iter().sum())
    });
    for value in 1..=4 {
        vm.push_int(value);
    }
    assert_eq!(vm.protected_call(4, 1), Status::Ok);
    assert_eq!(vm.to_int(-1), Some(10));
    vm.pop(1);

    vm.push_fn(|vm: &mut Vm| Outcome::values(vm, (1_i64, "two")));
    assert_eq!(vm.protected_call(0, crate::vm::Results::All), Status::Ok);
    assert_eq!(vm.top(), 2);
    assert_eq!(vm.to_str(-1), Some("two"));
    vm.pop(2);
}

#[test]
fn adapter_reports_host_errors() {
    let mut vm = Vm::new();
    vm.push_fn(|_vm: &mut Vm| -> Expected<()> { Err(Error::runtime("boom")) });
    assert_eq!(vm.protected_call(0, 0), Status::Error);
    assert_eq!(vm.to_str(-1), Some("boom"));
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn variadic_errors_name_the_argument() {
    let mut vm = Vm::new();
    let tally = |_vm: &mut Vm, label: String, rest: Variadic<i64>| -> Expected<String> {
        Ok(format!("{label}{}", rest.iter().sum::<i64>()))
    };
    vm.push_fn(tally);
    vm.push_string("n");
    vm.push_int(1);
    vm.push_string("two");
    assert_eq!(vm.protected_call(3, 1), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("bad argument #2: in argument #3\nexpected integer, found string")
    );
    vm.pop(1);

    vm.push_fn(tally);
    vm.push_string("n");
    assert_eq!(vm.protected_call(1, 1), Status::Ok);
    assert_eq!(vm.to_str(-1), Some("n0"));
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn exhausted_argument_space_is_a_guest_error() {
    let called = Arc::new(AtomicBool::new(false));
    let mut vm = Vm::builder().max_stack(3).min_frame_stack(1).build();
    assert!(vm.reserve_stack(2));
    vm.push_fn({
        let called = called.clone();
        move |_vm: &mut Vm, _rows: Vec<Vec<i64>>| called.store(true, Ordering::Relaxed)
    });
    vm.push_int(1);
    assert_eq!(vm.protected_call(1, 0), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("cannot reserve space for arguments\nguest stack exhausted")
    );
    vm.pop(1);
    assert_eq!(vm.top(), 0);
    assert!(!called.load(Ordering::Relaxed));
}

#[test]
fn exhausted_result_space_is_a_guest_error() {
    let mut vm = Vm::builder().max_stack(2).min_frame_stack(1).build();
    assert!(vm.reserve_stack(1));
    vm.push_fn(|_vm: &mut Vm| -> Expected<Vec<i64>> { Ok(vec![1, 2, 3]) });
    assert_eq!(vm.protected_call(0, 1), Status::Error);
    assert_eq!(vm.to_str(-1), Some("guest stack exhausted"));
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn verdicts_are_plain_data() {
    let mut vm = Vm::new();
    let verdict = Verdict::consume(&mut vm, Outcome::Error(Error::runtime("late")));
    assert_eq!(verdict.kind(), VerdictKind::Error);
    assert_eq!(verdict.count(), 1);
    assert_eq!(vm.to_str(-1), Some("late"));
    vm.pop(1);

    let verdict = Verdict::consume(&mut vm, Outcome::Yield(2));
    assert_eq!(verdict.kind(), VerdictKind::Yield);
    assert_eq!(verdict.count(), 2);
}

fn answer(vm: &mut Vm) -> Result<Transfer, Raised> {
    vm.push_int(42);
    Ok(Transfer::Return(1))
}

#[test]
fn raw_functions_skip_adaptation() {
    let mut vm = Vm::new();
    vm.push_function(Callback::raw(answer));
    assert_eq!(vm.protected_call(0, 1), Status::Ok);
    assert_eq!(vm.to_int(-1), Some(42));
    vm.pop(1);
}

#[test]
fn yielding_outside_a_coroutine_is_an_error() {
    let mut vm = Vm::new();
    vm.push_fn(|vm: &mut Vm| Outcome::yield_values(vm, (1_i64,)));
    assert_eq!(vm.protected_call(0, 0), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("attempt to yield from outside a coroutine")
    );
    vm.pop(1);
}

#[test]
fn weak_references_detach() {
    let master = Master::new(5);
    let mut first = master.observe();
    let mut second = Weak::from(&master);
    assert_eq!(master.observers(), 2);
    assert_eq!(first.lock(), Some(5));

    drop(master);
    assert!(first.lock().is_none());
    assert!(first.is_detached());
    assert!(first.lock().is_none());
    drop(first);
    assert!(second.lock().is_none());
    assert!(second.is_detached());
}

#[test]
fn weak_references_detach_when_the_master_drops_concurrently() {
    let master = Master::new(1_u64);
    let mut observer = master.observe();
    let dropper = std::thread::spawn(move || drop(master));
    while observer.lock().is_some() {}
    assert!(observer.is_detached());
    dropper.join().unwrap();
}

#[test]
fn weak_references_outlive_in_any_order() {
    let master = Master::new("vm");
    let first = master.observe();
    let mut second = first.clone();
    drop(first);
    assert_eq!(second.lock(), Some("vm"));
    drop(master);
    assert!(second.lock().is_none());
    assert!(Weak::<u8>::detached().lock().is_none());
}

#[test]
fn handles_detect_dropped_machines() {
    let vm = Vm::new();
    let other = Vm::new();
    let mut handle = vm.handle();
    assert!(handle.is_alive());
    assert!(handle.refers_to(&vm));
    assert_eq!(handle.check(&other), Err(Error::VmUnreachable));
    drop(vm);
    assert!(!handle.is_alive());
}

#[test]
fn function_refs_call_back() {
    let mut vm = Vm::new();
    vm.push_fn(|_vm: &mut Vm, a: i64, b: i64| -> Expected<i64> { Ok(a * b) });
    let mut multiply = FunctionRef::new(&vm, -1).unwrap();
    vm.set_global("multiply");
    let product: i64 = multiply.call(&mut vm, (6_i64, 7_i64)).unwrap();
    assert_eq!(product, 42);
    assert_eq!(vm.top(), 0);

    let mut other = Vm::new();
    assert_eq!(
        multiply.call::<_, i64>(&mut other, (1_i64, 2_i64)),
        Err(Error::VmUnreachable)
    );

    vm.push_nil();
    vm.set_global("multiply");
    vm.collect_garbage();
    assert_eq!(
        multiply.call::<_, i64>(&mut vm, (1_i64, 2_i64)),
        Err(Error::ObjectCollected)
    );
}

fn count_second(vm: &mut Vm) -> Result<Transfer, Raised> {
    vm.push_int(2);
    Ok(Transfer::Return(1))
}

fn count_first(vm: &mut Vm) -> Result<Transfer, Raised> {
    vm.push_function(Callback::raw(count_second));
    if let Err(err) = vm.set_continuation() {
        return Err(vm.raise(&err));
    }
    vm.push_int(1);
    Ok(Transfer::Yield(1))
}

#[test]
fn coroutine_refs_resume_until_expired() {
    let mut vm = Vm::new();
    vm.push_function(Callback::raw(count_first));
    vm.new_thread().unwrap();
    let mut counter = CoroutineRef::new(&vm, -1).unwrap();
    vm.set_global("counter");

    assert_eq!(
        counter.resume::<_, i64>(&mut vm, ()).unwrap(),
        Step::Yielded(1)
    );
    assert_eq!(
        counter.resume::<_, i64>(&mut vm, ()).unwrap(),
        Step::Finished(2)
    );
    assert_eq!(
        counter.resume::<_, i64>(&mut vm, ()),
        Err(Error::ExpiredCoroutine)
    );
    assert_eq!(vm.top(), 0);
}

struct Apple(u32);

static APPLE: OpaqueType<Apple> = OpaqueType::new("Apple", |t| {
    t.with_method("weight", |vm: &mut Vm, this: Handle<Apple>| -> Expected<u32> {
        Ok(this.get(vm)?.0)
    })
});

impl Opaque for Apple {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &APPLE
    }
}

#[derive(Debug)]
struct Banana;

static BANANA: OpaqueType<Banana> = OpaqueType::new("Banana", |t| t);

impl Opaque for Banana {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &BANANA
    }
}

struct Impostor;

static IMPOSTOR: OpaqueType<Impostor> = OpaqueType::new("Apple", |t| t);

impl Opaque for Impostor {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &IMPOSTOR
    }
}

#[test]
fn opaque_types_do_not_miscast() {
    let mut vm = Vm::new();
    opaque::register::<Apple>(&mut vm).unwrap();
    opaque::register::<Banana>(&mut vm).unwrap();
    opaque::register::<Apple>(&mut vm).unwrap();
    assert!(opaque::register::<Impostor>(&mut vm).is_err());

    opaque::push(&mut vm, Apple(3)).unwrap();
    assert!(opaque::test::<Banana>(&vm, -1).is_none());
    assert!(opaque::test::<Impostor>(&vm, -1).is_none());
    assert_eq!(opaque::test::<Apple>(&vm, -1).map(|apple| apple.0), Some(3));
    assert_eq!(
        opaque::check::<Banana>(&vm, -1).unwrap_err().message(),
        "expected Banana, found Apple"
    );
    assert_eq!(vm.type_name(-1), "Apple");
    vm.pop(1);

    vm.push_int(1);
    assert!(opaque::test::<Apple>(&vm, -1).is_none());
    vm.pop(1);
}

#[test]
fn opaque_methods_are_found_through_the_metatable() {
    let mut vm = Vm::new();
    opaque::register::<Apple>(&mut vm).unwrap();
    opaque::push(&mut vm, Apple(7)).unwrap();
    assert_eq!(vm.get_field(-1, "weight").unwrap(), Type::Function);
    vm.push_copy(-2);
    assert_eq!(vm.protected_call(1, 1), Status::Ok);
    assert_eq!(vm.to_int(-1), Some(7));
    vm.pop(2);

    vm.push_fn(|vm: &mut Vm, apple: Handle<Apple>| -> Expected<()> {
        apple.get_mut(vm)?.0 += 1;
        Ok(())
    });
    vm.push_int(1);
    assert_eq!(vm.protected_call(1, 0), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("bad argument #1: expected Apple, found integer")
    );
    vm.pop(1);
}

#[test]
fn failed_construction_releases_the_block() {
    let mut vm = Vm::new();
    opaque::register::<Apple>(&mut vm).unwrap();
    let objects = vm.object_count();
    let result = opaque::construct::<Apple>(&mut vm, |_| Err(Error::runtime("no apples")));
    assert_eq!(result, Err(Error::runtime("no apples")));
    assert_eq!(vm.object_count(), objects);
    assert_eq!(vm.top(), 0);

    assert!(opaque::push(&mut vm, Banana).is_err());
    assert_eq!(vm.object_count(), objects);
}

#[derive(Debug)]
struct Tracked(Arc<AtomicUsize>);

impl Drop for Tracked {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

static TRACKED: OpaqueType<Tracked> = OpaqueType::new("Tracked", |t| t);

impl Opaque for Tracked {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &TRACKED
    }
}

#[test]
fn finalized_objects_fail_cleanly() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut vm = Vm::new();
    opaque::register::<Tracked>(&mut vm).unwrap();
    opaque::push(&mut vm, Tracked(drops.clone())).unwrap();
    let object = vm.value(-1);
    vm.pop(1);

    vm.collect_garbage();
    assert_eq!(drops.load(Ordering::Relaxed), 1);

    // Finalized objects survive one more cycle.
    vm.push_value(object.clone());
    assert!(opaque::test::<Tracked>(&vm, -1).is_none());
    let err = opaque::check::<Tracked>(&vm, -1).unwrap_err();
    assert_eq!(err.message(), "expected Tracked, found a finalized object");
    vm.pop(1);

    vm.collect_garbage();
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert_eq!(object.push(&mut vm), Err(Error::ObjectCollected));
}

#[test]
fn dropping_the_machine_finalizes_remaining_objects() {
    let drops = Arc::new(AtomicUsize::new(0));
    let mut vm = Vm::new();
    opaque::register::<Tracked>(&mut vm).unwrap();
    opaque::push(&mut vm, Tracked(drops.clone())).unwrap();
    vm.set_global("tracked");
    drop(vm);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

struct Printer {
    print: Callback,
    printed: Arc<Mutex<Vec<String>>>,
}

impl Printer {
    fn new() -> Self {
        let printed = Arc::new(Mutex::new(Vec::new()));
        let print = Callback::new({
            let printed = printed.clone();
            move |_vm: &mut Vm, text: String| Vec::push(&mut printed.lock(), text)
        });
        Self { print, printed }
    }
}

impl Feature for Printer {
    fn name(&self) -> &'static str {
        "printer"
    }

    fn on_init(&self, vm: &mut Vm) -> Expected<()> {
        vm.push_function(self.print.clone());
        vm.set_global("print");
        Ok(())
    }

    fn on_register_permanents(&self, _vm: &mut Vm, permanents: &mut Permanents) -> Expected<()> {
        permanents.add_callback("lib.print", &self.print)
    }
}

#[test]
fn snapshots_require_initialization() {
    let persistence = Persistence::builder().with_feature(Printer::new()).build();
    let mut vm = Vm::new();
    assert_eq!(persistence.snapshot(&mut vm), Err(Error::Uninitialized));
    assert_eq!(
        persistence.restore(&mut vm, b"FRRY\x01\x00"),
        Err(Error::Uninitialized)
    );
    persistence.initialize(&mut vm).unwrap();
    assert!(persistence.initialize(&mut vm).is_err());
    assert!(persistence.snapshot(&mut vm).is_ok());
}

#[test]
fn snapshots_preserve_shape_and_callbacks() {
    let original = Printer::new();
    let persistence = Persistence::builder().with_feature(original).build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();

    vm.push_int(42);
    vm.set_global("answer");
    vm.new_table();
    vm.push_copy(-1);
    vm.set_field(-2, "me").unwrap();
    vm.push_string("first");
    vm.raw_set_index(-2, 1).unwrap();
    vm.set_global("cycle");
    vm.get_global("print");
    vm.set_global("alias");
    let bytes = persistence.snapshot(&mut vm).unwrap();
    assert_eq!(vm.top(), 0);

    let restored = Printer::new();
    let printed = restored.printed.clone();
    let persistence = Persistence::builder().with_feature(restored).build();
    let mut fresh = Vm::new();
    persistence.initialize(&mut fresh).unwrap();
    persistence.restore(&mut fresh, &bytes).unwrap();
    assert_eq!(fresh.top(), 0);

    fresh.get_global("answer");
    assert_eq!(fresh.to_int(-1), Some(42));
    fresh.get_global("cycle");
    fresh.get_field(-1, "me").unwrap();
    assert_eq!(fresh.get(-1), fresh.get(-2));
    fresh.raw_get_index(-1, 1).unwrap();
    assert_eq!(fresh.to_str(-1), Some("first"));
    fresh.pop(4);

    fresh.get_global("alias");
    fresh.push_string("hello");
    assert_eq!(fresh.protected_call(1, 0), Status::Ok);
    assert_eq!(&*printed.lock(), &[String::from("hello")]);
}

#[test]
fn unnamed_functions_abort_snapshots() {
    let persistence = Persistence::builder().with_feature(Printer::new()).build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();
    vm.push_fn(|_vm: &mut Vm| ());
    vm.set_global("anonymous");
    let err = persistence.snapshot(&mut vm).unwrap_err();
    assert_eq!(err.category(), Category::Persistence);
    assert!(err.message().contains("no permanent name"));
    assert_eq!(vm.top(), 0);
}

#[test]
fn malformed_snapshots_leave_state_untouched() {
    let persistence = Persistence::builder().with_feature(Printer::new()).build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();
    vm.push_int(1);
    vm.set_global("x");
    let bytes = persistence.snapshot(&mut vm).unwrap();
    vm.push_int(2);
    vm.set_global("x");

    assert!(persistence.restore(&mut vm, b"NOPE!").is_err());
    assert!(persistence
        .restore(&mut vm, &bytes[..bytes.len() - 1])
        .is_err());
    let mut trailing = bytes.clone();
    Vec::push(&mut trailing, 0);
    assert!(persistence.restore(&mut vm, &trailing).is_err());
    vm.get_global("x");
    assert_eq!(vm.to_int(-1), Some(2));
    vm.pop(1);

    persistence.restore(&mut vm, &bytes).unwrap();
    vm.get_global("x");
    assert_eq!(vm.to_int(-1), Some(1));
    vm.pop(1);
}

#[test]
fn permanents_reject_duplicates() {
    let print = Callback::new(|_vm: &mut Vm| ());
    let mut permanents = Permanents::new();
    permanents.add_callback("print", &print).unwrap();
    assert!(permanents.add_callback("print", &Callback::raw(answer)).is_err());
    assert!(permanents.add_callback("echo", &print.clone()).is_err());
    assert_eq!(permanents.len(), 1);
    assert_eq!(permanents.forward().callback(&print), Some("print"));
    assert!(permanents.reverse().callback("print").is_ok());
    assert!(permanents.reverse().callback("missing").is_err());
}

struct Counter(Arc<Mutex<i64>>);

impl Feature for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn on_init(&self, _vm: &mut Vm) -> Expected<()> {
        Ok(())
    }

    fn on_register_permanents(&self, _vm: &mut Vm, _permanents: &mut Permanents) -> Expected<()> {
        Ok(())
    }

    fn captures_state(&self) -> bool {
        true
    }

    fn on_capture(&self, _vm: &mut Vm) -> Expected<Value> {
        Ok(Value::Int(*self.0.lock()))
    }

    fn on_restore(&self, _vm: &mut Vm, captured: Value) -> Expected<()> {
        match captured {
            Value::Int(count) => {
                *self.0.lock() = count;
                Ok(())
            }
            other => Err(Error::mismatch(Type::Integer, other.kind())),
        }
    }
}

struct Fragile(Arc<AtomicBool>);

impl Feature for Fragile {
    fn name(&self) -> &'static str {
        "fragile"
    }

    fn on_init(&self, _vm: &mut Vm) -> Expected<()> {
        Ok(())
    }

    fn on_register_permanents(&self, _vm: &mut Vm, _permanents: &mut Permanents) -> Expected<()> {
        Ok(())
    }

    fn on_restore(&self, _vm: &mut Vm, _captured: Value) -> Expected<()> {
        if self.0.swap(false, Ordering::Relaxed) {
            Err(Error::runtime("fragile feature broke"))
        } else {
            Ok(())
        }
    }
}

#[test]
fn failed_restores_roll_back() {
    let count = Arc::new(Mutex::new(5));
    let fail = Arc::new(AtomicBool::new(false));
    let persistence = Persistence::builder()
        .with_feature(Counter(count.clone()))
        .with_feature(Fragile(fail.clone()))
        .build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();
    vm.push_int(1);
    vm.set_global("x");
    let bytes = persistence.snapshot(&mut vm).unwrap();

    vm.push_int(2);
    vm.set_global("x");
    *count.lock() = 9;
    fail.store(true, Ordering::Relaxed);
    let err = persistence.restore(&mut vm, &bytes).unwrap_err();
    assert!(err.message().starts_with("restore was rolled back"));
    assert!(err.message().contains("fragile feature broke"));
    assert_eq!(vm.top(), 0);
    vm.get_global("x");
    assert_eq!(vm.to_int(-1), Some(2));
    vm.pop(1);
    assert_eq!(*count.lock(), 9);

    persistence.restore(&mut vm, &bytes).unwrap();
    assert_eq!(*count.lock(), 5);
}

#[derive(Serialize, Deserialize)]
struct Jar {
    beans: Vec<String>,
}

static JAR: OpaqueType<Jar> = OpaqueType::new("Jar", |t| {
    t.with_method("count", |vm: &mut Vm, this: Handle<Jar>| -> Expected<usize> {
        Ok(this.get(vm)?.beans.len())
    })
    .with_persistence()
});

impl Opaque for Jar {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &JAR
    }
}

struct Jars;

impl Feature for Jars {
    fn name(&self) -> &'static str {
        "jars"
    }

    fn on_init(&self, vm: &mut Vm) -> Expected<()> {
        opaque::register::<Jar>(vm)
    }

    fn on_register_permanents(&self, vm: &mut Vm, permanents: &mut Permanents) -> Expected<()> {
        permanents.add_opaque::<Jar>(vm)
    }
}

#[test]
fn persistable_opaque_objects_round_trip() {
    let persistence = Persistence::builder().with_feature(Jars).build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();
    opaque::push(
        &mut vm,
        Jar {
            beans: vec![String::from("pinto"), String::from("fava")],
        },
    )
    .unwrap();
    vm.set_global("jar");
    vm.get_global("jar");
    vm.get_field(-1, "count").unwrap();
    vm.set_global("count");
    vm.pop(1);
    let bytes = persistence.snapshot(&mut vm).unwrap();

    let mut fresh = Vm::new();
    persistence.initialize(&mut fresh).unwrap();
    persistence.restore(&mut fresh, &bytes).unwrap();
    fresh.get_global("jar");
    let beans = opaque::test::<Jar>(&fresh, -1).map(|jar| jar.beans.clone());
    assert_eq!(
        beans,
        Some(vec![String::from("pinto"), String::from("fava")])
    );
    fresh.get_global("count");
    fresh.insert(-2);
    assert_eq!(fresh.protected_call(1, 1), Status::Ok);
    assert_eq!(fresh.to_int(-1), Some(2));
    fresh.pop(1);
}

#[test]
fn unpersistable_opaque_objects_abort_snapshots() {
    let persistence = Persistence::builder().with_feature(Jars).build();
    let mut vm = Vm::new();
    persistence.initialize(&mut vm).unwrap();
    opaque::register::<Apple>(&mut vm).unwrap();
    opaque::push(&mut vm, Apple(1)).unwrap();
    vm.set_global("apple");
    let err = persistence.snapshot(&mut vm).unwrap_err();
    assert!(err.message().contains("not persistable"));
}

#[test]
fn nil_marker_converts() {
    let mut vm = Vm::new();
    Nil.push(&mut vm).unwrap();
    assert_eq!(Nil::read(&mut vm, -1), Ok(Nil));
    assert_eq!(vm.get_type(-1), Type::Nil);
    vm.pop(1);
}
