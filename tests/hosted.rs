//! Exercises the host API the way an embedding application uses it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ferry::adapter::Outcome;
use ferry::convert::Variadic;
use ferry::lifecycle::Master;
use ferry::opaque::{self, Handle, Opaque, OpaqueType};
use ferry::vm::{Results, Status};
use ferry::{Expected, Push, Read, Value, Vm};

#[test]
fn values_round_trip_through_the_stack() {
    let mut vm = Vm::new();
    let mut scores = HashMap::new();
    scores.insert(String::from("ada"), 3_u16);
    scores.insert(String::from("grace"), 5);
    let nested = vec![
        BTreeMap::from([(1_i64, vec![String::from("one")])]),
        BTreeMap::new(),
    ];

    scores.clone().push(&mut vm).unwrap();
    nested.clone().push(&mut vm).unwrap();
    assert_eq!(
        Vec::<BTreeMap<i64, Vec<String>>>::read(&mut vm, -1).unwrap(),
        nested
    );
    assert_eq!(HashMap::<String, u16>::read(&mut vm, -2).unwrap(), scores);
    vm.pop(2);
    assert_eq!(vm.top(), 0);
}

#[test]
fn failed_reads_leave_the_stack_alone() {
    let mut vm = Vm::new();
    vec![Value::from(1_i64), Value::from(2.5_f64)]
        .push(&mut vm)
        .unwrap();
    let err = Vec::<i32>::read(&mut vm, -1).unwrap_err();
    assert_eq!(err.message(), "in index [2]\nexpected integer, found float");
    assert!(Vec::<bool>::read(&mut vm, -1).is_err());
    assert!(String::read(&mut vm, -1).is_err());
    assert_eq!(vm.top(), 1);
    vm.pop(1);

    vm.push_int(i64::from(i32::MAX) + 1);
    assert!(i32::read(&mut vm, -1).is_err());
    assert_eq!(u32::read(&mut vm, -1).unwrap(), 2_147_483_648);
    vm.pop(1);
}

struct Account {
    balance: i64,
}

static ACCOUNT: OpaqueType<Account> = OpaqueType::new("Account", |t| {
    t.with_method(
        "deposit",
        |vm: &mut Vm, this: Handle<Account>, amount: i64| -> Expected<i64> {
            let account = this.get_mut(vm)?;
            account.balance += amount;
            Ok(account.balance)
        },
    )
    .with_method("balance", |vm: &mut Vm, this: Handle<Account>| -> Expected<i64> {
        Ok(this.get(vm)?.balance)
    })
});

impl Opaque for Account {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &ACCOUNT
    }
}

struct Receipt;

static RECEIPT: OpaqueType<Receipt> = OpaqueType::new("Receipt", |t| t);

impl Opaque for Receipt {
    fn opaque_type() -> &'static OpaqueType<Self> {
        &RECEIPT
    }
}

#[test]
fn host_objects_are_called_through_methods() {
    let mut vm = Vm::new();
    opaque::register::<Account>(&mut vm).unwrap();
    opaque::register::<Receipt>(&mut vm).unwrap();
    vm.set_global_fn("open", |vm: &mut Vm, balance: i64| -> Expected<Outcome> {
        opaque::push(vm, Account { balance })?;
        Ok(Outcome::Return(1))
    });

    vm.get_global("open");
    vm.push_int(10);
    assert_eq!(vm.protected_call(1, 1), Status::Ok);
    assert!(opaque::test::<Receipt>(&vm, -1).is_none());

    vm.get_field(-1, "deposit").unwrap();
    vm.push_copy(-2);
    vm.push_int(5);
    assert_eq!(vm.protected_call(2, 1), Status::Ok);
    assert_eq!(vm.to_int(-1), Some(15));
    vm.pop(1);

    vm.get_field(-1, "deposit").unwrap();
    vm.push_copy(-2);
    vm.push_string("five");
    assert_eq!(vm.protected_call(2, 1), Status::Error);
    assert_eq!(
        vm.to_str(-1),
        Some("bad argument #2: expected integer, found string")
    );
    vm.pop(1);

    assert_eq!(opaque::check::<Account>(&vm, -1).unwrap().balance, 15);
    vm.pop(1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn host_functions_are_not_called_with_bad_arguments() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut vm = Vm::new();
    vm.set_global_fn("greet", {
        let calls = calls.clone();
        move |vm: &mut Vm, times: i64, name: String| {
            calls.fetch_add(1, Ordering::Relaxed);
            Outcome::value(vm, name.repeat(usize::try_from(times).unwrap_or(0)))
        }
    });

    vm.get_global("greet");
    vm.push_int(2);
    vm.push_string("hi");
    assert_eq!(vm.protected_call(2, 1), Status::Ok);
    assert_eq!(vm.to_str(-1), Some("hihi"));
    vm.pop(1);

    vm.get_global("greet");
    vm.push_string("twice");
    vm.push_string("hi");
    assert_eq!(vm.protected_call(2, 1), Status::Error);
    vm.pop(1);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(vm.top(), 0);
}

#[test]
fn variadic_functions_return_many_values() {
    let mut vm = Vm::new();
    vm.set_global_fn("reverse", |vm: &mut Vm, values: Variadic<Value>| {
        let count = values.len();
        for value in values.0.into_iter().rev() {
            vm.push_value(value);
        }
        Outcome::Return(count)
    });
    vm.get_global("reverse");
    vm.push_int(1);
    vm.push_int(2);
    vm.push_int(3);
    assert_eq!(vm.protected_call(3, Results::All), Status::Ok);
    assert_eq!(vm.top(), 3);
    assert_eq!(vm.to_int(1), Some(3));
    assert_eq!(vm.to_int(3), Some(1));
    vm.pop(3);
}

#[test]
fn weak_observers_outlive_their_master() {
    let master = Master::new(String::from("session"));
    let mut observers = vec![master.observe(), master.observe()];
    assert!(observers.iter_mut().all(|observer| observer.lock().is_some()));
    drop(master);
    let mut last = observers.remove(0);
    drop(observers);
    assert!(last.lock().is_none());
    assert!(last.is_detached());
}
