//! The driver as scripts see it

use moonbridge_docstore::module;
use moonbridge_engine::{Binding, BridgeConfig, LuaApi, LuaResult, LuaType, State};
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

fn load() -> (State, Binding) {
    let mut vm = State::new();
    let binding = Binding::on_load(&mut vm, &module(), BridgeConfig::default()).unwrap();
    (vm, binding)
}

/// Push `DocStore.Driver.Client.Connect(url)`
fn connect(vm: &mut State, url: &str) -> LuaResult<()> {
    vm.get_path("DocStore.Driver.Client.Connect")?;
    vm.push_string(url);
    vm.call(1, 1)
}

/// `obj:name(...)` with the object on top; `args` pushes the arguments and
/// returns how many it pushed. The object stays below the one result.
fn invoke<F>(vm: &mut State, name: &str, args: F) -> LuaResult<()>
where
    F: FnOnce(&mut State) -> i32,
{
    vm.get_field(-1, name)?;
    vm.push_value(-2)?;
    let nargs = args(vm);
    vm.call(nargs + 1, 1)
}

fn push_user(vm: &mut State, name: &str, age: f64) {
    vm.create_table();
    vm.push_string(name);
    vm.set_field(-2, "name").unwrap();
    vm.push_number(age);
    vm.set_field(-2, "age").unwrap();
}

fn push_filter(vm: &mut State, field: &str, value: f64) {
    vm.create_table();
    vm.push_number(value);
    vm.set_field(-2, field).unwrap();
}

/// Open `users` in a fresh store and leave the collection on top
fn users(vm: &mut State) {
    connect(vm, "docstore://app").unwrap();
    invoke(vm, "GetCollection", |vm| {
        vm.push_string("users");
        1
    })
    .unwrap();
}

/// Length of the array table on top
fn array_len(vm: &mut State) -> usize {
    let mut len = 0;
    loop {
        vm.push_number((len + 1) as f64);
        let ty = vm.raw_get(-2).unwrap();
        vm.pop(1);
        if ty == LuaType::Nil {
            return len;
        }
        len += 1;
    }
}

fn tick_until(vm: &mut State, done: impl Fn() -> bool) {
    for _ in 0..500 {
        vm.tick().unwrap();
        if done() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("async callback never ran");
}

#[test]
fn test_insert_find_delete() {
    let (mut vm, _binding) = load();
    users(&mut vm);

    invoke(&mut vm, "InsertOne", |vm| {
        push_user(vm, "ada", 36.0);
        1
    })
    .unwrap();
    let ada = vm.to_str(-1).unwrap();
    assert_eq!(ada.len(), 24);
    vm.pop(1);
    invoke(&mut vm, "InsertOne", |vm| {
        push_user(vm, "bob", 41.0);
        1
    })
    .unwrap();
    vm.pop(1);

    invoke(&mut vm, "Find", |vm| {
        push_filter(vm, "age", 36.0);
        1
    })
    .unwrap();
    assert_eq!(array_len(&mut vm), 1);
    vm.push_number(1.0);
    vm.raw_get(-2).unwrap();
    vm.get_field(-1, "name").unwrap();
    assert_eq!(vm.to_str(-1).as_deref(), Some("ada"));
    vm.get_field(-2, "_created").unwrap();
    assert_eq!(vm.type_of(-1), LuaType::Number);
    vm.pop(4);

    invoke(&mut vm, "Find", |vm| {
        vm.push_string(&ada);
        1
    })
    .unwrap();
    assert_eq!(array_len(&mut vm), 1);
    vm.pop(1);

    invoke(&mut vm, "DeleteOne", |vm| {
        vm.push_string(&ada);
        1
    })
    .unwrap();
    assert!(vm.to_bool(-1));
    vm.pop(1);

    invoke(&mut vm, "Count", |_| 0).unwrap();
    assert_eq!(vm.to_number(-1), Some(1.0));
    vm.pop(1);

    invoke(&mut vm, "FindOne", |vm| {
        push_filter(vm, "age", 36.0);
        1
    })
    .unwrap();
    assert_eq!(vm.type_of(-1), LuaType::Nil);
}

#[test]
fn test_malformed_id_is_a_type_mismatch() {
    let (mut vm, _binding) = load();
    users(&mut vm);
    let err = invoke(&mut vm, "DeleteOne", |vm| {
        vm.push_string("not-an-id");
        1
    })
    .unwrap_err();
    assert!(err.to_string().starts_with("Type mismatch"), "{}", err);
}

#[test]
fn test_unexposed_overload_is_denied() {
    let (mut vm, _binding) = load();
    users(&mut vm);
    let err = invoke(&mut vm, "Find", |vm| {
        vm.push_number(5.0);
        1
    })
    .unwrap_err();
    assert_eq!(err.to_string(), "Access denied: Find(f64) is not exposed");

    let err = invoke(&mut vm, "Find", |_| 0).unwrap_err();
    assert_eq!(err.to_string(), "No overload matches Find()");
}

#[test]
fn test_properties() {
    let (mut vm, _binding) = load();
    connect(&mut vm, "docstore://inventory").unwrap();
    vm.get_field(-1, "Name").unwrap();
    assert_eq!(vm.to_str(-1).as_deref(), Some("inventory"));
    vm.pop(1);
    vm.get_field(-1, "Url").unwrap();
    assert_eq!(vm.to_str(-1).as_deref(), Some("docstore://inventory"));
    vm.pop(1);

    invoke(&mut vm, "Ping", |_| 0).unwrap();
    assert!(vm.to_bool(-1));
    vm.pop(1);

    invoke(&mut vm, "GetCollection", |vm| {
        vm.push_string("parts");
        1
    })
    .unwrap();
    vm.get_field(-1, "Name").unwrap();
    assert_eq!(vm.to_str(-1).as_deref(), Some("parts"));
    vm.pop(2);

    invoke(&mut vm, "CollectionNames", |_| 0).unwrap();
    assert_eq!(array_len(&mut vm), 1);
}

#[test]
fn test_connections_share_a_store() {
    let (mut vm, _binding) = load();
    users(&mut vm);
    invoke(&mut vm, "InsertOne", |vm| {
        push_user(vm, "ada", 36.0);
        1
    })
    .unwrap();
    vm.set_top(0);

    users(&mut vm);
    invoke(&mut vm, "Count", |_| 0).unwrap();
    assert_eq!(vm.to_number(-1), Some(1.0));
}

#[test]
fn test_bad_url_is_rejected() {
    let (mut vm, _binding) = load();
    let err = connect(&mut vm, "mongodb://app").unwrap_err();
    assert!(err.to_string().contains("Unsupported connection url"));
}

#[test]
fn test_insert_async_calls_back_on_tick() {
    let (mut vm, _binding) = load();
    users(&mut vm);

    let received: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
    let sink = received.clone();
    invoke(&mut vm, "InsertOneAsync", move |vm| {
        push_user(vm, "ada", 36.0);
        vm.push_function(Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
            *sink.borrow_mut() = vm.to_str(1);
            Ok(0)
        }));
        2
    })
    .unwrap();
    vm.set_top(1);

    tick_until(&mut vm, || received.borrow().is_some());
    assert_eq!(received.borrow().as_ref().map(String::len), Some(24));

    invoke(&mut vm, "Count", |_| 0).unwrap();
    assert_eq!(vm.to_number(-1), Some(1.0));
}

#[test]
fn test_find_async_delivers_documents() {
    let (mut vm, binding) = load();
    users(&mut vm);
    for (name, age) in [("ada", 36.0), ("bob", 41.0), ("cy", 36.0)] {
        invoke(&mut vm, "InsertOne", |vm| {
            push_user(vm, name, age);
            1
        })
        .unwrap();
        vm.pop(1);
    }

    let found: Rc<RefCell<Option<usize>>> = Rc::new(RefCell::new(None));
    let sink = found.clone();
    invoke(&mut vm, "FindAsync", move |vm| {
        push_filter(vm, "age", 36.0);
        vm.push_function(Rc::new(move |vm: &mut dyn LuaApi| -> LuaResult<i32> {
            let mut count = 0;
            if vm.type_of(1) == LuaType::Table {
                loop {
                    vm.push_number((count + 1) as f64);
                    let ty = vm.raw_get(1)?;
                    vm.pop(1);
                    if ty == LuaType::Nil {
                        break;
                    }
                    count += 1;
                }
            }
            *sink.borrow_mut() = Some(count);
            Ok(0)
        }));
        2
    })
    .unwrap();

    tick_until(&mut vm, || found.borrow().is_some());
    assert_eq!(*found.borrow(), Some(2));
    assert_eq!(binding.bridge().scheduler().stats().completed, 1);
}

#[test]
fn test_unload_releases_everything() {
    let (mut vm, mut binding) = load();
    users(&mut vm);
    assert_eq!(binding.bridge().handles().len(), 2);

    let report = binding.on_unload(&mut vm);
    assert_eq!(report.handles, 2);
    assert!(binding.bridge().handles().is_empty());
    assert_eq!(binding.bridge().handles().tracked_references(), 0);
    assert!(invoke(&mut vm, "Count", |_| 0).is_err());
}
