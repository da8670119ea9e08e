//! Connection-level tests over the in-memory loopback bus.
//!
//! Each test attaches two or more connections to one `LoopbackBus` and
//! drives the bus explicitly with `run_until_idle`, or implicitly through a
//! blocking call, which dispatches on the calling thread.

use busrs_core::{
    signal_handler, BusError, Connection, ConnectionConfig, FilterVerdict, LoopbackBus, MatchSpec,
    Message, MessageHandler, MethodError, MethodSpec, Native, NodeInfo, ObjectType, ReplyHandle,
    RequestNameFlags, SignalHandler, SignalSpec, Value, ERROR_FAILED, ERROR_INVALID_ARGS,
    ERROR_UNKNOWN_METHOD, INTROSPECTABLE_IFACE, PEER_IFACE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const MACHINE_ID: &str = "0123456789abcdef0123456789abcdef";

fn config() -> ConnectionConfig {
    ConnectionConfig {
        machine_id: Some(MACHINE_ID.to_owned()),
        ..ConnectionConfig::default()
    }
}

fn pair() -> (LoopbackBus, Connection, Connection) {
    let bus = LoopbackBus::new();
    let client = Connection::new(bus.connect(), config());
    let server = Connection::new(bus.connect(), config());
    bus.run_until_idle();
    (bus, client, server)
}

fn call(server: &Connection, path: &str, iface: Option<&str>, member: &str) -> Message {
    let dest = server.unique_name().unwrap();
    Message::method_call(Some(&dest), path, iface, member).unwrap()
}

fn remote_name(err: BusError) -> String {
    match err {
        BusError::Remote(e) => e.name,
        other => panic!("expected a remote error, got {other:?}"),
    }
}

fn counter() -> (Arc<AtomicUsize>, SignalHandler) {
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);
    let handler = signal_handler(move |_event| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    (hits, handler)
}

const CALC: &str = "com.example.Calc";

fn calc_type() -> Arc<ObjectType> {
    ObjectType::builder("Calc")
        .method(
            MethodSpec::new(CALC, "Add", |_ctx, args| {
                let a = args[0].as_i64().unwrap_or_default();
                let b = args[1].as_i64().unwrap_or_default();
                Ok(Native::from(a + b))
            })
            .in_signature("ii")
            .out_signature("i")
            .arg_names(&["a", "b"])
            .out_names(&["sum"]),
        )
        .method(
            MethodSpec::new(CALC, "Reset", |_ctx, _args| Ok(Native::from("x")))
                .in_signature("")
                .out_signature(""),
        )
        .method(MethodSpec::new(CALC, "Where", |ctx, _args| {
            Ok(Native::from(ctx.relative_path()))
        }))
        .signal(SignalSpec::new(CALC, "Overflow", "x").arg_names(&["at"]))
        .build()
        .unwrap()
}

#[test]
fn signal_reaches_only_matching_member() {
    let (bus, client, server) = pair();
    let (hits, handler) = counter();
    client
        .add_signal_receiver(MatchSpec::new().member("Done"), handler)
        .unwrap();
    bus.run_until_idle();

    server
        .emit_signal("/job", "com.example.Jobs", "Done", Vec::<Native>::new(), None)
        .unwrap();
    server
        .emit_signal("/job", "com.example.Jobs", "Other", Vec::<Native>::new(), None)
        .unwrap();
    bus.run_until_idle();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn signal_arguments_reach_the_handler() {
    let (bus, client, server) = pair();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .add_signal_receiver(
            MatchSpec::new().interface("com.example.Jobs").arg(0, "build"),
            signal_handler(move |event| {
                sink.lock().unwrap().push(event.args().to_vec());
                Ok(())
            }),
        )
        .unwrap();
    bus.run_until_idle();

    for job in ["build", "test"] {
        let args = [Native::from(job), Native::from(7)];
        server
            .emit_signal("/job", "com.example.Jobs", "Done", args, None)
            .unwrap();
    }
    bus.run_until_idle();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0], vec![Value::String("build".into()), Value::Int32(7)]);
}

#[test]
fn removing_a_receiver_twice_is_harmless() {
    let (bus, client, server) = pair();
    let (hits, handler) = counter();
    let spec = MatchSpec::new().member("Done");
    client
        .add_signal_receiver(spec.clone(), Arc::clone(&handler))
        .unwrap();
    bus.run_until_idle();
    let unique = client.unique_name().unwrap();
    assert_eq!(bus.match_rules(&unique).len(), 1);

    assert_eq!(client.remove_signal_receiver(&spec, Some(&handler)), 1);
    assert_eq!(client.remove_signal_receiver(&spec, Some(&handler)), 0);
    bus.run_until_idle();
    assert!(bus.match_rules(&unique).is_empty());

    server
        .emit_signal("/job", "com.example.Jobs", "Done", Vec::<Native>::new(), None)
        .unwrap();
    bus.run_until_idle();
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[test]
fn failing_signal_handler_does_not_stop_others() {
    let (bus, client, server) = pair();
    let (hits, handler) = counter();
    client
        .add_signal_receiver(
            MatchSpec::new().member("Done"),
            signal_handler(|_event| Err("broken subscriber".into())),
        )
        .unwrap();
    client
        .add_signal_receiver(
            MatchSpec::new().member("Done"),
            signal_handler(|_event| panic!("subscriber panicked")),
        )
        .unwrap();
    client
        .add_signal_receiver(MatchSpec::new().member("Done"), handler)
        .unwrap();
    bus.run_until_idle();

    server
        .emit_signal("/job", "com.example.Jobs", "Done", Vec::<Native>::new(), None)
        .unwrap();
    bus.run_until_idle();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn well_known_sender_follows_its_owner() {
    let bus = LoopbackBus::new();
    let client = Connection::new(bus.connect(), config());
    let first = Connection::new(bus.connect(), config());
    bus.run_until_idle();

    let name = first
        .request_name("com.example.Svc", RequestNameFlags::default())
        .unwrap();
    let (hits, handler) = counter();
    client
        .add_signal_receiver(
            MatchSpec::new().sender("com.example.Svc").member("Tick"),
            handler,
        )
        .unwrap();
    bus.run_until_idle();

    let tick = |conn: &Connection| {
        conn.emit_signal("/clock", "com.example.Clock", "Tick", Vec::<Native>::new(), None)
            .unwrap();
        bus.run_until_idle();
    };
    tick(&first);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Released names no longer deliver from the old owner.
    drop(name);
    bus.run_until_idle();
    tick(&first);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let second = Connection::new(bus.connect(), config());
    let _name = second
        .request_name("com.example.Svc", RequestNameFlags::default())
        .unwrap();
    bus.run_until_idle();
    tick(&second);
    tick(&first);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn peer_interface_is_answered_by_every_connection() {
    let (_bus, client, server) = pair();
    client
        .call_blocking(call(&server, "/anything", Some(PEER_IFACE), "Ping"), None)
        .unwrap();
    let reply = client
        .call_blocking(call(&server, "/", Some(PEER_IFACE), "GetMachineId"), None)
        .unwrap();
    assert_eq!(reply.args()[0].as_str(), Some(MACHINE_ID));

    let err = client
        .call_blocking(call(&server, "/", Some(PEER_IFACE), "Dance"), None)
        .unwrap_err();
    assert_eq!(remote_name(err), ERROR_UNKNOWN_METHOD);
}

#[test]
fn filters_run_in_order_after_signal_delivery() {
    let (bus, client, server) = pair();
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&order);
    server
        .add_signal_receiver(
            MatchSpec::new().member("Done"),
            signal_handler(move |_event| {
                log.lock().unwrap().push("signal");
                Ok(())
            }),
        )
        .unwrap();
    let log = Arc::clone(&order);
    server.add_message_filter(move |_conn: &Connection, msg: &Message| {
        if msg.member() == Some("Done") || msg.member() == Some("Swallowed") {
            log.lock().unwrap().push("first");
        }
        Ok(FilterVerdict::NotYetHandled)
    });
    let log = Arc::clone(&order);
    server.add_message_filter(move |_conn: &Connection, msg: &Message| {
        if msg.member() == Some("Swallowed") {
            log.lock().unwrap().push("second");
            return Ok(FilterVerdict::Handled);
        }
        Ok(FilterVerdict::NotYetHandled)
    });
    let log = Arc::clone(&order);
    let handler: Arc<dyn MessageHandler> = Arc::new(
        move |_conn: &Connection, _msg: &Message| -> Result<Option<Message>, BusError> {
            log.lock().unwrap().push("handler");
            Ok(None)
        },
    );
    server.register("/obj", handler, None, false).unwrap();
    bus.run_until_idle();

    server
        .emit_signal("/obj", "com.example.Jobs", "Done", Vec::<Native>::new(), None)
        .unwrap();
    bus.run_until_idle();
    assert_eq!(*order.lock().unwrap(), vec!["signal", "first"]);

    order.lock().unwrap().clear();
    let mut msg = call(&server, "/obj", Some("com.example.Jobs"), "Swallowed");
    msg.set_no_reply_expected(true).unwrap();
    client.send(msg).unwrap();
    bus.run_until_idle();
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}

#[test]
fn nested_export_synthesizes_ancestors() {
    let (_bus, client, server) = pair();
    let handler: Arc<dyn MessageHandler> = Arc::new(
        |_conn: &Connection, msg: &Message| -> Result<Option<Message>, BusError> {
            Ok(Some(Message::method_return(msg)?))
        },
    );
    server.register("/a/b/c", handler, None, false).unwrap();

    for (path, child) in [("/", "a"), ("/a", "b"), ("/a/b", "c")] {
        let reply = client
            .call_blocking(
                call(&server, path, Some(INTROSPECTABLE_IFACE), "Introspect"),
                None,
            )
            .unwrap();
        let node = NodeInfo::parse(reply.args()[0].as_str().unwrap()).unwrap();
        assert!(node.interfaces.is_empty());
        assert_eq!(node.children, vec![child.to_owned()]);
    }

    let err = client
        .call_blocking(call(&server, "/a/b", Some(CALC), "Add"), None)
        .unwrap_err();
    assert_eq!(remote_name(err), ERROR_UNKNOWN_METHOD);

    server.unregister("/a/b/c").unwrap();
    assert!(server.list_exported_child_objects("/").unwrap().is_empty());
    let err = client
        .call_blocking(
            call(&server, "/a", Some(INTROSPECTABLE_IFACE), "Introspect"),
            None,
        )
        .unwrap_err();
    assert_eq!(remote_name(err), ERROR_UNKNOWN_METHOD);
}

#[test]
fn typed_object_answers_calls() {
    let (_bus, client, server) = pair();
    server.export("/calc", &calc_type(), false).unwrap();

    let mut msg = call(&server, "/calc", Some(CALC), "Add");
    msg.append([2, 40], Some("ii")).unwrap();
    let reply = client.call_blocking(msg, None).unwrap();
    assert_eq!(reply.args(), [Value::Int32(42)]);

    let mut msg = call(&server, "/calc", Some(CALC), "Add");
    msg.append(["two", "forty"], None).unwrap();
    let err = client.call_blocking(msg, None).unwrap_err();
    assert_eq!(remote_name(err), ERROR_INVALID_ARGS);

    let err = client
        .call_blocking(call(&server, "/calc", Some(CALC), "Divide"), None)
        .unwrap_err();
    assert_eq!(remote_name(err), ERROR_UNKNOWN_METHOD);
}

#[test]
fn return_value_must_fit_the_out_signature() {
    let (_bus, client, server) = pair();
    server.export("/calc", &calc_type(), false).unwrap();
    let err = client
        .call_blocking(call(&server, "/calc", Some(CALC), "Reset"), None)
        .unwrap_err();
    assert!(matches!(err, BusError::Remote(_)));
}

#[test]
fn typed_object_introspection_lists_interfaces_and_children() {
    let (_bus, client, server) = pair();
    server.export("/calc", &calc_type(), false).unwrap();
    server.export("/calc/history", &calc_type(), false).unwrap();

    let reply = client
        .call_blocking(
            call(&server, "/calc", Some(INTROSPECTABLE_IFACE), "Introspect"),
            None,
        )
        .unwrap();
    let node = NodeInfo::parse(reply.args()[0].as_str().unwrap()).unwrap();
    let names: Vec<&str> = node.interfaces.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec![INTROSPECTABLE_IFACE, CALC]);
    assert_eq!(node.children, vec!["history".to_owned()]);
    assert_eq!(node.in_signatures()[&format!("{CALC}.Add")], "ii");
}

#[test]
fn fallback_object_sees_relative_path() {
    let (_bus, client, server) = pair();
    server.export("/tree", &calc_type(), true).unwrap();

    let reply = client
        .call_blocking(call(&server, "/tree/x/y", Some(CALC), "Where"), None)
        .unwrap();
    assert_eq!(reply.args()[0].as_str(), Some("/x/y"));
    let reply = client
        .call_blocking(call(&server, "/tree", Some(CALC), "Where"), None)
        .unwrap();
    assert_eq!(reply.args()[0].as_str(), Some("/"));
}

#[derive(Debug, thiserror::Error)]
#[error("quota exceeded")]
struct QuotaExceeded;

#[test]
fn handler_errors_are_named_after_their_type() {
    let (_bus, client, server) = pair();
    let object_type = ObjectType::builder("Quota")
        .method(MethodSpec::new("com.example.Quota", "Take", |_ctx, _args| {
            Err(QuotaExceeded.into())
        }))
        .method(MethodSpec::new("com.example.Quota", "Refuse", |_ctx, _args| {
            Err(MethodError::new("com.example.Error.Refused", "not today"))
        }))
        .build()
        .unwrap();
    server.export("/quota", &object_type, false).unwrap();

    match client
        .call_blocking(call(&server, "/quota", None, "Take"), None)
        .unwrap_err()
    {
        BusError::Remote(e) => {
            assert_eq!(e.name, "integration.QuotaExceeded");
            assert_eq!(e.message, "quota exceeded");
        }
        other => panic!("unexpected error {other:?}"),
    }
    match client
        .call_blocking(call(&server, "/quota", None, "Refuse"), None)
        .unwrap_err()
    {
        BusError::Remote(e) => {
            assert_eq!(e.name, "com.example.Error.Refused");
            assert_eq!(e.message, "not today");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

type Stash = Arc<Mutex<Option<ReplyHandle>>>;

fn deferred_type(stash: &Stash) -> Arc<ObjectType> {
    let stash = Arc::clone(stash);
    ObjectType::builder("Slow")
        .method(
            MethodSpec::deferred("com.example.Slow", "Compute", move |_ctx, _args, reply| {
                *stash.lock().unwrap() = Some(reply);
                Ok(())
            })
            .out_signature("t"),
        )
        .method(MethodSpec::deferred(
            "com.example.Slow",
            "Forget",
            |_ctx, _args, reply| {
                drop(reply);
                Ok(())
            },
        ))
        .build()
        .unwrap()
}

type Outcome = Arc<Mutex<Option<Result<Vec<Value>, String>>>>;

fn call_async(client: &Connection, msg: Message) -> Outcome {
    let outcome: Outcome = Arc::new(Mutex::new(None));
    let ok = Arc::clone(&outcome);
    let failed = Arc::clone(&outcome);
    client
        .call_async(
            msg,
            None,
            move |reply| *ok.lock().unwrap() = Some(Ok(reply.args().to_vec())),
            move |err| *failed.lock().unwrap() = Some(Err(err.dbus_name().to_owned())),
        )
        .unwrap();
    outcome
}

#[test]
fn deferred_reply_arrives_when_sent() {
    let (bus, client, server) = pair();
    let stash: Stash = Arc::new(Mutex::new(None));
    server.export("/slow", &deferred_type(&stash), false).unwrap();

    let outcome = call_async(&client, call(&server, "/slow", None, "Compute"));
    bus.run_until_idle();
    assert!(outcome.lock().unwrap().is_none());

    let reply = stash.lock().unwrap().take().unwrap();
    reply.reply(42).unwrap();
    bus.run_until_idle();
    assert_eq!(*outcome.lock().unwrap(), Some(Ok(vec![Value::UInt64(42)])));
}

#[test]
fn dropped_reply_handle_fails_the_call() {
    let (bus, client, server) = pair();
    let stash: Stash = Arc::new(Mutex::new(None));
    server.export("/slow", &deferred_type(&stash), false).unwrap();

    let later = call_async(&client, call(&server, "/slow", None, "Compute"));
    let now = call_async(&client, call(&server, "/slow", None, "Forget"));
    bus.run_until_idle();
    assert_eq!(*now.lock().unwrap(), Some(Err(ERROR_FAILED.to_owned())));
    assert!(later.lock().unwrap().is_none());

    drop(stash.lock().unwrap().take());
    bus.run_until_idle();
    assert_eq!(*later.lock().unwrap(), Some(Err(ERROR_FAILED.to_owned())));
}

#[test]
fn blocking_call_without_timeout_waits_for_a_late_reply() {
    let (_bus, client, server) = pair();
    assert_eq!(client.config().default_timeout(), None);
    let stash: Stash = Arc::new(Mutex::new(None));
    server.export("/slow", &deferred_type(&stash), false).unwrap();

    let answering = Arc::clone(&stash);
    let worker = std::thread::spawn(move || loop {
        let handle = answering.lock().unwrap().take();
        if let Some(handle) = handle {
            std::thread::sleep(Duration::from_millis(150));
            handle.reply(7).unwrap();
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
    });

    let started = Instant::now();
    let reply = client
        .call_blocking(call(&server, "/slow", None, "Compute"), None)
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(reply.args().to_vec(), vec![Value::UInt64(7)]);
    worker.join().unwrap();
}

#[test]
fn exported_object_emits_declared_signals_only() {
    let (bus, client, server) = pair();
    let object = server.export("/calc", &calc_type(), false).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    client
        .add_signal_receiver(
            MatchSpec::new().interface(CALC).member("Overflow"),
            signal_handler(move |event| {
                sink.lock().unwrap().push(event.args().to_vec());
                Ok(())
            }),
        )
        .unwrap();
    bus.run_until_idle();

    object
        .emit_signal(&server, CALC, "Overflow", vec![Native::from(9)])
        .unwrap();
    assert!(matches!(
        object.emit_signal(&server, CALC, "Underflow", Vec::new()),
        Err(BusError::NotFound(_))
    ));
    bus.run_until_idle();
    assert_eq!(*seen.lock().unwrap(), vec![vec![Value::Int64(9)]]);
}
