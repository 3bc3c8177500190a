//! Integration tests for the #[derive(Object)] macro.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tether_core::meta::{MetaError, OBJECT_META};
use tether_core::{
    ConnectionType, Context, Event, EventPriority, Object, ProcessEventsFlags, Property, Runtime,
    TetherError,
};
use tether_macros::Object;

#[derive(Object, Default)]
#[object(
    signal = "value_changed(i32)",
    signal = "renamed()",
    slot = "set_value(i32)",
    slot = "bump()",
    method = "value() -> i32",
    method = "add(i32, i32) -> i32",
    class_info(author = "tether", version = "2")
)]
struct Counter {
    #[property(notify = "value_changed", reset)]
    value: Property<i32>,

    #[property(read_only)]
    label: String,

    bumps: AtomicUsize,
}

impl Counter {
    fn set_value(&self, ctx: &Context, value: &i32) {
        if self.value.set(*value) {
            self.value_changed(ctx, value);
        }
    }

    fn bump(&self, _ctx: &Context) {
        self.bumps.fetch_add(1, Ordering::SeqCst);
    }

    fn value(&self, _ctx: &Context) -> i32 {
        self.value.get()
    }

    fn add(&self, _ctx: &Context, a: &i32, b: &i32) -> i32 {
        a + b
    }
}

#[derive(Object, Default)]
#[object(signal = "overflowed(i32)", slot = "clear()", event = "on_event")]
struct BoundedCounter {
    #[object(superclass)]
    base: Counter,

    #[property(notify = "overflowed", reset = "restore_limit")]
    limit: Property<i32>,

    user_events: Mutex<Vec<u32>>,
}

impl BoundedCounter {
    fn clear(&self, ctx: &Context) {
        self.base.set_value(ctx, &0);
    }

    fn restore_limit(&self, _ctx: &Context) {
        self.limit.set(100);
    }

    fn on_event(&self, _ctx: &Context, event: &mut Event) -> bool {
        match event {
            Event::User { kind, .. } => {
                self.user_events.lock().push(*kind);
                true
            }
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Rgb(u8, u8, u8);

#[derive(Object, Default)]
#[object(signal = "color_changed(Rgb)", slot = "apply(Rgb)")]
struct Palette {
    applied: Mutex<Vec<Rgb>>,
}

impl Palette {
    fn apply(&self, _ctx: &Context, color: &Rgb) {
        self.applied.lock().push(color.clone());
    }
}

#[derive(Object)]
#[object(no_factory, class_name = "Sensor")]
struct SensorNode {
    #[property(read_only)]
    channel: u32,
}

fn record_i32(rt: &Runtime, sender: tether_core::ObjectId, signal: usize) -> Arc<Mutex<Vec<i32>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    rt.connect_fn(sender, signal, None, ConnectionType::Direct, move |_, args| {
        if let Some(v) = args.first().and_then(|a| a.downcast_ref::<i32>()) {
            log.lock().push(*v);
        }
    })
    .unwrap();
    seen
}

#[test]
fn test_derive_generates_meta_object() {
    let meta = Counter::META;
    assert_eq!(meta.class_name, "Counter");
    assert!(std::ptr::eq(meta.superclass.unwrap(), &OBJECT_META));
    assert_eq!(meta.method_offset(), OBJECT_META.method_count());
    // two signals, two slots, two methods, one constructor
    assert_eq!(meta.methods.len(), 7);
    assert!(std::ptr::eq(Counter::default().meta_object(), meta));
}

#[test]
fn test_method_indices_follow_declaration_order() {
    let meta = Counter::META;
    let offset = meta.method_offset();
    assert_eq!(meta.index_of_signal("value_changed(i32)"), Some(offset));
    assert_eq!(meta.index_of_signal("renamed()"), Some(offset + 1));
    assert_eq!(meta.index_of_slot("set_value(i32)"), Some(offset + 2));
    assert_eq!(meta.index_of_method("add(i32, i32)"), Some(offset + 5));
    assert_eq!(meta.index_of_signal("set_value(i32)"), None);
    assert_eq!(meta.index_of_method_by_name("bump"), Some(offset + 3));
    assert_eq!(meta.index_of_constructor("new()"), Some(offset + 6));
}

#[test]
fn test_class_info() {
    assert_eq!(Counter::META.class_info_value("author"), Some("tether"));
    assert_eq!(Counter::META.class_info_value("version"), Some("2"));
    assert_eq!(Counter::META.class_info_value("missing"), None);
}

#[test]
fn test_property_descriptors() {
    let meta = Counter::META;
    let value = meta.property(meta.index_of_property("value").unwrap()).unwrap();
    assert_eq!(value.descriptor.type_name, "i32");
    assert!(value.descriptor.is_writable());
    assert!(value.descriptor.is_resettable());
    assert_eq!(value.notify_signal(), meta.index_of_signal("value_changed(i32)"));

    let label = meta.property(meta.index_of_property("label").unwrap()).unwrap();
    assert!(!label.descriptor.is_writable());
    assert_eq!(label.notify_signal(), None);

    // the root class's object_name comes first
    assert_eq!(meta.index_of_property("object_name"), Some(0));
}

#[test]
fn test_write_property_emits_notify_on_change() {
    let rt = Runtime::new();
    let id = rt.create(Counter::default(), None).unwrap();
    let signal = Counter::META.index_of_signal("value_changed(i32)").unwrap();
    let seen = record_i32(&rt, id, signal);

    rt.write_property(id, "value", &5i32).unwrap();
    rt.write_property(id, "value", &5i32).unwrap();
    rt.write_property(id, "value", &6i32).unwrap();
    assert_eq!(*seen.lock(), vec![5, 6]);

    let value = rt.read_property(id, "value").unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&6));

    rt.reset_property(id, "value").unwrap();
    assert_eq!(*seen.lock(), vec![5, 6, 0]);
}

#[test]
fn test_write_with_wrong_type_fails() {
    let rt = Runtime::new();
    let id = rt.create(Counter::default(), None).unwrap();
    let err = rt.write_property(id, "value", &"five").unwrap_err();
    assert!(matches!(
        err,
        TetherError::Meta(MetaError::ArgumentMismatch { .. })
    ));
}

#[test]
fn test_read_only_property() {
    let rt = Runtime::new();
    let counter = Counter {
        label: "steps".into(),
        ..Default::default()
    };
    let id = rt.create(counter, None).unwrap();

    let label = rt.read_property(id, "label").unwrap();
    assert_eq!(label.downcast_ref::<String>().map(String::as_str), Some("steps"));

    let err = rt.write_property(id, "label", &String::from("x")).unwrap_err();
    assert!(matches!(err, TetherError::Meta(MetaError::PropertyAccess(_))));
    let err = rt.reset_property(id, "label").unwrap_err();
    assert!(matches!(err, TetherError::Meta(MetaError::PropertyAccess(_))));
}

#[test]
fn test_invoke_methods() {
    let rt = Runtime::new();
    let id = rt.create(Counter::default(), None).unwrap();

    let sum = rt
        .invoke_method_by_signature(id, "add(i32,i32)", &[&2i32, &3i32])
        .unwrap()
        .unwrap();
    assert_eq!(sum.downcast_ref::<i32>(), Some(&5));

    let none = rt.invoke_method_by_signature(id, "bump()", &[]).unwrap();
    assert!(none.is_none());
    assert_eq!(rt.get::<Counter>(id).unwrap().bumps.load(Ordering::SeqCst), 1);

    rt.invoke_method_by_signature(id, "set_value(i32)", &[&7i32]).unwrap();
    let value = rt.invoke_method_by_signature(id, "value()", &[]).unwrap().unwrap();
    assert_eq!(value.downcast_ref::<i32>(), Some(&7));

    let err = rt.invoke_method_by_signature(id, "add(i32,i32)", &[&2i32]).unwrap_err();
    assert!(matches!(err, TetherError::Meta(MetaError::MissingArgument(1))));
}

#[test]
fn test_signal_emitter_method() {
    let rt = Runtime::new();
    let id = rt.create(Counter::default(), None).unwrap();
    let signal = Counter::META.index_of_signal("value_changed(i32)").unwrap();
    let seen = record_i32(&rt, id, signal);

    let counter = rt.get::<Counter>(id).unwrap();
    let ctx = Context::new(rt.clone(), id, None);
    counter.value_changed(&ctx, &42);
    assert_eq!(*seen.lock(), vec![42]);
}

#[test]
fn test_connect_by_name_signal_to_slot() {
    let rt = Runtime::new();
    let a = rt.create(Counter::default(), None).unwrap();
    let b = rt.create(Counter::default(), None).unwrap();
    rt.connect_by_name(a, "value_changed(i32)", b, "set_value(i32)", ConnectionType::Direct)
        .unwrap();

    rt.write_property(a, "value", &9i32).unwrap();
    assert_eq!(rt.get::<Counter>(b).unwrap().value.get(), 9);
}

#[test]
fn test_signal_to_signal_forwarding() {
    let rt = Runtime::new();
    let a = rt.create(Counter::default(), None).unwrap();
    let b = rt.create(Counter::default(), None).unwrap();
    rt.connect_by_name(a, "value_changed(i32)", b, "value_changed(i32)", ConnectionType::Direct)
        .unwrap();
    let seen = record_i32(&rt, b, Counter::META.index_of_signal("value_changed(i32)").unwrap());

    rt.write_property(a, "value", &3i32).unwrap();
    assert_eq!(*seen.lock(), vec![3]);
}

#[test]
fn test_connect_rejects_incompatible_arguments() {
    let rt = Runtime::new();
    let a = rt.create(Counter::default(), None).unwrap();
    let b = rt.create(Palette::default(), None).unwrap();
    assert!(
        rt.connect_by_name(a, "value_changed(i32)", b, "apply(Rgb)", ConnectionType::Auto)
            .is_err()
    );
}

#[test]
fn test_superclass_members_are_reachable() {
    let meta = BoundedCounter::META;
    assert!(std::ptr::eq(meta.superclass.unwrap(), Counter::META));
    assert!(meta.inherits(Counter::META));
    assert!(meta.inherits(&OBJECT_META));
    assert_eq!(meta.method_offset(), Counter::META.method_count());
    assert_eq!(meta.index_of_signal("overflowed(i32)"), Some(Counter::META.method_count()));

    let rt = Runtime::new();
    let id = rt.create(BoundedCounter::default(), None).unwrap();
    assert!(rt.inherits(id, Counter::META));

    rt.write_property(id, "value", &3i32).unwrap();
    rt.invoke_method_by_signature(id, "bump()", &[]).unwrap();
    let obj = rt.get::<BoundedCounter>(id).unwrap();
    assert_eq!(obj.base.value.get(), 3);
    assert_eq!(obj.base.bumps.load(Ordering::SeqCst), 1);

    rt.invoke_method_by_signature(id, "clear()", &[]).unwrap();
    assert_eq!(obj.base.value.get(), 0);
}

#[test]
fn test_reset_with_custom_method() {
    let rt = Runtime::new();
    let id = rt.create(BoundedCounter::default(), None).unwrap();
    let seen = record_i32(&rt, id, BoundedCounter::META.index_of_signal("overflowed(i32)").unwrap());

    rt.write_property(id, "limit", &10i32).unwrap();
    assert_eq!(*seen.lock(), vec![10]);

    rt.reset_property(id, "limit").unwrap();
    assert_eq!(rt.get::<BoundedCounter>(id).unwrap().limit.get(), 100);
}

#[test]
fn test_event_handler_delegation() {
    let rt = Runtime::new();
    let id = rt.create(BoundedCounter::default(), None).unwrap();

    assert!(rt.send_event(id, Event::user(7)).unwrap());
    assert!(rt.post_event(id, Event::user(8), EventPriority::Normal));
    rt.send_posted_events(Some(id), None);

    assert_eq!(*rt.get::<BoundedCounter>(id).unwrap().user_events.lock(), vec![7, 8]);
}

#[test]
fn test_create_instance_through_factory() {
    let rt = Runtime::new();
    let id = rt.create_instance(Counter::META, &[], None).unwrap();
    assert!(std::ptr::eq(rt.meta_object_of(id).unwrap(), Counter::META));
    assert!(rt.get::<Counter>(id).is_some());
}

#[test]
fn test_no_factory_and_class_name() {
    let meta = SensorNode::META;
    assert_eq!(meta.class_name, "Sensor");
    assert_eq!(meta.methods.len(), 0);

    let rt = Runtime::new();
    let err = rt.create_instance(meta, &[], None).unwrap_err();
    assert!(matches!(err, TetherError::Meta(MetaError::NotCreatable("Sensor"))));

    let id = rt.create(SensorNode { channel: 4 }, None).unwrap();
    let channel = rt.read_property(id, "channel").unwrap();
    assert_eq!(channel.downcast_ref::<u32>(), Some(&4));
}

#[test]
fn test_queued_connection_registers_user_types() {
    let rt = Runtime::new();
    assert!(!rt.types().lookup("Rgb").is_valid());

    let a = rt.create(Palette::default(), None).unwrap();
    let b = rt.create(Palette::default(), None).unwrap();
    rt.connect_by_name(a, "color_changed(Rgb)", b, "apply(Rgb)", ConnectionType::Queued)
        .unwrap();
    assert!(rt.types().lookup("Rgb").is_valid());

    let palette = rt.get::<Palette>(a).unwrap();
    let ctx = Context::new(rt.clone(), a, None);
    let mut color = Rgb(1, 2, 3);
    palette.color_changed(&ctx, &color);
    color.0 = 9;

    let receiver = rt.get::<Palette>(b).unwrap();
    assert!(receiver.applied.lock().is_empty());
    rt.process_events(ProcessEventsFlags::ALL_EVENTS, None);
    assert_eq!(*receiver.applied.lock(), vec![Rgb(1, 2, 3)]);
}
