//! End-to-end scenarios on the mock document graph: two graphs sharing
//! one document through the membrane.
//!
//! Focus areas:
//! - Method calls through surrogates (`createElement`, `appendChild`)
//! - Cross-graph event dispatch with receiver identity
//! - Enumeration equivalence between the two views

use std::cell::RefCell;
use std::rc::Rc;

use membrane_engine::document_graph::{DocumentGraph, build_document_graph};
use membrane_engine::{
    GraphName, HandlerRef, Membrane, ObjectHandle, PropertyKey, Value,
};

fn key(s: &str) -> PropertyKey {
    PropertyKey::new(s)
}

struct Setup {
    membrane: Membrane,
    wet: HandlerRef,
    dry: HandlerRef,
    graph: DocumentGraph,
    dry_doc: ObjectHandle,
}

fn setup() -> Setup {
    let mut membrane = Membrane::default();
    let wet = membrane.get_handler_by_name("wet", true).expect("wet");
    let dry = membrane.get_handler_by_name("dry", true).expect("dry");
    let wet_name = wet.graph_name().clone();
    let graph = build_document_graph(&mut membrane, &wet_name).expect("document graph");
    let dry_doc = membrane
        .convert_argument_to_proxy(&wet, &dry, Value::Object(graph.document))
        .expect("wrap document")
        .as_object()
        .expect("surrogate handle");
    Setup {
        membrane,
        wet,
        dry,
        graph,
        dry_doc,
    }
}

fn method(membrane: &mut Membrane, target: ObjectHandle, name: &str) -> ObjectHandle {
    membrane
        .get(target, &key(name))
        .expect("method lookup")
        .as_object()
        .expect("callable")
}

// ---------------------------------------------------------------------------
// 1. Methods through surrogates
// ---------------------------------------------------------------------------

#[test]
fn create_element_from_the_dry_side() {
    let mut s = setup();
    let create = method(&mut s.membrane, s.dry_doc, "createElement");
    let dry_element = s
        .membrane
        .call(
            create,
            Value::Object(s.dry_doc),
            vec![Value::Str("p".into())],
        )
        .expect("createElement")
        .as_object()
        .expect("element");

    // The dry side reads its own view.
    assert_eq!(
        s.membrane.get(dry_element, &key("nodeName")).expect("get"),
        Value::Str("p".into())
    );
    // ownerDocument resolves to the dry document surrogate, not the
    // wet original.
    assert_eq!(
        s.membrane
            .get(dry_element, &key("ownerDocument"))
            .expect("get"),
        Value::Object(s.dry_doc)
    );
    // A real wet element backs the surrogate.
    let (found, real) = s
        .membrane
        .get_membrane_value(&GraphName::new("dry"), Value::Object(dry_element));
    assert!(found);
    let real_handle = real.as_object().expect("real element");
    assert_ne!(real_handle, dry_element);
    assert_eq!(
        s.membrane.get(real_handle, &key("nodeName")).expect("wet"),
        Value::Str("p".into())
    );
}

#[test]
fn append_child_through_the_membrane_updates_the_original() {
    let mut s = setup();
    let create = method(&mut s.membrane, s.dry_doc, "createElement");
    let dry_element = s
        .membrane
        .call(
            create,
            Value::Object(s.dry_doc),
            vec![Value::Str("span".into())],
        )
        .expect("createElement")
        .as_object()
        .expect("element");

    let dry_root = s
        .membrane
        .get(s.dry_doc, &key("rootElement"))
        .expect("rootElement")
        .as_object()
        .expect("element");
    let append = method(&mut s.membrane, dry_root, "appendChild");
    s.membrane
        .call(
            append,
            Value::Object(dry_root),
            vec![Value::Object(dry_element)],
        )
        .expect("appendChild");

    // The wet original records the real child.
    let children = s
        .membrane
        .get(s.graph.root_element, &key("childNodes"))
        .expect("wet children")
        .as_object()
        .expect("list");
    assert_eq!(
        s.membrane.get(children, &key("length")).expect("len"),
        Value::Int(1)
    );
    let first = s
        .membrane
        .get(children, &key("0"))
        .expect("first child")
        .as_object()
        .expect("element");
    let (found, real) = s
        .membrane
        .get_membrane_value(&GraphName::new("dry"), Value::Object(dry_element));
    assert!(found);
    assert_eq!(Value::Object(first), real);

    // The dry view of the child points back at the dry root.
    assert_eq!(
        s.membrane.get(dry_element, &key("parentNode")).expect("get"),
        Value::Object(dry_root)
    );
}

// ---------------------------------------------------------------------------
// 2. Cross-graph event dispatch
// ---------------------------------------------------------------------------

#[test]
fn event_dispatch_preserves_receiver_identity_across_the_boundary() {
    let mut s = setup();
    let dry_root = s
        .membrane
        .get(s.dry_doc, &key("rootElement"))
        .expect("rootElement")
        .as_object()
        .expect("element");

    // Wire the wet bubbling chain: root -> document.
    s.membrane
        .set(
            s.graph.root_element,
            &key("parentNode"),
            Value::Object(s.graph.document),
        )
        .expect("wire parent");

    // The dry side installs a handler written as dry-graph code.
    let seen: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let dry_handler = s.membrane.alloc_function(
        None,
        Rc::new(move |_m: &mut Membrane, ctx| {
            sink.borrow_mut().push(ctx.this.clone());
            Ok(Value::Undefined)
        }),
    );
    assert!(s
        .membrane
        .set(dry_root, &key("onEvent"), Value::Object(dry_handler))
        .expect("install handler"));

    // The wet original now holds a wet surrogate of the dry handler.
    let wet_view = s
        .membrane
        .get(s.graph.root_element, &key("onEvent"))
        .expect("wet view")
        .as_object()
        .expect("callable");
    assert_ne!(wet_view, dry_handler);

    // Dispatch from the dry side; the call crosses into the wet graph
    // and back into the dry handler.
    let dispatch = method(&mut s.membrane, dry_root, "dispatchEvent");
    let handled = s
        .membrane
        .call(
            dispatch,
            Value::Object(dry_root),
            vec![Value::Str("click".into())],
        )
        .expect("dispatch");
    assert_eq!(handled, Value::Int(1));

    // The handler saw the dry surrogate as its receiver: the value came
    // back through the membrane with identity intact.
    assert_eq!(*seen.borrow(), vec![Value::Object(dry_root)]);
}

#[test]
fn event_dispatch_from_the_wet_side_reaches_dry_handlers() {
    let mut s = setup();
    let dry_root = s
        .membrane
        .get(s.dry_doc, &key("rootElement"))
        .expect("rootElement")
        .as_object()
        .expect("element");

    let seen: Rc<RefCell<Vec<Value>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let dry_handler = s.membrane.alloc_function(
        None,
        Rc::new(move |_m: &mut Membrane, ctx| {
            sink.borrow_mut().push(ctx.args.first().cloned().unwrap_or(Value::Undefined));
            Ok(Value::Undefined)
        }),
    );
    s.membrane
        .set(dry_root, &key("onEvent"), Value::Object(dry_handler))
        .expect("install handler");

    // Wet-side dispatch on the original.
    let dispatch = method(&mut s.membrane, s.graph.root_element, "dispatchEvent");
    let handled = s
        .membrane
        .call(
            dispatch,
            Value::Object(s.graph.root_element),
            vec![Value::Str("load".into())],
        )
        .expect("wet dispatch");
    assert_eq!(handled, Value::Int(1));
    assert_eq!(*seen.borrow(), vec![Value::Str("load".into())]);
}

// ---------------------------------------------------------------------------
// 3. Enumeration equivalence
// ---------------------------------------------------------------------------

#[test]
fn undistorted_views_enumerate_identically() {
    let mut s = setup();
    assert_eq!(
        s.membrane.own_keys(s.dry_doc).expect("dry keys"),
        s.membrane.own_keys(s.graph.document).expect("wet keys")
    );
    assert_eq!(
        s.membrane.for_in_keys(s.dry_doc).expect("dry for-in"),
        s.membrane.for_in_keys(s.graph.document).expect("wet for-in")
    );
}
