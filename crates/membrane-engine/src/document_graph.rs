//! Mock document graph: a minimal document/node/element object graph with
//! event dispatch, used by the integration tests as a realistic
//! membrane-unaware collaborator.
//!
//! The graph is plain structured values; nothing in it knows the membrane
//! exists.  Its only behavioral surface is the host's structural
//! operations plus three native methods: `createElement`, `appendChild`,
//! and `dispatchEvent`.

use std::rc::Rc;

use crate::descriptor::{ObjectHandle, PropertyDescriptor, PropertyKey, Value};
use crate::error::MembraneError;
use crate::mapping::GraphName;
use crate::membrane::{CallContext, Membrane};
use crate::object_model::ObjectKind;

/// Handles of one freshly built document graph.
#[derive(Debug, Clone)]
pub struct DocumentGraph {
    pub graph: GraphName,
    pub document: ObjectHandle,
    pub root_element: ObjectHandle,
    pub node_prototype: ObjectHandle,
    pub element_prototype: ObjectHandle,
}

fn key(s: &str) -> PropertyKey {
    PropertyKey::new(s)
}

fn data(
    membrane: &mut Membrane,
    target: ObjectHandle,
    name: &str,
    value: Value,
) -> Result<(), MembraneError> {
    membrane.define_property(target, key(name), PropertyDescriptor::data(value))?;
    Ok(())
}

/// Build a document graph inside `membrane`, owned by `graph`.
pub fn build_document_graph(
    membrane: &mut Membrane,
    graph: &GraphName,
) -> Result<DocumentGraph, MembraneError> {
    let object_proto = membrane.object_prototype();
    let node_prototype = membrane.alloc_object(ObjectKind::Plain, Some(object_proto));
    let element_prototype = membrane.alloc_object(ObjectKind::Plain, Some(node_prototype));

    // -- Node.appendChild ----------------------------------------------------
    let append_child = membrane.alloc_function(
        None,
        Rc::new(|m: &mut Membrane, ctx: &CallContext| {
            let Some(parent) = ctx.this.as_object() else {
                return Err(MembraneError::bad_argument("appendChild needs a node receiver"));
            };
            let Some(child_value) = ctx.args.first().cloned() else {
                return Err(MembraneError::bad_argument("appendChild needs a child"));
            };
            let Some(child) = child_value.as_object() else {
                return Err(MembraneError::bad_argument("appendChild needs an object child"));
            };
            m.set(child, &key("parentNode"), Value::Object(parent))?;
            let children = match m.get(parent, &key("childNodes"))? {
                Value::Object(c) => c,
                _ => {
                    let c = m.alloc_object(ObjectKind::Indexable, None);
                    m.set(c, &key("length"), Value::Int(0))?;
                    m.set(parent, &key("childNodes"), Value::Object(c))?;
                    c
                }
            };
            let length = match m.get(children, &key("length"))? {
                Value::Int(n) => n,
                _ => 0,
            };
            m.set(children, &PropertyKey::new(length.to_string()), child_value)?;
            m.set(children, &key("length"), Value::Int(length + 1))?;
            Ok(Value::Object(child))
        }),
    );
    data(
        membrane,
        node_prototype,
        "appendChild",
        Value::Object(append_child),
    )?;

    // -- Node.dispatchEvent --------------------------------------------------
    // Bubbles from the receiver up the parentNode chain, invoking each
    // node's `onEvent` callback with the node as receiver.
    let dispatch_event = membrane.alloc_function(
        None,
        Rc::new(|m: &mut Membrane, ctx: &CallContext| {
            let Some(start) = ctx.this.as_object() else {
                return Err(MembraneError::bad_argument("dispatchEvent needs a node receiver"));
            };
            let event = ctx
                .args
                .first()
                .cloned()
                .unwrap_or(Value::Str("event".to_string()));
            let mut current = Some(start);
            let mut handled = 0_i64;
            while let Some(node) = current {
                if let Value::Object(handler) = m.get(node, &key("onEvent"))? {
                    m.call(handler, Value::Object(node), vec![event.clone()])?;
                    handled += 1;
                }
                current = match m.get(node, &key("parentNode"))? {
                    Value::Object(p) => Some(p),
                    _ => None,
                };
            }
            Ok(Value::Int(handled))
        }),
    );
    data(
        membrane,
        node_prototype,
        "dispatchEvent",
        Value::Object(dispatch_event),
    )?;

    data(membrane, element_prototype, "nodeType", Value::Int(1))?;

    // -- document ------------------------------------------------------------
    let document = membrane.alloc_object(ObjectKind::Plain, Some(node_prototype));
    data(membrane, document, "nodeType", Value::Int(9))?;
    data(membrane, document, "nodeName", Value::Str("#document".into()))?;
    // The document owns itself: a deliberate cycle.
    data(membrane, document, "ownerDocument", Value::Object(document))?;

    let element_proto_for_create = element_prototype;
    let create_element = membrane.alloc_function(
        None,
        Rc::new(move |m: &mut Membrane, ctx: &CallContext| {
            let Some(doc) = ctx.this.as_object() else {
                return Err(MembraneError::bad_argument("createElement needs a document"));
            };
            let name = match ctx.args.first() {
                Some(Value::Str(s)) if !s.is_empty() => s.clone(),
                _ => {
                    return Err(MembraneError::bad_argument(
                        "createElement needs a non-empty tag name",
                    ));
                }
            };
            let element = m.alloc_object(ObjectKind::Plain, Some(element_proto_for_create));
            m.set(element, &key("nodeName"), Value::Str(name))?;
            m.set(element, &key("ownerDocument"), Value::Object(doc))?;
            m.set(element, &key("parentNode"), Value::Null)?;
            Ok(Value::Object(element))
        }),
    );
    data(
        membrane,
        document,
        "createElement",
        Value::Object(create_element),
    )?;

    // -- root element --------------------------------------------------------
    let root_element = membrane.alloc_object(ObjectKind::Plain, Some(element_prototype));
    data(membrane, root_element, "nodeName", Value::Str("root".into()))?;
    data(
        membrane,
        root_element,
        "ownerDocument",
        Value::Object(document),
    )?;
    data(membrane, root_element, "parentNode", Value::Null)?;
    data(membrane, document, "rootElement", Value::Object(root_element))?;

    Ok(DocumentGraph {
        graph: graph.clone(),
        document,
        root_element,
        node_prototype,
        element_prototype,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Membrane, DocumentGraph) {
        let mut membrane = Membrane::default();
        let wet = GraphName::new("wet");
        membrane.get_handler_by_name(wet.clone(), true).expect("wet");
        let graph = build_document_graph(&mut membrane, &wet).expect("graph");
        (membrane, graph)
    }

    // -----------------------------------------------------------------------
    // 1. Structure
    // -----------------------------------------------------------------------

    #[test]
    fn document_shape() {
        let (mut membrane, graph) = setup();
        assert_eq!(
            membrane.get(graph.document, &key("nodeType")).expect("get"),
            Value::Int(9)
        );
        assert_eq!(
            membrane
                .get(graph.document, &key("rootElement"))
                .expect("get"),
            Value::Object(graph.root_element)
        );
        // ownerDocument cycle.
        assert_eq!(
            membrane
                .get(graph.document, &key("ownerDocument"))
                .expect("get"),
            Value::Object(graph.document)
        );
    }

    #[test]
    fn element_inherits_node_methods() {
        let (mut membrane, graph) = setup();
        let append = membrane
            .get(graph.root_element, &key("appendChild"))
            .expect("inherited");
        assert!(append.is_object());
        assert_eq!(
            membrane
                .get(graph.root_element, &key("nodeType"))
                .expect("get"),
            Value::Int(1)
        );
    }

    // -----------------------------------------------------------------------
    // 2. createElement / appendChild
    // -----------------------------------------------------------------------

    #[test]
    fn create_element_allocates_under_document() {
        let (mut membrane, graph) = setup();
        let create = membrane
            .get(graph.document, &key("createElement"))
            .expect("method")
            .as_object()
            .expect("callable");
        let element = membrane
            .call(
                create,
                Value::Object(graph.document),
                vec![Value::Str("p".into())],
            )
            .expect("createElement")
            .as_object()
            .expect("element");
        assert_eq!(
            membrane.get(element, &key("nodeName")).expect("get"),
            Value::Str("p".into())
        );
        assert_eq!(
            membrane.get(element, &key("ownerDocument")).expect("get"),
            Value::Object(graph.document)
        );
    }

    #[test]
    fn create_element_validates_arguments() {
        let (mut membrane, graph) = setup();
        let create = membrane
            .get(graph.document, &key("createElement"))
            .expect("method")
            .as_object()
            .expect("callable");
        let err = membrane
            .call(create, Value::Object(graph.document), vec![Value::Int(3)])
            .expect_err("bad tag");
        assert!(matches!(err, MembraneError::InvalidArgumentShape { .. }));
    }

    #[test]
    fn append_child_links_parent_and_children() {
        let (mut membrane, graph) = setup();
        let create = membrane
            .get(graph.document, &key("createElement"))
            .expect("method")
            .as_object()
            .expect("callable");
        let child = membrane
            .call(
                create,
                Value::Object(graph.document),
                vec![Value::Str("span".into())],
            )
            .expect("create")
            .as_object()
            .expect("element");
        let append = membrane
            .get(graph.root_element, &key("appendChild"))
            .expect("method")
            .as_object()
            .expect("callable");
        membrane
            .call(
                append,
                Value::Object(graph.root_element),
                vec![Value::Object(child)],
            )
            .expect("append");

        assert_eq!(
            membrane.get(child, &key("parentNode")).expect("get"),
            Value::Object(graph.root_element)
        );
        let children = membrane
            .get(graph.root_element, &key("childNodes"))
            .expect("children")
            .as_object()
            .expect("list");
        assert_eq!(
            membrane.get(children, &key("length")).expect("len"),
            Value::Int(1)
        );
        assert_eq!(
            membrane.get(children, &key("0")).expect("first"),
            Value::Object(child)
        );
    }

    // -----------------------------------------------------------------------
    // 3. Event dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn dispatch_event_bubbles_to_document() {
        let (mut membrane, graph) = setup();
        // Record receivers seen by the handler.
        let seen = membrane.alloc_object(ObjectKind::Indexable, None);
        membrane
            .set(seen, &key("length"), Value::Int(0))
            .expect("init");
        let handler = membrane.alloc_function(
            None,
            Rc::new(move |m: &mut Membrane, ctx: &CallContext| {
                let n = match m.get(seen, &key("length"))? {
                    Value::Int(n) => n,
                    _ => 0,
                };
                m.set(seen, &PropertyKey::new(n.to_string()), ctx.this.clone())?;
                m.set(seen, &key("length"), Value::Int(n + 1))?;
                Ok(Value::Undefined)
            }),
        );
        membrane
            .set(graph.root_element, &key("onEvent"), Value::Object(handler))
            .expect("root handler");
        membrane
            .set(graph.document, &key("onEvent"), Value::Object(handler))
            .expect("doc handler");
        membrane
            .set(
                graph.root_element,
                &key("parentNode"),
                Value::Object(graph.document),
            )
            .expect("wire parent");

        let dispatch = membrane
            .get(graph.root_element, &key("dispatchEvent"))
            .expect("method")
            .as_object()
            .expect("callable");
        let handled = membrane
            .call(
                dispatch,
                Value::Object(graph.root_element),
                vec![Value::Str("click".into())],
            )
            .expect("dispatch");
        assert_eq!(handled, Value::Int(2));

        // Receiver identity: first the element, then the document.
        assert_eq!(
            membrane.get(seen, &key("0")).expect("first"),
            Value::Object(graph.root_element)
        );
        assert_eq!(
            membrane.get(seen, &key("1")).expect("second"),
            Value::Object(graph.document)
        );
    }
}
