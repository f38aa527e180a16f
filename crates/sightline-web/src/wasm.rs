#![forbid(unsafe_code)]

//! `wasm-bindgen` host over the browser's `IntersectionObserver`.
//!
//! One JS closure per [`WebHost`] receives every observer's entries and
//! forwards them to the registry's [`BatchDispatcher`]; observers are created
//! lazily per distinct context key. Only compiled on `wasm32` targets.

use std::cell::Cell;
use std::hash::{Hash, Hasher};

use js_sys::{Array, Function, Object, Reflect, WeakMap};
use sightline_core::{
    BatchDispatcher, ContextKey, HostError, IntersectionEntry, ObservationContext,
    ObservationHost, ObserveOptions, SharedRegistry,
};
use tracing::error;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{
    Element, IntersectionObserver, IntersectionObserverEntry, IntersectionObserverInit, NodeList,
};

use crate::observer_init::ObserverInit;

thread_local! {
    static IDENTITIES: WeakMap = WeakMap::new();
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Stable per-node id, kept in a `WeakMap` so nodes are not retained.
fn identity_of(object: &Object) -> u64 {
    IDENTITIES.with(|ids| {
        if let Some(id) = ids.get(object).as_f64() {
            return id as u64;
        }
        let id = NEXT_ID.with(|next| next.replace(next.get() + 1));
        ids.set(object, &JsValue::from_f64(id as f64));
        id
    })
}

fn js_message(err: &JsValue) -> String {
    err.dyn_ref::<js_sys::Error>()
        .map(|e| String::from(e.message()))
        .or_else(|| err.as_string())
        .unwrap_or_else(|| format!("{err:?}"))
}

fn console_error(msg: &str) {
    let global = js_sys::global();
    let Ok(console) = Reflect::get(&global, &"console".into()) else {
        return;
    };
    let Ok(error) = Reflect::get(&console, &"error".into()) else {
        return;
    };
    let Ok(error_fn) = error.dyn_into::<Function>() else {
        return;
    };
    let _ = error_fn.call1(&console, &JsValue::from_str(msg));
}

fn install_panic_hook() {
    use std::sync::Once;

    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        std::panic::set_hook(Box::new(|info| {
            let msg = match info.location() {
                Some(loc) => format!(
                    "sightline panic at {}:{}:{}: {info}",
                    loc.file(),
                    loc.line(),
                    loc.column()
                ),
                None => format!("sightline panic: {info}"),
            };
            console_error(&msg);
        }));
    });
}

/// A DOM element compared by node identity: every wrapper of the same node
/// is equal and hashes the same.
#[derive(Clone, Debug)]
pub struct DomNode {
    id: u64,
    element: Element,
}

impl DomNode {
    #[must_use]
    pub fn new(element: Element) -> Self {
        Self {
            id: identity_of(&element),
            element,
        }
    }

    #[must_use]
    pub fn element(&self) -> &Element {
        &self.element
    }
}

impl PartialEq for DomNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DomNode {}

impl Hash for DomNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

type DeliveryClosure = Closure<dyn FnMut(Array, IntersectionObserver)>;

/// [`ObservationHost`] backed by `IntersectionObserver`.
pub struct WebHost {
    on_entries: DeliveryClosure,
}

impl std::fmt::Debug for WebHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebHost").finish_non_exhaustive()
    }
}

impl WebHost {
    #[must_use]
    pub fn new(dispatcher: BatchDispatcher<WebHost>) -> Self {
        let on_entries = Closure::new(move |entries: Array, _observer: IntersectionObserver| {
            dispatcher.deliver(
                entries
                    .iter()
                    .filter_map(|value| value.dyn_into::<IntersectionObserverEntry>().ok())
                    .map(|entry| {
                        IntersectionEntry::new(DomNode::new(entry.target()), entry.is_intersecting())
                            .with_ratio(entry.intersection_ratio())
                            .with_time(entry.time())
                    }),
            );
        });
        Self { on_entries }
    }
}

fn observer_options(
    init: &ObserverInit,
    root: Option<&DomNode>,
) -> Result<IntersectionObserverInit, HostError> {
    let options = Object::new();
    let root = root.map_or(JsValue::NULL, |frame| frame.element().clone().into());
    let thresholds: Array = init
        .thresholds
        .iter()
        .map(|&ratio| JsValue::from_f64(ratio))
        .collect();
    for (name, value) in [
        ("root", root),
        ("rootMargin", JsValue::from_str(&init.root_margin)),
        ("threshold", thresholds.into()),
    ] {
        Reflect::set(&options, &JsValue::from_str(name), &value)
            .map_err(|err| HostError::Unavailable(js_message(&err)))?;
    }
    Ok(options.unchecked_into())
}

impl ObservationHost for WebHost {
    type Element = DomNode;
    type Frame = DomNode;
    type Context = WebContext;

    fn create_context(&mut self, key: &ContextKey<DomNode>) -> Result<WebContext, HostError> {
        let init = ObserverInit::from_key(key);
        init.check()?;
        let options = observer_options(&init, key.frame.as_ref())?;
        let observer = IntersectionObserver::new_with_options(
            self.on_entries.as_ref().unchecked_ref::<Function>(),
            &options,
        )
        .map_err(|err| HostError::InvalidConfig(js_message(&err)))?;
        Ok(WebContext { observer })
    }
}

/// One live `IntersectionObserver`.
#[derive(Debug)]
pub struct WebContext {
    observer: IntersectionObserver,
}

impl ObservationContext<DomNode> for WebContext {
    fn watch(&mut self, target: &DomNode) -> Result<(), HostError> {
        self.observer.observe(target.element());
        Ok(())
    }

    fn unwatch(&mut self, target: &DomNode) {
        self.observer.unobserve(target.element());
    }

    fn disconnect(&mut self) {
        self.observer.disconnect();
    }
}

impl Drop for WebContext {
    fn drop(&mut self) {
        // The shared closure may already be freed; a live observer would call it.
        self.observer.disconnect();
    }
}

/// Registry wired to a fresh [`WebHost`].
#[must_use]
pub fn web_registry() -> SharedRegistry<WebHost> {
    install_panic_hook();
    SharedRegistry::new(WebHost::new)
}

fn js_callback(callback: Function) -> impl Fn(bool) + 'static {
    move |visible| {
        if let Err(err) = callback.call1(&JsValue::NULL, &JsValue::from_bool(visible)) {
            let message = js_message(&err);
            error!(message = %message, "visibility callback threw");
            console_error(&format!("sightline: visibility callback threw: {message}"));
        }
    }
}

fn parse_options(value: &JsValue) -> Result<ObserveOptions<DomNode>, JsValue> {
    let mut options = ObserveOptions::new();
    if value.is_undefined() || value.is_null() {
        return Ok(options);
    }

    let root = Reflect::get(value, &"root".into())?;
    if let Some(root) = root.dyn_ref::<Element>() {
        options = options.with_frame(DomNode::new(root.clone()));
    }
    if let Some(margin) = Reflect::get(value, &"rootMargin".into())?.as_string() {
        options = options.with_margin(margin);
    }
    let threshold = Reflect::get(value, &"threshold".into())?;
    if let Some(ratio) = threshold.as_f64() {
        options = options.with_threshold(ratio);
    } else if Array::is_array(&threshold) {
        // Non-numeric steps become NaN so the observer init check rejects them.
        let steps: Vec<f64> = Array::from(&threshold)
            .iter()
            .map(|step| step.as_f64().unwrap_or(f64::NAN))
            .collect();
        options = options.with_threshold(steps);
    }
    let once = Reflect::get(value, &"once".into())?;
    Ok(options.with_once(once.as_bool().unwrap_or(false)))
}

fn parse_targets(value: JsValue) -> Result<Vec<DomNode>, JsValue> {
    let invalid = || {
        JsValue::from(js_sys::Error::new(
            "expected an Element, an array of Elements, or a NodeList",
        ))
    };
    if let Some(nodes) = value.dyn_ref::<NodeList>() {
        // Text and comment nodes cannot be observed.
        return Ok((0..nodes.length())
            .filter_map(|index| nodes.item(index))
            .filter_map(|node| node.dyn_into::<Element>().ok())
            .map(DomNode::new)
            .collect());
    }
    if Array::is_array(&value) {
        Array::from(&value)
            .iter()
            .map(|item| item.dyn_into::<Element>().map(DomNode::new).map_err(|_| invalid()))
            .collect()
    } else {
        value
            .dyn_into::<Element>()
            .map(|element| vec![DomNode::new(element)])
            .map_err(|_| invalid())
    }
}

/// JS-facing visibility watcher.
///
/// ```js
/// const watcher = new VisibilityWatcher();
/// watcher
///     .addElement(img, (visible) => { if (visible) load(img); }, { once: true })
///     .addElement(document.querySelectorAll(".card"), onCard);
/// ```
#[wasm_bindgen]
pub struct VisibilityWatcher {
    registry: SharedRegistry<WebHost>,
}

impl Default for VisibilityWatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[wasm_bindgen]
impl VisibilityWatcher {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        Self {
            registry: web_registry(),
        }
    }

    /// Watch an element, an array of elements, or a `NodeList`. `options`
    /// accepts `{ root, rootMargin, threshold, once }`; missing fields use
    /// defaults. Returns a watcher over the same registry so calls chain.
    /// Throws if the browser rejects the configuration.
    #[wasm_bindgen(js_name = addElement)]
    pub fn add_element(
        &self,
        target: JsValue,
        callback: Function,
        options: JsValue,
    ) -> Result<VisibilityWatcher, JsValue> {
        let options = parse_options(&options)?;
        let targets = parse_targets(target)?;
        self.registry
            .add_elements(targets, js_callback(callback), options)
            .map_err(|err| JsValue::from(js_sys::Error::new(&err.to_string())))?;
        Ok(Self {
            registry: self.registry.clone(),
        })
    }

    #[wasm_bindgen(js_name = removeElement)]
    pub fn remove_element(&self, element: Element) -> bool {
        self.registry.remove_element(&DomNode::new(element))
    }

    pub fn contains(&self, element: Element) -> bool {
        self.registry.contains(&DomNode::new(element))
    }

    #[wasm_bindgen(getter)]
    pub fn size(&self) -> usize {
        self.registry.len()
    }

    /// Stop watching everything and release every observer.
    pub fn clear(&self) {
        self.registry.with_mut(|registry| registry.clear());
    }
}
