use std::sync::{
    Arc, LazyLock,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::{
    Cleanup, Context, Element, ErrorInfo, HostProps, Lanes, Reconciler, ReconcilerConfig, ReconcilerError, RenderContext,
    RenderResult, RenderSignal, Resource, RootId, RootOptions, SetState, SuspenseHandle, ThrownValue, deps,
    fiber::{FiberId, FiberKind, FiberState},
    test_renderer::{HostOp, TestRenderer},
    test_scheduler::TestScheduler,
};

type Engine = Reconciler<TestRenderer, TestScheduler>;

fn engine() -> Engine {
    Reconciler::new(
        TestRenderer::default(),
        TestScheduler::default(),
        ReconcilerConfig::default(),
    )
}

fn mount(options: RootOptions) -> (Engine, RootId) {
    let mut engine = engine();
    let root = engine.create_root((), options);
    (engine, root)
}

fn div(children: Vec<Element>) -> Element {
    Element::host("div", HostProps::new(), children)
}

fn span(text: impl Into<Arc<str>>) -> Element {
    Element::host("span", HostProps::new(), vec![Element::text(text)])
}

/// Ordered record of what components and effects did.
#[derive(Clone, Default)]
struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl PartialEq for Log {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Hands a value created during render back to the test.
#[derive(Clone)]
struct Slot<T>(Arc<Mutex<Option<T>>>);

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn put(&self, value: T) {
        *self.0.lock() = Some(value);
    }

    fn get(&self) -> T {
        let Some(value) = self.0.lock().clone() else {
            panic!("slot was never filled");
        };
        value
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[derive(Clone)]
struct Data(Resource<String>);

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.0.wakeable() == other.0.wakeable()
    }
}

#[derive(Clone, PartialEq)]
struct Tracker {
    name: &'static str,
    log: Log,
}

fn counter(cx: &mut RenderContext, slot: &Slot<SetState<i32>>) -> RenderResult {
    let (count, set_count) = cx.use_state(|| 0);
    slot.put(set_count);
    Ok(Element::text(count.to_string()))
}

fn appender(cx: &mut RenderContext, slot: &Slot<crate::Dispatch<String>>) -> RenderResult {
    let (value, dispatch) = cx.use_reducer(|state: &String, suffix: &String| format!("{state}{suffix}"), String::new);
    slot.put(dispatch);
    Ok(Element::text(value))
}

/// Logs every layout and passive effect mount and cleanup.
fn effects(cx: &mut RenderContext, tracker: &Tracker) -> RenderResult {
    let Tracker { name, log } = tracker.clone();
    let layout_log = log.clone();
    cx.use_layout_effect(Some(deps![]), move || {
        layout_log.push(format!("layout mount {name}"));
        let log = layout_log.clone();
        Ok(Some(Box::new(move || {
            log.push(format!("layout unmount {name}"));
            Ok(())
        }) as Cleanup))
    });
    let passive_log = log.clone();
    cx.use_effect(Some(deps![]), move || {
        passive_log.push(format!("passive mount {name}"));
        let log = passive_log.clone();
        Ok(Some(Box::new(move || {
            log.push(format!("passive unmount {name}"));
            Ok(())
        }) as Cleanup))
    });
    Ok(span(name))
}

#[derive(Clone, PartialEq)]
struct Reader {
    data: Data,
    log: Log,
}

/// Reads a resource and logs its effects, suspending while the resource is
/// pending.
fn reader(cx: &mut RenderContext, props: &Reader) -> RenderResult {
    let log = props.log.clone();
    cx.use_layout_effect(Some(deps![]), move || {
        log.push("layout mount");
        let log = log.clone();
        Ok(Some(Box::new(move || {
            log.push("layout unmount");
            Ok(())
        }) as Cleanup))
    });
    let log = props.log.clone();
    cx.use_effect(Some(deps![]), move || {
        log.push("passive mount");
        let log = log.clone();
        Ok(Some(Box::new(move || {
            log.push("passive unmount");
            Ok(())
        }) as Cleanup))
    });
    let value = cx.use_resource(&props.data.0)?;
    Ok(span(value))
}

fn broken(_cx: &mut RenderContext, message: &&'static str) -> RenderResult {
    Err(RenderSignal::Error(ThrownValue::msg(*message)))
}

fn error_log(log: &Log) -> Option<crate::ErrorCallback> {
    let log = log.clone();
    Some(Arc::new(move |info: &ErrorInfo| log.push(info.value.to_string())))
}

#[test]
fn update_reuses_host_instances() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    engine.render(
        root,
        Element::host("div", HostProps::new().with("id", "a"), vec![Element::text("one")]),
    )?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), r#"<div id="a">one</div>"#);
    engine.host_mut().take_ops();

    engine.render(
        root,
        Element::host("div", HostProps::new().with("id", "b"), vec![Element::text("two")]),
    )?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), r#"<div id="b">two</div>"#);
    let ops = engine.host_mut().take_ops();
    assert!(
        !ops.iter()
            .any(|op| matches!(op, HostOp::Create { .. } | HostOp::CreateText { .. })),
        "{ops:?}"
    );
    assert!(ops.iter().any(|op| matches!(op, HostOp::Update { .. })));
    assert!(ops.iter().any(|op| matches!(op, HostOp::UpdateText { text, .. } if text == "two")));
    Ok(())
}

fn keyed_list(keys: &[&'static str]) -> Element {
    Element::host(
        "ul",
        HostProps::new(),
        keys.iter()
            .map(|key| Element::host("li", HostProps::new(), vec![Element::text(*key)]).with_key(*key))
            .collect(),
    )
}

#[test]
fn keyed_children_move_instead_of_remount() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    engine.render(root, keyed_list(&["a", "b", "c"]))?;
    engine.flush_all()?;
    engine.host_mut().take_ops();

    engine.render(root, keyed_list(&["c", "a", "b"]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<ul><li>c</li><li>a</li><li>b</li></ul>");
    let ops = engine.host_mut().take_ops();
    assert!(!ops.iter().any(|op| matches!(op, HostOp::Create { .. })), "{ops:?}");
    assert!(!ops.iter().any(|op| matches!(op, HostOp::Remove { .. })), "{ops:?}");

    engine.render(root, keyed_list(&["c", "b"]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<ul><li>c</li><li>b</li></ul>");
    let removals = engine
        .host_mut()
        .take_ops()
        .into_iter()
        .filter(|op| matches!(op, HostOp::Remove { .. }))
        .count();
    assert_eq!(removals, 1);
    Ok(())
}

#[derive(Clone, PartialEq)]
struct Pair {
    slot: Slot<SetState<i32>>,
    log: Log,
}

fn pair(_cx: &mut RenderContext, props: &Pair) -> RenderResult {
    props.log.push("render A");
    Ok(div(vec![
        Element::component(stateful_item, props.clone()),
        Element::component(static_item, props.log.clone()),
    ]))
}

fn stateful_item(cx: &mut RenderContext, props: &Pair) -> RenderResult {
    props.log.push("render B");
    let (count, set_count) = cx.use_state(|| 0);
    props.slot.put(set_count);
    Ok(span(count.to_string()))
}

fn static_item(_cx: &mut RenderContext, log: &Log) -> RenderResult {
    log.push("render C");
    Ok(Element::host("em", HostProps::new(), vec![Element::text("c")]))
}

#[test]
fn updating_one_child_reuses_its_sibling() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let props = Pair {
        slot: Slot::new(),
        log: Log::default(),
    };
    engine.render(root, Element::component(pair, props.clone()))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><span>0</span><em>c</em></div>");
    assert_eq!(props.log.take(), ["render A", "render B", "render C"]);
    let is_em = |kind: &FiberKind| matches!(kind, FiberKind::HostComponent { tag } if &**tag == "em");
    let em = find_committed(&engine, root, is_em);
    engine.host_mut().take_ops();

    props.slot.get().set(1);
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><span>1</span><em>c</em></div>");
    assert_eq!(props.log.take(), ["render B"]);
    assert_eq!(find_committed(&engine, root, is_em), em);
    let ops = engine.host_mut().take_ops();
    assert!(
        ops.iter().all(|op| matches!(op, HostOp::UpdateText { text, .. } if text == "1")),
        "{ops:?}"
    );
    Ok(())
}

#[test]
fn sync_update_commits_before_pending_transition() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let slot = Slot::new();
    engine.render(root, Element::component(appender, slot.clone()))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "");

    let dispatch = slot.get();
    engine.start_transition(|_| dispatch.dispatch("T".to_string()));
    engine.flush_sync(|_| dispatch.dispatch("S".to_string()))?;
    // Only the sync update is visible; the transition is still pending.
    assert_eq!(engine.host().markup(), "S");

    engine.flush_all()?;
    // The transition is rebased: updates apply in the order they were made.
    assert_eq!(engine.host().markup(), "TS");
    Ok(())
}

fn wide_tree(slot: &Slot<SetState<i32>>, extra: usize) -> Element {
    let mut children = vec![Element::component(counter, slot.clone())];
    children.extend((0..extra).map(|_| Element::text("x")));
    div(children)
}

#[test]
fn sync_update_interrupts_yielding_transition() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let slot = Slot::new();
    engine.render(root, wide_tree(&slot, 0))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>0</div>");

    engine.scheduler_mut().set_yield_after(Some(1));
    engine.start_transition(|engine| engine.render(root, wide_tree(&slot, 5)))?;
    assert!(engine.flush_next_task()?);
    assert!(engine.flush_next_task()?);
    // The transition yielded before finishing; nothing was committed.
    assert_eq!(engine.host().markup(), "<div>0</div>");

    let set_count = slot.get();
    engine.flush_sync(|_| set_count.set(1))?;
    assert_eq!(engine.host().markup(), "<div>1</div>");

    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>1xxxxx</div>");
    Ok(())
}

#[test]
fn setting_equal_state_does_not_touch_the_host() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let slot = Slot::new();
    engine.render(root, div(vec![Element::component(counter, slot.clone())]))?;
    engine.flush_all()?;
    engine.host_mut().take_ops();

    slot.get().set(0);
    engine.flush_all()?;
    assert!(engine.host().ops().is_empty(), "{:?}", engine.host().ops());

    slot.get().update(|count| count + 2);
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>2</div>");
    Ok(())
}

#[test]
fn suspense_shows_fallback_until_data_arrives() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let data = Data(Resource::pending());
    let tree = Element::suspense(
        vec![Element::text("loading")],
        vec![Element::component(
            reader,
            Reader {
                data: data.clone(),
                log: log.clone(),
            },
        )],
    );
    engine.render(root, tree)?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "loading");
    assert!(log.take().is_empty());

    data.0.complete("done".to_string());
    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    assert_eq!(engine.host().markup(), "<span>done</span>");
    assert_eq!(log.take(), ["layout mount", "passive mount"]);
    Ok(())
}

fn reader_boundary(data: &Data, log: &Log) -> Element {
    Element::suspense(
        vec![Element::text("loading")],
        vec![Element::component(
            reader,
            Reader {
                data: data.clone(),
                log: log.clone(),
            },
        )],
    )
}

/// First record of the committed tree of `root` matching `kind`.
fn find_committed(engine: &Engine, root: RootId, kind: impl Fn(&FiberKind) -> bool) -> FiberId {
    let mut stack = vec![engine.roots[root].current];
    while let Some(id) = stack.pop() {
        if kind(&engine.fibers[id].kind) {
            return id;
        }
        let mut children = engine.fibers.children(id);
        children.reverse();
        stack.extend(children);
    }
    panic!("no matching fiber in the committed tree");
}

fn owed_lane(engine: &Engine, root: RootId) -> Lanes {
    let boundary = find_committed(engine, root, |kind| matches!(kind, FiberKind::Suspense));
    let Some(lane) = engine.fibers[boundary].retry_lane() else {
        panic!("boundary shows no fallback");
    };
    lane
}

#[test]
fn fallback_boundary_is_retried_on_the_lane_it_owns() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let data = Data(Resource::pending());
    engine.render(root, reader_boundary(&data, &log))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "loading");
    let lane = owed_lane(&engine, root);
    assert!(lane.includes_only_retries(), "{lane:?}");

    // Rendering the boundary again while it still waits keeps its lane.
    engine.render(root, reader_boundary(&data, &log))?;
    engine.flush_all()?;
    assert_eq!(owed_lane(&engine, root), lane);

    data.0.complete("done".to_string());
    engine.process_signals()?;
    assert!(engine.pending_lanes(root).is_some_and(|pending| pending.contains(lane)));

    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    assert_eq!(engine.host().markup(), "<span>done</span>");
    Ok(())
}

#[derive(Clone, PartialEq)]
struct Shell {
    data: Data,
    renders: Log,
    effects: Log,
}

fn shell(_cx: &mut RenderContext, props: &Shell) -> RenderResult {
    props.renders.push("render shell");
    Ok(div(vec![span("header"), reader_boundary(&props.data, &props.effects)]))
}

#[test]
fn resolved_data_renders_again_from_the_boundary() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let props = Shell {
        data: Data(Resource::pending()),
        renders: Log::default(),
        effects: Log::default(),
    };
    engine.render(root, Element::component(shell, props.clone()))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><span>header</span>loading</div>");
    assert_eq!(props.renders.take(), ["render shell"]);

    props.data.0.complete("body".to_string());
    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    assert_eq!(engine.host().markup(), "<div><span>header</span><span>body</span></div>");
    assert!(props.renders.take().is_empty());
    assert_eq!(props.effects.take(), ["layout mount", "passive mount"]);
    Ok(())
}

#[test]
fn resuspending_hides_content_and_disconnects_layout_effects() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    engine.render(root, reader_boundary(&Data(Resource::ready("A".to_string())), &log))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<span>A</span>");
    assert_eq!(log.take(), ["layout mount", "passive mount"]);

    let pending = Data(Resource::pending());
    engine.render(root, reader_boundary(&pending, &log))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "loading");
    assert_eq!(engine.host().markup_with_hidden(), "<span hidden>A</span>loading");
    // Hidden content keeps its state and passive effects.
    assert_eq!(log.take(), ["layout unmount"]);

    pending.0.complete("B".to_string());
    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    assert_eq!(engine.host().markup(), "<span>B</span>");
    assert_eq!(log.take(), ["layout mount"]);
    Ok(())
}

#[test]
fn transition_keeps_previous_screen_while_suspended() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    engine.render(root, reader_boundary(&Data(Resource::ready("A".to_string())), &log))?;
    engine.flush_all()?;
    assert_eq!(log.take(), ["layout mount", "passive mount"]);

    let pending = Data(Resource::pending());
    engine.start_transition(|engine| engine.render(root, reader_boundary(&pending, &log)))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<span>A</span>");
    assert_eq!(engine.host().markup_with_hidden(), "<span>A</span>");

    pending.0.complete("B".to_string());
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<span>B</span>");
    // The content was never hidden, so no effect ran again.
    assert!(log.take().is_empty());
    Ok(())
}

#[test]
fn deletion_runs_layout_cleanups_before_passive_cleanups() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let tracker = |name| {
        Element::component(
            effects,
            Tracker {
                name,
                log: log.clone(),
            },
        )
    };
    engine.render(root, div(vec![tracker("a"), tracker("b")]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><span>a</span><span>b</span></div>");
    assert_eq!(
        log.take(),
        ["layout mount a", "layout mount b", "passive mount a", "passive mount b"]
    );

    engine.render(root, div(vec![]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div></div>");
    assert_eq!(
        log.take(),
        ["layout unmount a", "layout unmount b", "passive unmount a", "passive unmount b"]
    );
    Ok(())
}

#[test]
fn replaced_sibling_cleans_up_before_the_new_one_mounts() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let tracker = |name: &'static str| {
        Element::component(
            effects,
            Tracker {
                name,
                log: log.clone(),
            },
        )
        .with_key(name)
    };
    engine.render(root, div(vec![tracker("a")]))?;
    engine.flush_all()?;
    assert_eq!(log.take(), ["layout mount a", "passive mount a"]);

    engine.render(root, div(vec![tracker("b")]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><span>b</span></div>");
    assert_eq!(
        log.take(),
        ["layout unmount a", "layout mount b", "passive unmount a", "passive mount b"]
    );
    Ok(())
}

#[test]
fn unmount_runs_every_cleanup_and_frees_every_record() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let handle = SuspenseHandle::new();
    let tree = div(vec![
        Element::component(
            effects,
            Tracker {
                name: "a",
                log: log.clone(),
            },
        ),
        Element::suspense(vec![Element::text("...")], vec![span("inner")]).with_suspense_handle(handle.clone()),
    ]);
    engine.render(root, tree)?;
    engine.flush_all()?;
    assert!(handle.is_bound());
    log.take();

    engine.unmount(root)?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "");
    assert_eq!(log.take(), ["layout unmount a", "passive unmount a"]);
    assert!(!handle.is_bound());
    assert_eq!(engine.fiber_count(), 0);
    assert!(matches!(
        engine.render(root, div(vec![])),
        Err(ReconcilerError::UnknownRoot)
    ));
    Ok(())
}

#[test]
fn suspense_handle_detaches_and_reattaches_effects() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let handle = SuspenseHandle::new();
    let tree = Element::suspense(
        vec![Element::text("...")],
        vec![Element::component(
            effects,
            Tracker {
                name: "a",
                log: log.clone(),
            },
        )],
    )
    .with_suspense_handle(handle.clone());
    engine.render(root, tree)?;
    engine.flush_all()?;
    log.take();

    handle.detach();
    engine.flush_all()?;
    assert_eq!(log.take(), ["layout unmount a", "passive unmount a"]);
    assert_eq!(engine.host().markup(), "<span>a</span>");

    handle.attach();
    engine.flush_all()?;
    assert_eq!(log.take(), ["layout mount a", "passive mount a"]);
    Ok(())
}

/// Every ancestor of a fiber with pending lanes carries those lanes in its
/// child lanes, up to a hidden offscreen ancestor that parked them. Returns
/// the lanes parked that way.
fn assert_child_lanes_cover_pending_work(engine: &Engine, root: RootId) -> Lanes {
    let mut stack = vec![engine.roots[root].current];
    let mut found = false;
    let mut parked = Lanes::NONE;
    while let Some(id) = stack.pop() {
        let lanes = engine.fibers[id].lanes;
        if !lanes.is_empty() {
            found = true;
            let mut ancestor: Option<FiberId> = engine.fibers[id].parent;
            while let Some(parent) = ancestor {
                let fiber = &engine.fibers[parent];
                if let FiberState::Offscreen(state) = &fiber.memoized_state
                    && fiber.is_hidden_offscreen()
                    && state.base_lanes.contains(lanes)
                {
                    parked |= lanes;
                    break;
                }
                assert!(
                    fiber.child_lanes.contains(lanes),
                    "ancestor {parent:?} of {id:?} is missing {lanes:?}"
                );
                ancestor = fiber.parent;
            }
        }
        stack.extend(engine.fibers.children(id));
    }
    assert!(found, "no fiber has pending work");
    parked
}

#[test]
fn updates_mark_child_lanes_up_to_the_root() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let slot = Slot::new();
    engine.render(
        root,
        div(vec![div(vec![span("left")]), div(vec![Element::component(counter, slot.clone())])]),
    )?;
    engine.flush_all()?;

    slot.get().set(5);
    engine.process_signals()?;
    assert_eq!(assert_child_lanes_cover_pending_work(&engine, root), Lanes::NONE);
    assert!(engine.pending_lanes(root).is_some_and(|lanes| lanes.contains(Lanes::DEFAULT)));

    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><div><span>left</span></div><div>5</div></div>");
    assert_eq!(engine.pending_lanes(root), Some(Lanes::NONE));
    Ok(())
}

fn counted_reader_boundary(slot: &Slot<SetState<i32>>, data: &Data, log: &Log) -> Element {
    Element::suspense(
        vec![Element::text("loading")],
        vec![
            Element::component(counter, slot.clone()),
            Element::component(
                reader,
                Reader {
                    data: data.clone(),
                    log: log.clone(),
                },
            ),
        ],
    )
}

#[test]
fn updates_inside_hidden_content_wait_for_the_reveal() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let slot = Slot::new();
    let log = Log::default();
    engine.render(root, counted_reader_boundary(&slot, &Data(Resource::ready("A".to_string())), &log))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "0<span>A</span>");

    let pending = Data(Resource::pending());
    engine.render(root, counted_reader_boundary(&slot, &pending, &log))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "loading");

    slot.get().set(3);
    engine.process_signals()?;
    assert_eq!(assert_child_lanes_cover_pending_work(&engine, root), Lanes::NONE);

    // The boundary suspends again; the update is parked on the hidden subtree.
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "loading");
    assert!(assert_child_lanes_cover_pending_work(&engine, root).contains(Lanes::DEFAULT));

    pending.0.complete("B".to_string());
    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    assert_eq!(engine.host().markup(), "3<span>B</span>");
    Ok(())
}

static THEME: LazyLock<Context<&'static str>> = LazyLock::new(|| Context::new("light"));

fn consumer(cx: &mut RenderContext, log: &Log) -> RenderResult {
    let theme = cx.use_context(&THEME);
    log.push(format!("render {theme}"));
    Ok(Element::text(theme))
}

#[test]
fn provider_change_reaches_consumers_behind_unchanged_elements() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let child = div(vec![Element::component(consumer, log.clone())]);
    let tree = |value| Element::provider(&THEME, value, vec![child.clone()]);

    engine.render(root, tree("dark"))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>dark</div>");
    assert_eq!(log.take(), ["render dark"]);

    engine.render(root, tree("dark"))?;
    engine.flush_all()?;
    assert!(log.take().is_empty());

    engine.render(root, tree("dim"))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>dim</div>");
    assert_eq!(log.take(), ["render dim"]);
    Ok(())
}

#[test]
fn error_boundary_renders_fallback_and_reports_once() -> Result<(), ReconcilerError> {
    let caught = Log::default();
    let recovered = Log::default();
    let (mut engine, root) = mount(RootOptions {
        on_caught_error: error_log(&caught),
        on_recoverable_error: error_log(&recovered),
        ..Default::default()
    });
    let tree = div(vec![
        span("sibling"),
        Element::error_boundary(
            |info: &ErrorInfo| Element::text(format!("caught: {}", info.value)),
            vec![Element::component(broken, "boom")],
        ),
    ]);
    engine.render(root, tree)?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div><span>sibling</span>caught: boom</div>");
    assert_eq!(caught.take(), ["boom"]);
    assert!(recovered.take().is_empty());
    Ok(())
}

#[test]
fn uncaught_error_clears_the_root() -> Result<(), ReconcilerError> {
    let uncaught = Log::default();
    let (mut engine, root) = mount(RootOptions {
        on_uncaught_error: error_log(&uncaught),
        ..Default::default()
    });
    engine.render(root, span("ok"))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<span>ok</span>");

    engine.render(root, div(vec![Element::component(broken, "fatal")]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "");
    assert_eq!(uncaught.take(), ["fatal"]);

    // The root stays usable.
    engine.render(root, span("again"))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<span>again</span>");
    Ok(())
}

fn runaway(cx: &mut RenderContext, _: &()) -> RenderResult {
    let (count, set_count) = cx.use_state(|| 0u64);
    cx.use_layout_effect(None, move || {
        set_count.update(|count| count + 1);
        Ok(None)
    });
    Ok(Element::text(count.to_string()))
}

#[test]
fn layout_effect_update_loop_hits_the_depth_limit() -> Result<(), ReconcilerError> {
    let mut engine = Reconciler::new(
        TestRenderer::default(),
        TestScheduler::default(),
        ReconcilerConfig {
            nested_update_limit: 10,
            ..Default::default()
        },
    );
    let root = engine.create_root((), RootOptions::default());
    engine.render(root, Element::component(runaway, ()))?;
    let result = engine.flush_all();
    assert!(
        matches!(result, Err(ReconcilerError::MaximumUpdateDepth { count }) if count > 10),
        "{result:?}"
    );
    Ok(())
}

fn cached(cx: &mut RenderContext, inits: &Slot<Arc<AtomicUsize>>) -> RenderResult {
    let inits = inits.get();
    let value = cx.use_cache(&"generation", || inits.fetch_add(1, Ordering::SeqCst) + 1);
    Ok(Element::text(format!("gen {value}")))
}

#[test]
fn refreshing_the_cache_recomputes_cached_values() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let inits = Slot::new();
    inits.put(Arc::new(AtomicUsize::new(0)));
    engine.render(root, div(vec![Element::component(cached, inits.clone())]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>gen 1</div>");

    engine.render(root, div(vec![Element::component(cached, inits.clone())]))?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>gen 1</div>");

    let lane = engine.refresh_cache(root)?;
    assert!(lane.is_transition());
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "<div>gen 2</div>");
    assert_eq!(inits.get().load(Ordering::SeqCst), 2);
    Ok(())
}

/// What one scripted run left behind.
#[derive(Debug, PartialEq)]
struct RunOutcome {
    tasks: Vec<String>,
    ops: Vec<HostOp>,
    markup: String,
    effects: Vec<String>,
}

/// Mounts a counter and a suspended reader, starts a transition, interrupts
/// it with a sync update and then resolves the reader.
fn scripted_run(yield_after: Option<usize>) -> Result<RunOutcome, ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    engine.scheduler_mut().set_yield_after(yield_after);
    let slot = Slot::new();
    let data = Data(Resource::pending());
    let log = Log::default();
    engine.render(
        root,
        div(vec![Element::component(counter, slot.clone()), reader_boundary(&data, &log)]),
    )?;
    engine.flush_all()?;
    engine.start_transition(|engine| {
        engine.render(
            root,
            div(vec![
                Element::component(counter, slot.clone()),
                reader_boundary(&data, &log),
                span("tail"),
            ]),
        )
    })?;
    engine.flush_next_task()?;
    engine.flush_sync(|_| slot.get().set(7))?;
    data.0.complete("ready".to_string());
    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    Ok(RunOutcome {
        markup: engine.host().markup(),
        ops: engine.host_mut().take_ops(),
        tasks: engine.scheduler_mut().take_task_log(),
        effects: log.take(),
    })
}

#[test]
fn identical_inputs_schedule_identically() -> Result<(), ReconcilerError> {
    let first = scripted_run(Some(2))?;
    let second = scripted_run(Some(2))?;
    assert_eq!(first.markup, "<div>7<span>ready</span><span>tail</span></div>");
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn yield_points_do_not_change_the_result() -> Result<(), ReconcilerError> {
    let baseline = scripted_run(None)?;
    assert_eq!(baseline.markup, "<div>7<span>ready</span><span>tail</span></div>");
    assert_eq!(baseline.effects, ["layout mount", "passive mount"]);
    for yield_after in [Some(1), Some(2), Some(3), Some(5), Some(100)] {
        let run = scripted_run(yield_after)?;
        assert_eq!(run.markup, baseline.markup, "yield after {yield_after:?}");
        assert_eq!(run.effects, baseline.effects, "yield after {yield_after:?}");
    }
    Ok(())
}

#[test]
fn rejected_resource_is_caught_by_the_nearest_boundary() -> Result<(), ReconcilerError> {
    let (mut engine, root) = mount(RootOptions::default());
    let log = Log::default();
    let data = Data(Resource::pending());
    let tree = Element::error_boundary(
        |info: &ErrorInfo| Element::text(format!("failed: {}", info.value)),
        vec![reader_boundary(&data, &log)],
    );
    engine.render(root, tree)?;
    engine.flush_all()?;
    assert_eq!(engine.host().markup(), "loading");

    data.0.fail(ThrownValue::msg("offline"));
    engine.flush_all()?;
    engine.advance_time_and_flush(1_000)?;
    assert_eq!(engine.host().markup(), "failed: offline");
    Ok(())
}
