//! Engine behaviour tests, driven end-to-end through the configuration
//! subtree with an in-memory RPC. Remote callbacks are closures keyed by
//! their ref id; proxied endpoints are whole second engines.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apteryx_common::error::AptError;
use apteryx_common::wire::{PathList, Request, Response, TreeMsg, request, response};
use apteryx_common::{guid, uri};
use apteryx_db::{Engine, Rpc, service};
use bytes::Bytes;

type Handler = Box<dyn FnMut(&request::Action) -> Response + Send>;

#[derive(Default)]
struct MockRpc {
    handlers: Mutex<HashMap<u64, Arc<Mutex<Handler>>>>,
    remotes: Mutex<HashMap<String, Arc<Engine>>>,
    unreachable: Mutex<HashSet<String>>,
}

impl Rpc for MockRpc {
    fn call(&self, target: &str, request: Request) -> Result<Response, AptError> {
        if self.unreachable.lock().unwrap().contains(target) {
            return Err(AptError::Connection("unreachable".into()));
        }
        if let Some(remote) = self.remotes.lock().unwrap().get(target).cloned() {
            return Ok(service::execute(&remote, request));
        }
        let action = request.action.as_ref().ok_or(AptError::Invalid)?;
        let cb_ref = match action {
            request::Action::Watch(r) => r.r#ref,
            request::Action::WatchTree(r) => r.r#ref,
            request::Action::Validate(r) => r.r#ref,
            request::Action::Refresh(r) => r.r#ref,
            request::Action::Provide(r) => r.r#ref,
            request::Action::Index(r) => r.r#ref,
            _ => return Err(AptError::Connection("not a callback".into())),
        };
        let handler = self
            .handlers
            .lock()
            .unwrap()
            .get(&cb_ref)
            .cloned()
            .ok_or_else(|| AptError::Connection("no handler".into()))?;
        let mut handler = handler.lock().unwrap();
        Ok(handler(action))
    }
}

struct Ctx {
    rpc: Arc<MockRpc>,
    engine: Arc<Engine>,
    next_ref: AtomicU64,
}

impl Ctx {
    fn new() -> Ctx {
        let rpc = Arc::new(MockRpc::default());
        let engine = Arc::new(Engine::new(rpc.clone()));
        Ctx {
            rpc,
            engine,
            next_ref: AtomicU64::new(1),
        }
    }

    /// Register a callback the way a client would: install the handler and
    /// write `/apteryx/<kind>/<guid>` with the pattern as value.
    fn register(&self, kind: &str, pattern: &str, handler: Handler) -> String {
        let cb_ref = self.next_ref.fetch_add(1, Ordering::Relaxed);
        self.rpc
            .handlers
            .lock()
            .unwrap()
            .insert(cb_ref, Arc::new(Mutex::new(handler)));
        let cb_guid = guid::make(4242, cb_ref, pattern);
        self.set_ok(
            &format!("/apteryx/{kind}/{cb_guid}"),
            Some(Bytes::from(pattern.to_string())),
        );
        cb_guid
    }

    fn deregister(&self, kind: &str, cb_guid: &str) {
        self.set_ok(&format!("/apteryx/{kind}/{cb_guid}"), None);
    }

    fn set_ok(&self, target: &str, value: Option<Bytes>) {
        self.engine.set(target, value, None, false).unwrap();
    }
}

fn watch_recorder(record: Arc<Mutex<Vec<(String, Option<Bytes>)>>>) -> Handler {
    Box::new(move |action| {
        if let request::Action::Watch(w) = action {
            record.lock().unwrap().push((w.path.clone(), w.value.clone()));
        }
        Response::ok(0)
    })
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within 1s");
}

// ---------------------------------------------------------------------
// Store round trips
// ---------------------------------------------------------------------

#[test]
fn basic_roundtrip() {
    let ctx = Ctx::new();
    let path = "/test/entity/zones/private/name";

    ctx.set_ok(path, Some(Bytes::from("private")));
    assert_eq!(ctx.engine.get(path).unwrap(), Some(Bytes::from("private")));

    ctx.set_ok(path, None);
    assert_eq!(ctx.engine.get(path).unwrap(), None);

    // No dangling interiors left behind; only the control plane's own
    // namespace remains visible at the root.
    assert!(ctx.engine.search("/test/").unwrap().is_empty());
    assert_eq!(ctx.engine.search("/").unwrap(), vec!["/apteryx"]);
    assert_eq!(ctx.engine.timestamp("/test").unwrap(), 0);
}

#[test]
fn invalid_paths_are_refused() {
    let ctx = Ctx::new();
    assert_eq!(
        ctx.engine.set("no-slash", Some(Bytes::new()), None, false),
        Err(AptError::Invalid)
    );
    assert_eq!(
        ctx.engine.set("/t/", Some(Bytes::new()), None, false),
        Err(AptError::Invalid)
    );
    assert_eq!(ctx.engine.get("/t/*").err(), Some(AptError::Invalid));
    assert_eq!(ctx.engine.search("/t").err(), Some(AptError::Invalid));
    assert_eq!(ctx.engine.search("*").err(), Some(AptError::Invalid));
    assert!(ctx.engine.search("/").is_ok());
}

#[test]
fn cas_linearises_on_timestamps() {
    let ctx = Ctx::new();
    let path = "/test/interfaces/eth0/ifindex";

    // Expected 0 on a fresh path succeeds.
    ctx.engine
        .set(path, Some(Bytes::from("1")), Some(0), false)
        .unwrap();
    // A second writer still expecting 0 loses.
    assert_eq!(
        ctx.engine.set(path, Some(Bytes::from("2")), Some(0), false),
        Err(AptError::Busy)
    );
    assert_eq!(ctx.engine.get(path).unwrap(), Some(Bytes::from("1")));

    let ts = ctx.engine.timestamp(path).unwrap();
    assert_ne!(ts, 0);
    ctx.engine
        .set(path, Some(Bytes::from("3")), Some(ts), false)
        .unwrap();
    assert_eq!(ctx.engine.get(path).unwrap(), Some(Bytes::from("3")));
}

#[test]
fn timestamps_are_monotonic_per_path() {
    let ctx = Ctx::new();
    ctx.set_ok("/test/a", Some(Bytes::from("1")));
    let first = ctx.engine.timestamp("/test/a").unwrap();
    ctx.set_ok("/test/a", Some(Bytes::from("2")));
    let second = ctx.engine.timestamp("/test/a").unwrap();
    assert!(second > first);
}

// ---------------------------------------------------------------------
// Watchers
// ---------------------------------------------------------------------

#[test]
fn wildcard_watcher_sees_prune_as_absent() {
    let ctx = Ctx::new();
    ctx.set_ok("/test/e/z/p/state", Some(Bytes::from("up")));

    let record = Arc::new(Mutex::new(Vec::new()));
    ctx.register("watchers", "/test/e/z/p/*", watch_recorder(record.clone()));

    ctx.engine.prune("/test/e/z/p").unwrap();
    wait_for(|| !record.lock().unwrap().is_empty());

    let seen = record.lock().unwrap().clone();
    assert_eq!(seen, vec![("/test/e/z/p/state".to_string(), None)]);
}

#[test]
fn set_wait_blocks_until_watchers_ran() {
    let ctx = Ctx::new();
    let record = Arc::new(Mutex::new(Vec::new()));
    ctx.register("watchers", "/test/w/*", watch_recorder(record.clone()));

    ctx.engine
        .set("/test/w/x", Some(Bytes::from("1")), None, true)
        .unwrap();
    // No sleeping: synchronous delivery has already happened.
    assert_eq!(
        record.lock().unwrap().clone(),
        vec![("/test/w/x".to_string(), Some(Bytes::from("1")))]
    );

    ctx.engine.set("/test/w/x", None, None, true).unwrap();
    assert_eq!(record.lock().unwrap().len(), 2);
    assert_eq!(record.lock().unwrap()[1], ("/test/w/x".to_string(), None));
}

#[test]
fn deregistered_watcher_stays_quiet() {
    let ctx = Ctx::new();
    let record = Arc::new(Mutex::new(Vec::new()));
    let cb_guid = ctx.register("watchers", "/test/q/*", watch_recorder(record.clone()));

    ctx.engine
        .set("/test/q/a", Some(Bytes::from("1")), None, true)
        .unwrap();
    assert_eq!(record.lock().unwrap().len(), 1);

    ctx.deregister("watchers", &cb_guid);
    ctx.engine
        .set("/test/q/a", Some(Bytes::from("2")), None, true)
        .unwrap();
    assert_eq!(record.lock().unwrap().len(), 1);
}

#[test]
fn tree_watcher_gets_one_snapshot_per_write() {
    let ctx = Ctx::new();
    let snapshots: Arc<Mutex<Vec<TreeMsg>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = snapshots.clone();
    // Registered on an ancestor of everything written below.
    ctx.register(
        "tree-watchers",
        "/test/tw",
        Box::new(move |action| {
            if let request::Action::WatchTree(w) = action
                && let Some(root) = &w.root
            {
                sink.lock().unwrap().push(root.clone());
            }
            Response::ok(0)
        }),
    );

    let tree = TreeMsg::node(
        "/test/tw",
        vec![TreeMsg::leaf("a", "1"), TreeMsg::leaf("b", "2")],
    );
    ctx.engine.set_tree(&tree, None, true).unwrap();

    let seen = snapshots.lock().unwrap().clone();
    assert_eq!(seen.len(), 1, "one snapshot for the whole set_tree");
    let mut leaves = Vec::new();
    seen[0].for_each_leaf(&mut |p, v| leaves.push((p.to_string(), v.clone())));
    leaves.sort();
    assert_eq!(
        leaves,
        vec![
            ("/test/tw/a".to_string(), Bytes::from("1")),
            ("/test/tw/b".to_string(), Bytes::from("2")),
        ]
    );
}

// ---------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------

#[test]
fn validator_veto_blocks_the_write() {
    let ctx = Ctx::new();
    ctx.register(
        "validators",
        "/test/v/*",
        Box::new(|_| Response::error(0, apteryx_common::code::EPERM)),
    );

    assert_eq!(
        ctx.engine
            .set("/test/v/x", Some(Bytes::from("1")), None, false),
        Err(AptError::Refused)
    );
    assert_eq!(ctx.engine.get("/test/v/x").unwrap(), None);
}

#[test]
fn validator_refusal_of_delete_preserves_value() {
    let ctx = Ctx::new();
    ctx.set_ok("/test/vd/x", Some(Bytes::from("keep")));
    ctx.register(
        "validators",
        "/test/vd/*",
        Box::new(|action| {
            let request::Action::Validate(v) = action else {
                return Response::ok(0);
            };
            if v.value.is_none() {
                Response::error(0, apteryx_common::code::EPERM)
            } else {
                Response::ok(0)
            }
        }),
    );

    assert_eq!(
        ctx.engine.set("/test/vd/x", None, None, false),
        Err(AptError::Refused)
    );
    assert_eq!(ctx.engine.get("/test/vd/x").unwrap(), Some(Bytes::from("keep")));
}

#[test]
fn set_tree_validators_run_in_lexicographic_leaf_order() {
    let ctx = Ctx::new();
    let order: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = order.clone();
    ctx.register(
        "validators",
        "/test/p/*",
        Box::new(move |action| {
            if let request::Action::Validate(v) = action {
                sink.lock().unwrap().push(v.path.clone());
            }
            Response::ok(0)
        }),
    );

    // Children deliberately inserted in reverse order.
    let children: Vec<TreeMsg> = (0..10)
        .rev()
        .map(|i| TreeMsg::leaf(i.to_string(), "v"))
        .collect();
    let tree = TreeMsg::node("/test/p", children);
    ctx.engine.set_tree(&tree, None, false).unwrap();

    let expected: Vec<String> = (0..10).map(|i| format!("/test/p/{i}")).collect();
    assert_eq!(order.lock().unwrap().clone(), expected);
}

#[test]
fn refused_set_tree_applies_nothing() {
    let ctx = Ctx::new();
    ctx.register(
        "validators",
        "/test/atomic/bad",
        Box::new(|_| Response::error(0, apteryx_common::code::EPERM)),
    );

    let tree = TreeMsg::node(
        "/test/atomic",
        vec![TreeMsg::leaf("awful", "1"), TreeMsg::leaf("bad", "2")],
    );
    assert_eq!(ctx.engine.set_tree(&tree, None, false), Err(AptError::Refused));
    assert_eq!(ctx.engine.get("/test/atomic/awful").unwrap(), None);
    assert_eq!(ctx.engine.get("/test/atomic/bad").unwrap(), None);
}

#[test]
fn dead_validator_times_the_write_out() {
    let ctx = Ctx::new();
    let cb_guid = ctx.register("validators", "/test/dead/*", Box::new(|_| Response::ok(0)));
    // Forget the handler: the mock now reports the client unreachable.
    let (_, cb_ref) = guid::parse(&cb_guid).unwrap();
    ctx.rpc.handlers.lock().unwrap().remove(&cb_ref);
    ctx.rpc
        .unreachable
        .lock()
        .unwrap()
        .insert(uri::client_uri(4242));

    assert_eq!(
        ctx.engine
            .set("/test/dead/x", Some(Bytes::from("1")), None, false),
        Err(AptError::Timeout)
    );
    assert_eq!(ctx.engine.get("/test/dead/x").unwrap(), None);
}

// ---------------------------------------------------------------------
// Refreshers
// ---------------------------------------------------------------------

#[test]
fn refresher_respects_its_validity_window() {
    let ctx = Ctx::new();
    let path = "/test/interfaces/eth0/state";
    let count = Arc::new(AtomicU64::new(0));

    let engine = ctx.engine.clone();
    let calls = count.clone();
    ctx.register(
        "refreshers",
        path,
        Box::new(move |action| {
            let request::Action::Refresh(r) = action else {
                return Response::ok(0);
            };
            let n = calls.fetch_add(1, Ordering::SeqCst);
            engine
                .set(&r.path, Some(Bytes::from(n.to_string())), None, false)
                .unwrap();
            Response::with_body(0, response::Body::Validity(5_000))
        }),
    );

    assert_eq!(ctx.engine.get(path).unwrap(), Some(Bytes::from("0")));
    assert_eq!(ctx.engine.get(path).unwrap(), Some(Bytes::from("0")));
    assert_eq!(count.load(Ordering::SeqCst), 1);

    std::thread::sleep(Duration::from_millis(6));
    assert_eq!(ctx.engine.get(path).unwrap(), Some(Bytes::from("1")));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn concurrent_readers_coalesce_into_one_refresh() {
    let ctx = Ctx::new();
    let path = "/test/coalesce/state";
    let count = Arc::new(AtomicU64::new(0));

    let engine = ctx.engine.clone();
    let calls = count.clone();
    ctx.register(
        "refreshers",
        path,
        Box::new(move |action| {
            let request::Action::Refresh(r) = action else {
                return Response::ok(0);
            };
            calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            engine
                .set(&r.path, Some(Bytes::from("ready")), None, false)
                .unwrap();
            Response::with_body(0, response::Body::Validity(1_000_000))
        }),
    );

    let mut readers = Vec::new();
    for _ in 0..4 {
        let engine = ctx.engine.clone();
        readers.push(std::thread::spawn(move || engine.get(path).unwrap()));
    }
    for reader in readers {
        assert_eq!(reader.join().unwrap(), Some(Bytes::from("ready")));
    }
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------
// Providers and indexers
// ---------------------------------------------------------------------

fn provider(value: &'static str) -> Handler {
    Box::new(move |_| Response::with_body(0, response::Body::Value(Bytes::from(value))))
}

#[test]
fn indexer_and_providers_synthesise_a_subtree() {
    let ctx = Ctx::new();
    ctx.register(
        "indexers",
        "/test/c/",
        Box::new(|_| {
            Response::with_body(
                0,
                response::Body::Paths(PathList {
                    paths: vec!["/test/c/rx".into(), "/test/c/tx".into()],
                }),
            )
        }),
    );
    ctx.register("providers", "/test/c/rx", provider("100"));
    ctx.register("providers", "/test/c/tx", provider("200"));

    assert_eq!(
        ctx.engine.search("/test/c/").unwrap(),
        vec!["/test/c/rx", "/test/c/tx"]
    );
    assert_eq!(ctx.engine.get("/test/c/rx").unwrap(), Some(Bytes::from("100")));

    let tree = ctx.engine.traverse("/test/c").unwrap().expect("synthetic tree");
    let mut leaves = Vec::new();
    tree.for_each_leaf(&mut |p, v| leaves.push((p.to_string(), v.clone())));
    leaves.sort();
    assert_eq!(
        leaves,
        vec![
            ("/test/c/rx".to_string(), Bytes::from("100")),
            ("/test/c/tx".to_string(), Bytes::from("200")),
        ]
    );
}

#[test]
fn stored_value_beats_provider() {
    let ctx = Ctx::new();
    ctx.register("providers", "/test/pv/x", provider("provided"));

    assert_eq!(
        ctx.engine.get("/test/pv/x").unwrap(),
        Some(Bytes::from("provided"))
    );
    ctx.set_ok("/test/pv/x", Some(Bytes::from("stored")));
    assert_eq!(
        ctx.engine.get("/test/pv/x").unwrap(),
        Some(Bytes::from("stored"))
    );
    ctx.set_ok("/test/pv/x", None);
    assert_eq!(
        ctx.engine.get("/test/pv/x").unwrap(),
        Some(Bytes::from("provided"))
    );
}

#[test]
fn wildcard_provider_needs_an_indexer_to_be_searchable() {
    let ctx = Ctx::new();
    ctx.register("providers", "/test/wp/*", provider("42"));

    // The concrete key still reads through.
    assert_eq!(ctx.engine.get("/test/wp/key").unwrap(), Some(Bytes::from("42")));
    // But the wildcard does not extend the search namespace.
    assert!(ctx.engine.search("/test/wp/").unwrap().is_empty());
}

#[test]
fn search_merges_store_and_index() {
    let ctx = Ctx::new();
    ctx.set_ok("/test/m/stored", Some(Bytes::from("1")));
    ctx.register(
        "indexers",
        "/test/m/",
        Box::new(|_| {
            Response::with_body(
                0,
                response::Body::Paths(PathList {
                    paths: vec!["/test/m/indexed".into(), "/test/m/stored".into()],
                }),
            )
        }),
    );

    assert_eq!(
        ctx.engine.search("/test/m/").unwrap(),
        vec!["/test/m/indexed", "/test/m/stored"]
    );
}

// ---------------------------------------------------------------------
// Query and find
// ---------------------------------------------------------------------

fn populate_interfaces(ctx: &Ctx) {
    ctx.set_ok("/test/i/eth0/state", Some(Bytes::from("up")));
    ctx.set_ok("/test/i/eth0/speed", Some(Bytes::from("1000")));
    ctx.set_ok("/test/i/eth1/state", Some(Bytes::from("down")));
    ctx.set_ok("/test/i/eth2/state", Some(Bytes::from("up")));
}

#[test]
fn query_projects_the_template() {
    let ctx = Ctx::new();
    populate_interfaces(&ctx);

    let template = TreeMsg::node(
        "/test/i",
        vec![TreeMsg::node(
            "*",
            vec![TreeMsg::node("state", Vec::new())],
        )],
    );
    let result = ctx.engine.query(&template).unwrap().expect("matches");
    assert_eq!(result.name, "/test/i");

    let mut leaves = Vec::new();
    result.for_each_leaf(&mut |p, v| leaves.push((p.to_string(), v.clone())));
    leaves.sort();
    assert_eq!(
        leaves,
        vec![
            ("/test/i/eth0/state".to_string(), Bytes::from("up")),
            ("/test/i/eth1/state".to_string(), Bytes::from("down")),
            ("/test/i/eth2/state".to_string(), Bytes::from("up")),
        ]
    );

    // Missing values are omitted, empty projections collapse to none.
    let template = TreeMsg::node(
        "/test/i",
        vec![TreeMsg::node("eth9", vec![TreeMsg::node("state", Vec::new())])],
    );
    assert!(ctx.engine.query(&template).unwrap().is_none());
}

#[test]
fn find_matches_leaf_values() {
    let ctx = Ctx::new();
    populate_interfaces(&ctx);

    assert_eq!(
        ctx.engine.find("/test/i/*/state", b"up").unwrap(),
        vec!["/test/i/eth0/state", "/test/i/eth2/state"]
    );
    assert!(ctx.engine.find("/test/i/*/state", b"absent").unwrap().is_empty());

    // The empty value only matches explicitly empty leaves.
    ctx.set_ok("/test/i/eth3/state", Some(Bytes::new()));
    assert_eq!(
        ctx.engine.find("/test/i/*/state", b"").unwrap(),
        vec!["/test/i/eth3/state"]
    );
}

#[test]
fn find_tree_ands_the_constraints() {
    let ctx = Ctx::new();
    populate_interfaces(&ctx);

    let template = TreeMsg {
        name: "/test/i/*".into(),
        value: None,
        children: vec![
            TreeMsg::leaf("state", "up"),
            TreeMsg::leaf("speed", "1000"),
        ],
    };
    assert_eq!(ctx.engine.find_tree(&template).unwrap(), vec!["/test/i/eth0"]);
}

// ---------------------------------------------------------------------
// Proxies
// ---------------------------------------------------------------------

const REMOTE_URI: &str = "tcp://127.0.0.1:9999";

impl Ctx {
    fn register_proxy(&self, pattern: &str, remote_uri: &str) -> String {
        let cb_ref = self.next_ref.fetch_add(1, Ordering::Relaxed);
        let cb_guid = guid::make(4242, cb_ref, pattern);
        self.set_ok(
            &format!("/apteryx/proxies/{cb_guid}"),
            Some(Bytes::from(format!("{remote_uri}:{pattern}"))),
        );
        cb_guid
    }
}

#[test]
fn proxy_forwards_reads_and_writes_with_the_prefix_stripped() {
    let ctx = Ctx::new();
    let remote = Arc::new(Engine::new(ctx.rpc.clone()));
    ctx.rpc
        .remotes
        .lock()
        .unwrap()
        .insert(REMOTE_URI.to_string(), remote.clone());
    ctx.register_proxy("/test/remote/*", REMOTE_URI);

    ctx.set_ok("/test/remote/test/local", Some(Bytes::from("test")));
    // The write landed remotely, at the path minus the proxy prefix.
    assert_eq!(
        remote.get("/test/local").unwrap(),
        Some(Bytes::from("test"))
    );

    assert_eq!(
        ctx.engine.get("/test/remote/test/local").unwrap(),
        Some(Bytes::from("test"))
    );

    // Search results come back re-prefixed into the local namespace.
    assert_eq!(
        ctx.engine.search("/test/remote/test/").unwrap(),
        vec!["/test/remote/test/local"]
    );

    // Timestamps are the remote's.
    let remote_ts = remote.timestamp("/test/local").unwrap();
    assert_eq!(
        ctx.engine.timestamp("/test/remote/test/local").unwrap(),
        remote_ts
    );

    ctx.engine.prune("/test/remote/test").unwrap();
    assert_eq!(remote.get("/test/local").unwrap(), None);
}

#[test]
fn unreachable_proxy_reads_fall_through_to_the_local_store() {
    let ctx = Ctx::new();
    ctx.rpc
        .unreachable
        .lock()
        .unwrap()
        .insert(REMOTE_URI.to_string());
    ctx.register_proxy("/test/remote/*", REMOTE_URI);
    ctx.set_ok("/test/local", Some(Bytes::from("test")));

    assert_eq!(ctx.engine.get("/test/remote/test/local").unwrap(), None);
}

#[test]
fn remote_validator_refusal_propagates_through_the_proxy() {
    let local = Ctx::new();
    let remote = Ctx::new();
    local
        .rpc
        .remotes
        .lock()
        .unwrap()
        .insert(REMOTE_URI.to_string(), remote.engine.clone());
    local.register_proxy("/test/remote/*", REMOTE_URI);

    // The validator lives on the remote instance.
    remote.register(
        "validators",
        "/test/local",
        Box::new(|_| Response::error(0, apteryx_common::code::EPERM)),
    );

    assert_eq!(
        local
            .engine
            .set("/test/remote/test/local", Some(Bytes::from("x")), None, false),
        Err(AptError::Refused)
    );
    assert_eq!(remote.engine.get("/test/local").unwrap(), None);
}

// ---------------------------------------------------------------------
// Configuration subtree observability
// ---------------------------------------------------------------------

#[test]
fn counters_are_provided_leaves() {
    let ctx = Ctx::new();
    ctx.set_ok("/test/counted", Some(Bytes::from("1")));

    let names = ctx.engine.search("/apteryx/counters/").unwrap();
    assert!(names.contains(&"/apteryx/counters/set".to_string()));

    let sets: u64 = ctx
        .engine
        .get("/apteryx/counters/set")
        .unwrap()
        .map(|v| String::from_utf8_lossy(&v).parse().unwrap())
        .unwrap();
    assert!(sets >= 1);
}

#[test]
fn statistics_snapshot_callback_latencies() {
    let ctx = Ctx::new();
    let cb_guid = ctx.register("watchers", "/test/s/*", watch_recorder(Default::default()));
    ctx.engine
        .set("/test/s/x", Some(Bytes::from("1")), None, true)
        .unwrap();

    // Reading the statistics subtree triggers the internal refresher that
    // rebuilds it from every registry.
    let tree = ctx
        .engine
        .traverse("/apteryx/statistics")
        .unwrap()
        .expect("statistics tree");
    let wanted = format!("/apteryx/statistics/watchers/{cb_guid}");
    let mut stats = None;
    tree.for_each_leaf(&mut |p, v| {
        if p == wanted {
            stats = Some(v.clone());
        }
    });
    let text = String::from_utf8(stats.expect("statistics leaf").to_vec()).unwrap();
    let fields: Vec<&str> = text.split(',').collect();
    assert_eq!(fields.len(), 4, "count,min,avg,max: {text}");
    let count: u64 = fields[0].parse().unwrap();
    assert!(count >= 1);
}
