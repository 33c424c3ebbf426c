//! Wire request execution: one function mapping a decoded [`Request`] onto
//! the engine and producing the [`Response`] to send back. The daemon's
//! workers call this for every inbound frame.

use apteryx_common::code;
use apteryx_common::error::AptError;
use apteryx_common::wire::{PathList, Request, Response, request, response};

use crate::engine::Engine;

pub fn execute(engine: &Engine, request: Request) -> Response {
    let id = request.id;
    let Some(action) = request.action else {
        return Response::error(id, code::EINVAL);
    };
    match action {
        request::Action::Set(req) => {
            status_only(id, engine.set(&req.path, req.value, req.expect_ts, req.wait))
        }
        request::Action::SetTree(req) => match req.root {
            Some(root) => status_only(id, engine.set_tree(&root, req.expect_ts, req.wait)),
            None => Response::error(id, code::EINVAL),
        },
        request::Action::Get(req) => match engine.get(&req.path) {
            Ok(Some(value)) => Response::with_body(id, response::Body::Value(value)),
            Ok(None) => Response::ok(id),
            Err(e) => Response::error(id, e.code()),
        },
        request::Action::Search(req) => paths(id, engine.search(&req.path)),
        request::Action::Traverse(req) => match engine.traverse(&req.path) {
            Ok(Some(tree)) => Response::with_body(id, response::Body::Tree(tree)),
            Ok(None) => Response::ok(id),
            Err(e) => Response::error(id, e.code()),
        },
        request::Action::Query(req) => match req.root.map(|root| engine.query(&root)) {
            Some(Ok(Some(tree))) => Response::with_body(id, response::Body::Tree(tree)),
            Some(Ok(None)) => Response::ok(id),
            Some(Err(e)) => Response::error(id, e.code()),
            None => Response::error(id, code::EINVAL),
        },
        request::Action::Find(req) => paths(id, engine.find(&req.path, &req.value)),
        request::Action::FindTree(req) => match req.root {
            Some(root) => paths(id, engine.find_tree(&root)),
            None => Response::error(id, code::EINVAL),
        },
        request::Action::Prune(req) => status_only(id, engine.prune(&req.path)),
        request::Action::Timestamp(req) => match engine.timestamp(&req.path) {
            Ok(ts) => Response::with_body(id, response::Body::Timestamp(ts)),
            Err(e) => Response::error(id, e.code()),
        },
        request::Action::Memuse(req) => match engine.memuse(&req.path) {
            Ok(bytes) => Response::with_body(id, response::Body::Timestamp(bytes)),
            Err(e) => Response::error(id, e.code()),
        },
        // Callback invocations only ever travel daemon-to-client.
        request::Action::Watch(_)
        | request::Action::WatchTree(_)
        | request::Action::Validate(_)
        | request::Action::Refresh(_)
        | request::Action::Provide(_)
        | request::Action::Index(_) => Response::error(id, code::EINVAL),
    }
}

fn status_only(id: u64, result: Result<(), AptError>) -> Response {
    match result {
        Ok(()) => Response::ok(id),
        Err(e) => Response::error(id, e.code()),
    }
}

fn paths(id: u64, result: Result<Vec<String>, AptError>) -> Response {
    match result {
        Ok(paths) => Response::with_body(id, response::Body::Paths(PathList { paths })),
        Err(e) => Response::error(id, e.code()),
    }
}
