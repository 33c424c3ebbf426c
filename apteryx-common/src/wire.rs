//! Protobuf messages for the Apteryx RPC protocol.
//!
//! The messages are written out by hand with `prost` derives rather than
//! generated from a `.proto` file; the encoding on the wire is ordinary
//! protobuf either way. `Request` travels client-to-daemon for store
//! operations and daemon-to-client for callback invocations (the variants
//! carrying a `r#ref` field); `Response` travels the opposite way.

use bytes::Bytes;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// Correlates a response with its request on a pipelined connection.
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(
        oneof = "request::Action",
        tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18"
    )]
    pub action: Option<request::Action>,
}

pub mod request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Action {
        #[prost(message, tag = "2")]
        Set(super::SetRequest),
        #[prost(message, tag = "3")]
        SetTree(super::SetTreeRequest),
        #[prost(message, tag = "4")]
        Get(super::GetRequest),
        #[prost(message, tag = "5")]
        Search(super::SearchRequest),
        #[prost(message, tag = "6")]
        Traverse(super::TraverseRequest),
        #[prost(message, tag = "7")]
        Query(super::QueryRequest),
        #[prost(message, tag = "8")]
        Find(super::FindRequest),
        #[prost(message, tag = "9")]
        FindTree(super::FindTreeRequest),
        #[prost(message, tag = "10")]
        Prune(super::PruneRequest),
        #[prost(message, tag = "11")]
        Timestamp(super::TimestampRequest),
        #[prost(message, tag = "12")]
        Memuse(super::MemuseRequest),
        // Callback invocations, daemon to client.
        #[prost(message, tag = "13")]
        Watch(super::WatchRequest),
        #[prost(message, tag = "14")]
        WatchTree(super::WatchTreeRequest),
        #[prost(message, tag = "15")]
        Validate(super::ValidateRequest),
        #[prost(message, tag = "16")]
        Refresh(super::RefreshRequest),
        #[prost(message, tag = "17")]
        Provide(super::ProvideRequest),
        #[prost(message, tag = "18")]
        Index(super::IndexRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetRequest {
    #[prost(string, tag = "1")]
    pub path: String,
    /// Absent value deletes the leaf.
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub value: Option<Bytes>,
    /// Compare-and-swap: expected `timestamp(path)` at commit time.
    #[prost(uint64, optional, tag = "3")]
    pub expect_ts: Option<u64>,
    /// Block until every matching watcher has been delivered.
    #[prost(bool, tag = "4")]
    pub wait: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTreeRequest {
    #[prost(message, optional, tag = "1")]
    pub root: Option<TreeMsg>,
    #[prost(uint64, optional, tag = "2")]
    pub expect_ts: Option<u64>,
    #[prost(bool, tag = "3")]
    pub wait: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SearchRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraverseRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryRequest {
    #[prost(message, optional, tag = "1")]
    pub root: Option<TreeMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindRequest {
    /// Pattern path; `*` segments are expanded.
    #[prost(string, tag = "1")]
    pub path: String,
    /// Required leaf value; empty matches only explicitly empty values.
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FindTreeRequest {
    #[prost(message, optional, tag = "1")]
    pub root: Option<TreeMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PruneRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimestampRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemuseRequest {
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchRequest {
    /// The client-side handler this invocation is for.
    #[prost(uint64, tag = "1")]
    pub r#ref: u64,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub value: Option<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WatchTreeRequest {
    #[prost(uint64, tag = "1")]
    pub r#ref: u64,
    #[prost(message, optional, tag = "2")]
    pub root: Option<TreeMsg>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateRequest {
    #[prost(uint64, tag = "1")]
    pub r#ref: u64,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(bytes = "bytes", optional, tag = "3")]
    pub value: Option<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RefreshRequest {
    #[prost(uint64, tag = "1")]
    pub r#ref: u64,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProvideRequest {
    #[prost(uint64, tag = "1")]
    pub r#ref: u64,
    #[prost(string, tag = "2")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexRequest {
    #[prost(uint64, tag = "1")]
    pub r#ref: u64,
    /// Search path, always slash-terminated.
    #[prost(string, tag = "2")]
    pub path: String,
}

/// A serialised subtree: `set_tree` input, `get_tree`/`query` output and
/// tree-watcher delivery. The root's `name` is an absolute path; every other
/// node's `name` is a single segment.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TreeMsg {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(bytes = "bytes", optional, tag = "2")]
    pub value: Option<Bytes>,
    #[prost(message, repeated, tag = "3")]
    pub children: Vec<TreeMsg>,
}

impl TreeMsg {
    pub fn leaf(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        TreeMsg {
            name: name.into(),
            value: Some(value.into()),
            children: Vec::new(),
        }
    }

    pub fn node(name: impl Into<String>, children: Vec<TreeMsg>) -> Self {
        TreeMsg {
            name: name.into(),
            value: None,
            children,
        }
    }

    /// Depth-first visit of `(path, value)` for every node carrying a value.
    /// `base` joins the root name unless the root name is already absolute.
    pub fn for_each_leaf<F: FnMut(&str, &Bytes)>(&self, f: &mut F) {
        fn walk<F: FnMut(&str, &Bytes)>(node: &TreeMsg, prefix: &str, f: &mut F) {
            let path = if prefix == "/" {
                format!("/{}", node.name)
            } else if node.name.starts_with('/') {
                node.name.clone()
            } else {
                format!("{}/{}", prefix, node.name)
            };
            if let Some(value) = &node.value {
                f(&path, value);
            }
            for child in &node.children {
                walk(child, &path, f);
            }
        }
        if self.name.is_empty() || self.name == "/" {
            for child in &self.children {
                walk(child, "/", f);
            }
            if let Some(value) = &self.value {
                f("/", value);
            }
        } else {
            walk(self, "", f);
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// 0 on success, a negated errno otherwise (see [`crate::code`]).
    #[prost(sint32, tag = "2")]
    pub status: i32,
    #[prost(oneof = "response::Body", tags = "3, 4, 5, 6, 7")]
    pub body: Option<response::Body>,
}

pub mod response {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(bytes = "bytes", tag = "3")]
        Value(Bytes),
        #[prost(message, tag = "4")]
        Paths(super::PathList),
        #[prost(message, tag = "5")]
        Tree(super::TreeMsg),
        #[prost(uint64, tag = "6")]
        Timestamp(u64),
        /// Refresher result: validity interval in microseconds.
        #[prost(uint64, tag = "7")]
        Validity(u64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PathList {
    #[prost(string, repeated, tag = "1")]
    pub paths: Vec<String>,
}

impl Response {
    pub fn ok(id: u64) -> Self {
        Response {
            id,
            status: 0,
            body: None,
        }
    }

    pub fn error(id: u64, status: i32) -> Self {
        Response {
            id,
            status,
            body: None,
        }
    }

    pub fn with_body(id: u64, body: response::Body) -> Self {
        Response {
            id,
            status: 0,
            body: Some(body),
        }
    }
}
