// src/router.rs
//
// Radix-tree route store with a hashed fast path for fully-static routes.
// Patterns support literal segments, `:name` parameters (one segment), and
// a trailing `*name` catch-all. Registration happens before the server
// starts; lookups after that are lock-free.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::Context;
use crate::http::Method;

/// Upper bound on bindings a single route can produce.
pub const MAX_ROUTE_PARAMS: usize = 16;

/// A route handler. Closures over `&mut Context` implement this blanket.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: &mut Context);
}

impl<F> Handler for F
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    fn handle(&self, ctx: &mut Context) {
        self(ctx)
    }
}

pub type ArcHandler = Arc<dyn Handler>;

/// Parameter bindings produced by a lookup. Keys borrow the router's node
/// storage, values borrow the request path.
pub struct Params<'k, 'v> {
    entries: [(&'k str, &'v str); MAX_ROUTE_PARAMS],
    len: usize,
}

impl<'k, 'v> Params<'k, 'v> {
    pub fn new() -> Self {
        Self {
            entries: [("", ""); MAX_ROUTE_PARAMS],
            len: 0,
        }
    }

    fn push(&mut self, key: &'k str, value: &'v str) {
        if self.len < MAX_ROUTE_PARAMS {
            self.entries[self.len] = (key, value);
            self.len += 1;
        }
    }

    pub fn get(&self, key: &str) -> Option<&'v str> {
        self.entries[..self.len]
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'k str, &'v str)> + '_ {
        self.entries[..self.len].iter().copied()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<'k, 'v> Default for Params<'k, 'v> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Static,
    Param,
    CatchAll,
}

struct Node {
    path: String,
    // First byte of each static child, aligned with the static prefix of
    // `children`. Wildcard children always sit at the tail.
    indices: Vec<u8>,
    children: Vec<Node>,
    handlers: HashMap<Method, ArcHandler>,
    kind: NodeKind,
    param_name: String,
    priority: u32,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            path: String::new(),
            indices: Vec::new(),
            children: Vec::new(),
            handlers: HashMap::new(),
            kind: NodeKind::Static,
            param_name: String::new(),
            priority: 0,
        }
    }
}

impl Node {
    fn has_wildcard_child(&self) -> bool {
        self.children
            .last()
            .map_or(false, |c| c.kind != NodeKind::Static)
    }

    fn wildcard_child(&self) -> Option<&Node> {
        self.children.last().filter(|c| c.kind != NodeKind::Static)
    }

    /// Fill an empty node (and descendants) from `path`, which may contain
    /// wildcards.
    fn insert_child(&mut self, method: Method, path: &str, handler: ArcHandler) {
        let (start, wc_len, valid) = match find_wildcard(path) {
            None => {
                self.path = path.to_string();
                self.handlers.insert(method, handler);
                return;
            }
            Some(w) => w,
        };

        if !valid {
            panic!("only one wildcard per path segment is allowed in '{}'", path);
        }
        let wildcard = &path[start..start + wc_len];
        if wildcard.len() < 2 {
            panic!("wildcards must be named in '{}'", path);
        }

        if wildcard.as_bytes()[0] == b':' {
            // Literal prefix before the parameter stays on this node.
            if start > 0 {
                self.path = path[..start].to_string();
            }

            let mut child = Node {
                kind: NodeKind::Param,
                path: wildcard.to_string(),
                param_name: wildcard[1..].to_string(),
                priority: 1,
                ..Default::default()
            };

            let rest = &path[start + wc_len..];
            if rest.is_empty() {
                child.handlers.insert(method, handler);
            } else {
                // Parameter in the middle: the remainder starts with '/'.
                let mut grandchild = Node {
                    priority: 1,
                    ..Default::default()
                };
                grandchild.insert_child(method, rest, handler);
                child.children.push(grandchild);
            }
            self.add_wildcard_child(child);
        } else {
            // Catch-all terminates the pattern and must follow a '/'.
            if start + wc_len != path.len() {
                panic!(
                    "catch-all routes are only allowed at the end of the path ('{}')",
                    path
                );
            }
            if start == 0 || path.as_bytes()[start - 1] != b'/' {
                panic!("no '/' before catch-all in '{}'", path);
            }

            if start > 0 {
                self.path = path[..start].to_string();
            }
            let mut child = Node {
                kind: NodeKind::CatchAll,
                path: wildcard.to_string(),
                param_name: wildcard[1..].to_string(),
                priority: 1,
                ..Default::default()
            };
            child.handlers.insert(method, handler);
            self.add_wildcard_child(child);
        }
    }

    fn add_wildcard_child(&mut self, child: Node) {
        if self.has_wildcard_child() {
            panic!(
                "wildcard '{}' conflicts with an existing wildcard child",
                child.path
            );
        }
        self.children.push(child);
    }

    fn add_route(&mut self, method: Method, path: &str, handler: ArcHandler) {
        let i = longest_common_prefix(path, &self.path);

        // Shared prefix shorter than this node: split the edge. The suffix
        // child takes everything this node held.
        if i < self.path.len() {
            let suffix = self.path[i..].to_string();
            let prefix = self.path[..i].to_string();
            let split_byte = suffix.as_bytes()[0];

            let child = Node {
                path: suffix,
                indices: std::mem::take(&mut self.indices),
                children: std::mem::take(&mut self.children),
                handlers: std::mem::take(&mut self.handlers),
                kind: self.kind,
                param_name: std::mem::take(&mut self.param_name),
                priority: self.priority.saturating_sub(1),
            };

            self.indices = vec![split_byte];
            self.children.push(child);
            self.path = prefix;
            self.kind = NodeKind::Static;
        }

        if i == path.len() {
            self.handlers.insert(method, handler);
            return;
        }

        let rest = &path[i..];

        // Continuing past a parameter node: remainder lives in its single
        // suffix child.
        if self.kind == NodeKind::Param {
            if !rest.starts_with('/') {
                panic!(
                    "route '{}' conflicts with parameter segment ':{}'",
                    rest, self.param_name
                );
            }
            if self.children.is_empty() {
                let mut child = Node {
                    priority: 1,
                    ..Default::default()
                };
                child.insert_child(method, rest, handler);
                self.children.push(child);
                return;
            }
            self.priority += 1;
            self.children[0].add_route(method, rest, handler);
            return;
        }

        let c = rest.as_bytes()[0];

        if c == b':' || c == b'*' {
            let wc_text = wildcard_text(rest);
            let existing = self
                .children
                .last()
                .filter(|child| child.kind != NodeKind::Static)
                .map(|child| child.path.clone());

            match existing {
                Some(ref p) if p.as_str() == wc_text => {
                    self.priority += 1;
                    let last = self.children.len() - 1;
                    self.children[last].add_route(method, rest, handler);
                }
                Some(p) => panic!(
                    "wildcard '{}' conflicts with existing wildcard '{}'",
                    wc_text, p
                ),
                None => self.insert_child(method, rest, handler),
            }
            return;
        }

        // Static continuation: descend by first byte, or grow a new child
        // slotted in front of any wildcard tail.
        if let Some(pos) = self.indices.iter().position(|&b| b == c) {
            self.priority += 1;
            self.children[pos].add_route(method, rest, handler);
            return;
        }

        let pos = self.indices.len();
        self.indices.push(c);
        self.children.insert(pos, Node::default());
        self.priority += 1;
        self.children[pos].insert_child(method, rest, handler);
    }

    fn get_value<'n, 'p>(
        &'n self,
        method: Method,
        mut path: &'p str,
        params: &mut Params<'n, 'p>,
    ) -> Option<&'n ArcHandler> {
        let mut n = self;

        loop {
            let prefix = n.path.as_str();

            if path.len() > prefix.len() {
                if !path.starts_with(prefix) {
                    return None;
                }
                path = &path[prefix.len()..];

                // Static children first: exact match outranks wildcards.
                let c = path.as_bytes()[0];
                if let Some(pos) = n.indices.iter().position(|&b| b == c) {
                    n = &n.children[pos];
                    continue;
                }

                let wc = n.wildcard_child()?;
                match wc.kind {
                    NodeKind::Param => {
                        // Consume up to the next '/' or the end.
                        let end = path
                            .bytes()
                            .position(|b| b == b'/')
                            .unwrap_or(path.len());
                        params.push(&wc.param_name, &path[..end]);

                        if end < path.len() {
                            if wc.children.is_empty() {
                                return None;
                            }
                            path = &path[end..];
                            n = &wc.children[0];
                            continue;
                        }
                        return wc.handlers.get(&method);
                    }
                    NodeKind::CatchAll => {
                        params.push(&wc.param_name, path);
                        return wc.handlers.get(&method);
                    }
                    NodeKind::Static => unreachable!("static node in wildcard slot"),
                }
            }

            if path == prefix {
                return n.handlers.get(&method);
            }
            return None;
        }
    }
}

/// Route store: a hash front for static routes plus radix trees for
/// parameterized ones, with per-method handler maps at the leaves.
pub struct Router {
    static_routes: HashMap<Method, HashMap<String, ArcHandler>>,
    root: Node,
    route_count: usize,
}

impl Router {
    pub fn new() -> Self {
        Self {
            static_routes: HashMap::new(),
            root: Node::default(),
            route_count: 0,
        }
    }

    /// Register a route. Panics on a malformed pattern; routes are wired at
    /// startup and a bad pattern is a programming error.
    pub fn add(&mut self, method: Method, path: &str, handler: ArcHandler) {
        if !path.starts_with('/') {
            panic!("path must begin with '/': '{}'", path);
        }

        self.route_count += 1;

        // Fully-static routes take the O(1) hash path.
        if !path.contains(':') && !path.contains('*') {
            self.static_routes
                .entry(method)
                .or_default()
                .insert(path.to_string(), handler);
            return;
        }

        if self.root.path.is_empty()
            && self.root.children.is_empty()
            && self.root.handlers.is_empty()
        {
            self.root.insert_child(method, path, handler);
            return;
        }
        self.root.add_route(method, path, handler);
    }

    /// Resolve a handler for `(method, path)`, binding wildcards into
    /// `params`. Method misses and path misses are both `None`.
    pub fn find<'r, 'p>(
        &'r self,
        method: Method,
        path: &'p str,
        params: &mut Params<'r, 'p>,
    ) -> Option<&'r ArcHandler> {
        if let Some(by_path) = self.static_routes.get(&method) {
            if let Some(handler) = by_path.get(path) {
                return Some(handler);
            }
        }

        if self.root.path.is_empty() && self.root.children.is_empty() {
            return None;
        }
        self.root.get_value(method, path, params)
    }

    pub fn route_count(&self) -> usize {
        self.route_count
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn longest_common_prefix(a: &str, b: &str) -> usize {
    a.bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

/// The wildcard token opening `path`: `:name` up to the next '/', or the
/// whole remainder for `*name`.
fn wildcard_text(path: &str) -> &str {
    if path.as_bytes()[0] == b'*' {
        return path;
    }
    match path.bytes().position(|b| b == b'/') {
        Some(end) => &path[..end],
        None => path,
    }
}

/// Locate the first wildcard in `path`: (start, length, valid). Invalid
/// means a second wildcard opener appears inside the same segment.
fn find_wildcard(path: &str) -> Option<(usize, usize, bool)> {
    let bytes = path.as_bytes();
    for (start, &c) in bytes.iter().enumerate() {
        if c != b':' && c != b'*' {
            continue;
        }

        let mut valid = true;
        for (off, &c2) in bytes[start + 1..].iter().enumerate() {
            match c2 {
                b'/' => return Some((start, 1 + off, valid)),
                b':' | b'*' => valid = false,
                _ => {}
            }
        }
        return Some((start, bytes.len() - start, valid));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn handler(id: usize, hits: &Arc<AtomicUsize>) -> ArcHandler {
        let hits = Arc::clone(hits);
        Arc::new(move |_ctx: &mut Context| {
            hits.store(id, Ordering::SeqCst);
        })
    }

    fn noop() -> ArcHandler {
        Arc::new(|_ctx: &mut Context| {})
    }

    fn lookup<'r>(router: &'r Router, method: Method, path: &str) -> Option<Vec<(String, String)>> {
        let mut params = Params::new();
        router.find(method, path, &mut params)?;
        Some(
            params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_static_routes() {
        let mut router = Router::new();
        router.add(Method::Get, "/hello/world", noop());

        assert!(lookup(&router, Method::Get, "/hello/world").is_some());
        assert!(lookup(&router, Method::Get, "/hello").is_none());
        assert!(lookup(&router, Method::Post, "/hello/world").is_none());
    }

    #[test]
    fn test_param_routes() {
        let mut router = Router::new();
        router.add(Method::Get, "/users/:id", noop());
        router.add(Method::Post, "/users/:id/posts/:post_id", noop());

        let params = lookup(&router, Method::Get, "/users/123").unwrap();
        assert_eq!(params, vec![("id".to_string(), "123".to_string())]);

        let params = lookup(&router, Method::Post, "/users/123/posts/abc").unwrap();
        assert_eq!(
            params,
            vec![
                ("id".to_string(), "123".to_string()),
                ("post_id".to_string(), "abc".to_string())
            ]
        );

        assert!(lookup(&router, Method::Get, "/users/123/posts/abc").is_none());
    }

    #[test]
    fn test_catch_all_binds_remainder() {
        let mut router = Router::new();
        router.add(Method::Get, "/static/*path", noop());

        let params = lookup(&router, Method::Get, "/static/js/app.js").unwrap();
        assert_eq!(params, vec![("path".to_string(), "js/app.js".to_string())]);

        let params = lookup(&router, Method::Get, "/static/a/b/c").unwrap();
        assert_eq!(params, vec![("path".to_string(), "a/b/c".to_string())]);
    }

    #[test]
    fn test_edge_split_keeps_both_routes() {
        let mut router = Router::new();
        router.add(Method::Get, "/api/users/:id", noop());
        router.add(Method::Get, "/api/user-agent/:id", noop());
        router.add(Method::Get, "/api/users/:id/settings", noop());

        assert!(lookup(&router, Method::Get, "/api/users/7").is_some());
        assert!(lookup(&router, Method::Get, "/api/user-agent/9").is_some());
        let params = lookup(&router, Method::Get, "/api/users/7/settings").unwrap();
        assert_eq!(params, vec![("id".to_string(), "7".to_string())]);
    }

    #[test]
    fn test_static_outranks_param() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.add(Method::Get, "/files/:name", handler(1, &hits));
        router.add(Method::Get, "/files/readme", handler(2, &hits));

        let mut params = Params::new();
        let h = router
            .find(Method::Get, "/files/readme", &mut params)
            .unwrap();
        let mut ctx = Context::new();
        h.handle(&mut ctx);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(params.is_empty());

        let h = router.find(Method::Get, "/files/other", &mut params).unwrap();
        h.handle(&mut ctx);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(params.get("name"), Some("other"));
    }

    #[test]
    fn test_handler_identity_preserved() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.add(Method::Get, "/ping", handler(42, &hits));

        let mut params = Params::new();
        let h = router.find(Method::Get, "/ping", &mut params).unwrap();
        let mut ctx = Context::new();
        h.handle(&mut ctx);
        assert_eq!(hits.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_method_dispatch_at_same_path() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut router = Router::new();
        router.add(Method::Get, "/res/:id", handler(1, &hits));
        router.add(Method::Delete, "/res/:id", handler(2, &hits));

        let mut params = Params::new();
        let h = router.find(Method::Delete, "/res/5", &mut params).unwrap();
        let mut ctx = Context::new();
        h.handle(&mut ctx);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_root_route() {
        let mut router = Router::new();
        router.add(Method::Get, "/", noop());
        assert!(lookup(&router, Method::Get, "/").is_some());
        assert!(lookup(&router, Method::Get, "/missing").is_none());
    }

    #[test]
    #[should_panic(expected = "path must begin with '/'")]
    fn test_rejects_relative_pattern() {
        let mut router = Router::new();
        router.add(Method::Get, "no-slash", noop());
    }

    #[test]
    #[should_panic(expected = "only one wildcard per path segment")]
    fn test_rejects_double_wildcard_segment() {
        let mut router = Router::new();
        router.add(Method::Get, "/bad/:a:b", noop());
    }

    #[test]
    #[should_panic(expected = "catch-all routes are only allowed at the end")]
    fn test_rejects_catch_all_midway() {
        let mut router = Router::new();
        router.add(Method::Get, "/bad/*rest/more", noop());
    }

    #[test]
    #[should_panic(expected = "wildcards must be named")]
    fn test_rejects_unnamed_wildcard() {
        let mut router = Router::new();
        router.add(Method::Get, "/bad/:", noop());
    }

    #[test]
    fn test_param_not_matching_deeper_path() {
        let mut router = Router::new();
        router.add(Method::Get, "/one/:id", noop());
        assert!(lookup(&router, Method::Get, "/one/a/b").is_none());
    }
}
