//! The node runtime: shared state, request dispatch and the input loop.
//!
//! A [`Node`] is built with a [`NodeBuilder`], which validates the handler set before any input is read. Running a
//! node spawns the outbox writer, then reads the input stream one line at a time. Each line waits for a slot in the
//! [`WorkerPool`] and is then dispatched on its own task, so a saturated pool pauses the reader. A task keeps its
//! slot until its reply is queued on the bounded outbox, so a stalled output stream pauses the reader too.
//!
//! Dispatch of a single line moves through four states and never retries:
//!
//! 1. **addressing-checked**: once the node id is known, a line addressed elsewhere gets a `Malformed` error.
//! 2. **type-resolved**: the probed `type` must have a registered handler, otherwise `NotSupported`.
//! 3. **executing**: a fresh outgoing `msg_id` is issued and the handler runs.
//! 4. **replied**: the handler's payload, error or silence is the line's single outcome.
//!
//! [`WorkerPool`]: crate::pool::WorkerPool

use std::{
    borrow::Cow,
    io, mem,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
};

use futures::FutureExt;
use once_cell::sync::OnceCell;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, error, trace, warn};

use crate::{
    codec::{self, Decoded},
    config::Config,
    error::{ErrorCode, NodeError, PanicError, RegistryError},
    gossip::Gossip,
    handlers,
    id::IdGenerator,
    message::{Body, Envelope, Payload, Topology},
    outbox::{self, Outbox, OutboxReceiver},
    pool::WorkerPool,
    registry::{Handler, HandlerRegistry},
};

/// State shared by every handler invocation on a node.
#[derive(Debug)]
pub struct NodeState {
    id: OnceCell<String>,
    node_ids: RwLock<Vec<String>>,
    ids: IdGenerator,
    gossip: Gossip,
    outbox: Outbox,
}

impl NodeState {
    /// Creates uninitialised node state sending on `outbox`, with outgoing ids starting at `first_msg_id`.
    pub fn new(first_msg_id: u64, outbox: Outbox) -> Self {
        NodeState {
            id: OnceCell::new(),
            node_ids: RwLock::new(Vec::new()),
            ids: IdGenerator::starting_at(first_msg_id),
            gossip: Gossip::new(),
            outbox,
        }
    }

    /// This node's id, once assigned by `init`.
    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    /// Assigns this node's id and the cluster membership.
    ///
    /// Only the first call has any effect. Returns `true` if this call assigned the id. A topology applied before
    /// this point now selects the node's neighbours.
    pub fn init(&self, node_id: String, node_ids: Vec<String>) -> bool {
        if self.id.set(node_id).is_err() {
            return false;
        }
        *self.node_ids.write().unwrap_or_else(PoisonError::into_inner) = node_ids;
        if let Some(id) = self.id() {
            self.gossip.select_neighbours(id);
        }
        true
    }

    /// Applies a topology update, selecting this node's neighbours from it once the node id is known.
    pub fn apply_topology(&self, topology: Topology) {
        let id = self.id();
        self.gossip.apply_topology(id, topology);
        if id.is_none() {
            // init may have landed while the topology was being stored
            if let Some(id) = self.id() {
                self.gossip.select_neighbours(id);
            }
        }
    }

    /// Every node in the cluster, as announced by `init`.
    pub fn node_ids(&self) -> Vec<String> {
        self.node_ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The outgoing message id generator.
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// The gossip engine.
    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    /// The outbox for messages other than the reply.
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

/// A context provided to handlers, giving access to the node state and the outgoing `msg_id` of the reply.
#[derive(Clone, Debug)]
pub struct Context {
    state: Arc<NodeState>,
    msg_id: u64,
}

impl Context {
    /// Creates a context for a handler invocation whose reply will carry `msg_id`.
    pub fn new(state: Arc<NodeState>, msg_id: u64) -> Self {
        Context { state, msg_id }
    }

    /// The node state.
    pub fn node(&self) -> &NodeState {
        &self.state
    }

    /// The `msg_id` the reply to this request will carry.
    pub fn msg_id(&self) -> u64 {
        self.msg_id
    }
}

/// Builds a [`Node`], collecting its handlers.
///
/// The `init` handler is always registered.
#[derive(Debug)]
pub struct NodeBuilder {
    config: Config,
    registry: HandlerRegistry,
}

impl NodeBuilder {
    /// Creates a builder with only the `init` handler registered.
    pub fn new(config: Config) -> Self {
        let mut registry = HandlerRegistry::new();
        if let Err(err) = registry.register("init", handlers::Init) {
            unreachable!("fresh registry rejected init: {err}");
        }

        NodeBuilder { config, registry }
    }

    /// Registers `handler` for messages of type `kind`.
    ///
    /// Fails if a handler is already registered for `kind`.
    pub fn handler<H>(
        mut self,
        kind: impl Into<Cow<'static, str>>,
        handler: H,
    ) -> Result<Self, RegistryError>
    where
        H: Handler,
    {
        self.registry.register(kind, handler)?;
        Ok(self)
    }

    /// Registers the `echo`, `generate`, `topology`, `broadcast` and `read` handlers.
    pub fn with_workloads(self) -> Result<Self, RegistryError> {
        self.handler("echo", handlers::Echo)?
            .handler("generate", handlers::Generate)?
            .handler("topology", handlers::Topology)?
            .handler("broadcast", handlers::Broadcast)?
            .handler("read", handlers::Read)
    }

    /// Builds the node, returning it with the receiving end of its outbox.
    pub fn build(self) -> (Node, OutboxReceiver) {
        let (outbox, outbox_rx) = outbox::outbox(self.config.outbox_capacity());
        let node = Node {
            state: Arc::new(NodeState::new(self.config.first_msg_id(), outbox)),
            registry: self.registry,
            pool_capacity: self.config.pool_capacity(),
        };

        (node, outbox_rx)
    }
}

/// A protocol node.
#[derive(Debug)]
pub struct Node {
    state: Arc<NodeState>,
    registry: HandlerRegistry,
    pool_capacity: usize,
}

impl Node {
    /// Creates a [`NodeBuilder`].
    pub fn builder(config: Config) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// The node's shared state.
    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Runs the node until `input` ends, writing every outgoing line to `output`.
    ///
    /// Once the input is exhausted, every in-flight handler is awaited and the outbox is flushed before returning.
    /// An I/O error reading input stops the reader; it is returned after in-flight work completes.
    pub async fn run<R, W>(self, outbox_rx: OutboxReceiver, input: R, output: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = tokio::spawn(outbox_rx.write_to(output));
        let served = Arc::new(self).serve(input).await;
        let written = writer.await.unwrap_or_else(|err| Err(io::Error::other(err)));

        served.and(written)
    }

    /// Reads `input` line by line, dispatching each line on the worker pool until end of stream.
    ///
    /// Replies are queued on the node's outbox. Blank lines are skipped.
    pub async fn serve<R>(self: Arc<Self>, input: R) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(input);
        let mut pool = WorkerPool::new(self.pool_capacity);
        let mut line = Vec::new();

        let res = loop {
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(err) => {
                    error!(%err, "failed to read input");
                    break Err(err);
                }
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                line.clear();
                continue;
            }

            let line = mem::take(&mut line);
            let node = self.clone();
            pool.spawn(async move { node.process_line(&line).await })
                .await;
        };

        pool.join().await;
        res
    }

    /// Handles one line and queues its reply, if any, on the outbox.
    pub async fn process_line(&self, line: &[u8]) {
        let Some(reply) = self.handle_line(line).await else {
            return;
        };
        if let Payload::Error { code, text } = &reply.body.payload {
            warn!(dest = %reply.dest, code = code.code(), %text, "replying with error");
        }
        if self.state.outbox.send(reply).await.is_err() {
            warn!("outbox closed, dropping reply");
        }
    }

    /// Decodes and dispatches one line, returning the reply without sending it.
    pub async fn handle_line(&self, line: &[u8]) -> Option<Envelope<Body>> {
        trace!(line = %String::from_utf8_lossy(line).trim_end(), "received");

        match codec::decode_line(line) {
            Ok(decoded) => self.dispatch(decoded).await,
            Err(err) => {
                debug!(%err, "malformed input line");
                Some(error_reply(
                    err.dest.clone().unwrap_or_default(),
                    err.src.clone().unwrap_or_default(),
                    err.msg_id,
                    err.code().into(),
                ))
            }
        }
    }

    /// Dispatches a decoded line to its handler, returning the reply.
    ///
    /// Returns `None` only when the handler chose not to reply.
    pub async fn dispatch(&self, decoded: Decoded) -> Option<Envelope<Body>> {
        let src = decoded.envelope.src.clone();
        let dest = decoded.envelope.dest.clone();
        let in_reply_to = decoded.probe.msg_id;

        if let Some(id) = self.state.id() {
            if dest != id {
                debug!(%dest, node_id = id, "message addressed to another node");
                return Some(error_reply(dest, src, in_reply_to, NodeError::malformed()));
            }
        }

        let Some(handler) = self.registry.get(decoded.probe.kind.as_str()) else {
            debug!(kind = %decoded.probe.kind, "no handler registered");
            return Some(error_reply(dest, src, in_reply_to, NodeError::not_supported()));
        };

        let request = match codec::resolve(decoded) {
            Ok(request) => request,
            Err(err) => {
                debug!(%err, "malformed message body");
                return Some(error_reply(dest, src, in_reply_to, NodeError::malformed()));
            }
        };

        let Some(msg_id) = self.state.ids.try_next() else {
            error!("outgoing message ids exhausted");
            return Some(error_reply(
                dest,
                src,
                in_reply_to,
                NodeError::new(ErrorCode::Unavailable, "outgoing message ids exhausted"),
            ));
        };
        let ctx = Context::new(self.state.clone(), msg_id);
        let res = AssertUnwindSafe(handler.handle_dyn(request, ctx))
            .catch_unwind()
            .await;

        match res {
            Ok(Ok(Some(payload))) => Some(Envelope {
                src: dest,
                dest: src,
                body: Body {
                    msg_id: Some(msg_id),
                    in_reply_to,
                    payload,
                },
            }),
            Ok(Ok(None)) => None,
            Ok(Err(err)) => Some(error_reply(dest, src, in_reply_to, err)),
            Err(payload) => {
                let err = PanicError::new(payload);
                error!(%err, "handler panicked");
                Some(error_reply(dest, src, in_reply_to, ErrorCode::Crashed.into()))
            }
        }
    }
}

fn error_reply(src: String, dest: String, in_reply_to: Option<u64>, err: NodeError) -> Envelope<Body> {
    let (code, text) = err.into_parts();
    Envelope {
        src,
        dest,
        body: Body {
            msg_id: None,
            in_reply_to,
            payload: Payload::Error { code, text },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::{
        message::Request,
        registry::{handler_fn, HandlerResult},
    };

    struct Crash;

    impl Handler for Crash {
        async fn handle(&self, _req: Request, _ctx: Context) -> HandlerResult {
            panic!("handler blew up")
        }
    }

    fn node() -> (Node, OutboxReceiver) {
        Node::builder(Config::default())
            .with_workloads()
            .unwrap()
            .build()
    }

    async fn line(node: &Node, value: serde_json::Value) -> Option<Envelope<Body>> {
        node.handle_line(value.to_string().as_bytes()).await
    }

    async fn init(node: &Node, id: &str) {
        let reply = line(
            node,
            json!({"src": "c0", "dest": id, "body": {"type": "init", "msg_id": 1, "node_id": id, "node_ids": [id]}}),
        )
        .await
        .unwrap();
        assert_eq!(reply.body.payload, Payload::InitOk);
    }

    fn error_code(reply: &Envelope<Body>) -> Option<ErrorCode> {
        match &reply.body.payload {
            Payload::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn echo_reply_copies_echo_and_correlates() {
        let (node, _rx) = node();
        init(&node, "n1").await;

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "echo", "msg_id": 1, "echo": "hi"}}),
        )
        .await
        .unwrap();
        assert_eq!(reply.src, "n1");
        assert_eq!(reply.dest, "c1");
        assert_eq!(reply.body.in_reply_to, Some(1));
        assert!(reply.body.msg_id.is_some());
        assert_eq!(
            reply.body.payload,
            Payload::EchoOk {
                echo: "hi".to_string()
            }
        );
    }

    #[tokio::test]
    async fn init_sets_identity_once() {
        let (node, _rx) = node();
        init(&node, "n1").await;

        let reply = line(
            &node,
            json!({"src": "c0", "dest": "n1", "body": {"type": "init", "msg_id": 2, "node_id": "n9", "node_ids": ["n9"]}}),
        )
        .await
        .unwrap();
        assert_eq!(reply.body.payload, Payload::InitOk);
        assert_eq!(node.state().id(), Some("n1"));
        assert_eq!(node.state().node_ids(), ["n1"]);
    }

    #[tokio::test]
    async fn misaddressed_message_is_malformed() {
        let (node, _rx) = node();
        init(&node, "n1").await;

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n2", "body": {"type": "echo", "msg_id": 5, "echo": "hi"}}),
        )
        .await
        .unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::Malformed));
        assert_eq!(reply.src, "n2");
        assert_eq!(reply.dest, "c1");
        assert_eq!(reply.body.in_reply_to, Some(5));
    }

    #[tokio::test]
    async fn any_destination_accepted_before_init() {
        let (node, _rx) = node();
        let reply = line(
            &node,
            json!({"src": "c1", "dest": "whoever", "body": {"type": "echo", "msg_id": 1, "echo": "x"}}),
        )
        .await
        .unwrap();
        assert_eq!(reply.src, "whoever");
        assert_eq!(error_code(&reply), None);
    }

    #[tokio::test]
    async fn unknown_type_is_not_supported() {
        let (node, _rx) = node();
        init(&node, "n1").await;

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "txn", "msg_id": 8}}),
        )
        .await
        .unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::NotSupported));
        assert_eq!(reply.body.in_reply_to, Some(8));
        assert_eq!(reply.body.msg_id, None);
    }

    #[tokio::test]
    async fn malformed_line_gets_single_malformed_reply() {
        let (node, _rx) = node();
        let reply = node.handle_line(b"{\"src\": \"c1\",").await.unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::Malformed));
        assert_eq!(reply.src, "");
        assert_eq!(reply.dest, "");
        assert_eq!(reply.body.in_reply_to, None);
    }

    #[tokio::test]
    async fn malformed_known_body_replies_to_probed_id() {
        let (node, _rx) = node();
        init(&node, "n1").await;

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "echo", "msg_id": 3}}),
        )
        .await
        .unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::Malformed));
        assert_eq!(reply.body.in_reply_to, Some(3));
        assert_eq!(reply.dest, "c1");
    }

    #[tokio::test]
    async fn handler_error_and_panic_become_error_replies() {
        let (node, _rx) = Node::builder(Config::default())
            .handler(
                "fail",
                handler_fn(|_req, _ctx| async {
                    Err(NodeError::new(ErrorCode::PreconditionFailed, "nope"))
                }),
            )
            .unwrap()
            .handler("crash", Crash)
            .unwrap()
            .build();

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "fail", "msg_id": 1}}),
        )
        .await
        .unwrap();
        assert_eq!(
            reply.body.payload,
            Payload::Error {
                code: ErrorCode::PreconditionFailed,
                text: "nope".to_string()
            }
        );

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "crash", "msg_id": 2}}),
        )
        .await
        .unwrap();
        assert_eq!(error_code(&reply), Some(ErrorCode::Crashed));
        assert_eq!(reply.body.in_reply_to, Some(2));
    }

    #[test]
    fn duplicate_handler_fails_at_build_time() {
        let err = Node::builder(Config::default())
            .handler("echo", handlers::Echo)
            .unwrap()
            .handler("echo", handlers::Echo)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("echo".into()));

        let err = Node::builder(Config::default())
            .handler("init", handlers::Echo)
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandler("init".into()));
    }

    #[tokio::test]
    async fn reply_msg_ids_come_from_generator() {
        let (node, _rx) = Node::builder(Config::default().with_first_msg_id(500))
            .with_workloads()
            .unwrap()
            .build();
        let first = line(
            &node,
            json!({"src": "c0", "dest": "n1", "body": {"type": "init", "msg_id": 1, "node_id": "n1"}}),
        )
        .await
        .unwrap();
        let second = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "read", "msg_id": 2}}),
        )
        .await
        .unwrap();
        assert_eq!(first.body.msg_id, Some(500));
        assert_eq!(second.body.msg_id, Some(501));
    }

    #[tokio::test]
    async fn exhausted_msg_ids_are_unavailable() {
        let (node, _rx) = Node::builder(Config::default().with_first_msg_id(u64::MAX - 1))
            .with_workloads()
            .unwrap()
            .build();
        init(&node, "n1").await;

        for msg_id in [2, 3] {
            let reply = line(
                &node,
                json!({"src": "c1", "dest": "n1", "body": {"type": "read", "msg_id": msg_id}}),
            )
            .await
            .unwrap();
            assert_eq!(error_code(&reply), Some(ErrorCode::Unavailable));
            assert_eq!(reply.body.in_reply_to, Some(msg_id));
        }
    }

    #[tokio::test]
    async fn topology_before_init_selects_neighbours_on_init() {
        let (node, mut rx) = node();
        let reply = line(
            &node,
            json!({"src": "c0", "dest": "n1", "body": {"type": "topology", "msg_id": 1, "topology": {"n1": ["n2"]}}}),
        )
        .await
        .unwrap();
        assert_eq!(reply.body.payload, Payload::TopologyOk);
        assert!(node.state().gossip().neighbours().is_empty());

        init(&node, "n1").await;
        assert_eq!(node.state().gossip().neighbours(), ["n2"]);

        let reply = line(
            &node,
            json!({"src": "c1", "dest": "n1", "body": {"type": "broadcast", "msg_id": 2, "message": 5}}),
        )
        .await
        .unwrap();
        assert_eq!(reply.body.payload, Payload::BroadcastOk);
        let copy = rx.try_recv().unwrap();
        assert_eq!((copy.src.as_str(), copy.dest.as_str()), ("n1", "n2"));
    }

    #[tokio::test]
    async fn stalled_output_stops_reading_input() {
        let (node, mut rx) = Node::builder(
            Config::default()
                .with_pool_capacity(1)
                .with_outbox_capacity(1),
        )
        .with_workloads()
        .unwrap()
        .build();
        let (mut feed, input) = tokio::io::duplex(256);
        let serve = tokio::spawn(Arc::new(node).serve(input));

        let lines: Vec<u8> = (0..200)
            .flat_map(|i| {
                let line = json!({"src": "c1", "dest": "n1", "body": {"type": "echo", "msg_id": i, "echo": "hi"}});
                format!("{line}\n").into_bytes()
            })
            .collect();
        let feeder = tokio::spawn(async move { feed.write_all(&lines).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!feeder.is_finished(), "input should stop being read");
        assert!(!serve.is_finished());

        let mut replies = 0;
        while rx.recv().await.is_some() {
            replies += 1;
        }
        feeder.await.unwrap().unwrap();
        serve.await.unwrap().unwrap();
        assert_eq!(replies, 200);
    }
}
