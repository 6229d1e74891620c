//! Handlers for the built-in workloads.

use tracing::debug;

use crate::{
    error::{ErrorCode, NodeError},
    message::{Inbound, Payload, Request},
    node::Context,
    registry::{Handler, HandlerResult},
};

/// Handles `init`, assigning the node its identity.
///
/// Only the first `init` takes effect; later ones are acknowledged without changing anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct Init;

impl Handler for Init {
    async fn handle(&self, req: Request, ctx: Context) -> HandlerResult {
        let Inbound::Known(Payload::Init { node_id, node_ids }) = req.message else {
            return Err(NodeError::malformed());
        };

        if ctx.node().init(node_id.clone(), node_ids) {
            debug!(%node_id, "node initialised");
        } else {
            debug!(%node_id, current = ?ctx.node().id(), "ignoring repeated init");
        }

        Ok(Some(Payload::InitOk))
    }
}

/// Handles `echo`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Echo;

impl Handler for Echo {
    async fn handle(&self, req: Request, _ctx: Context) -> HandlerResult {
        let Inbound::Known(Payload::Echo { echo }) = req.message else {
            return Err(NodeError::malformed());
        };

        Ok(Some(Payload::EchoOk { echo }))
    }
}

/// Handles `generate`, minting ids unique across the cluster.
///
/// Ids are `{node_id}-{msg_id}`, where `msg_id` is the reply's own outgoing id. Node ids are unique within the
/// cluster and outgoing ids never repeat on a node, so no coordination is needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct Generate;

impl Handler for Generate {
    async fn handle(&self, req: Request, ctx: Context) -> HandlerResult {
        let Inbound::Known(Payload::Generate) = req.message else {
            return Err(NodeError::malformed());
        };
        let Some(node_id) = ctx.node().id() else {
            return Err(NodeError::new(
                ErrorCode::Unavailable,
                "node is not initialised",
            ));
        };

        Ok(Some(Payload::GenerateOk {
            id: format!("{node_id}-{}", ctx.msg_id()),
        }))
    }
}

/// Handles `topology`, replacing the node's neighbour set.
#[derive(Clone, Copy, Debug, Default)]
pub struct Topology;

impl Handler for Topology {
    async fn handle(&self, req: Request, ctx: Context) -> HandlerResult {
        let Inbound::Known(Payload::Topology { topology }) = req.message else {
            return Err(NodeError::malformed());
        };

        ctx.node().apply_topology(topology);

        Ok(Some(Payload::TopologyOk))
    }
}

/// Handles `broadcast`, storing the value and gossiping it to neighbours the first time it is seen.
///
/// Broadcasts without a `msg_id` are gossip copies from other nodes and are not acknowledged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Broadcast;

impl Handler for Broadcast {
    async fn handle(&self, req: Request, ctx: Context) -> HandlerResult {
        let Inbound::Known(Payload::Broadcast { message }) = req.message else {
            return Err(NodeError::malformed());
        };

        let node = ctx.node();
        if let Some(fanout) = node.gossip().observe(message, &req.src) {
            let from = node.id().unwrap_or(&req.dest);
            fanout.send(from, node.outbox()).await;
        }

        Ok(req.msg_id.map(|_| Payload::BroadcastOk))
    }
}

/// Handles `read`, returning every value seen so far.
#[derive(Clone, Copy, Debug, Default)]
pub struct Read;

impl Handler for Read {
    async fn handle(&self, req: Request, ctx: Context) -> HandlerResult {
        let Inbound::Known(Payload::Read) = req.message else {
            return Err(NodeError::malformed());
        };

        Ok(Some(Payload::ReadOk {
            messages: ctx.node().gossip().snapshot(),
        }))
    }
}
