//! A netlink session bound to a network namespace.
//!
//! [`TcSession`] is what the engine uses to look at and mutate the traffic-control tree of one
//! namespace. Every method hops onto the namespace thread, resolves the interface there and
//! sends a single request.

use std::path::{Path, PathBuf};

use futures::{StreamExt as _, TryStreamExt as _};
use rtnetlink::packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkMessage, NetlinkPayload};
use rtnetlink::packet_route::{
    RouteNetlinkMessage,
    link::{LinkAttribute, LinkFlags},
    tc::{TcHandle, TcMessage},
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::namespace::{NamespaceId, NetworkNamespace};
use crate::tc::handle::{INGRESS_HANDLE, INGRESS_PARENT, raw};
use crate::tc::object::{TcObject, TcObjectId};
use crate::tc::snapshot::TcSnapshot;
use crate::wrappers;

/// Context owned by a namespace thread: an rtnetlink connection opened inside the namespace.
#[derive(Debug)]
pub struct NetlinkContext {
    /// Handle for sending rtnetlink messages within this namespace.
    pub handle: rtnetlink::Handle,
    /// Background task processing rtnetlink responses.
    _connection_task: tokio::task::JoinHandle<()>,
}

impl NetlinkContext {
    /// Open a new rtnetlink connection. Must be called from within a tokio runtime, on a thread
    /// already living in the target namespace.
    pub fn new() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        Ok(Self { handle, _connection_task: tokio::spawn(connection) })
    }

    /// Send a request expecting only an acknowledgement.
    pub async fn execute(&mut self, request: NetlinkMessage<RouteNetlinkMessage>) -> Result<()> {
        let mut response = self.handle.request(request)?;
        while let Some(message) = response.next().await {
            // Acknowledgements are error messages without a code.
            match message.payload {
                NetlinkPayload::Error(e) if e.code.is_some() => {
                    tracing::debug!(?e, "tc request failed");
                    return Err(Error::RtNetlink(rtnetlink::Error::NetlinkError(e)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Send a dump request and collect the tc messages it returns.
    pub async fn dump_tc(
        &mut self,
        mut request: NetlinkMessage<RouteNetlinkMessage>,
    ) -> Result<Vec<TcMessage>> {
        request.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut messages = Vec::new();
        let mut response = self.handle.request(request)?;
        while let Some(message) = response.next().await {
            match message.payload {
                NetlinkPayload::InnerMessage(
                    RouteNetlinkMessage::NewQueueDiscipline(m)
                    | RouteNetlinkMessage::NewTrafficClass(m)
                    | RouteNetlinkMessage::NewTrafficFilter(m),
                ) => messages.push(m),
                NetlinkPayload::Error(e) if e.code.is_some() => {
                    return Err(Error::RtNetlink(rtnetlink::Error::NetlinkError(e)));
                }
                _ => {}
            }
        }
        Ok(messages)
    }
}

/// A network interface visible inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub loopback: bool,
    pub up: bool,
}

/// Traffic-control operations against one network namespace.
#[derive(Debug)]
pub struct TcSession {
    namespace: NetworkNamespace<NetlinkContext>,
}

impl TcSession {
    /// Enter the namespace at `path` and open a netlink connection inside it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let namespace = NetworkNamespace::open(path, NetlinkContext::new).await?;
        Ok(Self { namespace })
    }

    /// Like [`TcSession::open`], but fails with [`Error::NamespaceGone`] unless the file at
    /// `path` is still the namespace identified by `expected`.
    pub async fn open_verified(path: impl Into<PathBuf>, expected: NamespaceId) -> Result<Self> {
        let namespace =
            NetworkNamespace::open_verified(path, Some(expected), NetlinkContext::new).await?;
        Ok(Self { namespace })
    }

    pub fn path(&self) -> &Path {
        self.namespace.path()
    }

    /// List the interfaces of the namespace.
    pub async fn links(&self) -> Result<Vec<Link>> {
        self.namespace
            .run(|ctx| {
                Box::pin(async move {
                    let mut links = Vec::new();
                    let mut stream = ctx.handle.link().get().execute();
                    while let Some(message) = stream.try_next().await? {
                        let name = message.attributes.iter().find_map(|attr| match attr {
                            LinkAttribute::IfName(name) => Some(name.clone()),
                            _ => None,
                        });
                        let Some(name) = name else { continue };
                        links.push(Link {
                            index: message.header.index,
                            name,
                            loopback: message.header.flags.contains(LinkFlags::Loopback),
                            up: message.header.flags.contains(LinkFlags::Up),
                        });
                    }
                    Ok::<_, Error>(links)
                })
            })
            .await?
    }

    /// Dump the traffic-control tree of an interface.
    pub async fn snapshot(&self, interface: &str) -> Result<TcSnapshot> {
        let interface = interface.to_string();
        self.namespace
            .run(move |ctx| {
                Box::pin(async move {
                    let index = if_index(&interface)?;

                    let qdiscs: Vec<_> = ctx
                        .dump_tc(NetlinkMessage::from(RouteNetlinkMessage::GetQueueDiscipline(
                            TcMessage::with_index(0),
                        )))
                        .await?
                        .into_iter()
                        .filter(|m| m.header.index == index)
                        .collect();
                    let classes = ctx
                        .dump_tc(NetlinkMessage::from(RouteNetlinkMessage::GetTrafficClass(
                            TcMessage::with_index(index),
                        )))
                        .await?;
                    let mut filters = ctx
                        .dump_tc(NetlinkMessage::from(RouteNetlinkMessage::GetTrafficFilter(
                            TcMessage::with_index(index),
                        )))
                        .await?;

                    // Without a parent the dump only covers the root qdisc.
                    if qdiscs.iter().any(|m| raw(m.header.parent) == INGRESS_PARENT) {
                        let mut request = TcMessage::with_index(index);
                        request.header.parent = TcHandle::from(INGRESS_HANDLE);
                        filters.extend(
                            ctx.dump_tc(NetlinkMessage::from(RouteNetlinkMessage::GetTrafficFilter(
                                request,
                            )))
                            .await?,
                        );
                    }

                    Ok::<_, Error>(TcSnapshot::from_messages(
                        qdiscs,
                        classes.into_iter().filter(|m| m.header.index == index),
                        filters.into_iter().filter(|m| m.header.index == index),
                    ))
                })
            })
            .await?
    }

    /// Create a single object on an interface.
    pub async fn create(&self, interface: &str, object: &TcObject) -> Result<()> {
        let interface = interface.to_string();
        let object = *object;
        self.namespace
            .run(move |ctx| {
                Box::pin(async move {
                    let index = if_index(&interface)?;
                    tracing::debug!(%interface, %object, "creating tc object");
                    ctx.execute(object.add_request(index)).await
                })
            })
            .await?
    }

    /// Delete a single object from an interface.
    pub async fn delete(&self, interface: &str, id: &TcObjectId) -> Result<()> {
        let interface = interface.to_string();
        let id = *id;
        self.namespace
            .run(move |ctx| {
                Box::pin(async move {
                    let index = if_index(&interface)?;
                    tracing::debug!(%interface, %id, "deleting tc object");
                    ctx.execute(id.delete_request(index)).await
                })
            })
            .await?
    }
}

/// Resolve an interface index on the calling (namespace) thread.
fn if_index(interface: &str) -> Result<i32> {
    wrappers::if_nametoindex(interface)
        .map(|index| index.get() as i32)
        .ok_or_else(|| Error::InterfaceNotFound(interface.to_string()))
}
