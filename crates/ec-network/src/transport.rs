//! Abstract peer transport.
//!
//! The sync core only needs "send this typed request to that peer and give
//! me the typed response". Wire encoding, sessions and version negotiation
//! live behind this trait.

use crate::message::{Request, Response};
use crate::metrics::{Meter, Metrics};
use crate::{NetworkResult, PeerId};
use async_trait::async_trait;
use std::sync::Arc;

/// Request/response transport to connected peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send `request` to `peer` and wait for its response.
    ///
    /// Implementations need not enforce a deadline; callers wrap the call
    /// in their own timeout.
    async fn send_request(&self, peer: &PeerId, request: Request) -> NetworkResult<Response>;
}

#[async_trait]
impl<T: PeerTransport + ?Sized> PeerTransport for Arc<T> {
    async fn send_request(&self, peer: &PeerId, request: Request) -> NetworkResult<Response> {
        (**self).send_request(peer, request).await
    }
}

/// Transport wrapper that meters packets and bytes per message kind.
pub struct MeteredTransport<T> {
    inner: T,
    metrics: Arc<dyn Metrics>,
}

impl<T: PeerTransport> MeteredTransport<T> {
    /// Wrap a transport.
    pub fn new(inner: T, metrics: Arc<dyn Metrics>) -> Self {
        Self { inner, metrics }
    }

    /// Access the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: PeerTransport> PeerTransport for MeteredTransport<T> {
    async fn send_request(&self, peer: &PeerId, request: Request) -> NetworkResult<Response> {
        let kind = request.kind();
        self.metrics.mark(Meter::PacketsOut(kind), 1);
        self.metrics
            .mark(Meter::TrafficOut(kind), request.size_hint() as u64);

        let response = self.inner.send_request(peer, request).await?;

        let kind = response.kind();
        self.metrics.mark(Meter::PacketsIn(kind), 1);
        self.metrics
            .mark(Meter::TrafficIn(kind), response.size_hint() as u64);
        Ok(response)
    }
}
