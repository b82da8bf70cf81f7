//! Request and response filter chains
//!
//! Filters run in registration order. A request filter may answer the request itself,
//! which stops the request chain and skips the origin entirely. Response filters always
//! run, once each, even when there is no response because the transport failed.

use std::sync::Arc;

use async_trait::async_trait;

use crate::proxy::context::ProxyContext;
use crate::proxy::message::ProxyResponse;

/// Transformation applied to every inbound request
#[async_trait]
pub trait RequestFilter: Send + Sync {
    /// Edit or replace `ctx.req` in place.
    ///
    /// Returning a response short-circuits: later filters do not run and nothing is sent
    /// to the origin.
    async fn filter_request(&self, ctx: &mut ProxyContext<'_>) -> Option<ProxyResponse>;
}

/// Transformation applied to every outbound response
#[async_trait]
pub trait ResponseFilter: Send + Sync {
    /// Edit or replace `ctx.resp`.
    ///
    /// `ctx.resp` is `None` when the origin could not be reached; `ctx.error` then says
    /// why, and the filter may put a substitute response in its place. A filter that
    /// receives a response must leave one behind.
    async fn filter_response(&self, ctx: &mut ProxyContext<'_>);
}

/// Adapts a plain closure into a [`RequestFilter`]
pub struct FnRequestFilter<F>(pub F);

impl<F> FnRequestFilter<F>
where
    F: Fn(&mut ProxyContext<'_>) -> Option<ProxyResponse> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> RequestFilter for FnRequestFilter<F>
where
    F: Fn(&mut ProxyContext<'_>) -> Option<ProxyResponse> + Send + Sync,
{
    async fn filter_request(&self, ctx: &mut ProxyContext<'_>) -> Option<ProxyResponse> {
        (self.0)(ctx)
    }
}

/// Adapts a plain closure into a [`ResponseFilter`]
pub struct FnResponseFilter<F>(pub F);

impl<F> FnResponseFilter<F>
where
    F: Fn(&mut ProxyContext<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ResponseFilter for FnResponseFilter<F>
where
    F: Fn(&mut ProxyContext<'_>) + Send + Sync,
{
    async fn filter_response(&self, ctx: &mut ProxyContext<'_>) {
        (self.0)(ctx)
    }
}

/// Run request filters until one answers the request
pub(crate) async fn filter_request(
    filters: &[Arc<dyn RequestFilter>],
    ctx: &mut ProxyContext<'_>,
) -> Option<ProxyResponse> {
    for filter in filters {
        if let Some(resp) = filter.filter_request(ctx).await {
            return Some(resp);
        }
    }
    None
}

/// Run every response filter over `ctx.resp`
pub(crate) async fn filter_response(filters: &[Arc<dyn ResponseFilter>], ctx: &mut ProxyContext<'_>) {
    for filter in filters {
        filter.filter_response(ctx).await;
    }
}
