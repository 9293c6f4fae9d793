// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::sync::Arc;
use tower::Service;

use crate::proxy::Dispatcher;

#[derive(Clone)]
pub struct RequestHandler {
    dispatcher: Arc<Dispatcher>,
}

impl RequestHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let dispatcher = self.dispatcher.clone();
        Box::pin(async move {
            match dispatcher.dispatch(req).await {
                Ok(resp) => Ok(resp),
                Err(err) => {
                    tracing::warn!(%err, "proxy error");
                    Ok(Response::from(err))
                }
            }
        })
    }
}
