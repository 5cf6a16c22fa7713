//! Session decorators.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use hbridge_common::{Endpoint, Headers, TransportResult};

use crate::session::{Session, TransportRequest, TransportResponse};

/// Adds headers to every request that does not already carry them.
///
/// Sessions derived through `proxied` are wrapped as well, so the headers
/// also reach tunnelled destinations.
pub struct DefaultHeaders {
    inner: Arc<dyn Session>,
    headers: Headers,
}

impl DefaultHeaders {
    pub fn wrap(inner: Arc<dyn Session>, headers: Headers) -> Arc<dyn Session> {
        Arc::new(DefaultHeaders { inner, headers })
    }
}

impl fmt::Debug for DefaultHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultHeaders")
            .field("headers", &self.headers)
            .field("inner", &self.inner)
            .finish()
    }
}

#[async_trait]
impl Session for DefaultHeaders {
    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    async fn send(&self, mut request: TransportRequest) -> TransportResult<TransportResponse> {
        for (name, value) in self.headers.iter() {
            if !request.headers.contains(name) {
                request.headers.append(name, value);
            }
        }
        self.inner.send(request).await
    }

    fn proxied(&self, target: &Endpoint) -> TransportResult<Arc<dyn Session>> {
        let inner = self.inner.proxied(target)?;
        Ok(DefaultHeaders::wrap(inner, self.headers.clone()))
    }

    fn close(&self) {
        self.inner.close();
    }
}
