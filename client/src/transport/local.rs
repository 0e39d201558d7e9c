//! In-process transport.
//!
//! Routes channels to [`LocalService`] implementations registered in the
//! same process. Services are looked up by the endpoint's full text first
//! (`10.0.0.1:50211`, `in-process:node-a`) and then by bare host, so one
//! registration can serve a node on both its plaintext and TLS ports.
//!
//! The transport counts channel opens and closes, which is how the tests
//! prove that a topology operation did or did not churn connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::trace;

use super::{Channel, ChannelOptions, ResponseStream, Status, Transport};
use crate::endpoint::Endpoint;

/// Server side of an in-process endpoint.
#[async_trait]
pub trait LocalService: Send + Sync {
    async fn unary(&self, method: &str, payload: Bytes) -> Result<Bytes, Status>;

    async fn server_streaming(
        &self,
        method: &str,
        _payload: Bytes,
    ) -> Result<ResponseStream, Status> {
        Err(Status::unimplemented(format!("{method} is not streaming")))
    }

    /// PEM certificate presented to TLS channels, if any.
    fn certificate(&self) -> Option<Bytes> {
        None
    }
}

type Registry = DashMap<String, Arc<dyn LocalService>>;

/// A [`Transport`] backed by services in this process.
#[derive(Default)]
pub struct LocalTransport {
    services: Arc<Registry>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `endpoint` exactly.
    pub fn register(&self, endpoint: &Endpoint, service: Arc<dyn LocalService>) {
        self.services.insert(endpoint.to_string(), service);
    }

    /// Serves every port of `host`.
    pub fn register_host(&self, host: &str, service: Arc<dyn LocalService>) {
        self.services.insert(host.to_string(), service);
    }

    /// Removes a registration made with either `register` or `register_host`.
    /// Existing channels start failing with `UNAVAILABLE`.
    pub fn deregister(&self, key: &str) -> bool {
        self.services.remove(key).is_some()
    }

    pub fn opened_channels(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed_channels(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for LocalTransport {
    fn open_channel(
        &self,
        endpoint: &Endpoint,
        options: &ChannelOptions,
    ) -> Result<Arc<dyn Channel>, Status> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        trace!(endpoint = %endpoint, tls = options.tls, "opening local channel");
        Ok(Arc::new(LocalChannel {
            key: endpoint.to_string(),
            host: endpoint.host().map(str::to_string),
            services: Arc::clone(&self.services),
            options: options.clone(),
            closed: AtomicBool::new(false),
            close_counter: Arc::clone(&self.closed),
        }))
    }
}

struct LocalChannel {
    key: String,
    host: Option<String>,
    services: Arc<Registry>,
    options: ChannelOptions,
    closed: AtomicBool,
    close_counter: Arc<AtomicUsize>,
}

impl LocalChannel {
    fn service(&self) -> Result<Arc<dyn LocalService>, Status> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable(format!("channel to {} is closed", self.key)));
        }
        let service = self
            .services
            .get(&self.key)
            .or_else(|| self.host.as_ref().and_then(|h| self.services.get(h)))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Status::unavailable(format!("no service listening on {}", self.key)))?;
        if self.options.tls {
            if let Some(certificate) = service.certificate() {
                if !self.options.accepts_certificate(&certificate) {
                    return Err(Status::unavailable(format!(
                        "certificate presented by {} does not match the address book",
                        self.key
                    )));
                }
            }
        }
        Ok(service)
    }
}

#[async_trait]
impl Channel for LocalChannel {
    async fn unary(&self, method: &str, payload: Bytes) -> Result<Bytes, Status> {
        let service = self.service()?;
        service.unary(method, payload).await
    }

    async fn server_streaming(
        &self,
        method: &str,
        payload: Bytes,
    ) -> Result<ResponseStream, Status> {
        let service = self.service()?;
        service.server_streaming(method, payload).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::certificate_hash;
    use crate::transport::StatusCode;

    struct Echo;

    #[async_trait]
    impl LocalService for Echo {
        async fn unary(&self, _method: &str, payload: Bytes) -> Result<Bytes, Status> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn routes_by_endpoint_then_host() {
        let transport = LocalTransport::new();
        transport.register_host("node-a", Arc::new(Echo));

        let tls = Endpoint::parse("node-a:50212").unwrap();
        let channel = transport
            .open_channel(&tls, &ChannelOptions::default())
            .unwrap();
        let reply = channel.unary("echo", Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(&reply[..], b"hi");

        let other = Endpoint::parse("node-b:50211").unwrap();
        let channel = transport
            .open_channel(&other, &ChannelOptions::default())
            .unwrap();
        let err = channel.unary("echo", Bytes::new()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unavailable);
    }

    #[tokio::test]
    async fn closed_channels_refuse_calls_and_count_once() {
        let transport = LocalTransport::new();
        let endpoint = Endpoint::in_process("svc");
        transport.register(&endpoint, Arc::new(Echo));

        let channel = transport
            .open_channel(&endpoint, &ChannelOptions::default())
            .unwrap();
        channel.close().await;
        channel.close().await;

        assert_eq!(transport.opened_channels(), 1);
        assert_eq!(transport.closed_channels(), 1);
        assert!(channel.unary("echo", Bytes::new()).await.is_err());
    }

    struct Pinned(&'static [u8]);

    #[async_trait]
    impl LocalService for Pinned {
        async fn unary(&self, _method: &str, payload: Bytes) -> Result<Bytes, Status> {
            Ok(payload)
        }

        fn certificate(&self) -> Option<Bytes> {
            Some(Bytes::from_static(self.0))
        }
    }

    #[tokio::test]
    async fn tls_channels_check_the_presented_certificate() {
        let transport = LocalTransport::new();
        transport.register_host("node-a", Arc::new(Pinned(b"real certificate")));
        let endpoint = Endpoint::parse("node-a:50212").unwrap();

        let trusted = ChannelOptions {
            tls: true,
            verify_certificates: true,
            certificate_hash: Some(certificate_hash(b"real certificate")),
        };
        let channel = transport.open_channel(&endpoint, &trusted).unwrap();
        assert!(channel.unary("echo", Bytes::new()).await.is_ok());

        let impostor = ChannelOptions {
            certificate_hash: Some(certificate_hash(b"someone else")),
            ..trusted.clone()
        };
        let channel = transport.open_channel(&endpoint, &impostor).unwrap();
        let err = channel.unary("echo", Bytes::new()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unavailable);

        // Plaintext channels never see a certificate.
        let plaintext = ChannelOptions {
            tls: false,
            ..impostor
        };
        let channel = transport.open_channel(&endpoint, &plaintext).unwrap();
        assert!(channel.unary("echo", Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn streaming_defaults_to_unimplemented() {
        let transport = LocalTransport::new();
        let endpoint = Endpoint::in_process("svc");
        transport.register(&endpoint, Arc::new(Echo));
        let channel = transport
            .open_channel(&endpoint, &ChannelOptions::default())
            .unwrap();
        let err = channel
            .server_streaming("stream", Bytes::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code, StatusCode::Unimplemented);
    }
}
