//! Remote step invoker contract and client-step construction.
//!
//! Transport adapters (gRPC, REST, in-process test doubles) implement
//! [`RemoteInvoker`]. The runtime hands every call the flow's
//! [`ContextHandle`]; adapters inject the four `x-pipeline-*` headers
//! outbound via [`outbound_metadata`] and feed response headers back with
//! [`absorb_response_metadata`].

use crate::context::{ContextHandle, HEADER_CACHE_STATUS};
use crate::error::BoxError;
use crate::step::{Step, StepCodec};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

/// A stream of serialized payloads crossing the transport boundary.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, BoxError>>;

/// Ordered string map for transport headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Headers to attach to an outbound call for `ctx`.
pub fn outbound_metadata(ctx: &ContextHandle) -> Metadata {
    let mut metadata = Metadata::new();
    for (name, value) in ctx.snapshot().to_header_pairs() {
        metadata.insert(name, value);
    }
    metadata
}

/// Absorb response headers: currently only `x-pipeline-cache-status`.
pub fn absorb_response_metadata(ctx: &ContextHandle, metadata: &Metadata) {
    if let Some(raw) = metadata.get(HEADER_CACHE_STATUS) {
        if let Ok(status) = crate::cache::CacheStatus::from_str(raw.trim()) {
            ctx.record_cache_status(status);
        }
    }
}

/// Transport adapter contract: four invocation shapes over opaque bytes.
///
/// Implementations receive the flow context on every call and are
/// responsible for header injection and extraction.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke_unary(
        &self,
        step_id: &str,
        request: Vec<u8>,
        ctx: &ContextHandle,
    ) -> Result<Vec<u8>, BoxError>;

    async fn invoke_server_stream(
        &self,
        step_id: &str,
        request: Vec<u8>,
        ctx: &ContextHandle,
    ) -> Result<ByteStream, BoxError>;

    async fn invoke_client_stream(
        &self,
        step_id: &str,
        requests: ByteStream,
        ctx: &ContextHandle,
    ) -> Result<Vec<u8>, BoxError>;

    async fn invoke_bidi(
        &self,
        step_id: &str,
        requests: ByteStream,
        ctx: &ContextHandle,
    ) -> Result<ByteStream, BoxError>;
}

/// Builders for client steps that call through a [`RemoteInvoker`].
///
/// Payloads are JSON-encoded; both codecs are attached so the step can be
/// cache-marked without further setup.
pub struct RemoteStep;

impl RemoteStep {
    /// Unary client step: `I → O` through `invoke_unary`.
    pub fn unary<I, O>(
        name: impl Into<String>,
        step_id: impl Into<String>,
        invoker: Arc<dyn RemoteInvoker>,
    ) -> Step
    where
        I: Serialize + DeserializeOwned + Clone + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
    {
        let step_id = step_id.into();
        Step::one_to_one_ctx(name, move |input: I, ctx| {
            let invoker = invoker.clone();
            let step_id = step_id.clone();
            async move {
                let request = serde_json::to_vec(&input)?;
                let response = invoker.invoke_unary(&step_id, request, &ctx).await?;
                let output: O = serde_json::from_slice(&response)?;
                Ok::<_, BoxError>(output)
            }
        })
        .with_request_codec(StepCodec::json::<I>())
        .with_response_codec(StepCodec::json::<O>())
    }

    /// Server-streaming client step: `I → stream<O>` through
    /// `invoke_server_stream`.
    pub fn server_stream<I, O>(
        name: impl Into<String>,
        step_id: impl Into<String>,
        invoker: Arc<dyn RemoteInvoker>,
    ) -> Step
    where
        I: Serialize + DeserializeOwned + Clone + Send + 'static,
        O: Serialize + DeserializeOwned + Send + 'static,
    {
        use futures::StreamExt;
        let step_id = step_id.into();
        Step::one_to_many_ctx(name, move |input: I, ctx| {
            let invoker = invoker.clone();
            let step_id = step_id.clone();
            async move {
                let request = serde_json::to_vec(&input)?;
                let frames = invoker.invoke_server_stream(&step_id, request, &ctx).await?;
                Ok::<_, BoxError>(frames.map(|frame| {
                    frame.and_then(|bytes| {
                        serde_json::from_slice::<O>(&bytes).map_err(|e| Box::new(e) as BoxError)
                    })
                }))
            }
        })
        .with_request_codec(StepCodec::json::<I>())
        .with_response_codec(StepCodec::json::<O>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStatus;
    use crate::context::{PipelineContext, HEADER_VERSION};

    #[test]
    fn outbound_metadata_carries_context() {
        let ctx = ContextHandle::bind(
            PipelineContext::new().with_version_tag("v3").with_replay_mode(true),
        );
        let metadata = outbound_metadata(&ctx);
        assert_eq!(metadata.get(HEADER_VERSION), Some("v3"));
        assert_eq!(metadata.get("x-pipeline-replay"), Some("true"));
        assert_eq!(metadata.len(), 2);
    }

    #[test]
    fn response_status_flows_back_into_context() {
        let ctx = ContextHandle::empty();
        let mut metadata = Metadata::new();
        metadata.insert(HEADER_CACHE_STATUS, "HIT");
        absorb_response_metadata(&ctx, &metadata);
        assert_eq!(ctx.snapshot().cache_status(), Some(CacheStatus::Hit));
    }

    #[test]
    fn malformed_status_ignored() {
        let ctx = ContextHandle::empty();
        let mut metadata = Metadata::new();
        metadata.insert(HEADER_CACHE_STATUS, "WARM");
        absorb_response_metadata(&ctx, &metadata);
        assert_eq!(ctx.snapshot().cache_status(), None);
    }

    #[tokio::test]
    async fn unary_client_step_round_trips_json() {
        use crate::step::ShapeKind;

        struct Uppercase;

        #[async_trait]
        impl RemoteInvoker for Uppercase {
            async fn invoke_unary(
                &self,
                _step_id: &str,
                request: Vec<u8>,
                _ctx: &ContextHandle,
            ) -> Result<Vec<u8>, BoxError> {
                let input: String = serde_json::from_slice(&request)?;
                Ok(serde_json::to_vec(&input.to_uppercase())?)
            }

            async fn invoke_server_stream(
                &self,
                _step_id: &str,
                _request: Vec<u8>,
                _ctx: &ContextHandle,
            ) -> Result<ByteStream, BoxError> {
                unimplemented!("not exercised")
            }

            async fn invoke_client_stream(
                &self,
                _step_id: &str,
                _requests: ByteStream,
                _ctx: &ContextHandle,
            ) -> Result<Vec<u8>, BoxError> {
                unimplemented!("not exercised")
            }

            async fn invoke_bidi(
                &self,
                _step_id: &str,
                _requests: ByteStream,
                _ctx: &ContextHandle,
            ) -> Result<ByteStream, BoxError> {
                unimplemented!("not exercised")
            }
        }

        let step = RemoteStep::unary::<String, String>("upper", "svc.upper", Arc::new(Uppercase));
        assert_eq!(step.kind(), ShapeKind::OneToOne);
        assert!(step.request_codec.is_some());
        assert!(step.response_codec.is_some());
    }
}
